pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod retry;
pub mod service;
pub mod stream;
pub mod token;
pub mod transport;

pub use config::Config;
pub use error::{RelayError, Result};
pub use service::RelayService;
