/// HTTP handlers for the WeCom callback and the background reply relay
pub mod callback;
pub mod relay;

pub use callback::{callback, health};
pub use relay::{RelayOutcome, relay_replies, spawn_relay};
