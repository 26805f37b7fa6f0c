use std::fs::{self, File, OpenOptions};
use std::path::Path;

use crate::error::Result;

/// Open the log file for appending, creating its directory first.
pub fn open_log_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
