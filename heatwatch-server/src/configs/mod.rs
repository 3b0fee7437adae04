use std::path::PathBuf;
use std::{env, io};

pub mod schema;
pub mod settings;
pub mod storage;

pub use schema::SchemaManager;
pub use settings::{Alert, Database, DeviceConf, Gateway, Notification, Schedule, Settings};
pub use storage::Storage;

pub fn normalize_path(path: &str) -> io::Result<PathBuf> {
    let path_buf = PathBuf::from(path);

    Ok(if path_buf.is_absolute() {
        path_buf
    } else {
        env::current_dir()?.join(&path_buf)
    })
}
