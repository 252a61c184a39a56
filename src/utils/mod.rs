use std::path::PathBuf;

use dirs::{data_dir, data_local_dir};

pub mod http;
pub mod logger;
pub mod serializer;
pub mod ttl_cache;

/// Per-user data directory for read-only inputs such as the GeoLite
/// database. Falls back to the working directory when the platform has no
/// notion of one.
pub fn get_data_dir(file: Option<&str>) -> PathBuf {
    let mut path = if let Some(path) = data_dir() {
        path
    } else if let Some(path) = data_local_dir() {
        path
    } else {
        PathBuf::from("./")
    };
    path.push("proxyhive/");
    if let Some(file) = file {
        path.push(file);
    }
    path
}
