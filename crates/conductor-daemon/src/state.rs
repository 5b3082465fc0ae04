//! Shared application state handed to every route handler.

use std::path::PathBuf;
use std::sync::Arc;

use conductor_backend::Backend;

pub struct AppState {
    pub backend: Arc<Backend>,
    pub static_dir: PathBuf,
    pub config_hash: String,
}

impl AppState {
    pub fn new(backend: Arc<Backend>, static_dir: PathBuf, config_hash: String) -> Self {
        Self {
            backend,
            static_dir,
            config_hash,
        }
    }
}
