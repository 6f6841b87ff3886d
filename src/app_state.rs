use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use crate::{config::AppConfig, staging::TempUploadArea};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub uploads: Arc<TempUploadArea>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn new(config: AppConfig, shutdown_sender: Option<oneshot::Sender<()>>) -> Self {
        let uploads = Arc::new(TempUploadArea::new(config.upload_temp_dir.clone()));
        Self {
            config,
            uploads,
            shutdown_sender: Arc::new(Mutex::new(shutdown_sender)),
        }
    }
}
