// src/lib.rs

pub mod client;
pub mod config;
pub mod constraints;
pub mod dispatcher;
pub mod downloader;
pub mod integrity;
pub mod logging;
pub mod manager;
pub mod models;
pub mod retry;
pub mod state_manager;
pub mod status;
pub mod sweeper;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::client::{HttpClient, TransferClient};
    pub use crate::config::EngineConfig;
    pub use crate::constraints::{Constraints, ManualConstraints, SystemConstraints};
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{DownloadJob, FileRequest, JobId, JobStatus};
    pub use crate::state_manager::{JobStore, StateManager};
    pub use crate::status::{DownloadState, RecordingDownloadStatus};
}
