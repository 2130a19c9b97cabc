mod archive;
pub mod config;
mod control_plane;
mod deploy;
mod detect;
mod error;
mod ignore_filter;
pub mod logging;
mod poll;
mod pool;
mod progress;
pub mod storage;
mod upload;

pub const APP_NAME: &str = "lets";

pub use archive::{archive_file_name, build_archive};
pub use config::{ConfigOverrides, Credentials, LetConfig};
pub use control_plane::{
    ControlPlane, DEFAULT_API_URL, DeployCapability, Deployment, DeploymentStatus, FAILED_STATUS,
    GraphqlControlPlane, GraphqlControlPlaneConfig, StartDeploymentRequest, UploadKind,
};
pub use deploy::{
    DeployOptions, DeployOutcome, DeployRequest, DeploySession, MAX_TOP_LEVEL_ENTRIES, preflight,
    run_deploy,
};
pub use detect::{Detection, STATIC_TYPES, detect_project_type, is_static_type};
pub use error::{Error, Result};
pub use ignore_filter::{compute_included_files, letignore_paths};
pub use poll::{PollOptions, PollPolicy, PollState, await_completion};
pub use pool::{BulkUploadResult, DEFAULT_MAX_WORKERS, UploadTask, run_pool, worker_count};
pub use progress::{
    AggregateSnapshot, FileProgress, ProgressAggregator, ProgressSink, StatusDisplay,
    UploadProgress,
};
pub use storage::{
    InMemoryStore, ObjectStore, OssConnector, OssStore, ProgressEvent, ProgressEventKind,
    ProgressListener, StorageCredentials, StoreConnector,
};
pub use upload::{
    UploadDirConfig, UploadFileConfig, UploadOptions, UploadSummary, object_key, upload_directory,
    upload_file,
};
