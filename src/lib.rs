pub mod config;
pub mod core;
pub mod server;
pub mod telemetry;
pub mod uploaders;
pub mod utils;

// 重新导出核心类型
pub use core::{
    DispatchError,
    Dispatcher,
    DispatcherConfig,
    DispatcherHandle,
    DispatcherStatus,
    NewTask,
    PassReport,
    PassStop,
    Result,
    StoreLocation,
    StoreRegistry,
    Task,
    TaskId,
    TaskQueue,
    TaskStatus,
    UploadRequest,
    Uploader,
};

pub use uploaders::{HttpUploader, HttpUploaderConfig};
pub use utils::{RateLimiter, RetryPolicy};
