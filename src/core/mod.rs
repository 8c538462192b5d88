mod dispatcher;
mod errors;
mod progress;
mod queue;
mod task;
mod traits;
mod types;
pub mod store;

pub use dispatcher::{Dispatcher, DispatcherHandle, PassReport, PassStop};
pub use errors::{DispatchError, Result};
pub use progress::{progress_channel, ProgressEvent, ProgressReceiver, ProgressStream};
pub use queue::{FailureOutcome, OrderedTasks, TaskQueue};
pub use store::{StoreLocation, StoreRegistry};
pub use task::{mime_type_by_extension, DispatcherStatus, NewTask, Task, TaskStatus};
pub use traits::{ByteStream, StoreFactory, TaskStore, UploadRequest, Uploader};
pub use types::{DispatcherConfig, DispatcherState, KeyField, Revision, TaskId};
