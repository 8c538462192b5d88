pub mod http;

pub use http::{HttpUploader, HttpUploaderConfig};
