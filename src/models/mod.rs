mod preview;

pub use preview::{PreviewJob, PreviewMetadata, PreviewResponse, PreviewResult};
