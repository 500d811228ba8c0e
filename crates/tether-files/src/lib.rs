// File transfer layer: shared HTTP plumbing, forbidden registry, download
// slots and the per-server upload pipeline.

pub mod cache;
pub mod error;
pub mod orchestrator;
pub mod transfer;
pub mod upload;

pub use cache::{CacheEntry, DirFileCache, FileCache, MemoryFileCache};
pub use error::{Result, TransferError};
pub use orchestrator::{RequestBody, SpeedUnit, TransferOrchestrator, TransferSettings};
pub use transfer::{DownloadFileTransfer, FileTransfer, UploadFileTransfer};
pub use upload::UploadManager;
