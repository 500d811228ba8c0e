//! Per-hash transfer records.
//!
//! Counters are shared between clones so the upload task can report
//! progress on the same record the aggregate views hand out.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tether_shared::protocol::{DownloadFileDto, UploadFileDto};
use tether_shared::ServerId;

/// One hash moving to or from one server.
pub trait FileTransfer {
    fn hash(&self) -> &str;
    fn server(&self) -> ServerId;
    fn is_forbidden(&self) -> bool;
    fn forbidden_by(&self) -> &str;
    fn total(&self) -> u64;
    fn transferred(&self) -> u64;

    fn can_be_transferred(&self) -> bool {
        !self.is_forbidden()
    }

    fn is_transferred(&self) -> bool {
        self.transferred() == self.total()
    }

    fn is_in_transfer(&self) -> bool {
        let done = self.transferred();
        done > 0 && done != self.total()
    }
}

/// One file on its way to a server. Clones share progress counters.
#[derive(Debug, Clone)]
pub struct UploadFileTransfer {
    dto: UploadFileDto,
    server: ServerId,
    /// Raw size until compression, then the compressed size.
    total: Arc<AtomicU64>,
    transferred: Arc<AtomicU64>,
    /// Where the cache keeps the file, when known.
    pub local_file: Option<PathBuf>,
}

impl UploadFileTransfer {
    pub fn new(dto: UploadFileDto, server: ServerId, total: u64) -> Self {
        Self {
            dto,
            server,
            total: Arc::new(AtomicU64::new(total)),
            transferred: Arc::new(AtomicU64::new(0)),
            local_file: None,
        }
    }

    pub fn with_local_file(mut self, path: PathBuf) -> Self {
        self.local_file = Some(path);
        self
    }

    /// Compression changes the size that actually goes over the wire.
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn set_transferred(&self, transferred: u64) {
        self.transferred.store(transferred, Ordering::Relaxed);
    }

    pub(crate) fn progress_counter(&self) -> Arc<AtomicU64> {
        self.transferred.clone()
    }
}

impl FileTransfer for UploadFileTransfer {
    fn hash(&self) -> &str {
        &self.dto.hash
    }

    fn server(&self) -> ServerId {
        self.server
    }

    fn is_forbidden(&self) -> bool {
        self.dto.is_forbidden
    }

    fn forbidden_by(&self) -> &str {
        &self.dto.forbidden_by
    }

    fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }
}

/// One file being fetched from a server.
#[derive(Debug, Clone)]
pub struct DownloadFileTransfer {
    dto: DownloadFileDto,
    server: ServerId,
    transferred: Arc<AtomicU64>,
}

impl DownloadFileTransfer {
    pub fn new(dto: DownloadFileDto, server: ServerId) -> Self {
        Self {
            dto,
            server,
            transferred: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn download_uri(&self) -> &str {
        &self.dto.url
    }

    /// Uncompressed size.
    pub fn total_raw(&self) -> u64 {
        self.dto.raw_size
    }

    pub fn set_transferred(&self, transferred: u64) {
        self.transferred.store(transferred, Ordering::Relaxed);
    }
}

impl FileTransfer for DownloadFileTransfer {
    fn hash(&self) -> &str {
        &self.dto.hash
    }

    fn server(&self) -> ServerId {
        self.server
    }

    fn is_forbidden(&self) -> bool {
        self.dto.is_forbidden
    }

    fn forbidden_by(&self) -> &str {
        &self.dto.forbidden_by
    }

    fn total(&self) -> u64 {
        self.dto.size
    }

    fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    fn can_be_transferred(&self) -> bool {
        self.dto.file_exists && !self.dto.is_forbidden && self.dto.size > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(hash: &str, forbidden: bool) -> UploadFileTransfer {
        let dto = UploadFileDto {
            hash: hash.into(),
            is_forbidden: forbidden,
            forbidden_by: if forbidden { "policy".into() } else { String::new() },
        };
        UploadFileTransfer::new(dto, ServerId::new(), 100)
    }

    #[test]
    fn test_transferred_iff_complete() {
        let t = upload("A", false);
        assert!(t.can_be_transferred());
        assert!(!t.is_transferred());
        t.set_transferred(40);
        assert!(t.is_in_transfer());
        t.set_transferred(100);
        assert!(t.is_transferred());
        assert!(!t.is_in_transfer());
    }

    #[test]
    fn test_clones_share_progress() {
        let t = upload("A", false);
        let view = t.clone();
        t.set_total(50);
        t.set_transferred(50);
        assert!(view.is_transferred());
    }

    #[test]
    fn test_forbidden_cannot_transfer() {
        let t = upload("A", true);
        assert!(!t.can_be_transferred());
        assert_eq!(t.forbidden_by(), "policy");
    }

    #[test]
    fn test_download_requires_remote_copy() {
        let missing = DownloadFileTransfer::new(
            DownloadFileDto {
                hash: "A".into(),
                file_exists: false,
                size: 10,
                ..Default::default()
            },
            ServerId::new(),
        );
        assert!(!missing.can_be_transferred());

        let present = DownloadFileTransfer::new(
            DownloadFileDto {
                hash: "A".into(),
                file_exists: true,
                size: 10,
                raw_size: 30,
                url: "https://cdn/A".into(),
                ..Default::default()
            },
            ServerId::new(),
        );
        assert!(present.can_be_transferred());
        assert_eq!(present.total(), 10);
        assert_eq!(present.total_raw(), 30);
    }
}
