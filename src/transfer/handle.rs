use crate::client::{ClientError, CompletedPart};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Queued,
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Part {
    pub number: u16,
    pub offset: u64,
    pub len: u64,
    pub etag: Option<String>,
    pub state: PartState,
}

/// State of one in-flight transfer. Terminal states are Completed, Failed
/// (retries exhausted) and Cancelled; a retry builds a successor handle
/// referencing the same upload id and surviving parts.
#[derive(Debug)]
pub struct TransferHandle {
    object_key: String,
    direction: TransferDirection,
    total_bytes: u64,
    multipart: AtomicBool,
    upload_id: Mutex<Option<String>>,
    parts: Mutex<BTreeMap<u16, Part>>,
    bytes_transferred: AtomicU64,
    etag: Mutex<Option<String>>,
    status: Mutex<TransferStatus>,
    last_error: Mutex<Option<ClientError>>,
    cancelled: AtomicBool,
    done: Notify,
}

impl TransferHandle {
    pub fn new(object_key: &str, direction: TransferDirection, total_bytes: u64) -> Self {
        Self {
            object_key: object_key.to_string(),
            direction,
            total_bytes,
            multipart: AtomicBool::new(false),
            upload_id: Mutex::new(None),
            parts: Mutex::new(BTreeMap::new()),
            bytes_transferred: AtomicU64::new(0),
            etag: Mutex::new(None),
            status: Mutex::new(TransferStatus::NotStarted),
            last_error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            done: Notify::new(),
        }
    }

    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn is_multipart(&self) -> bool {
        self.multipart.load(Ordering::Relaxed)
    }

    pub fn set_multipart(&self, multipart: bool) {
        self.multipart.store(multipart, Ordering::Relaxed);
    }

    pub fn upload_id(&self) -> Option<String> {
        self.upload_id.lock().unwrap().clone()
    }

    pub fn set_upload_id(&self, id: &str) {
        *self.upload_id.lock().unwrap() = Some(id.to_string());
    }

    pub fn etag(&self) -> Option<String> {
        self.etag.lock().unwrap().clone()
    }

    pub fn set_etag(&self, etag: &str) {
        *self.etag.lock().unwrap() = Some(etag.to_string());
    }

    pub fn status(&self) -> TransferStatus {
        *self.status.lock().unwrap()
    }

    /// Move to a new status; terminal states are never left again.
    /// Reaching a terminal state wakes all waiters.
    pub fn update_status(&self, next: TransferStatus) {
        let mut status = self.status.lock().unwrap();
        if status.is_terminal() {
            return;
        }
        *status = next;
        drop(status);
        if next.is_terminal() {
            self.done.notify_waiters();
        }
    }

    /// Prevent further retries; in-flight requests finish and are discarded
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.update_status(TransferStatus::Cancelled);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn should_continue(&self) -> bool {
        !self.is_cancelled()
    }

    pub fn set_error(&self, error: ClientError) {
        *self.last_error.lock().unwrap() = Some(error);
    }

    pub fn last_error(&self) -> Option<ClientError> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn add_part(&self, number: u16, offset: u64, len: u64) {
        let mut parts = self.parts.lock().unwrap();
        parts.insert(
            number,
            Part {
                number,
                offset,
                len,
                etag: None,
                state: PartState::Queued,
            },
        );
    }

    pub fn part_pending(&self, number: u16) {
        if let Some(part) = self.parts.lock().unwrap().get_mut(&number) {
            part.state = PartState::Pending;
        }
    }

    pub fn part_completed(&self, number: u16, etag: &str) {
        let mut parts = self.parts.lock().unwrap();
        if let Some(part) = parts.get_mut(&number) {
            part.state = PartState::Completed;
            part.etag = Some(etag.to_string());
            self.bytes_transferred.fetch_add(part.len, Ordering::Relaxed);
        }
    }

    pub fn part_failed(&self, number: u16) {
        if let Some(part) = self.parts.lock().unwrap().get_mut(&number) {
            part.state = PartState::Failed;
        }
    }

    pub fn parts(&self) -> Vec<Part> {
        self.parts.lock().unwrap().values().cloned().collect()
    }

    pub fn all_parts_completed(&self) -> bool {
        let parts = self.parts.lock().unwrap();
        !parts.is_empty() && parts.values().all(|p| p.state == PartState::Completed)
    }

    pub fn has_failed_parts(&self) -> bool {
        self.parts
            .lock()
            .unwrap()
            .values()
            .any(|p| p.state == PartState::Failed)
    }

    /// Completed parts with their recorded etags, in part order
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.parts
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.state == PartState::Completed)
            .map(|p| CompletedPart {
                part_number: p.number,
                etag: p.etag.clone().unwrap_or_default(),
            })
            .collect()
    }

    pub async fn wait_until_finished(&self) {
        loop {
            let notified = self.done.notified();
            if self.status().is_terminal() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_status_is_sticky() {
        let handle = TransferHandle::new("/k", TransferDirection::Download, 10);
        assert_eq!(handle.status(), TransferStatus::NotStarted);
        handle.update_status(TransferStatus::InProgress);
        handle.update_status(TransferStatus::Completed);
        handle.update_status(TransferStatus::Failed);
        assert_eq!(handle.status(), TransferStatus::Completed);
    }

    #[test]
    fn test_cancel_stops_retries() {
        let handle = TransferHandle::new("/k", TransferDirection::Upload, 10);
        handle.update_status(TransferStatus::InProgress);
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(handle.status(), TransferStatus::Cancelled);
    }

    #[test]
    fn test_part_accounting() {
        let handle = TransferHandle::new("/k", TransferDirection::Upload, 10);
        handle.add_part(1, 0, 6);
        handle.add_part(2, 6, 4);
        assert!(!handle.all_parts_completed());

        handle.part_completed(2, "e2");
        handle.part_completed(1, "e1");
        assert!(handle.all_parts_completed());
        assert_eq!(handle.bytes_transferred(), 10);
        let parts = handle.completed_parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_number, 1);
        assert_eq!(parts[0].etag, "e1");
    }

    #[tokio::test]
    async fn test_wait_until_finished() {
        use std::sync::Arc;
        let handle = Arc::new(TransferHandle::new("/k", TransferDirection::Download, 1));
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.wait_until_finished().await });
        handle.update_status(TransferStatus::InProgress);
        handle.update_status(TransferStatus::Completed);
        task.await.unwrap();
    }
}
