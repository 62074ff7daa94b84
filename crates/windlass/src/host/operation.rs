//! Queued host operations

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::runtime::bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult};

use super::HostError;

/// The host operations that flow through the queue
#[derive(Debug, Clone)]
pub enum OperationKind {
    /// Start or resume execution
    Run,

    /// Request cancellation of the root
    Cancel,

    /// Complete the workflow as Faulted with a reason
    Terminate { reason: String },

    /// Persist at quiescence, keeping the lock
    Persist,

    /// Persist at quiescence and unload
    Unload,

    /// Deliver a value to a bookmark
    ResumeBookmark { bookmark: Bookmark, value: Value },

    /// Enumerate live bookmarks
    GetBookmarks,
}

impl OperationKind {
    /// Short name for tracing spans
    pub fn name(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Cancel => "cancel",
            Self::Terminate { .. } => "terminate",
            Self::Persist => "persist",
            Self::Unload => "unload",
            Self::ResumeBookmark { .. } => "resume_bookmark",
            Self::GetBookmarks => "get_bookmarks",
        }
    }

    /// Whether servicing this operation initializes the instance lazily
    pub fn requires_initialized(&self) -> bool {
        true
    }

    /// Whether enqueueing while the scheduler runs asks it to pause
    pub fn interrupts_scheduler(&self) -> bool {
        matches!(
            self,
            Self::Cancel | Self::Terminate { .. } | Self::Persist | Self::Unload
        )
    }
}

/// Successful outcome of a serviced operation
#[derive(Debug)]
pub enum OperationOutcome {
    /// Nothing to report
    Done,

    /// Result of a bookmark resumption
    Resumption(BookmarkResumptionResult),

    /// Live bookmarks
    Bookmarks(Vec<BookmarkInfo>),
}

/// What a waiter receives
pub type OperationResult = Result<OperationOutcome, HostError>;

/// One enqueued host request
pub struct InstanceOperation {
    /// What to do
    pub kind: OperationKind,

    /// Servicing this operation initializes the instance lazily
    pub requires_initialized: bool,

    /// Enqueueing while running asks the scheduler to pause
    pub interrupts_scheduler: bool,

    action_id: AtomicU64,
    notified: AtomicBool,
    waiter: Mutex<Option<oneshot::Sender<OperationResult>>>,
}

impl InstanceOperation {
    /// Create an operation and the receiver its caller waits on
    pub fn new(kind: OperationKind) -> (Arc<Self>, oneshot::Receiver<OperationResult>) {
        let (tx, rx) = oneshot::channel();
        let operation = Arc::new(Self {
            requires_initialized: kind.requires_initialized(),
            interrupts_scheduler: kind.interrupts_scheduler(),
            kind,
            action_id: AtomicU64::new(0),
            notified: AtomicBool::new(false),
            waiter: Mutex::new(Some(tx)),
        });
        (operation, rx)
    }

    /// Stamp the host's action count at enqueue time
    pub fn stamp(&self, action_id: u64) {
        self.action_id.store(action_id, Ordering::SeqCst);
    }

    /// The stamped action count
    pub fn action_id(&self) -> u64 {
        self.action_id.load(Ordering::SeqCst)
    }

    /// Whether the operation has been picked up for servicing
    pub fn is_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }

    /// Mark notified and deliver the result to the waiter
    pub fn notify(&self, result: OperationResult) {
        self.notified.store(true, Ordering::SeqCst);
        if let Some(tx) = self.waiter.lock().take() {
            let _ = tx.send(result);
        }
    }
}

impl std::fmt::Debug for InstanceOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceOperation")
            .field("kind", &self.kind.name())
            .field("action_id", &self.action_id())
            .field("notified", &self.is_notified())
            .finish()
    }
}

/// The ordered pending-operations deque
#[derive(Default)]
pub struct PendingQueue {
    deque: VecDeque<Arc<InstanceOperation>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation
    pub fn push_back(&mut self, op: Arc<InstanceOperation>) {
        self.deque.push_back(op);
    }

    /// Push an operation to the front; it precedes all concurrently
    /// back-pushed operations
    pub fn push_front(&mut self, op: Arc<InstanceOperation>) {
        self.deque.push_front(op);
    }

    /// Remove an unnotified operation; fails once it is being serviced
    pub fn remove(&mut self, op: &Arc<InstanceOperation>) -> bool {
        if op.is_notified() {
            return false;
        }
        let before = self.deque.len();
        self.deque.retain(|pending| !Arc::ptr_eq(pending, op));
        self.deque.len() != before
    }

    /// Dequeue the first operation the predicate accepts
    pub fn take_first_runnable(
        &mut self,
        mut can_run: impl FnMut(&InstanceOperation) -> bool,
    ) -> Option<Arc<InstanceOperation>> {
        let position = self.deque.iter().position(|op| can_run(op))?;
        self.deque.remove(position)
    }

    /// Drain every pending operation
    pub fn drain(&mut self) -> Vec<Arc<InstanceOperation>> {
        self.deque.drain(..).collect()
    }

    /// Number of pending operations
    pub fn len(&self) -> usize {
        self.deque.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_front_push_precedes_back_push() {
        let mut queue = PendingQueue::new();
        let (back, _rx1) = InstanceOperation::new(OperationKind::Run);
        let (front, _rx2) = InstanceOperation::new(OperationKind::Cancel);

        queue.push_back(back);
        queue.push_front(front);

        let first = queue.take_first_runnable(|_| true).unwrap();
        assert_eq!(first.kind.name(), "cancel");
        let second = queue.take_first_runnable(|_| true).unwrap();
        assert_eq!(second.kind.name(), "run");
    }

    #[test]
    fn test_remove_fails_after_notify() {
        let mut queue = PendingQueue::new();
        let (op, _rx) = InstanceOperation::new(OperationKind::Run);
        queue.push_back(op.clone());

        op.notify(Ok(OperationOutcome::Done));
        assert!(!queue.remove(&op));

        let (other, _rx) = InstanceOperation::new(OperationKind::Run);
        queue.push_back(other.clone());
        assert!(queue.remove(&other));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_take_first_runnable_respects_predicate() {
        let mut queue = PendingQueue::new();
        let (persist, _rx1) = InstanceOperation::new(OperationKind::Persist);
        let (run, _rx2) = InstanceOperation::new(OperationKind::Run);
        queue.push_back(persist);
        queue.push_back(run);

        // Persist is gated; Run is serviceable.
        let taken = queue
            .take_first_runnable(|op| !matches!(op.kind, OperationKind::Persist))
            .unwrap();
        assert_eq!(taken.kind.name(), "run");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_interrupt_flags() {
        assert!(!OperationKind::Run.interrupts_scheduler());
        assert!(OperationKind::Cancel.interrupts_scheduler());
        assert!(OperationKind::Persist.interrupts_scheduler());
        assert!(!OperationKind::GetBookmarks.interrupts_scheduler());
    }

    #[tokio::test]
    async fn test_notify_wakes_waiter() {
        let (op, rx) = InstanceOperation::new(OperationKind::Run);
        op.notify(Ok(OperationOutcome::Done));

        let result = rx.await.expect("waiter should receive");
        assert!(matches!(result, Ok(OperationOutcome::Done)));
    }
}
