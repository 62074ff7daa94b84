//! End-to-end host scenarios
//!
//! Each test drives a real host through the public API: run, suspend on
//! bookmarks, cancel, terminate, persist, unload, and reload.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use windlass::persistence::keys;
use windlass::prelude::*;

// =============================================================================
// Test activities
// =============================================================================

struct NoOp {
    core: ActivityCore,
}

impl NoOp {
    fn new(name: &str) -> ActivityRef {
        Arc::new(Self {
            core: ActivityCore::new(name),
        })
    }
}

impl Activity for NoOp {
    fn core(&self) -> &ActivityCore {
        &self.core
    }
    fn cache_metadata(&self, _meta: &mut ActivityMetadata) {}
    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        Ok(())
    }
}

/// Blocks the scheduler thread for a while, then completes
struct Sleeper {
    core: ActivityCore,
    millis: u64,
}

impl Sleeper {
    fn new(name: &str, millis: u64) -> ActivityRef {
        Arc::new(Self {
            core: ActivityCore::new(name),
            millis,
        })
    }
}

impl Activity for Sleeper {
    fn core(&self) -> &ActivityCore {
        &self.core
    }
    fn cache_metadata(&self, _meta: &mut ActivityMetadata) {}
    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        std::thread::sleep(Duration::from_millis(self.millis));
        Ok(())
    }
}

/// Runs its children one after another
struct Sequence {
    core: ActivityCore,
    steps: Vec<ActivityRef>,
}

impl Sequence {
    fn new(name: &str, steps: Vec<ActivityRef>) -> ActivityRef {
        Arc::new(Self {
            core: ActivityCore::new(name),
            steps,
        })
    }
}

impl Activity for Sequence {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn cache_metadata(&self, meta: &mut ActivityMetadata) {
        for step in &self.steps {
            meta.add_child(step);
        }
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        if let Some(first) = self.steps.first() {
            ctx.schedule(first)?;
        }
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        child: &CompletedChild,
    ) -> Result<(), ActivityFailure> {
        if child.state != InstanceState::Closed {
            return Ok(());
        }
        let done = self
            .steps
            .iter()
            .position(|s| s.core().id() == Some(child.activity));
        if let Some(done) = done {
            if let Some(next) = self.steps.get(done + 1) {
                ctx.schedule(next)?;
            }
        }
        Ok(())
    }
}

/// Suspends on a named bookmark and surfaces the resumed value through
/// its `Result` out-argument
struct AwaitValue {
    core: ActivityCore,
    bookmark_name: String,
    result: Arc<Argument>,
}

impl AwaitValue {
    fn new(name: &str, bookmark_name: &str) -> ActivityRef {
        Arc::new(Self {
            core: ActivityCore::new(name),
            bookmark_name: bookmark_name.to_string(),
            result: Arc::new(Argument::output("Result", ValueKind::Any)),
        })
    }
}

impl Activity for AwaitValue {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn cache_metadata(&self, meta: &mut ActivityMetadata) {
        meta.add_argument(&self.result);
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        ctx.create_bookmark(self.bookmark_name.clone())?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _bookmark: &Bookmark,
        value: Value,
    ) -> Result<(), ActivityFailure> {
        ctx.set_argument(&self.result, value)
    }
}

/// An expression that never resolves synchronously: it parks on a
/// bookmark instead of producing its result
struct BlockingExpr {
    core: ActivityCore,
}

impl BlockingExpr {
    fn new(name: &str) -> ActivityRef {
        Arc::new(Self {
            core: ActivityCore::new(name),
        })
    }
}

impl Activity for BlockingExpr {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn cache_metadata(&self, meta: &mut ActivityMetadata) {
        meta.set_result_kind(ValueKind::Integer);
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        ctx.create_bookmark("expr-gate")?;
        Ok(())
    }
}

/// Body whose execution is observable; its input resolves asynchronously
struct GatedBody {
    core: ActivityCore,
    input: Arc<Argument>,
    executed: Arc<AtomicBool>,
}

impl GatedBody {
    fn new(name: &str) -> (ActivityRef, Arc<AtomicBool>) {
        let executed = Arc::new(AtomicBool::new(false));
        let activity: ActivityRef = Arc::new(Self {
            core: ActivityCore::new(name),
            input: Arc::new(
                Argument::input("Gate", ValueKind::Integer).bind(BlockingExpr::new("gate-expr")),
            ),
            executed: executed.clone(),
        });
        (activity, executed)
    }
}

impl Activity for GatedBody {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn cache_metadata(&self, meta: &mut ActivityMetadata) {
        meta.add_argument(&self.input);
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        self.executed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Failing {
    core: ActivityCore,
}

impl Failing {
    fn new(name: &str) -> ActivityRef {
        Arc::new(Self {
            core: ActivityCore::new(name),
        })
    }
}

impl Activity for Failing {
    fn core(&self) -> &ActivityCore {
        &self.core
    }
    fn cache_metadata(&self, _meta: &mut ActivityMetadata) {}
    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
        Err(ActivityFailure::new("body blew up"))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn watch_completion(host: &WorkflowHost) -> oneshot::Receiver<CompletedInfo> {
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    host.on_completed(move |info| {
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(info.clone());
        }
    })
    .expect("completed handler should assign");
    rx
}

fn count_idles(host: &WorkflowHost) -> Arc<AtomicUsize> {
    let idles = Arc::new(AtomicUsize::new(0));
    let counter = idles.clone();
    host.on_idle(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .expect("idle handler should assign");
    idles
}

async fn wait_for_bookmarks(host: &WorkflowHost, count: usize) -> Vec<BookmarkInfo> {
    for _ in 0..100 {
        let bookmarks = host.get_bookmarks().await.expect("get_bookmarks");
        if bookmarks.len() >= count {
            return bookmarks;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bookmarks never appeared");
}

// =============================================================================
// Scenarios
// =============================================================================

/// A sequence of two no-op activities completes Closed with no
/// outputs and never raises Idle.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn sequence_of_two_noops_completes_without_idling() {
    let host = WorkflowHost::new(Sequence::new("Root", vec![NoOp::new("A"), NoOp::new("B")]));
    let completed = watch_completion(&host);
    let idles = count_idles(&host);

    host.run().await.expect("run should be accepted");

    let info = completed.await.expect("completed should fire");
    assert_eq!(info.state, InstanceState::Closed);
    assert!(info.outputs.is_empty());
    assert!(info.failure.is_none());
    assert_eq!(idles.load(Ordering::SeqCst), 0);
    assert_eq!(host.state(), HostState::Completed);
}

/// Bookmark resume round-trip: the body consumes the resumed value
/// and completes Closed with it as an output.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn bookmark_resume_round_trip() {
    let host = WorkflowHost::new(AwaitValue::new("Root", "k"));
    let completed = watch_completion(&host);
    let idles = count_idles(&host);

    host.run().await.expect("run");

    let result = host.resume_bookmark("k", json!(42)).await.expect("resume");
    assert_eq!(result, BookmarkResumptionResult::Success);

    let info = completed.await.expect("completed");
    assert_eq!(info.state, InstanceState::Closed);
    assert_eq!(info.outputs.get("Result"), Some(&json!(42)));
    assert!(idles.load(Ordering::SeqCst) >= 1);
}

/// Resuming an unknown bookmark reports NotFound and leaves the
/// instance idle with its bookmark intact.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn resume_of_unknown_bookmark_is_not_found() {
    let host = WorkflowHost::new(AwaitValue::new("Root", "k"));
    let completed = watch_completion(&host);

    host.run().await.expect("run");
    let bookmarks = wait_for_bookmarks(&host, 1).await;
    assert_eq!(bookmarks[0].bookmark.name.as_deref(), Some("k"));

    let result = host.resume_bookmark("x", json!(0)).await.expect("resume");
    assert_eq!(result, BookmarkResumptionResult::NotFound);

    // Still idle, still resumable.
    let bookmarks = host.get_bookmarks().await.expect("bookmarks");
    assert_eq!(bookmarks.len(), 1);

    let result = host.resume_bookmark("k", json!(1)).await.expect("resume");
    assert_eq!(result, BookmarkResumptionResult::Success);
    let info = completed.await.expect("completed");
    assert_eq!(info.state, InstanceState::Closed);
}

/// Persist and unload mid-flight, reload into a fresh host, resume
/// the bookmark, and observe the same completion payload an
/// uninterrupted run produces.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn persist_and_reload_mid_flight() {
    let store = Arc::new(InMemoryInstanceStore::new());

    let host = WorkflowHost::builder(AwaitValue::new("Root", "k"))
        .store(store.clone())
        .build();
    host.run().await.expect("run");
    host.unload().await.expect("unload");

    assert_eq!(host.state(), HostState::Unloaded);
    let instance_id = host.instance_id().expect("instance id after persist");

    // The unloaded host rejects further operations.
    let err = host.resume_bookmark("k", json!(42)).await.unwrap_err();
    assert!(matches!(err, HostError::Unloaded));

    // A fresh host picks the instance up from the store.
    let reloaded = WorkflowHost::builder(AwaitValue::new("Root", "k"))
        .store(store.clone())
        .load(instance_id)
        .await
        .expect("load");
    let completed = watch_completion(&reloaded);

    let result = reloaded
        .resume_bookmark("k", json!(42))
        .await
        .expect("resume after reload");
    assert_eq!(result, BookmarkResumptionResult::Success);

    let info = completed.await.expect("completed");
    assert_eq!(info.state, InstanceState::Closed);
    assert_eq!(info.outputs.get("Result"), Some(&json!(42)));

    // Settle the pump, then check the completion save went through.
    let _ = reloaded.get_bookmarks().await;
    let data = store.instance_data(instance_id).expect("stored record");
    assert_eq!(data[keys::STATUS].value, json!("closed"));
    assert_eq!(
        data[&keys::path(keys::OUTPUT_PATH, "Result")].value,
        json!(42)
    );
}

/// A persist issued while the scheduler still has runnable work records
/// status Executing, and the reloaded instance finishes the remaining
/// work.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn persist_while_executing_records_executing_status() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let host = WorkflowHost::builder(Sequence::new(
        "Root",
        vec![Sleeper::new("A", 60), Sleeper::new("B", 60)],
    ))
    .store(store.clone())
    .build();
    let completed = watch_completion(&host);

    host.run().await.expect("run");
    host.persist().await.expect("persist");

    let instance_id = host.instance_id().expect("instance id");
    let data = store.instance_data(instance_id).expect("stored record");
    assert_eq!(data[keys::STATUS].value, json!("executing"));

    let info = completed.await.expect("completed");
    assert_eq!(info.state, InstanceState::Closed);
}

/// Cancel while an In-argument's expression is still pending; the
/// expression is canceled and the body never executes.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cancel_during_argument_resolution() {
    let (root, executed) = GatedBody::new("Root");
    let host = WorkflowHost::new(root);
    let completed = watch_completion(&host);

    host.run().await.expect("run");
    wait_for_bookmarks(&host, 1).await;

    host.cancel().await.expect("cancel");

    let info = completed.await.expect("completed");
    assert_eq!(info.state, InstanceState::Canceled);
    assert!(!executed.load(Ordering::SeqCst));
}

/// A cancel with a 10 ms budget against a scheduler stuck in a long
/// body surfaces Timeout, the cancel is never serviced, and the
/// workflow still completes Closed.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cancel_timeout_against_busy_scheduler() {
    let host = WorkflowHost::new(Sequence::new("Root", vec![Sleeper::new("Slow", 150)]));
    let completed = watch_completion(&host);

    host.run().await.expect("run");
    // Make sure the pump is inside the long body before canceling.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = host
        .cancel_timeout(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Timeout));

    // The timed-out cancel was removed unserviced.
    let info = completed.await.expect("completed");
    assert_eq!(info.state, InstanceState::Closed);
}

// =============================================================================
// Host behavior
// =============================================================================

/// Terminate completes the workflow as Faulted, and the delivered fault
/// carries the reason.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn terminate_delivers_faulted_completion() {
    let host = WorkflowHost::new(AwaitValue::new("Root", "k"));
    let completed = watch_completion(&host);

    host.run().await.expect("run");
    wait_for_bookmarks(&host, 1).await;
    host.terminate("operator gave up").await.expect("terminate");

    let info = completed.await.expect("completed");
    assert_eq!(info.state, InstanceState::Faulted);
    assert!(info.failure.expect("failure").mentions("operator gave up"));
}

/// A second cancel while one is pending is a no-op; the instance
/// completes Canceled exactly once.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cancel_is_idempotent() {
    let host = WorkflowHost::new(AwaitValue::new("Root", "k"));
    let completed = watch_completion(&host);

    host.run().await.expect("run");
    wait_for_bookmarks(&host, 1).await;

    host.cancel().await.expect("first cancel");
    host.cancel().await.expect("second cancel");

    let info = completed.await.expect("completed");
    assert_eq!(info.state, InstanceState::Canceled);
}

/// Without an UnhandledException handler, an unhandled fault terminates
/// the workflow with the body's failure.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unhandled_fault_terminates_by_default() {
    let host = WorkflowHost::new(Failing::new("Root"));
    let completed = watch_completion(&host);

    host.run().await.expect("run");

    let info = completed.await.expect("completed");
    assert_eq!(info.state, InstanceState::Faulted);
    assert!(info.failure.expect("failure").mentions("body blew up"));
}

/// The UnhandledException handler's Abort action tears the instance
/// down and raises Aborted instead of Completed.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unhandled_fault_abort_action() {
    let host = WorkflowHost::new(Failing::new("Root"));
    host.on_unhandled_exception(|_| UnhandledExceptionAction::Abort)
        .expect("assign handler");

    let (tx, rx) = oneshot::channel::<String>();
    let slot = Mutex::new(Some(tx));
    host.on_aborted(move |reason| {
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(reason.to_string());
        }
    })
    .expect("assign aborted handler");

    host.run().await.expect("run");

    let reason = rx.await.expect("aborted should fire");
    assert!(reason.contains("body blew up"));
    assert_eq!(host.state(), HostState::Aborted);

    // Operations on an aborted instance fail fast.
    let err = host.run().await.unwrap_err();
    assert!(matches!(err, HostError::Aborted { .. }));
}

/// Operations after completion surface the terminal state; resuming a
/// bookmark reports NotFound, silently.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn operations_after_completion() {
    let host = WorkflowHost::new(Sequence::new("Root", vec![NoOp::new("A")]));
    let completed = watch_completion(&host);

    host.run().await.expect("run");
    completed.await.expect("completed");

    let err = host.run().await.unwrap_err();
    assert!(matches!(err, HostError::Completed));

    let result = host.resume_bookmark("k", json!(0)).await.expect("resume");
    assert_eq!(result, BookmarkResumptionResult::NotFound);

    let bookmarks = host.get_bookmarks().await.expect("bookmarks");
    assert!(bookmarks.is_empty());
}

/// PersistableIdle returning Unload persists the instance and unloads
/// the host without an explicit Unload operation.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn persistable_idle_unload_action() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let host = WorkflowHost::builder(AwaitValue::new("Root", "k"))
        .store(store.clone())
        .build();
    host.on_persistable_idle(|_| PersistableIdleAction::Unload)
        .expect("assign handler");

    let (tx, rx) = oneshot::channel::<()>();
    let slot = Mutex::new(Some(tx));
    host.on_unloaded(move || {
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(());
        }
    })
    .expect("assign unloaded handler");

    host.run().await.expect("run");
    rx.await.expect("unloaded should fire");
    assert_eq!(host.state(), HostState::Unloaded);

    // The persisted record is resumable by a fresh host.
    let instance_id = host.instance_id().expect("instance id");
    let reloaded = WorkflowHost::builder(AwaitValue::new("Root", "k"))
        .store(store)
        .load(instance_id)
        .await
        .expect("load");
    let completed = watch_completion(&reloaded);
    reloaded
        .resume_bookmark("k", json!("go"))
        .await
        .expect("resume");
    let info = completed.await.expect("completed");
    assert_eq!(info.outputs.get("Result"), Some(&json!("go")));
}

/// load_runnable picks up an unlocked instance for a fresh owner.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn load_runnable_picks_up_unloaded_instance() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let host = WorkflowHost::builder(AwaitValue::new("Root", "k"))
        .store(store.clone())
        .build();
    host.run().await.expect("run");
    host.unload().await.expect("unload");

    let reloaded = WorkflowHost::builder(AwaitValue::new("Root", "k"))
        .store(store.clone())
        .load_runnable()
        .await
        .expect("load_runnable")
        .expect("an instance should be runnable");
    let completed = watch_completion(&reloaded);

    reloaded
        .resume_bookmark("k", json!(7))
        .await
        .expect("resume");
    let info = completed.await.expect("completed");
    assert_eq!(info.outputs.get("Result"), Some(&json!(7)));

    // Nothing else is runnable now.
    let none = WorkflowHost::builder(AwaitValue::new("Root", "k"))
        .store(store)
        .load_runnable()
        .await
        .expect("load_runnable");
    assert!(none.is_none());
}

/// Tracking participants see the workflow's records in order, flushed
/// before completion is raised.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn tracking_participant_observes_lifecycle() {
    struct Recorder {
        records: Mutex<Vec<TrackingRecord>>,
    }

    #[async_trait::async_trait]
    impl TrackingParticipant for Recorder {
        async fn track(&self, records: &[TrackingRecord]) -> anyhow::Result<()> {
            self.records.lock().extend_from_slice(records);
            Ok(())
        }
    }

    let recorder = Arc::new(Recorder {
        records: Mutex::new(vec![]),
    });
    let host = WorkflowHost::builder(Sequence::new("Root", vec![NoOp::new("A")]))
        .participant(recorder.clone())
        .build();
    let completed = watch_completion(&host);

    host.run().await.expect("run");
    completed.await.expect("completed");
    let _ = host.get_bookmarks().await;

    let records = recorder.records.lock();
    assert!(matches!(
        &records[0],
        TrackingRecord::WorkflowInstance { state } if state == "started"
    ));
    assert!(records.iter().any(|r| matches!(
        r,
        TrackingRecord::ActivityState { display_name, state, .. }
            if display_name == "A" && state == "closed"
    )));
    assert!(records.iter().any(|r| matches!(
        r,
        TrackingRecord::WorkflowInstance { state } if state == "completed"
    )));
}

/// Workflow inputs flow into the root's In arguments; unknown inputs
/// are rejected before anything runs.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn host_inputs_validated_and_delivered() {
    struct Echo {
        core: ActivityCore,
        input: Arc<Argument>,
        output: Arc<Argument>,
    }

    impl Activity for Echo {
        fn core(&self) -> &ActivityCore {
            &self.core
        }
        fn cache_metadata(&self, meta: &mut ActivityMetadata) {
            meta.add_argument(&self.input);
            meta.add_argument(&self.output);
        }
        fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFailure> {
            let value = ctx.argument_value(&self.input)?;
            ctx.set_argument(&self.output, value)
        }
    }

    fn echo() -> ActivityRef {
        Arc::new(Echo {
            core: ActivityCore::new("Echo"),
            input: Arc::new(Argument::input("Message", ValueKind::String)),
            output: Arc::new(Argument::output("Reply", ValueKind::String)),
        })
    }

    let host = WorkflowHost::builder(echo())
        .input("Message", json!("hello"))
        .build();
    let completed = watch_completion(&host);
    host.run().await.expect("run");
    let info = completed.await.expect("completed");
    assert_eq!(info.outputs.get("Reply"), Some(&json!("hello")));

    // Unknown input name fails the first initialized operation.
    let bad = WorkflowHost::builder(echo()).input("Nope", json!(1)).build();
    let err = bad.run().await.unwrap_err();
    assert!(matches!(err, HostError::UnknownInput(name) if name == "Nope"));
}
