//! Dispatch cycles against in-memory queue, store and backend fakes, plus
//! one run through the real ComfyUI dispatcher against a fake server.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Path as UrlPath, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use relay_cloud::queue::QueueError;
use relay_cloud::storage::StorageError;
use relay_cloud::{BlobStore, JobQueue, QueueKind, QueueMessage, ResultPublisher};
use relay_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use relay_comfyui::history::OutputImage;
use relay_comfyui::{ComfyUIDispatcher, DispatchError, GenerationBackend, JobHandle, Outputs};
use relay_core::backoff::PollBackoff;
use relay_core::catalog::TemplateCatalog;
use relay_core::template::WorkflowTemplate;
use relay_worker::ingest::{IngestionTrigger, TriggerError};
use relay_worker::{PipelineStage, QueueConsumer, QueueOutcome};

const BASE_INTERVAL: Duration = Duration::from_secs(1);
const ARTIFACT: &str = "relay_00001_.png";

// ---------------------------------------------------------------------------
// Queue fake
// ---------------------------------------------------------------------------

/// Messages stay visible until deleted, so anything not deleted is seen
/// again on the next receive.
#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<BTreeMap<&'static str, VecDeque<QueueMessage>>>,
    deleted: Mutex<Vec<String>>,
    failing_receive: Mutex<HashSet<&'static str>>,
    fail_delete: bool,
    next_id: AtomicU64,
}

impl MemoryQueue {
    fn push(&self, queue: QueueKind, body: &str) {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.messages
            .lock()
            .unwrap()
            .entry(queue.as_str())
            .or_default()
            .push_back(QueueMessage {
                queue,
                message_id: Some(format!("m-{n}")),
                receipt_handle: format!("r-{n}"),
                body: body.to_string(),
            });
    }

    fn pending(&self, queue: QueueKind) -> usize {
        self.messages
            .lock()
            .unwrap()
            .get(queue.as_str())
            .map_or(0, VecDeque::len)
    }

    fn fail_receive(&self, queue: QueueKind) {
        self.failing_receive.lock().unwrap().insert(queue.as_str());
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn receive(&self, queue: QueueKind) -> Result<Option<QueueMessage>, QueueError> {
        if self.failing_receive.lock().unwrap().contains(queue.as_str()) {
            return Err(QueueError::Receive {
                queue,
                reason: "injected failure".into(),
            });
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(queue.as_str())
            .and_then(|q| q.front().cloned()))
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        if self.fail_delete {
            return Err(QueueError::Delete {
                queue: message.queue,
                reason: "injected failure".into(),
            });
        }
        if let Some(q) = self.messages.lock().unwrap().get_mut(message.queue.as_str()) {
            q.retain(|m| m.receipt_handle != message.receipt_handle);
        }
        self.deleted.lock().unwrap().push(message.receipt_handle.clone());
        Ok(())
    }

    async fn send(&self, queue: QueueKind, body: &str) -> Result<String, QueueError> {
        self.push(queue, body);
        Ok(format!("m-{}", self.next_id.load(Ordering::SeqCst) - 1))
    }
}

// ---------------------------------------------------------------------------
// Store fake
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing_keys: HashSet<String>,
}

impl MemoryStore {
    fn failing_on(key: &str) -> Self {
        Self {
            failing_keys: HashSet::from([key.to_string()]),
            ..Default::default()
        }
    }

    fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn json(&self, key: &str) -> Value {
        serde_json::from_slice(&self.objects.lock().unwrap()[key]).unwrap()
    }

    fn seed_request(&self, id: &str) {
        self.objects.lock().unwrap().insert(
            format!("{id}.json"),
            json!({"id": id, "prompt": "a lighthouse", "seed": 0}).to_string().into_bytes(),
        );
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
        if self.failing_keys.contains(key) {
            return Err(StorageError::Put {
                key: key.to_string(),
                reason: "injected failure".into(),
            });
        }
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }
}

// ---------------------------------------------------------------------------
// Backend fake
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Script {
    Complete,
    SubmitFails500,
    TimesOut,
}

struct FakeBackend {
    script: Script,
    submitted: Mutex<Vec<WorkflowTemplate>>,
}

impl FakeBackend {
    fn new(script: Script) -> Self {
        Self {
            script,
            submitted: Mutex::new(Vec::new()),
        }
    }

    fn submitted(&self) -> Vec<WorkflowTemplate> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn submit(&self, workflow: &WorkflowTemplate) -> Result<JobHandle, DispatchError> {
        if self.script == Script::SubmitFails500 {
            return Err(DispatchError::Submit(ComfyUIApiError::ApiError {
                status: 500,
                body: "internal error".into(),
            }));
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(workflow.clone());
        Ok(JobHandle {
            prompt_id: format!("p-{}", submitted.len()),
            client_id: "test".into(),
            submitted_at: Instant::now(),
        })
    }

    async fn await_completion(
        &self,
        handle: &JobHandle,
        _output_node: Option<&str>,
    ) -> Result<Outputs, DispatchError> {
        if self.script == Script::TimesOut {
            return Err(DispatchError::Timeout {
                prompt_id: handle.prompt_id.clone(),
                attempts: 600,
            });
        }
        Ok(Outputs {
            prompt_id: handle.prompt_id.clone(),
            raw: json!({"9": {"images": [{"filename": ARTIFACT, "subfolder": "", "type": "output"}]}}),
            images: vec![OutputImage {
                filename: ARTIFACT.into(),
                subfolder: String::new(),
                kind: "output".into(),
            }],
            attempts: 1,
        })
    }
}

// ---------------------------------------------------------------------------
// Trigger fake
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingTrigger {
    cycles: Mutex<Vec<u64>>,
    fail: bool,
}

#[async_trait]
impl IngestionTrigger for RecordingTrigger {
    async fn trigger(&self, cycle: u64) -> Result<(), TriggerError> {
        self.cycles.lock().unwrap().push(cycle);
        if self.fail {
            Err(TriggerError::HttpStatus(503))
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn shipped_workflows() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../workflows")
}

fn output_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    image::RgbImage::new(4, 4)
        .save_with_format(dir.path().join(ARTIFACT), image::ImageFormat::Png)
        .unwrap();
    dir
}

struct Harness {
    queue: Arc<MemoryQueue>,
    store: Arc<MemoryStore>,
    consumer: QueueConsumer,
    _output: tempfile::TempDir,
}

fn harness_with(
    queue: MemoryQueue,
    store: MemoryStore,
    backend: Arc<dyn GenerationBackend>,
    workflow_dir: PathBuf,
) -> Harness {
    let queue = Arc::new(queue);
    let store = Arc::new(store);
    let output = output_dir();

    let publisher = ResultPublisher::new(store.clone(), output.path());
    let consumer = QueueConsumer::new(
        queue.clone(),
        TemplateCatalog::new(workflow_dir),
        backend,
        publisher,
        BASE_INTERVAL,
    );

    Harness {
        queue,
        store,
        consumer,
        _output: output,
    }
}

fn harness(backend: Arc<dyn GenerationBackend>) -> Harness {
    harness_with(
        MemoryQueue::default(),
        MemoryStore::default(),
        backend,
        shipped_workflows(),
    )
}

fn input(workflow: &WorkflowTemplate, node: &str, name: &str) -> Value {
    workflow.input(node, name).cloned().unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// End to end through the ComfyUI client
// ---------------------------------------------------------------------------

struct FakeComfy {
    history_calls: AtomicUsize,
    submissions: Mutex<Vec<Value>>,
}

async fn comfy_submit(State(fake): State<Arc<FakeComfy>>, Json(body): Json<Value>) -> Json<Value> {
    fake.submissions.lock().unwrap().push(body);
    Json(json!({"prompt_id": "p-abc", "number": 0, "node_errors": {}}))
}

async fn comfy_history(
    State(fake): State<Arc<FakeComfy>>,
    UrlPath(prompt_id): UrlPath<String>,
) -> Json<Value> {
    if fake.history_calls.fetch_add(1, Ordering::SeqCst) < 3 {
        return Json(json!({}));
    }
    Json(json!({
        prompt_id: {
            "outputs": {"9": {"images": [{"filename": ARTIFACT, "subfolder": "", "type": "output"}]}},
            "status": {"status_str": "success", "completed": true, "messages": []}
        }
    }))
}

#[tokio::test]
async fn abc_job_with_random_seed_completes_end_to_end() {
    let fake = Arc::new(FakeComfy {
        history_calls: AtomicUsize::new(0),
        submissions: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/prompt", post(comfy_submit))
        .route("/history/{prompt_id}", get(comfy_history))
        .with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let backend = ComfyUIDispatcher::with_backoff(
        ComfyUIApi::new(format!("http://{addr}")),
        PollBackoff {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_attempts: 600,
        },
    );
    let mut h = harness(Arc::new(backend));
    h.store.seed_request("abc");
    h.queue.push(
        QueueKind::Fast,
        &json!({"id": "abc", "prompt": "a lighthouse", "seed": 0}).to_string(),
    );

    let report = h.consumer.run_cycle().await;

    let Some(QueueOutcome::Completed { job_id, seed }) = report.outcome(QueueKind::Fast) else {
        panic!("fast queue outcome: {:?}", report.outcomes);
    };
    assert_eq!(job_id, "abc");
    assert_eq!(report.outcome(QueueKind::Slow), Some(&QueueOutcome::Empty));
    assert_eq!(fake.history_calls.load(Ordering::SeqCst), 4);

    assert_eq!(
        h.store.keys(),
        vec!["abc.json", "abc.png", "abc_final.json", "abc_output.json"]
    );
    let record = h.store.json("abc_final.json");
    assert_eq!(record["seed"], *seed);
    assert_eq!(h.store.json("abc.json")["seed"], *seed);

    let submissions = fake.submissions.lock().unwrap();
    assert_eq!(submissions[0]["prompt"]["3"]["inputs"]["seed"], *seed);
    assert_eq!(submissions[0]["prompt"]["16"]["inputs"]["text"], "a lighthouse");

    assert_eq!(h.queue.pending(QueueKind::Fast), 0);
    assert_eq!(report.interval, BASE_INTERVAL);
}

// ---------------------------------------------------------------------------
// Cycle semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn explicit_seed_is_passed_through_and_not_reconciled() {
    let backend = Arc::new(FakeBackend::new(Script::Complete));
    let mut h = harness(backend.clone());
    h.store.seed_request("s1");
    h.queue.push(
        QueueKind::Fast,
        r#"{"id": "s1", "prompt": "harbor at dusk", "seed": 1234, "width": 768, "steps": 20}"#,
    );

    let report = h.consumer.run_cycle().await;
    assert_eq!(
        report.outcome(QueueKind::Fast),
        Some(&QueueOutcome::Completed {
            job_id: "s1".into(),
            seed: 1234
        })
    );

    let workflow = &backend.submitted()[0];
    assert_eq!(input(workflow, "3", "seed"), 1234);
    assert_eq!(input(workflow, "3", "steps"), 20);
    assert_eq!(input(workflow, "53", "width"), 768);
    assert_eq!(input(workflow, "53", "height"), 512);
    assert_eq!(input(workflow, "53", "batch_size"), 1);

    assert_eq!(h.store.json("s1_final.json")["seed"], 1234);
    assert_eq!(h.store.json("s1.json")["seed"], 0);
}

#[tokio::test]
async fn submit_500_keeps_message_and_doubles_interval() {
    let mut h = harness(Arc::new(FakeBackend::new(Script::SubmitFails500)));
    h.queue.push(QueueKind::Fast, r#"{"id": "abc", "prompt": "a lighthouse"}"#);

    let report = h.consumer.run_cycle().await;

    assert_eq!(
        report.outcome(QueueKind::Fast),
        Some(&QueueOutcome::Left {
            job_id: Some("abc".into()),
            stage: PipelineStage::Dispatch,
            escalates: true,
        })
    );
    assert_eq!(h.queue.pending(QueueKind::Fast), 1);
    assert!(h.store.keys().is_empty());
    assert_eq!(report.interval, BASE_INTERVAL * 2);
}

#[tokio::test]
async fn mapping_to_missing_node_skips_only_that_field() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::copy(shipped_workflows().join("hidream.json"), dir.path().join("hidream.json")).unwrap();
    std::fs::write(
        dir.path().join("hidream.mapping.json"),
        json!({
            "output_node": "9",
            "fields": {
                "prompt": {"node": "16", "input": "text"},
                "steps": {"node": "99", "input": "steps"},
                "seed": {"node": "3", "input": "seed"}
            }
        })
        .to_string(),
    )
    .unwrap();

    let backend = Arc::new(FakeBackend::new(Script::Complete));
    let mut h = harness_with(
        MemoryQueue::default(),
        MemoryStore::default(),
        backend.clone(),
        dir.path().to_path_buf(),
    );
    h.queue.push(
        QueueKind::Fast,
        r#"{"id": "n99", "prompt": "a lighthouse", "seed": 77, "steps": 12}"#,
    );

    let report = h.consumer.run_cycle().await;
    assert!(matches!(
        report.outcome(QueueKind::Fast),
        Some(QueueOutcome::Completed { .. })
    ));

    let workflow = &backend.submitted()[0];
    assert!(workflow.node("99").is_none());
    assert_eq!(input(workflow, "16", "text"), "a lighthouse");
    assert_eq!(input(workflow, "3", "seed"), 77);
    assert_ne!(input(workflow, "3", "steps"), 12);
}

#[tokio::test]
async fn message_is_kept_when_final_record_write_fails() {
    let mut h = harness_with(
        MemoryQueue::default(),
        MemoryStore::failing_on("abc_final.json"),
        Arc::new(FakeBackend::new(Script::Complete)),
        shipped_workflows(),
    );
    h.queue.push(QueueKind::Fast, r#"{"id": "abc", "prompt": "a lighthouse", "seed": 5}"#);

    let report = h.consumer.run_cycle().await;

    assert_eq!(
        report.outcome(QueueKind::Fast),
        Some(&QueueOutcome::Left {
            job_id: Some("abc".into()),
            stage: PipelineStage::Publish,
            escalates: true,
        })
    );
    assert_eq!(h.queue.pending(QueueKind::Fast), 1);
    assert!(h.queue.deleted.lock().unwrap().is_empty());
    assert_eq!(report.interval, BASE_INTERVAL * 2);
}

#[tokio::test]
async fn failed_delete_counts_as_transport_failure() {
    let queue = MemoryQueue {
        fail_delete: true,
        ..Default::default()
    };
    let mut h = harness_with(
        queue,
        MemoryStore::default(),
        Arc::new(FakeBackend::new(Script::Complete)),
        shipped_workflows(),
    );
    h.queue.push(QueueKind::Fast, r#"{"id": "abc", "prompt": "a lighthouse", "seed": 5}"#);

    let report = h.consumer.run_cycle().await;

    assert!(matches!(
        report.outcome(QueueKind::Fast),
        Some(QueueOutcome::Left {
            stage: PipelineStage::Delete,
            escalates: true,
            ..
        })
    ));
    assert!(h.store.keys().contains(&"abc_final.json".to_string()));
    assert_eq!(report.interval, BASE_INTERVAL * 2);
}

#[tokio::test]
async fn unknown_model_is_left_without_escalation() {
    let backend = Arc::new(FakeBackend::new(Script::Complete));
    let mut h = harness(backend.clone());
    h.queue.push(
        QueueKind::Fast,
        r#"{"id": "abc", "prompt": "a lighthouse", "model": "flux"}"#,
    );

    let report = h.consumer.run_cycle().await;

    assert_eq!(
        report.outcome(QueueKind::Fast),
        Some(&QueueOutcome::Left {
            job_id: Some("abc".into()),
            stage: PipelineStage::Template,
            escalates: false,
        })
    );
    assert!(backend.submitted().is_empty());
    assert_eq!(h.queue.pending(QueueKind::Fast), 1);
    assert_eq!(report.interval, BASE_INTERVAL);
}

#[tokio::test]
async fn malformed_body_is_left_without_escalation() {
    let mut h = harness(Arc::new(FakeBackend::new(Script::Complete)));
    h.queue.push(QueueKind::Slow, "Hello from SQS!");

    let report = h.consumer.run_cycle().await;

    assert_eq!(
        report.outcome(QueueKind::Slow),
        Some(&QueueOutcome::Left {
            job_id: None,
            stage: PipelineStage::Parse,
            escalates: false,
        })
    );
    assert_eq!(h.queue.pending(QueueKind::Slow), 1);
    assert_eq!(report.interval, BASE_INTERVAL);
}

#[tokio::test]
async fn fast_queue_is_served_before_slow() {
    let backend = Arc::new(FakeBackend::new(Script::Complete));
    let mut h = harness(backend.clone());
    h.queue.push(QueueKind::Slow, r#"{"id": "slow-1", "prompt": "slow", "seed": 1}"#);
    h.queue.push(QueueKind::Fast, r#"{"id": "fast-1", "prompt": "fast", "seed": 2}"#);

    let report = h.consumer.run_cycle().await;
    assert_eq!(report.completed(), 2);

    let prompts: Vec<Value> = backend
        .submitted()
        .iter()
        .map(|w| input(w, "16", "text"))
        .collect();
    assert_eq!(prompts, vec![json!("fast"), json!("slow")]);
}

#[tokio::test]
async fn interval_escalates_once_per_cycle_and_caps_at_thirty_seconds() {
    let mut h = harness(Arc::new(FakeBackend::new(Script::TimesOut)));
    h.queue.push(QueueKind::Fast, r#"{"id": "a", "prompt": "x", "seed": 1}"#);
    h.queue.push(QueueKind::Slow, r#"{"id": "b", "prompt": "y", "seed": 1}"#);

    let mut intervals = Vec::new();
    for _ in 0..7 {
        let report = h.consumer.run_cycle().await;
        assert_eq!(report.left(), 2);
        intervals.push(report.interval.as_secs());
    }
    assert_eq!(intervals, vec![2, 4, 8, 16, 30, 30, 30]);
}

#[tokio::test]
async fn receive_failure_escalates() {
    let mut h = harness(Arc::new(FakeBackend::new(Script::Complete)));
    h.queue.fail_receive(QueueKind::Fast);

    let report = h.consumer.run_cycle().await;
    assert_eq!(
        report.outcome(QueueKind::Fast),
        Some(&QueueOutcome::Left {
            job_id: None,
            stage: PipelineStage::Receive,
            escalates: true,
        })
    );
    assert_eq!(report.interval, BASE_INTERVAL * 2);
}

#[tokio::test]
async fn only_a_clean_working_cycle_resets_the_interval() {
    let backend = Arc::new(FakeBackend::new(Script::Complete));
    let mut h = harness(backend);

    h.queue.fail_receive(QueueKind::Slow);
    let report = h.consumer.run_cycle().await;
    assert_eq!(report.interval, BASE_INTERVAL * 2);

    // Empty cycle: nothing done, nothing failed.
    h.queue.failing_receive.lock().unwrap().clear();
    let report = h.consumer.run_cycle().await;
    assert_eq!(report.interval, BASE_INTERVAL * 2);

    h.queue.push(QueueKind::Fast, r#"{"id": "ok", "prompt": "x", "seed": 3}"#);
    let report = h.consumer.run_cycle().await;
    assert_eq!(report.completed(), 1);
    assert_eq!(report.interval, BASE_INTERVAL);
}

#[tokio::test]
async fn trigger_fires_every_tenth_cycle_and_never_blocks_acks() {
    let trigger = Arc::new(RecordingTrigger {
        fail: true,
        ..Default::default()
    });
    let h = harness(Arc::new(FakeBackend::new(Script::Complete)));
    let mut consumer = h.consumer.with_trigger(trigger.clone());

    for cycle in 1..=20u64 {
        if cycle == 10 {
            h.queue.push(QueueKind::Fast, r#"{"id": "t10", "prompt": "x", "seed": 9}"#);
        }
        let report = consumer.run_cycle().await;
        assert_eq!(report.cycle, cycle);
        assert_eq!(report.triggered, cycle % 10 == 0);
        if cycle == 10 {
            assert_eq!(report.completed(), 1);
        }
    }

    assert_eq!(*trigger.cycles.lock().unwrap(), vec![10, 20]);
    assert_eq!(h.queue.pending(QueueKind::Fast), 0);
    assert_eq!(h.queue.deleted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn run_loop_stops_on_cancellation() {
    let queue = Arc::new(MemoryQueue::default());
    let output = output_dir();
    let mut consumer = QueueConsumer::new(
        queue,
        TemplateCatalog::new(shipped_workflows()),
        Arc::new(FakeBackend::new(Script::Complete)),
        ResultPublisher::new(Arc::new(MemoryStore::default()), output.path()),
        Duration::from_millis(5),
    );

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), consumer.run(cancel))
        .await
        .expect("dispatch loop ignored cancellation");
    assert!(consumer.cycles() >= 1);
}

/// Completes like [`Script::Complete`], but only once released.
struct GatedBackend {
    inner: FakeBackend,
    started: tokio::sync::Notify,
    release: tokio::sync::Notify,
}

#[async_trait]
impl GenerationBackend for GatedBackend {
    async fn submit(&self, workflow: &WorkflowTemplate) -> Result<JobHandle, DispatchError> {
        self.inner.submit(workflow).await
    }

    async fn await_completion(
        &self,
        handle: &JobHandle,
        output_node: Option<&str>,
    ) -> Result<Outputs, DispatchError> {
        self.started.notify_one();
        self.release.notified().await;
        self.inner.await_completion(handle, output_node).await
    }
}

#[tokio::test]
async fn cancellation_lets_the_in_flight_job_finish() {
    let backend = Arc::new(GatedBackend {
        inner: FakeBackend::new(Script::Complete),
        started: tokio::sync::Notify::new(),
        release: tokio::sync::Notify::new(),
    });
    let h = harness(backend.clone());
    h.queue.push(QueueKind::Fast, r#"{"id":"abc","prompt":"a lighthouse","seed":7}"#);

    let cancel = CancellationToken::new();
    let mut consumer = h.consumer;
    let loop_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        consumer.run(loop_cancel).await;
        consumer
    });

    backend.started.notified().await;
    cancel.cancel();
    backend.release.notify_one();

    let consumer = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("dispatch loop ignored cancellation")
        .unwrap();

    assert_eq!(consumer.cycles(), 1);
    assert_eq!(h.queue.pending(QueueKind::Fast), 0);
    assert_eq!(h.queue.deleted.lock().unwrap().len(), 1);
    assert!(h.store.keys().contains(&"abc_final.json".to_string()));
}
