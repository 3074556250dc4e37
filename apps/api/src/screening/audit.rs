//! Node-run audit trail.
//!
//! Pipeline steps report through a `NodeRunTracker`, which only enqueues.
//! A single writer task drains the queue in order and persists `NodeRun`
//! rows, so audit writes never slow down or fail a screening. Any write
//! whose (task, resume) item cannot be resolved is logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::screening::{NodeKind, NodeRun, NodeRunStatus, TokenUsage};
use crate::screening::pipeline::StepListener;
use crate::screening::scorer::ScoringError;
use crate::screening::store::{NodeRunFinish, ScreeningStore};

/// Identifies one step of one pipeline invocation.
#[derive(Debug, Clone)]
struct StepKey {
    task_id: Uuid,
    resume_id: Uuid,
    trace_id: Uuid,
    node: NodeKind,
    scorer_version: String,
}

enum AuditEvent {
    Start {
        key: StepKey,
        input: Value,
        at: DateTime<Utc>,
    },
    Finish {
        key: StepKey,
        finish: NodeRunFinish,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the writer task. Cloning shares the same queue.
#[derive(Clone)]
pub struct AuditRecorder {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditRecorder {
    /// Spawns the writer. It exits once every recorder and tracker is dropped.
    pub fn spawn(store: Arc<dyn ScreeningStore>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(store, rx));
        (Self { tx }, handle)
    }

    /// A listener for one match invocation; every step it reports shares
    /// one fresh trace id.
    pub fn tracker(&self, task_id: Uuid, resume_id: Uuid, scorer_version: &str) -> NodeRunTracker {
        NodeRunTracker {
            tx: self.tx.clone(),
            task_id,
            resume_id,
            trace_id: Uuid::new_v4(),
            scorer_version: scorer_version.to_string(),
        }
    }

    /// Resolves once everything enqueued before this call has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AuditEvent::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

pub struct NodeRunTracker {
    tx: mpsc::UnboundedSender<AuditEvent>,
    task_id: Uuid,
    resume_id: Uuid,
    trace_id: Uuid,
    scorer_version: String,
}

impl NodeRunTracker {
    #[cfg(test)]
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    fn key(&self, node: NodeKind) -> StepKey {
        StepKey {
            task_id: self.task_id,
            resume_id: self.resume_id,
            trace_id: self.trace_id,
            node,
            scorer_version: self.scorer_version.clone(),
        }
    }

    fn send(&self, event: AuditEvent) {
        if self.tx.send(event).is_err() {
            debug!(trace_id = %self.trace_id, "Audit writer stopped; dropping event");
        }
    }
}

impl StepListener for NodeRunTracker {
    fn on_step_start(&self, node: NodeKind, input: &Value) {
        self.send(AuditEvent::Start {
            key: self.key(node),
            input: input.clone(),
            at: Utc::now(),
        });
    }

    fn on_step_end(&self, node: NodeKind, output: &Value, usage: Option<TokenUsage>) {
        self.send(AuditEvent::Finish {
            key: self.key(node),
            finish: NodeRunFinish {
                status: NodeRunStatus::Completed,
                output: Some(output.clone()),
                token_usage: usage,
                error: None,
                finished_at: Utc::now(),
            },
        });
    }

    fn on_step_error(&self, node: NodeKind, error: &ScoringError) {
        self.send(AuditEvent::Finish {
            key: self.key(node),
            finish: NodeRunFinish {
                status: NodeRunStatus::Failed,
                output: None,
                token_usage: error.usage(),
                error: Some(error.to_string()),
                finished_at: Utc::now(),
            },
        });
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Writer
// ────────────────────────────────────────────────────────────────────────────

async fn run_writer(store: Arc<dyn ScreeningStore>, mut rx: mpsc::UnboundedReceiver<AuditEvent>) {
    // (trace, node) → node run opened by a start event
    let mut open: HashMap<(Uuid, NodeKind), Uuid> = HashMap::new();

    while let Some(event) = rx.recv().await {
        match event {
            AuditEvent::Start { key, input, at } => {
                if let Some(id) = open_run(store.as_ref(), &key, Some(input), at).await {
                    open.insert((key.trace_id, key.node), id);
                }
            }
            AuditEvent::Finish { key, finish } => {
                match open.remove(&(key.trace_id, key.node)) {
                    Some(id) => {
                        if let Err(e) = store.finish_node_run(id, finish).await {
                            warn!(node = %key.node, trace_id = %key.trace_id, "Failed to close node run: {e}");
                        }
                    }
                    // The start write was dropped; record the terminal state alone.
                    None => {
                        if let Some(id) =
                            open_run(store.as_ref(), &key, None, finish.finished_at).await
                        {
                            if let Err(e) = store.finish_node_run(id, finish).await {
                                warn!(node = %key.node, trace_id = %key.trace_id, "Failed to close node run: {e}");
                            }
                        }
                    }
                }
            }
            AuditEvent::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!("Audit writer stopped");
}

/// Inserts a running node-run row. Returns `None` when the write was dropped.
async fn open_run(
    store: &dyn ScreeningStore,
    key: &StepKey,
    input: Option<Value>,
    at: DateTime<Utc>,
) -> Option<Uuid> {
    let item = match store.find_task_resume(key.task_id, key.resume_id).await {
        Ok(Some(item)) => item,
        Ok(None) => {
            warn!(
                task_id = %key.task_id,
                resume_id = %key.resume_id,
                node = %key.node,
                "No task item for node run; dropping audit write"
            );
            return None;
        }
        Err(e) => {
            warn!(
                task_id = %key.task_id,
                resume_id = %key.resume_id,
                node = %key.node,
                "Could not resolve task item for node run: {e}"
            );
            return None;
        }
    };

    let previous = match store.count_node_runs(item.id, key.node).await {
        Ok(n) => n,
        Err(e) => {
            warn!(node = %key.node, "Could not count previous node runs: {e}");
            0
        }
    };

    let run = NodeRun {
        id: Uuid::new_v4(),
        task_resume_id: item.id,
        node: key.node,
        status: NodeRunStatus::Running,
        input,
        output: None,
        token_usage: None,
        error: None,
        attempt: previous + 1,
        trace_id: key.trace_id,
        scorer_version: key.scorer_version.clone(),
        started_at: at,
        finished_at: None,
    };

    match store.insert_node_run(&run).await {
        Ok(()) => Some(run.id),
        Err(e) => {
            warn!(node = %key.node, trace_id = %key.trace_id, "Failed to insert node run: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::models::screening::{
        Dimension, ResumeCounts, ScreeningStatus, ScreeningTask, ScreeningTaskResume,
    };
    use crate::screening::store::MemoryScreeningStore;

    async fn seeded() -> (Arc<MemoryScreeningStore>, Uuid, Uuid, Uuid) {
        let store = Arc::new(MemoryScreeningStore::new());
        let task_id = Uuid::new_v4();
        let resume_id = Uuid::new_v4();
        let item_id = Uuid::new_v4();
        store
            .create_task(
                &ScreeningTask {
                    id: task_id,
                    job_id: Uuid::new_v4(),
                    creator: "ana".to_string(),
                    status: ScreeningStatus::Running,
                    counts: ResumeCounts::default(),
                    weights: None,
                    model_config: None,
                    scorer_version: "test".to_string(),
                    created_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                },
                &[ScreeningTaskResume {
                    id: item_id,
                    task_id,
                    resume_id,
                    status: ScreeningStatus::Running,
                    score: None,
                    error_message: None,
                    processed_at: None,
                }],
            )
            .await
            .unwrap();
        (store, task_id, resume_id, item_id)
    }

    #[tokio::test]
    async fn test_start_then_end_updates_one_row() {
        let (store, task_id, resume_id, item_id) = seeded().await;
        let (audit, _writer) = AuditRecorder::spawn(store.clone());
        let tracker = audit.tracker(task_id, resume_id, "test");

        tracker.on_step_start(NodeKind::Skill, &json!({ "dimension": "skill" }));
        tracker.on_step_end(NodeKind::Skill, &json!({ "score": 80 }), Some(TokenUsage::new(9, 3)));
        audit.flush().await;

        let runs = store.list_node_runs(item_id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, NodeRunStatus::Completed);
        assert_eq!(runs[0].input, Some(json!({ "dimension": "skill" })));
        assert_eq!(runs[0].output, Some(json!({ "score": 80 })));
        assert_eq!(runs[0].token_usage, Some(TokenUsage::new(9, 3)));
        assert_eq!(runs[0].attempt, 1);
        assert_eq!(runs[0].trace_id, tracker.trace_id());
        assert!(runs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_error_without_start_creates_terminal_row() {
        let (store, task_id, resume_id, item_id) = seeded().await;
        let (audit, _writer) = AuditRecorder::spawn(store.clone());
        let tracker = audit.tracker(task_id, resume_id, "test");

        tracker.on_step_error(
            NodeKind::Education,
            &ScoringError::Scorer {
                dimension: Dimension::Education,
                message: "timeout".to_string(),
                usage: Some(TokenUsage::new(4, 0)),
            },
        );
        audit.flush().await;

        let runs = store.list_node_runs(item_id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, NodeRunStatus::Failed);
        assert!(runs[0].input.is_none());
        assert!(runs[0].error.as_deref().unwrap().contains("timeout"));
        assert_eq!(runs[0].token_usage, Some(TokenUsage::new(4, 0)));
    }

    #[tokio::test]
    async fn test_attempt_counts_previous_runs() {
        let (store, task_id, resume_id, item_id) = seeded().await;
        let (audit, _writer) = AuditRecorder::spawn(store.clone());

        for _ in 0..3 {
            let tracker = audit.tracker(task_id, resume_id, "test");
            tracker.on_step_start(NodeKind::Aggregate, &json!({}));
            tracker.on_step_end(NodeKind::Aggregate, &json!({}), None);
        }
        audit.flush().await;

        let mut attempts: Vec<u32> = store
            .list_node_runs(item_id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.attempt)
            .collect();
        attempts.sort();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unknown_item_is_dropped() {
        let (store, task_id, _, item_id) = seeded().await;
        let (audit, _writer) = AuditRecorder::spawn(store.clone());
        let tracker = audit.tracker(task_id, Uuid::new_v4(), "test");

        tracker.on_step_start(NodeKind::Dispatch, &json!({}));
        tracker.on_step_end(NodeKind::Dispatch, &json!({}), None);
        audit.flush().await;

        assert!(store.list_node_runs(item_id).await.unwrap().is_empty());
    }
}
