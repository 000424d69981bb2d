//! Background task manager for tracking engine tasks and collecting their results.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{BackgroundTask, TaskCompletionInfo, TaskId, TaskRecord, TaskState, TaskType, TaskUpdate};
use crate::db::FaceStore;
use crate::record::{AnalysisEngine, RecordedAnalysis, RecordedVerification};

/// Tracks background tasks and collects their results.
pub struct TaskManager {
    tasks: HashMap<TaskId, BackgroundTask>,
    /// Order in which tasks were added.
    task_order: Vec<TaskId>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            task_order: Vec::new(),
        }
    }

    /// Register a new background task.
    /// Returns the TaskId and a sender for the task to send updates.
    pub fn register_task(&mut self, task_type: TaskType) -> (TaskId, mpsc::Sender<TaskUpdate>) {
        let (tx, rx) = mpsc::channel();
        let task = BackgroundTask::new(task_type, rx);
        let id = task.id;

        self.tasks.insert(id, task);
        self.task_order.push(id);

        (id, tx)
    }

    /// Analyze one image on a worker thread and record the outcome.
    pub fn spawn_analysis(
        &mut self,
        store: Arc<FaceStore>,
        engine: Arc<dyn AnalysisEngine>,
        user_id: Option<i64>,
        image: PathBuf,
    ) -> TaskId {
        let (id, tx) = self.register_task(TaskType::Analysis);

        thread::spawn(move || {
            let _ = tx.send(TaskUpdate::Started);
            let update = match run_analysis(&store, engine.as_ref(), user_id, &image) {
                Ok(recorded) => TaskUpdate::Completed {
                    message: format!("Analyzed {}", image.display()),
                    record: TaskRecord::Analysis(recorded),
                },
                Err(e) => {
                    warn!("Analysis of {:?} failed: {:#}", image, e);
                    TaskUpdate::Failed { error: format!("{:#}", e) }
                }
            };
            let _ = tx.send(update);
        });

        id
    }

    /// Verify two images on a worker thread and record the outcome.
    pub fn spawn_verification(
        &mut self,
        store: Arc<FaceStore>,
        engine: Arc<dyn AnalysisEngine>,
        user_id: Option<i64>,
        image1: PathBuf,
        image2: PathBuf,
    ) -> TaskId {
        let (id, tx) = self.register_task(TaskType::Verification);

        thread::spawn(move || {
            let _ = tx.send(TaskUpdate::Started);
            let update = match run_verification(&store, engine.as_ref(), user_id, &image1, &image2) {
                Ok(recorded) => TaskUpdate::Completed {
                    message: format!(
                        "{} and {}: {}",
                        image1.display(),
                        image2.display(),
                        if recorded.verified { "same person" } else { "different people" }
                    ),
                    record: TaskRecord::Verification(recorded),
                },
                Err(e) => {
                    warn!("Verification of {:?} and {:?} failed: {:#}", image1, image2, e);
                    TaskUpdate::Failed { error: format!("{:#}", e) }
                }
            };
            let _ = tx.send(update);
        });

        id
    }

    /// Check if a task of the given type is still running.
    pub fn is_running(&self, task_type: TaskType) -> bool {
        self.tasks.values().any(|t| t.task_type == task_type && t.is_running())
    }

    /// Poll all task channels for updates without blocking.
    /// Finished tasks are returned once and then forgotten.
    pub fn poll_updates(&mut self) -> Vec<TaskCompletionInfo> {
        let mut completed = Vec::new();

        for id in self.task_order.clone() {
            if let Some(task) = self.tasks.get_mut(&id) {
                loop {
                    match task.receiver.try_recv() {
                        Ok(update) => {
                            if let Some(info) = apply_update(task, update) {
                                completed.push(info);
                                break;
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            completed.push(worker_lost(task));
                            break;
                        }
                    }
                }
            }
        }

        for info in &completed {
            self.forget(info.id);
        }

        completed
    }

    /// Block until the given task finishes or `timeout` passes.
    pub fn wait_for(&mut self, id: TaskId, timeout: Duration) -> Option<TaskCompletionInfo> {
        let deadline = Instant::now() + timeout;
        let task = self.tasks.get_mut(&id)?;

        let info = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match task.receiver.recv_timeout(remaining) {
                Ok(update) => {
                    if let Some(info) = apply_update(task, update) {
                        break info;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => break worker_lost(task),
            }
        };

        self.forget(id);
        Some(info)
    }

    /// Get all running tasks for display.
    pub fn running_tasks(&self) -> Vec<&BackgroundTask> {
        self.task_order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.is_running())
            .collect()
    }

    pub fn has_running_tasks(&self) -> bool {
        self.tasks.values().any(|t| t.is_running())
    }

    fn forget(&mut self, id: TaskId) {
        self.tasks.remove(&id);
        self.task_order.retain(|t| *t != id);
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

fn run_analysis(
    store: &FaceStore,
    engine: &dyn AnalysisEngine,
    user_id: Option<i64>,
    image: &Path,
) -> Result<RecordedAnalysis> {
    let outcome = engine
        .analyze(image)
        .with_context(|| format!("{} could not analyze {}", engine.engine_name(), image.display()))?;
    let recorded = store
        .record_analysis(user_id, image, &outcome)
        .context("Failed to record analysis")?;
    Ok(recorded)
}

fn run_verification(
    store: &FaceStore,
    engine: &dyn AnalysisEngine,
    user_id: Option<i64>,
    image1: &Path,
    image2: &Path,
) -> Result<RecordedVerification> {
    let outcome = engine.verify(image1, image2).with_context(|| {
        format!(
            "{} could not verify {} against {}",
            engine.engine_name(),
            image1.display(),
            image2.display()
        )
    })?;
    let recorded = store
        .record_verification(user_id, image1, image2, &outcome)
        .context("Failed to record verification")?;
    Ok(recorded)
}

/// Fold one update into the task. Returns completion info once the task is finished.
fn apply_update(task: &mut BackgroundTask, update: TaskUpdate) -> Option<TaskCompletionInfo> {
    match update {
        TaskUpdate::Started => {
            debug!("{} task {} started", task.task_type.display_name(), task.id.0);
            None
        }
        TaskUpdate::Completed { message, record } => {
            task.state = TaskState::Completed;
            Some(TaskCompletionInfo {
                id: task.id,
                task_type: task.task_type,
                message,
                record: Some(record),
                success: true,
            })
        }
        TaskUpdate::Failed { error } => {
            task.state = TaskState::Failed(error.clone());
            Some(TaskCompletionInfo {
                id: task.id,
                task_type: task.task_type,
                message: error,
                record: None,
                success: false,
            })
        }
    }
}

/// The worker hung up without reporting a result.
fn worker_lost(task: &mut BackgroundTask) -> TaskCompletionInfo {
    let error = "worker exited without reporting a result".to_string();
    task.state = TaskState::Failed(error.clone());
    TaskCompletionInfo {
        id: task.id,
        task_type: task.task_type,
        message: error,
        record: None,
        success: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AnalyzeResult, VerifyResult};
    use crate::record::{AnalyzeOutcome, FaceSample, VerifyOutcome};
    use anyhow::anyhow;

    const WAIT: Duration = Duration::from_secs(10);

    struct FixedEngine;

    impl AnalysisEngine for FixedEngine {
        fn analyze(&self, _image: &Path) -> Result<AnalyzeOutcome> {
            Ok(AnalyzeOutcome {
                result: AnalyzeResult { age: Some(33), ..Default::default() },
                face: Some(FaceSample { embedding: vec![0.6, 0.8], face_location: None }),
                ..Default::default()
            })
        }

        fn verify(&self, _image1: &Path, _image2: &Path) -> Result<VerifyOutcome> {
            Ok(VerifyOutcome {
                result: VerifyResult { verified: Some(false), distance: Some(0.72), ..Default::default() },
                ..Default::default()
            })
        }

        fn engine_name(&self) -> &'static str {
            "fixed"
        }
    }

    struct BrokenEngine;

    impl AnalysisEngine for BrokenEngine {
        fn analyze(&self, _image: &Path) -> Result<AnalyzeOutcome> {
            Err(anyhow!("no face detected"))
        }

        fn verify(&self, _image1: &Path, _image2: &Path) -> Result<VerifyOutcome> {
            Err(anyhow!("no face detected"))
        }

        fn engine_name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn test_analysis_task_records_outcome() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let mut manager = TaskManager::new();

        let id = manager.spawn_analysis(store.clone(), Arc::new(FixedEngine), None, PathBuf::from("/img/a.jpg"));
        let info = manager.wait_for(id, WAIT).unwrap();

        assert!(info.success, "{}", info.message);
        assert_eq!(info.task_type, TaskType::Analysis);
        let Some(TaskRecord::Analysis(recorded)) = info.record else {
            panic!("unexpected record: {:?}", info.record);
        };
        assert!(recorded.embedding_id.is_some());
        assert!(store.get_analysis(recorded.analysis_id).unwrap().is_some());
        assert!(!manager.has_running_tasks());
    }

    #[test]
    fn test_verification_task_records_outcome() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let mut manager = TaskManager::new();

        let id = manager.spawn_verification(
            store.clone(),
            Arc::new(FixedEngine),
            None,
            PathBuf::from("/img/a.jpg"),
            PathBuf::from("/img/b.jpg"),
        );
        let info = manager.wait_for(id, WAIT).unwrap();

        assert!(info.success);
        assert!(info.message.contains("different people"));
        let history = store.get_verification_history(1).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].similarity_score, 0.72);
        assert!(!history[0].verified);
    }

    #[test]
    fn test_engine_failure_is_reported_and_writes_nothing() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let mut manager = TaskManager::new();

        let id = manager.spawn_analysis(store.clone(), Arc::new(BrokenEngine), None, PathBuf::from("/img/a.jpg"));
        let info = manager.wait_for(id, WAIT).unwrap();

        assert!(!info.success);
        assert!(info.message.contains("no face detected"));
        assert!(info.record.is_none());
        assert_eq!(store.get_database_stats().unwrap().analysis_count, 0);
    }

    #[test]
    fn test_store_failure_is_reported() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let mut manager = TaskManager::new();

        let id = manager.spawn_analysis(store, Arc::new(FixedEngine), Some(404), PathBuf::from("/img/a.jpg"));
        let info = manager.wait_for(id, WAIT).unwrap();

        assert!(!info.success);
        assert!(info.message.contains("Failed to record analysis"));
    }

    #[test]
    fn test_poll_collects_each_completion_once() {
        let store = Arc::new(FaceStore::open_in_memory().unwrap());
        let mut manager = TaskManager::new();
        let engine: Arc<dyn AnalysisEngine> = Arc::new(FixedEngine);

        for i in 0..3 {
            manager.spawn_analysis(store.clone(), engine.clone(), None, PathBuf::from(format!("/img/{}.jpg", i)));
        }

        let deadline = Instant::now() + WAIT;
        let mut finished = Vec::new();
        while finished.len() < 3 && Instant::now() < deadline {
            finished.extend(manager.poll_updates());
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(finished.len(), 3);
        assert!(finished.iter().all(|info| info.success));
        assert!(manager.poll_updates().is_empty());
        assert!(!manager.is_running(TaskType::Analysis));
        assert_eq!(store.get_database_stats().unwrap().analysis_count, 3);
    }

    #[test]
    fn test_dropped_sender_is_failure() {
        let mut manager = TaskManager::new();
        let (id, tx) = manager.register_task(TaskType::Verification);
        assert_eq!(manager.running_tasks().len(), 1);
        drop(tx);

        let info = manager.wait_for(id, WAIT).unwrap();
        assert!(!info.success);
        assert!(manager.running_tasks().is_empty());
    }
}
