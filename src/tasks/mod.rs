//! Background task management for engine calls.
//!
//! Running a face engine can take seconds per image. These tasks run the
//! engine on a worker thread and persist the outcome through a shared
//! [`FaceStore`](crate::db::FaceStore), reporting back over a channel.

pub mod manager;

use std::sync::mpsc;
use std::time::Instant;

use crate::record::{RecordedAnalysis, RecordedVerification};

pub use manager::TaskManager;

/// Unique identifier for a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Type of background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Analysis,
    Verification,
}

impl TaskType {
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskType::Analysis => "Face Analysis",
            TaskType::Verification => "Face Verification",
        }
    }
}

/// State of a background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Failed(String),
}

/// What a finished task wrote to the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskRecord {
    Analysis(RecordedAnalysis),
    Verification(RecordedVerification),
}

/// Update messages sent from background tasks via channels.
#[derive(Debug, Clone)]
pub enum TaskUpdate {
    /// Worker picked the task up.
    Started,
    /// Engine ran and the outcome is committed.
    Completed { message: String, record: TaskRecord },
    /// Engine or store failed; nothing was written.
    Failed { error: String },
}

/// A background task with its state and update channel.
pub struct BackgroundTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub state: TaskState,
    pub receiver: mpsc::Receiver<TaskUpdate>,
    pub started_at: Instant,
}

impl BackgroundTask {
    pub fn new(task_type: TaskType, receiver: mpsc::Receiver<TaskUpdate>) -> Self {
        Self {
            id: TaskId::new(),
            task_type,
            state: TaskState::Running,
            receiver,
            started_at: Instant::now(),
        }
    }

    /// Get elapsed time since task started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }
}

/// A finished task, as returned by polling.
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
    pub id: TaskId,
    pub task_type: TaskType,
    pub message: String,
    pub record: Option<TaskRecord>,
    pub success: bool,
}
