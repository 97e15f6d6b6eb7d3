use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Free-form key/value results of a task.
pub type TaskData = BTreeMap<String, String>;

/// A unit of fire-and-forget work.
#[async_trait]
pub trait Task: Send + 'static {
    fn name(&self) -> &str;

    async fn run(self: Box<Self>) -> anyhow::Result<TaskData>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// What callers see of a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskState {
    pub id: Uuid,
    pub name: String,
    pub state: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub data: TaskData,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is stopped")]
    Stopped,
}

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<TaskData>> + Send>>;

/// Adapts a closure returning a future into a [`Task`].
struct FuncTask {
    name: String,
    fut: BoxFuture,
}

#[async_trait]
impl Task for FuncTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>) -> anyhow::Result<TaskData> {
        self.fut.await
    }
}

struct Queued {
    id: Uuid,
    task: Box<dyn Task>,
}

/// Bounded worker pool for ad-hoc tasks. `dispatch` waits while the queue
/// is full.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

type TaskMap = Arc<RwLock<HashMap<Uuid, TaskState>>>;

struct DispatcherInner {
    tx: Mutex<Option<mpsc::Sender<Queued>>>,
    tasks: TaskMap,
    workers: Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Queued>(queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let tasks = TaskMap::default();

        let mut set = JoinSet::new();
        for n in 0..workers.max(1) {
            set.spawn(worker(n, Arc::clone(&rx), Arc::clone(&tasks)));
        }
        Self {
            inner: Arc::new(DispatcherInner {
                tx: Mutex::new(Some(tx)),
                tasks,
                workers: Mutex::new(set),
            }),
        }
    }

    pub async fn dispatch(&self, task: impl Task) -> Result<Uuid, DispatchError> {
        self.dispatch_boxed(Box::new(task)).await
    }

    /// Run `f` on the pool as a task named `name`.
    pub async fn dispatch_func<F, Fut>(&self, name: &str, f: F) -> Result<Uuid, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<TaskData>> + Send + 'static,
    {
        self.dispatch_boxed(Box::new(FuncTask {
            name: name.to_owned(),
            fut: Box::pin(f()),
        }))
        .await
    }

    async fn dispatch_boxed(&self, task: Box<dyn Task>) -> Result<Uuid, DispatchError> {
        let tx = self.inner.tx.lock().await.clone().ok_or(DispatchError::Stopped)?;
        let id = Uuid::new_v4();
        self.inner.tasks.write().await.insert(
            id,
            TaskState {
                id,
                name: task.name().to_owned(),
                state: TaskStatus::Pending,
                error: None,
                data: TaskData::new(),
            },
        );
        if tx.send(Queued { id, task }).await.is_err() {
            self.inner.tasks.write().await.remove(&id);
            return Err(DispatchError::Stopped);
        }
        debug!("Dispatched task {}", id);
        Ok(id)
    }

    pub async fn lookup(&self, id: &Uuid) -> Option<TaskState> {
        self.inner.tasks.read().await.get(id).cloned()
    }

    /// Refuse new tasks, then wait for queued and running ones to finish.
    pub async fn stop(&self) {
        if self.inner.tx.lock().await.take().is_none() {
            return;
        }
        let mut workers = std::mem::take(&mut *self.inner.workers.lock().await);
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!("task worker failed: {}", e);
            }
        }
        info!("Dispatcher stopped");
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS, DEFAULT_QUEUE_SIZE)
    }
}

async fn worker(n: usize, rx: Arc<Mutex<mpsc::Receiver<Queued>>>, tasks: TaskMap) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(Queued { id, task }) = next else {
            debug!("task worker {} exiting", n);
            return;
        };

        set_status(&tasks, &id, TaskStatus::Running, None, None).await;
        let name = task.name().to_owned();
        match task.run().await {
            Ok(data) => {
                debug!("Task {} ({}) complete", id, name);
                set_status(&tasks, &id, TaskStatus::Complete, None, Some(data)).await;
            }
            Err(e) => {
                warn!("task {} ({}) failed: {:#}", id, name, e);
                set_status(&tasks, &id, TaskStatus::Failed, Some(format!("{e:#}")), None).await;
            }
        }
    }
}

async fn set_status(
    tasks: &RwLock<HashMap<Uuid, TaskState>>,
    id: &Uuid,
    status: TaskStatus,
    error: Option<String>,
    data: Option<TaskData>,
) {
    let mut tasks = tasks.write().await;
    if let Some(state) = tasks.get_mut(id) {
        state.state = status;
        state.error = error;
        if let Some(data) = data {
            state.data = data;
        }
    }
}
