// src/utils/scheduler.rs: dynamic fan-out of chunk builds and the join barrier

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{self, JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::config::defs::{BuildError, PipelineError};
use crate::utils::partition::{Chunk, ChunkPlan};
use crate::utils::plan_store::short;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// Stable identity of a build task: the same plan always yields the same ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub fingerprint: String,
    pub chunk_index: usize,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk{}@{}", self.chunk_index, short(&self.fingerprint))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    pub id: TaskId,
    pub status: TaskStatus,
}

/// Everything a worker needs to build one chunk.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub chunk: Chunk,
}

/// Output of one successful chunk build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexArtifact {
    pub chunk_index: usize,
    pub prefix: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Unplanned,
    Planned,
    Building,
    Joined,
    Failed,
}

/// Proof that every task of one plan generation finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRecord {
    pub fingerprint: String,
    pub task_ids: Vec<TaskId>,
}

/// Work executed once per chunk.
pub trait ChunkRunner: Send + Sync + 'static {
    fn run(&self, task: TaskDescriptor) -> BoxFuture<'static, anyhow::Result<IndexArtifact>>;

    /// Lets re-runs skip chunks already built for the same plan.
    fn is_complete(&self, _task: &TaskDescriptor) -> bool {
        false
    }
}


/// Fan-in over a task set whose size is only known after planning.
#[derive(Debug, Clone)]
pub struct JoinBarrier {
    fingerprint: String,
    tasks: BTreeMap<usize, BuildTask>,
}

impl JoinBarrier {
    pub fn new(fingerprint: &str, ids: impl IntoIterator<Item = TaskId>) -> Self {
        let tasks = ids
            .into_iter()
            .map(|id| (id.chunk_index, BuildTask { id, status: TaskStatus::Pending }))
            .collect();
        JoinBarrier { fingerprint: fingerprint.to_string(), tasks }
    }

    /// Records a status change. `Running` never overwrites a terminal status
    /// and terminal statuses are final.
    pub fn update(&mut self, chunk_index: usize, status: TaskStatus) -> Result<(), PipelineError> {
        let task = self.tasks.get_mut(&chunk_index).ok_or_else(|| {
            PipelineError::SchedulerOrder(format!("chunk {} is not part of the plan", chunk_index))
        })?;
        if !task.status.is_terminal() {
            task.status = status;
        }
        Ok(())
    }

    pub fn status(&self, chunk_index: usize) -> Option<TaskStatus> {
        self.tasks.get(&chunk_index).map(|t| t.status)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &BuildTask> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_satisfied(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.values().all(|t| t.status == TaskStatus::Done)
    }

    pub fn state(&self) -> SchedulerState {
        let statuses: Vec<TaskStatus> = self.tasks.values().map(|t| t.status).collect();
        if statuses.contains(&TaskStatus::Failed) {
            SchedulerState::Failed
        } else if self.is_satisfied() {
            SchedulerState::Joined
        } else if statuses.iter().all(|s| *s == TaskStatus::Pending) {
            SchedulerState::Planned
        } else {
            SchedulerState::Building
        }
    }

    /// Some only when every task is Done.
    pub fn record(&self) -> Option<JoinRecord> {
        if !self.is_satisfied() {
            return None;
        }
        Some(JoinRecord {
            fingerprint: self.fingerprint.clone(),
            task_ids: self.tasks.values().map(|t| t.id.clone()).collect(),
        })
    }
}


enum TaskOutcome {
    Built(IndexArtifact),
    Failed(BuildError),
    NotStarted(usize),
}

struct TaskEvent {
    chunk_index: usize,
    status: TaskStatus,
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "build task panicked".to_string()
    }
}


/// Two-phase scheduler: `plan` turns a ChunkPlan into task descriptors,
/// `execute` fans them out and joins on exactly that set.
#[derive(Debug)]
pub struct FanOutScheduler {
    state: SchedulerState,
    descriptors: Vec<TaskDescriptor>,
    barrier: Option<JoinBarrier>,
}

impl Default for FanOutScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FanOutScheduler {
    pub fn new() -> Self {
        FanOutScheduler {
            state: SchedulerState::Unplanned,
            descriptors: Vec::new(),
            barrier: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn barrier(&self) -> Option<&JoinBarrier> {
        self.barrier.as_ref()
    }

    /// Creates one Pending task per chunk. Planning the same plan again returns
    /// the same descriptors; anything else after planning is an error.
    ///
    /// # Arguments
    ///
    /// * `plan` - The persisted chunk plan.
    ///
    /// # Returns
    /// Result<Vec<TaskDescriptor>, PipelineError>
    pub fn plan(&mut self, plan: &ChunkPlan) -> Result<Vec<TaskDescriptor>, PipelineError> {
        match self.state {
            SchedulerState::Unplanned => {}
            SchedulerState::Planned
                if self.barrier.as_ref().is_some_and(|b| b.fingerprint == plan.fingerprint) =>
            {
                return Ok(self.descriptors.clone());
            }
            state => {
                return Err(PipelineError::SchedulerOrder(format!(
                    "cannot plan in state {:?}",
                    state
                )));
            }
        }

        let descriptors: Vec<TaskDescriptor> = plan
            .chunks
            .iter()
            .map(|chunk| TaskDescriptor {
                id: TaskId {
                    fingerprint: plan.fingerprint.clone(),
                    chunk_index: chunk.index,
                },
                chunk: chunk.clone(),
            })
            .collect();
        self.barrier = Some(JoinBarrier::new(
            &plan.fingerprint,
            descriptors.iter().map(|d| d.id.clone()),
        ));
        self.descriptors = descriptors.clone();
        self.state = SchedulerState::Planned;
        debug!("Scheduler planned {} build task(s)", self.descriptors.len());
        Ok(descriptors)
    }

    /// Current task list. Fails before planning: the task set does not exist yet.
    pub fn tasks(&self) -> Result<Vec<BuildTask>, PipelineError> {
        self.barrier
            .as_ref()
            .map(|b| b.tasks().cloned().collect())
            .ok_or_else(|| PipelineError::SchedulerOrder("no tasks before planning".to_string()))
    }

    /// Runs every planned task with at most `concurrency` in flight and waits
    /// for all of them. After the first failure no Pending task is started;
    /// tasks already running finish and leave their artifacts on disk.
    ///
    /// # Arguments
    ///
    /// * `runner` - Per-chunk work (materialize and index).
    /// * `concurrency` - Maximum simultaneous builds.
    ///
    /// # Returns
    /// Result<JoinRecord, PipelineError>; the error names the failed chunk.
    pub async fn execute<R: ChunkRunner>(&mut self, runner: Arc<R>, concurrency: usize) -> Result<JoinRecord, PipelineError> {
        match self.state {
            SchedulerState::Planned => {}
            SchedulerState::Unplanned => {
                return Err(PipelineError::SchedulerOrder("execute called before planning".to_string()));
            }
            state => {
                return Err(PipelineError::SchedulerOrder(format!("cannot execute in state {:?}", state)));
            }
        }
        let mut barrier = self
            .barrier
            .take()
            .ok_or_else(|| PipelineError::SchedulerOrder("planned without a barrier".to_string()))?;
        self.state = SchedulerState::Building;

        let result = drive(&mut barrier, &self.descriptors, runner, concurrency).await;
        self.state = barrier.state();
        self.barrier = Some(barrier);

        let mut failures = match result {
            Ok(failures) => failures,
            Err(e) => {
                self.state = SchedulerState::Failed;
                return Err(e);
            }
        };
        if !failures.is_empty() {
            self.state = SchedulerState::Failed;
            failures.sort_by_key(|f| f.chunk_index);
            for extra in &failures[1..] {
                error!("{}", extra);
            }
            return Err(PipelineError::Build(failures.remove(0)));
        }

        match self.barrier.as_ref().and_then(|b| b.record()) {
            Some(record) => {
                self.state = SchedulerState::Joined;
                info!("All {} chunk index(es) built", record.task_ids.len());
                Ok(record)
            }
            None => {
                self.state = SchedulerState::Failed;
                Err(PipelineError::SchedulerOrder("join barrier left unsatisfied".to_string()))
            }
        }
    }
}


async fn drive<R: ChunkRunner>(
    barrier: &mut JoinBarrier,
    descriptors: &[TaskDescriptor],
    runner: Arc<R>,
    concurrency: usize,
) -> Result<Vec<BuildError>, PipelineError> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let abort = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel::<TaskEvent>(descriptors.len().max(1));
    let mut join_set = JoinSet::new();

    for task in descriptors {
        let chunk_index = task.id.chunk_index;
        let check_runner = runner.clone();
        let check_task = task.clone();
        let complete = task::spawn_blocking(move || check_runner.is_complete(&check_task))
            .await
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("checking {} failed: {}", task.id, e)))?;
        if complete {
            info!("{} already built; skipping", task.id);
            barrier.update(chunk_index, TaskStatus::Done)?;
            continue;
        }

        let task = task.clone();
        let runner = runner.clone();
        let semaphore = semaphore.clone();
        let abort = abort.clone();
        let tx = tx.clone();
        join_set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return TaskOutcome::NotStarted(chunk_index),
            };
            if abort.load(Ordering::SeqCst) {
                return TaskOutcome::NotStarted(chunk_index);
            }
            let _ = tx.send(TaskEvent { chunk_index, status: TaskStatus::Running }).await;
            info!("Building {}", task.id);

            let outcome = match AssertUnwindSafe(runner.run(task)).catch_unwind().await {
                Ok(Ok(artifact)) => TaskOutcome::Built(artifact),
                Ok(Err(e)) => TaskOutcome::Failed(BuildError { chunk_index, cause: format!("{:#}", e) }),
                Err(panic) => TaskOutcome::Failed(BuildError { chunk_index, cause: panic_message(panic) }),
            };
            // set before the permit is released so queued siblings see it
            if matches!(outcome, TaskOutcome::Failed(_)) {
                abort.store(true, Ordering::SeqCst);
            }
            outcome
        });
    }
    drop(tx);
    debug!("Waiting on {} build task(s)", join_set.len());

    let mut events = ReceiverStream::new(rx);
    let mut failures = Vec::new();
    loop {
        tokio::select! {
            biased;
            Some(event) = events.next() => {
                barrier.update(event.chunk_index, event.status)?;
            }
            joined = join_set.join_next() => match joined {
                None => break,
                Some(Ok(TaskOutcome::Built(artifact))) => {
                    info!("chunk {} indexed at {}", artifact.chunk_index, artifact.prefix.display());
                    barrier.update(artifact.chunk_index, TaskStatus::Done)?;
                }
                Some(Ok(TaskOutcome::Failed(err))) => {
                    error!("{}", err);
                    abort.store(true, Ordering::SeqCst);
                    barrier.update(err.chunk_index, TaskStatus::Failed)?;
                    failures.push(err);
                }
                Some(Ok(TaskOutcome::NotStarted(chunk_index))) => {
                    debug!("chunk {} not started after an earlier failure", chunk_index);
                }
                Some(Err(e)) => {
                    join_set.abort_all();
                    return Err(PipelineError::Other(anyhow::anyhow!("build task aborted: {}", e)));
                }
            }
        }
    }
    Ok(failures)
}
