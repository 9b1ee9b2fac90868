//! Transfer scheduler.
//!
//! Tasks are admitted in FIFO order up to `max_concurrent_tasks`; each
//! admitted task runs its chunks through a [`JoinSet`] bounded by
//! `max_chunks_per_task`, and every chunk attempt additionally holds a
//! permit from a semaphore shared by all tasks.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use sharevault_protocol::{ChunkBitmap, TaskId, TaskRecord, TransferKind, TransferStatus};
use sharevault_quota::{QuotaLedger, ReservationId};
use sharevault_sandbox::{PathVirtualizer, WritableState, ensure_writable, normalize_virtual_path};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::TransferError;
use crate::auth::AuthContext;
use crate::chunked::StorageBackend;
use crate::config::QueueConfig;
use crate::persist::PersistenceStore;
use crate::progress::{ProgressHub, ProgressStream};
use crate::types::{TaskSnapshot, TransferRequest, TransferTask, chunk_count};
use crate::validation::{validate_file_name, validate_request};
use crate::worker::{ChunkJob, ChunkOutcome};

/// How a task run ended.
enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

struct TaskEntry {
    task: TransferTask,
    job: Arc<ChunkJob>,
    reservation: Mutex<Option<ReservationId>>,
    cancel: CancellationToken,
    progress: Mutex<ProgressHub>,
    status_tx: watch::Sender<TransferStatus>,
}

impl TaskEntry {
    fn new(
        task: TransferTask,
        job: Arc<ChunkJob>,
        reservation: Option<ReservationId>,
        config: &QueueConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(task.status());
        Self {
            task,
            job,
            reservation: Mutex::new(reservation),
            cancel: CancellationToken::new(),
            progress: Mutex::new(ProgressHub::new(config.progress_interval)),
            status_tx,
        }
    }

    fn publish(&self) {
        let update = self.task.progress();
        self.progress.lock().unwrap().publish(update);
        self.status_tx.send_replace(self.task.status());
    }

    /// Emits the terminal update. Must only be called once the task is
    /// terminal.
    fn finish(&self) {
        let update = self.task.progress();
        self.progress.lock().unwrap().finish(update);
        self.status_tx.send_replace(self.task.status());
    }

    fn take_reservation(&self) -> Option<ReservationId> {
        self.reservation.lock().unwrap().take()
    }
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, Arc<TaskEntry>>,
    /// Pending tasks, ordered by id.
    waiting: VecDeque<TaskId>,
    active: usize,
    /// Destination path -> the unfinished task writing it.
    destinations: HashMap<PathBuf, TaskId>,
}

impl QueueState {
    fn enqueue(&mut self, id: TaskId) {
        let pos = self.waiting.partition_point(|w| *w < id);
        self.waiting.insert(pos, id);
    }

    /// Reserves `dest` for task `id`. Fails if another task holds it.
    fn claim(&mut self, dest: &Path, id: TaskId) -> bool {
        match self.destinations.get(dest) {
            Some(owner) => *owner == id,
            None => {
                self.destinations.insert(dest.to_path_buf(), id);
                true
            }
        }
    }

    fn unclaim(&mut self, dest: &Path, id: TaskId) {
        if self.destinations.get(dest) == Some(&id) {
            self.destinations.remove(dest);
        }
    }
}

struct QueueInner {
    config: QueueConfig,
    virtualizer: Arc<PathVirtualizer>,
    ledger: Arc<QuotaLedger>,
    store: Arc<dyn PersistenceStore>,
    /// Sandbox side.
    remote: Arc<dyn StorageBackend>,
    /// Client side.
    local: Arc<dyn StorageBackend>,
    chunk_permits: Arc<Semaphore>,
    next_id: AtomicU64,
    state: Mutex<QueueState>,
}

/// Schedules uploads into and downloads out of user sandboxes.
///
/// Cheap to clone; clones share the same queue. Methods that start work
/// spawn onto the current Tokio runtime.
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<QueueInner>,
}

impl TransferQueue {
    /// Creates a queue.
    ///
    /// `remote` serves the sandboxes, `local` the client side of each
    /// transfer.
    pub fn new(
        config: QueueConfig,
        virtualizer: Arc<PathVirtualizer>,
        ledger: Arc<QuotaLedger>,
        store: Arc<dyn PersistenceStore>,
        remote: Arc<dyn StorageBackend>,
        local: Arc<dyn StorageBackend>,
    ) -> Self {
        let config = config.sanitized();
        let chunk_permits = Arc::new(Semaphore::new(config.max_global_chunks));
        Self {
            inner: Arc::new(QueueInner {
                config,
                virtualizer,
                ledger,
                store,
                remote,
                local,
                chunk_permits,
                next_id: AtomicU64::new(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Submits a transfer for the current user.
    ///
    /// Path resolution, validation and (for uploads) quota reservation all
    /// happen here; if any of them fails, no task exists afterwards.
    pub async fn submit(
        &self,
        auth: &dyn AuthContext,
        request: TransferRequest,
    ) -> Result<TaskId, TransferError> {
        let inner = &self.inner;
        let user = auth.current_user();

        validate_file_name(&request.file_name)?;
        let requested_path = request.virtual_path();
        let physical = inner
            .virtualizer
            .resolve(&user.username, &user.base_path, &requested_path)?;
        let virtual_path = normalize_virtual_path(&requested_path)?;

        let job_paths = JobPaths::new(request.kind, physical, request.local_path.clone());
        let (source, source_path) = inner.source_of(&job_paths);
        let source_size = source
            .size(source_path)
            .await
            .map_err(|e| TransferError::Validation(format!("cannot read source: {e}")))?;
        validate_request(&request, source_size)?;

        let (_, dest_path) = inner.dest_of(&job_paths);
        let shown = match request.kind {
            TransferKind::Upload => virtual_path.clone(),
            TransferKind::Download => request.local_path.display().to_string(),
        };
        if ensure_writable(dest_path) == WritableState::NotWritable {
            return Err(TransferError::Validation(format!(
                "destination is not writable: {shown}"
            )));
        }

        // Two writers would share one staging file.
        let id = TaskId(inner.next_id.fetch_add(1, Ordering::SeqCst));
        if !inner.state.lock().unwrap().claim(dest_path, id) {
            return Err(TransferError::Validation(format!(
                "another transfer is already writing {shown}"
            )));
        }

        let reservation = match request.kind {
            TransferKind::Upload => match inner.ledger.reserve(&user.id, request.total_size, Some(id)) {
                Ok(r) => Some(r),
                Err(e) => {
                    inner.state.lock().unwrap().unclaim(dest_path, id);
                    return Err(e.into());
                }
            },
            TransferKind::Download => None,
        };

        let chunk_size = inner.config.chunk_size;
        let record = TaskRecord {
            id,
            user_id: user.id.clone(),
            username: user.username.clone(),
            base_path: user.base_path.clone(),
            kind: request.kind,
            file_name: request.file_name.clone(),
            virtual_path,
            local_path: request.local_path.clone(),
            total_size: request.total_size,
            chunk_size,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            retry_count: 0,
            completed_chunks: ChunkBitmap::new(chunk_count(request.total_size, chunk_size)),
            created_at: Utc::now(),
            error: String::new(),
        };
        if let Err(e) = inner.store.save_task(&record) {
            if let Some(r) = reservation {
                inner.ledger.release(r);
            }
            inner.state.lock().unwrap().unclaim(dest_path, id);
            return Err(e);
        }

        let job = inner.job_for(id, &job_paths);
        let entry = Arc::new(TaskEntry::new(
            TransferTask::from_record(record),
            job,
            reservation,
            &inner.config,
        ));
        {
            let mut state = inner.state.lock().unwrap();
            state.tasks.insert(id, entry);
            state.enqueue(id);
        }

        info!(
            task_id = %id,
            user_id = %user.id,
            kind = %request.kind,
            bytes = request.total_size,
            "transfer queued"
        );
        inner.pump();
        Ok(id)
    }

    /// Requests cancellation.
    ///
    /// A pending task is cancelled on the spot. A running task stops at its
    /// next chunk boundary; results of chunks already in flight are
    /// discarded. Returns `false` if the task had already finished.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, TransferError> {
        let entry = {
            let mut state = self.inner.state.lock().unwrap();
            let entry = state
                .tasks
                .get(&id)
                .cloned()
                .ok_or(TransferError::TaskNotFound(id))?;
            match entry.task.status() {
                TransferStatus::Pending => {
                    state.waiting.retain(|w| *w != id);
                    entry.task.cancel();
                }
                TransferStatus::InProgress => {
                    debug!(task_id = %id, "cancellation requested");
                    entry.cancel.cancel();
                    return Ok(true);
                }
                _ => return Ok(false),
            }
            entry
        };

        entry.cancel.cancel();
        self.inner.settle(&entry, Outcome::Cancelled).await;
        Ok(true)
    }

    /// Opens a progress stream for a task.
    pub fn subscribe_progress(&self, id: TaskId) -> Result<ProgressStream, TransferError> {
        let entry = self.inner.entry(id)?;
        let current = entry.task.progress();
        let stream = entry.progress.lock().unwrap().subscribe(current);
        Ok(stream)
    }

    pub fn status(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.inner.entry(id).ok().map(|e| e.task.snapshot())
    }

    /// All tracked tasks, ordered by id.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let state = self.inner.state.lock().unwrap();
        let mut tasks: Vec<_> = state.tasks.values().map(|e| e.task.snapshot()).collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Resolves once the task reaches a terminal state.
    pub async fn wait(&self, id: TaskId) -> Result<TransferStatus, TransferError> {
        let mut rx = self.inner.entry(id)?.status_tx.subscribe();
        let status = *rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| TransferError::TaskNotFound(id))?;
        Ok(status)
    }

    /// Forgets finished tasks. Returns how many were dropped.
    pub fn remove_finished(&self) -> usize {
        let mut state = self.inner.state.lock().unwrap();
        let before = state.tasks.len();
        state.tasks.retain(|_, e| !e.task.status().is_terminal());
        before - state.tasks.len()
    }

    /// Resumes every pending or in-progress task found in the persistence
    /// store.
    ///
    /// Paths are resolved again, upload quota is reserved again, and only
    /// chunks missing from the completion bitmap are scheduled. Records
    /// that can no longer be resumed are dropped. Returns the resumed ids.
    pub async fn recover(&self) -> Result<Vec<TaskId>, TransferError> {
        let inner = &self.inner;
        let records = inner.store.load_pending_and_in_progress()?;
        let mut recovered = Vec::new();

        for record in records {
            let id = record.id;
            inner.next_id.fetch_max(id.0 + 1, Ordering::SeqCst);
            if inner.state.lock().unwrap().tasks.contains_key(&id) {
                continue;
            }

            match inner.restore(record).await {
                Ok(entry) => {
                    info!(
                        task_id = %id,
                        bytes_done = entry.task.bytes_transferred(),
                        chunks_left = entry.task.remaining_chunks().len(),
                        "transfer recovered"
                    );
                    inner.persist(&entry);
                    let mut state = inner.state.lock().unwrap();
                    state.tasks.insert(id, entry);
                    state.enqueue(id);
                    recovered.push(id);
                }
                Err(e) => {
                    error!(task_id = %id, error = %e, "cannot resume transfer, dropping it");
                    if let Err(e) = inner.store.delete_task(id) {
                        error!(task_id = %id, error = %e, "failed to delete task record");
                    }
                }
            }
        }

        inner.pump();
        Ok(recovered)
    }
}

/// Physical endpoints of a transfer.
struct JobPaths {
    kind: TransferKind,
    sandbox: PathBuf,
    local: PathBuf,
}

impl JobPaths {
    fn new(kind: TransferKind, sandbox: PathBuf, local: PathBuf) -> Self {
        Self {
            kind,
            sandbox,
            local,
        }
    }
}

impl QueueInner {
    fn entry(&self, id: TaskId) -> Result<Arc<TaskEntry>, TransferError> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(TransferError::TaskNotFound(id))
    }

    fn source_of<'a>(&'a self, paths: &'a JobPaths) -> (&'a Arc<dyn StorageBackend>, &'a PathBuf) {
        match paths.kind {
            TransferKind::Upload => (&self.local, &paths.local),
            TransferKind::Download => (&self.remote, &paths.sandbox),
        }
    }

    fn dest_of<'a>(&'a self, paths: &'a JobPaths) -> (&'a Arc<dyn StorageBackend>, &'a PathBuf) {
        match paths.kind {
            TransferKind::Upload => (&self.remote, &paths.sandbox),
            TransferKind::Download => (&self.local, &paths.local),
        }
    }

    fn job_for(&self, task_id: TaskId, paths: &JobPaths) -> Arc<ChunkJob> {
        let (source, source_path) = self.source_of(paths);
        let (dest, dest_path) = self.dest_of(paths);
        Arc::new(ChunkJob {
            task_id,
            source: Arc::clone(source),
            source_path: source_path.clone(),
            dest: Arc::clone(dest),
            dest_path: dest_path.clone(),
            permits: Arc::clone(&self.chunk_permits),
            policy: self.config.retry.clone(),
            timeout: self.config.chunk_timeout,
        })
    }

    fn persist(&self, entry: &TaskEntry) {
        if let Err(e) = self.store.save_task(&entry.task.record()) {
            error!(task_id = %entry.task.id(), error = %e, "failed to persist task");
        }
    }

    /// Rebuilds a task from a persisted record.
    async fn restore(&self, record: TaskRecord) -> Result<Arc<TaskEntry>, TransferError> {
        let physical =
            self.virtualizer
                .resolve(&record.username, &record.base_path, &record.virtual_path)?;
        let paths = JobPaths::new(record.kind, physical, record.local_path.clone());
        let job = self.job_for(record.id, &paths);

        if !self.state.lock().unwrap().claim(&job.dest_path, record.id) {
            return Err(TransferError::Validation(format!(
                "another transfer is already writing {}",
                record.virtual_path
            )));
        }

        let reservation = match record.kind {
            TransferKind::Upload => {
                match self
                    .ledger
                    .reserve(&record.user_id, record.total_size, Some(record.id))
                {
                    Ok(r) => Some(r),
                    Err(e) => {
                        if let Err(e) = job.dest.discard(&job.dest_path).await {
                            warn!(task_id = %record.id, error = %e, "failed to discard partial output");
                        }
                        self.state.lock().unwrap().unclaim(&job.dest_path, record.id);
                        return Err(e.into());
                    }
                }
            }
            TransferKind::Download => None,
        };

        let task = TransferTask::from_record(record);
        task.requeue();
        Ok(Arc::new(TaskEntry::new(task, job, reservation, &self.config)))
    }

    /// Starts waiting tasks while there is room.
    fn pump(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            while state.active < self.config.max_concurrent_tasks {
                let Some(id) = state.waiting.pop_front() else {
                    break;
                };
                let Some(entry) = state.tasks.get(&id).cloned() else {
                    continue;
                };
                if !entry.task.start() {
                    continue;
                }
                state.active += 1;
                started.push(entry);
            }
        }

        for entry in started {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run_task(entry).await });
        }
    }

    async fn run_task(self: Arc<Self>, entry: Arc<TaskEntry>) {
        let id = entry.task.id();
        debug!(task_id = %id, chunks = entry.task.remaining_chunks().len(), "transfer started");
        self.persist(&entry);
        entry.progress.lock().unwrap().start();
        entry.publish();

        let outcome = match self.drive_chunks(&entry).await {
            Outcome::Completed => self.finalize(&entry).await,
            other => other,
        };
        self.settle(&entry, outcome).await;

        self.state.lock().unwrap().active -= 1;
        self.pump();
    }

    /// Runs the remaining chunks of a task until all are done, one fails
    /// for good, or the task is cancelled.
    async fn drive_chunks(&self, entry: &TaskEntry) -> Outcome {
        let id = entry.task.id();
        // Child of the task token: cancelled by the user or by a sibling's
        // permanent failure.
        let siblings = entry.cancel.child_token();
        let mut pending = entry.task.remaining_chunks().into_iter();
        let mut running = JoinSet::new();
        let mut failure: Option<String> = None;

        loop {
            while failure.is_none()
                && !entry.cancel.is_cancelled()
                && running.len() < self.config.max_chunks_per_task
            {
                let Some(chunk) = pending.next() else {
                    break;
                };
                entry.task.mark_in_flight(chunk.index);
                running.spawn(Arc::clone(&entry.job).run(chunk, siblings.clone()));
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let result = match joined {
                Ok(r) => r,
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(format!("chunk worker failed: {e}"));
                    }
                    siblings.cancel();
                    continue;
                }
            };

            entry.task.add_retries(result.retries);
            let discarded = failure.is_some() || entry.cancel.is_cancelled();
            match result.outcome {
                ChunkOutcome::Done if !discarded => {
                    if entry.task.complete_chunk(result.index) {
                        let length = entry.task.chunk(result.index).map_or(0, |c| c.length);
                        entry.progress.lock().unwrap().record_bytes(length);
                        self.persist(entry);
                        entry.publish();
                    }
                }
                ChunkOutcome::Done | ChunkOutcome::Cancelled => {
                    entry.task.mark_chunk_pending(result.index);
                }
                ChunkOutcome::Failed(e) => {
                    entry.task.mark_chunk_failed(result.index);
                    if failure.is_none() && !entry.cancel.is_cancelled() {
                        let reason = if e.is_transient() {
                            format!("chunk {} failed after {} retries: {e}", result.index, result.retries)
                        } else {
                            format!("chunk {} failed: {e}", result.index)
                        };
                        warn!(task_id = %id, chunk = result.index, error = %e, "stopping transfer");
                        failure = Some(reason);
                        siblings.cancel();
                    }
                }
            }
        }

        if entry.cancel.is_cancelled() {
            Outcome::Cancelled
        } else if let Some(reason) = failure {
            Outcome::Failed(reason)
        } else if entry.task.all_chunks_done() {
            Outcome::Completed
        } else {
            Outcome::Failed("transfer stopped with chunks missing".into())
        }
    }

    /// Promotes the staged output and commits quota for uploads.
    async fn finalize(&self, entry: &TaskEntry) -> Outcome {
        if entry.cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        let job = &entry.job;
        let reservation = *entry.reservation.lock().unwrap();
        // An upload over an existing file only grows usage by the difference.
        let replaced = match reservation {
            Some(_) => job.dest.size(&job.dest_path).await.unwrap_or(0),
            None => 0,
        };
        let actual = match job.dest.finalize(&job.dest_path).await {
            Ok(n) => n,
            Err(e) => return Outcome::Failed(format!("finalizing output: {e}")),
        };

        if let Some(reservation) = reservation {
            if let Err(e) = self.ledger.commit_replacing(reservation, actual, replaced) {
                if let Err(e) = job.dest.remove(&job.dest_path).await {
                    error!(task_id = %entry.task.id(), error = %e, "failed to remove rejected output");
                }
                return Outcome::Failed(e.to_string());
            }
            entry.take_reservation();
        }
        Outcome::Completed
    }

    /// Applies the final transition, cleans up and notifies.
    async fn settle(&self, entry: &TaskEntry, outcome: Outcome) {
        let id = entry.task.id();
        match &outcome {
            Outcome::Completed => {
                entry.task.complete();
                info!(
                    task_id = %id,
                    bytes = entry.task.bytes_transferred(),
                    retries = entry.task.retry_count(),
                    elapsed_ms = entry.task.elapsed().map_or(0, |d| d.as_millis() as u64),
                    "transfer completed"
                );
            }
            Outcome::Cancelled => {
                entry.task.cancel();
                info!(task_id = %id, bytes = entry.task.bytes_transferred(), "transfer cancelled");
            }
            Outcome::Failed(reason) => {
                entry.task.fail(reason);
                error!(task_id = %id, error = %reason, "transfer failed");
            }
        }

        if !matches!(outcome, Outcome::Completed) {
            if let Some(reservation) = entry.take_reservation() {
                self.ledger.release(reservation);
            }
            if let Err(e) = entry.job.dest.discard(&entry.job.dest_path).await {
                warn!(task_id = %id, error = %e, "failed to discard partial output");
            }
        }

        if let Err(e) = self.store.delete_task(id) {
            error!(task_id = %id, error = %e, "failed to delete task record");
        }
        self.state.lock().unwrap().unclaim(&entry.job.dest_path, id);
        entry.finish();
    }
}
