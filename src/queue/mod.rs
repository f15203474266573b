//! Durable, single-worker task execution.
//!
//! Tasks are persisted first and then pushed onto a bounded in-memory channel
//! drained by exactly one worker loop, so at most one task is `running` at a
//! time. On [`TaskQueue::start`] a recovery pass re-enqueues whatever a previous
//! process left `pending` or `running`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ffmpeg::{FFmpegProcessor, ProgressCallback};
use crate::hub::HubHandle;
use crate::job::{NewTask, ProgressEvent, Task, TaskStatus};
use crate::store::TaskStore;

/// Tunables for the queue
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// Bound of the pending-work channel
    pub capacity: usize,
    /// How long an unconsumed canceled-intent is kept
    pub cancel_intent_ttl: Duration,
}

impl QueueOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capacity: config.queue_capacity.max(1),
            cancel_intent_ttl: config.cancel_intent_ttl(),
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The task currently owned by the worker
#[derive(Debug)]
struct ActiveTask {
    task_id: i64,
    /// Taken by the first cancel; later cancels find `None`
    kill: Option<oneshot::Sender<()>>,
}

/// State shared by the worker loop and cancel callers, under one lock
#[derive(Debug, Default)]
struct CancelState {
    current: Option<ActiveTask>,
    intents: HashMap<i64, Instant>,
}

impl CancelState {
    fn prune(&mut self, ttl: Duration) {
        let before = self.intents.len();
        self.intents.retain(|_, marked| marked.elapsed() < ttl);
        let pruned = before - self.intents.len();
        if pruned > 0 {
            debug!("Pruned {} expired cancel intents", pruned);
        }
    }
}

struct Inner {
    store: Arc<dyn TaskStore>,
    processor: FFmpegProcessor,
    hub: HubHandle,
    options: QueueOptions,
    sender: mpsc::Sender<Task>,
    receiver: Mutex<Option<mpsc::Receiver<Task>>>,
    started: AtomicBool,
    state: Mutex<CancelState>,
    /// Ids handed to the channel during this process lifetime
    enqueued: Mutex<HashSet<i64>>,
    /// Held by recovery until it has enqueued everything it found
    intake: Arc<tokio::sync::Mutex<()>>,
}

/// Handle to the task queue; cheap to clone
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        processor: FFmpegProcessor,
        hub: HubHandle,
        options: QueueOptions,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(options.capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                store,
                processor,
                hub,
                options,
                sender,
                receiver: Mutex::new(Some(receiver)),
                started: AtomicBool::new(false),
                state: Mutex::new(CancelState::default()),
                enqueued: Mutex::new(HashSet::new()),
                intake: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    /// Persist a task as pending and queue it for execution.
    ///
    /// Fails when the store write fails, in which case nothing is queued.
    pub async fn submit(&self, task: NewTask) -> Result<Task> {
        let task = self.inner.store.create(&task)?;
        info!("Task {} added: {:?} ({})", task.id, task.input_path, task.kind);

        // announced before the worker can see it, so pending precedes running
        self.inner.hub.publish(ProgressEvent::new(
            &task,
            TaskStatus::Pending,
            0.0,
            "Task added to queue",
        ));

        let _gate = self.inner.intake.lock().await;
        self.enqueue(task.clone()).await?;
        Ok(task)
    }

    /// Cancel a task. Idempotent.
    ///
    /// A queued task is skipped when dequeued; the running task has its
    /// process killed and is reported as failed by the worker. Errors only
    /// when the kill request cannot be delivered.
    pub fn cancel(&self, id: i64) -> Result<()> {
        let mut state = lock(&self.inner.state);
        state.prune(self.inner.options.cancel_intent_ttl);

        let Some(active) = state.current.as_mut().filter(|a| a.task_id == id) else {
            state.intents.insert(id, Instant::now());
            debug!("Task {} marked as canceled", id);
            return Ok(());
        };

        match active.kill.take() {
            Some(kill) => {
                info!("Canceling running task {}", id);
                kill.send(()).map_err(|_| Error::Signal(id))
            }
            None => {
                debug!("Task {} is already being killed", id);
                Ok(())
            }
        }
    }

    /// Drop any canceled-intent held for `id`, e.g. after its record was deleted
    pub fn forget(&self, id: i64) {
        lock(&self.inner.state).intents.remove(&id);
    }

    /// Id of the task the worker currently owns
    pub fn current_task(&self) -> Option<i64> {
        lock(&self.inner.state).current.as_ref().map(|a| a.task_id)
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Spawn the worker loop and recovery. Later calls do nothing.
    ///
    /// Returns once recovery holds the intake gate, so every submission made
    /// after this call is queued behind the recovered tasks.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let receiver = lock(&self.inner.receiver).take();
        let Some(receiver) = receiver else {
            warn!("Task queue receiver already taken");
            return;
        };

        // the worker goes first: a submission holding the gate may be waiting on channel space
        let queue = self.clone();
        tokio::spawn(async move { queue.run(receiver).await });

        let gate = self.inner.intake.clone().lock_owned().await;
        let queue = self.clone();
        tokio::spawn(async move {
            match queue.recover(gate).await {
                Ok(count) => info!("Recovered {} unfinished tasks", count),
                Err(e) => error!("Failed to recover pending tasks: {}", e),
            }
        });
        info!("Task queue started");
    }

    /// Queue stored pending tasks that have not been queued in this process.
    ///
    /// Returns how many were added.
    pub async fn sweep(&self) -> Result<usize> {
        let tasks = self.inner.store.list_pending()?;
        let _gate = self.inner.intake.lock().await;
        let mut added = 0;
        for task in tasks {
            if self.enqueue(task).await? {
                added += 1;
            }
        }
        if added > 0 {
            info!("Picked up {} new pending tasks", added);
        }
        Ok(added)
    }

    /// Apply cancel requests other processes left in the store.
    ///
    /// A request whose record is gone also drops the canceled-intent, since a
    /// deleted task is skipped at dequeue anyway. Returns how many were applied.
    pub fn apply_cancel_requests(&self) -> Result<usize> {
        let ids = self.inner.store.take_cancel_requests()?;
        for &id in &ids {
            if let Err(e) = self.cancel(id) {
                warn!("Failed to cancel task {}: {}", id, e);
            }
            if self.inner.store.get(id)?.is_none() {
                self.forget(id);
            }
        }
        Ok(ids.len())
    }

    async fn recover(&self, _gate: OwnedMutexGuard<()>) -> Result<usize> {
        let tasks = self.inner.store.list_unfinished()?;
        info!("Recovering {} pending tasks", tasks.len());

        let mut count = 0;
        for mut task in tasks {
            if task.status == TaskStatus::Running {
                // the process that ran it is gone
                task.status = TaskStatus::Pending;
                task.progress = 0.0;
                if let Err(e) =
                    self.inner
                        .store
                        .update_status(task.id, TaskStatus::Pending, 0.0, None)
                {
                    warn!("Failed to reset task {} to pending: {}", task.id, e);
                }
            }
            if self.enqueue(task).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Returns false when the task was already queued in this lifetime
    async fn enqueue(&self, task: Task) -> Result<bool> {
        if !lock(&self.inner.enqueued).insert(task.id) {
            return Ok(false);
        }
        self.inner
            .sender
            .send(task)
            .await
            .map_err(|_| Error::QueueClosed)?;
        Ok(true)
    }

    async fn run(self, mut receiver: mpsc::Receiver<Task>) {
        while let Some(task) = receiver.recv().await {
            self.process(task).await;
        }
        info!("Task queue worker stopped");
    }

    fn publish(&self, task: &Task, status: TaskStatus, progress: f64, message: impl Into<String>) {
        self.inner
            .hub
            .publish(ProgressEvent::new(task, status, progress, message));
    }

    fn persist_status(&self, task: &Task, status: TaskStatus, progress: f64, error: Option<&str>) {
        if let Err(e) = self
            .inner
            .store
            .update_status(task.id, status, progress, error)
        {
            warn!("Failed to store status {} for task {}: {}", status, task.id, e);
        }
    }

    /// Whether the stored record still asks for this task to run
    fn still_queued(&self, task: &Task) -> bool {
        match self.inner.store.get(task.id) {
            Ok(Some(stored)) => !stored.status.is_terminal(),
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to look up task {}: {}", task.id, e);
                true
            }
        }
    }

    /// Let a task that reached a terminal state be queued again by id
    fn release(&self, task_id: i64) {
        lock(&self.inner.enqueued).remove(&task_id);
    }

    /// Claim the active slot, unless a cancel for this task is pending
    fn activate(&self, task_id: i64) -> Option<oneshot::Receiver<()>> {
        let mut state = lock(&self.inner.state);
        state.prune(self.inner.options.cancel_intent_ttl);
        if state.intents.remove(&task_id).is_some() {
            return None;
        }
        let (kill, killed) = oneshot::channel();
        state.current = Some(ActiveTask {
            task_id,
            kill: Some(kill),
        });
        Some(killed)
    }

    fn deactivate(&self, task_id: i64) {
        let mut state = lock(&self.inner.state);
        if state.current.as_ref().map(|a| a.task_id) == Some(task_id) {
            state.current = None;
        }
    }

    async fn process(&self, task: Task) {
        info!("Processing task {}: {:?} ({})", task.id, task.input_path, task.kind);

        if !self.still_queued(&task) {
            info!("Task {} was deleted or already completed, skipping", task.id);
            self.forget(task.id);
            self.release(task.id);
            return;
        }

        // a skipped task stays pending, so it stays in the enqueued set
        let Some(killed) = self.activate(task.id) else {
            info!("Task {} canceled before start, skipping", task.id);
            return;
        };

        let result = self.execute(&task, killed).await;
        self.deactivate(task.id);
        self.release(task.id);

        match result {
            Ok(()) => self.finish(&task).await,
            Err(e) => self.fail(&task, &e),
        }
    }

    async fn execute(&self, task: &Task, killed: oneshot::Receiver<()>) -> Result<()> {
        // unknown kinds fail without ever being reported as running
        let kind = task.job_kind()?;

        self.persist_status(task, TaskStatus::Running, 0.0, None);
        self.publish(task, TaskStatus::Running, 0.0, "Processing started");

        if let Some(parent) = task.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let job = self
            .inner
            .processor
            .spawn(
                kind,
                &task.input_path,
                &task.output_path,
                &task.params,
                self.progress_callback(task),
            )
            .await?;
        debug!("Task {} ffmpeg started, PID: {:?}", task.id, job.pid());

        job.wait(killed).await
    }

    fn progress_callback(&self, task: &Task) -> ProgressCallback {
        let store = self.inner.store.clone();
        let hub = self.inner.hub.clone();
        let task = task.clone();
        Arc::new(move |progress: f64, message: &str| {
            if let Err(e) = store.update_progress(task.id, progress) {
                debug!("Failed to store progress for task {}: {}", task.id, e);
            }
            hub.publish(ProgressEvent::new(
                &task,
                TaskStatus::Running,
                progress,
                message,
            ));
        })
    }

    async fn finish(&self, task: &Task) {
        self.persist_status(task, TaskStatus::Finished, 100.0, None);
        self.publish(task, TaskStatus::Finished, 100.0, "Task completed successfully");

        if task.delete_original {
            match tokio::fs::remove_file(&task.input_path).await {
                Ok(()) => info!("Deleted original file: {:?}", task.input_path),
                Err(e) => warn!("Failed to delete original file {:?}: {}", task.input_path, e),
            }
        }

        info!("Task {} completed successfully", task.id);
    }

    fn fail(&self, task: &Task, err: &Error) {
        error!("Task {} failed: {}", task.id, err);
        let message = err.to_string();
        self.persist_status(task, TaskStatus::Error, task.progress, Some(&message));
        self.publish(task, TaskStatus::Error, task.progress, format!("Error: {message}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{self, HubOptions, Subscriber};
    use crate::store::SqliteStore;
    use tokio::time::timeout;

    fn setup() -> (TaskQueue, Arc<SqliteStore>, HubHandle) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let hub = hub::spawn(HubOptions {
            broadcast_capacity: 1024,
            subscriber_capacity: 1024,
        });
        let queue = TaskQueue::new(
            store.clone(),
            FFmpegProcessor::new("/definitely/not/ffmpeg", 0),
            hub.clone(),
            QueueOptions::default(),
        );
        (queue, store, hub)
    }

    async fn next_terminal(sub: &mut Subscriber, task_id: i64) -> ProgressEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = sub.recv().await.expect("hub closed");
                if event.task_id == task_id && event.status.is_terminal() {
                    return event;
                }
            }
        })
        .await
        .expect("no terminal event")
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (queue, _, _) = setup();
        assert!(!queue.is_started());
        queue.start().await;
        queue.start().await;
        assert!(queue.is_started());
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_without_spawning() {
        let (queue, store, hub) = setup();
        let mut sub = hub.register().await.unwrap();
        queue.start().await;

        let task = queue
            .submit(NewTask::new("/in/a.mp4", "/tmp/out/a.mp4", "upscale"))
            .await
            .unwrap();

        let mut statuses = Vec::new();
        let event = timeout(Duration::from_secs(5), async {
            loop {
                let event = sub.recv().await.unwrap();
                statuses.push(event.status);
                if event.status.is_terminal() {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.status, TaskStatus::Error);
        assert!(event.message.contains("unknown task type"));
        assert_eq!(statuses, vec![TaskStatus::Pending, TaskStatus::Error]);

        let stored = store.get(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Error);
        assert_eq!(queue.current_task(), None);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_task() {
        let (queue, store, hub) = setup();
        let mut sub = hub.register().await.unwrap();

        let skipped = queue
            .submit(NewTask::new("/in/a.mp4", "/tmp/out/a.mp4", "upscale"))
            .await
            .unwrap();
        let marker = queue
            .submit(NewTask::new("/in/b.mp4", "/tmp/out/b.mp4", "upscale"))
            .await
            .unwrap();
        queue.cancel(skipped.id).unwrap();
        queue.cancel(skipped.id).unwrap();

        queue.start().await;
        next_terminal(&mut sub, marker.id).await;

        let stored = store.get(skipped.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(lock(&queue.inner.state).intents.is_empty());

        // the skipped record is still pending and must not be queued again
        let enqueued = lock(&queue.inner.enqueued);
        assert!(enqueued.contains(&skipped.id));
        assert!(!enqueued.contains(&marker.id));
    }

    #[tokio::test]
    async fn test_deleted_task_is_not_dispatched() {
        let (queue, store, hub) = setup();
        let mut sub = hub.register().await.unwrap();

        let first = queue
            .submit(NewTask::new("/in/a.mp4", "/tmp/out/a.mp4", "upscale"))
            .await
            .unwrap();
        let deleted = queue
            .submit(NewTask::new("/in/b.mp4", "/tmp/out/b.mp4", "upscale"))
            .await
            .unwrap();
        let marker = queue
            .submit(NewTask::new("/in/c.mp4", "/tmp/out/c.mp4", "upscale"))
            .await
            .unwrap();
        assert!(store.delete(deleted.id).unwrap());
        queue.cancel(deleted.id).unwrap();

        queue.start().await;

        let mut seen = Vec::new();
        timeout(Duration::from_secs(5), async {
            loop {
                let event = sub.recv().await.unwrap();
                let done = event.task_id == marker.id && event.status.is_terminal();
                seen.push((event.task_id, event.status));
                if done {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert!(seen.contains(&(first.id, TaskStatus::Error)));
        let deleted_events: Vec<TaskStatus> = seen
            .iter()
            .filter(|(id, _)| *id == deleted.id)
            .map(|(_, status)| *status)
            .collect();
        assert_eq!(deleted_events, vec![TaskStatus::Pending]);

        assert!(lock(&queue.inner.state).intents.is_empty());
        assert!(lock(&queue.inner.enqueued).is_empty());
    }

    #[tokio::test]
    async fn test_finished_tasks_leave_enqueued_set() {
        let (queue, store, hub) = setup();
        let mut sub = hub.register().await.unwrap();
        queue.start().await;

        let task = queue
            .submit(NewTask::new("/in/a.mp4", "/tmp/out/a.mp4", "upscale"))
            .await
            .unwrap();
        next_terminal(&mut sub, task.id).await;
        assert!(lock(&queue.inner.enqueued).is_empty());

        // a terminal record is never picked up again
        assert_eq!(queue.sweep().await.unwrap(), 0);
        assert_eq!(store.get(task.id).unwrap().unwrap().status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_submission_waiting_on_gate_runs_after_recovered_tasks() {
        let (queue, store, hub) = setup();
        let mut sub = hub.register().await.unwrap();

        let recovered = store
            .create(&NewTask::new("/in/old.mp4", "/tmp/out/old.mp4", "upscale"))
            .unwrap();

        // a submission in flight while the queue starts
        let busy = queue.inner.intake.clone().lock_owned().await;
        let starter = queue.clone();
        let start = tokio::spawn(async move { starter.start().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(busy);
        start.await.unwrap();

        let fresh = queue
            .submit(NewTask::new("/in/new.mp4", "/tmp/out/new.mp4", "upscale"))
            .await
            .unwrap();

        let mut order = Vec::new();
        timeout(Duration::from_secs(5), async {
            while order.len() < 2 {
                let event = sub.recv().await.unwrap();
                if event.status.is_terminal() {
                    order.push(event.task_id);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(order, vec![recovered.id, fresh.id]);
    }

    #[tokio::test]
    async fn test_cancel_requests_from_store_are_applied() {
        let (queue, store, _) = setup();
        let kept = store
            .create(&NewTask::new("/in/a.mp4", "/tmp/out/a.mp4", "upscale"))
            .unwrap();

        // 7 is running and its record was deleted elsewhere
        let mut killed = queue.activate(7).unwrap();
        store.request_cancel(7).unwrap();
        store.request_cancel(kept.id).unwrap();

        assert_eq!(queue.apply_cancel_requests().unwrap(), 2);
        assert!(killed.try_recv().is_ok());

        let state = lock(&queue.inner.state);
        assert!(state.intents.contains_key(&kept.id));
        assert!(!state.intents.contains_key(&7));
        drop(state);

        assert_eq!(queue.apply_cancel_requests().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_not_an_error() {
        let (queue, _, _) = setup();
        assert!(queue.cancel(12345).is_ok());
        queue.forget(12345);
        assert!(lock(&queue.inner.state).intents.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_of_running_task_sends_kill_once() {
        let (queue, _, _) = setup();
        let mut killed = queue.activate(7).unwrap();
        assert_eq!(queue.current_task(), Some(7));

        queue.cancel(7).unwrap();
        queue.cancel(7).unwrap();

        assert!(killed.try_recv().is_ok());
        assert!(lock(&queue.inner.state).intents.is_empty());
        queue.deactivate(7);
        assert_eq!(queue.current_task(), None);
    }

    #[tokio::test]
    async fn test_cancel_after_process_exit_reports_signal_error() {
        let (queue, _, _) = setup();
        let killed = queue.activate(3).unwrap();
        drop(killed);
        assert!(matches!(queue.cancel(3), Err(Error::Signal(3))));
    }

    #[tokio::test]
    async fn test_expired_intents_are_pruned() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let queue = TaskQueue::new(
            store,
            FFmpegProcessor::new("ffmpeg", 0),
            hub::spawn(HubOptions::default()),
            QueueOptions {
                capacity: 4,
                cancel_intent_ttl: Duration::ZERO,
            },
        );
        queue.cancel(1).unwrap();
        queue.cancel(2).unwrap();
        // each cancel prunes the expired ones first
        assert_eq!(lock(&queue.inner.state).intents.len(), 1);
        assert!(queue.activate(2).is_some());
    }

    #[tokio::test]
    async fn test_recovery_resets_running_tasks() {
        let (queue, store, hub) = setup();
        let mut sub = hub.register().await.unwrap();

        let task = store
            .create(&NewTask::new("/in/a.mp4", "/tmp/out/a.mp4", "upscale"))
            .unwrap();
        store
            .update_status(task.id, TaskStatus::Running, 42.0, None)
            .unwrap();

        let gate = queue.inner.intake.clone().lock_owned().await;
        let recovered = queue.recover(gate).await.unwrap();
        assert_eq!(recovered, 1);
        let stored = store.get(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.progress, 0.0);

        // a second pass finds nothing new for this lifetime
        assert_eq!(queue.sweep().await.unwrap(), 0);

        queue.start().await;
        let event = next_terminal(&mut sub, task.id).await;
        assert_eq!(event.status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_sweep_picks_up_externally_created_tasks() {
        let (queue, store, hub) = setup();
        let mut sub = hub.register().await.unwrap();
        queue.start().await;

        let task = store
            .create(&NewTask::new("/in/a.mp4", "/tmp/out/a.mp4", "upscale"))
            .unwrap();

        // recovery may or may not have seen it; either way it runs once
        let _ = queue.sweep().await.unwrap();
        assert_eq!(queue.sweep().await.unwrap(), 0);
        let event = next_terminal(&mut sub, task.id).await;
        assert_eq!(event.status, TaskStatus::Error);
    }
}
