use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tokio::sync::mpsc;

/// An owned task posted to the host scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum RunnerKind {
    /// Foreground = single consumer task draining an unbounded channel
    /// (serialized by construction); workers = blocking-pool threads.
    Threaded {
        fg_tx: mpsc::UnboundedSender<Task>,
        handle: tokio::runtime::Handle,
    },
    /// Every post lands in one queue executed only when the driving thread
    /// pumps it. Deterministic; used by the sync driver and tests.
    Queued { queue: Mutex<VecDeque<Task>> },
}

/// The host task runner: a foreground lane that executes tasks one at a
/// time, and a worker pool for parallel background tasks.
pub struct TaskRunner {
    kind: RunnerKind,
    worker_slots: usize,
}

impl TaskRunner {
    /// A runner backed by the current tokio runtime. `worker_slots` is the
    /// host's worker-thread count used to bound concurrent compilations.
    ///
    /// Must be called from within a runtime.
    pub fn threaded(worker_slots: usize) -> Arc<Self> {
        let handle = tokio::runtime::Handle::current();
        let (fg_tx, mut fg_rx) = mpsc::unbounded_channel::<Task>();
        handle.spawn(async move {
            while let Some(task) = fg_rx.recv().await {
                task();
            }
        });
        Arc::new(Self {
            kind: RunnerKind::Threaded { fg_tx, handle },
            worker_slots: worker_slots.max(1),
        })
    }

    /// A queue-backed runner: nothing runs until [`pump`](Self::pump) is
    /// called from the driving thread.
    pub fn deterministic() -> Arc<Self> {
        Arc::new(Self {
            kind: RunnerKind::Queued {
                queue: Mutex::new(VecDeque::new()),
            },
            worker_slots: 1,
        })
    }

    /// Host worker-thread count.
    pub fn worker_slots(&self) -> usize {
        self.worker_slots
    }

    /// Whether this runner only executes when pumped.
    pub fn is_deterministic(&self) -> bool {
        matches!(self.kind, RunnerKind::Queued { .. })
    }

    /// Post a task to the foreground lane.
    pub fn post_foreground(&self, task: Task) {
        match &self.kind {
            RunnerKind::Threaded { fg_tx, .. } => {
                // The consumer only disappears when the runtime shuts down.
                let _ = fg_tx.send(task);
            }
            RunnerKind::Queued { queue } => {
                queue.lock().expect("task queue poisoned").push_back(task);
            }
        }
    }

    /// Post a task to the worker pool.
    pub fn post_worker(&self, task: Task) {
        match &self.kind {
            RunnerKind::Threaded { handle, .. } => {
                handle.spawn_blocking(task);
            }
            RunnerKind::Queued { queue } => {
                queue.lock().expect("task queue poisoned").push_back(task);
            }
        }
    }

    /// Run one queued task on the calling thread. Returns `false` when the
    /// queue is empty (always, for a threaded runner).
    pub fn pump(&self) -> bool {
        let RunnerKind::Queued { queue } = &self.kind else {
            return false;
        };
        let task = queue.lock().expect("task queue poisoned").pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Pump until the queue is empty; returns the number of tasks run.
    pub fn pump_all(&self) -> usize {
        let mut ran = 0;
        while self.pump() {
            ran += 1;
        }
        ran
    }
}

/// Tracks in-flight tasks of one owner so cancellation can join them.
///
/// Tasks register when they *start* executing; a queued task that is
/// cancelled before it runs becomes a no-op. `cancel_and_wait` therefore
/// joins exactly the tasks that are mid-execution.
#[derive(Default)]
pub(crate) struct TaskGroup {
    running: Mutex<usize>,
    idle: Condvar,
    cancelled: AtomicBool,
}

impl TaskGroup {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn begin(&self) -> bool {
        if self.cancelled() {
            return false;
        }
        *self.running.lock().expect("task group poisoned") += 1;
        true
    }

    fn finish(&self) {
        let mut running = self.running.lock().expect("task group poisoned");
        *running -= 1;
        if *running == 0 {
            self.idle.notify_all();
        }
    }

    /// Cancel and block until every mid-execution task has finished.
    /// Idempotent.
    pub(crate) fn cancel_and_wait(&self) {
        self.cancel();
        let mut running = self.running.lock().expect("task group poisoned");
        while *running > 0 {
            running = self.idle.wait(running).expect("task group poisoned");
        }
    }

    /// Wrap a task with begin/finish accounting and the cancellation check.
    pub(crate) fn wrap(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) -> Task {
        self.wrap_with_cancel(task, || {})
    }

    /// Like [`wrap`](Self::wrap), but runs `on_cancel` when the task is
    /// executed after cancellation (e.g. to release accounting the poster
    /// already did).
    pub(crate) fn wrap_with_cancel(
        self: &Arc<Self>,
        task: impl FnOnce() + Send + 'static,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Task {
        let group = self.clone();
        Box::new(move || {
            if !group.begin() {
                on_cancel();
                return;
            }
            task();
            group.finish();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn queued_runner_runs_nothing_until_pumped() {
        let runner = TaskRunner::deterministic();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            runner.post_worker(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(runner.pump_all(), 3);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert!(!runner.pump());
    }

    #[test]
    fn cancelled_group_turns_queued_tasks_into_noops() {
        let runner = TaskRunner::deterministic();
        let group = TaskGroup::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_task = ran.clone();
        runner.post_worker(group.wrap(move || {
            ran_task.fetch_add(1, Ordering::SeqCst);
        }));
        group.cancel_and_wait();
        runner.pump_all();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_and_wait_joins_running_tasks() {
        let runner = TaskRunner::threaded(2);
        let group = TaskGroup::new();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let group_for_task = group.clone();
        let finished_task = finished.clone();
        runner.post_worker(group.wrap(move || {
            entered_tx.send(()).unwrap();
            while !group_for_task.cancelled() {
                std::thread::yield_now();
            }
            finished_task.store(true, Ordering::SeqCst);
        }));

        entered_rx.recv().unwrap();
        let group_clone = group.clone();
        tokio::task::spawn_blocking(move || group_clone.cancel_and_wait())
            .await
            .unwrap();
        assert!(finished.load(Ordering::SeqCst));
        // Idempotent.
        group.cancel_and_wait();
    }
}
