//! Single-worker task queue used to move encode/decode work off the
//! producer's thread.
//!
//! Two admission policies share one queue:
//! - encode: always admits, evicting the oldest task once the bound is hit;
//! - decode: once the queue grows past the bound, rejects non-key tasks until
//!   a key task is admitted with the queue back within the bound.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::DEFAULT_MAX_ASYNC_TASKS;

pub const MIN_TASK_SIZE: usize = 3;
pub const MAX_TASK_SIZE: usize = 1000;

/// Tasks slower than this are traced.
const SLOW_TASK: Duration = Duration::from_millis(50);

pub type TaskFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

enum Task {
    Run(TaskFn),
    Exit,
}

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    /// Pending wake-ups, the count of a semaphore.
    wakes: usize,
    decode_dropping: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
    /// Cleared by the worker on its way out, panics included.
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post(&self, queue: &mut Queue, count: usize) {
        queue.wakes += count;
        if count == 1 {
            self.wake.notify_one();
        } else {
            self.wake.notify_all();
        }
    }
}

pub struct TaskManager {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    max_task: usize,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            thread: None,
            max_task: DEFAULT_MAX_ASYNC_TASKS,
        }
    }

    pub fn set_max_task_size(&mut self, size: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            (MIN_TASK_SIZE..=MAX_TASK_SIZE).contains(&size),
            "async task size limited to {} ~ {}, now size is: {}",
            MIN_TASK_SIZE,
            MAX_TASK_SIZE,
            size
        );
        self.max_task = size;
        Ok(())
    }

    pub fn max_task_size(&self) -> usize {
        self.max_task
    }

    /// Spawns the worker. Does nothing if one is already running; a worker
    /// that died is reaped and replaced, keeping its queued tasks.
    pub fn start_thread(&mut self, name: &str) -> anyhow::Result<()> {
        if self.is_enabled() {
            log::warn!("{} already running", name);
            return Ok(());
        }
        if let Some(handle) = self.thread.take() {
            Self::join(handle);
        }
        let shared = Arc::clone(&self.shared);
        let thread_name = name.to_string();
        self.shared.running.store(true, Ordering::Release);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::worker_loop(shared, thread_name))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                anyhow::anyhow!("spawn {} failed: {}", name, e)
            })?;
        self.thread = Some(handle);
        Ok(())
    }

    fn join(handle: JoinHandle<()>) {
        let name = handle.thread().name().unwrap_or("task worker").to_string();
        if handle.join().is_err() {
            log::error!("{} terminated abnormally", name);
        }
    }

    /// Stops the worker and blocks until it has exited. With `drop_pending`
    /// every queued task is discarded first; otherwise queued tasks still run.
    pub fn stop_thread(&mut self, drop_pending: bool) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        {
            let mut queue = self.shared.lock();
            if drop_pending {
                queue.tasks.clear();
                queue.decode_dropping = false;
            }
            queue.tasks.push_back(Task::Exit);
            self.shared.post(&mut queue, 10);
        }
        Self::join(handle);
        let mut queue = self.shared.lock();
        queue.tasks.retain(|task| !matches!(task, Task::Exit));
        queue.wakes = queue.tasks.len();
    }

    /// True while a worker thread is alive to run queued tasks.
    pub fn is_enabled(&self) -> bool {
        self.thread.is_some() && self.shared.running.load(Ordering::Acquire)
    }

    /// A worker was started but has died; nothing would run new tasks.
    fn is_dead(&self) -> bool {
        self.thread.is_some() && !self.shared.running.load(Ordering::Acquire)
    }

    /// Number of queued, not yet started tasks.
    pub fn pending(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Queues `task`, evicting the oldest one past the bound. Refused only
    /// when the worker has died.
    pub fn add_encode_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if self.is_dead() {
            return false;
        }
        let mut queue = self.shared.lock();
        queue.tasks.push_back(Task::Run(Box::new(task)));
        if queue.tasks.len() > self.max_task {
            log::warn!("encoder thread task is too more, now drop frame!");
            queue.tasks.pop_front();
        }
        self.shared.post(&mut queue, 1);
        true
    }

    /// Queues `task` unless the queue is shedding non-key work or the worker
    /// has died.
    pub fn add_decode_task<F>(&self, key_frame: bool, task: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if self.is_dead() {
            return false;
        }
        let mut queue = self.shared.lock();
        if queue.decode_dropping {
            if !key_frame {
                log::trace!("decode thread drop frame");
                return false;
            }
            queue.decode_dropping = false;
            log::info!("decode thread stop drop frame");
        }

        queue.tasks.push_back(Task::Run(Box::new(task)));
        if queue.tasks.len() > self.max_task {
            queue.decode_dropping = true;
            log::warn!("decode thread start drop frame");
        }
        self.shared.post(&mut queue, 1);
        true
    }

    fn worker_loop(shared: Arc<Shared>, name: String) {
        let _running = RunningGuard(&shared.running);
        log::info!("{} started", name);
        loop {
            let task = {
                let mut queue = shared.lock();
                while queue.wakes == 0 {
                    queue = shared
                        .wake
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                queue.wakes -= 1;
                queue.tasks.pop_front()
            };

            let run = match task {
                None => continue,
                Some(Task::Exit) => break,
                Some(Task::Run(run)) => run,
            };

            let start = Instant::now();
            match catch_unwind(AssertUnwindSafe(run)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("{} task failed: {:#}", name, e);
                    continue;
                }
                Err(panic) => {
                    log::error!("{} caught an unknown failure, exiting", name);
                    resume_unwind(panic);
                }
            }
            let cost = start.elapsed();
            if cost > SLOW_TASK {
                log::trace!("{} task took {:?}", name, cost);
            }
        }
        log::info!("{} exited!", name);
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.stop_thread(true);
    }
}
