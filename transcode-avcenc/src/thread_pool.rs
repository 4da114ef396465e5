//! Persistent worker pool.
//!
//! Workers park on a single condition variable between frames. `activate`
//! publishes a frame and wakes them; `sync` blocks the caller until every
//! worker that joined the frame has returned and both job queues are empty.
//! Worker `i` always processes slot `i` of the active context set, slot 0
//! being reserved for the calling thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::PoolJoinError;
use crate::process::{panic_message, run_worker, PicContext, ProcessShared};

#[derive(Debug, Default)]
struct PoolState {
    init_done: bool,
    end_of_stream: bool,
    working_threads: usize,
    has_frame: bool,
    active_set: usize,
    generation: u64,
    frame: Option<Arc<PicContext>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
    work: Arc<ProcessShared>,
}

impl PoolShared {
    // Caller holds the state lock.
    fn finish_frame_if_idle(&self, state: &mut PoolState) -> bool {
        if state.working_threads == 0 && self.work.queues.is_idle() {
            state.has_frame = false;
            state.frame = None;
            true
        } else {
            false
        }
    }
}

/// Pool of long-lived worker threads.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    handles: Vec<(usize, JoinHandle<()>)>,
    created: Vec<bool>,
}

impl ThreadPool {
    pub fn new(work: Arc<ProcessShared>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                cond: Condvar::new(),
                work,
            }),
            handles: Vec::new(),
            created: Vec::new(),
        }
    }

    /// Spawn `num_cores - 1` workers. Does nothing if already initialized.
    ///
    /// A worker that cannot be spawned is skipped; the frame is still
    /// completed by the remaining workers and the calling thread.
    pub fn init(&mut self, num_cores: usize) {
        if self.shared.state.lock().init_done {
            return;
        }

        let num_cores = num_cores.min(self.shared.work.num_cores()).max(1);
        self.created = vec![false; num_cores];
        self.created[0] = true;
        for slot in 1..num_cores {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("avcenc-worker-{slot}"))
                .spawn(move || worker_loop(shared, slot));
            match spawned {
                Ok(handle) => {
                    self.handles.push((slot, handle));
                    self.created[slot] = true;
                }
                Err(e) => {
                    tracing::warn!(slot, error = %e, "Failed to spawn encoder worker");
                }
            }
        }

        self.shared.state.lock().init_done = true;
        tracing::debug!(workers = self.handles.len(), "Thread pool initialized");
    }

    /// Check if `init` has run since the last shutdown.
    pub fn is_initialized(&self) -> bool {
        self.shared.state.lock().init_done
    }

    /// Number of live worker threads.
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Per-slot spawn results of the last `init`.
    pub fn created(&self) -> &[bool] {
        &self.created
    }

    /// Publish a frame for context set `set` and wake the workers.
    pub fn activate(&self, set: usize, frame: Arc<PicContext>) {
        if self.handles.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock();
        state.working_threads = 0;
        state.has_frame = true;
        state.active_set = set;
        state.generation += 1;
        state.frame = Some(frame);
        self.shared.cond.notify_all();
    }

    /// Block until the active frame is complete.
    pub fn sync(&self) {
        if self.handles.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock();
        while state.has_frame && !self.shared.finish_frame_if_idle(&mut state) {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Stop and join every worker. Safe to call more than once.
    pub fn shutdown(&mut self) -> Result<(), PoolJoinError> {
        {
            let mut state = self.shared.state.lock();
            if !state.init_done && self.handles.is_empty() {
                return Ok(());
            }
            state.end_of_stream = true;
            self.shared.cond.notify_all();
        }

        let mut result = Ok(());
        for (index, handle) in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                if result.is_ok() {
                    result = Err(PoolJoinError::WorkerPanicked {
                        index,
                        message: panic_message(&*payload),
                    });
                }
            }
        }

        *self.shared.state.lock() = PoolState::default();
        self.created.clear();
        tracing::debug!("Thread pool shut down");
        result
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.handles.len())
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

fn worker_loop(shared: Arc<PoolShared>, slot: usize) {
    let mut seen_generation = 0;
    loop {
        let (set, frame) = {
            let mut state = shared.state.lock();
            while !state.end_of_stream
                && !(state.has_frame && state.generation != seen_generation)
            {
                shared.cond.wait(&mut state);
            }
            if state.end_of_stream {
                break;
            }
            seen_generation = state.generation;
            state.working_threads += 1;
            (state.active_set, state.frame.clone())
        };

        if let Some(frame) = frame {
            run_worker(&shared.work, set, slot, &frame);
        }

        let mut state = shared.state.lock();
        state.working_threads -= 1;
        if shared.finish_frame_if_idle(&mut state) {
            shared.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::PcmKernels;
    use crate::process::tests::test_pic;

    fn pool(num_cores: usize) -> (ThreadPool, Arc<ProcessShared>) {
        let work = Arc::new(ProcessShared::new(num_cores, Arc::new(PcmKernels)));
        (ThreadPool::new(Arc::clone(&work)), work)
    }

    #[test]
    fn test_init_is_idempotent() {
        let (mut pool, _) = pool(4);
        pool.init(4);
        assert_eq!(pool.num_workers(), 3);
        pool.init(4);
        assert_eq!(pool.num_workers(), 3);
        assert_eq!(pool.created(), &[true, true, true, true]);
        pool.shutdown().unwrap();
        assert!(!pool.is_initialized());
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_single_core_pool_has_no_workers() {
        let (mut pool, work) = pool(1);
        pool.init(1);
        assert_eq!(pool.num_workers(), 0);

        let pic = Arc::new(test_pic(32, 32, 1 << 20));
        work.begin_frame(0, &pic);
        pool.activate(0, Arc::clone(&pic));
        run_worker(&work, 0, 0, &pic);
        pool.sync();
        assert!(work.queues.is_idle());
        assert!(work.end_frame(0).is_empty());
    }

    #[test]
    fn test_sync_leaves_queues_empty() {
        let (mut pool, work) = pool(4);
        pool.init(4);
        for call in 0..8usize {
            let set = call % 2;
            let pic = Arc::new(test_pic(64, 128, 1 << 20));
            work.begin_frame(set, &pic);
            pool.activate(set, Arc::clone(&pic));
            run_worker(&work, set, 0, &pic);
            pool.sync();

            assert_eq!(work.queues.process.pending(), 0);
            assert_eq!(work.queues.entropy.pending(), 0);
            assert_eq!(work.jobs_done(set).iter().sum::<usize>(), 16);
            assert!(work.end_frame(set).is_empty());
        }
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_reinit_after_shutdown() {
        let (mut pool, _) = pool(3);
        pool.init(3);
        pool.shutdown().unwrap();
        pool.init(3);
        assert_eq!(pool.num_workers(), 2);
        pool.shutdown().unwrap();
    }
}
