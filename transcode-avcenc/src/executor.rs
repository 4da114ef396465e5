//! Frame execution strategies.
//!
//! A [`FrameExecutor`] runs the jobs of one picture across `num_cores`
//! threads. The calling thread always takes part as slot 0.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::PoolJoinError;
use crate::process::{panic_message, run_worker, PicContext, ProcessShared};
use crate::thread_pool::ThreadPool;

/// Runs the jobs of a frame to completion.
pub trait FrameExecutor: Send {
    /// Prepare any long-lived resources. Called before the first frame.
    fn prepare(&mut self, num_cores: usize);

    /// Hand the frame to helper threads.
    fn start(&mut self, set: usize, pic: &Arc<PicContext>);

    /// Wait until every helper thread finished the frame.
    fn barrier(&mut self);

    /// Release helper threads.
    fn shutdown(&mut self) -> Result<(), PoolJoinError>;

    /// Shared work state.
    fn work(&self) -> &Arc<ProcessShared>;

    /// Run a frame with the calling thread as slot 0.
    fn run_frame(&mut self, set: usize, pic: &Arc<PicContext>) {
        self.start(set, pic);
        run_worker(self.work(), set, 0, pic);
        self.barrier();
    }
}

/// Workers stay alive across frames.
#[derive(Debug)]
pub struct PersistentExecutor {
    work: Arc<ProcessShared>,
    pool: ThreadPool,
}

impl PersistentExecutor {
    pub fn new(work: Arc<ProcessShared>) -> Self {
        Self {
            pool: ThreadPool::new(Arc::clone(&work)),
            work,
        }
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }
}

impl FrameExecutor for PersistentExecutor {
    fn prepare(&mut self, num_cores: usize) {
        self.pool.init(num_cores);
    }

    fn start(&mut self, set: usize, pic: &Arc<PicContext>) {
        self.pool.activate(set, Arc::clone(pic));
    }

    fn barrier(&mut self) {
        self.pool.sync();
    }

    fn shutdown(&mut self) -> Result<(), PoolJoinError> {
        self.pool.shutdown()
    }

    fn work(&self) -> &Arc<ProcessShared> {
        &self.work
    }
}

/// Helper threads are spawned for each frame and joined at the barrier.
#[derive(Debug)]
pub struct TransientExecutor {
    work: Arc<ProcessShared>,
    num_cores: usize,
    handles: Vec<(usize, JoinHandle<()>)>,
}

impl TransientExecutor {
    pub fn new(work: Arc<ProcessShared>) -> Self {
        let num_cores = work.num_cores();
        Self {
            work,
            num_cores,
            handles: Vec::new(),
        }
    }
}

impl FrameExecutor for TransientExecutor {
    fn prepare(&mut self, num_cores: usize) {
        self.num_cores = num_cores.min(self.work.num_cores()).max(1);
    }

    fn start(&mut self, set: usize, pic: &Arc<PicContext>) {
        for slot in 1..self.num_cores {
            let work = Arc::clone(&self.work);
            let pic = Arc::clone(pic);
            let spawned = thread::Builder::new()
                .name(format!("avcenc-frame-{slot}"))
                .spawn(move || run_worker(&work, set, slot, &pic));
            match spawned {
                Ok(handle) => self.handles.push((slot, handle)),
                Err(e) => {
                    tracing::error!(slot, error = %e, "Failed to spawn frame worker");
                    panic!("failed to spawn frame worker {slot}: {e}");
                }
            }
        }
    }

    fn barrier(&mut self) {
        for (slot, handle) in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                let message = panic_message(&*payload);
                tracing::error!(slot, %message, "Frame worker could not be joined");
                panic!("frame worker {slot} could not be joined: {message}");
            }
        }
    }

    fn shutdown(&mut self) -> Result<(), PoolJoinError> {
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
        result
    }

    fn work(&self) -> &Arc<ProcessShared> {
        &self.work
    }
}

/// Build the executor selected by `keep_threads_active`.
pub fn executor_for(keep_threads_active: bool, work: Arc<ProcessShared>) -> Box<dyn FrameExecutor> {
    if keep_threads_active {
        Box::new(PersistentExecutor::new(work))
    } else {
        Box::new(TransientExecutor::new(work))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::PcmKernels;
    use crate::process::tests::test_pic;

    fn run(executor: &mut dyn FrameExecutor, frames: usize) -> Vec<Vec<u8>> {
        executor.prepare(3);
        let mut payloads = Vec::new();
        for call in 0..frames {
            let set = call % 2;
            let pic = Arc::new(test_pic(48, 96, 1 << 20));
            executor.work().begin_frame(set, &pic);
            executor.run_frame(set, &pic);
            assert!(executor.work().queues.is_idle());
            assert!(executor.work().end_frame(set).is_empty());
            payloads.push(pic.slice_payload());
        }
        executor.shutdown().unwrap();
        payloads
    }

    #[test]
    fn test_persistent_and_transient_produce_same_output() {
        let work = || Arc::new(ProcessShared::new(3, Arc::new(PcmKernels)));
        let mut persistent = executor_for(true, work());
        let mut transient = executor_for(false, work());
        assert_eq!(run(persistent.as_mut(), 4), run(transient.as_mut(), 4));
    }

    #[test]
    fn test_transient_joins_every_frame() {
        let mut executor = TransientExecutor::new(Arc::new(ProcessShared::new(4, Arc::new(PcmKernels))));
        executor.prepare(4);
        let pic = Arc::new(test_pic(16, 64, 1 << 20));
        executor.work().begin_frame(0, &pic);
        executor.run_frame(0, &pic);
        assert!(executor.handles.is_empty());
        assert_eq!(executor.work().jobs_done(0).iter().sum::<usize>(), 8);
        executor.work().end_frame(0);
    }
}
