//! Per-frame job queues.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Stage a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Prediction, transform and reconstruction of one macroblock row.
    Process,
    /// Entropy coding of one macroblock row.
    Entropy,
}

/// One unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub kind: JobKind,
    pub mb_row: usize,
}

impl Job {
    pub fn process(mb_row: usize) -> Self {
        Self {
            kind: JobKind::Process,
            mb_row,
        }
    }

    pub fn entropy(mb_row: usize) -> Self {
        Self {
            kind: JobKind::Entropy,
            mb_row,
        }
    }
}

/// FIFO of jobs shared by every worker.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }

    pub fn pop(&self) -> Option<Job> {
        self.jobs.lock().pop_front()
    }

    /// Jobs waiting to be picked up.
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Drop every waiting job.
    pub fn reset(&self) {
        self.jobs.lock().clear();
    }
}

/// The process and entropy queues of the encoder.
#[derive(Debug, Default)]
pub struct JobQueues {
    pub process: JobQueue,
    pub entropy: JobQueue,
}

impl JobQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if both queues are empty.
    pub fn is_idle(&self) -> bool {
        self.process.is_empty() && self.entropy.is_empty()
    }

    pub fn reset(&self) {
        self.process.reset();
        self.entropy.reset();
    }

    /// Take the next job, entropy work first.
    pub fn next(&self) -> Option<Job> {
        self.entropy.pop().or_else(|| self.process.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = JobQueue::new();
        queue.push(Job::process(0));
        queue.push(Job::process(1));
        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.pop(), Some(Job::process(0)));
        assert_eq!(queue.pop(), Some(Job::process(1)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_entropy_jobs_taken_first() {
        let queues = JobQueues::new();
        queues.process.push(Job::process(3));
        queues.entropy.push(Job::entropy(2));
        assert_eq!(queues.next(), Some(Job::entropy(2)));
        assert_eq!(queues.next(), Some(Job::process(3)));
        assert!(queues.is_idle());
    }

    #[test]
    fn test_reset() {
        let queues = JobQueues::new();
        queues.process.push(Job::process(0));
        queues.entropy.push(Job::entropy(0));
        queues.reset();
        assert!(queues.is_idle());
        assert_eq!(queues.process.pending(), 0);
    }
}
