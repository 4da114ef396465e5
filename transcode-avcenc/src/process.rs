//! Per-worker process contexts and the worker body.
//!
//! Each of the two context sets holds one [`ProcessContext`] per core. The
//! set used by a frame is chosen by call parity, so a frame can be prepared
//! in one set while the other is still being collected. Workers pull jobs
//! from the shared [`JobQueues`] until both queues are drained; a finished
//! process job queues the entropy job of the same row.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{ErrorReason, ErrorSummary};
use crate::frame::RawBuffer;
use crate::job::{Job, JobKind, JobQueues};
use crate::kernels::MacroblockKernels;
use crate::picture::{MvBuffer, PicType, PictureBuffer};
use crate::MAX_CTXT_SETS;

/// Scratch state owned by one worker slot.
#[derive(Debug, Default)]
pub struct ProcessContext {
    /// Slot index inside its set; slot 0 is the calling thread.
    pub slot: usize,
    /// Failures recorded during the current frame.
    pub errors: ErrorSummary,
    /// Jobs completed during the current frame.
    pub jobs_done: usize,
    /// Reusable row buffer for kernels.
    pub scratch: Vec<u8>,
}

impl ProcessContext {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            ..Default::default()
        }
    }

    fn reset(&mut self) {
        self.errors = ErrorSummary::default();
        self.jobs_done = 0;
    }
}

/// Everything workers need to code one picture.
#[derive(Debug)]
pub struct PicContext {
    pub pic_cnt: i32,
    pub poc: i32,
    pub frame_num: u32,
    pub pic_type: PicType,
    pub qp: u8,
    /// Display size.
    pub width: u32,
    pub height: u32,
    pub mb_width: usize,
    pub mb_height: usize,
    pub source: Arc<RawBuffer>,
    pub recon: Arc<RwLock<PictureBuffer>>,
    pub mvs: Arc<RwLock<MvBuffer>>,
    /// Reference pictures, oldest first.
    pub references: Vec<Arc<RwLock<PictureBuffer>>>,
    rows: Vec<Mutex<Vec<u8>>>,
    bytes_written: AtomicUsize,
    capacity: usize,
}

impl PicContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pic_cnt: i32,
        poc: i32,
        frame_num: u32,
        pic_type: PicType,
        qp: u8,
        (width, height): (u32, u32),
        source: Arc<RawBuffer>,
        recon: Arc<RwLock<PictureBuffer>>,
        mvs: Arc<RwLock<MvBuffer>>,
        references: Vec<Arc<RwLock<PictureBuffer>>>,
        capacity: usize,
    ) -> Self {
        let mb_width = width.div_ceil(16) as usize;
        let mb_height = height.div_ceil(16) as usize;
        Self {
            pic_cnt,
            poc,
            frame_num,
            pic_type,
            qp,
            width,
            height,
            mb_width,
            mb_height,
            source,
            recon,
            mvs,
            references,
            rows: (0..mb_height).map(|_| Mutex::new(Vec::new())).collect(),
            bytes_written: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Store the coded bytes of one row, failing once the picture overflows.
    pub fn store_row(&self, mb_row: usize, bytes: Vec<u8>) -> Result<(), ErrorReason> {
        let total = self.bytes_written.fetch_add(bytes.len(), Ordering::AcqRel) + bytes.len();
        if total > self.capacity {
            return Err(ErrorReason::BitstreamBufferOverflow);
        }
        let slot = self.rows.get(mb_row).ok_or(ErrorReason::Fail)?;
        *slot.lock() = bytes;
        Ok(())
    }

    /// Bytes produced so far by every row.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written.load(Ordering::Acquire)
    }

    /// Concatenate rows in raster order.
    pub fn slice_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes_written().min(self.capacity));
        for row in &self.rows {
            out.extend_from_slice(&row.lock());
        }
        out
    }
}

/// State shared between the encoder and every worker.
pub struct ProcessShared {
    pub queues: JobQueues,
    sets: [Vec<Mutex<ProcessContext>>; MAX_CTXT_SETS],
    in_flight: [AtomicBool; MAX_CTXT_SETS],
    kernels: Arc<dyn MacroblockKernels>,
}

impl ProcessShared {
    pub fn new(num_cores: usize, kernels: Arc<dyn MacroblockKernels>) -> Self {
        let make_set = || (0..num_cores).map(|i| Mutex::new(ProcessContext::new(i))).collect();
        Self {
            queues: JobQueues::new(),
            sets: [make_set(), make_set()],
            in_flight: [AtomicBool::new(false), AtomicBool::new(false)],
            kernels,
        }
    }

    /// Number of slots per set.
    pub fn num_cores(&self) -> usize {
        self.sets[0].len()
    }

    pub fn contexts(&self, set: usize) -> &[Mutex<ProcessContext>] {
        &self.sets[set]
    }

    /// Reset the set's contexts and queue one process job per row.
    pub fn begin_frame(&self, set: usize, pic: &PicContext) {
        let was_in_flight = self.in_flight[set].swap(true, Ordering::AcqRel);
        debug_assert!(!was_in_flight, "context set {set} re-entered before sync");
        for ctx in &self.sets[set] {
            ctx.lock().reset();
        }
        for mb_row in 0..pic.mb_height {
            self.queues.process.push(Job::process(mb_row));
        }
    }

    /// Reset both queues and fold the errors recorded in the set.
    pub fn end_frame(&self, set: usize) -> ErrorSummary {
        self.queues.reset();
        self.in_flight[set].store(false, Ordering::Release);
        let summaries: Vec<ErrorSummary> = self.sets[set].iter().map(|c| c.lock().errors).collect();
        ErrorSummary::combine(&summaries)
    }

    /// Jobs completed per slot during the last frame of `set`.
    pub fn jobs_done(&self, set: usize) -> Vec<usize> {
        self.sets[set].iter().map(|c| c.lock().jobs_done).collect()
    }
}

impl std::fmt::Debug for ProcessShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessShared")
            .field("num_cores", &self.num_cores())
            .field("queues", &self.queues)
            .finish()
    }
}

/// Drain both queues on behalf of slot `slot` of context set `set`.
pub fn process_thread(shared: &ProcessShared, set: usize, slot: usize, pic: &PicContext) {
    let Some(cell) = shared.sets[set].get(slot) else {
        return;
    };
    let mut ctx = cell.lock();
    while let Some(job) = shared.queues.next() {
        match job.kind {
            JobKind::Process => match shared.kernels.process_row(pic, job.mb_row, &mut ctx) {
                Ok(()) => shared.queues.entropy.push(Job::entropy(job.mb_row)),
                Err(reason) => ctx.errors.record(reason),
            },
            JobKind::Entropy => {
                let coded = shared
                    .kernels
                    .entropy_row(pic, job.mb_row, &mut ctx)
                    .and_then(|bytes| pic.store_row(job.mb_row, bytes));
                if let Err(reason) = coded {
                    ctx.errors.record(reason);
                }
            }
        }
        ctx.jobs_done += 1;
    }
}

/// Run [`process_thread`], turning a panic into a recorded worker error.
pub fn run_worker(shared: &ProcessShared, set: usize, slot: usize, pic: &PicContext) {
    let result = catch_unwind(AssertUnwindSafe(|| process_thread(shared, set, slot, pic)));
    if let Err(payload) = result {
        tracing::error!(set, slot, message = %panic_message(&*payload), "Worker panicked");
        if let Some(cell) = shared.sets[set].get(slot) {
            cell.lock().errors.record(ErrorReason::WorkerPanicked);
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
