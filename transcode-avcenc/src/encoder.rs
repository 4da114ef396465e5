//! Per-call encode orchestration.
//!
//! Every call to [`H264Encoder::encode`] runs the same sequence: validate the
//! call, apply pending configuration, admit one picture in encode order, code
//! it across the worker threads, feed rate control, then return the coded
//! bitstream and at most one reconstructed picture in display order.
//!
//! Consecutive calls alternate between two context sets. Everything a call
//! stashes per set (its output buffer, picture count and skip flags) is reset
//! at the start of the call that reuses the set.

use std::sync::Arc;

use crate::buf_mgr::HoldFlags;
use crate::config::{ConfigRecord, ConfigRing, EncoderConfig, QualityMetrics};
use crate::error::{EncodeError, ErrorReason, ErrorSummary, Result};
use crate::executor::{executor_for, FrameExecutor};
use crate::fmt_conv;
use crate::frame::{check_input_dimensions, BitstreamBuffer, RawBuffer, Timestamp};
use crate::header::{HeaderWriter, ParameterSetWriter, SliceInfo};
use crate::input_queue::{InputQueue, QueuedPicture};
use crate::kernels::{MacroblockKernels, PcmKernels};
use crate::picture::{PicType, PictureStore, RefSetEntry, ReferenceSet};
use crate::process::{PicContext, ProcessShared};
use crate::quality::{compute_psnr, PlanePsnr};
use crate::rate_control::{BufferedRateControl, FrameStats, RateControl};
use crate::sei::{SeiPresent, SeiState};
use crate::{MAX_CTXT_SETS, MIN_STREAM_SIZE};

/// Coding type reported for an encode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncodedFrameType {
    Idr,
    I,
    P,
    B,
    /// Nothing was coded by this call.
    #[default]
    NotApplicable,
}

impl From<PicType> for EncodedFrameType {
    fn from(pic_type: PicType) -> Self {
        match pic_type {
            PicType::Idr => EncodedFrameType::Idr,
            PicType::I => EncodedFrameType::I,
            PicType::P => EncodedFrameType::P,
            PicType::B => EncodedFrameType::B,
        }
    }
}

/// Arguments of one encode call.
#[derive(Debug, Clone)]
pub struct EncodeInput {
    /// Picture to encode, in display order. `None` drains queued pictures.
    pub raw: Option<Arc<RawBuffer>>,
    /// Buffer receiving the coded bitstream.
    pub bitstream: BitstreamBuffer,
    /// Optional buffer to receive the reconstructed picture.
    pub recon: Option<RawBuffer>,
    pub timestamp: Timestamp,
    /// No more pictures follow.
    pub is_last: bool,
}

impl EncodeInput {
    /// A call without a picture.
    pub fn flush(bitstream: BitstreamBuffer) -> Self {
        Self {
            raw: None,
            bitstream,
            recon: None,
            timestamp: Timestamp::default(),
            is_last: true,
        }
    }

    /// A call carrying `raw`.
    pub fn picture(raw: Arc<RawBuffer>, timestamp: Timestamp, bitstream: BitstreamBuffer) -> Self {
        Self {
            raw: Some(raw),
            bitstream,
            recon: None,
            timestamp,
            is_last: false,
        }
    }

    /// Mark this call as the last one of the stream.
    pub fn last(mut self) -> Self {
        self.is_last = true;
        self
    }
}

/// Results of one encode call.
#[derive(Debug, Clone, Default)]
pub struct EncodeOutput {
    /// Status of the call, mirrored from the returned `Result`.
    pub error: Option<EncodeError>,
    /// A coded picture is in `bitstream`.
    pub output_present: bool,
    /// `recon` holds a reconstructed picture; zero-sized for skipped pictures.
    pub recon_present: bool,
    pub frame_type: EncodedFrameType,
    /// Input picture the call is done with.
    pub consumed_input: Option<Arc<RawBuffer>>,
    pub bitstream: Option<BitstreamBuffer>,
    pub recon: Option<RawBuffer>,
    /// Quality of the returned reconstruction.
    pub psnr: Option<PlanePsnr>,
    /// Timestamp of the coded picture.
    pub timestamp: Timestamp,
    /// Nothing more will be produced.
    pub is_last: bool,
}

struct CodedPicture {
    pic_type: PicType,
    timestamp: Timestamp,
}

/// Multi-threaded H.264 encoder instance.
pub struct H264Encoder {
    config: EncoderConfig,
    init_done: bool,
    fatal: Option<ErrorReason>,

    call_count: i64,
    pic_cnt: i32,
    coded_pic_count: i32,
    frame_num: u32,
    idr_pic_id: u32,
    idr_display_idx: i32,
    /// Highest display index written since the stream started.
    last_written_idx: i32,
    /// Dropped display indices that later pictures close up over.
    poc_gaps: Vec<i32>,

    pic_cnt_of: [i32; MAX_CTXT_SETS],
    pre_skip: [bool; MAX_CTXT_SETS],
    post_skip: [bool; MAX_CTXT_SETS],
    out_bufs: [Option<BitstreamBuffer>; MAX_CTXT_SETS],

    header_mode: bool,
    header_generated: bool,
    gen_header: bool,
    force_idr: bool,
    buffers_allocated: bool,

    config_ring: ConfigRing,
    sei: SeiState,
    input_queue: InputQueue,
    ref_set: ReferenceSet,
    store: PictureStore,

    work: Arc<ProcessShared>,
    executor: Box<dyn FrameExecutor>,
    rate_control: Box<dyn RateControl>,
    header_writer: Box<dyn HeaderWriter>,
}

impl H264Encoder {
    /// Create an encoder with the built-in kernels, rate control and header writer.
    pub fn new(config: EncoderConfig) -> Result<Self> {
        let rate_control = Box::new(BufferedRateControl::new(&config));
        Self::with_components(config, Arc::new(PcmKernels), rate_control, Box::new(ParameterSetWriter))
    }

    /// Create an encoder from explicit collaborators.
    pub fn with_components(
        config: EncoderConfig,
        kernels: Arc<dyn MacroblockKernels>,
        rate_control: Box<dyn RateControl>,
        header_writer: Box<dyn HeaderWriter>,
    ) -> Result<Self> {
        config.validate()?;
        let work = Arc::new(ProcessShared::new(config.num_cores, kernels));
        let executor = executor_for(config.keep_threads_active, Arc::clone(&work));
        let mut encoder = Self {
            input_queue: InputQueue::new(&config),
            ref_set: ReferenceSet::new(config.ref_buf_count()),
            config,
            init_done: false,
            fatal: None,
            call_count: -1,
            pic_cnt: -1,
            coded_pic_count: 0,
            frame_num: 0,
            idr_pic_id: 0,
            idr_display_idx: 0,
            last_written_idx: -1,
            poc_gaps: Vec::new(),
            pic_cnt_of: [-1; MAX_CTXT_SETS],
            pre_skip: [false; MAX_CTXT_SETS],
            post_skip: [false; MAX_CTXT_SETS],
            out_bufs: [None, None],
            header_mode: false,
            header_generated: false,
            gen_header: false,
            force_idr: false,
            buffers_allocated: false,
            config_ring: ConfigRing::new(),
            sei: SeiState::new(),
            store: PictureStore::new(),
            work,
            executor,
            rate_control,
            header_writer,
        };
        encoder.init()?;
        Ok(encoder)
    }

    /// (Re)initialize stream state. Clears a latched fatal error.
    pub fn init(&mut self) -> Result<()> {
        self.shutdown_executor();
        self.executor = executor_for(self.config.keep_threads_active, Arc::clone(&self.work));
        self.work.queues.reset();

        self.call_count = -1;
        self.pic_cnt = -1;
        self.pic_cnt_of = [-1; MAX_CTXT_SETS];
        self.pre_skip = [false; MAX_CTXT_SETS];
        self.post_skip = [false; MAX_CTXT_SETS];
        self.out_bufs = [None, None];
        self.header_mode = false;
        self.header_generated = false;
        self.gen_header = false;
        self.force_idr = false;
        self.buffers_allocated = false;
        self.config_ring.clear();
        self.store.clear();
        self.ref_set = ReferenceSet::new(self.config.ref_buf_count());
        self.reset_stream();
        self.rate_control.reconfigure(&self.config);

        self.fatal = None;
        self.init_done = true;
        tracing::debug!(
            width = self.config.width,
            height = self.config.height,
            cores = self.config.num_cores,
            persistent = self.config.keep_threads_active,
            "Encoder initialized"
        );
        Ok(())
    }

    /// Stop worker threads and drop stream state. `init` must run before the next call.
    pub fn reset(&mut self) {
        self.shutdown_executor();
        self.work.queues.reset();
        self.config_ring.clear();
        self.store.clear();
        self.ref_set.clear();
        self.buffers_allocated = false;
        self.init_done = false;
    }

    /// Queue a configuration record, applied at the call carrying its timestamp.
    pub fn set_config(&mut self, record: ConfigRecord) -> Result<()> {
        self.config_ring.push(record)
    }

    /// Make the next call emit SPS and PPS only.
    pub fn set_header_mode(&mut self, enable: bool) {
        self.header_mode = enable;
    }

    /// Active configuration.
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Encode calls counted so far, starting at -1.
    pub fn call_count(&self) -> i64 {
        self.call_count
    }

    /// Picture counter; advances on every non-header call.
    pub fn pic_cnt(&self) -> i32 {
        self.pic_cnt
    }

    /// Pictures coded and kept.
    pub fn coded_pic_count(&self) -> i32 {
        self.coded_pic_count
    }

    pub fn reference_set(&self) -> &ReferenceSet {
        &self.ref_set
    }

    pub fn picture_store(&self) -> &PictureStore {
        &self.store
    }

    /// Pending (process, entropy) jobs.
    pub fn pending_jobs(&self) -> (usize, usize) {
        (self.work.queues.process.pending(), self.work.queues.entropy.pending())
    }

    /// Latched fatal error, if any.
    pub fn fatal_error(&self) -> Option<EncodeError> {
        self.fatal.map(EncodeError::fatal)
    }

    /// Encode one call's worth of input.
    ///
    /// The returned status is mirrored into `output.error`. A fatal status is
    /// latched and returned by every later call until [`H264Encoder::init`].
    #[tracing::instrument(level = "trace", skip_all, fields(call = self.call_count + 1))]
    pub fn encode(&mut self, input: EncodeInput, output: &mut EncodeOutput) -> Result<()> {
        *output = EncodeOutput {
            consumed_input: input.raw.clone(),
            ..Default::default()
        };

        if let Err(e) = self.validate(&input.bitstream) {
            output.bitstream = Some(input.bitstream);
            return self.fail(output, e);
        }

        self.call_count += 1;
        let set = (self.call_count % MAX_CTXT_SETS as i64) as usize;
        self.pic_cnt_of[set] = -1;
        self.pre_skip[set] = false;
        self.post_skip[set] = false;
        self.out_bufs[set] = Some(input.bitstream);

        let result = self.encode_call(set, input.raw, input.recon, input.timestamp, input.is_last, output);
        if output.bitstream.is_none() {
            output.bitstream = self.out_bufs[set].take();
        }
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail(output, e),
        }
    }

    fn validate(&self, bitstream: &BitstreamBuffer) -> Result<()> {
        if let Some(reason) = self.fatal {
            return Err(EncodeError::fatal(reason));
        }
        if bitstream.capacity() < MIN_STREAM_SIZE {
            return Err(EncodeError::unsupported(ErrorReason::InsufficientOutputBuffer));
        }
        if !self.init_done {
            return Err(EncodeError::fatal(ErrorReason::InitNotDone));
        }
        Ok(())
    }

    fn fail(&mut self, output: &mut EncodeOutput, error: EncodeError) -> Result<()> {
        if error.is_fatal() {
            if self.fatal.is_none() {
                tracing::error!(%error, "Encoder entered fatal state");
            }
            self.fatal = Some(error.reason);
        }
        output.error = Some(error);
        Err(error)
    }

    fn encode_call(
        &mut self,
        set: usize,
        raw: Option<Arc<RawBuffer>>,
        recon: Option<RawBuffer>,
        timestamp: Timestamp,
        is_last: bool,
        output: &mut EncodeOutput,
    ) -> Result<()> {
        if self.call_count == 0 {
            self.reset_stream();
        }

        for record in self.config_ring.take_matching(&timestamp) {
            self.apply_config(record.config)?;
        }
        if self.sei.refresh(&self.config.sei) {
            tracing::debug!(present = ?self.sei.present(), "SEI change forces IDR");
            self.force_idr = true;
        }

        if let Some(raw) = &raw {
            if !self.header_mode {
                check_input_dimensions(raw, self.config.width, self.config.height)?;
            }
        }

        if !self.buffers_allocated {
            self.allocate_buffers();
            if !self.header_mode && !self.header_generated {
                self.gen_header = true;
            }
            self.executor.prepare(self.config.num_cores);
        }

        if self.header_mode {
            return self.emit_headers(set, raw, timestamp, is_last, output);
        }

        self.pic_cnt += 1;
        if std::mem::take(&mut self.force_idr) {
            self.input_queue.request_idr();
        }
        if let Some(raw) = raw {
            self.input_queue.push(raw, timestamp);
        }
        if is_last {
            self.input_queue.finish();
        }
        let admitted = self.input_queue.pop();
        output.is_last = admitted.is_last;
        output.consumed_input = admitted.picture.as_ref().map(|p| Arc::clone(&p.raw));

        if let Some(pic) = &admitted.picture {
            if self.rate_control.pre_encode_skip(pic.pic_type) {
                tracing::debug!(poc = pic.display_idx, "Pre-encode skip");
                self.pre_skip[set] = true;
                self.note_dropped(pic.display_idx);
                if pic.pic_type == PicType::Idr {
                    self.force_idr = true;
                }
            }
        }

        let mut coded = None;
        let mut deferred = None;
        if let Some(pic) = admitted.picture.filter(|_| !self.pre_skip[set]) {
            self.pic_cnt_of[set] = self.pic_cnt;
            let frame = self.pic_init(set, &pic)?;
            self.executor.run_frame(set, &frame);
            let summary = self.work.end_frame(set);
            deferred = self.post_encode(set, &pic, &frame, summary)?;
            coded = Some(CodedPicture {
                pic_type: pic.pic_type,
                timestamp: pic.timestamp,
            });
        }

        self.select_recon(set, recon, output)?;
        if self.post_skip[set] {
            self.retire_skipped(set)?;
        }

        match coded {
            Some(pic) if !self.post_skip[set] => {
                output.output_present = true;
                output.timestamp = pic.timestamp;
                output.frame_type = pic.pic_type.into();
            }
            _ => {
                output.output_present = false;
                output.timestamp = Timestamp::default();
                output.frame_type = EncodedFrameType::NotApplicable;
            }
        }
        output.bitstream = self.out_bufs[set].take();

        if self.config.enable_recon && self.ref_set.any_io_held(&self.store)? {
            output.is_last = false;
        }
        if self.config.keep_threads_active && output.is_last {
            self.shutdown_executor_or_abort();
        }

        match deferred {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn reset_stream(&mut self) {
        self.pic_cnt = -1;
        self.coded_pic_count = 0;
        self.frame_num = 0;
        self.idr_pic_id = 0;
        self.idr_display_idx = 0;
        self.last_written_idx = -1;
        self.poc_gaps.clear();
        self.sei = SeiState::new();
        self.input_queue = InputQueue::new(&self.config);
    }

    fn apply_config(&mut self, next: EncoderConfig) -> Result<()> {
        if let Err(e) = self.config.check_update(&next) {
            tracing::warn!(error = %e, "Rejected configuration update");
            return Err(e.into());
        }
        let force_idr = next.force_idr;
        self.config = next;
        self.config.force_idr = false;
        self.rate_control.reconfigure(&self.config);
        self.input_queue.reconfigure(&self.config);
        if force_idr {
            self.force_idr = true;
        }
        tracing::debug!(force_idr, rate_control = ?self.config.rate_control, "Applied configuration");
        Ok(())
    }

    fn allocate_buffers(&mut self) {
        let count = self.config.ref_buf_count();
        self.store
            .allocate(count, self.config.mb_width(), self.config.mb_height());
        self.buffers_allocated = true;
    }

    fn emit_headers(
        &mut self,
        set: usize,
        raw: Option<Arc<RawBuffer>>,
        timestamp: Timestamp,
        is_last: bool,
        output: &mut EncodeOutput,
    ) -> Result<()> {
        self.force_idr = true;

        let mut nal = Vec::with_capacity(64);
        self.header_writer
            .write_sps(&self.config, &mut nal)
            .and_then(|()| self.header_writer.write_pps(&self.config, &mut nal))
            .map_err(|_| EncodeError::unsupported(ErrorReason::HeaderGeneration))?;
        if let Some(buf) = self.out_bufs[set].as_mut() {
            buf.write(&nal).map_err(EncodeError::unsupported)?;
        }

        output.consumed_input = raw;
        output.timestamp = timestamp;
        output.is_last = is_last;
        output.output_present = true;
        output.recon_present = false;
        output.bitstream = self.out_bufs[set].take();

        self.header_generated = true;
        self.call_count -= 1;
        self.header_mode = false;
        self.gen_header = false;
        tracing::debug!(bytes = nal.len(), "Emitted stream headers");
        Ok(())
    }

    fn pic_init(&mut self, set: usize, pic: &QueuedPicture) -> Result<Arc<PicContext>> {
        let refs = self.ref_set.references(&self.store)?;
        if pic.pic_type == PicType::Idr {
            for &index in &refs {
                self.release_ref(index)?;
            }
        } else if pic.pic_type.is_reference() {
            let excess = (refs.len() + 1).saturating_sub(self.config.effective_ref_frames());
            for &index in refs.iter().take(excess) {
                self.release_ref(index)?;
            }
        }
        self.ref_set.reclaim(&self.store)?;

        let references = self
            .ref_set
            .references(&self.store)?
            .into_iter()
            .filter_map(|i| self.ref_set.get(i).and_then(|e| e.pic_buf))
            .map(|id| self.store.pics.payload(id))
            .collect::<Result<Vec<_>>>()?;

        let holds = HoldFlags::REF | HoldFlags::IO;
        let no_buffer = EncodeError::fatal(ErrorReason::NoFreeBuffer);
        let mv_buf = self.store.mvs.acquire(holds).ok_or(no_buffer)?;
        let Some(pic_buf) = self.store.pics.acquire(holds) else {
            self.store.mvs.release(mv_buf, holds)?;
            return Err(no_buffer);
        };
        self.ref_set.insert(RefSetEntry {
            pic_cnt: self.pic_cnt,
            poc: pic.display_idx,
            pic_type: pic.pic_type,
            pic_buf: Some(pic_buf),
            mv_buf: Some(mv_buf),
            psnr: None,
        })?;

        let qp = self.rate_control.frame_qp(pic.pic_type);
        self.coded_pic_count += 1;

        let capacity = self.out_bufs[set].as_ref().map_or(0, BitstreamBuffer::remaining);
        let frame = Arc::new(PicContext::new(
            self.pic_cnt,
            pic.display_idx,
            self.slice_frame_num(pic.pic_type),
            pic.pic_type,
            qp,
            (self.config.width, self.config.height),
            Arc::clone(&pic.raw),
            self.store.pics.payload(pic_buf)?,
            self.store.mvs.payload(mv_buf)?,
            references,
            capacity,
        ));
        self.work.begin_frame(set, &frame);

        tracing::debug!(
            pic_cnt = self.pic_cnt,
            poc = pic.display_idx,
            pic_type = ?pic.pic_type,
            qp,
            refs = frame.references.len(),
            "Picture init"
        );
        Ok(frame)
    }

    fn release_ref(&mut self, index: usize) -> Result<()> {
        if let Some(entry) = self.ref_set.get(index).copied() {
            self.store.release(&entry, HoldFlags::REF)?;
        }
        Ok(())
    }

    /// Write the coded picture and update rate control.
    ///
    /// Returns a recoverable error to report once the call completes.
    fn post_encode(
        &mut self,
        set: usize,
        pic: &QueuedPicture,
        frame: &PicContext,
        summary: ErrorSummary,
    ) -> Result<Option<EncodeError>> {
        if let Some(error) = summary.to_error() {
            if error.is_fatal() {
                return Err(error);
            }
        }

        let wrote_header = self.gen_header;
        let sei_present = if pic.pic_type == PicType::Idr {
            self.sei.take_pending()
        } else {
            SeiPresent::empty()
        };

        let mut nal = Vec::with_capacity(frame.bytes_written() + 64);
        if wrote_header {
            self.header_writer
                .write_sps(&self.config, &mut nal)
                .and_then(|()| self.header_writer.write_pps(&self.config, &mut nal))
                .map_err(|_| EncodeError::fatal(ErrorReason::HeaderGeneration))?;
        }
        self.header_writer
            .write_sei(self.sei.params(), sei_present, &mut nal)
            .map_err(|_| EncodeError::fatal(ErrorReason::HeaderGeneration))?;
        let slice = SliceInfo {
            pic_type: pic.pic_type,
            frame_num: self.slice_frame_num(pic.pic_type),
            poc: self.slice_poc(pic),
            idr_pic_id: self.idr_pic_id,
            qp: frame.qp,
        };
        self.header_writer
            .write_slice(&slice, &frame.slice_payload(), &mut nal)
            .map_err(|_| EncodeError::fatal(ErrorReason::HeaderGeneration))?;

        let remaining = self.out_bufs[set].as_ref().map_or(0, BitstreamBuffer::remaining);
        let overflowed = summary.to_error().is_some() || nal.len() > remaining;
        let stats = FrameStats {
            pic_type: pic.pic_type,
            qp: frame.qp,
            bits: nal.len() as u64 * 8,
            overflowed,
        };
        let skip = match self.rate_control.post_encode_update(&stats) {
            Ok(update) => update.skip || overflowed,
            Err(reason) => {
                let error = EncodeError::overflow_aware(reason);
                if error.is_fatal() {
                    return Err(error);
                }
                true
            }
        };
        let deferred = overflowed
            .then_some(EncodeError::unsupported(ErrorReason::BitstreamBufferOverflow));

        if skip {
            self.post_skip[set] = true;
            if wrote_header {
                self.gen_header = true;
            }
            if pic.pic_type == PicType::Idr {
                self.sei.restore_pending(sei_present);
                self.force_idr = true;
            }
            self.note_dropped(pic.display_idx);
            tracing::debug!(poc = pic.display_idx, overflowed, "Post-encode skip");
            return Ok(deferred);
        }

        if let Some(buf) = self.out_bufs[set].as_mut() {
            buf.write(&nal).map_err(EncodeError::unsupported)?;
        }
        if wrote_header {
            self.gen_header = false;
            self.header_generated = true;
        }
        if pic.pic_type == PicType::Idr {
            self.idr_pic_id = self.idr_pic_id.wrapping_add(1);
            self.idr_display_idx = pic.display_idx;
            self.frame_num = 0;
            self.poc_gaps.clear();
        }
        self.last_written_idx = self.last_written_idx.max(pic.display_idx);
        if pic.pic_type.is_reference() {
            self.frame_num = self.frame_num.wrapping_add(1);
        }

        let index = self
            .ref_set
            .find_by_pic_cnt(self.pic_cnt)
            .ok_or(EncodeError::fatal(ErrorReason::Fail))?;
        if self.config.quality_metrics.contains(QualityMetrics::PSNR) {
            let psnr = compute_psnr(
                &pic.raw,
                &frame.recon.read().frame,
                self.config.width,
                self.config.height,
            );
            if let Some(entry) = self.ref_set.get_mut(index) {
                entry.psnr = Some(psnr);
            }
        }
        self.finish_picture(index)?;
        Ok(deferred)
    }

    fn slice_frame_num(&self, pic_type: PicType) -> u32 {
        if pic_type == PicType::Idr {
            0
        } else {
            self.frame_num
        }
    }

    /// Picture order count of `pic` relative to the last written IDR.
    ///
    /// Dropped pictures beyond every written one leave no hole in the count.
    fn slice_poc(&self, pic: &QueuedPicture) -> i32 {
        if pic.pic_type == PicType::Idr {
            return 0;
        }
        let closed = self
            .poc_gaps
            .iter()
            .filter(|&&idx| idx > self.idr_display_idx && idx < pic.display_idx)
            .count();
        pic.display_idx - self.idr_display_idx - closed as i32
    }

    // A drop behind a written picture stays a hole.
    fn note_dropped(&mut self, display_idx: i32) {
        if display_idx > self.last_written_idx {
            self.poc_gaps.push(display_idx);
        }
    }

    fn finish_picture(&mut self, index: usize) -> Result<()> {
        let Some(entry) = self.ref_set.get(index).copied() else {
            return Ok(());
        };
        let mut release = HoldFlags::empty();
        if !entry.pic_type.is_reference() {
            release |= HoldFlags::REF;
        }
        if !self.config.enable_recon {
            release |= HoldFlags::IO;
        }
        if !release.is_empty() {
            self.store.release(&entry, release)?;
        }
        Ok(())
    }

    fn select_recon(&mut self, set: usize, recon: Option<RawBuffer>, output: &mut EncodeOutput) -> Result<()> {
        if !self.config.enable_recon {
            return Ok(());
        }
        if self.pic_cnt <= self.config.num_bframes as i32 && !output.is_last {
            return Ok(());
        }

        let format = self.config.recon_format;
        if self.post_skip[set] || self.pre_skip[set] {
            output.recon = Some(RawBuffer::zero_sized(format));
            output.recon_present = true;
            return Ok(());
        }

        let Some(index) = self.ref_set.select_recon(&self.store)? else {
            return Ok(());
        };
        let Some(entry) = self.ref_set.get(index).copied() else {
            return Ok(());
        };
        let Some(pic_buf) = entry.pic_buf else {
            return Ok(());
        };
        if let Some(queued) = self.input_queue.lowest_queued_display_idx() {
            if queued < entry.poc {
                tracing::trace!(poc = entry.poc, queued, "Recon waits for an earlier picture");
                return Ok(());
            }
        }

        let (width, height) = (self.config.width, self.config.height);
        let sizes = format.plane_sizes(width, height);
        let fits = |r: &RawBuffer| {
            r.format == format
                && r.planes.len() == sizes.len()
                && r.planes.iter().zip(&sizes).all(|(p, &(w, h))| p.width == w && p.height == h)
        };
        let mut dst = recon
            .filter(|r| fits(r))
            .unwrap_or_else(|| RawBuffer::alloc(format, width, height));
        fmt_conv::export_recon_into(&self.store.pics.payload(pic_buf)?.read().frame, &mut dst);
        self.store.release(&entry, HoldFlags::IO)?;

        if let Some(psnr) = entry.psnr {
            tracing::debug!(poc = entry.poc, y = psnr.y, u = psnr.u, v = psnr.v, "Recon PSNR");
        }
        output.recon = Some(dst);
        output.recon_present = true;
        output.psnr = entry.psnr;
        Ok(())
    }

    fn retire_skipped(&mut self, set: usize) -> Result<()> {
        self.coded_pic_count -= 1;
        let Some(index) = self.ref_set.find_by_pic_cnt(self.pic_cnt_of[set]) else {
            return Ok(());
        };
        if let Some(entry) = self.ref_set.get(index).copied() {
            self.store.release(&entry, HoldFlags::REF | HoldFlags::IO)?;
            self.ref_set.remove(index);
            tracing::debug!(pic_cnt = entry.pic_cnt, poc = entry.poc, "Retired skipped picture");
        }
        Ok(())
    }

    fn shutdown_executor(&mut self) {
        if let Err(e) = self.executor.shutdown() {
            tracing::warn!(error = %e, "Worker join failed during shutdown");
        }
    }

    fn shutdown_executor_or_abort(&mut self) {
        if let Err(e) = self.executor.shutdown() {
            tracing::error!(error = %e, "Worker join failed at end of stream");
            panic!("encoder worker join failed: {e}");
        }
    }
}

impl Drop for H264Encoder {
    fn drop(&mut self) {
        self.shutdown_executor();
    }
}

impl std::fmt::Debug for H264Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H264Encoder")
            .field("config", &self.config)
            .field("init_done", &self.init_done)
            .field("fatal", &self.fatal)
            .field("call_count", &self.call_count)
            .field("pic_cnt", &self.pic_cnt)
            .field("coded_pic_count", &self.coded_pic_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ColorFormat;

    fn picture(config: &EncoderConfig, seed: u8) -> Arc<RawBuffer> {
        let mut raw = RawBuffer::alloc(ColorFormat::Yuv420p, config.width, config.height);
        for plane in &mut raw.planes {
            for (i, b) in plane.data.iter_mut().enumerate() {
                *b = (i as u8).wrapping_mul(3).wrapping_add(seed);
            }
        }
        Arc::new(raw)
    }

    fn input(config: &EncoderConfig, seed: u8) -> EncodeInput {
        EncodeInput::picture(
            picture(config, seed),
            Timestamp::new(0, seed as u32),
            BitstreamBuffer::new(1 << 18),
        )
    }

    #[test]
    fn test_first_picture_carries_headers() {
        let config = EncoderConfig::new(32, 32);
        let mut encoder = H264Encoder::new(config.clone()).unwrap();
        let mut output = EncodeOutput::default();
        encoder.encode(input(&config, 0), &mut output).unwrap();

        assert!(output.output_present);
        assert_eq!(output.frame_type, EncodedFrameType::Idr);
        let data = output.bitstream.take().unwrap();
        assert_eq!(&data.data()[..5], &[0, 0, 0, 1, 0x67]);

        encoder.encode(input(&config, 1), &mut output).unwrap();
        assert_eq!(output.frame_type, EncodedFrameType::P);
        // No parameter sets on later pictures.
        assert_eq!(output.bitstream.unwrap().data()[4] & 0x1f, 1);
    }

    #[test]
    fn test_header_mode_emits_parameter_sets_only() {
        let config = EncoderConfig::new(32, 32);
        let mut encoder = H264Encoder::new(config.clone()).unwrap();
        encoder.set_header_mode(true);

        let mut output = EncodeOutput::default();
        encoder.encode(input(&config, 0), &mut output).unwrap();
        assert!(output.output_present);
        assert!(!output.recon_present);
        assert_eq!(output.frame_type, EncodedFrameType::NotApplicable);
        assert_eq!(encoder.call_count(), -1);
        assert_eq!(encoder.pic_cnt(), -1);
        assert!(output.consumed_input.is_some());
        let nal_types: Vec<u8> = output
            .bitstream
            .take().unwrap()
            .data()
            .windows(5)
            .filter(|w| w[..4] == [0, 0, 0, 1])
            .map(|w| w[4] & 0x1f)
            .collect();
        assert_eq!(nal_types, vec![7, 8]);

        // Not sticky: the next call codes an IDR without repeating headers.
        encoder.encode(input(&config, 0), &mut output).unwrap();
        assert_eq!(output.frame_type, EncodedFrameType::Idr);
        assert_eq!(output.bitstream.unwrap().data()[4] & 0x1f, 5);
    }

    #[test]
    fn test_insufficient_output_buffer() {
        let config = EncoderConfig::new(32, 32).with_recon(ColorFormat::Yuv420p);
        let mut encoder = H264Encoder::new(config.clone()).unwrap();
        let free_before = encoder.picture_store().pics.free_count();

        let mut small = input(&config, 0);
        small.bitstream = BitstreamBuffer::new(MIN_STREAM_SIZE - 1);
        let mut output = EncodeOutput::default();
        let err = encoder.encode(small, &mut output).unwrap_err();

        assert_eq!(err.reason, ErrorReason::InsufficientOutputBuffer);
        assert!(!err.is_fatal());
        assert_eq!(output.error, Some(err));
        assert_eq!(encoder.call_count(), -1);
        assert_eq!(encoder.pic_cnt(), -1);
        assert_eq!(encoder.picture_store().pics.free_count(), free_before);
        assert!(output.bitstream.is_some());
        assert!(encoder.fatal_error().is_none());
    }

    #[test]
    fn test_init_not_done_after_reset() {
        let config = EncoderConfig::new(32, 32);
        let mut encoder = H264Encoder::new(config.clone()).unwrap();
        encoder.reset();

        let mut output = EncodeOutput::default();
        let err = encoder.encode(input(&config, 0), &mut output).unwrap_err();
        assert_eq!(err, EncodeError::fatal(ErrorReason::InitNotDone));

        // Latched until re-initialized.
        let err = encoder.encode(input(&config, 0), &mut output).unwrap_err();
        assert_eq!(err.reason, ErrorReason::InitNotDone);
        encoder.init().unwrap();
        encoder.encode(input(&config, 0), &mut output).unwrap();
        assert!(output.output_present);
    }

    #[test]
    fn test_dimension_mismatch_is_not_latched() {
        let config = EncoderConfig::new(32, 32);
        let mut encoder = H264Encoder::new(config.clone()).unwrap();
        let wrong = EncoderConfig::new(48, 32);
        let mut output = EncodeOutput::default();

        let err = encoder.encode(input(&wrong, 0), &mut output).unwrap_err();
        assert_eq!(err.reason, ErrorReason::WidthNotSupported);
        assert!(encoder.fatal_error().is_none());
        encoder.encode(input(&config, 0), &mut output).unwrap();
    }

    #[test]
    fn test_short_input_plane_is_not_latched() {
        let config = EncoderConfig::new(32, 16).with_cores(2);
        let mut encoder = H264Encoder::new(config.clone()).unwrap();
        let mut raw = RawBuffer::alloc(ColorFormat::Yuv420p, 32, 16);
        raw.planes[0].data.truncate(100);
        let short = EncodeInput::picture(Arc::new(raw), Timestamp::default(), BitstreamBuffer::new(1 << 16));

        let mut output = EncodeOutput::default();
        let err = encoder.encode(short, &mut output).unwrap_err();
        assert_eq!(err, EncodeError::unsupported(ErrorReason::HeightNotSupported));
        assert!(encoder.fatal_error().is_none());
        assert_eq!(encoder.pending_jobs(), (0, 0));

        encoder.encode(input(&config, 0), &mut output).unwrap();
        assert_eq!(output.frame_type, EncodedFrameType::Idr);
    }

    #[test]
    fn test_immutable_config_change_is_fatal() {
        let config = EncoderConfig::new(32, 32);
        let mut encoder = H264Encoder::new(config.clone()).unwrap();
        encoder
            .set_config(ConfigRecord::immediate(config.clone().with_bframes(2)))
            .unwrap();

        let mut output = EncodeOutput::default();
        let err = encoder.encode(input(&config, 0), &mut output).unwrap_err();
        assert_eq!(err, EncodeError::fatal(ErrorReason::ConfigUpdate));

        let err = encoder.encode(input(&config, 1), &mut output).unwrap_err();
        assert_eq!(err.reason, ErrorReason::ConfigUpdate);
        assert_eq!(encoder.fatal_error(), Some(err));
    }

    #[test]
    fn test_force_idr_through_config() {
        let config = EncoderConfig::new(32, 32);
        let mut encoder = H264Encoder::new(config.clone()).unwrap();
        let mut output = EncodeOutput::default();
        encoder.encode(input(&config, 0), &mut output).unwrap();
        encoder.encode(input(&config, 1), &mut output).unwrap();

        let mut next = config.clone();
        next.force_idr = true;
        encoder.set_config(ConfigRecord::immediate(next)).unwrap();
        encoder.encode(input(&config, 2), &mut output).unwrap();
        assert_eq!(output.frame_type, EncodedFrameType::Idr);
        encoder.encode(input(&config, 3), &mut output).unwrap();
        assert_eq!(output.frame_type, EncodedFrameType::P);
        assert!(!encoder.config().force_idr);
    }
}
