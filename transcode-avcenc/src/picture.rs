//! Reconstructed pictures, motion-vector buffers and the reference set.

use serde::{Deserialize, Serialize};

use crate::buf_mgr::{BufferId, BufferManager, HoldFlags};
use crate::error::{EncodeError, ErrorReason, Result};
use crate::frame::{ColorFormat, RawBuffer};
use crate::quality::PlanePsnr;

/// Picture coding type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PicType {
    Idr,
    I,
    P,
    B,
}

impl PicType {
    /// Check if pictures of this type are kept for prediction.
    pub fn is_reference(&self) -> bool {
        !matches!(self, PicType::B)
    }

    /// Check if the picture is intra coded.
    pub fn is_intra(&self) -> bool {
        matches!(self, PicType::Idr | PicType::I)
    }
}

/// Reconstructed picture in macroblock-aligned planar 4:2:0 layout.
#[derive(Debug, Clone)]
pub struct PictureBuffer {
    /// Planar 4:2:0 samples, padded to whole macroblocks.
    pub frame: RawBuffer,
    /// Picture order count of the picture currently held.
    pub poc: i32,
}

impl PictureBuffer {
    pub fn new(mb_width: usize, mb_height: usize) -> Self {
        Self {
            frame: RawBuffer::alloc(
                ColorFormat::Yuv420p,
                (mb_width * 16) as u32,
                (mb_height * 16) as u32,
            ),
            poc: -1,
        }
    }
}

/// Motion vector in quarter-sample units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotionVector {
    pub x: i16,
    pub y: i16,
}

/// Per-macroblock motion vectors of one picture.
#[derive(Debug, Clone)]
pub struct MvBuffer {
    pub mvs: Vec<MotionVector>,
    pub mb_width: usize,
    pub mb_height: usize,
}

impl MvBuffer {
    pub fn new(mb_width: usize, mb_height: usize) -> Self {
        Self {
            mvs: vec![MotionVector::default(); mb_width * mb_height],
            mb_width,
            mb_height,
        }
    }

    /// Motion vectors of one macroblock row.
    pub fn row_mut(&mut self, mb_row: usize) -> &mut [MotionVector] {
        let start = mb_row * self.mb_width;
        &mut self.mvs[start..start + self.mb_width]
    }
}

/// One entry of the reference set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefSetEntry {
    /// Picture count of the picture, or -1 if the entry is empty.
    pub pic_cnt: i32,
    /// Picture order count.
    pub poc: i32,
    /// Coding type.
    pub pic_type: PicType,
    pub pic_buf: Option<BufferId>,
    pub mv_buf: Option<BufferId>,
    /// Quality computed on the reconstruction.
    pub psnr: Option<PlanePsnr>,
}

impl RefSetEntry {
    pub const EMPTY: Self = Self {
        pic_cnt: -1,
        poc: -1,
        pic_type: PicType::P,
        pic_buf: None,
        mv_buf: None,
        psnr: None,
    };

    pub fn is_empty(&self) -> bool {
        self.pic_cnt == -1
    }
}

/// Picture and motion-vector arenas addressed by the reference set.
#[derive(Debug)]
pub struct PictureStore {
    pub pics: BufferManager<PictureBuffer>,
    pub mvs: BufferManager<MvBuffer>,
}

impl PictureStore {
    pub fn new() -> Self {
        Self {
            pics: BufferManager::new("pic"),
            mvs: BufferManager::new("mv"),
        }
    }

    /// Allocate `count` picture and motion-vector buffers.
    pub fn allocate(&self, count: usize, mb_width: usize, mb_height: usize) {
        self.mvs
            .add_buffers(count, |_| MvBuffer::new(mb_width, mb_height));
        self.pics
            .add_buffers(count, |_| PictureBuffer::new(mb_width, mb_height));
    }

    /// Release `flags` on both buffers of an entry, motion vectors first.
    pub fn release(&self, entry: &RefSetEntry, flags: HoldFlags) -> Result<()> {
        if let Some(mv) = entry.mv_buf {
            self.mvs.release(mv, flags)?;
        }
        if let Some(pic) = entry.pic_buf {
            self.pics.release(pic, flags)?;
        }
        Ok(())
    }

    /// Release whichever of `flags` are still held on an entry.
    pub fn release_held(&self, entry: &RefSetEntry, flags: HoldFlags) -> Result<()> {
        if let Some(mv) = entry.mv_buf {
            self.mvs.release_held(mv, flags)?;
        }
        if let Some(pic) = entry.pic_buf {
            self.pics.release_held(pic, flags)?;
        }
        Ok(())
    }

    /// Holds on the picture buffer of an entry.
    pub fn pic_status(&self, entry: &RefSetEntry) -> Result<HoldFlags> {
        match entry.pic_buf {
            Some(id) => self.pics.status(id),
            None => Ok(HoldFlags::empty()),
        }
    }

    fn entry_status(&self, entry: &RefSetEntry) -> Result<HoldFlags> {
        let mv = match entry.mv_buf {
            Some(id) => self.mvs.status(id)?,
            None => HoldFlags::empty(),
        };
        Ok(self.pic_status(entry)? | mv)
    }

    pub fn clear(&self) {
        self.pics.clear();
        self.mvs.clear();
    }
}

impl Default for PictureStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Table of pictures still held as reference or awaiting output.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    entries: Vec<RefSetEntry>,
}

impl ReferenceSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![RefSetEntry::EMPTY; capacity],
        }
    }

    pub fn entries(&self) -> &[RefSetEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&RefSetEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut RefSetEntry> {
        self.entries.get_mut(index)
    }

    /// Place an entry into the first empty slot.
    pub fn insert(&mut self, entry: RefSetEntry) -> Result<usize> {
        let index = self
            .entries
            .iter()
            .position(RefSetEntry::is_empty)
            .ok_or(EncodeError::fatal(ErrorReason::NoFreeBuffer))?;
        self.entries[index] = entry;
        Ok(index)
    }

    /// Find the entry coded for `pic_cnt`.
    pub fn find_by_pic_cnt(&self, pic_cnt: i32) -> Option<usize> {
        if pic_cnt < 0 {
            return None;
        }
        self.entries.iter().position(|e| e.pic_cnt == pic_cnt)
    }

    /// Mark an entry empty.
    pub fn remove(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            *entry = RefSetEntry::EMPTY;
        }
    }

    /// Index of the lowest-POC entry whose picture still holds IO.
    pub fn select_recon(&self, store: &PictureStore) -> Result<Option<usize>> {
        let mut best: Option<(usize, i32)> = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.is_empty() || !store.pic_status(entry)?.contains(HoldFlags::IO) {
                continue;
            }
            if best.map_or(true, |(_, poc)| entry.poc < poc) {
                best = Some((index, entry.poc));
            }
        }
        Ok(best.map(|(index, _)| index))
    }

    /// Check if any picture still waits to be returned.
    pub fn any_io_held(&self, store: &PictureStore) -> Result<bool> {
        for entry in self.entries.iter().filter(|e| !e.is_empty()) {
            if store.pic_status(entry)?.contains(HoldFlags::IO) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Entries currently held as references, oldest first.
    pub fn references(&self, store: &PictureStore) -> Result<Vec<usize>> {
        let mut refs = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            if !entry.is_empty() && store.pic_status(entry)?.contains(HoldFlags::REF) {
                refs.push(index);
            }
        }
        refs.sort_by_key(|&i| self.entries[i].pic_cnt);
        Ok(refs)
    }

    /// Empty every entry whose buffers hold nothing.
    pub fn reclaim(&mut self, store: &PictureStore) -> Result<usize> {
        let mut reclaimed = 0;
        for entry in self.entries.iter_mut().filter(|e| !e.is_empty()) {
            if store.entry_status(entry)?.is_empty() {
                *entry = RefSetEntry::EMPTY;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Number of non-empty entries.
    pub fn occupied(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_empty()).count()
    }

    pub fn clear(&mut self) {
        self.entries.fill(RefSetEntry::EMPTY);
    }
}
