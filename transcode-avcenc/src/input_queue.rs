//! Input admission and GOP reordering.
//!
//! Pictures arrive in display order. Each one is typed from its position in
//! the GOP; B pictures wait until the anchor that follows them in display
//! order arrives, so encode order for `I B B P` is `I P B B`. A forced IDR
//! converts waiting B pictures into P pictures coded ahead of the IDR, and
//! end of stream turns the last waiting B picture into an anchor.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::EncoderConfig;
use crate::frame::{RawBuffer, Timestamp};
use crate::picture::PicType;

/// A picture ready to be coded.
#[derive(Debug, Clone)]
pub struct QueuedPicture {
    pub raw: Arc<RawBuffer>,
    pub timestamp: Timestamp,
    /// Display index since the start of the stream.
    pub display_idx: i32,
    pub pic_type: PicType,
}

/// A dequeued picture and whether it ends the stream.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub picture: Option<QueuedPicture>,
    pub is_last: bool,
}

#[derive(Debug, Clone, Copy)]
struct GopLayout {
    idr_interval: u32,
    i_interval: u32,
    num_bframes: u32,
}

/// Display-to-encode order queue.
#[derive(Debug)]
pub struct InputQueue {
    layout: GopLayout,
    waiting: VecDeque<QueuedPicture>,
    ready: VecDeque<QueuedPicture>,
    next_display_idx: i32,
    last_idr_idx: i32,
    force_idr: bool,
    end_of_stream: bool,
}

impl InputQueue {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            layout: GopLayout {
                idr_interval: config.idr_interval,
                i_interval: config.i_interval,
                num_bframes: config.num_bframes,
            },
            waiting: VecDeque::new(),
            ready: VecDeque::new(),
            next_display_idx: 0,
            last_idr_idx: 0,
            force_idr: false,
            end_of_stream: false,
        }
    }

    /// Pick up new GOP intervals. The B-frame count is fixed for the stream.
    pub fn reconfigure(&mut self, config: &EncoderConfig) {
        self.layout.idr_interval = config.idr_interval;
        self.layout.i_interval = config.i_interval;
    }

    /// Code the next received picture as IDR.
    pub fn request_idr(&mut self) {
        self.force_idr = true;
    }

    fn classify(&mut self, display_idx: i32) -> PicType {
        if display_idx == 0 || std::mem::take(&mut self.force_idr) {
            return PicType::Idr;
        }
        let pos = (display_idx - self.last_idr_idx) as u32;
        let layout = self.layout;
        if pos % layout.idr_interval == 0 {
            PicType::Idr
        } else if layout.i_interval > 0 && pos % layout.i_interval == 0 {
            PicType::I
        } else if pos % (layout.num_bframes + 1) == 0 {
            PicType::P
        } else {
            PicType::B
        }
    }

    fn release_waiting(&mut self, as_type: Option<PicType>) {
        while let Some(mut pic) = self.waiting.pop_front() {
            if let Some(pic_type) = as_type {
                pic.pic_type = pic_type;
            }
            self.ready.push_back(pic);
        }
    }

    /// Accept a picture in display order.
    pub fn push(&mut self, raw: Arc<RawBuffer>, timestamp: Timestamp) {
        let display_idx = self.next_display_idx;
        self.next_display_idx += 1;
        let pic_type = self.classify(display_idx);
        let pic = QueuedPicture {
            raw,
            timestamp,
            display_idx,
            pic_type,
        };

        match pic_type {
            PicType::Idr => {
                self.release_waiting(Some(PicType::P));
                self.last_idr_idx = display_idx;
                self.ready.push_back(pic);
            }
            PicType::I | PicType::P => {
                self.ready.push_back(pic);
                self.release_waiting(None);
            }
            PicType::B => self.waiting.push_back(pic),
        }
    }

    /// Mark end of stream; waiting B pictures get the last one as anchor.
    pub fn finish(&mut self) {
        if self.end_of_stream {
            return;
        }
        self.end_of_stream = true;
        if let Some(mut anchor) = self.waiting.pop_back() {
            anchor.pic_type = PicType::P;
            self.ready.push_back(anchor);
            self.release_waiting(None);
        }
    }

    /// Dequeue the next picture in encode order.
    pub fn pop(&mut self) -> Admitted {
        let picture = self.ready.pop_front();
        Admitted {
            picture,
            is_last: self.end_of_stream && self.is_drained(),
        }
    }

    /// Check if no picture is queued.
    pub fn is_drained(&self) -> bool {
        self.ready.is_empty() && self.waiting.is_empty()
    }

    /// Lowest display index among queued pictures.
    pub fn lowest_queued_display_idx(&self) -> Option<i32> {
        self.ready
            .iter()
            .chain(&self.waiting)
            .map(|p| p.display_idx)
            .min()
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Pictures received so far.
    pub fn received(&self) -> i32 {
        self.next_display_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ColorFormat;

    fn queue(bframes: u32, idr_interval: u32, i_interval: u32) -> InputQueue {
        let config = EncoderConfig::new(16, 16)
            .with_bframes(bframes)
            .with_intervals(idr_interval, i_interval);
        InputQueue::new(&config)
    }

    fn raw() -> Arc<RawBuffer> {
        Arc::new(RawBuffer::alloc(ColorFormat::Yuv420p, 16, 16))
    }

    fn drain(q: &mut InputQueue, inputs: usize) -> Vec<(i32, PicType)> {
        let mut order = Vec::new();
        for i in 0..inputs {
            q.push(raw(), Timestamp::new(0, i as u32));
            if let Some(p) = q.pop().picture {
                order.push((p.display_idx, p.pic_type));
            }
        }
        q.finish();
        while let Some(p) = q.pop().picture {
            order.push((p.display_idx, p.pic_type));
        }
        order
    }

    #[test]
    fn test_ibbp_encode_order() {
        let mut q = queue(2, 300, 0);
        let order = drain(&mut q, 7);
        assert_eq!(
            order,
            vec![
                (0, PicType::Idr),
                (3, PicType::P),
                (1, PicType::B),
                (2, PicType::B),
                (6, PicType::P),
                (4, PicType::B),
                (5, PicType::B),
            ]
        );
    }

    #[test]
    fn test_no_bframes_is_display_order() {
        let mut q = queue(0, 4, 0);
        let order = drain(&mut q, 6);
        let types: Vec<PicType> = order.iter().map(|(_, t)| *t).collect();
        assert_eq!(
            types,
            vec![PicType::Idr, PicType::P, PicType::P, PicType::P, PicType::Idr, PicType::P]
        );
    }

    #[test]
    fn test_intra_interval() {
        let mut q = queue(0, 100, 3);
        let order = drain(&mut q, 7);
        assert_eq!(order[3].1, PicType::I);
        assert_eq!(order[6].1, PicType::I);
    }

    #[test]
    fn test_forced_idr_flushes_waiting_b_as_p() {
        let mut q = queue(2, 300, 0);
        q.push(raw(), Timestamp::default());
        assert_eq!(q.pop().picture.unwrap().pic_type, PicType::Idr);
        q.push(raw(), Timestamp::default());
        assert!(q.pop().picture.is_none());

        q.request_idr();
        q.push(raw(), Timestamp::default());
        let first = q.pop().picture.unwrap();
        assert_eq!((first.display_idx, first.pic_type), (1, PicType::P));
        let second = q.pop().picture.unwrap();
        assert_eq!((second.display_idx, second.pic_type), (2, PicType::Idr));
    }

    #[test]
    fn test_lowest_queued_display_idx() {
        let mut q = queue(1, 300, 0);
        assert_eq!(q.lowest_queued_display_idx(), None);
        q.push(raw(), Timestamp::default());
        q.pop();
        q.push(raw(), Timestamp::default());
        assert_eq!(q.lowest_queued_display_idx(), Some(1));
        q.push(raw(), Timestamp::default());
        assert_eq!(q.pop().picture.unwrap().display_idx, 2);
        assert_eq!(q.lowest_queued_display_idx(), Some(1));
        q.pop();
        assert_eq!(q.lowest_queued_display_idx(), None);
    }

    #[test]
    fn test_end_of_stream_promotes_last_b() {
        let mut q = queue(3, 300, 0);
        for _ in 0..3 {
            q.push(raw(), Timestamp::default());
        }
        assert_eq!(q.pop().picture.unwrap().display_idx, 0);
        q.finish();

        let next = q.pop();
        let p = next.picture.unwrap();
        assert_eq!((p.display_idx, p.pic_type), (2, PicType::P));
        assert!(!next.is_last);
        let last = q.pop();
        assert_eq!(last.picture.unwrap().display_idx, 1);
        assert!(last.is_last);
        assert!(q.pop().picture.is_none());
    }
}
