//! Property-based tests for GOP reordering and reconstruction order.

use std::sync::Arc;

use proptest::prelude::*;
use transcode_avcenc::input_queue::InputQueue;
use transcode_avcenc::{
    BitstreamBuffer, ColorFormat, ConfigRecord, EncodeInput, EncodeOutput, EncoderConfig, ErrorReason,
    FrameStats, H264Encoder, ParameterSetWriter, PcmKernels, PicType, PostEncode, RateControl,
    RawBuffer, Timestamp,
};

fn raw(index: usize) -> Arc<RawBuffer> {
    let mut raw = RawBuffer::alloc(ColorFormat::Yuv420p, 32, 16);
    raw.planes[0].data.fill((index * 8 % 256) as u8);
    Arc::new(raw)
}

// =============================================================================
// Input Queue Tests
// =============================================================================

proptest! {
    /// Every picture is admitted exactly once and no B picture precedes its anchor.
    #[test]
    fn encode_order_is_a_valid_permutation(
        bframes in 0u32..=4,
        idr_interval in 1u32..=12,
        count in 1usize..=24,
        forced in proptest::collection::vec(any::<bool>(), 24),
    ) {
        let config = EncoderConfig::new(32, 16)
            .with_bframes(bframes)
            .with_intervals(idr_interval, 0);
        let mut queue = InputQueue::new(&config);

        let mut order = Vec::new();
        for i in 0..count {
            if forced[i] {
                queue.request_idr();
            }
            queue.push(raw(i), Timestamp::new(0, i as u32));
            if let Some(pic) = queue.pop().picture {
                order.push((pic.display_idx, pic.pic_type));
            }
        }
        queue.finish();
        loop {
            let admitted = queue.pop();
            match admitted.picture {
                Some(pic) => order.push((pic.display_idx, pic.pic_type)),
                None => {
                    prop_assert!(admitted.is_last);
                    break;
                }
            }
        }

        let mut seen: Vec<i32> = order.iter().map(|(idx, _)| *idx).collect();
        seen.sort_unstable();
        prop_assert_eq!(seen, (0..count as i32).collect::<Vec<_>>());
        prop_assert_eq!(order[0].1, PicType::Idr);

        for (pos, (idx, pic_type)) in order.iter().enumerate() {
            if *pic_type == PicType::B {
                // The anchor that follows in display order was coded earlier.
                let anchor = order[..pos]
                    .iter()
                    .any(|(other, t)| other > idx && *t != PicType::B);
                prop_assert!(anchor, "B picture {} coded before its anchor", idx);
            }
        }
        // Never more consecutive B pictures than configured.
        let mut run = 0;
        for (_, pic_type) in &order {
            run = if *pic_type == PicType::B { run + 1 } else { 0 };
            prop_assert!(run <= bframes as usize);
        }
    }
}

// =============================================================================
// Encoder Stream Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Reconstructions come back once each, in display order.
    #[test]
    fn recon_follows_display_order(
        bframes in 0u32..=3,
        idr_interval in 1u32..=8,
        cores in 1usize..=3,
        persistent in any::<bool>(),
        count in 1usize..=12,
    ) {
        let config = EncoderConfig::new(32, 16)
            .with_bframes(bframes)
            .with_intervals(idr_interval, 0)
            .with_cores(cores)
            .with_persistent_threads(persistent)
            .with_recon(ColorFormat::Yuv420p);
        let mut encoder = H264Encoder::new(config).unwrap();
        let mut output = EncodeOutput::default();
        let mut recon = Vec::new();
        let mut coded = 0;

        let mut calls = 0;
        loop {
            let input = if calls < count {
                let mut input = EncodeInput::picture(
                    raw(calls),
                    Timestamp::new(0, calls as u32),
                    BitstreamBuffer::new(1 << 16),
                );
                input.is_last = calls + 1 == count;
                input
            } else {
                EncodeInput::flush(BitstreamBuffer::new(1 << 16))
            };
            encoder.encode(input, &mut output).unwrap();
            calls += 1;

            coded += output.output_present as usize;
            if output.recon_present {
                recon.push(output.recon.as_ref().unwrap().planes[0].data[0]);
            }
            prop_assert_eq!(encoder.pending_jobs(), (0, 0));
            if output.is_last && calls >= count {
                break;
            }
            prop_assert!(calls < count + 16, "stream did not finish");
        }

        let expected: Vec<u8> = (0..count).map(|i| (i * 8 % 256) as u8).collect();
        prop_assert_eq!(recon, expected);
        prop_assert_eq!(coded, count);
    }
}

/// Rate control dropping pictures by call index.
#[derive(Debug)]
struct DropScript {
    pre: Vec<bool>,
    post: Vec<bool>,
    pre_calls: usize,
    post_calls: usize,
}

impl RateControl for DropScript {
    fn pre_encode_skip(&mut self, _: PicType) -> bool {
        self.pre_calls += 1;
        self.pre.get(self.pre_calls - 1).copied().unwrap_or(false)
    }

    fn frame_qp(&mut self, _: PicType) -> u8 {
        26
    }

    fn post_encode_update(&mut self, _: &FrameStats) -> Result<PostEncode, ErrorReason> {
        self.post_calls += 1;
        Ok(PostEncode {
            skip: self.post.get(self.post_calls - 1).copied().unwrap_or(false),
        })
    }

    fn reconfigure(&mut self, _: &EncoderConfig) {}
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Dropped pictures and forced IDRs keep the kept reconstructions in display order.
    #[test]
    fn recon_order_survives_drops(
        bframes in 0u32..=3,
        idr_interval in 1u32..=8,
        count in 1usize..=16,
        pre in proptest::collection::vec(proptest::bool::weighted(0.2), 20),
        post in proptest::collection::vec(proptest::bool::weighted(0.25), 20),
        forced in proptest::collection::vec(proptest::bool::weighted(0.1), 16),
    ) {
        let config = EncoderConfig::new(32, 16)
            .with_bframes(bframes)
            .with_intervals(idr_interval, 0)
            .with_cores(2)
            .with_recon(ColorFormat::Yuv420p);
        let rc = DropScript { pre, post, pre_calls: 0, post_calls: 0 };
        let mut encoder = H264Encoder::with_components(
            config.clone(),
            Arc::new(PcmKernels),
            Box::new(rc),
            Box::new(ParameterSetWriter),
        )
        .unwrap();
        let mut output = EncodeOutput::default();
        let mut recon = Vec::new();
        let mut kept = Vec::new();

        let mut calls = 0;
        loop {
            let input = if calls < count {
                if forced[calls] {
                    let mut next = config.clone();
                    next.force_idr = true;
                    encoder.set_config(ConfigRecord::immediate(next)).unwrap();
                }
                let mut input = EncodeInput::picture(
                    raw(calls),
                    Timestamp::new(0, calls as u32),
                    BitstreamBuffer::new(1 << 16),
                );
                input.is_last = calls + 1 == count;
                input
            } else {
                EncodeInput::flush(BitstreamBuffer::new(1 << 16))
            };
            encoder.encode(input, &mut output).unwrap();
            calls += 1;

            if output.output_present {
                kept.push(output.timestamp.low as usize);
            }
            if output.recon_present {
                let frame = output.recon.as_ref().unwrap();
                if !frame.is_zero_sized() {
                    recon.push(frame.planes[0].data[0]);
                }
            }
            prop_assert_eq!(encoder.pending_jobs(), (0, 0));
            if output.is_last && calls >= count {
                break;
            }
            prop_assert!(calls < count + 16, "stream did not finish");
        }

        kept.sort_unstable();
        let expected: Vec<u8> = kept.iter().map(|i| (i * 8 % 256) as u8).collect();
        prop_assert_eq!(recon, expected);
    }
}
