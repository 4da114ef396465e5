//! SEI metadata parameters and change tracking.
//!
//! The encoder keeps the last SEI parameters it signalled. Whenever the
//! configured parameters differ from them, the affected messages are marked
//! present and the next picture is coded as IDR so the new metadata starts a
//! fresh coded video sequence.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Maximum number of temporal sub-layers in shutter interval info.
pub const MAX_SUB_LAYERS: usize = 8;

/// Mastering display colour volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MasteringDisplay {
    pub display_primaries_x: [u16; 3],
    pub display_primaries_y: [u16; 3],
    pub white_point_x: u16,
    pub white_point_y: u16,
    pub max_display_mastering_luminance: u32,
    pub min_display_mastering_luminance: u32,
}

/// Content light level information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentLight {
    pub max_content_light_level: u16,
    pub max_pic_average_light_level: u16,
}

/// Ambient viewing environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AmbientViewing {
    pub ambient_illuminance: u32,
    pub ambient_light_x: u16,
    pub ambient_light_y: u16,
}

/// Shutter interval information.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ShutterInterval {
    pub sub_layer_idx: u32,
    pub info_present: bool,
    pub time_scale: u32,
    pub fixed_within_cvs: bool,
    pub num_units_in_shutter_interval: u32,
    pub max_sub_layers_minus1: u8,
    pub sub_layer_num_units: [u32; MAX_SUB_LAYERS],
}

impl ShutterInterval {
    /// Number of sub-layer entries in use.
    pub fn active_sub_layers(&self) -> usize {
        (self.max_sub_layers_minus1 as usize + 1).min(MAX_SUB_LAYERS)
    }
}

// Sub-layer entries beyond max_sub_layers_minus1 are not part of the message.
impl PartialEq for ShutterInterval {
    fn eq(&self, other: &Self) -> bool {
        let n = self.active_sub_layers();
        self.sub_layer_idx == other.sub_layer_idx
            && self.info_present == other.info_present
            && self.time_scale == other.time_scale
            && self.fixed_within_cvs == other.fixed_within_cvs
            && self.num_units_in_shutter_interval == other.num_units_in_shutter_interval
            && self.max_sub_layers_minus1 == other.max_sub_layers_minus1
            && self.sub_layer_num_units[..n] == other.sub_layer_num_units[..n]
    }
}

impl Eq for ShutterInterval {}

/// All SEI parameters carried by the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SeiParams {
    pub mastering_display: MasteringDisplay,
    pub content_light: ContentLight,
    pub ambient_viewing: AmbientViewing,
    pub shutter_interval: ShutterInterval,
}

bitflags! {
    /// SEI messages to emit with the next IDR picture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SeiPresent: u8 {
        const MASTERING_DISPLAY = 1 << 0;
        const CONTENT_LIGHT = 1 << 1;
        const AMBIENT_VIEWING = 1 << 2;
        const SHUTTER_INTERVAL = 1 << 3;
    }
}

/// Last signalled SEI parameters and which messages changed.
#[derive(Debug, Clone, Default)]
pub struct SeiState {
    latched: SeiParams,
    present: SeiPresent,
    pending: SeiPresent,
}

impl SeiState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `config` against the latched parameters.
    ///
    /// Every changed group is latched and marked present; unchanged groups
    /// are marked absent. Returns `true` if the next picture must be IDR.
    pub fn refresh(&mut self, config: &SeiParams) -> bool {
        let mut present = SeiPresent::empty();

        if self.latched.mastering_display != config.mastering_display {
            self.latched.mastering_display = config.mastering_display;
            present |= SeiPresent::MASTERING_DISPLAY;
        }
        if self.latched.content_light != config.content_light {
            self.latched.content_light = config.content_light;
            present |= SeiPresent::CONTENT_LIGHT;
        }
        if self.latched.ambient_viewing != config.ambient_viewing {
            self.latched.ambient_viewing = config.ambient_viewing;
            present |= SeiPresent::AMBIENT_VIEWING;
        }
        // Sub-layers are compared over the new config's count.
        if config.shutter_interval != self.latched.shutter_interval {
            self.latched.shutter_interval = config.shutter_interval;
            present |= SeiPresent::SHUTTER_INTERVAL;
        }

        self.present = present;
        self.pending |= present;
        !present.is_empty()
    }

    /// Messages marked by the last refresh.
    pub fn present(&self) -> SeiPresent {
        self.present
    }

    /// Latched parameters.
    pub fn params(&self) -> &SeiParams {
        &self.latched
    }

    /// Take the messages changed since the last IDR picture was coded.
    pub fn take_pending(&mut self) -> SeiPresent {
        std::mem::take(&mut self.pending)
    }

    /// Put back messages taken for a picture that was dropped.
    pub fn restore_pending(&mut self, messages: SeiPresent) {
        self.pending |= messages;
    }
}
