//! Host-facing configuration structures.
//!
//! Plain serde-derived data so hosts can keep mixer tuning in their own
//! configuration files. Limits control how much sample memory each channel
//! is provisioned with; see `Mixer::ch_set_limits`.

use serde::{Deserialize, Serialize};

use crate::memory::ALIGN;
use crate::{LOOP_OVERREAD, POLL_PER_SECOND};

/// Frequencies up to 1% over a channel's limit are accepted (file headers
/// round their rates); buffers are provisioned for the same overshoot.
pub(crate) const FREQ_TOLERANCE: f32 = 1.01;

/// Mixer initialization parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerConfig {
    /// Output sample rate in Hz (stereo frames per second).
    pub output_rate: u32,
    /// Number of mixer channels to provision. More channels cost memory
    /// (one staging buffer each), not mixing time.
    pub num_channels: usize,
}

impl MixerConfig {
    pub fn new(output_rate: u32, num_channels: usize) -> Self {
        MixerConfig { output_rate, num_channels }
    }
}

/// Per-channel provisioning limits.
///
/// Defaults allow any playable waveform: frames up to 16-bit stereo
/// (32 bits) at up to the output rate. Declaring tighter limits for
/// channels that only ever play narrower or lower-rate content shrinks
/// their staging buffers accordingly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelLimits {
    /// Maximum frame width in bits: sample width times interleaved
    /// channels, so mono 8-bit is 8 and stereo 16-bit is 32.
    pub max_frame_bits: u32,
    /// Maximum playback frequency in Hz.
    pub max_frequency: f32,
    /// Hard cap on the staging buffer size in bytes, applied on top of the
    /// computed size. `None` means no cap.
    pub max_buf_bytes: Option<u32>,
}

impl ChannelLimits {
    pub(crate) fn defaults(output_rate: u32) -> Self {
        ChannelLimits {
            max_frame_bits: 32,
            max_frequency: output_rate as f32,
            max_buf_bytes: None,
        }
    }

    /// Staging buffer size: one poll-budget of frames at the channel's
    /// limits (including the frequency tolerance), plus the loop overread,
    /// rounded up to the alignment quantum.
    pub(crate) fn buffer_size(&self) -> usize {
        let budget = (self.max_frequency * FREQ_TOLERANCE * (self.max_frame_bits as f32 / 8.0)
            / POLL_PER_SECOND as f32)
            .ceil() as usize;
        let mut size = (budget + LOOP_OVERREAD as usize + ALIGN - 1) & !(ALIGN - 1);
        if let Some(cap) = self.max_buf_bytes {
            let cap = (cap as usize) & !(ALIGN - 1);
            size = size.min(cap.max(ALIGN));
        }
        size
    }
}
