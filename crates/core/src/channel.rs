//! Per-channel playback state.
//!
//! Positions, steps and lengths are [`Fx64`] *byte* offsets: the sample
//! index in Q.12, shifted left by the channel's `bps_shift` so that the
//! executor can walk bytes without a per-sample multiply. The flag word uses
//! the same bit layout as the DSP command contract.

use crate::dsp::{CH_16BIT, CH_BPS_MASK, CH_STEREO, CH_STEREO_SUB};
use crate::fixed::{Fx15, Fx64, FX64_FRAC};

#[derive(Debug, Default)]
pub(crate) struct Channel {
    /// Playback position (Q.12 bytes, scaled by `bps_shift`).
    pub pos: Fx64,
    /// Position increment per output sample, same format.
    pub step: Fx64,
    /// Waveform end, same format.
    pub len: Fx64,
    /// Looping tail length, same format (zero = no loop).
    pub loop_len: Fx64,
    /// `CH_*` bits plus `bps_shift` in the low two bits.
    pub flags: u32,
    /// Whether a waveform is playing (the command-level `ptr != 0`).
    pub active: bool,
    pub lvol: Fx15,
    pub rvol: Fx15,
}

impl Channel {
    #[inline]
    pub(crate) fn bps_shift(&self) -> u32 {
        self.flags & CH_BPS_MASK
    }

    /// Shift that converts an Fx64 raw value into whole samples.
    #[inline]
    pub(crate) fn pos_shift(&self) -> u32 {
        FX64_FRAC + self.bps_shift()
    }

    #[inline]
    pub(crate) fn is_stereo(&self) -> bool {
        self.flags & CH_STEREO != 0
    }

    #[inline]
    pub(crate) fn is_secondary(&self) -> bool {
        self.flags & CH_STEREO_SUB != 0
    }

    pub(crate) fn set_vol(&mut self, lvol: f32, rvol: f32) {
        self.lvol = Fx15::from_f32(lvol);
        self.rvol = Fx15::from_f32(rvol);
    }

    /// Volume + panning: `pan` 0 is full left, 1 full right, 0.5 center
    /// (center attenuates each side by half).
    pub(crate) fn set_vol_pan(&mut self, vol: f32, pan: f32) {
        self.set_vol(vol * (1.0 - pan), vol * pan);
    }

    /// Dolby Pro Logic II matrix encoding of five speaker volumes into the
    /// stereo pair. Surround channels land with opposite phase so a
    /// downstream decoder can separate them again.
    pub(crate) fn set_vol_dolby(&mut self, fl: f32, fr: f32, c: f32, sl: f32, sr: f32) {
        let kf = 1.0f32;
        let kc = std::f32::consts::FRAC_1_SQRT_2;
        let ka = (0.75f32).sqrt();
        let kb = 0.5f32;
        let norm = kf + kc + ka + kb;
        let (kf, kc, ka, kb) = (kf / norm, kc / norm, ka / norm, kb / norm);

        let left = fl * kf + c * kc - sl * ka - sr * kb;
        let right = fr * kf + c * kc + sl * kb + sr * ka;
        self.set_vol(left, right);
    }

    /// Build the flag word for a waveform shape. `bits` ∈ {8, 16},
    /// `channels` ∈ {1, 2}; the frame width is their product.
    pub(crate) fn flags_for(bits: u8, channels: u8) -> u32 {
        let frame_bytes = (bits as u32 / 8) * channels as u32;
        let mut flags = frame_bytes.trailing_zeros();
        if bits == 16 {
            flags |= CH_16BIT;
        }
        if channels == 2 {
            flags |= CH_STEREO;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_layout_per_shape() {
        assert_eq!(Channel::flags_for(8, 1), 0);
        assert_eq!(Channel::flags_for(16, 1), 1 | CH_16BIT);
        assert_eq!(Channel::flags_for(8, 2), 1 | CH_STEREO);
        assert_eq!(Channel::flags_for(16, 2), 2 | CH_16BIT | CH_STEREO);
    }

    #[test]
    fn pan_splits_volume() {
        let mut c = Channel::default();
        c.set_vol_pan(1.0, 0.5);
        assert_eq!(c.lvol, Fx15::from_f32(0.5));
        assert_eq!(c.rvol, Fx15::from_f32(0.5));
        c.set_vol_pan(0.8, 0.0);
        assert_eq!(c.lvol, Fx15::from_f32(0.8));
        assert_eq!(c.rvol, Fx15::ZERO);
    }

    #[test]
    fn dolby_center_is_symmetric() {
        let mut c = Channel::default();
        c.set_vol_dolby(0.0, 0.0, 1.0, 0.0, 0.0);
        assert_eq!(c.lvol, c.rvol);
        let expected = std::f32::consts::FRAC_1_SQRT_2
            / (1.0 + std::f32::consts::FRAC_1_SQRT_2 + (0.75f32).sqrt() + 0.5);
        assert_eq!(c.lvol, Fx15::from_f32(expected));
    }

    #[test]
    fn dolby_surround_is_antiphase() {
        let mut c = Channel::default();
        c.set_vol_dolby(0.0, 0.0, 0.0, 1.0, 0.0);
        assert!(c.lvol.raw() < 0, "surround left lands negated on the left");
        assert!(c.rvol.raw() > 0);
    }
}
