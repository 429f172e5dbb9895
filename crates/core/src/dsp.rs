//! The external executor contract: one command per mixed block.
//!
//! The engine describes every channel in a fixed-layout settings block and
//! submits it together with a header and the output destination. The
//! executor — on real hardware, microcode running on the coprocessor —
//! consumes every channel whose `ptr` is non-zero, resamples it with a
//! phase-stepped fixed-point walk, applies the two per-side gains and the
//! master volume, and writes exactly `nsamples` interleaved s16 stereo
//! frames. It hands back each channel's post-mix position.
//!
//! [`SoftwareExecutor`] is the in-process reference implementation of this
//! contract, used for testing and for hosts without a coprocessor. It is
//! the executable form of the contract documentation below:
//!
//! - positions, steps and lengths are Q.12 fixed-point byte offsets; the
//!   engine transmits the low 31 bits and biases `ptr` so that
//!   `ptr + (pos >> 12)` always addresses the right byte;
//! - a channel with `loop_len != 0` wraps `pos` by `loop_len` whenever it
//!   reaches `len`; a channel with `loop_len == 0` goes silent past `len`
//!   but keeps advancing (the engine stops it at the next block);
//! - gains are Q1.15 (raw `0x8000` = +1.0), two channels per 32-bit word;
//!   the master volume is Q0.16 in the header's low half. Both multiply
//!   stages round before shifting.

use crate::fixed::{Fx15, Fx16, FX64_FRAC};
use crate::memory::SampleMem;
use crate::MAX_CHANNELS;

/// Command identifier placed in the header's upper half.
pub const CMD_MIX: u32 = 0x4D58_0000;

/// Largest value representable in the 31-bit position/length fields.
pub const MAX_U31: u32 = 0x7FFF_FFFF;

// Channel flag bits (bits 0-1 hold bps_shift).
pub const CH_BPS_MASK: u32 = 0b11;
pub const CH_16BIT: u32 = 1 << 2;
pub const CH_STEREO: u32 = 1 << 3;
pub const CH_STEREO_SUB: u32 = 1 << 4;

/// Per-channel record in the settings block. All fields are natural-width
/// words; `ptr == 0` marks the channel as not playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DspChannel {
    /// Low 31 bits of the Q.12 byte position.
    pub pos: u32,
    /// Q.12 byte step per output sample.
    pub step: u32,
    /// Q.12 byte offset of the end of valid data (loop end for loops).
    pub len: u32,
    /// Q.12 byte length of the looping tail, 0 if none.
    pub loop_len: u32,
    /// Bus address of the sample at byte position 0 (biased).
    pub ptr: u32,
    /// See the `CH_*` bits.
    pub flags: u32,
}

impl DspChannel {
    pub const ZERO: DspChannel = DspChannel {
        pos: 0,
        step: 0,
        len: 0,
        loop_len: 0,
        ptr: 0,
        flags: 0,
    };
}

/// Volume tables and channel records, laid out as the executor reads them.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct DspSettings {
    /// Left gains, two Q1.15 values per word (even channel in the low half).
    pub lvol: [u32; MAX_CHANNELS / 2],
    /// Right gains, same packing.
    pub rvol: [u32; MAX_CHANNELS / 2],
    pub channels: [DspChannel; MAX_CHANNELS],
}

/// One mix command.
#[derive(Debug, Clone)]
pub struct DspCommand {
    /// `CMD_MIX | master_volume_fx16`.
    pub header: u32,
    /// `(nsamples << 16) | num_channels`.
    pub count: u32,
    pub settings: DspSettings,
}

impl DspCommand {
    pub fn new(nsamples: usize, num_channels: usize, master: Fx16) -> Self {
        debug_assert!(nsamples <= 0xFFFF && num_channels <= MAX_CHANNELS);
        DspCommand {
            header: CMD_MIX | master.pack() as u32,
            count: ((nsamples as u32) << 16) | num_channels as u32,
            settings: DspSettings {
                lvol: [0; MAX_CHANNELS / 2],
                rvol: [0; MAX_CHANNELS / 2],
                channels: [DspChannel::ZERO; MAX_CHANNELS],
            },
        }
    }

    #[inline]
    pub fn nsamples(&self) -> usize {
        (self.count >> 16) as usize
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        (self.count & 0xFFFF) as usize
    }

    /// Store a channel's packed gain pair.
    pub fn set_gains(&mut self, ch: usize, lvol: Fx15, rvol: Fx15) {
        pack_gain(&mut self.settings.lvol, ch, lvol);
        pack_gain(&mut self.settings.rvol, ch, rvol);
    }
}

fn pack_gain(words: &mut [u32; MAX_CHANNELS / 2], ch: usize, gain: Fx15) {
    let shift = (ch & 1) * 16;
    let word = &mut words[ch / 2];
    *word = (*word & !(0xFFFF << shift)) | ((gain.pack() as u32) << shift);
}

fn unpack_gain(words: &[u32; MAX_CHANNELS / 2], ch: usize) -> i64 {
    let raw = (words[ch / 2] >> ((ch & 1) * 16)) as u16;
    Fx15::unpack(raw).raw() as i64
}

/// The opaque unit that performs the resample-and-mix.
///
/// `submit` must behave as a synchronous call: implementations backed by an
/// asynchronous queue submit at high priority and block until the command
/// has retired, so that the updated channel positions are valid on return.
pub trait DspExecutor {
    fn submit(&mut self, cmd: &mut DspCommand, mem: &SampleMem, out: &mut [i16]);
}

/// Reference implementation of the executor contract.
#[derive(Debug, Default)]
pub struct SoftwareExecutor;

impl DspExecutor for SoftwareExecutor {
    fn submit(&mut self, cmd: &mut DspCommand, mem: &SampleMem, out: &mut [i16]) {
        let ns = cmd.nsamples();
        let nch = cmd.num_channels();
        let master = (cmd.header & 0xFFFF) as i64;
        debug_assert!(out.len() >= ns * 2);
        let bytes = mem.bytes();

        for i in 0..ns {
            let mut acc_l = 0i64;
            let mut acc_r = 0i64;

            for ch in 0..nch {
                let c = &mut cmd.settings.channels[ch];
                if c.ptr == 0 {
                    continue;
                }
                if c.loop_len != 0 {
                    while c.pos >= c.len {
                        c.pos -= c.loop_len;
                    }
                }
                if c.loop_len != 0 || c.pos < c.len {
                    let bps = c.flags & CH_BPS_MASK;
                    let byte = (c.pos >> FX64_FRAC) & !((1u32 << bps) - 1);
                    let at = c.ptr.wrapping_add(byte) as usize;
                    let sample = if c.flags & CH_16BIT != 0 {
                        i16::from_ne_bytes([bytes[at], bytes[at + 1]]) as i64
                    } else {
                        ((bytes[at] as i8) as i64) << 8
                    };
                    acc_l += (sample * unpack_gain(&cmd.settings.lvol, ch) + (1 << 14)) >> 15;
                    acc_r += (sample * unpack_gain(&cmd.settings.rvol, ch) + (1 << 14)) >> 15;
                }
                // No masking here: a block advances well under 2^31, and the
                // engine's reconciliation needs the unmasked difference.
                c.pos = c.pos.wrapping_add(c.step);
            }

            out[i * 2] = clamp16((acc_l * master + (1 << 15)) >> 16);
            out[i * 2 + 1] = clamp16((acc_r * master + (1 << 15)) >> 16);
        }
    }
}

#[inline]
fn clamp16(v: i64) -> i16 {
    v.clamp(i16::MIN as i64, i16::MAX as i64) as i16
}
