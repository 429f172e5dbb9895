//! Block preparation: turning channel state into one executor command.
//!
//! For each mixed block the engine computes, per channel, the window of
//! absolute samples the executor will touch, drives the sample buffer to
//! make that window resident, and emits a channel record with 31-bit
//! positions. The CPU keeps the authoritative 64-bit position; the executor
//! returns its 31-bit view and the difference is folded back in, which
//! survives both forward motion across the 31-bit boundary and the
//! backward jumps of loop wraps.
//!
//! Loops come in three shapes:
//!
//! - **fully cached**: the tail fits in the staging buffer (and the
//!   waveform end fits the 31-bit command field), so the executor wraps by
//!   itself and the decoder eventually goes idle;
//! - **unrolled**: the adapter replays the tail into a linearly growing
//!   sample space and the executor is told there is no loop at all; the
//!   engine periodically wraps the coordinates back down to keep them from
//!   growing without bound;
//! - **none**: the channel stops once it runs off the end of its data.

use crate::dsp::{DspChannel, DspCommand, CH_STEREO, CH_STEREO_SUB, MAX_U31};
use crate::fixed::{Fx15, Fx16, Fx64, FX64_FRAC};
use crate::{Mixer, LOOP_OVERREAD, RESET_FADE_SECS};

/// How a channel is presented to the executor this block.
enum Presented {
    /// Straight data, silent past the valid-data end.
    Data,
    /// Real loop: executor wraps between `len` and `len - loop_len`.
    Cached,
    /// Unrolled loop: pretend the data is endless.
    Endless,
}

impl Mixer {
    /// Mix one block of `ns` stereo frames into `out`.
    pub(crate) fn exec(&mut self, out: &mut [i16], ns: usize) {
        debug_assert_eq!(out.len(), ns * 2);

        if self.mem.is_none() {
            if self.channels.iter().any(|c| c.active) {
                // limits changed mid-playback: reallocate, channels re-seek
                self.ensure_mem();
            } else {
                out.fill(0);
                self.ticks += ns as i64;
                return;
            }
        }

        let mut cmd = DspCommand::new(ns, self.num_channels, self.effective_master());
        for ch in 0..self.num_channels {
            if self.channels[ch].active && !self.channels[ch].is_secondary() {
                self.prepare_channel(&mut cmd, ch, ns);
            }
        }

        self.executor
            .submit(&mut cmd, self.mem.as_ref().expect("sample memory"), out);

        // Fold the executor's 31-bit positions back into the 64-bit state.
        for ch in 0..self.num_channels {
            let c = &mut self.channels[ch];
            if !c.active || c.is_secondary() {
                continue;
            }
            let new = cmd.settings.channels[ch].pos as i64;
            let old = c.pos.raw() & MAX_U31 as i64;
            c.pos = Fx64::from_raw(c.pos.raw() + (new - old));

            if cmd.settings.channels[ch].loop_len != 0 {
                // executor-view position never escapes the loop by more
                // than the prefetch allowance
                let slack = ((LOOP_OVERREAD as i64) << FX64_FRAC).max(c.step.raw());
                debug_assert!(c.pos.raw() < c.len.raw() + slack);
            }
        }

        self.ticks += ns as i64;
    }

    /// Compute the sample window one channel needs for `ns` output samples,
    /// make it resident, and write the channel's command record.
    fn prepare_channel(&mut self, cmd: &mut DspCommand, ch: usize, ns: usize) {
        let (pos_raw, step_raw, len_fx, loop_fx, bps, shift, flags, lvol, rvol, stereo) = {
            let c = &self.channels[ch];
            (
                c.pos.raw(),
                c.step.raw(),
                c.len.raw(),
                c.loop_len.raw(),
                c.bps_shift(),
                c.pos_shift(),
                c.flags,
                c.lvol,
                c.rvol,
                c.is_stereo(),
            )
        };
        debug_assert!(pos_raw >= 0 && step_raw >= 0);

        // Window of absolute samples this block touches. The `max` guards
        // the near-zero-step case where the next block's first sample would
        // otherwise look like a backwards seek.
        let wpos0 = (pos_raw >> shift) as u32;
        let wlast = ((pos_raw + step_raw * (ns as i64 - 1)) >> shift) as u32;
        let wnext = ((pos_raw + step_raw * ns as i64) >> shift) as u32;
        let mut wlen = (wlast - wpos0 + 1).max(wnext - wpos0);
        let mut wpos = wpos0;

        let len = (len_fx >> shift) as u32;
        let loop_len = (loop_fx >> shift) as u32;
        let overread = LOOP_OVERREAD >> bps;
        let overread_fx = (LOOP_OVERREAD as i64) << FX64_FRAC;

        let cacheable = loop_len != 0
            && ((loop_len as usize) << bps) < self.buffers[ch].cap()
            && len_fx + overread_fx <= MAX_U31 as i64;

        let presented;
        if loop_len == 0 {
            if wpos >= len {
                self.stop_inner(ch);
                return;
            }
            wlen = wlen.min(len - wpos) + overread;
            presented = Presented::Data;
        } else if cacheable {
            // Keep the whole loop resident at the buffer head; everything
            // before the tail will never be needed again.
            if wpos >= len - loop_len {
                self.buffers[ch].discard(len - loop_len);
            }
            while wpos >= len {
                wpos -= loop_len;
                let c = &mut self.channels[ch];
                c.pos -= Fx64::from_raw((loop_len as i64) << shift);
            }
            wlen = wlen.min(len - wpos) + overread;
            presented = Presented::Cached;
        } else {
            // Unrolled: the adapter feeds a monotonically growing sample
            // space. Once both the engine and the buffer have moved past
            // the waveform end, relabel the coordinates one or more whole
            // loop periods down.
            let buf_wpos = self.buffers[ch].wpos();
            if buf_wpos > len && wpos > len {
                let k_canonical = (wpos - len) / loop_len + 1;
                let mut k = k_canonical.min(buf_wpos / loop_len);
                if k > 0 && bps == 0 && (k * loop_len) & 1 == 1 {
                    k -= 1; // keep the byte phase of the relabel even
                }
                if k > 0 {
                    let delta = k * loop_len;
                    self.buffers[ch].discard(wpos);
                    self.buffers[ch].rebase_wpos(buf_wpos - delta);
                    let c = &mut self.channels[ch];
                    c.pos -= Fx64::from_raw((delta as i64) << shift);
                    wpos -= delta;
                }
            }
            wlen += overread;
            presented = Presented::Endless;
        }

        let (off, got) = self
            .buffers[ch]
            .get(self.mem.as_mut().expect("sample memory"), wpos, wlen);

        // Re-read the position: the loop branches may have shifted it.
        let pos_raw = self.channels[ch].pos.raw();
        let bias = pos_raw & !(MAX_U31 as i64);
        let low31 = (pos_raw - bias) as u32;

        // Bus address of the sample at (unbiased) byte position zero, so
        // that ptr + (pos >> 12) lands on the resident copy of the current
        // sample. Wraps in 32 bits by construction.
        let base = off as i64 - ((wpos as i64) << bps);
        let ptr = base.wrapping_add(bias >> FX64_FRAC) as u32;

        let (cmd_len, cmd_loop) = match presented {
            Presented::Data => {
                let end_fx = ((wpos + got) as i64) << shift;
                (((end_fx - bias).clamp(0, MAX_U31 as i64)) as u32, 0)
            }
            Presented::Cached => {
                debug_assert_eq!(bias, 0, "cached loop position fits 31 bits");
                (len_fx as u32, loop_fx as u32)
            }
            Presented::Endless => (MAX_U31, 0),
        };

        debug_assert!(step_raw <= MAX_U31 as i64);
        let record = DspChannel {
            pos: low31,
            step: step_raw as u32,
            len: cmd_len,
            loop_len: cmd_loop,
            ptr,
            flags,
        };
        cmd.settings.channels[ch] = record;

        if stereo {
            // The secondary is a shifted copy of the primary: same walk,
            // pointer advanced by one sample so it reads the right side.
            let mut sub = record;
            sub.ptr = record.ptr.wrapping_add(1 << (bps - 1));
            sub.flags = (flags & !CH_STEREO) | CH_STEREO_SUB;
            cmd.settings.channels[ch + 1] = sub;
            cmd.set_gains(ch, lvol, Fx15::ZERO);
            cmd.set_gains(ch + 1, Fx15::ZERO, rvol);
        } else {
            cmd.set_gains(ch, lvol, rvol);
        }
    }

    /// Master volume with the reset fade-out applied.
    fn effective_master(&self) -> Fx16 {
        let mut vol = self.vol;
        if let Some(started) = self.fade_start {
            let total = (RESET_FADE_SECS * self.output_rate as f32).max(1.0);
            let elapsed = (self.ticks - started) as f32;
            vol *= (1.0 - elapsed / total).clamp(0.0, 1.0);
        }
        Fx16::from_f32(vol)
    }
}
