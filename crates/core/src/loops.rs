//! Loop unrolling: presents a looping waveform as an unbounded stream.
//!
//! Downstream code (the sample buffer and the engine's position arithmetic)
//! wants sample positions that grow linearly forever. [`LoopAdapter`] sits
//! between the buffer and a looping waveform and remaps each pull: positions
//! past the end wrap into the looping tail, and requests spanning the end
//! are split into a straight segment plus one or more tail replays pulled
//! with `seeking = true`.

use crate::samplebuffer::{SampleSink, Source};
use crate::waveform::SharedWaveform;
use crate::LOOP_OVERREAD;

pub(crate) struct LoopAdapter {
    wave: SharedWaveform,
    /// Waveform length in samples.
    len: u32,
    /// Looping tail length in samples (always > 0 here).
    loop_len: u32,
}

impl LoopAdapter {
    pub(crate) fn new(wave: SharedWaveform, len: u32, loop_len: u32) -> Self {
        debug_assert!(loop_len > 0 && loop_len <= len);
        LoopAdapter { wave, len, loop_len }
    }
}

impl Source for LoopAdapter {
    fn pull(&mut self, dst: &mut SampleSink<'_>, mut wpos: u32, wlen: u32, mut seeking: bool) {
        let loop_start = self.len - self.loop_len;

        if wpos >= self.len {
            wpos = (wpos - self.len) % self.loop_len + loop_start;
            if wpos == 0 {
                // whole-waveform loop wrapped to the origin: the decoder
                // must restart, not continue
                seeking = true;
            }
        }

        let len1 = wlen.min(self.len - wpos);
        let mut len2 = wlen - len1;
        // A request is bounded by the staging capacity plus the overread,
        // and unrolled loops are at least one capacity long.
        debug_assert!(
            len2 <= self.loop_len + (LOOP_OVERREAD >> dst.bps_shift()),
            "loop request spans {len2} samples past the end (loop_len {})",
            self.loop_len
        );

        if len1 > 0 {
            self.wave.borrow_mut().pull(dst, wpos, len1, seeking);
        }
        while len2 > 0 {
            let n = len2.min(self.loop_len);
            self.wave.borrow_mut().pull(dst, loop_start, n, true);
            len2 -= n;
        }
    }

    fn waveform(&self) -> &SharedWaveform {
        &self.wave
    }
}
