//! Per-channel staging buffer for decoded samples.
//!
//! A [`SampleBuffer`] owns a byte slice of the shared sample region and keeps
//! a window of consecutive decoded samples resident for its channel. Samples
//! are addressed by *absolute* sample index within the (possibly unrolled)
//! waveform; the buffer tracks which window is resident:
//!
//! ```text
//! absolute samples:   [ wpos .. wpos + widx )      resident content
//! region bytes:       [ off  .. off + widx<<bps )  first resident sample at `off`
//! ridx:               smallest resident offset still needed downstream
//! ```
//!
//! Content is produced on demand by a bound [`Source`] through the narrow
//! append cursor [`SampleSink`]; a producer can append — always through the
//! write-only uncached view — but can neither retain the buffer nor
//! re-enter the mixer. Two alignment rules keep the external executor's DMA
//! free of gather overhead: appends happen in 8-byte-rounded requests, and
//! the byte address phase of the first resident sample is always even.

use std::rc::Weak;

use crate::memory::{SampleMem, UncachedView, ALIGN};
use crate::waveform::{same_waveform, SharedWaveform, Waveform};

/// A bound producer driving one buffer: either a waveform directly or a
/// waveform wrapped by the loop-unrolling adapter.
pub(crate) trait Source {
    fn pull(&mut self, dst: &mut SampleSink<'_>, wpos: u32, wlen: u32, seeking: bool);
    fn waveform(&self) -> &SharedWaveform;
}

/// Pass-through source for non-looping waveforms.
pub(crate) struct DirectSource {
    wave: SharedWaveform,
}

impl DirectSource {
    pub(crate) fn new(wave: SharedWaveform) -> Self {
        DirectSource { wave }
    }
}

impl Source for DirectSource {
    fn pull(&mut self, dst: &mut SampleSink<'_>, wpos: u32, wlen: u32, seeking: bool) {
        self.wave.borrow_mut().pull(dst, wpos, wlen, seeking);
    }

    fn waveform(&self) -> &SharedWaveform {
        &self.wave
    }
}

pub(crate) struct SampleBuffer {
    /// Byte offset of this channel's slice within the sample region.
    off: usize,
    /// Slice capacity in bytes (multiple of 8).
    cap: usize,
    /// log2 of bytes per sample (frame): 0, 1 or 2.
    bps: u32,
    /// Absolute index of the first resident sample.
    wpos: u32,
    /// Number of resident samples.
    widx: u32,
    /// Smallest resident offset still needed (compaction floor).
    ridx: u32,
    source: Option<Box<dyn Source>>,
    /// Identity of the last bound waveform, kept across `stop` so replaying
    /// the same (still alive) waveform can reuse cached content.
    last: Option<Weak<std::cell::RefCell<dyn Waveform>>>,
}

impl SampleBuffer {
    pub(crate) fn new() -> Self {
        SampleBuffer {
            off: 0,
            cap: 0,
            bps: 0,
            wpos: 0,
            widx: 0,
            ridx: 0,
            source: None,
            last: None,
        }
    }

    /// Bind this buffer to `nbytes` of the region starting at byte `off`.
    ///
    /// Called on (re-)allocation of the sample region. Resident content is
    /// dropped; the producer binding survives so a playing channel re-seeks
    /// transparently.
    pub(crate) fn init(&mut self, off: usize, nbytes: usize) {
        assert!(off % ALIGN == 0 && nbytes % ALIGN == 0, "misaligned sample buffer slice");
        self.off = off;
        self.cap = nbytes;
        self.wpos = 0;
        self.widx = 0;
        self.ridx = 0;
    }

    #[inline]
    pub(crate) fn is_init(&self) -> bool {
        self.cap != 0
    }

    #[inline]
    pub(crate) fn cap(&self) -> usize {
        self.cap
    }

    #[inline]
    pub(crate) fn wpos(&self) -> u32 {
        self.wpos
    }

    #[inline]
    pub(crate) fn widx(&self) -> u32 {
        self.widx
    }

    #[inline]
    pub(crate) fn ridx(&self) -> u32 {
        self.ridx
    }

    /// Set the frame width. `bits_per_frame` covers a whole frame: 8 for
    /// mono 8-bit up to 32 for stereo 16-bit. Changing the width of a
    /// non-empty buffer is a programming error.
    pub(crate) fn set_bps(&mut self, bits_per_frame: u32) {
        assert!(self.widx == 0, "set_bps on a non-empty sample buffer");
        self.bps = match bits_per_frame {
            8 => 0,
            16 => 1,
            32 => 2,
            other => panic!("unsupported frame width: {other} bits"),
        };
    }

    pub(crate) fn bind(&mut self, source: Box<dyn Source>) {
        self.last = Some(std::rc::Rc::downgrade(source.waveform()));
        self.source = Some(source);
    }

    /// Drop the strong producer reference. The caller is then free to
    /// destroy the waveform; the weak identity marker stays so a replay of
    /// the same waveform keeps the cached samples.
    pub(crate) fn unbind(&mut self) {
        self.source = None;
    }

    #[inline]
    pub(crate) fn bound(&self) -> bool {
        self.source.is_some()
    }

    pub(crate) fn waveform_name(&self) -> Option<String> {
        self.source
            .as_ref()
            .map(|s| s.waveform().borrow().info().name.clone())
    }

    pub(crate) fn is_same_waveform(&self, wave: &SharedWaveform) -> bool {
        match &self.last {
            Some(weak) => weak
                .upgrade()
                .map(|w| same_waveform(&w, wave))
                .unwrap_or(false),
            None => false,
        }
    }

    pub(crate) fn flush(&mut self) {
        self.wpos = 0;
        self.widx = 0;
        self.ridx = 0;
    }

    /// Raise the compaction floor: samples before absolute index `wpos` are
    /// no longer needed. The floor is kept byte-phase even (the target rolls
    /// down one sample if necessary).
    pub(crate) fn discard(&mut self, wpos: u32) {
        let mut target = wpos.clamp(self.wpos, self.wpos + self.widx);
        if (target << self.bps) & 1 == 1 {
            target -= 1;
        }
        self.ridx = self.ridx.max(target - self.wpos);
    }

    /// Relabel the resident window so it starts at absolute sample
    /// `new_wpos`. Used by the engine when wrapping an unrolled loop; the
    /// shift must preserve the even byte phase.
    pub(crate) fn rebase_wpos(&mut self, new_wpos: u32) {
        debug_assert!((new_wpos << self.bps) & 1 == 0, "rebase breaks phase lock");
        self.wpos = new_wpos;
    }

    /// Make `wlen` consecutive samples resident starting at absolute sample
    /// `wpos`. Returns the region byte offset of the first requested sample
    /// and the number of samples actually resident (short only at
    /// unknown-length EOF).
    pub(crate) fn get(&mut self, mem: &mut SampleMem, wpos: u32, mut wlen: u32) -> (usize, u32) {
        debug_assert!(self.is_init(), "sample buffer used before allocation");

        if wpos < self.wpos || wpos > self.wpos + self.widx {
            // Discontinuity: drop everything and ask the producer to seek.
            // If the byte phase of the target would be odd, start one sample
            // earlier and widen the request to compensate.
            self.widx = 0;
            self.wpos = wpos;
            if (wpos << self.bps) & 1 == 1 {
                self.wpos -= 1;
            }
            self.ridx = wpos - self.wpos;
            let need = wlen + (wpos - self.wpos);
            self.pull(mem, self.wpos, self.round_request(need), true);
        } else {
            self.ridx = wpos - self.wpos;
            let reuse = self.wpos + self.widx - wpos;
            if reuse < wlen {
                let start = self.wpos + self.widx;
                self.pull(mem, start, self.round_request(wlen - reuse), false);
            }
        }

        let have = (self.wpos + self.widx).saturating_sub(wpos);
        if have < wlen {
            wlen = have; // short read: unknown-length EOF
        }

        debug_assert!(self.check_invariants());
        (self.off + (((wpos - self.wpos) as usize) << self.bps), wlen)
    }

    /// Round a sample request up so its byte size is a multiple of 8.
    #[inline]
    fn round_request(&self, wlen: u32) -> u32 {
        let bytes = (((wlen as usize) << self.bps) + ALIGN - 1) & !(ALIGN - 1);
        (bytes >> self.bps) as u32
    }

    fn pull(&mut self, mem: &mut SampleMem, wpos: u32, wlen: u32, seeking: bool) {
        let Some(mut source) = self.source.take() else {
            return; // unbound (stopped mid-drain): short read
        };
        {
            let mut sink = SampleSink { buf: self, mem };
            source.pull(&mut sink, wpos, wlen, seeking);
        }
        self.source = Some(source);
    }

    /// Reserve space for `wlen` samples at the tail, compacting if the
    /// capacity would overflow. Returns the byte range within the region.
    fn reserve(&mut self, mem: &mut SampleMem, wlen: u32) -> core::ops::Range<usize> {
        let need_end = ((self.widx + wlen) as usize) << self.bps;
        if need_end > self.cap {
            // Roll the compaction floor down to an 8-byte boundary and move
            // the kept bytes to the head. Moving by a multiple of 8 keeps
            // the 2-byte address phase intact.
            let keep_from = (((self.ridx as usize) << self.bps)) & !(ALIGN - 1);
            if keep_from > 0 {
                let widx_bytes = (self.widx as usize) << self.bps;
                mem.bytes_mut()
                    .copy_within(self.off + keep_from..self.off + widx_bytes, self.off);
                let dropped = (keep_from >> self.bps) as u32;
                self.wpos += dropped;
                self.widx -= dropped;
                self.ridx -= dropped;
            }
        }
        let start = (self.widx as usize) << self.bps;
        let end = start + ((wlen as usize) << self.bps);
        assert!(
            end <= self.cap,
            "sample buffer too small: need {} bytes, capacity {}",
            end,
            self.cap
        );
        self.widx += wlen;
        self.off + start..self.off + end
    }

    fn check_invariants(&self) -> bool {
        self.ridx <= self.widx
            && ((self.widx as usize) << self.bps) <= self.cap
            && (self.wpos << self.bps) & 1 == 0
    }
}

/// Append-only cursor handed to a producer for the duration of one pull.
pub struct SampleSink<'a> {
    buf: &'a mut SampleBuffer,
    mem: &'a mut SampleMem,
}

impl<'a> SampleSink<'a> {
    #[cfg(test)]
    pub(crate) fn for_tests(buf: &'a mut SampleBuffer, mem: &'a mut SampleMem) -> Self {
        SampleSink { buf, mem }
    }
}

impl SampleSink<'_> {
    /// log2 of bytes per sample of the buffer being filled.
    #[inline]
    pub fn bps_shift(&self) -> u32 {
        self.buf.bps
    }

    /// Reserve space for `wlen` samples and return the write view to fill.
    ///
    /// The view starts 8-byte aligned as long as the producer appends in
    /// the rounded quantities it was asked for.
    pub fn reserve(&mut self, wlen: u32) -> UncachedView<'_> {
        let range = self.buf.reserve(self.mem, wlen);
        self.mem.uncached(range)
    }

    /// Append signed 16-bit values (whole frames for stereo buffers).
    pub fn push_i16(&mut self, values: &[i16]) {
        let bytes = values.len() * 2;
        debug_assert!(bytes & ((1 << self.buf.bps) - 1) == 0, "partial frame append");
        let mut dst = self.reserve((bytes >> self.buf.bps) as u32);
        for (i, v) in values.iter().enumerate() {
            dst.write_i16(i * 2, *v);
        }
    }

    /// Append signed 8-bit values (whole frames for stereo buffers).
    pub fn push_i8(&mut self, values: &[i8]) {
        let bytes = values.len();
        debug_assert!(bytes & ((1 << self.buf.bps) - 1) == 0, "partial frame append");
        let mut dst = self.reserve((bytes >> self.buf.bps) as u32);
        for (i, v) in values.iter().enumerate() {
            dst.write_i8(i, *v);
        }
    }
}
