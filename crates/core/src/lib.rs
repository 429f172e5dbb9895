//! # dspmix-core
//!
//! Real-time multi-channel audio mixer core for resource-constrained
//! hardware with a DSP-style coprocessor (v0.3.0).
//!
//! Mixes up to 32 independently-controlled streaming waveforms — each with
//! its own sample format, playback frequency, looping semantics and
//! per-side gain — into one interleaved 16-bit stereo PCM stream at a fixed
//! output rate. Samples are pulled from opaque producers on demand, staged
//! in per-channel buffers, and resampled/mixed by an external executor that
//! is driven with one command per block.
//!
//! ## Architecture
//!
//! - [`Mixer`] — Host-owned root: configuration, per-channel operations,
//!   the poll loop, events and throttling
//! - [`Waveform`] — Pull-driven sample producer ([`PcmWaveform`] is the
//!   in-memory implementation)
//! - `SampleBuffer` — Per-channel staging window over the shared sample
//!   region, fed through the [`SampleSink`] append cursor
//! - `LoopAdapter` — Presents looping waveforms as endless streams
//! - [`DspExecutor`] — The resample-and-mix unit; [`SoftwareExecutor`] is
//!   the in-process reference implementation of the command contract
//! - [`EventCallback`] — Sample-accurate timed callbacks fired from `poll`
//!
//! ## Timing
//!
//! One *tick* is one output stereo frame. `poll` produces the requested
//! frames, slicing internally at event boundaries so callbacks observe the
//! mixer clock exactly at their trigger tick. An optional sample-budget
//! throttle caps production for A/V sync; the budget gates samples, never
//! event delivery.

mod channel;
mod config;
mod dsp;
mod engine;
mod events;
mod fixed;
mod loops;
mod memory;
mod samplebuffer;
mod waveform;

pub use config::{ChannelLimits, MixerConfig};
pub use dsp::{
    DspChannel, DspCommand, DspExecutor, DspSettings, SoftwareExecutor, CH_16BIT, CH_BPS_MASK,
    CH_STEREO, CH_STEREO_SUB, CMD_MIX, MAX_U31,
};
pub use events::{EventCallback, SharedEvent};
pub use fixed::{Fx15, Fx16, Fx64, FX15_FRAC, FX16_FRAC, FX64_FRAC};
pub use memory::{BusAddress, SampleMem, UncachedView};
pub use samplebuffer::SampleSink;
pub use waveform::{PcmWaveform, SharedWaveform, Waveform, WaveformInfo};

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace};

use channel::Channel;
use events::EventList;
use loops::LoopAdapter;
use samplebuffer::{DirectSource, SampleBuffer, Source};

/// Maximum number of mixer channels.
pub const MAX_CHANNELS: usize = 32;
/// Bytes of repeated loop-start content kept after a loop end for the
/// executor's prefetch.
pub const LOOP_OVERREAD: u32 = 64;
/// Maximum waveform length in samples.
pub const WAVEFORM_MAX: u32 = (1 << 29) - 1;
/// Sentinel length for streams of unknown length (which must not loop).
pub const LEN_UNKNOWN: u32 = WAVEFORM_MAX;
/// Provisioning granularity: buffers hold 1/8th of a second at their
/// channel's limits, and polls are sliced to the same budget.
pub const POLL_PER_SECOND: u32 = 8;
/// Maximum number of concurrently registered events.
pub const MAX_EVENTS: usize = 32;
/// Length of the reset fade-out in seconds.
pub const RESET_FADE_SECS: f32 = 0.2;

/// Host-recoverable rejections. Contract violations (bad channel index,
/// operating on a stereo secondary, odd poll length, ...) are programming
/// errors and panic instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MixerError {
    #[error("output rate must be non-zero")]
    BadOutputRate,
    #[error("channel count {0} out of range 1..={MAX_CHANNELS}")]
    BadChannelCount(usize),
    #[error("unsupported waveform format: {bits}-bit, {channels} channel(s)")]
    UnsupportedFormat { bits: u8, channels: u8 },
    #[error("waveform length {0} exceeds the maximum")]
    WaveformTooLong(u32),
    #[error("invalid loop: tail of {loop_len} samples on waveform of length {len}")]
    BadLoop { len: u32, loop_len: u32 },
    #[error("stereo waveform on channel {0} needs a free channel above it")]
    StereoAtLastChannel(usize),
}

/// The audio delivery boundary used by [`Mixer::try_play`]: a double (or
/// more) buffered DAC/DMA sink. Kept opaque — the mixer only asks for a
/// writable buffer when one is free.
pub trait AudioOut {
    /// Whether a buffer is free for writing right now.
    fn can_write(&self) -> bool;
    /// Start writing the next free buffer.
    fn write_begin(&mut self) -> &mut [i16];
    /// Commit the buffer written after `write_begin`.
    fn write_end(&mut self);
}

/// The mixer root. Owns all channels, their staging buffers, the event
/// list and the executor for its whole lifetime; dropping it releases
/// everything. All operations are non-blocking except [`Mixer::poll`],
/// which may spin on the executor.
pub struct Mixer {
    output_rate: u32,
    num_channels: usize,
    vol: f32,
    ticks: i64,
    channels: Vec<Channel>,
    buffers: Vec<SampleBuffer>,
    limits: Vec<ChannelLimits>,
    mem: Option<SampleMem>,
    events: EventList,
    throttle: Option<f32>,
    fade_start: Option<i64>,
    executor: Box<dyn DspExecutor>,
}

impl Mixer {
    /// Initialize a mixer backed by the reference software executor.
    pub fn new(config: MixerConfig) -> Result<Mixer, MixerError> {
        Mixer::with_executor(config, Box::new(SoftwareExecutor))
    }

    /// Initialize a mixer driving a host-provided executor.
    pub fn with_executor(
        config: MixerConfig,
        executor: Box<dyn DspExecutor>,
    ) -> Result<Mixer, MixerError> {
        if config.output_rate == 0 {
            return Err(MixerError::BadOutputRate);
        }
        if config.num_channels == 0 || config.num_channels > MAX_CHANNELS {
            return Err(MixerError::BadChannelCount(config.num_channels));
        }
        debug!(
            "mixer init: {} channels at {} Hz",
            config.num_channels, config.output_rate
        );
        let n = config.num_channels;
        Ok(Mixer {
            output_rate: config.output_rate,
            num_channels: n,
            vol: 1.0,
            ticks: 0,
            channels: (0..n).map(|_| Channel::default()).collect(),
            buffers: (0..n).map(|_| SampleBuffer::new()).collect(),
            limits: vec![ChannelLimits::defaults(config.output_rate); n],
            mem: None,
            events: EventList::new(),
            throttle: None,
            fade_start: None,
            executor,
        })
    }

    /// Output rate in Hz.
    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Output samples produced since initialization.
    pub fn ticks(&self) -> i64 {
        self.ticks
    }

    /// Set the master volume (attenuation in `[0, 1]`).
    pub fn set_vol(&mut self, vol: f32) {
        assert!((0.0..=1.0).contains(&vol), "master volume out of range");
        self.vol = vol;
    }

    /// Start the linear master fade-out that accompanies a host reset.
    /// Idempotent; spans [`RESET_FADE_SECS`] from the first call.
    pub fn begin_reset_fade(&mut self) {
        if self.fade_start.is_none() {
            self.fade_start = Some(self.ticks);
        }
    }

    // ─── Per-channel operations ─────────────────────────────────────────

    /// Start playing a waveform on a channel, interrupting whatever the
    /// channel was playing.
    ///
    /// A stereo waveform claims `ch` for the left side and `ch + 1` for the
    /// right; per-channel operations on `ch + 1` are then forbidden until
    /// the waveform is stopped.
    ///
    /// If the same waveform object is played again on the channel that
    /// last played it, cached samples in the staging buffer are reused;
    /// only the position rewinds.
    pub fn ch_play<W: Waveform + 'static>(
        &mut self,
        ch: usize,
        wave: &Rc<RefCell<W>>,
    ) -> Result<(), MixerError> {
        let shared: SharedWaveform = wave.clone();
        self.play_shared(ch, shared)
    }

    /// Type-erased form of [`Mixer::ch_play`].
    pub fn ch_play_shared(&mut self, ch: usize, wave: &SharedWaveform) -> Result<(), MixerError> {
        self.play_shared(ch, wave.clone())
    }

    fn play_shared(&mut self, ch: usize, wave: SharedWaveform) -> Result<(), MixerError> {
        self.check_channel_op(ch);
        let info = wave.borrow().info().clone();

        if !matches!(info.bits, 8 | 16) || !matches!(info.channels, 1 | 2) {
            return Err(MixerError::UnsupportedFormat {
                bits: info.bits,
                channels: info.channels,
            });
        }
        if info.len > WAVEFORM_MAX {
            return Err(MixerError::WaveformTooLong(info.len));
        }
        if info.loop_len != 0 && (info.len == LEN_UNKNOWN || info.loop_len > info.len) {
            return Err(MixerError::BadLoop {
                len: info.len,
                loop_len: info.loop_len,
            });
        }
        if info.channels == 2 && ch + 1 >= self.num_channels {
            return Err(MixerError::StereoAtLastChannel(ch));
        }

        let frame_bits = info.bits as u32 * info.channels as u32;
        assert!(
            frame_bits <= self.limits[ch].max_frame_bits,
            "channel {}: {}-bit frames exceed the configured limit of {} bits",
            ch,
            frame_bits,
            self.limits[ch].max_frame_bits
        );

        self.ensure_mem();

        // release a sibling claimed by a previous stereo waveform
        if self.channels[ch].is_stereo() {
            self.channels[ch + 1].flags &= !CH_STEREO_SUB;
        }

        let flags = Channel::flags_for(info.bits, info.channels);
        let bps = flags & CH_BPS_MASK;

        let same = self.buffers[ch].is_same_waveform(&wave);
        if !same {
            self.buffers[ch].flush();
            self.buffers[ch].set_bps(info.bits as u32 * info.channels as u32);
        }
        if !same || !self.buffers[ch].bound() {
            let source: Box<dyn Source> = if info.loop_len > 0 {
                Box::new(LoopAdapter::new(wave.clone(), info.len, info.loop_len))
            } else {
                Box::new(DirectSource::new(wave.clone()))
            };
            self.buffers[ch].bind(source);
        }

        if info.channels == 2 {
            if self.channels[ch + 1].active {
                self.stop_inner(ch + 1);
            }
            let sub = &mut self.channels[ch + 1];
            sub.flags = CH_STEREO_SUB;
            sub.active = false;
        }

        let shift = FX64_FRAC + bps;
        let c = &mut self.channels[ch];
        c.flags = flags;
        c.len = Fx64::from_raw((info.len as i64) << shift);
        c.loop_len = Fx64::from_raw((info.loop_len as i64) << shift);
        c.pos = Fx64::ZERO;
        c.active = true;
        trace!("ch{}: play '{}'", ch, info.name);
        self.ch_set_freq(ch, info.frequency);
        Ok(())
    }

    /// Stop playback on a channel. On return the waveform's producer
    /// reference has been released: the host may free the waveform.
    pub fn ch_stop(&mut self, ch: usize) {
        self.check_channel_op(ch);
        trace!("ch{}: stop", ch);
        self.stop_inner(ch);
    }

    pub(crate) fn stop_inner(&mut self, ch: usize) {
        if self.channels[ch].is_stereo() {
            self.channels[ch + 1].flags &= !CH_STEREO_SUB;
        }
        let c = &mut self.channels[ch];
        c.active = false;
        c.flags &= !CH_STEREO;
        self.buffers[ch].unbind();
    }

    /// Whether the channel is currently playing a waveform.
    pub fn ch_playing(&self, ch: usize) -> bool {
        self.check_channel_op(ch);
        self.channels[ch].active
    }

    /// Debug name of the waveform playing on the channel.
    pub fn ch_waveform_name(&self, ch: usize) -> Option<String> {
        self.check_channel_op(ch);
        if !self.channels[ch].active {
            return None;
        }
        self.buffers[ch].waveform_name()
    }

    /// Set channel volume as left/right attenuations in `[0, 1]`.
    pub fn ch_set_vol(&mut self, ch: usize, lvol: f32, rvol: f32) {
        self.check_channel_op(ch);
        self.channels[ch].set_vol(lvol, rvol);
    }

    /// Set channel volume as a central volume plus a panning position
    /// (0 = left, 0.5 = center, 1 = right).
    pub fn ch_set_vol_pan(&mut self, ch: usize, vol: f32, pan: f32) {
        self.check_channel_op(ch);
        self.channels[ch].set_vol_pan(vol, pan);
    }

    /// Set channel volume with Dolby Pro Logic II matrix encoding from
    /// five speaker volumes (front left/right, center, surround
    /// left/right).
    pub fn ch_set_vol_dolby(&mut self, ch: usize, fl: f32, fr: f32, c: f32, sl: f32, sr: f32) {
        self.check_channel_op(ch);
        self.channels[ch].set_vol_dolby(fl, fr, c, sl, sr);
    }

    /// Override the playback frequency of a channel. Must be called after
    /// `ch_play` (playing a waveform resets the frequency to its nominal
    /// rate).
    pub fn ch_set_freq(&mut self, ch: usize, frequency: f32) {
        self.check_channel_op(ch);
        assert!(frequency >= 0.0, "negative playback frequency");
        assert!(
            frequency <= self.limits[ch].max_frequency * config::FREQ_TOLERANCE,
            "channel {} frequency {} Hz above configured limit {}",
            ch,
            frequency,
            self.limits[ch].max_frequency
        );
        let c = &mut self.channels[ch];
        let step = Fx64::from_f64(frequency as f64 / self.output_rate as f64);
        c.step = Fx64::from_raw(step.raw() << c.bps_shift());
    }

    /// Seek the channel to a position in samples (fractional values keep
    /// resampling phase). Must be called after `ch_play`.
    pub fn ch_set_pos(&mut self, ch: usize, pos: f64) {
        self.check_channel_op(ch);
        assert!(pos >= 0.0, "negative playback position");
        let c = &mut self.channels[ch];
        let fx = Fx64::from_f64(pos);
        c.pos = Fx64::from_raw(fx.raw() << c.bps_shift());
    }

    /// Current playback position in samples (fractional).
    pub fn ch_get_pos(&self, ch: usize) -> f64 {
        self.check_channel_op(ch);
        let c = &self.channels[ch];
        Fx64::from_raw(c.pos.raw() >> c.bps_shift()).to_f64()
    }

    /// Declare what the channel will ever be asked to play, shrinking its
    /// staging buffer accordingly. `max_bits` bounds the frame width in
    /// bits — sample width times interleaved channels, so mono 8-bit is 8
    /// and stereo 16-bit is 32. Zero values reset the respective limit to
    /// its default (32-bit frames, the output rate, no hard cap).
    ///
    /// Changing limits releases the sample region; it is reallocated on
    /// the next play or poll, and playing channels re-seek transparently.
    pub fn ch_set_limits(&mut self, ch: usize, max_bits: u32, max_frequency: f32, max_buf_sz: u32) {
        self.check_channel_op(ch);
        assert!(matches!(max_bits, 0 | 8 | 16 | 32), "unsupported frame width");
        let d = ChannelLimits::defaults(self.output_rate);
        self.limits[ch] = ChannelLimits {
            max_frame_bits: if max_bits == 0 { d.max_frame_bits } else { max_bits },
            max_frequency: if max_frequency == 0.0 { d.max_frequency } else { max_frequency },
            max_buf_bytes: if max_buf_sz == 0 { None } else { Some(max_buf_sz) },
        };
        debug!("ch{}: limits changed, sample memory released", ch);
        self.mem = None;
        for buf in &mut self.buffers {
            buf.flush();
        }
    }

    // ─── Throttling ─────────────────────────────────────────────────────

    /// Add `num_samples` to the production budget. While a budget is set,
    /// `poll` delivers at most the budget (plus one poll-slice of slack)
    /// and zero-fills the rest, keeping audio in lockstep with an external
    /// clock such as video frames.
    pub fn throttle(&mut self, num_samples: f32) {
        assert!(num_samples >= 0.0, "negative throttle budget");
        let allowance = self.throttle.unwrap_or(0.0) + num_samples;
        trace!("throttle: allowance {}", allowance);
        self.throttle = Some(allowance);
    }

    /// Remove the production budget.
    pub fn unthrottle(&mut self) {
        self.throttle = None;
    }

    // ─── Events ─────────────────────────────────────────────────────────

    /// Register a callback to fire `delay` output samples from now.
    pub fn add_event<C: EventCallback + 'static>(&mut self, delay: i64, cb: Rc<RefCell<C>>) {
        assert!(delay >= 0, "event delay must be non-negative");
        let shared: SharedEvent = cb;
        self.events.add(self.ticks + delay, shared);
    }

    /// Deregister a callback by identity. The event must be registered
    /// (a callback may also deregister itself by returning `None`).
    pub fn remove_event<C: EventCallback + 'static>(&mut self, cb: &Rc<RefCell<C>>) {
        let shared: SharedEvent = cb.clone();
        self.events.remove(&shared);
    }

    fn fire_due_events(&mut self) {
        while let Some(ev) = self.events.pop_due(self.ticks) {
            let delay = ev.cb.borrow_mut().fire();
            if let Some(delay) = delay {
                self.events.add(self.ticks + delay.get() as i64, ev.cb);
            }
        }
    }

    // ─── Mixing ─────────────────────────────────────────────────────────

    /// Produce `out.len() / 2` stereo frames of mixed audio.
    ///
    /// The frame count must be even (the delivery hardware consumes sample
    /// pairs). Event callbacks due within the polled span run synchronously
    /// at their exact tick. Under throttling, production beyond the budget
    /// is zero-filled.
    pub fn poll(&mut self, out: &mut [i16]) {
        assert!(out.len() % 4 == 0, "poll requires an even number of stereo frames");
        let mut frames = out.len() / 2;
        if frames == 0 {
            return;
        }

        if let Some(allowance) = self.throttle {
            let extra = (self.output_rate / POLL_PER_SECOND) as f32;
            let budget = (allowance + extra).max(0.0) as usize;
            let granted = frames.min(budget);
            out[granted * 2..].fill(0);
            self.throttle = Some(allowance - granted as f32);
            frames = granted;
        }

        let slice_max = (self.output_rate / POLL_PER_SECOND).max(1) as usize;
        let mut off = 0;
        loop {
            // due events fire even when throttled to zero samples
            self.fire_due_events();
            if frames == 0 {
                break;
            }
            let mut ns = frames.min(slice_max).min(0xFFFF);
            if let Some(t) = self.events.next_ticks() {
                ns = ns.min((t - self.ticks) as usize);
            }
            self.exec(&mut out[off..off + ns * 2], ns);
            off += ns * 2;
            frames -= ns;
        }
    }

    /// Poll into the audio output if it has a free buffer.
    ///
    /// Call this repeatedly during a frame (after rendering, between game
    /// objects, ...); not calling it often enough causes stutter.
    pub fn try_play(&mut self, out: &mut dyn AudioOut) {
        if out.can_write() {
            let buf = out.write_begin();
            self.poll(buf);
            out.write_end();
        }
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn check_channel(&self, ch: usize) {
        assert!(
            ch < self.num_channels,
            "channel index {} out of range (mixer has {})",
            ch,
            self.num_channels
        );
    }

    fn check_channel_op(&self, ch: usize) {
        self.check_channel(ch);
        assert!(
            !self.channels[ch].is_secondary(),
            "channel {} belongs to the stereo waveform on channel {}",
            ch,
            ch.wrapping_sub(1)
        );
    }

    /// Lazily allocate the sample region and carve it into per-channel
    /// slices according to the configured limits.
    fn ensure_mem(&mut self) {
        if self.mem.is_some() {
            return;
        }
        let mut offset = memory::ALIGN; // guard: bus address 0 stays unused
        let mut slices = Vec::with_capacity(self.num_channels);
        for limit in &self.limits {
            let size = limit.buffer_size();
            slices.push((offset, size));
            offset += size;
        }
        debug!(
            "allocating {} bytes of sample memory across {} channels",
            offset, self.num_channels
        );
        self.mem = Some(SampleMem::new(offset));
        for (buf, (off, size)) in self.buffers.iter_mut().zip(&slices) {
            buf.init(*off, *size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU64;

    fn mixer(rate: u32, channels: usize) -> Mixer {
        Mixer::new(MixerConfig::new(rate, channels)).unwrap()
    }

    fn left(out: &[i16]) -> Vec<i16> {
        out.iter().step_by(2).copied().collect()
    }

    fn right(out: &[i16]) -> Vec<i16> {
        out.iter().skip(1).step_by(2).copied().collect()
    }

    /// Unknown-length stream: produces `total` constant samples, then dries up.
    struct Stream {
        info: WaveformInfo,
        produced: u32,
        total: u32,
    }

    impl Stream {
        fn shared(rate: f32, total: u32) -> Rc<RefCell<Stream>> {
            Rc::new(RefCell::new(Stream {
                info: WaveformInfo {
                    name: "stream".into(),
                    bits: 16,
                    channels: 1,
                    frequency: rate,
                    len: LEN_UNKNOWN,
                    loop_len: 0,
                },
                produced: 0,
                total,
            }))
        }
    }

    impl Waveform for Stream {
        fn info(&self) -> &WaveformInfo {
            &self.info
        }

        fn pull(&mut self, dst: &mut SampleSink<'_>, _wpos: u32, wlen: u32, _seeking: bool) {
            let n = wlen.min(self.total - self.produced);
            let data = vec![500i16; n as usize];
            dst.push_i16(&data);
            self.produced += n;
        }
    }

    /// Waveform with arbitrary metadata, for validation tests.
    struct Fake {
        info: WaveformInfo,
    }

    impl Fake {
        fn shared(bits: u8, channels: u8, len: u32, loop_len: u32) -> Rc<RefCell<Fake>> {
            Rc::new(RefCell::new(Fake {
                info: WaveformInfo {
                    name: "fake".into(),
                    bits,
                    channels,
                    frequency: 1000.0,
                    len,
                    loop_len,
                },
            }))
        }
    }

    impl Waveform for Fake {
        fn info(&self) -> &WaveformInfo {
            &self.info
        }

        fn pull(&mut self, _dst: &mut SampleSink<'_>, _wpos: u32, _wlen: u32, _seeking: bool) {}
    }

    // ─── Playback scenarios ─────────────────────────────────────────────

    #[test]
    fn mono8_passthrough() {
        let mut mx = mixer(32000, 1);
        let wave =
            PcmWaveform::mono8("a", 32000.0, vec![10, 20, 30, 40, 50, 60, 70, 80], 0).shared();
        mx.ch_set_vol(0, 1.0, 0.0);
        mx.ch_play(0, &wave).unwrap();
        let mut out = [0i16; 16];
        mx.poll(&mut out);
        let expected: Vec<i16> = [10, 20, 30, 40, 50, 60, 70, 80]
            .iter()
            .map(|&s| (s as i16) << 8)
            .collect();
        assert_eq!(left(&out), expected);
        assert_eq!(right(&out), vec![0i16; 8]);
        assert_eq!(mx.ticks(), 8);
    }

    #[test]
    fn resample_up_by_two() {
        let mut mx = mixer(32000, 1);
        let wave =
            PcmWaveform::mono8("b", 16000.0, vec![10, 20, 30, 40, 50, 60, 70, 80], 0).shared();
        mx.ch_set_vol(0, 1.0, 0.0);
        mx.ch_play(0, &wave).unwrap();
        let mut out = [0i16; 32];
        mx.poll(&mut out);
        let expected: Vec<i16> = [10, 10, 20, 20, 30, 30, 40, 40, 50, 50, 60, 60, 70, 70, 80, 80]
            .iter()
            .map(|&s| (s as i16) << 8)
            .collect();
        assert_eq!(left(&out), expected);
    }

    #[test]
    fn cacheable_loop_repeats_forever() {
        let mut mx = mixer(32000, 1);
        let wave = PcmWaveform::mono16("c", 32000.0, vec![1, 2, 3, 4], 4).shared();
        mx.ch_set_vol(0, 1.0, 0.0);
        mx.ch_play(0, &wave).unwrap();
        let mut out = [0i16; 24];
        mx.poll(&mut out);
        assert_eq!(left(&out), [1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4]);
        assert_eq!(mx.ticks(), 12);
        // loops forever: ticks advance monotonically and playback continues
        let mut out = [0i16; 24];
        mx.poll(&mut out);
        assert_eq!(left(&out), [1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4]);
        assert_eq!(mx.ticks(), 24);
        assert!(mx.ch_playing(0));
    }

    #[test]
    fn unrollable_loop_matches_cacheable_output() {
        // 160 Hz output: the staging buffer holds 152 bytes, a 100-sample
        // 16-bit loop (200 bytes) cannot be cached and must unroll
        let mut mx = mixer(160, 1);
        let pattern: Vec<i16> = (0..100).map(|i| [1, 2, 3, 4][i % 4]).collect();
        let wave = PcmWaveform::mono16("d", 160.0, pattern, 100).shared();
        mx.ch_set_vol(0, 1.0, 0.0);
        mx.ch_play(0, &wave).unwrap();
        for _ in 0..3 {
            let mut out = [0i16; 160]; // 80 frames
            mx.poll(&mut out);
            let l = left(&out);
            for (i, &v) in l.iter().enumerate() {
                assert_eq!(v, [1, 2, 3, 4][i % 4], "frame {i}");
            }
        }
        assert_eq!(mx.ticks(), 240);
        assert!(mx.ch_playing(0));
    }

    #[test]
    fn event_fires_at_exact_tick() {
        let mut mx = mixer(32000, 1);
        let count = Rc::new(RefCell::new(0u32));
        let c = count.clone();
        let cb = Rc::new(RefCell::new(move || -> Option<NonZeroU64> {
            *c.borrow_mut() += 1;
            None
        }));
        mx.add_event(5, cb);
        let mut out = [0i16; 8]; // 4 frames: tick 5 not reached
        mx.poll(&mut out);
        assert_eq!(*count.borrow(), 0);
        let mut out = [0i16; 4]; // 2 frames: crosses tick 5
        mx.poll(&mut out);
        assert_eq!(*count.borrow(), 1);
        let mut out = [0i16; 16]; // deregistered: never fires again
        mx.poll(&mut out);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn event_reschedules_by_returned_delta() {
        let mut mx = mixer(32000, 1);
        let count = Rc::new(RefCell::new(0u32));
        let c = count.clone();
        let cb = Rc::new(RefCell::new(move || -> Option<NonZeroU64> {
            *c.borrow_mut() += 1;
            if *c.borrow() == 1 {
                NonZeroU64::new(3) // fire again at +8
            } else {
                None
            }
        }));
        mx.add_event(5, cb);
        let mut out = [0i16; 20]; // 10 frames: fires at 5 and at 8
        mx.poll(&mut out);
        assert_eq!(*count.borrow(), 2);
        let mut out = [0i16; 16];
        mx.poll(&mut out);
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn removed_event_never_fires() {
        let mut mx = mixer(32000, 1);
        let count = Rc::new(RefCell::new(0u32));
        let c = count.clone();
        let cb = Rc::new(RefCell::new(move || -> Option<NonZeroU64> {
            *c.borrow_mut() += 1;
            None
        }));
        mx.add_event(4, cb.clone());
        mx.remove_event(&cb);
        let mut out = [0i16; 16];
        mx.poll(&mut out);
        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn throttle_zero_fills_past_budget() {
        let mut mx = mixer(32, 1);
        let wave = PcmWaveform::mono8("f", 32.0, vec![100; 64], 0).shared();
        mx.ch_set_vol(0, 1.0, 0.0);
        mx.ch_play(0, &wave).unwrap();
        mx.throttle(4.0);
        let mut out = [0i16; 32]; // 16 frames, budget 4 + 32/8 slack = 8
        mx.poll(&mut out);
        let l = left(&out);
        assert_eq!(&l[..8], &[100i16 << 8; 8]);
        assert_eq!(&l[8..], &[0i16; 8]);
        assert_eq!(mx.ticks(), 8, "clamped frames do not advance time");
        // exhausted budget: nothing more comes out
        let mut out = [0x11i16; 32];
        mx.poll(&mut out);
        assert_eq!(out, [0i16; 32]);
        // unthrottle restores free-running playback
        mx.unthrottle();
        let mut out = [0i16; 32];
        mx.poll(&mut out);
        assert_eq!(left(&out)[..8], [100i16 << 8; 8]);
    }

    #[test]
    fn throttling_does_not_starve_events() {
        let mut mx = mixer(8, 1);
        let count = Rc::new(RefCell::new(0u32));
        let c = count.clone();
        let cb = Rc::new(RefCell::new(move || -> Option<NonZeroU64> {
            *c.borrow_mut() += 1;
            None
        }));
        mx.throttle(0.0);
        let mut out = [0i16; 4]; // 2 frames; slack allows 1
        mx.poll(&mut out);
        assert_eq!(mx.ticks(), 1);
        // budget is now negative: zero frames granted, events still fire
        mx.add_event(0, cb);
        let mut out = [0i16; 4];
        mx.poll(&mut out);
        assert_eq!(mx.ticks(), 1);
        assert_eq!(*count.borrow(), 1);
    }

    // ─── Round trips and boundaries ─────────────────────────────────────

    #[test]
    fn poll_zero_samples_is_noop() {
        let mut mx = mixer(32000, 1);
        mx.poll(&mut []);
        assert_eq!(mx.ticks(), 0);
    }

    #[test]
    fn position_round_trips_within_quantization() {
        let mut mx = mixer(32000, 1);
        let wave = PcmWaveform::mono16("p", 32000.0, vec![0; 64], 0).shared();
        mx.ch_play(0, &wave).unwrap();
        for pos in [0.0, 1.0, 12.34, 63.999] {
            mx.ch_set_pos(0, pos);
            assert!((mx.ch_get_pos(0) - pos).abs() < 1.0 / 4096.0, "pos {pos}");
        }
    }

    #[test]
    fn replay_of_same_waveform_reuses_cached_samples() {
        let mut mx = mixer(32000, 1);
        let data: Vec<i16> = (1..=32).collect();
        let wave = PcmWaveform::mono16("w", 32000.0, data, 0).shared();
        mx.ch_set_vol(0, 1.0, 1.0);
        mx.ch_play(0, &wave).unwrap();
        let mut out = [0i16; 16];
        mx.poll(&mut out);
        let cached = mx.buffers[0].widx();
        assert!(cached > 0);

        mx.ch_stop(0);
        assert!(!mx.ch_playing(0));
        // producer reference released: the host holds the only strong ref
        assert_eq!(Rc::strong_count(&wave), 1);
        assert_eq!(mx.buffers[0].widx(), cached, "stop keeps cached samples");

        mx.ch_play(0, &wave).unwrap();
        assert_eq!(mx.buffers[0].widx(), cached, "replay reuses the cache");
        assert_eq!(mx.ch_get_pos(0), 0.0, "only the position rewinds");

        // a different waveform flushes the buffer
        let other = PcmWaveform::mono16("o", 32000.0, vec![9; 8], 0).shared();
        mx.ch_play(0, &other).unwrap();
        assert_eq!(mx.buffers[0].widx(), 0);
    }

    #[test]
    fn constant_input_scales_by_gain_and_master() {
        let mut mx = mixer(32000, 1);
        let wave = PcmWaveform::mono16("k", 32000.0, vec![1000; 16], 0).shared();
        mx.ch_set_vol(0, 0.5, 0.25);
        mx.set_vol(0.5);
        mx.ch_play(0, &wave).unwrap();
        let mut out = [0i16; 8];
        mx.poll(&mut out);
        // 1000 * 0.5 * 0.5 = 250 and 1000 * 0.25 * 0.5 = 125, within one
        // LSB of the Q1.15 x Q0.16 pipeline (exact with the reference
        // executor's rounding)
        assert_eq!(left(&out), [250; 4]);
        assert_eq!(right(&out), [125; 4]);
    }

    #[test]
    fn unknown_length_stream_drains_to_silence() {
        let mut mx = mixer(32000, 1);
        let wave = Stream::shared(32000.0, 6);
        mx.ch_set_vol(0, 1.0, 0.0);
        mx.ch_play(0, &wave).unwrap();
        let mut out = [0i16; 16];
        mx.poll(&mut out);
        let l = left(&out);
        assert_eq!(&l[..6], &[500i16; 6]);
        assert_eq!(&l[6..], &[0i16; 2]);
        // EOF of an unknown-length stream is not a stop
        assert!(mx.ch_playing(0));
        let mut out = [0x33i16; 16];
        mx.poll(&mut out);
        assert_eq!(out, [0i16; 16]);
    }

    #[test]
    fn stereo_waveform_occupies_two_channels() {
        let mut mx = mixer(32000, 2);
        let frames = vec![7, -9, 11, -13, 15, -17, 19, -21];
        let wave = PcmWaveform::stereo16("st", 32000.0, frames.clone(), 0).shared();
        mx.ch_set_vol(0, 1.0, 1.0);
        mx.ch_play(0, &wave).unwrap();
        let mut out = [0i16; 8];
        mx.poll(&mut out);
        assert_eq!(out.to_vec(), frames);

        // stopping the pair frees the secondary for normal use again
        mx.ch_stop(0);
        mx.ch_set_vol(1, 1.0, 1.0);
    }

    #[test]
    fn stereo_fills_a_full_block_within_default_limits() {
        // a whole poll slice (output_rate / POLL_PER_SECOND frames) of
        // 4-byte stereo frames must fit the default provisioning
        let mut mx = mixer(800, 2);
        let data: Vec<i16> = (0..300i16).flat_map(|i| [i, -i]).collect();
        let wave = PcmWaveform::stereo16("wide", 800.0, data, 0).shared();
        mx.ch_set_vol(0, 1.0, 1.0);
        mx.ch_play(0, &wave).unwrap();
        let mut out = [0i16; 400]; // 200 frames, two full 100-frame slices
        mx.poll(&mut out);
        for i in 0..200 {
            assert_eq!(out[i * 2], i as i16, "left of frame {i}");
            assert_eq!(out[i * 2 + 1], -(i as i16), "right of frame {i}");
        }
    }

    #[test]
    #[should_panic(expected = "belongs to the stereo waveform")]
    fn operations_on_stereo_secondary_are_refused() {
        let mut mx = mixer(32000, 2);
        let wave = PcmWaveform::stereo16("st", 32000.0, vec![1, 2, 3, 4], 0).shared();
        mx.ch_play(0, &wave).unwrap();
        mx.ch_set_vol(1, 1.0, 1.0);
    }

    #[test]
    fn reset_fade_silences_across_fade_window() {
        // 40 Hz output: the 0.2 s fade spans 8 ticks, polled in 5-tick slices
        let mut mx = mixer(40, 1);
        let wave = PcmWaveform::mono16("r", 40.0, vec![1000; 64], 0).shared();
        mx.ch_set_vol(0, 1.0, 0.0);
        mx.ch_play(0, &wave).unwrap();
        mx.begin_reset_fade();
        let mut out = [0i16; 32]; // 16 frames
        mx.poll(&mut out);
        let l = left(&out);
        assert_eq!(l[0], 1000, "fade starts at full volume");
        assert!(l[5] > 0 && l[5] < 1000, "mid-fade block is attenuated");
        assert_eq!(&l[10..], &[0i16; 6], "silent after the fade window");
    }

    #[test]
    fn limit_change_reallocates_and_playback_recovers() {
        let mut mx = mixer(32000, 1);
        let wave = PcmWaveform::mono16("l", 32000.0, vec![7; 64], 0).shared();
        mx.ch_set_vol(0, 1.0, 0.0);
        mx.ch_play(0, &wave).unwrap();
        let mut out = [0i16; 16];
        mx.poll(&mut out);
        assert_eq!(left(&out), [7i16; 8]);

        mx.ch_set_limits(0, 16, 0.0, 0);
        assert!(mx.mem.is_none(), "limit change releases the region");
        let mut out = [0i16; 16];
        mx.poll(&mut out);
        assert_eq!(left(&out), [7i16; 8], "playback re-seeks transparently");
    }

    #[test]
    fn try_play_fills_a_free_buffer_once() {
        struct OneShot {
            buf: Vec<i16>,
            free: bool,
            committed: u32,
        }
        impl AudioOut for OneShot {
            fn can_write(&self) -> bool {
                self.free
            }
            fn write_begin(&mut self) -> &mut [i16] {
                &mut self.buf
            }
            fn write_end(&mut self) {
                self.free = false;
                self.committed += 1;
            }
        }

        let mut mx = mixer(32000, 1);
        let wave = PcmWaveform::mono16("t", 32000.0, vec![123; 64], 0).shared();
        mx.ch_set_vol(0, 1.0, 0.0);
        mx.ch_play(0, &wave).unwrap();
        let mut out = OneShot { buf: vec![0; 16], free: true, committed: 0 };
        mx.try_play(&mut out);
        assert_eq!(out.committed, 1);
        assert_eq!(out.buf[0], 123);
        mx.try_play(&mut out); // no free buffer: nothing happens
        assert_eq!(out.committed, 1);
        assert_eq!(mx.ticks(), 8);
    }

    #[test]
    fn waveform_name_follows_playback() {
        let mut mx = mixer(32000, 1);
        let wave = PcmWaveform::mono16("melody", 32000.0, vec![0; 8], 0).shared();
        assert_eq!(mx.ch_waveform_name(0), None);
        mx.ch_play(0, &wave).unwrap();
        assert_eq!(mx.ch_waveform_name(0).as_deref(), Some("melody"));
        mx.ch_stop(0);
        assert_eq!(mx.ch_waveform_name(0), None);
    }

    // ─── Rejections and contract violations ─────────────────────────────

    #[test]
    fn init_rejects_bad_configuration() {
        assert_eq!(
            Mixer::new(MixerConfig::new(0, 4)).err(),
            Some(MixerError::BadOutputRate)
        );
        assert_eq!(
            Mixer::new(MixerConfig::new(32000, 0)).err(),
            Some(MixerError::BadChannelCount(0))
        );
        assert_eq!(
            Mixer::new(MixerConfig::new(32000, MAX_CHANNELS + 1)).err(),
            Some(MixerError::BadChannelCount(MAX_CHANNELS + 1))
        );
    }

    #[test]
    fn play_rejects_malformed_waveforms() {
        let mut mx = mixer(32000, 1);
        assert!(matches!(
            mx.ch_play(0, &Fake::shared(12, 1, 8, 0)),
            Err(MixerError::UnsupportedFormat { bits: 12, .. })
        ));
        assert!(matches!(
            mx.ch_play(0, &Fake::shared(16, 3, 8, 0)),
            Err(MixerError::UnsupportedFormat { channels: 3, .. })
        ));
        assert!(matches!(
            mx.ch_play(0, &Fake::shared(16, 1, LEN_UNKNOWN, 4)),
            Err(MixerError::BadLoop { .. })
        ));
        assert!(matches!(
            mx.ch_play(0, &Fake::shared(16, 1, 8, 9)),
            Err(MixerError::BadLoop { .. })
        ));
        // stereo needs a second channel above
        assert!(matches!(
            mx.ch_play(0, &Fake::shared(16, 2, 8, 0)),
            Err(MixerError::StereoAtLastChannel(0))
        ));
        assert!(!mx.ch_playing(0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn bad_channel_index_asserts() {
        let mut mx = mixer(32000, 2);
        mx.ch_set_vol(5, 1.0, 1.0);
    }

    #[test]
    #[should_panic(expected = "even number of stereo frames")]
    fn odd_poll_length_asserts() {
        let mut mx = mixer(32000, 1);
        let mut out = [0i16; 2];
        mx.poll(&mut out);
    }

    #[test]
    #[should_panic(expected = "above configured limit")]
    fn frequency_above_limit_asserts() {
        let mut mx = mixer(32000, 1);
        let wave = PcmWaveform::mono16("q", 32000.0, vec![0; 8], 0).shared();
        mx.ch_play(0, &wave).unwrap();
        mx.ch_set_freq(0, 80000.0);
    }

    #[test]
    #[should_panic(expected = "exceed the configured limit")]
    fn frame_width_above_limit_asserts() {
        let mut mx = mixer(32000, 2);
        mx.ch_set_limits(0, 16, 0.0, 0); // mono-width frames only
        let wave = PcmWaveform::stereo16("wide", 32000.0, vec![1, 2, 3, 4], 0).shared();
        let _ = mx.ch_play(0, &wave);
    }
}
