//! Native backend: symphonia decode + cpal output.
//!
//! One output thread owns the cpal stream at the device's default f32
//! format. Every `play` opens and probes the file synchronously (so an
//! unreadable file is reported straight away), then hands it to a decoder
//! thread that resamples and channel-adapts into the voice's ring buffer.
//! The output callback mixes all voices and retires the ones that ran dry.
//!
//! If the stream reports an error the output thread exits; the next `play`
//! or `take_idle` rebuilds it.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{AudioBackend, ChannelId};
use crate::error::BackendError;
use crate::pool::Priority;

/// Seconds of audio buffered ahead per voice.
const VOICE_BUFFER_SECS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceFormat {
    rate: u32,
    channels: u16,
}

pub struct NativeBackend {
    shared: Arc<Shared>,
    next: AtomicU64,
    output: Mutex<Option<Output>>,
    decoders: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    voices: Mutex<Vec<Arc<Voice>>>,
    idle: Mutex<Vec<ChannelId>>,
    shutdown: AtomicBool,
}

impl Shared {
    fn retire(&self, channels: &[ChannelId]) {
        self.voices.lock().retain(|v| !channels.contains(&v.channel));
        self.idle.lock().extend_from_slice(channels);
    }
}

struct Output {
    format: DeviceFormat,
    alive: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct Voice {
    channel: ChannelId,
    samples: Mutex<SampleRing>,
    /// f32 bits of the linear gain.
    gain: AtomicU32,
    /// Decoder reached end of stream (or gave up).
    decoded: AtomicBool,
    stop: AtomicBool,
}

impl Voice {
    fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    fn set_gain(&self, volume: f32) {
        self.gain.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

/// An opened, probed file ready for decoding.
struct Source {
    path: PathBuf,
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
}

impl NativeBackend {
    /// Create the backend. The output device is opened on first use.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                voices: Mutex::new(Vec::new()),
                idle: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
            }),
            next: AtomicU64::new(0),
            output: Mutex::new(None),
            decoders: Mutex::new(Vec::new()),
        }
    }

    /// Format of a running output stream, (re)starting it if needed.
    fn ensure_output(&self) -> Result<DeviceFormat, BackendError> {
        let mut output = self.output.lock();
        if let Some(o) = output.as_ref() {
            if o.alive.load(Ordering::SeqCst) {
                return Ok(o.format);
            }
        }
        if let Some(old) = output.take() {
            log::warn!("cuebox: audio output lost, reopening device");
            let _ = old.thread.join();
        }

        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::sync_channel(1);
        let shared = Arc::clone(&self.shared);
        let thread_alive = Arc::clone(&alive);
        let thread = thread::spawn(move || run_output(shared, thread_alive, tx));

        match rx.recv() {
            Ok(Ok(format)) => {
                log::info!(
                    "cuebox: audio output at {} Hz, {} channels",
                    format.rate,
                    format.channels
                );
                *output = Some(Output {
                    format,
                    alive,
                    thread,
                });
                Ok(format)
            }
            Ok(Err(reason)) => {
                let _ = thread.join();
                Err(BackendError::Device(reason))
            }
            Err(_) => {
                let _ = thread.join();
                Err(BackendError::Device("audio output thread exited".into()))
            }
        }
    }

    fn output_lost(&self) -> bool {
        self.output
            .lock()
            .as_ref()
            .is_some_and(|o| !o.alive.load(Ordering::SeqCst))
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for NativeBackend {
    fn play(&self, file: &Path, _priority: Priority, volume: f32) -> Result<ChannelId, BackendError> {
        let format = self.ensure_output()?;
        let source = open_source(file).map_err(|e| BackendError::FileUnreadable {
            path: file.to_path_buf(),
            reason: e.to_string(),
        })?;

        let channel = ChannelId(self.next.fetch_add(1, Ordering::SeqCst));
        let capacity = format.rate as usize * format.channels as usize * VOICE_BUFFER_SECS;
        let voice = Arc::new(Voice {
            channel,
            samples: Mutex::new(SampleRing::new(capacity)),
            gain: AtomicU32::new(0),
            decoded: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });
        voice.set_gain(volume);
        self.shared.voices.lock().push(Arc::clone(&voice));

        let mut decoders = self.decoders.lock();
        decoders.retain(|h| !h.is_finished());
        decoders.push(thread::spawn(move || {
            let mut source = source;
            if let Err(e) = decode_to_ring(&mut source, &voice, format) {
                log::warn!("cuebox: decode error in {}: {}", source.path.display(), e);
            }
            voice.decoded.store(true, Ordering::SeqCst);
        }));
        Ok(channel)
    }

    fn stop(&self, channel: ChannelId) {
        let mut voices = self.shared.voices.lock();
        if let Some(pos) = voices.iter().position(|v| v.channel == channel) {
            let voice = voices.remove(pos);
            voice.stop.store(true, Ordering::SeqCst);
            voice.samples.lock().clear();
        }
    }

    fn set_volume(&self, channel: ChannelId, volume: f32) {
        if let Some(voice) = self.shared.voices.lock().iter().find(|v| v.channel == channel) {
            voice.set_gain(volume);
        }
    }

    fn take_idle(&self) -> Vec<ChannelId> {
        if self.output_lost() {
            if let Err(e) = self.ensure_output() {
                // Nothing can sound; release every voice so the scheduler retries.
                log::debug!("cuebox: {}", e);
                let lost: Vec<ChannelId> = self.shared.voices.lock().iter().map(|v| v.channel).collect();
                for voice in self.shared.voices.lock().iter() {
                    voice.stop.store(true, Ordering::SeqCst);
                }
                self.shared.retire(&lost);
            }
        }
        std::mem::take(&mut *self.shared.idle.lock())
    }
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for voice in self.shared.voices.lock().drain(..) {
            voice.stop.store(true, Ordering::SeqCst);
        }
        for handle in self.decoders.lock().drain(..) {
            let _ = handle.join();
        }
        if let Some(output) = self.output.lock().take() {
            output.alive.store(false, Ordering::SeqCst);
            let _ = output.thread.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Output thread
// ---------------------------------------------------------------------------

/// Own the cpal stream until the device fails or the backend shuts down.
fn run_output(
    shared: Arc<Shared>,
    alive: Arc<AtomicBool>,
    ready: SyncSender<Result<DeviceFormat, String>>,
) {
    let (stream, format) = match build_stream(&shared, &alive) {
        Ok(built) => built,
        Err(e) => {
            alive.store(false, Ordering::SeqCst);
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    let _ = ready.send(Ok(format));

    while alive.load(Ordering::SeqCst) && !shared.shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(25));
    }
    drop(stream);
    alive.store(false, Ordering::SeqCst);
}

fn build_stream(
    shared: &Arc<Shared>,
    alive: &Arc<AtomicBool>,
) -> Result<(cpal::Stream, DeviceFormat), Box<dyn std::error::Error>> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or("no output device")?;
    let default_cfg = device.default_output_config()?;
    if default_cfg.sample_format() != cpal::SampleFormat::F32 {
        return Err(format!(
            "device does not support f32 output (got {:?})",
            default_cfg.sample_format()
        )
        .into());
    }
    let config: cpal::StreamConfig = default_cfg.into();
    let format = DeviceFormat {
        rate: config.sample_rate.0,
        channels: config.channels.max(1),
    };

    let cb_shared = Arc::clone(shared);
    let err_alive = Arc::clone(alive);
    // Sized to the largest buffer seen; the callback never allocates after that.
    let mut scratch: Vec<f32> = Vec::with_capacity(8192);
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            mix_voices(&cb_shared, data, &mut scratch)
        },
        move |err| {
            log::error!("cuebox: cpal error: {}", err);
            err_alive.store(false, Ordering::SeqCst);
        },
        None,
    )?;
    stream.play()?;
    Ok((stream, format))
}

/// Sum every voice into `data` and retire voices that have run dry.
fn mix_voices(shared: &Shared, data: &mut [f32], scratch: &mut Vec<f32>) {
    data.fill(0.0);
    scratch.resize(data.len(), 0.0);
    let mut finished = Vec::new();
    {
        let voices = shared.voices.lock();
        for voice in voices.iter() {
            let (n, drained) = {
                let mut ring = voice.samples.lock();
                let n = ring.pull(scratch);
                (n, ring.len == 0)
            };
            let gain = voice.gain();
            for (out, s) in data.iter_mut().zip(&scratch[..n]) {
                *out += s * gain;
            }
            if drained && voice.decoded.load(Ordering::SeqCst) {
                finished.push(voice.channel);
            }
        }
    }
    for s in data.iter_mut() {
        *s = s.clamp(-1.0, 1.0);
    }
    if !finished.is_empty() {
        shared.retire(&finished);
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn open_source(path: &Path) -> Result<Source, Box<dyn std::error::Error + Send + Sync>> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let reader = probed.format;
    let track = reader.default_track().ok_or("no default track")?;
    let track_id = track.id;
    let decoder = symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    Ok(Source {
        path: path.to_path_buf(),
        reader,
        decoder,
        track_id,
    })
}

/// Decode `source` into the voice's ring at the device format.
fn decode_to_ring(
    source: &mut Source,
    voice: &Voice,
    format: DeviceFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut resampler: Option<LinearResampler> = None;

    loop {
        if voice.stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        let packet = match source.reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != source.track_id {
            continue;
        }

        let decoded = match source.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                log::debug!("cuebox: skipping corrupt packet in {}: {}", source.path.display(), e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let spec = *decoded.spec();
        let src_channels = spec.channels.count().max(1) as u16;
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        let rs = resampler.get_or_insert_with(|| {
            LinearResampler::new(spec.rate, format.rate, src_channels)
        });
        let resampled = rs.process(sample_buf.samples());
        let samples = if src_channels == format.channels {
            resampled
        } else {
            let frames = resampled.len() / src_channels as usize;
            let mut out = vec![0.0f32; frames * format.channels as usize];
            adapt_channels(&resampled, src_channels, &mut out, format.channels);
            out
        };

        // Back-pressure: wait for the mixer to make room.
        let mut rest: &[f32] = &samples;
        while !rest.is_empty() {
            let pushed = voice.samples.lock().push(rest);
            rest = &rest[pushed..];
            if !rest.is_empty() {
                thread::sleep(Duration::from_millis(5));
                if voice.stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
            }
        }
    }
}

/// Ring buffer of interleaved f32 samples.
struct SampleRing {
    buf: Vec<f32>,
    read_pos: usize,
    write_pos: usize,
    len: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0.0; capacity.max(1)],
            read_pos: 0,
            write_pos: 0,
            len: 0,
        }
    }

    /// Push as much as fits. Returns the number of samples taken.
    fn push(&mut self, samples: &[f32]) -> usize {
        let n = samples.len().min(self.buf.len() - self.len);
        for &s in &samples[..n] {
            self.buf[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % self.buf.len();
        }
        self.len += n;
        n
    }

    /// Fill `out`, zero-padding past the buffered samples.
    fn pull(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.len);
        for sample in out.iter_mut().take(n) {
            *sample = self.buf[self.read_pos];
            self.read_pos = (self.read_pos + 1) % self.buf.len();
        }
        self.len -= n;
        for sample in out.iter_mut().skip(n) {
            *sample = 0.0;
        }
        n
    }

    fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.len = 0;
    }
}

/// Linear interpolation resampler for interleaved frames.
struct LinearResampler {
    ratio: f64,
    phase: f64,
    channels: usize,
}

impl LinearResampler {
    fn new(src_rate: u32, dst_rate: u32, channels: u16) -> Self {
        Self {
            ratio: dst_rate as f64 / src_rate.max(1) as f64,
            phase: 0.0,
            channels: channels.max(1) as usize,
        }
    }

    fn is_needed(&self) -> bool {
        (self.ratio - 1.0).abs() > 0.001
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if !self.is_needed() {
            return input.to_vec();
        }
        let ch = self.channels;
        let in_frames = input.len() / ch;
        if in_frames == 0 {
            return Vec::new();
        }
        let out_frames = ((in_frames as f64) * self.ratio).ceil() as usize;
        let mut output = Vec::with_capacity(out_frames * ch);

        for _ in 0..out_frames {
            let idx = self.phase as usize;
            if idx >= in_frames {
                break;
            }
            let frac = (self.phase - idx as f64) as f32;
            for c in 0..ch {
                let s0 = input[idx * ch + c];
                let s1 = if idx + 1 < in_frames {
                    input[(idx + 1) * ch + c]
                } else {
                    s0
                };
                output.push(s0 + (s1 - s0) * frac);
            }
            self.phase += 1.0 / self.ratio;
        }

        self.phase = (self.phase - in_frames as f64).max(0.0);
        output
    }
}

/// Up/down-mix interleaved frames between channel counts.
fn adapt_channels(src: &[f32], src_ch: u16, dst: &mut [f32], dst_ch: u16) {
    let src_ch = src_ch as usize;
    let dst_ch = dst_ch as usize;
    let frames = dst.len() / dst_ch;

    for f in 0..frames {
        let so = f * src_ch;
        let d = &mut dst[f * dst_ch..(f + 1) * dst_ch];
        let frame = src.get(so..so + src_ch).unwrap_or(&[]);

        if src_ch == 1 {
            d.fill(frame.first().copied().unwrap_or(0.0));
        } else if dst_ch == 1 {
            d[0] = if frame.is_empty() {
                0.0
            } else {
                frame.iter().sum::<f32>() / frame.len() as f32
            };
        } else {
            for (c, out) in d.iter_mut().enumerate() {
                *out = frame.get(c).copied().unwrap_or(0.0);
            }
        }
    }
}
