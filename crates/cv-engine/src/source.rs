//! Impulse-response audio sources
//!
//! Everything the engine knows about IR audio flows through [`Readable`]:
//! random-access, per-channel sample reads from a source whose length,
//! channel count and sample rate are fixed. Sources are built once on the
//! worker thread while an engine is configured and are never touched from
//! the audio thread.
//!
//! Files are decoded eagerly into an [`AudioData`] container (WAV through
//! hound, compressed formats through symphonia); [`ChanSource`] exposes a
//! mono view of one channel and [`SrcSource`] adapts a mono source to the
//! engine sample rate.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use cv_core::{Error, Result, Sample};

/// Random-access audio source contract.
///
/// `read` fills `dst` with samples of `channel` starting at frame `pos`
/// and returns the number of samples produced (0 at end of stream).
/// Reads are synchronous and happen off the audio thread.
pub trait Readable: Send {
    fn read(&mut self, dst: &mut [Sample], pos: u64, channel: usize) -> usize;
    /// Total frames per channel.
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn channels(&self) -> usize;
    fn sample_rate(&self) -> u32;
}

/// Decoded interleaved audio held in memory.
#[derive(Debug, Clone)]
pub struct AudioData {
    samples: Vec<Sample>,
    channels: usize,
    sample_rate: u32,
}

impl AudioData {
    /// Wrap interleaved samples.
    pub fn from_interleaved(samples: Vec<Sample>, channels: usize, sample_rate: u32) -> Result<Self> {
        if channels == 0 || sample_rate == 0 {
            return Err(Error::BadParam("audio data needs channels and a rate"));
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Decode an audio file. WAV goes through hound; FLAC, MP3 and Ogg
    /// go through symphonia.
    pub fn decode_file(path: &Path) -> Result<Self> {
        let is_wav = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("wav") || e.eq_ignore_ascii_case("wave"))
            .unwrap_or(false);
        if is_wav {
            Self::decode_wav(path)
        } else {
            Self::decode_symphonia(path)
        }
    }

    fn decode_wav(path: &Path) -> Result<Self> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| Error::IrLoad(format!("{}: {}", path.display(), e)))?;
        let spec = reader.spec();
        let channels = spec.channels as usize;

        let samples: Vec<Sample> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .map(|s| s.unwrap_or(0.0))
                .collect(),
            hound::SampleFormat::Int => {
                let max_value = (1i64 << (spec.bits_per_sample - 1)) as Sample;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.unwrap_or(0) as Sample / max_value)
                    .collect()
            }
        };

        Self::from_interleaved(samples, channels, spec.sample_rate)
    }

    fn decode_symphonia(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::IrLoad(format!("{}: {}", path.display(), e)))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| Error::IrLoad(format!("unrecognized format: {}", e)))?;
        let mut format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| Error::IrLoad("no audio track".into()))?;
        let track_id = track.id;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .ok_or_else(|| Error::IrLoad("unknown channel layout".into()))?;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| Error::IrLoad("unknown sample rate".into()))?;

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::IrLoad(format!("unsupported codec: {}", e)))?;

        let mut samples = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => return Err(Error::IrLoad(format!("decode: {}", e))),
            };
            if packet.track_id() != track_id {
                continue;
            }
            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let mut buf =
                        SampleBuffer::<Sample>::new(decoded.capacity() as u64, *decoded.spec());
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
                // Recoverable decoder hiccups just skip the packet.
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(Error::IrLoad(format!("decode: {}", e))),
            }
        }

        Self::from_interleaved(samples, channels, sample_rate)
    }

    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.channels) as u64
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_channel(&self, dst: &mut [Sample], pos: u64, channel: usize) -> usize {
        if channel >= self.channels || pos >= self.frames() {
            return 0;
        }
        let n = dst.len().min((self.frames() - pos) as usize);
        let stride = self.channels;
        let base = pos as usize * stride + channel;
        for (i, d) in dst[..n].iter_mut().enumerate() {
            *d = self.samples[base + i * stride];
        }
        n
    }
}

/// Memory-backed multi-channel source.
pub struct MemSource {
    data: Arc<AudioData>,
}

impl MemSource {
    pub fn new(data: Arc<AudioData>) -> Self {
        Self { data }
    }
}

impl Readable for MemSource {
    fn read(&mut self, dst: &mut [Sample], pos: u64, channel: usize) -> usize {
        self.data.read_channel(dst, pos, channel)
    }

    fn len(&self) -> u64 {
        self.data.frames()
    }

    fn channels(&self) -> usize {
        self.data.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.data.sample_rate()
    }
}

/// Mono view of one channel of shared audio data.
pub struct ChanSource {
    data: Arc<AudioData>,
    channel: usize,
}

impl ChanSource {
    pub fn new(data: Arc<AudioData>, channel: usize) -> Result<Self> {
        if channel >= data.channels() {
            return Err(Error::BadParam("channel out of bounds"));
        }
        Ok(Self { data, channel })
    }
}

impl Readable for ChanSource {
    fn read(&mut self, dst: &mut [Sample], pos: u64, _channel: usize) -> usize {
        self.data.read_channel(dst, pos, self.channel)
    }

    fn len(&self) -> u64 {
        self.data.frames()
    }

    fn channels(&self) -> usize {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.data.sample_rate()
    }
}

/// Sample-rate-converting adapter over a mono source.
///
/// The inner source is resampled in full when the adapter is built; IR
/// loading happens off the audio thread where the one-time cost is
/// irrelevant, and random-access reads afterwards are trivial. Reports
/// `ceil(len * ratio) - 1` frames.
pub struct SrcSource {
    resampled: Vec<Sample>,
    target_rate: u32,
}

impl SrcSource {
    const CHUNK: usize = 1024;

    pub fn new(mut inner: Box<dyn Readable>, target_rate: u32) -> Result<Self> {
        let source_rate = inner.sample_rate();
        let ratio = target_rate as f64 / source_rate as f64;
        let inner_len = inner.len();
        let want = ((inner_len as f64 * ratio).ceil() as u64).saturating_sub(1) as usize;

        let mut resampler =
            FftFixedIn::<Sample>::new(source_rate as usize, target_rate as usize, Self::CHUNK, 2, 1)
                .map_err(|e| Error::IrLoad(format!("resampler: {}", e)))?;
        let delay = resampler.output_delay();

        let mut resampled = Vec::with_capacity(want + delay);
        let mut buf = vec![0.0; Self::CHUNK];
        let mut pos = 0u64;
        while resampled.len() < want + delay {
            let avail = inner_len.saturating_sub(pos).min(Self::CHUNK as u64) as usize;
            let got = if avail > 0 {
                inner.read(&mut buf[..avail], pos, 0)
            } else {
                0
            };
            buf[got..].fill(0.0);
            pos += Self::CHUNK as u64;

            let frames = resampler
                .process(&[buf.as_slice()], None)
                .map_err(|e| Error::IrLoad(format!("resampler: {}", e)))?;
            resampled.extend_from_slice(&frames[0]);
        }
        resampled.drain(..delay);
        resampled.truncate(want);

        Ok(Self {
            resampled,
            target_rate,
        })
    }
}

impl Readable for SrcSource {
    fn read(&mut self, dst: &mut [Sample], pos: u64, _channel: usize) -> usize {
        if pos >= self.resampled.len() as u64 {
            return 0;
        }
        let n = dst.len().min(self.resampled.len() - pos as usize);
        dst[..n].copy_from_slice(&self.resampled[pos as usize..pos as usize + n]);
        n
    }

    fn len(&self) -> u64 {
        self.resampled.len() as u64
    }

    fn channels(&self) -> usize {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.target_rate
    }
}
