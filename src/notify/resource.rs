//! Sound resources
//!
//! Resolves resource keys to files and decodes WAV data to interleaved
//! 16-bit little-endian PCM, the format every clip plays in.

use hound::{SampleFormat as WavSampleFormat, WavReader, WavSpec};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::ClipError;

/// Shape of decoded PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Resolve a resource key to an existing file.
///
/// Keys are `file://` URLs, absolute paths, or paths relative to
/// `sounds_dir` (the working directory if unset).
pub fn resolve(key: &str, sounds_dir: Option<&Path>) -> Result<PathBuf, ClipError> {
    if key.trim().is_empty() {
        return Err(ClipError::InvalidKey(key.to_string()));
    }

    let path = if key.contains("://") {
        let url = Url::parse(key).map_err(|e| ClipError::InvalidKey(format!("{}: {}", key, e)))?;
        if url.scheme() != "file" {
            return Err(ClipError::InvalidKey(format!("unsupported scheme in {}", key)));
        }
        url.to_file_path()
            .map_err(|_| ClipError::InvalidKey(key.to_string()))?
    } else {
        let path = PathBuf::from(key);
        match sounds_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }
    };

    if !path.is_file() {
        return Err(ClipError::NotFound(path));
    }
    Ok(path)
}

fn check_spec(spec: &WavSpec) -> Result<PcmFormat, ClipError> {
    let supported = match spec.sample_format {
        WavSampleFormat::Int => matches!(spec.bits_per_sample, 8 | 16 | 24 | 32),
        WavSampleFormat::Float => spec.bits_per_sample == 32,
    };
    if !supported || spec.channels == 0 || spec.sample_rate == 0 {
        return Err(ClipError::Decode(format!(
            "unsupported WAV format: {} bit {:?}, {} ch, {} Hz",
            spec.bits_per_sample, spec.sample_format, spec.channels, spec.sample_rate
        )));
    }

    Ok(PcmFormat {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Read the header of a WAV file
pub fn probe(path: &Path) -> Result<PcmFormat, ClipError> {
    let reader = WavReader::open(path)?;
    check_spec(&reader.spec())
}

/// Decode a whole WAV file
pub fn decode_all(path: &Path) -> Result<(PcmFormat, Vec<u8>), ClipError> {
    let mut reader = PcmReader::open(path)?;
    // the header's data length is not trusted beyond what the file holds
    let file_len = std::fs::metadata(path)?.len() as usize;
    let mut pcm = Vec::with_capacity(reader.len().min(file_len).saturating_mul(2));
    while reader.next_block(usize::MAX, &mut pcm)? > 0 {}
    Ok((reader.format(), pcm))
}

/// Incremental WAV decoder producing 16-bit PCM
pub struct PcmReader {
    reader: WavReader<BufReader<File>>,
    spec: WavSpec,
    format: PcmFormat,
}

impl PcmReader {
    pub fn open(path: &Path) -> Result<Self, ClipError> {
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        let format = check_spec(&spec)?;
        Ok(Self { reader, spec, format })
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Total samples in the file, all channels
    pub fn len(&self) -> usize {
        self.reader.len() as usize
    }

    /// Decode up to `max_samples` samples, appending them to `out`.
    /// Returns the number of samples decoded, 0 at end of data.
    pub fn next_block(
        &mut self,
        max_samples: usize,
        out: &mut Vec<u8>,
    ) -> Result<usize, ClipError> {
        let mut count = 0;

        match self.spec.sample_format {
            WavSampleFormat::Float => {
                for sample in self.reader.samples::<f32>().take(max_samples) {
                    let v = (sample?.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    out.extend_from_slice(&v.to_le_bytes());
                    count += 1;
                }
            }
            WavSampleFormat::Int => {
                let bits = self.spec.bits_per_sample;
                for sample in self.reader.samples::<i32>().take(max_samples) {
                    let v = to_i16(sample?, bits);
                    out.extend_from_slice(&v.to_le_bytes());
                    count += 1;
                }
            }
        }

        Ok(count)
    }
}

fn to_i16(sample: i32, bits: u16) -> i16 {
    if bits <= 16 {
        (sample << (16 - bits)) as i16
    } else {
        (sample >> (bits - 16)) as i16
    }
}
