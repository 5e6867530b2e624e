// crates/core/src/media.rs
//! Upload validation: confirm that payloads really are decodable media
//! before anything is staged or scheduled.
//!
//! Both probes decode the whole payload, which is CPU-bound. Callers on the
//! async runtime should run them via `tokio::task::spawn_blocking`.

use std::io::Cursor;

use image::{ImageFormat, ImageReader};

use crate::error::MediaError;

const SUPPORTED_IMAGE_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Bmp,
];

/// Facts about a decoded image upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl ImageInfo {
    /// File extension used when staging this image.
    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("img")
    }
}

/// Facts about a decoded audio upload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioInfo {
    pub channels: u16,
    pub sample_rate: u32,
    pub duration_secs: f64,
}

impl AudioInfo {
    pub fn extension(&self) -> &'static str {
        "wav"
    }
}

/// Decode `bytes` as a raster image in one of the supported formats.
pub fn probe_image(bytes: &[u8]) -> Result<ImageInfo, MediaError> {
    if bytes.is_empty() {
        return Err(MediaError::EmptyImage);
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| MediaError::CorruptImage(e.to_string()))?;

    let format = match reader.format() {
        Some(f) if SUPPORTED_IMAGE_FORMATS.contains(&f) => f,
        Some(f) => return Err(MediaError::UnsupportedImage(Some(format!("{f:?}")))),
        None => return Err(MediaError::UnsupportedImage(None)),
    };

    let decoded = reader
        .decode()
        .map_err(|e| MediaError::CorruptImage(e.to_string()))?;

    Ok(ImageInfo {
        format,
        width: decoded.width(),
        height: decoded.height(),
    })
}

/// Decode `bytes` as a WAV file, reading every sample so truncated data
/// chunks are caught here rather than inside the pipeline.
pub fn probe_audio(bytes: &[u8]) -> Result<AudioInfo, MediaError> {
    if bytes.is_empty() {
        return Err(MediaError::EmptyAudio);
    }

    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| MediaError::UnsupportedAudio(e.to_string()))?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        hound::SampleFormat::Int => count_samples(reader.samples::<i32>())?,
        hound::SampleFormat::Float => count_samples(reader.samples::<f32>())?,
    };
    if samples == 0 {
        return Err(MediaError::SilentAudio);
    }

    let frames = samples / u64::from(spec.channels.max(1));
    Ok(AudioInfo {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        duration_secs: frames as f64 / f64::from(spec.sample_rate.max(1)),
    })
}

fn count_samples<S>(samples: impl Iterator<Item = hound::Result<S>>) -> Result<u64, MediaError> {
    let mut count = 0u64;
    for sample in samples {
        sample.map_err(|e| MediaError::CorruptAudio(e.to_string()))?;
        count += 1;
    }
    Ok(count)
}

/// Test fixtures shared with other crates' tests.
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb, RgbImage};

    fn encode(format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(32, 32, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 128]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).expect("encode fixture image");
        out.into_inner()
    }

    pub fn jpeg_bytes() -> Vec<u8> {
        encode(ImageFormat::Jpeg)
    }

    pub fn png_bytes() -> Vec<u8> {
        encode(ImageFormat::Png)
    }

    /// A PNG cut off halfway through its pixel data.
    pub fn truncated_png_bytes() -> Vec<u8> {
        let mut bytes = png_bytes();
        bytes.truncate(bytes.len() / 2);
        bytes
    }

    /// 0.25 seconds of a 440 Hz mono tone at 16 kHz.
    pub fn wav_bytes() -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut out = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut out, spec).expect("wav writer");
            for t in 0..4_000u32 {
                let phase = t as f32 * 440.0 * std::f32::consts::TAU / 16_000.0;
                writer
                    .write_sample((phase.sin() * 8_000.0) as i16)
                    .expect("write sample");
            }
            writer.finalize().expect("finalize wav");
        }
        out.into_inner()
    }
}
