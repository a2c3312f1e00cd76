//! Turns a picked or captured image into a bounded-size inline JPEG payload.

use std::{
    fs,
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use chatrelay_core::{EncodedImage, MAX_IMAGE_DATA_URI_LEN};
use image::{DynamicImage, codecs::jpeg::JpegEncoder, imageops::FilterType};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_MAX_WIDTH: u32 = 800;
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// A just-picked or just-captured image, before any processing.
#[derive(Debug, Clone)]
pub enum RawImage {
    Path(PathBuf),
    Encoded(Vec<u8>),
    Pixels(DynamicImage),
}

#[derive(Debug, Error)]
pub enum ImagePipelineError {
    #[error("image I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("image decode failed: {0}")]
    Decode(#[source] image::ImageError),
    #[error("JPEG encode failed: {0}")]
    Encode(#[source] image::ImageError),
    #[error("image has no pixels")]
    EmptyImage,
    #[error("encoded image needs {bytes} bytes inline, over the {max} byte limit")]
    TooLarge { bytes: usize, max: usize },
    #[error("image transform task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub max_width: u32,
    pub jpeg_quality: u8,
    /// Where the intermediate JPEG is staged. `None` uses the system temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Upper bound on the rendered data URI, so the message fits one frame.
    pub max_data_uri_len: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_WIDTH,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            temp_dir: None,
            max_data_uri_len: MAX_IMAGE_DATA_URI_LEN,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImagePipeline {
    config: PipelineConfig,
}

impl ImagePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs [`ImagePipeline::transform_blocking`] on tokio's blocking pool.
    pub async fn transform(&self, raw: RawImage) -> Result<EncodedImage, ImagePipelineError> {
        let pipeline = self.clone();
        tokio::task::spawn_blocking(move || pipeline.transform_blocking(raw))
            .await
            .map_err(|err| ImagePipelineError::TaskFailed(err.to_string()))?
    }

    /// Decode, shrink to the configured width, re-encode as JPEG.
    ///
    /// The JPEG is staged in a temporary file that is removed when this
    /// returns, on success and on failure alike.
    pub fn transform_blocking(&self, raw: RawImage) -> Result<EncodedImage, ImagePipelineError> {
        let decoded = decode(raw)?;
        let (width, height) = (decoded.width(), decoded.height());
        if width == 0 || height == 0 {
            return Err(ImagePipelineError::EmptyImage);
        }

        let (target_w, target_h) = target_dimensions(width, height, self.config.max_width);
        let resized = if (target_w, target_h) == (width, height) {
            decoded
        } else {
            decoded.resize_exact(target_w, target_h, FilterType::Triangle)
        };
        // JPEG has no alpha channel.
        let rgb = resized.to_rgb8();

        let mut staged = self.stage_file()?;
        {
            let mut writer = BufWriter::new(staged.as_file_mut());
            let mut encoder = JpegEncoder::new_with_quality(&mut writer, self.config.jpeg_quality);
            encoder
                .encode_image(&rgb)
                .map_err(ImagePipelineError::Encode)?;
            writer.flush()?;
        }
        let encoded = EncodedImage::jpeg(fs::read(staged.path())?);
        let inline_len = encoded.data_uri_len();

        debug!(
            source_width = width,
            source_height = height,
            width = target_w,
            height = target_h,
            bytes = encoded.len(),
            "image transformed"
        );
        if inline_len > self.config.max_data_uri_len {
            return Err(ImagePipelineError::TooLarge {
                bytes: inline_len,
                max: self.config.max_data_uri_len,
            });
        }
        Ok(encoded)
    }

    fn stage_file(&self) -> Result<tempfile::NamedTempFile, io::Error> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("chatrelay-").suffix(".jpg");
        match &self.config.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
    }
}

fn decode(raw: RawImage) -> Result<DynamicImage, ImagePipelineError> {
    match raw {
        RawImage::Pixels(image) => Ok(image),
        RawImage::Encoded(bytes) => {
            image::load_from_memory(&bytes).map_err(ImagePipelineError::Decode)
        }
        RawImage::Path(path) => {
            let bytes = fs::read(&path)?;
            image::load_from_memory(&bytes).map_err(ImagePipelineError::Decode)
        }
    }
}

/// Width capped at `max_width`, height scaled to keep the aspect ratio.
/// Images already narrow enough are left as they are.
pub fn target_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    let max_width = max_width.max(1);
    if width <= max_width {
        return (width, height);
    }
    let half = u64::from(width) / 2;
    let scaled = (u64::from(height) * u64::from(max_width) + half) / u64::from(width);
    let scaled = u32::try_from(scaled).unwrap_or(u32::MAX).max(1);
    (max_width, scaled)
}
