//! Per-item transforms
//!
//! The walker treats the transform as an opaque async function from an
//! input path and its mirrored destination to the path actually written.
//! Implementations must be safe to call concurrently on distinct paths.
//!
//! Two processors ship with the crate:
//!
//! - [`CopyProcessor`] copies the item into the output mirror
//! - [`CropProcessor`] (feature `crop`) removes a band from the bottom of a
//!   screenshot, choosing a mobile or desktop profile by aspect ratio

use crate::config::{EngineConfig, ProcessorKind};
use crate::error::{ProcessingError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Result type of a per-item transform
pub type ProcessingResult<T> = std::result::Result<T, ProcessingError>;

/// Opaque per-item transform
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Transform `input`, writing next to or at `destination`
    ///
    /// `destination` is the mirrored output path of `input`; its parent
    /// directory already exists. Returns the path actually written, which
    /// may differ in extension.
    async fn process(&self, input: &Path, destination: &Path) -> ProcessingResult<PathBuf>;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Copies the item unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyProcessor;

#[async_trait]
impl ItemProcessor for CopyProcessor {
    async fn process(&self, input: &Path, destination: &Path) -> ProcessingResult<PathBuf> {
        tokio::fs::copy(input, destination)
            .await
            .map_err(|e| ProcessingError::downstream(input, e))?;
        trace!("Copied {:?} -> {:?}", input, destination);
        Ok(destination.to_path_buf())
    }

    fn name(&self) -> &str {
        "copy"
    }
}

/// Build the processor selected in the configuration
pub fn processor_for(config: &EngineConfig) -> Result<Arc<dyn ItemProcessor>> {
    match config.processor {
        ProcessorKind::Copy => Ok(Arc::new(CopyProcessor)),
        #[cfg(feature = "crop")]
        ProcessorKind::Crop => Ok(Arc::new(crop::CropProcessor::new(config.crop.clone()))),
        #[cfg(not(feature = "crop"))]
        ProcessorKind::Crop => Err(crate::error::WalkError::config(
            "the crop processor requires the `crop` feature",
        )),
    }
}

#[cfg(feature = "crop")]
pub use crop::{CropProcessor, CropProfile};

#[cfg(feature = "crop")]
mod crop {
    use super::{ItemProcessor, ProcessingResult};
    use crate::config::CropSettings;
    use crate::error::ProcessingError;
    use async_trait::async_trait;
    use image::{DynamicImage, ImageError, ImageFormat};
    use std::path::{Path, PathBuf};
    use tracing::debug;

    /// Crop profile picked from the image's aspect ratio
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CropProfile {
        /// Tall screenshot (status/navigation bar at the bottom)
        Mobile,
        /// Wide screenshot (taskbar/dock at the bottom)
        Desktop,
    }

    impl CropProfile {
        /// Profile for an image of the given size
        pub fn for_dimensions(width: u32, height: u32, settings: &CropSettings) -> Self {
            let ratio = height as f32 / width.max(1) as f32;
            if ratio > settings.mobile_aspect_ratio_threshold {
                CropProfile::Mobile
            } else {
                CropProfile::Desktop
            }
        }

        /// Fraction of the height removed from the bottom
        pub fn bottom_crop(self, settings: &CropSettings) -> f32 {
            match self {
                CropProfile::Mobile => settings.mobile_bottom_crop_percent,
                CropProfile::Desktop => settings.desktop_bottom_crop_percent,
            }
        }
    }

    /// Bottom-crops screenshots and re-encodes them
    #[derive(Debug, Clone)]
    pub struct CropProcessor {
        settings: CropSettings,
    }

    impl CropProcessor {
        /// Create a processor with the given settings
        pub fn new(settings: CropSettings) -> Self {
            Self { settings }
        }
    }

    #[async_trait]
    impl ItemProcessor for CropProcessor {
        async fn process(&self, input: &Path, destination: &Path) -> ProcessingResult<PathBuf> {
            let settings = self.settings.clone();
            let input = input.to_path_buf();
            let output = destination.with_extension(&settings.output_format);

            let task_input = input.clone();
            tokio::task::spawn_blocking(move || crop_file(&task_input, &output, &settings))
                .await
                .map_err(|e| ProcessingError::downstream(&input, e))?
        }

        fn name(&self) -> &str {
            "crop"
        }
    }

    fn crop_file(input: &Path, output: &Path, settings: &CropSettings) -> ProcessingResult<PathBuf> {
        let format = ImageFormat::from_extension(&settings.output_format)
            .ok_or_else(|| ProcessingError::Unsupported(output.to_path_buf()))?;

        let img = image::open(input).map_err(|e| match e {
            ImageError::Unsupported(_) => ProcessingError::Unsupported(input.to_path_buf()),
            ImageError::IoError(io) => ProcessingError::downstream(input, io),
            other => ProcessingError::Malformed {
                path: input.to_path_buf(),
                reason: other.to_string(),
            },
        })?;

        let (width, height) = (img.width(), img.height());
        let profile = CropProfile::for_dimensions(width, height, settings);
        let removed = (height as f32 * profile.bottom_crop(settings)).floor() as u32;
        let kept = height.saturating_sub(removed).max(1);

        let mut cropped = img.crop_imm(0, 0, width, kept);
        if format == ImageFormat::Jpeg {
            cropped = DynamicImage::ImageRgb8(cropped.to_rgb8());
        }
        cropped
            .save_with_format(output, format)
            .map_err(|e| ProcessingError::downstream(input, e))?;

        debug!(
            "Cropped {:?} ({:?}, {}x{} -> {}x{})",
            input, profile, width, height, width, kept
        );
        Ok(output.to_path_buf())
    }
}
