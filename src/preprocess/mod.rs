//! Preprocessing pipeline for detector input.
//!
//! `ContrastStretch? -> Letterbox -> Normalize?`
//!
//! Every stage is a pure function over an owned copy of a frame. Only
//! malformed input fails; pixel content never does.

mod contrast;
mod letterbox;
mod tensor;

pub use contrast::{contrast_stretch, ContrastParams};
pub use letterbox::{letterbox, LetterboxMeta};
pub use tensor::{denormalize, normalize, NormalizeParams, Tensor, IMAGENET_MEAN, IMAGENET_STD};

use crate::error::Result;
use crate::frame::Frame;

/// Default detector input edge.
pub const DEFAULT_TARGET_SIZE: u32 = 640;

#[derive(Clone, Debug, PartialEq)]
pub struct PreprocessOptions {
    /// `None` skips the contrast stage.
    pub contrast: Option<ContrastParams>,
    pub target_width: u32,
    pub target_height: u32,
    /// `None` returns the letterboxed RGB frame instead of a tensor.
    pub normalize: Option<NormalizeParams>,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            contrast: Some(ContrastParams::gentle()),
            target_width: DEFAULT_TARGET_SIZE,
            target_height: DEFAULT_TARGET_SIZE,
            normalize: None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum PreprocessedOutput {
    Tensor(Tensor),
    Frame(Frame),
}

impl PreprocessedOutput {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            Self::Frame(_) => None,
        }
    }

    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            Self::Frame(frame) => Some(frame),
            Self::Tensor(_) => None,
        }
    }
}

/// Pipeline result plus the geometry needed to map detections back.
#[derive(Clone, Debug)]
pub struct Preprocessed {
    pub output: PreprocessedOutput,
    pub meta: LetterboxMeta,
}

pub fn preprocess(frame: &Frame, options: &PreprocessOptions) -> Result<Preprocessed> {
    let (boxed, meta) = match &options.contrast {
        Some(params) => {
            let stretched = contrast_stretch(frame, params)?;
            letterbox(&stretched, options.target_width, options.target_height)?
        }
        None => letterbox(frame, options.target_width, options.target_height)?,
    };

    let output = match &options.normalize {
        Some(params) => PreprocessedOutput::Tensor(normalize(&boxed, params)?),
        None => PreprocessedOutput::Frame(boxed),
    };

    Ok(Preprocessed { output, meta })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;

    #[test]
    fn default_pipeline_returns_letterboxed_frame() {
        let frame = Frame::new(vec![120u8; 64 * 32 * 3], 64, 32).unwrap();
        let out = preprocess(&frame, &PreprocessOptions::default()).unwrap();
        let boxed = out.output.as_frame().expect("frame output");
        assert_eq!(boxed.dimensions(), (640, 640));
        assert_eq!(out.meta.scale(), 10.0);
        assert_eq!(out.meta.pad_y(), 160);
    }

    #[test]
    fn normalize_stage_yields_chw_tensor() {
        let frame = Frame::new(vec![60u8; 40 * 30 * 3], 40, 30).unwrap();
        let options = PreprocessOptions {
            contrast: None,
            target_width: 32,
            target_height: 32,
            normalize: Some(NormalizeParams::default()),
        };
        let out = preprocess(&frame, &options).unwrap();
        let tensor = out.output.as_tensor().expect("tensor output");
        assert_eq!(tensor.shape(), [3, 32, 32]);
        // top padding row is black
        let expected = (0.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        assert!((tensor.get(0, 0, 0).unwrap() - expected).abs() < 1e-5);
    }

    #[test]
    fn zero_target_is_invalid() {
        let frame = Frame::black(4, 4).unwrap();
        let options = PreprocessOptions {
            target_width: 0,
            ..PreprocessOptions::default()
        };
        assert!(matches!(preprocess(&frame, &options), Err(CaptureError::InvalidInput(_))));
    }
}
