use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the ground-truth pipeline. Sample errors are fatal:
/// batch assembly never skips a bad sample, it reports it with enough
/// context to find the offending annotation.
#[derive(Debug, Error)]
pub enum CraftError {
    #[error("failed to read image {path}")]
    ImageRead {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(
        "sample {path}: all {word_boxes} word boxes ({char_boxes} char box lists) \
         fell outside the {canvas}px canvas after cropping"
    )]
    BoxesOutsideCanvas {
        path: PathBuf,
        word_boxes: usize,
        char_boxes: usize,
        canvas: u32,
    },

    #[error("failed to load manifest {path}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("configuration: {message}")]
    Config { message: String },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("failed to write artifact {path}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Session(#[from] ort::Error),
}

impl CraftError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
