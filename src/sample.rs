use std::path::PathBuf;

use ndarray::{Array2, Array3, Array4};
use serde::{Deserialize, Serialize};

/// A 4-point polygon in pixel coordinates, `[[x, y]; 4]`.
///
/// Corner order matters to the Gaussian warp: callers reorder to clockwise
/// starting top-left (see [`crate::util::reorder_points`]) before rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quad(pub [[f32; 2]; 4]);

impl Quad {
    pub fn from_rect(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self([[x0, y0], [x1, y0], [x1, y1], [x0, y1]])
    }

    pub fn center(&self) -> [f32; 2] {
        let [a, b, c, d] = self.0;
        [
            (a[0] + b[0] + c[0] + d[0]) / 4.0,
            (a[1] + b[1] + c[1] + d[1]) / 4.0,
        ]
    }

    pub fn scaled(&self, factor: f32) -> Self {
        Self(self.0.map(|[x, y]| [x * factor, y * factor]))
    }
}

/// Which pool a data source belongs to. `Synthetic` sources carry no
/// character annotations; their char boxes and confidences come from a
/// model-in-the-loop estimator at fetch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Real,
    Synthetic,
}

/// One annotated training image as it appears in the dataset manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleAnnotation {
    pub image: PathBuf,
    pub word_boxes: Vec<Quad>,
    pub words: Vec<String>,
    #[serde(default)]
    pub char_boxes: Vec<Vec<Quad>>,
    #[serde(default)]
    pub confidences: Vec<f32>,
}

/// Output of the loader: the augmented image plus every box remapped into
/// the canvas frame.
#[derive(Debug)]
pub struct LoadedSample {
    /// Mean/std-normalized CHW pixels, ready for the network.
    pub image: Array3<f32>,
    pub word_boxes: Vec<Quad>,
    pub char_boxes: Vec<Vec<Quad>>,
    /// Character boxes, or one synthesized box per word where characters
    /// are unavailable. Rendered into the region heat map.
    pub region_boxes: Vec<Quad>,
    /// Boxes linking consecutive character centers within each word.
    pub affinity_boxes: Vec<Quad>,
    /// Width and height of the non-padded part of the canvas.
    pub valid_extent: (u32, u32),
}

/// One assembled training batch. Heat maps and masks are at half the
/// canvas resolution; word boxes are in half-resolution coordinates too.
/// Word-box and word-length arrays are zero-padded to the largest word
/// count in the batch.
#[derive(Debug)]
pub struct TrainBatch {
    pub image_paths: Vec<PathBuf>,
    /// `(n, 3, canvas, canvas)`
    pub images: Array4<f32>,
    /// `(n, max_words, 4, 2)`
    pub word_boxes: Array4<i32>,
    /// `(n, max_words)`; a word's length is recorded only when its char
    /// boxes are missing and still need to be split by the model.
    pub word_lengths: Array2<i32>,
    pub regions: Array3<f32>,
    pub affinities: Array3<f32>,
    pub confidences: Array3<f32>,
    pub fg_masks: Array3<f32>,
    pub bg_masks: Array3<f32>,
}

impl TrainBatch {
    pub fn len(&self) -> usize {
        self.image_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_paths.is_empty()
    }
}
