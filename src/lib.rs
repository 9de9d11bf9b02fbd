use ndarray::{stack, Array2, Array3, Array4, Axis};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::instrument;

mod dataset;
mod error;
pub mod gaussian;
pub mod loader;
pub mod loss;
mod mask;
pub mod model;
mod sample;
mod util;
pub mod visualize;

pub use dataset::{normalize, Manifest};
pub use error::CraftError;
pub use gaussian::GaussianGenerator;
pub use loader::{load_sample, CropTransform};
pub use loss::{CraftLoss, LossKind, LossOutput};
pub use mask::{build_masks, MaskSet};
pub use model::{CharBoxEstimator, CraftNet, ExecutionProvider, Heatmaps, DEFAULT_PROVIDERS};
pub use sample::{LoadedSample, Quad, SampleAnnotation, SourceKind, TrainBatch};
pub use util::reorder_points;

pub use ort as runtime;

const BASE_MIN_CROP_RATIO: f32 = 0.05;
const BASE_MAX_CROP_RATIO: f32 = 0.2; // 0.2 * 5 == 1
const CROP_SCHEDULE_STEPS: usize = 5;

pub struct GeneratorBuilder {
    canvas_size: u32,
    total_iterations: usize,
    sources: Vec<(SourceKind, Vec<SampleAnnotation>, f32)>,
    estimator: Option<Box<dyn CharBoxEstimator>>,
    seed: Option<u64>,
}

impl GeneratorBuilder {
    pub fn new(canvas_size: u32, total_iterations: usize) -> Self {
        Self {
            canvas_size,
            total_iterations,
            sources: Vec::new(),
            estimator: None,
            seed: None,
        }
    }

    /// Adds a data source with its sampling weight. Weights are normalized
    /// across all sources at build time.
    pub fn source(
        mut self,
        kind: SourceKind,
        samples: Vec<SampleAnnotation>,
        weight: f32,
    ) -> Self {
        self.sources.push((kind, samples, weight));
        self
    }

    /// Character-box estimator backing `Synthetic` sources.
    pub fn estimator(mut self, estimator: Box<dyn CharBoxEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[instrument(skip(self))]
    pub fn build(self) -> Result<BatchGenerator, CraftError> {
        if self.sources.is_empty() {
            return Err(CraftError::config("at least one data source is required"));
        }
        if self.canvas_size < 2 || self.canvas_size % 2 != 0 {
            return Err(CraftError::config(format!(
                "canvas size must be even, got {}",
                self.canvas_size
            )));
        }
        for (kind, samples, weight) in &self.sources {
            if samples.is_empty() {
                return Err(CraftError::config(format!("{kind:?} source is empty")));
            }
            if *weight <= 0.0 {
                return Err(CraftError::config(format!(
                    "{kind:?} source has non-positive weight {weight}"
                )));
            }
            if *kind == SourceKind::Synthetic && self.estimator.is_none() {
                return Err(CraftError::config(
                    "a synthetic source requires a character-box estimator",
                ));
            }
        }

        let weights = self.sources.iter().map(|(_, _, w)| *w).collect::<Vec<_>>();
        let picker = WeightedIndex::new(&weights)
            .map_err(|e| CraftError::config(format!("invalid source weights: {e}")))?;
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let sources = self
            .sources
            .into_iter()
            .map(|(kind, samples, _)| SourceState {
                kind,
                samples: samples.into_iter().map(normalize).collect(),
                cursor: 0,
            })
            .collect();

        Ok(BatchGenerator {
            sources,
            picker,
            estimator: self.estimator,
            canvas_size: self.canvas_size,
            total_iterations: self.total_iterations.max(1),
            fetched: 0,
            gaussian: GaussianGenerator::default(),
            rng,
        })
    }
}

struct SourceState {
    kind: SourceKind,
    samples: Vec<SampleAnnotation>,
    cursor: usize,
}

/// Assembles training batches: draws annotations across weighted sources,
/// runs each through crop/remap, mask building and Gaussian rendering, and
/// packs the results into padded batch tensors.
///
/// Holds the per-source cursors and shuffle state; single consumer only.
pub struct BatchGenerator {
    sources: Vec<SourceState>,
    picker: WeightedIndex<f32>,
    estimator: Option<Box<dyn CharBoxEstimator>>,
    canvas_size: u32,
    total_iterations: usize,
    fetched: usize,
    gaussian: GaussianGenerator,
    rng: StdRng,
}

impl BatchGenerator {
    /// Fetches the next batch of `size` samples. Any per-sample failure
    /// (unreadable image, boxes cropped out of the canvas) aborts the whole
    /// fetch; the caller is expected to treat that as fatal.
    #[instrument(level = "debug", skip(self))]
    pub fn get_batch(&mut self, size: usize) -> Result<TrainBatch, CraftError> {
        if size == 0 {
            return Err(CraftError::config("batch size must be positive"));
        }
        let crop_range = self.crop_range();
        self.fetched += 1;

        let half = self.canvas_size as usize / 2;
        let heat_size = (half, half);

        let mut image_paths = Vec::with_capacity(size);
        let mut images = Vec::with_capacity(size);
        let mut word_box_lists = Vec::with_capacity(size);
        let mut word_length_lists = Vec::with_capacity(size);
        let mut regions = Vec::with_capacity(size);
        let mut affinities = Vec::with_capacity(size);
        let mut confidences = Vec::with_capacity(size);
        let mut fg_masks = Vec::with_capacity(size);
        let mut bg_masks = Vec::with_capacity(size);

        for _ in 0..size {
            let annotation = self.next_annotation()?;
            let sample = load_sample(
                &annotation.image,
                self.canvas_size,
                &annotation.word_boxes,
                &annotation.char_boxes,
                crop_range,
                &mut self.rng,
            )?;

            // char-box counts can diverge from word counts when the boxes
            // come from the estimator
            let word_count = sample
                .word_boxes
                .len()
                .min(annotation.words.len())
                .min(sample.char_boxes.len());
            let halved_words = sample.word_boxes[..word_count]
                .iter()
                .map(half_res_box)
                .collect::<Vec<_>>();
            let word_lengths = (0..word_count)
                .map(|j| {
                    if sample.char_boxes[j].is_empty() {
                        annotation.words[j].chars().count() as i32
                    } else {
                        0
                    }
                })
                .collect::<Vec<_>>();

            let halved_quads = halved_words
                .iter()
                .map(|b| Quad(b.map(|[x, y]| [x as f32, y as f32])))
                .collect::<Vec<_>>();
            let valid_extent = (
                sample.valid_extent.0 as usize / 2,
                sample.valid_extent.1 as usize / 2,
            );
            let masks = build_masks(
                heat_size,
                &halved_quads,
                &annotation.confidences[..word_count],
                valid_extent,
            );

            let region_boxes = sample
                .region_boxes
                .iter()
                .map(|q| q.scaled(0.5))
                .collect::<Vec<_>>();
            let affinity_boxes = sample
                .affinity_boxes
                .iter()
                .map(|q| q.scaled(0.5))
                .collect::<Vec<_>>();
            regions.push(self.gaussian.generate(heat_size, &region_boxes));
            affinities.push(self.gaussian.generate(heat_size, &affinity_boxes));

            image_paths.push(annotation.image.clone());
            images.push(sample.image);
            word_box_lists.push(halved_words);
            word_length_lists.push(word_lengths);
            confidences.push(masks.combined);
            fg_masks.push(masks.fg);
            bg_masks.push(masks.bg);
        }

        let (word_boxes, word_lengths) = pad_word_arrays(&word_box_lists, &word_length_lists);
        Ok(TrainBatch {
            image_paths,
            images: stack_owned4(&images),
            word_boxes,
            word_lengths,
            regions: stack_owned3(&regions),
            affinities: stack_owned3(&affinities),
            confidences: stack_owned3(&confidences),
            fg_masks: stack_owned3(&fg_masks),
            bg_masks: stack_owned3(&bg_masks),
        })
    }

    /// The progressive augmentation window: the base crop range widens by
    /// one base step every `total_iterations / 5` fetches, up to 5x.
    fn crop_range(&self) -> (f32, f32) {
        let step = (self.total_iterations / CROP_SCHEDULE_STEPS).max(1);
        let multiplier = (1 + self.fetched / step).min(CROP_SCHEDULE_STEPS) as f32;
        (
            BASE_MIN_CROP_RATIO * multiplier,
            BASE_MAX_CROP_RATIO * multiplier,
        )
    }

    /// Draws the next annotation: weighted source pick, cursor advance,
    /// reshuffle on wraparound. Synthetic sources get their char boxes and
    /// confidences from the estimator, one word at a time.
    fn next_annotation(&mut self) -> Result<SampleAnnotation, CraftError> {
        let index = self.picker.sample(&mut self.rng);
        let source = &mut self.sources[index];
        let mut annotation = source.samples[source.cursor].clone();
        source.cursor += 1;
        if source.cursor >= source.samples.len() {
            source.cursor = 0;
            source.samples.shuffle(&mut self.rng);
            log::debug!("{:?} source wrapped, reshuffled", source.kind);
        }

        if source.kind == SourceKind::Synthetic {
            let estimator = self
                .estimator
                .as_ref()
                .ok_or_else(|| CraftError::config("synthetic source without an estimator"))?;
            annotation.char_boxes.clear();
            annotation.confidences.clear();
            for (word_box, word) in annotation.word_boxes.iter().zip(&annotation.words) {
                let (chars, confidence) =
                    estimator.estimate(&annotation.image, word_box, word.chars().count())?;
                annotation.char_boxes.push(chars);
                annotation.confidences.push(confidence);
            }
        }
        Ok(annotation)
    }
}

fn half_res_box(quad: &Quad) -> [[i32; 2]; 4] {
    quad.0
        .map(|[x, y]| [(x.floor() as i32).div_euclid(2), (y.floor() as i32).div_euclid(2)])
}

fn pad_word_arrays(
    word_box_lists: &[Vec<[[i32; 2]; 4]>],
    word_length_lists: &[Vec<i32>],
) -> (Array4<i32>, Array2<i32>) {
    let size = word_box_lists.len();
    let max_words = word_box_lists
        .iter()
        .map(Vec::len)
        .max()
        .unwrap_or(0)
        .max(1);
    let mut word_boxes = Array4::<i32>::zeros((size, max_words, 4, 2));
    let mut word_lengths = Array2::<i32>::zeros((size, max_words));
    for (i, (boxes, lengths)) in word_box_lists.iter().zip(word_length_lists).enumerate() {
        for (j, quad) in boxes.iter().enumerate() {
            for (k, [x, y]) in quad.iter().enumerate() {
                word_boxes[[i, j, k, 0]] = *x;
                word_boxes[[i, j, k, 1]] = *y;
            }
        }
        for (j, length) in lengths.iter().enumerate() {
            word_lengths[[i, j]] = *length;
        }
    }
    (word_boxes, word_lengths)
}

fn stack_owned3(arrays: &[ndarray::Array2<f32>]) -> Array3<f32> {
    let views = arrays.iter().map(|a| a.view()).collect::<Vec<_>>();
    stack(Axis(0), &views).unwrap()
}

fn stack_owned4(arrays: &[Array3<f32>]) -> Array4<f32> {
    let views = arrays.iter().map(|a| a.view()).collect::<Vec<_>>();
    stack(Axis(0), &views).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotation(name: &str) -> SampleAnnotation {
        SampleAnnotation {
            image: name.into(),
            word_boxes: vec![Quad::from_rect(0.0, 0.0, 50.0, 20.0)],
            words: vec!["ab".into()],
            char_boxes: Vec::new(),
            confidences: Vec::new(),
        }
    }

    fn source_of(count: usize, prefix: &str) -> Vec<SampleAnnotation> {
        (0..count)
            .map(|i| annotation(&format!("{prefix}/{i}.png")))
            .collect()
    }

    #[test]
    fn weighted_draws_approach_their_configured_ratio() {
        let mut generator = GeneratorBuilder::new(768, 100)
            .source(SourceKind::Real, source_of(50, "real"), 5.0)
            .source(SourceKind::Real, source_of(50, "other"), 1.0)
            .seed(7)
            .build()
            .unwrap();

        let mut first = 0usize;
        let draws = 10_000;
        for _ in 0..draws {
            let drawn = generator.next_annotation().unwrap();
            if drawn.image.starts_with("real") {
                first += 1;
            }
        }
        let ratio = first as f64 / draws as f64;
        assert!((ratio - 5.0 / 6.0).abs() < 0.02, "ratio was {ratio}");
    }

    #[test]
    fn cursor_wraps_into_a_fresh_permutation() {
        let mut generator = GeneratorBuilder::new(768, 100)
            .source(SourceKind::Real, source_of(5, "real"), 1.0)
            .seed(3)
            .build()
            .unwrap();

        for _ in 0..2 {
            let mut seen = std::collections::HashSet::new();
            for _ in 0..5 {
                seen.insert(generator.next_annotation().unwrap().image);
            }
            assert_eq!(seen.len(), 5);
        }
    }

    #[test]
    fn crop_schedule_widens_with_integer_division() {
        let mut generator = GeneratorBuilder::new(768, 10)
            .source(SourceKind::Real, source_of(2, "real"), 1.0)
            .build()
            .unwrap();

        assert_eq!(generator.crop_range(), (0.05, 0.2));
        generator.fetched = 2;
        assert_eq!(generator.crop_range(), (0.1, 0.4));
        generator.fetched = 9;
        assert_eq!(generator.crop_range(), (0.25, 1.0));
        // capped at 5x no matter how far training runs
        generator.fetched = 1000;
        assert_eq!(generator.crop_range(), (0.25, 1.0));
    }

    #[test]
    fn padding_zero_fills_beyond_each_samples_word_count() {
        let boxes = vec![
            vec![[[1, 2]; 4], [[3, 4]; 4]],
            vec![[[5, 6]; 4]],
        ];
        let lengths = vec![vec![2, 3], vec![4]];
        let (padded_boxes, padded_lengths) = pad_word_arrays(&boxes, &lengths);
        assert_eq!(padded_boxes.dim(), (2, 2, 4, 2));
        assert_eq!(padded_boxes[[0, 1, 0, 0]], 3);
        assert_eq!(padded_boxes[[1, 0, 0, 1]], 6);
        // sample 1 has one word; its second slot stays zero
        assert!(padded_boxes
            .index_axis(Axis(0), 1)
            .index_axis(Axis(0), 1)
            .iter()
            .all(|v| *v == 0));
        assert_eq!(padded_lengths[[0, 1]], 3);
        assert_eq!(padded_lengths[[1, 1]], 0);
    }

    #[test]
    fn synthetic_sources_require_an_estimator() {
        let result = GeneratorBuilder::new(768, 100)
            .source(SourceKind::Synthetic, source_of(2, "fake"), 1.0)
            .build();
        assert!(matches!(result, Err(CraftError::Config { .. })));
    }

    #[test]
    fn empty_sources_are_rejected() {
        let result = GeneratorBuilder::new(768, 100)
            .source(SourceKind::Real, Vec::new(), 1.0)
            .build();
        assert!(matches!(result, Err(CraftError::Config { .. })));
    }
}
