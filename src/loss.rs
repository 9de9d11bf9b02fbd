use std::cmp::Reverse;

use float_ord::FloatOrd;
use ndarray::{Array3, ArrayView3};
use tracing::instrument;

use crate::error::CraftError;

const HUBER_DELTA: f32 = 0.5;
const HARD_NEGATIVE_RATIO: usize = 3;
// mined even when a batch has no foreground at all
const MIN_HARD_NEGATIVES: usize = 1024;

/// Per-pixel error policy for the regression loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossKind {
    #[default]
    Mse,
    Mae,
    Huber,
}

/// Masked regression loss over region/affinity heat maps with adaptive
/// background hard-negative mining: every pixel error is scaled by the
/// combined confidence mask, foreground pixels contribute their mean, and
/// only the top `3 * |foreground|` highest-error background pixels count.
#[derive(Debug, Clone, Copy)]
pub struct CraftLoss {
    kind: LossKind,
    alpha: f32,
}

/// Scalar losses plus the mined background mask, kept for logging.
#[derive(Debug)]
pub struct LossOutput {
    pub total: f32,
    pub region: f32,
    pub affinity: f32,
    pub hard_bg_mask: Array3<f32>,
}

impl CraftLoss {
    pub fn new(kind: LossKind, alpha: f32) -> Self {
        Self { kind, alpha }
    }

    #[instrument(level = "debug", skip_all)]
    pub fn forward(
        &self,
        target_region: ArrayView3<f32>,
        target_affinity: ArrayView3<f32>,
        pred_region: ArrayView3<f32>,
        pred_affinity: ArrayView3<f32>,
        confidence: ArrayView3<f32>,
        fg_mask: ArrayView3<f32>,
        bg_mask: ArrayView3<f32>,
    ) -> Result<LossOutput, CraftError> {
        let expected = target_region.dim();
        for actual in [
            target_affinity.dim(),
            pred_region.dim(),
            pred_affinity.dim(),
            confidence.dim(),
            fg_mask.dim(),
            bg_mask.dim(),
        ] {
            if actual != expected {
                return Err(CraftError::ShapeMismatch {
                    expected: vec![expected.0, expected.1, expected.2],
                    actual: vec![actual.0, actual.1, actual.2],
                });
            }
        }

        let region_err = self.pixel_error(&target_region, &pred_region) * &confidence;
        let affinity_err = self.pixel_error(&target_affinity, &pred_affinity) * &confidence;

        let fg_count = fg_mask.iter().filter(|v| **v > 0.5).count();
        let region_fg = masked_mean(&region_err, &fg_mask, fg_count);
        let affinity_fg = masked_mean(&affinity_err, &fg_mask, fg_count);

        // one hard-background set for both maps, mined on their summed error
        let mut bg_pixels = bg_mask
            .indexed_iter()
            .filter(|(_, v)| **v > 0.5)
            .map(|(idx, _)| (region_err[idx] + affinity_err[idx], idx))
            .collect::<Vec<_>>();
        let bg_total = bg_pixels.len();
        let keep = if fg_count > 0 {
            (HARD_NEGATIVE_RATIO * fg_count).min(bg_total)
        } else {
            MIN_HARD_NEGATIVES.min(bg_total)
        };
        if keep > 0 && keep < bg_total {
            bg_pixels.select_nth_unstable_by_key(keep - 1, |(err, _)| Reverse(FloatOrd(*err)));
        }
        let hard = &bg_pixels[..keep];
        log::trace!("fg {fg_count}, bg {bg_total}, mined {keep}");

        let mut hard_bg_mask = Array3::<f32>::zeros(expected);
        for (_, idx) in hard {
            hard_bg_mask[*idx] = 1.0;
        }
        let (region_bg, affinity_bg) = if keep > 0 {
            (
                hard.iter().map(|(_, idx)| region_err[*idx]).sum::<f32>() / keep as f32,
                hard.iter().map(|(_, idx)| affinity_err[*idx]).sum::<f32>() / keep as f32,
            )
        } else {
            (0.0, 0.0)
        };

        let region = self.alpha * region_fg + region_bg;
        let affinity = self.alpha * affinity_fg + affinity_bg;
        Ok(LossOutput {
            total: region + affinity,
            region,
            affinity,
            hard_bg_mask,
        })
    }

    fn pixel_error(&self, target: &ArrayView3<f32>, pred: &ArrayView3<f32>) -> Array3<f32> {
        let diff = target - pred;
        match self.kind {
            LossKind::Mse => diff.mapv(|d| d * d),
            LossKind::Mae => diff.mapv(f32::abs),
            LossKind::Huber => diff.mapv(|d| {
                let magnitude = d.abs();
                if magnitude <= HUBER_DELTA {
                    0.5 * d * d
                } else {
                    HUBER_DELTA * (magnitude - 0.5 * HUBER_DELTA)
                }
            }),
        }
    }
}

fn masked_mean(err: &Array3<f32>, mask: &ArrayView3<f32>, count: usize) -> f32 {
    if count == 0 {
        return 0.0;
    }
    (err * mask).sum() / count as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    struct Fixture {
        target_region: Array3<f32>,
        target_affinity: Array3<f32>,
        pred_region: Array3<f32>,
        pred_affinity: Array3<f32>,
        confidence: Array3<f32>,
        fg: Array3<f32>,
        bg: Array3<f32>,
    }

    impl Fixture {
        fn new(fg_pixels: usize) -> Self {
            let dim = (1, 4, 4);
            let mut fg = Array3::<f32>::zeros(dim);
            let mut bg = Array3::<f32>::ones(dim);
            for i in 0..fg_pixels {
                fg[(0, i / 4, i % 4)] = 1.0;
                bg[(0, i / 4, i % 4)] = 0.0;
            }
            Self {
                target_region: Array3::zeros(dim),
                target_affinity: Array3::zeros(dim),
                pred_region: Array3::ones(dim),
                pred_affinity: Array3::zeros(dim),
                confidence: Array3::ones(dim),
                fg,
                bg,
            }
        }

        fn run(&self, loss: CraftLoss) -> LossOutput {
            loss.forward(
                self.target_region.view(),
                self.target_affinity.view(),
                self.pred_region.view(),
                self.pred_affinity.view(),
                self.confidence.view(),
                self.fg.view(),
                self.bg.view(),
            )
            .unwrap()
        }
    }

    #[test]
    fn mines_exactly_three_times_the_foreground_count() {
        let fixture = Fixture::new(2);
        let output = fixture.run(CraftLoss::new(LossKind::Mse, 1.0));
        assert_eq!(output.hard_bg_mask.sum(), 6.0);
    }

    #[test]
    fn mines_all_background_when_it_is_scarce() {
        // 10 fg pixels leave only 6 bg pixels, well under 3 * 10
        let fixture = Fixture::new(10);
        let output = fixture.run(CraftLoss::new(LossKind::Mse, 1.0));
        assert_eq!(output.hard_bg_mask.sum(), 6.0);
    }

    #[test]
    fn empty_foreground_still_mines_background() {
        let fixture = Fixture::new(0);
        let output = fixture.run(CraftLoss::new(LossKind::Mse, 1.0));
        assert_eq!(output.hard_bg_mask.sum(), 16.0);
        // every pixel errs by 1.0 on the region map, so bg drives the loss
        assert!(output.total.is_finite());
        assert!((output.region - 1.0).abs() < 1e-6);
        assert_eq!(output.affinity, 0.0);
    }

    #[test]
    fn empty_background_contributes_nothing() {
        let mut fixture = Fixture::new(16);
        fixture.bg.fill(0.0);
        let output = fixture.run(CraftLoss::new(LossKind::Mse, 2.0));
        assert_eq!(output.hard_bg_mask.sum(), 0.0);
        // alpha-weighted foreground term only
        assert!((output.region - 2.0).abs() < 1e-6);
        assert!(output.total.is_finite());
    }

    #[test]
    fn confidence_scales_the_foreground_term() {
        let mut fixture = Fixture::new(16);
        fixture.bg.fill(0.0);
        fixture.confidence.fill(0.5);
        let output = fixture.run(CraftLoss::new(LossKind::Mse, 1.0));
        assert!((output.region - 0.5).abs() < 1e-6);
    }

    #[test]
    fn error_policies_agree_with_their_formulas() {
        let loss = |kind| CraftLoss::new(kind, 1.0);
        let mut no_bg = Fixture::new(16);
        no_bg.bg.fill(0.0);
        // target 0, prediction 1: |d| = 1
        assert!((no_bg.run(loss(LossKind::Mse)).region - 1.0).abs() < 1e-6);
        assert!((no_bg.run(loss(LossKind::Mae)).region - 1.0).abs() < 1e-6);
        assert!((no_bg.run(loss(LossKind::Huber)).region - 0.375).abs() < 1e-6);
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let fixture = Fixture::new(2);
        let small = Array3::<f32>::zeros((1, 2, 2));
        let result = CraftLoss::new(LossKind::Mse, 1.0).forward(
            fixture.target_region.view(),
            fixture.target_affinity.view(),
            small.view(),
            fixture.pred_affinity.view(),
            fixture.confidence.view(),
            fixture.fg.view(),
            fixture.bg.view(),
        );
        assert!(matches!(result, Err(CraftError::ShapeMismatch { .. })));
    }

    #[test]
    fn mining_prefers_the_highest_errors() {
        let mut fixture = Fixture::new(1);
        // make one background pixel err far more than the rest
        fixture.pred_affinity[(0, 3, 3)] = 10.0;
        let output = fixture.run(CraftLoss::new(LossKind::Mse, 1.0));
        assert_eq!(output.hard_bg_mask[(0, 3, 3)], 1.0);
        assert_eq!(output.hard_bg_mask.sum(), 3.0);
    }
}
