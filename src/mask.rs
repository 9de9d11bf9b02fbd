use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use ndarray::{s, Array2};
use tracing::instrument;

use crate::sample::Quad;
use crate::util::to_imageproc_points;

/// Per-pixel weighting masks for one sample, all at heat-map resolution.
///
/// `fg` and `bg` are disjoint by construction; `combined` is
/// `clip(confidence + bg, 0, 1)`, so background always carries full weight
/// while annotated regions carry their annotation confidence.
#[derive(Debug)]
pub struct MaskSet {
    pub confidence: Array2<f32>,
    pub fg: Array2<f32>,
    pub bg: Array2<f32>,
    pub combined: Array2<f32>,
}

/// Builds the confidence / foreground / background masks from word boxes in
/// heat-map coordinates. `valid_extent` is the `(width, height)` of the
/// non-padded image region at heat-map resolution; background never extends
/// into the padding.
#[instrument(level = "trace", skip(word_boxes, confidences), fields(words = word_boxes.len()))]
pub fn build_masks(
    size: (usize, usize),
    word_boxes: &[Quad],
    confidences: &[f32],
    valid_extent: (usize, usize),
) -> MaskSet {
    let (height, width) = size;
    let mut confidence = Array2::<f32>::zeros(size);
    let mut fg = Array2::<f32>::zeros(size);

    for (quad, value) in word_boxes.iter().zip(confidences) {
        let points = to_imageproc_points(quad);
        if points.first() == points.last() {
            // collapsed to a point after rounding
            continue;
        }
        let mut painted = GrayImage::new(width as u32, height as u32);
        draw_polygon_mut(&mut painted, &points, Luma([1u8]));
        for (x, y, pixel) in painted.enumerate_pixels() {
            if pixel.0[0] > 0 {
                fg[[y as usize, x as usize]] += 1.0;
                confidence[[y as usize, x as usize]] += value;
            }
        }
    }
    confidence.mapv_inplace(|v| v.clamp(0.0, 1.0));
    fg.mapv_inplace(|v| v.min(1.0));

    let mut bg = Array2::<f32>::zeros(size);
    let (valid_w, valid_h) = valid_extent;
    bg.slice_mut(s![..valid_h.min(height), ..valid_w.min(width)])
        .fill(1.0);
    let bg = (&bg - &fg).mapv(|v| v.clamp(0.0, 1.0));
    let combined = (&confidence + &bg).mapv(|v| v.clamp(0.0, 1.0));

    MaskSet {
        confidence,
        fg,
        bg,
        combined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(x0: f32, y0: f32, x1: f32, y1: f32) -> Quad {
        Quad::from_rect(x0, y0, x1, y1)
    }

    #[test]
    fn foreground_and_background_are_disjoint() {
        let masks = build_masks(
            (64, 64),
            &[word(10.0, 10.0, 30.0, 20.0)],
            &[1.0],
            (64, 64),
        );
        for (f, b) in masks.fg.iter().zip(masks.bg.iter()) {
            assert_eq!(f * b, 0.0);
            assert!((f + b - 1.0).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn combined_mask_is_full_weight_outside_words() {
        let masks = build_masks(
            (64, 64),
            &[word(10.0, 10.0, 30.0, 20.0)],
            &[0.4],
            (64, 64),
        );
        assert!(masks.combined.iter().all(|v| (0.0..=1.0).contains(v)));
        for ((y, x), f) in masks.fg.indexed_iter() {
            if *f == 0.0 {
                assert_eq!(masks.combined[[y, x]], 1.0);
            }
        }
        // interior pixel carries the annotation confidence
        assert_eq!(masks.combined[[15, 20]], 0.4);
    }

    #[test]
    fn overlapping_words_clip_their_summed_confidence() {
        let boxes = [word(5.0, 5.0, 25.0, 25.0), word(15.0, 15.0, 35.0, 35.0)];
        let masks = build_masks((48, 48), &boxes, &[0.7, 0.7], (48, 48));
        assert!(masks.confidence.iter().all(|v| *v <= 1.0));
        assert_eq!(masks.confidence[[20, 20]], 1.0);
        assert!(masks.fg.iter().all(|v| *v <= 1.0));
    }

    #[test]
    fn background_stops_at_the_valid_extent() {
        let masks = build_masks((64, 64), &[word(5.0, 5.0, 15.0, 15.0)], &[1.0], (32, 48));
        assert_eq!(masks.bg[[10, 40]], 0.0); // x beyond valid width.. within height
        assert_eq!(masks.bg[[50, 10]], 0.0); // y beyond valid height
        assert_eq!(masks.bg[[40, 10]], 1.0);
        assert_eq!(masks.combined[[50, 40]], 0.0);
    }

    #[test]
    fn degenerate_word_boxes_paint_nothing() {
        let collapsed = Quad([[8.0, 8.0], [8.0, 8.0], [8.0, 8.0], [8.0, 8.0]]);
        let masks = build_masks((32, 32), &[collapsed], &[1.0], (32, 32));
        assert!(masks.fg.iter().all(|v| *v == 0.0));
    }
}
