use std::path::Path;

use image::{imageops, imageops::FilterType, DynamicImage, RgbImage};
use nalgebra::{Affine2, Matrix3, Point2};
use rand::Rng;
use tracing::instrument;

use crate::error::CraftError;
use crate::sample::{LoadedSample, Quad};
use crate::util::{reorder_points, subtract_mean_normalize};

const MEAN_VALUES: [f32; 3] = [0.485, 0.456, 0.406];
const NORM_VALUES: [f32; 3] = [1.0 / 0.229, 1.0 / 0.224, 1.0 / 0.225];

/// The crop + resize mapping from source-image coordinates into the canvas
/// frame. Invertible, so canvas-space boxes can be mapped back for
/// debugging and tests.
#[derive(Debug, Clone, Copy)]
pub struct CropTransform {
    affine: Affine2<f32>,
}

impl CropTransform {
    pub fn new(origin: (f32, f32), scale: f32) -> Self {
        let matrix = Matrix3::new(
            scale,
            0.0,
            -origin.0 * scale,
            0.0,
            scale,
            -origin.1 * scale,
            0.0,
            0.0,
            1.0,
        );
        Self {
            affine: Affine2::from_matrix_unchecked(matrix),
        }
    }

    pub fn apply_point(&self, [x, y]: [f32; 2]) -> [f32; 2] {
        let mapped = self.affine.transform_point(&Point2::new(x, y));
        [mapped.x, mapped.y]
    }

    pub fn apply(&self, quad: &Quad) -> Quad {
        Quad(quad.0.map(|point| self.apply_point(point)))
    }

    pub fn inverse(&self) -> Self {
        Self {
            affine: self.affine.inverse(),
        }
    }
}

/// Loads one image, applies a random crop sampled from `crop_range` of the
/// source extent, resizes onto a `canvas_size` square (aspect preserved,
/// right/bottom padding), and remaps every annotation box with the same
/// transform.
///
/// Fails when the image cannot be read or when every remapped word box
/// lands fully outside the canvas; the caller treats both as fatal.
#[instrument(level = "debug", skip(word_boxes, char_boxes, rng))]
pub fn load_sample<R: Rng>(
    path: &Path,
    canvas_size: u32,
    word_boxes: &[Quad],
    char_boxes: &[Vec<Quad>],
    crop_range: (f32, f32),
    rng: &mut R,
) -> Result<LoadedSample, CraftError> {
    let image = image::open(path).map_err(|source| CraftError::ImageRead {
        path: path.to_path_buf(),
        source,
    })?;
    let image = image.to_rgb8();
    let (width, height) = image.dimensions();

    let ratio = rng.gen_range(crop_range.0..=crop_range.1).min(1.0);
    let crop_w = ((width as f32 * ratio).round() as u32).clamp(1, width);
    let crop_h = ((height as f32 * ratio).round() as u32).clamp(1, height);
    let x0 = rng.gen_range(0..=width - crop_w);
    let y0 = rng.gen_range(0..=height - crop_h);
    let cropped = imageops::crop_imm(&image, x0, y0, crop_w, crop_h).to_image();

    let scale = canvas_size as f32 / crop_w.max(crop_h) as f32;
    let valid_w = ((crop_w as f32 * scale).round() as u32).clamp(1, canvas_size);
    let valid_h = ((crop_h as f32 * scale).round() as u32).clamp(1, canvas_size);
    log::trace!(
        "crop ({x0}, {y0}) {crop_w}x{crop_h} of {width}x{height}, valid {valid_w}x{valid_h}"
    );
    let resized = imageops::resize(&cropped, valid_w, valid_h, FilterType::Triangle);
    let mut canvas = RgbImage::new(canvas_size, canvas_size);
    imageops::replace(&mut canvas, &resized, 0, 0);

    let transform = CropTransform::new((x0 as f32, y0 as f32), scale);
    let word_boxes = word_boxes
        .iter()
        .map(|quad| transform.apply(quad))
        .collect::<Vec<_>>();
    let char_boxes = char_boxes
        .iter()
        .map(|word| word.iter().map(|quad| transform.apply(quad)).collect())
        .collect::<Vec<Vec<_>>>();

    if !word_boxes.is_empty()
        && word_boxes
            .iter()
            .all(|quad| outside_canvas(quad, canvas_size))
    {
        return Err(CraftError::BoxesOutsideCanvas {
            path: path.to_path_buf(),
            word_boxes: word_boxes.len(),
            char_boxes: char_boxes.len(),
            canvas: canvas_size,
        });
    }

    let (region_boxes, affinity_boxes) = derive_target_boxes(&word_boxes, &char_boxes);
    let image = subtract_mean_normalize(
        &DynamicImage::ImageRgb8(canvas),
        &MEAN_VALUES,
        &NORM_VALUES,
    );

    Ok(LoadedSample {
        image,
        word_boxes,
        char_boxes,
        region_boxes,
        affinity_boxes,
        valid_extent: (valid_w, valid_h),
    })
}

fn outside_canvas(quad: &Quad, canvas_size: u32) -> bool {
    let size = canvas_size as f32;
    let xs = quad.0.map(|[x, _]| x);
    let ys = quad.0.map(|[_, y]| y);
    let max_x = xs.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let min_x = xs.iter().cloned().fold(f32::INFINITY, f32::min);
    let max_y = ys.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let min_y = ys.iter().cloned().fold(f32::INFINITY, f32::min);
    max_x <= 0.0 || max_y <= 0.0 || min_x >= size || min_y >= size
}

/// Region boxes are the character boxes where available, or the word box
/// itself as a single-character stand-in; affinity boxes link each pair of
/// consecutive characters.
fn derive_target_boxes(word_boxes: &[Quad], char_boxes: &[Vec<Quad>]) -> (Vec<Quad>, Vec<Quad>) {
    let mut region_boxes = Vec::new();
    let mut affinity_boxes = Vec::new();
    for (i, word_box) in word_boxes.iter().enumerate() {
        let chars = char_boxes.get(i).map(Vec::as_slice).unwrap_or(&[]);
        if chars.is_empty() {
            region_boxes.push(*word_box);
            continue;
        }
        region_boxes.extend_from_slice(chars);
        for pair in chars.windows(2) {
            affinity_boxes.push(affinity_box(&pair[0], &pair[1]));
        }
    }
    (region_boxes, affinity_boxes)
}

/// Connects two adjacent character boxes: the quad through the centroids of
/// each box's upper and lower triangles (corners + box center).
pub(crate) fn affinity_box(first: &Quad, second: &Quad) -> Quad {
    let (first_top, first_bottom) = triangle_centers(&reorder_points(first));
    let (second_top, second_bottom) = triangle_centers(&reorder_points(second));
    Quad([first_top, second_top, second_bottom, first_bottom])
}

fn triangle_centers(quad: &Quad) -> ([f32; 2], [f32; 2]) {
    let [tl, tr, br, bl] = quad.0;
    let [cx, cy] = quad.center();
    let top = [(tl[0] + tr[0] + cx) / 3.0, (tl[1] + tr[1] + cy) / 3.0];
    let bottom = [(bl[0] + br[0] + cx) / 3.0, (bl[1] + br[1] + cy) / 3.0];
    (top, bottom)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: [f32; 2], expected: [f32; 2]) {
        assert!(
            (actual[0] - expected[0]).abs() < 1e-3 && (actual[1] - expected[1]).abs() < 1e-3,
            "{actual:?} != {expected:?}"
        );
    }

    #[test]
    fn crop_transform_round_trips() {
        let transform = CropTransform::new((37.0, 91.0), 1.6);
        let inverse = transform.inverse();
        let quad = Quad([[50.0, 100.0], [180.0, 95.0], [185.0, 140.0], [48.0, 150.0]]);
        let restored = inverse.apply(&transform.apply(&quad));
        for (restored, original) in restored.0.iter().zip(quad.0.iter()) {
            assert_close(*restored, *original);
        }
    }

    #[test]
    fn crop_transform_shifts_then_scales() {
        let transform = CropTransform::new((10.0, 20.0), 2.0);
        assert_close(transform.apply_point([10.0, 20.0]), [0.0, 0.0]);
        assert_close(transform.apply_point([15.0, 30.0]), [10.0, 20.0]);
    }

    #[test]
    fn word_without_chars_becomes_its_own_region_box() {
        let word = Quad::from_rect(0.0, 0.0, 40.0, 10.0);
        let (region, affinity) = derive_target_boxes(&[word], &[Vec::new()]);
        assert_eq!(region, vec![word]);
        assert!(affinity.is_empty());
    }

    #[test]
    fn chars_produce_regions_and_linking_affinities() {
        let word = Quad::from_rect(0.0, 0.0, 30.0, 10.0);
        let chars = vec![
            Quad::from_rect(0.0, 0.0, 10.0, 10.0),
            Quad::from_rect(10.0, 0.0, 20.0, 10.0),
            Quad::from_rect(20.0, 0.0, 30.0, 10.0),
        ];
        let (region, affinity) = derive_target_boxes(&[word], &[chars.clone()]);
        assert_eq!(region, chars);
        assert_eq!(affinity.len(), 2);
    }

    #[test]
    fn affinity_box_spans_the_two_character_centers() {
        let first = Quad::from_rect(0.0, 0.0, 10.0, 10.0);
        let second = Quad::from_rect(20.0, 0.0, 30.0, 10.0);
        let link = affinity_box(&first, &second);
        assert_close(link.center(), [15.0, 5.0]);
        // uppermost edge connects the two upper-triangle centroids
        assert_close(link.0[0], [5.0, 5.0 / 3.0]);
        assert_close(link.0[1], [25.0, 5.0 / 3.0]);
    }

    #[test]
    fn boxes_fully_left_of_the_canvas_are_outside() {
        assert!(outside_canvas(&Quad::from_rect(-60.0, 10.0, -20.0, 30.0), 100));
        assert!(!outside_canvas(&Quad::from_rect(-60.0, 10.0, 20.0, 30.0), 100));
        assert!(outside_canvas(&Quad::from_rect(110.0, 10.0, 150.0, 30.0), 100));
    }
}
