use std::fs;
use std::path::Path;

use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use ndarray::{ArrayView3, Axis};
use tracing::instrument;

use crate::error::CraftError;
use crate::sample::TrainBatch;
use crate::util::to_luma_image;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
const MAX_SNAPSHOTS: usize = 2;

/// Writes the first couple of batch images (min-max rescaled, downsampled
/// to heat-map resolution) with their word boxes outlined.
#[instrument(level = "debug", skip(batch))]
pub fn save_batch_images(
    dir: &Path,
    iteration: usize,
    batch: &TrainBatch,
    prefix: &str,
) -> Result<(), CraftError> {
    ensure_dir(dir)?;
    for index in 0..batch.len().min(MAX_SNAPSHOTS) {
        let image = batch.images.index_axis(Axis(0), index);
        let display = unnormalize_minmax(image);
        let (width, height) = display.dimensions();
        // word boxes live in half-resolution coordinates
        let mut display = imageops::resize(
            &display,
            (width / 2).max(1),
            (height / 2).max(1),
            FilterType::Triangle,
        );
        for word in batch.word_boxes.index_axis(Axis(0), index).outer_iter() {
            if word.iter().all(|v| *v == 0) {
                // padding entry
                continue;
            }
            let corners = word
                .outer_iter()
                .map(|point| (point[0] as f32, point[1] as f32))
                .collect::<Vec<_>>();
            for i in 0..corners.len() {
                let from = corners[i];
                let to = corners[(i + 1) % corners.len()];
                draw_line_segment_mut(&mut display, from, to, BOX_COLOR);
            }
        }
        save(
            &display,
            dir,
            &format!("{prefix}iter{}_{index}_img.jpg", iteration + 1),
        )?;
    }
    Ok(())
}

/// Writes one map kind's diagnostics for the first sample of a batch:
/// prediction, target, foreground mask and the mined hard-background mask.
#[instrument(level = "debug", skip(pred, target, fg_mask, hard_bg_mask))]
pub fn save_heatmap_log<'a>(
    dir: &Path,
    prefix: &str,
    kind: &str,
    map_loss: f32,
    pred: ArrayView3<'a, f32>,
    target: ArrayView3<'a, f32>,
    fg_mask: ArrayView3<'a, f32>,
    hard_bg_mask: ArrayView3<'a, f32>,
) -> Result<(), CraftError> {
    ensure_dir(dir)?;
    log::debug!("{prefix} {kind} loss {map_loss}");
    for (suffix, map) in [
        ("pred", pred),
        ("target", target),
        ("fg", fg_mask),
        ("hard_bg", hard_bg_mask),
    ] {
        let image = to_luma_image(map.index_axis(Axis(0), 0));
        save(&image, dir, &format!("{prefix}_{kind}_{suffix}.jpg"))?;
    }
    Ok(())
}

fn unnormalize_minmax(image: ArrayView3<f32>) -> RgbImage {
    let min = image.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = image.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = (max - min).max(1e-6);
    let height = image.len_of(Axis(1));
    let width = image.len_of(Axis(2));
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let pixel = |ch: usize| {
            let value = image[[ch, y as usize, x as usize]];
            ((value - min) / range * 255.0) as u8
        };
        Rgb([pixel(0), pixel(1), pixel(2)])
    })
}

fn ensure_dir(dir: &Path) -> Result<(), CraftError> {
    fs::create_dir_all(dir).map_err(|source| CraftError::Artifact {
        path: dir.to_path_buf(),
        source: Box::new(source),
    })
}

fn save<P, C>(image: &image::ImageBuffer<P, C>, dir: &Path, name: &str) -> Result<(), CraftError>
where
    P: image::PixelWithColorType,
    [P::Subpixel]: image::EncodableLayout,
    C: std::ops::Deref<Target = [P::Subpixel]>,
{
    let path = dir.join(name);
    image.save(&path).map_err(|source| CraftError::Artifact {
        path,
        source: Box::new(source),
    })
}
