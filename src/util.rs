use float_ord::FloatOrd;
use geo::{Coord, LineString, Polygon};
use image::{DynamicImage, GrayImage, ImageBuffer};
use imageproc::point::Point;
use ndarray::{Array3, ArrayView2, Axis};
use tracing::instrument;

use crate::sample::Quad;

#[instrument(level = "trace", skip(image))]
pub(crate) fn subtract_mean_normalize(
    image: &DynamicImage,
    mean_vals: &[f32; 3],
    norm_vals: &[f32; 3],
) -> Array3<f32> {
    let image = image.to_rgb32f();
    Array3::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| {
            let pixel = image.get_pixel(x as u32, y as u32).0[ch];
            (pixel - mean_vals[ch]) * norm_vals[ch]
        },
    )
}

pub(crate) fn to_luma_image(data: ArrayView2<f32>) -> GrayImage {
    let height = data.len_of(Axis(0));
    let width = data.len_of(Axis(1));
    let pixel_data = data
        .axis_iter(Axis(0))
        .flat_map(|it| it.into_iter())
        .map(|p| (p.clamp(0.0, 1.0) * 255.0) as u8)
        .collect::<Vec<u8>>();
    ImageBuffer::from_raw(width as u32, height as u32, pixel_data).unwrap()
}

pub(crate) fn to_geo_poly(quad: &Quad) -> Polygon<f32> {
    let points = quad
        .0
        .iter()
        .map(|[x, y]| Coord { x: *x, y: *y })
        .collect::<Vec<_>>();
    Polygon::new(LineString::from(points), vec![])
}

pub(crate) fn to_imageproc_points(quad: &Quad) -> Vec<Point<i32>> {
    quad.0
        .iter()
        .map(|[x, y]| Point::new(x.round() as i32, y.round() as i32))
        .collect()
}

/// Reorders a quad's corners to clockwise order starting from the corner
/// nearest the top-left. The Gaussian warp and affinity construction both
/// rely on this ordering.
pub fn reorder_points(quad: &Quad) -> Quad {
    let [cx, cy] = quad.center();
    let mut points = quad.0;
    // ascending angle around the centroid is clockwise in image coordinates
    points.sort_by_key(|[x, y]| FloatOrd((y - cy).atan2(x - cx)));
    let start = points
        .iter()
        .enumerate()
        .min_by_key(|(_, [x, y])| FloatOrd(x + y))
        .map(|(i, _)| i)
        .unwrap();
    points.rotate_left(start);
    Quad(points)
}
