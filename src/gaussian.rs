use geo::{Area, Coord, Intersects, IsConvex, Rect};
use image::{ImageBuffer, Luma};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use ndarray::Array2;
use tracing::instrument;

use crate::sample::Quad;
use crate::util::{reorder_points, to_geo_poly};

const PATCH_SIZE: u32 = 64;
// sigma = size / 6 puts the patch edges at exp(-4.5), effectively zero
const SIGMA_RATIO: f32 = 6.0;
const MIN_BOX_AREA: f32 = 1.0;

type LumaF32Image = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Renders region/affinity ground truth: a reference 2D Gaussian patch is
/// perspective-warped onto each target quad and summed into the canvas,
/// clipped to 1.0.
pub struct GaussianGenerator {
    patch: LumaF32Image,
}

impl Default for GaussianGenerator {
    fn default() -> Self {
        Self::new(PATCH_SIZE)
    }
}

impl GaussianGenerator {
    pub fn new(patch_size: u32) -> Self {
        let sigma = patch_size as f32 / SIGMA_RATIO;
        let center = (patch_size - 1) as f32 / 2.0;
        let patch = ImageBuffer::from_fn(patch_size, patch_size, |x, y| {
            let dx = x as f32 - center;
            let dy = y as f32 - center;
            Luma([(-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()])
        });
        Self { patch }
    }

    /// Renders one `(height, width)` heat map from the given quads, which
    /// are expected in canvas coordinates. Degenerate quads (zero area,
    /// non-convex, outside the canvas, or without a valid perspective
    /// mapping) contribute nothing.
    #[instrument(level = "trace", skip(self, boxes), fields(boxes = boxes.len()))]
    pub fn generate(&self, size: (usize, usize), boxes: &[Quad]) -> Array2<f32> {
        let (height, width) = size;
        let mut heat = Array2::<f32>::zeros(size);
        let mut scratch: LumaF32Image = ImageBuffer::new(width as u32, height as u32);
        let canvas = Rect::new(
            Coord { x: 0.0, y: 0.0 },
            Coord {
                x: width as f32,
                y: height as f32,
            },
        );
        let edge = (self.patch.width() - 1) as f32;
        let corners = [(0.0, 0.0), (edge, 0.0), (edge, edge), (0.0, edge)];

        for quad in boxes {
            let quad = reorder_points(quad);
            if !usable(&quad, &canvas) {
                log::trace!("skipping degenerate box {quad:?}");
                continue;
            }
            let to = quad.0.map(|[x, y]| (x, y));
            let projection = match Projection::from_control_points(corners, to) {
                Some(projection) => projection,
                None => continue,
            };
            warp_into(
                &self.patch,
                &projection,
                Interpolation::Bilinear,
                Luma([0.0]),
                &mut scratch,
            );
            for (x, y, pixel) in scratch.enumerate_pixels() {
                let value = pixel.0[0];
                if value > 0.0 {
                    heat[[y as usize, x as usize]] += value;
                }
            }
        }

        heat.mapv_inplace(|v| v.min(1.0));
        heat
    }
}

fn usable(quad: &Quad, canvas: &Rect<f32>) -> bool {
    let poly = to_geo_poly(quad);
    poly.unsigned_area() >= MIN_BOX_AREA && poly.exterior().is_convex() && poly.intersects(canvas)
}
