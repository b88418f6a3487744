//! Face alignment to the canonical 112×112 ArcFace crop.
//!
//! A 4-DOF similarity (scale, rotation, translation) is fitted in closed form
//! from the five detected landmarks to the InsightFace reference positions,
//! then the crop is sampled through its inverse.

use image::{Rgb, RgbImage};

pub const ALIGNED_SIZE: u32 = 112;

/// InsightFace reference landmarks for a 112×112 crop.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// `dst = [a -b; b a] · src + (tx, ty)`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares similarity mapping `src` onto `dst`.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let (src_cx, src_cy) = centroid(src);
        let (dst_cx, dst_cy) = centroid(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - src_cx, sy - src_cy);
            let (dx, dy) = (dx - dst_cx, dy - dst_cy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }

        // Degenerate landmarks (all coincident): translate only.
        if norm < 1e-12 {
            return Self {
                a: 1.0,
                b: 0.0,
                tx: dst_cx - src_cx,
                ty: dst_cy - src_cy,
            };
        }

        let a = dot / norm;
        let b = cross / norm;
        Self {
            a,
            b,
            tx: dst_cx - (a * src_cx - b * src_cy),
            ty: dst_cy - (b * src_cx + a * src_cy),
        }
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn invert(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

fn centroid(points: &[(f32, f32); 5]) -> (f32, f32) {
    let (sx, sy) = points
        .iter()
        .fold((0.0f32, 0.0f32), |(ax, ay), &(x, y)| (ax + x, ay + y));
    let n = points.len() as f32;
    (sx / n, sy / n)
}

/// Warp the face described by `landmarks` into a 112×112 aligned RGB crop.
///
/// Pixels that map outside the source are black.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let forward = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    let Some(inverse) = forward.invert() else {
        return RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    };

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |u, v| {
        let (x, y) = inverse.apply((u as f32, v as f32));
        sample_bilinear(image, x, y)
    })
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Rgb([0, 0, 0]);
    }
    let (max_x, max_y) = ((width - 1) as f32, (height - 1) as f32);
    if !(0.0..=max_x).contains(&x) || !(0.0..=max_y).contains(&y) {
        return Rgb([0, 0, 0]);
    }

    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(width - 1), (y0 + 1).min(height - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let tl = image.get_pixel(x0, y0).0;
    let tr = image.get_pixel(x1, y0).0;
    let bl = image.get_pixel(x0, y1).0;
    let br = image.get_pixel(x1, y1).0;

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = tl[c] as f32 * (1.0 - fx) + tr[c] as f32 * fx;
        let bottom = bl[c] as f32 * (1.0 - fx) + br[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}
