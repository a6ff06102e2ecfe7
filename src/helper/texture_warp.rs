use image::{DynamicImage, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into_with, Interpolation};
use nalgebra::{Matrix2x3, Matrix3, Vector2, Vector3};
use ndarray::Array2;
use tracing::{debug, warn};
use crate::error::error::{FacemeshError, Result};
use crate::utils::utils::array2_to_pairs;

const IN_CIRCLE_EPS: f64 = 1e-9;
const BARYCENTRIC_EPS: f64 = 1e-9;
/// Sample position for pixels no triangle covers; always outside the source.
const OUTSIDE: (f32, f32) = (-1.0, -1.0);

#[derive(Debug, Clone, Copy)]
struct Circumcircle {
    center: Vector2<f64>,
    radius_sq: f64,
}

impl Circumcircle {
    fn of(a: Vector2<f64>, b: Vector2<f64>, c: Vector2<f64>) -> Option<Self> {
        let d = 2.0 * (a.x * (b.y - c.y) + b.x * (c.y - a.y) + c.x * (a.y - b.y));
        if d.abs() < f64::EPSILON {
            return None
        }
        let (a2, b2, c2) = (a.norm_squared(), b.norm_squared(), c.norm_squared());
        let center = Vector2::new(
            (a2 * (b.y - c.y) + b2 * (c.y - a.y) + c2 * (a.y - b.y)) / d,
            (a2 * (c.x - b.x) + b2 * (a.x - c.x) + c2 * (b.x - a.x)) / d,
        );
        Some(Circumcircle { center, radius_sq: (a - center).norm_squared() })
    }

    fn contains(&self, p: Vector2<f64>) -> bool {
        (p - self.center).norm_squared() <= self.radius_sq * (1.0 + IN_CIRCLE_EPS)
    }
}

/// delaunay_triangulate triangulates a 2D point set (Bowyer-Watson).
///
/// Duplicate points are skipped and take part in no triangle. The returned
/// triangles index into `points` and are wound counter-clockwise.
pub fn delaunay_triangulate(points: &[[f64; 2]]) -> Vec<[usize; 3]> {
    if points.len() < 3 {
        return vec![]
    }

    let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
    let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
    for p in points {
        min_x = min_x.min(p[0]);
        min_y = min_y.min(p[1]);
        max_x = max_x.max(p[0]);
        max_y = max_y.max(p[1]);
    }
    let delta = (max_x - min_x).max(max_y - min_y).max(1.0) * 100.0;
    let (mid_x, mid_y) = ((min_x + max_x) / 2.0, (min_y + max_y) / 2.0);

    let n = points.len();
    let mut vertices: Vec<Vector2<f64>> = points.iter().map(|p| Vector2::new(p[0], p[1])).collect();
    vertices.push(Vector2::new(mid_x - delta, mid_y - delta));
    vertices.push(Vector2::new(mid_x, mid_y + delta));
    vertices.push(Vector2::new(mid_x + delta, mid_y - delta));

    let mut triangles: Vec<([usize; 3], Option<Circumcircle>)> = Vec::new();
    let super_tri = [n, n + 1, n + 2];
    triangles.push((super_tri, Circumcircle::of(vertices[n], vertices[n + 1], vertices[n + 2])));

    for idx in 0..n {
        let p = vertices[idx];
        if vertices[..idx].iter().any(|q| (q - p).norm_squared() < f64::EPSILON) {
            debug!("skipping duplicate control point {}", idx);
            continue
        }

        let mut bad: Vec<[usize; 3]> = Vec::new();
        triangles.retain(|(tri, circle)| {
            let is_bad = match circle {
                None => true,
                Some(circle) => circle.contains(p),
            };
            if is_bad {
                bad.push(*tri);
            }
            !is_bad
        });

        let mut boundary: Vec<(usize, usize)> = Vec::new();
        for tri in &bad {
            for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
                let shared = bad.iter().any(|other| {
                    other != tri && other.contains(&a) && other.contains(&b)
                });
                if !shared {
                    boundary.push((a, b));
                }
            }
        }

        for (a, b) in boundary {
            let tri = counter_clockwise([a, b, idx], &vertices);
            let circle = Circumcircle::of(vertices[tri[0]], vertices[tri[1]], vertices[tri[2]]);
            triangles.push((tri, circle));
        }
    }

    triangles
        .into_iter()
        .map(|(tri, _)| tri)
        .filter(|tri| tri.iter().all(|&v| v < n))
        .collect()
}

fn counter_clockwise(tri: [usize; 3], vertices: &[Vector2<f64>]) -> [usize; 3] {
    let (a, b, c) = (vertices[tri[0]], vertices[tri[1]], vertices[tri[2]]);
    let cross = (b - a).perp(&(c - a));
    if cross < 0.0 {
        [tri[0], tri[2], tri[1]]
    } else {
        tri
    }
}

/// One triangle of the piecewise transform: its corners in source space and
/// the affine map taking them onto the destination.
#[derive(Debug, Clone)]
struct AffinePiece {
    corners: [Vector2<f64>; 3],
    affine: Matrix2x3<f64>,
}

impl AffinePiece {
    fn apply(&self, p: Vector2<f64>) -> Vector2<f64> {
        self.affine * Vector3::new(p.x, p.y, 1.0)
    }

    fn barycentric(&self, p: Vector2<f64>) -> (f64, f64, f64) {
        let [a, b, c] = self.corners;
        let denom = (b - a).perp(&(c - a));
        let u = (b - p).perp(&(c - p)) / denom;
        let v = (c - p).perp(&(a - p)) / denom;
        (u, v, 1.0 - u - v)
    }

    fn contains(&self, p: Vector2<f64>) -> bool {
        let (u, v, w) = self.barycentric(p);
        u >= -BARYCENTRIC_EPS && v >= -BARYCENTRIC_EPS && w >= -BARYCENTRIC_EPS
    }
}

/// A piecewise-affine map between two corresponding point sets. The source
/// set is triangulated; every triangle carries its own affine transform.
#[derive(Debug, Clone)]
pub struct PiecewiseAffineTransform {
    pieces: Vec<AffinePiece>,
}

impl PiecewiseAffineTransform {

    /// estimate builds the transform mapping `src` control points onto `dst`.
    ///
    /// Triangles whose source corners are collinear have no affine solution and
    /// are left out, which shows up as uncovered texels rather than an error.
    ///
    /// # Arguments
    /// * `src` - control points in source space
    /// * `dst` - corresponding points in destination space
    ///
    /// # Returns
    /// * `PiecewiseAffineTransform`
    pub fn estimate(src: &[[f64; 2]], dst: &[[f64; 2]]) -> Result<Self> {
        if src.len() != dst.len() {
            return Err(FacemeshError::InvalidInput(format!(
                "control point count mismatch: {} source, {} destination", src.len(), dst.len()
            )))
        }
        if src.len() < 3 {
            return Err(FacemeshError::InvalidInput("at least 3 control points are required".to_string()))
        }

        let triangles = delaunay_triangulate(src);
        let mut pieces: Vec<AffinePiece> = Vec::with_capacity(triangles.len());
        let mut skipped = 0usize;

        for tri in triangles {
            let src_h = Matrix3::from_columns(&[
                Vector3::new(src[tri[0]][0], src[tri[0]][1], 1.0),
                Vector3::new(src[tri[1]][0], src[tri[1]][1], 1.0),
                Vector3::new(src[tri[2]][0], src[tri[2]][1], 1.0),
            ]);
            let dst_m = Matrix2x3::from_columns(&[
                Vector2::new(dst[tri[0]][0], dst[tri[0]][1]),
                Vector2::new(dst[tri[1]][0], dst[tri[1]][1]),
                Vector2::new(dst[tri[2]][0], dst[tri[2]][1]),
            ]);
            let src_inv = match src_h.try_inverse() {
                None => {
                    skipped += 1;
                    continue
                }
                Some(inv) => inv,
            };
            pieces.push(AffinePiece {
                corners: [
                    Vector2::new(src[tri[0]][0], src[tri[0]][1]),
                    Vector2::new(src[tri[1]][0], src[tri[1]][1]),
                    Vector2::new(src[tri[2]][0], src[tri[2]][1]),
                ],
                affine: dst_m * src_inv,
            });
        }

        if skipped > 0 {
            warn!("{} degenerate triangles dropped from the piecewise transform", skipped);
        }
        debug!("piecewise affine transform with {} triangles", pieces.len());
        Ok(PiecewiseAffineTransform { pieces })
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// apply maps a source-space point, or returns `None` outside the
    /// triangulated hull.
    pub fn apply(&self, p: [f64; 2]) -> Option<[f64; 2]> {
        let p = Vector2::new(p[0], p[1]);
        self.pieces
            .iter()
            .find(|piece| piece.contains(p))
            .map(|piece| {
                let q = piece.apply(p);
                [q.x, q.y]
            })
    }

    /// warp fills a `width x height` image by mapping every output pixel
    /// through the transform and sampling `image` bilinearly. Pixels outside
    /// the hull, or whose sample falls outside the source image, are black.
    pub fn warp(&self, image: &RgbImage, width: u32, height: u32) -> RgbImage {
        let mut output = RgbImage::new(width, height);
        if width == 0 || height == 0 {
            return output
        }

        let owners = self.piece_owners(width, height);
        warp_into_with(
            image,
            |x, y| {
                let owner = owners.get(y as usize * width as usize + x as usize).copied().flatten();
                match owner {
                    None => OUTSIDE,
                    Some(idx) => {
                        let q = self.pieces[idx].apply(Vector2::new(x as f64, y as f64));
                        (q.x as f32, q.y as f32)
                    }
                }
            },
            Interpolation::Bilinear,
            Rgb([0, 0, 0]),
            &mut output,
        );
        output
    }

    /// piece_owners assigns every output pixel to the first triangle that
    /// contains it.
    fn piece_owners(&self, width: u32, height: u32) -> Vec<Option<usize>> {
        let mut owners = vec![None; width as usize * height as usize];
        for (idx, piece) in self.pieces.iter().enumerate() {
            let xs = piece.corners.iter().map(|c| c.x);
            let ys = piece.corners.iter().map(|c| c.y);
            let min_x = xs.clone().fold(f64::MAX, f64::min).floor().max(0.0);
            let max_x = xs.fold(f64::MIN, f64::max).ceil().min((width - 1) as f64);
            let min_y = ys.clone().fold(f64::MAX, f64::min).floor().max(0.0);
            let max_y = ys.fold(f64::MIN, f64::max).ceil().min((height - 1) as f64);
            if min_x > max_x || min_y > max_y {
                continue
            }

            for y in (min_y as u32)..=(max_y as u32) {
                for x in (min_x as u32)..=(max_x as u32) {
                    let slot = &mut owners[y as usize * width as usize + x as usize];
                    if slot.is_none() && piece.contains(Vector2::new(x as f64, y as f64)) {
                        *slot = Some(idx);
                    }
                }
            }
        }
        owners
    }
}

/// warp_texture resamples the source photo into the canonical UV layout.
///
/// UV coordinates are scaled to `size x size` pixels and used as control
/// points; the transform maps them onto the detected landmark pixels.
///
/// # Arguments
/// * `uv_map` - `(N, 2)` unit-square UV coordinates per landmark
/// * `keypoints` - `(N, 2)` landmark positions in source image pixels
/// * `image` - source photo
/// * `size` - output texture edge length
///
/// # Returns
/// * `RgbImage`
pub fn warp_texture(uv_map: &Array2<f64>, keypoints: &Array2<f64>, image: &DynamicImage, size: u32) -> Result<RgbImage> {
    let scale = size as f64;
    let keypoints_uv: Vec<[f64; 2]> = uv_map
        .rows()
        .into_iter()
        .map(|row| [scale * row[0], scale * row[1]])
        .collect();
    let keypoints_img = array2_to_pairs(keypoints);

    let transform = PiecewiseAffineTransform::estimate(&keypoints_uv, &keypoints_img)?;
    let texture = transform.warp(&image.to_rgb8(), size, size);
    debug!("warped {}x{} source into {}x{} texture", image.width(), image.height(), size, size);
    Ok(texture)
}
