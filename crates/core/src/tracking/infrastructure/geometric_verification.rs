//! Model fitting used to verify that a candidate object really appears in
//! a frame: planar homographies and fundamental matrices, both estimated
//! with normalised direct linear transforms and wrapped in RANSAC.
//!
//! Every model maps object coordinates (`src`) to frame coordinates
//! (`dst`).

use std::f64::consts::SQRT_2;

use float_ord::FloatOrd;
use nalgebra::{Matrix3, SMatrix, SVector, SymmetricEigen, Vector3};
use rand::seq::index;
use rand::Rng;

pub type Point = (f32, f32);

/// Side of the square mapped by [`homography_is_plausible`].
const PLAUSIBILITY_SIDE: f32 = 200.0;
const MIN_EDGE: f64 = 20.0;
const MAX_EDGE: f64 = 2000.0;
const MAX_EDGE_RATIO: f64 = 2.5;
const MAX_REFINEMENTS: usize = 16;
const EIGEN_MAX_ITERATIONS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RansacParams {
    pub max_iterations: usize,
    /// Residual below which a pair counts as an inlier.
    pub threshold: f32,
    /// Stop sampling as soon as a model reaches this support.
    pub stop_support: usize,
}

#[derive(Clone, Debug)]
pub struct ModelFit {
    pub model: Matrix3<f64>,
    /// Indices of the pairs within `threshold` of the model, ascending.
    pub inliers: Vec<usize>,
}

impl ModelFit {
    pub fn support(&self) -> usize {
        self.inliers.len()
    }
}

/// Applies `h` to `p` with the projective division.
pub fn transform_point(h: &Matrix3<f64>, p: Point) -> Point {
    let q = h * Vector3::new(p.0 as f64, p.1 as f64, 1.0);
    ((q.x / q.z) as f32, (q.y / q.z) as f32)
}

pub fn distance(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Distance between `dst` and the image of `src` under `h`.
pub fn reprojection_error(h: &Matrix3<f64>, src: Point, dst: Point) -> f32 {
    distance(transform_point(h, src), dst)
}

pub fn homography_inverse(h: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    h.try_inverse().and_then(normalize_scale)
}

fn normalize_scale(h: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let s = h[(2, 2)];
    if s.abs() < 1e-12 || !h.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(h / s)
}

/// Similarity moving the centroid of `points` to the origin with a mean
/// distance of sqrt(2).
fn normalizer(points: &[Point]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.0 as f64, sy + p.1 as f64));
    let (cx, cy) = (sx / n, sy / n);
    let mean = points
        .iter()
        .map(|p| ((p.0 as f64 - cx).powi(2) + (p.1 as f64 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean > f64::EPSILON { SQRT_2 / mean } else { 1.0 };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn apply(t: &Matrix3<f64>, p: Point) -> (f64, f64) {
    (
        t[(0, 0)] * p.0 as f64 + t[(0, 2)],
        t[(1, 1)] * p.1 as f64 + t[(1, 2)],
    )
}

/// Unit vector minimising `x^T A x`, reshaped row-major into a 3x3 matrix.
fn null_vector(ata: SMatrix<f64, 9, 9>) -> Option<Matrix3<f64>> {
    let eig = SymmetricEigen::try_new(ata, f64::EPSILON, EIGEN_MAX_ITERATIONS)?;
    let (smallest, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by_key(|(_, v)| FloatOrd(**v))?;
    let column: Vec<f64> = eig.eigenvectors.column(smallest).iter().copied().collect();
    Some(Matrix3::from_row_slice(&column))
}

/// Least-squares homography through at least four pairs.
pub fn homography_from_pairs(src: &[Point], dst: &[Point]) -> Option<Matrix3<f64>> {
    if src.len() < 4 || src.len() != dst.len() {
        return None;
    }
    let ts = normalizer(src);
    let td = normalizer(dst);
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (a, b) in src.iter().zip(dst) {
        let (x, y) = apply(&ts, *a);
        let (xp, yp) = apply(&td, *b);
        let r1 = SVector::<f64, 9>::from_column_slice(&[
            -x, -y, -1.0, 0.0, 0.0, 0.0, xp * x, xp * y, xp,
        ]);
        let r2 = SVector::<f64, 9>::from_column_slice(&[
            0.0, 0.0, 0.0, -x, -y, -1.0, yp * x, yp * y, yp,
        ]);
        ata += r1 * r1.transpose();
        ata += r2 * r2.transpose();
    }
    let hn = null_vector(ata)?;
    let h = normalize_scale(td.try_inverse()? * hn * ts)?;
    if h.determinant().abs() < 1e-12 {
        return None;
    }
    Some(h)
}

/// Fundamental matrix through at least eight pairs, with `dst^T F src = 0`.
/// The result has rank two and unit Frobenius norm.
pub fn fundamental_from_pairs(src: &[Point], dst: &[Point]) -> Option<Matrix3<f64>> {
    if src.len() < 8 || src.len() != dst.len() {
        return None;
    }
    let ts = normalizer(src);
    let td = normalizer(dst);
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (a, b) in src.iter().zip(dst) {
        let (x, y) = apply(&ts, *a);
        let (xp, yp) = apply(&td, *b);
        let r = SVector::<f64, 9>::from_column_slice(&[
            xp * x, xp * y, xp, yp * x, yp * y, yp, x, y, 1.0,
        ]);
        ata += r * r.transpose();
    }
    let full = null_vector(ata)?;
    let mut svd = full.svd(true, true);
    svd.singular_values[2] = 0.0;
    let rank2 = svd.recompose().ok()?;
    let f = td.transpose() * rank2 * ts;
    let norm = f.norm();
    if norm < 1e-12 || !norm.is_finite() {
        return None;
    }
    Some(f / norm)
}

/// Distance in pixels from `dst` to the epipolar line of `src`.
pub fn epipolar_distance(f: &Matrix3<f64>, src: Point, dst: Point) -> f32 {
    let line = f * Vector3::new(src.0 as f64, src.1 as f64, 1.0);
    let norm = (line.x * line.x + line.y * line.y).sqrt();
    if norm < 1e-12 {
        return f32::INFINITY;
    }
    ((line.x * dst.0 as f64 + line.y * dst.1 as f64 + line.z).abs() / norm) as f32
}

fn ransac<R, Fit, Err>(
    n: usize,
    sample_size: usize,
    params: &RansacParams,
    rng: &mut R,
    fit: Fit,
    residual: Err,
) -> Option<ModelFit>
where
    R: Rng + ?Sized,
    Fit: Fn(&[usize]) -> Option<Matrix3<f64>>,
    Err: Fn(&Matrix3<f64>, usize) -> f32,
{
    if n < sample_size {
        return None;
    }
    let mut best: Option<ModelFit> = None;
    for _ in 0..params.max_iterations {
        let sample = index::sample(rng, n, sample_size).into_vec();
        let Some(model) = fit(&sample) else {
            continue;
        };
        let inliers: Vec<usize> = (0..n)
            .filter(|&i| residual(&model, i) < params.threshold)
            .collect();
        if best.as_ref().map_or(true, |b| inliers.len() > b.inliers.len()) {
            let done = inliers.len() >= params.stop_support;
            best = Some(ModelFit { model, inliers });
            if done {
                break;
            }
        }
    }
    best
}

fn subset(points: &[Point], indices: &[usize]) -> Vec<Point> {
    indices.iter().map(|&i| points[i]).collect()
}

/// Four-point RANSAC homography. Returns the best sampled model; callers
/// usually follow with [`refine_homography`].
pub fn ransac_homography<R: Rng + ?Sized>(
    src: &[Point],
    dst: &[Point],
    params: &RansacParams,
    rng: &mut R,
) -> Option<ModelFit> {
    if src.len() != dst.len() {
        return None;
    }
    ransac(
        src.len(),
        4,
        params,
        rng,
        |s| homography_from_pairs(&subset(src, s), &subset(dst, s)),
        |h, i| reprojection_error(h, src[i], dst[i]),
    )
}

/// Refits on the inliers until the inlier set stops changing size.
pub fn refine_homography(src: &[Point], dst: &[Point], fit: ModelFit, threshold: f32) -> ModelFit {
    let mut current = fit;
    for _ in 0..MAX_REFINEMENTS {
        let Some(model) =
            homography_from_pairs(&subset(src, &current.inliers), &subset(dst, &current.inliers))
        else {
            break;
        };
        let inliers: Vec<usize> = (0..src.len())
            .filter(|&i| reprojection_error(&model, src[i], dst[i]) < threshold)
            .collect();
        if inliers.len() < 4 {
            break;
        }
        let stable = inliers.len() == current.inliers.len();
        current = ModelFit { model, inliers };
        if stable {
            break;
        }
    }
    current
}

/// Eight-point RANSAC fundamental matrix, refitted once on its inliers.
pub fn ransac_fundamental<R: Rng + ?Sized>(
    src: &[Point],
    dst: &[Point],
    params: &RansacParams,
    rng: &mut R,
) -> Option<ModelFit> {
    if src.len() != dst.len() {
        return None;
    }
    let best = ransac(
        src.len(),
        8,
        params,
        rng,
        |s| fundamental_from_pairs(&subset(src, s), &subset(dst, s)),
        |f, i| epipolar_distance(f, src[i], dst[i]),
    )?;
    let Some(model) = fundamental_from_pairs(&subset(src, &best.inliers), &subset(dst, &best.inliers))
    else {
        return Some(best);
    };
    let inliers: Vec<usize> = (0..src.len())
        .filter(|&i| epipolar_distance(&model, src[i], dst[i]) < params.threshold)
        .collect();
    if inliers.len() >= best.inliers.len() {
        Some(ModelFit { model, inliers })
    } else {
        Some(best)
    }
}

/// Rejects homographies that squash, stretch or fold a reference square
/// beyond what a real view of a planar object produces.
pub fn homography_is_plausible(h: &Matrix3<f64>) -> bool {
    let s = PLAUSIBILITY_SIDE;
    let corners = [(0.0, 0.0), (s, 0.0), (s, s), (0.0, s)].map(|p| transform_point(h, p));
    let edges: [f64; 4] =
        std::array::from_fn(|i| distance(corners[i], corners[(i + 1) % 4]) as f64);
    if edges.iter().any(|e| !(MIN_EDGE..=MAX_EDGE).contains(e)) {
        return false;
    }
    let ratio_ok = |a: f64, b: f64| (1.0 / MAX_EDGE_RATIO..=MAX_EDGE_RATIO).contains(&(a / b));
    ratio_ok(edges[0], edges[2])
        && ratio_ok(edges[1], edges[3])
        && ratio_ok(edges[0], edges[1])
        && ratio_ok(edges[2], edges[3])
}
