use nalgebra::Vector3;
use ndarray::{Array2, Axis};
use tracing::debug;
use crate::error::error::{FacemeshError, Result};
use crate::utils::coordinate::{ANCHOR, BROW_CENTER, CHIN, FACE_EDGE_LEFT, FACE_EDGE_RIGHT, FOREHEAD, NUM_LANDMARKS};
use crate::utils::utils::{row_to_vector3, sub_row};

const DEGENERATE_EPS: f64 = 1e-12;

/// The face-relative frame built from the side-to-side and forehead-to-chin
/// directions. `axis3` is the face normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBasis {
    pub axis1: Vector3<f64>,
    pub axis2: Vector3<f64>,
    pub axis3: Vector3<f64>,
}

impl FaceBasis {

    /// from_keypoints constructs the basis from a cloud already centred on the anchor.
    ///
    /// axis3 must come from the cross product before axis1 is recomputed,
    /// otherwise the three axes are not mutually orthogonal.
    pub fn from_keypoints(keypoints: &Array2<f64>) -> Result<Self> {
        check_cloud(keypoints)?;
        let axis1 = row_to_vector3(keypoints, FACE_EDGE_RIGHT) - row_to_vector3(keypoints, FACE_EDGE_LEFT);
        let axis2 = row_to_vector3(keypoints, FOREHEAD) - row_to_vector3(keypoints, CHIN);

        let axis3 = normalized(axis2.cross(&axis1), "face normal")?;
        let axis2 = normalized(axis2, "forehead-to-chin axis")?;
        let axis1 = normalized(axis3.cross(&axis2), "side-to-side axis")?;

        Ok(FaceBasis { axis1, axis2, axis3 })
    }

    /// matrix stacks `[axis3, axis2, axis1]` as rows.
    pub fn matrix(&self) -> Array2<f64> {
        let mut u = Array2::<f64>::zeros((3, 3));
        for (row, axis) in [self.axis3, self.axis2, self.axis1].iter().enumerate() {
            for col in 0..3 {
                u[[row, col]] = axis[col];
            }
        }
        u
    }
}

fn check_cloud(keypoints: &Array2<f64>) -> Result<()> {
    if keypoints.ncols() != 3 {
        return Err(FacemeshError::InvalidInput(format!("expected (N, 3) keypoints, got {:?}", keypoints.dim())))
    }
    if keypoints.nrows() < NUM_LANDMARKS {
        return Err(FacemeshError::LandmarkCount { expected: NUM_LANDMARKS, found: keypoints.nrows() })
    }
    Ok(())
}

fn normalized(v: Vector3<f64>, name: &'static str) -> Result<Vector3<f64>> {
    let norm = v.norm();
    if !norm.is_finite() || norm < DEGENERATE_EPS {
        return Err(FacemeshError::DegenerateBasis(name))
    }
    Ok(v / norm)
}

/// normalize_keypoints re-centres the landmark cloud and re-expresses it in
/// the face basis.
///
/// The cloud is translated so the anchor sits at the origin, multiplied by the
/// basis matrix and finally centred on its own centroid.
///
/// # Arguments
/// * `keypoints` - `(468, 3)` cloud from `LandmarkSet::to_keypoints3d`
///
/// # Returns
/// * `(Array2<f64>, FaceBasis)`
pub fn normalize_keypoints(keypoints: &Array2<f64>) -> Result<(Array2<f64>, FaceBasis)> {
    check_cloud(keypoints)?;
    let center = keypoints.row(ANCHOR).to_owned();
    let centered = keypoints - &center;

    let basis = FaceBasis::from_keypoints(&centered)?;
    let projected = centered.dot(&basis.matrix());

    let mean = match projected.mean_axis(Axis(0)) {
        None => {
            return Err(FacemeshError::InvalidInput("empty landmark cloud".to_string()))
        }
        Some(mean) => mean,
    };
    let normalized = projected - &mean;

    debug!("normalized {} keypoints, face normal {:?}", normalized.nrows(), basis.axis3.as_slice());
    Ok((normalized, basis))
}

/// rotate_around_origin applies a 2D rotation to one pair of coordinate axes
/// of every point.
///
/// With `angle = atan2(p[opp], p[adj])` this zeroes `p[opp]`.
pub fn rotate_around_origin(keypoints: &mut Array2<f64>, opp_side: usize, adj_side: usize, angle: f64) {
    let (sin, cos) = angle.sin_cos();
    for mut row in keypoints.rows_mut() {
        let opp = row[opp_side];
        let adj = row[adj_side];
        row[opp_side] = cos * opp - sin * adj;
        row[adj_side] = cos * adj + sin * opp;
    }
}

/// align_keypoints_to_grid turns a normalized cloud to a canonical pose.
///
/// Three rotations are computed and applied one after another, each from the
/// current state of the cloud:
/// 1. (Z, Y) from the forehead, so the face is upright;
/// 2. (X, Y) from the brow centre, to remove forward/back tilt;
/// 3. (Z, X) from the cheek edges about their midpoint, so the face looks
///    down the camera axis.
///
/// The order is part of the contract. Bone placement depends on this frame.
pub fn align_keypoints_to_grid(keypoints: &Array2<f64>) -> Result<Array2<f64>> {
    check_cloud(keypoints)?;
    let mut keypoints = sub_row(keypoints, ANCHOR);

    let (adj_side, opp_side) = (keypoints[[FOREHEAD, 1]], keypoints[[FOREHEAD, 2]]);
    rotate_around_origin(&mut keypoints, 2, 1, opp_side.atan2(adj_side));

    let (adj_side, opp_side) = (keypoints[[BROW_CENTER, 1]], keypoints[[BROW_CENTER, 0]]);
    rotate_around_origin(&mut keypoints, 0, 1, opp_side.atan2(adj_side));

    let middle = (&keypoints.row(FACE_EDGE_RIGHT) + &keypoints.row(FACE_EDGE_LEFT)) / 2.0;
    let mut keypoints = keypoints - &middle;
    let (adj_side, opp_side) = (keypoints[[FACE_EDGE_RIGHT, 0]], keypoints[[FACE_EDGE_RIGHT, 2]]);
    rotate_around_origin(&mut keypoints, 2, 0, opp_side.atan2(adj_side));

    Ok(sub_row(&keypoints, ANCHOR))
}
