use ndarray::Array2;
use serde::{Deserialize, Serialize};
use crate::error::error::{FacemeshError, Result};

/// Number of face-mesh landmarks the reconstruction works with. Detectors
/// that emit refined iris points return more; everything past this is dropped.
pub const NUM_LANDMARKS: usize = 468;

/// Anchor point the normalized cloud is centred on.
pub const ANCHOR: usize = 0;
pub const NOSE_TIP: usize = 1;
pub const BROW_CENTER: usize = 9;
pub const FOREHEAD: usize = 10;
pub const CHIN: usize = 152;
pub const FACE_EDGE_LEFT: usize = 234;
pub const FACE_EDGE_RIGHT: usize = 454;

/// A single detected point. `x` and `y` are normalized to the image width and
/// height, `z` is a depth estimate on roughly the same scale as `x`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Landmark {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Landmark {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Landmark { x, y, z }
    }
}

/// The ordered landmark output of one detection. Indices carry anatomical
/// meaning and the set is never reordered after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet {
    points: Vec<Landmark>,
}

impl LandmarkSet {

    /// new builds a landmark set from detector output.
    ///
    /// Points beyond [`NUM_LANDMARKS`] are discarded; fewer is an error.
    pub fn new(mut points: Vec<Landmark>) -> Result<Self> {
        if points.len() < NUM_LANDMARKS {
            return Err(FacemeshError::LandmarkCount { expected: NUM_LANDMARKS, found: points.len() })
        }
        points.truncate(NUM_LANDMARKS);
        Ok(LandmarkSet { points })
    }

    pub fn points(&self) -> &[Landmark] {
        &self.points
    }

    pub fn get(&self, idx: usize) -> Option<&Landmark> {
        self.points.get(idx)
    }

    /// to_keypoints3d restores the face's aspect ratio.
    ///
    /// X and Z are normalized to the image width, Y to its height, so X and Z
    /// are scaled by `width / height` to bring all three axes to one unit.
    ///
    /// # Arguments
    /// * `width` - source image width in pixels
    /// * `height` - source image height in pixels
    ///
    /// # Returns
    /// * `Array2<f64>` of shape `(468, 3)`
    pub fn to_keypoints3d(&self, width: u32, height: u32) -> Array2<f64> {
        let width_ratio = width as f64 / height as f64;
        let mut keypoints = Array2::<f64>::zeros((self.points.len(), 3));
        for (idx, point) in self.points.iter().enumerate() {
            keypoints[[idx, 0]] = width_ratio * point.x;
            keypoints[[idx, 1]] = point.y;
            keypoints[[idx, 2]] = width_ratio * point.z;
        }
        keypoints
    }

    /// to_pixel_keypoints returns the landmark positions in source image pixels.
    ///
    /// # Returns
    /// * `Array2<f64>` of shape `(468, 2)`
    pub fn to_pixel_keypoints(&self, width: u32, height: u32) -> Array2<f64> {
        let mut keypoints = Array2::<f64>::zeros((self.points.len(), 2));
        for (idx, point) in self.points.iter().enumerate() {
            keypoints[[idx, 0]] = width as f64 * point.x;
            keypoints[[idx, 1]] = height as f64 * point.y;
        }
        keypoints
    }
}
