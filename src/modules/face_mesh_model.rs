//! Face-mesh landmark model run through ONNX Runtime.
//!
//! The model takes a square RGB crop resized to `input_size`, laid out as a
//! `(1, 3, S, S)` tensor in `[-1, 1]`, and returns 468 (or 478 with irises)
//! points in crop pixels plus an optional face-presence logit.
//!
//! Preprocessing and decoding are plain functions over `image` and `ndarray`
//! so they build and test without the runtime; the session itself needs the
//! `onnx` feature.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use crate::error::error::{FacemeshError, Result};
use crate::utils::coordinate::{Landmark, LandmarkSet, NUM_LANDMARKS};

/// Square region of the source image handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

/// center_square_crop takes the largest centred square. Portraits are
/// assumed to be framed on the face.
pub fn center_square_crop(width: u32, height: u32) -> CropBox {
    let size = width.min(height);
    CropBox {
        x: (width - size) / 2,
        y: (height - size) / 2,
        size,
    }
}

/// to_input_tensor crops, resizes and normalizes an image into the model's
/// `(1, 3, S, S)` layout.
pub fn to_input_tensor(image: &RgbImage, crop: &CropBox, input_size: u32) -> Result<Array4<f32>> {
    if crop.size == 0 || crop.x + crop.size > image.width() || crop.y + crop.size > image.height() {
        return Err(FacemeshError::InvalidInput(format!(
            "crop {:?} does not fit a {}x{} image", crop, image.width(), image.height()
        )))
    }

    let cropped = imageops::crop_imm(image, crop.x, crop.y, crop.size, crop.size).to_image();
    let resized = imageops::resize(&cropped, input_size, input_size, FilterType::Triangle);

    let side = input_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0 * 2.0 - 1.0;
        }
    }
    Ok(tensor)
}

/// face_present applies a sigmoid to the model's presence logit.
pub fn face_present(logit: f32, threshold: f32) -> bool {
    1.0 / (1.0 + (-logit).exp()) >= threshold
}

/// decode_landmarks maps raw model output back to landmarks normalized to the
/// full image.
///
/// Any output shape holding `N * 3` values with `N >= 468` is accepted
/// (`(1, N, 3)`, `(N, 3)`, `(1, 1, 1, N * 3)`, ...). Points are in crop pixels
/// at `input_size` resolution; depth shares the x scale.
///
/// # Arguments
/// * `shape` - output tensor shape
/// * `data` - output values, row-major
/// * `crop` - crop the model ran on
/// * `input_size` - model input edge length
/// * `width`, `height` - source image size
///
/// # Returns
/// * `LandmarkSet`
pub fn decode_landmarks(
    shape: &[i64],
    data: &[f32],
    crop: &CropBox,
    input_size: u32,
    width: u32,
    height: u32,
) -> Result<LandmarkSet> {
    let total: i64 = shape.iter().product();
    if total <= 0 || total % 3 != 0 || (data.len() as i64) < total {
        return Err(FacemeshError::Model(format!(
            "unexpected landmark output shape {:?} with {} values", shape, data.len()
        )))
    }
    let num_points = total as usize / 3;
    if num_points < NUM_LANDMARKS {
        return Err(FacemeshError::LandmarkCount { expected: NUM_LANDMARKS, found: num_points })
    }

    let scale = crop.size as f64 / input_size as f64;
    let points = data[..num_points * 3]
        .chunks_exact(3)
        .map(|p| {
            Landmark::new(
                (crop.x as f64 + p[0] as f64 * scale) / width as f64,
                (crop.y as f64 + p[1] as f64 * scale) / height as f64,
                p[2] as f64 * scale / width as f64,
            )
        })
        .collect();
    LandmarkSet::new(points)
}

#[cfg(feature = "onnx")]
pub use session::OnnxFaceMeshDetector;

#[cfg(feature = "onnx")]
mod session {
    use std::path::Path;
    use std::sync::Mutex;
    use image::DynamicImage;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::Tensor;
    use tracing::{debug, info};
    use crate::config::config::DetectorConfig;
    use crate::error::error::{FacemeshError, Result};
    use crate::modules::landmark_detector::LandmarkDetector;
    use crate::utils::coordinate::LandmarkSet;
    use crate::utils::image::has_alpha;
    use super::{center_square_crop, decode_landmarks, face_present, to_input_tensor};

    /// Face-mesh model loaded into an ONNX Runtime session.
    pub struct OnnxFaceMeshDetector {
        session: Mutex<Session>,
        config: DetectorConfig,
    }

    impl OnnxFaceMeshDetector {
        pub fn load(model_path: &Path, config: DetectorConfig) -> Result<Self> {
            if !model_path.is_file() {
                return Err(FacemeshError::AssetNotFound(model_path.to_path_buf()))
            }
            let session = Session::builder()
                .map_err(|e| FacemeshError::Model(format!("session builder: {e}")))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| FacemeshError::Model(format!("optimization level: {e}")))?
                .commit_from_file(model_path)
                .map_err(|e| FacemeshError::Model(format!("load {:?}: {e}", model_path)))?;
            info!("loaded face mesh model {:?}", model_path);
            Ok(OnnxFaceMeshDetector { session: Mutex::new(session), config })
        }
    }

    impl LandmarkDetector for OnnxFaceMeshDetector {
        fn detect(&self, image: &DynamicImage) -> Result<Option<LandmarkSet>> {
            if has_alpha(image) {
                return Err(FacemeshError::UnsupportedEncoding(format!("{:?} input", image.color())))
            }
            let rgb = image.to_rgb8();
            let (width, height) = rgb.dimensions();
            let crop = center_square_crop(width, height);
            let input = to_input_tensor(&rgb, &crop, self.config.input_size)?;

            let shape: Vec<usize> = input.shape().to_vec();
            let (data, _) = input.into_raw_vec_and_offset();
            let tensor = Tensor::from_array((shape, data))
                .map_err(|e| FacemeshError::Model(format!("input tensor: {e}")))?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| FacemeshError::Model("session poisoned".to_string()))?;
            let outputs = session
                .run(ort::inputs![tensor])
                .map_err(|e| FacemeshError::Model(format!("inference: {e}")))?;

            if let Some(name) = &self.config.score_output {
                let score = outputs
                    .get(name.as_str())
                    .ok_or_else(|| FacemeshError::Model(format!("no output named '{}'", name)))?;
                let (_, values) = score
                    .try_extract_tensor::<f32>()
                    .map_err(|e| FacemeshError::Model(format!("score output: {e}")))?;
                let logit = values.first().copied().unwrap_or(f32::MIN);
                if !face_present(logit, self.config.presence_threshold) {
                    debug!("face presence logit {} below threshold", logit);
                    return Ok(None)
                }
            }

            let name = self.config.landmark_output.as_str();
            let landmarks = outputs
                .get(name)
                .ok_or_else(|| FacemeshError::Model(format!("no output named '{}'", name)))?;
            let (out_shape, values) = landmarks
                .try_extract_tensor::<f32>()
                .map_err(|e| FacemeshError::Model(format!("landmark output: {e}")))?;
            let out_shape: Vec<i64> = out_shape.iter().copied().collect();
            decode_landmarks(&out_shape, values, &crop, self.config.input_size, width, height).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use image::Rgb;
    use super::*;

    #[test]
    fn test_center_square_crop() {
        assert_eq!(center_square_crop(640, 480), CropBox { x: 80, y: 0, size: 480 });
        assert_eq!(center_square_crop(300, 500), CropBox { x: 0, y: 100, size: 300 });
    }

    #[test]
    fn test_input_tensor_layout_and_range() {
        let image = RgbImage::from_fn(40, 20, |x, _| if x < 30 { Rgb([255, 0, 128]) } else { Rgb([0, 0, 0]) });
        let crop = CropBox { x: 5, y: 0, size: 20 };
        let tensor = to_input_tensor(&image, &crop, 8).unwrap();

        assert_eq!(tensor.dim(), (1, 3, 8, 8));
        assert_relative_eq!(tensor[[0, 0, 3, 0]], 1.0, epsilon = 0.01);
        assert_relative_eq!(tensor[[0, 1, 3, 0]], -1.0, epsilon = 0.01);
        assert_relative_eq!(tensor[[0, 2, 3, 0]], 128.0 / 255.0 * 2.0 - 1.0, epsilon = 0.01);
        assert!(tensor.iter().all(|v| (-1.0..=1.0).contains(v)));

        let outside = CropBox { x: 30, y: 0, size: 20 };
        assert!(matches!(to_input_tensor(&image, &outside, 8), Err(FacemeshError::InvalidInput(_))));
    }

    #[test]
    fn test_decode_maps_crop_pixels_to_image() {
        let crop = CropBox { x: 80, y: 0, size: 480 };
        let mut data = vec![0.0f32; 478 * 3];
        data[3] = 96.0;
        data[4] = 48.0;
        data[5] = -19.2;

        let set = decode_landmarks(&[1, 478, 3], &data, &crop, 192, 640, 480).unwrap();
        assert_eq!(set.points().len(), NUM_LANDMARKS);
        let p = set.points()[1];
        assert_relative_eq!(p.x, (80.0 + 240.0) / 640.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, 120.0 / 480.0, epsilon = 1e-6);
        assert_relative_eq!(p.z, -48.0 / 640.0, epsilon = 1e-6);
        assert_relative_eq!(set.points()[0].x, 80.0 / 640.0, epsilon = 1e-9);

        let flat = decode_landmarks(&[1, 1, 1, 1404], &data[..1404], &crop, 192, 640, 480).unwrap();
        assert_eq!(flat.points()[1], p);
    }

    #[test]
    fn test_decode_rejects_bad_outputs() {
        let crop = center_square_crop(100, 100);
        assert!(matches!(
            decode_landmarks(&[1, 100, 3], &[0.0; 300], &crop, 192, 100, 100),
            Err(FacemeshError::LandmarkCount { found: 100, .. })
        ));
        assert!(matches!(
            decode_landmarks(&[1, 1405], &[0.0; 1405], &crop, 192, 100, 100),
            Err(FacemeshError::Model(_))
        ));
        assert!(matches!(
            decode_landmarks(&[468, 3], &[0.0; 10], &crop, 192, 100, 100),
            Err(FacemeshError::Model(_))
        ));
    }

    #[test]
    fn test_face_presence_threshold() {
        assert!(face_present(3.0, 0.5));
        assert!(!face_present(-3.0, 0.5));
        assert!(face_present(0.0, 0.5));
    }
}
