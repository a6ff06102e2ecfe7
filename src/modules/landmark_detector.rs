use std::cell::Cell;
use std::path::Path;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use crate::error::error::{FacemeshError, Result};
use crate::utils::coordinate::{Landmark, LandmarkSet};
use crate::utils::image::{has_alpha, strip_alpha};

/// A face-mesh landmark model. `Ok(None)` means the image was understood but
/// no face was found; `UnsupportedEncoding` means the pixels were rejected.
pub trait LandmarkDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Option<LandmarkSet>>;
}

/// detect_with_alpha_fallback runs the detector, retrying exactly once on an
/// alpha-stripped copy when the first attempt rejects the encoding.
///
/// # Arguments
/// * `detector` - landmark model
/// * `image` - decoded input image
///
/// # Returns
/// * `(Option<LandmarkSet>, DynamicImage)` - the landmarks and the image they
///   were computed on, so texturing samples the same pixels.
pub fn detect_with_alpha_fallback(detector: &dyn LandmarkDetector, image: DynamicImage) -> Result<(Option<LandmarkSet>, DynamicImage)> {
    match detector.detect(&image) {
        Ok(landmarks) => Ok((landmarks, image)),
        Err(FacemeshError::UnsupportedEncoding(reason)) => {
            warn!("detector rejected image encoding ({}), retrying without alpha", reason);
            let rgb = strip_alpha(&image);
            match detector.detect(&rgb) {
                Ok(landmarks) => Ok((landmarks, rgb)),
                Err(FacemeshError::UnsupportedEncoding(reason)) => Err(FacemeshError::InvalidInput(format!(
                    "unable to use this image ({}), please try a JPG/JPEG image instead", reason
                ))),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SidecarFile {
    Frames { frames: Vec<Option<Vec<Landmark>>> },
    Single { landmarks: Vec<Landmark> },
}

/// Replays detections recorded as JSON by an external face-mesh model.
///
/// Each call to `detect` consumes the next recorded frame; a `null` frame is a
/// frame without a face. Once the recording is exhausted every call reports no
/// face.
#[derive(Debug)]
pub struct SidecarLandmarkDetector {
    frames: Vec<Option<LandmarkSet>>,
    cursor: Cell<usize>,
    accepts_alpha: bool,
}

impl SidecarLandmarkDetector {
    pub fn new(frames: Vec<Option<LandmarkSet>>) -> Self {
        SidecarLandmarkDetector {
            frames,
            cursor: Cell::new(0),
            accepts_alpha: true,
        }
    }

    /// from_json parses `{"landmarks": [...]}` or `{"frames": [[...], null, ...]}`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let parsed: SidecarFile = serde_json::from_str(raw)?;
        let frames = match parsed {
            SidecarFile::Single { landmarks } => vec![Some(LandmarkSet::new(landmarks)?)],
            SidecarFile::Frames { frames } => frames
                .into_iter()
                .map(|frame| frame.map(LandmarkSet::new).transpose())
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(SidecarLandmarkDetector::new(frames))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let detector = SidecarLandmarkDetector::from_json(&raw)?;
        info!("loaded {} recorded landmark frames from {:?}", detector.frames.len(), path);
        Ok(detector)
    }

    /// with_accepts_alpha controls whether images carrying an alpha channel are
    /// rejected the way the face-mesh model rejects them.
    pub fn with_accepts_alpha(mut self, accepts_alpha: bool) -> Self {
        self.accepts_alpha = accepts_alpha;
        self
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }
}

impl LandmarkDetector for SidecarLandmarkDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Option<LandmarkSet>> {
        if !self.accepts_alpha && has_alpha(image) {
            return Err(FacemeshError::UnsupportedEncoding(format!("{:?} input", image.color())))
        }

        let idx = self.cursor.get();
        self.cursor.set(idx + 1);
        let frame = self.frames.get(idx).cloned().flatten();
        debug!("frame {}: face {}", idx, if frame.is_some() { "found" } else { "not found" });
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use image::{RgbImage, RgbaImage};
    use crate::utils::coordinate::NUM_LANDMARKS;
    use crate::utils::coordinate::tests::synthetic_landmarks;
    use super::*;

    fn frames_json() -> String {
        let frame = serde_json::to_string(&synthetic_landmarks()).unwrap();
        format!(r#"{{"frames": [{}, null, {}]}}"#, frame, frame)
    }

    #[test]
    fn test_sidecar_replays_frames_in_order() {
        let detector = SidecarLandmarkDetector::from_json(&frames_json()).unwrap();
        let img = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        assert_eq!(detector.num_frames(), 3);

        assert_eq!(detector.detect(&img).unwrap().unwrap().points().len(), NUM_LANDMARKS);
        assert!(detector.detect(&img).unwrap().is_none());
        assert!(detector.detect(&img).unwrap().is_some());
        assert!(detector.detect(&img).unwrap().is_none());
    }

    #[test]
    fn test_sidecar_single_detection() {
        let raw = format!(r#"{{"landmarks": {}}}"#, serde_json::to_string(&synthetic_landmarks()).unwrap());
        let detector = SidecarLandmarkDetector::from_json(&raw).unwrap();
        assert_eq!(detector.num_frames(), 1);
    }

    #[test]
    fn test_sidecar_rejects_short_frames() {
        let raw = r#"{"landmarks": [{"x": 0.1, "y": 0.2, "z": 0.0}]}"#;
        assert!(matches!(
            SidecarLandmarkDetector::from_json(raw),
            Err(FacemeshError::LandmarkCount { .. })
        ));
    }

    #[test]
    fn test_alpha_image_is_retried_once_without_alpha() {
        let detector = SidecarLandmarkDetector::from_json(&frames_json()).unwrap().with_accepts_alpha(false);
        let img = DynamicImage::ImageRgba8(RgbaImage::new(8, 8));

        let (landmarks, used) = detect_with_alpha_fallback(&detector, img).unwrap();
        assert!(landmarks.is_some());
        assert!(!has_alpha(&used));
    }

    struct AlwaysRejects;

    impl LandmarkDetector for AlwaysRejects {
        fn detect(&self, _image: &DynamicImage) -> Result<Option<LandmarkSet>> {
            Err(FacemeshError::UnsupportedEncoding("corrupt".to_string()))
        }
    }

    #[test]
    fn test_second_rejection_is_invalid_input() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(8, 8));
        match detect_with_alpha_fallback(&AlwaysRejects, img) {
            Err(FacemeshError::InvalidInput(msg)) => assert!(msg.contains("JPG")),
            other => panic!("unexpected result {:?}", other.map(|(l, _)| l)),
        }
    }
}
