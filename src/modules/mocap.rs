use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use image::{DynamicImage, GenericImageView, ImageFormat};
use nalgebra::Vector3;
use ndarray::{Array2, Array3};
use tracing::{debug, info, warn};
use crate::error::error::{FacemeshError, Result};
use crate::modules::landmark_detector::{detect_with_alpha_fallback, LandmarkDetector};
use crate::utils::coordinate::{Landmark, LandmarkSet, NOSE_TIP, NUM_LANDMARKS};
use crate::utils::image::load_image;

/// A blocking source of frames. `Ok(None)` ends the capture.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>>;
}

/// Yields one still image, once.
pub struct StillImageSource {
    path: PathBuf,
    done: bool,
}

impl StillImageSource {
    pub fn new(path: &Path) -> Self {
        StillImageSource { path: path.to_path_buf(), done: false }
    }
}

impl FrameSource for StillImageSource {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>> {
        if self.done {
            return Ok(None)
        }
        self.done = true;
        load_image(&self.path).map(Some)
    }
}

/// Frames stored as image files in one directory, read in file-name order.
pub struct ImageSequenceSource {
    frames: VecDeque<PathBuf>,
}

impl ImageSequenceSource {
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut frames: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && ImageFormat::from_path(&path).is_ok() {
                frames.push(path);
            }
        }
        frames.sort();
        info!("found {} frame images in {:?}", frames.len(), dir);
        Ok(ImageSequenceSource { frames: frames.into() })
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>> {
        match self.frames.pop_front() {
            None => Ok(None),
            Some(path) => load_image(&path).map(Some),
        }
    }
}

#[cfg(feature = "opencv")]
pub use video::VideoCaptureSource;

#[cfg(feature = "opencv")]
mod video {
    use image::{DynamicImage, Rgb, RgbImage};
    use opencv::core::{Mat, Vec3b};
    use opencv::prelude::*;
    use opencv::videoio::{VideoCapture, CAP_ANY};
    use crate::config::config::CaptureInput;
    use crate::error::error::{FacemeshError, Result};
    use super::FrameSource;

    fn cv_error(e: opencv::Error) -> FacemeshError {
        FacemeshError::InvalidInput(format!("video capture: {}", e))
    }

    /// Frames from a video file or a live camera.
    pub struct VideoCaptureSource {
        capture: VideoCapture,
    }

    impl VideoCaptureSource {
        pub fn open(input: &CaptureInput) -> Result<Self> {
            let capture = match input {
                CaptureInput::File(path) => VideoCapture::from_file(&path.to_string_lossy(), CAP_ANY),
                CaptureInput::Camera(index) => VideoCapture::new(*index, CAP_ANY),
            }
            .map_err(cv_error)?;

            if !capture.is_opened().map_err(cv_error)? {
                return Err(FacemeshError::InvalidInput(format!("could not open capture source {:?}", input)))
            }
            Ok(VideoCaptureSource { capture })
        }
    }

    impl FrameSource for VideoCaptureSource {
        fn next_frame(&mut self) -> Result<Option<DynamicImage>> {
            let mut frame = Mat::default();
            if !self.capture.read(&mut frame).map_err(cv_error)? || frame.empty() {
                return Ok(None)
            }

            let size = frame.size().map_err(cv_error)?;
            let mut rgb = RgbImage::new(size.width as u32, size.height as u32);
            for y in 0..size.height {
                for x in 0..size.width {
                    let bgr = frame.at_2d::<Vec3b>(y, x).map_err(cv_error)?;
                    rgb.put_pixel(x as u32, y as u32, Rgb([bgr[2], bgr[1], bgr[0]]));
                }
            }
            Ok(Some(DynamicImage::ImageRgb8(rgb)))
        }
    }
}

/// get_vector places a landmark in scene space: image x to scene X, depth to
/// scene Y and image y (downward) to scene Z (upward), divided by `scaler`.
pub fn get_vector(landmark: &Landmark, width: u32, height: u32, scaler: f64) -> Vector3<f64> {
    let (w, h) = (width as f64, height as f64);
    Vector3::new(
        landmark.x * w / scaler,
        landmark.z * w / scaler,
        -landmark.y * h / scaler,
    )
}

/// face_to_scene converts one detection to scene space with the nose tip on
/// the origin. The result has one row per landmark.
pub fn face_to_scene(landmarks: &LandmarkSet, width: u32, height: u32, scaler: f64) -> Array2<f64> {
    let nose = get_vector(&landmarks.points()[NOSE_TIP], width, height, scaler);
    let mut points = Array2::<f64>::zeros((landmarks.points().len(), 3));
    for (i, landmark) in landmarks.points().iter().enumerate() {
        let v = get_vector(landmark, width, height, scaler) - nose;
        points[[i, 0]] = v.x;
        points[[i, 1]] = v.y;
        points[[i, 2]] = v.z;
    }
    points
}

#[derive(Debug, Clone, Default)]
pub struct CaptureReport {
    pub frames_read: usize,
    pub frames_skipped: usize,
    /// One `NUM_LANDMARKS x 3` scene-space array per frame with a face.
    pub faces: Vec<Array2<f64>>,
}

/// run_capture reads frames until the source is exhausted. Frames without a
/// face are skipped.
pub fn run_capture(source: &mut dyn FrameSource, detector: &dyn LandmarkDetector, scaler: f64) -> Result<CaptureReport> {
    let mut report = CaptureReport::default();

    while let Some(frame) = source.next_frame()? {
        let frame_idx = report.frames_read;
        report.frames_read += 1;
        let (width, height) = frame.dimensions();

        let (landmarks, _) = detect_with_alpha_fallback(detector, frame)?;
        match landmarks {
            None => {
                debug!("frame {}: no face, skipped", frame_idx);
                report.frames_skipped += 1;
            }
            Some(landmarks) => {
                report.faces.push(face_to_scene(&landmarks, width, height, scaler));
                debug!("frame {}: face captured", frame_idx);
            }
        }
    }

    if report.frames_skipped > 0 {
        warn!("{} of {} frames had no face", report.frames_skipped, report.frames_read);
    }
    info!("captured {} faces from {} frames", report.faces.len(), report.frames_read);
    Ok(report)
}

/// export_npy stores the captured faces as one `frames x 468 x 3` array.
pub fn export_npy(faces: &[Array2<f64>], path: &Path) -> Result<()> {
    let mut stacked = Array3::<f64>::zeros((faces.len(), NUM_LANDMARKS, 3));
    for (i, face) in faces.iter().enumerate() {
        if face.dim() != (NUM_LANDMARKS, 3) {
            return Err(FacemeshError::InvalidInput(format!("frame {} has shape {:?}", i, face.dim())))
        }
        stacked.index_axis_mut(ndarray::Axis(0), i).assign(face);
    }
    ndarray_npy::write_npy(path, &stacked)?;
    info!("exported {} frames to {:?}", faces.len(), path);
    Ok(())
}
