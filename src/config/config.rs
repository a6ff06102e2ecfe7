use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::error::error::{FacemeshError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataConfig {
    pub data_dir: PathBuf,
    pub canonical_mesh: String,
    pub uv_map: String,
    pub rig_mapping: String,
}

impl DataConfig {
    pub fn new() -> Self {
        DataConfig {
            data_dir: PathBuf::from("data"),
            canonical_mesh: "canonical_face_model.obj".to_string(),
            uv_map: "uv_map.json".to_string(),
            rig_mapping: "facemesh_rigify_mapping.json".to_string(),
        }
    }

    pub fn canonical_mesh_path(&self) -> PathBuf {
        self.data_dir.join(&self.canonical_mesh)
    }

    pub fn uv_map_path(&self) -> PathBuf {
        self.data_dir.join(&self.uv_map)
    }

    pub fn rig_mapping_path(&self) -> PathBuf {
        self.data_dir.join(&self.rig_mapping)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextureConfig {
    pub size: u32,
    pub material_name: String,
}

impl TextureConfig {
    pub fn new() -> Self {
        TextureConfig {
            size: 512,
            material_name: "FaceTexture".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Where artifacts are written. `None` writes next to the source image.
    pub output_dir: Option<PathBuf>,
}

impl OutputConfig {
    pub fn new() -> Self {
        OutputConfig { output_dir: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapConfig {
    pub threshold: f64,
    pub factor: f64,
}

impl SnapConfig {
    pub fn new() -> Self {
        SnapConfig {
            threshold: 0.05,
            factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureInput {
    File(PathBuf),
    Camera(i32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    pub scaler: f64,
    pub input: Option<CaptureInput>,
    pub npy_export: Option<PathBuf>,
}

impl CaptureConfig {
    pub fn new() -> Self {
        CaptureConfig {
            scaler: 200.0,
            input: None,
            npy_export: None,
        }
    }
}

/// Face-mesh model used when no recorded landmarks are given.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectorConfig {
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub landmark_output: String,
    /// Output carrying the face-presence logit, if the model has one.
    pub score_output: Option<String>,
    pub presence_threshold: f32,
}

impl DetectorConfig {
    pub fn new() -> Self {
        DetectorConfig {
            model_path: None,
            input_size: 192,
            landmark_output: "output".to_string(),
            score_output: None,
            presence_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default = "DataConfig::new")]
    pub data: DataConfig,
    #[serde(default = "TextureConfig::new")]
    pub texture: TextureConfig,
    #[serde(default = "OutputConfig::new")]
    pub output: OutputConfig,
    #[serde(default = "SnapConfig::new")]
    pub snap: SnapConfig,
    #[serde(default = "CaptureConfig::new")]
    pub capture: CaptureConfig,
    #[serde(default = "DetectorConfig::new")]
    pub detector: DetectorConfig,
}

impl PipelineConfig {
    pub fn new() -> Self {
        PipelineConfig {
            data: DataConfig::new(),
            texture: TextureConfig::new(),
            output: OutputConfig::new(),
            snap: SnapConfig::new(),
            capture: CaptureConfig::new(),
            detector: DetectorConfig::new(),
        }
    }

    /// from_file loads a JSON configuration. Missing sections take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&raw)?;
        debug!("loaded configuration from {:?}", path);
        Ok(config)
    }

    /// ensure_ready checks, once at startup, that every packaged asset is
    /// present and that the configured capture input can be opened by this
    /// build.
    pub fn ensure_ready(&self) -> Result<()> {
        for path in [
            self.data.canonical_mesh_path(),
            self.data.uv_map_path(),
            self.data.rig_mapping_path(),
        ] {
            if !path.is_file() {
                return Err(FacemeshError::EnvironmentNotReady(format!("missing data asset {:?}", path)))
            }
        }

        if self.texture.size == 0 {
            return Err(FacemeshError::EnvironmentNotReady("texture size must be positive".to_string()))
        }

        if let Some(model_path) = &self.detector.model_path {
            if !cfg!(feature = "onnx") {
                return Err(FacemeshError::EnvironmentNotReady(
                    "a landmark model is configured but this build lacks the `onnx` feature".to_string(),
                ))
            }
            if !model_path.is_file() {
                return Err(FacemeshError::EnvironmentNotReady(format!("missing landmark model {:?}", model_path)))
            }
        }
        if self.detector.input_size == 0 {
            return Err(FacemeshError::EnvironmentNotReady("model input size must be positive".to_string()))
        }

        if let Some(CaptureInput::Camera(_)) = &self.capture.input {
            if !cfg!(feature = "opencv") {
                return Err(FacemeshError::EnvironmentNotReady(
                    "live camera capture requires the `opencv` feature".to_string(),
                ))
            }
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig::new()
    }
}
