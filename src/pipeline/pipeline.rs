use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Error};
use image::{DynamicImage, GenericImageView};
use tracing::{info, warn};
use crate::config::config::PipelineConfig;
use crate::error::error::FacemeshError;
use crate::helper::face_helper::{align_keypoints_to_grid, normalize_keypoints};
use crate::helper::texture_warp::warp_texture;
use crate::modules::assets::FacemeshAssets;
use crate::modules::bone_mapper::{reposition_bones, Armature, EyePlacement, RigReport, SceneMesh};
use crate::modules::cleanup::{CleanupOp, EditableMesh};
use crate::modules::landmark_detector::{detect_with_alpha_fallback, LandmarkDetector};
use crate::modules::mesh_io::{write_mesh, MeshArtifacts, ReconstructedMesh};
use crate::modules::mocap::{export_npy, run_capture, CaptureReport, FrameSource};
use crate::modules::rig_validation::{armature_bone_count_ok, facemesh_vertex_count_ok, missing_face_bones, valid_metarig, RIGIFY_BONE_COUNT};
use crate::utils::coordinate::LandmarkSet;
use crate::utils::image::load_image;
use crate::utils::utils::array2_to_triples;

pub struct FacemeshPipeline {
    config: PipelineConfig,
    assets: FacemeshAssets,
    detector: Box<dyn LandmarkDetector>,
}

impl FacemeshPipeline {

    /// new checks the environment once and loads the packaged assets.
    ///
    /// # Arguments
    /// * `config` - PipelineConfig
    /// * `detector` - landmark model used for every image and frame
    ///
    /// # Returns
    /// * `Result<FacemeshPipeline, Error>`
    pub fn new(config: PipelineConfig, detector: Box<dyn LandmarkDetector>) -> Result<Self, Error> {
        config.ensure_ready().context("environment check failed")?;
        let assets = FacemeshAssets::load(&config.data)
            .with_context(|| format!("could not load assets from {:?}", config.data.data_dir))?;
        Ok(FacemeshPipeline::with_assets(config, assets, detector))
    }

    /// with_assets builds the pipeline around assets loaded elsewhere.
    pub fn with_assets(config: PipelineConfig, assets: FacemeshAssets, detector: Box<dyn LandmarkDetector>) -> Self {
        FacemeshPipeline { config, assets, detector }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn assets(&self) -> &FacemeshAssets {
        &self.assets
    }

    /// artifact_paths returns where the mesh and hidden texture for an image
    /// are written: `<dir>/<stem>.obj` and `<dir>/.<stem>_texture.jpg`.
    pub fn artifact_paths(&self, image_path: &Path) -> (PathBuf, PathBuf) {
        let stem = image_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "facemesh".to_string());
        let dir = match &self.config.output.output_dir {
            Some(dir) => dir.clone(),
            None => image_path.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        (dir.join(format!("{}.obj", stem)), dir.join(format!(".{}_texture.jpg", stem)))
    }

    /// reconstruct lifts one detection into a textured mesh on the canonical
    /// topology.
    ///
    /// # Arguments
    /// * `image` - the image the landmarks were detected on
    /// * `landmarks` - LandmarkSet
    ///
    /// # Returns
    /// * `Result<ReconstructedMesh, FacemeshError>`
    pub fn reconstruct(&self, image: &DynamicImage, landmarks: &LandmarkSet) -> Result<ReconstructedMesh, FacemeshError> {
        let (width, height) = image.dimensions();
        let keypoints3d = landmarks.to_keypoints3d(width, height);
        let (normalized, _) = normalize_keypoints(&keypoints3d)?;
        let aligned = align_keypoints_to_grid(&normalized)?;

        let topology = &self.assets.topology;
        let texture = if topology.uv_faces.is_empty() {
            warn!("canonical mesh has no texture coordinates, writing an untextured mesh");
            None
        } else {
            let pixels = landmarks.to_pixel_keypoints(width, height);
            Some(warp_texture(&self.assets.uv_map, &pixels, image, self.config.texture.size)?)
        };

        Ok(ReconstructedMesh {
            vertices: array2_to_triples(&aligned),
            colors: None,
            faces: topology.faces.clone(),
            uvcoords: topology.uvcoords.clone(),
            uv_faces: topology.uv_faces.clone(),
            texture,
        })
    }

    /// image_to_facemesh turns a face photo into mesh, material and texture
    /// files.
    ///
    /// # Arguments
    /// * `image_path` - photo containing one face
    ///
    /// # Returns
    /// * `Result<MeshArtifacts, Error>`
    pub fn image_to_facemesh(&self, image_path: &Path) -> Result<MeshArtifacts, Error> {
        let image = load_image(image_path)?;
        let (landmarks, image) = detect_with_alpha_fallback(self.detector.as_ref(), image)?;
        let landmarks = landmarks.ok_or(FacemeshError::NoFaceDetected)?;
        info!("detected {} landmarks in {:?}", landmarks.points().len(), image_path);

        let mesh = self
            .reconstruct(&image, &landmarks)
            .with_context(|| format!("could not reconstruct face from {:?}", image_path))?;

        let (obj_path, texture_path) = self.artifact_paths(image_path);
        if let Some(dir) = obj_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("could not create output directory {:?}", dir))?;
        }

        let artifacts = write_mesh(&mesh, &obj_path, &texture_path, &self.config.texture.material_name)
            .with_context(|| format!("could not write mesh {:?}", obj_path))?;
        Ok(artifacts)
    }

    /// rig_facemesh snaps the armature's face bones onto the mesh.
    ///
    /// A metarig is repositioned before rigify generates a rig from it, so no
    /// generated rig is required here; it must carry every mandatory face bone.
    ///
    /// # Arguments
    /// * `mesh` - reconstructed face mesh in the scene
    /// * `armature` - selected rig, if any
    /// * `eyes` - optional eye origins
    ///
    /// # Returns
    /// * `Result<RigReport, Error>`
    pub fn rig_facemesh(&self, mesh: &SceneMesh, armature: Option<&mut Armature>, eyes: &EyePlacement) -> Result<RigReport, Error> {
        if !facemesh_vertex_count_ok(mesh.vertices.len()) {
            return Err(anyhow!(FacemeshError::InvalidInput(format!(
                "mesh has {} vertices, not a face mesh", mesh.vertices.len()
            ))))
        }
        if let Some(rig) = armature.as_deref() {
            if rig.is_metarig && !valid_metarig(rig) {
                return Err(anyhow!(FacemeshError::MissingPrerequisite(format!(
                    "'{}' is not a usable metarig: face bones {:?} are missing", rig.name, missing_face_bones(rig)
                ))))
            }
            if !armature_bone_count_ok(rig) {
                warn!("armature '{}' has {} bones, a rigify rig has {}", rig.name, rig.bones.len(), RIGIFY_BONE_COUNT);
            }
            let missing = missing_face_bones(rig);
            if !missing.is_empty() {
                warn!("armature '{}' is missing {} face bones, they will not be placed", rig.name, missing.len());
            }
        }
        let report = reposition_bones(mesh, armature, &self.assets.rig_mapping.bones, eyes)?;
        Ok(report)
    }

    /// cleanup applies one structural edit to a loaded mesh.
    pub fn cleanup(&self, mesh: &mut EditableMesh, op: CleanupOp) -> Result<(), Error> {
        mesh.apply(op, &self.assets.rig_mapping.regions, &self.config.snap)
            .with_context(|| format!("cleanup {:?} failed", op))?;
        Ok(())
    }

    /// cleanup_file loads a mesh, edits it and writes it back in place.
    pub fn cleanup_file(&self, mesh_path: &Path, op: CleanupOp) -> Result<EditableMesh, Error> {
        let mut mesh = EditableMesh::load(mesh_path).with_context(|| format!("could not load {:?}", mesh_path))?;
        self.cleanup(&mut mesh, op)?;
        mesh.save(mesh_path)?;
        Ok(mesh)
    }

    /// capture runs the detector over every frame of the source, then exports
    /// the captured faces when an export path is configured.
    ///
    /// # Arguments
    /// * `source` - FrameSource
    ///
    /// # Returns
    /// * `Result<CaptureReport, Error>`
    pub fn capture(&self, source: &mut dyn FrameSource) -> Result<CaptureReport, Error> {
        let report = run_capture(source, self.detector.as_ref(), self.config.capture.scaler)?;
        if let Some(path) = &self.config.capture.npy_export {
            export_npy(&report.faces, path).with_context(|| format!("could not export capture to {:?}", path))?;
        }
        Ok(report)
    }
}
