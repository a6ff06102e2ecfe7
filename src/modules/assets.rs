use std::collections::HashMap;
use std::path::Path;
use ndarray::Array2;
use serde::Deserialize;
use tracing::info;
use crate::config::config::DataConfig;
use crate::error::error::{FacemeshError, Result};
use crate::modules::bone_mapper::BonePositionTable;
use crate::modules::cleanup::FaceRegionTable;
use crate::modules::mesh_io::{read_obj, ObjMesh};
use crate::utils::coordinate::NUM_LANDMARKS;

/// Faces and UV layout shared by every reconstructed mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTopology {
    pub vertices: Vec<[f64; 3]>,
    pub faces: Vec<[usize; 3]>,
    pub uvcoords: Vec<[f64; 2]>,
    pub uv_faces: Vec<[usize; 3]>,
}

impl CanonicalTopology {
    /// from_obj checks that the mesh has one vertex per landmark and that every
    /// face and UV index is in range.
    pub fn from_obj(obj: ObjMesh) -> Result<Self> {
        if obj.vertices.len() != NUM_LANDMARKS {
            return Err(FacemeshError::InvalidInput(format!(
                "canonical mesh has {} vertices, expected {}", obj.vertices.len(), NUM_LANDMARKS
            )))
        }
        if let Some(&index) = obj.faces.iter().flatten().find(|&&i| i >= obj.vertices.len()) {
            return Err(FacemeshError::VertexIndexOutOfRange { index, len: obj.vertices.len() })
        }
        if let Some(index) = obj.uv_faces.iter().flatten().find(|&&i| i >= obj.uvcoords.len()) {
            return Err(FacemeshError::InvalidInput(format!(
                "uv index {} out of range for {} uv coords", index, obj.uvcoords.len()
            )))
        }
        if !obj.uv_faces.is_empty() && obj.uv_faces.len() != obj.faces.len() {
            return Err(FacemeshError::InvalidInput("canonical mesh mixes textured and untextured faces".to_string()))
        }

        Ok(CanonicalTopology {
            vertices: obj.vertices,
            faces: obj.faces,
            uvcoords: obj.uvcoords,
            uv_faces: obj.uv_faces,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        CanonicalTopology::from_obj(read_obj(path)?)
    }
}

#[derive(Deserialize)]
struct UvMapFile {
    u: HashMap<String, f64>,
    v: HashMap<String, f64>,
}

/// parse_uv_map reads `{"u": {"0": .., ..}, "v": {..}}` into a
/// `NUM_LANDMARKS x 2` array of unit-square coordinates.
pub fn parse_uv_map(raw: &str) -> Result<Array2<f64>> {
    let file: UvMapFile = serde_json::from_str(raw)?;
    let mut uv = Array2::<f64>::zeros((NUM_LANDMARKS, 2));
    for i in 0..NUM_LANDMARKS {
        let key = i.to_string();
        match (file.u.get(&key), file.v.get(&key)) {
            (Some(&u), Some(&v)) => {
                uv[[i, 0]] = u;
                uv[[i, 1]] = v;
            }
            _ => return Err(FacemeshError::InvalidInput(format!("uv map has no entry for vertex {}", i))),
        }
    }
    Ok(uv)
}

/// Bone and region tables, stored together in the rig mapping asset.
#[derive(Debug, Clone, PartialEq)]
pub struct RigMapping {
    pub bones: BonePositionTable,
    pub regions: FaceRegionTable,
}

impl RigMapping {
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let bones = match value.get("bone_positions") {
            None => return Err(FacemeshError::InvalidInput("rig mapping has no bone_positions".to_string())),
            Some(bone_positions) => BonePositionTable::from_value(bone_positions)?,
        };
        let regions = FaceRegionTable::from_value(&value)?;
        Ok(RigMapping { bones, regions })
    }
}

fn read_asset(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(FacemeshError::AssetNotFound(path.to_path_buf()))
    }
    Ok(std::fs::read_to_string(path)?)
}

/// Static lookup data, loaded once and handed to each stage by reference.
#[derive(Debug, Clone)]
pub struct FacemeshAssets {
    pub topology: CanonicalTopology,
    pub uv_map: Array2<f64>,
    pub rig_mapping: RigMapping,
}

impl FacemeshAssets {
    pub fn load(data: &DataConfig) -> Result<Self> {
        let mesh_path = data.canonical_mesh_path();
        if !mesh_path.is_file() {
            return Err(FacemeshError::AssetNotFound(mesh_path))
        }
        let topology = CanonicalTopology::load(&mesh_path)?;
        let uv_map = parse_uv_map(&read_asset(&data.uv_map_path())?)?;
        let rig_mapping = RigMapping::from_json(&read_asset(&data.rig_mapping_path())?)?;

        info!(
            "loaded assets from {:?}: {} faces, {} mapped bones",
            data.data_dir, topology.faces.len(), rig_mapping.bones.len()
        );
        Ok(FacemeshAssets { topology, uv_map, rig_mapping })
    }
}
