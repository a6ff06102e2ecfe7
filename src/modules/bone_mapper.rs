use std::collections::BTreeMap;
use std::path::Path;
use nalgebra::{Matrix4, Point3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use crate::error::error::{FacemeshError, Result};

pub const EYE_LEFT_BONE: &str = "eye.L";
pub const EYE_RIGHT_BONE: &str = "eye.R";

/// Mesh vertex indices a bone's endpoints snap to. `None` leaves the
/// endpoint where it is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoneEndpoints {
    pub head: Option<usize>,
    pub tail: Option<usize>,
}

/// Bone name to mesh vertex mapping for the fixed face-mesh topology.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BonePositionTable {
    bones: BTreeMap<String, BoneEndpoints>,
}

impl BonePositionTable {
    pub fn new(bones: BTreeMap<String, BoneEndpoints>) -> Self {
        BonePositionTable { bones }
    }

    /// from_value reads the `bone_positions` object of the rig mapping asset.
    /// Entries named `desc` carry documentation and are skipped.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let entries = match value.as_object() {
            None => {
                return Err(FacemeshError::InvalidInput("bone_positions must be an object".to_string()))
            }
            Some(entries) => entries,
        };

        let mut bones = BTreeMap::new();
        for (name, entry) in entries {
            if name.eq_ignore_ascii_case("desc") {
                continue
            }
            let endpoints: BoneEndpoints = serde_json::from_value(entry.clone())?;
            bones.insert(name.clone(), endpoints);
        }
        debug!("bone position table with {} bones", bones.len());
        Ok(BonePositionTable { bones })
    }

    pub fn get(&self, name: &str) -> Option<&BoneEndpoints> {
        self.bones.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BoneEndpoints)> {
        self.bones.iter()
    }

    pub fn len(&self) -> usize {
        self.bones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bone {
    pub name: String,
    pub head: Point3<f64>,
    pub tail: Point3<f64>,
}

/// A rig skeleton in its own local space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Armature {
    pub name: String,
    pub bones: Vec<Bone>,
    #[serde(default = "Matrix4::identity")]
    pub world_matrix: Matrix4<f64>,
    /// Set on metarigs: the name of the rig generated from it, once generated.
    #[serde(default)]
    pub rigify_target_rig: Option<String>,
    #[serde(default)]
    pub is_metarig: bool,
}

impl Armature {
    pub fn bone(&self, name: &str) -> Option<&Bone> {
        self.bones.iter().find(|b| b.name == name)
    }

    pub fn bone_mut(&mut self, name: &str) -> Option<&mut Bone> {
        self.bones.iter_mut().find(|b| b.name == name)
    }

    pub fn has_bone(&self, name: &str) -> bool {
        self.bone(name).is_some()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let armature: Armature = serde_json::from_str(&raw)?;
        debug!("loaded armature '{}' with {} bones from {:?}", armature.name, armature.bones.len(), path);
        Ok(armature)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// A mesh placed in the scene: local vertex positions and its world transform.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneMesh {
    pub vertices: Vec<Point3<f64>>,
    pub world_matrix: Matrix4<f64>,
}

impl SceneMesh {
    pub fn new(vertices: Vec<Point3<f64>>) -> Self {
        SceneMesh { vertices, world_matrix: Matrix4::identity() }
    }
}

/// World-space origins of the optional eye meshes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EyePlacement {
    pub left: Option<Point3<f64>>,
    pub right: Option<Point3<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RigReport {
    pub repositioned: Vec<String>,
    pub not_in_armature: Vec<String>,
    /// Eye bones with no eye mesh supplied; they need manual placement.
    pub missing_eyes: Vec<String>,
}

/// reposition_bones snaps armature bones onto face-mesh vertices.
///
/// Every bone present in both the table and the armature gets its head and
/// tail moved to the mapped vertex, carried from mesh-local space to
/// armature-local space. Eye bones are then moved to the supplied eye
/// origins, keeping their head-to-tail offset. All indices are checked before
/// anything is modified.
///
/// # Arguments
/// * `mesh` - reconstructed face mesh in the scene
/// * `armature` - rig to modify, `None` when no rig is selected
/// * `table` - bone to vertex mapping
/// * `eyes` - optional eye origins in world space
///
/// # Returns
/// * `RigReport`
pub fn reposition_bones(
    mesh: &SceneMesh,
    armature: Option<&mut Armature>,
    table: &BonePositionTable,
    eyes: &EyePlacement,
) -> Result<RigReport> {
    let armature = match armature {
        None => {
            return Err(FacemeshError::MissingPrerequisite("no rig selected".to_string()))
        }
        Some(armature) => armature,
    };

    let armature_inv = match armature.world_matrix.try_inverse() {
        None => {
            return Err(FacemeshError::NonInvertibleTransform(armature.name.clone()))
        }
        Some(inv) => inv,
    };
    let mesh_to_armature = armature_inv * mesh.world_matrix;

    let mut report = RigReport::default();
    let mut updates: Vec<(&str, Option<Point3<f64>>, Option<Point3<f64>>)> = Vec::with_capacity(table.len());

    for (name, endpoints) in table.iter() {
        if !armature.has_bone(name) {
            report.not_in_armature.push(name.clone());
            continue
        }
        let head = endpoints.head.map(|idx| vertex(mesh, idx)).transpose()?;
        let tail = endpoints.tail.map(|idx| vertex(mesh, idx)).transpose()?;
        updates.push((name.as_str(), head, tail));
    }

    for (name, head, tail) in updates {
        if let Some(bone) = armature.bone_mut(name) {
            if let Some(head) = head {
                bone.head = mesh_to_armature.transform_point(&head);
            }
            if let Some(tail) = tail {
                bone.tail = mesh_to_armature.transform_point(&tail);
            }
            report.repositioned.push(name.to_string());
        }
    }

    for (bone_name, location) in [(EYE_LEFT_BONE, eyes.left), (EYE_RIGHT_BONE, eyes.right)] {
        let location = match location {
            None => {
                report.missing_eyes.push(bone_name.to_string());
                continue
            }
            Some(location) => location,
        };
        match armature.bone_mut(bone_name) {
            None => report.not_in_armature.push(bone_name.to_string()),
            Some(bone) => {
                let new_head = armature_inv.transform_point(&location);
                let translation = bone.head - new_head;
                bone.tail -= translation;
                bone.head = new_head;
                debug!("moved {} onto eye origin {:?}", bone_name, location);
            }
        }
    }

    if !report.missing_eyes.is_empty() {
        warn!("no eye mesh for {:?}; place those bones manually", report.missing_eyes);
    }
    info!(
        "repositioned {} bones on '{}' ({} table bones not in the armature)",
        report.repositioned.len(), armature.name, report.not_in_armature.len()
    );
    Ok(report)
}

fn vertex(mesh: &SceneMesh, idx: usize) -> Result<Point3<f64>> {
    mesh.vertices
        .get(idx)
        .copied()
        .ok_or(FacemeshError::VertexIndexOutOfRange { index: idx, len: mesh.vertices.len() })
}
