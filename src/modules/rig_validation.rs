use tracing::debug;
use crate::error::error::{FacemeshError, Result};
use crate::modules::bone_mapper::Armature;
use crate::utils::coordinate::NUM_LANDMARKS;

/// Bone count of a rigify-compatible rig.
pub const RIGIFY_BONE_COUNT: usize = 159;

/// Face bones every metarig must carry for the bone table to apply.
pub const MANDATORY_FACE_BONES: [&str; 76] = [
    "eye.L", "eye.R", "jaw", "jaw.L", "jaw.L.001", "jaw.R", "jaw.R.001", "temple.L", "temple.R",
    "chin", "chin.001", "chin.L", "chin.R",
    "lip.B.L", "lip.B.L.001", "lip.B.R", "lip.B.R.001", "lip.T.L", "lip.T.L.001", "lip.T.R", "lip.T.R.001",
    "cheek.B.L", "cheek.B.L.001", "cheek.B.R", "cheek.B.R.001", "cheek.T.L", "cheek.T.L.001", "cheek.T.R", "cheek.T.R.001",
    "brow.T.L", "brow.T.L.001", "brow.T.L.002", "brow.T.L.003", "brow.T.R", "brow.T.R.001", "brow.T.R.002", "brow.T.R.003",
    "forehead.L", "forehead.L.001", "forehead.L.002", "forehead.R", "forehead.R.001", "forehead.R.002",
    "nose", "nose.001", "nose.002", "nose.003", "nose.004", "nose.L", "nose.L.001", "nose.R", "nose.R.001",
    "lid.B.L", "lid.B.L.001", "lid.B.L.002", "lid.B.L.003", "lid.T.L", "lid.T.L.001", "lid.T.L.002", "lid.T.L.003",
    "lid.B.R", "lid.B.R.001", "lid.B.R.002", "lid.B.R.003", "lid.T.R", "lid.T.R.001", "lid.T.R.002", "lid.T.R.003",
    "brow.B.L", "brow.B.L.001", "brow.B.L.002", "brow.B.L.003", "brow.B.R", "brow.B.R.001", "brow.B.R.002", "brow.B.R.003",
];

/// A mesh can stand in for the face mesh when it has at least the landmark
/// vertex count.
pub fn facemesh_vertex_count_ok(vertex_count: usize) -> bool {
    vertex_count >= NUM_LANDMARKS
}

pub fn armature_bone_count_ok(armature: &Armature) -> bool {
    armature.bones.len() == RIGIFY_BONE_COUNT
}

pub fn missing_face_bones(armature: &Armature) -> Vec<&'static str> {
    MANDATORY_FACE_BONES
        .iter()
        .copied()
        .filter(|name| !armature.has_bone(name))
        .collect()
}

pub fn armature_face_bones_ok(armature: &Armature) -> bool {
    let missing = missing_face_bones(armature);
    if !missing.is_empty() {
        debug!("armature '{}' lacks face bones {:?}", armature.name, missing);
    }
    missing.is_empty()
}

/// A metarig carries a generated-rig link slot and every mandatory face bone.
pub fn valid_metarig(armature: &Armature) -> bool {
    armature.is_metarig && armature_face_bones_ok(armature)
}

/// resolve_generated_rig returns the name of the rig generated from the
/// selected metarig.
pub fn resolve_generated_rig(metarig: Option<&Armature>) -> Result<&str> {
    let metarig = match metarig {
        None => return Err(FacemeshError::MissingPrerequisite("No metarig selected".to_string())),
        Some(metarig) => metarig,
    };
    match metarig.rigify_target_rig.as_deref() {
        Some(name) if metarig.is_metarig => Ok(name),
        _ => Err(FacemeshError::MissingPrerequisite("metarig hasn't generated a rig".to_string())),
    }
}
