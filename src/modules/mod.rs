pub mod assets;
pub mod bone_mapper;
pub mod cleanup;
pub mod face_mesh_model;
pub mod landmark_detector;
pub mod mesh_io;
pub mod mocap;
pub mod rig_validation;
