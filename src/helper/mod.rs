pub mod face_helper;
pub mod texture_warp;
