use std::fmt::Write as _;
use std::path::Path;
use approx::assert_relative_eq;
use image::{Rgb, RgbImage};
use nalgebra::{Matrix4, Point3};
use serde_json::json;
use facemesh_pipeline::config::config::PipelineConfig;
use facemesh_pipeline::error::error::FacemeshError;
use facemesh_pipeline::modules::bone_mapper::{Armature, Bone, EyePlacement, SceneMesh};
use facemesh_pipeline::modules::cleanup::{CleanupOp, EditableMesh};
use facemesh_pipeline::modules::landmark_detector::SidecarLandmarkDetector;
use facemesh_pipeline::modules::mesh_io::read_obj;
use facemesh_pipeline::modules::mocap::ImageSequenceSource;
use facemesh_pipeline::modules::rig_validation::{resolve_generated_rig, MANDATORY_FACE_BONES};
use facemesh_pipeline::pipeline::pipeline::FacemeshPipeline;

const COLS: usize = 26;
const ROWS: usize = 18;

fn write_assets(dir: &Path) -> PipelineConfig {
    let mut obj = String::new();
    for r in 0..ROWS {
        for c in 0..COLS {
            let _ = writeln!(obj, "v {} {} 0", c as f64 / 25.0, r as f64 / 17.0);
        }
    }
    for r in 0..ROWS {
        for c in 0..COLS {
            let _ = writeln!(obj, "vt {} {}", c as f64 / 25.0, 1.0 - r as f64 / 17.0);
        }
    }
    for r in 0..ROWS - 1 {
        for c in 0..COLS - 1 {
            let a = r * COLS + c + 1;
            let (b, d, e) = (a + 1, a + COLS, a + COLS + 1);
            let _ = writeln!(obj, "f {}/{} {}/{} {}/{}", a, a, b, b, e, e);
            let _ = writeln!(obj, "f {}/{} {}/{} {}/{}", a, a, e, e, d, d);
        }
    }

    let mut u = serde_json::Map::new();
    let mut v = serde_json::Map::new();
    for i in 0..468 {
        u.insert(i.to_string(), json!((i % COLS) as f64 / 25.0));
        v.insert(i.to_string(), json!((i / COLS) as f64 / 17.0));
    }

    let mapping = json!({
        "bone_positions": {
            "DESC": "head/tail are face mesh vertex indices",
            "nose": {"head": 1, "tail": 4},
            "jaw": {"head": 152, "tail": null},
        },
        "face_verts": {"mouth": [[27, 28, 54], [27, 54, 53]]},
        "edge_verts": {"mouth": [[27, 54]]},
        "symmetry": {"center": [0, 10], "mirror_pairs": [[234, 454], [33, 263]]},
    });

    let mut config = PipelineConfig::new();
    config.data.data_dir = dir.to_path_buf();
    config.texture.size = 128;
    std::fs::write(config.data.canonical_mesh_path(), obj).unwrap();
    std::fs::write(config.data.uv_map_path(), json!({"u": u, "v": v}).to_string()).unwrap();
    std::fs::write(config.data.rig_mapping_path(), mapping.to_string()).unwrap();
    config
}

fn landmarks_json() -> serde_json::Value {
    let mut points: Vec<serde_json::Value> = (0..478)
        .map(|i| {
            let t = i as f64 / 468.0;
            let angle = t * std::f64::consts::TAU * 5.0;
            let radius = 0.04 + 0.16 * t;
            json!({"x": 0.5 + radius * angle.cos(), "y": 0.5 + radius * angle.sin(), "z": -0.04 * (1.0 - t)})
        })
        .collect();
    points[0] = json!({"x": 0.5, "y": 0.6, "z": -0.05});
    points[1] = json!({"x": 0.5, "y": 0.52, "z": -0.1});
    points[9] = json!({"x": 0.5, "y": 0.35, "z": -0.03});
    points[10] = json!({"x": 0.51, "y": 0.2, "z": -0.02});
    points[152] = json!({"x": 0.49, "y": 0.82, "z": -0.02});
    points[234] = json!({"x": 0.28, "y": 0.5, "z": 0.04});
    points[454] = json!({"x": 0.72, "y": 0.5, "z": 0.03});
    json!(points)
}

fn face_photo(path: &Path) {
    RgbImage::from_fn(160, 120, |x, y| Rgb([(x + 40) as u8, (y + 60) as u8, 128]))
        .save(path)
        .unwrap();
}

fn armature() -> Armature {
    let bone = |name: &str| Bone {
        name: name.to_string(),
        head: Point3::origin(),
        tail: Point3::new(0.0, 0.0, 0.1),
    };
    Armature {
        name: "rig".to_string(),
        bones: vec![bone("nose"), bone("jaw"), bone("eye.L"), bone("eye.R")],
        world_matrix: Matrix4::identity(),
        rigify_target_rig: None,
        is_metarig: false,
    }
}

#[test]
fn photo_to_rigged_and_cleaned_mesh() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_assets(dir.path());
    let image_path = dir.path().join("portrait.png");
    face_photo(&image_path);

    let detector = SidecarLandmarkDetector::from_json(&json!({"landmarks": landmarks_json()}).to_string()).unwrap();
    let pipeline = FacemeshPipeline::new(config, Box::new(detector)).unwrap();

    let artifacts = pipeline.image_to_facemesh(&image_path).unwrap();
    assert_eq!(artifacts.obj_path, dir.path().join("portrait.obj"));
    assert!(dir.path().join("portrait.mtl").is_file());
    assert!(dir.path().join(".portrait_texture.jpg").is_file());

    let obj = read_obj(&artifacts.obj_path).unwrap();
    assert_eq!(obj.vertices.len(), 468);
    for axis in 0..3 {
        assert_relative_eq!(obj.vertices[0][axis], 0.0, epsilon = 1e-9);
    }

    let scene_mesh = SceneMesh::new(obj.vertices.iter().map(|v| Point3::new(v[0], v[1], v[2])).collect());
    let mut rig = armature();
    let eyes = EyePlacement { left: Some(Point3::new(0.03, 0.02, 0.01)), right: None };
    let report = pipeline.rig_facemesh(&scene_mesh, Some(&mut rig), &eyes).unwrap();

    assert_eq!(report.missing_eyes, vec!["eye.R"]);
    let nose = rig.bone("nose").unwrap();
    assert_relative_eq!(nose.head, scene_mesh.vertices[1], epsilon = 1e-12);
    assert_relative_eq!(nose.tail, scene_mesh.vertices[4], epsilon = 1e-12);
    assert_eq!(rig.bone("jaw").unwrap().tail, Point3::new(0.0, 0.0, 0.1));
    assert_relative_eq!(rig.bone("eye.L").unwrap().tail, Point3::new(0.03, 0.02, 0.11), epsilon = 1e-12);

    let before = EditableMesh::load(&artifacts.obj_path).unwrap().face_vertex_sets();
    let opened = pipeline.cleanup_file(&artifacts.obj_path, CleanupOp::OpenMouth).unwrap();
    assert_eq!(opened.faces.len(), before.len() - 2);
    let closed = pipeline.cleanup_file(&artifacts.obj_path, CleanupOp::CloseMouth).unwrap();
    assert_eq!(closed.face_vertex_sets(), before);

    let symmetric = pipeline.cleanup_file(&artifacts.obj_path, CleanupOp::SmartSymmetrize).unwrap();
    for [l, r] in [[234, 454], [33, 263]] {
        assert_eq!(symmetric.vertices[l][0], -symmetric.vertices[r][0]);
        assert_eq!(symmetric.vertices[l][1], symmetric.vertices[r][1]);
        assert_eq!(symmetric.vertices[l][2], symmetric.vertices[r][2]);
    }
    let reloaded = EditableMesh::load(&artifacts.obj_path).unwrap();
    assert_eq!(reloaded.mtllib.as_deref(), Some("portrait.mtl"));
    assert_eq!(reloaded.vertices[10][0], 0.0);
}

#[test]
fn rig_without_armature_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_assets(dir.path());
    let pipeline = FacemeshPipeline::new(config, Box::new(SidecarLandmarkDetector::new(Vec::new()))).unwrap();
    let mesh = SceneMesh::new(vec![Point3::origin(); 468]);

    let err = pipeline.rig_facemesh(&mesh, None, &EyePlacement::default()).unwrap_err();
    assert!(matches!(err.downcast_ref::<FacemeshError>(), Some(FacemeshError::MissingPrerequisite(_))));
}

fn fresh_metarig() -> Armature {
    Armature {
        name: "metarig".to_string(),
        bones: MANDATORY_FACE_BONES
            .iter()
            .map(|name| Bone {
                name: name.to_string(),
                head: Point3::origin(),
                tail: Point3::new(0.0, 0.0, 0.1),
            })
            .collect(),
        world_matrix: Matrix4::identity(),
        rigify_target_rig: None,
        is_metarig: true,
    }
}

#[test]
fn metarig_is_rigged_before_generation() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_assets(dir.path());
    let pipeline = FacemeshPipeline::new(config, Box::new(SidecarLandmarkDetector::new(Vec::new()))).unwrap();
    let vertices: Vec<Point3<f64>> = (0..468).map(|i| Point3::new(i as f64 * 0.01, 0.5, -0.2)).collect();
    let mesh = SceneMesh::new(vertices);

    let mut metarig = fresh_metarig();
    let report = pipeline.rig_facemesh(&mesh, Some(&mut metarig), &EyePlacement::default()).unwrap();

    assert_eq!(report.missing_eyes, vec!["eye.L", "eye.R"]);
    assert_eq!(metarig.bone("nose").unwrap().head, mesh.vertices[1]);
    assert_eq!(metarig.bone("nose").unwrap().tail, mesh.vertices[4]);
    assert_eq!(metarig.bone("jaw").unwrap().head, mesh.vertices[152]);
    // Only motion capture needs the generated rig.
    assert!(resolve_generated_rig(Some(&metarig)).is_err());
}

#[test]
fn metarig_without_face_bones_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_assets(dir.path());
    let pipeline = FacemeshPipeline::new(config, Box::new(SidecarLandmarkDetector::new(Vec::new()))).unwrap();
    let mesh = SceneMesh::new(vec![Point3::origin(); 468]);

    let mut metarig = fresh_metarig();
    metarig.bones.retain(|bone| bone.name != "lid.T.L");
    let err = pipeline.rig_facemesh(&mesh, Some(&mut metarig), &EyePlacement::default()).unwrap_err();
    assert!(matches!(err.downcast_ref::<FacemeshError>(), Some(FacemeshError::MissingPrerequisite(_))));
    assert_eq!(metarig.bone("nose").unwrap().tail, Point3::new(0.0, 0.0, 0.1));
}

#[test]
fn capture_exports_only_frames_with_faces() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = write_assets(dir.path());
    let frames_dir = dir.path().join("frames");
    std::fs::create_dir(&frames_dir).unwrap();
    for i in 0..4 {
        face_photo(&frames_dir.join(format!("{:04}.png", i)));
    }
    let npy_path = dir.path().join("capture.npy");
    config.capture.npy_export = Some(npy_path.clone());

    let face = landmarks_json();
    let recording = json!({"frames": [face, null, null, face]}).to_string();
    let detector = SidecarLandmarkDetector::from_json(&recording).unwrap();
    let pipeline = FacemeshPipeline::new(config, Box::new(detector)).unwrap();

    let mut source = ImageSequenceSource::from_dir(&frames_dir).unwrap();
    let report = pipeline.capture(&mut source).unwrap();
    assert_eq!(report.frames_read, 4);
    assert_eq!(report.frames_skipped, 2);

    let stacked: ndarray::Array3<f64> = ndarray_npy::read_npy(&npy_path).unwrap();
    assert_eq!(stacked.dim(), (2, 468, 3));
    assert_relative_eq!(stacked[[1, 1, 0]], 0.0, epsilon = 1e-12);
}
