use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use image::{DynamicImage, RgbImage};
use tracing::{debug, info, warn};
use crate::error::error::{FacemeshError, Result};
use crate::utils::image::save_image;

/// Geometry as stored in a Wavefront OBJ file, with 0-based indices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjMesh {
    pub vertices: Vec<[f64; 3]>,
    pub uvcoords: Vec<[f64; 2]>,
    pub faces: Vec<[usize; 3]>,
    pub uv_faces: Vec<[usize; 3]>,
    /// Free-standing edges from `l` directives.
    pub edges: Vec<[usize; 2]>,
    pub mtllib: Option<String>,
    /// Material names in `usemtl` order; `face_materials` indexes into it.
    pub materials: Vec<String>,
    pub face_materials: Vec<usize>,
}

fn parse_floats(tokens: &[&str], line: usize) -> Result<Vec<f64>> {
    tokens
        .iter()
        .map(|t| {
            t.parse::<f64>().map_err(|e| FacemeshError::ObjFormat {
                line,
                message: format!("invalid number '{}': {}", t, e),
            })
        })
        .collect()
}

fn parse_index(token: &str, line: usize) -> Result<usize> {
    let idx = token.parse::<usize>().map_err(|e| FacemeshError::ObjFormat {
        line,
        message: format!("invalid index '{}': {}", token, e),
    })?;
    if idx == 0 {
        return Err(FacemeshError::ObjFormat { line, message: "indices are 1-based, found 0".to_string() })
    }
    Ok(idx - 1)
}

/// parse_obj reads vertices, texture coordinates and triangular faces.
///
/// Face corners are `v`, `v/vt`, `v//vn` or `v/vt/vn`; normals are ignored.
/// Indices are converted from 1-based to 0-based. `l` polylines are split
/// into edges, and `mtllib`/`usemtl` are remembered. Other directives are
/// skipped.
pub fn parse_obj(source: &str) -> Result<ObjMesh> {
    let mut mesh = ObjMesh::default();
    let mut current_material = 0;

    for (line_idx, raw_line) in source.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = raw_line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if line.starts_with("v ") {
            let values = parse_floats(&tokens[1..tokens.len().min(4)], line_no)?;
            if values.len() != 3 {
                return Err(FacemeshError::ObjFormat {
                    line: line_no,
                    message: format!("vertex {:?} does not have 3 values", values),
                })
            }
            mesh.vertices.push([values[0], values[1], values[2]]);
        } else if line.starts_with("vt ") {
            let values = parse_floats(&tokens[1..tokens.len().min(3)], line_no)?;
            if values.len() != 2 {
                return Err(FacemeshError::ObjFormat {
                    line: line_no,
                    message: format!("texture {:?} does not have 2 values", values),
                })
            }
            mesh.uvcoords.push([values[0], values[1]]);
        } else if line.starts_with("f ") {
            let corners = &tokens[1..];
            if corners.len() != 3 {
                return Err(FacemeshError::ObjFormat {
                    line: line_no,
                    message: format!("face has {} corners, only triangles are supported", corners.len()),
                })
            }

            let mut face = [0usize; 3];
            let mut uv_face = [0usize; 3];
            let mut uv_count = 0;
            for (i, corner) in corners.iter().enumerate() {
                let props: Vec<&str> = corner.split('/').collect();
                face[i] = parse_index(props[0], line_no)?;
                if props.len() > 1 && !props[1].is_empty() {
                    uv_face[i] = parse_index(props[1], line_no)?;
                    uv_count += 1;
                }
            }

            match uv_count {
                0 => {}
                3 => mesh.uv_faces.push(uv_face),
                _ => {
                    return Err(FacemeshError::ObjFormat {
                        line: line_no,
                        message: "face mixes corners with and without texture indices".to_string(),
                    })
                }
            }
            mesh.faces.push(face);
            mesh.face_materials.push(current_material);
        } else if line.starts_with("l ") {
            let indices = tokens[1..]
                .iter()
                .map(|t| parse_index(t.split('/').next().unwrap_or(t), line_no))
                .collect::<Result<Vec<_>>>()?;
            if indices.len() < 2 {
                return Err(FacemeshError::ObjFormat { line: line_no, message: "line needs two vertices".to_string() })
            }
            for pair in indices.windows(2) {
                mesh.edges.push([pair[0], pair[1]]);
            }
        } else if line.starts_with("mtllib ") {
            mesh.mtllib = tokens.get(1).map(|name| name.to_string());
        } else if line.starts_with("usemtl ") {
            let name = tokens.get(1).map(|name| name.to_string()).unwrap_or_default();
            current_material = match mesh.materials.iter().position(|m| *m == name) {
                Some(idx) => idx,
                None => {
                    mesh.materials.push(name);
                    mesh.materials.len() - 1
                }
            };
        }
    }

    debug!(
        "parsed OBJ: {} vertices, {} uv coords, {} faces",
        mesh.vertices.len(), mesh.uvcoords.len(), mesh.faces.len()
    );
    Ok(mesh)
}

pub fn read_obj(path: &Path) -> Result<ObjMesh> {
    let source = std::fs::read_to_string(path)?;
    let mesh = parse_obj(&source)?;
    info!("loaded mesh {:?} ({} vertices, {} faces)", path, mesh.vertices.len(), mesh.faces.len());
    Ok(mesh)
}

/// A mesh instance built on the canonical topology: its faces and UV layout
/// with vertex positions from one detection and an optional texture.
#[derive(Debug, Clone)]
pub struct ReconstructedMesh {
    pub vertices: Vec<[f64; 3]>,
    pub colors: Option<Vec<[f64; 3]>>,
    pub faces: Vec<[usize; 3]>,
    pub uvcoords: Vec<[f64; 2]>,
    pub uv_faces: Vec<[usize; 3]>,
    pub texture: Option<RgbImage>,
}

/// Paths of the files written for one mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshArtifacts {
    pub obj_path: PathBuf,
    pub mtl_path: Option<PathBuf>,
    pub texture_path: Option<PathBuf>,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// render_obj produces the OBJ text for a mesh.
///
/// Indices are written 1-based. Without a texture the faces are written in
/// reversed winding; with one, each corner is written as `v/vt` in stored
/// order after a `usemtl` for `material_name`.
pub fn render_obj(mesh: &ReconstructedMesh, mtl_name: Option<&str>, material_name: &str) -> Result<String> {
    let textured = mesh.texture.is_some();
    if textured && mesh.uv_faces.len() != mesh.faces.len() {
        return Err(FacemeshError::InvalidInput(format!(
            "{} faces but {} uv faces", mesh.faces.len(), mesh.uv_faces.len()
        )))
    }
    if let Some(colors) = &mesh.colors {
        if colors.len() != mesh.vertices.len() {
            return Err(FacemeshError::InvalidInput(format!(
                "{} vertices but {} vertex colors", mesh.vertices.len(), colors.len()
            )))
        }
    }

    let mut out = String::new();
    write_obj_text(&mut out, mesh, textured, mtl_name, material_name)?;
    Ok(out)
}

fn write_obj_text(
    out: &mut String,
    mesh: &ReconstructedMesh,
    textured: bool,
    mtl_name: Option<&str>,
    material_name: &str,
) -> std::fmt::Result {
    if let (true, Some(mtl_name)) = (textured, mtl_name) {
        write!(out, "mtllib {}\n\n", mtl_name)?;
    }

    match &mesh.colors {
        None => {
            for v in &mesh.vertices {
                writeln!(out, "v {} {} {}", v[0], v[1], v[2])?;
            }
        }
        Some(colors) => {
            for (v, c) in mesh.vertices.iter().zip(colors) {
                writeln!(out, "v {} {} {} {} {} {}", v[0], v[1], v[2], c[0], c[1], c[2])?;
            }
        }
    }

    if !textured {
        for f in &mesh.faces {
            writeln!(out, "f {} {} {}", f[2] + 1, f[1] + 1, f[0] + 1)?;
        }
        return Ok(())
    }

    for uv in &mesh.uvcoords {
        writeln!(out, "vt {} {}", uv[0], uv[1])?;
    }
    writeln!(out, "usemtl {}", material_name)?;
    for (f, uv) in mesh.faces.iter().zip(&mesh.uv_faces) {
        writeln!(
            out,
            "f {}/{} {}/{} {}/{}",
            f[0] + 1, uv[0] + 1,
            f[1] + 1, uv[1] + 1,
            f[2] + 1, uv[2] + 1,
        )?;
    }
    Ok(())
}

fn write_textured(
    texture: &RgbImage,
    texture_path: &Path,
    mtl_path: &Path,
    mtl_text: &str,
    obj_path: &Path,
    obj_text: &str,
    written: &mut Vec<PathBuf>,
) -> Result<()> {
    save_image(&DynamicImage::ImageRgb8(texture.clone()), texture_path)?;
    written.push(texture_path.to_path_buf());
    write_text(mtl_path, mtl_text)?;
    written.push(mtl_path.to_path_buf());
    write_text(obj_path, obj_text)
}

pub fn render_mtl(material_name: &str, texture_name: &str) -> String {
    format!("newmtl {}\nmap_Kd {}\n", material_name, texture_name)
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(text.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// write_mesh persists the mesh, and when it carries a texture also the
/// material file and the texture image.
///
/// Files are written texture first, then material, then geometry. If any
/// write fails the files already written are removed again.
///
/// # Arguments
/// * `mesh` - mesh to persist
/// * `obj_path` - geometry path; `.obj` is appended when missing
/// * `texture_path` - texture image path, referenced by file name
/// * `material_name` - material declared in the material file
///
/// # Returns
/// * `MeshArtifacts`
pub fn write_mesh(mesh: &ReconstructedMesh, obj_path: &Path, texture_path: &Path, material_name: &str) -> Result<MeshArtifacts> {
    let obj_path = if obj_path.extension().map_or(false, |ext| ext == "obj") {
        obj_path.to_path_buf()
    } else {
        PathBuf::from(format!("{}.obj", obj_path.display()))
    };
    let mtl_path = obj_path.with_extension("mtl");

    let texture = match &mesh.texture {
        None => {
            write_text(&obj_path, &render_obj(mesh, None, material_name)?)?;
            info!("saved untextured mesh {:?}", obj_path);
            return Ok(MeshArtifacts { obj_path, mtl_path: None, texture_path: None })
        }
        Some(texture) => texture,
    };

    let obj_text = render_obj(mesh, Some(&file_name(&mtl_path)), material_name)?;
    let mtl_text = render_mtl(material_name, &file_name(texture_path));

    let mut written: Vec<PathBuf> = Vec::with_capacity(2);
    if let Err(e) = write_textured(texture, texture_path, &mtl_path, &mtl_text, &obj_path, &obj_text, &mut written) {
        for path in written {
            if let Err(remove_err) = std::fs::remove_file(&path) {
                warn!("could not remove partial artifact {:?}: {}", path, remove_err);
            }
        }
        return Err(e)
    }

    info!("saved mesh {:?} with material {:?} and texture {:?}", obj_path, mtl_path, texture_path);
    Ok(MeshArtifacts {
        obj_path,
        mtl_path: Some(mtl_path),
        texture_path: Some(texture_path.to_path_buf()),
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use image::Rgb;
    use super::*;

    fn quad_mesh(texture: Option<RgbImage>) -> ReconstructedMesh {
        ReconstructedMesh {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.1], [1.0, 1.0, -0.25], [0.1 + 0.2, 1.0, 1e-7]],
            colors: None,
            faces: vec![[0, 1, 2], [0, 2, 3]],
            uvcoords: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
            uv_faces: vec![[0, 1, 2], [0, 2, 3]],
            texture,
        }
    }

    #[test]
    fn test_parse_obj_with_mixed_corner_forms() {
        let source = "# comment\nmtllib a.mtl\nv 0 0 0\nv 1 0 0 0.5 0.5 0.5\nv 0 1 0\nvt 0 0\nvt 1 0 0\nvt 0 1\n\
                      vn 0 0 1\nf 1/1/1 2/2/1 3/3/1\nf 3 2 1\nf 1//1 2//1 3//1\n";
        let mesh = parse_obj(source).unwrap();
        assert_eq!(mesh.vertices, vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert_eq!(mesh.uvcoords.len(), 3);
        assert_eq!(mesh.faces, vec![[0, 1, 2], [2, 1, 0], [0, 1, 2]]);
        assert_eq!(mesh.uv_faces, vec![[0, 1, 2]]);
        assert_eq!(mesh.mtllib.as_deref(), Some("a.mtl"));
    }

    #[test]
    fn test_parse_obj_materials_and_lines() {
        let source = "v 0 0 0\nv 1 0 0\nv 0 1 0\nv 1 1 0\nf 1 2 3\nusemtl Skin\nf 2 4 3\nusemtl Eye\nf 1 2 4\nl 1 3 4\n";
        let mesh = parse_obj(source).unwrap();
        assert_eq!(mesh.materials, vec!["Skin", "Eye"]);
        assert_eq!(mesh.face_materials, vec![0, 0, 1]);
        assert_eq!(mesh.edges, vec![[0, 2], [2, 3]]);
    }

    #[test]
    fn test_parse_obj_format_errors() {
        let cases = [
            ("v 1 2\n", 1),
            ("v 0 0 0\nvt 0.5\n", 2),
            ("v 0 0 0\nv 1 1 1\nv 2 2 2\nf 0 1 2\n", 4),
            ("v 0 0 0\nf 1 2 3 4\n", 2),
            ("v 0 zero 0\n", 1),
            ("v 0 0 0\nf 1/1 2 3\n", 2),
        ];
        for (source, line) in cases {
            match parse_obj(source) {
                Err(FacemeshError::ObjFormat { line: got, .. }) => assert_eq!(got, line, "{:?}", source),
                other => panic!("expected format error for {:?}, got {:?}", source, other),
            }
        }
    }

    #[test]
    fn test_untextured_round_trip_reverses_winding() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = quad_mesh(None);
        let artifacts = write_mesh(&mesh, &dir.path().join("face"), &dir.path().join("unused.jpg"), "FaceTexture").unwrap();

        assert_eq!(artifacts.obj_path, dir.path().join("face.obj"));
        assert!(artifacts.mtl_path.is_none());
        assert!(!dir.path().join("unused.jpg").exists());

        let loaded = read_obj(&artifacts.obj_path).unwrap();
        assert_eq!(loaded.vertices, mesh.vertices);
        assert_eq!(loaded.faces, vec![[2, 1, 0], [3, 2, 0]]);
        assert!(loaded.uvcoords.is_empty());
        assert!(loaded.uv_faces.is_empty());
    }

    #[test]
    fn test_textured_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let texture = RgbImage::from_pixel(8, 8, Rgb([120, 80, 40]));
        let mesh = quad_mesh(Some(texture));
        let texture_path = dir.path().join(".face_texture.jpg");
        let artifacts = write_mesh(&mesh, &dir.path().join("face.obj"), &texture_path, "FaceTexture").unwrap();

        let loaded = read_obj(&artifacts.obj_path).unwrap();
        for (a, b) in loaded.vertices.iter().zip(&mesh.vertices) {
            for axis in 0..3 {
                assert_relative_eq!(a[axis], b[axis], epsilon = 1e-12);
            }
        }
        assert_eq!(loaded.faces, mesh.faces);
        assert_eq!(loaded.uv_faces, mesh.uv_faces);
        assert_eq!(loaded.uvcoords, mesh.uvcoords);

        let obj_text = std::fs::read_to_string(&artifacts.obj_path).unwrap();
        assert!(obj_text.starts_with("mtllib face.mtl\n\n"));
        assert!(obj_text.contains("usemtl FaceTexture\nf 1/1 2/2 3/3\n"));

        let mtl_text = std::fs::read_to_string(artifacts.mtl_path.unwrap()).unwrap();
        assert_eq!(mtl_text, "newmtl FaceTexture\nmap_Kd .face_texture.jpg\n");
        assert!(artifacts.texture_path.unwrap().is_file());
    }

    #[test]
    fn test_vertex_colors_are_written() {
        let mut mesh = quad_mesh(None);
        mesh.colors = Some(vec![[1.0, 0.0, 0.0]; 4]);
        let text = render_obj(&mesh, None, "FaceTexture").unwrap();
        assert!(text.starts_with("v 0 0 0 1 0 0\n"));
        let reparsed = parse_obj(&text).unwrap();
        assert_eq!(reparsed.vertices, mesh.vertices);
    }

    #[test]
    fn test_vertex_color_count_must_match() {
        let mut mesh = quad_mesh(None);
        mesh.faces = vec![[0, 1, 2], [1, 3, 2]];
        mesh.colors = Some(vec![[1.0, 0.0, 0.0]; 2]);
        assert!(matches!(render_obj(&mesh, None, "mat"), Err(FacemeshError::InvalidInput(_))));

        let dir = tempfile::tempdir().unwrap();
        let obj_path = dir.path().join("face.obj");
        assert!(write_mesh(&mesh, &obj_path, &dir.path().join("t.jpg"), "mat").is_err());
        assert!(!obj_path.exists());
    }

    #[test]
    fn test_parse_obj_keeps_vertex_order_of_unreferenced_vertices() {
        // Vertex 2 is used only by an edge and vertex 4 by nothing at all;
        // every index must keep pointing at the same position.
        let source = "v 0 0 0\nv 1 0 0\nv 5 5 5\nv 0 1 0\nv 9 9 9\nf 4 2 1\nl 3 1\n";
        let mesh = parse_obj(source).unwrap();
        assert_eq!(mesh.vertices.len(), 5);
        assert_eq!(mesh.vertices[2], [5.0, 5.0, 5.0]);
        assert_eq!(mesh.vertices[4], [9.0, 9.0, 9.0]);
        assert_eq!(mesh.faces, vec![[3, 1, 0]]);
        assert_eq!(mesh.edges, vec![[2, 0]]);
    }

    #[test]
    fn test_failed_write_removes_partial_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let obj_path = dir.path().join("face.obj");
        std::fs::create_dir(&obj_path).unwrap();
        let texture_path = dir.path().join(".face_texture.jpg");
        let mesh = quad_mesh(Some(RgbImage::new(4, 4)));

        assert!(write_mesh(&mesh, &obj_path, &texture_path, "FaceTexture").is_err());
        assert!(!texture_path.exists());
        assert!(!dir.path().join("face.mtl").exists());
    }
}
