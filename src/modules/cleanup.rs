use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use crate::config::config::SnapConfig;
use crate::error::error::{FacemeshError, Result};
use crate::modules::mesh_io::{read_obj, ObjMesh};

pub const REGION_EYE_LEFT: &str = "eye.L";
pub const REGION_EYE_RIGHT: &str = "eye.R";
pub const REGION_MOUTH: &str = "mouth";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SymmetryTable {
    pub center: Vec<usize>,
    /// (left, right) vertex pairs mirrored across X.
    pub mirror_pairs: Vec<[usize; 2]>,
}

/// Faces and edges of the eye and mouth holes, plus the symmetry layout, for
/// the fixed face-mesh topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FaceRegionTable {
    pub face_verts: BTreeMap<String, Vec<[usize; 3]>>,
    pub edge_verts: BTreeMap<String, Vec<[usize; 2]>>,
    pub symmetry: SymmetryTable,
}

impl FaceRegionTable {
    /// from_value reads the region keys of the rig mapping asset; other keys
    /// are ignored.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let table: FaceRegionTable = serde_json::from_value(value.clone())?;
        debug!(
            "face region table: regions {:?}, {} center vertices, {} mirror pairs",
            table.face_verts.keys().collect::<Vec<_>>(), table.symmetry.center.len(), table.symmetry.mirror_pairs.len()
        );
        Ok(table)
    }

    fn region(&self, region: &str) -> Result<(&[[usize; 3]], &[[usize; 2]])> {
        let faces = self.face_verts.get(region);
        let edges = self.edge_verts.get(region);
        if faces.is_none() && edges.is_none() {
            return Err(FacemeshError::UnknownRegion(region.to_string()))
        }
        Ok((
            faces.map(|f| f.as_slice()).unwrap_or_default(),
            edges.map(|e| e.as_slice()).unwrap_or_default(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshFace {
    pub verts: [usize; 3],
    pub uv: Option<[usize; 3]>,
    pub material: usize,
}

impl MeshFace {
    fn vertex_set(&self) -> [usize; 3] {
        let mut sorted = self.verts;
        sorted.sort_unstable();
        sorted
    }

    fn has_edge(&self, edge: &[usize; 2]) -> bool {
        edge[0] != edge[1] && self.verts.contains(&edge[0]) && self.verts.contains(&edge[1])
    }
}

fn edge_key(a: usize, b: usize) -> [usize; 2] {
    if a <= b { [a, b] } else { [b, a] }
}

/// A face mesh loaded for structural edits. Faces and edges are explicit
/// index sets; vertices are never removed, so table indices stay valid.
#[derive(Debug, Clone, PartialEq)]
pub struct EditableMesh {
    pub vertices: Vec<[f64; 3]>,
    pub uvcoords: Vec<[f64; 2]>,
    pub faces: Vec<MeshFace>,
    edges: BTreeSet<[usize; 2]>,
    pub materials: Vec<String>,
    pub active_material: usize,
    pub mtllib: Option<String>,
}

impl EditableMesh {
    pub fn from_obj(obj: ObjMesh) -> Self {
        let textured = !obj.uv_faces.is_empty() && obj.uv_faces.len() == obj.faces.len();
        let faces: Vec<MeshFace> = obj
            .faces
            .iter()
            .enumerate()
            .map(|(i, verts)| MeshFace {
                verts: *verts,
                uv: if textured { Some(obj.uv_faces[i]) } else { None },
                material: obj.face_materials.get(i).copied().unwrap_or(0),
            })
            .collect();

        let mut mesh = EditableMesh {
            vertices: obj.vertices,
            uvcoords: obj.uvcoords,
            faces: Vec::new(),
            edges: obj.edges.iter().map(|e| edge_key(e[0], e[1])).collect(),
            materials: obj.materials,
            active_material: 0,
            mtllib: obj.mtllib,
        };
        for face in faces {
            mesh.insert_face(face);
        }
        mesh
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(EditableMesh::from_obj(read_obj(path)?))
    }

    fn insert_face(&mut self, face: MeshFace) {
        let [a, b, c] = face.verts;
        self.edges.insert(edge_key(a, b));
        self.edges.insert(edge_key(b, c));
        self.edges.insert(edge_key(c, a));
        self.faces.push(face);
    }

    pub fn has_face(&self, verts: &[usize; 3]) -> bool {
        let mut key = *verts;
        key.sort_unstable();
        self.faces.iter().any(|f| f.vertex_set() == key)
    }

    pub fn has_edge(&self, a: usize, b: usize) -> bool {
        self.edges.contains(&edge_key(a, b))
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// face_vertex_sets lists every face as its sorted vertex triple.
    pub fn face_vertex_sets(&self) -> BTreeSet<[usize; 3]> {
        self.faces.iter().map(|f| f.vertex_set()).collect()
    }

    fn check_indices<'a>(&self, indices: impl IntoIterator<Item = &'a usize>) -> Result<()> {
        let len = self.vertices.len();
        match indices.into_iter().find(|idx| **idx >= len) {
            Some(idx) => Err(FacemeshError::VertexIndexOutOfRange { index: *idx, len }),
            None => Ok(()),
        }
    }

    /// open_region cuts a hole: it deletes every face lying entirely on one of
    /// the region's face entries, then the region's edges together with any
    /// face still using them. Returns the number of faces removed.
    pub fn open_region(&mut self, table: &FaceRegionTable, region: &str) -> Result<usize> {
        self.open_regions(table, &[region])
    }

    /// open_regions opens several holes at once: the faces of every region
    /// go first, then the edges of every region. Nothing changes unless all
    /// regions resolve to valid indices.
    pub fn open_regions(&mut self, table: &FaceRegionTable, regions: &[&str]) -> Result<usize> {
        let resolved = regions
            .iter()
            .map(|region| table.region(region))
            .collect::<Result<Vec<_>>>()?;
        for (face_entries, edge_entries) in &resolved {
            self.check_indices(face_entries.iter().flatten().chain(edge_entries.iter().flatten()))?;
        }

        let before = self.faces.len();
        for entry in resolved.iter().flat_map(|(faces, _)| faces.iter()) {
            self.faces.retain(|face| !face.verts.iter().all(|v| entry.contains(v)));
        }
        for edge in resolved.iter().flat_map(|(_, edges)| edges.iter()) {
            self.edges.remove(&edge_key(edge[0], edge[1]));
            self.faces.retain(|face| !face.has_edge(edge));
        }

        let removed = before - self.faces.len();
        info!("opened {:?}: removed {} faces", regions, removed);
        Ok(removed)
    }

    /// close_region fills a hole with one face per region entry, skipping
    /// entries that already have a face. New faces take the active material.
    /// Returns the number of faces added.
    pub fn close_region(&mut self, table: &FaceRegionTable, region: &str) -> Result<usize> {
        let (face_entries, _) = table.region(region)?;
        self.check_indices(face_entries.iter().flatten())?;

        let per_vertex_uv = !self.uvcoords.is_empty() && self.uvcoords.len() == self.vertices.len();
        let mut added = 0;
        for entry in face_entries {
            if self.has_face(entry) {
                continue
            }
            self.insert_face(MeshFace {
                verts: *entry,
                uv: if per_vertex_uv { Some(*entry) } else { None },
                material: self.active_material,
            });
            added += 1;
        }

        info!("closed region {}: added {} faces", region, added);
        Ok(added)
    }

    /// smart_symmetrize forces exact bilateral symmetry across X: center
    /// vertices get x = 0, and each mirror pair shares its averaged y and z
    /// while the pair's total X width is split evenly around the center.
    pub fn smart_symmetrize(&mut self, symmetry: &SymmetryTable) -> Result<()> {
        self.check_indices(symmetry.center.iter().chain(symmetry.mirror_pairs.iter().flatten()))?;

        for &idx in &symmetry.center {
            self.vertices[idx][0] = 0.0;
        }
        for &[left, right] in &symmetry.mirror_pairs {
            let l = self.vertices[left];
            let r = self.vertices[right];
            let half_width = (l[0].abs() + r[0].abs()) / 2.0;
            let y = (l[1] + r[1]) / 2.0;
            let z = (l[2] + r[2]) / 2.0;
            self.vertices[left] = [-half_width, y, z];
            self.vertices[right] = [half_width, y, z];
        }

        info!(
            "smart symmetrize: {} center vertices, {} mirror pairs",
            symmetry.center.len(), symmetry.mirror_pairs.len()
        );
        Ok(())
    }

    /// symmetrize_snap pairs every vertex with the nearest vertex near its
    /// mirror image across X and blends the two toward each other by
    /// `snap.factor`. Vertices within `snap.threshold` of their own mirror
    /// image are put on the center plane. Returns the number of pairs found.
    pub fn symmetrize_snap(&mut self, snap: &SnapConfig) -> usize {
        let n = self.vertices.len();
        let mut done = vec![false; n];
        let mut pairs = 0;

        for i in 0..n {
            if done[i] {
                continue
            }
            let v = self.vertices[i];
            if (2.0 * v[0]).abs() <= snap.threshold {
                self.vertices[i][0] = 0.0;
                done[i] = true;
                continue
            }

            let mirror = [-v[0], v[1], v[2]];
            let mut best: Option<(usize, f64)> = None;
            for j in (i + 1)..n {
                if done[j] {
                    continue
                }
                let d = distance(&self.vertices[j], &mirror);
                if d <= snap.threshold && best.map_or(true, |(_, bd)| d < bd) {
                    best = Some((j, d));
                }
            }

            if let Some((j, _)) = best {
                let m = self.vertices[j];
                let blended = [
                    v[0] + (-m[0] - v[0]) * snap.factor,
                    v[1] + (m[1] - v[1]) * snap.factor,
                    v[2] + (m[2] - v[2]) * snap.factor,
                ];
                self.vertices[i] = blended;
                self.vertices[j] = [-blended[0], blended[1], blended[2]];
                done[i] = true;
                done[j] = true;
                pairs += 1;
            }
        }

        info!("symmetry snap matched {} vertex pairs", pairs);
        pairs
    }

    /// to_obj_text writes the mesh in stored winding, keeping its material
    /// library and slots. Edges not used by any face are written as `l`.
    pub fn to_obj_text(&self) -> Result<String> {
        let mut out = String::new();
        self.write_obj_text(&mut out)?;
        Ok(out)
    }

    fn write_obj_text(&self, out: &mut String) -> std::fmt::Result {
        if let Some(mtllib) = &self.mtllib {
            write!(out, "mtllib {}\n\n", mtllib)?;
        }
        for v in &self.vertices {
            writeln!(out, "v {} {} {}", v[0], v[1], v[2])?;
        }
        for uv in &self.uvcoords {
            writeln!(out, "vt {} {}", uv[0], uv[1])?;
        }

        let mut current_material: Option<usize> = None;
        for face in &self.faces {
            if current_material != Some(face.material) {
                if let Some(name) = self.materials.get(face.material) {
                    writeln!(out, "usemtl {}", name)?;
                }
                current_material = Some(face.material);
            }
            let [a, b, c] = face.verts;
            match face.uv {
                Some([ta, tb, tc]) => writeln!(out, "f {}/{} {}/{} {}/{}", a + 1, ta + 1, b + 1, tb + 1, c + 1, tc + 1)?,
                None => writeln!(out, "f {} {} {}", a + 1, b + 1, c + 1)?,
            }
        }

        let face_edges: BTreeSet<[usize; 2]> = self
            .faces
            .iter()
            .flat_map(|f| {
                let [a, b, c] = f.verts;
                [edge_key(a, b), edge_key(b, c), edge_key(c, a)]
            })
            .collect();
        for edge in self.edges.difference(&face_edges) {
            writeln!(out, "l {} {}", edge[0] + 1, edge[1] + 1)?;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_obj_text()?)?;
        info!("saved edited mesh {:?} ({} faces)", path, self.faces.len());
        Ok(())
    }
}

/// Named cleanup edits offered to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOp {
    OpenEyes,
    CloseEyes,
    OpenMouth,
    CloseMouth,
    Symmetrize,
    SmartSymmetrize,
}

impl EditableMesh {
    /// apply runs one cleanup edit against the region table.
    pub fn apply(&mut self, op: CleanupOp, table: &FaceRegionTable, snap: &SnapConfig) -> Result<()> {
        match op {
            CleanupOp::OpenEyes => {
                self.open_regions(table, &[REGION_EYE_LEFT, REGION_EYE_RIGHT])?;
            }
            CleanupOp::CloseEyes => {
                self.close_region(table, REGION_EYE_LEFT)?;
                self.close_region(table, REGION_EYE_RIGHT)?;
            }
            CleanupOp::OpenMouth => {
                self.open_region(table, REGION_MOUTH)?;
            }
            CleanupOp::CloseMouth => {
                self.close_region(table, REGION_MOUTH)?;
            }
            CleanupOp::Symmetrize => {
                self.symmetrize_snap(snap);
            }
            CleanupOp::SmartSymmetrize => self.smart_symmetrize(&table.symmetry)?,
        }
        Ok(())
    }
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use serde_json::json;
    use crate::modules::mesh_io::parse_obj;
    use super::*;

    /// A hexagon fan around vertex 0 forms the eye; face 1-2-7 sits outside it.
    fn fan_mesh() -> EditableMesh {
        let mut source = String::from("mtllib face.mtl\nv 0 0 0\n");
        for k in 0..6 {
            let angle = std::f64::consts::PI / 3.0 * k as f64;
            source.push_str(&format!("v {} {} 0\n", angle.cos(), angle.sin()));
        }
        source.push_str("v 2 0.5 0\nusemtl FaceTexture\n");
        for k in 1..=6 {
            source.push_str(&format!("f 1 {} {}\n", k + 1, k % 6 + 2));
        }
        source.push_str("f 2 3 8\n");
        EditableMesh::from_obj(parse_obj(&source).unwrap())
    }

    fn table() -> FaceRegionTable {
        FaceRegionTable::from_value(&json!({
            "bone_positions": {"nose": {"head": 1, "tail": 2}},
            "face_verts": {
                "eye.L": [[0, 1, 2], [0, 2, 3], [0, 3, 4], [0, 4, 5], [0, 5, 6], [0, 6, 1]],
                "mouth": [],
            },
            "edge_verts": {
                "eye.L": [[0, 1], [0, 2], [0, 3], [0, 4], [0, 5], [0, 6]],
                "mouth": [[7, 1]],
            },
            "symmetry": {"center": [0, 3], "mirror_pairs": [[1, 2], [4, 5]]},
        })).unwrap()
    }

    #[test]
    fn test_open_then_close_restores_faces() {
        let mut mesh = fan_mesh();
        let table = table();
        let before = mesh.face_vertex_sets();

        assert_eq!(mesh.open_region(&table, REGION_EYE_LEFT).unwrap(), 6);
        assert_eq!(mesh.faces.len(), 1);
        assert!(!mesh.has_edge(0, 3));
        assert!(mesh.has_edge(1, 2));
        assert_eq!(mesh.vertices.len(), 8);

        assert_eq!(mesh.close_region(&table, REGION_EYE_LEFT).unwrap(), 6);
        assert_eq!(mesh.face_vertex_sets(), before);
        assert!(mesh.has_edge(0, 3));
    }

    #[test]
    fn test_region_edits_are_idempotent() {
        let mut mesh = fan_mesh();
        let table = table();
        assert_eq!(mesh.close_region(&table, REGION_EYE_LEFT).unwrap(), 0);

        mesh.open_region(&table, REGION_EYE_LEFT).unwrap();
        assert_eq!(mesh.open_region(&table, REGION_EYE_LEFT).unwrap(), 0);
    }

    #[test]
    fn test_edge_deletion_takes_its_faces() {
        let mut mesh = fan_mesh();
        assert_eq!(mesh.open_region(&table(), REGION_MOUTH).unwrap(), 1);
        assert!(!mesh.has_face(&[1, 2, 7]));
        assert!(!mesh.has_edge(1, 7));
        assert!(mesh.has_edge(2, 7));
    }

    #[test]
    fn test_closed_faces_use_active_material() {
        let mut mesh = fan_mesh();
        let table = table();
        mesh.open_region(&table, REGION_EYE_LEFT).unwrap();
        mesh.materials.push("Eye".to_string());
        mesh.active_material = 1;
        mesh.close_region(&table, REGION_EYE_LEFT).unwrap();

        assert!(mesh.faces.iter().filter(|f| f.material == 1).count() == 6);
        let text = mesh.to_obj_text().unwrap();
        assert!(text.starts_with("mtllib face.mtl\n\n"));
        assert!(text.contains("usemtl Eye\nf 1 2 3\n"));
    }

    #[test]
    fn test_saved_hole_keeps_boundary_edges() {
        let mut mesh = fan_mesh();
        mesh.open_region(&table(), REGION_EYE_LEFT).unwrap();
        let reloaded = EditableMesh::from_obj(parse_obj(&mesh.to_obj_text().unwrap()).unwrap());

        assert_eq!(reloaded.face_vertex_sets(), mesh.face_vertex_sets());
        assert_eq!(reloaded.num_edges(), mesh.num_edges());
        assert!(reloaded.has_edge(3, 4));
    }

    #[test]
    fn test_unknown_region_and_bad_indices() {
        let mut mesh = fan_mesh();
        assert!(matches!(mesh.open_region(&table(), "ear.L"), Err(FacemeshError::UnknownRegion(_))));

        let mut table = table();
        table.face_verts.insert("mouth".to_string(), vec![[0, 1, 99]]);
        let before = mesh.clone();
        assert!(matches!(
            mesh.close_region(&table, REGION_MOUTH),
            Err(FacemeshError::VertexIndexOutOfRange { index: 99, len: 8 })
        ));
        assert_eq!(mesh, before);
    }

    #[test]
    fn test_smart_symmetrize_is_exact() {
        let mut mesh = fan_mesh();
        mesh.vertices[1] = [-0.31, 0.2, 0.05];
        mesh.vertices[2] = [0.27, 0.24, -0.01];
        mesh.vertices[3] = [0.013, 0.5, 0.1];
        let symmetry = table().symmetry;
        mesh.smart_symmetrize(&symmetry).unwrap();

        for &[l, r] in &symmetry.mirror_pairs {
            let (vl, vr) = (mesh.vertices[l], mesh.vertices[r]);
            assert_eq!(vl[0], -vr[0]);
            assert_eq!(vl[1], vr[1]);
            assert_eq!(vl[2], vr[2]);
        }
        for &c in &symmetry.center {
            assert_eq!(mesh.vertices[c][0], 0.0);
        }
        assert_relative_eq!(mesh.vertices[2][0], 0.29, epsilon = 1e-12);
        assert_relative_eq!(mesh.vertices[1][1], 0.22, epsilon = 1e-12);
    }

    #[test]
    fn test_symmetrize_snap_blends_pairs() {
        let mut mesh = fan_mesh();
        mesh.vertices = vec![[0.2, 1.0, 0.0], [0.01, 0.5, 0.0], [-0.22, 1.02, 0.0], [3.0, 0.0, 0.0]];
        mesh.faces.clear();
        let pairs = mesh.symmetrize_snap(&SnapConfig::new());

        assert_eq!(pairs, 1);
        assert_relative_eq!(mesh.vertices[0][0], 0.21, epsilon = 1e-12);
        assert_relative_eq!(mesh.vertices[2][0], -0.21, epsilon = 1e-12);
        assert_relative_eq!(mesh.vertices[0][1], 1.01, epsilon = 1e-12);
        assert_eq!(mesh.vertices[1][0], 0.0);
        assert_eq!(mesh.vertices[3], [3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_apply_named_edits() {
        let mut mesh = fan_mesh();
        let mut table = table();
        table.face_verts.insert(REGION_EYE_RIGHT.to_string(), vec![]);
        let snap = SnapConfig::new();

        mesh.apply(CleanupOp::OpenEyes, &table, &snap).unwrap();
        assert_eq!(mesh.faces.len(), 1);
        mesh.apply(CleanupOp::CloseEyes, &table, &snap).unwrap();
        assert_eq!(mesh.faces.len(), 7);
        mesh.apply(CleanupOp::OpenMouth, &table, &snap).unwrap();
        assert!(!mesh.has_face(&[1, 2, 7]));
    }

    #[test]
    fn test_open_eyes_checks_both_regions_before_editing() {
        let mut mesh = fan_mesh();
        let mut table = table();
        table.edge_verts.insert(REGION_EYE_RIGHT.to_string(), vec![[7, 42]]);
        let before = mesh.clone();

        assert!(matches!(
            mesh.apply(CleanupOp::OpenEyes, &table, &SnapConfig::new()),
            Err(FacemeshError::VertexIndexOutOfRange { index: 42, len: 8 })
        ));
        assert_eq!(mesh, before);
    }

    #[test]
    fn test_open_regions_opens_both_eyes() {
        let mut mesh = fan_mesh();
        let mut table = table();
        table.face_verts.insert(REGION_EYE_RIGHT.to_string(), vec![[1, 2, 7]]);
        table.edge_verts.insert(REGION_EYE_RIGHT.to_string(), vec![[2, 7]]);

        assert_eq!(mesh.open_regions(&table, &[REGION_EYE_LEFT, REGION_EYE_RIGHT]).unwrap(), 7);
        assert!(mesh.faces.is_empty());
        assert!(!mesh.has_edge(2, 7));
        assert!(mesh.has_edge(1, 2));
        assert!(mesh.has_edge(1, 7));
    }
}
