//! Triangle meshes produced for each tissue.

use crate::enums::TissueKind;

/// Indexed triangle mesh in physical (x, y, z) coordinates, mm.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriangleMesh {
    pub vertices: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
    /// Per-vertex unit normals, same length as `vertices` once computed.
    pub normals: Vec<[f32; 3]>,
}

impl TriangleMesh {
    pub fn new(vertices: Vec<[f32; 3]>, faces: Vec<[u32; 3]>) -> Self {
        let mut mesh = Self {
            vertices,
            faces,
            normals: Vec::new(),
        };
        mesh.compute_vertex_normals();
        mesh
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Area-weighted vertex normals. Isolated vertices get a zero normal.
    pub fn compute_vertex_normals(&mut self) {
        let mut normals = vec![[0.0_f32; 3]; self.vertices.len()];
        for face in &self.faces {
            let n = face_normal_unnormalized(
                self.vertices[face[0] as usize],
                self.vertices[face[1] as usize],
                self.vertices[face[2] as usize],
            );
            for &vi in face {
                let acc = &mut normals[vi as usize];
                acc[0] += n[0];
                acc[1] += n[1];
                acc[2] += n[2];
            }
        }
        for n in &mut normals {
            let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            if len > f32::EPSILON {
                n.iter_mut().for_each(|c| *c /= len);
            } else {
                *n = [0.0; 3];
            }
        }
        self.normals = normals;
    }

    /// Axis-aligned bounds, `None` for a mesh without vertices.
    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let first = *self.vertices.first()?;
        Some(self.vertices.iter().fold((first, first), |(mut lo, mut hi), v| {
            for axis in 0..3 {
                lo[axis] = lo[axis].min(v[axis]);
                hi[axis] = hi[axis].max(v[axis]);
            }
            (lo, hi)
        }))
    }

    /// Drop vertices no face references, renumbering faces.
    pub fn compact(&mut self) {
        let mut remap = vec![u32::MAX; self.vertices.len()];
        let mut vertices = Vec::with_capacity(self.vertices.len());
        for face in &mut self.faces {
            for idx in face.iter_mut() {
                let old = *idx as usize;
                if remap[old] == u32::MAX {
                    remap[old] = vertices.len() as u32;
                    vertices.push(self.vertices[old]);
                }
                *idx = remap[old];
            }
        }
        self.vertices = vertices;
        self.compute_vertex_normals();
    }
}

pub(crate) fn face_normal_unnormalized(a: [f32; 3], b: [f32; 3], c: [f32; 3]) -> [f32; 3] {
    let e1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let e2 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    [
        e1[1] * e2[2] - e1[2] * e2[1],
        e1[2] * e2[0] - e1[0] * e2[2],
        e1[0] * e2[1] - e1[1] * e2[0],
    ]
}

/// Flat 8-bit RGBA color.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    /// `#RRGGBB`, alpha omitted.
    pub fn to_hex(self) -> String {
        let [r, g, b, _] = self.0;
        format!("#{r:02X}{g:02X}{b:02X}")
    }

    /// Channels scaled to 0..=1.
    pub fn to_factor(self) -> [f32; 4] {
        self.0.map(|c| f32::from(c) / 255.0)
    }
}

/// One tissue's mesh with its display attributes.
#[derive(Clone, Debug)]
pub struct MeshArtifact {
    pub tissue: TissueKind,
    pub mesh: TriangleMesh,
    pub color: Rgba,
    /// Viewer hint; `color` itself stays opaque.
    pub opacity: f32,
}

impl MeshArtifact {
    pub fn new(tissue: TissueKind, mesh: TriangleMesh) -> Self {
        Self {
            tissue,
            mesh,
            color: Rgba(tissue.rgba()),
            opacity: tissue.opacity(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.tissue.name()
    }
}
