//! Binary glTF 2.0 (GLB) export.
//!
//! One node, mesh and material per tissue. Each mesh carries positions,
//! normals and `u32` indices in a single binary buffer.

use serde_json::{Value, json};

use crate::{
    error::{Error, Result},
    mesh::MeshArtifact,
};

const GLB_MAGIC: &[u8; 4] = b"glTF";
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: &[u8; 4] = b"JSON";
const CHUNK_BIN: &[u8; 4] = b"BIN\0";

const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;
const FLOAT: u32 = 5126;
const UNSIGNED_INT: u32 = 5125;

fn align_to_4bytes(buffer: &mut Vec<u8>, pad: u8) {
    while buffer.len() % 4 != 0 {
        buffer.push(pad);
    }
}

#[derive(Default)]
struct BufferBuilder {
    data: Vec<u8>,
    views: Vec<Value>,
    accessors: Vec<Value>,
}

impl BufferBuilder {
    /// Append `bytes` as a new buffer view and return its accessor index.
    fn push(&mut self, bytes: &[u8], target: u32, mut accessor: Value) -> usize {
        let offset = self.data.len();
        self.data.extend_from_slice(bytes);
        self.views.push(json!({
            "buffer": 0,
            "byteOffset": offset,
            "byteLength": bytes.len(),
            "target": target,
        }));
        align_to_4bytes(&mut self.data, 0);
        accessor["bufferView"] = json!(self.views.len() - 1);
        self.accessors.push(accessor);
        self.accessors.len() - 1
    }
}

/// Encode `meshes` as a GLB document.
///
/// # Errors
///
/// Returns [`Error::NoUsableMeshes`] when there is nothing to export and
/// [`Error::Json`] if the JSON chunk cannot be serialised.
pub fn encode(meshes: &[MeshArtifact]) -> Result<Vec<u8>> {
    let meshes: Vec<&MeshArtifact> = meshes.iter().filter(|m| !m.mesh.is_empty()).collect();
    if meshes.is_empty() {
        return Err(Error::NoUsableMeshes(Vec::new()));
    }

    let mut buffer = BufferBuilder::default();
    let mut nodes = Vec::new();
    let mut gltf_meshes = Vec::new();
    let mut materials = Vec::new();

    for (i, artifact) in meshes.iter().enumerate() {
        let mesh = &artifact.mesh;
        let (min, max) = mesh.bounds().unwrap_or(([0.0; 3], [0.0; 3]));

        let positions = buffer.push(
            bytemuck::cast_slice(&mesh.vertices),
            ARRAY_BUFFER,
            json!({
                "componentType": FLOAT,
                "count": mesh.vertex_count(),
                "type": "VEC3",
                "min": min,
                "max": max,
            }),
        );
        let mut attributes = json!({ "POSITION": positions });
        if mesh.normals.len() == mesh.vertices.len() {
            let normals = buffer.push(
                bytemuck::cast_slice(&mesh.normals),
                ARRAY_BUFFER,
                json!({
                    "componentType": FLOAT,
                    "count": mesh.normals.len(),
                    "type": "VEC3",
                }),
            );
            attributes["NORMAL"] = json!(normals);
        }
        let indices = buffer.push(
            bytemuck::cast_slice(&mesh.faces),
            ELEMENT_ARRAY_BUFFER,
            json!({
                "componentType": UNSIGNED_INT,
                "count": mesh.face_count() * 3,
                "type": "SCALAR",
            }),
        );

        materials.push(json!({
            "name": artifact.name(),
            "pbrMetallicRoughness": {
                "baseColorFactor": artifact.color.to_factor(),
                "metallicFactor": 0.0,
                "roughnessFactor": 0.8,
            },
            "doubleSided": true,
        }));
        gltf_meshes.push(json!({
            "name": artifact.name(),
            "primitives": [{
                "attributes": attributes,
                "indices": indices,
                "material": i,
                "mode": 4,
            }],
        }));
        nodes.push(json!({
            "name": artifact.name(),
            "mesh": i,
            "extras": { "opacity": artifact.opacity },
        }));
    }

    let document = json!({
        "asset": { "version": "2.0", "generator": env!("CARGO_PKG_NAME") },
        "scene": 0,
        "scenes": [{ "nodes": (0..nodes.len()).collect::<Vec<_>>() }],
        "nodes": nodes,
        "meshes": gltf_meshes,
        "materials": materials,
        "accessors": buffer.accessors,
        "bufferViews": buffer.views,
        "buffers": [{ "byteLength": buffer.data.len() }],
    });

    let mut json_bytes = serde_json::to_vec(&document)?;
    align_to_4bytes(&mut json_bytes, b' ');
    let mut bin = buffer.data;
    align_to_4bytes(&mut bin, 0);

    let total_length = 12 + 8 + json_bytes.len() + 8 + bin.len();
    let mut out = Vec::with_capacity(total_length);
    out.extend_from_slice(GLB_MAGIC);
    out.extend_from_slice(&GLB_VERSION.to_le_bytes());
    out.extend_from_slice(&(total_length as u32).to_le_bytes());
    out.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(CHUNK_JSON);
    out.extend_from_slice(&json_bytes);
    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(CHUNK_BIN);
    out.extend_from_slice(&bin);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{enums::TissueKind, mesh::TriangleMesh};

    fn triangle() -> TriangleMesh {
        TriangleMesh::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![[0, 1, 2]],
        )
    }

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn header_and_chunks_are_consistent() {
        let meshes = vec![
            MeshArtifact::new(TissueKind::Body, triangle()),
            MeshArtifact::new(TissueKind::Organs, triangle()),
        ];
        let bytes = encode(&meshes).unwrap();

        assert_eq!(&bytes[0..4], b"glTF");
        assert_eq!(read_u32(&bytes, 4), 2);
        assert_eq!(read_u32(&bytes, 8) as usize, bytes.len());

        let json_len = read_u32(&bytes, 12) as usize;
        assert_eq!(json_len % 4, 0);
        assert_eq!(&bytes[16..20], b"JSON");
        let doc: Value = serde_json::from_slice(&bytes[20..20 + json_len]).unwrap();
        assert_eq!(doc["meshes"].as_array().unwrap().len(), 2);
        assert_eq!(doc["nodes"][0]["name"], "body");
        assert_eq!(doc["accessors"][0]["count"], 3);

        let bin_at = 20 + json_len;
        let bin_len = read_u32(&bytes, bin_at) as usize;
        assert_eq!(&bytes[bin_at + 4..bin_at + 8], b"BIN\0");
        assert_eq!(doc["buffers"][0]["byteLength"], bin_len);
        assert_eq!(bin_at + 8 + bin_len, bytes.len());
    }

    #[test]
    fn nothing_to_export_is_an_error() {
        let empty = vec![MeshArtifact::new(TissueKind::Body, TriangleMesh::default())];
        assert!(matches!(encode(&empty), Err(Error::NoUsableMeshes(_))));
    }
}
