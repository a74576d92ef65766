mod mesh;
mod primitives;
mod vertex;

pub use mesh::*;
pub use vertex::*;

use crate::render::shader_types::Shape;

/// Geometry handed to the pipeline. Owned by the caller, read-only to the core.
#[derive(Clone, Debug, Default)]
pub struct Scene {
    pub meshes: Vec<Mesh>,
}

/// Concatenated geometry in the layout the stages bind.
#[derive(Clone, Debug, Default)]
pub struct SceneArrays {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// One per mesh, the array index is the instance id reported by traces.
    pub shapes: Vec<Shape>,
}

impl Scene {
    pub fn primitive_count(&self) -> u32 {
        self.meshes.iter().map(|mesh| mesh.primitive_count()).sum()
    }

    pub fn flatten(&self) -> SceneArrays {
        let mut arrays = SceneArrays::default();
        for mesh in &self.meshes {
            arrays.shapes.push(Shape {
                count: mesh.primitive_count(),
                first_index: arrays.indices.len() as u32,
                base_vertex: arrays.vertices.len() as u32,
                material_id: mesh.material_id,
            });
            arrays.vertices.extend_from_slice(&mesh.vertices);
            arrays.indices.extend_from_slice(&mesh.indices);
        }
        arrays
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_index_into_flattened_arrays() {
        let scene = Scene::ground_with_boxes(2);
        let arrays = scene.flatten();

        assert_eq!(arrays.shapes.len(), scene.meshes.len());
        for (shape, mesh) in arrays.shapes.iter().zip(&scene.meshes) {
            assert_eq!(shape.count, mesh.primitive_count());
            let first = shape.first_index as usize;
            let indices = &arrays.indices[first..first + mesh.indices.len()];
            assert_eq!(indices, &mesh.indices[..]);
            let base = shape.base_vertex as usize;
            assert_eq!(arrays.vertices[base], mesh.vertices[0]);
        }
        assert_eq!(arrays.indices.len() as u32, scene.primitive_count() * 3);
    }
}
