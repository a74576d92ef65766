use ultraviolet::Vec3;

use super::Vertex;

#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    /// Triangle list, indices are local to this mesh's vertices.
    pub indices: Vec<u32>,
    pub material_id: u32,
}

impl Mesh {
    pub fn primitive_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    pub fn positions(&self) -> Vec<[f32; 3]> {
        self.vertices.iter().map(|v| v.position).collect()
    }

    /// Appends a quad with corners in counter-clockwise order.
    pub fn push_quad(&mut self, corners: [Vec3; 4], color: Vec3) {
        let normal = (corners[1] - corners[0])
            .cross(corners[3] - corners[0])
            .normalized();
        let texcoords = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

        let base = self.vertices.len() as u32;
        for (corner, texcoord) in corners.iter().zip(texcoords) {
            self.vertices.push(Vertex::new(
                (*corner).into(),
                normal.into(),
                texcoord,
                color.into(),
            ));
        }
        self.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    pub fn cuboid(center: Vec3, half_extent: Vec3, color: Vec3, material_id: u32) -> Self {
        let mut mesh = Mesh {
            material_id,
            ..Mesh::default()
        };
        let corner = |x: f32, y: f32, z: f32| {
            center + Vec3::new(x * half_extent.x, y * half_extent.y, z * half_extent.z)
        };
        #[rustfmt::skip]
        let faces = [
            [corner(-1., -1., 1.), corner(1., -1., 1.), corner(1., 1., 1.), corner(-1., 1., 1.)],
            [corner(1., -1., -1.), corner(-1., -1., -1.), corner(-1., 1., -1.), corner(1., 1., -1.)],
            [corner(1., -1., 1.), corner(1., -1., -1.), corner(1., 1., -1.), corner(1., 1., 1.)],
            [corner(-1., -1., -1.), corner(-1., -1., 1.), corner(-1., 1., 1.), corner(-1., 1., -1.)],
            [corner(-1., 1., 1.), corner(1., 1., 1.), corner(1., 1., -1.), corner(-1., 1., -1.)],
            [corner(-1., -1., -1.), corner(1., -1., -1.), corner(1., -1., 1.), corner(-1., -1., 1.)],
        ];
        for face in faces {
            mesh.push_quad(face, color);
        }
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuboid_normals_point_outwards() {
        let mesh = Mesh::cuboid(Vec3::zero(), Vec3::one(), Vec3::one(), 0);
        assert_eq!(mesh.primitive_count(), 12);
        for vertex in &mesh.vertices {
            let position = Vec3::from(vertex.position);
            let normal = Vec3::from(vertex.normal);
            assert!(position.dot(normal) > 0.0);
        }
    }
}
