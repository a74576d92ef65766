use ultraviolet::Vec3;

use super::{Mesh, Scene, Vertex};

impl Scene {
    /// One triangle in the z = 0 plane facing +z.
    pub fn single_triangle() -> Self {
        let normal = [0.0, 0.0, 1.0];
        let color = [0.8, 0.8, 0.8];
        let mesh = Mesh {
            vertices: vec![
                Vertex::new([-1.0, -1.0, 0.0], normal, [0.0, 0.0], color),
                Vertex::new([1.0, -1.0, 0.0], normal, [1.0, 0.0], color),
                Vertex::new([0.0, 1.0, 0.0], normal, [0.5, 1.0], color),
            ],
            indices: vec![0, 1, 2],
            material_id: 0,
        };
        Scene { meshes: vec![mesh] }
    }

    /// A 20x20 ground plane at y = 0 with a row of unit boxes standing on it.
    pub fn ground_with_boxes(box_count: u32) -> Self {
        let mut ground = Mesh::default();
        ground.push_quad(
            [
                Vec3::new(-10.0, 0.0, 10.0),
                Vec3::new(10.0, 0.0, 10.0),
                Vec3::new(10.0, 0.0, -10.0),
                Vec3::new(-10.0, 0.0, -10.0),
            ],
            Vec3::new(0.7, 0.7, 0.7),
        );

        let mut meshes = vec![ground];
        let start = -(box_count as f32 - 1.0) * 1.5;
        for i in 0..box_count {
            let center = Vec3::new(start + i as f32 * 3.0, 1.0, 0.0);
            let hue = i as f32 / box_count.max(1) as f32;
            let color = Vec3::new(0.9 - 0.6 * hue, 0.3 + 0.4 * hue, 0.3 + 0.6 * hue);
            meshes.push(Mesh::cuboid(center, Vec3::one(), color, i + 1));
        }
        Scene { meshes }
    }

    /// Open box with a red left wall, a green right wall and two blocks inside.
    pub fn cornell_box() -> Self {
        let white = Vec3::new(0.73, 0.73, 0.73);
        let p = |x: f32, y: f32, z: f32| Vec3::new(x, y, z);

        let mut walls = Mesh::default();
        walls.push_quad([p(-1., 0., 1.), p(1., 0., 1.), p(1., 0., -1.), p(-1., 0., -1.)], white);
        walls.push_quad([p(-1., 2., -1.), p(1., 2., -1.), p(1., 2., 1.), p(-1., 2., 1.)], white);
        walls.push_quad([p(-1., 0., -1.), p(1., 0., -1.), p(1., 2., -1.), p(-1., 2., -1.)], white);

        let mut left = Mesh {
            material_id: 1,
            ..Mesh::default()
        };
        left.push_quad(
            [p(-1., 0., 1.), p(-1., 0., -1.), p(-1., 2., -1.), p(-1., 2., 1.)],
            Vec3::new(0.65, 0.05, 0.05),
        );

        let mut right = Mesh {
            material_id: 2,
            ..Mesh::default()
        };
        right.push_quad(
            [p(1., 0., -1.), p(1., 0., 1.), p(1., 2., 1.), p(1., 2., -1.)],
            Vec3::new(0.12, 0.45, 0.15),
        );

        let tall = Mesh::cuboid(p(-0.35, 0.6, -0.3), p(0.3, 0.6, 0.3), white, 3);
        let short = Mesh::cuboid(p(0.35, 0.3, 0.3), p(0.3, 0.3, 0.3), white, 3);

        Scene {
            meshes: vec![walls, left, right, tall, short],
        }
    }
}
