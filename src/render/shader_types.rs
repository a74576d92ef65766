//! Structs shared with the compute stages. Layouts match the std430/std140
//! declarations in `assets/shaders/common.glsl`.

use bytemuck::{Pod, Zeroable};
use ultraviolet::{Mat4, Vec3, Vec4};

/// Instance id written for rays that hit nothing.
pub const INVALID_ID: u32 = 0xFFFF_FFFF;

#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Ray {
    pub direction: [f32; 3],
    pub min_t: f32,
    pub origin: [f32; 3],
    pub max_t: f32,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3, min_t: f32, max_t: f32) -> Self {
        Self {
            direction: direction.into(),
            min_t,
            origin: origin.into(),
            max_t,
        }
    }

    pub fn origin(&self) -> Vec3 {
        Vec3::from(self.origin)
    }

    pub fn direction(&self) -> Vec3 {
        Vec3::from(self.direction)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Hit {
    pub instance_id: u32,
    pub primitive_id: u32,
    pub uv: [f32; 2],
}

impl Hit {
    pub const MISS: Hit = Hit {
        instance_id: INVALID_ID,
        primitive_id: INVALID_ID,
        uv: [0.0, 0.0],
    };

    pub fn is_miss(&self) -> bool {
        self.instance_id == INVALID_ID
    }
}

impl Default for Hit {
    fn default() -> Self {
        Hit::MISS
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Shape {
    pub count: u32,
    pub first_index: u32,
    pub base_vertex: u32,
    pub material_id: u32,
}

/// Per-frame view state. Every member is vec4 aligned so std140 and repr(C) agree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Params {
    /// `w` is the accumulated sample index.
    pub eye: [f32; 4],
    pub center: [f32; 4],
    /// near, far, secondary ray length, unused
    pub near_far: [f32; 4],
    /// width, height, 1 / width, 1 / height
    pub screen_dims: [f32; 4],
    /// Column-major.
    pub view_proj_inv: [f32; 16],
}

impl Params {
    pub fn width(&self) -> u32 {
        self.screen_dims[0] as u32
    }

    pub fn height(&self) -> u32 {
        self.screen_dims[1] as u32
    }

    pub fn sample_index(&self) -> u32 {
        self.eye[3] as u32
    }

    pub fn view_projection_inverse(&self) -> Mat4 {
        mat4_from_array(&self.view_proj_inv)
    }
}

pub fn mat4_to_array(matrix: &Mat4) -> [f32; 16] {
    let mut out = [0.0; 16];
    for (column, chunk) in matrix.cols.iter().zip(out.chunks_exact_mut(4)) {
        chunk.copy_from_slice(&[column.x, column.y, column.z, column.w]);
    }
    out
}

pub fn mat4_from_array(values: &[f32; 16]) -> Mat4 {
    let column = |i: usize| Vec4::new(values[i], values[i + 1], values[i + 2], values[i + 3]);
    Mat4::new(column(0), column(4), column(8), column(12))
}

/// Packs a linear color in [0, 1] into RGBA8 with opaque alpha.
pub fn pack_color(color: Vec3) -> u32 {
    let channel = |value: f32| (value.clamp(0.0, 1.0) * 255.0 + 0.5) as u32;
    channel(color.x) | channel(color.y) << 8 | channel(color.z) << 16 | 0xFF << 24
}

pub fn unpack_color(packed: u32) -> Vec3 {
    let channel = |shift: u32| ((packed >> shift) & 0xFF) as f32 / 255.0;
    Vec3::new(channel(0), channel(8), channel(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_layouts() {
        assert_eq!(std::mem::size_of::<Ray>(), 32);
        assert_eq!(std::mem::size_of::<Hit>(), 16);
        assert_eq!(std::mem::size_of::<Shape>(), 16);
        assert_eq!(std::mem::size_of::<Params>(), 128);
        assert_eq!(std::mem::offset_of!(Ray, origin), 16);
        assert_eq!(std::mem::offset_of!(Params, view_proj_inv), 64);
    }

    #[test]
    fn matrix_array_is_column_major() {
        let matrix = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let values = mat4_to_array(&matrix);
        assert_eq!(&values[12..15], &[1.0, 2.0, 3.0]);
        assert_eq!(mat4_from_array(&values), matrix);
    }

    #[test]
    fn packed_gray_levels() {
        assert_eq!(pack_color(Vec3::zero()), 0xFF00_0000);
        assert_eq!(pack_color(Vec3::one()), 0xFFFF_FFFF);
        let half = unpack_color(pack_color(Vec3::broadcast(0.5)));
        assert!((half.x - 0.5).abs() < 1.0 / 255.0);
    }
}
