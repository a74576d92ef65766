use bytemuck::{Pod, Zeroable};

/// Interleaved vertex as the geometry stages read it, 11 floats.
#[derive(Clone, Debug, Copy, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub texcoord: [f32; 2],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(
        position: [f32; 3],
        normal: [f32; 3],
        texcoord: [f32; 2],
        color: [f32; 3],
    ) -> Self {
        Self {
            position,
            normal,
            texcoord,
            color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_eleven_floats() {
        assert_eq!(std::mem::size_of::<Vertex>(), 44);
        assert_eq!(std::mem::offset_of!(Vertex, texcoord), 24);
        assert_eq!(std::mem::offset_of!(Vertex, color), 32);
    }
}
