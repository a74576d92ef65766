//! Per-technique description of the stage graph. The recorder is generic, a
//! technique only decides shaders, bindings and query types.

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::accel::{OutputType, QueryType};
use crate::device::{BindingDescriptor, BindingKind};

/// Every buffer a stage can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameBuffer {
    Params,
    Color,
    Vertices,
    Indices,
    Shapes,
    Random,
    CameraRays,
    SecondaryRays,
    SecondaryCount,
    Hits,
    SecondaryHits,
    SecondaryIds,
    Accumulation,
    TraceScratch,
}

impl FrameBuffer {
    pub fn name(&self) -> &'static str {
        match self {
            FrameBuffer::Params => "params",
            FrameBuffer::Color => "color",
            FrameBuffer::Vertices => "vertices",
            FrameBuffer::Indices => "indices",
            FrameBuffer::Shapes => "shapes",
            FrameBuffer::Random => "random",
            FrameBuffer::CameraRays => "camera_rays",
            FrameBuffer::SecondaryRays => "secondary_rays",
            FrameBuffer::SecondaryCount => "secondary_count",
            FrameBuffer::Hits => "hits",
            FrameBuffer::SecondaryHits => "secondary_hits",
            FrameBuffer::SecondaryIds => "secondary_ids",
            FrameBuffer::Accumulation => "accumulation",
            FrameBuffer::TraceScratch => "trace_scratch",
        }
    }

    /// Lives in the host-visible arena.
    pub fn is_host_visible(&self) -> bool {
        matches!(
            self,
            FrameBuffer::Params
                | FrameBuffer::Color
                | FrameBuffer::Vertices
                | FrameBuffer::Indices
                | FrameBuffer::Shapes
                | FrameBuffer::Random
        )
    }
}

#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub name: &'static str,
    pub shader: &'static str,
    pub bindings: Vec<(BindingKind, FrameBuffer)>,
    /// Buffers the stage writes, covered by the barrier after it.
    pub writes: Vec<FrameBuffer>,
}

impl StageDescriptor {
    fn new(
        name: &'static str,
        shader: &'static str,
        buffers: &[FrameBuffer],
        writes: &[FrameBuffer],
    ) -> Self {
        let bindings = buffers
            .iter()
            .map(|&buffer| {
                let kind = if buffer == FrameBuffer::Params {
                    BindingKind::Uniform
                } else {
                    BindingKind::Storage
                };
                (kind, buffer)
            })
            .collect();
        Self {
            name,
            shader,
            bindings,
            writes: writes.to_vec(),
        }
    }

    pub fn binding_descriptors(&self) -> Vec<BindingDescriptor> {
        self.bindings
            .iter()
            .map(|(kind, _)| BindingDescriptor {
                kind: *kind,
                count: 1,
            })
            .collect()
    }

    pub fn buffers(&self) -> impl Iterator<Item = FrameBuffer> + '_ {
        self.bindings.iter().map(|(_, buffer)| *buffer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceStep {
    pub query: QueryType,
    pub output: OutputType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechniqueKind {
    #[default]
    AmbientOcclusion,
    PathTrace,
}

#[derive(Debug, Clone)]
pub struct Technique {
    pub kind: TechniqueKind,
    /// Runs before the camera stage, followed by its own barrier.
    pub clear: Option<StageDescriptor>,
    pub camera: StageDescriptor,
    pub secondary: StageDescriptor,
    pub resolve: StageDescriptor,
    pub primary_trace: TraceStep,
    pub secondary_trace: TraceStep,
    /// Bytes of accumulation state per pixel.
    pub accumulation_stride: vk::DeviceSize,
}

impl Technique {
    pub fn new(kind: TechniqueKind) -> Self {
        match kind {
            TechniqueKind::AmbientOcclusion => Self::ambient_occlusion(),
            TechniqueKind::PathTrace => Self::path_trace(),
        }
    }

    pub fn ambient_occlusion() -> Self {
        use FrameBuffer::*;
        Self {
            kind: TechniqueKind::AmbientOcclusion,
            clear: None,
            camera: StageDescriptor::new(
                "camera",
                "camera_rays",
                &[Params, CameraRays, SecondaryCount, Accumulation, Color, Random],
                &[CameraRays, SecondaryCount, Accumulation, Color],
            ),
            secondary: StageDescriptor::new(
                "secondary",
                "ao_rays",
                &[
                    Params, SecondaryIds, SecondaryRays, SecondaryCount, Hits, CameraRays, Random,
                    Shapes, Indices, Vertices,
                ],
                &[SecondaryRays, SecondaryCount, SecondaryIds],
            ),
            resolve: StageDescriptor::new(
                "resolve",
                "ao_rays_resolve",
                &[Accumulation, Color, SecondaryIds, SecondaryCount, SecondaryHits],
                &[Accumulation, Color],
            ),
            primary_trace: TraceStep {
                query: QueryType::Intersect,
                output: OutputType::FullHit,
            },
            secondary_trace: TraceStep {
                query: QueryType::Occluded,
                output: OutputType::InstanceIdOnly,
            },
            accumulation_stride: 2 * 4,
        }
    }

    pub fn path_trace() -> Self {
        use FrameBuffer::*;
        Self {
            kind: TechniqueKind::PathTrace,
            clear: Some(StageDescriptor::new(
                "clear",
                "clear_counter",
                &[SecondaryCount],
                &[SecondaryCount],
            )),
            camera: StageDescriptor::new(
                "camera",
                "pt_camera_rays",
                &[Params, CameraRays, Accumulation, Color, Random],
                &[CameraRays, Accumulation, Color],
            ),
            secondary: StageDescriptor::new(
                "secondary",
                "bounce_rays",
                &[
                    Params, SecondaryIds, SecondaryRays, SecondaryCount, Hits, CameraRays, Random,
                    Shapes, Indices, Vertices, Accumulation, Color,
                ],
                &[SecondaryRays, SecondaryCount, SecondaryIds, Accumulation, Color],
            ),
            resolve: StageDescriptor::new(
                "resolve",
                "shade",
                &[
                    Accumulation, Color, SecondaryIds, SecondaryCount, SecondaryHits, Hits, Shapes,
                    Indices, Vertices,
                ],
                &[Accumulation, Color],
            ),
            primary_trace: TraceStep {
                query: QueryType::Intersect,
                output: OutputType::FullHit,
            },
            secondary_trace: TraceStep {
                query: QueryType::Intersect,
                output: OutputType::FullHit,
            },
            accumulation_stride: 4 * 4,
        }
    }

    /// Stages in recording order.
    pub fn stages(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.clear
            .iter()
            .chain([&self.camera, &self.secondary, &self.resolve])
    }

    pub fn stage_count(&self) -> u32 {
        self.stages().count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::kernel_lookup;

    #[test]
    fn binding_counts_match_kernels() {
        for technique in [Technique::ambient_occlusion(), Technique::path_trace()] {
            for stage in technique.stages() {
                let (_, count) = kernel_lookup(stage.shader).unwrap();
                assert_eq!(stage.bindings.len(), count, "{}", stage.shader);
                for written in &stage.writes {
                    assert!(stage.buffers().any(|buffer| buffer == *written));
                }
            }
        }
    }

    #[test]
    fn path_trace_has_clear_stage() {
        assert_eq!(Technique::ambient_occlusion().stage_count(), 3);
        assert_eq!(Technique::path_trace().stage_count(), 4);
        assert_eq!(
            Technique::path_trace().secondary_trace.output,
            OutputType::FullHit
        );
    }
}
