//! Acceleration structures: the intersection engine boundary and the
//! build sequencer that turns meshes into bottom- and top-level structures.

use std::sync::Arc;

use ash::vk;

use crate::arena::{ArenaRequest, DeviceMemoryArena};
use crate::device::{ComputeDevice, DeviceError, MemoryRequirements};
use crate::error::{Error, Result};
use crate::scene::Mesh;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("{0} memory is not bound")]
    StructureNotBound(&'static str),

    #[error("referenced structures live in different allocations")]
    MixedAllocations,

    #[error("{kind:?} structure cannot be built from {input}")]
    WrongInput {
        kind: StructureKind,
        input: &'static str,
    },

    #[error("{actual} primitives exceed the maximum of {max}")]
    TooManyPrimitives { max: u32, actual: u32 },

    #[error("{name} buffer holds {actual} bytes, {required} are needed")]
    BufferTooSmall {
        name: &'static str,
        required: u64,
        actual: u64,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureKind {
    BottomLevel,
    TopLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOperation {
    Build,
    /// Refit in place. Reserved, engines report it as not implemented.
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    /// Closest hit.
    Intersect,
    /// Any hit, enough for shadow and occlusion rays.
    Occluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    /// One `Hit` per ray.
    FullHit,
    /// One `u32` instance id per ray.
    InstanceIdOnly,
}

impl OutputType {
    pub fn stride(&self) -> vk::DeviceSize {
        match self {
            OutputType::FullHit => std::mem::size_of::<crate::render::shader_types::Hit>() as u64,
            OutputType::InstanceIdOnly => std::mem::size_of::<u32>() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceFlags(u32);

impl TraceFlags {
    pub const NONE: TraceFlags = TraceFlags(0);
    /// Write the hit distance back into the ray's max_t.
    pub const UPDATE_MAX_T: TraceFlags = TraceFlags(1);

    pub fn contains(&self, other: TraceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Row-major 3x4 identity.
pub const IDENTITY_TRANSFORM: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0,
];

#[derive(Debug, Clone)]
pub struct Instance<S> {
    pub instance_id: u32,
    /// Row-major 3x4 object to world transform.
    pub transform: [f32; 12],
    pub structure: S,
}

pub enum BuildInput<'a, D: ComputeDevice, S> {
    CpuMesh {
        positions: &'a [[f32; 3]],
        indices: &'a [u32],
    },
    /// Vertex positions are the first three floats of every `vertex_stride` bytes.
    GpuMesh {
        vertices: &'a D::Buffer,
        vertex_stride: vk::DeviceSize,
        vertex_count: u32,
        indices: &'a D::Buffer,
        index_count: u32,
    },
    Instances(&'a [Instance<S>]),
}

impl<'a, D: ComputeDevice, S> BuildInput<'a, D, S> {
    pub fn name(&self) -> &'static str {
        match self {
            BuildInput::CpuMesh { .. } => "cpu mesh",
            BuildInput::GpuMesh { .. } => "gpu mesh",
            BuildInput::Instances(_) => "instances",
        }
    }

    pub fn primitive_count(&self) -> u32 {
        match self {
            BuildInput::CpuMesh { indices, .. } => (indices.len() / 3) as u32,
            BuildInput::GpuMesh { index_count, .. } => index_count / 3,
            BuildInput::Instances(instances) => instances.len() as u32,
        }
    }

    pub fn matches(&self, kind: StructureKind) -> bool {
        matches!(
            (self, kind),
            (BuildInput::Instances(_), StructureKind::TopLevel)
                | (
                    BuildInput::CpuMesh { .. } | BuildInput::GpuMesh { .. },
                    StructureKind::BottomLevel
                )
        )
    }
}

pub struct BuildInfo<'a, D: ComputeDevice, S> {
    pub operation: BuildOperation,
    pub input: BuildInput<'a, D, S>,
}

pub struct TraceDesc<'a, D: ComputeDevice> {
    pub query: QueryType,
    pub output: OutputType,
    pub flags: TraceFlags,
    /// For indirect traces this is the capacity of the ray buffer.
    pub ray_count: u32,
    pub rays: &'a D::Buffer,
    pub hits: &'a D::Buffer,
    pub scratch: &'a D::Buffer,
}

/// The ray-intersection engine. Its traversal is opaque, only the memory and
/// recording protocol is visible here.
pub trait IntersectionEngine<D: ComputeDevice>: Send + Sync + 'static {
    type Structure: Clone;

    fn create_structure(
        &self,
        kind: StructureKind,
        max_primitives: u32,
    ) -> Result<Self::Structure, EngineError>;
    fn destroy_structure(&self, structure: Self::Structure);

    fn storage_requirements(&self, structure: &Self::Structure) -> MemoryRequirements;
    fn build_scratch_requirements(&self, structure: &Self::Structure) -> MemoryRequirements;
    fn trace_scratch_requirements(
        &self,
        structure: &Self::Structure,
        ray_count: u32,
    ) -> MemoryRequirements;

    fn bind_storage(
        &self,
        structure: &Self::Structure,
        memory: &D::Memory,
        offset: vk::DeviceSize,
    ) -> Result<(), EngineError>;
    fn bind_scratch(
        &self,
        structure: &Self::Structure,
        memory: &D::Memory,
        offset: vk::DeviceSize,
    ) -> Result<(), EngineError>;
    /// The allocation the structure's storage is bound to, if any.
    fn storage_memory(&self, structure: &Self::Structure) -> Option<D::Memory>;

    fn record_build(
        &self,
        structure: &Self::Structure,
        info: &BuildInfo<'_, D, Self::Structure>,
        commands: &mut D::CommandSequence,
    ) -> Result<(), EngineError>;
    fn record_trace(
        &self,
        structure: &Self::Structure,
        desc: &TraceDesc<'_, D>,
        commands: &mut D::CommandSequence,
    ) -> Result<(), EngineError>;
    /// The ray count is read from the first `u32` of `count` when the trace executes.
    fn record_trace_indirect(
        &self,
        structure: &Self::Structure,
        desc: &TraceDesc<'_, D>,
        count: &D::Buffer,
        commands: &mut D::CommandSequence,
    ) -> Result<(), EngineError>;
}

/// The structures of one scene and the memory they are bound to.
///
/// Dropping it destroys the bottom-level structures, then the top-level
/// structure, then frees the storage and scratch allocations.
pub struct SceneStructures<D: ComputeDevice, E: IntersectionEngine<D>> {
    bottom_level: Vec<E::Structure>,
    top_level: Option<E::Structure>,
    storage: Option<DeviceMemoryArena<D>>,
    scratch: Option<DeviceMemoryArena<D>>,
    engine: Arc<E>,
}

impl<D: ComputeDevice, E: IntersectionEngine<D>> SceneStructures<D, E> {
    fn empty(engine: Arc<E>) -> Self {
        Self {
            bottom_level: Vec::new(),
            top_level: None,
            storage: None,
            scratch: None,
            engine,
        }
    }

    pub fn bottom_level(&self) -> &[E::Structure] {
        &self.bottom_level
    }

    pub fn top_level(&self) -> Result<&E::Structure> {
        self.top_level.as_ref().ok_or(Error::EmptyScene)
    }

    pub fn storage_size(&self) -> vk::DeviceSize {
        self.storage.as_ref().map_or(0, |arena| arena.size())
    }

    pub fn scratch_size(&self) -> vk::DeviceSize {
        self.scratch.as_ref().map_or(0, |arena| arena.size())
    }
}

impl<D: ComputeDevice, E: IntersectionEngine<D>> Drop for SceneStructures<D, E> {
    fn drop(&mut self) {
        for structure in self.bottom_level.drain(..) {
            self.engine.destroy_structure(structure);
        }
        if let Some(structure) = self.top_level.take() {
            self.engine.destroy_structure(structure);
        }
        self.storage.take();
        self.scratch.take();
    }
}

pub struct AccelerationStructureBuilder<D: ComputeDevice, E: IntersectionEngine<D>> {
    device: Arc<D>,
    engine: Arc<E>,
}

impl<D: ComputeDevice, E: IntersectionEngine<D>> AccelerationStructureBuilder<D, E> {
    pub fn new(device: Arc<D>, engine: Arc<E>) -> Self {
        Self { device, engine }
    }

    /// Builds one instance per mesh with an identity transform.
    pub fn build(&self, meshes: &[Mesh]) -> Result<SceneStructures<D, E>> {
        let transforms = vec![IDENTITY_TRANSFORM; meshes.len()];
        self.build_instanced(meshes, &transforms)
    }

    /// Any failure discards every structure created so far.
    pub fn build_instanced(
        &self,
        meshes: &[Mesh],
        transforms: &[[f32; 12]],
    ) -> Result<SceneStructures<D, E>> {
        if meshes.is_empty() || meshes.iter().any(|mesh| mesh.primitive_count() == 0) {
            return Err(Error::EmptyScene);
        }
        if transforms.len() != meshes.len() {
            return Err(Error::BufferSizeMismatch {
                name: "instance transforms".into(),
                expected: meshes.len() as u64,
                actual: transforms.len() as u64,
            });
        }

        let mut structures = SceneStructures::empty(self.engine.clone());

        for mesh in meshes {
            let structure = self
                .engine
                .create_structure(StructureKind::BottomLevel, mesh.primitive_count())
                .map_err(Error::accel("creation"))?;
            structures.bottom_level.push(structure);
        }
        let top_level = self
            .engine
            .create_structure(StructureKind::TopLevel, meshes.len() as u32)
            .map_err(Error::accel("creation"))?;
        structures.top_level = Some(top_level.clone());

        let all: Vec<&E::Structure> = structures
            .bottom_level
            .iter()
            .chain(std::iter::once(&top_level))
            .collect();

        let mut storage_requests = Vec::with_capacity(all.len());
        let mut scratch = MemoryRequirements {
            size: 0,
            alignment: 1,
            memory_type_bits: u32::MAX,
        };
        for (i, structure) in all.iter().enumerate() {
            let storage = self.engine.storage_requirements(structure);
            let build_scratch = self.engine.build_scratch_requirements(structure);
            log::info!(
                "Structure {}: storage {} bytes, build scratch {} bytes",
                i,
                storage.size,
                build_scratch.size
            );
            storage_requests.push(ArenaRequest::region(format!("structure {}", i), storage));

            scratch.size = scratch.size.max(build_scratch.size);
            scratch.alignment = scratch.alignment.max(build_scratch.alignment);
            scratch.memory_type_bits &= build_scratch.memory_type_bits;
        }

        let storage = DeviceMemoryArena::allocate(
            self.device.clone(),
            "acceleration structures",
            storage_requests,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let scratch = DeviceMemoryArena::allocate(
            self.device.clone(),
            "build scratch",
            vec![ArenaRequest::region("scratch", scratch)],
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        log::info!(
            "Acceleration structure storage {} bytes, scratch {} bytes",
            storage.size(),
            scratch.size()
        );

        let storage_memory = storage.memory().ok_or(Error::EmptyScene)?;
        let scratch_memory = scratch.memory().ok_or(Error::EmptyScene)?;
        for (structure, entry) in all.iter().zip(storage.entries()) {
            self.engine
                .bind_storage(structure, storage_memory, entry.placement.offset)
                .map_err(Error::accel("storage binding"))?;
            self.engine
                .bind_scratch(structure, scratch_memory, 0)
                .map_err(Error::accel("scratch binding"))?;
        }
        structures.storage = Some(storage);
        structures.scratch = Some(scratch);

        for (structure, mesh) in structures.bottom_level.iter().zip(meshes) {
            let positions = mesh.positions();
            let info = BuildInfo {
                operation: BuildOperation::Build,
                input: BuildInput::CpuMesh {
                    positions: &positions,
                    indices: &mesh.indices,
                },
            };
            self.build_one(structure, &info)?;
        }

        let instances: Vec<Instance<E::Structure>> = structures
            .bottom_level
            .iter()
            .zip(transforms)
            .enumerate()
            .map(|(i, (structure, transform))| Instance {
                instance_id: i as u32,
                transform: *transform,
                structure: structure.clone(),
            })
            .collect();
        self.check_same_allocation(&top_level, &instances)?;
        let info = BuildInfo {
            operation: BuildOperation::Build,
            input: BuildInput::Instances(&instances),
        };
        self.build_one(&top_level, &info)?;

        Ok(structures)
    }

    fn check_same_allocation(
        &self,
        top_level: &E::Structure,
        instances: &[Instance<E::Structure>],
    ) -> Result<()> {
        let top_memory = self.engine.storage_memory(top_level);
        for instance in instances {
            let memory = self.engine.storage_memory(&instance.structure);
            if memory.is_none() {
                return Err(Error::accel("top-level build")(
                    EngineError::StructureNotBound("bottom-level storage"),
                ));
            }
            if memory != top_memory {
                return Err(Error::accel("top-level build")(
                    EngineError::MixedAllocations,
                ));
            }
        }
        Ok(())
    }

    /// Scratch is shared, so every build completes before the next is recorded.
    fn build_one(
        &self,
        structure: &E::Structure,
        info: &BuildInfo<'_, D, E::Structure>,
    ) -> Result<()> {
        let mut commands = self
            .device
            .begin_commands()
            .map_err(Error::load("build commands"))?;
        let result = self
            .engine
            .record_build(structure, info, &mut commands)
            .map_err(Error::accel("build"))
            .and_then(|_| {
                self.device
                    .end_commands(&mut commands)
                    .map_err(Error::load("build commands"))
            })
            .and_then(|_| {
                self.device
                    .submit_and_wait(&commands)
                    .map_err(Error::load("build submission"))
            });
        self.device.free_commands(commands);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostDevice, HostDeviceConfig, HostIntersector};
    use crate::scene::Scene;

    fn builder() -> (
        Arc<HostDevice>,
        Arc<HostIntersector>,
        AccelerationStructureBuilder<HostDevice, HostIntersector>,
    ) {
        let device = Arc::new(HostDevice::new(HostDeviceConfig::default()));
        let engine = Arc::new(HostIntersector::default());
        let builder = AccelerationStructureBuilder::new(device.clone(), engine.clone());
        (device, engine, builder)
    }

    #[test]
    fn storage_is_summed_and_scratch_is_shared() {
        let (device, engine, builder) = builder();
        let scene = Scene::ground_with_boxes(3);
        let structures = builder.build(&scene.meshes).unwrap();

        let mut storage_sum = 0;
        let mut scratch_max = 0;
        let all = structures
            .bottom_level()
            .iter()
            .chain(std::iter::once(structures.top_level().unwrap()));
        for structure in all {
            let storage =
                IntersectionEngine::<HostDevice>::storage_requirements(&*engine, structure);
            let scratch =
                IntersectionEngine::<HostDevice>::build_scratch_requirements(&*engine, structure);
            storage_sum += storage.size;
            scratch_max = scratch_max.max(scratch.size);
        }

        assert!(structures.storage_size() >= storage_sum);
        assert_eq!(structures.scratch_size(), scratch_max);
        assert_eq!(device.live_allocations(), 2);

        drop(structures);
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(engine.live_structures(), 0);
    }

    #[test]
    fn top_level_build_before_binding_fails() {
        let (device, engine, _) = builder();
        let blas = engine
            .create_structure(StructureKind::BottomLevel, 1)
            .unwrap();
        let tlas = engine.create_structure(StructureKind::TopLevel, 1).unwrap();

        let arena = DeviceMemoryArena::allocate(
            device.clone(),
            "tlas only",
            vec![
                ArenaRequest::region(
                    "tlas",
                    IntersectionEngine::<HostDevice>::storage_requirements(&*engine, &tlas),
                ),
                ArenaRequest::region(
                    "scratch",
                    IntersectionEngine::<HostDevice>::build_scratch_requirements(&*engine, &tlas),
                ),
            ],
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        let memory = arena.memory().unwrap();
        engine.bind_storage(&tlas, memory, 0).unwrap();
        engine
            .bind_scratch(&tlas, memory, arena.entry("scratch").unwrap().placement.offset)
            .unwrap();

        let instances = [Instance {
            instance_id: 0,
            transform: IDENTITY_TRANSFORM,
            structure: blas.clone(),
        }];
        let info: BuildInfo<'_, HostDevice, _> = BuildInfo {
            operation: BuildOperation::Build,
            input: BuildInput::Instances(&instances),
        };

        for _ in 0..2 {
            let mut commands = device.begin_commands().unwrap();
            let result = engine.record_build(&tlas, &info, &mut commands);
            assert!(matches!(result, Err(EngineError::StructureNotBound(_))));
            assert!(commands.labels().is_empty());
        }

        engine.destroy_structure(blas);
        engine.destroy_structure(tlas);
    }

    #[test]
    fn update_is_not_implemented() {
        let (device, engine, builder) = builder();
        let scene = Scene::single_triangle();
        let structures = builder.build(&scene.meshes).unwrap();

        let positions = scene.meshes[0].positions();
        let info: BuildInfo<'_, HostDevice, _> = BuildInfo {
            operation: BuildOperation::Update,
            input: BuildInput::CpuMesh {
                positions: &positions,
                indices: &scene.meshes[0].indices,
            },
        };
        let mut commands = device.begin_commands().unwrap();
        let result = engine.record_build(&structures.bottom_level()[0], &info, &mut commands);
        assert!(matches!(result, Err(EngineError::NotImplemented(_))));
    }

    #[test]
    fn empty_scene_is_rejected() {
        let (_, _, builder) = builder();
        assert!(matches!(builder.build(&[]), Err(Error::EmptyScene)));
    }

    #[test]
    fn failed_load_keeps_nothing_alive() {
        let device = Arc::new(HostDevice::new(HostDeviceConfig {
            memory_types: vec![vk::MemoryPropertyFlags::DEVICE_LOCAL],
            ..HostDeviceConfig::default()
        }));
        let engine = Arc::new(HostIntersector::default());
        let builder = AccelerationStructureBuilder::new(device.clone(), engine.clone());

        let result = builder.build(&Scene::single_triangle().meshes);
        assert!(matches!(result, Err(Error::AllocationFailed { .. })));
        assert_eq!(engine.live_structures(), 0);
        assert_eq!(device.live_allocations(), 0);
    }
}
