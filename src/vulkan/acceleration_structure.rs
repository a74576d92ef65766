//! Hardware acceleration structures, traced with ray queries from a compute shader.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::{
    descriptor_set::{DescriptorSet, WriteDescriptorSet},
    device::{VulkanBuffer, VulkanCommands, VulkanDevice, VulkanMemory},
    sync_commands::{CmdPipelineBarrier, MemoryBarrier},
};
use crate::accel::{
    BuildInfo, BuildInput, BuildOperation, EngineError, IntersectionEngine, OutputType, QueryType,
    StructureKind, TraceDesc,
};
use crate::device::{BindingKind, ComputeDevice, DeviceError, MemoryRequirements};
use crate::render::shader_types::Ray;

const TRACE_SHADER: &str = "trace_rays";
const TRACE_GROUP_SIZE: u32 = 64;
/// Traces recorded at once across all live structures.
const MAX_TRACE_SETS: u32 = 64;
/// Acceleration structures must start at a multiple of 256 bytes.
const STORAGE_ALIGNMENT: vk::DeviceSize = 256;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct TraceConstants {
    capacity: u32,
    query: u32,
    output: u32,
    flags: u32,
    indirect: u32,
}

struct BoundStorage {
    memory: VulkanMemory,
    buffer: VulkanBuffer,
    inner: vk::AccelerationStructureKHR,
    device_address: vk::DeviceAddress,
}

struct BoundScratch {
    buffer: VulkanBuffer,
    device_address: vk::DeviceAddress,
}

/// A host-visible copy of build input, alive until the structure is destroyed.
struct InputBuffer {
    buffer: VulkanBuffer,
    memory: VulkanMemory,
    device_address: vk::DeviceAddress,
}

struct StructureState {
    kind: StructureKind,
    max_primitives: u32,
    storage_requirements: MemoryRequirements,
    scratch_requirements: MemoryRequirements,
    storage: Mutex<Option<BoundStorage>>,
    scratch: Mutex<Option<BoundScratch>>,
    inputs: Mutex<Vec<InputBuffer>>,
    trace_sets: Mutex<Vec<DescriptorSet>>,
}

#[derive(Clone)]
pub struct VulkanStructure(Arc<StructureState>);

impl VulkanStructure {
    pub fn kind(&self) -> StructureKind {
        self.0.kind
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, DeviceError> {
    mutex
        .lock()
        .map_err(|_| DeviceError::DeviceLost("structure lock poisoned".into()))
}

// Rust will drop these fields in the order they are declared
pub struct VulkanIntersector {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: Mutex<vk::DescriptorPool>,
    live_structures: AtomicUsize,
    device: Arc<VulkanDevice>,
}

impl VulkanIntersector {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self, DeviceError> {
        let storage = |binding: u32| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .build()
        };
        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .build(),
            storage(1),
            storage(2),
            storage(3),
            storage(4),
        ];
        let push_constants = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: std::mem::size_of::<TraceConstants>() as u32,
        };
        let (pipeline, layout, set_layout) = device.create_compute_pipeline(
            TRACE_SHADER,
            &bindings,
            std::slice::from_ref(&push_constants),
        )?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: MAX_TRACE_SETS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: MAX_TRACE_SETS * 4,
            },
        ];
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(MAX_TRACE_SETS)
            .pool_sizes(&pool_sizes);
        let context_device = &device.context().device;
        let descriptor_pool =
            match unsafe { context_device.create_descriptor_pool(&create_info, None) } {
                Ok(pool) => pool,
                Err(err) => {
                    unsafe {
                        context_device.destroy_pipeline(pipeline, None);
                        context_device.destroy_pipeline_layout(layout, None);
                        context_device.destroy_descriptor_set_layout(set_layout, None);
                    }
                    return Err(err.into());
                }
            };

        Ok(Self {
            pipeline,
            layout,
            set_layout,
            descriptor_pool: Mutex::new(descriptor_pool),
            live_structures: AtomicUsize::new(0),
            device,
        })
    }

    pub fn live_structures(&self) -> usize {
        self.live_structures.load(Ordering::SeqCst)
    }

    fn acceleration_structure_loader(&self) -> &ash::extensions::khr::AccelerationStructure {
        &self.device.context().acceleration_structure
    }

    /// Sizes for a build of `max_primitives`, queried with an empty geometry of the right type.
    fn build_sizes(
        &self,
        kind: StructureKind,
        max_primitives: u32,
    ) -> vk::AccelerationStructureBuildSizesInfoKHR {
        let geometry = match kind {
            StructureKind::BottomLevel => triangle_geometry(
                vk::DeviceOrHostAddressConstKHR::default(),
                std::mem::size_of::<[f32; 3]>() as u64,
                max_primitives.saturating_mul(3),
                vk::DeviceOrHostAddressConstKHR::default(),
            ),
            StructureKind::TopLevel => {
                instance_geometry(vk::DeviceOrHostAddressConstKHR::default())
            }
        };
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(structure_type(kind))
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));

        unsafe {
            self.acceleration_structure_loader()
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[max_primitives],
                )
        }
    }

    /// Memory requirements of a buffer with `usage`, from a throwaway buffer.
    fn buffer_requirements(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        min_alignment: vk::DeviceSize,
    ) -> Result<MemoryRequirements, DeviceError> {
        let sizing_buffer = self.device.create_buffer(size, usage)?;
        let mut requirements = self.device.buffer_requirements(&sizing_buffer);
        self.device.destroy_buffer(sizing_buffer);
        requirements.size = requirements.size.max(size);
        requirements.alignment = requirements.alignment.max(min_alignment);
        Ok(requirements)
    }

    fn check_binding(
        requirements: MemoryRequirements,
        memory: &VulkanMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), EngineError> {
        if offset % requirements.alignment != 0 || offset + requirements.size > memory.size {
            return Err(DeviceError::OutOfRange {
                offset,
                len: requirements.size,
                size: memory.size,
            }
            .into());
        }
        Ok(())
    }

    /// Copies `bytes` into a new host-visible buffer usable as build input.
    fn upload(&self, bytes: &[u8]) -> Result<InputBuffer, DeviceError> {
        let device = &*self.device;
        let buffer = device.create_buffer(
            bytes.len() as u64,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;

        let memory = (|| -> Result<VulkanMemory, DeviceError> {
            let requirements = device.buffer_requirements(&buffer);
            let index = device
                .memory_type_index(
                    &requirements,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )
                .ok_or(DeviceError::NotHostVisible)?;
            let memory = device.allocate_memory(requirements.size, index)?;
            let written = device
                .bind_buffer_memory(&buffer, &memory, 0)
                .and_then(|_| device.write_memory(&memory, 0, bytes));
            match written {
                Ok(()) => Ok(memory),
                Err(err) => {
                    device.free_memory(memory);
                    Err(err)
                }
            }
        })();

        match memory {
            Ok(memory) => Ok(InputBuffer {
                device_address: device.buffer_device_address(buffer.inner),
                buffer,
                memory,
            }),
            Err(err) => {
                device.destroy_buffer(buffer);
                Err(err)
            }
        }
    }

    fn release_input(&self, input: InputBuffer) {
        self.device.destroy_buffer(input.buffer);
        self.device.free_memory(input.memory);
    }

    /// Builds the geometry description for `input`, uploading host data first.
    fn geometry(
        &self,
        structure: &VulkanStructure,
        input: &BuildInput<'_, VulkanDevice, VulkanStructure>,
    ) -> Result<vk::AccelerationStructureGeometryKHR, EngineError> {
        let address = |address| vk::DeviceOrHostAddressConstKHR {
            device_address: address,
        };

        let geometry = match input {
            BuildInput::CpuMesh { positions, indices } => {
                let vertices = self.upload(bytemuck::cast_slice::<[f32; 3], u8>(positions))?;
                let index_buffer = match self.upload(bytemuck::cast_slice::<u32, u8>(indices)) {
                    Ok(buffer) => buffer,
                    Err(err) => {
                        self.release_input(vertices);
                        return Err(err.into());
                    }
                };
                let geometry = triangle_geometry(
                    address(vertices.device_address),
                    std::mem::size_of::<[f32; 3]>() as u64,
                    (positions.len() as u32).saturating_sub(1),
                    address(index_buffer.device_address),
                );
                let mut inputs = lock(&structure.0.inputs)?;
                inputs.push(vertices);
                inputs.push(index_buffer);
                geometry
            }
            BuildInput::GpuMesh {
                vertices,
                vertex_stride,
                vertex_count,
                indices,
                ..
            } => triangle_geometry(
                address(self.device.buffer_device_address(vertices.inner)),
                *vertex_stride,
                vertex_count.saturating_sub(1),
                address(self.device.buffer_device_address(indices.inner)),
            ),
            BuildInput::Instances(instances) => {
                let top_memory = self.storage_memory(structure);
                let mut records = Vec::with_capacity(instances.len());
                for instance in instances.iter() {
                    let bound = lock(&instance.structure.0.storage)?;
                    let Some(storage) = bound.as_ref() else {
                        return Err(EngineError::StructureNotBound("bottom-level storage"));
                    };
                    if Some(&storage.memory) != top_memory.as_ref() {
                        return Err(EngineError::MixedAllocations);
                    }
                    records.push(vk::AccelerationStructureInstanceKHR {
                        transform: vk::TransformMatrixKHR {
                            matrix: instance.transform,
                        },
                        instance_custom_index_and_mask: vk::Packed24_8::new(
                            instance.instance_id,
                            0xFF,
                        ),
                        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                            0,
                            CULL_DISABLE,
                        ),
                        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                            device_handle: storage.device_address,
                        },
                    });
                }

                // SAFETY: the instance record is a plain repr(C) struct of 64 bytes.
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        records.as_ptr().cast::<u8>(),
                        std::mem::size_of_val(records.as_slice()),
                    )
                };
                let buffer = self.upload(bytes)?;
                let geometry = instance_geometry(address(buffer.device_address));
                lock(&structure.0.inputs)?.push(buffer);
                geometry
            }
        };
        Ok(geometry)
    }

    fn check_trace(
        &self,
        structure: &VulkanStructure,
        desc: &TraceDesc<'_, VulkanDevice>,
    ) -> Result<vk::AccelerationStructureKHR, EngineError> {
        if structure.0.kind != StructureKind::TopLevel {
            return Err(EngineError::WrongInput {
                kind: structure.0.kind,
                input: "rays",
            });
        }
        let inner = lock(&structure.0.storage)?
            .as_ref()
            .map(|storage| storage.inner)
            .ok_or(EngineError::StructureNotBound("top-level storage"))?;

        let rays = desc.ray_count as u64 * std::mem::size_of::<Ray>() as u64;
        let hits = desc.ray_count as u64 * desc.output.stride();
        let scratch = self.trace_scratch_requirements(structure, desc.ray_count).size;
        for (name, required, actual) in [
            ("ray", rays, desc.rays.size),
            ("hit", hits, desc.hits.size),
            ("trace scratch", scratch, desc.scratch.size),
        ] {
            if actual < required {
                return Err(EngineError::BufferTooSmall {
                    name,
                    required,
                    actual,
                });
            }
        }
        Ok(inner)
    }

    fn trace_operation(
        &self,
        structure: &VulkanStructure,
        desc: &TraceDesc<'_, VulkanDevice>,
        count: Option<&VulkanBuffer>,
        commands: &mut VulkanCommands,
    ) -> Result<(), EngineError> {
        let acceleration_structure = self.check_trace(structure, desc)?;

        let writes = vec![
            WriteDescriptorSet::acceleration_structure(0, acceleration_structure),
            WriteDescriptorSet::buffer(1, BindingKind::Storage, desc.rays.inner),
            WriteDescriptorSet::buffer(2, BindingKind::Storage, desc.hits.inner),
            // Direct traces never read the count, any buffer fills the slot.
            WriteDescriptorSet::buffer(3, BindingKind::Storage, count.unwrap_or(desc.rays).inner),
            WriteDescriptorSet::buffer(4, BindingKind::Storage, desc.scratch.inner),
        ];
        let descriptor_set = {
            let pool = lock(&self.descriptor_pool)?;
            DescriptorSet::new(self.device.context(), *pool, self.set_layout, writes)?
        };
        lock(&structure.0.trace_sets)?.push(descriptor_set);

        let constants = TraceConstants {
            capacity: desc.ray_count,
            query: match desc.query {
                QueryType::Intersect => 0,
                QueryType::Occluded => 1,
            },
            output: match desc.output {
                OutputType::FullHit => 0,
                OutputType::InstanceIdOnly => 1,
            },
            flags: desc.flags.bits(),
            indirect: count.is_some() as u32,
        };

        let device = &self.device.context().device;
        unsafe {
            device.cmd_bind_pipeline(commands.inner, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                commands.inner,
                vk::PipelineBindPoint::COMPUTE,
                self.layout,
                0,
                std::slice::from_ref(&descriptor_set.inner),
                &[],
            );
            device.cmd_push_constants(
                commands.inner,
                self.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&constants),
            );
            device.cmd_dispatch(
                commands.inner,
                desc.ray_count.div_ceil(TRACE_GROUP_SIZE),
                1,
                1,
            );
        }
        Ok(())
    }
}

impl Drop for VulkanIntersector {
    fn drop(&mut self) {
        let device = &self.device.context().device;
        unsafe {
            if let Ok(pool) = self.descriptor_pool.get_mut() {
                device.destroy_descriptor_pool(*pool, None);
            }
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

fn structure_type(kind: StructureKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        StructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        StructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn triangle_geometry(
    vertices: vk::DeviceOrHostAddressConstKHR,
    vertex_stride: vk::DeviceSize,
    max_vertex: u32,
    indices: vk::DeviceOrHostAddressConstKHR,
) -> vk::AccelerationStructureGeometryKHR {
    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vertices)
        .vertex_stride(vertex_stride)
        .max_vertex(max_vertex)
        .index_type(vk::IndexType::UINT32)
        .index_data(indices)
        .build();

    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .build()
}

const CULL_DISABLE: u8 = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8;

fn instance_geometry(
    instances: vk::DeviceOrHostAddressConstKHR,
) -> vk::AccelerationStructureGeometryKHR {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
        .array_of_pointers(false)
        .data(instances)
        .build();

    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
        .build()
}

impl IntersectionEngine<VulkanDevice> for VulkanIntersector {
    type Structure = VulkanStructure;

    fn create_structure(
        &self,
        kind: StructureKind,
        max_primitives: u32,
    ) -> Result<VulkanStructure, EngineError> {
        let sizes = self.build_sizes(kind, max_primitives);
        let storage_requirements = self.buffer_requirements(
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            STORAGE_ALIGNMENT,
        )?;
        let scratch_alignment = self
            .device
            .context()
            .min_acceleration_structure_scratch_offset_alignment as u64;
        let scratch_requirements = self.buffer_requirements(
            sizes.build_scratch_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            scratch_alignment,
        )?;
        log::debug!(
            "{:?} structure for {} primitives: {} storage bytes, {} scratch bytes",
            kind,
            max_primitives,
            sizes.acceleration_structure_size,
            sizes.build_scratch_size
        );

        self.live_structures.fetch_add(1, Ordering::SeqCst);
        Ok(VulkanStructure(Arc::new(StructureState {
            kind,
            max_primitives,
            storage_requirements,
            scratch_requirements,
            storage: Mutex::new(None),
            scratch: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
            trace_sets: Mutex::new(Vec::new()),
        })))
    }

    fn destroy_structure(&self, structure: VulkanStructure) {
        let state = &structure.0;
        let device = &self.device.context().device;

        if let (Ok(mut sets), Ok(pool)) = (state.trace_sets.lock(), self.descriptor_pool.lock()) {
            let sets: Vec<vk::DescriptorSet> = sets.drain(..).map(|set| set.inner).collect();
            if !sets.is_empty() {
                if let Err(err) = unsafe { device.free_descriptor_sets(*pool, &sets) } {
                    log::error!("Could not free trace descriptor sets: {}", err);
                }
            }
        }
        if let Some(storage) = state.storage.lock().ok().and_then(|mut bound| bound.take()) {
            unsafe {
                self.acceleration_structure_loader()
                    .destroy_acceleration_structure(storage.inner, None)
            };
            self.device.destroy_buffer(storage.buffer);
        }
        if let Some(scratch) = state.scratch.lock().ok().and_then(|mut bound| bound.take()) {
            self.device.destroy_buffer(scratch.buffer);
        }
        if let Ok(mut inputs) = state.inputs.lock() {
            for input in inputs.drain(..) {
                self.release_input(input);
            }
        }
        self.live_structures.fetch_sub(1, Ordering::SeqCst);
    }

    fn storage_requirements(&self, structure: &VulkanStructure) -> MemoryRequirements {
        structure.0.storage_requirements
    }

    fn build_scratch_requirements(&self, structure: &VulkanStructure) -> MemoryRequirements {
        structure.0.scratch_requirements
    }

    fn trace_scratch_requirements(
        &self,
        _structure: &VulkanStructure,
        ray_count: u32,
    ) -> MemoryRequirements {
        MemoryRequirements::new((ray_count as u64 * 8).max(16), 16)
    }

    fn bind_storage(
        &self,
        structure: &VulkanStructure,
        memory: &VulkanMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), EngineError> {
        let requirements = structure.0.storage_requirements;
        Self::check_binding(requirements, memory, offset)?;

        let buffer = self.device.create_buffer(
            requirements.size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;
        if let Err(err) = self.device.bind_buffer_memory(&buffer, memory, offset) {
            self.device.destroy_buffer(buffer);
            return Err(err.into());
        }

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.inner)
            .size(requirements.size)
            .ty(structure_type(structure.0.kind));
        let inner = match unsafe {
            self.acceleration_structure_loader()
                .create_acceleration_structure(&create_info, None)
        } {
            Ok(inner) => inner,
            Err(err) => {
                self.device.destroy_buffer(buffer);
                return Err(DeviceError::from(err).into());
            }
        };

        let device_address = {
            let acceleration_structure_device_address_info =
                vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                    .acceleration_structure(inner);

            unsafe {
                self.acceleration_structure_loader()
                    .get_acceleration_structure_device_address(
                        &acceleration_structure_device_address_info,
                    )
            }
        };

        let previous = lock(&structure.0.storage)?.replace(BoundStorage {
            memory: memory.clone(),
            buffer,
            inner,
            device_address,
        });
        if let Some(previous) = previous {
            unsafe {
                self.acceleration_structure_loader()
                    .destroy_acceleration_structure(previous.inner, None)
            };
            self.device.destroy_buffer(previous.buffer);
        }
        Ok(())
    }

    fn bind_scratch(
        &self,
        structure: &VulkanStructure,
        memory: &VulkanMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), EngineError> {
        let requirements = structure.0.scratch_requirements;
        Self::check_binding(requirements, memory, offset)?;

        let buffer = self.device.create_buffer(
            requirements.size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;
        if let Err(err) = self.device.bind_buffer_memory(&buffer, memory, offset) {
            self.device.destroy_buffer(buffer);
            return Err(err.into());
        }
        let device_address = self.device.buffer_device_address(buffer.inner);

        let previous = lock(&structure.0.scratch)?.replace(BoundScratch {
            buffer,
            device_address,
        });
        if let Some(previous) = previous {
            self.device.destroy_buffer(previous.buffer);
        }
        Ok(())
    }

    fn storage_memory(&self, structure: &VulkanStructure) -> Option<VulkanMemory> {
        let bound = structure.0.storage.lock().ok()?;
        bound.as_ref().map(|storage| storage.memory.clone())
    }

    fn record_build(
        &self,
        structure: &VulkanStructure,
        info: &BuildInfo<'_, VulkanDevice, VulkanStructure>,
        commands: &mut VulkanCommands,
    ) -> Result<(), EngineError> {
        let state = &structure.0;
        if info.operation == BuildOperation::Update {
            return Err(EngineError::NotImplemented("structure update"));
        }
        let destination = lock(&state.storage)?
            .as_ref()
            .map(|storage| storage.inner)
            .ok_or(EngineError::StructureNotBound("storage"))?;
        let scratch_address = lock(&state.scratch)?
            .as_ref()
            .map(|scratch| scratch.device_address)
            .ok_or(EngineError::StructureNotBound("scratch"))?;
        if !info.input.matches(state.kind) {
            return Err(EngineError::WrongInput {
                kind: state.kind,
                input: info.input.name(),
            });
        }
        let primitives = info.input.primitive_count();
        if primitives > state.max_primitives {
            return Err(EngineError::TooManyPrimitives {
                max: state.max_primitives,
                actual: primitives,
            });
        }

        let geometry = self.geometry(structure, &info.input)?;
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(structure_type(state.kind))
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(destination)
            .geometries(std::slice::from_ref(&geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            })
            .build();
        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(primitives)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
            .build();

        unsafe {
            self.acceleration_structure_loader()
                .cmd_build_acceleration_structures(
                    commands.inner,
                    std::slice::from_ref(&build_info),
                    &[std::slice::from_ref(&build_range)],
                );
        }
        CmdPipelineBarrier {
            memory_barriers: vec![MemoryBarrier::acceleration_structure_build()],
            buffer_memory_barriers: vec![],
        }
        .execute(commands.inner, self.device.context());

        log::debug!("Recorded {:?} build of {} primitives", state.kind, primitives);
        Ok(())
    }

    fn record_trace(
        &self,
        structure: &VulkanStructure,
        desc: &TraceDesc<'_, VulkanDevice>,
        commands: &mut VulkanCommands,
    ) -> Result<(), EngineError> {
        self.trace_operation(structure, desc, None, commands)
    }

    fn record_trace_indirect(
        &self,
        structure: &VulkanStructure,
        desc: &TraceDesc<'_, VulkanDevice>,
        count: &VulkanBuffer,
        commands: &mut VulkanCommands,
    ) -> Result<(), EngineError> {
        self.trace_operation(structure, desc, Some(count), commands)
    }
}
