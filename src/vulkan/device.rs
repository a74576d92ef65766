use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ash::vk;

use super::{
    command_pool::CommandPool,
    context::Context,
    descriptor_set::{DescriptorSet, WriteDescriptorSet},
    shader_module::ShaderModule,
    sync_commands::{BufferMemoryBarrier, CmdPipelineBarrier},
};
use crate::device::{
    find_memorytype_index, BarrierScope, BindingDescriptor, ComputeDevice,
    DeviceError, MemoryRequirements,
};

/// Descriptors a binding pool reserves per set.
const POOL_UNIFORMS_PER_SET: u32 = 2;
const POOL_STORAGE_PER_SET: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MappedPtr(NonNull<u8>);

// The mapping lives as long as the allocation and is only written through
// `write_memory`, whose callers own the ranges they touch.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulkanMemory {
    pub inner: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    mapped: Option<MappedPtr>,
}

#[derive(Debug, Clone)]
pub struct VulkanBuffer {
    pub inner: vk::Buffer,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

pub struct VulkanPipeline {
    pub inner: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
    pub bindings: Vec<BindingDescriptor>,
}

pub struct VulkanBindingPool {
    pub inner: vk::DescriptorPool,
    max_sets: u32,
}

pub struct VulkanCommands {
    pub inner: vk::CommandBuffer,
    ended: bool,
}

/// The compute queue of a real GPU.
// Rust will drop these fields in the order they are declared
pub struct VulkanDevice {
    command_pool: CommandPool,
    queue_lock: Mutex<()>,
    memory_types: Vec<vk::MemoryPropertyFlags>,
    shader_dir: PathBuf,
    context: Arc<Context>,
}

impl VulkanDevice {
    pub fn new(shader_dir: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        Self::with_context(Arc::new(Context::new()?), shader_dir)
    }

    pub fn with_context(
        context: Arc<Context>,
        shader_dir: impl Into<PathBuf>,
    ) -> Result<Self, DeviceError> {
        Ok(Self {
            command_pool: CommandPool::new(context.clone())?,
            queue_lock: Mutex::new(()),
            memory_types: context.memory_types(),
            shader_dir: shader_dir.into(),
            context,
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn shader_dir(&self) -> &Path {
        &self.shader_dir
    }

    pub fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe {
            self.context
                .buffer_device_address
                .get_buffer_device_address(&info)
        }
    }

    /// Loads the shader and builds a compute pipeline with one descriptor set.
    pub(crate) fn create_compute_pipeline(
        &self,
        shader_name: &str,
        set_layout_bindings: &[vk::DescriptorSetLayoutBinding],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<(vk::Pipeline, vk::PipelineLayout, vk::DescriptorSetLayout), DeviceError> {
        let device = &self.context.device;
        let shader = ShaderModule::load(self.context.clone(), &self.shader_dir, shader_name)?;

        let set_layout = {
            let create_info =
                vk::DescriptorSetLayoutCreateInfo::builder().bindings(set_layout_bindings);
            unsafe { device.create_descriptor_set_layout(&create_info, None) }?
        };

        let layout = {
            let create_info = vk::PipelineLayoutCreateInfo::builder()
                .set_layouts(std::slice::from_ref(&set_layout))
                .push_constant_ranges(push_constant_ranges);
            match unsafe { device.create_pipeline_layout(&create_info, None) } {
                Ok(layout) => layout,
                Err(err) => {
                    unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                    return Err(err.into());
                }
            }
        };

        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(shader.stage_create_info())
            .layout(layout)
            .build();
        let pipeline = unsafe {
            device.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&create_info),
                None,
            )
        };

        match pipeline {
            Ok(pipelines) if !pipelines.is_empty() => Ok((pipelines[0], layout, set_layout)),
            result => {
                let err = match result {
                    Err((_, err)) => err,
                    Ok(_) => vk::Result::ERROR_UNKNOWN,
                };
                unsafe {
                    device.destroy_pipeline_layout(layout, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
                Err(err.into())
            }
        }
    }

    fn lock_queue(&self) -> Result<MutexGuard<'_, ()>, DeviceError> {
        self.queue_lock
            .lock()
            .map_err(|_| DeviceError::DeviceLost("queue lock poisoned".into()))
    }

    fn check_range(
        memory: &VulkanMemory,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Result<NonNull<u8>, DeviceError> {
        let mapped = memory.mapped.ok_or(DeviceError::NotHostVisible)?;
        let len = len as u64;
        if offset.checked_add(len).map_or(true, |end| end > memory.size) {
            return Err(DeviceError::OutOfRange {
                offset,
                len,
                size: memory.size,
            });
        }
        Ok(mapped.0)
    }
}

fn lost(err: vk::Result) -> DeviceError {
    match err {
        vk::Result::ERROR_DEVICE_LOST => {
            DeviceError::DeviceLost("vulkan reported device loss".into())
        }
        other => DeviceError::Vulkan(other),
    }
}

impl ComputeDevice for VulkanDevice {
    type Memory = VulkanMemory;
    type Buffer = VulkanBuffer;
    type Pipeline = VulkanPipeline;
    type BindingPool = VulkanBindingPool;
    type BindingSet = DescriptorSet;
    type CommandSequence = VulkanCommands;
    type Fence = vk::Fence;

    fn memory_type_index(
        &self,
        requirements: &MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        find_memorytype_index(requirements.memory_type_bits, &self.memory_types, flags)
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> Result<VulkanMemory, DeviceError> {
        let property_flags = *self
            .memory_types
            .get(memory_type_index as usize)
            .ok_or(DeviceError::InvalidMemoryType(memory_type_index))?;

        // Acceleration structure storage and build inputs need device addresses.
        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index)
            .push_next(&mut flags_info);

        let device = &self.context.device;
        let inner = unsafe { device.allocate_memory(&allocate_info, None) }.map_err(|err| {
            match err {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    DeviceError::OutOfMemory {
                        requested: size,
                        available: self.context.heap_size(memory_type_index),
                    }
                }
                other => DeviceError::Vulkan(other),
            }
        })?;

        let mapped = if property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            let pointer = unsafe {
                device.map_memory(inner, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            };
            match pointer.map(|pointer| NonNull::new(pointer.cast::<u8>())) {
                Ok(Some(pointer)) => Some(MappedPtr(pointer)),
                Ok(None) => None,
                Err(err) => {
                    unsafe { device.free_memory(inner, None) };
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        Ok(VulkanMemory {
            inner,
            size,
            mapped,
        })
    }

    fn free_memory(&self, memory: VulkanMemory) {
        // Freeing unmaps implicitly.
        unsafe { self.context.device.free_memory(memory.inner, None) };
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<VulkanBuffer, DeviceError> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let inner = unsafe { self.context.device.create_buffer(&create_info, None) }?;
        Ok(VulkanBuffer { inner, size, usage })
    }

    fn buffer_requirements(&self, buffer: &VulkanBuffer) -> MemoryRequirements {
        unsafe { self.context.device.get_buffer_memory_requirements(buffer.inner) }.into()
    }

    fn bind_buffer_memory(
        &self,
        buffer: &VulkanBuffer,
        memory: &VulkanMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), DeviceError> {
        unsafe {
            self.context
                .device
                .bind_buffer_memory(buffer.inner, memory.inner, offset)
        }?;
        Ok(())
    }

    fn destroy_buffer(&self, buffer: VulkanBuffer) {
        unsafe { self.context.device.destroy_buffer(buffer.inner, None) };
    }

    fn write_memory(
        &self,
        memory: &VulkanMemory,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let mapped = Self::check_range(memory, offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapped.as_ptr().add(offset as usize),
                data.len(),
            )
        };
        Ok(())
    }

    fn read_memory(
        &self,
        memory: &VulkanMemory,
        offset: vk::DeviceSize,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        let mapped = Self::check_range(memory, offset, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapped.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            )
        };
        Ok(())
    }

    fn create_pipeline(
        &self,
        shader_name: &str,
        bindings: &[BindingDescriptor],
    ) -> Result<VulkanPipeline, DeviceError> {
        let set_layout_bindings: Vec<_> = bindings
            .iter()
            .enumerate()
            .map(|(i, binding)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(i as u32)
                    .descriptor_type(binding.kind.into())
                    .descriptor_count(binding.count)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();

        let (inner, layout, set_layout) =
            self.create_compute_pipeline(shader_name, &set_layout_bindings, &[])?;
        log::debug!("Created pipeline {} with {} bindings", shader_name, bindings.len());

        Ok(VulkanPipeline {
            inner,
            layout,
            set_layout,
            bindings: bindings.to_vec(),
        })
    }

    fn destroy_pipeline(&self, pipeline: VulkanPipeline) {
        let device = &self.context.device;
        unsafe {
            device.destroy_pipeline(pipeline.inner, None);
            device.destroy_pipeline_layout(pipeline.layout, None);
            device.destroy_descriptor_set_layout(pipeline.set_layout, None);
        }
    }

    fn create_binding_pool(&self, max_sets: u32) -> Result<VulkanBindingPool, DeviceError> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: max_sets * POOL_UNIFORMS_PER_SET,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_sets * POOL_STORAGE_PER_SET,
            },
        ];
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);
        let inner = unsafe { self.context.device.create_descriptor_pool(&create_info, None) }?;
        Ok(VulkanBindingPool { inner, max_sets })
    }

    fn reset_binding_pool(&self, pool: &VulkanBindingPool) -> Result<(), DeviceError> {
        unsafe {
            self.context
                .device
                .reset_descriptor_pool(pool.inner, vk::DescriptorPoolResetFlags::empty())
        }?;
        Ok(())
    }

    fn destroy_binding_pool(&self, pool: VulkanBindingPool) {
        unsafe { self.context.device.destroy_descriptor_pool(pool.inner, None) };
    }

    fn allocate_binding_set(
        &self,
        pool: &VulkanBindingPool,
        pipeline: &VulkanPipeline,
        buffers: &[&VulkanBuffer],
    ) -> Result<DescriptorSet, DeviceError> {
        if buffers.len() != pipeline.bindings.len() {
            return Err(DeviceError::BindingMismatch {
                expected: pipeline.bindings.len(),
                actual: buffers.len(),
            });
        }

        let writes = pipeline
            .bindings
            .iter()
            .zip(buffers)
            .enumerate()
            .map(|(i, (binding, buffer))| {
                WriteDescriptorSet::buffer(i as u32, binding.kind, buffer.inner)
            })
            .collect();

        DescriptorSet::new(&self.context, pool.inner, pipeline.set_layout, writes).map_err(
            |err| match err {
                DeviceError::Vulkan(
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL,
                ) => DeviceError::PoolExhausted(pool.max_sets),
                other => other,
            },
        )
    }

    fn begin_commands(&self) -> Result<VulkanCommands, DeviceError> {
        let inner = self.command_pool.allocate()?;
        let begin_info = vk::CommandBufferBeginInfo::builder();
        if let Err(err) = unsafe { self.context.device.begin_command_buffer(inner, &begin_info) } {
            self.command_pool.free(inner);
            return Err(err.into());
        }
        Ok(VulkanCommands {
            inner,
            ended: false,
        })
    }

    fn cmd_dispatch(
        &self,
        commands: &mut VulkanCommands,
        pipeline: &VulkanPipeline,
        binding_set: &DescriptorSet,
        groups: [u32; 3],
    ) {
        let device = &self.context.device;
        unsafe {
            device.cmd_bind_pipeline(
                commands.inner,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.inner,
            );
            device.cmd_bind_descriptor_sets(
                commands.inner,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                std::slice::from_ref(&binding_set.inner),
                &[],
            );
            device.cmd_dispatch(commands.inner, groups[0], groups[1], groups[2]);
        }
    }

    fn cmd_buffer_barrier(
        &self,
        commands: &mut VulkanCommands,
        scope: BarrierScope,
        buffers: &[&VulkanBuffer],
    ) {
        CmdPipelineBarrier {
            memory_barriers: vec![],
            buffer_memory_barriers: buffers
                .iter()
                .map(|buffer| BufferMemoryBarrier::whole(scope, buffer))
                .collect(),
        }
        .execute(commands.inner, &self.context);
    }

    fn cmd_copy_buffer(
        &self,
        commands: &mut VulkanCommands,
        src: &VulkanBuffer,
        dst: &VulkanBuffer,
        size: vk::DeviceSize,
    ) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.context.device.cmd_copy_buffer(
                commands.inner,
                src.inner,
                dst.inner,
                std::slice::from_ref(&region),
            )
        };
    }

    fn end_commands(&self, commands: &mut VulkanCommands) -> Result<(), DeviceError> {
        unsafe { self.context.device.end_command_buffer(commands.inner) }?;
        commands.ended = true;
        Ok(())
    }

    fn free_commands(&self, commands: VulkanCommands) {
        self.command_pool.free(commands.inner);
    }

    fn submit(
        &self,
        commands: &VulkanCommands,
        fence: Option<&vk::Fence>,
    ) -> Result<(), DeviceError> {
        if !commands.ended {
            return Err(DeviceError::CommandsNotEnded);
        }
        let submit_info =
            vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&commands.inner));

        let _queue = self.lock_queue()?;
        unsafe {
            self.context.device.queue_submit(
                self.context.queue,
                std::slice::from_ref(&submit_info),
                fence.copied().unwrap_or_else(vk::Fence::null),
            )
        }
        .map_err(lost)
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, DeviceError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        Ok(unsafe { self.context.device.create_fence(&create_info, None) }?)
    }

    fn fence_status(&self, fence: &vk::Fence) -> Result<bool, DeviceError> {
        unsafe { self.context.device.get_fence_status(*fence) }.map_err(lost)
    }

    fn wait_fence(&self, fence: &vk::Fence, timeout: Duration) -> Result<bool, DeviceError> {
        let timeout = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe {
            self.context
                .device
                .wait_for_fences(std::slice::from_ref(fence), true, timeout)
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(lost(err)),
        }
    }

    fn reset_fence(&self, fence: &vk::Fence) -> Result<(), DeviceError> {
        unsafe { self.context.device.reset_fences(std::slice::from_ref(fence)) }?;
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.context.device.destroy_fence(fence, None) };
    }

    fn wait_idle(&self) -> Result<(), DeviceError> {
        let _queue = self.lock_queue()?;
        unsafe { self.context.device.device_wait_idle() }.map_err(lost)
    }
}
