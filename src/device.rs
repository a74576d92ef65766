//! The compute-dispatch layer both backends implement.

use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;

use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("memory type index {0} does not exist")]
    InvalidMemoryType(u32),

    #[error("memory is not host visible")]
    NotHostVisible,

    #[error("access of {len} bytes at offset {offset} exceeds the {size} byte allocation")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("buffer has no memory bound")]
    BufferNotBound,

    #[error("no shader named {0}")]
    ShaderNotFound(String),

    #[error("could not read shader {path:?}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline declares {expected} bindings, got {actual}")]
    BindingMismatch { expected: usize, actual: usize },

    #[error("binding pool exhausted after {0} sets")]
    PoolExhausted(u32),

    #[error("command sequence was not ended before submission")]
    CommandsNotEnded,

    #[error("queue rejected the submission")]
    SubmitRejected,

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("could not load the vulkan library: {0}")]
    LibraryLoad(String),

    #[error("no physical device supports compute and ray queries")]
    NoSuitableDevice,

    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),
}

/// Size, alignment and compatible memory types of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    pub memory_type_bits: u32,
}

impl MemoryRequirements {
    pub fn new(size: vk::DeviceSize, alignment: vk::DeviceSize) -> Self {
        Self {
            size,
            alignment,
            memory_type_bits: u32::MAX,
        }
    }
}

impl From<vk::MemoryRequirements> for MemoryRequirements {
    fn from(value: vk::MemoryRequirements) -> Self {
        Self {
            size: value.size,
            alignment: value.alignment,
            memory_type_bits: value.memory_type_bits,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Uniform,
    Storage,
}

impl From<BindingKind> for vk::DescriptorType {
    fn from(kind: BindingKind) -> Self {
        match kind {
            BindingKind::Uniform => vk::DescriptorType::UNIFORM_BUFFER,
            BindingKind::Storage => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// One slot of a compute stage's binding layout, in binding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDescriptor {
    pub kind: BindingKind,
    pub count: u32,
}

impl BindingDescriptor {
    pub const fn uniform() -> Self {
        Self {
            kind: BindingKind::Uniform,
            count: 1,
        }
    }

    pub const fn storage() -> Self {
        Self {
            kind: BindingKind::Storage,
            count: 1,
        }
    }
}

/// Source and destination of a write-to-read buffer barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierScope {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl BarrierScope {
    /// Later stages read and also overwrite what earlier ones wrote.
    pub const COMPUTE_TO_COMPUTE: BarrierScope = BarrierScope {
        src_stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        src_access: vk::AccessFlags2::SHADER_WRITE,
        dst_stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        dst_access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::SHADER_READ.as_raw() | vk::AccessFlags2::SHADER_WRITE.as_raw(),
        ),
    };

    pub const COMPUTE_TO_TRANSFER: BarrierScope = BarrierScope {
        src_stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        src_access: vk::AccessFlags2::SHADER_WRITE,
        dst_stage: vk::PipelineStageFlags2::TRANSFER,
        dst_access: vk::AccessFlags2::TRANSFER_READ,
    };

    /// Makes results visible to host reads of mapped memory after the fence.
    pub const COMPUTE_TO_HOST: BarrierScope = BarrierScope {
        src_stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        src_access: vk::AccessFlags2::SHADER_WRITE,
        dst_stage: vk::PipelineStageFlags2::HOST,
        dst_access: vk::AccessFlags2::HOST_READ,
    };
}

pub trait ComputeDevice: Send + Sync + 'static {
    type Memory: Clone + PartialEq + Debug;
    type Buffer: Clone + Debug;
    type Pipeline;
    type BindingPool;
    type BindingSet: Clone;
    type CommandSequence;
    type Fence;

    fn memory_type_index(
        &self,
        requirements: &MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32>;
    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> Result<Self::Memory, DeviceError>;
    fn free_memory(&self, memory: Self::Memory);

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self::Buffer, DeviceError>;
    fn buffer_requirements(&self, buffer: &Self::Buffer) -> MemoryRequirements;
    fn bind_buffer_memory(
        &self,
        buffer: &Self::Buffer,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
    ) -> Result<(), DeviceError>;
    fn destroy_buffer(&self, buffer: Self::Buffer);

    /// Only legal on host-visible memory.
    fn write_memory(
        &self,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<(), DeviceError>;
    fn read_memory(
        &self,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
        out: &mut [u8],
    ) -> Result<(), DeviceError>;

    fn create_pipeline(
        &self,
        shader_name: &str,
        bindings: &[BindingDescriptor],
    ) -> Result<Self::Pipeline, DeviceError>;
    fn destroy_pipeline(&self, pipeline: Self::Pipeline);

    fn create_binding_pool(&self, max_sets: u32) -> Result<Self::BindingPool, DeviceError>;
    /// Frees every set allocated from the pool.
    fn reset_binding_pool(&self, pool: &Self::BindingPool) -> Result<(), DeviceError>;
    fn destroy_binding_pool(&self, pool: Self::BindingPool);
    fn allocate_binding_set(
        &self,
        pool: &Self::BindingPool,
        pipeline: &Self::Pipeline,
        buffers: &[&Self::Buffer],
    ) -> Result<Self::BindingSet, DeviceError>;

    fn begin_commands(&self) -> Result<Self::CommandSequence, DeviceError>;
    fn cmd_dispatch(
        &self,
        commands: &mut Self::CommandSequence,
        pipeline: &Self::Pipeline,
        binding_set: &Self::BindingSet,
        groups: [u32; 3],
    );
    fn cmd_buffer_barrier(
        &self,
        commands: &mut Self::CommandSequence,
        scope: BarrierScope,
        buffers: &[&Self::Buffer],
    );
    fn cmd_copy_buffer(
        &self,
        commands: &mut Self::CommandSequence,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        size: vk::DeviceSize,
    );
    fn end_commands(&self, commands: &mut Self::CommandSequence) -> Result<(), DeviceError>;
    fn free_commands(&self, commands: Self::CommandSequence);

    fn submit(
        &self,
        commands: &Self::CommandSequence,
        fence: Option<&Self::Fence>,
    ) -> Result<(), DeviceError>;

    /// Submits and blocks until the queue has finished the work.
    fn submit_and_wait(&self, commands: &Self::CommandSequence) -> Result<(), DeviceError> {
        let fence = self.create_fence(false)?;
        let result = self.submit(commands, Some(&fence)).and_then(|_| loop {
            if self.wait_fence(&fence, Duration::from_secs(1))? {
                break Ok(());
            }
        });
        self.destroy_fence(fence);
        result
    }

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, DeviceError>;
    fn fence_status(&self, fence: &Self::Fence) -> Result<bool, DeviceError>;
    /// Returns false when the timeout elapsed before the fence was signaled.
    fn wait_fence(&self, fence: &Self::Fence, timeout: Duration) -> Result<bool, DeviceError>;
    fn reset_fence(&self, fence: &Self::Fence) -> Result<(), DeviceError>;
    fn destroy_fence(&self, fence: Self::Fence);

    fn wait_idle(&self) -> Result<(), DeviceError>;
}

/// Finds the first memory type allowed by `memory_type_bits` that has all `flags`.
pub fn find_memorytype_index(
    memory_type_bits: u32,
    memory_types: &[vk::MemoryPropertyFlags],
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_types
        .iter()
        .enumerate()
        .find(|(index, property_flags)| {
            (memory_type_bits & (1 << index)) != 0 && **property_flags & flags == flags
        })
        .map(|(index, _)| index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_type_respects_bits_and_flags() {
        let types = [
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ];
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(find_memorytype_index(0b11, &types, host), Some(1));
        assert_eq!(find_memorytype_index(0b01, &types, host), None);
        assert_eq!(
            find_memorytype_index(0b11, &types, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }
}
