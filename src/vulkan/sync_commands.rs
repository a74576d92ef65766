use ash::vk;

use super::{context::Context, device::VulkanBuffer};
use crate::device::BarrierScope;

pub struct CmdPipelineBarrier<'resources> {
    pub memory_barriers: Vec<MemoryBarrier>,
    pub buffer_memory_barriers: Vec<BufferMemoryBarrier<'resources>>,
}

#[derive(Clone)]
pub struct MemoryBarrier {
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
    pub dst_access_mask: vk::AccessFlags2,
}

#[derive(Clone)]
pub struct BufferMemoryBarrier<'a> {
    pub scope: BarrierScope,
    pub buffer: &'a VulkanBuffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl<'a> BufferMemoryBarrier<'a> {
    /// Covers the whole buffer, no queue family transfer.
    pub fn whole(scope: BarrierScope, buffer: &'a VulkanBuffer) -> Self {
        Self {
            scope,
            buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
        }
    }
}

impl MemoryBarrier {
    /// Makes a finished acceleration structure build visible to later builds and ray queries.
    pub fn acceleration_structure_build() -> Self {
        Self {
            src_stage_mask: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            src_access_mask: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            dst_stage_mask: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags2::COMPUTE_SHADER,
            dst_access_mask: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        }
    }
}

impl<'resources> CmdPipelineBarrier<'resources> {
    pub fn execute(self, command_buffer: vk::CommandBuffer, context: &Context) {
        let memory_barriers: Vec<_> = self
            .memory_barriers
            .into_iter()
            .map(|v| {
                vk::MemoryBarrier2::builder()
                    .src_stage_mask(v.src_stage_mask)
                    .src_access_mask(v.src_access_mask)
                    .dst_stage_mask(v.dst_stage_mask)
                    .dst_access_mask(v.dst_access_mask)
                    .build() // Calling build is legal here
            })
            .collect();

        let buffer_memory_barriers: Vec<_> = self
            .buffer_memory_barriers
            .into_iter()
            .map(|v| {
                vk::BufferMemoryBarrier2::builder()
                    .src_stage_mask(v.scope.src_stage)
                    .src_access_mask(v.scope.src_access)
                    .dst_stage_mask(v.scope.dst_stage)
                    .dst_access_mask(v.scope.dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(v.buffer.inner)
                    .offset(v.offset)
                    .size(v.size)
                    .build()
            })
            .collect();

        unsafe {
            context.synchronisation2_loader.cmd_pipeline_barrier2(
                command_buffer,
                &vk::DependencyInfo::builder()
                    .memory_barriers(&memory_barriers)
                    .buffer_memory_barriers(&buffer_memory_barriers),
            );
        };
    }
}
