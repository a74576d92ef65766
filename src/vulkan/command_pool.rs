use std::sync::{Arc, Mutex};

use ash::vk::{self};

use super::context::Context;
use crate::device::DeviceError;

/// Command buffers of the compute queue. Allocation and freeing are serialized,
/// recording happens on the caller's thread.
pub struct CommandPool {
    inner: Mutex<vk::CommandPool>,
    context: Arc<Context>,
}

impl CommandPool {
    pub fn new(context: Arc<Context>) -> Result<Self, DeviceError> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.queue_family_index)
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            );

        let command_pool = unsafe { context.device.create_command_pool(&create_info, None) }?;

        Ok(Self {
            inner: Mutex::new(command_pool),
            context,
        })
    }

    pub fn allocate(&self) -> Result<vk::CommandBuffer, DeviceError> {
        let pool = self.lock()?;
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffers =
            unsafe { self.context.device.allocate_command_buffers(&allocate_info) }?;
        command_buffers
            .first()
            .copied()
            .ok_or(DeviceError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
    }

    pub fn free(&self, command_buffer: vk::CommandBuffer) {
        match self.lock() {
            Ok(pool) => unsafe {
                self.context
                    .device
                    .free_command_buffers(*pool, std::slice::from_ref(&command_buffer))
            },
            Err(err) => log::error!("Leaking command buffer: {}", err),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, vk::CommandPool>, DeviceError> {
        self.inner
            .lock()
            .map_err(|_| DeviceError::DeviceLost("command pool lock poisoned".into()))
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        if let Ok(pool) = self.inner.get_mut() {
            unsafe { self.context.device.destroy_command_pool(*pool, None) };
        }
    }
}
