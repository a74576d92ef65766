use std::{ffi::CStr, io::Cursor, path::Path, sync::Arc};

use ash::vk;

use super::context::Context;
use crate::device::DeviceError;

const SHADER_ENTRY_NAME: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// A compute shader module, destroyed once the pipeline using it is created.
pub struct ShaderModule {
    context: Arc<Context>,
    pub inner: vk::ShaderModule,
}

impl ShaderModule {
    /// Loads `<shader_dir>/<name>.comp.spv`.
    pub fn load(context: Arc<Context>, shader_dir: &Path, name: &str) -> Result<Self, DeviceError> {
        let path = shader_dir.join(format!("{}.comp.spv", name));
        let bytes = std::fs::read(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                DeviceError::ShaderNotFound(name.to_string())
            } else {
                DeviceError::ShaderLoad {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        Self::new(context, &bytes).map_err(|err| match err {
            ShaderError::Spv(source) => DeviceError::ShaderLoad { path, source },
            ShaderError::Vulkan(result) => DeviceError::Vulkan(result),
        })
    }

    fn new(context: Arc<Context>, bytes: &[u8]) -> Result<Self, ShaderError> {
        let mut spv_file = Cursor::new(bytes);

        let shader_code = ash::util::read_spv(&mut spv_file).map_err(ShaderError::Spv)?;

        let inner = {
            let create_info = vk::ShaderModuleCreateInfo::builder().code(&shader_code);
            unsafe { context.device.create_shader_module(&create_info, None) }
                .map_err(ShaderError::Vulkan)?
        };

        Ok(Self { context, inner })
    }

    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .module(self.inner)
            .name(SHADER_ENTRY_NAME)
            .stage(vk::ShaderStageFlags::COMPUTE)
            .build()
    }
}

enum ShaderError {
    Spv(std::io::Error),
    Vulkan(vk::Result),
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_shader_module(self.inner, None);
        }
    }
}
