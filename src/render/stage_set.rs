use std::collections::HashMap;
use std::sync::Arc;

use crate::device::{BindingDescriptor, ComputeDevice};
use crate::error::{Error, Result};

struct Stage<D: ComputeDevice> {
    pipeline: D::Pipeline,
    bindings: Vec<BindingDescriptor>,
}

/// Compute pipelines keyed by stage name, with one pool for all of their binding sets.
///
/// Binding sets are never freed one by one, they go away when the pool is reset
/// or destroyed.
pub struct ComputeStageSet<D: ComputeDevice> {
    stages: HashMap<String, Stage<D>>,
    pool: Option<D::BindingPool>,
    device: Arc<D>,
}

impl<D: ComputeDevice> ComputeStageSet<D> {
    pub fn new(device: Arc<D>, max_sets: u32) -> Result<Self> {
        let pool = device
            .create_binding_pool(max_sets)
            .map_err(Error::load("binding pool creation"))?;
        Ok(Self {
            stages: HashMap::new(),
            pool: Some(pool),
            device,
        })
    }

    /// Creating a stage again replaces the previous pipeline.
    pub fn create(
        &mut self,
        stage: &str,
        shader_name: &str,
        bindings: &[BindingDescriptor],
    ) -> Result<()> {
        if let Some(previous) = self.stages.remove(stage) {
            self.device.destroy_pipeline(previous.pipeline);
        }
        let pipeline = self
            .device
            .create_pipeline(shader_name, bindings)
            .map_err(Error::load("pipeline creation"))?;
        log::debug!(
            "Created stage {} from {} with {} bindings",
            stage,
            shader_name,
            bindings.len()
        );
        self.stages.insert(
            stage.to_string(),
            Stage {
                pipeline,
                bindings: bindings.to_vec(),
            },
        );
        Ok(())
    }

    pub fn pipeline(&self, stage: &str) -> Result<&D::Pipeline> {
        Ok(&self.stage(stage)?.pipeline)
    }

    pub fn binding_count(&self, stage: &str) -> Result<usize> {
        Ok(self.stage(stage)?.bindings.len())
    }

    /// Allocates a binding set from the shared pool with one buffer per binding, in order.
    pub fn bind(&self, stage: &str, buffers: &[&D::Buffer]) -> Result<D::BindingSet> {
        let entry = self.stage(stage)?;
        if buffers.len() != entry.bindings.len() {
            return Err(Error::BindingCountMismatch {
                stage: stage.to_string(),
                expected: entry.bindings.len(),
                actual: buffers.len(),
            });
        }
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| Error::StageNotCreated(stage.to_string()))?;
        self.device
            .allocate_binding_set(pool, &entry.pipeline, buffers)
            .map_err(Error::load("binding set allocation"))
    }

    /// Reclaims every binding set allocated so far.
    pub fn reset_bindings(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            self.device
                .reset_binding_pool(pool)
                .map_err(Error::load("binding pool reset"))?;
        }
        Ok(())
    }

    fn stage(&self, stage: &str) -> Result<&Stage<D>> {
        self.stages
            .get(stage)
            .ok_or_else(|| Error::StageNotCreated(stage.to_string()))
    }
}

impl<D: ComputeDevice> Drop for ComputeStageSet<D> {
    fn drop(&mut self) {
        for (_, stage) in self.stages.drain() {
            self.device.destroy_pipeline(stage.pipeline);
        }
        if let Some(pool) = self.pool.take() {
            self.device.destroy_binding_pool(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use crate::host::{HostDevice, HostDeviceConfig};
    use crate::render::technique::Technique;
    use ash::vk;

    fn stage_set(max_sets: u32) -> (Arc<HostDevice>, ComputeStageSet<HostDevice>) {
        let device = Arc::new(HostDevice::new(HostDeviceConfig::default()));
        (device.clone(), ComputeStageSet::new(device, max_sets).unwrap())
    }

    #[test]
    fn bind_checks_binding_count() {
        let (device, mut stages) = stage_set(4);
        let technique = Technique::ambient_occlusion();
        stages
            .create("resolve", "ao_rays_resolve", &technique.resolve.binding_descriptors())
            .unwrap();

        let buffer = device
            .create_buffer(16, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();
        let result = stages.bind("resolve", &[&buffer, &buffer]);
        assert!(matches!(
            result,
            Err(Error::BindingCountMismatch {
                expected: 5,
                actual: 2,
                ..
            })
        ));
        assert!(stages.bind("resolve", &[&buffer; 5]).is_ok());
        device.destroy_buffer(buffer);
    }

    #[test]
    fn create_is_idempotent() {
        let (_, mut stages) = stage_set(4);
        let bindings = [BindingDescriptor::storage()];
        stages.create("clear", "clear_counter", &bindings).unwrap();
        stages.create("clear", "clear_counter", &bindings).unwrap();
        assert_eq!(stages.binding_count("clear").unwrap(), 1);
        assert!(matches!(
            stages.pipeline("camera"),
            Err(Error::StageNotCreated(_))
        ));
    }

    #[test]
    fn unknown_shader_is_fatal() {
        let (_, mut stages) = stage_set(1);
        let result = stages.create("camera", "missing", &[BindingDescriptor::storage()]);
        assert!(matches!(
            result,
            Err(Error::Load {
                source: DeviceError::ShaderNotFound(_),
                ..
            })
        ));
    }

    #[test]
    fn pool_is_reclaimed_on_reset() {
        let (device, mut stages) = stage_set(1);
        stages
            .create("clear", "clear_counter", &[BindingDescriptor::storage()])
            .unwrap();
        let buffer = device
            .create_buffer(4, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();

        stages.bind("clear", &[&buffer]).unwrap();
        assert!(stages.bind("clear", &[&buffer]).is_err());
        stages.reset_bindings().unwrap();
        assert!(stages.bind("clear", &[&buffer]).is_ok());
        device.destroy_buffer(buffer);
    }
}
