use ash::vk;

use super::context::Context;
use crate::device::{BindingKind, DeviceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSet {
    pub inner: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn new(
        context: &Context,
        descriptor_pool: vk::DescriptorPool,
        set_layout: vk::DescriptorSetLayout,
        write_descriptor_sets: Vec<WriteDescriptorSet>,
    ) -> Result<Self, DeviceError> {
        let device = &context.device;
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool)
            .set_layouts(std::slice::from_ref(&set_layout));

        let descriptor_set = unsafe { device.allocate_descriptor_sets(&allocate_info) }?
            .first()
            .copied()
            .ok_or(DeviceError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))?;

        // The acceleration structure writes point into these, so they outlive the update.
        let mut acceleration_structure_infos: Vec<_> = write_descriptor_sets
            .iter()
            .map(|write| match &write.info {
                DescriptorInfo::AccelerationStructure(inner) => {
                    vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                        .acceleration_structures(std::slice::from_ref(inner))
                        .build()
                }
                DescriptorInfo::Buffer(..) => {
                    vk::WriteDescriptorSetAccelerationStructureKHR::default()
                }
            })
            .collect();

        let write_descriptor_sets: Vec<vk::WriteDescriptorSet> = write_descriptor_sets
            .iter()
            .zip(acceleration_structure_infos.iter_mut())
            .map(|(write, acceleration_structure_info)| {
                let mut vk_write = vk::WriteDescriptorSet::builder()
                    .dst_binding(write.binding)
                    .descriptor_type(write.info.descriptor_type())
                    .dst_set(descriptor_set);

                match &write.info {
                    DescriptorInfo::Buffer(_, info) => {
                        vk_write = vk_write.buffer_info(std::slice::from_ref(info))
                    }
                    DescriptorInfo::AccelerationStructure(_) => {
                        vk_write = vk_write.push_next(acceleration_structure_info);
                        vk_write.descriptor_count = 1;
                    }
                }
                vk_write.build()
            })
            .collect();

        unsafe { device.update_descriptor_sets(&write_descriptor_sets, &[]) };

        Ok(Self {
            inner: descriptor_set,
        })
    }
}

pub struct WriteDescriptorSet {
    binding: u32,
    info: DescriptorInfo,
}

pub enum DescriptorInfo {
    Buffer(BindingKind, vk::DescriptorBufferInfo),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl DescriptorInfo {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            DescriptorInfo::Buffer(kind, _) => (*kind).into(),
            DescriptorInfo::AccelerationStructure(_) => {
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
            }
        }
    }
}

impl WriteDescriptorSet {
    pub fn buffer(binding: u32, kind: BindingKind, buffer: vk::Buffer) -> WriteDescriptorSet {
        let info = vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
            .build();

        WriteDescriptorSet {
            binding,
            info: DescriptorInfo::Buffer(kind, info),
        }
    }

    pub fn acceleration_structure(
        binding: u32,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> WriteDescriptorSet {
        WriteDescriptorSet {
            binding,
            info: DescriptorInfo::AccelerationStructure(acceleration_structure),
        }
    }
}
