use std::ffi::CStr;

use ash::{
    extensions::khr::{
        AccelerationStructure, BufferDeviceAddress, DeferredHostOperations, Synchronization2,
    },
    vk::{self, ApplicationInfo, DeviceCreateInfo, DeviceQueueCreateInfo, InstanceCreateInfo},
};

use crate::device::DeviceError;

/// A headless instance and logical device with one compute queue.
pub struct Context {
    _entry: ash::Entry,
    pub instance: ash::Instance,

    pub acceleration_structure: AccelerationStructure,
    pub min_acceleration_structure_scratch_offset_alignment: u32,
    pub synchronisation2_loader: Synchronization2,

    pub physical_device: vk::PhysicalDevice,
    pub queue_family_index: u32,

    pub device: ash::Device,
    pub queue: vk::Queue,

    pub buffer_device_address: BufferDeviceAddress,
    pub device_memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl Context {
    pub fn new() -> Result<Self, DeviceError> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|err| DeviceError::LibraryLoad(err.to_string()))?;

        let instance = {
            let app_info = ApplicationInfo::builder().api_version(vk::API_VERSION_1_3);
            let create_info = InstanceCreateInfo::builder().application_info(&app_info);
            unsafe { entry.create_instance(&create_info, None) }?
        };

        // The entry has to outlive the instance even if device setup fails
        match Self::with_instance(entry.clone(), instance.clone()) {
            Ok(context) => Ok(context),
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    fn with_instance(entry: ash::Entry, instance: ash::Instance) -> Result<Self, DeviceError> {
        let (physical_device, queue_family_index) = find_physical_device(&instance)?;

        let device = create_logical_device(&instance, &physical_device, queue_family_index)?;

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let synchronisation2_loader = Synchronization2::new(&instance, &device);

        let acceleration_structure = AccelerationStructure::new(&instance, &device);
        // Only plain values are kept, the property struct carries a raw p_next pointer
        let min_acceleration_structure_scratch_offset_alignment =
            unsafe { AccelerationStructure::get_properties(&instance, physical_device) }
                .min_acceleration_structure_scratch_offset_alignment;

        let buffer_device_address = BufferDeviceAddress::new(&instance, &device);

        let device_memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!(
            "Using {:?} ({:?}), queue family {}",
            name,
            properties.device_type,
            queue_family_index
        );

        Ok(Self {
            _entry: entry,
            instance,

            acceleration_structure,
            min_acceleration_structure_scratch_offset_alignment,
            synchronisation2_loader,

            physical_device,
            queue_family_index,

            device,
            queue,
            buffer_device_address,
            device_memory_properties,
        })
    }

    /// Property flags of every memory type, indexed like the device reports them.
    pub fn memory_types(&self) -> Vec<vk::MemoryPropertyFlags> {
        let count = self.device_memory_properties.memory_type_count as usize;
        self.device_memory_properties.memory_types[..count]
            .iter()
            .map(|memory_type| memory_type.property_flags)
            .collect()
    }

    pub fn heap_size(&self, memory_type_index: u32) -> vk::DeviceSize {
        let memory_type = self.device_memory_properties.memory_types[memory_type_index as usize];
        self.device_memory_properties.memory_heaps[memory_type.heap_index as usize].size
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { self.device.destroy_device(None) };

        unsafe { self.instance.destroy_instance(None) };
    }
}

fn required_extensions() -> [&'static CStr; 5] {
    [
        Synchronization2::name(),
        AccelerationStructure::name(),
        vk::KhrRayQueryFn::name(),
        DeferredHostOperations::name(),
        BufferDeviceAddress::name(),
    ]
}

fn find_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, u32), DeviceError> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }?;

    physical_devices
        .into_iter()
        .filter(|pd| {
            let Ok(extension_properties) =
                (unsafe { instance.enumerate_device_extension_properties(*pd) })
            else {
                return false;
            };
            let supported: Vec<&CStr> = extension_properties
                .iter()
                .map(|property| unsafe { CStr::from_ptr(property.extension_name.as_ptr()) })
                .collect();

            required_extensions()
                .iter()
                .all(|required| supported.contains(required))
        })
        .filter_map(|pd| {
            unsafe { instance.get_physical_device_queue_family_properties(pd) }
                .iter()
                .position(|info| info.queue_flags.contains(vk::QueueFlags::COMPUTE))
                .map(|i| (pd, i as u32))
        })
        .min_by_key(|(pd, _)| {
            let device_type = unsafe { instance.get_physical_device_properties(*pd) }.device_type;

            match device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                vk::PhysicalDeviceType::CPU => 3,
                vk::PhysicalDeviceType::OTHER => 4,
                _ => 5,
            }
        })
        .ok_or(DeviceError::NoSuitableDevice)
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: &vk::PhysicalDevice,
    queue_family_index: u32,
) -> Result<ash::Device, DeviceError> {
    let device_extensions = required_extensions().map(|name| name.as_ptr());

    let queue_priorities = [1.0];
    let queue_create_info = DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family_index)
        .queue_priorities(&queue_priorities);

    let mut physical_device_vulkan13_features = vk::PhysicalDeviceVulkan13Features {
        synchronization2: vk::TRUE,
        ..vk::PhysicalDeviceVulkan13Features::default()
    };

    let mut enabled_buffer_device_address_features =
        vk::PhysicalDeviceBufferDeviceAddressFeatures {
            buffer_device_address: vk::TRUE,
            ..vk::PhysicalDeviceBufferDeviceAddressFeatures::default()
        };

    let mut enabled_acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR {
            acceleration_structure: vk::TRUE,
            ..vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        };

    let mut enabled_ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR {
        ray_query: vk::TRUE,
        ..vk::PhysicalDeviceRayQueryFeaturesKHR::default()
    };

    let create_info = DeviceCreateInfo::builder()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&device_extensions)
        .push_next(&mut physical_device_vulkan13_features)
        .push_next(&mut enabled_buffer_device_address_features)
        .push_next(&mut enabled_acceleration_structure_features)
        .push_next(&mut enabled_ray_query_features);

    Ok(unsafe { instance.create_device(*physical_device, &create_info, None) }?)
}
