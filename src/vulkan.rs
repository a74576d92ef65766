pub mod acceleration_structure;
pub mod command_pool;
pub mod context;
pub mod descriptor_set;
pub mod device;
pub mod shader_module;
pub mod sync_commands;

pub use acceleration_structure::{VulkanIntersector, VulkanStructure};
pub use device::VulkanDevice;
