//! Sub-allocation of many buffers from one device memory block.

use std::sync::Arc;

use ash::vk;

use crate::device::{ComputeDevice, DeviceError, MemoryRequirements};
use crate::error::{Error, Result};

/// Something that needs a slice of the arena's memory.
#[derive(Debug, Clone)]
pub enum ArenaRequest {
    /// The arena creates the buffer and binds it at its placement.
    Buffer {
        name: String,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    },
    /// Only an offset is reserved, the caller binds its own object there.
    Region {
        name: String,
        requirements: MemoryRequirements,
    },
}

impl ArenaRequest {
    pub fn buffer(
        name: impl Into<String>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Self {
        ArenaRequest::Buffer {
            name: name.into(),
            size,
            usage,
        }
    }

    pub fn region(name: impl Into<String>, requirements: MemoryRequirements) -> Self {
        ArenaRequest::Region {
            name: name.into(),
            requirements,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ArenaRequest::Buffer { name, .. } | ArenaRequest::Region { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl Placement {
    pub fn end(&self) -> vk::DeviceSize {
        self.offset + self.size
    }
}

pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

/// Places each request at the smallest multiple of its alignment that is not
/// before the end of the previous one. Returns the placements and the total size.
pub fn place(requirements: &[MemoryRequirements]) -> (Vec<Placement>, vk::DeviceSize) {
    let mut end = 0;
    let placements = requirements
        .iter()
        .map(|requirement| {
            let offset = align_up(end, requirement.alignment);
            end = offset + requirement.size;
            Placement {
                offset,
                size: requirement.size,
            }
        })
        .collect();
    (placements, end)
}

pub struct ArenaEntry<D: ComputeDevice> {
    pub name: String,
    pub placement: Placement,
    /// Size the caller asked for, the placement may be padded by the device.
    pub size: vk::DeviceSize,
    pub buffer: Option<D::Buffer>,
}

/// One device allocation with buffers bound inside it. Freeing the arena
/// invalidates all of its buffers at once.
pub struct DeviceMemoryArena<D: ComputeDevice> {
    label: String,
    entries: Vec<ArenaEntry<D>>,
    memory: Option<D::Memory>,
    memory_type_index: u32,
    size: vk::DeviceSize,
    device: Arc<D>,
}

impl<D: ComputeDevice> DeviceMemoryArena<D> {
    pub fn allocate(
        device: Arc<D>,
        label: impl Into<String>,
        requests: Vec<ArenaRequest>,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let mut arena = DeviceMemoryArena {
            label: label.into(),
            entries: Vec::with_capacity(requests.len()),
            memory: None,
            memory_type_index: 0,
            size: 0,
            device,
        };

        let mut requirements = Vec::with_capacity(requests.len());
        for request in requests {
            let (entry, requirement) = match request {
                ArenaRequest::Buffer { name, size, usage } => {
                    let buffer = arena
                        .device
                        .create_buffer(size, usage)
                        .map_err(Error::load("buffer creation"))?;
                    let requirement = arena.device.buffer_requirements(&buffer);
                    let entry = ArenaEntry {
                        name,
                        placement: Placement { offset: 0, size: 0 },
                        size,
                        buffer: Some(buffer),
                    };
                    (entry, requirement)
                }
                ArenaRequest::Region { name, requirements } => {
                    let entry = ArenaEntry {
                        name,
                        placement: Placement { offset: 0, size: 0 },
                        size: requirements.size,
                        buffer: None,
                    };
                    (entry, requirements)
                }
            };
            arena.entries.push(entry);
            requirements.push(requirement);
        }

        let (placements, total) = place(&requirements);
        let combined = MemoryRequirements {
            size: total,
            alignment: requirements.iter().map(|r| r.alignment).max().unwrap_or(1),
            memory_type_bits: requirements
                .iter()
                .fold(u32::MAX, |bits, r| bits & r.memory_type_bits),
        };

        arena.memory_type_index = arena
            .device
            .memory_type_index(&combined, flags)
            .ok_or_else(|| Error::AllocationFailed {
                label: arena.label.clone(),
                flags,
            })?;

        for (entry, placement) in arena.entries.iter_mut().zip(placements) {
            entry.placement = placement;
        }
        arena.size = total;

        if total > 0 {
            let memory = arena
                .device
                .allocate_memory(total, arena.memory_type_index)
                .map_err(|source| match source {
                    DeviceError::OutOfMemory { .. } => Error::OutOfMemory {
                        label: arena.label.clone(),
                        size: total,
                        source,
                    },
                    source => Error::Load {
                        step: "memory allocation",
                        source,
                    },
                })?;
            arena.memory = Some(memory);
        }

        if let Some(memory) = &arena.memory {
            for entry in &arena.entries {
                if let Some(buffer) = &entry.buffer {
                    arena
                        .device
                        .bind_buffer_memory(buffer, memory, entry.placement.offset)
                        .map_err(Error::load("buffer binding"))?;
                }
            }
        }

        log::info!(
            "Arena {}: {} entries in {} bytes (memory type {})",
            arena.label,
            arena.entries.len(),
            arena.size,
            arena.memory_type_index
        );
        for entry in &arena.entries {
            log::debug!(
                "  {} at {}..{}",
                entry.name,
                entry.placement.offset,
                entry.placement.end()
            );
        }

        Ok(arena)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory(&self) -> Option<&D::Memory> {
        self.memory.as_ref()
    }

    pub fn entries(&self) -> &[ArenaEntry<D>] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Result<&ArenaEntry<D>> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| Error::UnknownBuffer {
                arena: self.label.clone(),
                name: name.to_string(),
            })
    }

    pub fn buffer(&self, name: &str) -> Result<&D::Buffer> {
        let entry = self.entry(name)?;
        entry.buffer.as_ref().ok_or_else(|| Error::UnknownBuffer {
            arena: self.label.clone(),
            name: name.to_string(),
        })
    }

    /// Copies `data` into the named buffer. The length has to match exactly.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let (memory, offset) = self.host_range(name, data.len() as u64)?;
        self.device
            .write_memory(memory, offset, data)
            .map_err(Error::frame("host write"))
    }

    pub fn read(&self, name: &str, out: &mut [u8]) -> Result<()> {
        let (memory, offset) = self.host_range(name, out.len() as u64)?;
        self.device
            .read_memory(memory, offset, out)
            .map_err(Error::frame("host read"))
    }

    fn host_range(&self, name: &str, len: u64) -> Result<(&D::Memory, vk::DeviceSize)> {
        let entry = self.entry(name)?;
        if entry.size != len {
            return Err(Error::BufferSizeMismatch {
                name: name.to_string(),
                expected: entry.size,
                actual: len,
            });
        }
        let memory = self.memory.as_ref().ok_or_else(|| Error::UnknownBuffer {
            arena: self.label.clone(),
            name: name.to_string(),
        })?;
        Ok((memory, entry.placement.offset))
    }
}

impl<D: ComputeDevice> Drop for DeviceMemoryArena<D> {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            if let Some(buffer) = entry.buffer {
                self.device.destroy_buffer(buffer);
            }
        }
        if let Some(memory) = self.memory.take() {
            self.device.free_memory(memory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostDevice, HostDeviceConfig};

    fn host_visible() -> vk::MemoryPropertyFlags {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    }

    fn assert_valid_layout(requirements: &[MemoryRequirements], placements: &[Placement]) {
        for (requirement, placement) in requirements.iter().zip(placements) {
            assert_eq!(placement.offset % requirement.alignment.max(1), 0);
            assert_eq!(placement.size, requirement.size);
        }
        for pair in placements.windows(2) {
            assert!(pair[0].end() <= pair[1].offset);
        }
    }

    #[test]
    fn three_buffer_layout() {
        let requirements = [
            MemoryRequirements::new(100, 16),
            MemoryRequirements::new(40, 8),
            MemoryRequirements::new(16, 4),
        ];
        let (placements, total) = place(&requirements);

        assert_valid_layout(&requirements, &placements);
        let offsets: Vec<_> = placements.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 104, 144]);
        assert_eq!(total, 160);
    }

    #[test]
    fn placements_are_aligned_and_disjoint() {
        let sizes = [1, 7, 256, 3, 64, 0, 129, 31, 4096, 5];
        let alignments = [1, 4, 256, 8, 64, 16, 2, 128, 4096, 32];
        for rotation in 0..sizes.len() {
            let requirements: Vec<_> = (0..sizes.len())
                .map(|i| {
                    let j = (i + rotation) % sizes.len();
                    MemoryRequirements::new(sizes[i], alignments[j])
                })
                .collect();
            let (placements, total) = place(&requirements);
            assert_valid_layout(&requirements, &placements);
            assert!(placements.last().unwrap().end() == total);
        }
    }

    #[test]
    fn buffers_share_one_allocation() {
        let device = Arc::new(HostDevice::new(HostDeviceConfig::default()));
        let arena = DeviceMemoryArena::allocate(
            device.clone(),
            "test",
            vec![
                ArenaRequest::buffer("a", 100, vk::BufferUsageFlags::STORAGE_BUFFER),
                ArenaRequest::buffer("b", 40, vk::BufferUsageFlags::UNIFORM_BUFFER),
                ArenaRequest::region("c", MemoryRequirements::new(16, 4)),
            ],
            host_visible(),
        )
        .unwrap();

        assert_eq!(device.live_allocations(), 1);
        assert!(arena.buffer("a").is_ok());
        assert!(arena.buffer("c").is_err());
        assert!(arena.entry("c").is_ok());
        assert!(arena.entry("missing").is_err());

        arena.write("b", &[7u8; 40]).unwrap();
        let mut out = [0u8; 40];
        arena.read("b", &mut out).unwrap();
        assert_eq!(out, [7u8; 40]);

        drop(arena);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn write_must_match_size() {
        let device = Arc::new(HostDevice::new(HostDeviceConfig::default()));
        let arena = DeviceMemoryArena::allocate(
            device,
            "test",
            vec![ArenaRequest::buffer("a", 16, vk::BufferUsageFlags::STORAGE_BUFFER)],
            host_visible(),
        )
        .unwrap();

        let err = arena.write("a", &[0u8; 12]).unwrap_err();
        assert!(matches!(
            err,
            Error::BufferSizeMismatch {
                expected: 16,
                actual: 12,
                ..
            }
        ));
    }

    #[test]
    fn exceeding_budget_is_out_of_memory() {
        let device = Arc::new(HostDevice::new(HostDeviceConfig {
            memory_budget: 1024,
            ..HostDeviceConfig::default()
        }));
        let result = DeviceMemoryArena::allocate(
            device.clone(),
            "big",
            vec![
                ArenaRequest::buffer("a", 1000, vk::BufferUsageFlags::STORAGE_BUFFER),
                ArenaRequest::buffer("b", 1000, vk::BufferUsageFlags::STORAGE_BUFFER),
            ],
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        );

        assert!(matches!(result, Err(Error::OutOfMemory { .. })));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn missing_memory_type_is_allocation_failure() {
        let device = Arc::new(HostDevice::new(HostDeviceConfig {
            memory_types: vec![vk::MemoryPropertyFlags::DEVICE_LOCAL],
            ..HostDeviceConfig::default()
        }));
        let result = DeviceMemoryArena::allocate(
            device,
            "upload",
            vec![ArenaRequest::buffer("a", 64, vk::BufferUsageFlags::STORAGE_BUFFER)],
            host_visible(),
        );

        assert!(matches!(result, Err(Error::AllocationFailed { .. })));
    }
}
