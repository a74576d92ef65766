use std::sync::Arc;

use ash::vk;
use rand::Rng;

use super::shader_types::{Hit, Params, Ray, Shape};
use super::technique::{FrameBuffer, Technique};
use crate::arena::{ArenaRequest, DeviceMemoryArena};
use crate::device::{ComputeDevice, MemoryRequirements};
use crate::error::{Error, Result};
use crate::scene::{SceneArrays, Vertex};

fn size_of<T>(count: usize) -> vk::DeviceSize {
    (std::mem::size_of::<T>() * count) as vk::DeviceSize
}

/// The buffers one frame reads and writes, in a host-visible and a device-local arena.
pub struct FrameResources<D: ComputeDevice> {
    host: DeviceMemoryArena<D>,
    device_local: DeviceMemoryArena<D>,
    num_rays: u32,
}

impl<D: ComputeDevice> FrameResources<D> {
    pub fn allocate(
        device: Arc<D>,
        arrays: &SceneArrays,
        num_rays: u32,
        technique: &Technique,
        trace_scratch: MemoryRequirements,
    ) -> Result<Self> {
        let expected = Self::expected_sizes(arrays, num_rays, technique, trace_scratch);
        let usage = |buffer: FrameBuffer| match buffer {
            FrameBuffer::Params => vk::BufferUsageFlags::UNIFORM_BUFFER,
            FrameBuffer::Color => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
            }
            _ => vk::BufferUsageFlags::STORAGE_BUFFER,
        };
        let requests = |host_visible: bool| -> Vec<ArenaRequest> {
            expected
                .iter()
                .filter(|(buffer, _)| buffer.is_host_visible() == host_visible)
                .map(|&(buffer, size)| ArenaRequest::buffer(buffer.name(), size, usage(buffer)))
                .collect()
        };

        let host = DeviceMemoryArena::allocate(
            device.clone(),
            "frame host",
            requests(true),
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let device_local = DeviceMemoryArena::allocate(
            device,
            "frame device",
            requests(false),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let resources = Self {
            host,
            device_local,
            num_rays,
        };
        resources.validate(&expected)?;
        resources.upload(arrays)?;
        Ok(resources)
    }

    fn expected_sizes(
        arrays: &SceneArrays,
        num_rays: u32,
        technique: &Technique,
        trace_scratch: MemoryRequirements,
    ) -> Vec<(FrameBuffer, vk::DeviceSize)> {
        let n = num_rays as usize;
        vec![
            (FrameBuffer::Params, size_of::<Params>(1)),
            (FrameBuffer::Color, size_of::<u32>(n)),
            (FrameBuffer::Vertices, size_of::<Vertex>(arrays.vertices.len())),
            (FrameBuffer::Indices, size_of::<u32>(arrays.indices.len())),
            (FrameBuffer::Shapes, size_of::<Shape>(arrays.shapes.len())),
            (FrameBuffer::Random, size_of::<u32>(n)),
            (FrameBuffer::CameraRays, size_of::<Ray>(n)),
            (FrameBuffer::SecondaryRays, size_of::<Ray>(n)),
            (FrameBuffer::SecondaryCount, size_of::<u32>(1)),
            (FrameBuffer::Hits, size_of::<Hit>(n)),
            (
                FrameBuffer::SecondaryHits,
                num_rays as u64 * technique.secondary_trace.output.stride(),
            ),
            (FrameBuffer::SecondaryIds, size_of::<u32>(n)),
            (
                FrameBuffer::Accumulation,
                num_rays as u64 * technique.accumulation_stride,
            ),
            (FrameBuffer::TraceScratch, trace_scratch.size),
        ]
    }

    fn arena(&self, buffer: FrameBuffer) -> &DeviceMemoryArena<D> {
        if buffer.is_host_visible() {
            &self.host
        } else {
            &self.device_local
        }
    }

    /// Every buffer has exactly the size the ray count implies and a placement that holds it.
    fn validate(&self, expected: &[(FrameBuffer, vk::DeviceSize)]) -> Result<()> {
        for &(buffer, size) in expected {
            let entry = self.arena(buffer).entry(buffer.name())?;
            if entry.size != size || entry.placement.size < size {
                return Err(Error::BufferSizeMismatch {
                    name: buffer.name().to_string(),
                    expected: size,
                    actual: entry.size.min(entry.placement.size),
                });
            }
        }
        Ok(())
    }

    fn upload(&self, arrays: &SceneArrays) -> Result<()> {
        self.host
            .write("vertices", bytemuck::cast_slice(&arrays.vertices))?;
        self.host
            .write("indices", bytemuck::cast_slice(&arrays.indices))?;
        self.host
            .write("shapes", bytemuck::cast_slice(&arrays.shapes))?;

        let mut rng = rand::thread_rng();
        let seeds: Vec<u32> = (0..self.num_rays).map(|_| rng.gen()).collect();
        self.host.write("random", bytemuck::cast_slice(&seeds))?;

        self.write_params(&Params::default())?;
        self.write_color(&vec![0; self.num_rays as usize])
    }

    pub fn num_rays(&self) -> u32 {
        self.num_rays
    }

    pub fn buffer(&self, buffer: FrameBuffer) -> Result<&D::Buffer> {
        self.arena(buffer).buffer(buffer.name())
    }

    pub fn write_params(&self, params: &Params) -> Result<()> {
        self.host
            .write(FrameBuffer::Params.name(), bytemuck::bytes_of(params))
    }

    pub fn read_params(&self) -> Result<Params> {
        let mut params = Params::default();
        self.host.read(
            FrameBuffer::Params.name(),
            bytemuck::bytes_of_mut(&mut params),
        )?;
        Ok(params)
    }

    pub fn write_color(&self, color: &[u32]) -> Result<()> {
        self.host
            .write(FrameBuffer::Color.name(), bytemuck::cast_slice(color))
    }

    pub fn read_color(&self) -> Result<Vec<u32>> {
        let mut color = vec![0u32; self.num_rays as usize];
        self.host.read(
            FrameBuffer::Color.name(),
            bytemuck::cast_slice_mut(&mut color),
        )?;
        Ok(color)
    }

    pub fn host_size(&self) -> vk::DeviceSize {
        self.host.size()
    }

    pub fn device_size(&self) -> vk::DeviceSize {
        self.device_local.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostDevice, HostDeviceConfig};
    use crate::scene::Scene;

    fn resources(technique: &Technique) -> (Arc<HostDevice>, FrameResources<HostDevice>) {
        let device = Arc::new(HostDevice::new(HostDeviceConfig::default()));
        let arrays = Scene::ground_with_boxes(2).flatten();
        let resources = FrameResources::allocate(
            device.clone(),
            &arrays,
            100,
            technique,
            MemoryRequirements::new(800, 16),
        )
        .unwrap();
        (device, resources)
    }

    #[test]
    fn buffers_are_sized_from_ray_count() {
        let technique = Technique::ambient_occlusion();
        let (device, resources) = resources(&technique);

        assert_eq!(device.live_allocations(), 2);
        assert_eq!(resources.buffer(FrameBuffer::CameraRays).unwrap().size(), 100 * 32);
        assert_eq!(resources.buffer(FrameBuffer::Hits).unwrap().size(), 100 * 16);
        assert_eq!(resources.buffer(FrameBuffer::SecondaryHits).unwrap().size(), 100 * 4);
        assert_eq!(resources.buffer(FrameBuffer::Accumulation).unwrap().size(), 100 * 8);
        assert_eq!(resources.buffer(FrameBuffer::Shapes).unwrap().size(), 3 * 16);
        assert_eq!(resources.read_color().unwrap(), vec![0; 100]);
    }

    #[test]
    fn color_upload_must_match() {
        let technique = Technique::path_trace();
        let (_, resources) = resources(&technique);

        let err = resources.write_color(&[0; 99]).unwrap_err();
        assert!(matches!(err, Error::BufferSizeMismatch { .. }));
        resources.write_color(&[7; 100]).unwrap();
        assert_eq!(resources.read_color().unwrap()[99], 7);
    }
}
