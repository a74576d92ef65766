use std::sync::Arc;

use ash::vk;
use ultraviolet::Vec3;

use frame_tracer::accel::{OutputType, QueryType, TraceDesc, TraceFlags};
use frame_tracer::arena::{ArenaRequest, DeviceMemoryArena};
use frame_tracer::host::{HostDevice, HostDeviceConfig, HostIntersector};
use frame_tracer::{
    AccelerationStructureBuilder, ComputeDevice, Hit, IntersectionEngine, Ray, Scene, INVALID_ID,
};

fn host_visible() -> vk::MemoryPropertyFlags {
    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
}

/// One ray straight at the triangle's interior, one that passes beside it.
fn beside_and_through() -> [Ray; 2] {
    [
        Ray::new(Vec3::new(0.0, 0.0, 2.0), Vec3::new(0.0, 0.0, -1.0), 0.0, 100.0),
        Ray::new(Vec3::new(5.0, 0.0, 2.0), Vec3::new(0.0, 0.0, -1.0), 0.0, 100.0),
    ]
}

struct TriangleTracer {
    device: Arc<HostDevice>,
    engine: Arc<HostIntersector>,
}

impl TriangleTracer {
    fn new() -> Self {
        Self {
            device: Arc::new(HostDevice::new(HostDeviceConfig::default())),
            engine: Arc::new(HostIntersector::default()),
        }
    }

    /// Traces `rays` against the single triangle scene and returns the raw
    /// output and the rays as they are after the trace.
    fn trace(
        &self,
        rays: &[Ray],
        query: QueryType,
        output: OutputType,
        flags: TraceFlags,
    ) -> (Vec<u8>, Vec<Ray>) {
        let structures = AccelerationStructureBuilder::new(self.device.clone(), self.engine.clone())
            .build(&Scene::single_triangle().meshes)
            .unwrap();
        let top_level = structures.top_level().unwrap();

        let ray_count = rays.len() as u32;
        let scratch = self.engine.trace_scratch_requirements(top_level, ray_count);
        let output_size = rays.len() as u64 * output.stride();
        let arena = DeviceMemoryArena::allocate(
            self.device.clone(),
            "tracer",
            vec![
                ArenaRequest::buffer(
                    "rays",
                    std::mem::size_of_val(rays) as u64,
                    vk::BufferUsageFlags::STORAGE_BUFFER,
                ),
                ArenaRequest::buffer("hits", output_size, vk::BufferUsageFlags::STORAGE_BUFFER),
                ArenaRequest::buffer("scratch", scratch.size, vk::BufferUsageFlags::STORAGE_BUFFER),
            ],
            host_visible(),
        )
        .unwrap();
        arena.write("rays", bytemuck::cast_slice(rays)).unwrap();

        let desc = TraceDesc {
            query,
            output,
            flags,
            ray_count,
            rays: arena.buffer("rays").unwrap(),
            hits: arena.buffer("hits").unwrap(),
            scratch: arena.buffer("scratch").unwrap(),
        };
        let mut commands = self.device.begin_commands().unwrap();
        self.engine
            .record_trace(top_level, &desc, &mut commands)
            .unwrap();
        self.device.end_commands(&mut commands).unwrap();
        self.device.submit_and_wait(&commands).unwrap();
        self.device.free_commands(commands);

        let mut hits = vec![0u8; output_size as usize];
        arena.read("hits", &mut hits).unwrap();
        let mut traced = rays.to_vec();
        arena
            .read("rays", bytemuck::cast_slice_mut(&mut traced))
            .unwrap();
        (hits, traced)
    }
}

#[test]
fn closest_hit_reports_instance_primitive_and_barycentrics() {
    let tracer = TriangleTracer::new();
    let (bytes, _) = tracer.trace(
        &beside_and_through(),
        QueryType::Intersect,
        OutputType::FullHit,
        TraceFlags::NONE,
    );
    let hits: Vec<Hit> = bytes
        .chunks_exact(std::mem::size_of::<Hit>())
        .map(bytemuck::pod_read_unaligned)
        .collect();

    assert_eq!(hits[0].instance_id, 0);
    assert_eq!(hits[0].primitive_id, 0);
    assert!((hits[0].uv[0] - 0.25).abs() < 1e-5);
    assert!((hits[0].uv[1] - 0.5).abs() < 1e-5);

    assert!(hits[1].is_miss());
    assert_eq!(hits[1].primitive_id, INVALID_ID);
}

#[test]
fn occlusion_writes_instance_ids_only() {
    let tracer = TriangleTracer::new();
    let (bytes, _) = tracer.trace(
        &beside_and_through(),
        QueryType::Occluded,
        OutputType::InstanceIdOnly,
        TraceFlags::NONE,
    );
    let ids: Vec<u32> = bytes
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned)
        .collect();

    assert_eq!(ids, vec![0, INVALID_ID]);
}

#[test]
fn update_max_t_shortens_hit_rays_only() {
    let tracer = TriangleTracer::new();
    let (_, rays) = tracer.trace(
        &beside_and_through(),
        QueryType::Intersect,
        OutputType::FullHit,
        TraceFlags::UPDATE_MAX_T,
    );

    assert!((rays[0].max_t - 2.0).abs() < 1e-4);
    assert_eq!(rays[1].max_t, 100.0);
}

#[test]
fn segment_shorter_than_the_distance_misses() {
    let tracer = TriangleTracer::new();
    let short = [Ray::new(
        Vec3::new(0.0, 0.0, 2.0),
        Vec3::new(0.0, 0.0, -1.0),
        0.0,
        1.5,
    )];
    let (bytes, _) = tracer.trace(
        &short,
        QueryType::Occluded,
        OutputType::InstanceIdOnly,
        TraceFlags::NONE,
    );

    assert_eq!(bytemuck::pod_read_unaligned::<u32>(&bytes), INVALID_ID);
}

#[test]
fn structures_are_destroyed_with_the_scene() {
    let tracer = TriangleTracer::new();
    let structures = AccelerationStructureBuilder::new(tracer.device.clone(), tracer.engine.clone())
        .build(&Scene::ground_with_boxes(2).meshes)
        .unwrap();

    // three meshes and the top level
    assert_eq!(tracer.engine.live_structures(), 4);
    assert_eq!(structures.bottom_level().len(), 3);
    assert!(structures.storage_size() > 0);

    drop(structures);
    assert_eq!(tracer.engine.live_structures(), 0);
    assert_eq!(tracer.device.live_allocations(), 0);
}
