use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use ultraviolet::{Mat4, Vec3, Vec4};

use super::device::{lock, HostBuffer, HostCommands, HostDevice, HostMemory};
use crate::accel::{
    BuildInfo, BuildInput, BuildOperation, EngineError, IntersectionEngine, OutputType, QueryType,
    StructureKind, TraceDesc, TraceFlags,
};
use crate::device::{DeviceError, MemoryRequirements};
use crate::render::shader_types::{Hit, Ray};

const STORAGE_ALIGNMENT: u64 = 256;
const SCRATCH_ALIGNMENT: u64 = 128;

#[derive(Debug, Clone, Copy)]
struct Aabb {
    min: Vec3,
    max: Vec3,
}

impl Aabb {
    fn empty() -> Self {
        Self {
            min: Vec3::broadcast(f32::MAX),
            max: Vec3::broadcast(f32::MIN),
        }
    }

    fn grow(&mut self, point: Vec3) {
        self.min = self.min.min_by_component(point);
        self.max = self.max.max_by_component(point);
    }

    fn transformed(&self, object_to_world: &Mat4) -> Aabb {
        let mut out = Aabb::empty();
        for corner in 0..8 {
            let pick = |bit: usize, lo: f32, hi: f32| if corner & bit == 0 { lo } else { hi };
            let point = Vec3::new(
                pick(1, self.min.x, self.max.x),
                pick(2, self.min.y, self.max.y),
                pick(4, self.min.z, self.max.z),
            );
            out.grow(object_to_world.transform_point3(point));
        }
        out
    }

    /// Slab test against the ray segment `[min_t, max_t]`.
    fn intersects(&self, origin: Vec3, direction: Vec3, min_t: f32, max_t: f32) -> bool {
        let origin: [f32; 3] = origin.into();
        let direction: [f32; 3] = direction.into();
        let lo: [f32; 3] = self.min.into();
        let hi: [f32; 3] = self.max.into();

        let (mut near, mut far) = (min_t, max_t);
        for axis in 0..3 {
            if direction[axis].abs() < 1e-12 {
                if origin[axis] < lo[axis] || origin[axis] > hi[axis] {
                    return false;
                }
                continue;
            }
            let t0 = (lo[axis] - origin[axis]) / direction[axis];
            let t1 = (hi[axis] - origin[axis]) / direction[axis];
            near = near.max(t0.min(t1));
            far = far.min(t0.max(t1));
            if near > far {
                return false;
            }
        }
        true
    }
}

struct Triangle {
    v0: Vec3,
    edge1: Vec3,
    edge2: Vec3,
}

impl Triangle {
    /// Two-sided Möller-Trumbore. `u` weights the second vertex, `v` the third.
    fn intersect(&self, origin: Vec3, direction: Vec3) -> Option<(f32, f32, f32)> {
        let p = direction.cross(self.edge2);
        let det = self.edge1.dot(p);
        if det.abs() < 1e-9 {
            return None;
        }
        let inv_det = 1.0 / det;
        let s = origin - self.v0;
        let u = s.dot(p) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let q = s.cross(self.edge1);
        let v = direction.dot(q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        Some((self.edge2.dot(q) * inv_det, u, v))
    }
}

struct PlacedInstance {
    instance_id: u32,
    world_to_object: Mat4,
    bounds: Aabb,
    triangles: Arc<Geometry>,
}

enum Geometry {
    Triangles { triangles: Vec<Triangle>, bounds: Aabb },
    Instances(Vec<PlacedInstance>),
}

impl Geometry {
    fn from_positions(positions: &[[f32; 3]], indices: &[u32]) -> Result<Geometry, DeviceError> {
        let mut bounds = Aabb::empty();
        let mut triangles = Vec::with_capacity(indices.len() / 3);
        for triangle in indices.chunks_exact(3) {
            let mut corners = [Vec3::zero(); 3];
            for (corner, &index) in corners.iter_mut().zip(triangle) {
                let position = positions
                    .get(index as usize)
                    .ok_or(DeviceError::OutOfRange {
                        offset: index as u64,
                        len: 1,
                        size: positions.len() as u64,
                    })?;
                *corner = Vec3::from(*position);
                bounds.grow(*corner);
            }
            triangles.push(Triangle {
                v0: corners[0],
                edge1: corners[1] - corners[0],
                edge2: corners[2] - corners[0],
            });
        }
        Ok(Geometry::Triangles { triangles, bounds })
    }
}

/// Row-major 3x4 to a column-major matrix.
fn transform_matrix(transform: &[f32; 12]) -> Mat4 {
    let m = transform;
    Mat4::new(
        Vec4::new(m[0], m[4], m[8], 0.0),
        Vec4::new(m[1], m[5], m[9], 0.0),
        Vec4::new(m[2], m[6], m[10], 0.0),
        Vec4::new(m[3], m[7], m[11], 1.0),
    )
}

struct HostStructureState {
    id: u64,
    kind: StructureKind,
    max_primitives: u32,
    storage: Mutex<Option<(HostMemory, u64)>>,
    scratch: Mutex<Option<(HostMemory, u64)>>,
    geometry: Mutex<Option<Arc<Geometry>>>,
}

impl HostStructureState {
    fn built(&self) -> Result<Arc<Geometry>, DeviceError> {
        lock(&self.geometry)?
            .clone()
            .ok_or_else(|| DeviceError::DeviceLost(format!("structure {} is not built", self.id)))
    }

    fn is_bound(slot: &Mutex<Option<(HostMemory, u64)>>) -> bool {
        slot.lock().map(|bound| bound.is_some()).unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct HostStructure(Arc<HostStructureState>);

impl HostStructure {
    pub fn kind(&self) -> StructureKind {
        self.0.kind
    }
}

impl std::fmt::Debug for HostStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStructure")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .finish()
    }
}

/// Brute-force traversal over per-instance bounds, run on the host queue.
#[derive(Default)]
pub struct HostIntersector {
    next_id: AtomicU64,
    live_structures: AtomicUsize,
}

impl HostIntersector {
    pub fn live_structures(&self) -> usize {
        self.live_structures.load(Ordering::SeqCst)
    }

    fn bind(
        slot: &Mutex<Option<(HostMemory, u64)>>,
        requirements: MemoryRequirements,
        memory: &HostMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), EngineError> {
        if offset % requirements.alignment != 0 || offset + requirements.size > memory.size() {
            return Err(DeviceError::OutOfRange {
                offset,
                len: requirements.size,
                size: memory.size(),
            }
            .into());
        }
        *lock(slot)? = Some((memory.clone(), offset));
        Ok(())
    }

    fn check_trace(
        desc: &TraceDesc<'_, HostDevice>,
        required_scratch: u64,
    ) -> Result<(), EngineError> {
        let rays = desc.ray_count as u64 * std::mem::size_of::<Ray>() as u64;
        let hits = desc.ray_count as u64 * desc.output.stride();
        for (name, required, actual) in [
            ("ray", rays, desc.rays.size()),
            ("hit", hits, desc.hits.size()),
            ("trace scratch", required_scratch, desc.scratch.size()),
        ] {
            if actual < required {
                return Err(EngineError::BufferTooSmall {
                    name,
                    required,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn trace_operation(
        &self,
        structure: &HostStructure,
        desc: &TraceDesc<'_, HostDevice>,
        count: Option<&HostBuffer>,
        commands: &mut HostCommands,
    ) -> Result<(), EngineError> {
        if structure.0.kind != StructureKind::TopLevel {
            return Err(EngineError::WrongInput {
                kind: structure.0.kind,
                input: "rays",
            });
        }
        if !HostStructureState::is_bound(&structure.0.storage) {
            return Err(EngineError::StructureNotBound("top-level storage"));
        }
        let required_scratch = self.trace_scratch_requirements(structure, desc.ray_count).size;
        Self::check_trace(desc, required_scratch)?;

        let state = structure.0.clone();
        let rays = desc.rays.clone();
        let hits = desc.hits.clone();
        let scratch = desc.scratch.clone();
        let count = count.cloned();
        let capacity = desc.ray_count;
        let (query, output, flags) = (desc.query, desc.output, desc.flags);

        let label = if count.is_some() {
            "trace indirect"
        } else {
            "trace"
        };
        commands.push_host(
            label,
            Arc::new(move || -> Result<(), DeviceError> {
                let geometry = state.built()?;
                let ray_count = match &count {
                    Some(count) => count
                        .read::<u32>()?
                        .first()
                        .copied()
                        .unwrap_or(0)
                        .min(capacity),
                    None => capacity,
                };

                let mut batch: Vec<Ray> = rays.read()?;
                batch.truncate(ray_count as usize);
                let results: Vec<Option<(Hit, f32)>> = batch
                    .iter()
                    .map(|ray| trace_ray(&geometry, ray, query))
                    .collect();

                let distances: Vec<[f32; 2]> = results
                    .iter()
                    .map(|result| [result.map_or(f32::INFINITY, |(_, t)| t), 0.0])
                    .collect();
                scratch.write_at(0, &distances)?;

                match output {
                    OutputType::FullHit => {
                        let out: Vec<Hit> = results
                            .iter()
                            .map(|result| result.map_or(Hit::MISS, |(hit, _)| hit))
                            .collect();
                        hits.write_at(0, &out)?;
                    }
                    OutputType::InstanceIdOnly => {
                        let out: Vec<u32> = results
                            .iter()
                            .map(|result| result.map_or(Hit::MISS, |(hit, _)| hit).instance_id)
                            .collect();
                        hits.write_at(0, &out)?;
                    }
                }

                if flags.contains(TraceFlags::UPDATE_MAX_T) {
                    for (ray, result) in batch.iter_mut().zip(&results) {
                        if let Some((_, t)) = result {
                            ray.max_t = *t;
                        }
                    }
                    rays.write_at(0, &batch)?;
                }
                Ok(())
            }),
        );
        Ok(())
    }
}

fn trace_ray(geometry: &Geometry, ray: &Ray, query: QueryType) -> Option<(Hit, f32)> {
    let Geometry::Instances(instances) = geometry else {
        return None;
    };
    let (origin, direction) = (ray.origin(), ray.direction());
    let mut closest: Option<(Hit, f32)> = None;

    for instance in instances {
        let max_t = closest.map_or(ray.max_t, |(_, t)| t);
        if !instance.bounds.intersects(origin, direction, ray.min_t, max_t) {
            continue;
        }
        let Geometry::Triangles { triangles, .. } = &*instance.triangles else {
            continue;
        };
        let local_origin = instance.world_to_object.transform_point3(origin);
        let local_direction = instance.world_to_object.transform_vec3(direction);

        for (primitive_id, triangle) in triangles.iter().enumerate() {
            let Some((t, u, v)) = triangle.intersect(local_origin, local_direction) else {
                continue;
            };
            let max_t = closest.map_or(ray.max_t, |(_, t)| t);
            if t < ray.min_t || t > max_t {
                continue;
            }
            let hit = Hit {
                instance_id: instance.instance_id,
                primitive_id: primitive_id as u32,
                uv: [u, v],
            };
            closest = Some((hit, t));
            if query == QueryType::Occluded {
                return closest;
            }
        }
    }
    closest
}

impl IntersectionEngine<HostDevice> for HostIntersector {
    type Structure = HostStructure;

    fn create_structure(
        &self,
        kind: StructureKind,
        max_primitives: u32,
    ) -> Result<HostStructure, EngineError> {
        self.live_structures.fetch_add(1, Ordering::SeqCst);
        Ok(HostStructure(Arc::new(HostStructureState {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            max_primitives,
            storage: Mutex::new(None),
            scratch: Mutex::new(None),
            geometry: Mutex::new(None),
        })))
    }

    fn destroy_structure(&self, _structure: HostStructure) {
        self.live_structures.fetch_sub(1, Ordering::SeqCst);
    }

    fn storage_requirements(&self, structure: &HostStructure) -> MemoryRequirements {
        let primitives = structure.0.max_primitives as u64;
        let size = match structure.0.kind {
            StructureKind::BottomLevel => 64 + primitives * 48,
            StructureKind::TopLevel => 128 + primitives * 64,
        };
        MemoryRequirements::new(crate::arena::align_up(size, STORAGE_ALIGNMENT), STORAGE_ALIGNMENT)
    }

    fn build_scratch_requirements(&self, structure: &HostStructure) -> MemoryRequirements {
        let primitives = structure.0.max_primitives as u64;
        let size = match structure.0.kind {
            StructureKind::BottomLevel => primitives * 32 + 256,
            StructureKind::TopLevel => primitives * 16 + 256,
        };
        MemoryRequirements::new(size, SCRATCH_ALIGNMENT)
    }

    fn trace_scratch_requirements(
        &self,
        _structure: &HostStructure,
        ray_count: u32,
    ) -> MemoryRequirements {
        MemoryRequirements::new((ray_count as u64 * 8).max(16), 16)
    }

    fn bind_storage(
        &self,
        structure: &HostStructure,
        memory: &HostMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), EngineError> {
        let requirements = self.storage_requirements(structure);
        Self::bind(&structure.0.storage, requirements, memory, offset)
    }

    fn bind_scratch(
        &self,
        structure: &HostStructure,
        memory: &HostMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), EngineError> {
        let requirements = self.build_scratch_requirements(structure);
        Self::bind(&structure.0.scratch, requirements, memory, offset)
    }

    fn storage_memory(&self, structure: &HostStructure) -> Option<HostMemory> {
        let bound = structure.0.storage.lock().ok()?;
        bound.as_ref().map(|(memory, _)| memory.clone())
    }

    fn record_build(
        &self,
        structure: &HostStructure,
        info: &BuildInfo<'_, HostDevice, HostStructure>,
        commands: &mut HostCommands,
    ) -> Result<(), EngineError> {
        let state = &structure.0;
        if info.operation == BuildOperation::Update {
            return Err(EngineError::NotImplemented("structure update"));
        }
        if !HostStructureState::is_bound(&state.storage) {
            return Err(EngineError::StructureNotBound("storage"));
        }
        if !HostStructureState::is_bound(&state.scratch) {
            return Err(EngineError::StructureNotBound("scratch"));
        }
        if !info.input.matches(state.kind) {
            return Err(EngineError::WrongInput {
                kind: state.kind,
                input: info.input.name(),
            });
        }
        let primitives = info.input.primitive_count();
        if primitives > state.max_primitives {
            return Err(EngineError::TooManyPrimitives {
                max: state.max_primitives,
                actual: primitives,
            });
        }

        let target = state.clone();
        let build: Box<dyn Fn() -> Result<Geometry, DeviceError> + Send + Sync> = match &info.input
        {
            BuildInput::CpuMesh { positions, indices } => {
                let positions = positions.to_vec();
                let indices = indices.to_vec();
                Box::new(move || Geometry::from_positions(&positions, &indices))
            }
            BuildInput::GpuMesh {
                vertices,
                vertex_stride,
                vertex_count,
                indices,
                index_count,
            } => {
                let (vertices, indices) = ((*vertices).clone(), (*indices).clone());
                let (stride, vertex_count, index_count) =
                    (*vertex_stride as usize, *vertex_count as usize, *index_count as usize);
                Box::new(move || {
                    let bytes = vertices.read_bytes()?;
                    let positions: Vec<[f32; 3]> = bytes
                        .chunks(stride)
                        .take(vertex_count)
                        .filter_map(|vertex| {
                            let position = vertex.get(..12)?;
                            Some(bytemuck::pod_read_unaligned::<[f32; 3]>(position))
                        })
                        .collect();
                    let mut indices = indices.read::<u32>()?;
                    indices.truncate(index_count);
                    Geometry::from_positions(&positions, &indices)
                })
            }
            BuildInput::Instances(instances) => {
                let top_memory = self.storage_memory(structure);
                let mut placed = Vec::with_capacity(instances.len());
                for instance in instances.iter() {
                    let memory = self.storage_memory(&instance.structure);
                    if memory.is_none() {
                        return Err(EngineError::StructureNotBound("bottom-level storage"));
                    }
                    if memory != top_memory {
                        return Err(EngineError::MixedAllocations);
                    }
                    placed.push((
                        instance.instance_id,
                        transform_matrix(&instance.transform),
                        instance.structure.0.clone(),
                    ));
                }
                Box::new(move || {
                    let mut out = Vec::with_capacity(placed.len());
                    for (instance_id, object_to_world, bottom_level) in &placed {
                        let triangles = bottom_level.built()?;
                        let Geometry::Triangles { bounds, .. } = &*triangles else {
                            return Err(DeviceError::DeviceLost(
                                "instance references a top-level structure".into(),
                            ));
                        };
                        out.push(PlacedInstance {
                            instance_id: *instance_id,
                            world_to_object: object_to_world.inversed(),
                            bounds: bounds.transformed(object_to_world),
                            triangles: triangles.clone(),
                        });
                    }
                    Ok(Geometry::Instances(out))
                })
            }
        };

        commands.push_host(
            "build",
            Arc::new(move || -> Result<(), DeviceError> {
                let geometry = build()?;
                *lock(&target.geometry)? = Some(Arc::new(geometry));
                Ok(())
            }),
        );
        Ok(())
    }

    fn record_trace(
        &self,
        structure: &HostStructure,
        desc: &TraceDesc<'_, HostDevice>,
        commands: &mut HostCommands,
    ) -> Result<(), EngineError> {
        self.trace_operation(structure, desc, None, commands)
    }

    fn record_trace_indirect(
        &self,
        structure: &HostStructure,
        desc: &TraceDesc<'_, HostDevice>,
        count: &HostBuffer,
        commands: &mut HostCommands,
    ) -> Result<(), EngineError> {
        if count.size() < 4 {
            return Err(EngineError::BufferTooSmall {
                name: "ray count",
                required: 4,
                actual: count.size(),
            });
        }
        self.trace_operation(structure, desc, Some(count), commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_barycentrics() {
        let triangle = Triangle {
            v0: Vec3::new(-1.0, -1.0, 0.0),
            edge1: Vec3::new(2.0, 0.0, 0.0),
            edge2: Vec3::new(1.0, 2.0, 0.0),
        };
        let (t, u, v) = triangle
            .intersect(Vec3::new(0.0, 0.0, 2.0), Vec3::new(0.0, 0.0, -1.0))
            .unwrap();
        assert!((t - 2.0).abs() < 1e-6);
        assert!((u - 0.25).abs() < 1e-6);
        assert!((v - 0.5).abs() < 1e-6);

        // back faces hit too
        assert!(triangle
            .intersect(Vec3::new(0.0, 0.0, -2.0), Vec3::new(0.0, 0.0, 1.0))
            .is_some());
        assert!(triangle
            .intersect(Vec3::new(5.0, 0.0, 2.0), Vec3::new(0.0, 0.0, -1.0))
            .is_none());
    }

    #[test]
    fn row_major_translation() {
        let mut transform = crate::accel::IDENTITY_TRANSFORM;
        transform[3] = 4.0;
        transform[11] = -2.0;
        let matrix = transform_matrix(&transform);
        let moved = matrix.transform_point3(Vec3::zero());
        assert_eq!(moved, Vec3::new(4.0, 0.0, -2.0));
    }

    #[test]
    fn slab_test_respects_segment() {
        let bounds = Aabb {
            min: Vec3::new(-1.0, -1.0, -1.0),
            max: Vec3::new(1.0, 1.0, 1.0),
        };
        let origin = Vec3::new(0.0, 0.0, 5.0);
        let direction = Vec3::new(0.0, 0.0, -1.0);
        assert!(bounds.intersects(origin, direction, 0.0, 10.0));
        assert!(!bounds.intersects(origin, direction, 0.0, 3.0));
        assert!(!bounds.intersects(origin, -direction, 0.0, 10.0));
    }

    #[test]
    fn oversized_build_is_rejected() {
        let device = HostDevice::new(super::super::HostDeviceConfig::default());
        let engine = HostIntersector::default();
        let structure = engine.create_structure(StructureKind::BottomLevel, 1).unwrap();
        let memory = {
            use crate::device::ComputeDevice;
            device.allocate_memory(4096, 0).unwrap()
        };
        engine.bind_storage(&structure, &memory, 0).unwrap();
        engine.bind_scratch(&structure, &memory, 1024).unwrap();

        let positions = [[0.0; 3]; 4];
        let indices = [0, 1, 2, 0, 2, 3];
        let info = BuildInfo {
            operation: BuildOperation::Build,
            input: BuildInput::CpuMesh {
                positions: &positions,
                indices: &indices,
            },
        };
        let mut commands = HostCommands::default();
        assert!(matches!(
            engine.record_build(&structure, &info, &mut commands),
            Err(EngineError::TooManyPrimitives { max: 1, actual: 2 })
        ));
        assert!(commands.labels().is_empty());
        engine.destroy_structure(structure);
    }
}
