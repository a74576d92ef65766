//! Host versions of the compute stages in `assets/shaders/`, looked up by shader name.

use std::f32::consts::PI;

use bytemuck::Pod;
use ultraviolet::{Vec3, Vec4};

use super::device::HostBuffer;
use crate::device::DeviceError;
use crate::render::shader_types::{pack_color, Hit, Params, Ray, Shape, INVALID_ID};
use crate::scene::Vertex;

pub const GROUP_SIZE: usize = 64;
const SURFACE_EPSILON: f32 = 1e-3;
const SKY_COLOR: Vec3 = Vec3::new(0.8, 0.85, 1.0);
const AMBIENT: f32 = 0.25;
const RAY_SIZE: u64 = std::mem::size_of::<Ray>() as u64;

pub type Kernel = fn(&KernelArgs<'_>) -> Result<(), DeviceError>;

pub struct KernelArgs<'a> {
    pub buffers: &'a [HostBuffer],
    pub groups: [u32; 3],
}

impl<'a> KernelArgs<'a> {
    fn invocations(&self) -> usize {
        self.groups.iter().map(|&g| g as usize).product::<usize>() * GROUP_SIZE
    }

    fn read<T: Pod>(&self, slot: usize) -> Result<Vec<T>, DeviceError> {
        self.buffers[slot].read()
    }

    fn first<T: Pod>(&self, slot: usize) -> Result<T, DeviceError> {
        self.read::<T>(slot)?
            .first()
            .copied()
            .ok_or(DeviceError::OutOfRange {
                offset: 0,
                len: std::mem::size_of::<T>() as u64,
                size: self.buffers[slot].size(),
            })
    }
}

/// Returns the kernel and the number of bindings its shader declares.
pub fn lookup(shader_name: &str) -> Option<(Kernel, usize)> {
    let entry = match shader_name {
        "camera_rays" => (camera_rays as Kernel, 6),
        "pt_camera_rays" => (pt_camera_rays as Kernel, 5),
        "clear_counter" => (clear_counter as Kernel, 1),
        "ao_rays" => (ao_rays as Kernel, 10),
        "ao_rays_resolve" => (ao_rays_resolve as Kernel, 5),
        "bounce_rays" => (bounce_rays as Kernel, 12),
        "shade" => (shade as Kernel, 9),
        _ => return None,
    };
    Some(entry)
}

fn hash(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

/// Uniform in [0, 1) for one pixel seed, sample index and sampling dimension.
pub fn random_float(seed: u32, sample: u32, dimension: u32) -> f32 {
    let h = hash(seed ^ hash(sample.wrapping_mul(0x9e37_79b9) ^ hash(dimension)));
    (h >> 8) as f32 / (1u32 << 24) as f32
}

pub fn camera_ray(params: &Params, pixel: u32, seed: u32) -> Ray {
    let width = params.width().max(1);
    let height = params.height().max(1);
    let sample = params.sample_index();

    let (jitter_x, jitter_y) = if sample == 0 {
        (0.5, 0.5)
    } else {
        (random_float(seed, sample, 0), random_float(seed, sample, 1))
    };
    let x = ((pixel % width) as f32 + jitter_x) / width as f32 * 2.0 - 1.0;
    let y = ((pixel / width) as f32 + jitter_y) / height as f32 * 2.0 - 1.0;

    let inverse = params.view_projection_inverse();
    let unproject = |depth: f32| {
        let p = inverse * Vec4::new(x, y, depth, 1.0);
        Vec3::new(p.x, p.y, p.z) / p.w
    };
    let direction = (unproject(1.0) - unproject(0.0)).normalized();
    let origin = Vec3::new(params.eye[0], params.eye[1], params.eye[2]);

    Ray::new(origin, direction, 0.0, params.near_far[1])
}

fn orthonormal_basis(normal: Vec3) -> (Vec3, Vec3) {
    let up = if normal.x.abs() > 0.9 {
        Vec3::unit_y()
    } else {
        Vec3::unit_x()
    };
    let tangent = up.cross(normal).normalized();
    let bitangent = normal.cross(tangent);
    (tangent, bitangent)
}

pub fn cosine_direction(normal: Vec3, u1: f32, u2: f32) -> Vec3 {
    let radius = u1.sqrt();
    let phi = 2.0 * PI * u2;
    let (tangent, bitangent) = orthonormal_basis(normal);
    (tangent * (radius * phi.cos())
        + bitangent * (radius * phi.sin())
        + normal * (1.0 - u1).max(0.0).sqrt())
    .normalized()
}

pub struct Surface {
    pub position: Vec3,
    pub normal: Vec3,
    pub color: Vec3,
}

/// Interpolates the hit triangle's vertices. Instances are assumed to use identity transforms.
pub fn surface(
    hit: &Hit,
    shapes: &[Shape],
    indices: &[u32],
    vertices: &[Vertex],
) -> Option<Surface> {
    let shape = shapes.get(hit.instance_id as usize)?;
    if hit.primitive_id >= shape.count {
        return None;
    }
    let first = shape.first_index as usize + hit.primitive_id as usize * 3;
    let triangle = indices.get(first..first + 3)?;
    let vertex = |k: usize| vertices.get(shape.base_vertex as usize + triangle[k] as usize);
    let (v0, v1, v2) = (vertex(0)?, vertex(1)?, vertex(2)?);

    let [u, v] = hit.uv;
    let w = 1.0 - u - v;
    let lerp = |a: [f32; 3], b: [f32; 3], c: [f32; 3]| {
        Vec3::from(a) * w + Vec3::from(b) * u + Vec3::from(c) * v
    };

    Some(Surface {
        position: lerp(v0.position, v1.position, v2.position),
        normal: lerp(v0.normal, v1.normal, v2.normal).normalized(),
        color: lerp(v0.color, v1.color, v2.color),
    })
}

fn write_camera_rays(
    args: &KernelArgs,
    rays_slot: usize,
    random_slot: usize,
) -> Result<Params, DeviceError> {
    let params: Params = args.first(0)?;
    let random: Vec<u32> = args.read(random_slot)?;
    let capacity = (args.buffers[rays_slot].size() / RAY_SIZE) as usize;
    let pixels = (params.width() as usize).saturating_mul(params.height() as usize);
    let count = args.invocations().min(capacity).min(random.len()).min(pixels);

    let rays: Vec<Ray> = (0..count)
        .map(|i| camera_ray(&params, i as u32, random[i]))
        .collect();
    args.buffers[rays_slot].write_at(0, &rays)?;
    Ok(params)
}

/// bindings: params, rays, count, accumulation, color, random
fn camera_rays(args: &KernelArgs) -> Result<(), DeviceError> {
    let params = write_camera_rays(args, 1, 5)?;
    args.buffers[2].write_at(0, &[0u32])?;
    if params.sample_index() == 0 {
        args.buffers[3].fill_zero()?;
        args.buffers[4].fill_zero()?;
    }
    Ok(())
}

/// bindings: params, rays, accumulation, color, random
fn pt_camera_rays(args: &KernelArgs) -> Result<(), DeviceError> {
    let params = write_camera_rays(args, 1, 4)?;
    if params.sample_index() == 0 {
        args.buffers[2].fill_zero()?;
        args.buffers[3].fill_zero()?;
    }
    Ok(())
}

/// bindings: count
fn clear_counter(args: &KernelArgs) -> Result<(), DeviceError> {
    args.buffers[0].write_at(0, &[0u32])
}

/// bindings: params, ids, secondary rays, count, hits, camera rays, random,
/// shapes, indices, vertices
fn ao_rays(args: &KernelArgs) -> Result<(), DeviceError> {
    spawn_secondary_rays(args, false)
}

/// bindings: as `ao_rays`, then accumulation, color
fn bounce_rays(args: &KernelArgs) -> Result<(), DeviceError> {
    spawn_secondary_rays(args, true)
}

fn spawn_secondary_rays(args: &KernelArgs, path_trace: bool) -> Result<(), DeviceError> {
    let params: Params = args.first(0)?;
    let hits: Vec<Hit> = args.read(4)?;
    let camera: Vec<Ray> = args.read(5)?;
    let random: Vec<u32> = args.read(6)?;
    let shapes: Vec<Shape> = args.read(7)?;
    let indices: Vec<u32> = args.read(8)?;
    let vertices: Vec<Vertex> = args.read(9)?;

    let capacity = (args.buffers[2].size() / RAY_SIZE) as usize;
    let start = args.first::<u32>(3)? as usize;
    let count = args
        .invocations()
        .min(hits.len())
        .min(camera.len())
        .min(random.len());
    let sample = params.sample_index();
    let length = if path_trace {
        params.near_far[1]
    } else {
        params.near_far[2]
    };

    let mut rays = Vec::new();
    let mut ids = Vec::new();
    let mut sky = Vec::new();
    for i in 0..count {
        if hits[i].is_miss() {
            if path_trace {
                sky.push((i, SKY_COLOR));
            }
            continue;
        }
        let Some(surface) = surface(&hits[i], &shapes, &indices, &vertices) else {
            continue;
        };
        if start + rays.len() >= capacity {
            break;
        }

        let mut normal = surface.normal;
        if normal.dot(camera[i].direction()) > 0.0 {
            normal = -normal;
        }
        let direction = cosine_direction(
            normal,
            random_float(random[i], sample, 2),
            random_float(random[i], sample, 3),
        );
        rays.push(Ray::new(
            surface.position + normal * SURFACE_EPSILON,
            direction,
            0.0,
            length,
        ));
        ids.push(i as u32);
    }

    args.buffers[2].write_at(start as u64 * RAY_SIZE, &rays)?;
    args.buffers[1].write_at(start as u64 * 4, &ids)?;
    args.buffers[3].write_at(0, &[(start + rays.len()) as u32])?;

    if path_trace && !sky.is_empty() {
        accumulate_radiance(&args.buffers[10], &args.buffers[11], sky)?;
    }
    Ok(())
}

/// bindings: accumulation, color, ids, count, occluder ids
fn ao_rays_resolve(args: &KernelArgs) -> Result<(), DeviceError> {
    let mut accumulation: Vec<[u32; 2]> = args.read(0)?;
    let mut color: Vec<u32> = args.read(1)?;
    let ids: Vec<u32> = args.read(2)?;
    let occluders: Vec<u32> = args.read(4)?;
    let count = (args.first::<u32>(3)? as usize)
        .min(args.invocations())
        .min(ids.len())
        .min(occluders.len());

    for k in 0..count {
        let id = ids[k] as usize;
        let (Some(samples), Some(pixel)) = (accumulation.get_mut(id), color.get_mut(id)) else {
            continue;
        };
        samples[1] += 1;
        if occluders[k] == INVALID_ID {
            samples[0] += 1;
        }
        *pixel = pack_color(Vec3::broadcast(samples[0] as f32 / samples[1] as f32));
    }

    args.buffers[0].write_at(0, &accumulation)?;
    args.buffers[1].write_at(0, &color)
}

/// bindings: accumulation, color, ids, count, secondary hits, hits, shapes,
/// indices, vertices
fn shade(args: &KernelArgs) -> Result<(), DeviceError> {
    let ids: Vec<u32> = args.read(2)?;
    let secondary: Vec<Hit> = args.read(4)?;
    let hits: Vec<Hit> = args.read(5)?;
    let shapes: Vec<Shape> = args.read(6)?;
    let indices: Vec<u32> = args.read(7)?;
    let vertices: Vec<Vertex> = args.read(8)?;
    let count = (args.first::<u32>(3)? as usize)
        .min(args.invocations())
        .min(ids.len())
        .min(secondary.len());

    let mut samples = Vec::with_capacity(count);
    for k in 0..count {
        let id = ids[k] as usize;
        let Some(albedo) = hits
            .get(id)
            .and_then(|hit| surface(hit, &shapes, &indices, &vertices))
            .map(|surface| surface.color)
        else {
            continue;
        };
        let radiance = if secondary[k].is_miss() {
            albedo * SKY_COLOR
        } else {
            surface(&secondary[k], &shapes, &indices, &vertices)
                .map_or(Vec3::zero(), |bounce| albedo * bounce.color * AMBIENT)
        };
        samples.push((id, radiance));
    }

    accumulate_radiance(&args.buffers[0], &args.buffers[1], samples)
}

fn accumulate_radiance(
    accumulation: &HostBuffer,
    color: &HostBuffer,
    samples: Vec<(usize, Vec3)>,
) -> Result<(), DeviceError> {
    let mut sums: Vec<[f32; 4]> = accumulation.read()?;
    let mut pixels: Vec<u32> = color.read()?;
    for (id, radiance) in samples {
        let (Some(sum), Some(pixel)) = (sums.get_mut(id), pixels.get_mut(id)) else {
            continue;
        };
        sum[0] += radiance.x;
        sum[1] += radiance.y;
        sum[2] += radiance.z;
        sum[3] += 1.0;
        *pixel = pack_color(Vec3::new(sum[0], sum[1], sum[2]) / sum[3]);
    }
    accumulation.write_at(0, &sums)?;
    color.write_at(0, &pixels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_floats_are_in_unit_range() {
        for seed in 0..64 {
            for sample in 0..8 {
                let value = random_float(seed, sample, 2);
                assert!((0.0..1.0).contains(&value));
            }
        }
        assert_ne!(random_float(1, 1, 0), random_float(1, 2, 0));
    }

    #[test]
    fn cosine_directions_stay_in_hemisphere() {
        let normal = Vec3::new(0.3, 0.9, -0.2).normalized();
        for i in 0..32 {
            let direction = cosine_direction(normal, random_float(i, 1, 2), random_float(i, 1, 3));
            assert!(direction.dot(normal) >= 0.0);
            assert!((direction.mag() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn surface_interpolates_barycentrics() {
        let vertices = [
            Vertex::new([0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0], [1.0, 0.0, 0.0]),
            Vertex::new([1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0], [0.0, 1.0, 0.0]),
            Vertex::new([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0], [0.0, 0.0, 1.0]),
        ];
        let shapes = [Shape {
            count: 1,
            first_index: 0,
            base_vertex: 0,
            material_id: 0,
        }];
        let hit = Hit {
            instance_id: 0,
            primitive_id: 0,
            uv: [0.25, 0.5],
        };

        let interpolated = surface(&hit, &shapes, &[0, 1, 2], &vertices).unwrap();
        assert!((interpolated.position - Vec3::new(0.25, 0.5, 0.0)).mag() < 1e-6);
        assert!((interpolated.color - Vec3::new(0.25, 0.25, 0.5)).mag() < 1e-6);
        assert!(surface(&Hit::MISS, &shapes, &[0, 1, 2], &vertices).is_none());
    }
}
