//! The in-process backend: a `ComputeDevice` whose queue is a worker thread and
//! an intersection engine that traverses on the host.

mod device;
mod engine;
mod kernels;

pub use device::*;
pub use engine::*;
pub use kernels::{camera_ray, lookup as kernel_lookup, GROUP_SIZE};
