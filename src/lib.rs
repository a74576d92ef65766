//! Orchestrates a ray-traced frame on a compute queue: acceleration structures
//! are built once per scene, every frame replays a prerecorded sequence of
//! compute stages and ray traces.

pub mod accel;
pub mod arena;
pub mod camera;
pub mod config_loader;
pub mod device;
pub mod error;
pub mod host;
pub mod render;
pub mod scene;
pub mod time;
pub mod vulkan;

pub use accel::{AccelerationStructureBuilder, IntersectionEngine, SceneStructures};
pub use device::{ComputeDevice, DeviceError};
pub use error::{Error, ErrorKind, Result};
pub use render::{
    shader_types::{Hit, Params, Ray, INVALID_ID},
    technique::{Technique, TechniqueKind},
    FrameSettings, TraceContext,
};
pub use scene::Scene;
