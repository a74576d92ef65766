pub mod frame_recorder;
pub mod frame_resources;
pub mod frame_sync;
pub mod shader_types;
pub mod stage_set;
pub mod technique;
pub mod view_channel;

use std::sync::Arc;
use std::time::Duration;

use crate::accel::{AccelerationStructureBuilder, IntersectionEngine, SceneStructures};
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::scene::Scene;

use self::{
    frame_recorder::{FramePipeline, FramePipelineRecorder},
    frame_resources::FrameResources,
    frame_sync::{FrameState, FrameSynchronizer},
    shader_types::Params,
    stage_set::ComputeStageSet,
    technique::{FrameBuffer, Technique},
    view_channel::ViewParameterChannel,
};

#[derive(Debug, Clone, Copy)]
pub struct FrameSettings {
    /// Fence waits longer than this log a performance warning and retry.
    pub fence_soft_timeout: Duration,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            fence_soft_timeout: Duration::from_secs(1),
        }
    }
}

/// Everything one scene needs to render frames: structures, buffers, stages
/// and the recorded frame.
// Rust will drop these fields in the order they are declared
pub struct TraceContext<D: ComputeDevice, E: IntersectionEngine<D>> {
    pipeline: FramePipeline<D>,
    stages: ComputeStageSet<D>,
    view: ViewParameterChannel,
    sync: FrameSynchronizer<D>,
    resources: FrameResources<D>,
    structures: SceneStructures<D, E>,
    technique: Technique,
    frames_submitted: u64,
    engine: Arc<E>,
    device: Arc<D>,
}

impl<D: ComputeDevice, E: IntersectionEngine<D>> TraceContext<D, E> {
    /// Builds the acceleration structures, allocates and fills the frame buffers,
    /// creates the stages and records the frame. Nothing survives a failure.
    pub fn init(
        device: Arc<D>,
        engine: Arc<E>,
        scene: &Scene,
        num_rays: u32,
        technique: Technique,
        settings: FrameSettings,
    ) -> Result<Self> {
        let structures =
            AccelerationStructureBuilder::new(device.clone(), engine.clone()).build(&scene.meshes)?;

        let arrays = scene.flatten();
        let trace_scratch = engine.trace_scratch_requirements(structures.top_level()?, num_rays);
        let resources = FrameResources::allocate(
            device.clone(),
            &arrays,
            num_rays,
            &technique,
            trace_scratch,
        )?;
        log::info!(
            "Frame buffers: {} host-visible bytes, {} device-local bytes",
            resources.host_size(),
            resources.device_size()
        );

        let mut stages = ComputeStageSet::new(device.clone(), technique.stage_count())?;
        for stage in technique.stages() {
            stages.create(stage.name, stage.shader, &stage.binding_descriptors())?;
        }

        let pipeline = FramePipelineRecorder {
            device: &device,
            engine: &*engine,
            top_level: structures.top_level()?,
            stages: &stages,
            resources: &resources,
            technique: &technique,
        }
        .record()?;

        let sync = FrameSynchronizer::new(device.clone(), settings.fence_soft_timeout)?;

        Ok(Self {
            pipeline,
            stages,
            view: ViewParameterChannel::default(),
            sync,
            resources,
            structures,
            technique,
            frames_submitted: 0,
            engine,
            device,
        })
    }

    /// Waits for the previous frame, then writes the view. The accumulated
    /// sample index is stamped into `eye.w`, the stamped params are returned.
    pub fn update_view(&mut self, params: Params) -> Result<Params> {
        self.sync.begin_host_write()?;
        self.view.update(&self.resources, params)
    }

    /// Submits the recorded frame. On failure the frame stays recorded and can
    /// be submitted again.
    pub fn submit(&mut self) -> Result<()> {
        let commands = self.pipeline.commands()?;
        self.sync.submit(commands)?;
        self.frames_submitted += 1;
        Ok(())
    }

    /// Waits for the last submission and reads back the packed RGBA8 colors.
    pub fn color(&mut self) -> Result<Vec<u32>> {
        self.sync.wait()?;
        self.resources.read_color()
    }

    /// Overwrites the color buffer, e.g. to seed or clear the output.
    pub fn set_color(&mut self, color: &[u32]) -> Result<()> {
        self.sync.wait()?;
        self.resources.write_color(color)
    }

    /// The raw color buffer for a presentation path that copies on the device.
    pub fn color_buffer(&self) -> Result<&D::Buffer> {
        self.resources.buffer(FrameBuffer::Color)
    }

    pub fn sample_index(&self) -> u32 {
        self.view.sample()
    }

    pub fn num_rays(&self) -> u32 {
        self.resources.num_rays()
    }

    pub fn technique(&self) -> &Technique {
        &self.technique
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    pub fn frame_state(&self) -> FrameState {
        self.sync.state()
    }

    pub fn fence_signaled(&self) -> Result<bool> {
        self.sync.is_signaled()
    }

    pub fn structures(&self) -> &SceneStructures<D, E> {
        &self.structures
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn stages(&self) -> &ComputeStageSet<D> {
        &self.stages
    }

    pub fn resources(&self) -> &FrameResources<D> {
        &self.resources
    }

    /// The recorded frame, as every `submit` replays it.
    pub fn frame_commands(&self) -> Result<&D::CommandSequence> {
        self.pipeline.commands()
    }
}

impl<D: ComputeDevice, E: IntersectionEngine<D>> Drop for TraceContext<D, E> {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle().map_err(Error::frame("shutdown")) {
            log::error!("{}", err);
        }
    }
}
