use std::sync::Arc;

use super::frame_resources::FrameResources;
use super::stage_set::ComputeStageSet;
use super::technique::{FrameBuffer, StageDescriptor, Technique, TraceStep};
use crate::accel::{IntersectionEngine, TraceDesc, TraceFlags};
use crate::device::{BarrierScope, ComputeDevice};
use crate::error::{Error, Result};

/// Invocations per workgroup in every stage shader.
pub const WORKGROUP_SIZE: u32 = 64;

/// The recorded frame. Immutable, resubmitted every frame.
pub struct FramePipeline<D: ComputeDevice> {
    commands: Option<D::CommandSequence>,
    /// Pool-owned, kept for as long as the commands reference them.
    _binding_sets: Vec<D::BindingSet>,
    device: Arc<D>,
}

impl<D: ComputeDevice> FramePipeline<D> {
    pub fn commands(&self) -> Result<&D::CommandSequence> {
        self.commands
            .as_ref()
            .ok_or_else(|| Error::StageNotCreated("frame".into()))
    }
}

impl<D: ComputeDevice> Drop for FramePipeline<D> {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.take() {
            self.device.free_commands(commands);
        }
    }
}

pub struct FramePipelineRecorder<'a, D: ComputeDevice, E: IntersectionEngine<D>> {
    pub device: &'a Arc<D>,
    pub engine: &'a E,
    pub top_level: &'a E::Structure,
    pub stages: &'a ComputeStageSet<D>,
    pub resources: &'a FrameResources<D>,
    pub technique: &'a Technique,
}

impl<'a, D: ComputeDevice, E: IntersectionEngine<D>> FramePipelineRecorder<'a, D, E> {
    /// Binds every stage and records the whole frame once.
    pub fn record(&self) -> Result<FramePipeline<D>> {
        let mut bound = Vec::new();
        for stage in self.technique.stages() {
            let buffers = self.buffers(stage.buffers())?;
            let set = self.stages.bind(stage.name, &buffers)?;
            bound.push((stage, set));
        }

        let mut commands = self
            .device
            .begin_commands()
            .map_err(Error::load("frame commands"))?;
        let recorded = self.record_into(&mut commands, &bound).and_then(|_| {
            self.device
                .end_commands(&mut commands)
                .map_err(Error::load("frame commands"))
        });
        if let Err(err) = recorded {
            self.device.free_commands(commands);
            return Err(err);
        }

        Ok(FramePipeline {
            commands: Some(commands),
            _binding_sets: bound.into_iter().map(|(_, set)| set).collect(),
            device: self.device.clone(),
        })
    }

    fn record_into(
        &self,
        commands: &mut D::CommandSequence,
        bound: &[(&StageDescriptor, D::BindingSet)],
    ) -> Result<()> {
        let groups = [
            self.resources.num_rays().div_ceil(WORKGROUP_SIZE),
            1,
            1,
        ];
        let stage = |name: &str| {
            bound
                .iter()
                .find(|(stage, _)| stage.name == name)
                .ok_or_else(|| Error::StageNotCreated(name.to_string()))
        };

        if self.technique.clear.is_some() {
            let (clear, set) = stage("clear")?;
            self.dispatch(commands, clear, set, groups)?;
            self.barrier(commands, BarrierScope::COMPUTE_TO_COMPUTE, &clear.writes)?;
        }

        let (camera, set) = stage("camera")?;
        self.dispatch(commands, camera, set, groups)?;
        self.barrier(commands, BarrierScope::COMPUTE_TO_COMPUTE, &camera.writes)?;

        self.trace(
            commands,
            self.technique.primary_trace,
            FrameBuffer::CameraRays,
            FrameBuffer::Hits,
            None,
        )?;
        self.barrier(
            commands,
            BarrierScope::COMPUTE_TO_COMPUTE,
            &[
                FrameBuffer::Hits,
                FrameBuffer::SecondaryCount,
                FrameBuffer::TraceScratch,
            ],
        )?;

        let (secondary, set) = stage("secondary")?;
        self.dispatch(commands, secondary, set, groups)?;
        self.barrier(commands, BarrierScope::COMPUTE_TO_COMPUTE, &secondary.writes)?;

        self.trace(
            commands,
            self.technique.secondary_trace,
            FrameBuffer::SecondaryRays,
            FrameBuffer::SecondaryHits,
            Some(FrameBuffer::SecondaryCount),
        )?;
        self.barrier(
            commands,
            BarrierScope::COMPUTE_TO_COMPUTE,
            &[FrameBuffer::SecondaryHits],
        )?;

        let (resolve, set) = stage("resolve")?;
        self.dispatch(commands, resolve, set, groups)?;
        self.barrier(commands, BarrierScope::COMPUTE_TO_TRANSFER, &[FrameBuffer::Color])?;
        // color() reads the mapped buffer directly
        self.barrier(commands, BarrierScope::COMPUTE_TO_HOST, &[FrameBuffer::Color])?;

        log::info!(
            "Recorded {:?} frame for {} rays in {} workgroups",
            self.technique.kind,
            self.resources.num_rays(),
            groups[0]
        );
        Ok(())
    }

    fn buffers(&self, names: impl Iterator<Item = FrameBuffer>) -> Result<Vec<&'a D::Buffer>> {
        names.map(|name| self.resources.buffer(name)).collect()
    }

    fn dispatch(
        &self,
        commands: &mut D::CommandSequence,
        stage: &StageDescriptor,
        set: &D::BindingSet,
        groups: [u32; 3],
    ) -> Result<()> {
        let pipeline = self.stages.pipeline(stage.name)?;
        self.device.cmd_dispatch(commands, pipeline, set, groups);
        log::debug!("  dispatch {} ({})", stage.name, stage.shader);
        Ok(())
    }

    fn barrier(
        &self,
        commands: &mut D::CommandSequence,
        scope: BarrierScope,
        buffers: &[FrameBuffer],
    ) -> Result<()> {
        let handles = self.buffers(buffers.iter().copied())?;
        self.device.cmd_buffer_barrier(commands, scope, &handles);
        log::debug!("  barrier {:?}", buffers);
        Ok(())
    }

    fn trace(
        &self,
        commands: &mut D::CommandSequence,
        step: TraceStep,
        rays: FrameBuffer,
        hits: FrameBuffer,
        count: Option<FrameBuffer>,
    ) -> Result<()> {
        let desc = TraceDesc {
            query: step.query,
            output: step.output,
            flags: TraceFlags::NONE,
            ray_count: self.resources.num_rays(),
            rays: self.resources.buffer(rays)?,
            hits: self.resources.buffer(hits)?,
            scratch: self.resources.buffer(FrameBuffer::TraceScratch)?,
        };
        match count {
            Some(count) => {
                let count = self.resources.buffer(count)?;
                self.engine
                    .record_trace_indirect(self.top_level, &desc, count, commands)
                    .map_err(Error::accel("indirect trace recording"))?;
            }
            None => self
                .engine
                .record_trace(self.top_level, &desc, commands)
                .map_err(Error::accel("trace recording"))?,
        }
        log::debug!("  trace {:?} {:?} into {}", step.query, step.output, hits.name());
        Ok(())
    }
}
