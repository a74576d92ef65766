use super::frame_resources::FrameResources;
use super::shader_types::Params;
use crate::device::ComputeDevice;
use crate::error::Result;

/// Counts frames rendered from an unchanged view.
#[derive(Debug, Clone, Default)]
pub struct SampleAccumulator {
    /// `None` until the first frame, which always starts at sample 0.
    previous: Option<[f32; 16]>,
    sample: u32,
}

impl SampleAccumulator {
    /// Returns 0 when the view-projection changed since the last call, and the
    /// previous index plus one otherwise.
    pub fn next(&mut self, view_proj_inv: &[f32; 16]) -> u32 {
        if self.previous.as_ref() == Some(view_proj_inv) {
            self.sample += 1;
        } else {
            self.previous = Some(*view_proj_inv);
            self.sample = 0;
        }
        self.sample
    }

    pub fn sample(&self) -> u32 {
        self.sample
    }
}

/// Writes view state into the params uniform the recorded frame reads.
#[derive(Debug, Default)]
pub struct ViewParameterChannel {
    accumulator: SampleAccumulator,
}

impl ViewParameterChannel {
    /// The caller has to own the params buffer, see `FrameSynchronizer::begin_host_write`.
    pub fn update<D: ComputeDevice>(
        &mut self,
        resources: &FrameResources<D>,
        mut params: Params,
    ) -> Result<Params> {
        let sample = self.accumulator.next(&params.view_proj_inv);
        params.eye[3] = sample as f32;
        resources.write_params(&params)?;
        Ok(params)
    }

    pub fn sample(&self) -> u32 {
        self.accumulator.sample()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_view_accumulates() {
        let mut accumulator = SampleAccumulator::default();
        let mut view = [0.0; 16];
        view[0] = 1.0;

        assert_eq!(accumulator.next(&view), 0);
        assert_eq!(accumulator.next(&view), 1);
        assert_eq!(accumulator.next(&view), 2);

        view[12] = 0.5;
        assert_eq!(accumulator.next(&view), 0);
        assert_eq!(accumulator.next(&view), 1);
    }

    #[test]
    fn first_frame_starts_at_zero_for_any_view() {
        let mut accumulator = SampleAccumulator::default();
        assert_eq!(accumulator.next(&[0.0; 16]), 0);
        assert_eq!(accumulator.next(&[0.0; 16]), 1);
    }
}
