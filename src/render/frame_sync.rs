use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::ComputeDevice;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Nothing in flight, the fence is signaled.
    Idle,
    /// The fence was reset and the host may write shared buffers. Not submitted yet.
    HostWriting,
    /// Submitted, the fence signals when the queue is done.
    InFlight,
}

/// Gates host access to the shared frame buffers with one completion fence.
/// Single-buffered, at most one submission is ever in flight.
pub struct FrameSynchronizer<D: ComputeDevice> {
    fence: Option<D::Fence>,
    state: FrameState,
    soft_timeout: Duration,
    device: Arc<D>,
}

impl<D: ComputeDevice> FrameSynchronizer<D> {
    pub fn new(device: Arc<D>, soft_timeout: Duration) -> Result<Self> {
        // Signaled, so the first frame does not block
        let fence = device
            .create_fence(true)
            .map_err(Error::load("fence creation"))?;
        Ok(Self {
            fence: Some(fence),
            state: FrameState::Idle,
            soft_timeout,
            device,
        })
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    fn fence(&self) -> Result<&D::Fence> {
        self.fence.as_ref().ok_or_else(|| {
            Error::frame("fence access")(crate::device::DeviceError::DeviceLost(
                "fence destroyed".into(),
            ))
        })
    }

    pub fn is_signaled(&self) -> Result<bool> {
        self.device
            .fence_status(self.fence()?)
            .map_err(Error::frame("fence status"))
    }

    /// Blocks until the last submission is complete. A wait longer than the soft
    /// timeout is logged and retried, never abandoned.
    pub fn wait(&mut self) -> Result<()> {
        if self.state == FrameState::HostWriting {
            // The reset fence has no submission that could signal it
            return Ok(());
        }
        let start = Instant::now();
        let fence = self.fence()?;
        while !self
            .device
            .wait_fence(fence, self.soft_timeout)
            .map_err(Error::frame("fence wait"))?
        {
            log::warn!(
                "Performance warning: frame fence still unsignaled after {:?}",
                start.elapsed()
            );
        }
        self.state = FrameState::Idle;
        Ok(())
    }

    /// Waits for the previous submission and resets the fence, after which the
    /// host owns the shared buffers until `submit`.
    pub fn begin_host_write(&mut self) -> Result<()> {
        self.wait()?;
        if self.state != FrameState::HostWriting {
            self.device
                .reset_fence(self.fence()?)
                .map_err(Error::frame("fence reset"))?;
            self.state = FrameState::HostWriting;
        }
        Ok(())
    }

    /// Submits `commands` so they signal the fence. A failed submission leaves
    /// the fence reset and the commands valid for another try.
    pub fn submit(&mut self, commands: &D::CommandSequence) -> Result<()> {
        self.begin_host_write()?;
        self.device
            .submit(commands, Some(self.fence()?))
            .map_err(Error::frame("submit"))?;
        self.state = FrameState::InFlight;
        Ok(())
    }
}

impl<D: ComputeDevice> Drop for FrameSynchronizer<D> {
    fn drop(&mut self) {
        if let Some(fence) = self.fence.take() {
            self.device.destroy_fence(fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostDevice, HostDeviceConfig};

    #[test]
    fn first_frame_does_not_block() {
        let device = Arc::new(HostDevice::new(HostDeviceConfig::default()));
        let mut sync = FrameSynchronizer::new(device, Duration::from_millis(10)).unwrap();

        assert!(sync.is_signaled().unwrap());
        sync.begin_host_write().unwrap();
        assert_eq!(sync.state(), FrameState::HostWriting);
        assert!(!sync.is_signaled().unwrap());
        // a reset but unsubmitted fence is not waited on
        sync.wait().unwrap();
    }

    #[test]
    fn stalled_fence_is_retried() {
        let device = Arc::new(HostDevice::new(HostDeviceConfig {
            completion_delay: Duration::from_millis(60),
            ..HostDeviceConfig::default()
        }));
        let mut sync = FrameSynchronizer::new(device.clone(), Duration::from_millis(5)).unwrap();
        let mut commands = device.begin_commands().unwrap();
        device.end_commands(&mut commands).unwrap();

        sync.submit(&commands).unwrap();
        assert_eq!(sync.state(), FrameState::InFlight);
        sync.wait().unwrap();
        assert!(sync.is_signaled().unwrap());
        assert_eq!(device.completed(), 1);
    }
}
