use ash::vk;

use crate::accel::EngineError;
use crate::device::DeviceError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a failure has to be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Scene initialization is aborted and nothing is kept running.
    LoadFatal,
    /// A programming error in how buffers are wired up.
    BindingContractViolation,
    /// The frame failed, the recorded commands stay valid and can be resubmitted.
    SubmissionFailure,
    Configuration,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of device memory while allocating {size} bytes for {label}")]
    OutOfMemory {
        label: String,
        size: u64,
        #[source]
        source: DeviceError,
    },

    #[error("no memory type with {flags:?} for {label}")]
    AllocationFailed {
        label: String,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("acceleration structure {step} failed")]
    AccelerationStructure {
        step: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("scene has no geometry")]
    EmptyScene,

    #[error("device call failed during {step}")]
    Load {
        step: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("stage {stage} declares {expected} bindings, got {actual}")]
    BindingCountMismatch {
        stage: String,
        expected: usize,
        actual: usize,
    },

    #[error("buffer {name} holds {actual} bytes, expected {expected}")]
    BufferSizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("stage {0} has not been created")]
    StageNotCreated(String),

    #[error("arena {arena} has no buffer named {name}")]
    UnknownBuffer { arena: String, name: String },

    #[error("frame {step} failed")]
    Frame {
        step: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("could not read config")]
    Io(#[from] std::io::Error),

    #[error("could not parse config")]
    Config(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfMemory { .. }
            | Error::AllocationFailed { .. }
            | Error::AccelerationStructure { .. }
            | Error::EmptyScene
            | Error::Load { .. } => ErrorKind::LoadFatal,
            Error::BindingCountMismatch { .. }
            | Error::BufferSizeMismatch { .. }
            | Error::StageNotCreated(_)
            | Error::UnknownBuffer { .. } => ErrorKind::BindingContractViolation,
            Error::Frame { .. } => ErrorKind::SubmissionFailure,
            Error::Io(_) | Error::Config(_) => ErrorKind::Configuration,
        }
    }

    pub(crate) fn load(step: &'static str) -> impl FnOnce(DeviceError) -> Error {
        move |source| Error::Load { step, source }
    }

    pub(crate) fn frame(step: &'static str) -> impl FnOnce(DeviceError) -> Error {
        move |source| Error::Frame { step, source }
    }

    pub(crate) fn accel(step: &'static str) -> impl FnOnce(EngineError) -> Error {
        move |source| Error::AccelerationStructure { step, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let stall = Error::frame("submit")(DeviceError::SubmitRejected);
        assert_eq!(stall.kind(), ErrorKind::SubmissionFailure);

        let mismatch = Error::BindingCountMismatch {
            stage: "ao_rays".into(),
            expected: 10,
            actual: 9,
        };
        assert_eq!(mismatch.kind(), ErrorKind::BindingContractViolation);

        let build = Error::accel("build")(EngineError::NotImplemented("update"));
        assert_eq!(build.kind(), ErrorKind::LoadFatal);
    }
}
