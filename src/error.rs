use crate::device::DeviceId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid device {id}: expected an ordinal in [0, {count})")]
    InvalidDevice { id: i64, count: usize },

    #[error("unsupported fill width: {width} bytes (expected 1, 2 or 4)")]
    UnsupportedFillWidth { width: usize },

    #[error("graph instantiation failed: {0}")]
    GraphInstantiation(String),

    #[error("dependency cycle detected at task '{task}'")]
    CyclicGraph { task: String },

    #[error("illegal mutation: {0}")]
    IllegalMutation(String),

    #[error("no device support: {0}")]
    NoDeviceSupport(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device error on {device}: {message}")]
    Device { device: DeviceId, message: String },

    #[error("task '{task}' failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("task '{task}' panicked: {message}")]
    WorkerPanic { task: String, message: String },

    #[error("executor error: {0}")]
    Executor(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn executor<S: Into<String>>(msg: S) -> Self {
        Error::Executor(msg.into())
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn illegal_mutation<S: Into<String>>(msg: S) -> Self {
        Error::IllegalMutation(msg.into())
    }

    pub fn instantiation<S: Into<String>>(msg: S) -> Self {
        Error::GraphInstantiation(msg.into())
    }

    pub fn device<S: Into<String>>(device: DeviceId, msg: S) -> Self {
        Error::Device {
            device,
            message: msg.into(),
        }
    }

    /// Error a host callable returns to report its own failure.
    pub fn task_failed<T: Into<String>, S: Into<String>>(task: T, msg: S) -> Self {
        Error::TaskFailed {
            task: task.into(),
            message: msg.into(),
        }
    }

    /// Structural errors come from how a graph or device flow was built, not
    /// from executing work. Cycles and missing device support are reported by
    /// `run` before dispatch; invalid devices and illegal mutations can also
    /// surface from inside a running device task.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::CyclicGraph { .. }
                | Error::IllegalMutation(_)
                | Error::InvalidDevice { .. }
                | Error::NoDeviceSupport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::InvalidDevice { id: -1, count: 4 };
        assert_eq!(
            err.to_string(),
            "invalid device -1: expected an ordinal in [0, 4)"
        );

        let err = Error::UnsupportedFillWidth { width: 8 };
        assert!(err.to_string().contains("8 bytes"));
    }

    #[test]
    fn test_structural() {
        assert!(Error::CyclicGraph { task: "a".into() }.is_structural());
        assert!(Error::illegal_mutation("x").is_structural());
        assert!(Error::InvalidDevice { id: 4, count: 2 }.is_structural());
        assert!(!Error::task_failed("t", "boom").is_structural());
    }
}
