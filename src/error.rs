//! Error types for Stool

use thiserror::Error;

/// Result type for Stool operations
pub type Result<T> = std::result::Result<T, StoolError>;

/// Coarse classification of a failure, used to decide how it is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User-fixable problem with the request
    Validation,
    /// A systemic limit (port range, memory, disk) was hit
    Exhaustion,
    /// The container engine failed or is unreachable
    Backend,
    /// Host level misconfiguration, reported to the admin only
    Infrastructure,
}

/// Stool error types
#[derive(Error, Debug)]
pub enum StoolError {
    #[error("{stage}: stage expired {expire}. To start it, you have to adjust the 'expire' date.")]
    Expired { stage: String, expire: String },

    #[error("{stage}: stage quota exceeded. Used: {used} mb > quota: {quota} mb.")]
    QuotaExceeded { stage: String, used: u64, quota: u64 },

    #[error("{stage}: unknown app(s): {apps}")]
    UnknownApp { stage: String, apps: String },

    #[error("{stage}: {app}: app index not found: {index}")]
    AppIndex {
        stage: String,
        app: String,
        index: usize,
    },

    #[error("{stage}: no apps to start - did you build the stage?")]
    NothingBuilt { stage: String },

    #[error("invalid value for {name}: {message}")]
    InvalidProperty { name: String, message: String },

    #[error("{name}: no such property, choose one of {choices}")]
    UnknownProperty { name: String, choices: String },

    #[error("port already allocated: {port} (held by {owner})")]
    PortAllocated { port: u16, owner: String },

    #[error("port already in use: {0}")]
    PortInUse(u16),

    #[error("port {port} out of range {first} .. {last}")]
    PortOutOfRange { port: u16, first: u16, last: u16 },

    #[error("{0}: stage is already stopped")]
    AlreadyStopped(String),

    #[error("stage already exists: {0}")]
    StageExists(String),

    #[error("stage not found: {0}")]
    StageNotFound(String),

    #[error("invalid stage name: {0}")]
    InvalidName(String),

    #[error("no free port in range {first} .. {last}")]
    NoFreePort { first: u16, last: u16 },

    #[error("{stage}: {app}: cannot reserve memory: unreserved {unreserved} mb, requested {requested} mb. Consider stopping stages.")]
    MemoryExhausted {
        stage: String,
        app: String,
        requested: u64,
        unreserved: u64,
    },

    #[error("{stage}: cannot reserve disk space: used {used} mb > quota {quota} mb")]
    DiskExhausted { stage: String, used: u64, quota: u64 },

    #[error("image build failed: {summary}")]
    Build { summary: String, output: String },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("{stage}: {app}: unexpected container status: {status}")]
    ContainerStatus {
        stage: String,
        app: String,
        status: String,
    },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Infrastructure problem: {0}")]
    Infrastructure(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoolError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoolError::NoFreePort { .. }
            | StoolError::MemoryExhausted { .. }
            | StoolError::DiskExhausted { .. } => ErrorKind::Exhaustion,
            StoolError::Build { .. }
            | StoolError::Engine(_)
            | StoolError::ContainerStatus { .. }
            | StoolError::ContainerNotFound(_)
            | StoolError::ImageNotFound(_)
            | StoolError::Timeout(_)
            | StoolError::Lock(_)
            | StoolError::Io(_)
            | StoolError::Json(_) => ErrorKind::Backend,
            StoolError::Infrastructure(_) | StoolError::InvalidConfig(_) => {
                ErrorKind::Infrastructure
            }
            _ => ErrorKind::Validation,
        }
    }

    /// True for errors a user can fix by changing the request
    pub fn is_user_fixable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::Exhaustion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_errors_name_the_numbers() {
        let err = StoolError::MemoryExhausted {
            stage: "s1".to_string(),
            app: "web".to_string(),
            requested: 1024,
            unreserved: 300,
        };
        let message = err.to_string();
        assert!(message.contains("s1"));
        assert!(message.contains("web"));
        assert!(message.contains("1024"));
        assert!(message.contains("300"));
        assert_eq!(err.kind(), ErrorKind::Exhaustion);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(StoolError::AlreadyStopped("s".into()).kind(), ErrorKind::Validation);
        assert_eq!(StoolError::PortInUse(9000).kind(), ErrorKind::Validation);
        assert_eq!(StoolError::Engine("down".into()).kind(), ErrorKind::Backend);
        assert_eq!(
            StoolError::Infrastructure("dns".into()).kind(),
            ErrorKind::Infrastructure
        );
        assert!(!StoolError::Engine("down".into()).is_user_fixable());
    }
}
