use thiserror::Error;

#[derive(Debug, Error)]
pub enum DroverError {
    #[error("control channel lost: {0}")]
    ChannelRecoverable(String),

    #[error("control channel command failed with code {code}: {command}")]
    ChannelFatal { command: String, code: i32 },

    #[error("control channel command could not be spawned: {0}")]
    ChannelSpawn(String),

    #[error("screen capture failed for {serial} after {attempts} attempts")]
    CaptureFailed { serial: String, attempts: u32 },

    #[error("routine restart requested: {0}")]
    RoutineRestart(String),

    #[error("task '{0}' is not registered")]
    UnknownTask(String),

    #[error("task '{0}' is registered more than once")]
    DuplicateTask(String),

    #[error("routine '{0}' is not defined in config")]
    UnknownRoutine(String),

    #[error("layout '{layout}' referenced by '{target}' does not exist")]
    UnknownLayout { target: String, layout: String },

    #[error("no layout specified for target '{0}' and no default layout set")]
    NoLayout(String),

    #[error("button '{0}' is not defined for this layout")]
    UnknownButton(String),

    #[error("template '{0}' is not defined for this layout")]
    UnknownTemplate(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("task '{task}' failed: {reason}")]
    TaskFailed { task: String, reason: String },

    #[error("perception helper error: {0}")]
    Perception(String),

    #[error("emulator error: {0}")]
    Emulator(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DroverError {
    /// Errors that mean "restart this target's routine from its cursor"
    /// rather than "abort the target".
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DroverError::ChannelRecoverable(_)
                | DroverError::CaptureFailed { .. }
                | DroverError::RoutineRestart(_)
        )
    }

    pub fn task_failed(task: &str, reason: impl Into<String>) -> Self {
        DroverError::TaskFailed {
            task: task.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DroverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(DroverError::ChannelRecoverable("x".into()).is_recoverable());
        assert!(DroverError::RoutineRestart("x".into()).is_recoverable());
        assert!(DroverError::CaptureFailed {
            serial: "127.0.0.1:5555".into(),
            attempts: 2
        }
        .is_recoverable());

        assert!(!DroverError::ChannelFatal {
            command: "shell input tap 1 2".into(),
            code: 255
        }
        .is_recoverable());
        assert!(!DroverError::UnknownTask("mail".into()).is_recoverable());
        assert!(!DroverError::UnknownButton("march".into()).is_recoverable());
    }
}
