use thiserror::Error;
use vigil_backend::BackendError;

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("no debugger session is connected")]
    BackendUnavailable,
    #[error("backend call did not complete within the deadlock timeout")]
    Deadlock,
    #[error("class `{0}` is not loaded")]
    ClassNotFound(String),
    #[error("stack frame has no source information")]
    AbsentSourceInfo,
    #[error("invalid value: {0}")]
    InvalidValueFormat(String),
    #[error("debuggee process disconnected")]
    ProcessDisconnected,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Backend(BackendError),
}

impl DebugError {
    /// Terminal for the current session: no in-flight breakpoint or watch
    /// state is worth keeping once one of these occurs.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable | Self::Deadlock | Self::ProcessDisconnected
        )
    }
}

impl From<BackendError> for DebugError {
    fn from(err: BackendError) -> Self {
        if err.is_disconnect() {
            Self::ProcessDisconnected
        } else {
            Self::Backend(err)
        }
    }
}
