use std::fmt;

/// Main error type for reactorcide
#[derive(Debug)]
pub enum Error {
    /// Missing/invalid job configuration (image, command, workspace, job id, …)
    ConfigInvalid(String),

    /// Transient broker RPC failure (deadline exceeded, connection error)
    BrokerTransient(String),

    /// `GetNextTask` found no work — not an error condition, carried so call
    /// sites can match on it without string comparison
    BrokerNotFound,

    /// Container runtime failed to start the container (exit 125)
    ContainerRuntime(String),

    /// Process killed, typically OOM (exit 137)
    OomKilled(String),

    /// Non-root process lacked permission to execute (exit 126)
    PermissionDenied(String),

    /// Command not found inside the container (exit 127)
    CommandNotFound(String),

    /// Process terminated by SIGTERM (exit 143)
    Terminated(String),

    /// Non-zero exit from user code, any other code
    ApplicationError(i32, String),

    /// Kubernetes pod-level startup failure (ImagePullBackOff, ErrImagePull,
    /// CreateContainerConfigError, CrashLoopBackOff, …)
    PodStartupError(String),

    /// A `${secret:...}` reference could not be resolved
    SecretUnresolvable(String),

    /// Workspace directory creation/teardown failed
    WorkspaceSetup(String),

    /// Object-store write failed while shipping logs (best-effort, non-fatal)
    LogShippingError(String),

    /// Job/container was cancelled via context cancellation
    Cancelled,

    /// Serialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Generic errors with description
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConfigInvalid(msg) => write!(f, "invalid job configuration: {}", msg),
            Error::BrokerTransient(msg) => write!(f, "broker transient error: {}", msg),
            Error::BrokerNotFound => write!(f, "no task available"),
            Error::ContainerRuntime(msg) => write!(f, "container runtime error: {}", msg),
            Error::OomKilled(msg) => write!(f, "process killed (oom): {}", msg),
            Error::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            Error::CommandNotFound(msg) => write!(f, "command not found: {}", msg),
            Error::Terminated(msg) => write!(f, "terminated: {}", msg),
            Error::ApplicationError(code, msg) => write!(f, "application error (exit {}): {}", code, msg),
            Error::PodStartupError(msg) => write!(f, "pod startup error: {}", msg),
            Error::SecretUnresolvable(msg) => write!(f, "secret unresolvable: {}", msg),
            Error::WorkspaceSetup(msg) => write!(f, "workspace setup failed: {}", msg),
            Error::LogShippingError(msg) => write!(f, "log shipping error: {}", msg),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Serialization(e) => write!(f, "serialization error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Other(msg) => write!(f, "error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::ConfigInvalid(error.to_string())
    }
}

// Common error constructors
impl Error {
    pub fn config_invalid<T: Into<String>>(msg: T) -> Self {
        Error::ConfigInvalid(msg.into())
    }

    pub fn broker_transient<T: Into<String>>(msg: T) -> Self {
        Error::BrokerTransient(msg.into())
    }

    pub fn other<T: Into<String>>(msg: T) -> Self {
        Error::Other(msg.into())
    }

    /// Errors that `RetryCore` should re-enter on.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::BrokerTransient(_)
                | Error::ContainerRuntime(_)
                | Error::OomKilled(_)
                | Error::WorkspaceSetup(_)
        )
    }

    /// Short categorical label, used as the `error_type` metrics label and in
    /// `last_error`-adjacent logging — never includes secret contents.
    pub fn category(&self) -> &'static str {
        match self {
            Error::ConfigInvalid(_) => "config_invalid",
            Error::BrokerTransient(_) => "broker_transient",
            Error::BrokerNotFound => "broker_not_found",
            Error::ContainerRuntime(_) => "container_runtime",
            Error::OomKilled(_) => "oom_killed",
            Error::PermissionDenied(_) => "permission_denied",
            Error::CommandNotFound(_) => "command_not_found",
            Error::Terminated(_) => "terminated",
            Error::ApplicationError(_, _) => "application_error",
            Error::PodStartupError(_) => "pod_startup_error",
            Error::SecretUnresolvable(_) => "secret_unresolvable",
            Error::WorkspaceSetup(_) => "workspace_setup",
            Error::LogShippingError(_) => "log_shipping_error",
            Error::Cancelled => "cancelled",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::ContainerRuntime("x".into()).retryable());
        assert!(Error::OomKilled("x".into()).retryable());
        assert!(!Error::PermissionDenied("x".into()).retryable());
        assert!(!Error::ApplicationError(1, "x".into()).retryable());
        assert!(!Error::Cancelled.retryable());
    }

    #[test]
    fn category_labels() {
        assert_eq!(Error::BrokerNotFound.category(), "broker_not_found");
        assert_eq!(Error::PodStartupError("x".into()).category(), "pod_startup_error");
    }
}
