use std::fmt::Display;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Cuda(Box<dyn std::error::Error + Send + Sync>),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },

    #[error("IO error: {0}")]
    IoError(String),

    /// Arbitrary errors wrapping with context.
    #[error("{context}: {wrapped}")]
    WrappedContext {
        wrapped: Box<dyn std::error::Error + Send + Sync>,
        context: String,
    },

    /// Malformed graph description, id collision or undeclared operand.
    /// Never retried.
    #[error("structural error: {0}")]
    Structural(String),

    /// A runner or cached object was used from a different device context.
    #[error("execution context mismatch: plan bound to {expected}, stream belongs to {actual}")]
    ContextMismatch { expected: String, actual: String },

    /// Heuristics produced nothing usable, or every candidate failed to build.
    #[error("no viable plan for `{fingerprint}` ({candidates} candidates){}", failure_suffix(.last_failure))]
    NoViablePlan {
        fingerprint: String,
        candidates: usize,
        last_failure: Option<String>,
    },

    /// One candidate failed to compile.
    #[error("failed to build engine {engine_id}: {reason}")]
    BuildFailure { engine_id: i64, reason: String },

    /// Device-level failure while running a bound plan.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn failure_suffix(last_failure: &Option<String>) -> String {
    match last_failure {
        Some(msg) => format!(": last failure: {msg}"),
        None => String::new(),
    }
}

impl Error {
    pub fn structural<M: Display>(msg: M) -> Self {
        Self::Structural(msg.to_string()).bt()
    }

    pub fn execution<M: Display>(msg: M) -> Self {
        Self::Execution(msg.to_string()).bt()
    }

    /// Attach a backtrace when `RUST_BACKTRACE` enables capture.
    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }

    /// The error with any backtrace wrapper stripped.
    pub fn inner(&self) -> &Self {
        match self {
            Self::WithBacktrace { inner, .. } => inner.inner(),
            other => other,
        }
    }

    /// Structural errors are fatal to the single build and must not be retried.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.inner(),
            Self::Structural(_) | Self::ContextMismatch { .. }
        )
    }

    /// `true` when a caller may retry after relaxing its numeric policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self.inner(), Self::NoViablePlan { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::IoError(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(value.to_string())
    }
}

/// Return early with an [`Error::Structural`].
#[macro_export]
macro_rules! structural {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::Error::structural(format!($fmt $(, $arg)*)))
    };
}

/// Attach a description of what was being attempted to a foreign error.
pub trait Context<T> {
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Display,
        F: FnOnce() -> C;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Display,
        F: FnOnce() -> C,
    {
        self.map_err(|e| {
            Error::WrappedContext {
                wrapped: Box::new(e),
                context: f().to_string(),
            }
            .bt()
        })
    }
}
