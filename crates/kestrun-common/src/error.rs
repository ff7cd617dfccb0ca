use hyper::StatusCode;
use std::fmt;
use thiserror::Error;

/// Severity of a script compilation diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A single compiler diagnostic with an optional source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(mut self, line: Option<usize>, column: Option<usize>) -> Self {
        self.line = line;
        self.column = column;
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => {
                write!(f, "{} at {}:{}: {}", self.severity, line, column, self.message)
            }
            (Some(line), None) => write!(f, "{} at line {}: {}", self.severity, line, self.message),
            _ => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum KestrunError {
    #[error("Runspace pool exhausted: no runspace became available within {0}ms")]
    PoolExhaustedTimeout(u64),

    #[error("Runspace pool has been disposed")]
    PoolDisposed,

    #[error("Failed to create runspace: {0}")]
    RunspaceCreation(String),

    #[error("{language} compilation failed: {}", render_diagnostics(.diagnostics))]
    ScriptCompilation {
        language: String,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("Script runtime error: {0}")]
    ScriptRuntime(String),

    #[error("Script execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied by policy '{0}'")]
    Forbidden(String),

    #[error("No route matches {0}")]
    NotFound(String),

    #[error("Method {method} is not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KestrunError {
    /// HTTP status the host answers with when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            KestrunError::PoolExhaustedTimeout(_) | KestrunError::PoolDisposed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            KestrunError::Unauthorized => StatusCode::UNAUTHORIZED,
            KestrunError::Forbidden(_) => StatusCode::FORBIDDEN,
            KestrunError::NotFound(_) => StatusCode::NOT_FOUND,
            KestrunError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            KestrunError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            KestrunError::Transport(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Compilation diagnostics, if this is a compilation failure.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            KestrunError::ScriptCompilation { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, KestrunError>;
