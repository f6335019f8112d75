use anvil_model::{ErrorKind, OpError, PortClaim};
use bollard::errors::Error as BollardError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("execution backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("host port conflict: {}", join_claims(.0))]
    PortConflict(Vec<PortClaim>),
    #[error("no free host ports in {start}..=65535 (tried up to {end} first): {}", join_claims(.conflicts))]
    NoPortsAvailable {
        start: u16,
        end: u16,
        conflicts: Vec<PortClaim>,
    },
    #[error("{channel} timed out after {timeout_ms}ms")]
    ProtocolTimeout {
        channel: &'static str,
        timeout_ms: u64,
    },
    #[error("{channel}: {message}")]
    Protocol {
        channel: &'static str,
        message: String,
    },
    #[error("inconsistent state: {0}")]
    CorruptState(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid {field}: {message}")]
    InvalidParam { field: String, message: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

fn join_claims(claims: &[PortClaim]) -> String {
    if claims.is_empty() {
        return "-".to_string();
    }
    claims
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            RuntimeError::NotFound(_) => ErrorKind::NotFound,
            RuntimeError::PortConflict(_) => ErrorKind::PortConflict,
            RuntimeError::NoPortsAvailable { .. } => ErrorKind::NoPortsAvailable,
            RuntimeError::ProtocolTimeout { .. } | RuntimeError::Protocol { .. } => {
                ErrorKind::ProtocolTimeout
            }
            RuntimeError::CorruptState(_) => ErrorKind::CorruptState,
            RuntimeError::Unsupported(_) => ErrorKind::Unsupported,
            RuntimeError::InvalidParam { .. } => ErrorKind::InvalidParam,
            RuntimeError::Io { .. } | RuntimeError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        RuntimeError::InvalidParam {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn protocol(channel: &'static str, message: impl Into<String>) -> Self {
        RuntimeError::Protocol {
            channel,
            message: message.into(),
        }
    }

    /// `map_err` adapter for io failures.
    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> RuntimeError {
        let context = context.into();
        move |source| RuntimeError::Io { context, source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    pub fn conflicts(&self) -> &[PortClaim] {
        match self {
            RuntimeError::PortConflict(c) => c,
            RuntimeError::NoPortsAvailable { conflicts, .. } => conflicts,
            _ => &[],
        }
    }
}

impl From<BollardError> for RuntimeError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                404 => RuntimeError::NotFound(message),
                400 | 409 => RuntimeError::invalid("docker", message),
                _ => RuntimeError::Internal(format!("docker api {status_code}: {message}")),
            },
            BollardError::IOError { err } => RuntimeError::BackendUnavailable(err.to_string()),
            other => {
                let msg = other.to_string();
                let lower = msg.to_ascii_lowercase();
                if ["connect", "socket", "timed out", "timeout", "hyper"]
                    .iter()
                    .any(|k| lower.contains(k))
                {
                    RuntimeError::BackendUnavailable(msg)
                } else {
                    RuntimeError::Internal(msg)
                }
            }
        }
    }
}

impl From<RuntimeError> for OpError {
    fn from(err: RuntimeError) -> Self {
        OpError {
            kind: err.kind(),
            message: truncate_utf8(&err.to_string(), MAX_MESSAGE_BYTES),
            conflicts: err.conflicts().to_vec(),
        }
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_model::Protocol;

    #[test]
    fn op_error_truncates_message() {
        let long = "a".repeat(MAX_MESSAGE_BYTES + 1024);
        let op: OpError = RuntimeError::Internal(long).into();
        assert_eq!(op.kind, ErrorKind::Internal);
        assert!(op.message.len() <= MAX_MESSAGE_BYTES);
        assert!(op.message.ends_with("…(truncated)"));
    }

    #[test]
    fn port_conflict_carries_claims() {
        let claims = vec![PortClaim {
            port: 25565,
            protocol: Protocol::Tcp,
            owner: Some("lobby".to_string()),
        }];
        let op: OpError = RuntimeError::PortConflict(claims.clone()).into();
        assert_eq!(op.kind, ErrorKind::PortConflict);
        assert_eq!(op.conflicts, claims);
        assert!(op.message.contains("25565/tcp"));
    }

    #[test]
    fn docker_404_maps_to_not_found() {
        let err: RuntimeError = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: mc".to_string(),
        }
        .into();
        assert!(err.is_not_found());
    }

    #[test]
    fn error_chain_skips_duplicates() {
        let err = anyhow::anyhow!("inner").context("outer").context("outer");
        assert_eq!(format_error_chain(&err), "outer: inner");
    }
}
