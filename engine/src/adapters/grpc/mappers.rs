//! Domain to wire mapping

use crate::domain::{BackendState, DomainError};
use crate::logs::{LogLine, LogSource};
use crate::proto::node_agent as pb;
use crate::supervisor::BackendHealth;
use tonic::Status;

pub fn state_to_proto(state: BackendState) -> pb::BackendState {
    match state {
        BackendState::Stopped => pb::BackendState::Stopped,
        BackendState::Starting => pb::BackendState::Starting,
        BackendState::Running => pb::BackendState::Running,
        BackendState::Stopping => pb::BackendState::Stopping,
        BackendState::Crashed(_) => pb::BackendState::Crashed,
        BackendState::Degraded => pb::BackendState::Degraded,
    }
}

pub fn log_line_to_proto(line: LogLine) -> pb::LogLine {
    let source = match line.source {
        LogSource::Stdout => pb::LogSource::Stdout,
        LogSource::Stderr => pb::LogSource::Stderr,
    };
    pb::LogLine {
        timestamp_ms: line.timestamp_ms,
        source: source as i32,
        backend_id: line.backend_id,
        text: line.text,
    }
}

pub fn health_to_proto(health: &BackendHealth) -> pb::BackendStatus {
    pb::BackendStatus {
        backend_id: health.id.clone(),
        kind: health.kind.to_string(),
        state: state_to_proto(health.state) as i32,
        pid: health.pid.unwrap_or(0),
        exit_code: health.exit_code.unwrap_or(0),
        uptime_sec: health.uptime.map(|d| d.as_secs()).unwrap_or(0),
        config_revision: health.config_revision.unwrap_or(0),
        consecutive_failures: health.consecutive_failures,
        last_error: health.last_error.clone().unwrap_or_default(),
        core_version: health.core_version.clone().unwrap_or_default(),
    }
}

/// Map a domain failure onto the closest gRPC status code. The message
/// is the domain error's display form; no internal detail leaks beyond
/// what the operator needs.
pub fn status_from(err: DomainError) -> Status {
    let message = err.to_string();
    match err {
        DomainError::BackendNotFound(_) => Status::not_found(message),
        DomainError::AlreadyRunning { .. } => Status::failed_precondition(message),
        DomainError::InvalidStateTransition { .. } => Status::failed_precondition(message),
        DomainError::NoPriorSnapshot(_) => Status::failed_precondition(message),
        DomainError::InvalidConfig(_) => Status::invalid_argument(message),
        DomainError::Conflict(_) => Status::aborted(message),
        DomainError::Authentication(_) => Status::unauthenticated(message),
        DomainError::Launch { .. } | DomainError::Io(_) => Status::internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            state_to_proto(BackendState::Crashed(137)),
            pb::BackendState::Crashed
        );
        assert_eq!(
            state_to_proto(BackendState::Degraded),
            pb::BackendState::Degraded
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            status_from(DomainError::BackendNotFound("x".into())).code(),
            Code::NotFound
        );
        assert_eq!(
            status_from(DomainError::AlreadyRunning {
                id: "x".into(),
                pid: 1
            })
            .code(),
            Code::FailedPrecondition
        );
        assert_eq!(
            status_from(DomainError::InvalidConfig("bad".into())).code(),
            Code::InvalidArgument
        );
        assert_eq!(
            status_from(DomainError::Conflict("x".into())).code(),
            Code::Aborted
        );
        assert_eq!(
            status_from(DomainError::NoPriorSnapshot("x".into())).code(),
            Code::FailedPrecondition
        );
    }
}
