//! Operation outcomes.
//!
//! Every provider operation ends in an [`OperationResult`]. Failures keep the
//! provider's own text and numeric code next to the normalized
//! [`FailureCode`], plus enough sequencing context to tell the caller what
//! was already applied.

use core::fmt;

use serde::Serialize;

use crate::error::{Error, Result, TransportErrorKind};
use crate::lifecycle::StepPolicy;

/// Normalized failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureCode {
    /// The job did not reach a terminal state within the job timeout.
    Timeout,
    /// The caller withdrew interest, or the provider terminated the job.
    Cancelled,
    /// Polling a job kept failing at the transport level.
    TransportLost,
    /// The session was closed.
    Disconnected,
    /// A transport call failed outright.
    Transport(TransportErrorKind),
    /// The VM (or job) is not in a state that allows the operation.
    InvalidState,
    /// The resource is locked or busy.
    ResourceInUse,
    /// The caller lacks the rights for the operation.
    AccessDenied,
    /// A VM, file or other object does not exist.
    NotFound,
    /// The request was rejected before reaching the provider.
    InvalidRequest,
    /// Any provider code without a more specific mapping.
    Unknown(u32),
}

impl FailureCode {
    /// Whether the same operation could plausibly succeed if retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            FailureCode::Timeout | FailureCode::TransportLost | FailureCode::ResourceInUse => true,
            FailureCode::Transport(kind) => kind.is_transient(),
            _ => false,
        }
    }

    /// Codes that end a lifecycle sequence regardless of step policy.
    pub(crate) fn stops_sequence(&self) -> bool {
        matches!(self, FailureCode::Cancelled | FailureCode::Disconnected)
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCode::Timeout => write!(f, "Timeout"),
            FailureCode::Cancelled => write!(f, "Cancelled"),
            FailureCode::TransportLost => write!(f, "TransportLost"),
            FailureCode::Disconnected => write!(f, "Disconnected"),
            FailureCode::Transport(kind) => write!(f, "Transport({})", kind),
            FailureCode::InvalidState => write!(f, "InvalidState"),
            FailureCode::ResourceInUse => write!(f, "ResourceInUse"),
            FailureCode::AccessDenied => write!(f, "AccessDenied"),
            FailureCode::NotFound => write!(f, "NotFound"),
            FailureCode::InvalidRequest => write!(f, "InvalidRequest"),
            FailureCode::Unknown(code) => write!(f, "Unknown({})", code),
        }
    }
}

/// Whether a failed operation left changes behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartialCompletion {
    No,
    Yes,
    Unknown,
}

/// Opaque token naming a provider job that was left running.
///
/// Returned on timeout and cancellation so the caller can decide whether to
/// terminate the job with [`Session::terminate_job`](crate::Session::terminate_job).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PendingJob(String);

impl PendingJob {
    pub(crate) fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub(crate) fn path(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PendingJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Non-fatal condition reported by a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub provider_code: Option<u32>,
    pub message: String,
}

impl Warning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            provider_code: None,
            message: message.into(),
        }
    }

    pub(crate) fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            provider_code: Some(code),
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.provider_code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// What happened to one step of a lifecycle request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed { warnings: Vec<Warning> },
    Failed { code: FailureCode, message: String },
    NotRun,
}

/// Per-step report attached to a lifecycle failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub operation: String,
    pub policy: StepPolicy,
    pub outcome: StepOutcome,
}

/// A provider operation that ran and did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub code: FailureCode,
    /// Provider text when there is one.
    pub message: String,
    /// Raw numeric code as reported by the provider.
    pub provider_code: Option<u32>,
    pub partial: PartialCompletion,
    /// Steps that completed before the sequence stopped.
    pub completed_steps: usize,
    /// Index of the step that decided the failure.
    pub failed_step: Option<usize>,
    pub steps: Vec<StepReport>,
    /// Job still running on the provider side.
    pub pending_job: Option<PendingJob>,
}

impl Failure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            provider_code: None,
            partial: PartialCompletion::No,
            completed_steps: 0,
            failed_step: None,
            steps: Vec::new(),
            pending_job: None,
        }
    }

    /// Failure translated from a provider return value or job error code.
    pub(crate) fn from_provider(code: u32, message: impl Into<String>) -> Self {
        Self {
            provider_code: Some(code),
            ..Self::new(crate::wmi::job::classify(code), message)
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(FailureCode::InvalidState, message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureCode::NotFound, message)
    }

    pub(crate) fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureCode::Cancelled, message).with_partial(PartialCompletion::Unknown)
    }

    pub(crate) fn with_partial(mut self, partial: PartialCompletion) -> Self {
        self.partial = partial;
        self
    }

    pub(crate) fn with_pending_job(mut self, job: Option<PendingJob>) -> Self {
        self.pending_job = job;
        self
    }

    pub(crate) fn context(mut self, prefix: impl fmt::Display) -> Self {
        self.message = format!("{}: {}", prefix, self.message);
        self
    }

    /// Whether some change may have been applied before the failure.
    pub fn is_partial(&self) -> bool {
        self.partial != PartialCompletion::No
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(code) = self.provider_code {
            write!(f, " (provider code {})", code)?;
        }
        if let Some(step) = self.failed_step {
            write!(f, " [step {}, {} completed]", step, self.completed_steps)?;
        }
        Ok(())
    }
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        match err {
            Error::Operation(failure) => failure,
            Error::Disconnected => {
                Failure::new(FailureCode::Disconnected, "session is closed")
            }
            Error::Transport(e) if e.is_not_found() => Failure::not_found(e.message),
            Error::Transport(e) => Failure::new(FailureCode::Transport(e.kind), e.message),
            Error::VmNotFound(id) => Failure::not_found(format!("VM not found: {}", id)),
            e @ Error::SwitchNotFound(_) => Failure::not_found(e.to_string()),
            e @ Error::MissingProperty { .. } => Failure::new(
                FailureCode::Transport(TransportErrorKind::MalformedResponse),
                e.to_string(),
            ),
            other => Failure::new(FailureCode::InvalidRequest, other.to_string()),
        }
    }
}

/// Outcome of a provider operation.
#[must_use]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationResult {
    Success { warnings: Vec<Warning> },
    Failure(Failure),
}

impl OperationResult {
    pub fn success() -> Self {
        OperationResult::Success {
            warnings: Vec::new(),
        }
    }

    pub fn success_with(warnings: Vec<Warning>) -> Self {
        OperationResult::Success { warnings }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn warnings(&self) -> &[Warning] {
        match self {
            OperationResult::Success { warnings } => warnings,
            OperationResult::Failure(_) => &[],
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            OperationResult::Failure(f) => Some(f),
            OperationResult::Success { .. } => None,
        }
    }

    pub fn code(&self) -> Option<FailureCode> {
        self.failure().map(|f| f.code)
    }

    /// Convert into a `Result`, turning a failure into [`Error::Operation`].
    pub fn into_result(self) -> Result<Vec<Warning>> {
        match self {
            OperationResult::Success { warnings } => Ok(warnings),
            OperationResult::Failure(f) => Err(Error::Operation(f)),
        }
    }
}

impl From<core::result::Result<Vec<Warning>, Failure>> for OperationResult {
    fn from(outcome: core::result::Result<Vec<Warning>, Failure>) -> Self {
        match outcome {
            Ok(warnings) => OperationResult::Success { warnings },
            Err(failure) => OperationResult::Failure(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn transient_codes() {
        assert!(FailureCode::Timeout.is_transient());
        assert!(FailureCode::ResourceInUse.is_transient());
        assert!(FailureCode::Transport(TransportErrorKind::Network).is_transient());
        assert!(!FailureCode::AccessDenied.is_transient());
        assert!(!FailureCode::Unknown(32768).is_transient());
    }

    #[test]
    fn provider_failure_keeps_text_and_code() {
        let failure = Failure::from_provider(32775, "The operation cannot be performed while the object is in its current state.");
        assert_eq!(failure.code, FailureCode::InvalidState);
        assert_eq!(failure.provider_code, Some(32775));
        assert!(failure.message.starts_with("The operation cannot"));
        assert!(!failure.is_partial());
    }

    #[test]
    fn error_conversion() {
        let failure: Failure = Error::Disconnected.into();
        assert_eq!(failure.code, FailureCode::Disconnected);

        let failure: Failure = Error::Transport(TransportError::auth_failed("denied")).into();
        assert_eq!(failure.code, FailureCode::Transport(TransportErrorKind::AuthFailed));

        let failure: Failure = Error::validation("path", "cannot be empty").into();
        assert_eq!(failure.code, FailureCode::InvalidRequest);
    }

    #[test]
    fn result_serializes_with_outcome_tag() {
        let ok = OperationResult::success_with(vec![Warning::with_code(1, "slow disk")]);
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["warnings"][0]["provider_code"], 1);

        let failed = OperationResult::Failure(Failure::new(FailureCode::Timeout, "job timed out"));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["code"], "Timeout");
        assert_eq!(json["partial"], "No");
    }

    #[test]
    fn into_result_maps_failure_to_error() {
        let err = OperationResult::Failure(Failure::not_found("gone"))
            .into_result()
            .unwrap_err();
        assert!(matches!(err, Error::Operation(ref f) if f.code == FailureCode::NotFound));
    }
}
