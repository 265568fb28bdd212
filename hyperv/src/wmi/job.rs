//! WMI job tracking.
//!
//! Hyper-V WMI methods either finish synchronously or start an
//! `Msvm_ConcreteJob` and return its path. The tracker classifies the raw
//! method result, polls started jobs to a terminal state and normalizes the
//! provider's codes into an [`OperationResult`].
//!
//! Everything is built from two primitives, [`JobTracker::begin`] and
//! [`JobTracker::poll`]. A [`TrackedJob`] is consumed by each poll and only
//! handed back while it is still running, so a finished job cannot be polled
//! again.

use core::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::transport::RawCallResult;
use super::value::WmiObject;
use crate::config::PollPolicy;
use crate::error::{Error, Result};
use crate::result::{Failure, FailureCode, OperationResult, PartialCompletion, PendingJob, Warning};
use crate::suspend::Suspend;

/// Method return value: completed synchronously.
pub const RETURN_COMPLETED: u32 = 0;

/// Method return value: job started, see the `Job` out-parameter.
pub const RETURN_JOB_STARTED: u32 = 4096;

/// `Msvm_ConcreteJob.JobState` values as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProviderJobState {
    New = 2,
    Starting = 3,
    Running = 4,
    Suspended = 5,
    ShuttingDown = 6,
    Completed = 7,
    Terminated = 8,
    Killed = 9,
    Exception = 10,
    Service = 11,
}

impl ProviderJobState {
    pub fn from_raw(value: u16) -> Option<Self> {
        match value {
            2 => Some(ProviderJobState::New),
            3 => Some(ProviderJobState::Starting),
            4 => Some(ProviderJobState::Running),
            5 => Some(ProviderJobState::Suspended),
            6 => Some(ProviderJobState::ShuttingDown),
            7 => Some(ProviderJobState::Completed),
            8 => Some(ProviderJobState::Terminated),
            9 => Some(ProviderJobState::Killed),
            10 => Some(ProviderJobState::Exception),
            11 => Some(ProviderJobState::Service),
            _ => None,
        }
    }
}

/// Normalized job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    CompletedWithWarnings,
    Failed,
    Cancelled,
}

impl JobState {
    /// Map a provider state. `Completed` with a nonzero error code is a
    /// completion with warnings.
    pub fn from_provider(raw: ProviderJobState, error_code: u32, percent: u8) -> Self {
        match raw {
            ProviderJobState::New | ProviderJobState::Starting if percent > 0 => JobState::Running,
            ProviderJobState::New | ProviderJobState::Starting => JobState::Pending,
            ProviderJobState::Running
            | ProviderJobState::Suspended
            | ProviderJobState::ShuttingDown => JobState::Running,
            ProviderJobState::Completed if error_code == 0 => JobState::Completed,
            ProviderJobState::Completed => JobState::CompletedWithWarnings,
            ProviderJobState::Terminated | ProviderJobState::Killed => JobState::Cancelled,
            ProviderJobState::Exception | ProviderJobState::Service => JobState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "Pending"),
            JobState::Running => write!(f, "Running"),
            JobState::Completed => write!(f, "Completed"),
            JobState::CompletedWithWarnings => write!(f, "CompletedWithWarnings"),
            JobState::Failed => write!(f, "Failed"),
            JobState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Translate a provider return value, job error code or HRESULT.
pub fn classify(code: u32) -> FailureCode {
    match code {
        4097 | 32775 | 0x8007_139F => FailureCode::InvalidState,
        6 | 4099 | 32774 | 0x8007_00AA | 0x8007_0020 | 0x8007_0050 | 0x8007_00B7 => FailureCode::ResourceInUse,
        32769 | 0x8007_0005 | 0x8004_1003 => FailureCode::AccessDenied,
        0x8007_0002 | 0x8007_0003 | 0x8004_1002 | 0x8007_0490 => FailureCode::NotFound,
        other => FailureCode::Unknown(other),
    }
}

/// One read of an `Msvm_ConcreteJob`.
#[derive(Debug, Clone)]
struct JobSnapshot {
    raw_state: u16,
    percent: u32,
    error_code: u32,
    error_description: Option<String>,
    status: Option<String>,
}

impl JobSnapshot {
    fn read(job: &WmiObject) -> Result<Self> {
        Ok(Self {
            raw_state: job.require_u16("JobState")?,
            percent: job.get_u32("PercentComplete").unwrap_or(0),
            error_code: job.get_u32("ErrorCode").unwrap_or(0),
            error_description: job
                .get_str("ErrorDescription")
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            status: job.get_str("JobStatus").map(str::to_string),
        })
    }

    fn text(&self) -> Option<&str> {
        self.error_description.as_deref().or(self.status.as_deref())
    }
}

/// A provider job being waited on.
#[derive(Debug)]
pub(crate) struct TrackedJob {
    path: String,
    operation: String,
    state: JobState,
    percent: u8,
    started: Instant,
    interval: Duration,
    polls: u32,
    transport_failures: u32,
}

impl TrackedJob {
    fn new(path: &str, operation: &str, interval: Duration) -> Self {
        Self {
            path: path.to_string(),
            operation: operation.to_string(),
            state: JobState::Pending,
            percent: 0,
            started: Instant::now(),
            interval,
            polls: 0,
            transport_failures: 0,
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn state(&self) -> JobState {
        self.state
    }

    pub(crate) fn percent(&self) -> u8 {
        self.percent
    }

    pub(crate) fn polls(&self) -> u32 {
        self.polls
    }

    fn pending_job(&self) -> PendingJob {
        PendingJob::new(self.path.clone())
    }
}

/// Result of classifying a raw method result.
#[derive(Debug)]
pub(crate) enum Begin {
    Immediate(OperationResult),
    Track(TrackedJob),
}

/// Result of one poll.
#[derive(Debug)]
pub(crate) enum JobPoll {
    Ready(OperationResult),
    /// Still running; poll again after the delay.
    Pending(TrackedJob, Duration),
}

/// Waits on provider jobs with a shared cadence and timeout.
#[derive(Debug, Clone)]
pub(crate) struct JobTracker {
    policy: PollPolicy,
    timeout: Duration,
}

impl JobTracker {
    pub(crate) fn new(policy: PollPolicy, timeout: Duration) -> Self {
        Self { policy, timeout }
    }

    pub(crate) fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Classify a raw method result.
    ///
    /// - 0: completed synchronously
    /// - 4096: job started (check `Job` output parameter)
    /// - Other: error code
    pub(crate) fn begin(&self, raw: &RawCallResult, operation: &str) -> Begin {
        let code = match raw.return_value() {
            Ok(code) => code,
            Err(e) => return Begin::Immediate(OperationResult::Failure(Failure::from(e))),
        };

        match code {
            RETURN_COMPLETED => {
                debug!(operation, "completed synchronously");
                Begin::Immediate(OperationResult::success())
            }
            RETURN_JOB_STARTED => match raw.job_path() {
                Some(path) => {
                    debug!(operation, job = path, "job started");
                    Begin::Track(TrackedJob::new(path, operation, self.policy.initial_interval))
                }
                None => {
                    let mut failure = Failure::new(
                        FailureCode::Unknown(RETURN_JOB_STARTED),
                        format!("{}: job started but no job path was returned", operation),
                    );
                    failure.provider_code = Some(RETURN_JOB_STARTED);
                    Begin::Immediate(OperationResult::Failure(failure))
                }
            },
            code => {
                let message = raw
                    .error_description()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{} failed with return code {}", operation, code));
                debug!(operation, code, "method failed synchronously");
                Begin::Immediate(OperationResult::Failure(Failure::from_provider(code, message)))
            }
        }
    }

    /// Poll a job once through `fetch`, which reads the job object by path.
    pub(crate) fn poll<F>(&self, mut job: TrackedJob, fetch: F) -> JobPoll
    where
        F: FnOnce(&str) -> Result<WmiObject>,
    {
        if job.started.elapsed() >= self.timeout {
            return JobPoll::Ready(self.timed_out(&job));
        }

        job.polls += 1;
        let object = match fetch(&job.path) {
            Ok(object) => object,
            Err(Error::Disconnected) => {
                let failure = Failure::new(
                    FailureCode::Disconnected,
                    format!("session closed while waiting for {}", job.operation),
                );
                return JobPoll::Ready(self.unfinished(failure, &job));
            }
            Err(Error::Transport(e)) if e.is_not_found() => {
                warn!(operation = %job.operation, job = %job.path, "job object disappeared while polling");
                let failure = Failure::not_found(format!("job for {} disappeared: {}", job.operation, e.message))
                    .with_partial(PartialCompletion::Unknown);
                return JobPoll::Ready(OperationResult::Failure(failure));
            }
            Err(Error::Transport(e)) => {
                job.transport_failures += 1;
                if job.transport_failures > self.policy.max_transport_retries {
                    warn!(
                        operation = %job.operation,
                        job = %job.path,
                        attempts = job.transport_failures,
                        error = %e,
                        "giving up on job after repeated transport failures"
                    );
                    let failure = Failure::new(
                        FailureCode::TransportLost,
                        format!(
                            "lost contact with job after {} attempts: {}",
                            job.transport_failures, e.message
                        ),
                    );
                    return JobPoll::Ready(self.unfinished(failure, &job));
                }
                warn!(
                    operation = %job.operation,
                    job = %job.path,
                    attempt = job.transport_failures,
                    error = %e,
                    "transport failure while polling job, retrying"
                );
                return self.reschedule(job);
            }
            Err(other) => return JobPoll::Ready(self.unfinished(Failure::from(other), &job)),
        };
        job.transport_failures = 0;

        match JobSnapshot::read(&object) {
            Ok(snapshot) => self.observe(job, snapshot),
            Err(e) => JobPoll::Ready(self.unfinished(Failure::from(e), &job)),
        }
    }

    /// `begin` followed by polling until the job is terminal.
    pub(crate) async fn submit<S, F>(
        &self,
        raw: &RawCallResult,
        operation: &str,
        fetch: F,
        suspend: &mut S,
    ) -> OperationResult
    where
        S: Suspend,
        F: Fn(&str) -> Result<WmiObject>,
    {
        match self.begin(raw, operation) {
            Begin::Immediate(result) => result,
            Begin::Track(job) => self.wait(job, fetch, suspend).await,
        }
    }

    /// Poll until terminal. The first poll is immediate.
    pub(crate) async fn wait<S, F>(
        &self,
        mut job: TrackedJob,
        fetch: F,
        suspend: &mut S,
    ) -> OperationResult
    where
        S: Suspend,
        F: Fn(&str) -> Result<WmiObject>,
    {
        loop {
            match self.poll(job, &fetch) {
                JobPoll::Ready(result) => return result,
                JobPoll::Pending(next, delay) => {
                    if suspend.pause(delay).await.is_err() {
                        info!(
                            operation = %next.operation,
                            job = %next.path,
                            "wait cancelled by caller, provider job left running"
                        );
                        let failure = Failure::cancelled(format!(
                            "{} cancelled by caller while job was {} ({}% complete)",
                            next.operation, next.state, next.percent
                        ))
                        .with_pending_job(Some(next.pending_job()));
                        return OperationResult::Failure(failure);
                    }
                    job = next;
                }
            }
        }
    }

    fn observe(&self, mut job: TrackedJob, snapshot: JobSnapshot) -> JobPoll {
        let percent = snapshot.percent.min(100) as u8;
        if percent < job.percent {
            warn!(
                operation = %job.operation,
                job = %job.path,
                previous = job.percent,
                reported = percent,
                "provider reported decreasing progress, keeping previous value"
            );
        } else {
            job.percent = percent;
        }

        match ProviderJobState::from_raw(snapshot.raw_state) {
            Some(raw) => {
                let state = JobState::from_provider(raw, snapshot.error_code, job.percent);
                if !(job.state == JobState::Running && state == JobState::Pending) {
                    job.state = state;
                }
            }
            None => warn!(
                operation = %job.operation,
                job = %job.path,
                value = snapshot.raw_state,
                "unexpected job state from provider, treating as still running"
            ),
        }

        debug!(
            operation = %job.operation,
            job = %job.path,
            state = %job.state,
            percent = job.percent,
            poll = job.polls,
            "job progress"
        );

        if job.state.is_terminal() {
            JobPoll::Ready(self.finish(&job, snapshot))
        } else {
            self.reschedule(job)
        }
    }

    fn finish(&self, job: &TrackedJob, snapshot: JobSnapshot) -> OperationResult {
        let elapsed = job.started.elapsed();
        match job.state {
            JobState::CompletedWithWarnings => {
                let text = snapshot.text().map(str::to_string).unwrap_or_else(|| {
                    format!("job completed with error code {}", snapshot.error_code)
                });
                warn!(
                    operation = %job.operation,
                    job = %job.path,
                    code = snapshot.error_code,
                    "job completed with warnings: {}",
                    text
                );
                OperationResult::success_with(vec![Warning::with_code(snapshot.error_code, text)])
            }
            JobState::Failed => {
                let text = snapshot
                    .text()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{} failed", job.operation));
                debug!(operation = %job.operation, job = %job.path, code = snapshot.error_code, "job failed");
                OperationResult::Failure(Failure::from_provider(snapshot.error_code, text))
            }
            JobState::Cancelled => {
                let text = snapshot
                    .error_description
                    .clone()
                    .unwrap_or_else(|| format!("{} job was terminated", job.operation));
                let mut failure = Failure::cancelled(text);
                failure.provider_code = Some(snapshot.error_code).filter(|c| *c != 0);
                OperationResult::Failure(failure)
            }
            _ => {
                debug!(operation = %job.operation, job = %job.path, ?elapsed, "job completed");
                OperationResult::success()
            }
        }
    }

    fn reschedule(&self, mut job: TrackedJob) -> JobPoll {
        let remaining = self.timeout.saturating_sub(job.started.elapsed());
        let delay = job.interval.min(remaining);
        job.interval = self.policy.next_interval(job.interval);
        JobPoll::Pending(job, delay)
    }

    fn timed_out(&self, job: &TrackedJob) -> OperationResult {
        warn!(
            operation = %job.operation,
            job = %job.path,
            state = %job.state,
            percent = job.percent,
            timeout = ?self.timeout,
            "job did not finish in time"
        );
        let failure = Failure::new(
            FailureCode::Timeout,
            format!(
                "{} did not finish within {:?} (last state {}, {}% complete)",
                job.operation, self.timeout, job.state, job.percent
            ),
        );
        self.unfinished(failure, job)
    }

    fn unfinished(&self, failure: Failure, job: &TrackedJob) -> OperationResult {
        OperationResult::Failure(
            failure
                .with_partial(PartialCompletion::Unknown)
                .with_pending_job(Some(job.pending_job())),
        )
    }
}
