#[cfg(windows)]
mod connection;
pub(crate) mod job;
mod query;
mod transport;
mod value;

#[cfg(windows)]
pub use connection::WmiTransport;
pub use job::{classify, JobState, ProviderJobState, RETURN_COMPLETED, RETURN_JOB_STARTED};
pub use query::{Call, MethodCall, Query, Reply};
pub use transport::{RawCallResult, Transport};
pub use value::{Value, WmiObject};
