//! The seam between the client and the WMI provider.

use std::sync::Arc;
use std::time::Duration;

use super::query::{Call, Reply};
use super::value::WmiObject;
use crate::error::{Error, Result, TransportError};

/// Carries calls to a WMI provider.
///
/// Implementations must be safe to call from several threads at once and
/// must not cache results: every `invoke` is a fresh round trip.
pub trait Transport: Send + Sync {
    fn invoke(&self, call: &Call, timeout: Duration) -> core::result::Result<Reply, TransportError>;

    /// Release the connection. Called once when the owning session closes.
    fn close(&self) {}
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn invoke(&self, call: &Call, timeout: Duration) -> core::result::Result<Reply, TransportError> {
        (**self).invoke(call, timeout)
    }

    fn close(&self) {
        (**self).close()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn invoke(&self, call: &Call, timeout: Duration) -> core::result::Result<Reply, TransportError> {
        (**self).invoke(call, timeout)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Out-parameters of a provider method call.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCallResult(WmiObject);

impl RawCallResult {
    pub fn new(out_params: WmiObject) -> Self {
        Self(out_params)
    }

    /// `ReturnValue` out-parameter.
    pub fn return_value(&self) -> Result<u32> {
        self.0
            .get_u32("ReturnValue")
            .ok_or_else(|| Error::missing_property(self.0.class(), "ReturnValue"))
    }

    /// Path of the job started by the call (`Job` out-parameter).
    pub fn job_path(&self) -> Option<&str> {
        self.0.get_str("Job").filter(|p| !p.is_empty())
    }

    /// Provider error text when the call failed synchronously.
    pub fn error_description(&self) -> Option<&str> {
        self.0.get_str("ErrorDescription")
    }

    pub fn out(&self) -> &WmiObject {
        &self.0
    }
}
