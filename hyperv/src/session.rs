//! Sessions: the single chokepoint between the library and the provider.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::lifecycle::Controller;
use crate::msvm;
use crate::result::{OperationResult, PendingJob};
use crate::suspend::{run_blocking, Blocking, Cooperative};
use crate::vm::{DiskClone, VirtualSwitch, VmHandle, VmId, VmSpec};
use crate::wmi::job::JobTracker;
use crate::wmi::{Call, MethodCall, Query, RawCallResult, Reply, Transport, WmiObject};

/// Connection to a Hyper-V management namespace.
///
/// Cheap to clone; clones share the transport, the job tracker and the open
/// flag. Safe to use from several threads at once.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    transport: Box<dyn Transport>,
    tracker: JobTracker,
    open: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.inner.config.host_label())
            .field("namespace", &self.inner.config.namespace)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Connect to Hyper-V over COM/WMI.
///
/// The connection is established by the first call, which is also where
/// unreachable hosts and rejected credentials are reported.
#[cfg(windows)]
pub fn connect(config: SessionConfig) -> Result<Session> {
    let transport = crate::wmi::WmiTransport::new(&config);
    Session::open(config, transport)
}

impl Session {
    /// Open a session over an existing transport.
    pub fn open<T: Transport + 'static>(config: SessionConfig, transport: T) -> Result<Self> {
        config.validate()?;
        info!(
            host = config.host_label(),
            namespace = %config.namespace,
            "opened Hyper-V session"
        );
        let tracker = JobTracker::new(config.poll.clone(), config.job_timeout);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport: Box::new(transport),
                tracker,
                open: AtomicBool::new(true),
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Close the session. Idempotent; later calls fail with `Disconnected`.
    pub fn close(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            self.inner.transport.close();
            info!(host = self.inner.config.host_label(), "closed Hyper-V session");
        }
    }

    /// Send one call to the provider with the configured timeout.
    pub fn invoke(&self, call: &Call) -> Result<Reply> {
        if !self.is_open() {
            return Err(Error::Disconnected);
        }
        debug!(host = self.inner.config.host_label(), call = %call.describe(), "provider call");
        self.inner
            .transport
            .invoke(call, self.inner.config.call_timeout)
            .map_err(|e| {
                debug!(call = %call.describe(), error = %e, "provider call failed");
                Error::Transport(e)
            })
    }

    pub(crate) fn query(&self, query: Query) -> Result<Vec<WmiObject>> {
        Ok(self.invoke(&Call::Query(query))?.into_objects())
    }

    pub(crate) fn query_first(&self, query: Query) -> Result<Option<WmiObject>> {
        Ok(self.query(query)?.into_iter().next())
    }

    pub(crate) fn get_object(&self, path: &str) -> Result<WmiObject> {
        let reply = self.invoke(&Call::Get {
            path: path.to_string(),
        })?;
        Ok(reply.into_object()?)
    }

    pub(crate) fn exec(&self, call: MethodCall) -> Result<RawCallResult> {
        let reply = self.invoke(&Call::Exec(call))?;
        Ok(RawCallResult::new(reply.into_object()?))
    }

    pub(crate) fn tracker(&self) -> &JobTracker {
        &self.inner.tracker
    }

    /// All VMs on the host.
    pub fn list_vms(&self) -> Result<Vec<VmHandle>> {
        self.query(msvm::vms())?
            .iter()
            .map(|obj| VmHandle::from_wmi(self.clone(), obj))
            .collect()
    }

    /// VMs with the given display name. Names are not unique in Hyper-V.
    pub fn find_vms(&self, name: &str) -> Result<Vec<VmHandle>> {
        self.query(msvm::vms_named(name))?
            .iter()
            .map(|obj| VmHandle::from_wmi(self.clone(), obj))
            .collect()
    }

    /// VM by GUID.
    pub fn get_vm(&self, id: &str) -> Result<VmHandle> {
        let id = VmId::parse(id)?;
        match self.query_first(msvm::vm_by_id(&id))? {
            Some(obj) => VmHandle::from_wmi(self.clone(), &obj),
            None => Err(Error::VmNotFound(id.to_string())),
        }
    }

    /// All virtual switches on the host.
    pub fn switches(&self) -> Result<Vec<VirtualSwitch>> {
        self.query(msvm::switches())?
            .iter()
            .map(VirtualSwitch::from_wmi)
            .collect()
    }

    /// The one switch with this display name.
    pub fn switch_by_name(&self, name: &str) -> Result<VirtualSwitch> {
        single_switch(self.query(msvm::switch_by_name(name))?, name)
    }

    /// Switch by GUID.
    pub fn switch_by_id(&self, id: &str) -> Result<VirtualSwitch> {
        single_switch(self.query(msvm::switch_by_id(id))?, id)
    }

    /// Clone a virtual hard disk file, as a differencing child or a full copy.
    pub fn clone_disk(&self, clone: &DiskClone) -> OperationResult {
        let mut controller = Controller::new(self, Blocking);
        run_blocking(controller.clone_disk(clone))
    }

    pub async fn clone_disk_async(&self, clone: &DiskClone, cancel: &CancellationToken) -> OperationResult {
        let mut controller = Controller::new(self, Cooperative::new(cancel));
        controller.clone_disk(clone).await
    }

    /// Define a VM and apply its memory and processor settings.
    pub fn define_vm(&self, spec: &VmSpec) -> Result<VmHandle> {
        let mut controller = Controller::new(self, Blocking);
        run_blocking(controller.define(spec))
    }

    pub async fn define_vm_async(
        &self,
        spec: &VmSpec,
        cancel: &CancellationToken,
    ) -> Result<VmHandle> {
        let mut controller = Controller::new(self, Cooperative::new(cancel));
        controller.define(spec).await
    }

    /// Terminate a job left running by a timed-out or cancelled operation.
    pub fn terminate_job(&self, job: &PendingJob) -> OperationResult {
        let mut controller = Controller::new(self, Blocking);
        run_blocking(controller.terminate_job(job))
    }

    pub async fn terminate_job_async(
        &self,
        job: &PendingJob,
        cancel: &CancellationToken,
    ) -> OperationResult {
        let mut controller = Controller::new(self, Cooperative::new(cancel));
        controller.terminate_job(job).await
    }
}

fn single_switch(mut found: Vec<WmiObject>, key: &str) -> Result<VirtualSwitch> {
    match found.len() {
        0 => Err(Error::SwitchNotFound(key.to_string())),
        1 => VirtualSwitch::from_wmi(&found.remove(0)),
        count => Err(Error::AmbiguousSwitch {
            name: key.to_string(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
        closed: AtomicUsize,
    }

    impl Transport for CountingTransport {
        fn invoke(&self, _call: &Call, timeout: Duration) -> core::result::Result<Reply, TransportError> {
            assert_eq!(timeout, Duration::from_secs(7));
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Reply::Objects(Vec::new()))
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session(transport: Arc<CountingTransport>) -> Session {
        let config = SessionConfig::default().with_call_timeout(Duration::from_secs(7));
        Session::open(config, transport).unwrap()
    }

    #[test]
    fn invoke_passes_call_timeout() {
        let transport = Arc::new(CountingTransport::default());
        let session = session(transport.clone());
        assert!(session.list_vms().unwrap().is_empty());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_is_idempotent_and_disconnects() {
        let transport = Arc::new(CountingTransport::default());
        let session = session(transport.clone());
        let clone = session.clone();

        session.close();
        session.close();
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert!(!clone.is_open());
        assert!(matches!(clone.list_vms(), Err(Error::Disconnected)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn open_rejects_invalid_config() {
        let config = SessionConfig::default().with_namespace("");
        let result = Session::open(config, CountingTransport::default());
        assert!(matches!(result, Err(Error::Validation { field: "namespace", .. })));
    }

    #[test]
    fn get_vm_validates_id_before_calling() {
        let transport = Arc::new(CountingTransport::default());
        let session = session(transport.clone());
        assert!(matches!(session.get_vm("not-a-guid"), Err(Error::InvalidVmId(_))));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        let missing = session.get_vm("5c8f5e1a-0b3d-4f7e-9a61-2d7f3b1c9e40");
        assert!(matches!(missing, Err(Error::VmNotFound(_))));
    }

    #[test]
    fn session_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Session>();
    }
}
