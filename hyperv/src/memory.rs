//! In-memory Hyper-V provider.
//!
//! [`InMemoryHyperV`] implements [`Transport`] over a simulated
//! `root\virtualization\v2` namespace. It models VMs with their settings,
//! controllers and shutdown components, primordial resource pools with
//! default settings, and `Msvm_ConcreteJob`s that advance one scripted
//! [`Frame`] per poll. Hooks inject provider errors, job scripts, transport
//! faults and uncooperative guests.
//!
//! Clones share the same namespace, so a test can hand one clone to a
//! [`Session`](crate::Session) and inspect the host through another.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::error::TransportError;
use crate::msvm::{self, subtype};
use crate::result::PendingJob;
use crate::vm::{ComPort, ControllerKind, Generation, GuestIpSpec, VmId, VmState};
use crate::wmi::{Call, MethodCall, Query, Reply, Transport, Value, WmiObject};

const NAMESPACE: &str = r"\\SIMHOST\root\virtualization\v2";

const INVALID_PARAMETER: u32 = 32773;
const INVALID_STATE: u32 = 32775;
const NOT_SUPPORTED: u32 = 32770;
const NOT_FOUND: u32 = 0x8004_1002;
const FILE_NOT_FOUND: u32 = 0x8007_0002;
const FILE_EXISTS: u32 = 0x8007_0050;

type Effect = Box<dyn FnOnce(&mut Sim) + Send>;

/// One observation of a simulated job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    New,
    Running(u8),
    Completed,
    /// Completed with a nonzero error code.
    Warning { code: u32, message: String },
    /// Exception state with an error code and description.
    Failed { code: u32, message: String },
    Terminated,
    /// Arbitrary `JobState`/`PercentComplete`, for malformed or odd providers.
    Raw { state: u16, percent: u16 },
}

impl Frame {
    fn job_state(&self) -> u16 {
        match self {
            Frame::New => 2,
            Frame::Running(_) => 4,
            Frame::Completed | Frame::Warning { .. } => 7,
            Frame::Terminated => 8,
            Frame::Failed { .. } => 10,
            Frame::Raw { state, .. } => *state,
        }
    }

    fn percent(&self) -> u16 {
        match self {
            Frame::New => 0,
            Frame::Running(p) => u16::from(*p),
            Frame::Completed | Frame::Warning { .. } => 100,
            Frame::Failed { .. } | Frame::Terminated => 0,
            Frame::Raw { percent, .. } => *percent,
        }
    }

    fn is_terminal(&self) -> bool {
        (7..=11).contains(&self.job_state())
    }

    fn succeeded(&self) -> bool {
        self.job_state() == 7
    }

    fn to_object(&self, path: &str) -> WmiObject {
        let mut props = BTreeMap::new();
        props.insert("JobState".to_string(), Value::U16(self.job_state()));
        props.insert("PercentComplete".to_string(), Value::U16(self.percent()));
        let (code, text) = match self {
            Frame::Warning { code, message } | Frame::Failed { code, message } => (*code, message.as_str()),
            _ => (0, ""),
        };
        props.insert("ErrorCode".to_string(), Value::U32(code));
        props.insert("ErrorDescription".to_string(), Value::from(text));
        WmiObject::from_provider(msvm::CONCRETE_JOB, Some(path.to_string()), props)
    }
}

/// Frames a job reports, one per poll. The last frame repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScript {
    frames: Vec<Frame>,
}

impl JobScript {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    /// Running, then completed. The default for every job.
    pub fn completes() -> Self {
        Self::new([Frame::Running(50), Frame::Completed])
    }

    pub fn warns(code: u32, message: impl Into<String>) -> Self {
        Self::new([
            Frame::Running(60),
            Frame::Warning {
                code,
                message: message.into(),
            },
        ])
    }

    pub fn fails(code: u32, message: impl Into<String>) -> Self {
        Self::new([
            Frame::Running(30),
            Frame::Failed {
                code,
                message: message.into(),
            },
        ])
    }

    /// Never reaches a terminal state.
    pub fn stalls() -> Self {
        Self::new([Frame::Running(10)])
    }
}

struct SimJob {
    frames: VecDeque<Frame>,
    current: Frame,
    on_success: Vec<Effect>,
    on_failure: Vec<Effect>,
    finished: bool,
}

struct Link {
    class: String,
    ends: (String, String),
    object: WmiObject,
}

impl Link {
    fn other_end(&self, path: &str) -> Option<&str> {
        if self.ends.0.eq_ignore_ascii_case(path) {
            Some(&self.ends.1)
        } else if self.ends.1.eq_ignore_ascii_case(path) {
            Some(&self.ends.0)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Sim {
    objects: BTreeMap<String, WmiObject>,
    links: Vec<Link>,
    jobs: BTreeMap<String, SimJob>,
    next_id: u64,
    synchronous: bool,
    scripts: HashMap<String, VecDeque<JobScript>>,
    failures: HashMap<String, VecDeque<u32>>,
    call_faults: VecDeque<TransportError>,
    poll_faults: u32,
    stalled_polls: u32,
    missing_files: BTreeSet<String>,
    /// Disk files known to the image service, by lowercased path, with their parent.
    disks: BTreeMap<String, Option<String>>,
    ignoring_shutdown: BTreeSet<String>,
    transitions: BTreeMap<String, (u16, u32)>,
    calls: Vec<String>,
    method_calls: Vec<String>,
    job_polls: u32,
    closes: u32,
}

/// Simulated Hyper-V host. See the [module docs](self).
#[derive(Clone)]
pub struct InMemoryHyperV {
    sim: Arc<Mutex<Sim>>,
}

impl std::fmt::Debug for InMemoryHyperV {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sim = self.lock();
        f.debug_struct("InMemoryHyperV")
            .field("objects", &sim.objects.len())
            .field("jobs", &sim.jobs.len())
            .finish()
    }
}

impl Default for InMemoryHyperV {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHyperV {
    /// Host with a management service and resource pools, but no VMs.
    pub fn new() -> Self {
        let mut sim = Sim::default();
        sim.seed_host();
        Self {
            sim: Arc::new(Mutex::new(sim)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sim> {
        self.sim.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a VM in `state`. Gen1 VMs get two IDE controllers, Gen2 one SCSI.
    pub fn add_vm(&self, name: &str, generation: Generation, state: VmState) -> VmId {
        let id = VmId::from_uuid(Uuid::new_v4());
        self.lock()
            .create_vm(id.as_str(), name, generation, None, state.to_enabled_state());
        id
    }

    /// Add a virtual switch and return its id.
    pub fn add_switch(&self, name: &str) -> String {
        let mut sim = self.lock();
        let id = Uuid::new_v4().to_string().to_uppercase();
        sim.store(
            WmiObject::new(msvm::ETHERNET_SWITCH).with("ElementName", name),
            "Name",
            &id,
        );
        id
    }

    /// Delete a switch, leaving adapter connections that still point at it.
    pub fn remove_switch(&self, id: &str) {
        self.lock().objects.remove(&object_path(msvm::ETHERNET_SWITCH, "Name", id));
    }

    /// Put a disk file on the host for the image service to read.
    pub fn add_disk(&self, path: &str) {
        self.lock().disks.insert(path.to_ascii_lowercase(), None);
    }

    pub fn disk_exists(&self, path: &str) -> bool {
        self.lock().disks.contains_key(&path.to_ascii_lowercase())
    }

    /// Parent of a differencing disk.
    pub fn disk_parent(&self, path: &str) -> Option<String> {
        self.lock().disks.get(&path.to_ascii_lowercase()).cloned().flatten()
    }

    /// Methods return 0 and apply their effect at once, unless a script is queued.
    pub fn set_synchronous(&self, synchronous: bool) {
        self.lock().synchronous = synchronous;
    }

    /// The next job started by `method` follows `script`.
    pub fn script_next(&self, method: &str, script: JobScript) {
        self.lock()
            .scripts
            .entry(method.to_string())
            .or_default()
            .push_back(script);
    }

    /// The next call to `method` returns `code` synchronously.
    pub fn fail_next(&self, method: &str, code: u32) {
        self.lock()
            .failures
            .entry(method.to_string())
            .or_default()
            .push_back(code);
    }

    /// The next transport call of any kind fails with `error`.
    pub fn fail_next_call(&self, error: TransportError) {
        self.lock().call_faults.push_back(error);
    }

    /// The next `count` job polls fail with a network error.
    pub fn fail_job_polls(&self, count: u32) {
        self.lock().poll_faults = count;
    }

    /// The next `count` job polls hang until the per-call timeout expires.
    pub fn stall_job_polls(&self, count: u32) {
        self.lock().stalled_polls = count;
    }

    /// Attaching `path` fails the way a missing file does.
    pub fn missing_file(&self, path: &str) {
        self.lock().missing_files.insert(path.to_ascii_lowercase());
    }

    /// The guest acknowledges shutdown requests and keeps running.
    pub fn guest_ignores_shutdown(&self, id: &VmId) {
        self.lock().ignoring_shutdown.insert(id.to_string());
    }

    pub fn remove_shutdown_component(&self, id: &VmId) {
        let mut sim = self.lock();
        sim.objects.retain(|_, o| {
            !(o.class() == msvm::SHUTDOWN_COMPONENT && o.get_str("SystemName") == Some(id.as_str()))
        });
    }

    pub fn set_vm_state(&self, id: &VmId, state: VmState) {
        self.lock()
            .set_enabled_state(&vm_path(id.as_str()), state.to_enabled_state());
    }

    /// Put the VM in `from` and let it settle into `to` on the `reads`-th
    /// VM query.
    pub fn transition(&self, id: &VmId, from: VmState, to: VmState, reads: u32) {
        let mut sim = self.lock();
        let path = vm_path(id.as_str());
        sim.set_enabled_state(&path, from.to_enabled_state());
        sim.transitions.insert(path, (to.to_enabled_state(), reads));
    }

    /// Force a pending job to completed; it reports so on its next poll.
    pub fn complete_job(&self, job: &PendingJob) {
        if let Some(job) = self.lock().jobs.get_mut(job.path()) {
            job.frames.clear();
            job.current = Frame::Completed;
        }
    }

    /// Drop a job object, as the host does once `TimeBeforeRemoval` elapses.
    pub fn remove_job(&self, job: &PendingJob) {
        self.lock().jobs.remove(job.path());
    }

    /// Raw `JobState` of a job, as last reported.
    pub fn job_state(&self, job: &PendingJob) -> Option<u16> {
        self.lock().jobs.get(job.path()).map(|j| j.current.job_state())
    }

    pub fn vm_exists(&self, id: &VmId) -> bool {
        self.lock().objects.contains_key(&vm_path(id.as_str()))
    }

    pub fn vm_state(&self, id: &VmId) -> Option<VmState> {
        self.lock()
            .objects
            .get(&vm_path(id.as_str()))
            .and_then(|vm| vm.get_u16("EnabledState"))
            .map(VmState::from_enabled_state)
    }

    pub fn vm_ids_named(&self, name: &str) -> Vec<VmId> {
        self.lock()
            .objects
            .values()
            .filter(|o| o.class() == msvm::COMPUTER_SYSTEM && o.get_str("ElementName") == Some(name))
            .filter_map(|o| o.get_str("Name").and_then(|id| VmId::parse(id).ok()))
            .collect()
    }

    pub fn memory_mb(&self, id: &VmId) -> Option<u64> {
        self.lock()
            .components(id.as_str(), msvm::MEMORY_SETTINGS)
            .first()
            .and_then(|m| m.get_u64("VirtualQuantity"))
    }

    pub fn dynamic_memory(&self, id: &VmId) -> Option<(u64, u64)> {
        let sim = self.lock();
        let memory = sim.components(id.as_str(), msvm::MEMORY_SETTINGS).into_iter().next()?;
        if memory.get_bool("DynamicMemoryEnabled") != Some(true) {
            return None;
        }
        Some((memory.get_u64("Reservation")?, memory.get_u64("Limit")?))
    }

    pub fn cpu_count(&self, id: &VmId) -> Option<u64> {
        self.lock()
            .components(id.as_str(), msvm::PROCESSOR_SETTINGS)
            .first()
            .and_then(|p| p.get_u64("VirtualQuantity"))
    }

    /// Virtual disk files attached to the VM.
    pub fn attached_disks(&self, id: &VmId) -> Vec<String> {
        self.lock()
            .components(id.as_str(), msvm::STORAGE_SETTINGS)
            .iter()
            .filter_map(|d| d.get_string_array("HostResource"))
            .flat_map(|hosts| hosts.iter().cloned())
            .collect()
    }

    /// Occupied drive locations on a controller.
    pub fn drive_locations(&self, id: &VmId, kind: ControllerKind, number: usize) -> Vec<u32> {
        let sim = self.lock();
        let resources = sim.components(id.as_str(), msvm::RESOURCE_SETTINGS);
        let mut controllers: Vec<&WmiObject> = resources
            .iter()
            .filter(|r| r.get_str("ResourceSubType") == Some(kind.subtype()))
            .collect();
        controllers.sort_by_key(|c| c.get_str("InstanceID").unwrap_or_default().to_string());
        let Some(controller) = controllers.get(number).and_then(|c| c.path()) else {
            return Vec::new();
        };
        let mut locations: Vec<u32> = resources
            .iter()
            .filter(|r| r.get_str("ResourceSubType") == Some(subtype::DISK_DRIVE))
            .filter(|r| r.get_str("Parent") == Some(controller))
            .filter_map(|r| r.get_str("AddressOnParent").and_then(|a| a.parse().ok()))
            .collect();
        locations.sort_unstable();
        locations
    }

    /// Names of the VM's network adapters.
    pub fn nics(&self, id: &VmId) -> Vec<String> {
        self.lock()
            .components(id.as_str(), msvm::PORT_SETTINGS)
            .iter()
            .filter_map(|p| p.get_str("ElementName").map(str::to_string))
            .collect()
    }

    /// Names of the switches the VM's adapters are connected to.
    pub fn connected_switches(&self, id: &VmId) -> Vec<String> {
        let sim = self.lock();
        sim.components(id.as_str(), msvm::CONNECTION_SETTINGS)
            .iter()
            .filter_map(|c| c.get_string_array("HostResource"))
            .flat_map(|hosts| hosts.iter())
            .filter_map(|switch| sim.objects.get(switch))
            .filter_map(|switch| switch.get_str("ElementName").map(str::to_string))
            .collect()
    }

    /// Guest IP configuration last applied to an adapter.
    pub fn guest_ip(&self, id: &VmId, adapter: &str) -> Option<GuestIpSpec> {
        let sim = self.lock();
        let port = sim
            .components(id.as_str(), msvm::PORT_SETTINGS)
            .into_iter()
            .find(|p| p.get_str("ElementName") == Some(adapter))?;
        let config = sim
            .links
            .iter()
            .filter(|l| l.class == msvm::SETTING_DATA_COMPONENT)
            .find_map(|l| port.path().and_then(|p| l.other_end(p)))
            .and_then(|path| sim.objects.get(path))?;
        let strings = |name: &str| config.get_string_array(name).map(<[String]>::to_vec).unwrap_or_default();
        Some(GuestIpSpec {
            adapter: adapter.to_string(),
            dhcp: config.get_bool("DHCPEnabled").unwrap_or(false),
            addresses: strings("IPAddresses"),
            subnets: strings("Subnets"),
            gateways: strings("DefaultGateways"),
            dns_servers: strings("DNSServers"),
        })
    }

    /// Pipe a serial port is connected to; empty when disconnected.
    pub fn com_port_connection(&self, id: &VmId, port: ComPort) -> Option<String> {
        self.lock()
            .components(id.as_str(), msvm::SERIAL_PORT_SETTINGS)
            .iter()
            .find(|p| p.get_str("ElementName") == Some(port.element_name()))
            .and_then(|p| p.get_string_array("Connection"))
            .and_then(|c| c.first().cloned())
    }

    /// Every call seen, as `Call::describe` renders it.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Methods invoked, as `Class.Method`.
    pub fn method_calls(&self) -> Vec<String> {
        self.lock().method_calls.clone()
    }

    pub fn job_polls(&self) -> u32 {
        self.lock().job_polls
    }

    /// Times the transport was closed.
    pub fn closes(&self) -> u32 {
        self.lock().closes
    }
}

impl InMemoryHyperV {
    fn take_stall(&self, call: &Call) -> bool {
        let mut sim = self.lock();
        let is_poll = matches!(call, Call::Get { path } if sim.jobs.contains_key(path));
        if is_poll && sim.stalled_polls > 0 {
            sim.stalled_polls -= 1;
            sim.calls.push(call.describe());
            return true;
        }
        false
    }
}

impl Transport for InMemoryHyperV {
    fn invoke(&self, call: &Call, timeout: Duration) -> Result<Reply, TransportError> {
        if self.take_stall(call) {
            std::thread::sleep(timeout);
            return Err(TransportError::timed_out(format!("{} exceeded {:?}", call.describe(), timeout)));
        }

        let mut sim = self.lock();
        sim.calls.push(call.describe());
        if let Some(fault) = sim.call_faults.pop_front() {
            return Err(fault);
        }

        match call {
            Call::Query(query) => Ok(Reply::Objects(sim.query(query))),
            Call::Get { path } if sim.jobs.contains_key(path) => sim.poll_job(path).map(Reply::Object),
            Call::Get { path } => sim
                .objects
                .get(path)
                .cloned()
                .map(Reply::Object)
                .ok_or_else(|| TransportError::not_found(format!("object not found: {}", path))),
            Call::Exec(method) => Ok(Reply::Object(sim.exec(method))),
        }
    }

    fn close(&self) {
        self.lock().closes += 1;
    }
}

fn object_path(class: &str, key: &str, value: &str) -> String {
    format!(r#"{}:{}.{}="{}""#, NAMESPACE, class, key, value)
}

fn vm_path(id: &str) -> String {
    object_path(msvm::COMPUTER_SYSTEM, "Name", id)
}

fn out(code: u32) -> WmiObject {
    let mut props = BTreeMap::new();
    props.insert("ReturnValue".to_string(), Value::U32(code));
    WmiObject::from_provider("__PARAMETERS", None, props)
}

fn set_state(vm: String, state: u16) -> Effect {
    Box::new(move |sim: &mut Sim| sim.set_enabled_state(&vm, state))
}

fn matches_filter(object: &WmiObject, property: &str, expected: &Value) -> bool {
    object
        .get(property)
        .is_some_and(|actual| actual.to_wql().eq_ignore_ascii_case(&expected.to_wql()))
}

impl Sim {
    fn seed_host(&mut self) {
        self.store(
            WmiObject::new(msvm::COMPUTER_SYSTEM)
                .with("ElementName", "SIMHOST")
                .with("Caption", "Hosting Computer System")
                .with("EnabledState", 2u16),
            "Name",
            "SIMHOST",
        );
        self.store(
            WmiObject::new(msvm::MANAGEMENT_SERVICE).with("ElementName", "Virtual Machine Management Service"),
            "Name",
            "vmms",
        );
        self.store(
            WmiObject::new(msvm::IMAGE_MANAGEMENT_SERVICE).with("ElementName", "Image Management Service"),
            "Name",
            "vhdsvc",
        );

        let resources = [
            (subtype::DISK_DRIVE, msvm::RESOURCE_SETTINGS),
            (subtype::VIRTUAL_HARD_DISK, msvm::STORAGE_SETTINGS),
            (subtype::ETHERNET_PORT, msvm::PORT_SETTINGS),
            (subtype::ETHERNET_CONNECTION, msvm::CONNECTION_SETTINGS),
        ];
        for (index, (resource_subtype, class)) in resources.into_iter().enumerate() {
            let pool = self.store(
                WmiObject::new(msvm::RESOURCE_POOL)
                    .with("ResourceSubType", resource_subtype)
                    .with("Primordial", true),
                "InstanceID",
                &format!("Microsoft:Primordial\\{}", index),
            );
            let capabilities = self.store(
                WmiObject::new(msvm::ALLOCATION_CAPABILITIES).with("ResourceSubType", resource_subtype),
                "InstanceID",
                &format!("Microsoft:Capabilities\\{}", index),
            );
            self.link(msvm::ELEMENT_CAPABILITIES, ("ManagedElement", &pool), ("Capabilities", &capabilities), None);

            for (role, label) in [(0u16, "Default"), (3u16, "Maximum")] {
                let settings = self.store(
                    WmiObject::new(class)
                        .with("ResourceSubType", resource_subtype)
                        .with("ElementName", label),
                    "InstanceID",
                    &format!("Microsoft:Definition\\{}\\{}", index, label),
                );
                self.link(
                    msvm::SETTINGS_DEFINE_CAPABILITIES,
                    ("GroupComponent", &capabilities),
                    ("PartComponent", &settings),
                    Some(role),
                );
            }
        }
    }

    fn store(&mut self, object: WmiObject, key: &str, id: &str) -> String {
        let path = object_path(object.class(), key, id);
        let mut props: BTreeMap<String, Value> = object
            .properties()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        props.insert(key.to_string(), Value::from(id));
        self.objects.insert(
            path.clone(),
            WmiObject::from_provider(object.class(), Some(path.clone()), props),
        );
        path
    }

    fn update(&mut self, path: &str, changes: Vec<(String, Value)>) {
        if let Some(object) = self.objects.get(path) {
            let mut props: BTreeMap<String, Value> = object
                .properties()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect();
            props.extend(changes);
            let class = object.class().to_string();
            self.objects.insert(
                path.to_string(),
                WmiObject::from_provider(class, Some(path.to_string()), props),
            );
        }
    }

    fn link(&mut self, class: &str, left: (&str, &str), right: (&str, &str), value_role: Option<u16>) {
        let mut object = WmiObject::new(class).with(left.0, left.1).with(right.0, right.1);
        if let Some(role) = value_role {
            object.set("ValueRole", role);
        }
        let props: BTreeMap<String, Value> = object
            .properties()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        let path = format!(r#"{}:{}.{}="{}",{}="{}""#, NAMESPACE, class, left.0, left.1, right.0, right.1);
        self.links.push(Link {
            class: class.to_string(),
            ends: (left.1.to_string(), right.1.to_string()),
            object: WmiObject::from_provider(class, Some(path), props),
        });
    }

    fn component(&mut self, settings: &str, component: &str) {
        self.link(
            msvm::SETTINGS_COMPONENT,
            ("GroupComponent", settings),
            ("PartComponent", component),
            None,
        );
    }

    fn create_vm(&mut self, id: &str, name: &str, generation: Generation, notes: Option<String>, state: u16) {
        let vm = self.store(
            WmiObject::new(msvm::COMPUTER_SYSTEM)
                .with("ElementName", name)
                .with("Caption", msvm::VM_CAPTION)
                .with("EnabledState", state),
            "Name",
            id,
        );
        let settings = self.store(
            WmiObject::new(msvm::SYSTEM_SETTINGS)
                .with("ElementName", name)
                .with("VirtualSystemIdentifier", id)
                .with("VirtualSystemSubType", generation.to_subtype())
                .with("Notes", notes.into_iter().collect::<Vec<_>>()),
            "InstanceID",
            &format!("Microsoft:{}", id),
        );
        self.link(msvm::SETTINGS_DEFINE_STATE, ("ManagedElement", &vm), ("SettingData", &settings), None);

        let memory = self.store(
            WmiObject::new(msvm::MEMORY_SETTINGS)
                .with("VirtualQuantity", 1024u64)
                .with("Reservation", 1024u64)
                .with("Limit", 1024u64)
                .with("DynamicMemoryEnabled", false),
            "InstanceID",
            &format!("Microsoft:{}\\Memory", id),
        );
        self.component(&settings, &memory);

        let processor = self.store(
            WmiObject::new(msvm::PROCESSOR_SETTINGS).with("VirtualQuantity", 1u64),
            "InstanceID",
            &format!("Microsoft:{}\\Processor", id),
        );
        self.component(&settings, &processor);

        let controllers: &[(ControllerKind, &str)] = match generation {
            Generation::Gen1 => &[(ControllerKind::Ide, "0"), (ControllerKind::Ide, "1")],
            Generation::Gen2 => &[(ControllerKind::Scsi, "0")],
        };
        for (kind, address) in controllers {
            let controller = self.store(
                WmiObject::new(msvm::RESOURCE_SETTINGS)
                    .with("ResourceSubType", kind.subtype())
                    .with("Address", *address),
                "InstanceID",
                &format!("Microsoft:{}\\{:?}{}", id, kind, address),
            );
            self.component(&settings, &controller);
        }

        for port in ["COM 1", "COM 2"] {
            let serial = self.store(
                WmiObject::new(msvm::SERIAL_PORT_SETTINGS)
                    .with("ElementName", port)
                    .with("Connection", vec![String::new()]),
                "InstanceID",
                &format!("Microsoft:{}\\{}", id, port.replace(' ', "")),
            );
            self.component(&settings, &serial);
        }

        self.store(
            WmiObject::new(msvm::SHUTDOWN_COMPONENT)
                .with("SystemName", id)
                .with("OperationalStatus", Value::U16Array(vec![2])),
            "DeviceID",
            &format!("Microsoft:{}\\Shutdown", id),
        );
    }

    /// Guest-side IP configuration that the host keeps for each synthetic adapter.
    fn add_guest_network_config(&mut self, port: &str, instance: &str) {
        let config = self.store(
            WmiObject::new(msvm::GUEST_NETWORK_CONFIG)
                .with("DHCPEnabled", true)
                .with("IPAddresses", Vec::<String>::new())
                .with("Subnets", Vec::<String>::new())
                .with("DefaultGateways", Vec::<String>::new())
                .with("DNSServers", Vec::<String>::new())
                .with("ProtocolIFType", msvm::PROTOCOL_IPV4_IPV6),
            "InstanceID",
            &format!("{}\\GuestNetwork", instance),
        );
        self.link(msvm::SETTING_DATA_COMPONENT, ("GroupComponent", port), ("PartComponent", &config), None);
    }

    fn destroy_vm(&mut self, vm: &str) {
        let id = self
            .objects
            .get(vm)
            .and_then(|o| o.get_str("Name"))
            .unwrap_or_default()
            .to_string();
        let mut doomed: BTreeSet<String> = BTreeSet::new();
        doomed.insert(vm.to_string());
        let settings: Vec<String> = self
            .links
            .iter()
            .filter(|l| l.class == msvm::SETTINGS_DEFINE_STATE)
            .filter_map(|l| l.other_end(vm).map(str::to_string))
            .collect();
        for path in settings {
            let parts: Vec<String> = self
                .links
                .iter()
                .filter(|l| l.class == msvm::SETTINGS_COMPONENT)
                .filter_map(|l| l.other_end(&path).map(str::to_string))
                .collect();
            let guest: Vec<String> = self
                .links
                .iter()
                .filter(|l| l.class == msvm::SETTING_DATA_COMPONENT)
                .filter_map(|l| parts.iter().find_map(|part| l.other_end(part)).map(str::to_string))
                .collect();
            doomed.extend(parts);
            doomed.extend(guest);
            doomed.insert(path);
        }
        for (path, object) in &self.objects {
            if object.class() == msvm::SHUTDOWN_COMPONENT && object.get_str("SystemName") == Some(id.as_str()) {
                doomed.insert(path.clone());
            }
        }

        self.objects.retain(|path, _| !doomed.contains(path));
        self.links
            .retain(|l| !doomed.contains(&l.ends.0) && !doomed.contains(&l.ends.1));
    }

    fn set_enabled_state(&mut self, vm: &str, state: u16) {
        self.update(vm, vec![("EnabledState".to_string(), Value::U16(state))]);
    }

    /// Resource settings of `class` belonging to the VM.
    fn components(&self, id: &str, class: &str) -> Vec<WmiObject> {
        let vm = vm_path(id);
        let Some(settings) = self
            .links
            .iter()
            .filter(|l| l.class == msvm::SETTINGS_DEFINE_STATE)
            .find_map(|l| l.other_end(&vm))
        else {
            return Vec::new();
        };
        self.links
            .iter()
            .filter(|l| l.class == msvm::SETTINGS_COMPONENT)
            .filter_map(|l| l.other_end(settings))
            .filter_map(|path| self.objects.get(path))
            .filter(|o| o.class() == class)
            .cloned()
            .collect()
    }

    fn advance_transitions(&mut self) {
        let mut settled = Vec::new();
        for (vm, (target, remaining)) in self.transitions.iter_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                settled.push((vm.clone(), *target));
            }
        }
        for (vm, target) in settled {
            self.transitions.remove(&vm);
            self.set_enabled_state(&vm, target);
        }
    }

    fn query(&mut self, query: &Query) -> Vec<WmiObject> {
        match query {
            Query::Select { class, filters } => {
                if class == msvm::COMPUTER_SYSTEM {
                    self.advance_transitions();
                }
                self.objects
                    .values()
                    .filter(|o| o.class().eq_ignore_ascii_case(class))
                    .filter(|o| filters.iter().all(|(p, v)| matches_filter(o, p, v)))
                    .cloned()
                    .collect()
            }
            Query::Associators {
                of,
                assoc_class,
                result_class,
            } => self
                .links
                .iter()
                .filter(|l| assoc_class.as_deref().map_or(true, |a| l.class == a))
                .filter_map(|l| l.other_end(of))
                .filter_map(|path| self.objects.get(path))
                .filter(|o| o.class() == result_class)
                .cloned()
                .collect(),
            Query::References { of, result_class } => self
                .links
                .iter()
                .filter(|l| &l.class == result_class && l.other_end(of).is_some())
                .map(|l| l.object.clone())
                .collect(),
        }
    }

    fn poll_job(&mut self, path: &str) -> Result<WmiObject, TransportError> {
        self.job_polls += 1;
        if self.poll_faults > 0 {
            self.poll_faults -= 1;
            return Err(TransportError::network("connection reset while reading job"));
        }

        let (object, effects) = {
            let Some(job) = self.jobs.get_mut(path) else {
                return Err(TransportError::not_found(format!("object not found: {}", path)));
            };
            if !job.finished {
                if let Some(frame) = job.frames.pop_front() {
                    job.current = frame;
                }
            }
            let mut effects = Vec::new();
            if !job.finished && job.current.is_terminal() {
                job.finished = true;
                effects = if job.current.succeeded() {
                    std::mem::take(&mut job.on_success)
                } else {
                    std::mem::take(&mut job.on_failure)
                };
            }
            (job.current.to_object(path), effects)
        };

        for effect in effects {
            effect(self);
        }
        Ok(object)
    }

    fn start_job(
        &mut self,
        method: &str,
        transition: Option<(String, u16)>,
        on_success: Vec<Effect>,
        on_failure: Vec<Effect>,
        forced: Option<JobScript>,
    ) -> WmiObject {
        let script = forced.or_else(|| self.scripts.get_mut(method).and_then(VecDeque::pop_front));
        if script.is_none() && self.synchronous {
            for effect in on_success {
                effect(self);
            }
            return out(0);
        }

        if let Some((vm, state)) = transition {
            self.set_enabled_state(&vm, state);
        }
        let path = object_path(msvm::CONCRETE_JOB, "InstanceID", &Uuid::new_v4().to_string().to_uppercase());
        let frames = script.unwrap_or_else(JobScript::completes).frames.into();
        self.jobs.insert(
            path.clone(),
            SimJob {
                frames,
                current: Frame::New,
                on_success,
                on_failure,
                finished: false,
            },
        );
        debug!(method, job = %path, "simulated job started");
        out(4096).with("Job", path)
    }

    fn exec(&mut self, call: &MethodCall) -> WmiObject {
        self.method_calls.push(format!("{}.{}", call.class, call.method));
        if let Some(code) = self.failures.get_mut(&call.method).and_then(VecDeque::pop_front) {
            return out(code);
        }

        match (call.class.as_str(), call.method.as_str()) {
            (msvm::COMPUTER_SYSTEM, "RequestStateChange") => self.request_state_change(call),
            (msvm::CONCRETE_JOB, "RequestStateChange") => self.terminate_job(call),
            (msvm::SHUTDOWN_COMPONENT, "InitiateShutdown") => self.initiate_shutdown(call),
            (msvm::MANAGEMENT_SERVICE, "DefineSystem") => self.define_system(call),
            (msvm::MANAGEMENT_SERVICE, "DestroySystem") => self.destroy_system(call),
            (msvm::MANAGEMENT_SERVICE, "AddResourceSettings") => self.add_resources(call),
            (msvm::MANAGEMENT_SERVICE, "ModifyResourceSettings") => self.modify_resources(call),
            (msvm::MANAGEMENT_SERVICE, "SetGuestNetworkAdapterConfiguration") => self.set_guest_network(call),
            (msvm::IMAGE_MANAGEMENT_SERVICE, "CreateVirtualHardDisk") => self.create_disk(call),
            (msvm::IMAGE_MANAGEMENT_SERVICE, "ConvertVirtualHardDisk") => self.convert_disk(call),
            _ => out(NOT_SUPPORTED),
        }
    }

    fn request_state_change(&mut self, call: &MethodCall) -> WmiObject {
        let vm = call.target.clone();
        let Some(current) = self.objects.get(&vm).and_then(|o| o.get_u16("EnabledState")) else {
            return out(NOT_FOUND);
        };
        let Some(requested) = call.args.get("RequestedState").and_then(Value::as_u16) else {
            return out(INVALID_PARAMETER);
        };

        use VmState::*;
        let (transitional, settled) = match (requested, VmState::from_enabled_state(current)) {
            (2, Paused) => (Resuming, Running),
            (2, Off | Saved) => (Starting, Running),
            (3, Running | Paused | Saved | ShuttingDown) => (Stopping, Off),
            (6, Running | Paused) => (Saving, Saved),
            (9, Running) => (Pausing, Paused),
            (11, Running) => (Starting, Running),
            _ => return out(INVALID_STATE),
        };

        self.start_job(
            "RequestStateChange",
            Some((vm.clone(), transitional.to_enabled_state())),
            vec![set_state(vm.clone(), settled.to_enabled_state())],
            vec![set_state(vm, current)],
            None,
        )
    }

    fn terminate_job(&mut self, call: &MethodCall) -> WmiObject {
        if call.args.get("RequestedState").and_then(Value::as_u16) != Some(msvm::JOB_TERMINATE) {
            return out(INVALID_PARAMETER);
        }
        let effects = {
            let Some(job) = self.jobs.get_mut(&call.target) else {
                return out(NOT_FOUND);
            };
            if job.finished {
                return out(INVALID_STATE);
            }
            job.frames.clear();
            job.current = Frame::Terminated;
            job.finished = true;
            std::mem::take(&mut job.on_failure)
        };
        for effect in effects {
            effect(self);
        }
        out(0)
    }

    fn initiate_shutdown(&mut self, call: &MethodCall) -> WmiObject {
        let Some(id) = self
            .objects
            .get(&call.target)
            .and_then(|c| c.get_str("SystemName"))
            .map(str::to_string)
        else {
            return out(NOT_FOUND);
        };
        if self.ignoring_shutdown.contains(&id) {
            debug!(vm = %id, "guest ignored shutdown request");
            return out(0);
        }

        let vm = vm_path(&id);
        let running = VmState::Running.to_enabled_state();
        if self.objects.get(&vm).and_then(|o| o.get_u16("EnabledState")) != Some(running) {
            return out(INVALID_STATE);
        }
        self.start_job(
            "InitiateShutdown",
            Some((vm.clone(), VmState::ShuttingDown.to_enabled_state())),
            vec![set_state(vm.clone(), VmState::Off.to_enabled_state())],
            vec![set_state(vm, running)],
            None,
        )
    }

    fn define_system(&mut self, call: &MethodCall) -> WmiObject {
        let Some(settings) = call.args.get("SystemSettings").and_then(Value::as_instance) else {
            return out(INVALID_PARAMETER);
        };
        let name = settings.get_str("ElementName").unwrap_or_default().to_string();
        let generation = settings
            .get_str("VirtualSystemSubType")
            .map(Generation::from_subtype)
            .unwrap_or_default();
        let notes = settings.get_string_array("Notes").and_then(|n| n.first().cloned());

        let id = VmId::from_uuid(Uuid::new_v4()).to_string();
        let path = vm_path(&id);
        let off = VmState::Off.to_enabled_state();
        let effect: Effect = Box::new(move |sim: &mut Sim| sim.create_vm(&id, &name, generation, notes, off));
        self.start_job("DefineSystem", None, vec![effect], Vec::new(), None)
            .with("ResultingSystem", path)
    }

    fn destroy_system(&mut self, call: &MethodCall) -> WmiObject {
        let Some(vm) = call.args.get("AffectedSystem").and_then(Value::as_str).map(str::to_string) else {
            return out(INVALID_PARAMETER);
        };
        match self.objects.get(&vm).and_then(|o| o.get_u16("EnabledState")) {
            None => return out(NOT_FOUND),
            Some(state) if state != VmState::Off.to_enabled_state() => return out(INVALID_STATE),
            Some(_) => {}
        }
        let effect: Effect = Box::new(move |sim: &mut Sim| sim.destroy_vm(&vm));
        self.start_job("DestroySystem", None, vec![effect], Vec::new(), None)
    }

    fn add_resources(&mut self, call: &MethodCall) -> WmiObject {
        let Some(settings) = call.args.get("AffectedConfiguration").and_then(Value::as_str).map(str::to_string) else {
            return out(INVALID_PARAMETER);
        };
        let Some(vm_id) = self
            .objects
            .get(&settings)
            .and_then(|s| s.get_str("VirtualSystemIdentifier"))
            .map(str::to_string)
        else {
            return out(NOT_FOUND);
        };
        let resources = call
            .args
            .get("ResourceSettings")
            .and_then(Value::as_instances)
            .map(<[WmiObject]>::to_vec)
            .unwrap_or_default();

        let mut created = Vec::new();
        let mut paths = Vec::new();
        let mut missing = None;
        for resource in resources {
            self.next_id += 1;
            let instance = format!("Microsoft:{}\\{}", vm_id, self.next_id);
            paths.push(object_path(resource.class(), "InstanceID", &instance));
            for host in resource.get_string_array("HostResource").unwrap_or_default() {
                if self.missing_files.contains(&host.to_ascii_lowercase()) {
                    missing = Some(host.clone());
                }
            }
            created.push((resource, instance));
        }

        let forced = missing.map(|file| {
            JobScript::fails(
                FILE_NOT_FOUND,
                format!("The system cannot find the file specified. ('{}')", file),
            )
        });
        let effect: Effect = Box::new(move |sim: &mut Sim| {
            for (resource, instance) in created {
                let is_port = resource.class() == msvm::PORT_SETTINGS;
                let path = sim.store(resource, "InstanceID", &instance);
                sim.component(&settings, &path);
                if is_port {
                    sim.add_guest_network_config(&path, &instance);
                }
            }
        });
        self.start_job("AddResourceSettings", None, vec![effect], Vec::new(), forced)
            .with("ResultingResourceSettings", paths)
    }

    fn modify_resources(&mut self, call: &MethodCall) -> WmiObject {
        let resources = call
            .args
            .get("ResourceSettings")
            .and_then(Value::as_instances)
            .unwrap_or_default();

        let mut changes = Vec::new();
        for resource in resources {
            match resource.path() {
                Some(path) if self.objects.contains_key(path) => {
                    let props: Vec<(String, Value)> = resource
                        .modified()
                        .map(|(name, value)| (name.to_string(), value.clone()))
                        .collect();
                    changes.push((path.to_string(), props));
                }
                _ => return out(NOT_FOUND),
            }
        }
        let paths: Vec<String> = changes.iter().map(|(path, _)| path.clone()).collect();
        let effect: Effect = Box::new(move |sim: &mut Sim| {
            for (path, props) in changes {
                sim.update(&path, props);
            }
        });
        self.start_job("ModifyResourceSettings", None, vec![effect], Vec::new(), None)
            .with("ResultingResourceSettings", paths)
    }

    fn set_guest_network(&mut self, call: &MethodCall) -> WmiObject {
        let vm = call.args.get("ComputerSystem").and_then(Value::as_str).unwrap_or_default();
        if !self.objects.contains_key(vm) {
            return out(NOT_FOUND);
        }
        let configs = call
            .args
            .get("NetworkConfiguration")
            .and_then(Value::as_instances)
            .unwrap_or_default();
        if configs.is_empty() {
            return out(INVALID_PARAMETER);
        }

        let mut changes = Vec::new();
        for config in configs {
            match config.path() {
                Some(path) if self.objects.contains_key(path) => {
                    let props: Vec<(String, Value)> = config
                        .modified()
                        .map(|(name, value)| (name.to_string(), value.clone()))
                        .collect();
                    changes.push((path.to_string(), props));
                }
                _ => return out(NOT_FOUND),
            }
        }
        let effect: Effect = Box::new(move |sim: &mut Sim| {
            for (path, props) in changes {
                sim.update(&path, props);
            }
        });
        self.start_job("SetGuestNetworkAdapterConfiguration", None, vec![effect], Vec::new(), None)
    }

    fn create_disk(&mut self, call: &MethodCall) -> WmiObject {
        let Some(settings) = call.args.get("VirtualDiskSettingData").and_then(Value::as_instance) else {
            return out(INVALID_PARAMETER);
        };
        let Some(path) = settings.get_str("Path").map(str::to_string) else {
            return out(INVALID_PARAMETER);
        };
        let parent = settings.get_str("ParentPath").map(str::to_string);
        let source = parent.clone().filter(|_| settings.get_u16("Type") == Some(msvm::VHD_DIFFERENCING));
        self.disk_job("CreateVirtualHardDisk", path, source, parent)
    }

    fn convert_disk(&mut self, call: &MethodCall) -> WmiObject {
        let Some(source) = call.args.get("SourcePath").and_then(Value::as_str).map(str::to_string) else {
            return out(INVALID_PARAMETER);
        };
        let Some(path) = call
            .args
            .get("VirtualDiskSettingData")
            .and_then(Value::as_instance)
            .and_then(|s| s.get_str("Path"))
            .map(str::to_string)
        else {
            return out(INVALID_PARAMETER);
        };
        self.disk_job("ConvertVirtualHardDisk", path, Some(source), None)
    }

    /// Job that writes the disk file at `path`, reading `source` if given.
    fn disk_job(&mut self, method: &str, path: String, source: Option<String>, parent: Option<String>) -> WmiObject {
        let forced = match source {
            Some(ref source) if !self.disks.contains_key(&source.to_ascii_lowercase()) => Some(JobScript::fails(
                FILE_NOT_FOUND,
                format!("The system cannot find the file specified. ('{}')", source),
            )),
            _ if self.disks.contains_key(&path.to_ascii_lowercase()) => Some(JobScript::fails(
                FILE_EXISTS,
                format!("The file exists. ('{}')", path),
            )),
            _ => None,
        };
        let effect: Effect = Box::new(move |sim: &mut Sim| {
            sim.disks.insert(path.to_ascii_lowercase(), parent);
        });
        self.start_job(method, None, vec![effect], Vec::new(), forced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(hv: &InMemoryHyperV, query: Query) -> Vec<WmiObject> {
        match hv.invoke(&Call::Query(query), Duration::from_secs(1)).unwrap() {
            Reply::Objects(objects) => objects,
            Reply::Object(object) => vec![object],
        }
    }

    #[test]
    fn vm_query_excludes_host() {
        let hv = InMemoryHyperV::new();
        let id = hv.add_vm("web-01", Generation::Gen2, VmState::Off);

        let vms = query(&hv, msvm::vms());
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].get_str("Name"), Some(id.as_str()));
        assert_eq!(query(&hv, msvm::vm_by_id(&id)).len(), 1);
    }

    #[test]
    fn default_settings_chain_resolves() {
        let hv = InMemoryHyperV::new();
        let pools = query(&hv, msvm::primordial_pool(subtype::DISK_DRIVE));
        assert_eq!(pools.len(), 1);

        let caps = query(&hv, msvm::pool_capabilities(pools[0].path().unwrap()));
        assert_eq!(caps.len(), 1);

        let refs = query(&hv, msvm::capability_settings(caps[0].path().unwrap()));
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().any(|r| r.get_u16("ValueRole") == Some(0)));
    }

    #[test]
    fn jobs_advance_one_frame_per_poll() {
        let hv = InMemoryHyperV::new();
        let id = hv.add_vm("web-01", Generation::Gen2, VmState::Off);
        let call = MethodCall::new(vm_path(id.as_str()), msvm::COMPUTER_SYSTEM, "RequestStateChange")
            .arg("RequestedState", 2u16);

        let reply = hv.invoke(&Call::Exec(call), Duration::from_secs(1)).unwrap().into_object().unwrap();
        assert_eq!(reply.get_u32("ReturnValue"), Some(4096));
        assert_eq!(hv.vm_state(&id), Some(VmState::Starting));

        let job = reply.get_str("Job").unwrap().to_string();
        let get = Call::Get { path: job };
        let first = hv.invoke(&get, Duration::from_secs(1)).unwrap().into_object().unwrap();
        assert_eq!(first.get_u16("JobState"), Some(4));
        let second = hv.invoke(&get, Duration::from_secs(1)).unwrap().into_object().unwrap();
        assert_eq!(second.get_u16("JobState"), Some(7));
        assert_eq!(hv.vm_state(&id), Some(VmState::Running));
        assert_eq!(hv.job_polls(), 2);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let hv = InMemoryHyperV::new();
        let id = hv.add_vm("web-01", Generation::Gen2, VmState::Off);
        let call = MethodCall::new(vm_path(id.as_str()), msvm::COMPUTER_SYSTEM, "RequestStateChange")
            .arg("RequestedState", 9u16);
        let reply = hv.invoke(&Call::Exec(call), Duration::from_secs(1)).unwrap().into_object().unwrap();
        assert_eq!(reply.get_u32("ReturnValue"), Some(INVALID_STATE));
    }
}
