//! COM/WMI transport for Windows hosts.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::ptr;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use windows::core::{Interface, BSTR, HSTRING, PCWSTR};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoInitializeSecurity, CoSetProxyBlanket,
    CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED, EOAC_NONE, RPC_C_AUTHN_LEVEL_CALL,
    RPC_C_AUTHN_LEVEL_DEFAULT, RPC_C_IMP_LEVEL_IMPERSONATE, SAFEARRAY, SAFEARRAYBOUND,
};
use windows::Win32::System::Ole::{
    SafeArrayCreate, SafeArrayDestroy, SafeArrayGetElement, SafeArrayGetLBound,
    SafeArrayGetUBound, SafeArrayPutElement,
};
use windows::Win32::System::Rpc::{RPC_C_AUTHN_WINNT, RPC_C_AUTHZ_NONE};
use windows::Win32::System::Variant::{
    VARIANT, VT_ARRAY, VT_BOOL, VT_BSTR, VT_EMPTY, VT_I2, VT_I4, VT_I8, VT_NULL, VT_UI1, VT_UI2,
    VT_UI4, VT_UI8,
};
use windows::Win32::System::Wmi::{
    IWbemCallResult, IWbemClassObject, IWbemLocator, IWbemObjectTextSrc, IWbemServices, WbemLocator,
    WbemObjectTextSrc, WBEM_FLAG_CONNECT_USE_MAX_WAIT, WBEM_FLAG_FORWARD_ONLY,
    WBEM_FLAG_NONSYSTEM_ONLY, WBEM_FLAG_RETURN_IMMEDIATELY, WBEM_S_TIMEDOUT, WBEM_TIMEOUT_TYPE,
    WMI_OBJ_TEXT_WMI_DTD_2_0,
};

use super::query::{Call, MethodCall, Reply};
use super::transport::Transport;
use super::value::{Value, WmiObject};
use crate::config::{Credentials, SessionConfig};
use crate::error::{TransportError, TransportErrorKind};

type ComResult<T> = core::result::Result<T, TransportError>;

thread_local! {
    static COM_INITIALIZED: Cell<bool> = const { Cell::new(false) };
}

const WBEM_E_ACCESS_DENIED: u32 = 0x8004_1003;
const E_ACCESSDENIED: u32 = 0x8007_0005;
const RPC_S_SERVER_UNAVAILABLE: u32 = 0x8007_06BA;
const RPC_S_UNKNOWN_HOST: u32 = 0x8007_06D1;
const WBEM_E_TIMED_OUT: u32 = 0x8004_3001;
const WBEM_E_INVALID_SYNTAX: u32 = 0x8004_1017;
const WBEM_E_NOT_FOUND: u32 = 0x8004_1002;
const WBEM_E_INVALID_OBJECT_PATH: u32 = 0x8004_103A;

/// Connected `IWbemServices` proxy.
struct Services(IWbemServices);

// SAFETY: COM is initialized multithreaded on every calling thread, so the
// proxy belongs to the MTA and may be used from any of them.
unsafe impl Send for Services {}
unsafe impl Sync for Services {}

/// [`Transport`] over DCOM to `root\virtualization\v2`.
///
/// Connects lazily on the first call and reconnects after a connection
/// level failure.
pub struct WmiTransport {
    host: Option<String>,
    namespace_path: String,
    credentials: Option<Credentials>,
    services: Mutex<Option<Services>>,
}

impl std::fmt::Debug for WmiTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WmiTransport")
            .field("namespace", &self.namespace_path)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl WmiTransport {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            host: config.host.clone(),
            namespace_path: config.namespace_path(),
            credentials: config.credentials.clone(),
            services: Mutex::new(None),
        }
    }

    fn services(&self) -> ComResult<IWbemServices> {
        init_com();
        let mut cached = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ref services) = *cached {
            return Ok(services.0.clone());
        }
        let services = self.connect()?;
        *cached = Some(Services(services.clone()));
        Ok(services)
    }

    fn reset(&self) {
        *self.services.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn connect(&self) -> ComResult<IWbemServices> {
        let host = self.host.as_deref().unwrap_or("localhost");
        debug!(host, namespace = %self.namespace_path, "connecting to WMI");
        unsafe {
            let locator: IWbemLocator =
                CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER).map_err(com_error)?;

            let namespace = BSTR::from(self.namespace_path.as_str());
            let services = match self.credentials {
                Some(ref creds) => locator.ConnectServer(
                    &namespace,
                    &BSTR::from(creds.full_username()),
                    &BSTR::from(creds.password_str()),
                    &BSTR::new(),
                    WBEM_FLAG_CONNECT_USE_MAX_WAIT.0 as i32,
                    &BSTR::new(),
                    None,
                ),
                None => locator.ConnectServer(
                    &namespace,
                    &BSTR::new(),
                    &BSTR::new(),
                    &BSTR::new(),
                    WBEM_FLAG_CONNECT_USE_MAX_WAIT.0 as i32,
                    &BSTR::new(),
                    None,
                ),
            }
            .map_err(com_error)?;

            CoSetProxyBlanket(
                &services,
                RPC_C_AUTHN_WINNT,
                RPC_C_AUTHZ_NONE,
                None,
                RPC_C_AUTHN_LEVEL_CALL,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
            )
            .map_err(com_error)?;

            info!(host, namespace = %self.namespace_path, "connected to WMI");
            Ok(services)
        }
    }
}

impl Transport for WmiTransport {
    fn invoke(&self, call: &Call, timeout: Duration) -> ComResult<Reply> {
        let services = self.services()?;
        let deadline = Deadline::after(timeout);
        let reply = unsafe {
            match call {
                Call::Query(query) => query_objects(&services, &query.to_string(), &deadline).map(Reply::Objects),
                Call::Get { path } => get_raw(&services, path, &deadline).and_then(|o| read_object(&o)).map(Reply::Object),
                Call::Exec(method) => exec_method(&services, method, &deadline).map(Reply::Object),
            }
        };

        if let Err(ref e) = reply {
            if matches!(e.kind, TransportErrorKind::Unreachable | TransportErrorKind::Network) {
                debug!(error = %e, "dropping WMI connection");
                self.reset();
            }
        }
        reply
    }

    fn close(&self) {
        self.reset();
    }
}

fn init_com() {
    COM_INITIALIZED.with(|initialized| {
        if !initialized.get() {
            unsafe {
                // Already-initialized threads and processes report errors here.
                let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
                let _ = CoInitializeSecurity(
                    None,
                    -1,
                    None,
                    None,
                    RPC_C_AUTHN_LEVEL_DEFAULT,
                    RPC_C_IMP_LEVEL_IMPERSONATE,
                    None,
                    EOAC_NONE,
                    None,
                );
            }
            initialized.set(true);
        }
    })
}

fn com_error(e: windows::core::Error) -> TransportError {
    let code = e.code().0 as u32;
    let kind = match code {
        WBEM_E_ACCESS_DENIED | E_ACCESSDENIED => TransportErrorKind::AuthFailed,
        RPC_S_SERVER_UNAVAILABLE | RPC_S_UNKNOWN_HOST => TransportErrorKind::Unreachable,
        WBEM_E_TIMED_OUT => TransportErrorKind::TimedOut,
        WBEM_E_INVALID_SYNTAX => TransportErrorKind::MalformedResponse,
        WBEM_E_NOT_FOUND | WBEM_E_INVALID_OBJECT_PATH => TransportErrorKind::NotFound,
        _ => TransportErrorKind::Network,
    };
    TransportError::new(kind, format!("{} (0x{:08X})", e.message(), code))
}

/// Time left for one `invoke`, shared by every COM round trip it makes.
struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn after(timeout: Duration) -> Self {
        // COM takes the wait as i32 milliseconds.
        let timeout = timeout.min(Duration::from_millis(i32::MAX as u64));
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    fn millis_left(&self, what: &str) -> ComResult<i32> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(self.expired(what));
        }
        Ok(i32::try_from(left.as_millis()).unwrap_or(i32::MAX).max(1))
    }

    fn expired(&self, what: &str) -> TransportError {
        TransportError::timed_out(format!("{} exceeded {:?}", what, self.timeout))
    }
}

/// Collect the object of a semisynchronous call before the deadline.
unsafe fn await_result(call: Option<IWbemCallResult>, deadline: &Deadline, what: &str) -> ComResult<IWbemClassObject> {
    let call = call.ok_or_else(|| TransportError::malformed(format!("{} returned no call result", what)))?;
    let mut raw = ptr::null_mut();
    // WBEM_S_TIMEDOUT is a success code, so the HRESULT is read directly.
    let hr = (Interface::vtable(&call).GetResultObject)(Interface::as_raw(&call), deadline.millis_left(what)?, &mut raw);
    if hr.0 == WBEM_S_TIMEDOUT.0 {
        return Err(deadline.expired(what));
    }
    hr.ok().map_err(com_error)?;
    if raw.is_null() {
        return Err(TransportError::malformed(format!("{} returned no object", what)));
    }
    Ok(IWbemClassObject::from_raw(raw))
}

unsafe fn query_objects(services: &IWbemServices, wql: &str, deadline: &Deadline) -> ComResult<Vec<WmiObject>> {
    let enumerator = services
        .ExecQuery(
            &BSTR::from("WQL"),
            &BSTR::from(wql),
            WBEM_FLAG_FORWARD_ONLY | WBEM_FLAG_RETURN_IMMEDIATELY,
            None,
        )
        .map_err(com_error)?;

    let mut results = Vec::new();
    loop {
        let mut objects: [Option<IWbemClassObject>; 1] = [None];
        let mut returned = 0u32;
        let hr = enumerator.Next(WBEM_TIMEOUT_TYPE(deadline.millis_left(wql)?), &mut objects, &mut returned);
        hr.ok().map_err(com_error)?;
        if hr.0 == WBEM_S_TIMEDOUT.0 {
            return Err(deadline.expired(wql));
        }
        if returned == 0 {
            break;
        }
        if let Some(obj) = objects[0].take() {
            results.push(read_object(&obj)?);
        }
    }
    Ok(results)
}

unsafe fn get_raw(services: &IWbemServices, path: &str, deadline: &Deadline) -> ComResult<IWbemClassObject> {
    let mut pending = None;
    services
        .GetObject(&BSTR::from(path), WBEM_FLAG_RETURN_IMMEDIATELY, None, None, Some(&mut pending))
        .map_err(com_error)?;
    await_result(pending, deadline, path)
}

unsafe fn exec_method(services: &IWbemServices, call: &MethodCall, deadline: &Deadline) -> ComResult<WmiObject> {
    let class = get_raw(services, &call.class, deadline)?;
    let method = HSTRING::from(call.method.as_str());
    let mut in_definition = None;
    let mut out_definition = None;
    class
        .GetMethod(PCWSTR(method.as_ptr()), 0, &mut in_definition, &mut out_definition)
        .map_err(com_error)?;

    let in_params = match in_definition {
        Some(definition) => Some(definition.SpawnInstance(0).map_err(com_error)?),
        None => None,
    };
    if let Some(ref params) = in_params {
        for (name, value) in &call.args {
            put(services, params, name, value, deadline)?;
        }
    }

    let mut pending = None;
    services
        .ExecMethod(
            &BSTR::from(call.target.as_str()),
            &BSTR::from(call.method.as_str()),
            WBEM_FLAG_RETURN_IMMEDIATELY,
            None,
            in_params.as_ref(),
            None,
            Some(&mut pending),
        )
        .map_err(com_error)?;

    let out_params = await_result(pending, deadline, &call.method)?;
    read_object(&out_params)
}

unsafe fn read_object(obj: &IWbemClassObject) -> ComResult<WmiObject> {
    let class = get_string(obj, "__CLASS").unwrap_or_default();
    let path = get_string(obj, "__PATH").filter(|p| !p.is_empty());

    let mut properties = BTreeMap::new();
    obj.BeginEnumeration(WBEM_FLAG_NONSYSTEM_ONLY.0).map_err(com_error)?;
    loop {
        let mut name = BSTR::new();
        let mut value = VARIANT::default();
        if obj.Next(0, &mut name, &mut value, None, None).is_err() || name.is_empty() {
            break;
        }
        properties.insert(name.to_string(), to_value(&value)?);
    }
    let _ = obj.EndEnumeration();

    Ok(WmiObject::from_provider(class, path, properties))
}

unsafe fn get_string(obj: &IWbemClassObject, name: &str) -> Option<String> {
    let name = HSTRING::from(name);
    let mut value = VARIANT::default();
    obj.Get(PCWSTR(name.as_ptr()), 0, &mut value, None, None).ok()?;
    to_value(&value).ok()?.as_str().map(str::to_string)
}

unsafe fn to_value(variant: &VARIANT) -> ComResult<Value> {
    let inner = &variant.Anonymous.Anonymous;
    let vt = inner.vt;
    let data = &inner.Anonymous;

    if (vt & VT_ARRAY) == VT_ARRAY {
        let element = vt & !VT_ARRAY;
        return if element == VT_BSTR {
            read_array::<BSTR>(data.parray).map(|items| {
                Value::StringArray(items.iter().map(|s| s.to_string()).collect())
            })
        } else if element == VT_I4 {
            read_array::<i32>(data.parray).map(|items| Value::U16Array(items.into_iter().map(|v| v as u16).collect()))
        } else if element == VT_I2 || element == VT_UI2 {
            read_array::<u16>(data.parray).map(Value::U16Array)
        } else {
            Ok(Value::Null)
        };
    }

    Ok(match vt {
        t if t == VT_NULL || t == VT_EMPTY => Value::Null,
        t if t == VT_BSTR => Value::String(String::try_from(&*data.bstrVal).unwrap_or_default()),
        t if t == VT_BOOL => Value::Bool(data.boolVal.0 != 0),
        t if t == VT_UI1 => Value::U16(u16::from(data.bVal)),
        t if t == VT_I2 => Value::U16(data.iVal as u16),
        t if t == VT_UI2 => Value::U16(data.uiVal),
        // uint32 travels as VT_I4.
        t if t == VT_I4 => Value::U32(data.lVal as u32),
        t if t == VT_UI4 => Value::U32(data.ulVal),
        t if t == VT_I8 => Value::U64(data.llVal as u64),
        t if t == VT_UI8 => Value::U64(data.ullVal),
        _ => Value::Null,
    })
}

unsafe fn read_array<T: Default>(sa: *mut SAFEARRAY) -> ComResult<Vec<T>> {
    if sa.is_null() {
        return Ok(Vec::new());
    }
    let lower = SafeArrayGetLBound(sa, 1).map_err(com_error)?;
    let upper = SafeArrayGetUBound(sa, 1).map_err(com_error)?;

    let mut items = Vec::with_capacity((upper - lower + 1).max(0) as usize);
    for i in lower..=upper {
        let mut element = T::default();
        SafeArrayGetElement(sa, &i, &mut element as *mut T as *mut _).map_err(com_error)?;
        items.push(element);
    }
    Ok(items)
}

unsafe fn put(
    services: &IWbemServices,
    obj: &IWbemClassObject,
    name: &str,
    value: &Value,
    deadline: &Deadline,
) -> ComResult<()> {
    let variant = to_variant(services, value, deadline)?;
    let name = HSTRING::from(name);
    obj.Put(PCWSTR(name.as_ptr()), 0, &variant, 0).map_err(com_error)
}

unsafe fn to_variant(services: &IWbemServices, value: &Value, deadline: &Deadline) -> ComResult<VARIANT> {
    Ok(match value {
        Value::Null => VARIANT::default(),
        Value::Bool(v) => VARIANT::from(*v),
        // uint16 and uint32 are passed as VT_I4.
        Value::U16(v) => VARIANT::from(i32::from(*v)),
        Value::U32(v) => VARIANT::from(*v as i32),
        // uint64 is passed as a string.
        Value::U64(v) => VARIANT::from(BSTR::from(v.to_string())),
        Value::I32(v) => VARIANT::from(*v),
        Value::String(s) => VARIANT::from(BSTR::from(s.as_str())),
        Value::StringArray(items) => string_array(items)?,
        Value::Instance(obj) => VARIANT::from(BSTR::from(instance_text(services, obj, deadline)?)),
        Value::InstanceArray(objs) => {
            let texts = objs
                .iter()
                .map(|o| instance_text(services, o, deadline))
                .collect::<ComResult<Vec<_>>>()?;
            string_array(&texts)?
        }
        Value::U16Array(_) => {
            return Err(TransportError::malformed("uint16 array arguments are not supported"))
        }
    })
}

unsafe fn string_array(items: &[String]) -> ComResult<VARIANT> {
    let bounds = SAFEARRAYBOUND {
        cElements: items.len() as u32,
        lLbound: 0,
    };
    let sa = SafeArrayCreate(VT_BSTR, 1, &bounds);
    if sa.is_null() {
        return Err(TransportError::malformed("failed to allocate SAFEARRAY"));
    }

    for (i, item) in items.iter().enumerate() {
        let bstr = BSTR::from(item.as_str());
        let index = i as i32;
        // SafeArrayPutElement copies the BSTR.
        if let Err(e) = SafeArrayPutElement(sa, &index, bstr.as_ptr() as *const _) {
            let _ = SafeArrayDestroy(sa);
            return Err(com_error(e));
        }
    }

    let mut variant = VARIANT::default();
    (*variant.Anonymous.Anonymous).vt = VT_ARRAY | VT_BSTR;
    (*variant.Anonymous.Anonymous).Anonymous.parray = sa;
    Ok(variant)
}

/// Embedded-instance text for a method argument.
///
/// Objects read from the provider are re-read by path and only their
/// modified properties are applied; new objects are spawned from the class.
unsafe fn instance_text(services: &IWbemServices, obj: &WmiObject, deadline: &Deadline) -> ComResult<String> {
    let (instance, changes): (IWbemClassObject, Vec<(&str, &Value)>) = match obj.path() {
        Some(path) => (get_raw(services, path, deadline)?, obj.modified().collect()),
        None => (
            get_raw(services, obj.class(), deadline)?.SpawnInstance(0).map_err(com_error)?,
            obj.properties().collect(),
        ),
    };
    for (name, value) in changes {
        put(services, &instance, name, value, deadline)?;
    }

    let text_src: IWbemObjectTextSrc =
        CoCreateInstance(&WbemObjectTextSrc, None, CLSCTX_INPROC_SERVER).map_err(com_error)?;
    // Hyper-V expects embedded instances in WMI DTD 2.0.
    let text = text_src
        .GetText(0, &instance, WMI_OBJ_TEXT_WMI_DTD_2_0.0 as u32, None)
        .map_err(com_error)?;
    Ok(String::try_from(&text).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hresults_map_to_transport_kinds() {
        let kind = |code: u32| com_error(windows::core::Error::from_hresult(windows::core::HRESULT(code as i32))).kind;
        assert_eq!(kind(WBEM_E_ACCESS_DENIED), TransportErrorKind::AuthFailed);
        assert_eq!(kind(RPC_S_SERVER_UNAVAILABLE), TransportErrorKind::Unreachable);
        assert_eq!(kind(WBEM_E_TIMED_OUT), TransportErrorKind::TimedOut);
        assert_eq!(kind(WBEM_E_NOT_FOUND), TransportErrorKind::NotFound);
        assert_eq!(kind(0x8004_1001), TransportErrorKind::Network);
    }

    #[test]
    fn expired_deadline_times_out() {
        let deadline = Deadline::after(Duration::ZERO);
        let err = deadline.millis_left("GetObject").unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::TimedOut);

        let deadline = Deadline::after(Duration::from_secs(30));
        assert!(deadline.millis_left("GetObject").unwrap() > 0);
    }
}
