//! C ABI for linking lanshare-core as a static library from C/C++ or mobile hosts.
//! Strings cross the boundary as (pointer, byte length) UTF-8 pairs. Functions returning
//! `c_int` use -1 for errors; details go to the log. Blocking calls (run, broadcast, send)
//! made from inside a callback return -1; only respond and cancel may be called there.

use std::ffi::c_void;
use std::net::IpAddr;
use std::os::raw::c_int;
use std::path::Path;
use std::slice;
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::handler::{EventHandler, TransferProgress};
use crate::identity::{FileIdentityStore, IdentityStore, MemoryIdentityStore};
use crate::interrupt::Interrupt;
use crate::protocol::COMPATIBILITY;
use crate::service::Service;
use crate::transfer::{Direction, FileId};
use crate::{EngineError, VERSION};

/// Host "should I stop?" predicate, polled once per loop cycle.
pub type ShouldInterrupt = Option<extern "C" fn() -> bool>;

/// Callback table for the data service. Any entry may be null. Callbacks run on engine
/// threads, so `user_data` must be safe to use from any thread.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LanshareCallbacks {
    pub user_data: *mut c_void,
    pub on_text: Option<
        extern "C" fn(user_data: *mut c_void, host: *const u8, host_len: usize, text: *const u8, text_len: usize),
    >,
    pub on_file_offer: Option<
        extern "C" fn(
            user_data: *mut c_void,
            file_id: u8,
            host: *const u8,
            host_len: usize,
            name: *const u8,
            name_len: usize,
            size: u64,
        ),
    >,
    /// `status` uses the transfer state codes 1..=7; `sending` tells which side the id belongs to.
    /// Ids are unique per peer, so (`peer`, `file_id`, `sending`) names one transfer.
    pub on_file_progress: Option<
        extern "C" fn(
            user_data: *mut c_void,
            file_id: u8,
            peer: *const u8,
            peer_len: usize,
            transferred: u64,
            total: u64,
            status: u8,
            sending: bool,
        ),
    >,
    /// Return false to abort the transfer.
    pub on_file_chunk:
        Option<extern "C" fn(user_data: *mut c_void, file_id: u8, offset: u64, data: *const u8, len: usize) -> bool>,
}

struct FfiHandler(LanshareCallbacks);

// The host promises user_data is thread-safe; function pointers already are.
unsafe impl Send for FfiHandler {}
unsafe impl Sync for FfiHandler {}

impl EventHandler for FfiHandler {
    fn on_text(&self, host: &str, text: &str) {
        if let Some(f) = self.0.on_text {
            f(self.0.user_data, host.as_ptr(), host.len(), text.as_ptr(), text.len());
        }
    }

    fn on_file_offer(&self, file_id: FileId, host: &str, file_name: &str, size: u64) {
        if let Some(f) = self.0.on_file_offer {
            f(
                self.0.user_data,
                file_id,
                host.as_ptr(),
                host.len(),
                file_name.as_ptr(),
                file_name.len(),
                size,
            );
        }
    }

    fn on_file_progress(&self, p: &TransferProgress) {
        if let Some(f) = self.0.on_file_progress {
            let peer = p.peer.to_string();
            f(
                self.0.user_data,
                p.file_id,
                peer.as_ptr(),
                peer.len(),
                p.transferred,
                p.total,
                p.state.code(),
                p.direction == Direction::Sending,
            );
        }
    }

    fn on_file_chunk(&self, file_id: FileId, offset: u64, data: &[u8]) -> bool {
        match self.0.on_file_chunk {
            Some(f) => f(self.0.user_data, file_id, offset, data.as_ptr(), data.len()),
            None => true,
        }
    }
}

/// Borrow a (ptr, len) UTF-8 argument. None when null or not UTF-8.
fn str_arg<'a>(ptr: *const u8, len: usize) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    let bytes = unsafe { slice::from_raw_parts(ptr, len) };
    std::str::from_utf8(bytes).ok()
}

fn service<'a>(h: *mut c_void) -> Option<&'a Service> {
    unsafe { (h as *const Service).as_ref() }
}

fn interrupt(should_interrupt: ShouldInterrupt) -> Interrupt {
    match should_interrupt {
        Some(f) => Interrupt::from_fn(move || f()),
        None => Interrupt::new(),
    }
}

fn status(result: Result<(), EngineError>, what: &str) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(error = %e, "{what} failed");
            -1
        }
    }
}

/// Copy the version string into out_buf. Returns bytes written, or -1 if null or too small.
#[no_mangle]
pub extern "C" fn lanshare_version(out_buf: *mut u8, out_len: usize) -> c_int {
    if out_buf.is_null() || out_len < VERSION.len() {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(VERSION.as_ptr(), VERSION.len());
    }
    VERSION.len() as c_int
}

#[no_mangle]
pub extern "C" fn lanshare_compatibility() -> u32 {
    COMPATIBILITY
}

fn config_from_args(
    discovery_port: u16,
    discovery_send_port: u16,
    data_addr: *const u8,
    data_addr_len: usize,
    data_port: u16,
    group: u8,
) -> Option<ServiceConfig> {
    let mut config = ServiceConfig {
        discovery_port,
        discovery_send_port,
        data_port,
        group,
        ..ServiceConfig::default()
    };
    if !data_addr.is_null() {
        config.data_bind_addr = str_arg(data_addr, data_addr_len)?.parse::<IpAddr>().ok()?;
    }
    Some(config)
}

fn identity_store(path: *const u8, path_len: usize) -> Option<Box<dyn IdentityStore>> {
    if path.is_null() {
        return Some(Box::new(MemoryIdentityStore::new()));
    }
    let path = str_arg(path, path_len)?;
    Some(Box::new(FileIdentityStore::new(path)))
}

fn open(
    config: Option<ServiceConfig>,
    store: Option<Box<dyn IdentityStore>>,
    restore: bool,
) -> *mut c_void {
    let (Some(config), Some(store)) = (config, store) else {
        return std::ptr::null_mut();
    };
    let created = if restore {
        Service::restore(config, &*store)
    } else {
        Service::create(config, &*store)
    };
    match created {
        Ok(svc) => Box::into_raw(Box::new(svc)) as *mut c_void,
        Err(e) => {
            tracing::warn!(error = %e, "cannot start service");
            std::ptr::null_mut()
        }
    }
}

/// Create a service. data_addr may be null (all interfaces); identity_path may be null
/// (identity kept in memory). Returns an opaque handle or null on failure.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn lanshare_create(
    discovery_port: u16,
    discovery_send_port: u16,
    data_addr: *const u8,
    data_addr_len: usize,
    data_port: u16,
    group: u8,
    identity_path: *const u8,
    identity_path_len: usize,
) -> *mut c_void {
    open(
        config_from_args(discovery_port, discovery_send_port, data_addr, data_addr_len, data_port, group),
        identity_store(identity_path, identity_path_len),
        false,
    )
}

/// Create a service from a TOML config document. Same handle semantics as `lanshare_create`.
#[no_mangle]
pub extern "C" fn lanshare_create_from_toml(
    toml: *const u8,
    toml_len: usize,
    identity_path: *const u8,
    identity_path_len: usize,
) -> *mut c_void {
    let config = str_arg(toml, toml_len).and_then(|s| match ServiceConfig::from_toml_str(s) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %e, "invalid config");
            None
        }
    });
    open(config, identity_store(identity_path, identity_path_len), false)
}

/// Like `lanshare_create` but fails (null) when no identity was saved before.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn lanshare_restore(
    discovery_port: u16,
    discovery_send_port: u16,
    data_addr: *const u8,
    data_addr_len: usize,
    data_port: u16,
    group: u8,
    identity_path: *const u8,
    identity_path_len: usize,
) -> *mut c_void {
    open(
        config_from_args(discovery_port, discovery_send_port, data_addr, data_addr_len, data_port, group),
        identity_store(identity_path, identity_path_len),
        true,
    )
}

/// Destroy a service and stop its loops. No-op if h is null. Must not be called from a callback.
#[no_mangle]
pub extern "C" fn lanshare_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut Service) };
}

/// 1 if this instance generated its identity on creation, 0 if not, -1 if h is null.
#[no_mangle]
pub extern "C" fn lanshare_is_first_run(h: *mut c_void) -> c_int {
    match service(h) {
        Some(svc) => svc.is_first_run() as c_int,
        None => -1,
    }
}

/// Run discovery on this thread until should_interrupt returns true (or the service is destroyed).
#[no_mangle]
pub extern "C" fn lanshare_run_discovery(h: *mut c_void, should_interrupt: ShouldInterrupt) -> c_int {
    let Some(svc) = service(h) else { return -1 };
    status(svc.run_discovery(interrupt(should_interrupt)), "discovery")
}

/// Bind discovery now and run it in the background.
#[no_mangle]
pub extern "C" fn lanshare_start_discovery(h: *mut c_void, should_interrupt: ShouldInterrupt) -> c_int {
    let Some(svc) = service(h) else { return -1 };
    status(
        svc.spawn_discovery(interrupt(should_interrupt)).map(drop),
        "discovery start",
    )
}

fn install_callbacks(svc: &Service, callbacks: *const LanshareCallbacks) {
    if let Some(table) = unsafe { callbacks.as_ref() } {
        svc.set_handler(Arc::new(FfiHandler(*table)));
    }
}

/// Run the data service on this thread. callbacks may be null (events are dropped).
#[no_mangle]
pub extern "C" fn lanshare_run_data_service(
    h: *mut c_void,
    callbacks: *const LanshareCallbacks,
    should_interrupt: ShouldInterrupt,
) -> c_int {
    let Some(svc) = service(h) else { return -1 };
    install_callbacks(svc, callbacks);
    status(svc.run_data_service(interrupt(should_interrupt)), "data service")
}

/// Bind the data service now and run it in the background.
#[no_mangle]
pub extern "C" fn lanshare_start_data_service(
    h: *mut c_void,
    callbacks: *const LanshareCallbacks,
    should_interrupt: ShouldInterrupt,
) -> c_int {
    let Some(svc) = service(h) else { return -1 };
    install_callbacks(svc, callbacks);
    status(
        svc.spawn_data_service(interrupt(should_interrupt)).map(drop),
        "data service start",
    )
}

/// Send one announce. Returns the number of targets reached, or -1.
#[no_mangle]
pub extern "C" fn lanshare_broadcast_once(h: *mut c_void) -> c_int {
    let Some(svc) = service(h) else { return -1 };
    match svc.broadcast_once() {
        Ok(n) => n as c_int,
        Err(e) => {
            tracing::warn!(error = %e, "broadcast failed");
            -1
        }
    }
}

#[no_mangle]
pub extern "C" fn lanshare_start_auto_broadcast(h: *mut c_void) -> c_int {
    let Some(svc) = service(h) else { return -1 };
    svc.start_auto_broadcast();
    0
}

/// Write the peer list into out_buf when it fits. Always returns the size the list needs
/// (so out_buf may be null to query it), or -1 if h is null.
#[no_mangle]
pub extern "C" fn lanshare_get_peers(h: *mut c_void, out_buf: *mut u8, out_len: usize) -> i64 {
    let Some(svc) = service(h) else { return -1 };
    let bytes = svc.peer_list_bytes();
    if !out_buf.is_null() && bytes.len() <= out_len {
        unsafe {
            out_buf.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
    }
    bytes.len() as i64
}

#[no_mangle]
pub extern "C" fn lanshare_send_text(
    h: *mut c_void,
    host: *const u8,
    host_len: usize,
    text: *const u8,
    text_len: usize,
) -> c_int {
    let (Some(svc), Some(host), Some(text)) =
        (service(h), str_arg(host, host_len), str_arg(text, text_len))
    else {
        return -1;
    };
    status(svc.send_text(host, text), "send text")
}

/// Send text to every known peer. Returns the number of peers it could not reach, or -1.
#[no_mangle]
pub extern "C" fn lanshare_broadcast_text(h: *mut c_void, text: *const u8, text_len: usize) -> c_int {
    let (Some(svc), Some(text)) = (service(h), str_arg(text, text_len)) else {
        return -1;
    };
    match svc.broadcast_text(text) {
        Ok(report) => report.failed.len() as c_int,
        Err(e) => {
            tracing::warn!(error = %e, "broadcast text failed");
            -1
        }
    }
}

/// Offer a file. Returns its file id (0..=255), or -1.
#[no_mangle]
pub extern "C" fn lanshare_try_send_file(
    h: *mut c_void,
    host: *const u8,
    host_len: usize,
    path: *const u8,
    path_len: usize,
) -> c_int {
    let (Some(svc), Some(host), Some(path)) =
        (service(h), str_arg(host, host_len), str_arg(path, path_len))
    else {
        return -1;
    };
    match svc.try_send_file(host, Path::new(path)) {
        Ok(id) => c_int::from(id),
        Err(e) => {
            tracing::warn!(error = %e, "send file failed");
            -1
        }
    }
}

/// Answer an offer. dest may be null when rejecting. Safe to call from a callback.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn lanshare_respond_to_file(
    h: *mut c_void,
    host: *const u8,
    host_len: usize,
    file_id: u8,
    size: u64,
    dest: *const u8,
    dest_len: usize,
    accept: bool,
) -> c_int {
    let (Some(svc), Some(host)) = (service(h), str_arg(host, host_len)) else {
        return -1;
    };
    let dest = match str_arg(dest, dest_len) {
        Some(d) => d,
        None if !accept => "",
        None => return -1,
    };
    status(
        svc.respond_to_file(host, file_id, size, Path::new(dest), accept),
        "respond to file",
    )
}

#[no_mangle]
pub extern "C" fn lanshare_cancel_transfer(
    h: *mut c_void,
    host: *const u8,
    host_len: usize,
    file_id: u8,
) -> c_int {
    let (Some(svc), Some(host)) = (service(h), str_arg(host, host_len)) else {
        return -1;
    };
    status(svc.cancel_transfer(host, file_id), "cancel")
}
