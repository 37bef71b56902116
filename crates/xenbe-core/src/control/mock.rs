//! In-memory control plane for tests and simulation.
//!
//! # Why a mock control plane?
//!
//! The real store and event-channel devices only exist inside a privileged
//! Xen domain.  `MockControlPlane` keeps the store as an ordered map, fires
//! watches the way the store daemon does, and hands out event-channel ports
//! from a counter.  Everything the runtime does against it is recorded in a
//! journal so tests can assert on call order.
//!
//! # Pollable handles
//!
//! Every store and event-channel handle owns a connected Unix socket pair.
//! One byte is written per queued event and one byte is consumed per event
//! fetched, so the read side is readable exactly while events are pending and
//! the runtime can `poll(2)` it like the real device.
//!
//! # Store semantics
//!
//! - Writing a node creates all of its missing ancestors with an empty value.
//! - Removing a node removes its whole subtree.
//! - A watch fires once when it is registered, and again whenever a node at or
//!   below the watched path changes.  Removing an ancestor of a watched path
//!   also fires it.
//! - Unwatching drops any events already queued for that token.
//!
//! # Failure injection
//!
//! [`MockControlPlane::fail`] makes every later call of the named operation
//! (e.g. `"evtchn.bind"`) return a [`ControlPlaneError`] until
//! [`MockControlPlane::recover`] is called.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::{
    ControlPlane, ControlPlaneError, EventChannelHandle, GrantTableHandle, MappedPages,
    PageProtection, RawWatchEvent, StoreHandle,
};
use crate::domain::ids::{DeviceId, DomainId};
use crate::domain::paths::{self, DOMAIN_LIST_PATH, OWN_DOMAIN_ID_NODE};
use crate::domain::state::ConnectionState;

/// errno reported for injected failures (`EIO`).
const INJECTED_ERRNO: i32 = 5;
const PAGE_SIZE: usize = 4096;

/// The simulated control plane.  Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MockControlPlane {
    inner: Arc<Inner>,
}

struct Inner {
    nodes: Mutex<BTreeMap<String, String>>,
    store_handles: Mutex<Vec<Weak<StoreQueue>>>,
    channel_handles: Mutex<Vec<Weak<ChannelQueue>>>,
    next_port: Mutex<u32>,
    grants: Mutex<GrantBook>,
    journal: Mutex<Vec<String>>,
    failures: Mutex<HashSet<&'static str>>,
}

#[derive(Default)]
struct GrantBook {
    next_address: usize,
    mapped: BTreeMap<usize, usize>,
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControlPlane {
    /// Creates a control plane whose caller runs in domain 0.
    pub fn new() -> Self {
        let plane = Self {
            inner: Arc::new(Inner {
                nodes: Mutex::new(BTreeMap::new()),
                store_handles: Mutex::new(Vec::new()),
                channel_handles: Mutex::new(Vec::new()),
                next_port: Mutex::new(1),
                grants: Mutex::new(GrantBook {
                    next_address: 0x1000_0000,
                    mapped: BTreeMap::new(),
                }),
                journal: Mutex::new(Vec::new()),
                failures: Mutex::new(HashSet::new()),
            }),
        };
        plane.insert_node(OWN_DOMAIN_ID_NODE, "0");
        plane.insert_node(&paths::join(DOMAIN_LIST_PATH, "0"), "");
        plane
    }

    // ── Test controls ─────────────────────────────────────────────────────────

    /// Makes every later call of `operation` fail until [`Self::recover`].
    pub fn fail(&self, operation: &'static str) {
        self.inner.failures.lock().insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        self.inner.failures.lock().remove(operation);
    }

    /// Returns a copy of every recorded operation, oldest first.
    pub fn journal(&self) -> Vec<String> {
        self.inner.journal.lock().clone()
    }

    /// Returns the journal entries starting with `prefix`.
    pub fn journal_matching(&self, prefix: &str) -> Vec<String> {
        self.inner
            .journal
            .lock()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Writes a node as if another domain (or the toolstack) had written it.
    pub fn write(&self, path: &str, value: &str) {
        self.insert_node(path, value);
        self.fire(path, false);
    }

    /// Removes a subtree as if the toolstack had removed it.
    pub fn remove(&self, path: &str) {
        if self.remove_subtree(path) {
            self.fire(path, true);
        }
    }

    pub fn read(&self, path: &str) -> Option<String> {
        self.inner.nodes.lock().get(path).cloned()
    }

    /// Creates `/local/domain/<dom>`.
    pub fn add_domain(&self, domain: DomainId) {
        self.write(&Self::domain_path_of(domain), "");
    }

    /// Removes `/local/domain/<dom>` and everything beneath it.
    pub fn remove_domain(&self, domain: DomainId) {
        self.remove(&Self::domain_path_of(domain));
    }

    /// Publishes a frontend device directory with a `state` and `backend-id` node.
    pub fn add_frontend(
        &self,
        domain: DomainId,
        device_class: &str,
        device: DeviceId,
        state: ConnectionState,
    ) {
        let device_path = Self::frontend_path_of(domain, device_class, device);
        self.insert_node(&paths::backend_id_path(&device_path), "0");
        self.write(&paths::state_path(&device_path), &state.as_raw().to_string());
    }

    pub fn set_frontend_state(
        &self,
        domain: DomainId,
        device_class: &str,
        device: DeviceId,
        state: ConnectionState,
    ) {
        let device_path = Self::frontend_path_of(domain, device_class, device);
        self.write(&paths::state_path(&device_path), &state.as_raw().to_string());
    }

    pub fn remove_frontend(&self, domain: DomainId, device_class: &str, device: DeviceId) {
        self.remove(&Self::frontend_path_of(domain, device_class, device));
    }

    /// `/local/domain/<dom>/device/<class>/<dev>`
    pub fn frontend_path_of(domain: DomainId, device_class: &str, device: DeviceId) -> String {
        let list =
            paths::device_list_path(&Self::domain_path_of(domain), paths::DEVICE_DIR, device_class);
        paths::device_path(&list, device)
    }

    pub fn domain_path_of(domain: DomainId) -> String {
        paths::join(DOMAIN_LIST_PATH, &domain.to_string())
    }

    /// Active watch registrations across all open store handles.
    pub fn active_watches(&self) -> Vec<(String, String)> {
        self.live_store_queues()
            .iter()
            .flat_map(|queue| queue.watches.lock().clone())
            .collect()
    }

    /// Fixes the local port returned by the next `bind_interdomain`.
    pub fn set_next_local_port(&self, port: u32) {
        *self.inner.next_port.lock() = port;
    }

    /// Signals `port` on whichever open event-channel handle has it bound.
    ///
    /// Returns `false` if no handle has the port bound.
    pub fn raise(&self, port: u32) -> bool {
        self.raise_as(port, port)
    }

    /// Queues `reported` as the pending port on the handle that has
    /// `bound_port` bound.  Used to simulate a misbehaving driver.
    pub fn raise_as(&self, bound_port: u32, reported: u32) -> bool {
        let handles = self.live_channel_queues();
        match handles.iter().find(|queue| queue.bound.lock().contains(&bound_port)) {
            Some(queue) => {
                queue.push(reported);
                true
            }
            None => false,
        }
    }

    /// Ports currently bound across all open event-channel handles.
    pub fn bound_ports(&self) -> Vec<u32> {
        self.live_channel_queues()
            .iter()
            .flat_map(|queue| queue.bound.lock().iter().copied().collect::<Vec<_>>())
            .collect()
    }

    /// Number of grant mappings not yet unmapped.
    pub fn mapped_grant_count(&self) -> usize {
        self.inner.grants.lock().mapped.len()
    }

    /// Shuts down the notification socket of every open store handle, so that
    /// pollers observe a hang-up.
    pub fn sever_store_connections(&self) {
        for queue in self.live_store_queues() {
            queue.signal.sever();
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn record(&self, entry: String) {
        debug!("mock control plane: {entry}");
        self.inner.journal.lock().push(entry);
    }

    fn check(&self, operation: &'static str, target: &str) -> Result<(), ControlPlaneError> {
        if self.inner.failures.lock().contains(operation) {
            self.record(format!("{operation} {target} -> injected failure"));
            return Err(ControlPlaneError::from_errno(operation, target, INJECTED_ERRNO));
        }
        Ok(())
    }

    fn insert_node(&self, path: &str, value: &str) {
        let mut nodes = self.inner.nodes.lock();
        let mut ancestor = String::new();
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let absolute = path.starts_with('/');
        for component in &components[..components.len().saturating_sub(1)] {
            if absolute || !ancestor.is_empty() {
                ancestor.push('/');
            }
            ancestor.push_str(component);
            nodes.entry(ancestor.clone()).or_default();
        }
        nodes.insert(path.to_string(), value.to_string());
    }

    fn remove_subtree(&self, path: &str) -> bool {
        let mut nodes = self.inner.nodes.lock();
        let doomed: Vec<String> = nodes
            .keys()
            .filter(|key| paths::is_within(key, path))
            .cloned()
            .collect();
        for key in &doomed {
            nodes.remove(key);
        }
        !doomed.is_empty()
    }

    fn directory_of(&self, path: &str) -> Option<Vec<String>> {
        let nodes = self.inner.nodes.lock();
        let root = path.trim_end_matches('/');
        let mut found = nodes.contains_key(root);
        let mut children = BTreeSet::new();
        for key in nodes.keys() {
            if let Some(rest) = key.strip_prefix(root).and_then(|r| r.strip_prefix('/')) {
                found = true;
                if let Some(child) = rest.split('/').next().filter(|c| !c.is_empty()) {
                    children.insert(child.to_string());
                }
            }
        }
        found.then(|| children.into_iter().collect())
    }

    fn fire(&self, changed: &str, removal: bool) {
        for queue in self.live_store_queues() {
            let hits: Vec<(String, String)> = queue
                .watches
                .lock()
                .iter()
                .filter(|(watched, _)| {
                    paths::is_within(changed, watched)
                        || (removal && paths::is_within(watched, changed))
                })
                .cloned()
                .collect();
            for (_, token) in hits {
                queue.push(RawWatchEvent {
                    path: changed.to_string(),
                    token,
                });
            }
        }
    }

    fn live_store_queues(&self) -> Vec<Arc<StoreQueue>> {
        let mut handles = self.inner.store_handles.lock();
        handles.retain(|weak| weak.strong_count() > 0);
        handles.iter().filter_map(Weak::upgrade).collect()
    }

    fn live_channel_queues(&self) -> Vec<Arc<ChannelQueue>> {
        let mut handles = self.inner.channel_handles.lock();
        handles.retain(|weak| weak.strong_count() > 0);
        handles.iter().filter_map(Weak::upgrade).collect()
    }
}

impl ControlPlane for MockControlPlane {
    fn open_store(&self) -> Result<Box<dyn StoreHandle>, ControlPlaneError> {
        self.check("store.open", "store")?;
        let queue = Arc::new(StoreQueue {
            watches: Mutex::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
            signal: Signal::new().map_err(|e| ControlPlaneError::new("store.open", "store", e))?,
        });
        self.inner.store_handles.lock().push(Arc::downgrade(&queue));
        self.record("store.open".to_string());
        Ok(Box::new(MockStore {
            plane: self.clone(),
            queue,
        }))
    }

    fn open_event_channel(&self) -> Result<Box<dyn EventChannelHandle>, ControlPlaneError> {
        self.check("evtchn.open", "evtchn")?;
        let queue = Arc::new(ChannelQueue {
            bound: Mutex::new(BTreeSet::new()),
            pending: Mutex::new(VecDeque::new()),
            signal: Signal::new()
                .map_err(|e| ControlPlaneError::new("evtchn.open", "evtchn", e))?,
        });
        self.inner.channel_handles.lock().push(Arc::downgrade(&queue));
        self.record("evtchn.open".to_string());
        Ok(Box::new(MockEventChannel {
            plane: self.clone(),
            queue,
        }))
    }

    fn open_grant_table(&self) -> Result<Box<dyn GrantTableHandle>, ControlPlaneError> {
        self.check("gnttab.open", "gnttab")?;
        self.record("gnttab.open".to_string());
        Ok(Box::new(MockGrantTable {
            plane: self.clone(),
        }))
    }
}

// ── Notification socket ───────────────────────────────────────────────────────

struct Signal {
    reader: UnixStream,
    writer: UnixStream,
}

impl Signal {
    fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    fn raise(&self) {
        if let Err(e) = (&self.writer).write_all(&[1]) {
            debug!("mock signal write failed: {e}");
        }
    }

    fn consume(&self) {
        let mut byte = [0u8; 1];
        if let Err(e) = (&self.reader).read(&mut byte) {
            debug!("mock signal read failed: {e}");
        }
    }

    fn sever(&self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }

    fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

// ── Store handle ──────────────────────────────────────────────────────────────

struct StoreQueue {
    watches: Mutex<Vec<(String, String)>>,
    events: Mutex<VecDeque<RawWatchEvent>>,
    signal: Signal,
}

impl StoreQueue {
    fn push(&self, event: RawWatchEvent) {
        let mut events = self.events.lock();
        events.push_back(event);
        self.signal.raise();
    }
}

struct MockStore {
    plane: MockControlPlane,
    queue: Arc<StoreQueue>,
}

impl StoreHandle for MockStore {
    fn domain_path(&self, domain: DomainId) -> Result<String, ControlPlaneError> {
        self.plane.check("store.domain_path", &domain.to_string())?;
        Ok(MockControlPlane::domain_path_of(domain))
    }

    fn read(&self, path: &str) -> Result<Option<String>, ControlPlaneError> {
        self.plane.check("store.read", path)?;
        Ok(self.plane.read(path))
    }

    fn write(&self, path: &str, value: &str) -> Result<(), ControlPlaneError> {
        self.plane.check("store.write", path)?;
        self.plane.record(format!("store.write {path} = {value}"));
        self.plane.write(path, value);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), ControlPlaneError> {
        self.plane.check("store.remove", path)?;
        self.plane.record(format!("store.remove {path}"));
        self.plane.remove(path);
        Ok(())
    }

    fn directory(&self, path: &str) -> Result<Option<Vec<String>>, ControlPlaneError> {
        self.plane.check("store.directory", path)?;
        Ok(self.plane.directory_of(path))
    }

    fn watch(&self, path: &str, token: &str) -> Result<(), ControlPlaneError> {
        self.plane.check("store.watch", path)?;
        self.plane.record(format!("store.watch {path} {token}"));
        self.queue
            .watches
            .lock()
            .push((path.to_string(), token.to_string()));
        self.queue.push(RawWatchEvent {
            path: path.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }

    fn unwatch(&self, path: &str, token: &str) -> Result<(), ControlPlaneError> {
        self.plane.check("store.unwatch", path)?;
        self.plane.record(format!("store.unwatch {path} {token}"));
        self.queue
            .watches
            .lock()
            .retain(|(p, t)| !(p == path && t == token));
        let mut events = self.queue.events.lock();
        let before = events.len();
        events.retain(|event| event.token != token);
        for _ in events.len()..before {
            self.queue.signal.consume();
        }
        Ok(())
    }

    fn read_watch(&self) -> Result<Option<RawWatchEvent>, ControlPlaneError> {
        self.plane.check("store.read_watch", "store")?;
        let mut events = self.queue.events.lock();
        let event = events.pop_front();
        if event.is_some() {
            self.queue.signal.consume();
        }
        Ok(event)
    }

    fn fileno(&self) -> RawFd {
        self.queue.signal.fd()
    }

    fn close(&self) -> Result<(), ControlPlaneError> {
        self.plane.check("store.close", "store")?;
        self.plane.record("store.close".to_string());
        self.queue.watches.lock().clear();
        Ok(())
    }
}

// ── Event-channel handle ──────────────────────────────────────────────────────

struct ChannelQueue {
    bound: Mutex<BTreeSet<u32>>,
    pending: Mutex<VecDeque<u32>>,
    signal: Signal,
}

impl ChannelQueue {
    fn push(&self, port: u32) {
        let mut pending = self.pending.lock();
        pending.push_back(port);
        self.signal.raise();
    }
}

struct MockEventChannel {
    plane: MockControlPlane,
    queue: Arc<ChannelQueue>,
}

impl EventChannelHandle for MockEventChannel {
    fn bind_interdomain(
        &self,
        domain: DomainId,
        remote_port: u32,
    ) -> Result<u32, ControlPlaneError> {
        let target = format!("{domain}:{remote_port}");
        self.plane.check("evtchn.bind", &target)?;
        let local = {
            let mut next = self.plane.inner.next_port.lock();
            let port = *next;
            *next += 1;
            port
        };
        self.queue.bound.lock().insert(local);
        self.plane.record(format!("evtchn.bind {target} -> {local}"));
        Ok(local)
    }

    fn notify(&self, local_port: u32) -> Result<(), ControlPlaneError> {
        self.plane.check("evtchn.notify", &local_port.to_string())?;
        self.plane.record(format!("evtchn.notify {local_port}"));
        Ok(())
    }

    fn unmask(&self, local_port: u32) -> Result<(), ControlPlaneError> {
        self.plane.check("evtchn.unmask", &local_port.to_string())?;
        self.plane.record(format!("evtchn.unmask {local_port}"));
        Ok(())
    }

    fn unbind(&self, local_port: u32) -> Result<(), ControlPlaneError> {
        self.plane.check("evtchn.unbind", &local_port.to_string())?;
        self.plane.record(format!("evtchn.unbind {local_port}"));
        self.queue.bound.lock().remove(&local_port);
        Ok(())
    }

    fn pending(&self) -> Result<Option<u32>, ControlPlaneError> {
        self.plane.check("evtchn.pending", "evtchn")?;
        let mut pending = self.queue.pending.lock();
        let port = pending.pop_front();
        if port.is_some() {
            self.queue.signal.consume();
        }
        Ok(port)
    }

    fn fileno(&self) -> RawFd {
        self.queue.signal.fd()
    }

    fn close(&self) -> Result<(), ControlPlaneError> {
        self.plane.check("evtchn.close", "evtchn")?;
        self.plane.record("evtchn.close".to_string());
        Ok(())
    }
}

// ── Grant-table handle ────────────────────────────────────────────────────────

struct MockGrantTable {
    plane: MockControlPlane,
}

impl GrantTableHandle for MockGrantTable {
    fn map_foreign_pages(
        &self,
        domain: DomainId,
        refs: &[u32],
        protection: PageProtection,
    ) -> Result<MappedPages, ControlPlaneError> {
        self.plane.check("gnttab.map", &domain.to_string())?;
        let mut book = self.plane.inner.grants.lock();
        let address = book.next_address;
        book.next_address += refs.len().max(1) * PAGE_SIZE;
        book.mapped.insert(address, refs.len());
        self.plane.record(format!(
            "gnttab.map {domain} {refs:?} {protection:?} -> {address:#x}"
        ));
        Ok(MappedPages {
            address,
            count: refs.len(),
        })
    }

    fn unmap(&self, pages: MappedPages) -> Result<(), ControlPlaneError> {
        let target = format!("{:#x}", pages.address);
        self.plane.check("gnttab.unmap", &target)?;
        let removed = self.plane.inner.grants.lock().mapped.remove(&pages.address);
        if removed.is_none() {
            return Err(ControlPlaneError::from_errno("gnttab.unmap", target, 22));
        }
        self.plane.record(format!("gnttab.unmap {target}"));
        Ok(())
    }

    fn close(&self) -> Result<(), ControlPlaneError> {
        self.plane.record("gnttab.close".to_string());
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
