//! DiscoveryEngine: finds guest domains and their frontend devices in the
//! store and owns one handler per served device.
//!
//! # How discovery works (for beginners)
//!
//! Three levels of watches, all on one [`StoreWatchMultiplexer`]:
//!
//! ```text
//! /local/domain                          ── domain list   (one watch)
//!   └─ <dom>/device/<class>              ── device list   (one per domain)
//!        └─ <dev>/state                  ── frontend state (one per device)
//! ```
//!
//! Every trigger re-reads the current store contents and diffs them against
//! the engine's tables, so a stale or coalesced trigger is harmless:
//!
//! - A domain that appears gets a device-list watch.  A domain that
//!   disappears has every watch it owns cleared and then every handler
//!   released.
//! - A device that appears gets a state watch.  A device that disappears has
//!   its state watch cleared and then its handler released.
//! - A state change either creates the handler (see *Attach policy*) or is
//!   forwarded to the existing one.
//!
//! # Attach policy
//!
//! With `wait_for_frontend`, a handler is created only while the frontend is
//! `Initializing`.  Without it, a handler is created as soon as the state node
//! holds any recognized state other than `Closing`/`Closed`.  A handler that
//! reports [`FrontendHandler::is_terminated`], or whose creation failed, is
//! released and recreated only when the frontend re-enters `Initializing`.
//!
//! # Locking
//!
//! The engine tables sit behind one lock.  Store round-trips (setting and
//! clearing watches), factory calls and handler callbacks all run after it is
//! released.  A released handler's watches are cleared before the handler is
//! told it was removed.
//!
//! Each handler also carries a dispatch guard.  Releasing a handler waits
//! for a state callback already running on it, and no callback reaches it
//! afterwards.  The guard is reentrant, so a handler may remove itself or
//! stop the engine from inside its own callback.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, ReentrantMutex};
use tracing::{debug, info, warn};
use xenbe_core::domain::paths;
use xenbe_core::{ConnectionState, ControlPlane, DeviceId, DomainId, FrontendKey};

use super::frontend::{FrontendFactory, FrontendHandler, FrontendRecord};
use crate::error::{BackendError, ErrorCallback};
use crate::infrastructure::storage::config::BackendConfig;
use crate::infrastructure::store::{StoreClient, StoreWatchMultiplexer, WatchCallback, WatchTrigger};

/// Settings for one [`DiscoveryEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Device class to serve, e.g. `"vif"`.
    pub device_class: String,
    /// Attach only to frontends in the `Initializing` state.
    pub wait_for_frontend: bool,
    /// Domain the backend runs in; read from the store when `None`.
    pub own_domain: Option<DomainId>,
    pub domain_list_path: String,
    pub device_dir: String,
}

impl EngineConfig {
    pub fn new(device_class: impl Into<String>) -> Self {
        Self {
            device_class: device_class.into(),
            wait_for_frontend: false,
            own_domain: None,
            domain_list_path: paths::DOMAIN_LIST_PATH.to_string(),
            device_dir: paths::DEVICE_DIR.to_string(),
        }
    }

    pub fn with_wait_for_frontend(mut self, wait: bool) -> Self {
        self.wait_for_frontend = wait;
        self
    }

    pub fn with_own_domain(mut self, domain: DomainId) -> Self {
        self.own_domain = Some(domain);
        self
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            device_class: config.backend.device_class.clone(),
            wait_for_frontend: config.backend.wait_for_frontend,
            own_domain: config.backend.domain_id.map(DomainId),
            domain_list_path: config.store.domain_list_path.clone(),
            device_dir: config.store.device_dir.clone(),
        }
    }
}

// ── Engine tables ─────────────────────────────────────────────────────────────

enum Slot {
    /// No handler yet; the attach policy decides.
    Awaiting,
    /// The factory is running for this device.
    Creating,
    Active(Arc<OwnedHandler>),
    /// Handler terminated or creation failed; waiting for `Initializing`.
    Detached,
}

struct DeviceRecord {
    device_path: String,
    state_path: String,
    slot: Slot,
}

struct DomainRecord {
    device_list_path: String,
    devices: BTreeMap<DeviceId, DeviceRecord>,
}

#[derive(Default)]
struct EngineState {
    active: bool,
    domains: BTreeMap<DomainId, DomainRecord>,
}

#[derive(Default)]
struct Completion {
    finished: bool,
    failure: Option<String>,
}

/// A handler created by the factory and owned by the engine alone.
///
/// The `Arc` only exists so a callback can run outside the engine lock; it is
/// never handed out.
struct OwnedHandler {
    handler: Box<dyn FrontendHandler>,
    released: ReentrantMutex<Cell<bool>>,
}

impl OwnedHandler {
    fn new(handler: Box<dyn FrontendHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            released: ReentrantMutex::new(Cell::new(false)),
        })
    }

    /// Runs `f` on the handler unless it has been released.
    fn dispatch<R>(&self, f: impl FnOnce(&dyn FrontendHandler) -> R) -> Option<R> {
        let released = self.released.lock();
        if released.get() {
            return None;
        }
        Some(f(self.handler.as_ref()))
    }

    /// Waits for a running callback, then calls `on_removed` exactly once.
    fn release(&self) -> bool {
        let released = self.released.lock();
        if released.replace(true) {
            return false;
        }
        self.handler.on_removed();
        true
    }
}

type Released = Vec<(FrontendKey, Arc<OwnedHandler>)>;

enum StateAction {
    Create(FrontendRecord),
    Forward(Arc<OwnedHandler>),
}

struct EngineInner {
    self_ref: Weak<EngineInner>,
    config: EngineConfig,
    own_domain: DomainId,
    store: StoreClient,
    watches: StoreWatchMultiplexer,
    factory: Arc<dyn FrontendFactory>,
    state: Mutex<EngineState>,
    completion: Mutex<Completion>,
    completed: Condvar,
    error_callback: Mutex<Option<ErrorCallback>>,
}

/// Tracks domains and frontend devices of one class and owns their handlers.
pub struct DiscoveryEngine {
    inner: Arc<EngineInner>,
}

impl DiscoveryEngine {
    /// Opens a store connection and prepares the engine.  Nothing is watched
    /// until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be opened, or if the own domain id is not
    /// configured and cannot be read from the store.
    pub fn new(
        plane: &dyn ControlPlane,
        config: EngineConfig,
        factory: Arc<dyn FrontendFactory>,
    ) -> Result<Self, BackendError> {
        let store = StoreClient::open(plane)?;
        let own_domain = match config.own_domain {
            Some(domain) => domain,
            None => store.own_domain_id()?,
        };
        let watches = StoreWatchMultiplexer::new(&store);

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| EngineInner {
            self_ref: weak.clone(),
            config,
            own_domain,
            store,
            watches,
            factory,
            state: Mutex::new(EngineState::default()),
            completion: Mutex::new(Completion::default()),
            completed: Condvar::new(),
            error_callback: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .watches
            .set_error_callback(Some(Arc::new(move |err: &BackendError| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_loop_failed(err);
                }
            })));

        info!(
            "discovery engine for {:?} created in Dom({own_domain})",
            inner.config.device_class
        );
        Ok(Self { inner })
    }

    /// Receives the error that ends the watch loop, in addition to it being
    /// reported by [`wait_for_finish`](Self::wait_for_finish).
    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        *self.inner.error_callback.lock() = callback;
    }

    /// Watches the domain list and starts the watch loop.
    ///
    /// # Errors
    ///
    /// - [`BackendError::AlreadyStarted`] if the engine is running.
    /// - Any error registering the domain-list watch or starting the loop.
    pub fn start(&self) -> Result<(), BackendError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.active {
                return Err(BackendError::AlreadyStarted("discovery engine"));
            }
            state.active = true;
        }
        *inner.completion.lock() = Completion::default();

        let started = inner
            .watches
            .set_watch(
                &inner.config.domain_list_path,
                inner.callback(|inner, _| inner.on_domain_list_changed()),
            )
            .and_then(|_| inner.watches.start());
        if let Err(e) = started {
            inner.state.lock().active = false;
            if let Err(clear_err) = inner.watches.clear_watch_all() {
                warn!("failed to clear watches after failed start: {clear_err}");
            }
            return Err(e);
        }
        info!(
            "watching {} for {:?} frontends",
            inner.config.domain_list_path, inner.config.device_class
        );
        Ok(())
    }

    /// Stops the watch loop, clears every watch and releases every handler.
    ///
    /// Safe from any state, including from inside a handler callback.
    /// Unblocks [`wait_for_finish`](Self::wait_for_finish).
    pub fn stop(&self) {
        let inner = &self.inner;
        let was_active = std::mem::replace(&mut inner.state.lock().active, false);

        inner.watches.stop();
        if let Err(e) = inner.watches.clear_watch_all() {
            warn!("failed to clear watches on stop: {e}");
        }

        let released = {
            let mut state = inner.state.lock();
            let mut released = Released::new();
            for (domain, record) in std::mem::take(&mut state.domains) {
                collect_handlers(domain, record, &mut released);
            }
            released
        };
        dispose(released);

        {
            let mut completion = inner.completion.lock();
            completion.finished = true;
            inner.completed.notify_all();
        }
        if was_active {
            info!("discovery engine stopped");
        }
    }

    /// Blocks until the engine is stopped or its watch loop fails.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::WatchLoopFailed`] if the loop ended on an
    /// error.  The owner should then [`stop`](Self::stop) the engine (and may
    /// start it again).
    pub fn wait_for_finish(&self) -> Result<(), BackendError> {
        let mut completion = self.inner.completion.lock();
        while !completion.finished {
            self.inner.completed.wait(&mut completion);
        }
        match &completion.failure {
            Some(reason) => Err(BackendError::WatchLoopFailed(reason.clone())),
            None => Ok(()),
        }
    }

    /// Releases the handler of one device.
    ///
    /// If the watch loop is delivering a state change to the handler, this
    /// waits for that callback to return before calling
    /// [`FrontendHandler::on_removed`].
    ///
    /// The device stays tracked: a new handler is created when its frontend
    /// re-enters `Initializing`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] if the device has no active handler.
    pub fn remove_frontend(&self, domain: DomainId, device: DeviceId) -> Result<(), BackendError> {
        let key = FrontendKey::new(domain, device);
        let handler = {
            let mut state = self.inner.state.lock();
            let record = state
                .domains
                .get_mut(&domain)
                .and_then(|d| d.devices.get_mut(&device));
            let Some(record) = record else {
                return Err(BackendError::NotFound(key.to_string()));
            };
            match std::mem::replace(&mut record.slot, Slot::Detached) {
                Slot::Active(handler) => handler,
                other => {
                    record.slot = other;
                    return Err(BackendError::NotFound(key.to_string()));
                }
            }
        };
        dispose(vec![(key, handler)]);
        Ok(())
    }

    /// Domains currently tracked, ascending.
    pub fn tracked_domains(&self) -> Vec<DomainId> {
        self.inner.state.lock().domains.keys().copied().collect()
    }

    /// Devices tracked under `domain`, with or without a handler.
    pub fn tracked_devices(&self, domain: DomainId) -> Vec<DeviceId> {
        self.inner
            .state
            .lock()
            .domains
            .get(&domain)
            .map(|d| d.devices.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Devices that currently have an active handler.
    pub fn frontends(&self) -> Vec<FrontendKey> {
        let state = self.inner.state.lock();
        state
            .domains
            .iter()
            .flat_map(|(domain, record)| {
                record.devices.iter().filter_map(move |(device, d)| {
                    matches!(d.slot, Slot::Active(_)).then(|| FrontendKey::new(*domain, *device))
                })
            })
            .collect()
    }

    /// Whether one device currently has an active handler.
    pub fn has_frontend(&self, domain: DomainId, device: DeviceId) -> bool {
        let state = self.inner.state.lock();
        state
            .domains
            .get(&domain)
            .and_then(|d| d.devices.get(&device))
            .is_some_and(|record| matches!(record.slot, Slot::Active(_)))
    }

    pub fn device_class(&self) -> &str {
        &self.inner.config.device_class
    }

    pub fn own_domain(&self) -> DomainId {
        self.inner.own_domain
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().active && self.inner.watches.is_running()
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.inner.store.handle().close() {
            warn!("failed to close store connection: {e}");
        }
    }
}

// ── Watch triggers ────────────────────────────────────────────────────────────

impl EngineInner {
    /// Wraps an engine method as a watch callback holding only a weak
    /// reference, so registrations never keep the engine alive.
    fn callback<F>(&self, f: F) -> WatchCallback
    where
        F: Fn(&EngineInner, &WatchTrigger) -> Result<(), BackendError> + Send + Sync + 'static,
    {
        let weak = self.self_ref.clone();
        Arc::new(move |trigger: &WatchTrigger| match weak.upgrade() {
            Some(inner) => f(&inner, trigger),
            None => Ok(()),
        })
    }

    fn on_loop_failed(&self, err: &BackendError) {
        warn!("discovery watch loop failed: {err}");
        let callback = self.error_callback.lock().clone();
        if let Some(callback) = callback {
            callback(err);
        }
        let mut completion = self.completion.lock();
        completion.failure = Some(err.to_string());
        completion.finished = true;
        self.completed.notify_all();
    }

    fn on_domain_list_changed(&self) -> Result<(), BackendError> {
        let listed: BTreeSet<DomainId> = self
            .store
            .read_directory(&self.config.domain_list_path)?
            .iter()
            .filter_map(|entry| match entry.parse::<DomainId>() {
                Ok(domain) => Some(domain),
                Err(e) => {
                    debug!("ignoring domain list entry: {e}");
                    None
                }
            })
            .filter(|domain| *domain != self.own_domain)
            .collect();

        // Home paths are resolved before taking the lock.
        let known: BTreeSet<DomainId> = self.state.lock().domains.keys().copied().collect();
        let mut appeared = Vec::new();
        for &domain in listed.difference(&known) {
            let domain_path = self.store.domain_path(domain)?;
            appeared.push((domain, domain_path));
        }

        let mut released = Released::new();
        let mut stale_watches = Vec::new();
        let mut added = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.active {
                return Ok(());
            }

            let vanished: Vec<DomainId> = state
                .domains
                .keys()
                .filter(|domain| !listed.contains(domain))
                .copied()
                .collect();
            for domain in vanished {
                if let Some(record) = state.domains.remove(&domain) {
                    collect_domain_watches(&record, &mut stale_watches);
                    collect_handlers(domain, record, &mut released);
                    info!("Dom({domain}) removed");
                }
            }

            for (domain, domain_path) in appeared {
                if state.domains.contains_key(&domain) {
                    continue;
                }
                let device_list_path = paths::device_list_path(
                    &domain_path,
                    &self.config.device_dir,
                    &self.config.device_class,
                );
                state.domains.insert(
                    domain,
                    DomainRecord {
                        device_list_path: device_list_path.clone(),
                        devices: BTreeMap::new(),
                    },
                );
                added.push((domain, device_list_path));
            }
        }

        for path in &stale_watches {
            self.clear_watch_logged(path);
        }
        dispose(released);

        for (domain, device_list_path) in added {
            let callback = self.callback(move |inner, _| inner.on_device_list_changed(domain));
            match self.watches.set_watch(&device_list_path, callback) {
                Ok(_) => info!("Dom({domain}) tracked, watching {device_list_path}"),
                Err(e) => {
                    warn!("Dom({domain}) not tracked: {e}");
                    self.state.lock().domains.remove(&domain);
                }
            }
        }
        Ok(())
    }

    fn on_device_list_changed(&self, domain: DomainId) -> Result<(), BackendError> {
        let Some(device_list_path) = self
            .state
            .lock()
            .domains
            .get(&domain)
            .map(|record| record.device_list_path.clone())
        else {
            return Ok(());
        };

        let mut listed = BTreeSet::new();
        for entry in self.store.read_directory(&device_list_path)? {
            let device = match entry.parse::<DeviceId>() {
                Ok(device) => device,
                Err(e) => {
                    debug!("Dom({domain}): ignoring device entry: {e}");
                    continue;
                }
            };
            let device_path = paths::device_path(&device_list_path, device);
            if self.serves(&device_path)? {
                listed.insert(device);
            }
        }

        let mut released = Released::new();
        let mut stale_watches = Vec::new();
        let mut added = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.active {
                return Ok(());
            }
            let Some(record) = state.domains.get_mut(&domain) else {
                return Ok(());
            };

            let vanished: Vec<DeviceId> = record
                .devices
                .keys()
                .filter(|device| !listed.contains(device))
                .copied()
                .collect();
            for device in vanished {
                if let Some(device_record) = record.devices.remove(&device) {
                    stale_watches.push(device_record.state_path);
                    if let Slot::Active(handler) = device_record.slot {
                        released.push((FrontendKey::new(domain, device), handler));
                    }
                    debug!("{} device gone", FrontendKey::new(domain, device));
                }
            }

            for &device in &listed {
                if record.devices.contains_key(&device) {
                    continue;
                }
                let device_path = paths::device_path(&record.device_list_path, device);
                let state_path = paths::state_path(&device_path);
                record.devices.insert(
                    device,
                    DeviceRecord {
                        device_path,
                        state_path: state_path.clone(),
                        slot: Slot::Awaiting,
                    },
                );
                added.push((device, state_path));
            }
        }

        for path in &stale_watches {
            self.clear_watch_logged(path);
        }
        dispose(released);

        for (device, state_path) in added {
            let key = FrontendKey::new(domain, device);
            let callback =
                self.callback(move |inner, _| inner.on_frontend_state_changed(domain, device));
            match self.watches.set_watch(&state_path, callback) {
                Ok(_) => debug!("{key} device found"),
                Err(e) => {
                    warn!("{key}: cannot watch state: {e}");
                    if let Some(record) = self.state.lock().domains.get_mut(&domain) {
                        record.devices.remove(&device);
                    }
                }
            }
        }
        Ok(())
    }

    fn on_frontend_state_changed(&self, domain: DomainId, device: DeviceId) -> Result<(), BackendError> {
        let key = FrontendKey::new(domain, device);
        let Some(state_path) = self
            .state
            .lock()
            .domains
            .get(&domain)
            .and_then(|d| d.devices.get(&device))
            .map(|record| record.state_path.clone())
        else {
            return Ok(());
        };

        let frontend_state = match self.store.read_state(&state_path) {
            Ok(Some(frontend_state)) => frontend_state,
            // Node removed; the device-list trigger tears the device down.
            Ok(None) => return Ok(()),
            Err(BackendError::InvalidValue { value, .. }) => {
                warn!("{key}: unreadable frontend state {value:?}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        debug!("{key} frontend state: {frontend_state}");

        let action = {
            let mut state = self.state.lock();
            if !state.active {
                return Ok(());
            }
            let Some(record) = state
                .domains
                .get_mut(&domain)
                .and_then(|d| d.devices.get_mut(&device))
            else {
                return Ok(());
            };
            let action = match &record.slot {
                Slot::Active(handler) => Some(StateAction::Forward(Arc::clone(handler))),
                Slot::Creating => None,
                slot if self.should_attach(slot, frontend_state) => {
                    Some(StateAction::Create(FrontendRecord::new(
                        self.config.device_class.clone(),
                        key,
                        record.device_path.clone(),
                        self.store.clone(),
                    )))
                }
                _ => None,
            };
            if matches!(action, Some(StateAction::Create(_))) {
                record.slot = Slot::Creating;
            }
            action
        };

        match action {
            Some(StateAction::Create(frontend)) => self.create_handler(&frontend),
            Some(StateAction::Forward(owned)) => {
                owned.dispatch(|handler| handler.on_frontend_state_changed(frontend_state));
                if owned.dispatch(|handler| handler.is_terminated()) == Some(true) {
                    self.release_terminated(key, owned);
                }
            }
            None => {}
        }
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn should_attach(&self, slot: &Slot, frontend_state: ConnectionState) -> bool {
        match slot {
            Slot::Detached => frontend_state == ConnectionState::Initializing,
            _ if self.config.wait_for_frontend => frontend_state == ConnectionState::Initializing,
            _ => frontend_state.is_recognized() && !frontend_state.is_closing(),
        }
    }

    /// Whether this backend should serve the device at `device_path`.
    ///
    /// A device without a `backend-id` node is served; one naming a different
    /// domain is left to that backend.
    fn serves(&self, device_path: &str) -> Result<bool, BackendError> {
        let backend_id_path = paths::backend_id_path(device_path);
        match self.store.read_string(&backend_id_path)? {
            None => Ok(true),
            Some(text) => match text.parse::<DomainId>() {
                Ok(backend) => Ok(backend == self.own_domain),
                Err(e) => {
                    warn!("{backend_id_path}: {e}");
                    Ok(false)
                }
            },
        }
    }

    fn create_handler(&self, frontend: &FrontendRecord) {
        let key = frontend.key();
        let created = self.factory.create(frontend);

        let orphan = {
            let mut state = self.state.lock();
            let record = state
                .domains
                .get_mut(&key.domain)
                .and_then(|d| d.devices.get_mut(&key.device))
                .filter(|record| matches!(record.slot, Slot::Creating));

            match (created, record) {
                (Ok(handler), Some(record)) => {
                    record.slot = Slot::Active(OwnedHandler::new(handler));
                    info!("{key} frontend attached");
                    None
                }
                // Device vanished or the engine stopped while the factory ran.
                (Ok(handler), None) => Some(OwnedHandler::new(handler)),
                (Err(e), Some(record)) => {
                    record.slot = Slot::Detached;
                    warn!("{key} handler creation failed: {e}");
                    None
                }
                (Err(e), None) => {
                    warn!("{key} handler creation failed: {e}");
                    None
                }
            }
        };
        if let Some(handler) = orphan {
            dispose(vec![(key, handler)]);
        }
    }

    fn release_terminated(&self, key: FrontendKey, handler: Arc<OwnedHandler>) {
        let released = {
            let mut state = self.state.lock();
            match state
                .domains
                .get_mut(&key.domain)
                .and_then(|d| d.devices.get_mut(&key.device))
            {
                Some(record)
                    if matches!(&record.slot, Slot::Active(current) if Arc::ptr_eq(current, &handler)) =>
                {
                    record.slot = Slot::Detached;
                    true
                }
                _ => false,
            }
        };
        if released {
            info!("{key} handler terminated");
            dispose(vec![(key, handler)]);
        }
    }

    fn clear_watch_logged(&self, path: &str) {
        if let Err(e) = self.watches.clear_watch(path) {
            warn!("failed to clear watch on {path}: {e}");
        }
    }
}

/// Every state watch of a domain, then its device-list watch.
fn collect_domain_watches(record: &DomainRecord, watches: &mut Vec<String>) {
    watches.extend(record.devices.values().map(|device| device.state_path.clone()));
    watches.push(record.device_list_path.clone());
}

fn collect_handlers(domain: DomainId, record: DomainRecord, released: &mut Released) {
    for (device, device_record) in record.devices {
        if let Slot::Active(handler) = device_record.slot {
            released.push((FrontendKey::new(domain, device), handler));
        }
    }
}

/// Notifies and drops released handlers.  Must run without the engine lock
/// and after their watches are cleared.
fn dispose(released: Released) {
    for (key, handler) in released {
        if handler.release() {
            info!("{key} frontend released");
        }
    }
}
