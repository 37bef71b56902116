//! Integration tests for the discovery engine.
//!
//! Every test drives the public API against the in-memory control plane and
//! observes the engine through a recording handler factory.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use xenbe_backend::application::discovery::{DiscoveryEngine, EngineConfig};
use xenbe_backend::application::frontend::{FrontendFactory, FrontendHandler, FrontendRecord};
use xenbe_backend::BackendError;
use xenbe_core::control::mock::MockControlPlane;
use xenbe_core::domain::paths;
use xenbe_core::{ConnectionState, DeviceId, DomainId, FrontendKey};

const CLASS: &str = "vif";
const DEV0: DeviceId = DeviceId(0);

// ── Test doubles ──────────────────────────────────────────────────────────────

type StateHook = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Shared log of everything the engine did to handlers.
#[derive(Default)]
struct Ledger {
    created: Mutex<Vec<FrontendKey>>,
    live: Mutex<BTreeSet<FrontendKey>>,
    duplicate_create: AtomicBool,
    /// Watches still registered at the moment each handler was released.
    watches_at_removal: Mutex<Vec<(FrontendKey, Vec<(String, String)>)>>,
    state_calls: AtomicUsize,
}

struct RecordingHandler {
    key: FrontendKey,
    plane: MockControlPlane,
    ledger: Arc<Ledger>,
    on_state: Option<StateHook>,
}

impl FrontendHandler for RecordingHandler {
    fn on_frontend_state_changed(&self, state: ConnectionState) {
        self.ledger.state_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.on_state {
            hook(state);
        }
    }

    fn on_removed(&self) {
        self.ledger.live.lock().remove(&self.key);
        self.ledger
            .watches_at_removal
            .lock()
            .push((self.key, self.plane.active_watches()));
    }
}

struct RecordingFactory {
    plane: MockControlPlane,
    ledger: Arc<Ledger>,
    hook: Mutex<Option<StateHook>>,
}

impl RecordingFactory {
    fn new(plane: &MockControlPlane) -> Arc<Self> {
        Arc::new(Self {
            plane: plane.clone(),
            ledger: Arc::new(Ledger::default()),
            hook: Mutex::new(None),
        })
    }
}

impl FrontendFactory for RecordingFactory {
    fn create(&self, frontend: &FrontendRecord) -> Result<Box<dyn FrontendHandler>, BackendError> {
        let key = frontend.key();
        self.ledger.created.lock().push(key);
        if !self.ledger.live.lock().insert(key) {
            self.ledger.duplicate_create.store(true, Ordering::SeqCst);
        }
        Ok(Box::new(RecordingHandler {
            key,
            plane: self.plane.clone(),
            ledger: Arc::clone(&self.ledger),
            on_state: self.hook.lock().clone(),
        }))
    }
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn settle() {
    std::thread::sleep(Duration::from_millis(100));
}

fn start_engine(plane: &MockControlPlane) -> (DiscoveryEngine, Arc<RecordingFactory>) {
    let factory = RecordingFactory::new(plane);
    let engine = DiscoveryEngine::new(plane, EngineConfig::new(CLASS), factory.clone()).unwrap();
    engine.start().unwrap();
    (engine, factory)
}

fn key(domain: u16, device: u16) -> FrontendKey {
    FrontendKey::new(DomainId(domain), DeviceId(device))
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn test_domain_removal_clears_watches_before_releasing_handler() {
    // Arrange: domains {3, 7}
    let plane = MockControlPlane::new();
    plane.add_domain(DomainId(3));
    plane.add_domain(DomainId(7));
    let (engine, factory) = start_engine(&plane);
    assert!(eventually(|| engine.tracked_domains() == vec![DomainId(3), DomainId(7)]));
    let watched: Vec<String> = plane.active_watches().into_iter().map(|(p, _)| p).collect();
    assert!(watched.contains(&"/local/domain/3/device/vif".to_string()));
    assert!(watched.contains(&"/local/domain/7/device/vif".to_string()));

    // Act 1: device 0 appears in domain 3
    plane.add_frontend(DomainId(3), CLASS, DEV0, ConnectionState::Initializing);

    // Assert 1: exactly one creation
    assert!(eventually(|| engine.frontends() == vec![key(3, 0)]));
    settle();
    assert_eq!(*factory.ledger.created.lock(), vec![key(3, 0)]);

    // Act 2: domain list shrinks to {7}
    let calls_before = factory.ledger.state_calls.load(Ordering::SeqCst);
    plane.remove_domain(DomainId(3));

    // Assert 2: domain gone, handler released after its watches were cleared
    assert!(eventually(|| engine.tracked_domains() == vec![DomainId(7)]));
    assert!(eventually(|| factory.ledger.watches_at_removal.lock().len() == 1));
    let (released, remaining) = factory.ledger.watches_at_removal.lock()[0].clone();
    assert_eq!(released, key(3, 0));
    assert!(
        remaining.iter().all(|(path, _)| !paths::is_within(path, "/local/domain/3")),
        "watches under the removed domain still registered: {remaining:?}"
    );
    settle();
    assert_eq!(factory.ledger.state_calls.load(Ordering::SeqCst), calls_before);
    assert!(engine.frontends().is_empty());
    engine.stop();
}

#[test]
fn test_domain_created_and_removed_before_processing_never_creates_handler() {
    // Arrange: a handler in domain 2 that blocks the watch thread on demand
    let plane = MockControlPlane::new();
    let factory = RecordingFactory::new(&plane);
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    *factory.hook.lock() = Some(Arc::new(move |state: ConnectionState| {
        if state == ConnectionState::Connected {
            let _ = entered_tx.lock().send(());
            let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
        }
    }));
    plane.add_domain(DomainId(2));
    plane.add_frontend(DomainId(2), CLASS, DEV0, ConnectionState::Initializing);
    let engine =
        DiscoveryEngine::new(&plane, EngineConfig::new(CLASS), factory.clone()).unwrap();
    engine.start().unwrap();
    assert!(eventually(|| engine.frontends() == vec![key(2, 0)]));

    // Act: park the watch thread, then create and destroy domain 5
    plane.set_frontend_state(DomainId(2), CLASS, DEV0, ConnectionState::Connected);
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    plane.add_domain(DomainId(5));
    plane.add_frontend(DomainId(5), CLASS, DEV0, ConnectionState::Initializing);
    plane.remove_domain(DomainId(5));
    release_tx.send(()).unwrap();
    settle();

    // Assert
    assert!(!factory.ledger.created.lock().contains(&key(5, 0)));
    assert_eq!(engine.tracked_domains(), vec![DomainId(2)]);
    assert!(plane
        .active_watches()
        .iter()
        .all(|(path, _)| !paths::is_within(path, "/local/domain/5")));
    engine.stop();
}

#[test]
fn test_tracked_domains_converge_after_mutation_sequence() {
    // Arrange
    let plane = MockControlPlane::new();
    let (engine, factory) = start_engine(&plane);

    // Act: interleaved adds and removes, some domains re-added
    let mut expected = BTreeSet::new();
    for round in 0..3u16 {
        for domain in 1..=6u16 {
            if (domain + round) % 3 == 0 {
                plane.remove_domain(DomainId(domain));
                expected.remove(&domain);
            } else {
                plane.add_domain(DomainId(domain));
                plane.add_frontend(DomainId(domain), CLASS, DEV0, ConnectionState::Initializing);
                expected.insert(domain);
            }
        }
    }

    // Assert
    let expected_domains: Vec<DomainId> = expected.iter().copied().map(DomainId).collect();
    let expected_frontends: Vec<FrontendKey> = expected.iter().map(|d| key(*d, 0)).collect();
    assert!(eventually(|| engine.tracked_domains() == expected_domains));
    assert!(eventually(|| engine.frontends() == expected_frontends));
    settle();
    assert!(!factory.ledger.duplicate_create.load(Ordering::SeqCst));
    assert_eq!(
        factory.ledger.live.lock().iter().copied().collect::<Vec<_>>(),
        expected_frontends
    );
    engine.stop();
    assert!(factory.ledger.live.lock().is_empty());
}

#[test]
fn test_unrecognized_state_is_forwarded_to_active_handler() {
    let plane = MockControlPlane::new();
    let factory = RecordingFactory::new(&plane);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    *factory.hook.lock() = Some(Arc::new(move |state: ConnectionState| sink.lock().push(state)));
    plane.add_domain(DomainId(4));
    plane.add_frontend(DomainId(4), CLASS, DEV0, ConnectionState::Initializing);
    let engine = DiscoveryEngine::new(&plane, EngineConfig::new(CLASS), factory.clone()).unwrap();
    engine.start().unwrap();
    assert!(eventually(|| engine.has_frontend(DomainId(4), DEV0)));

    let state_path =
        paths::state_path(&MockControlPlane::frontend_path_of(DomainId(4), CLASS, DEV0));
    plane.write(&state_path, "99");

    assert!(eventually(|| seen.lock().contains(&ConnectionState::Unrecognized(99))));
    engine.stop();
}

#[test]
fn test_stop_from_any_state_returns_and_silences_callbacks() {
    let plane = MockControlPlane::new();
    let factory = RecordingFactory::new(&plane);
    let engine = DiscoveryEngine::new(&plane, EngineConfig::new(CLASS), factory.clone()).unwrap();

    // Never started
    engine.stop();
    engine.wait_for_finish().unwrap();

    // Running with an active handler
    plane.add_domain(DomainId(3));
    plane.add_frontend(DomainId(3), CLASS, DEV0, ConnectionState::Initializing);
    engine.start().unwrap();
    assert!(eventually(|| engine.frontends().len() == 1));
    engine.stop();
    let calls = factory.ledger.state_calls.load(Ordering::SeqCst);

    // Already stopped
    engine.stop();
    plane.set_frontend_state(DomainId(3), CLASS, DEV0, ConnectionState::Connected);
    settle();

    assert_eq!(factory.ledger.state_calls.load(Ordering::SeqCst), calls);
    assert!(engine.tracked_domains().is_empty());
    assert!(plane.active_watches().is_empty());
    assert!(factory.ledger.live.lock().is_empty());

    // Restartable after stop
    engine.start().unwrap();
    assert!(eventually(|| engine.frontends().len() == 1));
    engine.stop();
}

#[test]
fn test_stop_from_inside_handler_callback_unblocks_wait_for_finish() {
    // Arrange: the handler stops its own engine when the frontend connects
    let plane = MockControlPlane::new();
    let factory = RecordingFactory::new(&plane);
    let slot: Arc<Mutex<Weak<DiscoveryEngine>>> = Arc::new(Mutex::new(Weak::new()));
    let inner_slot = Arc::clone(&slot);
    *factory.hook.lock() = Some(Arc::new(move |state: ConnectionState| {
        if state == ConnectionState::Connected {
            if let Some(engine) = inner_slot.lock().upgrade() {
                engine.stop();
            }
        }
    }));
    let engine = Arc::new(
        DiscoveryEngine::new(&plane, EngineConfig::new(CLASS), factory.clone()).unwrap(),
    );
    *slot.lock() = Arc::downgrade(&engine);
    plane.add_domain(DomainId(3));
    plane.add_frontend(DomainId(3), CLASS, DEV0, ConnectionState::Initializing);
    engine.start().unwrap();
    assert!(eventually(|| engine.frontends().len() == 1));

    // Act
    plane.set_frontend_state(DomainId(3), CLASS, DEV0, ConnectionState::Connected);
    let waiter = Arc::clone(&engine);
    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = done_tx.send(waiter.wait_for_finish().is_ok());
    });

    // Assert
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert!(eventually(|| !engine.is_running()));
    assert!(factory.ledger.live.lock().is_empty());
}

#[test]
fn test_severed_store_connection_fails_wait_for_finish() {
    let plane = MockControlPlane::new();
    let (engine, _factory) = start_engine(&plane);
    let reported = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&reported);
    engine.set_error_callback(Some(Arc::new(move |_: &BackendError| {
        flag.store(true, Ordering::SeqCst);
    })));

    plane.sever_store_connections();

    assert!(matches!(
        engine.wait_for_finish(),
        Err(BackendError::WatchLoopFailed(_))
    ));
    assert!(reported.load(Ordering::SeqCst));
    engine.stop();
}

#[test]
fn test_own_domain_override_skips_configured_domain() {
    let plane = MockControlPlane::new();
    plane.add_domain(DomainId(1));
    plane.add_domain(DomainId(9));
    let factory = RecordingFactory::new(&plane);
    let config = EngineConfig::new(CLASS).with_own_domain(DomainId(9));
    let engine = DiscoveryEngine::new(&plane, config, factory).unwrap();

    engine.start().unwrap();

    // Dom0 is just another guest from Dom9's point of view.
    assert!(eventually(|| engine.tracked_domains() == vec![DomainId(0), DomainId(1)]));
    engine.stop();
}
