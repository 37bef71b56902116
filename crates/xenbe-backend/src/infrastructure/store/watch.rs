//! Store watch multiplexer: one background loop dispatching every watch
//! registered on a store connection.
//!
//! # How it works (for beginners)
//!
//! The store lets a client register interest in a path together with an
//! opaque *token*.  Whenever that path (or anything beneath it) changes, the
//! store queues a `(fired path, token)` event on the connection.  This module
//! owns the table that maps tokens back to callbacks, and a thread that:
//!
//! 1. Blocks in a [`CancellableWait`] on the connection's descriptor.
//! 2. Reads the next event.
//! 3. Looks the token up and, if it is still registered, invokes the callback.
//!
//! Tokens are generated here (`xenbe-watch-<n>`) rather than reusing the
//! path, so a callback can tell registrations apart even when two paths fire
//! the same change.
//!
//! Callbacks run on the loop thread *outside* the table lock, so a callback
//! may register or clear watches (including its own) freely.  Callbacks from
//! one multiplexer never overlap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};
use xenbe_core::StoreHandle;

use super::StoreClient;
use crate::error::{BackendError, ErrorCallback};
use crate::infrastructure::join_unless_current;
use crate::infrastructure::poll::{CancellableWait, PollInterest, WaitOutcome};

/// What a watch callback is told about the event that fired it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTrigger {
    /// Token of the registration that matched.
    pub token: String,
    /// Path the registration was made for.
    pub path: String,
    /// Path the store reported as changed (the watched path or a descendant).
    pub fired_path: String,
}

/// A watch callback.  Returning an error stops the loop.
pub type WatchCallback = Arc<dyn Fn(&WatchTrigger) -> Result<(), BackendError> + Send + Sync>;

struct Registration {
    token: String,
    callback: WatchCallback,
}

#[derive(Default)]
struct WatchTable {
    by_path: HashMap<String, Registration>,
    path_by_token: HashMap<String, String>,
}

impl WatchTable {
    fn has_token(&self, path: &str, token: &str) -> bool {
        self.by_path.get(path).is_some_and(|r| r.token == token)
    }

    fn remove_if_token(&mut self, path: &str, token: &str) {
        if self.has_token(path, token) {
            self.by_path.remove(path);
            self.path_by_token.remove(token);
        }
    }
}

struct Shared {
    store: Arc<dyn StoreHandle>,
    table: Mutex<WatchTable>,
    next_token: AtomicU64,
    error_callback: Mutex<Option<ErrorCallback>>,
}

struct Worker {
    wait: Arc<CancellableWait>,
    thread: JoinHandle<()>,
}

/// Dispatches store watch events to per-path callbacks.
pub struct StoreWatchMultiplexer {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl StoreWatchMultiplexer {
    pub fn new(store: &StoreClient) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Arc::clone(store.handle()),
                table: Mutex::new(WatchTable::default()),
                next_token: AtomicU64::new(0),
                error_callback: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Installs the handler for loop errors.  Without one, errors are logged.
    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        *self.shared.error_callback.lock() = callback;
    }

    // ── Registrations ─────────────────────────────────────────────────────────

    /// Registers `callback` for changes at or below `path`.
    ///
    /// If `path` is already registered the callback is replaced and the
    /// existing token kept; the store is not asked to watch it twice.
    ///
    /// The store fires every new watch once immediately, so the callback runs
    /// soon after registration (once the loop is started) even if nothing has
    /// changed.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::ControlPlane`] if the store rejects the watch;
    /// nothing is registered in that case.
    pub fn set_watch(&self, path: &str, callback: WatchCallback) -> Result<String, BackendError> {
        // The entry goes in first so the initial event always resolves; the
        // store call itself runs without the table lock.
        let token = {
            let mut table = self.shared.table.lock();
            if let Some(existing) = table.by_path.get_mut(path) {
                existing.callback = callback;
                debug!(path, token = %existing.token, "watch callback replaced");
                return Ok(existing.token.clone());
            }
            let token = format!(
                "xenbe-watch-{}",
                self.shared.next_token.fetch_add(1, Ordering::Relaxed)
            );
            table.path_by_token.insert(token.clone(), path.to_string());
            table.by_path.insert(
                path.to_string(),
                Registration {
                    token: token.clone(),
                    callback,
                },
            );
            token
        };

        if let Err(e) = self.shared.store.watch(path, &token) {
            self.shared.table.lock().remove_if_token(path, &token);
            return Err(e.into());
        }

        // Cleared while the store call was in flight.
        if !self.shared.table.lock().has_token(path, &token) {
            if let Err(e) = self.shared.store.unwatch(path, &token) {
                warn!(path, %token, "failed to drop watch cleared during registration: {e}");
            }
            debug!(path, %token, "watch cleared during registration");
            return Ok(token);
        }
        debug!(path, %token, "watch set");
        Ok(token)
    }

    /// Unregisters `path`.
    ///
    /// Clearing a path that is not registered is not an error: it is logged
    /// and `Ok(())` is returned.  Events already queued for the path are
    /// dropped by the loop.
    pub fn clear_watch(&self, path: &str) -> Result<(), BackendError> {
        let registration = {
            let mut table = self.shared.table.lock();
            let Some(registration) = table.by_path.remove(path) else {
                debug!("{}", BackendError::NotFound(path.to_string()));
                return Ok(());
            };
            table.path_by_token.remove(&registration.token);
            registration
        };
        self.shared.store.unwatch(path, &registration.token)?;
        debug!(path, token = %registration.token, "watch cleared");
        Ok(())
    }

    /// Unregisters every path.
    ///
    /// Every registration is removed from the table even if the store fails
    /// to drop some of them; the first such failure is returned.
    pub fn clear_watch_all(&self) -> Result<(), BackendError> {
        let drained: Vec<(String, Registration)> = {
            let mut table = self.shared.table.lock();
            table.path_by_token.clear();
            table.by_path.drain().collect()
        };
        let mut first_error = None;
        for (path, registration) in drained {
            if let Err(e) = self.shared.store.unwatch(&path, &registration.token) {
                warn!(%path, "failed to clear watch: {e}");
                first_error.get_or_insert(BackendError::from(e));
            }
        }
        debug!("all watches cleared");
        first_error.map_or(Ok(()), Err)
    }

    /// Paths currently registered, sorted.
    pub fn watched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.shared.table.lock().by_path.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn is_watched(&self, path: &str) -> bool {
        self.shared.table.lock().by_path.contains_key(path)
    }

    // ── Loop control ──────────────────────────────────────────────────────────

    /// Starts the dispatch loop.
    ///
    /// A loop that exited on its own after an error may be started again.
    ///
    /// # Errors
    ///
    /// - [`BackendError::AlreadyStarted`] if the loop is running.
    /// - [`BackendError::Wait`] if the wait cannot be armed.
    /// - [`BackendError::Spawn`] if the thread cannot be created.
    pub fn start(&self) -> Result<(), BackendError> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.thread.is_finished()) {
            return Err(BackendError::AlreadyStarted("store watch multiplexer"));
        }
        if let Some(previous) = worker.take() {
            join_unless_current(previous.thread, "store watch loop");
        }

        let wait = Arc::new(
            CancellableWait::arm(self.shared.store.fileno(), PollInterest::READABLE)
                .map_err(BackendError::Wait)?,
        );
        let thread = {
            let shared = Arc::clone(&self.shared);
            let wait = Arc::clone(&wait);
            thread::Builder::new()
                .name("xenbe-store-watch".to_string())
                .spawn(move || run(&shared, &wait))
                .map_err(|source| BackendError::Spawn {
                    name: "store watch",
                    source,
                })?
        };
        *worker = Some(Worker { wait, thread });
        debug!("store watch loop started");
        Ok(())
    }

    /// Cancels the loop and waits for it to exit.
    ///
    /// Safe from any state and from inside a watch callback.  Once it returns
    /// (from any other thread) no callback is running or will run.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if let Err(e) = worker.wait.cancel() {
            warn!("failed to signal store watch loop: {e}");
        }
        join_unless_current(worker.thread, "store watch loop");
        debug!("store watch loop stopped");
    }

    /// Returns `true` while the loop thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.thread.is_finished())
    }
}

impl Drop for StoreWatchMultiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn resolve(&self, token: &str) -> Option<(String, WatchCallback)> {
        let table = self.table.lock();
        let path = table.path_by_token.get(token)?;
        let registration = table.by_path.get(path)?;
        Some((path.clone(), Arc::clone(&registration.callback)))
    }

    fn report(&self, err: BackendError) {
        let callback = self.error_callback.lock().clone();
        match callback {
            Some(callback) => callback(&err),
            None => error!("store watch loop failed: {err}"),
        }
    }
}

fn run(shared: &Shared, wait: &CancellableWait) {
    loop {
        match wait.wait() {
            Ok(WaitOutcome::Ready) => {}
            Ok(WaitOutcome::Cancelled) => break,
            Err(e) => {
                shared.report(BackendError::Wait(e));
                break;
            }
        }

        let event = match shared.store.read_watch() {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                shared.report(e.into());
                break;
            }
        };

        let Some((path, callback)) = shared.resolve(&event.token) else {
            trace!(token = %event.token, fired = %event.path, "event for cleared watch dropped");
            continue;
        };
        let trigger = WatchTrigger {
            token: event.token,
            path,
            fired_path: event.path,
        };
        trace!(?trigger, "watch fired");
        if let Err(e) = callback(&trigger) {
            shared.report(e);
            break;
        }
    }
    debug!("store watch loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use std::os::unix::io::RawFd;
    use std::sync::mpsc::{self, Receiver};
    use std::time::Duration;
    use xenbe_core::control::mock::MockControlPlane;
    use xenbe_core::{ControlPlaneError, DomainId, RawWatchEvent};

    mock! {
        Store {}
        impl StoreHandle for Store {
            fn domain_path(&self, domain: DomainId) -> Result<String, ControlPlaneError>;
            fn read(&self, path: &str) -> Result<Option<String>, ControlPlaneError>;
            fn write(&self, path: &str, value: &str) -> Result<(), ControlPlaneError>;
            fn remove(&self, path: &str) -> Result<(), ControlPlaneError>;
            fn directory(&self, path: &str) -> Result<Option<Vec<String>>, ControlPlaneError>;
            fn watch(&self, path: &str, token: &str) -> Result<(), ControlPlaneError>;
            fn unwatch(&self, path: &str, token: &str) -> Result<(), ControlPlaneError>;
            fn read_watch(&self) -> Result<Option<RawWatchEvent>, ControlPlaneError>;
            fn fileno(&self) -> RawFd;
            fn close(&self) -> Result<(), ControlPlaneError>;
        }
    }

    /// A store whose `watch` call parks until the test releases it.
    fn gated_store(store: &mut MockStore) -> (Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        store.expect_watch().times(1).return_once(move |_, _| {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            Ok(())
        });
        (entered_rx, release_tx)
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn setup() -> (MockControlPlane, StoreWatchMultiplexer) {
        let plane = MockControlPlane::new();
        let store = StoreClient::open(&plane).unwrap();
        (plane, StoreWatchMultiplexer::new(&store))
    }

    fn forwarding() -> (WatchCallback, Receiver<WatchTrigger>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: WatchCallback =
            Arc::new(move |trigger: &WatchTrigger| -> Result<(), BackendError> {
                let _ = tx.lock().send(trigger.clone());
                Ok(())
            });
        (callback, rx)
    }

    #[test]
    fn test_set_watch_fires_once_on_registration_with_generated_token() {
        // Arrange
        let (_plane, mux) = setup();
        let (callback, rx) = forwarding();

        // Act
        let token = mux.set_watch("/local/domain", callback).unwrap();
        mux.start().unwrap();

        // Assert
        let trigger = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(token, "xenbe-watch-0");
        assert_eq!(trigger.token, token);
        assert_eq!(trigger.path, "/local/domain");
        assert_eq!(trigger.fired_path, "/local/domain");
        mux.stop();
    }

    #[test]
    fn test_change_below_watched_path_reports_fired_path() {
        let (plane, mux) = setup();
        let (callback, rx) = forwarding();
        mux.set_watch("/local/domain", callback).unwrap();
        mux.start().unwrap();
        rx.recv_timeout(TIMEOUT).unwrap();

        plane.write("/local/domain/4", "");

        let trigger = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(trigger.path, "/local/domain");
        assert_eq!(trigger.fired_path, "/local/domain/4");
        mux.stop();
    }

    #[test]
    fn test_set_watch_twice_replaces_callback_and_keeps_token() {
        let (plane, mux) = setup();
        let (first, first_rx) = forwarding();
        let (second, second_rx) = forwarding();

        let token_a = mux.set_watch("/a", first).unwrap();
        let token_b = mux.set_watch("/a", second).unwrap();
        mux.start().unwrap();

        assert_eq!(token_a, token_b);
        assert_eq!(plane.active_watches().len(), 1);
        assert_eq!(second_rx.recv_timeout(TIMEOUT).unwrap().token, token_a);
        assert!(first_rx.try_recv().is_err());
        mux.stop();
    }

    #[test]
    fn test_clear_watch_on_unregistered_path_succeeds() {
        let (_plane, mux) = setup();

        assert!(mux.clear_watch("/never/registered").is_ok());
        assert!(mux.clear_watch("/never/registered").is_ok());
    }

    #[test]
    fn test_clear_watch_stops_delivery_and_unregisters() {
        let (plane, mux) = setup();
        let (callback, rx) = forwarding();
        mux.set_watch("/a", callback).unwrap();
        mux.start().unwrap();
        rx.recv_timeout(TIMEOUT).unwrap();

        mux.clear_watch("/a").unwrap();
        plane.write("/a/b", "1");

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(plane.active_watches().is_empty());
        assert!(!mux.is_watched("/a"));
        mux.stop();
    }

    #[test]
    fn test_callback_may_clear_its_own_watch() {
        let (plane, mux) = setup();
        let mux = Arc::new(mux);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let weak = Arc::downgrade(&mux);
        let callback: WatchCallback =
            Arc::new(move |trigger: &WatchTrigger| -> Result<(), BackendError> {
                if let Some(mux) = weak.upgrade() {
                    mux.clear_watch(&trigger.path)?;
                }
                let _ = tx.lock().send(());
                Ok(())
            });

        mux.set_watch("/a", callback).unwrap();
        mux.start().unwrap();

        rx.recv_timeout(TIMEOUT).unwrap();
        assert!(plane.active_watches().is_empty());
        mux.stop();
    }

    #[test]
    fn test_callback_error_goes_to_error_callback_and_ends_loop() {
        let (_plane, mux) = setup();
        let (err_tx, err_rx) = mpsc::channel();
        let err_tx = Mutex::new(err_tx);
        mux.set_error_callback(Some(Arc::new(move |e: &BackendError| {
            let _ = err_tx.lock().send(e.to_string());
        })));
        mux.set_watch("/a", Arc::new(|_: &WatchTrigger| Err(BackendError::Handler("bad".to_string()))))
            .unwrap();

        mux.start().unwrap();

        assert_eq!(
            err_rx.recv_timeout(TIMEOUT).unwrap(),
            "frontend handler error: bad"
        );
        std::thread::sleep(Duration::from_millis(50));
        assert!(!mux.is_running());
    }

    #[test]
    fn test_hang_up_on_store_connection_is_reported_as_wait_error() {
        let (plane, mux) = setup();
        let (err_tx, err_rx) = mpsc::channel();
        let err_tx = Mutex::new(err_tx);
        mux.set_error_callback(Some(Arc::new(move |e: &BackendError| {
            let _ = err_tx.lock().send(matches!(e, BackendError::Wait(_)));
        })));
        mux.start().unwrap();

        plane.sever_store_connections();

        assert!(err_rx.recv_timeout(TIMEOUT).unwrap());
    }

    #[test]
    fn test_start_twice_returns_already_started() {
        let (_plane, mux) = setup();
        mux.start().unwrap();

        let result = mux.start();

        assert!(matches!(result, Err(BackendError::AlreadyStarted(_))));
        mux.stop();
    }

    #[test]
    fn test_stop_from_any_state_returns() {
        let (_plane, mux) = setup();

        mux.stop();
        mux.start().unwrap();
        mux.stop();
        mux.stop();

        assert!(!mux.is_running());
    }

    #[test]
    fn test_failed_registration_leaves_nothing_behind() {
        let (plane, mux) = setup();
        plane.fail("store.watch");
        let (callback, _rx) = forwarding();

        let result = mux.set_watch("/a", callback);

        assert!(matches!(result, Err(BackendError::ControlPlane(_))));
        assert!(mux.watched_paths().is_empty());
    }

    #[test]
    fn test_clear_watch_all_unregisters_everything() {
        let (plane, mux) = setup();
        for path in ["/a", "/b", "/c"] {
            let (callback, _rx) = forwarding();
            mux.set_watch(path, callback).unwrap();
        }

        mux.clear_watch_all().unwrap();

        assert!(mux.watched_paths().is_empty());
        assert!(plane.active_watches().is_empty());
    }

    #[test]
    fn test_table_is_not_locked_while_store_registers_watch() {
        // Arrange
        let mut store = MockStore::new();
        let (entered, release) = gated_store(&mut store);
        let mux = Arc::new(StoreWatchMultiplexer::new(&StoreClient::from_handle(Arc::new(store))));
        let registering = {
            let mux = Arc::clone(&mux);
            std::thread::spawn(move || {
                let (callback, _rx) = forwarding();
                mux.set_watch("/a", callback)
            })
        };
        entered.recv_timeout(TIMEOUT).unwrap();

        // Act: table access from another thread while the store call is parked
        let (tx, rx) = mpsc::channel();
        {
            let mux = Arc::clone(&mux);
            std::thread::spawn(move || {
                let cleared = mux.clear_watch("/b").is_ok();
                let _ = tx.send((cleared, mux.watched_paths()));
            });
        }
        let observed = rx.recv_timeout(TIMEOUT);
        let _ = release.send(());

        // Assert
        assert_eq!(observed.unwrap(), (true, vec!["/a".to_string()]));
        assert_eq!(registering.join().unwrap().unwrap(), "xenbe-watch-0");
        assert!(mux.is_watched("/a"));
    }

    #[test]
    fn test_watch_cleared_during_registration_is_dropped_from_store() {
        // Arrange
        let mut store = MockStore::new();
        let (entered, release) = gated_store(&mut store);
        store
            .expect_unwatch()
            .withf(|path, token| path == "/a" && token == "xenbe-watch-0")
            .times(2)
            .returning(|_, _| Ok(()));
        let mux = Arc::new(StoreWatchMultiplexer::new(&StoreClient::from_handle(Arc::new(store))));
        let registering = {
            let mux = Arc::clone(&mux);
            std::thread::spawn(move || {
                let (callback, _rx) = forwarding();
                mux.set_watch("/a", callback)
            })
        };
        entered.recv_timeout(TIMEOUT).unwrap();

        // Act
        mux.clear_watch("/a").unwrap();
        let _ = release.send(());

        // Assert
        assert!(registering.join().unwrap().is_ok());
        assert!(!mux.is_watched("/a"));
    }
}
