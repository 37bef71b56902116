//! Simulated mode for the executable.
//!
//! There is no native driver binding in this binary, so `--simulate` runs the
//! discovery engine against the in-memory control plane and plays a scripted
//! guest on a timer:
//!
//! ```text
//! domain appears → frontend Initializing → event-channel published →
//! Connected → interrupt raised → Closing → Closed → domain destroyed → ...
//! ```
//!
//! The [`LoggingFactory`] creates handlers that log every state change (on a
//! deferred call queue, off the watch thread) and bind the frontend's event
//! channel once it is connected.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};
use xenbe_backend::application::frontend::{FrontendFactory, FrontendHandler, FrontendRecord};
use xenbe_backend::infrastructure::deferred::DeferredCallQueue;
use xenbe_backend::infrastructure::evtchn::EventChannelNotifier;
use xenbe_backend::infrastructure::timer::{TimerCallback, TimerService};
use xenbe_backend::BackendError;
use xenbe_core::control::mock::MockControlPlane;
use xenbe_core::domain::paths;
use xenbe_core::{ConnectionState, ControlPlane, DeviceId, DomainId};

/// Store node through which the simulated frontend publishes its port.
const EVENT_CHANNEL_NODE: &str = "event-channel";
const GUEST: DomainId = DomainId(1);
const DEVICE: DeviceId = DeviceId(0);
const GUEST_PORT: u32 = 15;

// ── Scripted guest ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Step {
    CreateDomain,
    PublishFrontend,
    Connect,
    RaiseInterrupt,
    Close,
    Closed,
    DestroyDomain,
}

const SCRIPT: [Step; 7] = [
    Step::CreateDomain,
    Step::PublishFrontend,
    Step::Connect,
    Step::RaiseInterrupt,
    Step::Close,
    Step::Closed,
    Step::DestroyDomain,
];

/// Plays [`SCRIPT`] against the mock control plane, one step per tick.
pub struct SimulatedGuest {
    timer: TimerService,
}

impl SimulatedGuest {
    pub fn new(plane: MockControlPlane, device_class: String) -> Self {
        let cursor = AtomicUsize::new(0);
        let callback: TimerCallback = Arc::new(move || {
            let step = SCRIPT[cursor.fetch_add(1, Ordering::Relaxed) % SCRIPT.len()];
            info!("simulated guest: {step:?}");
            play(&plane, &device_class, step);
        });
        Self {
            timer: TimerService::new(callback, true),
        }
    }

    pub fn start(&self, tick: Duration) -> Result<(), BackendError> {
        self.timer.start(tick)
    }

    pub fn stop(&self) {
        self.timer.stop();
    }
}

fn play(plane: &MockControlPlane, device_class: &str, step: Step) {
    let set_state = |state| plane.set_frontend_state(GUEST, device_class, DEVICE, state);
    match step {
        Step::CreateDomain => plane.add_domain(GUEST),
        Step::PublishFrontend => {
            let device_path = MockControlPlane::frontend_path_of(GUEST, device_class, DEVICE);
            plane.write(&paths::join(&device_path, EVENT_CHANNEL_NODE), &GUEST_PORT.to_string());
            plane.add_frontend(GUEST, device_class, DEVICE, ConnectionState::Initializing);
        }
        Step::Connect => set_state(ConnectionState::Connected),
        Step::RaiseInterrupt => {
            for port in plane.bound_ports() {
                plane.raise(port);
            }
        }
        Step::Close => set_state(ConnectionState::Closing),
        Step::Closed => set_state(ConnectionState::Closed),
        Step::DestroyDomain => plane.remove_domain(GUEST),
    }
}

// ── Logging handlers ──────────────────────────────────────────────────────────

/// Creates [`LoggingHandler`]s.
pub struct LoggingFactory {
    plane: Arc<dyn ControlPlane>,
    queue: Arc<DeferredCallQueue>,
}

impl LoggingFactory {
    pub fn new(plane: Arc<dyn ControlPlane>, queue: Arc<DeferredCallQueue>) -> Self {
        Self { plane, queue }
    }
}

impl FrontendFactory for LoggingFactory {
    fn create(&self, frontend: &FrontendRecord) -> Result<Box<dyn FrontendHandler>, BackendError> {
        info!(
            "{} new {} frontend at {}",
            frontend.key(),
            frontend.device_class(),
            frontend.device_path()
        );
        Ok(Box::new(LoggingHandler {
            frontend: frontend.clone(),
            plane: Arc::clone(&self.plane),
            queue: Arc::clone(&self.queue),
            channel: Mutex::new(None),
            terminated: AtomicBool::new(false),
        }))
    }
}

/// Logs state changes and serves the frontend's event channel while
/// connected.
pub struct LoggingHandler {
    frontend: FrontendRecord,
    plane: Arc<dyn ControlPlane>,
    queue: Arc<DeferredCallQueue>,
    channel: Mutex<Option<EventChannelNotifier>>,
    terminated: AtomicBool,
}

impl LoggingHandler {
    fn bind_channel(&self) -> Result<(), BackendError> {
        let node = paths::join(self.frontend.device_path(), EVENT_CHANNEL_NODE);
        let Some(remote_port) = self.frontend.store().read_uint(&node)? else {
            warn!("{} no {EVENT_CHANNEL_NODE} published", self.frontend.key());
            return Ok(());
        };
        let remote_port = u32::try_from(remote_port).map_err(|_| BackendError::InvalidValue {
            path: node,
            value: remote_port.to_string(),
        })?;

        let key = self.frontend.key();
        let notifier = EventChannelNotifier::new(
            self.plane.as_ref(),
            key.domain,
            remote_port,
            Arc::new(move || info!("{key} interrupt received")),
        )?;
        notifier.start()?;
        *self.channel.lock() = Some(notifier);
        Ok(())
    }
}

impl FrontendHandler for LoggingHandler {
    fn on_frontend_state_changed(&self, state: ConnectionState) {
        let key = self.frontend.key();
        if let Err(e) = self
            .queue
            .submit(move || info!("{key} frontend state changed to {state}"))
        {
            warn!("{key} state change not logged: {e}");
        }

        match state {
            ConnectionState::Connected => {
                if let Err(e) = self.bind_channel() {
                    warn!("{key} cannot bind event channel: {e}");
                }
            }
            ConnectionState::Closing => {
                self.channel.lock().take();
            }
            ConnectionState::Closed => self.terminated.store(true, Ordering::SeqCst),
            _ => {}
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn on_removed(&self) {
        self.channel.lock().take();
        info!("{} handler released", self.frontend.key());
    }
}
