//! Tunnel Manager
//!
//! Owns the single-tunnel run/stop state machine. `start` does the
//! fallible setup on the caller's thread, then hands the transport routine
//! to a background task whose single exit path closes the device, resets
//! the state and notifies the observer.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = TunnelManager::new(runtime.handle().clone(), transport, BridgeSettings::default());
//! manager.options().set_sni("example.com");
//!
//! let handle = unsafe { TunHandle::from_raw_fd(tun_fd) };
//! manager.start(TunnelRequest::new(profile_path, handle, 1280).with_observer(observer))?;
//!
//! if manager.is_running() {
//!     manager.stop(); // completion arrives via on_disconnected
//! }
//! ```

use crate::device::{PacketQueue, PacketSink, TunDevice, TunHandle};
use crate::endpoint::{self, EndpointError};
use crate::options::OptionsStore;
use crate::profile::{Profile, ProfileError};
use crate::settings::{self, BridgeSettings, SettingsError};
use crate::transport::{SessionConfig, Transport, TunnelLink, TunnelParams};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives tunnel state notifications
///
/// Always called from a background task, never from inside `start` or
/// `stop`.
pub trait TunnelObserver: Send + Sync {
    /// The tunnel is believed to be up
    fn on_connected(&self);
    /// The run is over
    fn on_disconnected(&self, reason: &str);
    /// The run failed; followed by `on_disconnected`
    fn on_error(&self, message: &str);
}

/// Where inbound (host -> tunnel) packets come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InboundMode {
    /// The transport reads the TUN descriptor directly
    #[default]
    Device,
    /// The host pushes packets through [`TunnelManager::input_packet`]
    Queue,
}

/// Parameters of one `start` call
pub struct TunnelRequest {
    /// Profile file produced by registration
    pub profile_path: PathBuf,
    /// Host TUN descriptor
    pub handle: TunHandle,
    /// Interface MTU; 0 selects the configured default
    pub mtu: usize,
    /// Outbound packet redirection
    pub sink: Option<Arc<dyn PacketSink>>,
    /// State observer
    pub observer: Option<Arc<dyn TunnelObserver>>,
    /// Inbound packet source
    pub inbound: InboundMode,
}

impl TunnelRequest {
    pub fn new(profile_path: impl Into<PathBuf>, handle: TunHandle, mtu: usize) -> Self {
        Self {
            profile_path: profile_path.into(),
            handle,
            mtu,
            sink: None,
            observer: None,
            inbound: InboundMode::Device,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn PacketSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TunnelObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_inbound(mut self, inbound: InboundMode) -> Self {
        self.inbound = inbound;
        self
    }
}

/// Coordinator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    /// No run
    Idle,
    /// `start` is doing its synchronous setup
    Starting,
    /// A run is active
    Running,
}

/// Tunnel manager errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Tunnel is already running")]
    AlreadyRunning,

    #[error("Failed to load profile: {0}")]
    Profile(#[from] ProfileError),

    #[error("Invalid endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("Failed to prepare transport: {0:#}")]
    Transport(anyhow::Error),

    #[error("Failed to attach TUN device: {0}")]
    Device(#[source] std::io::Error),
}

/// Mutable coordinator state, guarded by one lock
///
/// `cancel` is `Some` exactly when `phase` is `Running`.
struct TunnelState {
    phase: TunnelPhase,
    /// Bumped on every successful start
    generation: u64,
    cancel: Option<CancellationToken>,
    observer: Option<Arc<dyn TunnelObserver>>,
    inbound: Option<Arc<PacketQueue>>,
}

impl TunnelState {
    fn new() -> Self {
        Self {
            phase: TunnelPhase::Idle,
            generation: 0,
            cancel: None,
            observer: None,
            inbound: None,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.phase == TunnelPhase::Running && self.generation == generation
    }

    /// Back to `Idle`, returning the inbound queue so it can be dropped
    /// outside the lock
    fn reset(&mut self) -> Option<Arc<PacketQueue>> {
        self.phase = TunnelPhase::Idle;
        self.cancel = None;
        self.observer = None;
        self.inbound.take()
    }
}

type SharedState = Arc<Mutex<TunnelState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, TunnelState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Setup produced by the synchronous half of `start`
struct PreparedRun<P> {
    session: SessionConfig,
    prepared: P,
    device: Arc<TunDevice>,
    inbound: Option<Arc<PacketQueue>>,
}

/// Tunnel Manager
///
/// One instance per process, shared by every control-surface entry point.
pub struct TunnelManager<T: Transport> {
    /// Runtime the background tasks run on
    runtime: Handle,
    /// External transport routine
    transport: Arc<T>,
    /// User-adjustable connection options
    options: OptionsStore,
    /// Tunables
    settings: BridgeSettings,
    /// Run state
    state: SharedState,
}

impl<T: Transport> TunnelManager<T> {
    /// Create a manager that spawns its tasks on `runtime`
    pub fn new(runtime: Handle, transport: T, settings: BridgeSettings) -> Self {
        Self::with_options(runtime, transport, settings, OptionsStore::new())
    }

    /// Create a manager with previously persisted options
    pub fn with_options(
        runtime: Handle,
        transport: T,
        settings: BridgeSettings,
        options: OptionsStore,
    ) -> Self {
        Self {
            runtime,
            transport: Arc::new(transport),
            options,
            settings,
            state: Arc::new(Mutex::new(TunnelState::new())),
        }
    }

    /// Connection options used by the next start
    pub fn options(&self) -> &OptionsStore {
        &self.options
    }

    /// Active settings
    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Current phase
    pub fn phase(&self) -> TunnelPhase {
        lock(&self.state).phase
    }

    /// Whether a run is active
    pub fn is_running(&self) -> bool {
        self.phase() == TunnelPhase::Running
    }

    /// Start a run.
    ///
    /// Returns once the background task is spawned; it does not wait for
    /// the remote handshake. On error nothing is spawned and the TUN
    /// descriptor is left untouched for the caller to dispose.
    pub fn start(&self, request: TunnelRequest) -> Result<(), TunnelError> {
        {
            let mut state = lock(&self.state);
            if state.phase != TunnelPhase::Idle {
                warn!("Start rejected: tunnel is {:?}", state.phase);
                return Err(TunnelError::AlreadyRunning);
            }
            state.phase = TunnelPhase::Starting;
        }

        info!(
            "Starting tunnel: profile={}, fd={}, mtu={}",
            request.profile_path.display(),
            request.handle.raw_fd(),
            request.mtu
        );

        let observer = request.observer.clone();
        let run = match self.prepare_run(request) {
            Ok(run) => run,
            Err(e) => {
                lock(&self.state).phase = TunnelPhase::Idle;
                error!("Tunnel start failed: {}", e);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let generation = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.phase = TunnelPhase::Running;
            state.cancel = Some(cancel.clone());
            state.observer = observer.clone();
            state.inbound = run.inbound.clone();
            state.generation
        };

        self.spawn_run(generation, run, cancel, observer);

        info!("Tunnel started (run {})", generation);
        Ok(())
    }

    /// Initiate teardown of the active run.
    ///
    /// Returns `false` (and does nothing) when idle. Completion is signalled
    /// by `on_disconnected`; `is_running` reports `false` immediately.
    pub fn stop(&self) -> bool {
        let queue = {
            let mut state = lock(&self.state);
            if state.phase != TunnelPhase::Running {
                debug!("Stop ignored: tunnel is {:?}", state.phase);
                return false;
            }

            info!("Stopping tunnel (run {})", state.generation);
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            state.reset()
        };

        // Closing the queue wakes a transport blocked on inbound reads
        if let Some(queue) = queue {
            log_dropped(&queue);
        }
        true
    }

    /// Push a host-read packet into the active run's inbound queue.
    ///
    /// Never blocks. Returns `false` if the packet was dropped (queue full,
    /// no run, or the run reads the descriptor directly).
    pub fn input_packet(&self, packet: &[u8]) -> bool {
        let queue = lock(&self.state).inbound.clone();
        match queue {
            Some(queue) => queue.push(packet.to_vec()),
            None => false,
        }
    }

    /// Everything fallible about a start, in order: MTU, profile, SNI,
    /// endpoint, transport setup, and finally taking the descriptor.
    fn prepare_run(&self, request: TunnelRequest) -> Result<PreparedRun<T::Prepared>, TunnelError> {
        let mtu = match request.mtu {
            0 => self.settings.default_mtu,
            mtu => mtu,
        };
        settings::validate_mtu(mtu)?;

        let profile = Profile::load(&request.profile_path)?;
        let credentials = profile.credentials()?;

        let options = self.options.get();
        let sni = if options.sni.is_empty() {
            self.transport.default_sni().to_string()
        } else {
            options.sni.clone()
        };
        info!("Using SNI: {}", sni);

        let endpoint = endpoint::resolve(&options, &profile)?;

        let session = SessionConfig {
            endpoint,
            sni,
            credentials,
            params: TunnelParams::from_settings(&self.settings, mtu),
        };

        let prepared = panic::catch_unwind(AssertUnwindSafe(|| self.transport.prepare(&session)))
            .unwrap_or_else(|payload| {
                Err(anyhow::anyhow!(
                    "transport setup panicked: {}",
                    panic_message(payload.as_ref())
                ))
            })
            .map_err(TunnelError::Transport)?;

        let file = request.handle.attach().map_err(TunnelError::Device)?;
        let device = TunDevice::new(file, mtu, request.sink);

        let (device, inbound) = match request.inbound {
            InboundMode::Device => (device, None),
            InboundMode::Queue => {
                let (queue, rx) = PacketQueue::bounded(self.settings.inbound_queue_capacity);
                (device.with_inbound_queue(rx), Some(Arc::new(queue)))
            }
        };

        Ok(PreparedRun {
            session,
            prepared,
            device: Arc::new(device),
            inbound,
        })
    }

    /// Spawn the transport task and the connected-notification watcher
    fn spawn_run(
        &self,
        generation: u64,
        run: PreparedRun<T::Prepared>,
        cancel: CancellationToken,
        observer: Option<Arc<dyn TunnelObserver>>,
    ) {
        let notifier = Arc::new(RunNotifier::new(observer));
        let (link, handshake) = TunnelLink::new(cancel.clone());
        let handshake = self.transport.reports_handshake().then_some(handshake);

        self.runtime.spawn(watch_connected(
            self.state.clone(),
            generation,
            cancel.clone(),
            notifier.clone(),
            handshake,
            self.settings.connect_grace(),
        ));

        let transport = self.transport.clone();
        let state = self.state.clone();
        let PreparedRun {
            session,
            prepared,
            device,
            ..
        } = run;

        self.runtime.spawn(async move {
            info!("Starting MASQUE tunnel to {}", session.endpoint);
            let task_device = device.clone();
            let result = tokio::task::spawn_blocking(move || {
                transport.maintain(session, prepared, task_device, link)
            })
            .await;

            finish_run(&state, generation, &device, &cancel, &notifier, result);
        });
    }
}

impl<T: Transport> Drop for TunnelManager<T> {
    fn drop(&mut self) {
        // Don't leave a transport running with nobody to stop it
        self.stop();
    }
}

/// Single exit path of a run
fn finish_run(
    state: &SharedState,
    generation: u64,
    device: &TunDevice,
    cancel: &CancellationToken,
    notifier: &RunNotifier,
    result: Result<anyhow::Result<()>, JoinError>,
) {
    info!("MASQUE tunnel exited (run {})", generation);
    let stopped = cancel.is_cancelled();

    // Releases the connected watcher
    cancel.cancel();
    device.close();

    let queue = {
        let mut state = lock(state);
        if state.generation == generation && state.phase == TunnelPhase::Running {
            state.reset()
        } else {
            None
        }
    };
    if let Some(queue) = queue {
        log_dropped(&queue);
    }

    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) if stopped => {
            debug!("Transport returned after stop: {:#}", e);
            None
        }
        Ok(Err(e)) => Some(format!("Transport error: {:#}", e)),
        Err(e) if e.is_panic() => {
            Some(format!("Transport panicked: {}", panic_message(e.into_panic().as_ref())))
        }
        Err(e) => Some(format!("Transport task aborted: {}", e)),
    };

    match &failure {
        Some(message) => {
            error!("{}", message);
            notifier.disconnected(Some(message), &format!("Tunnel failed: {}", message));
        }
        None if stopped => notifier.disconnected(None, "Tunnel stopped"),
        None => notifier.disconnected(None, "Tunnel closed"),
    }
}

/// Fire `on_connected` once the handshake is reported or the grace delay
/// passes, unless the run ended first
async fn watch_connected(
    state: SharedState,
    generation: u64,
    cancel: CancellationToken,
    notifier: Arc<RunNotifier>,
    handshake: Option<oneshot::Receiver<()>>,
    grace: Duration,
) {
    let trigger = async move {
        match handshake {
            Some(rx) => rx.await.is_ok(),
            None => {
                tokio::time::sleep(grace).await;
                true
            }
        }
    };

    tokio::select! {
        fired = trigger => {
            if fired {
                notifier.connected(|| lock(&state).is_current(generation));
            }
        }
        _ = cancel.cancelled() => {}
    }
}

/// Per-run observer delivery
///
/// Serializes the two notifications so `on_connected` can never follow
/// `on_disconnected`, and each fires at most once.
struct RunNotifier {
    observer: Option<Arc<dyn TunnelObserver>>,
    progress: Mutex<Progress>,
}

#[derive(Default)]
struct Progress {
    connected: bool,
    disconnected: bool,
}

impl RunNotifier {
    fn new(observer: Option<Arc<dyn TunnelObserver>>) -> Self {
        Self {
            observer,
            progress: Mutex::new(Progress::default()),
        }
    }

    fn connected(&self, still_running: impl FnOnce() -> bool) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if progress.connected || progress.disconnected || !still_running() {
            return;
        }
        progress.connected = true;

        info!("Tunnel connected");
        if let Some(observer) = &self.observer {
            observer.on_connected();
        }
    }

    fn disconnected(&self, error: Option<&str>, reason: &str) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if progress.disconnected {
            return;
        }
        progress.disconnected = true;

        info!("Tunnel disconnected: {}", reason);
        if let Some(observer) = &self.observer {
            if let Some(message) = error {
                observer.on_error(message);
            }
            observer.on_disconnected(reason);
        }
    }
}

fn log_dropped(queue: &PacketQueue) {
    let dropped = queue.dropped();
    if dropped > 0 {
        warn!("Inbound queue dropped {} packets during the run", dropped);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
