//! Persistent connection manager
//!
//! Owns the session, the socket, and the reconnect policy:
//! - `connect()` walks login (captcha-assisted when configured) →
//!   device directory → socket upgrade, and resolves once the socket
//!   is open and the read loop is live
//! - inbound state frames update the per-device state machines and fan
//!   out as typed [`Event`]s
//! - a periodic health probe and the socket's own error/close paths
//!   all signal one supervisor task, which drives a single-flight
//!   reconnect loop with exponential backoff
//!
//! External callers only read device snapshots and call
//! [`Connection::send_command`]; all mutation happens inside the
//! manager's own tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, ORIGIN, USER_AGENT};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Authenticator, Session};
use crate::config::Config;
use crate::device::{normalize_mac, CommandAction, CommandState, Device, Power, Telemetry};
use crate::directory::{Directory, DirectoryError};
use crate::protocol::{InboundFrame, STATE_UPDATE};
use crate::solver::SolverClient;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("device directory fetch failed: {0}")]
    Directory(#[from] DirectoryError),

    #[error("socket handshake failed: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("socket is not connected")]
    NotConnected,

    #[error("no device with MAC {0}")]
    UnknownDevice(String),

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("socket write failed: {0}")]
    Send(tokio_tungstenite::tungstenite::Error),
}

/// Lifecycle of one manager instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    /// Obtaining a session
    Connecting,
    /// Fetching the directory and upgrading the socket
    Subscribing,
    Live,
    Reconnecting {
        attempt: u32,
    },
}

/// Typed notifications fanned out to subscribers
#[derive(Debug, Clone)]
pub enum Event {
    /// A device's command state was confirmed by the backend
    StateChanged {
        mac_address: String,
        state: CommandState,
    },
    /// A device reported new room telemetry
    TemperatureChanged {
        mac_address: String,
        telemetry: Telemetry,
    },
    /// Socket-level failure, including reconnect exhaustion; the
    /// manager recovers (or goes Idle) on its own
    ConnectionError { message: String },
}

/// Handle to a persistent cloud connection. Cheap to clone; all clones
/// drive the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

struct Shared {
    config: Config,
    auth: Authenticator,
    directory: Directory,
    solver: Option<SolverClient>,
    session: RwLock<Option<Session>>,
    devices: RwLock<HashMap<String, Device>>,
    previous_power: RwLock<HashMap<String, Power>>,
    sink: Mutex<Option<WsSink>>,
    state: RwLock<ConnectionState>,
    events: broadcast::Sender<Event>,
    reconnect_tx: mpsc::UnboundedSender<()>,
    reconnect_in_flight: AtomicBool,
    attempts: AtomicU32,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Must be called from within a Tokio runtime; the reconnect
    /// supervisor is spawned here.
    pub fn new(config: Config) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .expect("failed to build HTTP client");

        let auth = Authenticator::new(client.clone(), config.clone());
        let directory = Directory::new(client, config.clone());
        let solver = config.solver.clone().map(SolverClient::new);
        let (events, _) = broadcast::channel(64);
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Shared {
            config,
            auth,
            directory,
            solver,
            session: RwLock::new(None),
            devices: RwLock::new(HashMap::new()),
            previous_power: RwLock::new(HashMap::new()),
            sink: Mutex::new(None),
            state: RwLock::new(ConnectionState::Idle),
            events,
            reconnect_tx,
            reconnect_in_flight: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            reader_task: Mutex::new(None),
            health_task: Mutex::new(None),
            expiry_task: Mutex::new(None),
            reconnect_task: Mutex::new(None),
        });

        spawn_reconnect_supervisor(Arc::downgrade(&inner), reconnect_rx);

        Self { inner }
    }

    /// Subscribe to state, telemetry, and connection-error events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.state.read().await.clone()
    }

    /// Snapshot of all known devices.
    pub async fn devices(&self) -> Vec<Device> {
        self.inner.devices.read().await.values().cloned().collect()
    }

    /// Snapshot of one device; `mac` may be in any separator/case form.
    pub async fn device(&self, mac: &str) -> Option<Device> {
        self.inner.devices.read().await.get(&normalize_mac(mac)).cloned()
    }

    /// Current session, if authenticated.
    pub async fn session(&self) -> Option<Session> {
        self.inner.session.read().await.clone()
    }

    /// Authenticate, fetch the directory, and open the socket.
    /// Resolves once the socket is open; failures name the stage that
    /// broke and are not retried here.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if let Err(e) = establish(&self.inner).await {
            self.inner.set_state(ConnectionState::Idle).await;
            return Err(e);
        }
        spawn_health_probe(&self.inner).await;
        Ok(())
    }

    /// Orderly teardown: stop all tasks, close the socket, go Idle.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.set_state(ConnectionState::Idle).await;
        for slot in [&inner.health_task, &inner.expiry_task, &inner.reconnect_task] {
            if let Some(handle) = slot.lock().await.take() {
                handle.abort();
            }
        }
        inner.reconnect_in_flight.store(false, Ordering::Release);
        inner.teardown_socket().await;
        info!("disconnected");
    }

    /// Build and send one command. Resolves when the socket write
    /// completes; there is no queuing and no implicit reconnect.
    pub async fn send_command(&self, mac: &str, action: CommandAction) -> Result<(), CommandError> {
        let mac = normalize_mac(mac);
        let device = self
            .inner
            .devices
            .read()
            .await
            .get(&mac)
            .cloned()
            .ok_or_else(|| CommandError::UnknownDevice(mac.clone()))?;

        let old_power = self
            .inner
            .previous_power
            .read()
            .await
            .get(&mac)
            .copied()
            .unwrap_or_default();

        let user_id = self
            .inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.user_id.clone())
            .ok_or(CommandError::NotConnected)?;

        let envelope = device.build_command(&action, old_power, &user_id);
        let payload = serde_json::to_string(&envelope)?;

        let mut guard = self.inner.sink.lock().await;
        let sink = guard.as_mut().ok_or(CommandError::NotConnected)?;
        sink.send(Message::text(payload)).await.map_err(CommandError::Send)?;

        debug!(%mac, action = %envelope.action_type, "command sent");
        Ok(())
    }
}

impl Shared {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Hand reconnection over to the supervisor. Socket tasks never
    /// drive the policy themselves.
    fn signal_reconnect(&self) {
        let _ = self.reconnect_tx.send(());
    }

    /// Reuse the current session, refresh it when close to expiry, or
    /// fall back to a full (captcha-assisted) login.
    async fn ensure_session(&self) -> Result<Session, AuthError> {
        let margin = self.config.connection.refresh_margin();
        let existing = self.session.read().await.clone();

        if let Some(session) = existing {
            if !session.expires_within(margin) {
                return Ok(session);
            }
            match self.auth.refresh(&session).await {
                Ok(refreshed) => {
                    *self.session.write().await = Some(refreshed.clone());
                    return Ok(refreshed);
                }
                Err(e) => debug!(error = %e, "refresh failed, falling back to login"),
            }
        }

        let session = match &self.solver {
            Some(solver) => self.auth.login_with_solved_challenge(solver).await?,
            None => self.auth.login(None).await?,
        };
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// Route one inbound frame. Frames without the state-update
    /// discriminator and a device identity are ignored silently.
    async fn handle_frame(&self, raw: &str) {
        let frame: InboundFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(_) => return,
        };

        let (Some(kind), Some(mac)) = (frame.message_type, frame.mac_address) else {
            return;
        };
        if kind != STATE_UPDATE {
            return;
        }

        let mac = normalize_mac(&mac);
        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(&mac) else {
            debug!(%mac, "state update for unknown device ignored");
            return;
        };

        if let Some(action) = &frame.action {
            device.apply_action(action);
            if let Some(power) = action.power {
                self.previous_power.write().await.insert(mac.clone(), power);
            }
            self.emit(Event::StateChanged {
                mac_address: mac.clone(),
                state: device.state.clone(),
            });
        }

        if let Some(env) = &frame.lat_env_var {
            if device.apply_env(env) {
                self.emit(Event::TemperatureChanged {
                    mac_address: mac.clone(),
                    telemetry: device.telemetry,
                });
            }
        }
    }

    async fn teardown_socket(&self) {
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }
}

/// Exponential backoff: `base × 2^attempt`, capped at `max`.
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

async fn store_task(slot: &Mutex<Option<JoinHandle<()>>>, handle: JoinHandle<()>) {
    if let Some(old) = slot.lock().await.replace(handle) {
        old.abort();
    }
}

/// Full connect sequence; shared by `connect()` and every reconnect
/// attempt. On success the attempt counter resets and the manager is
/// Live.
async fn establish(shared: &Arc<Shared>) -> Result<(), ConnectError> {
    shared.set_state(ConnectionState::Connecting).await;
    let session = shared.ensure_session().await?;

    shared.set_state(ConnectionState::Subscribing).await;
    let devices = shared.directory.list_devices(&session).await?;

    {
        // Same lock order as the frame handler: devices, then
        // previous_power.
        let mut map = shared.devices.write().await;
        let mut previous_power = shared.previous_power.write().await;
        map.clear();
        for device in devices {
            previous_power.insert(device.mac_address.clone(), device.state.power);
            map.insert(device.mac_address.clone(), device);
        }
    }

    open_socket(shared, &session).await?;

    shared.set_state(ConnectionState::Live).await;
    shared.attempts.store(0, Ordering::Relaxed);

    if !shared.config.connection.disable_token_refresh {
        spawn_expiry_timer(shared, session.expires_at).await;
    }

    let device_count = shared.devices.read().await.len();
    info!(device_count, "connection live");
    Ok(())
}

/// Consumes reconnect signals from the socket tasks and runs the
/// policy for each. Holds only a weak handle so dropping the last
/// [`Connection`] clone shuts it down.
fn spawn_reconnect_supervisor(weak: Weak<Shared>, mut signals: mpsc::UnboundedReceiver<()>) {
    tokio::spawn(async move {
        while signals.recv().await.is_some() {
            let Some(shared) = weak.upgrade() else {
                break;
            };
            schedule_reconnect(&shared).await;
        }
    });
}

async fn open_socket(shared: &Arc<Shared>, session: &Session) -> Result<(), ConnectError> {
    let url = format!(
        "{}/websocket/?sessionId={}&token={}",
        shared.config.ws_base.trim_end_matches('/'),
        session.session_id,
        session.access_token
    );

    // The backend rejects the upgrade without a matching Origin and a
    // browser-like user agent.
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        ORIGIN,
        HeaderValue::from_str(&shared.config.web_origin)
            .map_err(|e| tokio_tungstenite::tungstenite::Error::HttpFormat(e.into()))?,
    );
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&shared.config.user_agent)
            .map_err(|e| tokio_tungstenite::tungstenite::Error::HttpFormat(e.into()))?,
    );

    let (stream, _response) = connect_async(request).await?;
    debug!("socket open");

    let (sink, read) = stream.split();
    *shared.sink.lock().await = Some(sink);

    let reader = {
        let shared = shared.clone();
        tokio::spawn(async move { read_loop(shared, read).await })
    };
    store_task(&shared.reader_task, reader).await;

    Ok(())
}

/// Consumes inbound frames in arrival order until the socket errors or
/// closes, then hands off to the reconnect policy.
async fn read_loop(shared: Arc<Shared>, mut read: WsRead) {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => shared.handle_frame(text.as_str()).await,
            Ok(Message::Close(_)) => {
                debug!("server closed socket");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "socket read failed");
                shared.emit(Event::ConnectionError {
                    message: e.to_string(),
                });
                break;
            }
        }
    }

    *shared.sink.lock().await = None;
    if *shared.state.read().await != ConnectionState::Idle {
        shared.signal_reconnect();
    }
}

/// Periodically verifies the socket is up; a dead socket goes through
/// the same reconnect path as an error or close event.
async fn spawn_health_probe(shared: &Arc<Shared>) {
    let handle = {
        let shared = shared.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(shared.config.connection.health_check_interval());
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let socket_up = shared.sink.lock().await.is_some();
                if !socket_up && *shared.state.read().await != ConnectionState::Idle {
                    debug!("health probe found socket down");
                    shared.signal_reconnect();
                }
            }
        })
    };
    store_task(&shared.health_task, handle).await;
}

/// Proactively recycles the connection shortly before token expiry.
/// Optional: the socket usually outlives the token, and the
/// reconnect-on-close path covers the eventual drop either way.
async fn spawn_expiry_timer(shared: &Arc<Shared>, expires_at: DateTime<Utc>) {
    let handle = {
        let shared = shared.clone();
        tokio::spawn(async move {
            let margin = chrono::Duration::from_std(shared.config.connection.refresh_margin())
                .unwrap_or_else(|_| chrono::Duration::zero());
            let wait = (expires_at - margin - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            info!("access token nearing expiry, recycling connection");
            shared.teardown_socket().await;
            shared.signal_reconnect();
        })
    };
    store_task(&shared.expiry_task, handle).await;
}

/// All reconnect triggers (read-loop exit, health probe, expiry timer)
/// converge here; the atomic guard keeps at most one attempt in
/// flight.
async fn schedule_reconnect(shared: &Arc<Shared>) {
    if !shared.config.connection.auto_reconnect {
        shared.set_state(ConnectionState::Idle).await;
        return;
    }

    // Exhaustion and disconnect() both land in Idle; stray signals
    // arriving afterwards (e.g. from the health probe) must not
    // restart the policy or re-report the failure.
    if *shared.state.read().await == ConnectionState::Idle {
        return;
    }

    if shared
        .reconnect_in_flight
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        debug!("reconnect already pending");
        return;
    }

    let handle = {
        let shared = shared.clone();
        tokio::spawn(async move {
            let base = shared.config.connection.reconnect_base();
            let max = shared.config.connection.reconnect_max();

            loop {
                let attempt = shared.attempts.load(Ordering::Relaxed);
                if attempt >= shared.config.connection.max_reconnect_attempts {
                    warn!(attempt, "reconnect attempts exhausted");
                    shared.emit(Event::ConnectionError {
                        message: "reconnect attempts exhausted".to_string(),
                    });
                    shared.set_state(ConnectionState::Idle).await;
                    break;
                }

                let delay = backoff_delay(base, max, attempt);
                shared.set_state(ConnectionState::Reconnecting { attempt }).await;
                debug!(attempt, ?delay, "waiting before reconnect");
                tokio::time::sleep(delay).await;

                match establish(&shared).await {
                    // establish() reset the attempt counter
                    Ok(()) => break,
                    Err(e) => {
                        warn!(error = %e, "reconnect attempt failed");
                        shared.attempts.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            shared.reconnect_in_flight.store(false, Ordering::Release);
        })
    };
    store_task(&shared.reconnect_task, handle).await;
}
