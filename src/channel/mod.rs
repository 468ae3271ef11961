// Event channel management
// Owns the single persistent channel: connect/disconnect lifecycle, automatic
// reconnection with backoff, acknowledgements, and fan-out of inbound events
// to the callback registry shared by every feature module.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub mod events;
pub mod memory;
pub mod registry;
pub mod transport;
pub mod websocket;

pub use registry::{EventRegistry, SubscriptionId};
pub use transport::{Credential, Frame, Transport, TransportLink};

use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries exhausted or credential rejected; stays here until `connect` is called again.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed opens before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            max_attempts: 6,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let spread = delay.as_millis() as u64 / 5;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// The narrow sending side of the channel that feature modules depend on.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError>;

    /// Send and wait for the server's single acknowledgement.
    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, ChannelError>;
}

#[derive(Default)]
struct Session {
    // Bumped by connect and disconnect; a supervisor only touches the
    // session while its own generation is current.
    generation: u64,
    outbound: Option<mpsc::Sender<Frame>>,
    pending_acks: HashMap<u64, oneshot::Sender<Value>>,
    next_ack_id: u64,
    user_id: Option<String>,
    supervisor: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    registry: EventRegistry,
    policy: ReconnectPolicy,
    ack_timeout: Duration,
    session: Arc<Mutex<Session>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, policy: ReconnectPolicy, ack_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            registry: EventRegistry::new(),
            policy,
            ack_timeout,
            session: Arc::new(Mutex::new(Session::default())),
            state_tx: Arc::new(state_tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The user the channel was last connected for.
    pub fn user_id(&self) -> Option<String> {
        self.lock().user_id.clone()
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn register_callback<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.registry.register(event, handler)
    }

    pub fn unregister_callback(&self, event: &str, id: SubscriptionId) -> bool {
        self.registry.unregister(event, id)
    }

    /// Start the channel for `credential`. Does nothing while already connecting or connected.
    ///
    /// Returns immediately; use [`wait_connected`](Self::wait_connected) or
    /// [`watch_state`](Self::watch_state) to follow progress.
    pub fn connect(&self, credential: Credential) {
        let mut session = self.lock();
        let state = self.state();
        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            debug!("connect() ignored, channel already {:?}", state);
            return;
        }

        session.generation += 1;
        session.user_id = Some(credential.user_id.clone());
        self.state_tx.send_replace(ConnectionState::Connecting);

        let generation = session.generation;
        let manager = self.clone();
        session.supervisor = Some(tokio::spawn(async move {
            manager.supervise(credential, generation).await;
        }));
    }

    /// Tear the channel down. Registered callbacks stay registered and
    /// receive events again after the next `connect`.
    pub fn disconnect(&self) {
        let mut session = self.lock();
        session.generation += 1;
        if let Some(supervisor) = session.supervisor.take() {
            supervisor.abort();
        }
        session.outbound = None;
        let dropped = session.pending_acks.len();
        // Dropping the senders fails every waiter with `Closed`.
        session.pending_acks.clear();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Channel disconnected ({} pending acknowledgements dropped)", dropped);
    }

    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.wait_for(ConnectionState::Connected, timeout).await
    }

    pub async fn wait_for(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut state_rx = self.state_tx.subscribe();
        let reached = async {
            loop {
                if *state_rx.borrow_and_update() == target {
                    return true;
                }
                if state_rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, reached).await.unwrap_or(false)
    }

    /// Run `update` only if `generation` is still the live one.
    fn with_current<F>(&self, generation: u64, update: F) -> bool
    where
        F: FnOnce(&mut Session, &watch::Sender<ConnectionState>),
    {
        let mut session = self.lock();
        if session.generation != generation {
            return false;
        }
        update(&mut session, &self.state_tx);
        true
    }

    async fn supervise(self, credential: Credential, generation: u64) {
        let mut failures: u32 = 0;
        loop {
            let still_current = self.with_current(generation, |_, state| {
                state.send_replace(ConnectionState::Connecting);
            });
            if !still_current {
                return;
            }

            match self.transport.open(&credential).await {
                Ok(link) => {
                    failures = 0;
                    let installed = self.with_current(generation, |session, state| {
                        session.outbound = Some(link.outbound);
                        state.send_replace(ConnectionState::Connected);
                    });
                    if !installed {
                        return;
                    }
                    info!("Channel connected for user {}", credential.user_id);

                    self.pump(link.inbound).await;

                    let still_current = self.with_current(generation, |session, state| {
                        session.outbound = None;
                        session.pending_acks.clear();
                        state.send_replace(ConnectionState::Disconnected);
                    });
                    if !still_current {
                        return;
                    }
                    warn!("Channel connection lost, reconnecting");
                    tokio::time::sleep(self.policy.jittered(1)).await;
                }
                Err(ChannelError::Unauthorized) => {
                    error!("Channel rejected the credential for {}; not retrying", credential.user_id);
                    self.give_up(generation);
                    return;
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Channel connect attempt {}/{} failed: {}",
                        failures, self.policy.max_attempts, e
                    );
                    if failures >= self.policy.max_attempts {
                        error!("All channel connection attempts failed");
                        self.give_up(generation);
                        return;
                    }
                    self.with_current(generation, |_, state| {
                        state.send_replace(ConnectionState::Disconnected);
                    });
                    let backoff = self.policy.jittered(failures);
                    info!("Retrying channel connection in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn give_up(&self, generation: u64) {
        self.with_current(generation, |session, state| {
            session.outbound = None;
            session.pending_acks.clear();
            // Dropping our own handle only detaches the task.
            session.supervisor = None;
            state.send_replace(ConnectionState::Failed);
        });
    }

    // Inbound frames are handled strictly one at a time, in transport order.
    async fn pump(&self, mut inbound: mpsc::Receiver<Frame>) {
        while let Some(frame) = inbound.recv().await {
            match frame {
                Frame::Event { event, payload, .. } => {
                    let delivered = self.registry.dispatch(&event, &payload);
                    debug!("Event '{}' delivered to {} handler(s)", event, delivered);
                }
                Frame::Ack { ack_id, payload } => {
                    let waiter = self.lock().pending_acks.remove(&ack_id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(payload);
                        }
                        None => debug!("Acknowledgement {} arrived with nobody waiting", ack_id),
                    }
                }
            }
        }
    }

    fn send_frame(outbound: &mpsc::Sender<Frame>, frame: Frame) -> Result<(), ChannelError> {
        outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ChannelError::Unreachable("outbound buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ChannelError::NotConnected,
        })
    }

    pub fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        let outbound = self.lock().outbound.clone().ok_or(ChannelError::NotConnected)?;
        Self::send_frame(&outbound, Frame::event(event, payload))
    }

    pub async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, ChannelError> {
        let (ack_id, ack_rx) = {
            let mut session = self.lock();
            let outbound = session.outbound.clone().ok_or(ChannelError::NotConnected)?;
            session.next_ack_id += 1;
            let ack_id = session.next_ack_id;
            let frame = Frame::Event {
                event: event.to_string(),
                payload,
                ack_id: Some(ack_id),
            };
            Self::send_frame(&outbound, frame)?;
            let (ack_tx, ack_rx) = oneshot::channel();
            session.pending_acks.insert(ack_id, ack_tx);
            (ack_id, ack_rx)
        };

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.lock().pending_acks.remove(&ack_id);
                warn!("No acknowledgement for '{}' within {:?}", event, self.ack_timeout);
                Err(ChannelError::AckTimeout)
            }
        }
    }
}

#[async_trait]
impl EventSink for ConnectionManager {
    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        ConnectionManager::emit(self, event, payload)
    }

    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, ChannelError> {
        ConnectionManager::emit_with_ack(self, event, payload).await
    }
}
