//! # Mesh
//!
//! Public entry point. A [`Mesh`] is a cheap-to-clone handle to one
//! [`MeshActor`] task that owns every component of the node:
//!
//! ```text
//!  Mesh (handle) ──Command──► MeshActor
//!                              ├── ConnectionManager ── ChannelProvider
//!                              ├── PeerDiscovery
//!                              ├── EvictionManager
//!                              ├── MeshOptimizer
//!                              ├── GossipManager
//!                              ├── WebDht (optional)
//!                              └── Schedule (periodic tasks)
//! ```
//!
//! Inbound signaling envelopes and channel events enter through the same
//! command queue as API calls, so all state is mutated by one task, one
//! command at a time. After every command and timer tick the actor drains the
//! links that left the table and reacts: events, DHT cleanup, and a redial when
//! the node ends up isolated.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::connection::ConnectionManager;
use crate::dht::{DhtConfig, DhtOutput, DhtStats, GetOptions, PutOptions, UpdateOptions, WebDht};
use crate::discovery::{DiscoveredPeerInfo, PeerDiscovery};
use crate::error::MeshError;
use crate::eviction::{EvictionManager, REASON_CLOSER_PEER};
use crate::gossip::{CHAT_LABEL, Dispatch, GossipConfig, GossipManager, ReceivedMessage};
use crate::identity::PeerId;
use crate::link::LinkInfo;
use crate::maintenance::{MaintenanceConfig, Schedule, Task};
use crate::messages::{LinkFrame, MessageId, Signal, SignalingEnvelope, decode_frame, encode_frame};
use crate::optimizer::MeshOptimizer;
use crate::protocols::{ChannelEvent, ChannelProvider, SignalingTransport};
use crate::storage::{SettingsStore, load_or_generate_peer_id, load_settings, save_settings};

const COMMAND_CHANNEL_SIZE: usize = 1000;
const EVENT_CHANNEL_SIZE: usize = 1000;

pub const REASON_MESH_DISCONNECTED: &str = "mesh disconnected";
pub const REASON_PEER_LEFT: &str = "peer left network";
pub const REASON_REJECTED: &str = "connection rejected";

type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

// ============================================================================
// Events
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub level: StatusLevel,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeshEvent {
    Status(StatusEvent),
    PeerDiscovered { peer_id: PeerId },
    PeerConnected { peer_id: PeerId, initiator: bool },
    PeerDisconnected { peer_id: PeerId, reason: String },
    MessageReceived(ReceivedMessage),
    DhtValueChanged {
        key: String,
        value: Vec<u8>,
        version: u64,
        issuer: PeerId,
    },
}

/// Snapshot returned by [`Mesh::status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshStatus {
    pub peer_id: PeerId,
    pub connected: bool,
    pub connected_count: usize,
    /// Every link in the table, negotiating ones included.
    pub total_peer_count: usize,
    pub min_peers: usize,
    pub max_peers: usize,
    pub discovered_count: usize,
    pub auto_discovery: bool,
    pub eviction_strategy: bool,
    pub xor_routing: bool,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

type DhtGetReply = oneshot::Sender<Result<oneshot::Receiver<Option<Vec<u8>>>, MeshError>>;
type DhtWriteReply = oneshot::Sender<Result<oneshot::Receiver<bool>, MeshError>>;

enum Setting {
    MaxPeers(usize),
    MinPeers(usize),
    EvictionStrategy(bool),
    XorRouting(bool),
    AutoDiscovery(bool),
}

enum Command {
    Connect(oneshot::Sender<()>),
    Disconnect(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
    ConnectToPeer(PeerId, oneshot::Sender<Result<(), MeshError>>),
    ForceConnectToAll(oneshot::Sender<usize>),
    CleanupStalePeers(oneshot::Sender<usize>),
    SendMessage(Vec<u8>, oneshot::Sender<Result<MessageId, MeshError>>),
    SendDirectMessage(PeerId, Vec<u8>, oneshot::Sender<Result<Option<MessageId>, MeshError>>),
    DhtPut {
        key: String,
        value: Vec<u8>,
        options: PutOptions,
        reply: DhtWriteReply,
    },
    DhtGet {
        key: String,
        options: GetOptions,
        reply: DhtGetReply,
    },
    DhtUpdate {
        key: String,
        value: Vec<u8>,
        options: UpdateOptions,
        reply: DhtWriteReply,
    },
    DhtUnsubscribe(String, oneshot::Sender<Result<(), MeshError>>),
    Configure(Setting, oneshot::Sender<usize>),
    Status(oneshot::Sender<MeshStatus>),
    DiscoveredPeers(oneshot::Sender<Vec<DiscoveredPeerInfo>>),
    DhtStats(oneshot::Sender<DhtStats>),
    Peers(oneshot::Sender<Vec<LinkInfo>>),
    Signaling(SignalingEnvelope),
    Channel(ChannelEvent),
}

// ============================================================================
// Builder
// ============================================================================

pub struct MeshBuilder {
    peer_id: Option<String>,
    config: MeshConfig,
    gossip: GossipConfig,
    dht: DhtConfig,
    maintenance: MaintenanceConfig,
    enable_dht: bool,
    signaling: Option<Arc<dyn SignalingTransport>>,
    channels: Option<Arc<dyn ChannelProvider>>,
    settings: Option<Arc<dyn SettingsStore>>,
}

impl Default for MeshBuilder {
    fn default() -> Self {
        Self {
            peer_id: None,
            config: MeshConfig::default(),
            gossip: GossipConfig::default(),
            dht: DhtConfig::default(),
            maintenance: MaintenanceConfig::default(),
            enable_dht: true,
            signaling: None,
            channels: None,
            settings: None,
        }
    }
}

impl MeshBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this id. An invalid one is replaced by a generated id.
    pub fn peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    pub fn gossip_config(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    pub fn dht_config(mut self, dht: DhtConfig) -> Self {
        self.dht = dht;
        self
    }

    pub fn maintenance_config(mut self, maintenance: MaintenanceConfig) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub fn enable_dht(mut self, enabled: bool) -> Self {
        self.enable_dht = enabled;
        self
    }

    pub fn signaling(mut self, signaling: Arc<dyn SignalingTransport>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    pub fn channels(mut self, channels: Arc<dyn ChannelProvider>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Persist the peer id and settings here. Saved settings take precedence
    /// over [`MeshBuilder::config`].
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(store);
        self
    }

    /// Spawn the actor. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Mesh> {
        let signaling = self.signaling.ok_or(MeshError::MissingCapability("signaling transport"))?;
        let channels = self.channels.ok_or(MeshError::MissingCapability("channel provider"))?;

        let store = self.settings.as_deref();
        let local = load_or_generate_peer_id(store, self.peer_id.as_deref());
        let config = store
            .and_then(load_settings)
            .unwrap_or(self.config)
            .normalized();

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let actor = MeshActor {
            local,
            running: false,
            connections: ConnectionManager::new(
                local,
                channels,
                self.maintenance.attempt_timeout,
                self.maintenance.stale_link_timeout,
            ),
            discovery: PeerDiscovery::new(local),
            eviction: EvictionManager::new(local),
            optimizer: MeshOptimizer::new(),
            gossip: GossipManager::new(local, self.gossip),
            dht: self.enable_dht.then(|| WebDht::new(local, self.dht)),
            schedule: Schedule::new(self.maintenance),
            config,
            signaling,
            settings: self.settings,
            events: event_tx,
            ping_nonce: 0,
        };
        info!(peer_id = %local, dht = actor.dht.is_some(), "mesh node created");
        tokio::spawn(actor.run(cmd_rx));

        Ok(Mesh {
            peer_id: local,
            cmd_tx,
            events: Arc::new(Mutex::new(Some(event_rx))),
        })
    }
}

// ============================================================================
// Mesh Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Mesh {
    peer_id: PeerId,
    cmd_tx: mpsc::Sender<Command>,
    events: Arc<TakeOnce<MeshEvent>>,
}

impl Mesh {
    pub fn builder() -> MeshBuilder {
        MeshBuilder::new()
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| MeshError::ActorClosed)?;
        Ok(rx.await.map_err(|_| MeshError::ActorClosed)?)
    }

    /// The event stream. Can be taken once.
    pub async fn events(&self) -> Result<mpsc::Receiver<MeshEvent>> {
        let mut guard = self.events.lock().await;
        guard.take().context("event receiver already taken")
    }

    /// Join the mesh: announce ourselves and start periodic maintenance.
    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await
    }

    /// Leave the mesh: say goodbye and close every link. The node can reconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Disconnect and stop the actor. Later calls fail with `ActorClosed`.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    pub async fn connect_to_peer(&self, peer_id: &str) -> Result<()> {
        let peer = PeerId::from_hex(peer_id)?;
        Ok(self.request(|tx| Command::ConnectToPeer(peer, tx)).await??)
    }

    /// Dial every discovered peer without a link, up to capacity. Returns the
    /// number of dials started.
    pub async fn force_connect_to_all(&self) -> Result<usize> {
        self.request(Command::ForceConnectToAll).await
    }

    pub async fn cleanup_stale_peers(&self) -> Result<usize> {
        self.request(Command::CleanupStalePeers).await
    }

    /// Broadcast `content` to the whole mesh.
    pub async fn send_message(&self, content: impl Into<Vec<u8>>) -> Result<MessageId> {
        let content = content.into();
        Ok(self.request(|tx| Command::SendMessage(content, tx)).await??)
    }

    /// Route `content` to one peer. `None` when there is no link to route over.
    pub async fn send_direct_message(
        &self,
        target: &str,
        content: impl Into<Vec<u8>>,
    ) -> Result<Option<MessageId>> {
        let target = PeerId::from_hex(target)?;
        let content = content.into();
        Ok(self
            .request(|tx| Command::SendDirectMessage(target, content, tx))
            .await??)
    }

    /// Store `value` under the next version of `key`. Resolves once the
    /// current version has been read from the replicas and the write placed.
    pub async fn dht_put(&self, key: &str, value: impl Into<Vec<u8>>, options: PutOptions) -> Result<bool> {
        let key = key.to_string();
        let value = value.into();
        let pending = self
            .request(|reply| Command::DhtPut {
                key,
                value,
                options,
                reply,
            })
            .await??;
        Ok(pending.await.unwrap_or(false))
    }

    pub async fn dht_get(&self, key: &str, options: GetOptions) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        let pending = self
            .request(|reply| Command::DhtGet { key, options, reply })
            .await??;
        Ok(pending.await.unwrap_or(None))
    }

    /// Subscribe to `key` and return its current value.
    pub async fn dht_subscribe(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.dht_get(key, GetOptions { subscribe: true }).await
    }

    pub async fn dht_unsubscribe(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        Ok(self.request(|tx| Command::DhtUnsubscribe(key, tx)).await??)
    }

    /// Write a new version of `key`. Returns `false` when an explicit version
    /// does not exceed the current one.
    pub async fn dht_update(&self, key: &str, value: impl Into<Vec<u8>>, options: UpdateOptions) -> Result<bool> {
        let key = key.to_string();
        let value = value.into();
        let pending = self
            .request(|reply| Command::DhtUpdate {
                key,
                value,
                options,
                reply,
            })
            .await??;
        Ok(pending.await.unwrap_or(false))
    }

    /// Returns the applied value after clamping to `1..=50`.
    pub async fn set_max_peers(&self, max_peers: usize) -> Result<usize> {
        self.request(|tx| Command::Configure(Setting::MaxPeers(max_peers), tx)).await
    }

    /// Returns the applied value after clamping to `0..=49`.
    pub async fn set_min_peers(&self, min_peers: usize) -> Result<usize> {
        self.request(|tx| Command::Configure(Setting::MinPeers(min_peers), tx)).await
    }

    pub async fn set_eviction_strategy(&self, enabled: bool) -> Result<()> {
        self.request(|tx| Command::Configure(Setting::EvictionStrategy(enabled), tx)).await?;
        Ok(())
    }

    pub async fn set_xor_routing(&self, enabled: bool) -> Result<()> {
        self.request(|tx| Command::Configure(Setting::XorRouting(enabled), tx)).await?;
        Ok(())
    }

    pub async fn set_auto_discovery(&self, enabled: bool) -> Result<()> {
        self.request(|tx| Command::Configure(Setting::AutoDiscovery(enabled), tx)).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<MeshStatus> {
        self.request(Command::Status).await
    }

    pub async fn discovered_peers(&self) -> Result<Vec<DiscoveredPeerInfo>> {
        self.request(Command::DiscoveredPeers).await
    }

    pub async fn dht_stats(&self) -> Result<DhtStats> {
        self.request(Command::DhtStats).await
    }

    /// Every link in the table with its state.
    pub async fn peers(&self) -> Result<Vec<LinkInfo>> {
        self.request(Command::Peers).await
    }

    /// Feed an envelope received from the signaling relay.
    pub async fn handle_signaling(&self, envelope: SignalingEnvelope) -> Result<()> {
        self.cmd_tx
            .send(Command::Signaling(envelope))
            .await
            .map_err(|_| MeshError::ActorClosed)?;
        Ok(())
    }

    /// Feed an outcome reported by the channel provider.
    pub async fn handle_channel_event(&self, event: ChannelEvent) -> Result<()> {
        self.cmd_tx
            .send(Command::Channel(event))
            .await
            .map_err(|_| MeshError::ActorClosed)?;
        Ok(())
    }
}

// ============================================================================
// Mesh Actor
// ============================================================================

pub(crate) struct MeshActor {
    pub(crate) local: PeerId,
    pub(crate) running: bool,
    pub(crate) config: MeshConfig,
    pub(crate) connections: ConnectionManager,
    pub(crate) discovery: PeerDiscovery,
    pub(crate) eviction: EvictionManager,
    pub(crate) optimizer: MeshOptimizer,
    pub(crate) gossip: GossipManager,
    pub(crate) dht: Option<WebDht>,
    pub(crate) schedule: Schedule,
    signaling: Arc<dyn SignalingTransport>,
    settings: Option<Arc<dyn SettingsStore>>,
    events: mpsc::Sender<MeshEvent>,
    ping_nonce: u64,
}

impl MeshActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut tick = tokio::time::interval(self.schedule.config().tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await.is_break() {
                                break;
                            }
                        }
                        None => {
                            debug!("mesh handle dropped, actor quitting");
                            self.leave().await;
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    self.on_tick(Instant::now()).await;
                }
            }
            self.process_departures().await;
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Connect(reply) => {
                self.join().await;
                let _ = reply.send(());
            }
            Command::Disconnect(reply) => {
                self.leave().await;
                let _ = reply.send(());
            }
            Command::Shutdown(reply) => {
                self.leave().await;
                self.process_departures().await;
                debug!(peer_id = %self.local.short(), "mesh actor quitting");
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
            Command::ConnectToPeer(peer, reply) => {
                let _ = reply.send(self.connect_to_peer(peer).await);
            }
            Command::ForceConnectToAll(reply) => {
                let _ = reply.send(self.force_connect_to_all().await);
            }
            Command::CleanupStalePeers(reply) => {
                let removed = self.connections.cleanup_stale_peers(Instant::now()).await;
                if !removed.is_empty() {
                    self.status(StatusLevel::Info, format!("cleaned up {} stale peer(s)", removed.len()));
                }
                let _ = reply.send(removed.len());
            }
            Command::SendMessage(content, reply) => {
                let _ = reply.send(self.send_message(content).await);
            }
            Command::SendDirectMessage(target, content, reply) => {
                let _ = reply.send(self.send_direct_message(target, content).await);
            }
            Command::DhtPut {
                key,
                value,
                options,
                reply,
            } => {
                let _ = reply.send(self.dht_put(&key, value, options).await);
            }
            Command::DhtGet { key, options, reply } => {
                let _ = reply.send(self.dht_get(&key, options).await);
            }
            Command::DhtUpdate {
                key,
                value,
                options,
                reply,
            } => {
                let _ = reply.send(self.dht_update(&key, value, options).await);
            }
            Command::DhtUnsubscribe(key, reply) => {
                let _ = reply.send(self.dht_unsubscribe(&key).await);
            }
            Command::Configure(setting, reply) => {
                let _ = reply.send(self.configure(setting).await);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::DiscoveredPeers(reply) => {
                let _ = reply.send(self.discovery.infos(&self.connections, Instant::now()));
            }
            Command::DhtStats(reply) => {
                let stats = self.dht.as_ref().map(WebDht::stats).unwrap_or_default();
                let _ = reply.send(stats);
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.connections.link_infos(Instant::now()));
            }
            Command::Signaling(envelope) => self.on_signaling(envelope).await,
            Command::Channel(event) => self.on_channel_event(event).await,
        }
        ControlFlow::Continue(())
    }

    // ========================================================================
    // Outbound helpers
    // ========================================================================

    pub(crate) fn emit(&self, event: MeshEvent) {
        if let Err(e) = self.events.try_send(event) {
            trace!(error = %e, "dropping mesh event");
        }
    }

    pub(crate) fn status(&self, level: StatusLevel, message: impl Into<String>) {
        self.emit(MeshEvent::Status(StatusEvent {
            level,
            message: message.into(),
        }));
    }

    pub(crate) async fn send_signal(&self, target: Option<PeerId>, signal: Signal) {
        let kind = signal.type_name();
        let envelope = SignalingEnvelope::new(self.local, target, &signal);
        if let Err(e) = self.signaling.send(envelope).await {
            warn!(kind, target = ?target.map(|t| t.short()), error = %e, "failed to send signaling message");
        }
    }

    async fn send_frame(&mut self, peer: PeerId, frame: &LinkFrame) {
        let bytes = match encode_frame(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %peer.short(), error = %e, "failed to encode link frame");
                return;
            }
        };
        if let Err(e) = self.connections.send_frame(&peer, bytes).await {
            match e {
                MeshError::Transport { .. } => {
                    self.connections.fail(peer, &e.to_string()).await;
                }
                _ => trace!(peer = %peer.short(), error = %e, "link frame not sent"),
            }
        }
    }

    async fn dispatch(&mut self, dispatch: Dispatch) {
        let frame = LinkFrame::Gossip(dispatch.message);
        for target in dispatch.targets {
            self.send_frame(target, &frame).await;
        }
    }

    async fn apply_dht_output(&mut self, out: DhtOutput) {
        for (peer, frame) in out.frames {
            self.send_frame(peer, &LinkFrame::Dht(frame)).await;
        }
        for change in out.changes {
            self.emit(MeshEvent::DhtValueChanged {
                key: change.key,
                value: change.value,
                version: change.version,
                issuer: change.issuer,
            });
        }
    }

    /// Start an outbound link and signal the offer.
    pub(crate) async fn dial(&mut self, peer: PeerId) -> Result<(), MeshError> {
        let offer = self.connections.dial(peer, &self.config, Instant::now()).await?;
        self.send_signal(Some(peer), Signal::Offer(offer)).await;
        Ok(())
    }

    async fn dial_all(&mut self, targets: Vec<PeerId>) -> usize {
        let mut started = 0;
        for peer in targets {
            match self.dial(peer).await {
                Ok(()) => started += 1,
                Err(e) => debug!(peer = %peer.short(), error = %e, "dial skipped"),
            }
        }
        started
    }

    fn persist_settings(&self) {
        if let Some(store) = &self.settings
            && let Err(e) = save_settings(store.as_ref(), &self.config)
        {
            warn!(error = %e, "failed to persist mesh settings");
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn join(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.schedule.start(Instant::now());
        self.send_signal(None, Signal::Announce).await;
        info!(peer_id = %self.local.short(), "joined mesh");
        self.status(StatusLevel::Info, "connected");
    }

    async fn leave(&mut self) {
        if self.running {
            self.send_signal(None, Signal::Goodbye).await;
        }
        self.running = false;
        self.schedule.stop();
        let closed = self.connections.disconnect_all(REASON_MESH_DISCONNECTED).await;
        self.discovery.clear();
        self.gossip.clear();
        if let Some(dht) = self.dht.as_mut() {
            dht.reset_remote_state();
        }
        info!(peer_id = %self.local.short(), closed, "left mesh");
        self.status(StatusLevel::Info, "disconnected");
    }

    async fn connect_to_peer(&mut self, peer: PeerId) -> Result<(), MeshError> {
        if peer == self.local {
            return Err(MeshError::SelfConnection);
        }
        if !self.running {
            return Err(MeshError::NotConnected);
        }
        if self.discovery.add_discovered_peer(peer, Instant::now()) {
            self.emit(MeshEvent::PeerDiscovered { peer_id: peer });
        }
        self.dial(peer).await
    }

    async fn force_connect_to_all(&mut self) -> usize {
        if !self.running {
            return 0;
        }
        let candidates = self.discovery.dial_candidates(&self.connections, &self.config);
        let targets = self
            .optimizer
            .force_connect_to_all(&candidates, &self.connections, &self.config);
        let started = self.dial_all(targets).await;
        info!(started, "forced connection to discovered peers");
        started
    }

    pub(crate) async fn run_optimize(&mut self) {
        if !self.running || !self.optimizer.needs_peers(&self.connections, &self.config) {
            return;
        }
        let candidates = self.discovery.dial_candidates(&self.connections, &self.config);
        let targets = self
            .optimizer
            .optimize_connections(&candidates, &self.connections, &self.config);
        self.dial_all(targets).await;
    }

    /// React to lost links. Isolated nodes redial at once, nodes below
    /// `min_peers` schedule an optimisation pass.
    pub(crate) async fn react_to_loss(&mut self, lost: &[PeerId]) {
        if !self.running {
            return;
        }
        let now = Instant::now();
        if self.connections.connected_count() == 0 {
            if !self.redial_isolated(lost).await {
                self.schedule.defer_optimize(now);
            }
        } else if self.connections.connected_count() < self.config.min_peers {
            self.schedule.defer_optimize(now);
        }
    }

    /// Dial the closest available peer outside `exclude` while nothing is
    /// connected. Returns whether a dial started.
    pub(crate) async fn redial_isolated(&mut self, exclude: &[PeerId]) -> bool {
        let candidates = self.discovery.dial_candidates(&self.connections, &self.config);
        let Some(peer) = self
            .optimizer
            .isolation_target(&candidates, exclude, &self.connections, &self.config)
        else {
            return false;
        };
        match self.dial(peer).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "isolation redial failed");
                false
            }
        }
    }

    /// Emit events and clean dependent state for every link that left.
    pub(crate) async fn process_departures(&mut self) {
        loop {
            let departures = self.connections.drain_departures();
            if departures.is_empty() {
                return;
            }
            let now = Instant::now();
            let mut lost = Vec::with_capacity(departures.len());
            for departure in departures {
                let peer = departure.peer_id;
                if let Some(dht) = self.dht.as_mut() {
                    let connected = self.connections.connected_peers();
                    let out = dht.forget_peer(&peer, &connected, now);
                    self.apply_dht_output(out).await;
                }
                if departure.was_connected {
                    info!(peer = %peer.short(), reason = %departure.reason, "peer disconnected");
                    self.emit(MeshEvent::PeerDisconnected {
                        peer_id: peer,
                        reason: departure.reason,
                    });
                } else {
                    debug!(peer = %peer.short(), state = %departure.state, reason = %departure.reason, "dropped pending link");
                }
                lost.push(peer);
            }
            self.react_to_loss(&lost).await;
        }
    }

    // ========================================================================
    // Messaging and DHT
    // ========================================================================

    async fn send_message(&mut self, content: Vec<u8>) -> Result<MessageId, MeshError> {
        let connected = self.connections.connected_peers();
        let dispatch = self.gossip.broadcast(content, CHAT_LABEL, &connected, Instant::now())?;
        let id = dispatch.message.id;
        debug!(msg_id = %id, peers = dispatch.targets.len(), "broadcasting message");
        self.dispatch(dispatch).await;
        Ok(id)
    }

    async fn send_direct_message(&mut self, target: PeerId, content: Vec<u8>) -> Result<Option<MessageId>, MeshError> {
        if target == self.local {
            return Err(MeshError::SelfConnection);
        }
        let connected = self.connections.connected_peers();
        let Some(dispatch) = self
            .gossip
            .send_direct(target, content, CHAT_LABEL, &connected, Instant::now())?
        else {
            debug!(target = %target.short(), "no route for direct message");
            return Ok(None);
        };
        let id = dispatch.message.id;
        self.dispatch(dispatch).await;
        Ok(Some(id))
    }

    async fn dht_put(
        &mut self,
        key: &str,
        value: Vec<u8>,
        options: PutOptions,
    ) -> Result<oneshot::Receiver<bool>, MeshError> {
        let connected = self.connections.connected_peers();
        let dht = self.dht.as_mut().ok_or(MeshError::DhtDisabled)?;
        let (tx, rx) = oneshot::channel();
        let out = dht.put(key, value, options, &connected, Instant::now(), tx)?;
        self.apply_dht_output(out).await;
        Ok(rx)
    }

    async fn dht_get(
        &mut self,
        key: &str,
        options: GetOptions,
    ) -> Result<oneshot::Receiver<Option<Vec<u8>>>, MeshError> {
        let connected = self.connections.connected_peers();
        let dht = self.dht.as_mut().ok_or(MeshError::DhtDisabled)?;
        let (tx, rx) = oneshot::channel();
        let out = dht.get(key, options, &connected, Instant::now(), tx);
        self.apply_dht_output(out).await;
        Ok(rx)
    }

    async fn dht_update(
        &mut self,
        key: &str,
        value: Vec<u8>,
        options: UpdateOptions,
    ) -> Result<oneshot::Receiver<bool>, MeshError> {
        let connected = self.connections.connected_peers();
        let dht = self.dht.as_mut().ok_or(MeshError::DhtDisabled)?;
        let (tx, rx) = oneshot::channel();
        let out = dht.update(key, value, options, &connected, Instant::now(), tx)?;
        self.apply_dht_output(out).await;
        Ok(rx)
    }

    async fn dht_unsubscribe(&mut self, key: &str) -> Result<(), MeshError> {
        let connected = self.connections.connected_peers();
        let dht = self.dht.as_mut().ok_or(MeshError::DhtDisabled)?;
        let out = dht.unsubscribe(key, &connected);
        self.apply_dht_output(out).await;
        Ok(())
    }

    // ========================================================================
    // Settings and queries
    // ========================================================================

    async fn configure(&mut self, setting: Setting) -> usize {
        let applied = match setting {
            Setting::MaxPeers(max_peers) => {
                let applied = self.config.set_max_peers(max_peers);
                if self.connections.connected_count() > applied {
                    self.eviction
                        .disconnect_excess_peers(&mut self.connections, &self.config)
                        .await;
                }
                applied
            }
            Setting::MinPeers(min_peers) => {
                let applied = self.config.set_min_peers(min_peers);
                self.run_optimize().await;
                applied
            }
            Setting::EvictionStrategy(enabled) => {
                self.config.eviction_strategy = enabled;
                self.status(StatusLevel::Info, format!("setting eviction_strategy={enabled}"));
                usize::from(enabled)
            }
            Setting::XorRouting(enabled) => {
                self.config.xor_routing = enabled;
                self.status(StatusLevel::Info, format!("setting xor_routing={enabled}"));
                if !enabled && self.config.eviction_strategy {
                    self.status(
                        StatusLevel::Warning,
                        "XOR routing disabled, eviction strategy effectiveness reduced",
                    );
                }
                usize::from(enabled)
            }
            Setting::AutoDiscovery(enabled) => {
                self.config.auto_discovery = enabled;
                self.status(StatusLevel::Info, format!("setting auto_discovery={enabled}"));
                usize::from(enabled)
            }
        };
        self.persist_settings();
        applied
    }

    fn snapshot(&self) -> MeshStatus {
        MeshStatus {
            peer_id: self.local,
            connected: self.running,
            connected_count: self.connections.connected_count(),
            total_peer_count: self.connections.link_count(),
            min_peers: self.config.min_peers,
            max_peers: self.config.max_peers,
            discovered_count: self.discovery.len(),
            auto_discovery: self.config.auto_discovery,
            eviction_strategy: self.config.eviction_strategy,
            xor_routing: self.config.xor_routing,
        }
    }

    // ========================================================================
    // Channel events
    // ========================================================================

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        let now = Instant::now();
        match event {
            ChannelEvent::Connected(peer) => match self.connections.on_channel_connected(peer, now) {
                Ok(initiator) => {
                    info!(peer = %peer.short(), initiator, "peer connected");
                    if self.discovery.add_discovered_peer(peer, now) {
                        self.emit(MeshEvent::PeerDiscovered { peer_id: peer });
                    }
                    self.emit(MeshEvent::PeerConnected {
                        peer_id: peer,
                        initiator,
                    });
                    // simultaneous inbound and outbound admissions can overshoot
                    self.eviction
                        .disconnect_excess_peers(&mut self.connections, &self.config)
                        .await;
                }
                Err(e) => {
                    debug!(peer = %peer.short(), error = %e, "channel opened without a negotiating link");
                    self.connections.close_orphan_channel(peer).await;
                }
            },
            ChannelEvent::Failed { peer, reason } => {
                if self.connections.fail(peer, &reason).await {
                    self.status(StatusLevel::Error, format!("connection to {} failed: {reason}", peer.short()));
                }
            }
            ChannelEvent::Closed(peer) => {
                if !self.connections.on_channel_closed(peer) {
                    trace!(peer = %peer.short(), "close for unknown link");
                }
            }
            ChannelEvent::Interrupted(peer) => match self.connections.restart_ice(peer, now).await {
                Ok(offer) => {
                    debug!(peer = %peer.short(), "restarting ICE");
                    self.send_signal(Some(peer), Signal::IceRestartOffer(offer)).await;
                }
                Err(e) if e.is_state_conflict() => {
                    trace!(peer = %peer.short(), error = %e, "not restarting ICE");
                }
                Err(e) => {
                    self.connections.fail(peer, &e.to_string()).await;
                }
            },
            ChannelEvent::LocalCandidate { peer, candidate } => {
                if self.connections.has_link(&peer) {
                    self.send_signal(Some(peer), Signal::IceCandidate(candidate)).await;
                } else {
                    trace!(peer = %peer.short(), "dropping local candidate for unknown link");
                }
            }
            ChannelEvent::Data { peer, frame } => self.on_frame(peer, &frame, now).await,
        }
    }

    async fn on_frame(&mut self, peer: PeerId, bytes: &[u8], now: Instant) {
        if !self.connections.record_activity(&peer, now) {
            trace!(peer = %peer.short(), "dropping frame from peer without open link");
            return;
        }
        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, len = bytes.len(), "dropping undecodable frame");
                return;
            }
        };
        let connected = self.connections.connected_peers();
        match frame {
            LinkFrame::Gossip(message) => {
                let inbound = self.gossip.handle_incoming(peer, message, &connected, now);
                if let Some(received) = inbound.deliver {
                    debug!(origin = %received.origin.short(), direct = received.direct, hops = received.hops, "message received");
                    self.emit(MeshEvent::MessageReceived(received));
                }
                if let Some(forward) = inbound.forward {
                    self.dispatch(forward).await;
                }
            }
            LinkFrame::Dht(frame) => match self.dht.as_mut() {
                Some(dht) => {
                    let out = dht.handle_frame(peer, frame, &connected, now);
                    self.apply_dht_output(out).await;
                }
                None => trace!(peer = %peer.short(), "DHT disabled, dropping DHT frame"),
            },
            LinkFrame::Ping { nonce } => {
                self.send_frame(peer, &LinkFrame::Pong { nonce }).await;
            }
            LinkFrame::Pong { nonce } => {
                trace!(peer = %peer.short(), nonce, "pong");
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    async fn on_tick(&mut self, now: Instant) {
        for task in self.schedule.due(now) {
            match task {
                Task::HealthCheck => self.health_check(now).await,
                Task::PrunePeers => {
                    let max_age = self.schedule.config().stale_peer_max_age;
                    let connections = &self.connections;
                    self.discovery.prune_stale(max_age, now, |p| connections.has_link(p));
                }
                Task::Optimize => self.run_optimize().await,
                Task::DhtSweep => {
                    if let Some(dht) = self.dht.as_mut() {
                        dht.sweep(now);
                    }
                }
                Task::GossipTrim => {
                    self.gossip.trim(now);
                }
                Task::Announce => self.send_signal(None, Signal::Announce).await,
            }
        }
        if self.schedule.take_deferred_optimize(now) {
            if self.connections.connected_count() == 0 {
                self.redial_isolated(&[]).await;
            }
            self.run_optimize().await;
        }
        if let Some(dht) = self.dht.as_mut() {
            let connected = self.connections.connected_peers();
            let out = dht.expire_lookups(&connected, now);
            self.apply_dht_output(out).await;
        }
    }

    async fn health_check(&mut self, now: Instant) {
        for peer in self.connections.connected_peers() {
            self.ping_nonce = self.ping_nonce.wrapping_add(1);
            let nonce = self.ping_nonce;
            self.send_frame(peer, &LinkFrame::Ping { nonce }).await;
        }
        let expired = self.connections.expire_attempts(now).await;
        let stale = self.connections.cleanup_stale_peers(now).await;
        if !expired.is_empty() || !stale.is_empty() {
            debug!(
                expired_attempts = expired.len(),
                stale_links = stale.len(),
                connected = self.connections.connected_count(),
                "health check removed links"
            );
        }
    }

    /// Make room for `peer` when full by dropping a farther connected peer.
    pub(crate) async fn make_room_for(&mut self, peer: &PeerId) {
        if self.connections.can_dial_more(&self.config) {
            return;
        }
        let victim = self
            .discovery
            .should_evict_for(peer, &self.connections, &self.eviction, &self.config);
        if let Some(victim) = victim {
            self.eviction
                .evict_peer(&mut self.connections, victim, REASON_CLOSER_PEER)
                .await;
        }
    }
}

/// Poll `status` until `predicate` holds or `timeout` passes.
pub async fn wait_for_status(
    mesh: &Mesh,
    timeout: Duration,
    predicate: impl Fn(&MeshStatus) -> bool,
) -> Result<MeshStatus> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = mesh.status().await?;
        if predicate(&status) {
            return Ok(status);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for mesh status, last: {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubChannels, StubSignaling};

    fn stub_mesh() -> (Mesh, Arc<StubSignaling>, Arc<StubChannels>) {
        let signaling = Arc::new(StubSignaling::default());
        let channels = Arc::new(StubChannels::default());
        let mesh = Mesh::builder()
            .peer_id("80".repeat(20))
            .signaling(signaling.clone())
            .channels(channels.clone())
            .build()
            .unwrap();
        (mesh, signaling, channels)
    }

    fn id(first: u8) -> PeerId {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        PeerId::from_bytes(bytes)
    }

    #[tokio::test]
    async fn build_requires_collaborators() {
        let err = Mesh::builder().build().err().unwrap();
        assert!(matches!(
            err.downcast_ref::<MeshError>(),
            Some(MeshError::MissingCapability(_))
        ));

        let err = Mesh::builder()
            .signaling(Arc::new(StubSignaling::default()))
            .build()
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<MeshError>(),
            Some(&MeshError::MissingCapability("channel provider"))
        );
    }

    #[tokio::test]
    async fn connect_announces_and_disconnect_says_goodbye() {
        let (mesh, signaling, _) = stub_mesh();
        mesh.connect().await.unwrap();
        assert!(mesh.status().await.unwrap().connected);
        mesh.disconnect().await.unwrap();
        assert!(!mesh.status().await.unwrap().connected);
        assert_eq!(signaling.sent_types(), vec!["announce".to_string(), "goodbye".to_string()]);
    }

    #[tokio::test]
    async fn announce_from_smaller_peer_triggers_dial() {
        let (mesh, signaling, channels) = stub_mesh();
        mesh.connect().await.unwrap();
        let envelope = SignalingEnvelope::new(id(0x10), None, &Signal::Announce);
        mesh.handle_signaling(envelope).await.unwrap();

        let status = mesh.status().await.unwrap();
        assert_eq!(status.discovered_count, 1);
        assert_eq!(status.total_peer_count, 1);
        assert_eq!(channels.offers_created(), 1);
        let types = signaling.sent_types();
        assert!(types.contains(&"offer".to_string()));
        // newcomers are greeted with a targeted announce
        assert_eq!(types.iter().filter(|t| *t == "announce").count(), 2);
    }

    #[tokio::test]
    async fn signals_for_other_targets_are_ignored() {
        let (mesh, _, channels) = stub_mesh();
        mesh.connect().await.unwrap();
        let offer = Signal::Offer(crate::messages::SessionDescription::offer("v=0\r\ns=offer"));
        let envelope = SignalingEnvelope::new(id(0x10), Some(id(0x20)), &offer);
        mesh.handle_signaling(envelope).await.unwrap();
        assert_eq!(mesh.status().await.unwrap().total_peer_count, 0);
        assert_eq!(channels.answers_created(), 0);
    }

    #[tokio::test]
    async fn malformed_offer_reports_error_status() {
        let (mesh, _, _) = stub_mesh();
        let mut events = mesh.events().await.unwrap();
        assert!(mesh.events().await.is_err());
        mesh.connect().await.unwrap();

        let bad = Signal::Offer(crate::messages::SessionDescription::offer("x"));
        mesh.handle_signaling(SignalingEnvelope::new(id(0x10), None, &bad))
            .await
            .unwrap();
        mesh.status().await.unwrap();

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let MeshEvent::Status(StatusEvent {
                level: StatusLevel::Error,
                ..
            }) = event
            {
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert_eq!(mesh.status().await.unwrap().total_peer_count, 0);
    }

    #[tokio::test]
    async fn settings_are_clamped_and_persisted() {
        let store = Arc::new(crate::storage::MemorySettingsStore::new());
        let mesh = Mesh::builder()
            .signaling(Arc::new(StubSignaling::default()))
            .channels(Arc::new(StubChannels::default()))
            .settings_store(store.clone())
            .build()
            .unwrap();
        assert_eq!(mesh.set_max_peers(500).await.unwrap(), 50);
        assert_eq!(mesh.set_min_peers(100).await.unwrap(), 49);
        mesh.set_xor_routing(false).await.unwrap();

        let saved = load_settings(store.as_ref()).unwrap();
        assert_eq!(saved.max_peers, 50);
        assert!(!saved.xor_routing);
        assert_eq!(
            store.get(crate::storage::PEER_ID_KEY).unwrap(),
            Some(mesh.peer_id().to_hex())
        );
    }

    #[tokio::test]
    async fn dht_calls_fail_when_disabled() {
        let mesh = Mesh::builder()
            .signaling(Arc::new(StubSignaling::default()))
            .channels(Arc::new(StubChannels::default()))
            .enable_dht(false)
            .build()
            .unwrap();
        let err = mesh.dht_put("k", b"v".to_vec(), PutOptions::default()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<MeshError>(), Some(&MeshError::DhtDisabled));
        assert!(!mesh.dht_stats().await.unwrap().enabled);
    }

    #[tokio::test]
    async fn shutdown_closes_actor() {
        let (mesh, _, _) = stub_mesh();
        mesh.shutdown().await.unwrap();
        let err = mesh.status().await.unwrap_err();
        assert_eq!(err.downcast_ref::<MeshError>(), Some(&MeshError::ActorClosed));
    }
}
