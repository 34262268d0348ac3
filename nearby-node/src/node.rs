//! Node handle and the actor that owns the protocol core.
//!
//! All state lives in one actor task. Application calls and socket tasks only send it
//! messages; the actor feeds them to `NearbyCore` and performs the returned actions in
//! order, so events reach observers in the order the core produced them.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nearby_core::{
    create_identity, Action, DataKind, Datagram, DiscoveryInfo, DisplayName, Event,
    InvitationContext, InvitationId, InviteError, Keypair, NearbyCore, PeerId, PeerRecord,
    ResolveError, SendError, ServiceType, SessionMessage, DEFAULT_INVITE_TIMEOUT,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventStream};
use crate::config::Config;
use crate::discovery::{DiscoveryChannel, Medium};
use crate::error::{Error, Result};
use crate::transport::{self, LinkHandle};

/// Options for `Node::invite`.
#[derive(Debug, Clone)]
pub struct InviteOptions {
    /// How long the peer has to answer (default 30 s).
    pub timeout: Duration,
    /// Opaque bytes delivered with the invitation.
    pub context: Option<InvitationContext>,
}

impl Default for InviteOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_INVITE_TIMEOUT,
            context: None,
        }
    }
}

/// An invitation that was sent and is waiting for the peer's answer.
#[derive(Debug)]
pub struct PendingInvite {
    invitation_id: InvitationId,
    outcome: oneshot::Receiver<Result<(), InviteError>>,
}

impl PendingInvite {
    pub fn invitation_id(&self) -> InvitationId {
        self.invitation_id
    }

    /// Resolves when the peer accepted (it is `Connected` by then), declined, did not
    /// answer in time, or the link failed.
    pub async fn outcome(self) -> Result<()> {
        match self.outcome.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Shutdown),
        }
    }
}

/// Messages from socket tasks to the actor.
#[derive(Debug)]
pub(crate) enum Input {
    Datagram {
        datagram: Datagram,
        source: IpAddr,
    },
    DiscoveryFailed {
        reason: String,
    },
    LinkUp {
        peer: PeerId,
        addr: SocketAddr,
        outbound: bool,
        link: LinkHandle,
    },
    LinkMessage {
        peer: PeerId,
        link: u64,
        message: SessionMessage,
    },
    LinkDown {
        peer: PeerId,
        link: u64,
        reason: String,
    },
    DialFailed {
        peer: PeerId,
        reason: String,
    },
}

/// Commands from `Node` handles to the actor.
enum Command {
    StartAdvertising {
        service_type: ServiceType,
        display_name: DisplayName,
        discovery_info: DiscoveryInfo,
        respond_to: oneshot::Sender<()>,
    },
    StopAdvertising {
        respond_to: oneshot::Sender<()>,
    },
    StartBrowsing {
        service_type: ServiceType,
        respond_to: oneshot::Sender<()>,
    },
    StopBrowsing {
        respond_to: oneshot::Sender<()>,
    },
    Invite {
        peer: PeerId,
        options: InviteOptions,
        respond_to: oneshot::Sender<Result<PendingInvite, InviteError>>,
    },
    ResolveInvitation {
        invitation_id: InvitationId,
        accept: bool,
        respond_to: oneshot::Sender<Result<(), ResolveError>>,
    },
    Send {
        peer: PeerId,
        kind: DataKind,
        payload: Vec<u8>,
        respond_to: oneshot::Sender<Result<oneshot::Receiver<Result<(), SendError>>, SendError>>,
    },
    Disconnect {
        respond_to: oneshot::Sender<()>,
    },
    Subscribe {
        respond_to: oneshot::Sender<EventStream>,
    },
    ConnectedPeers {
        respond_to: oneshot::Sender<Vec<PeerRecord>>,
    },
    DiscoveredPeers {
        respond_to: oneshot::Sender<Vec<PeerRecord>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a running node. Cheap to clone; the node shuts down when `shutdown` is
/// called or the last handle is dropped.
#[derive(Clone)]
pub struct Node {
    commands: mpsc::UnboundedSender<Command>,
    peer_id: PeerId,
    listen_addr: SocketAddr,
}

impl Node {
    /// Start a node on the LAN: multicast discovery as configured, session listener bound.
    pub async fn start(config: Config, display_name: &str) -> Result<Node> {
        let medium = Medium::Multicast {
            group: config.multicast_group,
            port: config.discovery_port,
        };
        Self::start_with_medium(config, display_name, medium).await
    }

    /// Start a node on an explicit discovery medium (e.g. an in-process `MemoryHub`).
    pub async fn start_with_medium(
        config: Config,
        display_name: &str,
        medium: Medium,
    ) -> Result<Node> {
        let identity = create_identity(display_name)?;
        let listener = TcpListener::bind((config.transport_bind, config.transport_port)).await?;
        let listen_addr = listener.local_addr()?;
        let peer_id = identity.peer_id();
        let keypair = identity.keypair().clone();

        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(transport::accept_loop(
            listener,
            keypair.clone(),
            peer_id,
            inputs_tx.clone(),
            config.connect_timeout(),
        ));

        let actor = Actor {
            core: NearbyCore::new(identity, listen_addr.port(), config.timing()),
            medium,
            discovery: None,
            inputs: inputs_tx,
            keypair,
            connect_timeout: config.connect_timeout(),
            bus: EventBus::default(),
            links: HashMap::new(),
            invite_waiters: HashMap::new(),
            send_waiters: HashMap::new(),
            accept_task,
        };
        tokio::spawn(actor.run(commands_rx, inputs_rx, config.tick_interval()));
        info!(peer = %peer_id, addr = %listen_addr, "node started");
        Ok(Node {
            commands: commands_tx,
            peer_id,
            listen_addr,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Where this node accepts session links.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Advertise under `service_type`. Also becomes the local display name. Bind failures
    /// arrive later as `Event::AdvertiseError`.
    pub async fn start_advertising(
        &self,
        service_type: &str,
        display_name: &str,
        discovery_info: DiscoveryInfo,
    ) -> Result<()> {
        let service_type = ServiceType::new(service_type)?;
        let display_name = DisplayName::new(display_name)?;
        self.request(|respond_to| Command::StartAdvertising {
            service_type,
            display_name,
            discovery_info,
            respond_to,
        })
        .await
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        self.request(|respond_to| Command::StopAdvertising { respond_to })
            .await
    }

    /// Browse for `service_type`. Bind failures arrive later as `Event::BrowseError`.
    pub async fn start_browsing(&self, service_type: &str) -> Result<()> {
        let service_type = ServiceType::new(service_type)?;
        self.request(|respond_to| Command::StartBrowsing {
            service_type,
            respond_to,
        })
        .await
    }

    pub async fn stop_browsing(&self) -> Result<()> {
        self.request(|respond_to| Command::StopBrowsing { respond_to })
            .await
    }

    /// Invite a found peer. Fails at once on `PeerNotFound`, `AlreadyConnected` or
    /// `AlreadyPending`; otherwise await `PendingInvite::outcome` for the answer.
    pub async fn invite(&self, peer: PeerId, options: InviteOptions) -> Result<PendingInvite> {
        let pending = self
            .request(|respond_to| Command::Invite {
                peer,
                options,
                respond_to,
            })
            .await??;
        Ok(pending)
    }

    /// Answer an `Event::InvitationReceived`, exactly once.
    pub async fn resolve_invitation(&self, invitation_id: InvitationId, accept: bool) -> Result<()> {
        self.request(|respond_to| Command::ResolveInvitation {
            invitation_id,
            accept,
            respond_to,
        })
        .await??;
        Ok(())
    }

    /// Reliable, ordered send to a connected peer. Completes once the peer acknowledged it.
    pub async fn send(&self, peer: PeerId, data: impl Into<Vec<u8>>) -> Result<()> {
        self.send_kind(peer, DataKind::Binary, data.into()).await
    }

    /// Like `send`, delivered to the peer as `Event::ReceivedText`.
    pub async fn send_text(&self, peer: PeerId, text: &str) -> Result<()> {
        self.send_kind(peer, DataKind::Text, text.as_bytes().to_vec())
            .await
    }

    async fn send_kind(&self, peer: PeerId, kind: DataKind, payload: Vec<u8>) -> Result<()> {
        let acked = self
            .request(|respond_to| Command::Send {
                peer,
                kind,
                payload,
                respond_to,
            })
            .await??;
        match acked.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// Leave every session and drop pending invitations. Returns once state has changed;
    /// links close in the background after flushing.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|respond_to| Command::Disconnect { respond_to })
            .await
    }

    /// Every event published from now on.
    pub async fn subscribe(&self) -> Result<EventStream> {
        self.request(|respond_to| Command::Subscribe { respond_to })
            .await
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerRecord>> {
        self.request(|respond_to| Command::ConnectedPeers { respond_to })
            .await
    }

    pub async fn discovered_peers(&self) -> Result<Vec<PeerRecord>> {
        self.request(|respond_to| Command::DiscoveredPeers { respond_to })
            .await
    }

    /// Disconnect, stop advertising and browsing, and stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|respond_to| Command::Shutdown { respond_to })
            .await
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

struct Actor {
    core: NearbyCore,
    medium: Medium,
    /// Open while advertising or browsing.
    discovery: Option<DiscoveryChannel>,
    inputs: mpsc::UnboundedSender<Input>,
    keypair: Arc<Keypair>,
    connect_timeout: Duration,
    bus: EventBus,
    /// Live links per peer, oldest first. The core sees the first up and the last down.
    links: HashMap<PeerId, Vec<LinkHandle>>,
    invite_waiters: HashMap<InvitationId, oneshot::Sender<Result<(), InviteError>>>,
    send_waiters: HashMap<(PeerId, u64), oneshot::Sender<Result<(), SendError>>>,
    accept_task: JoinHandle<()>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        tick_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { respond_to }) => {
                        self.shutdown().await;
                        let _ = respond_to.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(input) = inputs.recv() => self.handle_input(input).await,
                _ = ticker.tick() => {
                    let actions = self.core.tick(now());
                    self.execute(actions).await;
                }
            }
        }
        info!(peer = %self.core.peer_id(), "node stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartAdvertising {
                service_type,
                display_name,
                discovery_info,
                respond_to,
            } => {
                let actions = match self.open_discovery() {
                    Ok(()) => {
                        info!(service = %service_type, name = %display_name, "advertising");
                        self.core
                            .start_advertising(service_type, display_name, discovery_info, now())
                    }
                    Err(e) => self.core.advertise_failed(e.to_string()),
                };
                self.execute(actions).await;
                let _ = respond_to.send(());
            }
            Command::StopAdvertising { respond_to } => {
                let actions = self.core.stop_advertising();
                self.execute(actions).await;
                self.close_discovery_if_idle();
                let _ = respond_to.send(());
            }
            Command::StartBrowsing {
                service_type,
                respond_to,
            } => {
                let actions = match self.open_discovery() {
                    Ok(()) => {
                        info!(service = %service_type, "browsing");
                        self.core.start_browsing(service_type)
                    }
                    Err(e) => self.core.browse_failed(e.to_string()),
                };
                self.execute(actions).await;
                let _ = respond_to.send(());
            }
            Command::StopBrowsing { respond_to } => {
                let actions = self.core.stop_browsing();
                self.execute(actions).await;
                self.close_discovery_if_idle();
                let _ = respond_to.send(());
            }
            Command::Invite {
                peer,
                options,
                respond_to,
            } => match self.core.invite(peer, options.timeout, options.context, now()) {
                Ok((invitation_id, actions)) => {
                    debug!(%peer, invitation = %invitation_id, "inviting");
                    let (tx, rx) = oneshot::channel();
                    self.invite_waiters.insert(invitation_id, tx);
                    let _ = respond_to.send(Ok(PendingInvite {
                        invitation_id,
                        outcome: rx,
                    }));
                    self.execute(actions).await;
                }
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                }
            },
            Command::ResolveInvitation {
                invitation_id,
                accept,
                respond_to,
            } => match self.core.resolve_invitation(invitation_id, accept, now()) {
                Ok(actions) => {
                    debug!(invitation = %invitation_id, accept, "invitation resolved");
                    self.execute(actions).await;
                    let _ = respond_to.send(Ok(()));
                }
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                }
            },
            Command::Send {
                peer,
                kind,
                payload,
                respond_to,
            } => match self.core.send(peer, kind, payload, now()) {
                Ok((seq, actions)) => {
                    let (tx, rx) = oneshot::channel();
                    self.send_waiters.insert((peer, seq), tx);
                    let _ = respond_to.send(Ok(rx));
                    self.execute(actions).await;
                }
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                }
            },
            Command::Disconnect { respond_to } => {
                let actions = self.core.disconnect(now());
                self.execute(actions).await;
                let _ = respond_to.send(());
            }
            Command::Subscribe { respond_to } => {
                let _ = respond_to.send(self.bus.subscribe());
            }
            Command::ConnectedPeers { respond_to } => {
                let _ = respond_to.send(self.core.connected_peers());
            }
            Command::DiscoveredPeers { respond_to } => {
                let _ = respond_to.send(self.core.discovered_peers());
            }
            Command::Shutdown { respond_to } => {
                self.shutdown().await;
                let _ = respond_to.send(());
            }
        }
    }

    async fn handle_input(&mut self, input: Input) {
        let actions = match input {
            Input::Datagram { datagram, source } => self.core.on_datagram(datagram, source, now()),
            Input::DiscoveryFailed { reason } => {
                self.discovery = None;
                self.core.discovery_failed(reason)
            }
            Input::LinkUp {
                peer,
                addr,
                outbound,
                link,
            } => {
                let links = self.links.entry(peer).or_default();
                links.push(link);
                if links.len() == 1 {
                    self.core.on_link_up(peer, addr, outbound, now())
                } else {
                    Vec::new()
                }
            }
            Input::LinkMessage {
                peer,
                link,
                message,
            } => {
                if !self.is_live(peer, link) {
                    return;
                }
                self.core.on_message(peer, message, now())
            }
            Input::LinkDown { peer, link, reason } => {
                let Some(links) = self.links.get_mut(&peer) else {
                    return;
                };
                let before = links.len();
                links.retain(|l| l.id != link);
                if links.len() == before || !links.is_empty() {
                    return;
                }
                self.links.remove(&peer);
                debug!(%peer, %reason, "peer link lost");
                self.core.on_link_down(peer, &reason)
            }
            Input::DialFailed { peer, reason } => {
                if self.links.contains_key(&peer) {
                    return;
                }
                warn!(%peer, %reason, "could not reach peer");
                self.core.on_link_down(peer, &reason)
            }
        };
        self.execute(actions).await;
    }

    fn is_live(&self, peer: PeerId, link: u64) -> bool {
        self.links
            .get(&peer)
            .is_some_and(|links| links.iter().any(|l| l.id == link))
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Broadcast(datagram) => {
                    let Some(discovery) = &self.discovery else {
                        continue;
                    };
                    if let Err(e) = discovery.send(&datagram).await {
                        let reason = format!("discovery send failed: {e}");
                        match datagram {
                            Datagram::Announce(_) => {
                                queue.extend(self.core.advertise_failed(reason))
                            }
                            Datagram::Query { .. } => {
                                queue.extend(self.core.browse_failed(reason))
                            }
                            Datagram::Goodbye { .. } => warn!(%reason, "goodbye not sent"),
                        }
                    }
                }
                Action::Connect {
                    peer,
                    addr,
                    public_key,
                } => {
                    debug!(%peer, %addr, "dialing");
                    transport::dial(
                        peer,
                        addr,
                        public_key,
                        self.keypair.clone(),
                        self.core.peer_id(),
                        self.inputs.clone(),
                        self.connect_timeout,
                    );
                }
                Action::Send { peer, message } => {
                    match self.links.get(&peer).and_then(|links| links.first()) {
                        Some(link) => {
                            if !link.send(message) {
                                debug!(%peer, "link closed before send");
                            }
                        }
                        None => debug!(%peer, "no link for message"),
                    }
                }
                Action::CloseLink { peer } => {
                    if let Some(links) = self.links.remove(&peer) {
                        debug!(%peer, count = links.len(), "closing links");
                    }
                }
                Action::Emit(event) => {
                    trace_event(&event);
                    self.bus.publish(event);
                }
                Action::InviteSettled {
                    invitation_id,
                    result,
                } => {
                    if let Some(tx) = self.invite_waiters.remove(&invitation_id) {
                        let _ = tx.send(result);
                    }
                }
                Action::SendSettled { peer, seq, result } => {
                    if let Some(tx) = self.send_waiters.remove(&(peer, seq)) {
                        let _ = tx.send(result);
                    }
                }
            }
        }
    }

    fn open_discovery(&mut self) -> std::io::Result<()> {
        if self.discovery.is_none() {
            self.discovery = Some(DiscoveryChannel::open(&self.medium, self.inputs.clone())?);
        }
        Ok(())
    }

    fn close_discovery_if_idle(&mut self) {
        if !self.core.is_advertising() && !self.core.is_browsing() {
            self.discovery = None;
        }
    }

    async fn shutdown(&mut self) {
        let mut actions = self.core.disconnect(now());
        actions.extend(self.core.stop_advertising());
        actions.extend(self.core.stop_browsing());
        self.execute(actions).await;
        self.discovery = None;
        self.links.clear();
        self.accept_task.abort();
    }
}

fn trace_event(event: &Event) {
    match event {
        Event::PeerFound { peer, .. } => {
            info!(peer = %peer.id, name = %peer.display_name, "peer found")
        }
        Event::PeerLost { peer } => info!(peer = %peer.id, name = %peer.display_name, "peer lost"),
        Event::PeerStateChanged { peer, state } => {
            info!(peer = %peer.id, name = %peer.display_name, %state, "peer state changed")
        }
        Event::InvitationReceived {
            invitation_id,
            peer,
            ..
        } => info!(peer = %peer.id, invitation = %invitation_id, "invitation received"),
        Event::ReceivedData { peer, data } => debug!(peer = %peer.id, len = data.len(), "data"),
        Event::ReceivedText { peer, text } => debug!(peer = %peer.id, len = text.len(), "text"),
        Event::AdvertiseError { reason } => warn!(%reason, "advertising failed"),
        Event::BrowseError { reason } => warn!(%reason, "browsing failed"),
    }
}
