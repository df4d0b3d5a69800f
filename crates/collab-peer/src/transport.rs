//! WebSocket transport.
//!
//! Each session runs a driver task that:
//! - joins the room topic on the first reachable signaling endpoint
//! - announces itself and learns the other participants from their announces
//! - dials or accepts direct links (lower peer ID dials when both listen)
//! - falls back to relaying frames over signaling when a direct link is
//!   impossible and the ICE configuration carries a TURN entry
//!
//! Everything the driver observes goes back to the host as
//! `(SessionId, TransportEvent)` pairs on one channel. The `WsSession` handle
//! only queues commands, so the engine never waits on the network.

use crate::link::{LinkEvent, LinkId, PeerLink};
use crate::message::{RoomMessage, SignalMessage};
use collab_core::protocol::{Frame, Handshake, PresenceFrame, SyncFrame};
use collab_core::transport::Result;
use collab_core::{
    PeerId, PresenceMessage, RendezvousConfig, SessionId, SyncTransport, TransportConnector,
    TransportError, TransportEvent, UpdateDelta,
};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_async, connect_async, tungstenite::Message,
};
use tracing::{debug, info, warn};

/// Events from every session, tagged with the session that produced them.
pub type EventSender = mpsc::UnboundedSender<(SessionId, TransportEvent)>;
pub type EventReceiver = mpsc::UnboundedReceiver<(SessionId, TransportEvent)>;

const SIGNALING_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type IncomingSlot = Arc<Mutex<Option<mpsc::UnboundedSender<TcpStream>>>>;

/// Opens WebSocket sessions.
pub struct WsConnector {
    events: EventSender,
    advertise: Option<String>,
    /// Accepted sockets go to the current session's driver.
    incoming: IncomingSlot,
    acceptor: Option<JoinHandle<()>>,
}

impl WsConnector {
    /// A connector that only dials out. Peers that cannot reach us directly
    /// relay through signaling.
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            advertise: None,
            incoming: Arc::new(Mutex::new(None)),
            acceptor: None,
        }
    }

    /// A connector that also accepts direct links on `listen`.
    ///
    /// `advertise` defaults to `ws://<bound address>`.
    pub async fn with_listener(
        events: EventSender,
        listen: &str,
        advertise: Option<String>,
    ) -> anyhow::Result<(Self, SocketAddr)> {
        let listener = TcpListener::bind(listen).await?;
        let addr = listener.local_addr()?;
        info!("Accepting peer links on {}", addr);

        let incoming: IncomingSlot = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&incoming);
        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!("Incoming link from {}", remote);
                        let target = slot.lock().ok().and_then(|s| s.clone());
                        match target {
                            Some(tx) => {
                                let _ = tx.send(stream);
                            }
                            None => debug!("No active session, dropping link from {}", remote),
                        }
                    }
                    Err(e) => warn!("Failed to accept peer link: {}", e),
                }
            }
        });

        let connector = Self {
            events,
            advertise: Some(advertise.unwrap_or_else(|| format!("ws://{addr}"))),
            incoming,
            acceptor: Some(acceptor),
        };
        Ok((connector, addr))
    }

    pub fn advertised_address(&self) -> Option<&str> {
        self.advertise.as_deref()
    }
}

impl Drop for WsConnector {
    fn drop(&mut self) {
        if let Some(task) = self.acceptor.take() {
            task.abort();
        }
    }
}

impl TransportConnector for WsConnector {
    type Session = WsSession;

    fn open(
        &mut self,
        session: SessionId,
        local: PeerId,
        rendezvous: &RendezvousConfig,
    ) -> Result<WsSession> {
        rendezvous.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Other(format!("no async runtime: {e}")))?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        if self.acceptor.is_some() {
            if let Ok(mut slot) = self.incoming.lock() {
                *slot = Some(incoming_tx);
            }
        }

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let driver = SessionDriver {
            session,
            local,
            rendezvous: rendezvous.clone(),
            advertise: self.advertise.clone(),
            events: self.events.clone(),
            commands: commands_rx,
            incoming: incoming_rx,
            signal: None,
            signal_reader: None,
            links: HashMap::new(),
            routes: HashMap::new(),
            known: HashMap::new(),
            dialing: HashSet::new(),
            next_link_id: 1,
            link_tx,
            link_rx,
            dial_tx,
            dial_rx,
            accepted_tx,
            accepted_rx,
        };
        runtime.spawn(driver.run());
        debug!("Opened {} for {}", session, local);

        Ok(WsSession {
            session,
            commands: commands_tx,
            destroyed: false,
        })
    }
}

#[derive(Debug)]
enum Command {
    Broadcast(Vec<u8>),
    SendTo(PeerId, Vec<u8>),
    Destroy,
}

/// Handle to one session's driver.
pub struct WsSession {
    session: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    destroyed: bool,
}

impl WsSession {
    fn queue(&self, command: Command) {
        if self.destroyed {
            return;
        }
        if self.commands.send(command).is_err() {
            debug!("{} driver has exited", self.session);
        }
    }

    fn queue_frame(&self, frame: Frame, to: Option<PeerId>) {
        match frame.encode() {
            Ok(bytes) => self.queue(match to {
                Some(peer) => Command::SendTo(peer, bytes),
                None => Command::Broadcast(bytes),
            }),
            Err(e) => warn!("Failed to encode frame: {}", e),
        }
    }
}

impl SyncTransport for WsSession {
    fn session(&self) -> SessionId {
        self.session
    }

    fn broadcast_delta(&mut self, delta: &UpdateDelta) {
        self.queue_frame(SyncFrame::Delta(delta.bytes().to_vec()).into(), None);
    }

    fn broadcast_awareness(&mut self, message: &PresenceMessage) {
        self.queue_frame(PresenceFrame::Presence(message.clone()).into(), None);
    }

    fn broadcast_leave(&mut self, peer: PeerId) {
        self.queue_frame(
            PresenceFrame::Leave { peer_id: peer }.into(),
            None,
        );
    }

    fn send_to(&mut self, peer: PeerId, frame: SyncFrame) {
        self.queue_frame(frame.into(), Some(peer));
    }

    fn destroy(&mut self) {
        self.queue(Command::Destroy);
        self.destroyed = true;
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// How frames reach a linked peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Direct(LinkId),
    Relay,
}

type DialResult = std::result::Result<WebSocketStream<MaybeTlsStream<TcpStream>>, String>;

struct SessionDriver {
    session: SessionId,
    local: PeerId,
    rendezvous: RendezvousConfig,
    advertise: Option<String>,
    events: EventSender,
    commands: mpsc::UnboundedReceiver<Command>,
    incoming: mpsc::UnboundedReceiver<TcpStream>,
    signal: Option<mpsc::UnboundedSender<Message>>,
    signal_reader: Option<JoinHandle<()>>,
    links: HashMap<LinkId, PeerLink>,
    routes: HashMap<PeerId, Route>,
    /// Announced participants and their direct-link addresses
    known: HashMap<PeerId, Option<String>>,
    dialing: HashSet<PeerId>,
    next_link_id: LinkId,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    dial_tx: mpsc::UnboundedSender<(PeerId, DialResult)>,
    dial_rx: mpsc::UnboundedReceiver<(PeerId, DialResult)>,
    /// Inbound links whose WebSocket upgrade finished
    accepted_tx: mpsc::UnboundedSender<WebSocketStream<TcpStream>>,
    accepted_rx: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
}

impl SessionDriver {
    async fn run(mut self) {
        let mut signal_rx = match self.join_signaling().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("{}: {}", self.session, e);
                self.emit(TransportEvent::Error(e));
                return;
            }
        };
        self.emit(TransportEvent::Status { connected: true });
        self.announce();

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;

        loop {
            tokio::select! {
                text = signal_rx.recv() => match text {
                    Some(text) => self.on_signal(&text),
                    None => {
                        warn!("{}: signaling connection lost", self.session);
                        self.emit(TransportEvent::Status { connected: false });
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Destroy) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(stream) = self.incoming.recv() => self.accept_link(stream),
                Some(ws_stream) = self.accepted_rx.recv() => self.open_link(ws_stream),
                Some(event) = self.link_rx.recv() => self.on_link_event(event),
                Some((peer, result)) = self.dial_rx.recv() => self.on_dial(peer, result),
                _ = keepalive.tick() => self.send_signal(SignalMessage::Ping),
            }
        }

        self.shutdown();
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send((self.session, event));
    }

    // ==================== Signaling ====================

    /// Connect to the first reachable endpoint and subscribe to the room.
    async fn join_signaling(&mut self) -> Result<mpsc::UnboundedReceiver<String>> {
        let mut last_error = TransportError::Signaling("no signaling endpoints".into());

        for url in self.rendezvous.signaling.clone() {
            let ws_stream = match timeout(SIGNALING_CONNECT_TIMEOUT, connect_async(&url)).await {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(e)) => {
                    debug!("Signaling endpoint {} unreachable: {}", url, e);
                    last_error = TransportError::Signaling(format!("{url}: {e}"));
                    continue;
                }
                Err(_) => {
                    last_error = TransportError::Signaling(format!("{url}: connect timed out"));
                    continue;
                }
            };
            info!("Joined signaling at {} ({})", url, self.session);

            let (mut write, mut read) = ws_stream.split();
            let (outgoing, mut queue) = mpsc::unbounded_channel::<Message>();
            tokio::spawn(async move {
                while let Some(message) = queue.recv().await {
                    if write.send(message).await.is_err() {
                        break;
                    }
                }
                let _ = write.close().await;
            });

            let (text_tx, text_rx) = mpsc::unbounded_channel();
            let reader = tokio::spawn(async move {
                while let Some(Ok(msg)) = read.next().await {
                    let text = match msg {
                        Message::Text(text) => text.to_string(),
                        Message::Close(_) => break,
                        _ => continue,
                    };
                    if text_tx.send(text).is_err() {
                        break;
                    }
                }
            });

            self.signal = Some(outgoing);
            self.signal_reader = Some(reader);
            self.send_signal(SignalMessage::Subscribe {
                topics: vec![self.rendezvous.room.clone()],
            });
            return Ok(text_rx);
        }

        Err(last_error)
    }

    fn send_signal(&self, message: SignalMessage) {
        if let Some(signal) = &self.signal {
            let _ = signal.send(Message::Text(message.to_text().into()));
        }
    }

    fn publish(&self, message: &RoomMessage) {
        self.send_signal(SignalMessage::publish(&self.rendezvous.room, message));
    }

    fn announce(&self) {
        self.publish(&RoomMessage::Announce {
            from: self.local,
            address: self.advertise.clone(),
        });
    }

    fn on_signal(&mut self, text: &str) {
        match SignalMessage::from_text(text) {
            Some(SignalMessage::Ping) => self.send_signal(SignalMessage::Pong),
            Some(SignalMessage::Publish { topic, data }) if topic == self.rendezvous.room => {
                match RoomMessage::from_value(data) {
                    Some(message) if message.sender() != self.local => self.on_room(message),
                    Some(_) => {}
                    None => debug!("Ignoring unrecognized room message"),
                }
            }
            _ => {}
        }
    }

    fn on_room(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Announce { from, address } => {
                match self.routes.get(&from).copied() {
                    Some(Route::Relay) => {
                        // The peer rejoined; restart the catch-up exchange.
                        self.known.insert(from, address);
                        self.emit(TransportEvent::PeerUnlinked(from));
                        self.emit(TransportEvent::PeerLinked(from));
                        return;
                    }
                    Some(Route::Direct(_)) => {
                        self.known.insert(from, address);
                        return;
                    }
                    None => {}
                }
                let is_new = self.known.insert(from, address.clone()).is_none();
                if is_new {
                    debug!("Discovered {} ({:?})", from, address);
                    self.announce();
                }
                if !self.dialing.contains(&from) {
                    self.establish(from, address);
                }
            }
            RoomMessage::Relay { from, to, payload } => {
                if to != self.local {
                    return;
                }
                if !self.routes.contains_key(&from) {
                    self.routes.insert(from, Route::Relay);
                    self.emit(TransportEvent::PeerLinked(from));
                }
                self.on_frame(from, &payload);
            }
            RoomMessage::Depart { from } => {
                self.known.remove(&from);
                if self.routes.get(&from) == Some(&Route::Relay) {
                    self.routes.remove(&from);
                    self.emit(TransportEvent::PeerUnlinked(from));
                }
            }
        }
    }

    // ==================== Links ====================

    fn establish(&mut self, peer: PeerId, address: Option<String>) {
        let we_dial = match (&address, &self.advertise) {
            (Some(_), Some(_)) => self.local < peer,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => {
                self.relay_or_fail(peer, "neither side accepts direct links");
                return;
            }
        };
        let Some(url) = address.filter(|_| we_dial) else {
            debug!("Waiting for {} to dial us", peer);
            return;
        };

        self.dialing.insert(peer);
        let results = self.dial_tx.clone();
        tokio::spawn(async move {
            let result = match timeout(DIAL_TIMEOUT, connect_async(&url)).await {
                Ok(Ok((ws, _))) => Ok(ws),
                Ok(Err(e)) => Err(format!("{url}: {e}")),
                Err(_) => Err(format!("{url}: dial timed out")),
            };
            let _ = results.send((peer, result));
        });
    }

    fn relay_or_fail(&mut self, peer: PeerId, reason: &str) {
        if self.rendezvous.ice.allows_relay() {
            info!("Relaying frames for {} through signaling ({})", peer, reason);
            if self.routes.insert(peer, Route::Relay).is_none() {
                self.emit(TransportEvent::PeerLinked(peer));
            }
        } else {
            warn!("No route to {}: {}", peer, reason);
            self.emit(TransportEvent::Error(TransportError::Traversal(format!(
                "no route to {peer}: {reason}"
            ))));
        }
    }

    fn on_dial(&mut self, peer: PeerId, result: DialResult) {
        self.dialing.remove(&peer);
        match result {
            Ok(ws_stream) => {
                if self.routes.contains_key(&peer) {
                    debug!("Already linked with {}, dropping dialed link", peer);
                    return;
                }
                self.open_link(ws_stream);
            }
            Err(reason) => self.relay_or_fail(peer, &reason),
        }
    }

    /// Upgrade an inbound socket off the driver loop. A slow or silent
    /// client only costs its own task.
    fn accept_link(&self, stream: TcpStream) {
        let accepted = self.accepted_tx.clone();
        tokio::spawn(async move {
            match timeout(DIAL_TIMEOUT, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    let _ = accepted.send(ws_stream);
                }
                Ok(Err(e)) => debug!("Peer link upgrade failed: {}", e),
                Err(_) => debug!("Peer link upgrade timed out"),
            }
        });
    }

    /// Register a link and send our handshake. It carries no traffic until
    /// the remote handshake arrives.
    fn open_link<S>(&mut self, ws_stream: WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let link_id = self.next_link_id;
        self.next_link_id += 1;
        let link = PeerLink::new(link_id, ws_stream, self.link_tx.clone());
        let handshake = Handshake::new(self.local, self.rendezvous.room.clone());
        if let Err(e) = link.send(&handshake.to_json()) {
            warn!("Failed to send handshake on link {}: {}", link_id, e);
            return;
        }
        self.links.insert(link_id, link);
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame { link_id, data } => {
                match self.links.get(&link_id).map(|link| link.peer) {
                    Some(Some(peer)) => self.on_frame(peer, &data),
                    Some(None) => self.on_handshake(link_id, &data),
                    None => {}
                }
            }
            LinkEvent::Closed { link_id } => {
                let Some(link) = self.links.remove(&link_id) else {
                    return;
                };
                if let Some(peer) = link.peer {
                    if self.routes.get(&peer) == Some(&Route::Direct(link_id)) {
                        self.routes.remove(&peer);
                        self.known.remove(&peer);
                        info!("Link to {} closed", peer);
                        self.emit(TransportEvent::PeerUnlinked(peer));
                    }
                }
            }
        }
    }

    fn on_handshake(&mut self, link_id: LinkId, data: &[u8]) {
        let Some(handshake) = Handshake::from_json(data) else {
            warn!("Expected handshake on link {}, dropping frame", link_id);
            return;
        };
        if handshake.should_warn_version() {
            warn!(
                "Peer {} speaks protocol version {}",
                handshake.peer_id, handshake.version
            );
        }

        let peer = handshake.peer_id;
        let duplicate = matches!(self.routes.get(&peer), Some(Route::Direct(_)));
        if !handshake.accepts(&self.rendezvous.room) || peer == self.local || duplicate {
            debug!("Rejecting link {} from {} (room {})", link_id, peer, handshake.room);
            if let Some(mut link) = self.links.remove(&link_id) {
                link.close();
            }
            return;
        }

        if let Some(link) = self.links.get_mut(&link_id) {
            link.peer = Some(peer);
        }
        let was_linked = self.routes.insert(peer, Route::Direct(link_id)).is_some();
        info!("Direct link to {} established", peer);
        if !was_linked {
            self.emit(TransportEvent::PeerLinked(peer));
        }
    }

    fn on_frame(&self, from: PeerId, data: &[u8]) {
        match Frame::decode(data) {
            Ok(Frame::Sync(frame)) => self.emit(TransportEvent::Sync { from, frame }),
            Ok(Frame::Presence(PresenceFrame::Presence(message))) => {
                self.emit(TransportEvent::Presence(message))
            }
            Ok(Frame::Presence(PresenceFrame::Leave { peer_id })) => {
                self.emit(TransportEvent::Left(peer_id))
            }
            Err(e) => warn!("Dropping bad frame from {}: {}", from, e),
        }
    }

    // ==================== Commands ====================

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Broadcast(bytes) => {
                let routes: Vec<(PeerId, Route)> =
                    self.routes.iter().map(|(p, r)| (*p, *r)).collect();
                for (peer, route) in routes {
                    self.route_send(peer, route, &bytes);
                }
            }
            Command::SendTo(peer, bytes) => match self.routes.get(&peer).copied() {
                Some(route) => self.route_send(peer, route, &bytes),
                None => debug!("Not linked with {}, dropping frame", peer),
            },
            Command::Destroy => {}
        }
    }

    fn route_send(&self, peer: PeerId, route: Route, bytes: &[u8]) {
        match route {
            Route::Direct(link_id) => {
                let sent = self
                    .links
                    .get(&link_id)
                    .ok_or(TransportError::Closed)
                    .and_then(|link| link.send(bytes));
                if let Err(e) = sent {
                    warn!("Send to {} failed: {}", peer, e);
                }
            }
            Route::Relay => self.publish(&RoomMessage::Relay {
                from: self.local,
                to: peer,
                payload: bytes.to_vec(),
            }),
        }
    }

    fn shutdown(&mut self) {
        // Frames queued before the destroy command still go out.
        while let Ok(command) = self.commands.try_recv() {
            self.on_command(command);
        }
        self.publish(&RoomMessage::Depart { from: self.local });
        self.send_signal(SignalMessage::Unsubscribe {
            topics: vec![self.rendezvous.room.clone()],
        });
        for link in self.links.values_mut() {
            link.close();
        }
        self.links.clear();
        self.routes.clear();
        if let Some(signal) = self.signal.take() {
            let _ = signal.send(Message::Close(None));
        }
        if let Some(reader) = self.signal_reader.take() {
            reader.abort();
        }
        debug!("{} shut down", self.session);
    }
}
