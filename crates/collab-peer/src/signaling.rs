//! Topic pub/sub signaling server.
//!
//! Clients subscribe to topics and publish JSON payloads; every subscriber of
//! the topic (the publisher included) receives the publish frame verbatim.
//! The server never inspects payloads, so it carries announces, relayed
//! frames and departures alike.

use crate::message::SignalMessage;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

type ClientId = u64;

#[derive(Debug)]
enum ClientEvent {
    Text { client: ClientId, text: String },
    Closed { client: ClientId },
}

pub struct SignalingServer {
    /// Outgoing queue per connected client
    clients: HashMap<ClientId, mpsc::UnboundedSender<Message>>,
    /// Subscribers per topic
    topics: HashMap<String, HashSet<ClientId>>,
    next_client_id: ClientId,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    event_rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            clients: HashMap::new(),
            topics: HashMap::new(),
            next_client_id: 1,
            event_tx,
            event_rx,
        }
    }

    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind signaling server to {listen_addr}"))?;
        info!("Signaling server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve in the background. Returns the bound address.
    pub async fn spawn(listen_addr: &str) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = Self::bind(listen_addr).await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(Self::new().run(listener));
        Ok((addr, task))
    }

    /// Serve until the task is dropped or aborted.
    pub async fn run(mut self, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => self.accept_connection(stream, addr).await,
                    Err(e) => error!("Failed to accept signaling connection: {}", e),
                },
                Some(event) = self.event_rx.recv() => self.handle(event),
            }
        }
    }

    async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("Signaling upgrade failed for {}: {}", addr, e);
                return;
            }
        };

        let client = self.next_client_id;
        self.next_client_id += 1;
        debug!("Signaling client {} connected from {}", client, addr);

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

        let events = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                let text = match msg {
                    Message::Text(text) => text.to_string(),
                    Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Message::Close(_) => break,
                    _ => continue,
                };
                if events.send(ClientEvent::Text { client, text }).is_err() {
                    return;
                }
            }
            let _ = events.send(ClientEvent::Closed { client });
        });

        self.clients.insert(client, outgoing);
    }

    fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Text { client, text } => {
                let Some(message) = SignalMessage::from_text(&text) else {
                    warn!("Ignoring unrecognized signaling message from {}", client);
                    return;
                };
                self.on_message(client, message, text);
            }
            ClientEvent::Closed { client } => {
                self.clients.remove(&client);
                for subscribers in self.topics.values_mut() {
                    subscribers.remove(&client);
                }
                self.topics.retain(|_, subscribers| !subscribers.is_empty());
                debug!("Signaling client {} disconnected", client);
            }
        }
    }

    fn on_message(&mut self, client: ClientId, message: SignalMessage, raw: String) {
        match message {
            SignalMessage::Subscribe { topics } => {
                for topic in topics {
                    debug!("Client {} subscribed to {}", client, topic);
                    self.topics.entry(topic).or_default().insert(client);
                }
            }
            SignalMessage::Unsubscribe { topics } => {
                for topic in topics {
                    if let Some(subscribers) = self.topics.get_mut(&topic) {
                        subscribers.remove(&client);
                        if subscribers.is_empty() {
                            self.topics.remove(&topic);
                        }
                    }
                }
            }
            SignalMessage::Publish { topic, .. } => {
                let Some(subscribers) = self.topics.get(&topic) else {
                    return;
                };
                for subscriber in subscribers {
                    if let Some(outgoing) = self.clients.get(subscriber) {
                        let _ = outgoing.send(Message::Text(raw.clone().into()));
                    }
                }
            }
            SignalMessage::Ping => {
                if let Some(outgoing) = self.clients.get(&client) {
                    let _ = outgoing.send(Message::Text(SignalMessage::Pong.to_text().into()));
                }
            }
            SignalMessage::Pong => {}
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, HashSet::len)
    }
}
