//! A single WebSocket link to another participant.
//!
//! Each link splits its stream: a read task forwards frames to the owner's
//! event channel and a write task drains an outgoing queue, so sends never
//! block the caller.

use collab_core::TransportError;
use collab_core::protocol::MAX_MESSAGE_SIZE;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

pub type LinkId = u64;

/// Event emitted by a link's read task.
#[derive(Debug)]
pub enum LinkEvent {
    Frame { link_id: LinkId, data: Vec<u8> },
    Closed { link_id: LinkId },
}

pub struct PeerLink {
    pub link_id: LinkId,
    /// The remote participant, known once its handshake arrives.
    pub peer: Option<collab_core::PeerId>,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    read_task: Option<JoinHandle<()>>,
}

impl PeerLink {
    /// Wrap an upgraded stream and start its read and write tasks.
    pub fn new<S>(
        link_id: LinkId,
        ws_stream: WebSocketStream<S>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut write, read) = ws_stream.split();
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(e) = write.send(message).await {
                    debug!("Link {} write failed: {}", link_id, e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let read_task = tokio::spawn(async move {
            Self::read_loop(link_id, read, events).await;
        });

        Self {
            link_id,
            peer: None,
            outgoing: Some(outgoing),
            read_task: Some(read_task),
        }
    }

    async fn read_loop<S>(
        link_id: LinkId,
        mut read: futures::stream::SplitStream<WebSocketStream<S>>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data: Vec<u8> = match msg {
                        Message::Binary(data) => data.into(),
                        Message::Text(text) => text.as_bytes().to_vec(),
                        Message::Close(_) => {
                            debug!("Received close frame on link {}", link_id);
                            break;
                        }
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Frame on link {} exceeds max size ({} > {}), dropping",
                            link_id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    if events.send(LinkEvent::Frame { link_id, data }).is_err() {
                        break;
                    }
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    debug!("Link {} closed", link_id);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error on link {}: {}", link_id, e);
                    break;
                }
                None => {
                    debug!("Link {} stream ended", link_id);
                    break;
                }
            }
        }

        let _ = events.send(LinkEvent::Closed { link_id });
    }

    /// Queue a binary frame.
    pub fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        outgoing
            .send(Message::Binary(data.to_vec().into()))
            .map_err(|_| TransportError::SendFailed(format!("link {} is closed", self.link_id)))
    }

    /// Flush queued frames, then close. The read task stops immediately.
    pub fn close(&mut self) {
        if let Some(outgoing) = self.outgoing.take() {
            let _ = outgoing.send(Message::Close(None));
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}
