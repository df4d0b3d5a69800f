//! The running peer: one `CollabSession` wired to WebSockets and disk.
//!
//! The host owns the clock. It feeds transport events and console commands
//! into the session and calls `tick` whenever a deadline passes.

use crate::config::PeerConfig;
use crate::console::{Command, HELP};
use crate::file_store::FileStore;
use crate::render::HtmlRenderer;
use crate::transport::{EventReceiver, WsConnector};
use anyhow::{Context, Result};
use collab_core::{
    CollabSession, MergeError, PeerId, PresenceUser, SessionEvent, SessionId, SubscriptionSet,
    TransportEvent, now_ms,
};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Saved rendered content, refreshed by the content-save hook.
pub const CONTENT_FILE: &str = "content.html";

/// Upper bound on how long the host sleeps with nothing scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(1);

pub type PeerSession = CollabSession<WsConnector, FileStore>;

pub struct PeerHost {
    session: PeerSession,
    content_path: PathBuf,
    _subscriptions: SubscriptionSet,
}

impl PeerHost {
    /// Build the session from `config`. Does not connect yet.
    pub async fn start(config: &PeerConfig) -> Result<(Self, EventReceiver)> {
        let rendezvous = config.rendezvous()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connector = match &config.listen {
            Some(listen) => {
                WsConnector::with_listener(events_tx, listen, config.advertise.clone())
                    .await
                    .with_context(|| format!("failed to listen for peer links on {listen}"))?
                    .0
            }
            None => WsConnector::new(events_tx),
        };
        let store = FileStore::open(&config.data_dir)
            .with_context(|| format!("failed to open data dir {}", config.data_dir.display()))?;

        let mut user = PresenceUser::random();
        if let Some(name) = &config.name {
            user.name = name.clone();
        }
        if let Some(color) = &config.color {
            user.color = color.clone();
        }

        let local = PeerId::generate();
        info!("Peer {} joining room {:?} as {}", local, config.room, user.name);
        let session = CollabSession::new(
            local,
            user,
            config.session(),
            rendezvous,
            connector,
            store,
            Box::new(HtmlRenderer),
            now_ms(),
        );

        let content_path = config.data_dir.join(CONTENT_FILE);
        let mut subscriptions = SubscriptionSet::new();
        let path = content_path.clone();
        subscriptions.push(session.on_event(move |event| match event {
            SessionEvent::ContentSaved(html) => {
                if let Err(e) = std::fs::write(&path, html) {
                    warn!("Failed to save content to {}: {}", path.display(), e);
                }
            }
            SessionEvent::Connection(state) => info!("Connection {}", state),
            SessionEvent::ConnectionFailed(error) => println!("! {error}"),
            SessionEvent::PresenceChanged(peers) => {
                info!("{} active user(s)", peers.len());
            }
            SessionEvent::HistoryRecorded(entry) => {
                info!("{} changed {} line(s)", entry.author_name, entry.changed_lines.len());
            }
            SessionEvent::DocumentChanged(_) | SessionEvent::Warning(_) => {}
        }));

        let host = Self {
            session,
            content_path,
            _subscriptions: subscriptions,
        };
        Ok((host, events_rx))
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn local_peer(&self) -> PeerId {
        self.session.local_peer()
    }

    pub fn content_path(&self) -> &Path {
        &self.content_path
    }

    /// Where other peers dial us, if direct links are accepted.
    pub fn advertised_address(&self) -> Option<&str> {
        self.session.connector().advertised_address()
    }

    pub fn connect(&mut self) {
        self.session.connect(now_ms());
    }

    pub fn on_transport_event(&mut self, session: SessionId, event: TransportEvent) {
        self.session.handle_transport_event(session, event, now_ms());
    }

    pub fn tick(&mut self) {
        self.session.tick(now_ms());
    }

    /// How long to wait before the next `tick` is due.
    pub fn sleep_duration(&self) -> Duration {
        match self.session.next_deadline() {
            Some(deadline) => {
                Duration::from_millis(deadline.saturating_sub(now_ms())).min(IDLE_WAIT)
            }
            None => IDLE_WAIT,
        }
    }

    /// Run one console command and return what to print.
    pub fn execute(&mut self, command: Command) -> Result<String, MergeError> {
        let now = now_ms();
        match command {
            Command::Show => Ok(self.session.document().plain_text()),
            Command::Users => Ok(self.users()),
            Command::History => Ok(self.history()),
            Command::Status => Ok(self.status()),
            Command::Help => Ok(HELP.to_string()),
            Command::Connect => {
                self.session.connect(now);
                Ok(format!("{}", self.session.connection_state()))
            }
            Command::Undo => Ok(if self.session.undo(now)? {
                String::new()
            } else {
                "nothing to undo".to_string()
            }),
            Command::Redo => Ok(if self.session.redo(now)? {
                String::new()
            } else {
                "nothing to redo".to_string()
            }),
            Command::Name(name) => {
                let mut user = self.session.awareness().user_for(self.local_peer());
                user.name = name;
                self.session.set_local_user(user, now);
                Ok(String::new())
            }
            Command::Color(color) => {
                let mut user = self.session.awareness().user_for(self.local_peer());
                user.color = color;
                self.session.set_local_user(user, now);
                Ok(String::new())
            }
            Command::Quit => Ok(String::new()),
            edit => {
                for change in edit.edits(self.session.document().len()) {
                    self.session.apply_local_edit(change, now)?;
                }
                Ok(String::new())
            }
        }
    }

    fn users(&self) -> String {
        let local = self.local_peer();
        let mut out = String::new();
        for peer in self.session.awareness().list_active() {
            let you = if peer.peer_id == local { " (you)" } else { "" };
            let _ = writeln!(out, "{} {}{}", peer.color, peer.display_name, you);
        }
        out.trim_end().to_string()
    }

    fn history(&self) -> String {
        let entries = self.session.history().entries();
        if entries.is_empty() {
            return "no changes yet".to_string();
        }
        let mut out = String::new();
        for entry in entries.iter().rev() {
            let _ = writeln!(
                out,
                "{} {}: {}",
                entry.timestamp,
                entry.author_name,
                entry.changed_lines.join(" | ")
            );
        }
        out.trim_end().to_string()
    }

    fn status(&self) -> String {
        let mut out = format!(
            "peer {} is {}",
            self.local_peer(),
            self.session.connection_state()
        );
        if let Some(error) = self.session.connection_error() {
            let _ = write!(out, " ({error})");
        }
        if let Some(address) = self.advertised_address() {
            let _ = write!(out, "; direct links at {address}");
        }
        out
    }

    /// Leave the room and flush everything to disk.
    pub fn shutdown(&mut self) {
        self.session.teardown();
    }
}
