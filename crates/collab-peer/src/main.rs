//! collab-peer: terminal client and signaling server for collaborative
//! editing.
//!
//! `join` edits a shared document from stdin; `signal` runs the rendezvous
//! server peers meet through.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use collab_peer::{Command, PeerConfig, PeerHost, SignalingServer};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "collab-peer")]
#[command(about = "Peer-to-peer collaborative rich-text editor")]
struct Cli {
    #[command(subcommand)]
    command: Mode,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Join a room and edit from stdin
    Join(JoinArgs),
    /// Run a signaling server
    Signal {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:4444")]
        listen: String,
    },
}

#[derive(Args, Debug)]
struct JoinArgs {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Room to join
    #[arg(long)]
    room: Option<String>,

    /// Signaling endpoint (repeatable)
    #[arg(long = "signaling")]
    signaling: Vec<String>,

    /// Accept direct peer links on this address
    #[arg(long)]
    listen: Option<String>,

    /// Address other peers should dial
    #[arg(long)]
    advertise: Option<String>,

    /// Directory for the snapshot, history and saved content
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Display name
    #[arg(long)]
    name: Option<String>,

    /// Display color (#rrggbb)
    #[arg(long)]
    color: Option<String>,
}

impl JoinArgs {
    fn into_config(self) -> Result<PeerConfig> {
        let mut config = PeerConfig::load_or_default(self.config.as_deref())?;
        if let Some(room) = self.room {
            config.room = room;
        }
        if !self.signaling.is_empty() {
            config.signaling = self.signaling;
        }
        if self.listen.is_some() {
            config.listen = self.listen;
        }
        if self.advertise.is_some() {
            config.advertise = self.advertise;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if self.name.is_some() {
            config.name = self.name;
        }
        if self.color.is_some() {
            config.color = self.color;
        }
        Ok(config)
    }
}

async fn join(config: PeerConfig) -> Result<()> {
    let (mut host, mut events) = PeerHost::start(&config).await?;
    host.connect();
    println!("Joined {} as peer {}. Type :help for commands.", config.room, host.local_peer());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let wait = host.sleep_duration();
        tokio::select! {
            Some((session, event)) = events.recv() => {
                host.on_transport_event(session, event);
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) => match Command::parse(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => match host.execute(command) {
                        Ok(output) if !output.is_empty() => println!("{output}"),
                        Ok(_) => {}
                        Err(e) => println!("! {e}"),
                    },
                    Err(e) => println!("! {e}"),
                },
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },

            _ = tokio::time::sleep(wait) => {}

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
        host.tick();
    }

    info!("Leaving room");
    host.shutdown();
    // Give the leave frames a moment to go out.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

async fn signal(listen: &str) -> Result<()> {
    let listener = SignalingServer::bind(listen).await?;
    tokio::select! {
        _ = SignalingServer::new().run(listener) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for the editor.
    let default_filter = if cli.verbose {
        "collab_peer=debug,collab_core=debug"
    } else {
        "collab_peer=info,collab_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Mode::Join(args) => join(args.into_config()?).await,
        Mode::Signal { listen } => signal(&listen).await,
    }
}
