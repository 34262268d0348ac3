// nearby: find peers on the LAN, connect, and chat over stdin/stdout.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use nearby_node::{config, DiscoveryInfo, Event, InviteOptions, Node};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nearby", version, about = "Discover nearby peers, connect and chat")]
struct Args {
    /// Display name shown to other peers.
    #[arg(long, default_value = "nearby")]
    name: String,
    /// Service type to advertise and browse for.
    #[arg(long, default_value = "nearby-chat")]
    service: String,
    /// Discovery info entry, repeatable.
    #[arg(long = "info", value_name = "KEY=VALUE")]
    info: Vec<String>,
    /// Advertise (default: advertise and browse).
    #[arg(long)]
    advertise: bool,
    /// Browse and invite every peer found (default: advertise and browse).
    #[arg(long)]
    browse: bool,
    /// Accept invitations instead of declining them.
    #[arg(long)]
    auto_accept: bool,
    /// Config file instead of ~/.config/nearby/config.toml or /etc/nearby/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load(args.config.as_deref()).context("loading config")?;
    let info = DiscoveryInfo::parse_pairs(args.info.iter().map(String::as_str))
        .context("invalid --info")?;
    let (advertise, browse) = match (args.advertise, args.browse) {
        (false, false) => (true, true),
        flags => flags,
    };
    let mode = Mode {
        advertise,
        browse,
        auto_accept: args.auto_accept,
    };

    let node = Node::start(cfg, &args.name).await?;
    let mut events = node.subscribe().await?;
    if advertise {
        node.start_advertising(&args.service, &args.name, info).await?;
    }
    if browse {
        node.start_browsing(&args.service).await?;
    }

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    tokio::spawn(send_lines(node.clone(), line_rx));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => on_event(&node, event, mode),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(text)) => {
                    let _ = line_tx.send(text);
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
            res = &mut shutdown => {
                res?;
                break;
            }
        }
    }
    info!("shutting down");
    node.shutdown().await?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Mode {
    advertise: bool,
    browse: bool,
    auto_accept: bool,
}

fn on_event(node: &Node, event: Event, mode: Mode) {
    match event {
        Event::PeerFound {
            peer,
            discovery_info,
        } => {
            let info: Vec<String> = discovery_info
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            println!("found {} ({}) [{}]", peer.display_name, peer.id, info.join(", "));
            // When both sides advertise and browse, only the lower peer id invites.
            if mode.browse && (!mode.advertise || node.peer_id() < peer.id) {
                let node = node.clone();
                tokio::spawn(async move {
                    let invited = match node.invite(peer.id, InviteOptions::default()).await {
                        Ok(pending) => pending.outcome().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = invited {
                        warn!(peer = %peer.id, error = %e, "invitation failed");
                    }
                });
            }
        }
        Event::PeerLost { peer } => println!("lost {}", peer.display_name),
        Event::PeerStateChanged { peer, state } => println!("{} is {}", peer.display_name, state),
        Event::InvitationReceived {
            invitation_id,
            peer,
            ..
        } => {
            println!(
                "invitation from {} ({})",
                peer.display_name,
                if mode.auto_accept { "accepting" } else { "declining" }
            );
            let node = node.clone();
            tokio::spawn(async move {
                if let Err(e) = node.resolve_invitation(invitation_id, mode.auto_accept).await {
                    warn!(peer = %peer.id, error = %e, "could not answer invitation");
                }
            });
        }
        Event::ReceivedText { peer, text } => println!("[{}] {}", peer.display_name, text),
        Event::ReceivedData { peer, data } => {
            println!("[{}] <{} bytes>", peer.display_name, data.len())
        }
        Event::AdvertiseError { reason } => eprintln!("advertising failed: {reason}"),
        Event::BrowseError { reason } => eprintln!("browsing failed: {reason}"),
    }
}

/// Send each stdin line, in order, to every peer connected at the time.
async fn send_lines(node: Node, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = lines.recv().await {
        let Ok(peers) = node.connected_peers().await else {
            return;
        };
        if peers.is_empty() {
            warn!("no connected peers");
        }
        for peer in peers {
            if let Err(e) = node.send_text(peer.id, &text).await {
                warn!(peer = %peer.id, error = %e, "send failed");
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
