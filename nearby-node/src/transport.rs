//! Session links: TCP listener and dialer, hello handshake + encrypted frames.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nearby_core::identity::{derive_session_key, Direction};
use nearby_core::wire::{frame_len, open_message, seal_message, LEN_SIZE};
use nearby_core::{Keypair, PeerId, PublicKey, SessionMessage, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::node::Input;

const HELLO_SIZE: usize = 1 + 16 + 32; // version + peer_id + public_key

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Writer side of a link, held by the actor. Dropping the last handle flushes queued
/// frames and closes the link.
#[derive(Debug)]
pub(crate) struct LinkHandle {
    pub(crate) id: u64,
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl LinkHandle {
    /// Queue a message. False if the link is already gone.
    pub(crate) fn send(&self, message: SessionMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Accept incoming links until the listener fails.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    keypair: Arc<Keypair>,
    local: PeerId,
    inputs: mpsc::UnboundedSender<Input>,
    hello_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                let keypair = keypair.clone();
                let inputs = inputs.clone();
                tokio::spawn(async move {
                    let hello = tokio::time::timeout(
                        hello_timeout,
                        handshake_accept(&mut stream, keypair.as_ref(), local),
                    )
                    .await;
                    match hello {
                        Ok(Ok((peer, session_key))) => {
                            run_link(stream, addr, peer, session_key, Direction::Responder, inputs)
                                .await
                        }
                        Ok(Err(e)) => debug!(%addr, error = %e, "link handshake failed"),
                        Err(_) => debug!(%addr, "link handshake timed out"),
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Open a link to a discovered peer. Reports `LinkUp` or `DialFailed` to the actor.
pub(crate) fn dial(
    peer: PeerId,
    addr: SocketAddr,
    public_key: PublicKey,
    keypair: Arc<Keypair>,
    local: PeerId,
    inputs: mpsc::UnboundedSender<Input>,
    connect_timeout: Duration,
) {
    tokio::spawn(async move {
        let connected = tokio::time::timeout(connect_timeout, async {
            let mut stream = TcpStream::connect(addr).await?;
            let session_key =
                handshake_connect(&mut stream, keypair.as_ref(), local, peer, &public_key).await?;
            Ok::<_, io::Error>((stream, session_key))
        })
        .await;
        let reason = match connected {
            Ok(Ok((stream, session_key))) => {
                run_link(stream, addr, peer, session_key, Direction::Initiator, inputs).await;
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connect timed out".to_string(),
        };
        debug!(%peer, %addr, %reason, "dial failed");
        let _ = inputs.send(Input::DialFailed { peer, reason });
    });
}

async fn handshake_accept(
    stream: &mut TcpStream,
    keypair: &Keypair,
    local: PeerId,
) -> io::Result<(PeerId, [u8; 32])> {
    let mut buf = [0u8; HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    let (peer, peer_public) = parse_hello(&buf)?;
    if peer == local {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "link to self"));
    }
    stream.write_all(&hello_bytes(keypair, local)).await?;
    stream.flush().await?;
    let secret = keypair.shared_secret(&peer_public);
    Ok((peer, derive_session_key(&secret)))
}

/// Dialer side: the answering hello must match the identity the peer announced.
async fn handshake_connect(
    stream: &mut TcpStream,
    keypair: &Keypair,
    local: PeerId,
    expected: PeerId,
    expected_public: &PublicKey,
) -> io::Result<[u8; 32]> {
    stream.write_all(&hello_bytes(keypair, local)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    let (peer, peer_public) = parse_hello(&buf)?;
    if peer != expected || &peer_public != expected_public {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "peer identity does not match its announcement",
        ));
    }
    let secret = keypair.shared_secret(&peer_public);
    Ok(derive_session_key(&secret))
}

fn hello_bytes(keypair: &Keypair, local: PeerId) -> [u8; HELLO_SIZE] {
    let mut out = [0u8; HELLO_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(local.as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    out
}

fn parse_hello(buf: &[u8; HELLO_SIZE]) -> io::Result<(PeerId, PublicKey)> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut peer_id = [0u8; 16];
    peer_id.copy_from_slice(&buf[1..17]);
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&buf[17..49]);
    Ok((PeerId::from_bytes(peer_id), PublicKey::from_bytes(public_key)))
}

/// Drive an established link: register it with the actor, write queued messages, forward
/// received ones, and report when it goes down.
async fn run_link(
    stream: TcpStream,
    addr: SocketAddr,
    peer: PeerId,
    session_key: [u8; 32],
    direction: Direction,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionMessage>();
    let (closed_tx, mut closed_rx) = oneshot::channel::<()>();
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let up = Input::LinkUp {
        peer,
        addr,
        outbound: direction == Direction::Initiator,
        link: LinkHandle { id, tx },
    };
    if inputs.send(up).is_err() {
        return;
    }
    debug!(%peer, %addr, link = id, "link up");

    tokio::spawn(async move {
        let mut write_counter: u64 = 0;
        while let Some(message) = rx.recv().await {
            let frame = match seal_message(&session_key, direction, write_counter, &message) {
                Ok(f) => f,
                Err(e) => {
                    warn!(%peer, error = %e, "cannot seal frame");
                    continue;
                }
            };
            write_counter = write_counter.saturating_add(1);
            let written = match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                debug!(%peer, error = %e, "link write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
        let _ = closed_tx.send(());
    });

    let mut read_counter: u64 = 0;
    let reason = loop {
        let cipher = tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(c) => c,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break "closed by peer".to_string(),
                Err(e) => break e.to_string(),
            },
            _ = &mut closed_rx => break "link closed".to_string(),
        };
        let message = match open_message(&session_key, direction.opposite(), read_counter, &cipher) {
            Ok(m) => m,
            Err(e) => break format!("bad frame: {e}"),
        };
        read_counter = read_counter.saturating_add(1);
        if inputs
            .send(Input::LinkMessage {
                peer,
                link: id,
                message,
            })
            .is_err()
        {
            return;
        }
    };
    debug!(%peer, link = id, %reason, "link down");
    let _ = inputs.send(Input::LinkDown {
        peer,
        link: id,
        reason,
    });
}

async fn read_frame(reader: &mut OwnedReadHalf) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = frame_len(&len_buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut cipher = vec![0u8; len];
    reader.read_exact(&mut cipher).await?;
    Ok(cipher)
}
