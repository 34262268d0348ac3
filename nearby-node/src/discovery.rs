//! LAN discovery medium: UDP multicast for real networks, an in-process hub for tests.
//!
//! The medium only moves datagrams. What they mean (found, lost, queries) is decided by
//! the core; this module encodes, decodes and forwards them to the actor.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use nearby_core::wire::{decode_datagram, encode_datagram, MAX_DATAGRAM_LEN};
use nearby_core::Datagram;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::node::Input;

/// Source address reported for datagrams on the memory hub; its nodes listen on loopback.
const MEMORY_SOURCE: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const MEMORY_BACKLOG: usize = 1024;

/// Where discovery datagrams travel.
#[derive(Debug, Clone)]
pub enum Medium {
    /// IPv4 multicast group and UDP port shared by every node on the LAN.
    Multicast { group: Ipv4Addr, port: u16 },
    /// In-process hub; every node started on the same hub hears every other.
    Memory(MemoryHub),
}

/// Shared in-process discovery medium.
#[derive(Debug, Clone)]
pub struct MemoryHub {
    tx: broadcast::Sender<Vec<u8>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MEMORY_BACKLOG);
        Self { tx }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

enum Outbound {
    Udp {
        socket: Arc<UdpSocket>,
        dest: SocketAddr,
    },
    Memory(broadcast::Sender<Vec<u8>>),
}

/// An open discovery medium. Dropping it stops the receive loop.
pub(crate) struct DiscoveryChannel {
    outbound: Outbound,
    recv_task: JoinHandle<()>,
}

impl DiscoveryChannel {
    /// Open the medium and start forwarding received datagrams to the actor.
    pub(crate) fn open(medium: &Medium, inputs: mpsc::UnboundedSender<Input>) -> io::Result<Self> {
        match medium {
            Medium::Multicast { group, port } => {
                let socket = Arc::new(make_multicast_socket(*group, *port)?);
                let recv_task = tokio::spawn(recv_loop(socket.clone(), inputs));
                Ok(Self {
                    outbound: Outbound::Udp {
                        socket,
                        dest: SocketAddr::from((*group, *port)),
                    },
                    recv_task,
                })
            }
            Medium::Memory(hub) => {
                let rx = hub.tx.subscribe();
                let recv_task = tokio::spawn(memory_recv_loop(rx, inputs));
                Ok(Self {
                    outbound: Outbound::Memory(hub.tx.clone()),
                    recv_task,
                })
            }
        }
    }

    pub(crate) async fn send(&self, datagram: &Datagram) -> io::Result<()> {
        let bytes = encode_datagram(datagram)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match &self.outbound {
            Outbound::Udp { socket, dest } => {
                socket.send_to(&bytes, *dest).await?;
            }
            Outbound::Memory(tx) => {
                // No receivers is fine: nobody else is listening yet.
                let _ = tx.send(bytes);
            }
        }
        Ok(())
    }
}

impl Drop for DiscoveryChannel {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

/// Multicast socket shared by every node on the host: reuse address/port, TTL 1, loopback on.
fn make_multicast_socket(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    if !group.is_multicast() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{group} is not an IPv4 multicast address"),
        ));
    }
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn recv_loop(socket: Arc<UdpSocket>, inputs: mpsc::UnboundedSender<Input>) {
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                if n > MAX_DATAGRAM_LEN {
                    debug!(%from, len = n, "oversized datagram dropped");
                    continue;
                }
                if !forward(&buf[..n], from.ip(), &inputs) {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "discovery socket failed");
                let _ = inputs.send(Input::DiscoveryFailed {
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}

async fn memory_recv_loop(mut rx: broadcast::Receiver<Vec<u8>>, inputs: mpsc::UnboundedSender<Input>) {
    loop {
        match rx.recv().await {
            Ok(bytes) => {
                if !forward(&bytes, MEMORY_SOURCE, &inputs) {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "discovery hub lagging, datagrams dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Decode and hand a datagram to the actor. False once the actor is gone.
fn forward(bytes: &[u8], source: IpAddr, inputs: &mpsc::UnboundedSender<Input>) -> bool {
    match decode_datagram(bytes) {
        Ok(datagram) => inputs.send(Input::Datagram { datagram, source }).is_ok(),
        Err(e) => {
            debug!(%source, error = %e, "ignoring undecodable datagram");
            true
        }
    }
}
