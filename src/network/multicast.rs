//! UDP multicast transport
//!
//! Owns one datagram socket joined to one group for its whole lifetime.
//! Datagrams carry raw PCM with no header; the datagram boundary is the frame.
//!
//! socket2 configures the socket (reuse flags, membership, TTL); after that
//! all I/O goes through the plain [`UdpSocket`].

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::TransportError;

/// A socket joined to a multicast group
#[derive(Debug)]
pub struct MulticastTransport {
    socket: UdpSocket,
    group: SocketAddr,
    bind: SocketAddr,
    interface: Option<Ipv4Addr>,
    ttl: u32,
}

impl MulticastTransport {
    /// Resolve addresses, open and bind the socket, join the group and set the TTL.
    ///
    /// Fails at the first failing step; the socket is closed on every error path.
    pub fn join(config: &NetworkConfig) -> Result<Self, TransportError> {
        let group = resolve(&config.group, config.port)?;
        if !group.ip().is_multicast() {
            return Err(TransportError::Resolution {
                address: config.group.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a multicast address"),
            });
        }

        let bind = resolve_matching(&config.bind_address, config.port, &group)?;
        let interface = match config.interface.as_deref() {
            Some(text) => Some(text.parse::<Ipv4Addr>().map_err(|e| {
                TransportError::Resolution {
                    address: text.to_string(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, e),
                }
            })?),
            None => None,
        };

        let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))
            .map_err(TransportError::socket("creating socket"))?;
        socket
            .set_reuse_address(true)
            .map_err(TransportError::socket("setting SO_REUSEADDR"))?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket
            .set_reuse_port(true)
            .map_err(TransportError::socket("setting SO_REUSEPORT"))?;
        socket
            .bind(&bind.into())
            .map_err(TransportError::socket("binding"))?;

        let join_error = |source| TransportError::Join { group, source };
        match group.ip() {
            IpAddr::V4(group_ip) => {
                let iface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
                socket
                    .join_multicast_v4(&group_ip, &iface)
                    .map_err(join_error)?;
                socket
                    .set_multicast_ttl_v4(config.ttl)
                    .map_err(TransportError::socket("setting multicast TTL"))?;
                socket
                    .set_multicast_loop_v4(true)
                    .map_err(TransportError::socket("enabling multicast loopback"))?;
                if let Some(iface) = interface {
                    socket
                        .set_multicast_if_v4(&iface)
                        .map_err(TransportError::socket("selecting multicast interface"))?;
                }
            }
            IpAddr::V6(group_ip) => {
                socket.join_multicast_v6(&group_ip, 0).map_err(join_error)?;
                socket
                    .set_multicast_hops_v6(config.ttl)
                    .map_err(TransportError::socket("setting multicast hops"))?;
                socket
                    .set_multicast_loop_v6(true)
                    .map_err(TransportError::socket("enabling multicast loopback"))?;
            }
        }

        tracing::info!(
            "Joined multicast group {} (bound {}, ttl {})",
            group,
            bind,
            config.ttl
        );

        Ok(Self {
            socket: socket.into(),
            group,
            bind,
            interface,
            ttl: config.ttl,
        })
    }

    /// Drop group membership and close the socket
    pub fn leave(self) {
        let result = match self.group.ip() {
            IpAddr::V4(group_ip) => self
                .socket
                .leave_multicast_v4(&group_ip, &self.interface.unwrap_or(Ipv4Addr::UNSPECIFIED)),
            IpAddr::V6(group_ip) => self.socket.leave_multicast_v6(&group_ip, 0),
        };

        if let Err(e) = result {
            tracing::warn!("Failed to leave multicast group {}: {}", self.group, e);
        }
        tracing::info!("Left multicast group {}", self.group);
    }

    /// Send one datagram to the group
    pub fn send(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.socket
            .send_to(bytes, self.group)
            .map_err(TransportError::Send)
    }

    /// Whether a datagram is waiting. `None` waits forever, `Some(ZERO)` polls.
    pub fn poll_readable(&self, timeout: Option<Duration>) -> Result<bool, TransportError> {
        let mode = match timeout {
            Some(t) if t.is_zero() => self.socket.set_nonblocking(true),
            other => self
                .socket
                .set_nonblocking(false)
                .and_then(|_| self.socket.set_read_timeout(other)),
        };
        mode.map_err(TransportError::Receive)?;

        let mut probe = [0u8; 1];
        match self.socket.peek_from(&mut probe) {
            Ok(_) => Ok(true),
            Err(e) if is_message_size(&e) => Ok(true),
            Err(e) if is_timeout(&e) => Ok(false),
            Err(e) => Err(TransportError::Receive(e)),
        }
    }

    /// Receive one datagram into `buf`, returning its length.
    ///
    /// The datagram is peeked before it is dequeued. One that fills `buf`
    /// completely cannot be told apart from a longer one, so it is reported
    /// as [`TransportError::Truncated`] and left queued: grow `buf` and call
    /// again, or drop it with [`discard`](Self::discard).
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let capacity = buf.len();
        match self.socket.peek_from(buf) {
            Ok((len, _)) if len < capacity => {}
            Ok(_) => return Err(TransportError::Truncated { capacity }),
            Err(e) if is_message_size(&e) => return Err(TransportError::Truncated { capacity }),
            Err(e) => return Err(TransportError::Receive(e)),
        }

        self.socket
            .recv_from(buf)
            .map(|(len, _)| len)
            .map_err(TransportError::Receive)
    }

    /// Dequeue the next datagram without keeping any of it
    pub fn discard(&self) -> Result<(), TransportError> {
        let mut sink = [0u8; 1];
        match self.socket.recv_from(&mut sink) {
            Ok(_) => Ok(()),
            Err(e) if is_message_size(&e) => Ok(()),
            Err(e) => Err(TransportError::Receive(e)),
        }
    }

    /// Resolved group address
    pub fn group(&self) -> SocketAddr {
        self.group
    }

    /// Resolved bind address
    pub fn bind_address(&self) -> SocketAddr {
        self.bind
    }

    pub fn interface(&self) -> Option<Ipv4Addr> {
        self.interface
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }
}

fn resolve_all(host: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::Resolution {
            address: host.to_string(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(TransportError::Resolution {
            address: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        });
    }
    Ok(addrs)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    resolve_all(host, port).map(|addrs| addrs[0])
}

/// First address for `host` in the same family as `group`
fn resolve_matching(host: &str, port: u16, group: &SocketAddr) -> Result<SocketAddr, TransportError> {
    resolve_all(host, port)?
        .into_iter()
        .find(|addr| addr.is_ipv4() == group.is_ipv4())
        .ok_or_else(|| TransportError::Resolution {
            address: host.to_string(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "bind address family does not match the group",
            ),
        })
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(windows)]
fn is_message_size(err: &io::Error) -> bool {
    // WSAEMSGSIZE
    err.raw_os_error() == Some(10040)
}

#[cfg(not(windows))]
fn is_message_size(_err: &io::Error) -> bool {
    false
}
