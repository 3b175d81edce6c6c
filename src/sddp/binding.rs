/*!
A `SocketBinding` owns one UDP socket bound to (or sending from) a single
local network interface. Multicast-receiving bindings are wildcard-bound
on the multicast port and join the group on the requested interface;
unicast (client) bindings bind the interface address on an ephemeral port
and never join a group.
*/

use pnet::datalink;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

use super::constants;
use crate::error::Error;

/// One UDP socket bound to a single local interface address.
#[derive(Debug)]
pub struct SocketBinding {
    index: AtomicI64,
    unicast_addr: SocketAddr,
    display_name: String,
    socket: Arc<UdpSocket>,
}

impl SocketBinding {
    /// The index assigned when this binding was attached to an engine, or
    /// -1 if it has not yet been attached.
    pub fn index(&self) -> i64 {
        self.index.load(Ordering::SeqCst)
    }

    pub(crate) fn attach(&self, index: i64) {
        self.index.store(index, Ordering::SeqCst);
    }

    /// The interface IP and port this binding represents, distinct from
    /// the wildcard address the underlying socket may be bound to.
    pub fn unicast_addr(&self) -> SocketAddr {
        self.unicast_addr
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr).await
    }

    /// Create a multicast-receiving binding for `bind_ip`: wildcard-bound
    /// on `multicast_port`, joined to `multicast_addr` on `bind_ip`.
    pub fn new_multicast_receiver(
        bind_ip: IpAddr,
        multicast_addr: IpAddr,
        multicast_port: u16,
    ) -> Result<Self, Error> {
        let domain = if multicast_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(not(target_os = "windows"))]
        socket.set_reuse_port(true)?;
        disable_multicast_all(&socket, multicast_addr.is_ipv6())?;

        let wildcard: SocketAddr = if multicast_addr.is_ipv6() {
            (IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 0]), multicast_port).into()
        } else {
            (IpAddr::from([0u8, 0, 0, 0]), multicast_port).into()
        };
        socket.bind(&wildcard.into())?;

        match (multicast_addr, bind_ip) {
            (IpAddr::V4(group), IpAddr::V4(iface)) => {
                socket.join_multicast_v4(&group, &iface)?;
            }
            (IpAddr::V6(group), IpAddr::V6(iface)) => {
                socket.join_multicast_v6(&group, interface_index_for_v6(&iface))?;
            }
            _ => {
                return Err(Error::NetworkTransport(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "multicast group and bind address families must match",
                )))
            }
        }

        socket.set_nonblocking(true)?;
        let tokio_socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            index: AtomicI64::new(-1),
            unicast_addr: SocketAddr::new(bind_ip, multicast_port),
            display_name: format!("{}:{} (multicast)", bind_ip, multicast_port),
            socket: Arc::new(tokio_socket),
        })
    }

    /// Create a unicast, send/receive-only binding for `bind_ip` on an
    /// ephemeral port, used by the client for SEARCH and its responses.
    pub fn new_unicast(bind_ip: IpAddr) -> Result<Self, Error> {
        let domain = if bind_ip.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let addr: SocketAddr = (bind_ip, 0).into();
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        let tokio_socket = UdpSocket::from_std(socket.into())?;
        let unicast_addr = tokio_socket.local_addr()?;
        Ok(Self {
            index: AtomicI64::new(-1),
            unicast_addr,
            display_name: format!("{} (unicast)", unicast_addr),
            socket: Arc::new(tokio_socket),
        })
    }
}

/// On Linux, disable `IP_MULTICAST_ALL`/`IPV6_MULTICAST_ALL` so each
/// wildcard-bound socket only receives traffic for the groups it
/// explicitly joined on the interface it is bound to. Without this,
/// multiple per-interface bindings on one host would each see every
/// interface's multicast traffic, yielding duplicate deliveries.
#[cfg(target_os = "linux")]
fn disable_multicast_all(socket: &Socket, is_ipv6: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let value: libc::c_int = 0;
    let (level, optname) = if is_ipv6 {
        (libc::IPPROTO_IPV6, constants::IPV6_MULTICAST_ALL)
    } else {
        (libc::IPPROTO_IP, constants::IP_MULTICAST_ALL)
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn disable_multicast_all(_socket: &Socket, _is_ipv6: bool) -> io::Result<()> {
    Ok(())
}

/// The OS interface index carrying `bind_ip`, for `join_multicast_v6`.
/// Index 0 ("unspecified", let the kernel pick) is returned if no local
/// interface carries this address, which can only happen if the address
/// enumerated by the caller has since disappeared (e.g. an interface was
/// unplugged between enumeration and bind).
fn interface_index_for_v6(bind_ip: &Ipv6Addr) -> u32 {
    for interface in datalink::interfaces() {
        let carries_addr = interface
            .ips
            .iter()
            .any(|ip_network| ip_network.ip() == IpAddr::V6(*bind_ip));
        if carries_addr {
            return interface.index;
        }
    }
    0
}
