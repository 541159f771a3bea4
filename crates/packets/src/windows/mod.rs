//! Windows realization: raw ICMP sending with an `SIO_RCVALL` snoop
//! source for replies, plus `IcmpSendEcho` for local destinations.
//!
//! The snoop socket binds one local interface address and receives every
//! inbound IP datagram on it, header included, so replies carry their
//! true TTL just like the Linux capture path.

use crate::{
    default_read_deadline, get_read_timeout, parse_reply_packet, EchoSink, ReadInterrupt,
    ReplyEvent, ReplySource, TransportConfig, TransportHandle, TIMESTAMP_LEN,
};
use pingmux_common::PingError;
use std::ffi::c_void;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::trace;
use windows_sys::Win32::NetworkManagement::IpHelper::{
    GetBestInterface, IcmpCloseHandle, IcmpCreateFile, IcmpSendEcho, ICMP_ECHO_REPLY,
    IP_REQ_TIMED_OUT, IP_SUCCESS,
};
use windows_sys::Win32::Networking::WinSock::{
    bind, closesocket, ioctlsocket, recv, sendto, setsockopt, shutdown, socket, WSAGetLastError,
    WSAIoctl, WSAPoll, WSAStartup, AF_INET, FIONBIO, INVALID_SOCKET, IPPROTO_ICMP, IPPROTO_IP,
    IP_TTL, POLLRDNORM, SD_BOTH, SIO_RCVALL, SOCKADDR, SOCKADDR_IN, SOCKET, SOCKET_ERROR,
    SOCK_RAW, WSADATA, WSAEINTR, WSAEWOULDBLOCK, WSAPOLLFD,
};

const RCVALL_ON: u32 = 1;
const READ_BUFFER_LEN: usize = 65536;
const INVALID_ICMP_HANDLE: isize = -1;

/// Opens the Windows realization: a raw ICMP socket for sending and a
/// receive-all snoop socket bound to the chosen interface address for
/// replies. Both need administrator rights.
pub(crate) fn open_capture(config: &TransportConfig) -> Result<TransportHandle, PingError> {
    ensure_winsock()?;
    let (bind_ip, device) = snoop_bind_addr(config)?;
    let send_socket = raw_icmp_socket(config.default_ttl)?;
    let snoop_socket = Arc::new(open_snoop(bind_ip)?);
    Ok(TransportHandle {
        sink: Box::new(RawIcmpSink {
            socket: Arc::new(send_socket),
            current_ttl: config.default_ttl,
            default_ttl: config.default_ttl,
        }),
        source: Box::new(SnoopSource {
            socket: snoop_socket.clone(),
            buffer: vec![0u8; READ_BUFFER_LEN],
        }),
        interrupt: Box::new(SocketInterrupt {
            socket: snoop_socket,
        }),
        // Raw sockets send the id as given; nothing rewrites it.
        echo_id: config.requested_id,
        device: Some(device.unwrap_or_else(|| bind_ip.to_string())),
    })
}

/// One echo through `IcmpSendEcho`, for destinations on this host where
/// loopback traffic never reaches the snoop socket. Returns the round
/// trip in milliseconds and the reply TTL.
pub fn local_echo(
    dest: Ipv4Addr,
    timeout: Duration,
    payload_size: usize,
) -> Result<(i64, i32), PingError> {
    let handle = unsafe { IcmpCreateFile() };
    if handle == INVALID_ICMP_HANDLE {
        return Err(PingError::SocketCreation(io::Error::last_os_error()));
    }
    let data = vec![0u8; TIMESTAMP_LEN + payload_size];
    let mut reply_buffer = vec![0u8; mem::size_of::<ICMP_ECHO_REPLY>() + data.len() + 8];
    let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
    let count = unsafe {
        IcmpSendEcho(
            handle,
            u32::from_be_bytes(dest.octets()).to_be(),
            data.as_ptr() as *const c_void,
            data.len() as u16,
            std::ptr::null(),
            reply_buffer.as_mut_ptr() as *mut c_void,
            reply_buffer.len() as u32,
            timeout_ms.max(1),
        )
    };
    let result = if count == 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(IP_REQ_TIMED_OUT as i32) {
            Err(PingError::ReadTimeout)
        } else {
            Err(PingError::Internal(format!("IcmpSendEcho failed: {err}")))
        }
    } else {
        let reply = unsafe { &*(reply_buffer.as_ptr() as *const ICMP_ECHO_REPLY) };
        if reply.Status == IP_SUCCESS {
            // The helper also reports the TTL one hop short.
            Ok((reply.RoundTripTime as i64, reply.Options.Ttl as i32 + 1))
        } else {
            Err(PingError::Internal(format!(
                "echo failed with status {}",
                reply.Status
            )))
        }
    };
    unsafe {
        IcmpCloseHandle(handle);
    }
    result
}

/// Closes the socket when the last sink or source drops.
struct RawSocket(SOCKET);

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            closesocket(self.0);
        }
    }
}

struct RawIcmpSink {
    socket: Arc<RawSocket>,
    current_ttl: u8,
    default_ttl: u8,
}

impl EchoSink for RawIcmpSink {
    fn send(&mut self, target: Ipv4Addr, packet: &[u8], ttl: Option<u8>) -> Result<(), PingError> {
        let effective = ttl.unwrap_or(self.default_ttl);
        if effective != self.current_ttl {
            set_ttl(&self.socket, effective)?;
            self.current_ttl = effective;
        }
        let addr = sockaddr_v4(target, 0);
        loop {
            let rc = unsafe {
                sendto(
                    self.socket.0,
                    packet.as_ptr(),
                    packet.len() as i32,
                    0,
                    &addr as *const SOCKADDR_IN as *const SOCKADDR,
                    mem::size_of::<SOCKADDR_IN>() as i32,
                )
            };
            if rc != SOCKET_ERROR {
                return Ok(());
            }
            let code = unsafe { WSAGetLastError() };
            if code == WSAEWOULDBLOCK {
                continue;
            }
            return Err(PingError::SendFailed(io::Error::from_raw_os_error(code)));
        }
    }
}

/// Reply stream over the receive-all socket. Buffers arrive as complete
/// IPv4 datagrams, header first.
struct SnoopSource {
    socket: Arc<RawSocket>,
    buffer: Vec<u8>,
}

impl ReplySource for SnoopSource {
    fn recv(&mut self, deadline: Option<Instant>) -> Result<ReplyEvent, PingError> {
        let deadline = deadline.unwrap_or_else(default_read_deadline);
        loop {
            if Instant::now() >= deadline {
                return Err(PingError::ReadTimeout);
            }
            if !poll_readable(self.socket.0, get_read_timeout(deadline))? {
                continue;
            }
            let rc = unsafe {
                recv(
                    self.socket.0,
                    self.buffer.as_mut_ptr(),
                    self.buffer.len() as i32,
                    0,
                )
            };
            if rc == SOCKET_ERROR {
                let code = unsafe { WSAGetLastError() };
                if code == WSAEWOULDBLOCK || code == WSAEINTR {
                    continue;
                }
                return Err(PingError::Internal(format!("snoop read failed: {code}")));
            }
            if rc == 0 {
                return Err(PingError::Internal("snoop stream closed".into()));
            }
            let received_at = Instant::now();
            match parse_reply_packet(&self.buffer[..rc as usize]) {
                Ok(captured) => {
                    return Ok(ReplyEvent {
                        id: captured.id,
                        seq: captured.seq,
                        // Snooped datagrams carry the genuine IPv4 TTL.
                        ttl: captured.ttl as i32,
                        received_at,
                    });
                }
                Err(err) => {
                    trace!("skipping snooped datagram: {err}");
                    continue;
                }
            }
        }
    }
}

struct SocketInterrupt {
    socket: Arc<RawSocket>,
}

impl ReadInterrupt for SocketInterrupt {
    fn interrupt(&self) {
        unsafe {
            shutdown(self.socket.0, SD_BOTH);
        }
    }
}

fn ensure_winsock() -> Result<(), PingError> {
    static STARTED: OnceLock<i32> = OnceLock::new();
    let rc = *STARTED.get_or_init(|| {
        let mut data: WSADATA = unsafe { mem::zeroed() };
        unsafe { WSAStartup(0x0202, &mut data) }
    });
    if rc != 0 {
        return Err(PingError::SocketCreation(io::Error::from_raw_os_error(rc)));
    }
    Ok(())
}

fn raw_icmp_socket(default_ttl: u8) -> Result<RawSocket, PingError> {
    let raw = unsafe { socket(AF_INET as i32, SOCK_RAW as i32, IPPROTO_ICMP as i32) };
    if raw == INVALID_SOCKET {
        return Err(PingError::SocketCreation(wsa_error("socket failed")));
    }
    let socket = RawSocket(raw);
    set_nonblocking(&socket)?;
    set_ttl(&socket, default_ttl)?;
    Ok(socket)
}

fn open_snoop(bind_ip: Ipv4Addr) -> Result<RawSocket, PingError> {
    let raw = unsafe { socket(AF_INET as i32, SOCK_RAW as i32, IPPROTO_IP as i32) };
    if raw == INVALID_SOCKET {
        return Err(PingError::CaptureOpen {
            device: bind_ip.to_string(),
            source: wsa_error("socket failed"),
        });
    }
    let socket = RawSocket(raw);
    let addr = sockaddr_v4(bind_ip, 0);
    let rc = unsafe {
        bind(
            socket.0,
            &addr as *const SOCKADDR_IN as *const SOCKADDR,
            mem::size_of::<SOCKADDR_IN>() as i32,
        )
    };
    if rc == SOCKET_ERROR {
        return Err(PingError::CaptureOpen {
            device: bind_ip.to_string(),
            source: wsa_error("bind failed"),
        });
    }
    let option: u32 = RCVALL_ON;
    let mut returned = 0u32;
    let rc = unsafe {
        WSAIoctl(
            socket.0,
            SIO_RCVALL,
            &option as *const u32 as *const c_void,
            mem::size_of::<u32>() as u32,
            std::ptr::null_mut(),
            0,
            &mut returned,
            std::ptr::null_mut(),
            None,
        )
    };
    if rc == SOCKET_ERROR {
        return Err(PingError::SocketOption {
            option: "SIO_RCVALL",
            source: wsa_error("WSAIoctl failed"),
        });
    }
    set_nonblocking(&socket)?;
    Ok(socket)
}

/// Picks the local address the snoop socket binds, and the interface
/// name it belongs to when one is known. An explicit hint matches by
/// name substring; otherwise the forwarding table decides.
fn snoop_bind_addr(config: &TransportConfig) -> Result<(Ipv4Addr, Option<String>), PingError> {
    let interfaces = if_addrs::get_if_addrs().unwrap_or_default();
    if let Some(hint) = config.interface.as_deref() {
        return interfaces
            .iter()
            .find(|iface| iface.name.contains(hint) && matches!(iface.ip(), IpAddr::V4(_)))
            .and_then(|iface| match iface.ip() {
                IpAddr::V4(ip) => Some((ip, Some(iface.name.clone()))),
                IpAddr::V6(_) => None,
            })
            .ok_or(PingError::NoCaptureDevice);
    }
    if let Some(peer) = config.peer {
        if let Some(index) = best_interface_index(peer) {
            if let Some(iface) = interfaces
                .iter()
                .find(|iface| iface.index == Some(index) && matches!(iface.ip(), IpAddr::V4(_)))
            {
                if let IpAddr::V4(ip) = iface.ip() {
                    return Ok((ip, Some(iface.name.clone())));
                }
            }
        }
        if let Some(ip) = crate::resolve::route_source_addr(peer) {
            let name = interfaces
                .iter()
                .find(|iface| iface.ip() == IpAddr::V4(ip))
                .map(|iface| iface.name.clone());
            return Ok((ip, name));
        }
    }
    interfaces
        .iter()
        .find(|iface| !iface.is_loopback() && matches!(iface.ip(), IpAddr::V4(_)))
        .and_then(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some((ip, Some(iface.name.clone()))),
            IpAddr::V6(_) => None,
        })
        .ok_or(PingError::NoCaptureDevice)
}

fn best_interface_index(dest: Ipv4Addr) -> Option<u32> {
    let mut index = 0u32;
    let rc = unsafe { GetBestInterface(u32::from_be_bytes(dest.octets()).to_be(), &mut index) };
    if rc == 0 {
        Some(index)
    } else {
        None
    }
}

fn poll_readable(socket: SOCKET, timeout: Duration) -> Result<bool, PingError> {
    let mut fds = WSAPOLLFD {
        fd: socket,
        events: POLLRDNORM as i16,
        revents: 0,
    };
    let rc = unsafe { WSAPoll(&mut fds, 1, timeout.as_millis() as i32) };
    if rc == SOCKET_ERROR {
        let code = unsafe { WSAGetLastError() };
        if code == WSAEINTR {
            return Ok(false);
        }
        return Err(PingError::Internal(format!("WSAPoll failed: {code}")));
    }
    Ok(rc > 0)
}

fn set_nonblocking(socket: &RawSocket) -> Result<(), PingError> {
    let mut enabled: u32 = 1;
    let rc = unsafe { ioctlsocket(socket.0, FIONBIO, &mut enabled) };
    if rc == SOCKET_ERROR {
        return Err(PingError::SocketOption {
            option: "FIONBIO",
            source: wsa_error("ioctlsocket failed"),
        });
    }
    Ok(())
}

fn set_ttl(socket: &RawSocket, ttl: u8) -> Result<(), PingError> {
    let value = ttl as i32;
    let rc = unsafe {
        setsockopt(
            socket.0,
            IPPROTO_IP as i32,
            IP_TTL,
            &value as *const i32 as *const u8,
            mem::size_of::<i32>() as i32,
        )
    };
    if rc == SOCKET_ERROR {
        return Err(PingError::SocketOption {
            option: "IP_TTL",
            source: wsa_error("setsockopt failed"),
        });
    }
    Ok(())
}

fn sockaddr_v4(addr: Ipv4Addr, port: u16) -> SOCKADDR_IN {
    let mut sockaddr: SOCKADDR_IN = unsafe { mem::zeroed() };
    sockaddr.sin_family = AF_INET;
    sockaddr.sin_port = port.to_be();
    sockaddr.sin_addr.S_un.S_addr = u32::from_be_bytes(addr.octets()).to_be();
    sockaddr
}

fn wsa_error(message: &str) -> io::Error {
    let err = unsafe { WSAGetLastError() };
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", message, err))
}
