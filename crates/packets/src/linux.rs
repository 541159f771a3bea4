use crate::{
    default_read_deadline, get_read_timeout, parse_echo_reply, parse_reply_frame, resolve,
    EchoSink, ReadInterrupt, ReplyEvent, ReplySource, TransportConfig, TransportHandle,
};
use libc::{
    AF_INET, AF_PACKET, ETH_P_ALL, IPPROTO_ICMP, IP_RECVTTL, IP_TTL, SOCK_DGRAM, SOCK_NONBLOCK,
    SOCK_RAW, SOL_SOCKET, SO_ATTACH_FILTER, SO_BINDTODEVICE,
};
use pingmux_common::PingError;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

const ETH_P_ALL_NETWORK: i32 = (ETH_P_ALL as u16).to_be() as i32;
const READ_BUFFER_LEN: usize = 65536;

/// Opens the datagram realization: one `SOCK_DGRAM`/`IPPROTO_ICMP`
/// socket serving as both sink and source.
pub(crate) fn open_datagram(config: &TransportConfig) -> Result<TransportHandle, PingError> {
    let fd = icmp_socket(SOCK_DGRAM)?;
    // The kernel rewrites every outgoing echo id to the socket's bound
    // ident and demuxes replies by it. Bind the ident callers will put
    // in their packets, or learn the one the kernel assigned instead.
    let echo_id = bind_echo_ident(&fd, config.requested_id)?;
    set_socket_option(&fd, libc::IPPROTO_IP, IP_RECVTTL, 1, "IP_RECVTTL")?;
    set_socket_option(
        &fd,
        libc::IPPROTO_IP,
        IP_TTL,
        config.default_ttl as libc::c_int,
        "IP_TTL",
    )?;
    if let Some(device) = config.interface.as_deref() {
        bind_to_device(&fd, device)?;
    }
    let fd = Arc::new(fd);
    Ok(TransportHandle {
        sink: Box::new(IcmpSink {
            fd: fd.clone(),
            current_ttl: config.default_ttl,
            default_ttl: config.default_ttl,
        }),
        source: Box::new(DgramSource {
            fd: fd.clone(),
            buffer: vec![0u8; READ_BUFFER_LEN],
        }),
        interrupt: Box::new(SocketInterrupt { fd }),
        echo_id,
        device: config.interface.clone(),
    })
}

/// Opens the capture realization: a raw ICMP socket for sending and an
/// `AF_PACKET` socket with a BPF filter for replies.
pub(crate) fn open_capture(config: &TransportConfig) -> Result<TransportHandle, PingError> {
    let device = resolve::pick_capture_device(config.peer, config.interface.as_deref())
        .ok_or(PingError::NoCaptureDevice)?;
    let send_fd = icmp_socket(SOCK_RAW)?;
    set_socket_option(
        &send_fd,
        libc::IPPROTO_IP,
        IP_TTL,
        config.default_ttl as libc::c_int,
        "IP_TTL",
    )?;
    let source = CaptureSource::open(&device, config.peer)?;
    let capture_fd = source.fd.clone();
    Ok(TransportHandle {
        sink: Box::new(IcmpSink {
            fd: Arc::new(send_fd),
            current_ttl: config.default_ttl,
            default_ttl: config.default_ttl,
        }),
        // Raw sockets send the id as given; no rewrite to account for.
        echo_id: config.requested_id,
        source: Box::new(source),
        interrupt: Box::new(SocketInterrupt { fd: capture_fd }),
        device: Some(device),
    })
}

/// Send side shared by both realizations. Writes bare ICMP messages and
/// flips the socket TTL only when a probe asks for a different one.
struct IcmpSink {
    fd: Arc<OwnedFd>,
    current_ttl: u8,
    default_ttl: u8,
}

impl EchoSink for IcmpSink {
    fn send(&mut self, target: Ipv4Addr, packet: &[u8], ttl: Option<u8>) -> Result<(), PingError> {
        let effective = ttl.unwrap_or(self.default_ttl);
        if effective != self.current_ttl {
            set_socket_option(
                &self.fd,
                libc::IPPROTO_IP,
                IP_TTL,
                effective as libc::c_int,
                "IP_TTL",
            )?;
            self.current_ttl = effective;
        }
        let addr = sockaddr_v4(target);
        loop {
            let rc = unsafe {
                libc::sendto(
                    self.fd.as_raw_fd(),
                    packet.as_ptr() as *const libc::c_void,
                    packet.len(),
                    0,
                    &addr as *const _ as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                continue;
            }
            return Err(PingError::SendFailed(err));
        }
    }
}

/// Reply stream over the datagram socket. The kernel delivers only echo
/// replies for this socket's ident and strips the IP header, so the TTL
/// arrives as ancillary data.
struct DgramSource {
    fd: Arc<OwnedFd>,
    buffer: Vec<u8>,
}

impl ReplySource for DgramSource {
    fn recv(&mut self, deadline: Option<Instant>) -> Result<ReplyEvent, PingError> {
        let deadline = deadline.unwrap_or_else(default_read_deadline);
        loop {
            if Instant::now() >= deadline {
                return Err(PingError::ReadTimeout);
            }
            if !poll_readable(self.fd.as_raw_fd(), get_read_timeout(deadline))? {
                continue;
            }
            let (len, raw_ttl) = match recv_with_ttl(self.fd.as_raw_fd(), &mut self.buffer) {
                Ok(result) => result,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            };
            if len == 0 {
                return Err(PingError::Internal("reply stream closed".into()));
            }
            let received_at = Instant::now();
            let reply = match parse_echo_reply(&self.buffer[..len]) {
                Ok(reply) => reply,
                Err(err) => {
                    trace!("skipping non-reply datagram: {err}");
                    continue;
                }
            };
            // IP_RECVTTL reports the hop count after the local delivery
            // decrement; put that hop back.
            let ttl = raw_ttl.map(|value| value + 1).unwrap_or(-1);
            return Ok(ReplyEvent {
                id: reply.id,
                seq: reply.seq,
                ttl,
                received_at,
            });
        }
    }
}

/// Passive `AF_PACKET` reply stream bound to one device, with a classic
/// BPF program keeping everything but ICMP out of the queue.
struct CaptureSource {
    fd: Arc<OwnedFd>,
    buffer: Vec<u8>,
}

impl CaptureSource {
    fn open(device: &str, peer: Option<Ipv4Addr>) -> Result<Self, PingError> {
        let fd = unsafe { libc::socket(AF_PACKET, SOCK_RAW | SOCK_NONBLOCK, ETH_P_ALL_NETWORK) };
        if fd < 0 {
            return Err(PingError::CaptureOpen {
                device: device.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        bind_capture(&fd, device)?;
        let filter = match peer {
            Some(peer) => icmp_host_filter(peer).to_vec(),
            None => icmp_filter().to_vec(),
        };
        set_bpf_and_drain(&fd, &filter).map_err(|source| PingError::SocketOption {
            option: "SO_ATTACH_FILTER",
            source,
        })?;
        Ok(Self {
            fd: Arc::new(fd),
            buffer: vec![0u8; READ_BUFFER_LEN],
        })
    }
}

impl ReplySource for CaptureSource {
    fn recv(&mut self, deadline: Option<Instant>) -> Result<ReplyEvent, PingError> {
        let deadline = deadline.unwrap_or_else(default_read_deadline);
        loop {
            if Instant::now() >= deadline {
                return Err(PingError::ReadTimeout);
            }
            if !poll_readable(self.fd.as_raw_fd(), get_read_timeout(deadline))? {
                continue;
            }
            let rc = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    self.buffer.as_mut_ptr() as *mut libc::c_void,
                    self.buffer.len(),
                    0,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    continue;
                }
                return Err(err.into());
            }
            if rc == 0 {
                return Err(PingError::Internal("capture stream closed".into()));
            }
            let received_at = Instant::now();
            match parse_reply_frame(&self.buffer[..rc as usize]) {
                Ok(captured) => {
                    return Ok(ReplyEvent {
                        id: captured.id,
                        seq: captured.seq,
                        // Captured frames carry the genuine IPv4 TTL.
                        ttl: captured.ttl as i32,
                        received_at,
                    });
                }
                Err(err) => {
                    trace!("skipping captured frame: {err}");
                    continue;
                }
            }
        }
    }
}

/// Shuts the shared socket down so a blocked reader returns right away.
/// Packet sockets ignore the shutdown; their reader falls back to the
/// poll tick.
struct SocketInterrupt {
    fd: Arc<OwnedFd>,
}

impl ReadInterrupt for SocketInterrupt {
    fn interrupt(&self) {
        unsafe {
            libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

fn icmp_socket(kind: libc::c_int) -> Result<OwnedFd, PingError> {
    let fd = unsafe { libc::socket(AF_INET, kind | SOCK_NONBLOCK, IPPROTO_ICMP) };
    if fd < 0 {
        return Err(PingError::SocketCreation(io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn bind_echo_ident(fd: &OwnedFd, requested: u16) -> Result<u16, PingError> {
    if requested != 0 && bind_ident(fd, requested).is_ok() {
        return Ok(requested);
    }
    // Ident taken by another ping socket, or zero, which binds as
    // "kernel's choice" anyway; read back what it picked.
    bind_ident(fd, 0).map_err(PingError::SocketCreation)?;
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd.as_raw_fd(),
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(PingError::SocketCreation(io::Error::last_os_error()));
    }
    Ok(u16::from_be(addr.sin_port))
}

fn bind_ident(fd: &OwnedFd, ident: u16) -> io::Result<()> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = AF_INET as libc::sa_family_t;
    // For ICMP datagram sockets the port field carries the echo ident.
    addr.sin_port = ident.to_be();
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn bind_to_device(fd: &OwnedFd, device: &str) -> Result<(), PingError> {
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_SOCKET,
            SO_BINDTODEVICE,
            device.as_ptr() as *const libc::c_void,
            device.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(PingError::SocketOption {
            option: "SO_BINDTODEVICE",
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn bind_capture(fd: &OwnedFd, device: &str) -> Result<(), PingError> {
    let name = std::ffi::CString::new(device)
        .map_err(|_| PingError::Internal(format!("bad device name: {device}")))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(PingError::CaptureOpen {
            device: device.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = AF_PACKET as libc::sa_family_t;
    addr.sll_protocol = (ETH_P_ALL as u16).to_be();
    addr.sll_ifindex = index as i32;
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(PingError::CaptureOpen {
            device: device.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn set_socket_option(
    fd: &OwnedFd,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
    name: &'static str,
) -> Result<(), PingError> {
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            option,
            &value as *const _ as *const libc::c_void,
            mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(PingError::SocketOption {
            option: name,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn sockaddr_v4(addr: Ipv4Addr) -> libc::sockaddr_in {
    let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
    sockaddr.sin_family = AF_INET as libc::sa_family_t;
    sockaddr.sin_addr = libc::in_addr {
        s_addr: u32::from_be_bytes(addr.octets()).to_be(),
    };
    sockaddr
}

fn poll_readable(fd: RawFd, timeout: Duration) -> Result<bool, PingError> {
    let mut fds = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut fds as *mut _, 1, timeout.as_millis() as i32) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err.into());
    }
    Ok(rc > 0)
}

fn recv_with_ttl(fd: RawFd, buffer: &mut [u8]) -> io::Result<(usize, Option<i32>)> {
    let mut control = [0u8; 64];
    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
        iov_len: buffer.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len() as _;
    let rc = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut ttl = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::IPPROTO_IP && header.cmsg_type == IP_TTL {
            let mut value: libc::c_int = 0;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    &mut value as *mut libc::c_int as *mut u8,
                    mem::size_of::<libc::c_int>(),
                );
            }
            ttl = Some(value);
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }
    Ok((rc as usize, ttl))
}

fn set_bpf(fd: &OwnedFd, filter: &[libc::sock_filter]) -> io::Result<()> {
    let prog = libc::sock_fprog {
        len: filter.len() as u16,
        filter: filter.as_ptr() as *mut libc::sock_filter,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_SOCKET,
            SO_ATTACH_FILTER,
            &prog as *const _ as *const libc::c_void,
            mem::size_of_val(&prog) as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Attaching a filter does not flush packets queued before it existed:
/// install a drop-everything program, drain the queue, then attach the
/// real filter.
fn set_bpf_and_drain(fd: &OwnedFd, filter: &[libc::sock_filter]) -> io::Result<()> {
    set_bpf(fd, &drop_all_filter())?;
    let mut buf = [0u8; 1];
    loop {
        let rc = unsafe {
            libc::recv(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if rc >= 0 {
            continue;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            break;
        }
        return Err(err);
    }
    set_bpf(fd, filter)
}

fn drop_all_filter() -> [libc::sock_filter; 1] {
    [sock_filter(0x6, 0, 0, 0)]
}

// tcpdump -dd 'icmp'.
fn icmp_filter() -> [libc::sock_filter; 6] {
    [
        sock_filter(0x28, 0, 0, 0x0000000c),
        sock_filter(0x15, 0, 3, 0x00000800),
        sock_filter(0x30, 0, 0, 0x00000017),
        sock_filter(0x15, 0, 1, 0x00000001),
        sock_filter(0x6, 0, 0, 0x00040000),
        sock_filter(0x6, 0, 0, 0x00000000),
    ]
}

// tcpdump -dd 'icmp and host <peer>'.
fn icmp_host_filter(peer: Ipv4Addr) -> [libc::sock_filter; 10] {
    let addr = u32::from_be_bytes(peer.octets());
    [
        sock_filter(0x28, 0, 0, 0x0000000c),
        sock_filter(0x15, 0, 7, 0x00000800),
        sock_filter(0x30, 0, 0, 0x00000017),
        sock_filter(0x15, 0, 5, 0x00000001),
        sock_filter(0x20, 0, 0, 0x0000001a),
        sock_filter(0x15, 2, 0, addr),
        sock_filter(0x20, 0, 0, 0x0000001e),
        sock_filter(0x15, 0, 1, addr),
        sock_filter(0x6, 0, 0, 0x00040000),
        sock_filter(0x6, 0, 0, 0x00000000),
    ]
}

const fn sock_filter(code: u16, jt: u8, jf: u8, k: u32) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_preserves_address_octets() {
        let addr = sockaddr_v4(Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(addr.sin_family, AF_INET as libc::sa_family_t);
        assert_eq!(addr.sin_addr.s_addr.to_ne_bytes(), [192, 168, 1, 20]);
    }

    #[test]
    fn host_filter_embeds_peer_address() {
        let filter = icmp_host_filter(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(filter[5].k, 0x0a010203);
        assert_eq!(filter[7].k, 0x0a010203);
    }
}
