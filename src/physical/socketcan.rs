//! Linux raw CAN sockets.
//!
//! Requires the interface to be configured and up beforehand:
//!
//! ```text
//! ip link set can0 type can bitrate 500000
//! ip link set can0 up
//! ```
//!
//! The port is registered with the tokio reactor, so [`Backend::assign`]
//! must run inside a runtime with I/O enabled.

use async_trait::async_trait;
use std::io;
use std::mem::{size_of, zeroed};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;

use super::{aborted, Backend, CloseSignal, Port};
use crate::data_link::{ErrorClass, WIRE_FRAME_SIZE};

/// Backend issuing the real system calls
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCanBackend;

/// A `PF_CAN` raw socket that is not yet registered for async I/O.
/// Dropping it closes the descriptor.
#[derive(Debug)]
pub struct RawCanSocket {
    fd: OwnedFd,
}

impl AsRawFd for RawCanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Backend for RawCanBackend {
    type Socket = RawCanSocket;
    type Port = RawCanPort;

    fn create_socket(&self) -> io::Result<RawCanSocket> {
        let fd = unsafe {
            libc::socket(
                libc::PF_CAN,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::CAN_RAW,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(RawCanSocket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn interface_index(&self, _socket: &RawCanSocket, device: &str) -> io::Result<u32> {
        Ok(nix::net::if_::if_nametoindex(device)?)
    }

    fn set_error_filter(&self, socket: &RawCanSocket, mask: ErrorClass) -> io::Result<()> {
        let err_mask: libc::can_err_mask_t = mask.bits();
        let rv = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_ERR_FILTER,
                &err_mask as *const libc::can_err_mask_t as *const libc::c_void,
                size_of::<libc::can_err_mask_t>() as libc::socklen_t,
            )
        };
        if rv != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn bind(&self, socket: &RawCanSocket, if_index: u32) -> io::Result<()> {
        let mut addr: libc::sockaddr_can = unsafe { zeroed() };
        addr.can_family = libc::AF_CAN as libc::sa_family_t;
        addr.can_ifindex = if_index as libc::c_int;

        let rv = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_can as *const libc::sockaddr,
                size_of::<libc::sockaddr_can>() as libc::socklen_t,
            )
        };
        if rv != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn assign(&self, socket: RawCanSocket) -> io::Result<RawCanPort> {
        set_nonblocking(socket.as_raw_fd())?;
        let handle =
            Handle::try_current().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let _enter = handle.enter();
        let io = AsyncFd::new(socket.fd)?;
        Ok(RawCanPort {
            io,
            signal: CloseSignal::default(),
        })
    }
}

/// A bound raw CAN socket registered with the tokio reactor
#[derive(Debug)]
pub struct RawCanPort {
    io: AsyncFd<OwnedFd>,
    signal: CloseSignal,
}

impl RawCanPort {
    async fn read_ready(&self, buf: &mut [u8; WIRE_FRAME_SIZE]) -> io::Result<usize> {
        loop {
            let mut guard = self.io.readable().await?;
            match guard.try_io(|inner| read_fd(inner.as_raw_fd(), &mut buf[..])) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl Port for RawCanPort {
    async fn read_frame(&self, buf: &mut [u8; WIRE_FRAME_SIZE]) -> io::Result<usize> {
        tokio::select! {
            biased;
            _ = self.signal.closed() => Err(aborted()),
            result = self.read_ready(buf) => result,
        }
    }

    fn write_frame(&self, buf: &[u8; WIRE_FRAME_SIZE], timeout: Duration) -> io::Result<usize> {
        let fd = self.io.as_raw_fd();
        let deadline = Instant::now() + timeout;
        loop {
            if self.signal.is_closed() {
                return Err(aborted());
            }

            let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {}
                _ => return Err(err),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !poll_fd(fd, libc::POLLOUT, remaining)? {
                return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
            }
        }
    }

    fn close(&self) {
        self.signal.close();
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn poll_fd(fd: RawFd, events: i16, timeout: Duration) -> io::Result<bool> {
    let mut fds = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().clamp(1, i32::MAX as u128) as i32;
    loop {
        let res = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if res >= 0 {
            return Ok(res > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
