//! Physical access to the CAN bus.
//!
//! The driver never issues system calls itself. Everything that touches the
//! operating system goes through two traits:
//!
//! - [`Backend`] performs the individual setup steps of opening a bus socket:
//!   creating it, resolving the interface, installing the error filter,
//!   binding, and handing the descriptor to the async runtime.
//! - [`Port`] is the bound socket produced by the last step. It reads frames
//!   asynchronously and writes them synchronously, and can be closed to abort
//!   an outstanding read.
//!
//! [`socketcan`] implements both over a Linux `PF_CAN` raw socket; `mock`
//! (feature `mock`) keeps everything in memory for tests.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use socketcan_driver::driver::SocketCanDriver;
//! use socketcan_driver::physical::socketcan::RawCanBackend;
//! use socketcan_driver::transport::TransportBase;
//!
//! let base = Arc::new(TransportBase::new(
//!     |frame: &socketcan_driver::types::Frame| println!("{frame:?}"),
//!     |_: &socketcan_driver::types::State| {},
//! ));
//! let driver = SocketCanDriver::new(RawCanBackend, base);
//! # let _ = driver;
//! ```

#[cfg(any(test, feature = "mock"))]
pub mod mock;
#[cfg(target_os = "linux")]
pub mod socketcan;

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::data_link::{ErrorClass, WIRE_FRAME_SIZE};

/// Platform access used to open a bus socket, one method per setup step.
///
/// A `Socket` that is dropped must release its descriptor, so an aborted
/// setup never leaks.
pub trait Backend: Send + Sync + 'static {
    type Socket: Send;
    type Port: Port;

    fn create_socket(&self) -> io::Result<Self::Socket>;
    fn interface_index(&self, socket: &Self::Socket, device: &str) -> io::Result<u32>;
    fn set_error_filter(&self, socket: &Self::Socket, mask: ErrorClass) -> io::Result<()>;
    fn bind(&self, socket: &Self::Socket, if_index: u32) -> io::Result<()>;
    /// Hands the bound socket to the async I/O layer
    fn assign(&self, socket: Self::Socket) -> io::Result<Self::Port>;
}

/// A bound bus socket.
#[async_trait]
pub trait Port: Send + Sync + 'static {
    /// Waits for and reads one frame. Fails with `ECANCELED` once the port is closed.
    async fn read_frame(&self, buf: &mut [u8; WIRE_FRAME_SIZE]) -> io::Result<usize>;

    /// Writes one frame, blocking the calling thread up to `timeout` while
    /// the socket is not writable.
    fn write_frame(&self, buf: &[u8; WIRE_FRAME_SIZE], timeout: Duration) -> io::Result<usize>;

    /// Aborts any outstanding read. The descriptor is released on drop.
    fn close(&self);
}

/// One-shot close flag that wakes every pending reader.
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent close is not missed
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// Error returned by reads and writes on a closed port
pub fn aborted() -> io::Error {
    io::Error::from_raw_os_error(libc::ECANCELED)
}

pub fn is_aborted(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ECANCELED)
}
