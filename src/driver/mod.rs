//! SocketCAN driver core.
//!
//! [`SocketCanDriver`] opens a raw CAN socket through a [`Backend`], reports
//! state and errors to a shared [`TransportBase`], translates frames between
//! the kernel layout and [`Frame`], and recovers by tearing the socket down
//! and opening it again.
//!
//! Sends are synchronous and serialized by a lock. Receives are asynchronous
//! and are re-armed by the base. Both directions use the socket concurrently.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use socketcan_driver::driver::SocketCanDriver;
//! use socketcan_driver::physical::socketcan::RawCanBackend;
//! use socketcan_driver::transport::{spawn_receiver, TransportBase};
//! use socketcan_driver::types::{Frame, State};
//!
//! # async fn run() -> socketcan_driver::error::Result<()> {
//! let base = Arc::new(TransportBase::new(
//!     |frame: &Frame| println!("rx {:03X} {:02X?}", frame.id, frame.payload()),
//!     |state: &State| println!("state {state:?}"),
//! ));
//! let driver = Arc::new(SocketCanDriver::new(RawCanBackend, base));
//! driver.init("vcan0", 0)?;
//! let receiver = spawn_receiver(Arc::clone(&driver));
//!
//! driver.enqueue(&Frame::new(0x123, &[0xAA, 0xBB]))?;
//!
//! driver.shutdown();
//! let _ = receiver.await;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::data_link::{
    ErrorClass, ErrorClassTranslator, ErrorTranslator, WireFrame, WIRE_FRAME_SIZE,
};
use crate::error::{DriverError, ErrorCode, Result, SetupStep};
use crate::physical::{is_aborted, Backend, Port};
use crate::transport::TransportBase;
use crate::types::{validate_device_name, DriverConfig, DriverState, Frame, State, Timeouts};

const LOCK_POLL_INTERVAL: Duration = Duration::from_micros(100);

pub struct SocketCanDriver<B: Backend> {
    backend: B,
    base: Arc<TransportBase>,
    timeouts: Timeouts,
    translator: Box<dyn ErrorTranslator>,
    device: Mutex<String>,
    port: RwLock<Option<Arc<B::Port>>>,
    // init, shutdown and recover; always taken before `send_lock`
    lifecycle: Mutex<()>,
    send_lock: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Acquires `mutex`, giving up after `timeout`
fn lock_timeout<T>(mutex: &Mutex<T>, timeout: Duration) -> Option<MutexGuard<'_, T>> {
    let deadline = Instant::now() + timeout;
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(e)) => return Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::sleep(LOCK_POLL_INTERVAL);
            }
        }
    }
}

fn setup(step: SetupStep) -> impl FnOnce(io::Error) -> DriverError {
    move |source| DriverError::Setup { step, source }
}

impl<B: Backend> SocketCanDriver<B> {
    pub fn new(backend: B, base: Arc<TransportBase>) -> Self {
        Self {
            backend,
            base,
            timeouts: Timeouts::default(),
            translator: Box::new(ErrorClassTranslator),
            device: Mutex::new(String::new()),
            port: RwLock::new(None),
            lifecycle: Mutex::new(()),
            send_lock: Mutex::new(()),
        }
    }

    /// Driver using the timeouts of `config`. Call [`init_with`](Self::init_with) to open it.
    pub fn from_config(backend: B, base: Arc<TransportBase>, config: &DriverConfig) -> Self {
        Self::new(backend, base).with_timeouts(config.timeouts)
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_translator(mut self, translator: impl ErrorTranslator + 'static) -> Self {
        self.translator = Box::new(translator);
        self
    }

    pub fn base(&self) -> &Arc<TransportBase> {
        &self.base
    }

    pub fn state(&self) -> State {
        self.base.state()
    }

    /// Interface passed to the last `init`
    pub fn device(&self) -> String {
        lock(&self.device).clone()
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Opens a raw socket bound to `device`.
    ///
    /// The interface must already be configured: any `bitrate` other than 0
    /// is refused. Fails without side effects unless the driver is closed.
    pub fn init(&self, device: &str, bitrate: u32) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        self.init_locked(device, bitrate)
    }

    pub fn init_with(&self, config: &DriverConfig) -> Result<()> {
        self.init(&config.device, config.bitrate)
    }

    fn init_locked(&self, device: &str, bitrate: u32) -> Result<()> {
        let state = self.base.state();
        if state.driver_state != DriverState::Closed {
            warn!(device, state = ?state.driver_state, "init refused, driver is not closed");
            return Err(DriverError::NotClosed(state.driver_state));
        }

        *lock(&self.device) = device.to_string();
        if bitrate != 0 {
            warn!(device, bitrate, "bitrate configuration is not supported");
            return Err(DriverError::UnsupportedBitrate(bitrate));
        }
        validate_device_name(device)?;

        match self.open_port(device) {
            Ok(port) => {
                *self.port.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(port));
                self.base.set_error_code(ErrorCode::NONE);
                self.base.set_driver_state(DriverState::Open);
                info!(device, "CAN socket open");
                Ok(())
            }
            Err(err) => {
                warn!(device, error = %err, "CAN socket setup failed");
                self.base.set_error_code(err.code());
                Err(err)
            }
        }
    }

    /// Runs the setup steps in order. The socket is dropped, and so
    /// released, as soon as one of them fails.
    fn open_port(&self, device: &str) -> Result<B::Port> {
        let socket = self
            .backend
            .create_socket()
            .map_err(setup(SetupStep::CreateSocket))?;

        let if_index = self
            .backend
            .interface_index(&socket, device)
            .map_err(setup(SetupStep::ResolveInterface))?;
        debug!(device, if_index, "interface resolved");

        self.backend
            .set_error_filter(&socket, ErrorClass::FILTER)
            .map_err(setup(SetupStep::InstallErrorFilter))?;

        self.backend
            .bind(&socket, if_index)
            .map_err(setup(SetupStep::Bind))?;
        debug!(device, if_index, "socket bound");

        self.backend
            .assign(socket)
            .map_err(setup(SetupStep::AssignIo))
    }

    /// Closes the socket, aborting an outstanding read, and moves to `Closed`.
    pub fn shutdown(&self) {
        let _lifecycle = lock(&self.lifecycle);
        self.shutdown_locked();
    }

    fn shutdown_locked(&self) {
        let port = self.port.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(port) = port {
            port.close();
            info!(device = %self.device(), "CAN socket closed");
        }
        self.base.set_driver_state(DriverState::Closed);
    }

    /// Tears the socket down and opens it again on the same interface.
    ///
    /// Only valid while open; otherwise `NotOpen` is returned and nothing
    /// happens. Waits for an in-flight send to finish before closing.
    pub fn recover(&self) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        if !self.base.state().is_open() {
            return Err(DriverError::NotOpen);
        }

        let timeout = self.timeouts.send_lock();
        let _send = lock_timeout(&self.send_lock, timeout).ok_or_else(|| {
            warn!(?timeout, "recovery postponed, send in progress");
            DriverError::LockTimeout(timeout)
        })?;

        let device = self.device();
        info!(device, "recovering CAN socket");
        self.shutdown_locked();
        self.init_locked(&device, 0)
    }

    fn current_port(&self) -> Option<Arc<B::Port>> {
        self.port.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Writes one frame, blocking until the kernel has taken all 16 bytes.
    ///
    /// Concurrent callers are serialized. A failed write records the error
    /// code and resets the state to `Open` without closing the socket; the
    /// frame is not retried. A write cut short by a concurrent shutdown or
    /// recovery returns `NotOpen` and records nothing.
    ///
    /// The state listener is notified while the socket slot is read-locked,
    /// so it must not call back into `init`, `shutdown` or `recover`.
    pub fn enqueue(&self, frame: &Frame) -> Result<()> {
        if self.current_port().is_none() {
            return Err(DriverError::NotOpen);
        }

        let timeout = self.timeouts.send_lock();
        let Some(_send) = lock_timeout(&self.send_lock, timeout) else {
            return Err(self.report_send_error(DriverError::LockTimeout(timeout)));
        };

        // Recovery or shutdown may have replaced the socket while we waited
        let port = self.current_port().ok_or(DriverError::NotOpen)?;
        let wire = WireFrame::encode(frame).map_err(|e| self.report_send_error(e))?;

        match port.write_frame(&wire.to_bytes(), self.timeouts.write()) {
            Ok(WIRE_FRAME_SIZE) => {
                trace!(can_id = wire.can_id, dlc = wire.can_dlc, "frame sent");
                Ok(())
            }
            Ok(written) => Err(self.reset_after_write(
                &port,
                DriverError::ShortWrite {
                    written,
                    expected: WIRE_FRAME_SIZE,
                },
            )),
            Err(e) if is_aborted(&e) => Err(DriverError::NotOpen),
            Err(e) => Err(self.reset_after_write(&port, DriverError::Write(e))),
        }
    }

    fn report_send_error(&self, err: DriverError) -> DriverError {
        warn!(error = %err, "send failed");
        self.base.set_error_code(err.code());
        err
    }

    /// Records a failed write on `port` and forces `Open`, unless `port` was
    /// torn down in the meantime. The slot stays read-locked until the state
    /// is written, so a teardown cannot slip in between.
    fn reset_after_write(&self, port: &Arc<B::Port>, err: DriverError) -> DriverError {
        let slot = self.port.read().unwrap_or_else(|e| e.into_inner());
        if !slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, port)) {
            debug!(error = %err, "write failed on a socket that was closed meanwhile");
            return DriverError::NotOpen;
        }
        let err = self.report_send_error(err);
        self.base.set_driver_state(DriverState::Open);
        err
    }

    /// Performs one read into `buf`, decodes it into the base's input slot
    /// and notifies the base. Does not re-arm; see
    /// [`receive_loop`](crate::transport::receive_loop).
    ///
    /// Error frames are forwarded like any other frame, their class bits
    /// are recorded as the internal error.
    pub async fn receive(&self, buf: &mut [u8; WIRE_FRAME_SIZE]) -> Result<()> {
        let port = self.current_port().ok_or(DriverError::NotOpen)?;

        let err = match port.read_frame(buf).await {
            Ok(WIRE_FRAME_SIZE) => {
                let wire = WireFrame::from_bytes(buf);
                if wire.is_error_frame() {
                    debug!(class = wire.error_class(), "error frame received");
                    self.base.set_internal_error(wire.error_class());
                }
                trace!(can_id = wire.can_id, dlc = wire.can_dlc, "frame received");
                self.base.update_input(|input| wire.decode_into(input));
                self.base.frame_received(Ok(()));
                return Ok(());
            }
            Ok(n) => DriverError::Read(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("incomplete frame: {n} of {WIRE_FRAME_SIZE} bytes"),
            )),
            Err(e) if is_aborted(&e) => return Err(DriverError::Aborted),
            Err(e) => DriverError::Read(e),
        };

        warn!(error = %err, "receive failed");
        self.base.frame_received(Err(&err));
        Err(err)
    }

    /// Text for an internal error value, e.g. the state's `internal_error`
    pub fn translate_error(&self, internal_error: u32) -> Option<String> {
        self.translator.translate(internal_error)
    }
}

impl<B: Backend> Drop for SocketCanDriver<B> {
    fn drop(&mut self) {
        let port = self.port.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(port) = port {
            port.close();
        }
    }
}

impl<B: Backend> std::fmt::Debug for SocketCanDriver<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanDriver")
            .field("device", &self.device())
            .field("state", &self.state())
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
