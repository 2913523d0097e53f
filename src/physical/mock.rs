use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{aborted, Backend, CloseSignal, Port};
use crate::data_link::{ErrorClass, WireFrame, WIRE_FRAME_SIZE};
use crate::error::SetupStep;

/// Something the mock bus hands to the next read
#[derive(Debug)]
pub enum Inbound {
    Bytes(Vec<u8>),
    Error(i32),
}

/// How the mock port answers writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteBehavior {
    #[default]
    Complete,
    /// Accept only this many bytes
    Short(usize),
    /// Fail with this errno
    Fail(i32),
}

/// Shared state of the simulated bus, inspected and steered by tests
#[derive(Debug)]
pub struct MockBus {
    interfaces: Mutex<HashMap<String, u32>>,
    failures: Mutex<HashMap<SetupStep, i32>>,
    steps: Mutex<Vec<SetupStep>>,
    live_sockets: AtomicUsize,
    error_filter: Mutex<Option<ErrorClass>>,
    bound_index: Mutex<Option<u32>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    wire: Mutex<Vec<u8>>,
    write_behavior: Mutex<WriteBehavior>,
    write_delay: Mutex<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockBus {
    fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            interfaces: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            steps: Mutex::new(Vec::new()),
            live_sockets: AtomicUsize::new(0),
            error_filter: Mutex::new(None),
            bound_index: Mutex::new(None),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            wire: Mutex::new(Vec::new()),
            write_behavior: Mutex::new(WriteBehavior::Complete),
            write_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn add_interface(&self, name: &str, if_index: u32) {
        lock(&self.interfaces).insert(name.to_string(), if_index);
    }

    /// Makes `step` fail with `errno` until cleared
    pub fn fail_at(&self, step: SetupStep, errno: i32) {
        lock(&self.failures).insert(step, errno);
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Setup steps attempted so far, in order
    pub fn steps(&self) -> Vec<SetupStep> {
        lock(&self.steps).clone()
    }

    /// Sockets created and not yet released
    pub fn live_sockets(&self) -> usize {
        self.live_sockets.load(Ordering::SeqCst)
    }

    pub fn error_filter(&self) -> Option<ErrorClass> {
        *lock(&self.error_filter)
    }

    pub fn bound_index(&self) -> Option<u32> {
        *lock(&self.bound_index)
    }

    pub fn push_frame(&self, frame: &WireFrame) {
        self.push(Inbound::Bytes(frame.to_bytes().to_vec()));
    }

    pub fn push(&self, inbound: Inbound) {
        // The receiver lives as long as the bus
        let _ = self.inbound_tx.send(inbound);
    }

    /// Every byte written so far, in wire order
    pub fn written_bytes(&self) -> Vec<u8> {
        lock(&self.wire).clone()
    }

    pub fn written_frames(&self) -> Vec<WireFrame> {
        lock(&self.wire)
            .chunks_exact(WIRE_FRAME_SIZE)
            .map(|chunk| {
                let mut buf = [0u8; WIRE_FRAME_SIZE];
                buf.copy_from_slice(chunk);
                WireFrame::from_bytes(&buf)
            })
            .collect()
    }

    pub fn set_write_behavior(&self, behavior: WriteBehavior) {
        *lock(&self.write_behavior) = behavior;
    }

    /// Delay applied inside every write, while the driver holds its send lock.
    /// A port closed during the delay aborts the write unless it is set to fail.
    pub fn set_write_delay(&self, delay: Duration) {
        *lock(&self.write_delay) = delay;
    }

    fn attempt(&self, step: SetupStep) -> io::Result<()> {
        lock(&self.steps).push(step);
        match lock(&self.failures).get(&step) {
            Some(errno) => Err(io::Error::from_raw_os_error(*errno)),
            None => Ok(()),
        }
    }
}

/// In-memory backend used by tests
#[derive(Debug, Clone)]
pub struct MockBackend {
    bus: Arc<MockBus>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Backend exposing a single interface, `vcan0`
    pub fn new() -> Self {
        let bus = Arc::new(MockBus::new());
        bus.add_interface("vcan0", 3);
        Self { bus }
    }

    /// Backend whose setup fails at `step` with `errno`
    pub fn new_failing(step: SetupStep, errno: i32) -> Self {
        let backend = Self::new();
        backend.bus.fail_at(step, errno);
        backend
    }

    pub fn bus(&self) -> Arc<MockBus> {
        Arc::clone(&self.bus)
    }
}

/// Counts as a live descriptor until dropped
#[derive(Debug)]
pub struct MockSocket {
    bus: Arc<MockBus>,
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        self.bus.live_sockets.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Backend for MockBackend {
    type Socket = MockSocket;
    type Port = MockPort;

    fn create_socket(&self) -> io::Result<MockSocket> {
        self.bus.attempt(SetupStep::CreateSocket)?;
        self.bus.live_sockets.fetch_add(1, Ordering::SeqCst);
        Ok(MockSocket {
            bus: Arc::clone(&self.bus),
        })
    }

    fn interface_index(&self, _socket: &MockSocket, device: &str) -> io::Result<u32> {
        self.bus.attempt(SetupStep::ResolveInterface)?;
        lock(&self.bus.interfaces)
            .get(device)
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))
    }

    fn set_error_filter(&self, _socket: &MockSocket, mask: ErrorClass) -> io::Result<()> {
        self.bus.attempt(SetupStep::InstallErrorFilter)?;
        *lock(&self.bus.error_filter) = Some(mask);
        Ok(())
    }

    fn bind(&self, _socket: &MockSocket, if_index: u32) -> io::Result<()> {
        self.bus.attempt(SetupStep::Bind)?;
        *lock(&self.bus.bound_index) = Some(if_index);
        Ok(())
    }

    fn assign(&self, socket: MockSocket) -> io::Result<MockPort> {
        self.bus.attempt(SetupStep::AssignIo)?;
        Ok(MockPort {
            bus: Arc::clone(&self.bus),
            signal: CloseSignal::default(),
            _socket: socket,
        })
    }
}

/// Bound port on the mock bus
#[derive(Debug)]
pub struct MockPort {
    bus: Arc<MockBus>,
    signal: CloseSignal,
    _socket: MockSocket,
}

impl MockPort {
    async fn next_inbound(&self) -> Option<Inbound> {
        self.bus.inbound_rx.lock().await.recv().await
    }
}

#[async_trait]
impl Port for MockPort {
    async fn read_frame(&self, buf: &mut [u8; WIRE_FRAME_SIZE]) -> io::Result<usize> {
        let inbound = tokio::select! {
            biased;
            _ = self.signal.closed() => return Err(aborted()),
            inbound = self.next_inbound() => inbound,
        };
        match inbound {
            Some(Inbound::Bytes(bytes)) => {
                let len = bytes.len().min(WIRE_FRAME_SIZE);
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(len)
            }
            Some(Inbound::Error(errno)) => Err(io::Error::from_raw_os_error(errno)),
            None => Err(aborted()),
        }
    }

    fn write_frame(&self, buf: &[u8; WIRE_FRAME_SIZE], _timeout: Duration) -> io::Result<usize> {
        if self.signal.is_closed() {
            return Err(aborted());
        }

        let delay = *lock(&self.bus.write_delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let len = match *lock(&self.bus.write_behavior) {
            WriteBehavior::Complete => WIRE_FRAME_SIZE,
            WriteBehavior::Short(n) => n.min(WIRE_FRAME_SIZE),
            WriteBehavior::Fail(errno) => return Err(io::Error::from_raw_os_error(errno)),
        };
        // Closed while the write was waiting
        if self.signal.is_closed() {
            return Err(aborted());
        }

        // Byte by byte, so unsynchronized writers would interleave
        for byte in &buf[..len] {
            lock(&self.bus.wire).push(*byte);
            thread::yield_now();
        }
        Ok(len)
    }

    fn close(&self) {
        self.signal.close();
    }
}
