//! Transport base the driver reports to.
//!
//! [`TransportBase`] owns the state cell (driver state, error code, last bus
//! error class), the reusable input frame slot, and the two listeners
//! supplied by the application. The driver writes into it; the base decides
//! what reaches the listeners:
//!
//! - the state listener is called whenever the state actually changes,
//! - the frame listener is called for every successfully received frame,
//!   error frames included.
//!
//! Re-arming the receive path is also the base's job, see [`receive_loop`].

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::data_link::WIRE_FRAME_SIZE;
use crate::driver::SocketCanDriver;
use crate::error::{DriverError, ErrorCode, Result};
use crate::physical::Backend;
use crate::types::{DriverState, Frame, State};

/// Accepts decoded frames
pub trait FrameListener: Send + Sync {
    fn on_frame(&self, frame: &Frame);
}

impl<F> FrameListener for F
where
    F: Fn(&Frame) + Send + Sync,
{
    fn on_frame(&self, frame: &Frame) {
        self(frame)
    }
}

/// Accepts state and error transitions
pub trait StateListener: Send + Sync {
    fn on_state(&self, state: &State);
}

impl<F> StateListener for F
where
    F: Fn(&State) + Send + Sync,
{
    fn on_state(&self, state: &State) {
        self(state)
    }
}

pub struct TransportBase {
    state: Mutex<State>,
    input: Mutex<Frame>,
    frame_listener: Box<dyn FrameListener>,
    state_listener: Box<dyn StateListener>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl TransportBase {
    pub fn new(
        frame_listener: impl FrameListener + 'static,
        state_listener: impl StateListener + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(State::default()),
            input: Mutex::new(Frame::default()),
            frame_listener: Box::new(frame_listener),
            state_listener: Box::new(state_listener),
        }
    }

    pub fn state(&self) -> State {
        *lock(&self.state)
    }

    pub fn set_driver_state(&self, driver_state: DriverState) {
        self.update_state(|state| state.driver_state = driver_state);
    }

    pub fn set_error_code(&self, error_code: ErrorCode) {
        self.update_state(|state| state.error_code = error_code);
    }

    pub fn set_internal_error(&self, internal_error: u32) {
        self.update_state(|state| state.internal_error = internal_error);
    }

    /// Applies `f` to the state and notifies the state listener if it changed.
    /// The listener runs after the state lock is released.
    fn update_state(&self, f: impl FnOnce(&mut State)) {
        let changed = {
            let mut state = lock(&self.state);
            let before = *state;
            f(&mut state);
            (*state != before).then_some(*state)
        };
        if let Some(state) = changed {
            self.state_listener.on_state(&state);
        }
    }

    /// Gives the driver write access to the reusable input slot
    pub fn update_input(&self, f: impl FnOnce(&mut Frame)) {
        f(&mut lock(&self.input));
    }

    /// Last frame written into the input slot
    pub fn input(&self) -> Frame {
        *lock(&self.input)
    }

    /// Completion of one receive operation. On success the input slot is
    /// forwarded to the frame listener, on failure the error code is recorded.
    pub fn frame_received(&self, result: std::result::Result<(), &DriverError>) {
        match result {
            Ok(()) => {
                let frame = self.input();
                self.frame_listener.on_frame(&frame);
            }
            Err(err) => self.set_error_code(err.code()),
        }
    }
}

impl std::fmt::Debug for TransportBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportBase")
            .field("state", &self.state())
            .field("input", &self.input())
            .finish_non_exhaustive()
    }
}

/// Re-arms `driver.receive` after every completed read.
///
/// Returns `Ok(())` once the socket is torn down (shutdown or recover) and
/// the read failure otherwise. After a recovery the loop has to be started
/// again for the new socket.
pub async fn receive_loop<B: Backend>(driver: Arc<SocketCanDriver<B>>) -> Result<()> {
    let mut buf = [0u8; WIRE_FRAME_SIZE];
    loop {
        match driver.receive(&mut buf).await {
            Ok(()) => {}
            Err(DriverError::Aborted) | Err(DriverError::NotOpen) => {
                debug!("receive loop stopped, socket closed");
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, "receive loop stopped");
                return Err(err);
            }
        }
    }
}

/// Runs [`receive_loop`] on the current tokio runtime
pub fn spawn_receiver<B: Backend>(driver: Arc<SocketCanDriver<B>>) -> JoinHandle<Result<()>> {
    tokio::spawn(receive_loop(driver))
}
