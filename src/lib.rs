// Layered like the bus it drives
pub mod data_link; // Raw CAN frame layout and error classes
pub mod driver; // SocketCAN driver core
pub mod physical; // Socket backends
pub mod transport; // Transport base and receive loop

// Common types and traits
pub mod error;
pub mod types;

// Re-exports for convenience
pub use driver::SocketCanDriver;
pub use error::{DriverError, ErrorCode, Result};
#[cfg(target_os = "linux")]
pub use physical::socketcan::RawCanBackend;
pub use transport::{receive_loop, spawn_receiver, TransportBase};
pub use types::{DriverConfig, DriverState, Frame, State};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
