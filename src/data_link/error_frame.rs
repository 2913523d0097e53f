//! Bus error classes carried by error frames.
//!
//! The same bit values select which classes the kernel reports
//! (`CAN_RAW_ERR_FILTER`) and identify the class of a received error frame.
//! Details beyond the class live in the data bytes and are left to
//! [`ErrorTranslator`] implementations.

use bitflags::bitflags;

bitflags! {
    /// Error classes from `linux/can/error.h`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorClass: u32 {
        const TX_TIMEOUT = 0x0001;
        const LOST_ARBITRATION = 0x0002;
        const CONTROLLER = 0x0004;
        const PROTOCOL = 0x0008;
        const TRANSCEIVER = 0x0010;
        const NO_ACK = 0x0020;
        const BUS_OFF = 0x0040;
        const BUS_ERROR = 0x0080;
        const RESTARTED = 0x0100;
    }
}

const DESCRIPTIONS: [(ErrorClass, &str); 9] = [
    (ErrorClass::TX_TIMEOUT, "tx timeout"),
    (ErrorClass::LOST_ARBITRATION, "lost arbitration"),
    (ErrorClass::CONTROLLER, "controller problem"),
    (ErrorClass::PROTOCOL, "protocol violation"),
    (ErrorClass::TRANSCEIVER, "transceiver status"),
    (ErrorClass::NO_ACK, "no ack on transmission"),
    (ErrorClass::BUS_OFF, "bus off"),
    (ErrorClass::BUS_ERROR, "bus error"),
    (ErrorClass::RESTARTED, "controller restarted"),
];

impl ErrorClass {
    /// Classes installed on every socket the driver opens
    pub const FILTER: ErrorClass = ErrorClass::TX_TIMEOUT.union(ErrorClass::BUS_OFF);

    /// Text for a single class, `None` for combinations or unknown bits
    pub fn description(&self) -> Option<&'static str> {
        DESCRIPTIONS
            .iter()
            .find(|(class, _)| class == self)
            .map(|(_, text)| *text)
    }
}

/// Turns the driver's internal error value into text.
pub trait ErrorTranslator: Send + Sync {
    fn translate(&self, internal_error: u32) -> Option<String>;
}

/// Never translates anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTranslation;

impl ErrorTranslator for NoTranslation {
    fn translate(&self, _internal_error: u32) -> Option<String> {
        None
    }
}

/// Names every known class bit set in the value, e.g. `"tx timeout, bus off"`
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassTranslator;

impl ErrorTranslator for ErrorClassTranslator {
    fn translate(&self, internal_error: u32) -> Option<String> {
        let classes = ErrorClass::from_bits_truncate(internal_error);
        let names: Vec<&str> = classes.iter().filter_map(|c| c.description()).collect();
        if names.is_empty() {
            None
        } else {
            Some(names.join(", "))
        }
    }
}

impl<F> ErrorTranslator for F
where
    F: Fn(u32) -> Option<String> + Send + Sync,
{
    fn translate(&self, internal_error: u32) -> Option<String> {
        self(internal_error)
    }
}
