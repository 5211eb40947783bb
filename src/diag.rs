//! Diagnostic sink for bus errors.
//!
//! The transfer engine reports every non-fatal failure here, tagged with the peripheral it
//! happened on. Reports are logged with `defmt` (when enabled), and forwarded to an optional
//! application handler; eg to count faults or latch a status LED.

use core::cell::Cell;

use critical_section::Mutex;

/// Class of error reported to the diagnostic sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    /// Peripheral initialization failed.
    Init,
    /// A blocking call timed out waiting for the bus.
    BusyTimeout,
    /// The hardware refused to start a queued transfer.
    XferStart,
    /// A transfer was rejected because the queue was full.
    QueueOverflow,
    /// The hardware reported an error during a transfer.
    XferError,
}

/// Peripheral identifier attached to each report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum Periph {
    Spi1 = 1,
    Spi2 = 2,
    Spi3 = 3,
    Spi4 = 4,
    I2c1 = 0x11,
    I2c2 = 0x12,
    I2c3 = 0x13,
}

impl Periph {
    /// Numeric identifier, for sinks that store plain integers.
    pub fn id(self) -> u32 {
        self as u32
    }
}

/// Application hook for error reports. Called from whichever context the error was detected
/// in, including interrupt handlers; keep it short.
pub type DiagHandler = fn(ErrorKind, Periph);

static HANDLER: Mutex<Cell<Option<DiagHandler>>> = Mutex::new(Cell::new(None));

/// Install (or with `None`, remove) the application handler.
pub fn set_handler(handler: Option<DiagHandler>) {
    critical_section::with(|cs| HANDLER.borrow(cs).set(handler));
}

/// Report an error.
pub fn report(kind: ErrorKind, periph: Periph) {
    crate::warn!("{} on {}", kind, periph);

    let handler = critical_section::with(|cs| HANDLER.borrow(cs).get());
    if let Some(h) = handler {
        h(kind, periph);
    }
}
