//! Common error definitions.

use crate::{dma::DmaError, i2c::I2cError, spi::SpiError};

macro_rules! impl_from_error {
    ($error:ident) => {
        impl From<$error> for Error {
            fn from(error: $error) -> Self {
                Self::$error(error)
            }
        }
    };
}

/// Alias for Result<T, Error>.
pub type Result<T> = core::result::Result<T, Error>;

/// Collection of all errors that can occur.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Occurs when an expected change of a register does happen in time.
    ///
    /// This is returned when a bounded loop exceeds its alotted iteration count.
    RegisterUnchanged,
    /// The transfer queue of the bus is full; the transfer was not accepted.
    QueueFull,
    /// A blocking call gave up waiting for the bus to go idle.
    BusyTimeout,
    /// The operation requires an idle bus.
    Busy,
    /// The channel has not been initialized.
    NotInitialized,
    /// An interrupt is already routed to a different channel.
    IrqConflict,
    /// No free slot left in the interrupt routing table.
    IrqTableFull,
    /// Zero-length transfer, or too long for the hardware counter.
    InvalidLength,
    /// The peripheral clock can't produce the requested bus clock.
    InvalidClock,
    /// The configuration or peripheral isn't supported on this device.
    Unsupported,
    /// Direct Memory Access (DMA) error
    DmaError(DmaError),
    I2cError(I2cError),
    /// SPI errors.
    SpiError(SpiError),
}

impl_from_error!(DmaError);
impl_from_error!(I2cError);
impl_from_error!(SpiError);

#[cfg(feature = "embedded_hal")]
mod embedded_hal_impl {
    use embedded_hal::{
        i2c::{Error as I2cEhError, ErrorKind as I2cErrorKind, NoAcknowledgeSource},
        spi::{Error as SpiEhError, ErrorKind as SpiErrorKind},
    };

    use super::{Error, I2cError, SpiError};

    impl I2cEhError for Error {
        fn kind(&self) -> I2cErrorKind {
            match self {
                Error::I2cError(i) => match i {
                    I2cError::Bus => I2cErrorKind::Bus,
                    I2cError::Arbitration => I2cErrorKind::ArbitrationLoss,
                    I2cError::Nack => I2cErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown),
                    I2cError::Overrun => I2cErrorKind::Overrun,
                    _ => I2cErrorKind::Other,
                },
                _ => I2cErrorKind::Other,
            }
        }
    }

    impl SpiEhError for Error {
        fn kind(&self) -> SpiErrorKind {
            match self {
                Error::SpiError(s) => match s {
                    SpiError::Overrun => SpiErrorKind::Overrun,
                    SpiError::ModeFault => SpiErrorKind::ModeFault,
                    SpiError::FrameFormat => SpiErrorKind::FrameFormat,
                    _ => SpiErrorKind::Other,
                },
                _ => SpiErrorKind::Other,
            }
        }
    }
}
