//! Support for the Serial Peripheral Interface (SPI) bus peripheral.
//! Provides queued, non-blocking transfers driven by interrupts or DMA, and blocking transfers
//! that bypass the queue.
//!
//! Transfers are described by [`SpiXfer`], queued per channel on a [`SpiBuses`] array, and
//! dispatched by its `task` method. The register-level driver is `SpiPort`, available with an
//! F4 chip feature.

#[cfg(feature = "f4")]
mod f4;
#[cfg(feature = "f4")]
pub use f4::*;

use core::ptr;

use crate::{
    bus::{BusHw, Completion},
    error::{Error, Result},
    gpio::Pin,
    queue::{QUEUE_LEN, XferId},
    registry::{BusArray, ChannelId, SharedBuses},
};

/// SPI error
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiError {
    /// Overrun occurred
    Overrun,
    /// Mode fault occurred
    ModeFault,
    /// CRC error
    Crc,
    /// TI frame format error
    FrameFormat,
    Hardware,
}

/// SPI peripheral.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiChannel {
    One,
    Two,
    Three,
    /// Only on F401, F411 and F446.
    Four,
}

/// Number of SPI channels; the size of an SPI bus array.
pub const SPI_CHANNELS: usize = 4;

impl ChannelId for SpiChannel {
    fn index(self) -> usize {
        self as usize
    }
}

/// Set the factor to divide the APB clock by to set baud rate. Sets `SPI_CR1` register, `BR` field.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum BaudRate {
    Div2 = 0b000,
    Div4 = 0b001,
    Div8 = 0b010,
    Div16 = 0b011,
    Div32 = 0b100,
    Div64 = 0b101,
    Div128 = 0b110,
    Div256 = 0b111,
}

impl BaudRate {
    /// The fastest prescaler that doesn't exceed `hz`, given the peripheral clock. Requests
    /// slower than `pclk / 256` get `Div256`.
    pub fn from_hz(pclk: u32, hz: u32) -> Self {
        const ALL: [BaudRate; 8] = [
            BaudRate::Div2,
            BaudRate::Div4,
            BaudRate::Div8,
            BaudRate::Div16,
            BaudRate::Div32,
            BaudRate::Div64,
            BaudRate::Div128,
            BaudRate::Div256,
        ];

        ALL.into_iter()
            .find(|br| pclk / br.divisor() <= hz)
            .unwrap_or(BaudRate::Div256)
    }

    pub fn divisor(self) -> u32 {
        2 << (self as u32)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
/// Clock polarity. Sets CR1 register, CPOL field. Stored in the config as a field of `SpiMode`.
pub enum SpiPolarity {
    /// Clock signal low when idle
    IdleLow = 0,
    /// Clock signal high when idle
    IdleHigh = 1,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
/// Clock phase. Sets CR1 register, CPHA field. Stored in the config as a field of `SpiMode`.
pub enum SpiPhase {
    /// Data in "captured" on the first clock transition
    CaptureOnFirstTransition = 0,
    /// Data in "captured" on the second clock transition
    CaptureOnSecondTransition = 1,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// SPI mode. Sets CR1 reigster, CPOL and CPHA fields.
pub struct SpiMode {
    /// Clock polarity
    pub polarity: SpiPolarity,
    /// Clock phase
    pub phase: SpiPhase,
}

impl SpiMode {
    /// Set Spi Mode 0: Idle low, capture on first transition.
    /// Data sampled on rising edge and shifted out on the falling edge
    pub fn mode0() -> Self {
        Self {
            polarity: SpiPolarity::IdleLow,
            phase: SpiPhase::CaptureOnFirstTransition,
        }
    }

    /// Set Spi Mode 1: Idle low, capture on second transition.
    /// Data sampled on the falling edge and shifted out on the rising edge
    pub fn mode1() -> Self {
        Self {
            polarity: SpiPolarity::IdleLow,
            phase: SpiPhase::CaptureOnSecondTransition,
        }
    }

    /// Set Spi Mode 2: Idle high, capture on first transition.
    /// Data sampled on the rising edge and shifted out on the falling edge
    pub fn mode2() -> Self {
        Self {
            polarity: SpiPolarity::IdleHigh,
            phase: SpiPhase::CaptureOnFirstTransition,
        }
    }

    /// Set Spi Mode 3: Idle high, capture on second transition.
    /// Data sampled on the falling edge and shifted out on the rising edge
    pub fn mode3() -> Self {
        Self {
            polarity: SpiPolarity::IdleHigh,
            phase: SpiPhase::CaptureOnSecondTransition,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Sets CR1 register, MSTR field.
pub enum SpiRole {
    Master,
    /// Not supported; initialization fails with `Error::Unsupported`.
    Slave,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Sets CR1 register, LSBFIRST field.
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

#[derive(Clone, Debug)]
/// Configuration data for SPI.
pub struct SpiConfig {
    /// Defaults to master.
    pub role: SpiRole,
    /// SPI mode associated with Polarity and Phase. Defaults to Mode0: Idle low, capture on first transition.
    pub mode: SpiMode,
    /// Defaults to MSB first.
    pub bit_order: BitOrder,
    /// Target clock speed. The prescaler picks the fastest rate that doesn't exceed it.
    /// Defaults to 1Mhz.
    pub clk_speed_hz: u32,
    /// Use DMA streams for queued transfers, when the channel has them. Defaults to true.
    pub use_dma: bool,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            role: SpiRole::Master,
            mode: SpiMode::mode0(),
            bit_order: BitOrder::MsbFirst,
            clk_speed_hz: 1_000_000,
            use_dma: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiDir {
    Write,
    Read,
    /// Full duplex: write and read the same number of bytes.
    WriteRead,
}

/// One SPI transaction. Buffers are referenced, not copied: they must stay valid, and the
/// read buffer untouched, until the transfer's callback fires.
#[derive(Clone, Copy, Debug)]
pub struct SpiXfer {
    pub dir: SpiDir,
    tx: *const u8,
    rx: *mut u8,
    len: usize,
    /// Chip select, driven low for the duration of the transfer.
    pub cs: Option<Pin>,
}

// The pointers are only dereferenced by the driver, while the transfer is in flight.
unsafe impl Send for SpiXfer {}

impl SpiXfer {
    pub fn write(buf: &'static [u8]) -> Self {
        unsafe { Self::write_raw(buf.as_ptr(), buf.len()) }
    }

    pub fn read(buf: &'static mut [u8]) -> Self {
        unsafe { Self::read_raw(buf.as_mut_ptr(), buf.len()) }
    }

    /// Write `tx` while reading into `rx`. The buffers must be the same length.
    pub fn write_read(tx: &'static [u8], rx: &'static mut [u8]) -> Result<Self> {
        if tx.len() != rx.len() {
            return Err(Error::InvalidLength);
        }
        Ok(unsafe { Self::write_read_raw(tx.as_ptr(), rx.as_mut_ptr(), tx.len()) })
    }

    /// # Safety
    /// `tx` must be valid for `len` byte reads until the transfer completes.
    pub unsafe fn write_raw(tx: *const u8, len: usize) -> Self {
        Self {
            dir: SpiDir::Write,
            tx,
            rx: ptr::null_mut(),
            len,
            cs: None,
        }
    }

    /// # Safety
    /// `rx` must be valid for `len` byte writes until the transfer completes, and not
    /// otherwise accessed meanwhile.
    pub unsafe fn read_raw(rx: *mut u8, len: usize) -> Self {
        Self {
            dir: SpiDir::Read,
            tx: ptr::null(),
            rx,
            len,
            cs: None,
        }
    }

    /// # Safety
    /// Both of [`write_raw`](Self::write_raw) and [`read_raw`](Self::read_raw) apply.
    pub unsafe fn write_read_raw(tx: *const u8, rx: *mut u8, len: usize) -> Self {
        Self {
            dir: SpiDir::WriteRead,
            tx,
            rx,
            len,
            cs: None,
        }
    }

    /// Drive `pin` low while this transfer runs.
    pub fn with_cs(mut self, pin: Pin) -> Self {
        self.cs = Some(pin);
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(any(feature = "f4", test))]
    /// Byte to transmit at `i`; reads send 0xff.
    ///
    /// # Safety
    /// `i < len`, and the write buffer must still be valid.
    pub(crate) unsafe fn tx_byte(&self, i: usize) -> u8 {
        if self.tx.is_null() {
            0xff
        } else {
            unsafe { ptr::read_volatile(self.tx.add(i)) }
        }
    }

    #[cfg(any(feature = "f4", test))]
    /// Store a received byte; dropped for writes.
    ///
    /// # Safety
    /// `i < len`, and the read buffer must still be valid.
    pub(crate) unsafe fn store_rx(&self, i: usize, byte: u8) {
        if !self.rx.is_null() {
            unsafe { ptr::write_volatile(self.rx.add(i), byte) };
        }
    }

    #[cfg(feature = "f4")]
    pub(crate) fn tx_ptr(&self) -> *const u8 {
        self.tx
    }

    #[cfg(feature = "f4")]
    pub(crate) fn rx_ptr(&self) -> *mut u8 {
        self.rx
    }
}

/// SPI bus handles, one per channel.
pub type SpiBuses<H, const N: usize = QUEUE_LEN> = BusArray<SpiChannel, H, SPI_CHANNELS, N>;

/// SPI bus handles in a `static`, shared with interrupt handlers.
pub type SharedSpi<H, const N: usize = QUEUE_LEN> = SharedBuses<SpiChannel, H, SPI_CHANNELS, N>;

impl<H, const N: usize> BusArray<SpiChannel, H, SPI_CHANNELS, N>
where
    H: BusHw<Xfer = SpiXfer>,
{
    /// Queue a write of `buf`.
    pub fn write(
        &mut self,
        channel: SpiChannel,
        buf: &'static [u8],
        cs: Option<Pin>,
        done: Completion,
    ) -> Result<XferId> {
        let mut xfer = SpiXfer::write(buf);
        xfer.cs = cs;
        self.submit(channel, xfer, done)
    }

    /// Queue a read into `buf`.
    pub fn read(
        &mut self,
        channel: SpiChannel,
        buf: &'static mut [u8],
        cs: Option<Pin>,
        done: Completion,
    ) -> Result<XferId> {
        let mut xfer = SpiXfer::read(buf);
        xfer.cs = cs;
        self.submit(channel, xfer, done)
    }

    /// Queue a full-duplex transfer. `tx` and `rx` must be the same length; otherwise
    /// nothing is queued, and no callback fires.
    pub fn write_read(
        &mut self,
        channel: SpiChannel,
        tx: &'static [u8],
        rx: &'static mut [u8],
        cs: Option<Pin>,
        done: Completion,
    ) -> Result<XferId> {
        let mut xfer = SpiXfer::write_read(tx, rx)?;
        xfer.cs = cs;
        self.submit(channel, xfer, done)
    }
}

impl<H, const N: usize> SharedBuses<SpiChannel, H, SPI_CHANNELS, N>
where
    H: BusHw<Xfer = SpiXfer>,
{
    /// Blocking write: waits up to `max_iters` dispatch iterations for the queue to drain.
    pub fn write_blocking(
        &self,
        channel: SpiChannel,
        buf: &[u8],
        cs: Option<Pin>,
        max_iters: u32,
    ) -> Result<()> {
        // The transfer completes before this returns, so a borrowed buffer is fine.
        let mut xfer = unsafe { SpiXfer::write_raw(buf.as_ptr(), buf.len()) };
        xfer.cs = cs;
        self.transfer_blocking(channel, &xfer, max_iters)
    }

    pub fn read_blocking(
        &self,
        channel: SpiChannel,
        buf: &mut [u8],
        cs: Option<Pin>,
        max_iters: u32,
    ) -> Result<()> {
        let mut xfer = unsafe { SpiXfer::read_raw(buf.as_mut_ptr(), buf.len()) };
        xfer.cs = cs;
        self.transfer_blocking(channel, &xfer, max_iters)
    }

    pub fn write_read_blocking(
        &self,
        channel: SpiChannel,
        tx: &[u8],
        rx: &mut [u8],
        cs: Option<Pin>,
        max_iters: u32,
    ) -> Result<()> {
        if tx.len() != rx.len() {
            return Err(Error::InvalidLength);
        }
        let mut xfer = unsafe { SpiXfer::write_read_raw(tx.as_ptr(), rx.as_mut_ptr(), tx.len()) };
        xfer.cs = cs;
        self.transfer_blocking(channel, &xfer, max_iters)
    }
}
