//! Queued, non-blocking SPI and I2C transfers for STM32F4.
//!
//! Each bus channel owns a bounded FIFO of pending transfers, with at most one in flight on
//! the hardware. Transfers are started from thread context, run on DMA streams or interrupts,
//! and are completed from interrupt context with a callback. Blocking variants wait for the
//! queue to drain, then transfer directly.
//!
//! The queue and dispatch engine is hardware independent; the register-level drivers are
//! enabled by selecting a chip with a Cargo feature: `f401`, `f405`, `f407`, `f411`, or `f446`.
//! Add `f4rt` when building a program that's flashed directly, for the interrupt vector table.
//!
//! Example, with SPI1 on its default DMA streams:
//! ```ignore
//! use stm32f4_xfer::{
//!     bus::Completion,
//!     gpio::{Pin, PinMode, Port},
//!     pac::{self, interrupt},
//!     spi::{SharedSpi, SpiBuses, SpiChannel, SpiConfig, SpiPort},
//! };
//!
//! static SPI: SharedSpi<SpiPort> = SharedSpi::new();
//!
//! fn done(result: stm32f4_xfer::Result<()>, ctx: usize) {
//!     // Runs in the DMA interrupt.
//! }
//!
//! let cs = Pin::new(Port::A, 4).configure(PinMode::Output);
//! cs.set_high();
//!
//! let mut buses = SpiBuses::new();
//! buses.init(SpiChannel::One, SpiPort::new(SpiChannel::One, SpiConfig::default(), 84_000_000)?)?;
//! SPI.install(buses);
//!
//! static CMD: [u8; 4] = [0x03, 0, 0, 0];
//! SPI.with(|b| b.write(SpiChannel::One, &CMD, Some(cs), Completion::new(done, 0)))??;
//!
//! loop {
//!     SPI.task();
//! }
//!
//! #[interrupt]
//! fn DMA2_STREAM2() {
//!     SPI.on_interrupt(pac::Interrupt::DMA2_STREAM2);
//! }
//! ```

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "f401")]
pub use stm32f4::stm32f401 as pac;

#[cfg(feature = "f405")]
pub use stm32f4::stm32f405 as pac;

#[cfg(feature = "f407")]
pub use stm32f4::stm32f407 as pac;

#[cfg(feature = "f411")]
pub use stm32f4::stm32f411 as pac;

#[cfg(feature = "f446")]
pub use stm32f4::stm32f446 as pac;

/// Upper bound on iterations of busy-wait loops on register flags. Loops that exceed it give
/// up with `Error::RegisterUnchanged`, instead of hanging.
pub const MAX_ITERS: u32 = 300_000;

// `macros` must come first, so its macros are visible to the other modules.
mod macros;

pub mod bus;
pub mod diag;
pub mod dma;
pub mod error;
pub mod gpio;
pub mod i2c;
#[cfg(feature = "f4")]
pub mod i2c_f4;
pub mod queue;
pub mod registry;
pub mod spi;
#[cfg(feature = "f4")]
mod util;

pub use crate::{
    bus::{Bus, BusHw, BusState, BusStats, Completion, XferCallback},
    error::{Error, Result},
    queue::{QUEUE_LEN, XferId},
    registry::{BusArray, SharedBuses},
};
