//! Support for the F4 Direct Memory Access (DMA) controllers. This module handles stream
//! configuration, status flags, and stopping transfers. It's used by the SPI and I2C drivers
//! for their DMA paths.
//!
//! F4 has 2 DMA controllers with 8 streams each. Each stream picks one of 8 request channels
//! (`CHSEL`); which peripheral request maps to which stream and channel is fixed by hardware.
//! See RM0090, tables 42 and 43, or RM0368, tables 27 and 28.

#[cfg(feature = "f4")]
use core::sync::atomic::{self, Ordering};

#[cfg(feature = "f4")]
use cortex_m::interrupt::InterruptNumber;

#[cfg(feature = "f4")]
use crate::pac::{self, Interrupt, RCC, dma2};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaError {
    /// Transfer error; eg a bus error on the memory side. The stream disables itself.
    Transfer,
    /// FIFO overrun or underrun.
    Fifo,
    /// Direct mode error.
    DirectMode,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaPeriph {
    Dma1,
    Dma2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DmaStream {
    S0 = 0,
    S1 = 1,
    S2 = 2,
    S3 = 3,
    S4 = 4,
    S5 = 5,
    S6 = 6,
    S7 = 7,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
/// Stream priority. Sets CR register, PL field.
/// Only write to this when the stream is disabled.
pub enum Priority {
    Low = 0b00,
    Medium = 0b01,
    High = 0b10,
    VeryHigh = 0b11,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
/// Set in CR, DIR field.
pub enum Direction {
    PeriphToMem = 0b00,
    MemToPeriph = 0b01,
}

/// A stream, and the request channel it listens to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaSlot {
    pub periph: DmaPeriph,
    pub stream: DmaStream,
    /// Request channel select, 0 - 7. Sets CR register, CHSEL field.
    pub channel: u8,
}

impl DmaSlot {
    pub const fn new(periph: DmaPeriph, stream: DmaStream, channel: u8) -> Self {
        Self {
            periph,
            stream,
            channel,
        }
    }
}

/// Receive and transmit streams for one bus peripheral.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DmaPair {
    pub rx: DmaSlot,
    pub tx: DmaSlot,
    pub priority: Priority,
}

/// Status of a stream, read from LISR or HISR.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct StreamStatus {
    pub complete: bool,
    pub error: Option<DmaError>,
}

// Bit offset of each stream's flags within LISR/HISR, and LIFCR/HIFCR.
const FLAG_OFFSETS: [u32; 4] = [0, 6, 16, 22];

const DMEIF: u32 = 1 << 2;
const TEIF: u32 = 1 << 3;
const TCIF: u32 = 1 << 5;
// FEIF, DMEIF, TEIF, HTIF, TCIF
const ALL_FLAGS: u32 = 0b11_1101;

impl StreamStatus {
    /// Decode a stream's flags from the raw value of LISR (streams 0-3) or HISR (4-7).
    pub fn from_isr(isr: u32, stream: DmaStream) -> Self {
        let flags = isr >> FLAG_OFFSETS[stream as usize % 4];

        // FIFO errors aren't fatal in direct mode, which is all we use; ignore FEIF.
        let error = if flags & TEIF != 0 {
            Some(DmaError::Transfer)
        } else if flags & DMEIF != 0 {
            Some(DmaError::DirectMode)
        } else {
            None
        };

        Self {
            complete: flags & TCIF != 0,
            error,
        }
    }
}

/// Mask to write to LIFCR or HIFCR to clear every flag of `stream`.
pub fn clear_mask(stream: DmaStream) -> u32 {
    ALL_FLAGS << FLAG_OFFSETS[stream as usize % 4]
}

#[cfg(feature = "f4")]
fn regs(periph: DmaPeriph) -> &'static dma2::RegisterBlock {
    // DMA1 and DMA2 share a register layout.
    unsafe {
        match periph {
            DmaPeriph::Dma1 => &*(pac::DMA1::ptr() as *const dma2::RegisterBlock),
            DmaPeriph::Dma2 => &*pac::DMA2::ptr(),
        }
    }
}

/// Enable the controller's clock on AHB1. Safe to call repeatedly.
#[cfg(feature = "f4")]
pub fn enable_clock(periph: DmaPeriph) {
    let rcc = unsafe { &(*RCC::ptr()) };
    match periph {
        DmaPeriph::Dma1 => rcc.ahb1enr().modify(|_, w| w.dma1en().set_bit()),
        DmaPeriph::Dma2 => rcc.ahb1enr().modify(|_, w| w.dma2en().set_bit()),
    };
}

/// Per-transfer stream settings.
#[cfg(feature = "f4")]
pub struct StreamCfg {
    pub periph_addr: u32,
    pub mem_addr: u32,
    pub num_data: u16,
    pub direction: Direction,
    /// Increment the memory address after each byte. Off for a dummy source or sink.
    pub mem_incr: bool,
    pub priority: Priority,
    /// Interrupt on transfer complete. Transfer error interrupts are always on.
    pub tc_interrupt: bool,
}

/// Configure a stream for a byte-wide peripheral transfer in direct mode, and enable it.
/// RM0090, section 10.3.18: Stream configuration procedure.
#[cfg(feature = "f4")]
pub fn cfg_stream(slot: DmaSlot, cfg: &StreamCfg) -> crate::error::Result<()> {
    let regs = regs(slot.periph);
    let st = regs.st(slot.stream as usize);

    // 1. If the stream is enabled, disable it and wait for EN to read back 0.
    st.cr().modify(|_, w| w.en().clear_bit());
    crate::bounded_loop!(
        st.cr().read().en().bit_is_set(),
        crate::error::Error::RegisterUnchanged
    );

    // Stale flags from a previous transfer would block the enable.
    clear_flags(slot);

    // 2. Peripheral port register address.
    st.par().write(|w| unsafe { w.bits(cfg.periph_addr) });

    atomic::compiler_fence(Ordering::SeqCst);

    // 3. Memory address.
    st.m0ar().write(|w| unsafe { w.bits(cfg.mem_addr) });

    // 4. Number of data items.
    st.ndtr().write(|w| unsafe { w.bits(cfg.num_data as u32) });

    // 8. Direct mode: FIFO disabled.
    st.fcr().modify(|_, w| w.dmdis().clear_bit());

    // 5 - 9. Channel, priority, direction, increments, sizes, interrupts.
    st.cr().write(|w| unsafe {
        w.chsel().bits(slot.channel);
        w.pl().bits(cfg.priority as u8);
        w.dir().bits(cfg.direction as u8);
        w.pinc().clear_bit();
        w.minc().bit(cfg.mem_incr);
        // 8-bit transfers on both sides.
        w.psize().bits(0b00);
        w.msize().bits(0b00);
        w.circ().clear_bit();
        w.teie().set_bit();
        w.dmeie().set_bit();
        w.tcie().bit(cfg.tc_interrupt)
    });

    // See the [Embedonomicon section on DMA](https://docs.rust-embedded.org/embedonomicon/dma.html)
    // for info on why we use `compiler_fence` here.
    atomic::compiler_fence(Ordering::Release);

    // 10. Activate the stream.
    st.cr().modify(|_, w| w.en().set_bit());
    Ok(())
}

/// Stop a transfer, if in progress, and clear the stream's flags.
#[cfg(feature = "f4")]
pub fn stop(slot: DmaSlot) {
    let st = regs(slot.periph).st(slot.stream as usize);

    st.cr()
        .modify(|_, w| w.en().clear_bit().tcie().clear_bit().teie().clear_bit());

    let mut i = 0;
    while st.cr().read().en().bit_is_set() && i < crate::MAX_ITERS {
        i += 1;
    }
    clear_flags(slot);
}

#[cfg(feature = "f4")]
pub fn status(slot: DmaSlot) -> StreamStatus {
    let regs = regs(slot.periph);
    let isr = if (slot.stream as u8) < 4 {
        regs.lisr().read().bits()
    } else {
        regs.hisr().read().bits()
    };
    StreamStatus::from_isr(isr, slot.stream)
}

#[cfg(feature = "f4")]
pub fn clear_flags(slot: DmaSlot) {
    let regs = regs(slot.periph);
    let mask = clear_mask(slot.stream);
    if (slot.stream as u8) < 4 {
        regs.lifcr().write(|w| unsafe { w.bits(mask) });
    } else {
        regs.hifcr().write(|w| unsafe { w.bits(mask) });
    }
}

/// The stream's interrupt number, for routing.
#[cfg(feature = "f4")]
pub fn irq(slot: DmaSlot) -> u16 {
    use DmaStream::*;

    let int = match (slot.periph, slot.stream) {
        (DmaPeriph::Dma1, S0) => Interrupt::DMA1_STREAM0,
        (DmaPeriph::Dma1, S1) => Interrupt::DMA1_STREAM1,
        (DmaPeriph::Dma1, S2) => Interrupt::DMA1_STREAM2,
        (DmaPeriph::Dma1, S3) => Interrupt::DMA1_STREAM3,
        (DmaPeriph::Dma1, S4) => Interrupt::DMA1_STREAM4,
        (DmaPeriph::Dma1, S5) => Interrupt::DMA1_STREAM5,
        (DmaPeriph::Dma1, S6) => Interrupt::DMA1_STREAM6,
        (DmaPeriph::Dma1, S7) => Interrupt::DMA1_STREAM7,
        (DmaPeriph::Dma2, S0) => Interrupt::DMA2_STREAM0,
        (DmaPeriph::Dma2, S1) => Interrupt::DMA2_STREAM1,
        (DmaPeriph::Dma2, S2) => Interrupt::DMA2_STREAM2,
        (DmaPeriph::Dma2, S3) => Interrupt::DMA2_STREAM3,
        (DmaPeriph::Dma2, S4) => Interrupt::DMA2_STREAM4,
        (DmaPeriph::Dma2, S5) => Interrupt::DMA2_STREAM5,
        (DmaPeriph::Dma2, S6) => Interrupt::DMA2_STREAM6,
        (DmaPeriph::Dma2, S7) => Interrupt::DMA2_STREAM7,
    };
    int.number()
}
