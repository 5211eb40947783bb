//! Inter-Integrated Circuit (I2C) bus transfers: writes, reads, and register reads (write the
//! register address, then read after a repeated start).
//!
//! Transfers are described by [`I2cXfer`] and queued per channel on an [`I2cBuses`] array. The
//! register-level driver, `I2cPort`, is in `i2c_f4` and needs an F4 chip feature.

use crate::{
    bus::{BusHw, Completion},
    error::{Error, Result},
    queue::{QUEUE_LEN, XferId},
    registry::{BusArray, ChannelId, SharedBuses},
};

#[non_exhaustive]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum I2cError {
    /// Misplaced start or stop condition.
    Bus,
    Arbitration,
    Nack,
    Overrun,
    Pec,
    Timeout,
    Crc,
}

/// I2C peripheral.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum I2cChannel {
    One,
    Two,
    Three,
}

/// Number of I2C channels; the size of an I2C bus array.
pub const I2C_CHANNELS: usize = 3;

impl ChannelId for I2cChannel {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Sets OAR1 register, ADDMODE field. Selects the addressing mode for targets, and for our own
/// address.
pub enum AddressMode {
    SevenBit,
    TenBit,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Fast mode duty cycle, tLOW / tHIGH. Sets CCR register, DUTY field.
pub enum DutyCycle {
    Ratio2to1,
    Ratio16to9,
}

#[derive(Clone, Debug)]
/// Configuration data for I2C.
pub struct I2cConfig {
    /// Defaults to 7-bit.
    pub address_mode: AddressMode,
    /// Allow targets to stretch the clock. Defaults to true.
    pub clock_stretch: bool,
    /// Bus speed; standard mode up to 100kHz, fast mode up to 400kHz. Defaults to 100kHz.
    pub clk_speed_hz: u32,
    /// Duty cycle used in fast mode. Defaults to 2:1.
    pub duty_cycle: DutyCycle,
    /// Our own address, in the configured address mode. Defaults to 0.
    pub own_address: u16,
    /// Use DMA streams for plain writes and reads, when the channel has them. Defaults to true.
    pub use_dma: bool,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            address_mode: AddressMode::SevenBit,
            clock_stretch: true,
            clk_speed_hz: 100_000,
            duty_cycle: DutyCycle::Ratio2to1,
            own_address: 0,
            use_dma: true,
        }
    }
}

/// Register values for a bus speed. RM0090, section 27.6.8: I2C_CCR.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct I2cTiming {
    /// Peripheral clock in MHz. Sets CR2 register, FREQ field.
    pub freq: u8,
    /// Maximum rise time, in peripheral clock cycles plus one. Sets TRISE.
    pub trise: u8,
    pub ccr: u16,
    /// Fast mode. Sets CCR register, F_S field.
    pub fast: bool,
    /// 16:9 duty cycle. Sets CCR register, DUTY field.
    pub duty_16_9: bool,
}

impl I2cTiming {
    pub fn new(pclk: u32, speed: u32, duty: DutyCycle) -> Result<Self> {
        let freq = pclk / 1_000_000;
        if !(2..=50).contains(&freq) || speed == 0 || speed > 400_000 {
            return Err(Error::InvalidClock);
        }

        let trise = if speed <= 100_000 {
            freq + 1
        } else {
            (freq * 300) / 1000 + 1
        };

        // Round up, so the bus never runs faster than requested.
        let div_ceil = |k: u32| (pclk - 1) / (speed * k) + 1;

        let (ccr, fast, duty_16_9) = if speed <= 100_000 {
            (core::cmp::max(div_ceil(2), 4), false, false)
        } else {
            match duty {
                DutyCycle::Ratio2to1 => (core::cmp::max(div_ceil(3), 1), true, false),
                DutyCycle::Ratio16to9 => (core::cmp::max(div_ceil(25), 1), true, true),
            }
        };

        // 12-bit field.
        if ccr > 0xfff {
            return Err(Error::InvalidClock);
        }

        Ok(Self {
            freq: freq as u8,
            trise: trise as u8,
            ccr: ccr as u16,
            fast,
            duty_16_9,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum I2cDir {
    Write,
    Read,
    /// Write a register address, then read after a repeated start.
    ReadMem,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Width of the register address for `ReadMem`.
pub enum MemAddrSize {
    One,
    Two,
}

/// One I2C transaction. The buffer is referenced, not copied: it must stay valid, and
/// untouched for reads, until the transfer's callback fires.
#[derive(Clone, Copy, Debug)]
pub struct I2cXfer {
    pub dir: I2cDir,
    /// Target address: 7 or 10 bits, per the channel's `AddressMode`.
    pub addr: u16,
    pub mem_addr: u16,
    pub mem_addr_size: MemAddrSize,
    buf: *mut u8,
    len: usize,
}

// The pointer is only dereferenced by the driver, while the transfer is in flight.
unsafe impl Send for I2cXfer {}

impl I2cXfer {
    pub fn write(addr: u16, buf: &'static [u8]) -> Self {
        unsafe { Self::write_raw(addr, buf.as_ptr(), buf.len()) }
    }

    pub fn read(addr: u16, buf: &'static mut [u8]) -> Self {
        unsafe { Self::read_raw(addr, buf.as_mut_ptr(), buf.len()) }
    }

    pub fn read_mem(
        addr: u16,
        mem_addr: u16,
        mem_addr_size: MemAddrSize,
        buf: &'static mut [u8],
    ) -> Self {
        unsafe { Self::read_mem_raw(addr, mem_addr, mem_addr_size, buf.as_mut_ptr(), buf.len()) }
    }

    /// # Safety
    /// `buf` must be valid for `len` byte reads until the transfer completes.
    pub unsafe fn write_raw(addr: u16, buf: *const u8, len: usize) -> Self {
        Self {
            dir: I2cDir::Write,
            addr,
            mem_addr: 0,
            mem_addr_size: MemAddrSize::One,
            // Never written through for writes.
            buf: buf as *mut u8,
            len,
        }
    }

    /// # Safety
    /// `buf` must be valid for `len` byte writes until the transfer completes, and not
    /// otherwise accessed meanwhile.
    pub unsafe fn read_raw(addr: u16, buf: *mut u8, len: usize) -> Self {
        Self {
            dir: I2cDir::Read,
            addr,
            mem_addr: 0,
            mem_addr_size: MemAddrSize::One,
            buf,
            len,
        }
    }

    /// # Safety
    /// As for [`read_raw`](Self::read_raw).
    pub unsafe fn read_mem_raw(
        addr: u16,
        mem_addr: u16,
        mem_addr_size: MemAddrSize,
        buf: *mut u8,
        len: usize,
    ) -> Self {
        Self {
            dir: I2cDir::ReadMem,
            addr,
            mem_addr,
            mem_addr_size,
            buf,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_read(&self) -> bool {
        self.dir != I2cDir::Write
    }

    /// Register address bytes, most significant first.
    pub fn mem_addr_bytes(&self) -> ([u8; 2], usize) {
        match self.mem_addr_size {
            MemAddrSize::One => ([self.mem_addr as u8, 0], 1),
            MemAddrSize::Two => (self.mem_addr.to_be_bytes(), 2),
        }
    }

    #[cfg(any(feature = "f4", test))]
    /// # Safety
    /// `i < len`, and the buffer must still be valid.
    pub(crate) unsafe fn byte(&self, i: usize) -> u8 {
        unsafe { core::ptr::read_volatile(self.buf.add(i)) }
    }

    #[cfg(any(feature = "f4", test))]
    /// # Safety
    /// `i < len`, the buffer must still be valid, and this must be a read.
    pub(crate) unsafe fn store(&self, i: usize, byte: u8) {
        unsafe { core::ptr::write_volatile(self.buf.add(i), byte) };
    }

    #[cfg(feature = "f4")]
    pub(crate) fn buf_ptr(&self) -> *mut u8 {
        self.buf
    }
}

/// First byte of a 10-bit address header: `11110xx0`, with the two high address bits.
pub fn ten_bit_header(addr: u16) -> u8 {
    0xf0 | ((addr >> 7) as u8 & 0x06)
}

/// I2C bus handles, one per channel.
pub type I2cBuses<H, const N: usize = QUEUE_LEN> = BusArray<I2cChannel, H, I2C_CHANNELS, N>;

/// I2C bus handles in a `static`, shared with interrupt handlers.
pub type SharedI2c<H, const N: usize = QUEUE_LEN> = SharedBuses<I2cChannel, H, I2C_CHANNELS, N>;

impl<H, const N: usize> BusArray<I2cChannel, H, I2C_CHANNELS, N>
where
    H: BusHw<Xfer = I2cXfer>,
{
    /// Queue a write of `buf` to the target at `addr`.
    pub fn write(
        &mut self,
        channel: I2cChannel,
        addr: u16,
        buf: &'static [u8],
        done: Completion,
    ) -> Result<XferId> {
        self.submit(channel, I2cXfer::write(addr, buf), done)
    }

    pub fn read(
        &mut self,
        channel: I2cChannel,
        addr: u16,
        buf: &'static mut [u8],
        done: Completion,
    ) -> Result<XferId> {
        self.submit(channel, I2cXfer::read(addr, buf), done)
    }

    /// Queue a register read: `mem_addr` is written, then `buf` is read after a repeated start.
    pub fn read_mem(
        &mut self,
        channel: I2cChannel,
        addr: u16,
        mem_addr: u16,
        mem_addr_size: MemAddrSize,
        buf: &'static mut [u8],
        done: Completion,
    ) -> Result<XferId> {
        self.submit(
            channel,
            I2cXfer::read_mem(addr, mem_addr, mem_addr_size, buf),
            done,
        )
    }
}

impl<H, const N: usize> SharedBuses<I2cChannel, H, I2C_CHANNELS, N>
where
    H: BusHw<Xfer = I2cXfer>,
{
    /// Blocking write: waits up to `max_iters` dispatch iterations for the queue to drain.
    pub fn write_blocking(
        &self,
        channel: I2cChannel,
        addr: u16,
        buf: &[u8],
        max_iters: u32,
    ) -> Result<()> {
        // The transfer completes before this returns, so a borrowed buffer is fine.
        let xfer = unsafe { I2cXfer::write_raw(addr, buf.as_ptr(), buf.len()) };
        self.transfer_blocking(channel, &xfer, max_iters)
    }

    pub fn read_blocking(
        &self,
        channel: I2cChannel,
        addr: u16,
        buf: &mut [u8],
        max_iters: u32,
    ) -> Result<()> {
        let xfer = unsafe { I2cXfer::read_raw(addr, buf.as_mut_ptr(), buf.len()) };
        self.transfer_blocking(channel, &xfer, max_iters)
    }

    pub fn read_mem_blocking(
        &self,
        channel: I2cChannel,
        addr: u16,
        mem_addr: u16,
        mem_addr_size: MemAddrSize,
        buf: &mut [u8],
        max_iters: u32,
    ) -> Result<()> {
        let xfer = unsafe {
            I2cXfer::read_mem_raw(addr, mem_addr, mem_addr_size, buf.as_mut_ptr(), buf.len())
        };
        self.transfer_blocking(channel, &xfer, max_iters)
    }
}
