//! I2C support for F4, which uses an older peripheral than the other STM32 families: addressing
//! and stop conditions are driven by software, event by event. RM0090, section 27.3.3.
//!
//! Transfers run interrupt-driven, one event per interrupt, or with DMA moving the data bytes
//! while the address phase stays interrupt-driven.

use cortex_m::interrupt::InterruptNumber;

use crate::{
    MAX_ITERS, bounded_loop,
    bus::BusHw,
    diag::Periph,
    dma::{self, DmaPair, DmaPeriph, DmaSlot, DmaStream, Direction, Priority, StreamCfg},
    error::{Error, Result},
    gpio::{OutputType, Pin, PinMode},
    i2c::*,
    pac::{self, Interrupt, RCC, i2c1},
    util::{rcc_disable, rcc_en_reset},
};

impl I2cChannel {
    /// Default DMA streams. RM0090, table 42. These can collide with the defaults of other
    /// peripherals; override them with `I2cPort::with_dma` if so.
    pub fn default_dma(self) -> DmaPair {
        use DmaPeriph::*;
        use DmaStream::*;

        let (rx, tx) = match self {
            Self::One => (DmaSlot::new(Dma1, S0, 1), DmaSlot::new(Dma1, S6, 1)),
            Self::Two => (DmaSlot::new(Dma1, S2, 7), DmaSlot::new(Dma1, S7, 7)),
            Self::Three => (DmaSlot::new(Dma1, S2, 3), DmaSlot::new(Dma1, S4, 3)),
        };
        DmaPair {
            rx,
            tx,
            priority: Priority::Low,
        }
    }

    fn periph(self) -> Periph {
        match self {
            Self::One => Periph::I2c1,
            Self::Two => Periph::I2c2,
            Self::Three => Periph::I2c3,
        }
    }
}

/// SCL and SDA pins, and their alternate function number. When given, `init` configures them,
/// and uses them to free a bus left busy by a target stuck mid-transfer.
#[derive(Debug, Clone, Copy)]
pub struct I2cPins {
    pub scl: Pin,
    pub sda: Pin,
    pub af: u8,
}

/// Progress of the transfer in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Start condition requested; the address goes out on SB.
    Start { read: bool },
    /// 10-bit write header sent; the low address byte goes out on ADD10.
    Header,
    /// Address sent; waiting for ADDR.
    Addr { read: bool },
    MemAddr,
    Tx,
    /// Last byte written; stop or restart on BTF.
    Drain,
    Rx,
    DmaTx,
    DmaRx,
}

/// Hardware binding for one I2C peripheral. Master mode only.
pub struct I2cPort {
    channel: I2cChannel,
    regs: *const i2c1::RegisterBlock,
    cfg: I2cConfig,
    pclk: u32,
    dma: Option<DmaPair>,
    pins: Option<I2cPins>,
    irqs: [u16; 4],
    num_irqs: usize,
    phase: Phase,
    /// Bytes moved so far in the current phase, on the interrupt path.
    pos: usize,
    dma_active: bool,
}

// The register block is only accessed through the owning bus handle.
unsafe impl Send for I2cPort {}

impl I2cPort {
    /// `pclk` is the APB1 clock, in Hz; it must be between 2 and 50MHz.
    pub fn new(channel: I2cChannel, cfg: I2cConfig, pclk: u32) -> Self {
        let regs = match channel {
            I2cChannel::One => pac::I2C1::ptr(),
            I2cChannel::Two => pac::I2C2::ptr() as *const i2c1::RegisterBlock,
            I2cChannel::Three => pac::I2C3::ptr() as *const i2c1::RegisterBlock,
        };

        let dma = cfg.use_dma.then(|| channel.default_dma());

        let mut result = Self {
            channel,
            regs,
            cfg,
            pclk,
            dma: None,
            pins: None,
            irqs: [0; 4],
            num_irqs: 0,
            phase: Phase::Idle,
            pos: 0,
            dma_active: false,
        };
        result.set_dma(dma);
        result
    }

    /// Use these DMA streams, or with `None`, interrupts only.
    pub fn with_dma(mut self, dma: Option<DmaPair>) -> Self {
        self.set_dma(dma);
        self
    }

    pub fn with_pins(mut self, pins: I2cPins) -> Self {
        self.pins = Some(pins);
        self
    }

    fn set_dma(&mut self, dma: Option<DmaPair>) {
        let (ev, er) = match self.channel {
            I2cChannel::One => (Interrupt::I2C1_EV, Interrupt::I2C1_ER),
            I2cChannel::Two => (Interrupt::I2C2_EV, Interrupt::I2C2_ER),
            I2cChannel::Three => (Interrupt::I2C3_EV, Interrupt::I2C3_ER),
        };

        self.irqs[0] = ev.number();
        self.irqs[1] = er.number();
        self.num_irqs = 2;
        if let Some(d) = dma {
            self.irqs[2] = dma::irq(d.rx);
            self.irqs[3] = dma::irq(d.tx);
            self.num_irqs = 4;
        }
        self.dma = dma;
    }

    fn regs(&self) -> &'static i2c1::RegisterBlock {
        unsafe { &*self.regs }
    }

    fn ten_bit(&self) -> bool {
        self.cfg.address_mode == AddressMode::TenBit
    }

    fn check_len(xfer: &I2cXfer) -> Result<()> {
        if xfer.is_empty() || xfer.len() > u16::MAX as usize {
            return Err(Error::InvalidLength);
        }
        Ok(())
    }

    pub fn check_and_clear_error_flags(&self) -> Result<()> {
        // Note that flags should only be cleared once they have been registered. If flags are
        // cleared otherwise, there may be an inherent race condition and flags may be missed.
        let regs = self.regs();
        let sr1 = regs.sr1().read();

        if sr1.timeout().bit_is_set() {
            regs.sr1().modify(|_, w| w.timeout().clear_bit());
            return Err(I2cError::Timeout.into());
        }

        if sr1.pecerr().bit_is_set() {
            regs.sr1().modify(|_, w| w.pecerr().clear_bit());
            return Err(I2cError::Crc.into());
        }

        if sr1.ovr().bit_is_set() {
            regs.sr1().modify(|_, w| w.ovr().clear_bit());
            return Err(I2cError::Overrun.into());
        }

        if sr1.af().bit_is_set() {
            regs.sr1().modify(|_, w| w.af().clear_bit());
            return Err(I2cError::Nack.into());
        }

        if sr1.arlo().bit_is_set() {
            regs.sr1().modify(|_, w| w.arlo().clear_bit());
            return Err(I2cError::Arbitration.into());
        }

        // The errata indicates that BERR may be incorrectly detected. It recommends ignoring and
        // clearing the BERR bit instead.
        if sr1.berr().bit_is_set() {
            regs.sr1().modify(|_, w| w.berr().clear_bit());
        }

        Ok(())
    }

    fn write_dr(&self, byte: u8) {
        self.regs().dr().write(|w| unsafe { w.bits(u16::from(byte)) });
    }

    /// Clear ADDR by reading SR1, then SR2.
    fn clear_addr(&self) {
        let _ = self.regs().sr1().read();
        let _ = self.regs().sr2().read();
    }

    /// Wait for the previous stop condition to go out, and for the bus to be free.
    fn wait_idle(&self) -> Result<()> {
        let regs = self.regs();
        bounded_loop!(regs.cr1().read().stop().bit_is_set(), I2cError::Bus);
        bounded_loop!(regs.sr2().read().busy().bit_is_set(), I2cError::Bus);
        Ok(())
    }

    /// Disable interrupts and DMA requests, and release the bus if we still hold it.
    fn abort(&mut self) {
        let regs = self.regs();
        regs.cr2().modify(|_, w| {
            w.itevten().clear_bit();
            w.iterren().clear_bit();
            w.itbufen().clear_bit();
            w.dmaen().clear_bit();
            w.last().clear_bit()
        });
        if regs.sr2().read().msl().bit_is_set() {
            regs.cr1().modify(|_, w| w.stop().set_bit());
        }
        self.finish();
    }

    /// Transfer over: stop DMA streams, and interrupts.
    fn finish(&mut self) {
        self.regs().cr2().modify(|_, w| {
            w.itevten().clear_bit();
            w.iterren().clear_bit();
            w.itbufen().clear_bit();
            w.dmaen().clear_bit();
            w.last().clear_bit()
        });
        if self.dma_active
            && let Some(d) = self.dma
        {
            dma::stop(d.rx);
            dma::stop(d.tx);
        }
        self.dma_active = false;
        self.phase = Phase::Idle;
    }

    fn stop_ok(&mut self) -> Option<Result<()>> {
        self.regs().cr1().modify(|_, w| w.stop().set_bit());
        self.finish();
        Some(Ok(()))
    }

    /// Set START, then wait for SB.
    fn start(&self) -> Result<()> {
        self.regs().cr1().modify(|_, w| w.start().set_bit());

        bounded_loop!(
            self.regs().sr1().read().sb().bit_is_clear(),
            Error::RegisterUnchanged,
            {
                self.check_and_clear_error_flags()?;
            }
        );
        Ok(())
    }

    fn wait_addr(&self) -> Result<()> {
        // Check for any I2C errors. If a Nack occurs, the ADDR bit will never be set.
        bounded_loop!(
            self.regs().sr1().read().addr().bit_is_clear(),
            Error::RegisterUnchanged,
            {
                self.check_and_clear_error_flags()?;
            }
        );
        Ok(())
    }

    /// Generate a start condition and address the target. Returns with ADDR set, and not
    /// cleared. After a repeated start, 10-bit reads only resend the header.
    fn address(&self, addr: u16, read: bool, repeated: bool) -> Result<()> {
        self.start()?;

        if !self.ten_bit() {
            self.write_dr(((addr as u8 & 0x7f) << 1) | read as u8);
            return self.wait_addr();
        }

        if !(read && repeated) {
            self.write_dr(ten_bit_header(addr));
            bounded_loop!(
                self.regs().sr1().read().add10().bit_is_clear(),
                Error::RegisterUnchanged,
                {
                    self.check_and_clear_error_flags()?;
                }
            );
            self.write_dr(addr as u8);
            self.wait_addr()?;

            if !read {
                return Ok(());
            }
            self.clear_addr();
            self.start()?;
        }

        self.write_dr(ten_bit_header(addr) | 1);
        self.wait_addr()
    }

    pub fn send_byte(&self, byte: u8) -> Result<()> {
        // Wait until we're ready for sending
        bounded_loop!(
            self.regs().sr1().read().tx_e().bit_is_clear(),
            Error::RegisterUnchanged,
            {
                self.check_and_clear_error_flags()?;
            }
        );

        // Push out a byte of data
        self.write_dr(byte);

        // Wait until byte is transferred
        bounded_loop!(
            self.regs().sr1().read().btf().bit_is_clear(),
            Error::RegisterUnchanged,
            {
                self.check_and_clear_error_flags()?;
            }
        );

        Ok(())
    }

    pub fn recv_byte(&self) -> Result<u8> {
        bounded_loop!(
            self.regs().sr1().read().rx_ne().bit_is_clear(),
            Error::RegisterUnchanged,
            {
                self.check_and_clear_error_flags()?;
            }
        );

        Ok(self.regs().dr().read().bits() as u8)
    }

    /// Receive into the transfer's buffer, with ADDR set. Ends with a stop condition.
    fn recv_bytes(&self, xfer: &I2cXfer) -> Result<()> {
        let regs = self.regs();
        let len = xfer.len();

        if len == 1 {
            // The single byte must be NACKed: clear ACK before ADDR.
            regs.cr1().modify(|_, w| w.ack().clear_bit());
            self.clear_addr();
            regs.cr1().modify(|_, w| w.stop().set_bit());
        } else {
            regs.cr1().modify(|_, w| w.ack().set_bit());
            self.clear_addr();

            for i in 0..len - 1 {
                let byte = self.recv_byte()?;
                unsafe { xfer.store(i, byte) };
            }

            // Prepare to send Nack then STOP after next byte
            regs.cr1()
                .modify(|_, w| w.ack().clear_bit().stop().set_bit());
        }

        let last = self.recv_byte()?;
        unsafe { xfer.store(len - 1, last) };

        bounded_loop!(
            regs.cr1().read().stop().bit_is_set(),
            Error::RegisterUnchanged
        );
        Ok(())
    }

    fn blocking_inner(&self, xfer: &I2cXfer) -> Result<()> {
        match xfer.dir {
            I2cDir::Write => {
                self.address(xfer.addr, false, false)?;
                self.clear_addr();

                for i in 0..xfer.len() {
                    self.send_byte(unsafe { xfer.byte(i) })?;
                }

                self.regs().cr1().modify(|_, w| w.stop().set_bit());
                bounded_loop!(
                    self.regs().cr1().read().stop().bit_is_set(),
                    Error::RegisterUnchanged
                );
                Ok(())
            }
            I2cDir::Read => {
                self.address(xfer.addr, true, false)?;
                self.recv_bytes(xfer)
            }
            I2cDir::ReadMem => {
                self.address(xfer.addr, false, false)?;
                self.clear_addr();

                let (bytes, n) = xfer.mem_addr_bytes();
                for b in &bytes[..n] {
                    self.send_byte(*b)?;
                }

                self.address(xfer.addr, true, true)?;
                self.recv_bytes(xfer)
            }
        }
    }

    /// Release a bus held busy by a target stuck mid-transfer, by driving the lines by hand,
    /// then resetting the peripheral. ES0182, section 2.14.7.
    fn recover_bus(&self, pins: &I2cPins) -> Result<()> {
        fn expect(pin: Pin, high: bool) -> Result<()> {
            bounded_loop!(pin.is_high() != high, I2cError::Bus);
            Ok(())
        }

        let regs = self.regs();
        crate::warn!("{} held busy; recovering", self.channel.periph());

        // 1. Disable the peripheral.
        regs.cr1().modify(|_, w| w.pe().clear_bit());

        // 2. SCL and SDA as open-drain outputs, released high.
        for pin in [pins.scl, pins.sda] {
            pin.set_high();
            pin.output_type(OutputType::OpenDrain);
            pin.configure(PinMode::Output);
        }

        // 3. Both lines must read back high.
        expect(pins.scl, true)?;
        expect(pins.sda, true)?;

        // 4 - 7. Drive SDA, then SCL, low.
        pins.sda.set_low();
        expect(pins.sda, false)?;
        pins.scl.set_low();
        expect(pins.scl, false)?;

        // 8 - 11. Release SCL, then SDA: a stop condition.
        pins.scl.set_high();
        expect(pins.scl, true)?;
        pins.sda.set_high();
        expect(pins.sda, true)?;

        // 12. Back to the alternate function.
        for pin in [pins.scl, pins.sda] {
            pin.configure(PinMode::Alt(pins.af));
        }

        // 13 - 14. Reset the peripheral; `init` configures it again.
        regs.cr1().modify(|_, w| w.swrst().set_bit());
        regs.cr1().modify(|_, w| w.swrst().clear_bit());

        Ok(())
    }

    /// Interrupt path event handling. Each call handles at most one event.
    fn advance(&mut self, xfer: &I2cXfer) -> Option<Result<()>> {
        let regs = self.regs();
        let sr1 = regs.sr1().read();

        match self.phase {
            Phase::Idle => (),
            Phase::Start { read } => {
                if sr1.sb().bit_is_clear() {
                    return None;
                }
                // Reading SR1, then writing the address to DR, clears SB.
                if !self.ten_bit() {
                    self.write_dr(((xfer.addr as u8 & 0x7f) << 1) | read as u8);
                    self.phase = Phase::Addr { read };
                } else if read {
                    // Only reached after addressing the target as a write.
                    self.write_dr(ten_bit_header(xfer.addr) | 1);
                    self.phase = Phase::Addr { read };
                } else {
                    self.write_dr(ten_bit_header(xfer.addr));
                    self.phase = Phase::Header;
                }
            }
            Phase::Header => {
                if sr1.add10().bit_is_clear() {
                    return None;
                }
                self.write_dr(xfer.addr as u8);
                self.phase = Phase::Addr { read: false };
            }
            Phase::Addr { read: true } => {
                if sr1.addr().bit_is_clear() {
                    return None;
                }
                let single = xfer.len() == 1;
                regs.cr1().modify(|_, w| w.ack().bit(!single));
                self.clear_addr();
                if single {
                    regs.cr1().modify(|_, w| w.stop().set_bit());
                }
                self.pos = 0;
                self.phase = if self.dma_active {
                    Phase::DmaRx
                } else {
                    Phase::Rx
                };
            }
            Phase::Addr { read: false } => {
                if sr1.addr().bit_is_clear() {
                    return None;
                }
                self.clear_addr();
                self.pos = 0;
                self.phase = match xfer.dir {
                    I2cDir::Write if self.dma_active => Phase::DmaTx,
                    I2cDir::Write => Phase::Tx,
                    I2cDir::ReadMem => Phase::MemAddr,
                    // 10-bit reads address the target as a write first.
                    I2cDir::Read => {
                        regs.cr1().modify(|_, w| w.start().set_bit());
                        Phase::Start { read: true }
                    }
                };
            }
            Phase::MemAddr => {
                if sr1.tx_e().bit_is_clear() {
                    return None;
                }
                let (bytes, n) = xfer.mem_addr_bytes();
                self.write_dr(bytes[self.pos]);
                self.pos += 1;
                if self.pos == n {
                    regs.cr2().modify(|_, w| w.itbufen().clear_bit());
                    self.phase = Phase::Drain;
                }
            }
            Phase::Tx => {
                if sr1.tx_e().bit_is_clear() {
                    return None;
                }
                self.write_dr(unsafe { xfer.byte(self.pos) });
                self.pos += 1;
                if self.pos == xfer.len() {
                    // Only BTF from here on; TXE would fire continuously.
                    regs.cr2().modify(|_, w| w.itbufen().clear_bit());
                    self.phase = Phase::Drain;
                }
            }
            Phase::Drain => {
                if sr1.btf().bit_is_clear() {
                    return None;
                }
                if xfer.dir != I2cDir::ReadMem {
                    return self.stop_ok();
                }
                regs.cr2().modify(|_, w| w.itbufen().set_bit());
                regs.cr1().modify(|_, w| w.start().set_bit());
                self.phase = Phase::Start { read: true };
            }
            Phase::Rx => {
                if sr1.rx_ne().bit_is_clear() {
                    return None;
                }
                let byte = regs.dr().read().bits() as u8;
                unsafe { xfer.store(self.pos, byte) };
                self.pos += 1;

                if self.pos == xfer.len() {
                    self.finish();
                    return Some(Ok(()));
                }
                // NACK the last byte, and stop after it. RM0090, section 27.3.3, method 2.
                if xfer.len() - self.pos == 1 {
                    regs.cr1()
                        .modify(|_, w| w.ack().clear_bit().stop().set_bit());
                }
            }
            Phase::DmaTx => {
                let d = self.dma?;
                if sr1.btf().bit_is_set() && dma::status(d.tx).complete {
                    return self.stop_ok();
                }
            }
            Phase::DmaRx => {
                let d = self.dma?;
                if dma::status(d.rx).complete {
                    if xfer.len() == 1 {
                        // STOP was set with ADDR.
                        self.finish();
                        return Some(Ok(()));
                    }
                    return self.stop_ok();
                }
            }
        }
        None
    }
}

/// Stream, direction, and whether transfer complete interrupts. Writes finish on BTF, after
/// the last byte leaves the shift register; an enabled TC would fire again on every event
/// until then.
fn dma_stream(d: DmaPair, read: bool) -> (DmaSlot, Direction, bool) {
    if read {
        (d.rx, Direction::PeriphToMem, true)
    } else {
        (d.tx, Direction::MemToPeriph, false)
    }
}

impl BusHw for I2cPort {
    type Xfer = I2cXfer;

    fn periph(&self) -> Periph {
        self.channel.periph()
    }

    /// Enable and reset the peripheral clock, then configure the peripheral. RM0090, section
    /// 27.3.3: the peripheral input clock must be programmed in CR2 first, then the clock
    /// control registers, then PE.
    fn init(&mut self) -> Result<()> {
        let timing = I2cTiming::new(self.pclk, self.cfg.clk_speed_hz, self.cfg.duty_cycle)?;

        let rcc = unsafe { &(*RCC::ptr()) };
        match self.channel {
            I2cChannel::One => {
                rcc_en_reset!(apb1, i2c1, rcc);
            }
            I2cChannel::Two => {
                rcc_en_reset!(apb1, i2c2, rcc);
            }
            I2cChannel::Three => {
                rcc_en_reset!(apb1, i2c3, rcc);
            }
        }

        if let Some(d) = self.dma {
            dma::enable_clock(d.rx.periph);
            dma::enable_clock(d.tx.periph);
        }

        if let Some(pins) = self.pins {
            for pin in [pins.scl, pins.sda] {
                pin.output_type(OutputType::OpenDrain);
                pin.configure(PinMode::Alt(pins.af));
            }
            if self.regs().sr2().read().busy().bit_is_set() {
                self.recover_bus(&pins)?;
            }
        }

        let regs = self.regs();
        let cfg = &self.cfg;

        // Make sure the I2C unit is disabled so we can configure it
        regs.cr1().modify(|_, w| w.pe().clear_bit());

        // Configure bus frequency into I2C peripheral
        regs.cr2().write(|w| unsafe { w.freq().bits(timing.freq) });

        // Bit 14 of OAR1 must be kept at 1 by software.
        let oar1: u16 = match cfg.address_mode {
            AddressMode::SevenBit => (1 << 14) | ((cfg.own_address & 0x7f) << 1),
            AddressMode::TenBit => (1 << 15) | (1 << 14) | (cfg.own_address & 0x3ff),
        };
        regs.oar1().write(|w| unsafe { w.bits(oar1.into()) });

        // Configure correct rise times
        regs.trise()
            .write(|w| unsafe { w.trise().bits(timing.trise) });

        regs.ccr().write(|w| unsafe {
            w.f_s()
                .bit(timing.fast)
                .duty()
                .bit(timing.duty_16_9)
                .ccr()
                .bits(timing.ccr)
        });

        // Enable the I2C processing
        regs.cr1()
            .write(|w| w.nostretch().bit(!cfg.clock_stretch).pe().set_bit());

        self.phase = Phase::Idle;
        Ok(())
    }

    fn deinit(&mut self) {
        self.abort();

        let mut i = 0;
        while self.regs().cr1().read().stop().bit_is_set() && i < MAX_ITERS {
            i += 1;
        }
        self.regs().cr1().modify(|_, w| w.pe().clear_bit());

        let rcc = unsafe { &(*RCC::ptr()) };
        match self.channel {
            I2cChannel::One => {
                rcc_disable!(apb1, i2c1, rcc);
            }
            I2cChannel::Two => {
                rcc_disable!(apb1, i2c2, rcc);
            }
            I2cChannel::Three => {
                rcc_disable!(apb1, i2c3, rcc);
            }
        }
    }

    fn interrupts(&self) -> &[u16] {
        &self.irqs[..self.num_irqs]
    }

    /// Plain writes and reads, with 7-bit addressing. Register reads stay on the interrupt
    /// path.
    fn dma_capable(&self, xfer: &I2cXfer) -> bool {
        self.dma.is_some() && xfer.dir != I2cDir::ReadMem && !self.ten_bit()
    }

    /// RM0090, section 27.3.9: DMA requests. Events up to ADDR are still handled by interrupt;
    /// for reads, LAST makes the peripheral NACK the final byte.
    fn start_dma(&mut self, xfer: &I2cXfer) -> Result<()> {
        Self::check_len(xfer)?;
        let Some(d) = self.dma else {
            return Err(Error::Unsupported);
        };
        if xfer.dir == I2cDir::ReadMem {
            return Err(Error::Unsupported);
        }

        self.wait_idle()?;

        let read = xfer.is_read();
        let (slot, direction, tc_interrupt) = dma_stream(d, read);

        let cfg_result = dma::cfg_stream(
            slot,
            &StreamCfg {
                periph_addr: self.regs().dr() as *const _ as u32,
                mem_addr: xfer.buf_ptr() as u32,
                num_data: xfer.len() as u16,
                direction,
                mem_incr: true,
                priority: d.priority,
                tc_interrupt,
            },
        );
        if let Err(e) = cfg_result {
            dma::stop(slot);
            return Err(e);
        }

        self.dma_active = true;
        self.phase = Phase::Start { read };

        let regs = self.regs();
        regs.cr2().modify(|_, w| {
            w.dmaen().set_bit();
            w.last().bit(read);
            w.itbufen().clear_bit();
            w.itevten().set_bit();
            w.iterren().set_bit()
        });
        regs.cr1()
            .modify(|_, w| w.pos().clear_bit().ack().bit(read).start().set_bit());

        Ok(())
    }

    fn start_irq(&mut self, xfer: &I2cXfer) -> Result<()> {
        Self::check_len(xfer)?;
        self.wait_idle()?;

        self.pos = 0;
        self.dma_active = false;
        // 7-bit reads are addressed as reads right away; everything else starts as a write.
        let read = xfer.dir == I2cDir::Read && !self.ten_bit();
        self.phase = Phase::Start { read };

        let regs = self.regs();
        regs.cr2().modify(|_, w| {
            w.itbufen().set_bit();
            w.itevten().set_bit();
            w.iterren().set_bit()
        });
        regs.cr1()
            .modify(|_, w| w.pos().clear_bit().ack().set_bit().start().set_bit());

        Ok(())
    }

    fn service_irq(&mut self, xfer: &I2cXfer) -> Option<Result<()>> {
        if self.phase == Phase::Idle {
            return None;
        }

        if let Err(e) = self.check_and_clear_error_flags() {
            self.abort();
            return Some(Err(e));
        }

        if self.dma_active
            && let Some(d) = self.dma
        {
            let slot = if xfer.is_read() { d.rx } else { d.tx };
            if let Some(e) = dma::status(slot).error {
                self.abort();
                return Some(Err(e.into()));
            }
        }

        self.advance(xfer)
    }

    fn transfer_blocking(&mut self, xfer: &I2cXfer) -> Result<()> {
        Self::check_len(xfer)?;
        self.wait_idle()?;

        let result = self.blocking_inner(xfer);
        if result.is_err() && self.regs().sr2().read().msl().bit_is_set() {
            self.regs().cr1().modify(|_, w| w.stop().set_bit());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_writes_finish_on_btf() {
        let d = I2cChannel::One.default_dma();

        let (slot, dir, tc) = dma_stream(d, false);
        assert_eq!(slot, d.tx);
        assert_eq!(dir, Direction::MemToPeriph);
        assert!(!tc);

        let (slot, dir, tc) = dma_stream(d, true);
        assert_eq!(slot, d.rx);
        assert_eq!(dir, Direction::PeriphToMem);
        assert!(tc);
    }
}
