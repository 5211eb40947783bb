//! F4 register-level SPI driver. Master mode, 8-bit frames, software chip select.

use core::sync::atomic::AtomicU8;

use cortex_m::interrupt::InterruptNumber;

use super::*;
use crate::{
    MAX_ITERS, bounded_loop,
    bus::BusHw,
    diag::Periph,
    dma::{self, DmaPair, DmaPeriph, DmaSlot, DmaStream, Direction, Priority, StreamCfg},
    error::{Error, Result},
    pac::{self, Interrupt, RCC, spi1},
    util::{rcc_disable, rcc_en_reset},
};

// Sink for received bytes on DMA writes, and source of filler bytes on DMA reads.
static DUMMY_RX: AtomicU8 = AtomicU8::new(0);
static DUMMY_TX: u8 = 0xff;

impl SpiChannel {
    /// Default DMA streams. RM0090, tables 42 and 43. These can collide with the defaults
    /// of other peripherals; override them with `SpiPort::with_dma` if so.
    pub fn default_dma(self) -> DmaPair {
        use DmaPeriph::*;
        use DmaStream::*;

        let (rx, tx) = match self {
            Self::One => (DmaSlot::new(Dma2, S2, 3), DmaSlot::new(Dma2, S3, 3)),
            Self::Two => (DmaSlot::new(Dma1, S3, 0), DmaSlot::new(Dma1, S4, 0)),
            Self::Three => (DmaSlot::new(Dma1, S0, 0), DmaSlot::new(Dma1, S5, 0)),
            Self::Four => (DmaSlot::new(Dma2, S0, 4), DmaSlot::new(Dma2, S1, 4)),
        };
        DmaPair {
            rx,
            tx,
            priority: Priority::Medium,
        }
    }

    fn periph(self) -> Periph {
        match self {
            Self::One => Periph::Spi1,
            Self::Two => Periph::Spi2,
            Self::Three => Periph::Spi3,
            Self::Four => Periph::Spi4,
        }
    }
}

/// Hardware binding for one SPI peripheral.
pub struct SpiPort {
    channel: SpiChannel,
    regs: *const spi1::RegisterBlock,
    cfg: SpiConfig,
    pclk: u32,
    dma: Option<DmaPair>,
    irqs: [u16; 3],
    num_irqs: usize,
    /// Bytes exchanged so far, on the interrupt path.
    pos: usize,
    dma_active: bool,
}

// The register block is only accessed through the owning bus handle.
unsafe impl Send for SpiPort {}

impl SpiPort {
    /// `pclk` is the clock of the APB bus the peripheral sits on, in Hz: APB2 for SPI1 and
    /// SPI4, APB1 for SPI2 and SPI3. Chip-select pins must be configured as outputs, and
    /// driven high, by the application.
    pub fn new(channel: SpiChannel, cfg: SpiConfig, pclk: u32) -> Result<Self> {
        let regs = match channel {
            SpiChannel::One => pac::SPI1::ptr(),
            SpiChannel::Two => pac::SPI2::ptr() as *const spi1::RegisterBlock,
            SpiChannel::Three => pac::SPI3::ptr() as *const spi1::RegisterBlock,
            #[cfg(spi4)]
            SpiChannel::Four => pac::SPI4::ptr() as *const spi1::RegisterBlock,
            #[cfg(not(spi4))]
            SpiChannel::Four => return Err(Error::Unsupported),
        };

        let dma = cfg.use_dma.then(|| channel.default_dma());

        let mut result = Self {
            channel,
            regs,
            cfg,
            pclk,
            dma: None,
            irqs: [0; 3],
            num_irqs: 0,
            pos: 0,
            dma_active: false,
        };
        result.set_dma(dma);
        Ok(result)
    }

    /// Use these DMA streams, or with `None`, interrupts only.
    pub fn with_dma(mut self, dma: Option<DmaPair>) -> Self {
        self.set_dma(dma);
        self
    }

    fn set_dma(&mut self, dma: Option<DmaPair>) {
        let periph_irq = match self.channel {
            SpiChannel::One => Interrupt::SPI1,
            SpiChannel::Two => Interrupt::SPI2,
            SpiChannel::Three => Interrupt::SPI3,
            #[cfg(spi4)]
            SpiChannel::Four => Interrupt::SPI4,
            // Unreachable; `new` refuses it.
            #[cfg(not(spi4))]
            SpiChannel::Four => Interrupt::SPI1,
        };

        self.irqs[0] = periph_irq.number();
        self.num_irqs = 1;
        if let Some(d) = dma {
            self.irqs[1] = dma::irq(d.rx);
            self.irqs[2] = dma::irq(d.tx);
            self.num_irqs = 3;
        }
        self.dma = dma;
    }

    fn regs(&self) -> &'static spi1::RegisterBlock {
        unsafe { &*self.regs }
    }

    fn check_len(xfer: &SpiXfer) -> Result<()> {
        if xfer.is_empty() || xfer.len() > u16::MAX as usize {
            return Err(Error::InvalidLength);
        }
        Ok(())
    }

    fn check_errors(&self) -> Result<()> {
        let sr = self.regs().sr().read();

        if sr.ovr().bit_is_set() {
            // Cleared by reading DR, then SR.
            let _ = self.regs().dr().read();
            let _ = self.regs().sr().read();
            return Err(SpiError::Overrun.into());
        } else if sr.modf().bit_is_set() {
            // Cleared by reading SR, then writing CR1. MSTR and SPE dropped with the fault.
            self.regs()
                .cr1()
                .modify(|_, w| w.mstr().set_bit().spe().set_bit());
            return Err(SpiError::ModeFault.into());
        } else if sr.crcerr().bit_is_set() {
            self.regs().sr().modify(|_, w| w.crcerr().clear_bit());
            return Err(SpiError::Crc.into());
        }
        Ok(())
    }

    /// Discard a stale received byte, and any overrun flag with it.
    fn flush_rx(&self) {
        let regs = self.regs();
        if regs.sr().read().rxne().bit_is_set() || regs.sr().read().ovr().bit_is_set() {
            let _ = regs.dr().read();
            let _ = regs.sr().read();
        }
    }

    /// Write a single byte if available, or block until it's available.
    fn write_one(&self, byte: u8) -> Result<()> {
        self.check_errors()?;

        bounded_loop!(
            self.regs().sr().read().txe().bit_is_clear(),
            SpiError::Hardware
        );

        self.regs().dr().write(|w| unsafe { w.bits(byte.into()) });
        Ok(())
    }

    /// Read a single byte if available, or block until it's available.
    fn read_one(&self) -> Result<u8> {
        bounded_loop!(
            self.regs().sr().read().rxne().bit_is_clear(),
            SpiError::Hardware,
            {
                self.check_errors()?;
            }
        );

        Ok(self.regs().dr().read().bits() as u8)
    }

    fn stop_irq(&self) {
        self.regs()
            .cr2()
            .modify(|_, w| w.rxneie().clear_bit().errie().clear_bit());
    }

    fn stop_dma(&mut self) {
        self.regs().cr2().modify(|_, w| {
            w.txdmaen().clear_bit();
            w.rxdmaen().clear_bit();
            w.errie().clear_bit()
        });
        if let Some(d) = self.dma {
            dma::stop(d.tx);
            dma::stop(d.rx);
        }
        self.dma_active = false;
    }

    fn service_dma(&mut self) -> Option<Result<()>> {
        let d = self.dma?;
        let rx = dma::status(d.rx);
        let tx = dma::status(d.tx);

        if let Some(e) = rx.error.or(tx.error) {
            self.stop_dma();
            return Some(Err(e.into()));
        }
        if let Err(e) = self.check_errors() {
            self.stop_dma();
            return Some(Err(e));
        }

        // The receive stream finishing means every byte has been clocked out and in.
        if rx.complete {
            self.stop_dma();
            return Some(Ok(()));
        }
        None
    }
}

impl BusHw for SpiPort {
    type Xfer = SpiXfer;

    fn periph(&self) -> Periph {
        self.channel.periph()
    }

    /// Initialize an SPI peripheral, including configuration register writes, and enabling and resetting
    /// its RCC peripheral clock.
    fn init(&mut self) -> Result<()> {
        if self.cfg.role == SpiRole::Slave {
            return Err(Error::Unsupported);
        }

        let rcc = unsafe { &(*RCC::ptr()) };
        match self.channel {
            SpiChannel::One => {
                rcc_en_reset!(apb2, spi1, rcc);
            }
            SpiChannel::Two => {
                rcc_en_reset!(apb1, spi2, rcc);
            }
            SpiChannel::Three => {
                rcc_en_reset!(apb1, spi3, rcc);
            }
            #[cfg(spi4)]
            SpiChannel::Four => {
                rcc_en_reset!(apb2, spi4, rcc);
            }
            #[cfg(not(spi4))]
            SpiChannel::Four => return Err(Error::Unsupported),
        }

        if let Some(d) = self.dma {
            dma::enable_clock(d.rx.periph);
            dma::enable_clock(d.tx.periph);
        }

        let baud_rate = BaudRate::from_hz(self.pclk, self.cfg.clk_speed_hz);
        let cfg = &self.cfg;

        // RM0090, section 28.3.3: Configuring the SPI in master mode
        self.regs().cr1().write(|w| unsafe {
            // a) Configure the serial clock baud rate using the BR[2:0] bits
            w.br().bits(baud_rate as u8);
            // b) Configure the CPOL and CPHA bits
            w.cpol().bit(cfg.mode.polarity as u8 != 0);
            w.cpha().bit(cfg.mode.phase as u8 != 0);
            // c) 8-bit frames, full duplex.
            w.dff().clear_bit();
            w.bidimode().clear_bit();
            w.rxonly().clear_bit();
            // d) Configure the LSBFIRST bit to define the frame format.
            w.lsbfirst().bit(cfg.bit_order == BitOrder::LsbFirst);
            w.crcen().clear_bit();
            // e) Software slave management; chip selects are GPIOs.
            w.ssm().set_bit();
            w.ssi().set_bit();
            w.mstr().set_bit();
            w.spe().set_bit()
        });

        self.regs().cr2().write(|w| w.ssoe().clear_bit());

        Ok(())
    }

    /// RM0090, section 28.3.8: Disabling the SPI.
    fn deinit(&mut self) {
        self.stop_irq();
        if self.dma.is_some() {
            self.stop_dma();
        }

        let mut i = 0;
        while self.regs().sr().read().bsy().bit_is_set() && i < MAX_ITERS {
            i += 1;
        }
        self.regs().cr1().modify(|_, w| w.spe().clear_bit());

        let rcc = unsafe { &(*RCC::ptr()) };
        match self.channel {
            SpiChannel::One => {
                rcc_disable!(apb2, spi1, rcc);
            }
            SpiChannel::Two => {
                rcc_disable!(apb1, spi2, rcc);
            }
            SpiChannel::Three => {
                rcc_disable!(apb1, spi3, rcc);
            }
            #[cfg(spi4)]
            SpiChannel::Four => {
                rcc_disable!(apb2, spi4, rcc);
            }
            #[cfg(not(spi4))]
            SpiChannel::Four => (),
        }
    }

    fn interrupts(&self) -> &[u16] {
        &self.irqs[..self.num_irqs]
    }

    fn dma_capable(&self, _xfer: &SpiXfer) -> bool {
        self.dma.is_some()
    }

    /// RM0090, section 28.3.9: Communication using DMA. Both streams always run; writes
    /// discard what they receive, and reads transmit 0xff.
    fn start_dma(&mut self, xfer: &SpiXfer) -> Result<()> {
        Self::check_len(xfer)?;
        let Some(d) = self.dma else {
            return Err(Error::Unsupported);
        };

        self.flush_rx();

        let periph_addr = self.regs().dr() as *const _ as u32;
        let num_data = xfer.len() as u16;

        let (rx_addr, rx_incr) = if xfer.rx_ptr().is_null() {
            (DUMMY_RX.as_ptr() as u32, false)
        } else {
            (xfer.rx_ptr() as u32, true)
        };
        let (tx_addr, tx_incr) = if xfer.tx_ptr().is_null() {
            (&DUMMY_TX as *const u8 as u32, false)
        } else {
            (xfer.tx_ptr() as u32, true)
        };

        // 1. Enable DMA Rx buffer in the RXDMAEN bit.
        self.regs().cr2().modify(|_, w| w.rxdmaen().set_bit());

        // 2. Enable DMA streams for Tx and Rx.
        let streams = dma::cfg_stream(
            d.rx,
            &StreamCfg {
                periph_addr,
                mem_addr: rx_addr,
                num_data,
                direction: Direction::PeriphToMem,
                mem_incr: rx_incr,
                priority: d.priority,
                tc_interrupt: true,
            },
        )
        .and_then(|_| {
            dma::cfg_stream(
                d.tx,
                &StreamCfg {
                    periph_addr,
                    mem_addr: tx_addr,
                    num_data,
                    direction: Direction::MemToPeriph,
                    mem_incr: tx_incr,
                    priority: d.priority,
                    tc_interrupt: false,
                },
            )
        });

        if let Err(e) = streams {
            self.stop_dma();
            return Err(e);
        }

        self.dma_active = true;

        // 3. Enable DMA Tx buffer in the TXDMAEN bit. This starts the transfer.
        self.regs()
            .cr2()
            .modify(|_, w| w.txdmaen().set_bit().errie().set_bit());

        Ok(())
    }

    /// One byte in flight at a time: each RXNE interrupt stores the received byte and sends
    /// the next.
    fn start_irq(&mut self, xfer: &SpiXfer) -> Result<()> {
        Self::check_len(xfer)?;

        self.flush_rx();
        self.pos = 0;
        self.dma_active = false;

        self.regs()
            .cr2()
            .modify(|_, w| w.rxneie().set_bit().errie().set_bit());

        let first = unsafe { xfer.tx_byte(0) };
        self.regs().dr().write(|w| unsafe { w.bits(first.into()) });
        Ok(())
    }

    fn service_irq(&mut self, xfer: &SpiXfer) -> Option<Result<()>> {
        if self.dma_active {
            return self.service_dma();
        }

        if let Err(e) = self.check_errors() {
            self.stop_irq();
            return Some(Err(e));
        }

        let regs = self.regs();
        if regs.sr().read().rxne().bit_is_clear() {
            return None;
        }

        let byte = regs.dr().read().bits() as u8;
        unsafe { xfer.store_rx(self.pos, byte) };
        self.pos += 1;

        if self.pos < xfer.len() {
            let next = unsafe { xfer.tx_byte(self.pos) };
            regs.dr().write(|w| unsafe { w.bits(next.into()) });
            None
        } else {
            self.stop_irq();
            Some(Ok(()))
        }
    }

    fn transfer_blocking(&mut self, xfer: &SpiXfer) -> Result<()> {
        if xfer.is_empty() {
            return Err(Error::InvalidLength);
        }

        self.flush_rx();

        for i in 0..xfer.len() {
            self.write_one(unsafe { xfer.tx_byte(i) })?;
            let byte = self.read_one()?;
            unsafe { xfer.store_rx(i, byte) };
        }

        bounded_loop!(
            self.regs().sr().read().bsy().bit_is_set(),
            Error::RegisterUnchanged
        );
        Ok(())
    }

    fn select(&mut self, xfer: &SpiXfer) {
        if let Some(cs) = xfer.cs {
            cs.set_low();
        }
    }

    fn deselect(&mut self, xfer: &SpiXfer) {
        if let Some(cs) = xfer.cs {
            cs.set_high();
        }
    }
}
