// On-target tests of the SPI queue.

// This test requires a wire between MOSI and MISO of SPI1:
// * pa7 <-> pa6
//
// Interrupts stay masked; tests service them by polling the bus array's interrupt entry.

#![deny(warnings)]
#![no_std]
#![no_main]

#[cfg(test)]
#[embedded_test::tests(setup = rtt_target::rtt_init_defmt!())]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use hal::{
        Completion, Error,
        dma::DmaPair,
        gpio::{Pin, PinMode, Port},
        pac::Interrupt,
        spi::{SharedSpi, SpiBuses, SpiChannel, SpiConfig, SpiPort},
    };

    const PCLK2: u32 = 16_000_000;
    const MAX_WAIT: u32 = 100_000;

    static SPI: SharedSpi<SpiPort> = SharedSpi::new();
    static DONE: AtomicU32 = AtomicU32::new(0);
    static FAILED: AtomicU32 = AtomicU32::new(0);

    static TX: [u8; 6] = [0x55, 0xaa, 0x00, 0xff, 0x12, 0x34];
    static mut RX: [u8; 6] = [0; 6];

    fn on_done(result: hal::Result<()>, _ctx: usize) {
        match result {
            Ok(()) => DONE.fetch_add(1, Ordering::SeqCst),
            Err(_) => FAILED.fetch_add(1, Ordering::SeqCst),
        };
    }

    fn setup(dma: Option<DmaPair>) -> Pin {
        for pin in 5..=7 {
            Pin::new(Port::A, pin).configure(PinMode::Alt(5));
        }
        let cs = Pin::new(Port::A, 4).configure(PinMode::Output);
        cs.set_high();

        // Release the previous test's array, if any, so its channel can be set up again.
        if let Some(mut old) = SPI.take() {
            let _ = old.deinit(SpiChannel::One);
        }

        let port = SpiPort::new(SpiChannel::One, SpiConfig::default(), PCLK2)
            .unwrap()
            .with_dma(dma);
        let mut buses = SpiBuses::new();
        buses.init(SpiChannel::One, port).unwrap();
        SPI.install(buses);

        DONE.store(0, Ordering::SeqCst);
        FAILED.store(0, Ordering::SeqCst);
        cs
    }

    /// Service interrupts and the dispatch loop until the channel is idle.
    fn drain(irqs: &[Interrupt]) {
        for _ in 0..MAX_WAIT {
            for irq in irqs {
                SPI.on_interrupt(*irq);
            }
            SPI.task();
            if !SPI.is_busy(SpiChannel::One) {
                return;
            }
        }
        defmt::panic!("bus never went idle");
    }

    #[test]
    fn blocking_loopback() {
        let cs = setup(None);
        let mut rx = [0; 6];

        SPI.write_read_blocking(SpiChannel::One, &TX, &mut rx, Some(cs), MAX_WAIT)
            .unwrap();
        defmt::assert_eq!(rx, TX);
        defmt::assert!(cs.is_high());
    }

    #[test]
    fn queued_loopback_irq() {
        let cs = setup(None);

        #[allow(static_mut_refs)]
        let rx = unsafe { &mut RX };
        rx.fill(0);

        SPI.with(|b| {
            b.write_read(SpiChannel::One, &TX, rx, Some(cs), Completion::new(on_done, 0))
        })
        .unwrap()
        .unwrap();

        drain(&[Interrupt::SPI1]);

        defmt::assert_eq!(DONE.load(Ordering::SeqCst), 1);
        defmt::assert_eq!(FAILED.load(Ordering::SeqCst), 0);
        #[allow(static_mut_refs)]
        let rx = unsafe { &RX };
        defmt::assert_eq!(*rx, TX);
    }

    #[test]
    fn queued_loopback_dma() {
        let cs = setup(Some(SpiChannel::One.default_dma()));

        #[allow(static_mut_refs)]
        let rx = unsafe { &mut RX };
        rx.fill(0);

        SPI.with(|b| {
            b.write_read(SpiChannel::One, &TX, rx, Some(cs), Completion::new(on_done, 0))
        })
        .unwrap()
        .unwrap();

        drain(&[Interrupt::SPI1, Interrupt::DMA2_STREAM2, Interrupt::DMA2_STREAM3]);

        defmt::assert_eq!(DONE.load(Ordering::SeqCst), 1);
        #[allow(static_mut_refs)]
        let rx = unsafe { &RX };
        defmt::assert_eq!(*rx, TX);
    }

    #[test]
    fn queue_overflow_rejected() {
        let cs = setup(None);

        for i in 0..hal::QUEUE_LEN {
            SPI.with(|b| b.write(SpiChannel::One, &TX, Some(cs), Completion::new(on_done, i)))
                .unwrap()
                .unwrap();
        }
        let overflow = SPI
            .with(|b| b.write(SpiChannel::One, &TX, Some(cs), Completion::new(on_done, 99)))
            .unwrap();
        defmt::assert_eq!(overflow, Err(Error::QueueFull));

        drain(&[Interrupt::SPI1]);
        defmt::assert_eq!(DONE.load(Ordering::SeqCst), hal::QUEUE_LEN as u32);
    }
}
