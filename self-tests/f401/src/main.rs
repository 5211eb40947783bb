//! Queued SPI writes on SPI1, driven by DMA interrupts, with a running count of completed
//! writes logged over RTT. It demonstrates setting up a shared bus array and routing its
//! interrupts to it.
//!
//! Pins: SCK PA5, MISO PA6, MOSI PA7, CS PA4.

#![deny(warnings)]
#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::NVIC;
use cortex_m_rt::entry; // The runtime

use hal::{
    Completion,
    gpio::{Pin, PinMode, Port},
    pac::{self, Interrupt, interrupt},
    spi::{SharedSpi, SpiBuses, SpiChannel, SpiConfig, SpiPort},
};

// Import the panic handler
use panic_probe as _;

// APB2 at reset, running from HSI.
const PCLK2: u32 = 16_000_000;

static SPI: SharedSpi<SpiPort> = SharedSpi::new();
static COMPLETED: AtomicU32 = AtomicU32::new(0);

static PAYLOAD: [u8; 8] = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04];

fn write_done(result: hal::Result<()>, ctx: usize) {
    match result {
        Ok(()) => {
            COMPLETED.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => defmt::warn!("write {} failed: {}", ctx, e),
    }
}

#[entry]
fn main() -> ! {
    rtt_target::rtt_init_defmt!();
    // Set up microcontroller peripherals
    let _dp = pac::Peripherals::take().unwrap();

    defmt::println!("SPI queue demo");

    for pin in 5..=7 {
        Pin::new(Port::A, pin).configure(PinMode::Alt(5));
    }
    let cs = Pin::new(Port::A, 4).configure(PinMode::Output);
    cs.set_high();

    let port = SpiPort::new(SpiChannel::One, SpiConfig::default(), PCLK2).unwrap();
    let mut buses = SpiBuses::new();
    buses.init(SpiChannel::One, port).unwrap();
    SPI.install(buses);

    unsafe {
        NVIC::unmask(Interrupt::SPI1);
        NVIC::unmask(Interrupt::DMA2_STREAM2);
        NVIC::unmask(Interrupt::DMA2_STREAM3);
    }

    let mut ctx = 0;
    loop {
        SPI.task();

        if !SPI.is_busy(SpiChannel::One) {
            let queued = SPI.with(|b| {
                b.write(
                    SpiChannel::One,
                    &PAYLOAD,
                    Some(cs),
                    Completion::new(write_done, ctx),
                )
            });
            if let Ok(Err(e)) = queued {
                defmt::warn!("queue: {}", e);
            }
            ctx += 1;
        }

        if ctx % 10_000 == 0 {
            defmt::debug!("{} writes completed", COMPLETED.load(Ordering::Relaxed));
        }
    }
}

#[interrupt]
fn SPI1() {
    SPI.on_interrupt(Interrupt::SPI1);
}

#[interrupt]
fn DMA2_STREAM2() {
    SPI.on_interrupt(Interrupt::DMA2_STREAM2);
}

#[interrupt]
fn DMA2_STREAM3() {
    SPI.on_interrupt(Interrupt::DMA2_STREAM3);
}

// same panicking *behavior* as `panic-probe` but doesn't print a panic message
// this prevents the panic message being printed *twice* when `defmt::panic` is invoked
#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
