//! Owned bus arrays indexed by typed channels, and interrupt routing.
//!
//! A [`BusArray`] holds one [`Bus`] per channel of a bus type. Initializing a channel records
//! its interrupt numbers in an [`IrqTable`], so an interrupt handler only needs to pass the
//! number of the interrupt that fired.
//!
//! [`SharedBuses`] wraps an array for use from a `static`: thread code and interrupt handlers
//! each get exclusive access inside a critical section.
//!
//! Example, with SPI1 on the DMA path:
//! ```ignore
//! static SPI: SharedBuses<SpiChannel, SpiPort, SPI_CHANNELS> = SharedBuses::new();
//!
//! let mut buses = BusArray::new();
//! buses.init(SpiChannel::One, SpiPort::new(SpiChannel::One, cfg, pclk2))?;
//! SPI.install(buses);
//!
//! #[interrupt]
//! fn DMA2_STREAM2() {
//!     SPI.on_interrupt(pac::Interrupt::DMA2_STREAM2);
//! }
//! ```

use core::{cell::RefCell, marker::PhantomData};

use cortex_m::interrupt::InterruptNumber;
use critical_section::Mutex;

use crate::{
    bus::{Bus, BusHw, Completion},
    error::{Error, Result},
    queue::{QUEUE_LEN, XferId},
};

/// Maximum number of interrupts routed per bus array.
pub const MAX_IRQS: usize = 16;

/// A bus channel usable as an array index; eg `SpiChannel`.
pub trait ChannelId: Copy {
    fn index(self) -> usize;
}

/// Fixed table mapping interrupt numbers to channel indices.
pub struct IrqTable<const M: usize = MAX_IRQS> {
    entries: [Option<(u16, usize)>; M],
}

impl<const M: usize> Default for IrqTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const M: usize> IrqTable<M> {
    pub const fn new() -> Self {
        Self { entries: [None; M] }
    }

    /// Route `irq` to `channel`. Registering the same pair twice is a no-op; routing an
    /// interrupt that already belongs to another channel fails.
    pub fn register(&mut self, irq: u16, channel: usize) -> Result<()> {
        match self.lookup(irq) {
            Some(c) if c == channel => return Ok(()),
            Some(_) => return Err(Error::IrqConflict),
            None => (),
        }

        let slot = self
            .entries
            .iter_mut()
            .find(|e| e.is_none())
            .ok_or(Error::IrqTableFull)?;
        *slot = Some((irq, channel));
        Ok(())
    }

    /// Remove every route to `channel`.
    pub fn unregister(&mut self, channel: usize) {
        for e in self.entries.iter_mut() {
            if matches!(e, Some((_, c)) if *c == channel) {
                *e = None;
            }
        }
    }

    pub fn lookup(&self, irq: u16) -> Option<usize> {
        self.entries
            .iter()
            .flatten()
            .find(|(i, _)| *i == irq)
            .map(|(_, c)| *c)
    }
}

/// One bus handle per channel, plus interrupt routing.
pub struct BusArray<C, H: BusHw, const CH: usize, const N: usize = QUEUE_LEN> {
    buses: [Option<Bus<H, N>>; CH],
    irqs: IrqTable,
    _channel: PhantomData<C>,
}

impl<C: ChannelId, H: BusHw, const CH: usize, const N: usize> Default for BusArray<C, H, CH, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ChannelId, H: BusHw, const CH: usize, const N: usize> BusArray<C, H, CH, N> {
    pub fn new() -> Self {
        Self {
            buses: [const { None }; CH],
            irqs: IrqTable::new(),
            _channel: PhantomData,
        }
    }

    /// Bind `hw` to `channel`, initialize it, and route its interrupts. Re-initializing a
    /// channel is refused while it has transfers outstanding.
    pub fn init(&mut self, channel: C, hw: H) -> Result<()> {
        let i = channel.index();
        if i >= CH {
            return Err(Error::Unsupported);
        }
        if self.buses[i].as_ref().is_some_and(|b| b.is_busy()) {
            return Err(Error::Busy);
        }

        self.irqs.unregister(i);

        let mut bus = Bus::new(hw);
        bus.init()?;

        let routed = bus
            .hw()
            .interrupts()
            .iter()
            .try_for_each(|&irq| self.irqs.register(irq, i));

        if let Err(e) = routed {
            self.irqs.unregister(i);
            let _ = bus.deinit();
            return Err(e);
        }

        self.buses[i] = Some(bus);
        Ok(())
    }

    /// Shut a channel down and drop its interrupt routes.
    pub fn deinit(&mut self, channel: C) -> Result<()> {
        let bus = self.bus_mut(channel)?;
        bus.deinit()?;

        let i = channel.index();
        self.irqs.unregister(i);
        self.buses[i] = None;
        Ok(())
    }

    pub fn bus(&self, channel: C) -> Option<&Bus<H, N>> {
        self.buses.get(channel.index())?.as_ref()
    }

    pub fn bus_mut(&mut self, channel: C) -> Result<&mut Bus<H, N>> {
        self.buses
            .get_mut(channel.index())
            .and_then(|b| b.as_mut())
            .ok_or(Error::NotInitialized)
    }

    pub fn is_init(&self, channel: C) -> bool {
        self.bus(channel).is_some_and(|b| b.is_init())
    }

    /// Uninitialized channels are never busy.
    pub fn is_busy(&self, channel: C) -> bool {
        self.bus(channel).is_some_and(|b| b.is_busy())
    }

    pub fn submit(&mut self, channel: C, xfer: H::Xfer, done: Completion) -> Result<XferId> {
        self.bus_mut(channel)?.submit(xfer, done)
    }

    /// See [`Bus::withdraw`].
    pub fn withdraw(&mut self, channel: C, id: XferId) -> bool {
        self.bus_mut(channel).is_ok_and(|b| b.withdraw(id))
    }

    /// Run the dispatch loop of every channel.
    pub fn task(&mut self) {
        for bus in self.buses.iter_mut().flatten() {
            bus.task();
        }
    }

    /// Route an interrupt to the channel that registered it. Unknown interrupts are ignored.
    pub fn on_interrupt(&mut self, irq: u16) {
        let Some(i) = self.irqs.lookup(irq) else {
            return;
        };
        if let Some(bus) = self.buses[i].as_mut() {
            bus.on_interrupt();
        }
    }

    pub fn transfer_now(&mut self, channel: C, xfer: &H::Xfer) -> Result<()> {
        self.bus_mut(channel)?.transfer_now(xfer)
    }
}

/// A [`BusArray`] shared between thread code and interrupt handlers.
pub struct SharedBuses<C, H: BusHw, const CH: usize, const N: usize = QUEUE_LEN> {
    inner: Mutex<RefCell<Option<BusArray<C, H, CH, N>>>>,
}

impl<C: ChannelId, H: BusHw, const CH: usize, const N: usize> Default
    for SharedBuses<C, H, CH, N>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ChannelId, H: BusHw, const CH: usize, const N: usize> SharedBuses<C, H, CH, N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    /// Hand the initialized array over, replacing any previous one.
    pub fn install(&self, buses: BusArray<C, H, CH, N>) {
        critical_section::with(|cs| {
            self.inner.borrow(cs).replace(Some(buses));
        });
    }

    /// Take the array back out; eg to reconfigure channels.
    pub fn take(&self) -> Option<BusArray<C, H, CH, N>> {
        critical_section::with(|cs| self.inner.borrow(cs).take())
    }

    /// Run `f` with exclusive access to the array, inside a critical section.
    pub fn with<R>(&self, f: impl FnOnce(&mut BusArray<C, H, CH, N>) -> R) -> Result<R> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow(cs).borrow_mut();
            inner.as_mut().map(f).ok_or(Error::NotInitialized)
        })
    }

    pub fn submit(&self, channel: C, xfer: H::Xfer, done: Completion) -> Result<XferId> {
        self.with(|b| b.submit(channel, xfer, done))?
    }

    pub fn withdraw(&self, channel: C, id: XferId) -> bool {
        self.with(|b| b.withdraw(channel, id)).unwrap_or(false)
    }

    pub fn is_busy(&self, channel: C) -> bool {
        self.with(|b| b.is_busy(channel)).unwrap_or(false)
    }

    /// Dispatch loop; call from thread context.
    pub fn task(&self) {
        let _ = self.with(|b| b.task());
    }

    /// Call from each interrupt handler registered by the channels.
    pub fn on_interrupt(&self, irq: impl InterruptNumber) {
        let _ = self.with(|b| b.on_interrupt(irq.number()));
    }

    /// Wait for `channel` to drain its queue, then run `xfer` directly, bypassing the queue.
    ///
    /// The dispatch loop runs on each wait iteration, and the critical section is released
    /// between iterations so completion interrupts can fire. Gives up with `BusyTimeout` after
    /// `max_iters` iterations.
    pub fn transfer_blocking(&self, channel: C, xfer: &H::Xfer, max_iters: u32) -> Result<()> {
        let mut i = 0;
        loop {
            let busy = self.with(|b| {
                b.task();
                b.is_busy(channel)
            })?;
            if !busy {
                break;
            }

            i += 1;
            if i >= max_iters {
                return Err(self.with(|b| b.bus_mut(channel).map(|bus| bus.busy_timeout()))??);
            }
        }

        self.with(|b| b.transfer_now(channel, xfer))?
    }
}
