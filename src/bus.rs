//! Per-channel transfer engine: a bounded queue of pending transfers, with at most one in
//! flight on the hardware at a time.
//!
//! Transfers are dispatched from thread context by [`Bus::submit`] and [`Bus::task`], and
//! finished from interrupt context by [`Bus::on_interrupt`] / [`Bus::complete`]. The in-flight
//! transfer stays at the front of the queue until `task` retires it, so a completed but not yet
//! retired transfer still occupies a slot.
//!
//! ```text
//! Idle --start ok--> Busy --ISR--> Done(Ok | Err) --task--> Idle
//!   ^                                                        |
//!   +-------- start failed: callback(Err), next entry -------+
//! ```

use crate::{
    diag::{self, ErrorKind, Periph},
    error::{Error, Result},
    queue::{QUEUE_LEN, XferId, XferQueue},
};

/// Completion callback: the transfer result and the context value supplied with it. Runs in
/// interrupt context for transfers that started on the hardware, and in the caller's context
/// for transfers that failed to start. It must not call back into the bus.
pub type XferCallback = fn(Result<()>, usize);

/// Callback plus its opaque context.
#[derive(Clone, Copy)]
pub struct Completion {
    pub callback: Option<XferCallback>,
    pub ctx: usize,
}

impl Completion {
    pub const fn new(callback: XferCallback, ctx: usize) -> Self {
        Self {
            callback: Some(callback),
            ctx,
        }
    }

    /// Fire and forget.
    pub const fn none() -> Self {
        Self {
            callback: None,
            ctx: 0,
        }
    }

    fn fire(&self, result: Result<()>) {
        if let Some(cb) = self.callback {
            cb(result, self.ctx);
        }
    }
}

/// Hardware binding for one bus channel. Implemented by the register-level drivers, and by
/// mocks in tests.
pub trait BusHw {
    /// Transfer descriptor. It's copied into the queue; any buffers it points to must stay
    /// valid until its callback fires.
    type Xfer: Copy;

    fn periph(&self) -> Periph;

    /// Enable clocks and configure the peripheral.
    fn init(&mut self) -> Result<()>;

    fn deinit(&mut self);

    /// Interrupt numbers that should be routed to this channel.
    fn interrupts(&self) -> &[u16] {
        &[]
    }

    /// Whether `xfer` can use the DMA path. DMA is preferred when available.
    fn dma_capable(&self, _xfer: &Self::Xfer) -> bool {
        false
    }

    fn start_dma(&mut self, _xfer: &Self::Xfer) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn start_irq(&mut self, xfer: &Self::Xfer) -> Result<()>;

    /// Handle a pending interrupt for the transfer in flight. Returns `Some` once the transfer
    /// has finished, successfully or not.
    fn service_irq(&mut self, xfer: &Self::Xfer) -> Option<Result<()>>;

    /// Perform the whole transfer, blocking until it completes.
    fn transfer_blocking(&mut self, xfer: &Self::Xfer) -> Result<()>;

    /// Assert the target's select line, if it has one.
    fn select(&mut self, _xfer: &Self::Xfer) {}

    fn deselect(&mut self, _xfer: &Self::Xfer) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusState {
    /// Nothing in flight. The queue is empty unless the bus is uninitialized.
    Idle,
    /// The front of the queue is running on the hardware.
    Busy,
    /// The front of the queue has finished; waiting for `task` to retire it.
    Done(Result<()>),
}

/// Running counters, per bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusStats {
    /// Transfers retired without error.
    pub completed: u32,
    /// Transfers rejected with a full queue.
    pub overflows: u32,
    pub start_failures: u32,
    /// Transfers the hardware finished with an error.
    pub xfer_errors: u32,
    pub busy_timeouts: u32,
    pub dma_starts: u32,
    pub irq_starts: u32,
}

#[derive(Clone, Copy)]
struct Pending<X> {
    xfer: X,
    done: Completion,
}

/// Bus handle: the hardware binding, its queue, and the state of the transfer in flight.
pub struct Bus<H: BusHw, const N: usize = QUEUE_LEN> {
    hw: H,
    is_init: bool,
    state: BusState,
    queue: XferQueue<Pending<H::Xfer>, N>,
    next_id: u32,
    stats: BusStats,
}

impl<H: BusHw, const N: usize> Bus<H, N> {
    pub fn new(hw: H) -> Self {
        Self {
            hw,
            is_init: false,
            state: BusState::Idle,
            queue: XferQueue::new(),
            next_id: 0,
            stats: BusStats::default(),
        }
    }

    /// Initialize the hardware. Calling this on an initialized bus does nothing.
    pub fn init(&mut self) -> Result<()> {
        if self.is_init {
            return Ok(());
        }

        if let Err(e) = self.hw.init() {
            diag::report(ErrorKind::Init, self.hw.periph());
            return Err(e);
        }

        self.is_init = true;
        crate::debug!("{} initialized", self.hw.periph());
        Ok(())
    }

    /// Shut the hardware down. Refused while a transfer is in flight or queued; transfers in
    /// flight can't be cancelled.
    pub fn deinit(&mut self) -> Result<()> {
        if !self.is_init {
            return Ok(());
        }
        if self.is_busy() {
            return Err(Error::Busy);
        }

        self.hw.deinit();
        self.is_init = false;
        crate::debug!("{} deinitialized", self.hw.periph());
        Ok(())
    }

    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    /// A transfer is in flight, awaiting retirement, or queued.
    pub fn is_busy(&self) -> bool {
        self.state != BusState::Idle || !self.queue.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        !self.is_busy()
    }

    /// Number of queue slots in use, including the transfer in flight.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    pub fn periph(&self) -> Periph {
        self.hw.periph()
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Queue a transfer, and start it right away if the bus is idle.
    ///
    /// If the queue is full the transfer is rejected with `QueueFull`, and its callback never
    /// runs. If it's accepted but fails to start, its callback runs with the error before this
    /// returns.
    pub fn submit(&mut self, xfer: H::Xfer, done: Completion) -> Result<XferId> {
        if !self.is_init {
            return Err(Error::NotInitialized);
        }

        let id = XferId(self.next_id);
        if self.queue.push(id, Pending { xfer, done }).is_err() {
            self.stats.overflows += 1;
            diag::report(ErrorKind::QueueOverflow, self.hw.periph());
            return Err(Error::QueueFull);
        }
        self.next_id = self.next_id.wrapping_add(1);

        self.task();
        Ok(id)
    }

    /// Dispatch loop. Call periodically from thread context, never from an interrupt handler.
    ///
    /// Retires a finished transfer, then starts queued transfers until one is running on the
    /// hardware or the queue is empty. Transfers that fail to start get their callback, with
    /// the error, before the next one is attempted.
    pub fn task(&mut self) {
        if !self.is_init {
            return;
        }

        if let BusState::Done(result) = self.state {
            match result {
                Ok(()) => self.stats.completed += 1,
                Err(_) => {
                    self.stats.xfer_errors += 1;
                    diag::report(ErrorKind::XferError, self.hw.periph());
                }
            }
            self.queue.pop_front();
            self.state = BusState::Idle;
        }

        if self.state != BusState::Idle {
            return;
        }

        while let Some(next) = self.queue.front().copied() {
            match self.start(&next.xfer) {
                Ok(()) => {
                    self.state = BusState::Busy;
                    return;
                }
                Err(e) => {
                    self.stats.start_failures += 1;
                    diag::report(ErrorKind::XferStart, self.hw.periph());
                    self.queue.pop_front();
                    next.done.fire(Err(e));
                }
            }
        }
    }

    fn start(&mut self, xfer: &H::Xfer) -> Result<()> {
        self.hw.select(xfer);

        let result = if self.hw.dma_capable(xfer) {
            self.stats.dma_starts += 1;
            self.hw.start_dma(xfer)
        } else {
            self.stats.irq_starts += 1;
            self.hw.start_irq(xfer)
        };

        if result.is_err() {
            self.hw.deselect(xfer);
        }
        result
    }

    /// Interrupt entry point. Lets the hardware layer make progress on the transfer in
    /// flight, and completes it when the hardware reports it finished. Interrupts that arrive
    /// with nothing in flight are ignored.
    pub fn on_interrupt(&mut self) {
        if self.state != BusState::Busy {
            return;
        }
        let Some(current) = self.queue.front().copied() else {
            return;
        };

        if let Some(result) = self.hw.service_irq(&current.xfer) {
            self.complete(result);
        }
    }

    /// Mark the transfer in flight as finished: record the result, release its select line,
    /// then run its callback. Runs in interrupt context. Fires at most once per transfer.
    pub fn complete(&mut self, result: Result<()>) {
        if self.state != BusState::Busy {
            return;
        }
        let Some(current) = self.queue.front().copied() else {
            return;
        };

        self.state = BusState::Done(result);
        self.hw.deselect(&current.xfer);
        current.done.fire(result);
    }

    /// Remove a transfer that is queued but not yet dispatched. Its callback never runs.
    /// Returns `false` if it's in flight, finished, or unknown.
    pub fn withdraw(&mut self, id: XferId) -> bool {
        if self.state != BusState::Idle && self.queue.front_id() == Some(id) {
            return false;
        }
        self.queue.remove(id).is_some()
    }

    /// Run a transfer directly, bypassing the queue. The bus must be idle.
    pub fn transfer_now(&mut self, xfer: &H::Xfer) -> Result<()> {
        if !self.is_init {
            return Err(Error::NotInitialized);
        }
        if self.is_busy() {
            return Err(Error::Busy);
        }

        self.hw.select(xfer);
        let result = self.hw.transfer_blocking(xfer);
        self.hw.deselect(xfer);

        if result.is_err() {
            self.stats.start_failures += 1;
            diag::report(ErrorKind::XferStart, self.hw.periph());
        }
        result
    }

    /// Count and report a blocking wait that gave up.
    pub(crate) fn busy_timeout(&mut self) -> Error {
        self.stats.busy_timeouts += 1;
        diag::report(ErrorKind::BusyTimeout, self.hw.periph());
        Error::BusyTimeout
    }
}
