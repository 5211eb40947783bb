use std::cell::RefCell;

use cortex_m::interrupt::InterruptNumber;
use stm32f4_xfer::{
    Bus, BusHw, BusState, Completion, Error, Result,
    diag::{self, ErrorKind, Periph},
    gpio::{Pin, Port},
    i2c::{I2cBuses, I2cChannel, I2cDir, I2cXfer, MemAddrSize},
    registry::{BusArray, ChannelId, SharedBuses},
    spi::{SpiBuses, SpiChannel, SpiDir, SpiError, SpiXfer},
};

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Init,
    Deinit,
    Select(u32),
    Deselect(u32),
    StartDma(u32),
    StartIrq(u32),
    Blocking(u32),
    Done(u32, Result<()>),
    Diag(ErrorKind, Periph),
}

// Callbacks are plain fn pointers, so they log through a thread-local. Each test runs on its
// own thread.
std::thread_local! {
    static LOG: RefCell<Vec<Event>> = const { RefCell::new(Vec::new()) };
}

fn log(e: Event) {
    LOG.with(|l| l.borrow_mut().push(e));
}

fn take_log() -> Vec<Event> {
    LOG.with(|l| std::mem::take(&mut *l.borrow_mut()))
}

fn on_done(result: Result<()>, ctx: usize) {
    log(Event::Done(ctx as u32, result));
}

fn on_diag(kind: ErrorKind, periph: Periph) {
    log(Event::Diag(kind, periph));
}

fn done(tag: u32) -> Completion {
    Completion::new(on_done, tag as usize)
}

fn setup() {
    diag::set_handler(Some(on_diag));
    take_log();
}

// ---------------------------------------------------------------------------
// Mock hardware
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct MockXfer {
    tag: u32,
    /// Interrupts needed to finish.
    irqs: u32,
    fail_start: bool,
    hw_error: bool,
    cs: bool,
}

fn xfer(tag: u32) -> MockXfer {
    MockXfer {
        tag,
        irqs: 1,
        fail_start: false,
        hw_error: false,
        cs: false,
    }
}

struct MockHw {
    dma: bool,
    fail_init: bool,
    irqs: &'static [u16],
    remaining: u32,
}

impl MockHw {
    fn new() -> Self {
        Self {
            dma: false,
            fail_init: false,
            irqs: &[],
            remaining: 0,
        }
    }

    fn with_irqs(irqs: &'static [u16]) -> Self {
        Self { irqs, ..Self::new() }
    }

    fn start(&mut self, xfer: &MockXfer) -> Result<()> {
        if xfer.fail_start {
            return Err(Error::InvalidLength);
        }
        self.remaining = xfer.irqs;
        Ok(())
    }
}

impl BusHw for MockHw {
    type Xfer = MockXfer;

    fn periph(&self) -> Periph {
        Periph::Spi2
    }

    fn init(&mut self) -> Result<()> {
        if self.fail_init {
            return Err(Error::Unsupported);
        }
        log(Event::Init);
        Ok(())
    }

    fn deinit(&mut self) {
        log(Event::Deinit);
    }

    fn interrupts(&self) -> &[u16] {
        self.irqs
    }

    fn dma_capable(&self, _xfer: &MockXfer) -> bool {
        self.dma
    }

    fn start_dma(&mut self, xfer: &MockXfer) -> Result<()> {
        log(Event::StartDma(xfer.tag));
        self.start(xfer)
    }

    fn start_irq(&mut self, xfer: &MockXfer) -> Result<()> {
        log(Event::StartIrq(xfer.tag));
        self.start(xfer)
    }

    fn service_irq(&mut self, xfer: &MockXfer) -> Option<Result<()>> {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining > 0 {
            return None;
        }
        if xfer.hw_error {
            Some(Err(SpiError::Overrun.into()))
        } else {
            Some(Ok(()))
        }
    }

    fn transfer_blocking(&mut self, xfer: &MockXfer) -> Result<()> {
        log(Event::Blocking(xfer.tag));
        if xfer.hw_error {
            return Err(Error::RegisterUnchanged);
        }
        Ok(())
    }

    fn select(&mut self, xfer: &MockXfer) {
        if xfer.cs {
            log(Event::Select(xfer.tag));
        }
    }

    fn deselect(&mut self, xfer: &MockXfer) {
        if xfer.cs {
            log(Event::Deselect(xfer.tag));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestChannel {
    A,
    B,
}

impl ChannelId for TestChannel {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy)]
struct Irq(u16);

unsafe impl InterruptNumber for Irq {
    fn number(self) -> u16 {
        self.0
    }
}

fn init_bus<const N: usize>(hw: MockHw) -> Bus<MockHw, N> {
    let mut bus = Bus::new(hw);
    bus.init().unwrap();
    take_log();
    bus
}

/// Only starts and completions.
fn dispatch(events: &[Event]) -> Vec<Event> {
    events
        .iter()
        .copied()
        .filter(|e| {
            matches!(
                e,
                Event::StartDma(_) | Event::StartIrq(_) | Event::Done(..) | Event::Blocking(_)
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[test]
fn transfers_complete_in_submission_order() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    for tag in 1..=3 {
        bus.submit(xfer(tag), done(tag)).unwrap();
    }
    assert_eq!(bus.state(), BusState::Busy);
    assert_eq!(bus.pending(), 3);
    // The first starts inside `submit`; the others wait.
    assert_eq!(dispatch(&take_log()), vec![Event::StartIrq(1)]);

    for _ in 0..3 {
        bus.on_interrupt();
        bus.task();
    }

    assert_eq!(
        dispatch(&take_log()),
        vec![
            Event::Done(1, Ok(())),
            Event::StartIrq(2),
            Event::Done(2, Ok(())),
            Event::StartIrq(3),
            Event::Done(3, Ok(())),
        ]
    );
    assert!(bus.is_idle());
    assert_eq!(bus.stats().completed, 3);
}

#[test]
fn full_queue_rejects_without_callback() {
    setup();
    let mut bus: Bus<MockHw, 4> = init_bus(MockHw::new());

    // The first one is in flight, and still holds its slot.
    for tag in 1..=4 {
        bus.submit(xfer(tag), done(tag)).unwrap();
    }
    assert_eq!(bus.pending(), 4);

    assert_eq!(bus.submit(xfer(5), done(5)), Err(Error::QueueFull));
    assert_eq!(bus.pending(), 4);
    assert_eq!(bus.stats().overflows, 1);

    let log = take_log();
    assert!(log.contains(&Event::Diag(ErrorKind::QueueOverflow, Periph::Spi2)));
    assert!(!log.iter().any(|e| matches!(e, Event::Done(5, _))));

    // Nothing queued behind the rejection runs it later either.
    for _ in 0..4 {
        bus.on_interrupt();
        bus.task();
    }
    assert!(!take_log().iter().any(|e| matches!(e, Event::Done(5, _))));
    assert!(bus.is_idle());
}

#[test]
fn failed_start_reports_before_next_start() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    bus.submit(xfer(1), done(1)).unwrap();
    bus.submit(MockXfer { fail_start: true, ..xfer(2) }, done(2))
        .unwrap();
    bus.submit(xfer(3), done(3)).unwrap();
    take_log();

    bus.on_interrupt();
    bus.task();

    assert_eq!(
        dispatch(&take_log()),
        vec![
            Event::Done(1, Ok(())),
            Event::StartIrq(2),
            Event::Done(2, Err(Error::InvalidLength)),
            Event::StartIrq(3),
        ]
    );
    assert_eq!(bus.state(), BusState::Busy);
    assert_eq!(bus.pending(), 1);
    assert_eq!(bus.stats().start_failures, 1);
}

#[test]
fn failed_starts_drain_queue_in_one_pass() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    bus.submit(xfer(1), done(1)).unwrap();
    for tag in 2..=4 {
        bus.submit(MockXfer { fail_start: true, ..xfer(tag) }, done(tag))
            .unwrap();
    }
    take_log();

    bus.on_interrupt();
    bus.task();

    let log = take_log();
    assert_eq!(
        dispatch(&log),
        vec![
            Event::Done(1, Ok(())),
            Event::StartIrq(2),
            Event::Done(2, Err(Error::InvalidLength)),
            Event::StartIrq(3),
            Event::Done(3, Err(Error::InvalidLength)),
            Event::StartIrq(4),
            Event::Done(4, Err(Error::InvalidLength)),
        ]
    );
    let reports = log
        .iter()
        .filter(|e| **e == Event::Diag(ErrorKind::XferStart, Periph::Spi2))
        .count();
    assert_eq!(reports, 3);
    assert_eq!(bus.state(), BusState::Idle);
    assert_eq!(bus.pending(), 0);
    assert_eq!(bus.stats().start_failures, 3);
    assert_eq!(bus.stats().completed, 1);
}

#[test]
fn failed_start_on_submit_calls_back_before_returning() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    let id = bus.submit(MockXfer { fail_start: true, ..xfer(7) }, done(7));
    assert!(id.is_ok());

    let log = take_log();
    assert!(log.contains(&Event::Done(7, Err(Error::InvalidLength))));
    assert!(log.contains(&Event::Diag(ErrorKind::XferStart, Periph::Spi2)));
    assert!(bus.is_idle());
    assert_eq!(bus.pending(), 0);
}

#[test]
fn hardware_error_is_reported() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    bus.submit(MockXfer { hw_error: true, ..xfer(1) }, done(1))
        .unwrap();
    bus.on_interrupt();
    assert_eq!(bus.state(), BusState::Done(Err(SpiError::Overrun.into())));

    bus.task();
    let log = take_log();
    assert!(log.contains(&Event::Done(1, Err(SpiError::Overrun.into()))));
    assert!(log.contains(&Event::Diag(ErrorKind::XferError, Periph::Spi2)));
    assert_eq!(bus.stats().xfer_errors, 1);
    assert_eq!(bus.stats().completed, 0);
    assert!(bus.is_idle());
}

#[test]
fn dma_preferred_when_capable() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw {
        dma: true,
        ..MockHw::new()
    });
    bus.submit(xfer(1), done(1)).unwrap();
    assert_eq!(take_log(), vec![Event::StartDma(1)]);
    assert_eq!(bus.stats().dma_starts, 1);

    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());
    bus.submit(xfer(2), done(2)).unwrap();
    assert_eq!(take_log(), vec![Event::StartIrq(2)]);
    assert_eq!(bus.stats().irq_starts, 1);
}

#[test]
fn chip_select_released_before_callback() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    bus.submit(MockXfer { cs: true, ..xfer(1) }, done(1)).unwrap();
    bus.on_interrupt();
    assert_eq!(
        take_log(),
        vec![
            Event::Select(1),
            Event::StartIrq(1),
            Event::Deselect(1),
            Event::Done(1, Ok(())),
        ]
    );

    // And when the start fails.
    bus.task();
    bus.submit(
        MockXfer {
            cs: true,
            fail_start: true,
            ..xfer(2)
        },
        done(2),
    )
    .unwrap();
    assert_eq!(
        take_log()
            .into_iter()
            .filter(|e| !matches!(e, Event::Diag(..)))
            .collect::<Vec<_>>(),
        vec![
            Event::Select(2),
            Event::StartIrq(2),
            Event::Deselect(2),
            Event::Done(2, Err(Error::InvalidLength)),
        ]
    );
}

#[test]
fn interrupts_progress_multi_step_transfers() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    bus.submit(MockXfer { irqs: 3, ..xfer(1) }, done(1)).unwrap();
    bus.on_interrupt();
    bus.on_interrupt();
    assert_eq!(bus.state(), BusState::Busy);

    bus.on_interrupt();
    assert_eq!(bus.state(), BusState::Done(Ok(())));

    // Late interrupts after completion don't fire the callback again.
    bus.on_interrupt();
    bus.complete(Ok(()));
    let dones = take_log()
        .into_iter()
        .filter(|e| matches!(e, Event::Done(..)))
        .count();
    assert_eq!(dones, 1);
}

#[test]
fn retire_drops_pending_by_one() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    bus.submit(xfer(1), done(1)).unwrap();
    bus.submit(xfer(2), done(2)).unwrap();

    // Finished, but not retired: still holds its slot.
    bus.on_interrupt();
    assert_eq!(bus.pending(), 2);
    assert!(bus.is_busy());

    bus.task();
    assert_eq!(bus.pending(), 1);
    assert_eq!(bus.state(), BusState::Busy);
}

#[test]
fn withdraw_only_undispatched() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    let a = bus.submit(xfer(1), done(1)).unwrap();
    let b = bus.submit(xfer(2), done(2)).unwrap();
    bus.submit(xfer(3), done(3)).unwrap();

    assert!(!bus.withdraw(a));
    assert!(bus.withdraw(b));
    assert!(!bus.withdraw(b));
    assert_eq!(bus.pending(), 2);

    bus.on_interrupt();
    bus.task();
    bus.on_interrupt();
    bus.task();

    let log = dispatch(&take_log());
    assert!(!log.iter().any(|e| matches!(e, Event::StartIrq(2) | Event::Done(2, _))));
    assert_eq!(log.last(), Some(&Event::Done(3, Ok(()))));

    // Already completed.
    assert!(!bus.withdraw(a));
}

#[test]
fn deinit_refused_while_busy() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    bus.submit(xfer(1), done(1)).unwrap();
    assert_eq!(bus.deinit(), Err(Error::Busy));
    assert!(bus.is_init());

    bus.on_interrupt();
    // Done, but not yet retired.
    assert_eq!(bus.deinit(), Err(Error::Busy));

    bus.task();
    assert_eq!(bus.deinit(), Ok(()));
    assert!(!bus.is_init());
    assert!(take_log().contains(&Event::Deinit));
}

#[test]
fn uninitialized_bus_refuses_work() {
    setup();
    let mut bus: Bus<MockHw, 5> = Bus::new(MockHw::new());

    assert_eq!(bus.submit(xfer(1), done(1)), Err(Error::NotInitialized));
    assert_eq!(bus.transfer_now(&xfer(1)), Err(Error::NotInitialized));
    bus.task();
    assert!(take_log().is_empty());

    let mut bus: Bus<MockHw, 5> = Bus::new(MockHw {
        fail_init: true,
        ..MockHw::new()
    });
    assert_eq!(bus.init(), Err(Error::Unsupported));
    assert!(!bus.is_init());
    assert_eq!(
        take_log(),
        vec![Event::Diag(ErrorKind::Init, Periph::Spi2)]
    );
}

#[test]
fn init_twice_is_noop() {
    setup();
    let mut bus: Bus<MockHw, 5> = Bus::new(MockHw::new());
    bus.init().unwrap();
    bus.init().unwrap();
    assert_eq!(take_log(), vec![Event::Init]);
}

#[test]
fn transfer_now_needs_idle_bus() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    assert_eq!(bus.transfer_now(&MockXfer { cs: true, ..xfer(1) }), Ok(()));
    assert_eq!(
        take_log(),
        vec![Event::Select(1), Event::Blocking(1), Event::Deselect(1)]
    );

    bus.submit(xfer(2), done(2)).unwrap();
    assert_eq!(bus.transfer_now(&xfer(3)), Err(Error::Busy));
}

#[test]
fn failed_blocking_transfer_is_reported() {
    setup();
    let mut bus: Bus<MockHw, 5> = init_bus(MockHw::new());

    assert_eq!(
        bus.transfer_now(&MockXfer { hw_error: true, cs: true, ..xfer(1) }),
        Err(Error::RegisterUnchanged)
    );
    assert_eq!(
        take_log(),
        vec![
            Event::Select(1),
            Event::Blocking(1),
            Event::Deselect(1),
            Event::Diag(ErrorKind::XferStart, Periph::Spi2),
        ]
    );
    assert_eq!(bus.stats().start_failures, 1);
    assert!(bus.is_idle());
}

// ---------------------------------------------------------------------------
// Bus arrays
// ---------------------------------------------------------------------------

#[test]
fn interrupts_route_to_their_channel() {
    setup();
    let mut buses: BusArray<TestChannel, MockHw, 2> = BusArray::new();
    buses
        .init(TestChannel::A, MockHw::with_irqs(&[10, 11]))
        .unwrap();
    buses
        .init(TestChannel::B, MockHw::with_irqs(&[20]))
        .unwrap();
    take_log();

    buses.submit(TestChannel::A, xfer(1), done(1)).unwrap();
    buses.submit(TestChannel::B, xfer(2), done(2)).unwrap();

    buses.on_interrupt(20);
    // Unrouted.
    buses.on_interrupt(99);
    let log = dispatch(&take_log());
    assert!(log.contains(&Event::Done(2, Ok(()))));
    assert!(!log.iter().any(|e| matches!(e, Event::Done(1, _))));

    buses.on_interrupt(11);
    assert!(take_log().contains(&Event::Done(1, Ok(()))));

    buses.task();
    assert!(!buses.is_busy(TestChannel::A));
    assert!(!buses.is_busy(TestChannel::B));
}

#[test]
fn conflicting_interrupts_refused() {
    setup();
    let mut buses: BusArray<TestChannel, MockHw, 2> = BusArray::new();
    buses
        .init(TestChannel::A, MockHw::with_irqs(&[10, 11]))
        .unwrap();

    assert_eq!(
        buses.init(TestChannel::B, MockHw::with_irqs(&[30, 11])),
        Err(Error::IrqConflict)
    );
    assert!(!buses.is_init(TestChannel::B));
    assert!(take_log().contains(&Event::Deinit));

    // 30 was released with the failed channel.
    buses
        .init(TestChannel::B, MockHw::with_irqs(&[30]))
        .unwrap();
    assert_eq!(
        buses.submit(TestChannel::B, xfer(1), done(1)).map(|_| ()),
        Ok(())
    );
    buses.on_interrupt(30);
    assert!(take_log().contains(&Event::Done(1, Ok(()))));
}

#[test]
fn array_deinit_and_reinit() {
    setup();
    let mut buses: BusArray<TestChannel, MockHw, 2> = BusArray::new();
    assert_eq!(
        buses.submit(TestChannel::A, xfer(1), done(1)).map(|_| ()),
        Err(Error::NotInitialized)
    );

    buses.init(TestChannel::A, MockHw::with_irqs(&[5])).unwrap();
    let id = buses.submit(TestChannel::A, xfer(1), done(1)).unwrap();
    assert_eq!(
        buses.init(TestChannel::A, MockHw::with_irqs(&[5])),
        Err(Error::Busy)
    );
    assert_eq!(buses.deinit(TestChannel::A), Err(Error::Busy));

    buses.on_interrupt(5);
    buses.task();
    assert_eq!(buses.deinit(TestChannel::A), Ok(()));
    assert!(!buses.is_init(TestChannel::A));
    assert!(!buses.withdraw(TestChannel::A, id));
    // Routes are gone with it.
    buses.on_interrupt(5);
    assert!(dispatch(&take_log()).ends_with(&[Event::Done(1, Ok(()))]));
}

// ---------------------------------------------------------------------------
// Shared buses
// ---------------------------------------------------------------------------

#[test]
fn shared_blocking_transfer_when_idle() {
    setup();
    let shared: SharedBuses<TestChannel, MockHw, 2> = SharedBuses::new();
    assert_eq!(
        shared.transfer_blocking(TestChannel::A, &xfer(1), 10),
        Err(Error::NotInitialized)
    );

    let mut buses = BusArray::new();
    buses.init(TestChannel::A, MockHw::with_irqs(&[3])).unwrap();
    shared.install(buses);
    take_log();

    assert_eq!(shared.transfer_blocking(TestChannel::A, &xfer(1), 10), Ok(()));
    assert_eq!(take_log(), vec![Event::Blocking(1)]);
}

#[test]
fn shared_blocking_transfer_waits_then_times_out() {
    setup();
    let shared: SharedBuses<TestChannel, MockHw, 2> = SharedBuses::new();
    let mut buses = BusArray::new();
    buses.init(TestChannel::A, MockHw::with_irqs(&[3])).unwrap();
    shared.install(buses);

    shared.submit(TestChannel::A, xfer(1), done(1)).unwrap();
    take_log();

    // No interrupt ever arrives.
    assert_eq!(
        shared.transfer_blocking(TestChannel::A, &xfer(2), 50),
        Err(Error::BusyTimeout)
    );
    let log = take_log();
    assert!(log.contains(&Event::Diag(ErrorKind::BusyTimeout, Periph::Spi2)));
    assert!(!log.contains(&Event::Blocking(2)));
    let stats = shared
        .with(|b| b.bus(TestChannel::A).map(|bus| bus.stats()))
        .unwrap()
        .unwrap();
    assert_eq!(stats.busy_timeouts, 1);

    // Once the queue drains, the blocking transfer goes through.
    shared.on_interrupt(Irq(3));
    assert_eq!(shared.transfer_blocking(TestChannel::A, &xfer(2), 50), Ok(()));
    assert_eq!(
        dispatch(&take_log()),
        vec![Event::Done(1, Ok(())), Event::Blocking(2)]
    );
}

#[test]
fn shared_blocking_transfer_without_waiting() {
    setup();
    let shared: SharedBuses<TestChannel, MockHw, 2> = SharedBuses::new();
    let mut buses = BusArray::new();
    buses.init(TestChannel::A, MockHw::with_irqs(&[3])).unwrap();
    shared.install(buses);

    shared.submit(TestChannel::A, xfer(1), done(1)).unwrap();
    take_log();

    assert_eq!(
        shared.transfer_blocking(TestChannel::A, &xfer(2), 0),
        Err(Error::BusyTimeout)
    );
    let log = take_log();
    assert!(!log.contains(&Event::Blocking(2)));
    assert!(log.contains(&Event::Diag(ErrorKind::BusyTimeout, Periph::Spi2)));
    assert!(shared.is_busy(TestChannel::A));
}

#[test]
fn shared_task_and_withdraw() {
    setup();
    let shared: SharedBuses<TestChannel, MockHw, 2> = SharedBuses::new();
    let mut buses = BusArray::new();
    buses.init(TestChannel::A, MockHw::with_irqs(&[3])).unwrap();
    shared.install(buses);

    shared.submit(TestChannel::A, xfer(1), done(1)).unwrap();
    let second = shared.submit(TestChannel::A, xfer(2), done(2)).unwrap();
    assert!(shared.is_busy(TestChannel::A));
    assert!(shared.withdraw(TestChannel::A, second));

    shared.on_interrupt(Irq(3));
    shared.task();
    assert!(!shared.is_busy(TestChannel::A));
    assert!(shared.take().is_some());
    assert!(!shared.is_busy(TestChannel::A));
}

// ---------------------------------------------------------------------------
// Bus-specific surfaces
// ---------------------------------------------------------------------------

/// Records the descriptors it's asked to run; finishes each on one interrupt.
struct Recorder<X> {
    periph: Periph,
    seen: Vec<X>,
}

impl<X: Copy> BusHw for Recorder<X> {
    type Xfer = X;

    fn periph(&self) -> Periph {
        self.periph
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn deinit(&mut self) {}

    fn start_irq(&mut self, xfer: &X) -> Result<()> {
        self.seen.push(*xfer);
        Ok(())
    }

    fn service_irq(&mut self, _xfer: &X) -> Option<Result<()>> {
        Some(Ok(()))
    }

    fn transfer_blocking(&mut self, xfer: &X) -> Result<()> {
        self.seen.push(*xfer);
        Ok(())
    }
}

#[test]
fn spi_surface_builds_descriptors() {
    static TX: [u8; 3] = [1, 2, 3];

    setup();
    let cs = Pin::new(Port::A, 4);
    let mut buses: SpiBuses<Recorder<SpiXfer>> = SpiBuses::new();
    buses
        .init(
            SpiChannel::Two,
            Recorder {
                periph: Periph::Spi2,
                seen: Vec::new(),
            },
        )
        .unwrap();

    buses
        .write(SpiChannel::Two, &TX, Some(cs), done(1))
        .unwrap();
    let rx = Box::leak(Box::new([0u8; 2]));
    buses.read(SpiChannel::Two, rx, None, done(2)).unwrap();

    // The read waits for the write.
    let bus = buses.bus(SpiChannel::Two).unwrap();
    assert_eq!(bus.pending(), 2);
    let seen = &bus.hw().seen;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].dir, SpiDir::Write);
    assert_eq!(seen[0].len(), 3);
    assert_eq!(seen[0].cs, Some(cs));

    buses.bus_mut(SpiChannel::Two).unwrap().on_interrupt();
    buses.task();
    let seen = &buses.bus(SpiChannel::Two).unwrap().hw().seen;
    assert_eq!(seen[1].dir, SpiDir::Read);
    assert_eq!(seen[1].len(), 2);
    assert_eq!(seen[1].cs, None);

    assert_eq!(
        buses
            .write(SpiChannel::One, &TX, None, done(3))
            .map(|_| ()),
        Err(Error::NotInitialized)
    );
}

#[test]
fn spi_write_read_refuses_mismatched_buffers() {
    static TX: [u8; 3] = [1, 2, 3];

    setup();
    let mut buses: SpiBuses<Recorder<SpiXfer>> = SpiBuses::new();
    buses
        .init(
            SpiChannel::Two,
            Recorder {
                periph: Periph::Spi2,
                seen: Vec::new(),
            },
        )
        .unwrap();
    take_log();

    let rx = Box::leak(Box::new([0u8; 2]));
    assert_eq!(
        buses
            .write_read(SpiChannel::Two, &TX, rx, None, done(1))
            .map(|_| ()),
        Err(Error::InvalidLength)
    );
    let bus = buses.bus(SpiChannel::Two).unwrap();
    assert_eq!(bus.pending(), 0);
    assert!(bus.hw().seen.is_empty());
    assert!(take_log().is_empty());

    let rx = Box::leak(Box::new([0u8; 3]));
    buses
        .write_read(SpiChannel::Two, &TX, rx, None, done(2))
        .unwrap();
    let seen = &buses.bus(SpiChannel::Two).unwrap().hw().seen;
    assert_eq!(seen[0].dir, SpiDir::WriteRead);
    assert_eq!(seen[0].len(), 3);
}

#[test]
fn i2c_surface_builds_descriptors() {
    setup();
    let mut buses: I2cBuses<Recorder<I2cXfer>> = I2cBuses::new();
    buses
        .init(
            I2cChannel::One,
            Recorder {
                periph: Periph::I2c1,
                seen: Vec::new(),
            },
        )
        .unwrap();

    let reg = Box::leak(Box::new([0u8; 2]));
    buses
        .read_mem(I2cChannel::One, 0x50, 0x0102, MemAddrSize::Two, reg, done(1))
        .unwrap();

    let seen = &buses.bus(I2cChannel::One).unwrap().hw().seen;
    assert_eq!(seen[0].dir, I2cDir::ReadMem);
    assert_eq!(seen[0].addr, 0x50);
    assert_eq!(seen[0].mem_addr_bytes(), ([0x01, 0x02], 2));
    assert_eq!(seen[0].len(), 2);
}

#[test]
fn i2c_shared_blocking_write() {
    setup();
    let shared: SharedBuses<I2cChannel, Recorder<I2cXfer>, 3> = SharedBuses::new();
    let mut buses = BusArray::new();
    buses
        .init(
            I2cChannel::Two,
            Recorder {
                periph: Periph::I2c2,
                seen: Vec::new(),
            },
        )
        .unwrap();
    shared.install(buses);

    let data = [0xaa, 0xbb];
    shared
        .write_blocking(I2cChannel::Two, 0x20, &data, 10)
        .unwrap();

    let (dir, addr, len) = shared
        .with(|b| {
            let x = b.bus(I2cChannel::Two).unwrap().hw().seen[0];
            (x.dir, x.addr, x.len())
        })
        .unwrap();
    assert_eq!((dir, addr, len), (I2cDir::Write, 0x20, 2));
}
