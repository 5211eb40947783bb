//! General Purpose Input and Output (GPIO) pins, as used for chip-select lines and bus pins.
//!
//! A [`Pin`] is a plain `Copy` identifier, so transfer descriptors can carry their select line.
//! Register functions are only available with an F4 chip feature.

#[cfg(feature = "f4")]
use crate::pac::{self, RCC, gpioa};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// GPIO port letter
pub enum Port {
    A,
    B,
    C,
    D,
    E,
    H,
}

#[derive(Copy, Clone, Eq, PartialEq)]
/// Values for `GPIOx_MODER`
pub enum PinMode {
    Input,
    Output,
    /// Alternate function, 0 - 15. See the datasheet's AF mapping table.
    Alt(u8),
    Analog,
}

impl PinMode {
    #[cfg(feature = "f4")]
    /// We use this function to find the value bits due to being unable to repr(u8) with
    /// the wrapped alt function value.
    fn val(&self) -> u32 {
        match self {
            Self::Input => 0b00,
            Self::Output => 0b01,
            Self::Alt(_) => 0b10,
            Self::Analog => 0b11,
        }
    }
}

#[derive(Copy, Clone)]
#[repr(u8)]
/// Values for `GPIOx_OTYPER`
pub enum OutputType {
    PushPull = 0,
    OpenDrain = 1,
}

#[derive(Copy, Clone)]
#[repr(u8)]
/// Values for `GPIOx_OSPEEDR`
pub enum OutputSpeed {
    Low = 0,
    Medium = 0b01,
    High = 0b10,
    VeryHigh = 0b11,
}

#[derive(Copy, Clone)]
#[repr(u8)]
/// Values for `GPIOx_PUPDR`
pub enum Pull {
    Floating = 0b00,
    Up = 0b01,
    Dn = 0b10,
}

/// A GPIO pin; eg PA4 is `Pin::new(Port::A, 4)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pin {
    pub port: Port,
    /// 0 through 15.
    pub pin: u8,
}

impl Pin {
    pub const fn new(port: Port, pin: u8) -> Self {
        Self { port, pin }
    }
}

#[cfg(feature = "f4")]
fn regs(port: Port) -> &'static gpioa::RegisterBlock {
    // All ports share GPIOA's layout; only reset values differ.
    let ptr = match port {
        Port::A => pac::GPIOA::ptr() as *const gpioa::RegisterBlock,
        Port::B => pac::GPIOB::ptr() as *const gpioa::RegisterBlock,
        Port::C => pac::GPIOC::ptr() as *const gpioa::RegisterBlock,
        Port::D => pac::GPIOD::ptr() as *const gpioa::RegisterBlock,
        Port::E => pac::GPIOE::ptr() as *const gpioa::RegisterBlock,
        Port::H => pac::GPIOH::ptr() as *const gpioa::RegisterBlock,
    };
    unsafe { &*ptr }
}

#[cfg(feature = "f4")]
impl Pin {
    /// Enable the port's clock, and set the pin's mode. Returns the pin, for chaining.
    pub fn configure(self, mode: PinMode) -> Self {
        let rcc = unsafe { &(*RCC::ptr()) };
        match self.port {
            Port::A => rcc.ahb1enr().modify(|_, w| w.gpioaen().set_bit()),
            Port::B => rcc.ahb1enr().modify(|_, w| w.gpioben().set_bit()),
            Port::C => rcc.ahb1enr().modify(|_, w| w.gpiocen().set_bit()),
            Port::D => rcc.ahb1enr().modify(|_, w| w.gpioden().set_bit()),
            Port::E => rcc.ahb1enr().modify(|_, w| w.gpioeen().set_bit()),
            Port::H => rcc.ahb1enr().modify(|_, w| w.gpiohen().set_bit()),
        };

        if let PinMode::Alt(af) = mode {
            self.alt_fn(af);
        }

        let shift = 2 * self.pin as u32;
        regs(self.port).moder().modify(|r, w| unsafe {
            w.bits((r.bits() & !(0b11 << shift)) | (mode.val() << shift))
        });
        self
    }

    fn alt_fn(&self, af: u8) {
        let regs = regs(self.port);
        let shift = 4 * (self.pin as u32 % 8);
        let val = (af as u32 & 0xf) << shift;
        if self.pin < 8 {
            regs.afrl()
                .modify(|r, w| unsafe { w.bits((r.bits() & !(0xf << shift)) | val) });
        } else {
            regs.afrh()
                .modify(|r, w| unsafe { w.bits((r.bits() & !(0xf << shift)) | val) });
        }
    }

    /// Set output type. Sets the `OTYPER` register.
    pub fn output_type(&self, value: OutputType) {
        let bit = 1 << self.pin;
        regs(self.port).otyper().modify(|r, w| unsafe {
            w.bits(match value {
                OutputType::PushPull => r.bits() & !bit,
                OutputType::OpenDrain => r.bits() | bit,
            })
        });
    }

    /// Set output speed. Sets the `OSPEEDR` register.
    pub fn speed(&self, value: OutputSpeed) {
        let shift = 2 * self.pin as u32;
        regs(self.port).ospeedr().modify(|r, w| unsafe {
            w.bits((r.bits() & !(0b11 << shift)) | ((value as u32) << shift))
        });
    }

    /// Set internal pull resistor. Sets the `PUPDR` register.
    pub fn pull(&self, value: Pull) {
        let shift = 2 * self.pin as u32;
        regs(self.port).pupdr().modify(|r, w| unsafe {
            w.bits((r.bits() & !(0b11 << shift)) | ((value as u32) << shift))
        });
    }

    /// Set the pin's output voltage to high. Sets the `BSRR` register. Atomic.
    pub fn set_high(&self) {
        regs(self.port)
            .bsrr()
            .write(|w| unsafe { w.bits(1 << self.pin) });
    }

    /// Set the pin's output voltage to low. Sets the `BSRR` register. Atomic.
    pub fn set_low(&self) {
        regs(self.port)
            .bsrr()
            .write(|w| unsafe { w.bits(1 << (self.pin as u32 + 16)) });
    }

    /// Check if the pin's input voltage is high. Reads from the `IDR` register.
    pub fn is_high(&self) -> bool {
        regs(self.port).idr().read().bits() & (1 << self.pin) != 0
    }

    pub fn is_low(&self) -> bool {
        !self.is_high()
    }
}
