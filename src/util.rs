//! This is an internal module that contains utility functionality used by other modules.

/// Enables and resets peripheral clocks on various RCC registesr.
/// The first argument is a `apb1`, `apb2` etc to specify the reg block. The second is something like
/// `spi2`, and the third is a `pac::RCC`.
macro_rules! rcc_en_reset {
    (apb1, $periph:expr, $rcc:expr) => {
        paste::paste! {
            $rcc.apb1enr().modify(|_, w| w.[<$periph en>]().set_bit());
            $rcc.apb1rstr().modify(|_, w| w.[<$periph rst>]().set_bit());
            $rcc.apb1rstr().modify(|_, w| w.[<$periph rst>]().clear_bit());
        }
    };
    (apb2, $periph:expr, $rcc:expr) => {
        paste::paste! {
            $rcc.apb2enr().modify(|_, w| w.[<$periph en>]().set_bit());
            $rcc.apb2rstr().modify(|_, w| w.[<$periph rst>]().set_bit());
            $rcc.apb2rstr().modify(|_, w| w.[<$periph rst>]().clear_bit());
        }
    };
}

/// Disables a peripheral clock; the counterpart of `rcc_en_reset`.
macro_rules! rcc_disable {
    (apb1, $periph:expr, $rcc:expr) => {
        paste::paste! {
            $rcc.apb1enr().modify(|_, w| w.[<$periph en>]().clear_bit());
        }
    };
    (apb2, $periph:expr, $rcc:expr) => {
        paste::paste! {
            $rcc.apb2enr().modify(|_, w| w.[<$periph en>]().clear_bit());
        }
    };
}

pub(crate) use rcc_disable;
pub(crate) use rcc_en_reset;
