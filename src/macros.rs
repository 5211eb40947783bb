//! This module contains utility macros that are not STM32-specific, or specific
//! to this library.

/// Log at debug level with `defmt`, when the `defmt` feature is enabled. Compiles to nothing
/// otherwise; arguments are still type-checked so they don't trigger unused warnings.
#[macro_export]
#[doc(hidden)]
macro_rules! debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        defmt::debug!($($arg)*);
        #[cfg(not(feature = "defmt"))]
        $crate::__log_sink!($($arg)*);
    }};
}

/// Log at warn level with `defmt`, when the `defmt` feature is enabled.
#[macro_export]
#[doc(hidden)]
macro_rules! warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        defmt::warn!($($arg)*);
        #[cfg(not(feature = "defmt"))]
        $crate::__log_sink!($($arg)*);
    }};
}

#[macro_export]
#[doc(hidden)]
macro_rules! __log_sink {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        $( let _ = &$arg; )*
    }};
}

/// Spin while `$cond` holds, giving up with `$err` after `MAX_ITERS` iterations. The optional
/// block runs on each iteration; eg to check error flags.
///
/// Example: `bounded_loop!(regs.sr().read().txe().bit_is_clear(), Error::RegisterUnchanged);`
#[macro_export]
#[doc(hidden)]
macro_rules! bounded_loop {
    ($cond:expr, $err:expr) => {
        $crate::bounded_loop!($cond, $err, {})
    };
    ($cond:expr, $err:expr, $body:block) => {{
        let mut i: u32 = 0;
        while $cond {
            $body
            i += 1;
            if i >= $crate::MAX_ITERS {
                return Err($err.into());
            }
        }
    }};
}
