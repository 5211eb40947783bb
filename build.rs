use cfg_aliases::cfg_aliases;

fn main() {
    cfg_aliases! {
        // SPI4 is only present on some F4 variants.
        spi4: { any(feature = "f401", feature = "f411", feature = "f446") },
    }
}
