//! Static configuration of the codec session.

use fugit::{KilohertzU32, RateExtU32};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
/// Specifies the clock multiplier used by the VS1003
pub enum ClockMultiplier {
    /// Use base input clock, no multiplication
    Times1_0 = 0,
    /// 1.5x
    Times1_5 = 1,
    /// 2.0x
    Times2_0 = 2,
    /// 2.5x
    Times2_5 = 3,
    /// 3.0x
    Times3_0 = 4,
    /// 3.5x
    Times3_5 = 5,
    /// 4.0x
    Times4_0 = 6,
    /// 4.5x
    ///
    /// Note: with the default clock of 12.288MHz this will overclock the device
    Times4_5 = 7,
}

impl ClockMultiplier {
    /// The multiplier times two, so that it stays an integer
    const fn doubled(self) -> u32 {
        self as u32 + 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
/// Extra multiplier the codec firmware may add on top of [ClockMultiplier] while decoding WMA.
pub enum ClockBoost {
    /// Do not boost the clock
    Plus0_0 = 0,
    /// Up to +0.5x
    Plus0_5 = 1,
    /// Up to +1.0x
    Plus1_0 = 2,
    /// Up to +1.5x
    Plus1_5 = 3,
}

/// Codec session configuration.
///
/// The defaults match a VS1003 board with a 12.288 MHz crystal running at 3.0x
/// (36.864 MHz), which gives exact 8 kHz and 16 kHz recording dividers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Config {
    /// Crystal frequency on XTALI
    pub xtali: KilohertzU32,
    /// Clock multiplier written to SCI_CLOCKF once the chip is up
    pub clock_multiplier: ClockMultiplier,
    /// WMA clock boost written to SCI_CLOCKF
    pub wma_boost: ClockBoost,
    /// Set `SM_SDISHARE`: the chip derives xDCS from xCS and the data chip select line is unused
    pub shared_chip_select: bool,
    /// DREQ polls allowed around a single register transaction
    pub dreq_poll_limit: u32,
    /// Register polls allowed while waiting for the record buffer to fill or to restart
    pub record_poll_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// The default configuration
    pub const fn new() -> Self {
        Self {
            xtali: KilohertzU32::from_raw(12_288),
            clock_multiplier: ClockMultiplier::Times3_0,
            wma_boost: ClockBoost::Plus0_0,
            shared_chip_select: false,
            dreq_poll_limit: vs1003_pac::DEFAULT_DREQ_POLL_LIMIT,
            record_poll_limit: 1_000_000,
        }
    }

    /// Set the crystal frequency
    pub fn with_xtali(mut self, xtali: KilohertzU32) -> Self {
        self.xtali = xtali;
        self
    }

    /// Set the clock multiplier and the WMA boost
    pub fn with_clock(mut self, multiplier: ClockMultiplier, wma_boost: ClockBoost) -> Self {
        self.clock_multiplier = multiplier;
        self.wma_boost = wma_boost;
        self
    }

    /// Select shared (`SM_SDISHARE`) or separate chip selects
    pub fn with_shared_chip_select(mut self, shared: bool) -> Self {
        self.shared_chip_select = shared;
        self
    }

    /// Set both polling budgets
    pub fn with_poll_limits(mut self, dreq: u32, record: u32) -> Self {
        self.dreq_poll_limit = dreq;
        self.record_poll_limit = record.max(1);
        self
    }

    /// SC_FREQ field value for the configured crystal
    ///
    /// # Panics
    ///
    /// Panics if the crystal frequency is outside of the range the VS1003 accepts.
    pub(crate) fn input_frequency(&self) -> u16 {
        let xtali_4k: u32 = self.xtali.to_kHz() / 4;
        assert!(xtali_4k > 2_000, "Provided frequency is too low!");
        let clock_input = xtali_4k - 2_000;
        assert!(
            clock_input < (1 << 11),
            "Provided frequency is too high!"
        );
        clock_input as u16
    }

    /// The internal clock (CLKI) the codec runs on after SCI_CLOCKF is written
    pub fn internal_clock(&self) -> KilohertzU32 {
        (self.xtali.to_kHz() * self.clock_multiplier.doubled() / 2).kHz()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_clock_is_three_times_the_crystal() {
        let config = Config::default();
        assert_eq!(config.internal_clock().to_kHz(), 36_864);
        assert_eq!(config.input_frequency(), 1072);
    }

    #[test]
    fn multiplier_field_codes_match_the_datasheet() {
        assert_eq!(ClockMultiplier::Times3_0 as u8, 4);
        assert_eq!(ClockMultiplier::Times1_0.doubled(), 2);
        assert_eq!(ClockMultiplier::Times4_5.doubled(), 9);
    }

    #[test]
    #[should_panic(expected = "too low")]
    fn rejects_slow_crystal() {
        Config::default().with_xtali(8_000u32.kHz()).input_frequency();
    }
}
