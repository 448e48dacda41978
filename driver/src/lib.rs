//! Audio session driver for the VS1003 codec.
//!
//! [`Vs1003`] owns the register interface and walks the chip through its modes with typestates:
//! a fresh device is [`NotInitialized`], [`Vs1003::reset_initialize`] turns it into an
//! [`Initialized`] one (or an [`Errored`] one, which can be reset again).
//!
//! Playing and recording borrow an initialized device exclusively through the
//! [`Playback`] and [`Recording`] guards, so at most one stream is active at a time.
//! [`Vs1003::play_file`] and [`Vs1003::record_file`] run whole transfers between a
//! [`Storage`] and the codec.

#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

#[macro_use]
mod fmt;

mod config;
mod playback;
mod recording;
mod storage;
pub mod wav;

pub use vs1003_pac as pac;

pub use config::{ClockBoost, ClockMultiplier, Config};
pub use playback::{Playback, PlaybackMonitor, PlaybackStatus};
pub use recording::{Recording, RecordingSummary, SampleRate};
pub use storage::{OpenMode, Storage};

use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin},
};
use fugit::{ExtU32, HertzU32, MicrosDurationU32, RateExtU32, SecsDurationU32};

/// Bytes the codec accepts for every rising edge of DREQ
pub const CHUNK_SIZE: usize = 32;

/// Zero bytes sent after a stream, so the codec flushes everything it buffered
const END_FILL_BYTES: usize = 2048;

/// Zero bytes sent before a new stream
const STREAM_LEAD_IN_BYTES: usize = 10;

/// Attenuation of the quietest setting that keeps the analog part powered
pub const SILENCE: u8 = 0xFE;

/// 0xFF on both channels powers down the analog part
const ANALOG_POWER_DOWN: u8 = 0xFF;

/// -18 dB, the level the codec is left at after a soft reset
const RESET_ATTENUATION: u8 = 0x24;

const AICTRL_ADDRESS: u8 = 0x0C;
const AUDATA_INDEX: usize = 0x05;

/// Register round-trip patterns, as (AICTRL index, value)
const SANITY_PATTERNS: [(usize, u16); 2] = [(1, 0xABAD), (2, 0x7E57)];

/// How long the codec may hold DREQ low while taking a 32-byte piece of padding
const FILL_TIMEOUT: MicrosDurationU32 = MicrosDurationU32::from_ticks(500_000);

/// Contains all peripherals required to interface with VS1003
#[derive(Debug)]
pub struct Peripherals<TBus, TXcs, TXdcs, TDreq, TRst> {
    /// The SPI bus shared by the control and data channels.
    pub bus: TBus,
    /// Control channel chip select (xCS).
    pub xcs: TXcs,
    /// Data channel chip select (xDCS).
    /// Any unconnected output will do when [`Config::shared_chip_select`] is set.
    pub xdcs: TXdcs,
    /// The DREQ input pin.
    pub dreq: TDreq,
    /// The xRST output pin.
    pub xrst: TRst,
}

impl<TBus, TXcs, TXdcs, TDreq, TRst> Vs1003Peripherals for Peripherals<TBus, TXcs, TXdcs, TDreq, TRst>
where
    TBus: pac::BusControl,
    TXcs: OutputPin,
    TXdcs: OutputPin<Error = TXcs::Error>,
    TDreq: InputPin,
    TRst: OutputPin,
{
    type TBus = TBus;
    type TXcs = TXcs;
    type TXdcs = TXdcs;
    type TDreq = TDreq;
    type TRst = TRst;
    type Error = Error<TBus::Error, TXcs::Error, TDreq::Error, TRst::Error>;

    fn take(self) -> Self {
        self
    }
}

/// Helper trait to represent device peripherals.
///
/// This is used in the implementation to reduce the number of generic arguments everywhere.
pub trait Vs1003Peripherals {
    /// The type of the SPI bus
    type TBus: pac::BusControl;
    /// The type of the xCS output pin
    type TXcs: OutputPin;
    /// The type of the xDCS output pin
    type TXdcs: OutputPin<Error = <Self::TXcs as embedded_hal::digital::ErrorType>::Error>;
    /// The type of the DREQ input pin
    type TDreq: InputPin;
    /// The type of the xRST output pin
    type TRst: OutputPin;

    /// The error type that will be returned by the driver
    type Error: core::fmt::Debug
        + core::error::Error
        + From<
            Error<
                <Self::TBus as embedded_hal::spi::ErrorType>::Error,
                <Self::TXcs as embedded_hal::digital::ErrorType>::Error,
                <Self::TDreq as embedded_hal::digital::ErrorType>::Error,
                <Self::TRst as embedded_hal::digital::ErrorType>::Error,
            >,
        >;

    /// Return the peripheral instances
    fn take(self) -> Peripherals<Self::TBus, Self::TXcs, Self::TXdcs, Self::TDreq, Self::TRst>;
}

/// [`Error`] for a given set of peripherals
pub type DriverError<T> = Error<
    <<T as Vs1003Peripherals>::TBus as embedded_hal::spi::ErrorType>::Error,
    <<T as Vs1003Peripherals>::TXcs as embedded_hal::digital::ErrorType>::Error,
    <<T as Vs1003Peripherals>::TDreq as embedded_hal::digital::ErrorType>::Error,
    <<T as Vs1003Peripherals>::TRst as embedded_hal::digital::ErrorType>::Error,
>;

/// The register interface built from a set of peripherals
pub type Interface<T> = pac::Vs1003Interface<
    <T as Vs1003Peripherals>::TBus,
    <T as Vs1003Peripherals>::TXcs,
    <T as Vs1003Peripherals>::TXdcs,
    <T as Vs1003Peripherals>::TDreq,
>;

#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// The error enum returned by most of [Vs1003] APIs
pub enum Error<EBus, ECs, EDreq, ERst> {
    /// The SPI bus failed a transfer
    #[error("Failed to communicate over SPI")]
    Bus(EBus),

    /// Driving xCS or xDCS failed
    #[error("Failed to drive a chip select")]
    ChipSelect(ECs),

    /// Reading of DREQ pin state failed
    #[error("Failed to read DREQ signal")]
    DreqRead(EDreq),

    /// Setting xRST state failed
    #[error("Failed to write xRST signal")]
    RstWrite(ERst),

    /// DREQ stayed low for the whole polling budget of a register access
    #[error("Device is busy (DREQ low for {0} polls)")]
    Busy(u32),

    /// Operation has timed out, likely the DREQ signal didn't rise when expected
    #[error("Timeout of {}us exceeded", .0.ticks())]
    Timeout(MicrosDurationU32),

    /// A register did not hold the value written to it
    #[error("Register {address:#04x} read back {read:#06x} instead of {wrote:#06x}")]
    SanityCheck {
        /// SCI address of the register
        address: u8,
        /// Value written
        wrote: u16,
        /// Value read back
        read: u16,
    },

    /// The chip reports a different member of the VS10xx family
    #[error("Unsupported chip {0:?}")]
    UnsupportedChip(pac::Version),

    /// The record buffer did not reach the expected fill level
    #[error("Record buffer stalled for {0} polls")]
    RecordStalled(u32),
}

impl<EBus, ECs, EDreq, ERst> From<pac::Vs1003InterfaceError<EBus, ECs, EDreq>>
    for Error<EBus, ECs, EDreq, ERst>
{
    fn from(value: pac::Vs1003InterfaceError<EBus, ECs, EDreq>) -> Self {
        match value {
            pac::Vs1003InterfaceError::Spi(err) => Self::Bus(err),
            pac::Vs1003InterfaceError::ChipSelect(err) => Self::ChipSelect(err),
            pac::Vs1003InterfaceError::Dreq(err) => Self::DreqRead(err),
            pac::Vs1003InterfaceError::Busy(polls) => Self::Busy(polls),
        }
    }
}

#[derive(thiserror::Error)]
#[error("Mode change failed: {error}")]
/// The error returned by [Vs1003] APIs that change the typestate
pub struct ModeChangeError<T: Vs1003Peripherals> {
    /// The actual error
    pub error: T::Error,
    /// The device, so that it can be reset
    pub device: Vs1003<Errored, T>,
}

impl<T: Vs1003Peripherals> core::fmt::Debug for ModeChangeError<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("ModeChangeError").field(&self.error).finish()
    }
}

/// Errors of whole-file transfers
#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum StreamError<ECodec, EFile> {
    /// The codec failed
    #[error("Codec error: {0}")]
    Codec(ECodec),
    /// Opening, reading, writing, seeking or closing the file failed
    #[error("File error: {0:?}")]
    File(EFile),
    /// The file took fewer bytes than it was given
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes handed to the file
        expected: usize,
        /// Bytes the file accepted
        written: usize,
    },
}

/// Stream format detected by the decoder, from SCI_HDAT1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum AudioFormat {
    /// Nothing recognized yet
    Unknown,
    /// RIFF WAV
    Riff,
    /// MPEG layer 3
    Mp3,
    /// Standard MIDI file
    Midi,
}

impl AudioFormat {
    /// Decode the value of SCI_HDAT1
    pub const fn from_header_word(value: u16) -> Self {
        match value {
            0x7665 => Self::Riff,
            0x4D54 => Self::Midi,
            v if v & 0xFFE6 == 0xFFE2 => Self::Mp3,
            _ => Self::Unknown,
        }
    }
}

/// Sample rate and channel count of the current stream, from SCI_AUDATA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct AudioData {
    /// Sample rate, rounded down to an even number of Hz
    pub sample_rate: HertzU32,
    /// Two channels
    pub stereo: bool,
}

impl AudioData {
    /// Decode the value of SCI_AUDATA
    pub fn from_register(value: u16) -> Self {
        Self {
            sample_rate: u32::from(value & 0xFFFE).Hz(),
            stereo: value & 1 != 0,
        }
    }
}

/// Typestate type for freshly constructed VS1003
#[derive(Debug)]
#[non_exhaustive]
pub struct NotInitialized {}

/// Typestate type for a VS1003 that failed state change
#[derive(Debug)]
#[non_exhaustive]
pub struct Errored {}

/// Typestate type for a VS1003 that is idle and ready to play or record
#[derive(Debug)]
#[non_exhaustive]
pub struct Initialized {}

/// High level interface for the VS1003 audio codec
pub struct Vs1003<State, T: Vs1003Peripherals> {
    sci: pac::Vs1003<Interface<T>>,
    xrst: T::TRst,
    config: Config,
    state: State,
}

impl<State: core::fmt::Debug, T: Vs1003Peripherals> core::fmt::Debug for Vs1003<State, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vs1003")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: Vs1003Peripherals> Vs1003<NotInitialized, T> {
    /// Create the interface
    pub fn new(peripherals: T, config: Config) -> Self {
        let Peripherals {
            bus,
            xcs,
            xdcs,
            dreq,
            xrst,
        } = peripherals.take();

        let interface = pac::Vs1003Interface::new(bus, xcs, xdcs, dreq)
            .with_poll_limit(config.dreq_poll_limit);

        Self {
            sci: pac::Vs1003::new(interface),
            xrst,
            config,
            state: NotInitialized {},
        }
    }
}

impl<State, T: Vs1003Peripherals> Vs1003<State, T> {
    /// Reset the VS1003, verify that it is really a VS1003 that answers and set up its clock.
    ///
    /// The sequence is: xRST pulse, de-click of the analog part, native SPI mode with a soft
    /// reset, a write/read-back check of two scratch registers, a chip version check and finally
    /// the clock multiplier from the [`Config`]. The bus is switched to its fast clock at the end.
    ///
    /// Note: before executing this method the SPI clock must be lower than `xtali / 4`.
    ///
    /// # Blocking
    ///
    /// This method blocks for at least 105ms and up to about 125ms, assuming that
    /// `delay.delay_us(10)` blocks for 10us and a reasonable SPI clock speed.
    ///
    /// # Panics
    ///
    /// This method will panic if the configured crystal frequency is outside
    /// of legal range for VS1003.
    pub fn reset_initialize(
        mut self,
        delay: &mut impl DelayNs,
    ) -> Result<Vs1003<Initialized, T>, ModeChangeError<T>> {
        match self.initialize(delay) {
            Err(error) => {
                warn!("VS1003 initialization failed");
                Err(ModeChangeError {
                    error,
                    device: self.change_state(Errored {}),
                })
            }
            Ok(()) => {
                info!(
                    "VS1003 initialized, CLKI {=u32} kHz",
                    self.config.internal_clock().to_kHz()
                );
                Ok(self.change_state(Initialized {}))
            }
        }
    }

    /// Proxy for [pac::Vs1003::is_busy].
    /// Returns true when the device cannot accept commands or data.
    pub fn is_busy(&mut self) -> Result<bool, T::Error> {
        Ok(self.sci.is_busy().map_err(Error::DreqRead)?)
    }

    /// The configuration the session was created with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the SCI interface to allow custom configuration of the device
    pub fn sci(&mut self) -> &mut pac::Vs1003<Interface<T>> {
        &mut self.sci
    }

    fn initialize(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.xrst.set_low().map_err(Error::RstWrite)?;
        delay.delay_us(100);
        self.xrst.set_high().map_err(Error::RstWrite)?;
        delay.delay_ms(5);
        // According to datasheet the maximum reset time is 50000 clock cycles
        // At 12MHz this is ~4.2ms, at 8MHz it would be 6.25ms
        self.wait_for_dreq(delay, 10.millis())?;

        // Power the analog part down and back up at silence, otherwise it clicks
        self.write_attenuation(ANALOG_POWER_DOWN)?;
        delay.delay_ms(100);
        self.write_attenuation(SILENCE)?;

        // The first read after reset may come back garbled
        self.sci.mode().read().map_err(Error::from)?;

        let shared = self.config.shared_chip_select;
        self.sci
            .mode()
            .write(|r| {
                r.set_sdi_new(true);
                r.set_sdi_share(shared);
                r.set_reset(true);
            })
            .map_err(Error::from)?;
        self.wait_for_dreq(delay, 10.millis())?;

        self.check_register_round_trip()?;

        let version = self.sci.status().read().map_err(Error::from)?.version();
        debug!("SS_VER reports {}", version);
        if !matches!(version, pac::Version::Vs1003) {
            return Err(Error::UnsupportedChip(version))?;
        }

        self.write_clock(delay)?;
        self.sci.set_fast_clock().map_err(Error::from)?;
        Ok(())
    }

    fn check_register_round_trip(&mut self) -> Result<(), T::Error> {
        for (index, pattern) in SANITY_PATTERNS {
            self.sci
                .ai_ctrl(index)
                .write(|r| r.set_value(pattern))
                .map_err(Error::from)?;
        }

        for (index, pattern) in SANITY_PATTERNS {
            let read = self.sci.ai_ctrl(index).read().map_err(Error::from)?.value();
            if read != pattern {
                return Err(Error::SanityCheck {
                    address: AICTRL_ADDRESS + index as u8,
                    wrote: pattern,
                    read,
                })?;
            }
        }

        for (index, _) in SANITY_PATTERNS {
            self.sci
                .ai_ctrl(index)
                .write(|r| r.set_value(0))
                .map_err(Error::from)?;
        }
        Ok(())
    }

    /// Write SCI_CLOCKF from the configuration and wait for the clock to settle
    fn write_clock(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        let multiplier = self.config.clock_multiplier as u8;
        let boost = self.config.wma_boost as u8;
        let input_frequency = self.config.input_frequency();

        self.sci
            .clockf()
            .write(|r| {
                r.set_multiplier(multiplier);
                r.set_allowed_addition(boost);
                r.set_input_frequency(input_frequency);
            })
            .map_err(Error::from)?;

        // Datasheet specifies maximum execution time of 11000 clock cycles
        // At 12MHz this is ~1ms, at 8 MHz ~1.4ms.
        self.wait_for_dreq(delay, 5.millis())
    }

    fn write_attenuation(&mut self, attenuation: u8) -> Result<(), T::Error> {
        self.sci
            .vol()
            .write(|r| {
                r.set_left(attenuation);
                r.set_right(attenuation);
            })
            .map_err(Error::from)?;
        Ok(())
    }

    fn wait_for_dreq(
        &mut self,
        delay: &mut impl DelayNs,
        max_delay: MicrosDurationU32,
    ) -> Result<(), T::Error> {
        const DELAY_STEP: u32 = 10;

        let mut remaining_delay_us = max_delay.ticks();

        while remaining_delay_us > 0 {
            if !self.is_busy()? {
                return Ok(());
            }
            delay.delay_us(remaining_delay_us.min(DELAY_STEP));
            remaining_delay_us = remaining_delay_us.saturating_sub(DELAY_STEP);
        }

        if !self.is_busy()? {
            return Ok(());
        }
        Err(Error::Timeout(max_delay))?
    }

    fn change_state<NewState>(self, state: NewState) -> Vs1003<NewState, T> {
        Vs1003 {
            sci: self.sci,
            xrst: self.xrst,
            config: self.config,
            state,
        }
    }
}

impl<T: Vs1003Peripherals> Vs1003<Initialized, T> {
    /// Set the output attenuation of both channels in -0.5 dB steps.
    ///
    /// 0 is the loudest setting, values above [`SILENCE`] are clamped to it.
    pub fn set_volume(&mut self, attenuation: u8) -> Result<(), T::Error> {
        self.write_attenuation(attenuation.min(SILENCE))
    }

    /// Turn the bass enhancer on (+15 dB below 60 Hz) or off. Treble settings are kept.
    pub fn set_bass_enhancement(&mut self, enable: bool) -> Result<(), T::Error> {
        let (amplitude, frequency) = if enable { (15, 6) } else { (0, 0) };
        self.sci
            .bass()
            .modify(|r| {
                r.set_bass_amplitude(amplitude);
                r.set_bass_frequency(frequency);
            })
            .map_err(Error::from)?;
        Ok(())
    }

    /// Turn the treble control on (+10.5 dB above 10 kHz) or off. Bass settings are kept.
    pub fn set_treble_control(&mut self, enable: bool) -> Result<(), T::Error> {
        let (amplitude, frequency) = if enable { (7, 10) } else { (0, 0) };
        self.sci
            .bass()
            .modify(|r| {
                r.set_treble_amplitude(amplitude);
                r.set_treble_frequency(frequency);
            })
            .map_err(Error::from)?;
        Ok(())
    }

    /// The stream format the decoder has recognized
    pub fn format(&mut self) -> Result<AudioFormat, T::Error> {
        let value = self.sci.stream_header().read().map_err(Error::from)?.value();
        Ok(AudioFormat::from_header_word(value))
    }

    /// Sample rate and channels of the stream being decoded
    pub fn audio_data(&mut self) -> Result<AudioData, T::Error> {
        let value = self.sci.raw(AUDATA_INDEX).read().map_err(Error::from)?.value();
        Ok(AudioData::from_register(value))
    }

    /// Seconds decoded since the last stream start
    pub fn decode_time(&mut self) -> Result<SecsDurationU32, T::Error> {
        let seconds = self.sci.decode_time().read().map_err(Error::from)?.seconds();
        Ok(SecsDurationU32::from_ticks(u32::from(seconds)))
    }

    /// Soft reset: flush the stream, reset the decoder, restore the clock and a -18 dB volume.
    pub fn reset(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.send_zeros(delay, END_FILL_BYTES)?;
        self.sci
            .mode()
            .modify(|r| r.set_reset(true))
            .map_err(Error::from)?;
        self.wait_for_dreq(delay, 10.millis())?;
        // A soft reset drops SCI_CLOCKF back to its default
        self.write_clock(delay)?;
        self.write_attenuation(RESET_ATTENUATION)?;
        self.clear_decode_time()
    }

    /// Power down the analog driver. The chip needs a reset afterwards to make sound again.
    pub fn shutdown(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.sci
            .status()
            .modify(|r| r.set_analog_driver_powerdown(true))
            .map_err(Error::from)?;
        delay.delay_ms(10);
        Ok(())
    }

    /// Changes the typestate to errored.
    /// Can be useful for simplification of retry loops.
    pub fn into_errored_state(self) -> Vs1003<Errored, T> {
        self.change_state(Errored {})
    }

    fn clear_decode_time(&mut self) -> Result<(), T::Error> {
        // The chip only takes the value when it is written twice
        for _ in 0..2 {
            self.sci
                .decode_time()
                .write(|r| r.set_seconds(0))
                .map_err(Error::from)?;
        }
        Ok(())
    }

    fn send_zeros(&mut self, delay: &mut impl DelayNs, count: usize) -> Result<(), T::Error> {
        const ZEROS: [u8; CHUNK_SIZE] = [0; CHUNK_SIZE];

        let mut remaining = count;
        while remaining > 0 {
            self.wait_for_dreq(delay, FILL_TIMEOUT)?;
            let len = remaining.min(CHUNK_SIZE);
            self.sci.send_data(&ZEROS[..len]).map_err(Error::from)?;
            remaining -= len;
        }
        Ok(())
    }
}
