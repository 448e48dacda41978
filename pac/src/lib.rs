#![cfg_attr(not(test), no_std)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

//! Register map and bus access for the VS1003 audio codec.
//!
//! The codec exposes two SPI channels on a single bus: the control channel (SCI, selected by xCS)
//! carrying 4-byte register packets, and the data channel (SDI, selected by xDCS) carrying raw
//! audio stream bytes. Both are gated by the DREQ line, which is high whenever the codec can take
//! another transaction.
//!
//! Every control transaction polls DREQ before asserting xCS and polls it again before releasing
//! xCS, so the chip has latched the command when the call returns. Polling is bounded by an
//! iteration budget and reported as [`Vs1003InterfaceError::Busy`] when exhausted.
//!
//! Any failed transaction releases both chip selects and runs [`BusControl::reinitialize`] before
//! the error is returned. The logical operation is never retried here.

use embedded_hal::{
    digital::{InputPin, OutputPin},
    spi::SpiBus,
};

/// Number of DREQ polls a single wait may take before giving up.
pub const DEFAULT_DREQ_POLL_LIMIT: u32 = 100_000;

const OPCODE_WRITE: u8 = 0x02;
const OPCODE_READ: u8 = 0x03;
const DUMMY: u8 = 0xFF;

/// A SPI bus that can be brought back into a known state after a failed transfer.
pub trait BusControl: SpiBus<u8> {
    /// De-initialize the peripheral and initialize it again at the slow, safe clock
    /// used before the codec clock multiplier is set.
    fn reinitialize(&mut self) -> Result<(), Self::Error>;

    /// Switch to the faster clock that is allowed once the codec runs on its multiplied clock.
    fn set_fast_clock(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone)]
/// The bus, chip selects and DREQ input needed to talk to a VS1003.
pub struct Vs1003Interface<TBus, TXcs, TXdcs, TDreq> {
    bus: TBus,
    xcs: TXcs,
    xdcs: TXdcs,
    dreq: TDreq,
    poll_limit: u32,
}

#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// The error type returned by the interface
pub enum Vs1003InterfaceError<EBus, ECs, EDreq> {
    /// The SPI peripheral has failed to complete a transfer
    #[error("SPI error")]
    Spi(EBus),
    /// One of the chip select outputs could not be driven
    #[error("Chip select error")]
    ChipSelect(ECs),
    /// The DREQ input failed to provide a value
    #[error("Digital input error")]
    Dreq(EDreq),
    /// DREQ stayed low for the whole polling budget
    #[error("VS1003 is busy (DREQ low for {0} polls)")]
    Busy(u32),
}

/// [`Vs1003InterfaceError`] for a given set of peripheral types
pub type InterfaceError<TBus, TXcs, TDreq> = Vs1003InterfaceError<
    <TBus as embedded_hal::spi::ErrorType>::Error,
    <TXcs as embedded_hal::digital::ErrorType>::Error,
    <TDreq as embedded_hal::digital::ErrorType>::Error,
>;

impl<TBus, TXcs, TXdcs, TDreq> Vs1003Interface<TBus, TXcs, TXdcs, TDreq> {
    /// Create a new interface.
    ///
    /// `xcs` selects the control channel, `xdcs` the data channel. When the codec runs with
    /// shared chip select (`SM_SDISHARE`) `xdcs` may be any output that is not wired to the chip.
    pub const fn new(bus: TBus, xcs: TXcs, xdcs: TXdcs, dreq: TDreq) -> Self {
        Vs1003Interface {
            bus,
            xcs,
            xdcs,
            dreq,
            poll_limit: DEFAULT_DREQ_POLL_LIMIT,
        }
    }

    /// Change the number of DREQ polls a wait may take. A limit of zero is raised to one.
    pub fn with_poll_limit(mut self, poll_limit: u32) -> Self {
        self.poll_limit = poll_limit.max(1);
        self
    }

    /// Give back the peripherals
    pub fn release(self) -> (TBus, TXcs, TXdcs, TDreq) {
        (self.bus, self.xcs, self.xdcs, self.dreq)
    }
}

impl<TBus, TXcs, TXdcs, TDreq> Vs1003Interface<TBus, TXcs, TXdcs, TDreq>
where
    TDreq: InputPin,
{
    /// Check whether the device refuses commands or data right now
    pub fn is_busy(&mut self) -> Result<bool, TDreq::Error> {
        self.dreq.is_low()
    }
}

impl<TBus, TXcs, TXdcs, TDreq> Vs1003Interface<TBus, TXcs, TXdcs, TDreq>
where
    TBus: BusControl,
    TXcs: OutputPin,
    TXdcs: OutputPin<Error = TXcs::Error>,
    TDreq: InputPin,
{
    /// Poll DREQ until it is high or the polling budget runs out.
    pub fn wait_until_ready(&mut self) -> Result<(), InterfaceError<TBus, TXcs, TDreq>> {
        for _ in 0..self.poll_limit {
            if self.dreq.is_high().map_err(Vs1003InterfaceError::Dreq)? {
                return Ok(());
            }
        }
        Err(Vs1003InterfaceError::Busy(self.poll_limit))
    }

    /// Write a 16-bit value to the register at `address`.
    pub fn write_word(
        &mut self,
        address: u8,
        value: u16,
    ) -> Result<(), InterfaceError<TBus, TXcs, TDreq>> {
        let [high, low] = value.to_be_bytes();
        let mut packet = [OPCODE_WRITE, address, high, low];
        self.control_transaction(&mut packet)
    }

    /// Read the 16-bit value of the register at `address`.
    pub fn read_word(&mut self, address: u8) -> Result<u16, InterfaceError<TBus, TXcs, TDreq>> {
        let mut packet = [OPCODE_READ, address, DUMMY, DUMMY];
        self.control_transaction(&mut packet)?;
        // The bytes clocked in while the opcode and address go out carry no data
        Ok(u16::from_be_bytes([packet[2], packet[3]]))
    }

    /// Send stream bytes over the data channel.
    ///
    /// DREQ is not checked: the caller must only send after DREQ went high, and at most
    /// 32 bytes per DREQ assertion.
    pub fn send_data(&mut self, data: &[u8]) -> Result<(), InterfaceError<TBus, TXcs, TDreq>> {
        let result = self.data_transaction(data);
        if result.is_err() {
            self.recover();
        }
        result
    }

    /// Switch the bus to its fast clock
    pub fn set_fast_clock(&mut self) -> Result<(), InterfaceError<TBus, TXcs, TDreq>> {
        self.bus.set_fast_clock().map_err(Vs1003InterfaceError::Spi)
    }

    fn control_transaction(
        &mut self,
        packet: &mut [u8; 4],
    ) -> Result<(), InterfaceError<TBus, TXcs, TDreq>> {
        let result = self.run_control(packet);
        if result.is_err() {
            self.recover();
        }
        result
    }

    fn run_control(&mut self, packet: &mut [u8; 4]) -> Result<(), InterfaceError<TBus, TXcs, TDreq>> {
        self.wait_until_ready()?;
        self.xcs.set_low().map_err(Vs1003InterfaceError::ChipSelect)?;

        let transferred = self
            .bus
            .transfer_in_place(packet)
            .and_then(|()| self.bus.flush())
            .map_err(Vs1003InterfaceError::Spi);
        // xCS stays asserted until DREQ rises again, otherwise the command may not be latched
        let latched = transferred.and_then(|()| self.wait_until_ready());

        self.xcs.set_high().map_err(Vs1003InterfaceError::ChipSelect)?;
        latched
    }

    fn data_transaction(&mut self, data: &[u8]) -> Result<(), InterfaceError<TBus, TXcs, TDreq>> {
        self.xdcs.set_low().map_err(Vs1003InterfaceError::ChipSelect)?;
        let written = self
            .bus
            .write(data)
            .and_then(|()| self.bus.flush())
            .map_err(Vs1003InterfaceError::Spi);
        self.xdcs.set_high().map_err(Vs1003InterfaceError::ChipSelect)?;
        written
    }

    fn recover(&mut self) {
        // Best effort, the caller gets the transaction error
        let _ = self.xcs.set_high();
        let _ = self.xdcs.set_high();
        if self.bus.reinitialize().is_err() {
            #[cfg(feature = "defmt-03")]
            defmt::error!("SPI bus re-initialization failed");
        } else {
            #[cfg(feature = "defmt-03")]
            defmt::warn!("SPI bus re-initialized after a failed transaction");
        }
    }
}

impl<TBus, TXcs, TXdcs, TDreq> device_driver::RegisterInterface
    for Vs1003Interface<TBus, TXcs, TXdcs, TDreq>
where
    TBus: BusControl,
    TXcs: OutputPin,
    TXdcs: OutputPin<Error = TXcs::Error>,
    TDreq: InputPin,
{
    type Error = InterfaceError<TBus, TXcs, TDreq>;
    type AddressType = u8;

    fn write_register(
        &mut self,
        address: Self::AddressType,
        size_bits: u32,
        data: &[u8],
    ) -> Result<(), Self::Error> {
        assert_eq!(size_bits, 16);
        assert_eq!(data.len(), 2);

        self.write_word(address, u16::from_be_bytes([data[0], data[1]]))
    }

    fn read_register(
        &mut self,
        address: Self::AddressType,
        size_bits: u32,
        data: &mut [u8],
    ) -> Result<(), Self::Error> {
        assert_eq!(size_bits, 16);
        assert_eq!(data.len(), 2);

        let value = self.read_word(address)?;
        data.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }
}

impl<TBus, TXcs, TXdcs, TDreq> Vs1003<Vs1003Interface<TBus, TXcs, TXdcs, TDreq>>
where
    TDreq: InputPin,
{
    /// Check if the device refuses commands or data right now
    pub fn is_busy(&mut self) -> Result<bool, TDreq::Error> {
        self.interface.is_busy()
    }
}

impl<TBus, TXcs, TXdcs, TDreq> Vs1003<Vs1003Interface<TBus, TXcs, TXdcs, TDreq>>
where
    TBus: BusControl,
    TXcs: OutputPin,
    TXdcs: OutputPin<Error = TXcs::Error>,
    TDreq: InputPin,
{
    /// Proxy for [`Vs1003Interface::wait_until_ready`]
    pub fn wait_until_ready(&mut self) -> Result<(), InterfaceError<TBus, TXcs, TDreq>> {
        self.interface.wait_until_ready()
    }

    /// Proxy for [`Vs1003Interface::send_data`]
    pub fn send_data(&mut self, data: &[u8]) -> Result<(), InterfaceError<TBus, TXcs, TDreq>> {
        self.interface.send_data(data)
    }

    /// Proxy for [`Vs1003Interface::set_fast_clock`]
    pub fn set_fast_clock(&mut self) -> Result<(), InterfaceError<TBus, TXcs, TDreq>> {
        self.interface.set_fast_clock()
    }
}

device_driver::create_device!(
    device_name: Vs1003,
    dsl: {
        config {
            type RegisterAddressType = u8;
            type DefaultByteOrder = BE;
            type DefmtFeature = "defmt-03";
        }
        /// Any SCI register by its address, as a plain 16-bit word.
        register Raw {
            const ADDRESS = 0x0;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;
            const REPEAT = {
                count: 16,
                stride: 1,
            };

            value: uint = 0..16,
        },
        /// SCI_MODE, the operating mode.
        register Mode {
            const ADDRESS = 0x0;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// Invert the left channel for differential output
            differential: bool = 0,
            /// Software reset, cleared by the chip once the reset is done
            reset: bool = 2,
            /// Leave WAV decoding
            out_of_wav: bool = 3,
            power_down: bool = 4,
            /// Allow SDI tests
            allow_tests: bool = 5,
            stream_mode: bool = 6,
            /// Latch SDI data on the falling DCLK edge
            dclk_falling_edge: bool = 8,
            /// SDI bytes arrive least significant bit first
            sdi_lsb_first: bool = 9,
            /// xDCS is generated by inverting xCS, so SDI needs no chip select of its own
            sdi_share: bool = 10,
            /// VS10xx native SPI modes
            sdi_new: bool = 11,
            /// Together with `reset` starts an IMA ADPCM recording session
            adpcm: bool = 12,
            /// High-pass filter for recording
            adpcm_hp: bool = 13,
            /// Record from LINEIN instead of the microphone
            line_input: bool = 14,
        },
        /// SCI_STATUS
        register Status {
            const ADDRESS = 0x1;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// Chip family as reported by SS_VER.
            /// Code 2 is shared by the VS1002 and the VS1011e.
            version: uint as enum Version {
                Vs1001 = 0,
                Vs1011 = 1,
                Vs1002 = 2,
                Vs1003 = 3,
                Vs1053 = 4,
                Vs1033 = 5,
                Vs1063 = 6,
                Vs1103 = 7,
                Unknown = catch_all
            } = 4..=7,

            /// Analog driver power-down.
            /// Set a few milliseconds before reset to avoid a click.
            analog_driver_powerdown: bool = 3,
            /// Internal analog power-down, owned by the chip firmware
            analog_internal_powerdown: bool = 2,
            /// Analog volume, owned by the chip firmware.
            /// 0 = -0 dB, 1 = -6 dB, 3 = -12 dB
            analog_volume: uint = 0..=1,
        },
        /// SCI_BASS, built-in bass and treble enhancers.
        register Bass {
            const ADDRESS = 0x2;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// Treble in 1.5 dB steps, 0 = off
            treble_amplitude: int = 12..=15,
            /// Treble lower limit in 1 kHz steps
            treble_frequency: uint = 8..=11,
            /// Bass enhancement in 1 dB steps, 0 = off
            bass_amplitude: uint = 4..=7,
            /// Bass lower limit in 10 Hz steps (2..=15)
            bass_frequency: uint = 0..=3,
        },
        /// SCI_CLOCKF, clock multiplier and crystal frequency.
        register Clockf {
            const ADDRESS = 0x3;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            /// CLKI = XTALI * (1 + multiplier / 2)
            multiplier: uint = 13..=15,
            /// Extra multiplier the firmware may add for WMA, in 0.5x steps
            allowed_addition: uint = 11..=12,
            /// (XTALI - 8 MHz) / 4 kHz, 0 means 12.288 MHz
            input_frequency: uint = 0..=10,
        },
        /// SCI_DECODE_TIME, seconds decoded (or recorded) so far.
        ///
        /// A new value only sticks when it is written twice in a row.
        register DecodeTime {
            const ADDRESS = 0x4;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            seconds: uint = 0..16,
        },
        /// SCI_AUDATA, sample rate and channel count of the current stream.
        register Audata {
            const ADDRESS = 0x5;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            stereo: bool = 0,
            /// Sample rate divided by two
            half_sample_rate: uint = 1..16,
        },
        /// SCI_HDAT1, stream header data. Identifies the format being decoded.
        register StreamHeader {
            type Access = RO;

            const ADDRESS = 0x9;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            value: uint = 0..16,
        },
        /// SCI_HDAT0 while recording: the next word of encoded ADPCM data.
        register RecData {
            type Access = RO;

            const ADDRESS = 0x8;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            value: uint = 0..16,
        },
        /// SCI_HDAT1 while recording: number of words waiting in the record buffer.
        register RecWords {
            type Access = RO;

            const ADDRESS = 0x9;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            value: uint = 0..16,
        },
        /// SCI_VOL, attenuation in -0.5 dB steps per channel.
        ///
        /// 0 is full volume, 254 (0xFE) silence; 255 on both channels powers the analog part down.
        register Vol {
            const ADDRESS = 0xB;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;

            right: uint = 0..8,
            left: uint = 8..16,
        },
        /// SCI_AICTRL0..3, application control words.
        ///
        /// In recording mode AICTRL0 is the sample rate divider and AICTRL1 the gain.
        register AiCtrl {
            const ADDRESS = 0xC;
            const SIZE_BITS = 16;
            const ALLOW_ADDRESS_OVERLAP = true;
            const REPEAT = {
                count: 4,
                stride: 1,
            };

            value: uint = 0..16,
        },
    }
);
