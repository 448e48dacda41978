use embedded_hal::delay::DelayNs;
use embedded_io::{Seek, SeekFrom, Write};
use fugit::{ExtU32, HertzU32, RateExtU32};

use crate::{
    wav::{WavHeader, BLOCK_SIZE, MAX_SECTORS, SECTOR_SIZE},
    DriverError, Error, Initialized, OpenMode, Storage, StreamError, Vs1003, Vs1003Peripherals,
    SILENCE,
};

/// SCI_BASS address, snapshotted while recording
const BASS_INDEX: usize = 0x02;
/// SCI_VOL address, snapshotted while recording
const VOL_INDEX: usize = 0x0B;

/// Fixed 4x gain (1024 = 1x), automatic gain control off
const RECORD_GAIN: u16 = 0x1000;

/// The record buffer holds 1024 words
const RECORD_BUFFER_WORDS: core::ops::Range<u16> = 128..896;

/// Offset of the reserved byte of an IMA ADPCM block header, zero in every valid block
const BLOCK_TAG_OFFSET: usize = 3;

/// ADPCM recording rates the codec supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum SampleRate {
    /// 8 kHz
    Hz8000,
    /// 16 kHz
    Hz16000,
}

impl SampleRate {
    /// The rate in Hz
    pub fn hz(self) -> HertzU32 {
        match self {
            SampleRate::Hz8000 => 8_000.Hz(),
            SampleRate::Hz16000 => 16_000.Hz(),
        }
    }

    /// Sectors (pairs of 505-sample blocks) produced every 505 ms
    const fn sectors_per_window(self) -> u64 {
        match self {
            SampleRate::Hz8000 => 4,
            SampleRate::Hz16000 => 8,
        }
    }

    /// The highest header-inclusive sector count a recording of `seconds` keeps going at.
    ///
    /// Capped at [`MAX_SECTORS`], so the size fields of the finished header cannot overflow.
    pub fn sector_limit(self, seconds: u32) -> u32 {
        let limit = u64::from(seconds) * 1000 * self.sectors_per_window() / 505;
        limit.min(u64::from(MAX_SECTORS - 1)) as u32
    }
}

/// Outcome of [`Vs1003::record_file`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct RecordingSummary {
    /// Sectors in the file, the header sector included
    pub sectors: u32,
    /// Block pairs that failed validation and were left out
    pub dropped_pairs: u32,
    /// Size of the file in bytes
    pub file_size: u32,
}

/// The codec in IMA ADPCM recording mode.
///
/// Volume and tone settings from before the recording are restored by [`Recording::finish`].
pub struct Recording<'a, T: Vs1003Peripherals> {
    codec: &'a mut Vs1003<Initialized, T>,
    rate: SampleRate,
    saved_volume: u16,
    saved_bass: u16,
}

impl<T: Vs1003Peripherals> core::fmt::Debug for Recording<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Recording")
            .field("rate", &self.rate)
            .field("saved_volume", &self.saved_volume)
            .field("saved_bass", &self.saved_bass)
            .finish_non_exhaustive()
    }
}

impl<T: Vs1003Peripherals> Vs1003<Initialized, T> {
    /// Mute the output and switch the codec into IMA ADPCM recording at `rate`.
    ///
    /// # Blocking
    ///
    /// This method blocks for at least 20ms.
    ///
    /// # Panics
    ///
    /// This call will panic if the rate is too high for the configured clock.
    /// The maximum achievable rate is CLKI / 1024.
    pub fn begin_recording(
        &mut self,
        delay: &mut impl DelayNs,
        rate: SampleRate,
    ) -> Result<Recording<'_, T>, T::Error> {
        let saved_volume = self.sci.raw(VOL_INDEX).read().map_err(Error::from)?.value();
        let saved_bass = self.sci.raw(BASS_INDEX).read().map_err(Error::from)?.value();

        self.set_volume(SILENCE)?;
        self.sci.bass().write(|_| {}).map_err(Error::from)?;
        delay.delay_ms(10);
        self.write_clock(delay)?;

        let divider = self.sample_rate_divider(rate);
        debug!("Recording divider {=u16}", divider);

        // AICTRL0 is the divider
        self.sci
            .ai_ctrl(0)
            .write(|r| r.set_value(divider))
            .map_err(Error::from)?;
        // AICTRL1 is the gain
        self.sci
            .ai_ctrl(1)
            .write(|r| r.set_value(RECORD_GAIN))
            .map_err(Error::from)?;

        self.sci
            .mode()
            .modify(|r| {
                r.set_adpcm(true);
                r.set_reset(true);
            })
            .map_err(Error::from)?;
        delay.delay_ms(10);
        self.wait_for_dreq(delay, 10.millis())?;
        // The reset that starts the recorder also resets SCI_CLOCKF
        self.write_clock(delay)?;

        Ok(Recording {
            codec: self,
            rate,
            saved_volume,
            saved_bass,
        })
    }

    fn sample_rate_divider(&self, rate: SampleRate) -> u16 {
        let divider = self
            .config
            .internal_clock()
            .to_Hz()
            .div_ceil(256 * rate.hz().to_Hz());
        assert!(
            divider >= 4,
            "Requested sample rate is too high for provided clock"
        );
        divider as u16
    }

    /// Record `seconds` of audio at `rate` into a new WAV file at `path`.
    ///
    /// Block pairs whose headers look corrupt are dropped and counted. Once recording mode was
    /// entered the codec is always brought back and the file always closed, the first error
    /// is the one returned.
    pub fn record_file<S: Storage>(
        &mut self,
        storage: &mut S,
        path: &str,
        delay: &mut impl DelayNs,
        seconds: u32,
        rate: SampleRate,
    ) -> Result<RecordingSummary, StreamError<T::Error, S::Error>> {
        let mut file = storage
            .open(path, OpenMode::CreateTruncate)
            .map_err(StreamError::File)?;

        let mut recording = match self.begin_recording(delay, rate) {
            Ok(recording) => recording,
            Err(error) => {
                let _ = S::close(file);
                return Err(StreamError::Codec(error));
            }
        };
        info!("Recording {=u32} s to {=str}", seconds, path);

        let captured = recording.capture(&mut file, seconds);
        let finished = recording.finish(delay).map_err(StreamError::Codec);
        let closed = S::close(file).map_err(StreamError::File);

        let summary = captured?;
        finished?;
        closed?;

        info!(
            "Recorded {=u32} sectors, {=u32} pairs dropped",
            summary.sectors,
            summary.dropped_pairs
        );
        Ok(summary)
    }
}

impl<T: Vs1003Peripherals> Recording<'_, T> {
    /// The rate the codec records at
    pub fn sample_rate(&self) -> SampleRate {
        self.rate
    }

    /// Wait until the record buffer holds less than 256 words, so the next read starts at a
    /// block boundary.
    pub fn sync_to_frame(&mut self) -> Result<(), T::Error> {
        let limit = self.codec.config.record_poll_limit;
        for _ in 0..limit {
            if self.buffered_words()? >> 8 == 0 {
                return Ok(());
            }
        }
        Err(DriverError::<T>::RecordStalled(limit))?
    }

    /// Read one 256-byte block, waiting until the record buffer holds at least one
    /// and is not about to overflow.
    pub fn read_block(&mut self, block: &mut [u8; BLOCK_SIZE]) -> Result<(), T::Error> {
        let limit = self.codec.config.record_poll_limit;
        let mut polls = 0;
        while !RECORD_BUFFER_WORDS.contains(&self.buffered_words()?) {
            polls += 1;
            if polls >= limit {
                return Err(DriverError::<T>::RecordStalled(limit))?;
            }
        }

        for word in block.chunks_exact_mut(2) {
            let value = self
                .codec
                .sci
                .rec_data()
                .read()
                .map_err(Error::from)?
                .value();
            word.copy_from_slice(&value.to_be_bytes());
        }
        Ok(())
    }

    /// Leave recording mode: soft reset, then put volume and tone back.
    pub fn finish(self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.codec
            .sci
            .mode()
            .modify(|r| r.set_adpcm(false))
            .map_err(Error::from)?;
        self.codec.reset(delay)?;

        let (volume, bass) = (self.saved_volume, self.saved_bass);
        self.codec
            .sci
            .raw(VOL_INDEX)
            .write(|r| r.set_value(volume))
            .map_err(Error::from)?;
        self.codec
            .sci
            .raw(BASS_INDEX)
            .write(|r| r.set_value(bass))
            .map_err(Error::from)?;
        Ok(())
    }

    fn buffered_words(&mut self) -> Result<u16, T::Error> {
        Ok(self
            .codec
            .sci
            .rec_words()
            .read()
            .map_err(Error::from)?
            .value())
    }

    fn capture<F: Write + Seek>(
        &mut self,
        file: &mut F,
        seconds: u32,
    ) -> Result<RecordingSummary, StreamError<T::Error, F::Error>> {
        let mut header = WavHeader::new(self.rate.hz());
        write_all(file, &header.to_bytes())?;

        self.sync_to_frame().map_err(StreamError::Codec)?;

        let limit = self.rate.sector_limit(seconds);
        let mut pair = [[0u8; BLOCK_SIZE]; SECTOR_SIZE / BLOCK_SIZE];
        let mut dropped_pairs = 0;

        while header.sectors <= limit {
            for block in pair.iter_mut() {
                self.read_block(block).map_err(StreamError::Codec)?;
            }

            let sector = pair.as_flattened();
            if is_intact(sector) {
                write_all(file, sector)?;
                header.sectors += 1;
            } else {
                dropped_pairs += 1;
                warn!("Dropped a corrupt block pair at sector {=u32}", header.sectors);
            }
        }

        file.seek(SeekFrom::Start(0)).map_err(StreamError::File)?;
        write_all(file, &header.to_bytes())?;
        file.flush().map_err(StreamError::File)?;

        Ok(RecordingSummary {
            sectors: header.sectors,
            dropped_pairs,
            file_size: header.file_size(),
        })
    }
}

/// Both blocks of a sector carry a zero reserved byte in their headers
fn is_intact(sector: &[u8]) -> bool {
    debug_assert_eq!(sector.len(), SECTOR_SIZE);
    sector[BLOCK_TAG_OFFSET] == 0 && sector[BLOCK_SIZE + BLOCK_TAG_OFFSET] == 0
}

/// Hand all of `bytes` to the file, which may take them in several pieces.
/// A file that stops taking bytes is a short write. `Write::write_all` panics on that instead.
fn write_all<E, F: Write>(file: &mut F, bytes: &[u8]) -> Result<(), StreamError<E, F::Error>> {
    let mut written = 0;
    while written < bytes.len() {
        match file.write(&bytes[written..]).map_err(StreamError::File)? {
            0 => {
                return Err(StreamError::ShortWrite {
                    expected: bytes.len(),
                    written,
                })
            }
            taken => written += taken,
        }
    }
    Ok(())
}
