use embedded_hal::delay::DelayNs;
use embedded_io::Read;
use fugit::SecsDurationU32;

use crate::{
    AudioData, AudioFormat, Error, Initialized, OpenMode, Storage, StreamError, Vs1003,
    Vs1003Peripherals, CHUNK_SIZE, END_FILL_BYTES, FILL_TIMEOUT, STREAM_LEAD_IN_BYTES,
};

/// Snapshot of a running playback, handed to a [`PlaybackMonitor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct PlaybackStatus {
    /// Format the decoder recognized
    pub format: AudioFormat,
    /// Sample rate and channels
    pub audio: AudioData,
    /// Seconds decoded so far
    pub decode_time: SecsDurationU32,
    /// Bytes sent to the codec so far
    pub streamed_bytes: u32,
}

/// Receives status reports while [`Vs1003::play_file`] runs
pub trait PlaybackMonitor {
    /// Called while the codec is ready for the next chunk
    fn report(&mut self, status: &PlaybackStatus);

    /// When false the status is never queried
    fn wants_reports(&self) -> bool {
        true
    }
}

impl PlaybackMonitor for () {
    fn report(&mut self, _status: &PlaybackStatus) {}

    fn wants_reports(&self) -> bool {
        false
    }
}

impl AudioFormat {
    /// Streamed bytes between two status reports
    fn report_interval(self) -> u32 {
        match self {
            AudioFormat::Riff | AudioFormat::Mp3 => 4096,
            AudioFormat::Midi | AudioFormat::Unknown => 512,
        }
    }
}

/// An active stream into the decoder.
///
/// The codec stays borrowed until [`Playback::finish`] flushes the stream.
pub struct Playback<'a, T: Vs1003Peripherals> {
    codec: &'a mut Vs1003<Initialized, T>,
}

impl<T: Vs1003Peripherals> core::fmt::Debug for Playback<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Playback").finish_non_exhaustive()
    }
}

impl<T: Vs1003Peripherals> Vs1003<Initialized, T> {
    /// Prepare the decoder for a new stream: a few zero bytes and a cleared decode time.
    pub fn begin_playback(&mut self, delay: &mut impl DelayNs) -> Result<Playback<'_, T>, T::Error> {
        self.send_zeros(delay, STREAM_LEAD_IN_BYTES)?;
        // Register accesses only wait a few polls, give the chip time to take the lead-in
        self.wait_for_dreq(delay, FILL_TIMEOUT)?;
        self.clear_decode_time()?;
        Ok(Playback { codec: self })
    }

    /// Stream the file at `path` to the decoder and return the number of bytes sent.
    ///
    /// Whole 32-byte chunks are sent; the stream ends at the first read that cannot fill a chunk,
    /// including a failed read. While the codec is busy the next chunk is read ahead. Every few
    /// kilobytes, once the codec is ready again, a [`PlaybackStatus`] goes to `monitor`.
    ///
    /// # Blocking
    ///
    /// Blocks until the whole file has been decoded. Waiting for DREQ while streaming is not
    /// bounded, the codec raises it as it plays its buffer.
    pub fn play_file<S: Storage>(
        &mut self,
        storage: &mut S,
        path: &str,
        delay: &mut impl DelayNs,
        monitor: &mut impl PlaybackMonitor,
    ) -> Result<u32, StreamError<T::Error, S::Error>> {
        let mut file = storage
            .open(path, OpenMode::Read)
            .map_err(StreamError::File)?;
        info!("Playing {=str}", path);

        let streamed = self.stream_from(&mut file, delay, monitor);
        let closed = S::close(file).map_err(StreamError::File);

        let streamed = streamed?;
        closed?;
        Ok(streamed)
    }

    fn stream_from<F: Read>(
        &mut self,
        file: &mut F,
        delay: &mut impl DelayNs,
        monitor: &mut impl PlaybackMonitor,
    ) -> Result<u32, StreamError<T::Error, F::Error>> {
        let mut playback = self.begin_playback(delay).map_err(StreamError::Codec)?;

        let mut chunk = [0u8; CHUNK_SIZE];
        let mut need_data = true;
        let mut streamed: u32 = 0;
        let mut next_report: u32 = 0;

        let reporting = monitor.wants_reports();

        'stream: loop {
            while playback.is_busy().map_err(StreamError::Codec)? {
                if need_data {
                    if !fetch_chunk(file, &mut chunk) {
                        break 'stream;
                    }
                    need_data = false;
                }
            }

            // DREQ is high, so the status reads do not have to wait for the buffer to drain
            if reporting && streamed >= next_report {
                let status = playback.status(streamed).map_err(StreamError::Codec)?;
                next_report = streamed + status.format.report_interval();
                monitor.report(&status);
            }

            if need_data && !fetch_chunk(file, &mut chunk) {
                break;
            }
            playback.send_chunk(&chunk).map_err(StreamError::Codec)?;
            need_data = true;
            streamed += CHUNK_SIZE as u32;
        }

        info!("End of stream after {=u32} bytes", streamed);
        playback.finish(delay).map_err(StreamError::Codec)?;
        Ok(streamed)
    }
}

/// Fill `chunk` completely. Returns false at the end of the stream.
fn fetch_chunk<F: Read>(file: &mut F, chunk: &mut [u8; CHUNK_SIZE]) -> bool {
    let mut filled = 0;
    while filled < CHUNK_SIZE {
        match file.read(&mut chunk[filled..]) {
            Ok(0) => return false,
            Ok(read) => filled += read,
            Err(_) => {
                warn!("File read failed, ending the stream");
                return false;
            }
        }
    }
    true
}

impl<T: Vs1003Peripherals> Playback<'_, T> {
    /// Returns true while the codec cannot take another chunk
    pub fn is_busy(&mut self) -> Result<bool, T::Error> {
        self.codec.is_busy()
    }

    /// Send one chunk. Only call this after [`Playback::is_busy`] returned false.
    pub fn send_chunk(&mut self, chunk: &[u8; CHUNK_SIZE]) -> Result<(), T::Error> {
        self.codec.sci.send_data(chunk).map_err(Error::from)?;
        Ok(())
    }

    /// Proxy for [`Vs1003::format`]
    pub fn format(&mut self) -> Result<AudioFormat, T::Error> {
        self.codec.format()
    }

    /// Proxy for [`Vs1003::audio_data`]
    pub fn audio_data(&mut self) -> Result<AudioData, T::Error> {
        self.codec.audio_data()
    }

    /// Proxy for [`Vs1003::decode_time`]
    pub fn decode_time(&mut self) -> Result<SecsDurationU32, T::Error> {
        self.codec.decode_time()
    }

    /// Proxy for [`Vs1003::set_volume`]
    pub fn set_volume(&mut self, attenuation: u8) -> Result<(), T::Error> {
        self.codec.set_volume(attenuation)
    }

    /// Query everything a [`PlaybackStatus`] holds
    pub fn status(&mut self, streamed_bytes: u32) -> Result<PlaybackStatus, T::Error> {
        Ok(PlaybackStatus {
            format: self.format()?,
            audio: self.audio_data()?,
            decode_time: self.decode_time()?,
            streamed_bytes,
        })
    }

    /// End the stream: pad it with zeros so the decoder plays out everything it buffered.
    pub fn finish(self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.codec.send_zeros(delay, END_FILL_BYTES)
    }
}
