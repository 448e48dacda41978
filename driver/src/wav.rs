//! The 512-byte IMA ADPCM WAV header written in front of recordings.
//!
//! The header fills one whole sector, so every later write of the recorder stays sector
//! aligned: `fmt ` and `fact` chunks are followed by a `JUNK` chunk padding up to the
//! `data` chunk header at offset 504.

use fugit::HertzU32;

/// Size of one storage sector. Audio is written in whole sectors.
pub const SECTOR_SIZE: usize = 512;

/// Size of the header, which takes the first sector
pub const HEADER_SIZE: usize = SECTOR_SIZE;

/// Most sectors a file can have while its sample count and sizes fit the 32-bit header fields.
/// The sample count (1010 per audio sector) is the first to overflow.
pub const MAX_SECTORS: u32 = u32::MAX / (2 * SAMPLES_PER_BLOCK as u32) + 1;

/// Bytes of one IMA ADPCM block, as produced by the codec
pub const BLOCK_SIZE: usize = 256;

/// Samples encoded in one block: the header sample plus two per byte of the remaining 252
pub const SAMPLES_PER_BLOCK: u16 = 505;

const FORMAT_IMA_ADPCM: u16 = 0x0011;
const CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 4;
const FMT_CHUNK_SIZE: u32 = 20;
const FACT_CHUNK_SIZE: u32 = 4;
const JUNK_CHUNK_SIZE: u32 = 444;
const DATA_CHUNK_OFFSET: usize = 504;

/// Header of a mono IMA ADPCM recording made of whole 512-byte sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct WavHeader {
    /// Sample rate of the recording
    pub sample_rate: HertzU32,
    /// Sectors in the file, the header sector included
    pub sectors: u32,
}

impl WavHeader {
    /// Header of a file that holds no audio yet
    pub const fn new(sample_rate: HertzU32) -> Self {
        Self {
            sample_rate,
            sectors: 1,
        }
    }

    /// Total file size in bytes
    pub const fn file_size(&self) -> u32 {
        self.sectors * SECTOR_SIZE as u32
    }

    /// Value of the RIFF chunk size field
    pub const fn riff_size(&self) -> u32 {
        self.file_size() - 8
    }

    /// Value of the data chunk size field
    pub const fn data_size(&self) -> u32 {
        self.file_size() - HEADER_SIZE as u32
    }

    /// Samples in the file, two blocks per sector
    pub const fn sample_count(&self) -> u32 {
        self.audio_sectors() * 2 * SAMPLES_PER_BLOCK as u32
    }

    /// Average byte rate: one block per 505 samples
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate.to_Hz() * BLOCK_SIZE as u32 / SAMPLES_PER_BLOCK as u32
    }

    const fn audio_sectors(&self) -> u32 {
        self.sectors.saturating_sub(1)
    }

    /// Serialize the header, little-endian
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buffer = [0u8; HEADER_SIZE];
        let mut writer = HeaderWriter::new(&mut buffer);

        writer.put(b"RIFF");
        writer.put_u32_le(self.riff_size());
        writer.put(b"WAVE");

        writer.put(b"fmt ");
        writer.put_u32_le(FMT_CHUNK_SIZE);
        writer.put_u16_le(FORMAT_IMA_ADPCM);
        writer.put_u16_le(CHANNELS);
        writer.put_u32_le(self.sample_rate.to_Hz());
        writer.put_u32_le(self.byte_rate());
        writer.put_u16_le(BLOCK_SIZE as u16);
        writer.put_u16_le(BITS_PER_SAMPLE);
        // cbSize, then the extra word: samples per block
        writer.put_u16_le(2);
        writer.put_u16_le(SAMPLES_PER_BLOCK);

        writer.put(b"fact");
        writer.put_u32_le(FACT_CHUNK_SIZE);
        writer.put_u32_le(self.sample_count());

        writer.put(b"JUNK");
        writer.put_u32_le(JUNK_CHUNK_SIZE);
        writer.skip_to(DATA_CHUNK_OFFSET);

        writer.put(b"data");
        writer.put_u32_le(self.data_size());

        buffer
    }
}

struct HeaderWriter<'a> {
    buffer: &'a mut [u8],
    offset: usize,
}

impl<'a> HeaderWriter<'a> {
    fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    fn put(&mut self, data: &[u8]) {
        self.buffer[self.offset..self.offset + data.len()].copy_from_slice(data);
        self.offset += data.len();
    }

    fn put_u16_le(&mut self, value: u16) {
        self.put(&value.to_le_bytes());
    }

    fn put_u32_le(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    fn skip_to(&mut self, offset: usize) {
        debug_assert!(offset >= self.offset);
        self.offset = offset;
    }
}
