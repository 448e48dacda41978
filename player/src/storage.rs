//! Files on the SD card, as seen by the audio driver.

use embedded_io::{ErrorType, Read, Seek, SeekFrom, Write};
use embedded_sdmmc::{BlockDevice, Directory, File, Mode, TimeSource};
use vs1003_audio::{OpenMode, Storage};

const MAX_DIRS: usize = 4;
const MAX_FILES: usize = 4;
const MAX_VOLUMES: usize = 1;

#[derive(Debug)]
pub struct SdError<E: core::fmt::Debug>(pub embedded_sdmmc::Error<E>);

impl<E: core::fmt::Debug> embedded_io::Error for SdError<E> {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0 {
            embedded_sdmmc::Error::NotFound => embedded_io::ErrorKind::NotFound,
            embedded_sdmmc::Error::InvalidOffset => embedded_io::ErrorKind::InvalidInput,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

/// The root directory of the first volume
pub struct SdStorage<'v, D: BlockDevice, T: TimeSource> {
    root: Directory<'v, D, T, MAX_DIRS, MAX_FILES, MAX_VOLUMES>,
}

impl<'v, D: BlockDevice, T: TimeSource> SdStorage<'v, D, T> {
    pub fn new(root: Directory<'v, D, T, MAX_DIRS, MAX_FILES, MAX_VOLUMES>) -> Self {
        Self { root }
    }
}

pub struct SdFile<'v, D: BlockDevice, T: TimeSource>(File<'v, D, T, MAX_DIRS, MAX_FILES, MAX_VOLUMES>);

impl<D: BlockDevice, T: TimeSource> ErrorType for SdFile<'_, D, T> {
    type Error = SdError<D::Error>;
}

impl<D: BlockDevice, T: TimeSource> Read for SdFile<'_, D, T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.0.is_eof() {
            return Ok(0);
        }
        self.0.read(buf).map_err(SdError)
    }
}

impl<D: BlockDevice, T: TimeSource> Write for SdFile<'_, D, T> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.write(buf).map_err(SdError)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.flush().map_err(SdError)
    }
}

impl<D: BlockDevice, T: TimeSource> Seek for SdFile<'_, D, T> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, Self::Error> {
        let target = match pos {
            SeekFrom::Start(offset) => i64::try_from(offset).unwrap_or(i64::MAX),
            SeekFrom::Current(delta) => i64::from(self.0.offset()) + delta,
            SeekFrom::End(delta) => i64::from(self.0.length()) + delta,
        };
        let target =
            u32::try_from(target).map_err(|_| SdError(embedded_sdmmc::Error::InvalidOffset))?;
        self.0.seek_from_start(target).map_err(SdError)?;
        Ok(u64::from(target))
    }
}

impl<'v, D: BlockDevice, T: TimeSource> Storage for SdStorage<'v, D, T> {
    type Error = SdError<D::Error>;
    type File<'s>
        = SdFile<'s, D, T>
    where
        Self: 's;

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::File<'_>, Self::Error> {
        let mode = match mode {
            OpenMode::Read => Mode::ReadOnly,
            OpenMode::CreateTruncate => Mode::ReadWriteCreateOrTruncate,
        };
        self.root
            .open_file_in_dir(path, mode)
            .map(SdFile)
            .map_err(SdError)
    }

    fn close<'s>(file: Self::File<'s>) -> Result<(), Self::Error>
    where
        Self: 's,
    {
        file.0.close().map_err(SdError)
    }
}
