//! Where played and recorded files live.

use embedded_io::{ErrorType, Read, Seek, Write};

/// How a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum OpenMode {
    /// Existing file, read from the start
    Read,
    /// New or emptied file, written from the start
    CreateTruncate,
}

/// A filesystem the streaming functions can open files on.
///
/// Files borrow the storage while open and must be given back through [`Storage::close`],
/// so that the filesystem can flush its directory entry.
pub trait Storage {
    /// Error of every filesystem and file operation
    type Error: embedded_io::Error;

    /// An open file
    type File<'s>: Read + Write + Seek + ErrorType<Error = Self::Error>
    where
        Self: 's;

    /// Open the file at `path`
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::File<'_>, Self::Error>;

    /// Close a file opened by [`Storage::open`]
    fn close<'s>(file: Self::File<'s>) -> Result<(), Self::Error>
    where
        Self: 's;
}
