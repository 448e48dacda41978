//! A simulated VS1003 on a fake SPI bus, and an in-memory file store.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::digital::{self, InputPin, OutputPin};
use embedded_hal::spi::{self, SpiBus};
use embedded_hal_mock::eh1::delay::NoopDelay;
use vs1003_audio::{pac, Config, Initialized, OpenMode, Peripherals, Storage, Vs1003};

pub const MODE: usize = 0x0;
pub const STATUS: usize = 0x1;
pub const BASS: usize = 0x2;
pub const CLOCKF: usize = 0x3;
pub const DECODE_TIME: usize = 0x4;
pub const AUDATA: usize = 0x5;
pub const HDAT0: usize = 0x8;
pub const HDAT1: usize = 0x9;
pub const VOL: usize = 0xB;
pub const AICTRL0: usize = 0xC;

const SM_RESET: u16 = 1 << 2;
const SM_ADPCM: u16 = 1 << 12;

/// Register file and pin state of the simulated chip
pub struct ChipModel {
    pub regs: [u16; 16],
    /// ANDed into every value read back, to simulate stuck bits
    pub read_mask: [u16; 16],
    pub xcs_low: bool,
    pub xdcs_low: bool,
    pub hardware_resets: usize,
    /// Every byte received on the data channel
    pub sdi: Vec<u8>,
    /// Every control write, in order
    pub writes: Vec<(u8, u16)>,
    /// DREQ reads that return low after each data transfer
    pub busy_after_data: u32,
    pending_busy: u32,
    /// DREQ never rises
    pub dreq_stuck: bool,
    /// Transfers that fail before the bus works again
    pub failing_transfers: u32,
    pub reinitialized: usize,
    pub fast_clock: bool,
    /// Values of the record fill level, returned before `rec_words_idle`
    pub rec_words: VecDeque<u16>,
    pub rec_words_idle: u16,
    /// Indices of recorded blocks whose header is broken
    pub corrupt_blocks: HashSet<usize>,
    rec_data_reads: usize,
}

impl ChipModel {
    fn new() -> Self {
        let mut regs = [0; 16];
        // SS_VER = 3
        regs[STATUS] = 0x0030;
        Self {
            regs,
            read_mask: [0xFFFF; 16],
            xcs_low: false,
            xdcs_low: false,
            hardware_resets: 0,
            sdi: Vec::new(),
            writes: Vec::new(),
            busy_after_data: 0,
            pending_busy: 0,
            dreq_stuck: false,
            failing_transfers: 0,
            reinitialized: 0,
            fast_clock: false,
            rec_words: VecDeque::new(),
            rec_words_idle: 200,
            corrupt_blocks: HashSet::new(),
            rec_data_reads: 0,
        }
    }

    fn recording(&self) -> bool {
        self.regs[MODE] & SM_ADPCM != 0
    }

    fn write(&mut self, address: u8, value: u16) {
        self.writes.push((address, value));
        let value = if usize::from(address) == MODE {
            // The reset finishes instantly
            value & !SM_RESET
        } else {
            value
        };
        self.regs[usize::from(address & 0x0F)] = value;
    }

    fn read(&mut self, address: u8) -> u16 {
        let index = usize::from(address & 0x0F);
        let value = match index {
            HDAT1 if self.recording() => self.rec_words.pop_front().unwrap_or(self.rec_words_idle),
            HDAT0 if self.recording() => self.next_rec_word(),
            _ => self.regs[index],
        };
        value & self.read_mask[index]
    }

    /// Recorded blocks are 128 words; byte 3 of a block is zero unless the block is corrupt.
    fn next_rec_word(&mut self) -> u16 {
        let block = self.rec_data_reads / 128;
        let word = self.rec_data_reads % 128;
        self.rec_data_reads += 1;
        match word {
            1 if self.corrupt_blocks.contains(&block) => 0x0101,
            1 => 0x0100,
            _ => 0xA000 | (block as u16 & 0xFF),
        }
    }

    fn dreq_high(&mut self) -> bool {
        if self.dreq_stuck {
            false
        } else if self.pending_busy > 0 {
            self.pending_busy -= 1;
            false
        } else {
            true
        }
    }

    /// Control writes to `address`, values only
    pub fn writes_to(&self, address: usize) -> Vec<u16> {
        self.writes
            .iter()
            .filter(|(a, _)| usize::from(*a) == address)
            .map(|(_, v)| *v)
            .collect()
    }
}

pub type Chip = Rc<RefCell<ChipModel>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault;

impl spi::Error for BusFault {
    fn kind(&self) -> spi::ErrorKind {
        spi::ErrorKind::Other
    }
}

pub struct FakeBus(Chip);

impl spi::ErrorType for FakeBus {
    type Error = BusFault;
}

impl FakeBus {
    fn fault(&mut self) -> Result<(), BusFault> {
        let mut chip = self.0.borrow_mut();
        if chip.failing_transfers > 0 {
            chip.failing_transfers -= 1;
            return Err(BusFault);
        }
        Ok(())
    }
}

impl SpiBus for FakeBus {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.fault()?;
        words.fill(0);
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.fault()?;
        let mut chip = self.0.borrow_mut();
        assert!(chip.xdcs_low, "data sent without xDCS");
        assert!(!chip.xcs_low, "data sent while xCS is low");
        chip.sdi.extend_from_slice(words);
        chip.pending_busy = chip.busy_after_data;
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.fault()?;
        read.fill(0);
        let _ = write;
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.fault()?;
        let mut chip = self.0.borrow_mut();
        assert!(chip.xcs_low, "control packet without xCS");
        assert_eq!(words.len(), 4);
        match words[0] {
            0x02 => chip.write(words[1], u16::from_be_bytes([words[2], words[3]])),
            0x03 => {
                let value = chip.read(words[1]);
                words[..2].fill(0);
                words[2..].copy_from_slice(&value.to_be_bytes());
            }
            opcode => panic!("unknown opcode {opcode:#04x}"),
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl pac::BusControl for FakeBus {
    fn reinitialize(&mut self) -> Result<(), Self::Error> {
        let mut chip = self.0.borrow_mut();
        chip.reinitialized += 1;
        chip.fast_clock = false;
        Ok(())
    }

    fn set_fast_clock(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().fast_clock = true;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Line {
    Xcs,
    Xdcs,
    Xrst,
}

pub struct FakePin(Chip, Line);

impl digital::ErrorType for FakePin {
    type Error = Infallible;
}

impl OutputPin for FakePin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        let mut chip = self.0.borrow_mut();
        match self.1 {
            Line::Xcs => chip.xcs_low = true,
            Line::Xdcs => chip.xdcs_low = true,
            Line::Xrst => {}
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut chip = self.0.borrow_mut();
        match self.1 {
            Line::Xcs => chip.xcs_low = false,
            Line::Xdcs => chip.xdcs_low = false,
            Line::Xrst => chip.hardware_resets += 1,
        }
        Ok(())
    }
}

pub struct FakeDreq(Chip);

impl digital::ErrorType for FakeDreq {
    type Error = Infallible;
}

impl InputPin for FakeDreq {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.0.borrow_mut().dreq_high())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.0.borrow_mut().dreq_high())
    }
}

pub type TestPeripherals = Peripherals<FakeBus, FakePin, FakePin, FakeDreq, FakePin>;
pub type TestError = vs1003_audio::Error<BusFault, Infallible, Infallible, Infallible>;

pub fn chip() -> Chip {
    Rc::new(RefCell::new(ChipModel::new()))
}

pub fn peripherals(chip: &Chip) -> TestPeripherals {
    Peripherals {
        bus: FakeBus(chip.clone()),
        xcs: FakePin(chip.clone(), Line::Xcs),
        xdcs: FakePin(chip.clone(), Line::Xdcs),
        dreq: FakeDreq(chip.clone()),
        xrst: FakePin(chip.clone(), Line::Xrst),
    }
}

/// A chip that went through initialization, with the write log cleared
pub fn initialized(config: Config) -> (Chip, Vs1003<Initialized, TestPeripherals>) {
    let chip = chip();
    let codec = Vs1003::new(peripherals(&chip), config)
        .reset_initialize(&mut NoopDelay::new())
        .unwrap();
    {
        let mut model = chip.borrow_mut();
        model.writes.clear();
        model.sdi.clear();
    }
    (chip, codec)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    NotFound,
    Injected,
}

impl embedded_io::Error for MemError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MemError::NotFound => embedded_io::ErrorKind::NotFound,
            MemError::Injected => embedded_io::ErrorKind::Other,
        }
    }
}

#[derive(Default)]
pub struct MemStorage {
    pub files: HashMap<String, Vec<u8>>,
    pub closed: usize,
    pub fail_seek: bool,
    pub fail_reads_after: Option<usize>,
    /// Most bytes a single write call takes
    pub write_limit: Option<usize>,
    /// Size at which files are full and writes take nothing
    pub capacity: Option<usize>,
}

impl MemStorage {
    pub fn with_file(name: &str, contents: Vec<u8>) -> Self {
        let mut storage = Self::default();
        storage.files.insert(name.into(), contents);
        storage
    }
}

pub struct MemFile<'s> {
    storage: &'s mut MemStorage,
    name: String,
    position: usize,
}

impl MemFile<'_> {
    fn contents(&mut self) -> &mut Vec<u8> {
        self.storage.files.entry(self.name.clone()).or_default()
    }
}

impl embedded_io::ErrorType for MemFile<'_> {
    type Error = MemError;
}

impl embedded_io::Read for MemFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if let Some(limit) = self.storage.fail_reads_after {
            if self.position >= limit {
                return Err(MemError::Injected);
            }
        }
        let position = self.position;
        let contents = self.contents();
        let available = contents.len().saturating_sub(position);
        let len = available.min(buf.len());
        buf[..len].copy_from_slice(&contents[position..position + len]);
        self.position += len;
        Ok(len)
    }
}

impl embedded_io::Write for MemFile<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let position = self.position;
        let mut len = buf.len();
        if let Some(limit) = self.storage.write_limit {
            len = len.min(limit);
        }
        if let Some(capacity) = self.storage.capacity {
            len = len.min(capacity.saturating_sub(position));
        }
        let contents = self.contents();
        if contents.len() < position + len {
            contents.resize(position + len, 0);
        }
        contents[position..position + len].copy_from_slice(&buf[..len]);
        self.position += len;
        Ok(len)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl embedded_io::Seek for MemFile<'_> {
    fn seek(&mut self, pos: embedded_io::SeekFrom) -> Result<u64, Self::Error> {
        if self.storage.fail_seek {
            return Err(MemError::Injected);
        }
        let length = self.contents().len() as i64;
        let target = match pos {
            embedded_io::SeekFrom::Start(offset) => offset as i64,
            embedded_io::SeekFrom::End(offset) => length + offset,
            embedded_io::SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        self.position = target.max(0) as usize;
        Ok(self.position as u64)
    }
}

impl Storage for MemStorage {
    type Error = MemError;
    type File<'s> = MemFile<'s>;

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::File<'_>, Self::Error> {
        match mode {
            OpenMode::Read if !self.files.contains_key(path) => return Err(MemError::NotFound),
            OpenMode::Read => {}
            OpenMode::CreateTruncate => {
                self.files.insert(path.into(), Vec::new());
            }
        }
        Ok(MemFile {
            storage: self,
            name: path.into(),
            position: 0,
        })
    }

    fn close<'s>(file: Self::File<'s>) -> Result<(), Self::Error>
    where
        Self: 's,
    {
        file.storage.closed += 1;
        Ok(())
    }
}

pub fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}
