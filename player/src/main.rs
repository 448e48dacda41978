//! Plays `SONG.MP3` from the SD card, records ten seconds from the microphone into `REC.WAV`
//! and plays the recording back.
//!
//! VS1003 on SPI0 (SCK gpio2, MOSI gpio3, MISO gpio4, xCS gpio5, DREQ gpio6, xRST gpio7,
//! xDCS gpio8), SD card on SPI1 (SCK gpio10, MOSI gpio11, MISO gpio12, CS gpio13).

#![no_std]
#![no_main]

mod storage;

use core::cell::RefCell;

use bsp::entry;
use defmt::{error, info, warn, Debug2Format};
use defmt_rtt as _;
use embedded_hal::{
    delay::DelayNs,
    digital::{OutputPin, PinState},
    spi::{ErrorType, SpiBus},
};
use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_sdmmc::{SdCard, TimeSource, Timestamp, VolumeIdx, VolumeManager};
use fugit::HertzU32;
use panic_probe as _;

use rp_pico::{
    self as bsp,
    hal::{
        fugit::RateExtU32,
        gpio::{bank0, FunctionSpi, Pin, PullDown},
        spi::Enabled,
    },
};
use vs1003_audio::{
    pac::BusControl, Config, Peripherals, PlaybackMonitor, PlaybackStatus,
    SampleRate, Vs1003,
};

use bsp::hal::{
    clocks::{init_clocks_and_plls, Clock},
    pac,
    sio::Sio,
    watchdog::Watchdog,
};

use storage::SdStorage;

const SONG: &str = "SONG.MP3";
const RECORDING: &str = "REC.WAV";
const RECORD_SECONDS: u32 = 10;

/// Below CLKI / 7 of the codec before its clock multiplier is set
const CODEC_SLOW_CLOCK: HertzU32 = HertzU32::from_raw(1_000_000);
/// Below CLKI / 7 at 36.864 MHz
const CODEC_FAST_CLOCK: HertzU32 = HertzU32::from_raw(4_000_000);

type CodecSpi = bsp::hal::Spi<
    Enabled,
    pac::SPI0,
    (
        Pin<bank0::Gpio3, FunctionSpi, PullDown>,
        Pin<bank0::Gpio4, FunctionSpi, PullDown>,
        Pin<bank0::Gpio2, FunctionSpi, PullDown>,
    ),
    8,
>;

/// The codec's SPI peripheral, with the clock switching the driver asks for
struct CodecBus {
    spi: CodecSpi,
    peripheral_clock: HertzU32,
}

impl ErrorType for CodecBus {
    type Error = <CodecSpi as ErrorType>::Error;
}

impl SpiBus for CodecBus {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.spi.read(words)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.spi.write(words)
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.spi.transfer(read, write)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.spi.transfer_in_place(words)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        SpiBus::flush(&mut self.spi)
    }
}

impl BusControl for CodecBus {
    fn reinitialize(&mut self) -> Result<(), Self::Error> {
        SpiBus::flush(&mut self.spi)?;
        self.spi
            .set_baudrate(self.peripheral_clock, CODEC_SLOW_CLOCK);
        Ok(())
    }

    fn set_fast_clock(&mut self) -> Result<(), Self::Error> {
        let actual = self
            .spi
            .set_baudrate(self.peripheral_clock, CODEC_FAST_CLOCK);
        info!("Codec SPI at {} Hz", actual.to_Hz());
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct SharedDelay<'a>(&'a RefCell<cortex_m::delay::Delay>);

impl DelayNs for SharedDelay<'_> {
    fn delay_ns(&mut self, ns: u32) {
        self.0.borrow_mut().delay_us(ns.div_ceil(1000));
    }

    fn delay_us(&mut self, us: u32) {
        self.0.borrow_mut().delay_us(us);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.0.borrow_mut().delay_ms(ms);
    }
}

/// The board has no RTC, files get a fixed date
struct FixedTime;

impl TimeSource for FixedTime {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 56,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

struct LogMonitor;

impl PlaybackMonitor for LogMonitor {
    fn report(&mut self, status: &PlaybackStatus) {
        info!("play: {}", status);
    }
}

#[entry]
fn main() -> ! {
    info!("Program start");
    let mut pac = pac::Peripherals::take().unwrap();
    let core = pac::CorePeripherals::take().unwrap();
    let mut watchdog = Watchdog::new(pac.WATCHDOG);
    let sio = Sio::new(pac.SIO);

    // External high-speed crystal on the pico board is 12Mhz
    let external_xtal_freq_hz = 12_000_000u32;
    let clocks = init_clocks_and_plls(
        external_xtal_freq_hz,
        pac.XOSC,
        pac.CLOCKS,
        pac.PLL_SYS,
        pac.PLL_USB,
        &mut pac.RESETS,
        &mut watchdog,
    )
    .ok()
    .unwrap();

    let delay = RefCell::new(cortex_m::delay::Delay::new(
        core.SYST,
        clocks.system_clock.freq().to_Hz(),
    ));
    let mut delay = SharedDelay(&delay);

    // Takes the timer out of reset, the log timestamp reads it directly
    let _timer = bsp::hal::Timer::new(pac.TIMER, &mut pac.RESETS, &clocks);
    defmt::timestamp!("{=u32:us}", {
        unsafe { &*rp_pico::pac::TIMER::PTR }
            .timerawl()
            .read()
            .bits()
    });

    let pins = bsp::Pins::new(
        pac.IO_BANK0,
        pac.PADS_BANK0,
        sio.gpio_bank0,
        &mut pac.RESETS,
    );

    let sck = pins.gpio2.into_function::<FunctionSpi>();
    let mosi = pins.gpio3.into_function::<FunctionSpi>();
    let miso = pins.gpio4.into_function::<FunctionSpi>();
    let xcs = pins.gpio5.into_push_pull_output_in_state(PinState::High);
    let dreq = pins.gpio6.into_pull_up_input();
    let xrst = pins.gpio7.into_push_pull_output_in_state(PinState::High);
    let xdcs = pins.gpio8.into_push_pull_output_in_state(PinState::High);

    let mut led_pin = pins.led.into_push_pull_output();

    let spi0 = bsp::hal::Spi::<_, _, _, 8>::new(pac.SPI0, (mosi, miso, sck)).init(
        &mut pac.RESETS,
        clocks.peripheral_clock.freq(),
        CODEC_SLOW_CLOCK,
        embedded_hal::spi::MODE_0,
    );
    let bus = CodecBus {
        spi: spi0,
        peripheral_clock: clocks.peripheral_clock.freq(),
    };

    let device = Vs1003::new(
        Peripherals {
            bus,
            xcs,
            xdcs,
            dreq,
            xrst,
        },
        Config::default(),
    );
    let mut codec = match device.reset_initialize(&mut delay) {
        Ok(codec) => codec,
        Err(mut failed) => loop {
            warn!("VS1003 init failed: {}, retrying", Debug2Format(&failed.error));
            delay.delay_ms(100);
            match failed.device.reset_initialize(&mut delay) {
                Ok(codec) => break codec,
                Err(again) => failed = again,
            }
        },
    };

    let sd_sck = pins.gpio10.into_function::<FunctionSpi>();
    let sd_mosi = pins.gpio11.into_function::<FunctionSpi>();
    let sd_miso = pins.gpio12.into_function::<FunctionSpi>();
    let sd_cs = pins.gpio13.into_push_pull_output_in_state(PinState::High);
    let spi1 = bsp::hal::Spi::<_, _, _, 8>::new(pac.SPI1, (sd_mosi, sd_miso, sd_sck)).init(
        &mut pac.RESETS,
        clocks.peripheral_clock.freq(),
        400.kHz(),
        embedded_hal::spi::MODE_0,
    );
    let sd_device = ExclusiveDevice::new(spi1, sd_cs, delay).unwrap();
    let sdcard = SdCard::new(sd_device, delay);
    match sdcard.num_bytes() {
        Ok(size) => info!("SD card: {} bytes", size),
        Err(e) => error!("SD card init failed: {}", Debug2Format(&e)),
    }
    sdcard.spi(|device| {
        device
            .bus_mut()
            .set_baudrate(clocks.peripheral_clock.freq(), 16.MHz());
    });

    let mut volume_mgr = VolumeManager::new(sdcard, FixedTime);
    let mut volume = volume_mgr.open_volume(VolumeIdx(0)).unwrap();
    let mut storage = SdStorage::new(volume.open_root_dir().unwrap());

    codec.set_volume(0x20).unwrap();
    codec.set_bass_enhancement(true).unwrap();

    match codec.play_file(&mut storage, SONG, &mut delay, &mut LogMonitor) {
        Ok(bytes) => info!("Played {} bytes of {}", bytes, SONG),
        Err(e) => error!("Playing {} failed: {}", SONG, Debug2Format(&e)),
    }

    info!("Recording");
    led_pin.set_high().unwrap();
    let recorded = codec.record_file(
        &mut storage,
        RECORDING,
        &mut delay,
        RECORD_SECONDS,
        SampleRate::Hz8000,
    );
    led_pin.set_low().unwrap();
    match recorded {
        Ok(summary) => info!("Recorded {}", summary),
        Err(e) => error!("Recording failed: {}", Debug2Format(&e)),
    }

    info!("Playing the recording back");
    match codec.play_file(&mut storage, RECORDING, &mut delay, &mut LogMonitor) {
        Ok(bytes) => info!("Played {} bytes", bytes),
        Err(e) => error!("Playback failed: {}", Debug2Format(&e)),
    }

    codec.shutdown(&mut delay).unwrap();
    info!("Done");
    loop {
        cortex_m::asm::wfi();
    }
}
