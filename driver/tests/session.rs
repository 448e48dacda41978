mod common;

use common::*;
use embedded_hal_mock::eh1::delay::NoopDelay;
use vs1003_audio::{pac, Config, Error, Vs1003};

#[test]
fn initialization_configures_clock_and_native_mode() {
    let chip = chip();
    let codec = Vs1003::new(peripherals(&chip), Config::default())
        .reset_initialize(&mut NoopDelay::new());
    assert!(codec.is_ok());

    let model = chip.borrow();
    assert_eq!(model.hardware_resets, 1);
    // SM_SDINEW, the reset bit is cleared by the chip
    assert_eq!(model.regs[MODE], 0x0800);
    // 3.0x, 12.288 MHz
    assert_eq!(model.regs[CLOCKF], 0x8000 | 1072);
    assert_eq!(model.regs[VOL], 0xFEFE);
    assert_eq!(model.writes_to(VOL), [0xFFFF, 0xFEFE]);
    assert_eq!(model.writes_to(AICTRL0 + 1), [0xABAD, 0]);
    assert_eq!(model.writes_to(AICTRL0 + 2), [0x7E57, 0]);
    assert!(model.fast_clock);
    assert!(!model.xcs_low && !model.xdcs_low);
}

#[test]
fn shared_chip_select_is_configured() {
    let (chip, _codec) = initialized(Config::default().with_shared_chip_select(true));
    assert_eq!(chip.borrow().regs[MODE], 0x0C00);
}

#[test]
fn register_round_trip_failure_is_reported() {
    let chip = chip();
    chip.borrow_mut().read_mask[AICTRL0 + 1] = 0x00FF;

    let err = Vs1003::new(peripherals(&chip), Config::default())
        .reset_initialize(&mut NoopDelay::new())
        .unwrap_err();

    assert!(matches!(
        err.error,
        Error::SanityCheck {
            address: 0x0D,
            wrote: 0xABAD,
            read: 0x00AD
        }
    ));
    assert!(!chip.borrow().fast_clock);
}

#[test]
fn other_chips_are_rejected_and_can_be_retried() {
    let chip = chip();
    // SS_VER = 4
    chip.borrow_mut().regs[STATUS] = 0x0040;

    let err = Vs1003::new(peripherals(&chip), Config::default())
        .reset_initialize(&mut NoopDelay::new())
        .unwrap_err();
    assert!(matches!(
        err.error,
        Error::UnsupportedChip(pac::Version::Vs1053)
    ));

    chip.borrow_mut().regs[STATUS] = 0x0030;
    assert!(err.device.reset_initialize(&mut NoopDelay::new()).is_ok());
    assert_eq!(chip.borrow().hardware_resets, 2);
}

#[test]
fn volume_is_replicated_and_clamped() {
    let (chip, mut codec) = initialized(Config::default());

    codec.set_volume(0x20).unwrap();
    assert_eq!(chip.borrow().regs[VOL], 0x2020);

    codec.set_volume(0xFF).unwrap();
    assert_eq!(chip.borrow().regs[VOL], 0xFEFE);
}

#[test]
fn bass_and_treble_keep_each_other() {
    let (chip, mut codec) = initialized(Config::default());

    codec.set_treble_control(true).unwrap();
    codec.set_bass_enhancement(true).unwrap();
    assert_eq!(chip.borrow().regs[BASS], 0x7AF6);

    codec.set_bass_enhancement(false).unwrap();
    assert_eq!(chip.borrow().regs[BASS], 0x7A00);

    codec.set_bass_enhancement(true).unwrap();
    codec.set_treble_control(false).unwrap();
    assert_eq!(chip.borrow().regs[BASS], 0x00F6);
}

#[test]
fn queries_decode_status_registers() {
    let (chip, mut codec) = initialized(Config::default());
    {
        let mut model = chip.borrow_mut();
        model.regs[HDAT1] = 0xFFFB;
        model.regs[AUDATA] = 44_101;
        model.regs[DECODE_TIME] = 93;
    }

    assert_eq!(codec.format().unwrap(), vs1003_audio::AudioFormat::Mp3);
    let audio = codec.audio_data().unwrap();
    assert_eq!(audio.sample_rate.to_Hz(), 44_100);
    assert!(audio.stereo);
    assert_eq!(codec.decode_time().unwrap().ticks(), 93);
}

#[test]
fn soft_reset_flushes_and_restores_defaults() {
    let (chip, mut codec) = initialized(Config::default());
    codec.set_volume(0).unwrap();

    codec.reset(&mut NoopDelay::new()).unwrap();

    let model = chip.borrow();
    assert_eq!(model.sdi.len(), 2048);
    assert!(model.sdi.iter().all(|&b| b == 0));
    assert!(model.writes_to(MODE).iter().any(|v| v & 0x0004 != 0));
    assert_eq!(model.regs[CLOCKF], 0x8000 | 1072);
    assert_eq!(model.regs[VOL], 0x2424);
    assert_eq!(model.writes_to(DECODE_TIME), [0, 0]);
}

#[test]
fn shutdown_powers_down_the_analog_driver() {
    let (chip, mut codec) = initialized(Config::default());

    codec.shutdown(&mut NoopDelay::new()).unwrap();

    let status = chip.borrow().regs[STATUS];
    assert_eq!(status & 0x0008, 0x0008);
    assert_eq!(status & 0x00F0, 0x0030);
}

#[test]
fn failed_transfer_reinitializes_bus_and_next_call_succeeds() {
    let (chip, mut codec) = initialized(Config::default());
    chip.borrow_mut().failing_transfers = 1;

    let err = codec.set_volume(0x10).unwrap_err();
    assert!(matches!(err, Error::Bus(BusFault)));
    {
        let model = chip.borrow();
        assert_eq!(model.reinitialized, 1);
        assert!(!model.xcs_low);
        assert_ne!(model.regs[VOL], 0x1010);
    }

    codec.set_volume(0x10).unwrap();
    assert_eq!(chip.borrow().regs[VOL], 0x1010);
}

#[test]
fn stuck_dreq_is_reported_as_busy() {
    let (chip, mut codec) = initialized(Config::default().with_poll_limits(50, 10));
    chip.borrow_mut().dreq_stuck = true;

    let err: TestError = codec.set_volume(0).unwrap_err();
    assert!(matches!(err, Error::Busy(50)));
    assert_eq!(chip.borrow().reinitialized, 1);
}
