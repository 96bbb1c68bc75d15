//! Serial discovery unit tests

use kflash::discovery::{
    extract_mcu_from_serial, generate_serial_pattern, is_supported_device, match_device,
    match_devices,
};
use kflash::models::DiscoveredDevice;

fn device(filename: &str) -> DiscoveredDevice {
    DiscoveredDevice {
        path: format!("/dev/serial/by-id/{filename}"),
        filename: filename.to_string(),
    }
}

#[test]
fn test_klipper_pattern_matches_katapult_filename() {
    let devices = vec![device("usb-katapult_stm32h723xx_29001A000951313236343430-if00")];

    let found = match_device("usb-Klipper_stm32h723xx_29001A*", &devices);
    assert!(found.is_some());
}

#[test]
fn test_unrelated_devices_never_match() {
    let devices = vec![
        device("usb-Beacon_Beacon_RevH_FC2-if00"),
        device("usb-Cartographer_614e_21003B-if00"),
    ];

    assert!(match_device("usb-Klipper_*", &devices).is_none());
    assert!(!is_supported_device("usb-Beacon_Beacon_RevH_FC2-if00"));
}

#[test]
fn test_pattern_distinguishes_same_mcu_boards() {
    let devices = vec![
        device("usb-Klipper_rp2040_3039343B0A987CCC-if00"),
        device("usb-Klipper_rp2040_45503571290B1068-if00"),
    ];

    let matched = match_devices("usb-Klipper_rp2040_3039*", &devices);
    assert_eq!(matched.len(), 1);
    assert!(matched[0].filename.contains("3039343B"));
}

#[test]
fn test_pattern_generation_roundtrip() {
    let filename = "usb-Klipper_stm32h723xx_29001A000951313236343430-if00";
    let pattern = generate_serial_pattern(filename);
    assert_eq!(pattern, "usb-Klipper_stm32h723xx_29001A000951313236343430*");

    let devices = vec![device(filename)];
    assert!(match_device(&pattern, &devices).is_some());
}

#[test]
fn test_mcu_extraction_variants() {
    assert_eq!(
        extract_mcu_from_serial("usb-Klipper_stm32h723xx_29001A-if00").as_deref(),
        Some("stm32h723")
    );
    assert_eq!(
        extract_mcu_from_serial("usb-Klipper_stm32f446xx_1A002F-if00").as_deref(),
        Some("stm32f446")
    );
    assert_eq!(
        extract_mcu_from_serial("usb-katapult_rp2040_455035-if00").as_deref(),
        Some("rp2040")
    );
}
