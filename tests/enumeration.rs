//! Enumeration and claim protocol, driven through the public host API

mod common;

use std::cell::RefCell;
use std::vec::Vec;

use common::*;
use imxrt_usbhost::config::MAX_CLAIMS_PER_DEVICE;
use imxrt_usbhost::transfer::control::request;
use imxrt_usbhost::{ClaimLevel, SetupPacket, Speed, UsbError};

#[test]
fn test_enumeration_without_strings() {
    let log = RefCell::new(Vec::new());
    let mut driver = MockDriver::new(&log, Accept::Interfaces);
    let mut host = new_host();
    let driver_id = host.driver_ready_for_device(&mut driver).unwrap();

    let device = host.device_attached(Speed::Full).unwrap();
    assert!(host.core().is_enumerating());

    let requests = enumerate(&mut host, device, &device_descriptor(0, 64, [0, 0, 0]), &vendor_config());
    assert_eq!(
        requests,
        [
            SetupPacket::get_descriptor(1, 0, 0, 8),
            SetupPacket::set_address(1),
            SetupPacket::get_descriptor(1, 0, 0, 18),
            SetupPacket::get_descriptor(2, 0, 0, 9),
            SetupPacket::get_descriptor(2, 0, 0, 25),
            SetupPacket::set_configuration(1),
        ]
    );

    let record = host.core().device(device).unwrap();
    assert_eq!(record.state().ordinal(), 15);
    assert_eq!(record.address(), 1);
    assert_eq!(record.max_packet_size0(), 64);
    assert_eq!(record.vendor_id(), 0x16C0);
    assert_eq!(record.interface_count(), 1);
    assert_eq!(record.claims().len(), 1);

    // control pipe follows the device
    let qh = host.core().qh(record.control_pipe()).unwrap();
    assert_eq!(qh.address(), 1);
    assert_eq!(qh.max_packet_len(), 64);

    assert!(!host.core().is_enumerating());
    assert!(!host.is_waiting(driver_id));
    assert_eq!(host.core().stats().large_buffers.0, 0);

    let log = log.borrow();
    assert_eq!(log[0], DriverEvent::Offered(ClaimLevel::Device, 16));
    assert_eq!(log[1], DriverEvent::Offered(ClaimLevel::Interface(0), 16));
    assert_eq!(log[2], DriverEvent::Configured(driver_id, device, ClaimLevel::Interface(0)));
}

#[test]
fn test_enumeration_with_strings() {
    let mut host = new_host();
    let device = host.device_attached(Speed::High).unwrap();

    let requests = enumerate(&mut host, device, &device_descriptor(0, 64, [1, 2, 3]), &vendor_config());
    let strings: Vec<(u16, u16)> = requests
        .iter()
        .filter(|s| s.request == request::GET_DESCRIPTOR && s.value >> 8 == 3)
        .map(|s| (s.value & 0xFF, s.index))
        .collect();
    assert_eq!(strings, [(0, 0), (1, 0x0409), (2, 0x0409), (3, 0x0409)]);
    assert_eq!(requests.len(), 10);

    let record = host.core().device(device).unwrap();
    assert!(record.is_configured());
    assert_eq!(record.language_id(), 0x0409);
    assert_eq!(record.strings().product.len, 4);
}

#[test]
fn test_device_level_claim_wins() {
    let log_a = RefCell::new(Vec::new());
    let log_b = RefCell::new(Vec::new());
    let mut interfaces = MockDriver::new(&log_a, Accept::Interfaces);
    let mut whole = MockDriver::new(&log_b, Accept::Device);

    let mut host = new_host();
    let a = host.driver_ready_for_device(&mut interfaces).unwrap();
    let b = host.driver_ready_for_device(&mut whole).unwrap();

    let device = host.device_attached(Speed::Full).unwrap();
    enumerate(&mut host, device, &device_descriptor(0, 8, [0, 0, 0]), &two_interface_config());

    assert!(host.is_waiting(a));
    assert!(!host.is_waiting(b));
    assert!(!log_a.borrow().iter().any(|e| matches!(e, DriverEvent::Configured(..))));
    assert!(log_b.borrow().contains(&DriverEvent::Configured(b, device, ClaimLevel::Device)));
}

#[test]
fn test_one_driver_takes_several_interfaces() {
    let log = RefCell::new(Vec::new());
    let mut driver = MockDriver::new(&log, Accept::Interfaces);
    let mut host = new_host();
    let id = host.driver_ready_for_device(&mut driver).unwrap();

    let device = host.device_attached(Speed::Full).unwrap();
    enumerate(&mut host, device, &device_descriptor(0, 8, [0, 0, 0]), &two_interface_config());

    let claims = host.core().device(device).unwrap().claims();
    assert_eq!(claims.len(), 2);
    assert_eq!(claims[0].level, ClaimLevel::Interface(0));
    assert_eq!(claims[1].level, ClaimLevel::Interface(1));
    assert!(claims.iter().all(|c| c.driver == id));

    // told once on removal, then waiting again
    host.device_detached(device);
    let disconnects = log.borrow().iter().filter(|e| matches!(e, DriverEvent::Disconnected(_))).count();
    assert_eq!(disconnects, 1);
    assert!(host.is_waiting(id));
}

#[test]
fn test_unclaimed_device_stays_configured() {
    let log = RefCell::new(Vec::new());
    let mut driver = MockDriver::new(&log, Accept::Nothing);
    let mut host = new_host();
    let id = host.driver_ready_for_device(&mut driver).unwrap();

    let device = host.device_attached(Speed::Full).unwrap();
    enumerate(&mut host, device, &device_descriptor(0, 64, [0, 0, 0]), &vendor_config());

    assert!(host.core().device(device).unwrap().is_configured());
    assert!(host.core().device(device).unwrap().claims().is_empty());
    assert!(host.is_waiting(id));
    assert!(!host.core().is_enumerating());
}

#[test]
fn test_stall_aborts_and_releases_lock() {
    let mut host = new_host();
    let device = host.device_attached(Speed::Full).unwrap();
    assert_eq!(host.device_attached(Speed::Full), Err(UsbError::EnumerationBusy));

    let setup = stall_control(&mut host);
    assert_eq!(setup, SetupPacket::get_descriptor(1, 0, 0, 8));

    let record = host.core().device(device).unwrap();
    assert_eq!(record.state().ordinal(), 0);
    assert!(!record.is_configured());
    assert!(!host.core().is_enumerating());
    assert!(pending_control(&host).is_none());

    // the next attachment gets its own address
    let second = host.device_attached(Speed::Full).unwrap();
    enumerate(&mut host, second, &device_descriptor(0, 64, [0, 0, 0]), &vendor_config());
    assert_eq!(host.core().device(second).unwrap().address(), 2);
}

#[test]
fn test_oversized_configuration_aborts() {
    let mut host = new_host();
    let device = host.device_attached(Speed::Full).unwrap();
    let mut config = vendor_config();
    config[2] = 0x00;
    config[3] = 0x04; // wTotalLength 1024
    let requests = enumerate(&mut host, device, &device_descriptor(0, 64, [0, 0, 0]), &config);

    assert_eq!(requests.len(), 4);
    assert!(!host.core().is_enumerating());
    assert_eq!(host.core().device(device).unwrap().state().ordinal(), 12);
}

#[test]
fn test_detach_frees_everything() {
    let log = RefCell::new(Vec::new());
    let mut driver = MockDriver::new(&log, Accept::Device);
    let mut host = new_host();
    host.driver_ready_for_device(&mut driver).unwrap();
    let baseline = host.core().stats();

    let device = host.device_attached(Speed::Full).unwrap();
    enumerate(&mut host, device, &device_descriptor(0, 64, [0, 0, 0]), &vendor_config());
    assert_eq!(host.core().stats().devices.0, 1);

    host.device_detached(device);
    assert_eq!(host.core().stats(), baseline);
    assert!(host.core().device(device).is_none());
    assert_eq!(host.core().devices().count(), 0);
    assert!(log.borrow().contains(&DriverEvent::Disconnected(device)));

    // address 1 is free again
    let again = host.device_attached(Speed::Full).unwrap();
    enumerate(&mut host, again, &device_descriptor(0, 64, [0, 0, 0]), &vendor_config());
    assert_eq!(host.core().device(again).unwrap().address(), 1);
}

#[test]
fn test_detach_during_enumeration() {
    let mut host = new_host();
    let device = host.device_attached(Speed::Low).unwrap();
    complete_control(&mut host, &device_descriptor(0, 8, [0, 0, 0])[..8]);

    host.device_detached(device);
    assert!(!host.core().is_enumerating());
    assert_eq!(host.core().stats().transfers.0, 0);
    assert_eq!(host.core().stats().pipes.0, 0);
    assert_eq!(host.core().controller().unlinks.len(), 1);
}

#[test]
fn test_driver_registry_is_bounded() {
    let log = RefCell::new(Vec::new());
    let mut drivers: Vec<MockDriver<'_>> = (0..17).map(|_| MockDriver::new(&log, Accept::Nothing)).collect();
    let mut host = new_host();
    let mut results = Vec::new();
    for driver in drivers.iter_mut() {
        results.push(host.driver_ready_for_device(driver).map(|id| id.index()));
    }
    assert_eq!(results[15], Ok(15));
    assert_eq!(results[16], Err(UsbError::NoResources));
}

#[test]
fn test_claims_stop_at_the_per_device_limit() {
    let log = RefCell::new(Vec::new());
    let mut driver = MockDriver::new(&log, Accept::Interfaces);
    let mut host = new_host();
    host.driver_ready_for_device(&mut driver).unwrap();

    let mut config = vec![0x09, 0x02, 0x36, 0x00, 0x05, 0x01, 0x00, 0x80, 0x32];
    for number in 0..5u8 {
        config.extend_from_slice(&[0x09, 0x04, number, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00]);
    }
    let device = host.device_attached(Speed::Full).unwrap();
    enumerate(&mut host, device, &device_descriptor(0, 64, [0, 0, 0]), &config);

    let claims = host.core().device(device).unwrap().claims();
    assert_eq!(claims.len(), MAX_CLAIMS_PER_DEVICE);
    assert_eq!(claims.last().unwrap().level, ClaimLevel::Interface(3));
    let offers = log
        .borrow()
        .iter()
        .filter(|e| matches!(e, DriverEvent::Offered(ClaimLevel::Interface(_), _)))
        .count();
    assert_eq!(offers, MAX_CLAIMS_PER_DEVICE);
}

#[test]
fn test_split_target_is_nearest_high_speed_hub() {
    let mut host = new_host();
    let high = host.device_attached(Speed::High).unwrap();
    enumerate(&mut host, high, &device_descriptor(9, 64, [0, 0, 0]), &hub_config());
    let high_address = host.core().device(high).unwrap().address();
    assert_eq!(host.core().device(high).unwrap().transaction_translator(), (0, 0));

    // a full-speed hub on port 3 of the high-speed one
    let full = host.core_mut().new_device(Speed::Full, high_address, 3).unwrap();
    assert_eq!(host.core().device(full).unwrap().transaction_translator(), (high_address, 3));
    enumerate(&mut host, full, &device_descriptor(9, 64, [0, 0, 0]), &hub_config());
    let full_address = host.core().device(full).unwrap().address();

    // a low-speed device behind it still splits at the high-speed hub
    let low = host.core_mut().new_device(Speed::Low, full_address, 4).unwrap();
    let record = host.core().device(low).unwrap();
    assert_eq!((record.hub_address(), record.hub_port()), (full_address, 4));
    assert_eq!(record.transaction_translator(), (high_address, 3));
    let qh = host.core().qh(record.control_pipe()).unwrap();
    assert_eq!(qh.split_target(), (high_address, 3));
}
