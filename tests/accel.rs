//! Accelerator wiring: memory map, vCPU threads and the device bus.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::data_abort;
use hvaccel::backend::recording::{BackendCall, RecordingBackend};
use hvaccel::{
    Accelerator, Error, ExitRecord, MemFlags, MmioBus, MmioDevice, RamBlock, RegisterFile,
};
use parking_lot::Mutex;

#[derive(Default)]
struct Latch {
    writes: Mutex<Vec<(u64, u64)>>,
}

impl MmioDevice for Latch {
    fn read(&self, _offset: u64, _size: usize) -> u64 {
        0
    }

    fn write(&self, offset: u64, _size: usize, value: u64) {
        self.writes.lock().push((offset, value));
    }
}

#[test]
fn test_ram_block_maps_into_guest() {
    let accel = Accelerator::builder(RecordingBackend::new()).build().unwrap();
    let ram = RamBlock::new(0x20_0000).unwrap();
    accel.add_region(ram.region(0x4000_0000, MemFlags::RWX)).unwrap();

    ram.write(0x10, b"boot").unwrap();
    let host = accel.host_address_for(0x4000_0010).unwrap();
    assert_eq!(host, ram.host_address().offset(0x10));
    assert_eq!(
        accel.slots().guest_ranges_for_host(host, 4),
        vec![(0x4000_0010, 4)]
    );

    let mappings = accel.backend().mappings();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].size, 0x20_0000);
}

#[test]
fn test_spawned_vcpu_drives_devices() {
    let latch = Arc::new(Latch::default());
    let bus = MmioBus::new();
    assert!(bus.register(0x0900_0000, 0x1000, latch.clone()));

    let accel = Accelerator::builder(RecordingBackend::new()).build().unwrap();
    // Scripted before the vCPU exists: replayed once it first runs.
    accel.backend().push_exit(
        0,
        ExitRecord::exception(data_abort(true, 2, 1, false, false), 0, 0x0900_0008),
    );

    let mut boot = RegisterFile::reset_state();
    boot.pc = 0x4008_0000;
    boot.x[1] = 0x41;
    let vcpu = accel.spawn_vcpu(0, Arc::new(bus), boot).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while latch.writes.lock().is_empty() {
        assert!(Instant::now() < deadline, "mmio write never arrived");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(*latch.writes.lock(), vec![(8, 0x41)]);

    let regs = vcpu.handle().synchronize().unwrap();
    assert_eq!(regs.pc, 0x4008_0004);
    vcpu.stop().unwrap();
}

#[test]
fn test_spawn_reports_creation_failure() {
    let accel = Accelerator::builder(RecordingBackend::new()).build().unwrap();
    accel.backend().fail_next("create_vcpu");
    let err = accel
        .spawn_vcpu(0, Arc::new(MmioBus::new()), RegisterFile::reset_state())
        .unwrap_err();
    assert!(matches!(err, Error::BackendRejection { op: "create_vcpu", .. }));
}

#[test]
fn test_vcpus_share_one_memory_map() {
    let accel = Accelerator::builder(RecordingBackend::new()).build().unwrap();
    let a = accel
        .spawn_vcpu(0, Arc::new(MmioBus::new()), RegisterFile::reset_state())
        .unwrap();
    let b = accel
        .spawn_vcpu(1, Arc::new(MmioBus::new()), RegisterFile::reset_state())
        .unwrap();

    let ram = RamBlock::new(0x1_0000).unwrap();
    accel.add_region(ram.region(0x8000_0000, MemFlags::RW)).unwrap();
    assert!(accel.find_overlap(0x8000_0000, 0x8000_1000).is_some());

    a.stop().unwrap();
    b.stop().unwrap();
    let calls = accel.backend().calls();
    assert!(calls.contains(&BackendCall::DestroyVcpu(0)));
    assert!(calls.contains(&BackendCall::DestroyVcpu(1)));
}
