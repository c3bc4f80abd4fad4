//! Run loop behavior against scripted exits.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{data_abort, region, sysreg_trap, wfx, TestBus, HOST_BASE};
use hvaccel::backend::recording::{BackendCall, RecordingBackend, ScriptedExit};
use hvaccel::vcpu::regs::sys;
use hvaccel::vcpu::timer::{CTL_ENABLE, CTL_IMASK, CTL_ISTATUS};
use hvaccel::vcpu::{class, ArchReg, ExitKind, SysReg, Syndrome};
use hvaccel::{
    Accelerator, Error, ExitReason, ExitRecord, InterruptKind, MemFlags, RegisterFile, Vcpu,
    VcpuRunState,
};

const MMIO: u64 = 0x0900_0000;

fn setup(bus: Arc<TestBus>) -> (Accelerator<RecordingBackend>, Vcpu<RecordingBackend>) {
    let accel = Accelerator::builder(RecordingBackend::new()).build().unwrap();
    let mut vcpu = accel.create_vcpu(0, bus).unwrap();
    vcpu.reset(&boot_regs()).unwrap();
    (accel, vcpu)
}

fn boot_regs() -> RegisterFile {
    let mut regs = RegisterFile::reset_state();
    regs.pc = 0x4008_0000;
    regs
}

fn backend(accel: &Accelerator<RecordingBackend>) -> &RecordingBackend {
    accel.backend()
}

#[test]
fn test_push_run_pull_round_trip() {
    let bus = TestBus::new();
    let accel = Accelerator::builder(RecordingBackend::new()).build().unwrap();
    let mut vcpu = accel.create_vcpu(0, bus).unwrap();

    let mut initial = boot_regs();
    initial.x[5] = 0x5555;
    initial.x[30] = 0xdead_0000;
    initial.fpcr = 0x0300_0000;
    initial.q[3] = 0x0123_4567_89ab_cdef_0011_2233_4455_6677;
    initial.set_sys(sys::SCTLR_EL1, 0x30d0_0980);
    initial.set_sys(sys::VBAR_EL1, 0x4000_0800);
    vcpu.reset(&initial).unwrap();
    assert!(!vcpu.is_dirty());
    assert_eq!(backend(&accel).guest_register(0, ArchReg::X(5)), 0x5555);
    assert_eq!(
        backend(&accel).guest_register(0, ArchReg::Sys(sys::VBAR_EL1)),
        0x4000_0800
    );

    backend(&accel).push_exit(0, ExitRecord::canceled());
    assert_eq!(vcpu.run_once().unwrap(), ExitKind::Canceled);

    assert_eq!(vcpu.registers().unwrap(), &initial);
}

#[test]
fn test_guest_changes_visible_after_exit() {
    let (accel, mut vcpu) = setup(TestBus::new());
    backend(&accel).push_exit(
        0,
        ScriptedExit {
            writes: vec![(ArchReg::X(1), 7), (ArchReg::Pc, 0x4008_0100)],
            exit: ExitRecord::exception(Syndrome::new(class::SMC64, 0).0, 0, 0),
        },
    );
    vcpu.run_once().unwrap();

    let regs = vcpu.registers().unwrap();
    assert_eq!(regs.gp(1), 7);
    assert_eq!(regs.pc, 0x4008_0104);
    assert!(vcpu.is_dirty());
}

#[test]
fn test_mmio_write_forwards_masked_value() {
    let bus = TestBus::new();
    let (accel, mut vcpu) = setup(bus.clone());
    vcpu.registers_mut().unwrap().x[3] = 0xdead_beef_cafe;

    backend(&accel).push_exit(0, ExitRecord::exception(data_abort(true, 2, 3, false, false), 0, MMIO));
    assert_eq!(vcpu.run_once().unwrap(), ExitKind::Exception);

    assert_eq!(*bus.writes.lock(), vec![(MMIO, 4, 0xbeef_cafe)]);
    assert_eq!(vcpu.registers().unwrap().pc, 0x4008_0004);
}

#[test]
fn test_mmio_read_loads_register() {
    let bus = TestBus::new();
    bus.answer(MMIO + 8, 0x1234_5678);
    let (accel, mut vcpu) = setup(bus.clone());

    backend(&accel).push_exit(0, ExitRecord::exception(data_abort(false, 3, 9, false, true), 0, MMIO + 8));
    vcpu.run_once().unwrap();

    assert_eq!(*bus.reads.lock(), vec![(MMIO + 8, 8)]);
    let regs = vcpu.registers().unwrap();
    assert_eq!(regs.gp(9), 0x1234_5678);
    assert_eq!(regs.pc, 0x4008_0004);
}

#[test]
fn test_mmio_read_sign_extends() {
    let bus = TestBus::new();
    bus.answer(MMIO, 0x80);
    let (accel, mut vcpu) = setup(bus);

    // LDRSB X7 then LDRSB W8.
    backend(&accel).push_exit(0, ExitRecord::exception(data_abort(false, 0, 7, true, true), 0, MMIO));
    backend(&accel).push_exit(0, ExitRecord::exception(data_abort(false, 0, 8, true, false), 0, MMIO));
    vcpu.run_once().unwrap();
    vcpu.run_once().unwrap();

    let regs = vcpu.registers().unwrap();
    assert_eq!(regs.gp(7), 0xffff_ffff_ffff_ff80);
    assert_eq!(regs.gp(8), 0xffff_ff80);
}

#[test]
fn test_mmio_read_into_xzr_is_discarded() {
    let bus = TestBus::new();
    bus.answer(MMIO, 0xff);
    let (accel, mut vcpu) = setup(bus.clone());
    backend(&accel).push_exit(0, ExitRecord::exception(data_abort(false, 2, 31, false, false), 0, MMIO));
    vcpu.run_once().unwrap();
    assert_eq!(bus.reads.lock().len(), 1);
    assert_eq!(vcpu.registers().unwrap().gp(31), 0);
}

#[test]
fn test_abort_on_mapped_ram_is_fatal() {
    let bus = TestBus::new();
    let (accel, mut vcpu) = setup(bus.clone());
    accel
        .add_region(region(HOST_BASE, 0x4000_0000, 0x10_0000, MemFlags::RWX))
        .unwrap();

    backend(&accel).push_exit(
        0,
        ExitRecord::exception(data_abort(true, 2, 0, false, false), 0, 0x4000_0010),
    );
    let err = vcpu.run_once().unwrap_err();
    assert!(matches!(err, Error::UnsupportedAbort { gpa: 0x4000_0010, .. }));
    assert!(err.is_fatal());
    assert!(bus.writes.lock().is_empty());
}

#[test]
fn test_abort_without_syndrome_is_fatal() {
    let bus = TestBus::new();
    let (accel, mut vcpu) = setup(bus.clone());
    backend(&accel).push_exit(0, ExitRecord::exception(Syndrome::new(class::DABT_LOWER, 0).0, 0, MMIO));
    let err = vcpu.run_once().unwrap_err();
    assert!(matches!(err, Error::UnsupportedAbort { .. }));
    assert!(bus.reads.lock().is_empty());
}

#[test]
fn test_unknown_exception_class_is_fatal() {
    let (accel, mut vcpu) = setup(TestBus::new());
    backend(&accel).push_exit(0, ExitRecord::exception(Syndrome::new(class::IABT_LOWER, 0x10).0, 0, 0));
    let err = vcpu.run_once().unwrap_err();
    assert!(matches!(
        err,
        Error::UnhandledException {
            class: class::IABT_LOWER,
            iss: 0x10
        }
    ));
    assert!(err.is_fatal());
}

#[test]
fn test_unknown_exit_reason_is_fatal() {
    let (accel, mut vcpu) = setup(TestBus::new());
    backend(&accel).push_exit(
        0,
        ExitRecord {
            reason: ExitReason::Unknown(7),
            exception: None,
        },
    );
    let err = vcpu.run_once().unwrap_err();
    assert!(matches!(err, Error::UnhandledExit(7)));
    assert_eq!(vcpu.run_state(), VcpuRunState::Exited(ExitKind::Other));
}

#[test]
fn test_exception_exit_without_syndrome_is_fatal() {
    let (accel, mut vcpu) = setup(TestBus::new());
    backend(&accel).push_exit(
        0,
        ExitRecord {
            reason: ExitReason::Exception,
            exception: None,
        },
    );
    let err = vcpu.run_once().unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)));
    assert!(err.is_fatal());
    assert_eq!(vcpu.run_state(), VcpuRunState::Exited(ExitKind::Other));
}

#[test]
fn test_vtimer_asserts_then_deasserts_line() {
    let bus = TestBus::new();
    let (accel, mut vcpu) = setup(bus.clone());
    let backend = backend(&accel);
    let ctl = ArchReg::Sys(sys::CNTV_CTL_EL0);

    backend.set_guest_register(0, ctl, CTL_ENABLE | CTL_ISTATUS);
    backend.push_exit(0, ExitRecord::vtimer());
    assert_eq!(vcpu.run_once().unwrap(), ExitKind::TimerActivated);
    assert_eq!(*bus.vtimer.lock(), vec![true]);
    assert!(backend.vtimer_masked(0));

    // Still firing: stays masked.
    backend.push_exit(0, ExitRecord::canceled());
    vcpu.run_once().unwrap();
    assert_eq!(*bus.vtimer.lock(), vec![true]);
    assert!(backend.vtimer_masked(0));

    // The guest masked the timer in its handler.
    backend.set_guest_register(0, ctl, CTL_ENABLE | CTL_ISTATUS | CTL_IMASK);
    backend.push_exit(0, ExitRecord::canceled());
    vcpu.run_once().unwrap();
    assert_eq!(*bus.vtimer.lock(), vec![true, false]);
    assert!(!backend.vtimer_masked(0));
}

#[test]
fn test_sysreg_traps() {
    let bus = TestBus::new();
    let custom = SysReg::new(3, 0, 15, 0, 0);
    bus.sysregs.lock().insert(custom, 0);
    let (accel, mut vcpu) = setup(bus.clone());
    let backend = backend(&accel);
    backend.set_virtual_counter(Some(1234));
    vcpu.registers_mut().unwrap().x[4] = 77;
    vcpu.registers_mut().unwrap().x[6] = 0xaaaa;

    backend.push_exit(0, ExitRecord::exception(sysreg_trap(sys::CNTPCT_EL0, 2, true), 0, 0));
    backend.push_exit(0, ExitRecord::exception(sysreg_trap(custom, 4, false), 0, 0));
    backend.push_exit(0, ExitRecord::exception(sysreg_trap(sys::OSLSR_EL1, 6, true), 0, 0));
    backend.push_exit(0, ExitRecord::exception(sysreg_trap(custom, 5, true), 0, 0));
    for _ in 0..4 {
        vcpu.run_once().unwrap();
    }

    let regs = vcpu.registers().unwrap();
    assert_eq!(regs.gp(2), 1234);
    assert_eq!(regs.gp(6), 0);
    assert_eq!(regs.gp(5), 77);
    assert_eq!(regs.pc, 0x4008_0000 + 16);
    assert_eq!(bus.sysregs.lock()[&custom], 77);
}

#[test]
fn test_hypercalls() {
    let bus = TestBus::with_hypercalls();
    let (accel, mut vcpu) = setup(bus);
    vcpu.registers_mut().unwrap().x[0] = 41;
    backend(&accel).push_exit(0, ExitRecord::exception(Syndrome::new(class::HVC64, 0).0, 0, 0));
    vcpu.run_once().unwrap();

    let regs = vcpu.registers().unwrap();
    assert_eq!(regs.gp(0), 42);
    assert_eq!(regs.pc, 0x4008_0000);
}

#[test]
fn test_wfi_with_pending_irq_returns_immediately() {
    let (accel, mut vcpu) = setup(TestBus::new());
    let handle = vcpu.handle();
    handle.set_irq_level(true).unwrap();

    backend(&accel).push_exit(0, ExitRecord::exception(wfx(false), 0, 0));
    let start = Instant::now();
    vcpu.run_once().unwrap();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(backend(&accel).pending_interrupt(0, InterruptKind::Irq));
    assert_eq!(vcpu.registers().unwrap().pc, 0x4008_0004);
}

#[test]
fn test_wfi_sleeps_until_timer_deadline() {
    let bus = TestBus::new();
    let accel = Accelerator::builder(RecordingBackend::new()).build().unwrap();
    let backend = backend(&accel);
    let mut vcpu = accel.create_vcpu(0, bus).unwrap();

    backend.set_virtual_counter(Some(1000));
    let freq = hvaccel::backend::recording::DEFAULT_COUNTER_FREQUENCY;
    let mut regs = boot_regs();
    regs.set_sys(sys::CNTV_CTL_EL0, CTL_ENABLE);
    regs.set_sys(sys::CNTV_CVAL_EL0, 1000 + freq / 50);
    vcpu.reset(&regs).unwrap();

    backend.push_exit(0, ExitRecord::exception(wfx(false), 0, 0));
    let start = Instant::now();
    vcpu.run_once().unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(15), "woke after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5));
}

#[test]
fn test_wfi_sleep_is_capped() {
    let accel = Accelerator::builder(RecordingBackend::new())
        .wfi_max_sleep(Duration::from_millis(10))
        .build()
        .unwrap();
    let mut vcpu = accel.create_vcpu(0, TestBus::new()).unwrap();
    vcpu.reset(&boot_regs()).unwrap();

    // Timer disabled: without the cap this would sleep until kicked.
    backend(&accel).push_exit(0, ExitRecord::exception(wfx(false), 0, 0));
    let start = Instant::now();
    vcpu.run_once().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_wfi_woken_by_irq_from_other_thread() {
    let (accel, mut vcpu) = setup(TestBus::new());
    let handle = vcpu.handle();
    backend(&accel).push_exit(0, ExitRecord::exception(wfx(false), 0, 0));

    let raiser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.set_irq_level(true).unwrap();
    });
    let start = Instant::now();
    vcpu.run_once().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(40));
    raiser.join().unwrap();

    // The kick also cancels the next resume, which then carries the IRQ.
    assert_eq!(vcpu.run_once().unwrap(), ExitKind::Canceled);
    assert!(backend(&accel).pending_interrupt(0, InterruptKind::Irq));
}

#[test]
fn test_wfe_does_not_sleep() {
    let (accel, mut vcpu) = setup(TestBus::new());
    backend(&accel).push_exit(0, ExitRecord::exception(wfx(true), 0, 0));
    let start = Instant::now();
    vcpu.run_once().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(vcpu.registers().unwrap().pc, 0x4008_0004);
}

#[test]
fn test_cross_thread_register_access() {
    let accel = Accelerator::builder(RecordingBackend::new()).build().unwrap();
    let mut initial = boot_regs();
    initial.x[0] = 0x4400_0000;
    let vcpu = accel.spawn_vcpu(0, TestBus::new(), initial.clone()).unwrap();
    let handle = vcpu.handle().clone();

    let regs = handle.synchronize().unwrap();
    assert_eq!(regs, initial);

    let mut changed = regs;
    changed.x[0] = 42;
    changed.pc = 0x4010_0000;
    handle.set_registers(changed.clone()).unwrap();
    assert_eq!(handle.synchronize().unwrap(), changed);

    vcpu.stop().unwrap();
}

#[test]
fn test_register_access_after_halt_fails_fast() {
    let accel = Arc::new(Accelerator::builder(RecordingBackend::new()).build().unwrap());
    let (handle_tx, handle_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

    let owner = {
        let accel = accel.clone();
        thread::spawn(move || {
            let mut vcpu = accel.create_vcpu(0, TestBus::new()).unwrap();
            vcpu.reset(&boot_regs()).unwrap();
            handle_tx.send(vcpu.handle()).unwrap();
            vcpu.run().unwrap();
            assert_eq!(vcpu.run_state(), VcpuRunState::Stopped);
            // Keep the vCPU alive while the other thread asks for registers.
            release_rx.recv().unwrap();
            assert_eq!(vcpu.registers().unwrap().pc, 0x4008_0000);
        })
    };

    let handle = handle_rx.recv().unwrap();
    assert_eq!(handle.synchronize().unwrap().pc, 0x4008_0000);
    handle.halt().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let err = loop {
        match handle.synchronize() {
            Err(err) => break err,
            Ok(_) => {
                assert!(Instant::now() < deadline, "run loop never stopped serving");
                thread::sleep(Duration::from_millis(1));
            }
        }
    };
    assert!(matches!(err, Error::VcpuStopped(0)));
    assert!(matches!(
        handle.set_registers(boot_regs()),
        Err(Error::VcpuStopped(0))
    ));

    release_tx.send(()).unwrap();
    owner.join().unwrap();
}

#[test]
fn test_irq_reaches_running_vcpu() {
    let accel = Accelerator::builder(RecordingBackend::new()).build().unwrap();
    let vcpu = accel.spawn_vcpu(0, TestBus::new(), boot_regs()).unwrap();

    vcpu.handle().set_irq_level(true).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !backend(&accel).pending_interrupt(0, InterruptKind::Irq) {
        assert!(Instant::now() < deadline, "IRQ never injected");
        thread::sleep(Duration::from_millis(1));
    }

    vcpu.handle().set_irq_level(false).unwrap();
    vcpu.handle().set_fiq_level(true).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !backend(&accel).pending_interrupt(0, InterruptKind::Fiq) {
        assert!(Instant::now() < deadline, "FIQ never injected");
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!backend(&accel).pending_interrupt(0, InterruptKind::Irq));
    vcpu.stop().unwrap();
}

#[test]
fn test_halt_stops_run_loop_and_destroys() {
    let accel = Accelerator::builder(RecordingBackend::new()).build().unwrap();
    let vcpu = accel.spawn_vcpu(3, TestBus::new(), boot_regs()).unwrap();
    assert_eq!(vcpu.handle().index(), 3);
    vcpu.stop().unwrap();

    let calls = backend(&accel).calls();
    assert_eq!(calls.first(), Some(&BackendCall::CreateVcpu(3)));
    assert!(calls.contains(&BackendCall::DestroyVcpu(3)));
}

#[test]
fn test_failed_push_keeps_state_dirty() {
    let (accel, mut vcpu) = setup(TestBus::new());
    vcpu.registers_mut().unwrap().x[1] = 9;
    backend(&accel).fail_next("set_register");
    let err = vcpu.run_once().unwrap_err();
    assert!(matches!(err, Error::BackendRejection { op: "set_register", .. }));
    assert!(vcpu.is_dirty());

    backend(&accel).push_exit(0, ExitRecord::canceled());
    vcpu.run_once().unwrap();
    assert!(!vcpu.is_dirty());
    assert_eq!(backend(&accel).guest_register(0, ArchReg::X(1)), 9);
}
