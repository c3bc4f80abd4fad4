//! vCPU ownership and the run loop.
//!
//! A [`Vcpu`] lives on the thread that created it; the backend requires all
//! per-vCPU calls to come from there. Other threads talk to it through a
//! [`VcpuHandle`]: interrupt line changes go through atomics, while register
//! access goes through a request channel serviced between guest runs. Any
//! request that needs the vCPU out of guest mode kicks it with
//! [`force_exit`](HypervisorBackend::force_exit).
//!
//! Requests are accepted only while the owner serves them: from creation
//! until [`Vcpu::run`] returns, and again on each later entry to `run`.
//! Outside that window they fail with [`Error::VcpuStopped`]; the owner
//! reads a stopped vCPU through [`Vcpu::registers`] directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::{mpsc, oneshot};

use crate::backend::{ExceptionInfo, ExitReason, HypervisorBackend, InterruptKind, VcpuId};
use crate::device::DeviceBus;
use crate::error::{Error, Result};
use crate::memory::MemorySlotTable;

use super::exit::{class, DataAbort, ExitKind, SysRegAccess, Syndrome};
use super::regs::{sys, ArchReg, RegisterFile};
use super::state::VcpuState;
use super::sysreg;
use super::timer::{self, WfiWait};

/// Lifecycle of a vCPU as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuRunState {
    /// Created, registers not yet loaded.
    Created,
    /// Registers loaded; never run.
    Ready,
    /// Inside the backend's run call.
    Running,
    /// Returned from the backend and dispatched the exit.
    Exited(ExitKind),
    /// Left the run loop after a halt request.
    Stopped,
}

enum VcpuRequest {
    Synchronize(oneshot::Sender<RegisterFile>),
    SetRegisters(Box<RegisterFile>, oneshot::Sender<()>),
}

/// State shared between a vCPU and its handles.
struct VcpuShared {
    index: u32,
    owner: ThreadId,
    // None once the backend vCPU is destroyed.
    backend_id: Mutex<Option<VcpuId>>,
    irq: AtomicBool,
    fiq: AtomicBool,
    halt: AtomicBool,
    // Whether queued requests will be answered. Checked and cleared under
    // the lock so a request is either queued while serving or refused.
    serving: Mutex<bool>,
    kicked: Mutex<bool>,
    wake: Condvar,
}

impl VcpuShared {
    fn has_work(&self) -> bool {
        self.irq.load(Ordering::SeqCst)
            || self.fiq.load(Ordering::SeqCst)
            || self.halt.load(Ordering::SeqCst)
    }

    fn clear_kick(&self) {
        *self.kicked.lock() = false;
    }

    fn wake_up(&self) {
        *self.kicked.lock() = true;
        self.wake.notify_all();
    }

    /// Block the owning thread until kicked, the wait expires, or work
    /// arrives.
    fn wait_for_kick(&self, wait: WfiWait) {
        let mut kicked = self.kicked.lock();
        let deadline = match wait {
            WfiWait::Immediate => None,
            WfiWait::For(d) => Some(Instant::now().checked_add(d)),
            WfiWait::Indefinite => Some(None),
        };
        if let Some(deadline) = deadline {
            while !*kicked && !self.has_work() {
                match deadline {
                    Some(at) => {
                        if self.wake.wait_until(&mut kicked, at).timed_out() {
                            break;
                        }
                    }
                    None => self.wake.wait(&mut kicked),
                }
            }
        }
        *kicked = false;
    }
}

/// Cross-thread handle to a [`Vcpu`].
pub struct VcpuHandle<B: HypervisorBackend> {
    backend: Arc<B>,
    shared: Arc<VcpuShared>,
    requests: mpsc::UnboundedSender<VcpuRequest>,
}

impl<B: HypervisorBackend> Clone for VcpuHandle<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            shared: self.shared.clone(),
            requests: self.requests.clone(),
        }
    }
}

impl<B: HypervisorBackend> VcpuHandle<B> {
    /// Index of the vCPU.
    pub fn index(&self) -> u32 {
        self.shared.index
    }

    /// Set the IRQ line level.
    ///
    /// A rising edge from any thread other than the owner forces the vCPU
    /// out of guest mode so the new level is seen at the next resume.
    pub fn set_irq_level(&self, level: bool) -> Result<()> {
        self.set_level(&self.shared.irq, level)
    }

    /// Set the FIQ line level. See [`set_irq_level`](Self::set_irq_level).
    pub fn set_fiq_level(&self, level: bool) -> Result<()> {
        self.set_level(&self.shared.fiq, level)
    }

    fn set_level(&self, line: &AtomicBool, level: bool) -> Result<()> {
        let previous = line.swap(level, Ordering::SeqCst);
        if level && !previous && !self.on_owner_thread() {
            self.kick()?;
        }
        Ok(())
    }

    /// Fetch the vCPU's registers from another thread.
    ///
    /// Afterwards the shadow is authoritative and will be pushed before the
    /// guest resumes. Fails with [`Error::VcpuStopped`] once the run loop
    /// has returned.
    pub fn synchronize(&self) -> Result<RegisterFile> {
        self.request("synchronize", VcpuRequest::Synchronize)
    }

    /// Replace the vCPU's registers from another thread.
    pub fn set_registers(&self, regs: RegisterFile) -> Result<()> {
        self.request("set_registers", |reply| {
            VcpuRequest::SetRegisters(Box::new(regs), reply)
        })
    }

    fn request<T>(
        &self,
        op: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> VcpuRequest,
    ) -> Result<T> {
        self.check_foreign_thread(op)?;
        let (tx, rx) = oneshot::channel();
        {
            let serving = self.shared.serving.lock();
            if !*serving {
                return Err(Error::VcpuStopped(self.shared.index));
            }
            self.requests.send(make(tx)).map_err(|_| Error::VcpuGone)?;
        }
        self.kick()?;
        rx.blocking_recv().map_err(|_| Error::VcpuGone)
    }

    /// Ask the run loop to return.
    pub fn halt(&self) -> Result<()> {
        self.shared.halt.store(true, Ordering::SeqCst);
        self.kick()
    }

    fn on_owner_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    fn check_foreign_thread(&self, op: &str) -> Result<()> {
        if self.on_owner_thread() {
            return Err(Error::InvariantViolation(format!(
                "{op} through a handle on vCPU {}'s own thread",
                self.shared.index
            )));
        }
        Ok(())
    }

    fn kick(&self) -> Result<()> {
        self.shared.wake_up();
        let id = self.shared.backend_id.lock();
        if let Some(id) = *id {
            self.backend.force_exit(id)?;
        }
        Ok(())
    }
}

/// A vCPU owned by the current thread.
pub struct Vcpu<B: HypervisorBackend> {
    index: u32,
    backend: Arc<B>,
    slots: Arc<MemorySlotTable<B>>,
    bus: Arc<dyn DeviceBus>,
    inner: Option<B::Vcpu>,
    state: VcpuState,
    shared: Arc<VcpuShared>,
    requests: mpsc::UnboundedReceiver<VcpuRequest>,
    sender: mpsc::UnboundedSender<VcpuRequest>,
    run_state: VcpuRunState,
    vtimer_masked: bool,
    wfi_max_sleep: Option<Duration>,
}

impl<B: HypervisorBackend> Vcpu<B> {
    /// Create vCPU `index` owned by the calling thread.
    pub fn create(
        backend: Arc<B>,
        slots: Arc<MemorySlotTable<B>>,
        bus: Arc<dyn DeviceBus>,
        index: u32,
    ) -> Result<Self> {
        let inner = backend.create_vcpu(index)?;
        let id = backend.vcpu_id(&inner);
        tracing::debug!(vcpu = index, backend = backend.name(), "created vcpu");
        let (sender, requests) = mpsc::unbounded_channel();
        Ok(Self {
            index,
            backend,
            slots,
            bus,
            inner: Some(inner),
            state: VcpuState::new(),
            shared: Arc::new(VcpuShared {
                index,
                owner: thread::current().id(),
                backend_id: Mutex::new(Some(id)),
                irq: AtomicBool::new(false),
                fiq: AtomicBool::new(false),
                halt: AtomicBool::new(false),
                serving: Mutex::new(true),
                kicked: Mutex::new(false),
                wake: Condvar::new(),
            }),
            requests,
            sender,
            run_state: VcpuRunState::Created,
            vtimer_masked: false,
            wfi_max_sleep: None,
        })
    }

    /// Cap each wait-for-interrupt sleep at `max`.
    pub fn set_wfi_max_sleep(&mut self, max: Option<Duration>) {
        self.wfi_max_sleep = max;
    }

    /// A handle for other threads.
    pub fn handle(&self) -> VcpuHandle<B> {
        VcpuHandle {
            backend: self.backend.clone(),
            shared: self.shared.clone(),
            requests: self.sender.clone(),
        }
    }

    /// Index of this vCPU.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Current lifecycle state.
    pub fn run_state(&self) -> VcpuRunState {
        self.run_state
    }

    /// Whether the shadow registers hold unpushed changes.
    pub fn is_dirty(&self) -> bool {
        self.state.is_dirty()
    }

    /// Load `regs` as the vCPU's complete state and push it to the backend.
    pub fn reset(&mut self, regs: &RegisterFile) -> Result<()> {
        let vcpu = self.inner.as_ref().ok_or(Error::VcpuGone)?;
        self.state.load(&*self.backend, vcpu, regs)?;
        self.run_state = VcpuRunState::Ready;
        Ok(())
    }

    /// Synchronized view of the registers. Reading does not mark the
    /// shadow dirty.
    pub fn registers(&mut self) -> Result<&RegisterFile> {
        let vcpu = self.inner.as_ref().ok_or(Error::VcpuGone)?;
        self.state.current_regs(&*self.backend, vcpu)
    }

    /// Synchronized, mutable view of the registers. Changes are pushed
    /// before the guest next runs.
    pub fn registers_mut(&mut self) -> Result<&mut RegisterFile> {
        let vcpu = self.inner.as_ref().ok_or(Error::VcpuGone)?;
        self.state.synchronize(&*self.backend, vcpu)
    }

    /// Run the guest until the next exit and handle it.
    pub fn run_once(&mut self) -> Result<ExitKind> {
        self.shared.clear_kick();
        self.service_requests()?;

        let backend = &*self.backend;
        let vcpu = self.inner.as_mut().ok_or(Error::VcpuGone)?;
        if self.state.is_dirty() {
            self.state.push(backend, vcpu)?;
        }

        // Drop the timer line once the guest has quiesced the timer.
        if self.vtimer_masked {
            let ctl = backend.get_register(vcpu, ArchReg::Sys(sys::CNTV_CTL_EL0))?;
            if !timer::irq_asserted(ctl) {
                self.bus.set_vtimer_level(self.index, false);
                backend.set_vtimer_mask(vcpu, false)?;
                self.vtimer_masked = false;
            }
        }

        let irq = self.shared.irq.load(Ordering::SeqCst);
        let fiq = self.shared.fiq.load(Ordering::SeqCst);
        backend.set_pending_interrupt(vcpu, InterruptKind::Irq, irq)?;
        backend.set_pending_interrupt(vcpu, InterruptKind::Fiq, fiq)?;

        self.state.note_resumed();
        self.run_state = VcpuRunState::Running;
        let exit = backend.run(vcpu)?;
        tracing::trace!(vcpu = self.index, ?exit, "vcpu exit");

        let kind = match (exit.reason, exit.exception) {
            (ExitReason::Canceled, _) => ExitKind::Canceled,
            (ExitReason::Exception, Some(info)) => {
                self.state.pull(backend, vcpu)?;
                self.run_state = VcpuRunState::Exited(ExitKind::Exception);
                self.handle_exception(info)?;
                ExitKind::Exception
            }
            (ExitReason::VtimerActivated, _) => {
                // The backend masked the timer; it stays masked until the
                // guest clears the condition.
                self.vtimer_masked = true;
                self.bus.set_vtimer_level(self.index, true);
                ExitKind::TimerActivated
            }
            (ExitReason::Exception, None) => {
                self.run_state = VcpuRunState::Exited(ExitKind::Other);
                return Err(Error::InvariantViolation(
                    "exception exit without syndrome".into(),
                ));
            }
            (ExitReason::Unknown(reason), _) => {
                self.run_state = VcpuRunState::Exited(ExitKind::Other);
                return Err(Error::UnhandledExit(reason));
            }
        };
        self.run_state = VcpuRunState::Exited(kind);
        Ok(kind)
    }

    /// Run until halted through a [`VcpuHandle`].
    ///
    /// Requests queued before the loop returns are still answered; later
    /// ones are refused until `run` is entered again.
    pub fn run(&mut self) -> Result<()> {
        tracing::debug!(vcpu = self.index, "entering run loop");
        *self.shared.serving.lock() = true;
        let result = self.run_until_halted();
        *self.shared.serving.lock() = false;
        let result = result.and_then(|()| self.service_requests());
        self.discard_requests();
        result
    }

    fn run_until_halted(&mut self) -> Result<()> {
        loop {
            if self.shared.halt.swap(false, Ordering::SeqCst) {
                self.run_state = VcpuRunState::Stopped;
                tracing::debug!(vcpu = self.index, "halted");
                return Ok(());
            }
            self.run_once()?;
        }
    }

    /// Destroy the backend vCPU.
    pub fn destroy(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        *self.shared.serving.lock() = false;
        self.discard_requests();
        *self.shared.backend_id.lock() = None;
        match self.inner.take() {
            Some(vcpu) => self.backend.destroy_vcpu(vcpu),
            None => Ok(()),
        }
    }

    fn service_requests(&mut self) -> Result<()> {
        while let Ok(request) = self.requests.try_recv() {
            let vcpu = self.inner.as_ref().ok_or(Error::VcpuGone)?;
            match request {
                VcpuRequest::Synchronize(reply) => {
                    let regs = self.state.synchronize(&*self.backend, vcpu)?;
                    let _ = reply.send(regs.clone());
                }
                VcpuRequest::SetRegisters(regs, reply) => {
                    *self.state.regs_mut() = *regs;
                    let _ = reply.send(());
                }
            }
        }
        Ok(())
    }

    // Dropping a request's reply sender fails the waiting caller.
    fn discard_requests(&mut self) {
        while self.requests.try_recv().is_ok() {}
    }

    fn handle_exception(&mut self, info: ExceptionInfo) -> Result<()> {
        self.state.ensure_current()?;
        let syndrome = Syndrome(info.syndrome);
        let iss = syndrome.iss();
        let len = syndrome.instruction_len();

        match syndrome.class() {
            class::DABT_LOWER => self.handle_data_abort(syndrome, info.physical_address)?,
            class::SYS64 => {
                let counter = self.virtual_counter()?;
                let regs = self.state.regs_mut();
                sysreg::emulate(SysRegAccess::from_iss(iss), regs, &*self.bus, self.index, counter);
                regs.advance_pc(len);
            }
            class::WFX => {
                self.state.regs_mut().advance_pc(len);
                if iss & 1 == 0 {
                    self.wait_for_interrupt()?;
                } else {
                    // WFE
                    thread::yield_now();
                }
            }
            ec @ (class::HVC64 | class::SMC64) => {
                let smc = ec == class::SMC64;
                let regs = self.state.regs_mut();
                if !self.bus.hypercall(self.index, regs, smc) {
                    tracing::debug!(vcpu = self.index, smc, x0 = regs.gp(0), "unhandled hypercall");
                    regs.set_gp(0, u64::MAX);
                }
                // HVC returns past itself; a trapped SMC does not.
                if smc {
                    regs.advance_pc(len);
                }
            }
            ec => {
                tracing::error!(
                    vcpu = self.index,
                    class = format_args!("{:#x}", ec),
                    iss = format_args!("{:#x}", iss),
                    va = format_args!("{:#x}", info.virtual_address),
                    pa = format_args!("{:#x}", info.physical_address),
                    "unhandled exception"
                );
                return Err(Error::UnhandledException { class: ec, iss });
            }
        }

        self.state.mark_dirty();
        Ok(())
    }

    fn handle_data_abort(&mut self, syndrome: Syndrome, gpa: u64) -> Result<()> {
        if let Some(slot) = self.slots.find_overlap(gpa, gpa.saturating_add(1)) {
            tracing::error!(
                vcpu = self.index,
                gpa = format_args!("{:#x}", gpa),
                %slot,
                "abort on mapped RAM"
            );
            return Err(Error::UnsupportedAbort {
                gpa,
                reason: "access to mapped RAM trapped",
            });
        }
        let abort = DataAbort::from_iss(syndrome.iss());
        if !abort.isv {
            return Err(Error::UnsupportedAbort {
                gpa,
                reason: "no valid instruction syndrome",
            });
        }
        if abort.s1ptw {
            return Err(Error::UnsupportedAbort {
                gpa,
                reason: "stage-1 page table walk",
            });
        }

        let width = abort.width();
        let regs = self.state.regs_mut();
        if abort.wnr {
            let value = regs.gp(abort.srt) & abort.value_mask();
            tracing::trace!(vcpu = self.index, gpa = format_args!("{:#x}", gpa), width, value, "mmio write");
            self.bus.mmio_write(self.index, gpa, width, value);
        } else {
            let raw = self.bus.mmio_read(self.index, gpa, width);
            tracing::trace!(vcpu = self.index, gpa = format_args!("{:#x}", gpa), width, raw, "mmio read");
            regs.set_gp(abort.srt, abort.extend_load(raw));
        }
        regs.advance_pc(syndrome.instruction_len());
        Ok(())
    }

    fn wait_for_interrupt(&mut self) -> Result<()> {
        if self.shared.has_work() {
            return Ok(());
        }
        let regs = self.state.regs();
        let ctl = regs.sys(sys::CNTV_CTL_EL0).unwrap_or(0);
        let cval = regs.sys(sys::CNTV_CVAL_EL0).unwrap_or(0);
        let now = self.virtual_counter()?;
        let wait = timer::wfi_wait(ctl, cval, now, self.backend.counter_frequency())
            .clamp(self.wfi_max_sleep);
        tracing::trace!(vcpu = self.index, ?wait, "wfi");
        self.shared.wait_for_kick(wait);
        Ok(())
    }

    fn virtual_counter(&self) -> Result<u64> {
        let vcpu = self.inner.as_ref().ok_or(Error::VcpuGone)?;
        self.backend.virtual_counter(vcpu)
    }
}

impl<B: HypervisorBackend> Drop for Vcpu<B> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(vcpu = self.index, error = %err, "failed to destroy vcpu");
        }
    }
}

impl<B: HypervisorBackend> std::fmt::Debug for Vcpu<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("index", &self.index)
            .field("backend", &self.backend.name())
            .field("run_state", &self.run_state)
            .field("dirty", &self.state.is_dirty())
            .finish()
    }
}
