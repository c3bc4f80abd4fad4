//! Accelerator core: one guest's memory map and vCPUs over a backend.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;

use crate::backend::{HostAddress, HypervisorBackend, MemFlags};
use crate::builder::AccelBuilder;
use crate::config::AccelConfig;
use crate::device::DeviceBus;
use crate::error::{fatal, Error, Result};
use crate::memory::{MemoryRegion, MemorySlotTable, Slot};
use crate::vcpu::{RegisterFile, Vcpu, VcpuHandle};

/// Hardware acceleration for one guest.
///
/// Owns the backend and the memory slot table, and creates vCPUs that share
/// them. Memory map changes that leave the guest unable to continue
/// (exhausted slots, an inconsistent table, a backend rejection) terminate
/// the process with a diagnostic; other errors are returned.
///
/// # Example
///
/// ```rust,no_run
/// use hvaccel::backend::recording::RecordingBackend;
/// use hvaccel::{Accelerator, MemFlags, RamBlock};
///
/// let accel = Accelerator::builder(RecordingBackend::new())
///     .slot_capacity(64)
///     .build()?;
/// let ram = RamBlock::new(64 << 20)?;
/// accel.add_region(ram.region(0x4000_0000, MemFlags::RWX))?;
/// # Ok::<(), hvaccel::Error>(())
/// ```
pub struct Accelerator<B: HypervisorBackend> {
    backend: Arc<B>,
    slots: Arc<MemorySlotTable<B>>,
    config: AccelConfig,
}

impl<B: HypervisorBackend + 'static> Accelerator<B> {
    /// Create a new accelerator builder.
    pub fn builder(backend: B) -> AccelBuilder<B> {
        AccelBuilder::new(backend)
    }

    /// Create an accelerator over `backend`.
    pub fn new(backend: Arc<B>, config: AccelConfig) -> Result<Self> {
        config.validate()?;
        let slots = Arc::new(MemorySlotTable::with_config(backend.clone(), &config));
        tracing::info!(
            backend = backend.name(),
            slots = config.slot_capacity,
            policy = %slots.policy(),
            "accelerator ready"
        );
        Ok(Self {
            backend,
            slots,
            config,
        })
    }

    /// The backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The memory slot table.
    pub fn slots(&self) -> &Arc<MemorySlotTable<B>> {
        &self.slots
    }

    /// The configuration in effect.
    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    /// Map `region` into the guest.
    pub fn add_region(&self, region: MemoryRegion) -> Result<()> {
        let result = self.slots.add_region(region);
        self.check(result, "add_region", region.gpa, region.size)
    }

    /// Unmap `[gpa, gpa + size)` from the guest.
    pub fn remove_region(&self, gpa: u64, size: u64) -> Result<()> {
        let result = self.slots.remove_region(gpa, size);
        self.check(result, "remove_region", gpa, size)
    }

    /// Change guest permissions on a mapped range.
    pub fn protect_region(&self, gpa: u64, size: u64, flags: MemFlags) -> Result<()> {
        let result = self.slots.protect_region(gpa, size, flags);
        self.check(result, "protect_region", gpa, size)
    }

    /// Slot intersecting `[start, end)`, if any.
    pub fn find_overlap(&self, start: u64, end: u64) -> Option<Slot> {
        self.slots.find_overlap(start, end)
    }

    /// Host address backing `gpa`, if mapped.
    pub fn host_address_for(&self, gpa: u64) -> Option<HostAddress> {
        self.slots.host_address_for(gpa)
    }

    /// Create vCPU `index` owned by the calling thread.
    pub fn create_vcpu(&self, index: u32, bus: Arc<dyn DeviceBus>) -> Result<Vcpu<B>> {
        let mut vcpu = Vcpu::create(self.backend.clone(), self.slots.clone(), bus, index)?;
        vcpu.set_wfi_max_sleep(self.config.wfi_max_sleep);
        Ok(vcpu)
    }

    /// Start vCPU `index` on a dedicated thread, loaded with `initial`.
    ///
    /// Returns once the vCPU exists and its registers are pushed. A fatal
    /// error in the run loop terminates the process.
    pub fn spawn_vcpu(
        &self,
        index: u32,
        bus: Arc<dyn DeviceBus>,
        initial: RegisterFile,
    ) -> Result<VcpuThread<B>> {
        let backend = self.backend.clone();
        let slots = self.slots.clone();
        let max_sleep = self.config.wfi_max_sleep;
        let (tx, rx) = oneshot::channel();

        let join = thread::Builder::new()
            .name(format!("vcpu{index}"))
            .spawn(move || {
                let created = Vcpu::create(backend, slots.clone(), bus, index).and_then(|mut vcpu| {
                    vcpu.set_wfi_max_sleep(max_sleep);
                    vcpu.reset(&initial)?;
                    Ok(vcpu)
                });
                let mut vcpu = match created {
                    Ok(vcpu) => vcpu,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                let _ = tx.send(Ok(vcpu.handle()));

                if let Err(err) = vcpu.run() {
                    if err.is_fatal() {
                        fatal(&err, &format!("vcpu {index}: {vcpu:?}\n{}", slots.dump()));
                    }
                    tracing::error!(vcpu = index, error = %err, "run loop ended");
                }
            })?;

        let handle = rx.blocking_recv().map_err(|_| Error::VcpuGone)??;
        Ok(VcpuThread { handle, join })
    }

    fn check(&self, result: Result<()>, op: &str, gpa: u64, size: u64) -> Result<()> {
        match result {
            Err(err) if err.is_fatal() => fatal(
                &err,
                &format!("{op} gpa {gpa:#x} size {size:#x}\n{}", self.slots.dump()),
            ),
            other => other,
        }
    }
}

impl<B: HypervisorBackend> std::fmt::Debug for Accelerator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accelerator")
            .field("backend", &self.backend.name())
            .field("slots", &self.slots)
            .field("config", &self.config)
            .finish()
    }
}

/// A vCPU running on its own thread.
pub struct VcpuThread<B: HypervisorBackend> {
    handle: VcpuHandle<B>,
    join: JoinHandle<()>,
}

impl<B: HypervisorBackend> std::fmt::Debug for VcpuThread<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcpuThread")
            .field("join", &self.join)
            .finish_non_exhaustive()
    }
}

impl<B: HypervisorBackend> VcpuThread<B> {
    /// Handle for interrupts, register access, and halting.
    pub fn handle(&self) -> &VcpuHandle<B> {
        &self.handle
    }

    /// Halt the vCPU and wait for its thread to exit.
    pub fn stop(self) -> Result<()> {
        self.handle.halt()?;
        self.join.join().map_err(|_| Error::VcpuGone)
    }
}
