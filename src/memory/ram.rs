//! Host memory blocks used to back guest RAM.

use crate::backend::{HostAddress, MemFlags};
use crate::error::{Error, Result};

use super::slot::MemoryRegion;

#[cfg(target_os = "windows")]
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};

/// A page-aligned, zero-initialized host allocation.
pub struct RamBlock {
    ptr: *mut u8,
    size: usize,
}

// Safety: RamBlock owns its allocation; concurrent guest access goes through
// the hypervisor, not through these pointers.
unsafe impl Send for RamBlock {}
unsafe impl Sync for RamBlock {}

impl RamBlock {
    /// Allocate `size` bytes, rounded up to the host page size.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::MemoryAllocationFailed(
                "Size must be greater than 0".to_string(),
            ));
        }
        let page = page_size();
        let aligned = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or_else(|| Error::MemoryAllocationFailed(format!("size {size:#x} overflows")))?;
        let ptr = Self::allocate(aligned)?;
        tracing::debug!(size = aligned, "allocated RAM block");
        Ok(Self {
            ptr,
            size: aligned,
        })
    }

    #[cfg(unix)]
    fn allocate(size: usize) -> Result<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocationFailed(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(ptr as *mut u8)
    }

    #[cfg(target_os = "windows")]
    fn allocate(size: usize) -> Result<*mut u8> {
        let ptr = unsafe { VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::MemoryAllocationFailed(format!(
                "VirtualAlloc failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(ptr as *mut u8)
    }

    /// Host address of the first byte.
    pub fn host_address(&self) -> HostAddress {
        HostAddress::from_ptr(self.ptr)
    }

    /// Size of the block in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// A region mapping the whole block at `gpa`.
    pub fn region(&self, gpa: u64, flags: MemFlags) -> MemoryRegion {
        MemoryRegion::new(self.host_address(), gpa, self.size as u64, flags)
    }

    /// A region mapping `[offset, offset + len)` of the block at `gpa`.
    pub fn subregion(&self, offset: usize, len: usize, gpa: u64, flags: MemFlags) -> Result<MemoryRegion> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(MemoryRegion::new(
                self.host_address().offset(offset as u64),
                gpa,
                len as u64,
                flags,
            )),
            _ => Err(Error::InvalidRegion {
                gpa,
                size: len as u64,
            }),
        }
    }

    /// Copy bytes out of the block.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy bytes into the block.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
        Ok(())
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::InvalidRegion {
                gpa: offset as u64,
                size: len as u64,
            }),
        }
    }
}

impl Drop for RamBlock {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        #[cfg(target_os = "windows")]
        unsafe {
            let _ = VirtualFree(self.ptr as *mut std::ffi::c_void, 0, MEM_RELEASE);
        }
    }
}

impl std::fmt::Debug for RamBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamBlock")
            .field("host", &self.host_address())
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}
