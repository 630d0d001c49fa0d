//! The boundary between the allocator and the operating system.
//!
//! Everything the heap and the pools need from the kernel fits in three
//! operations: map some pages, unmap them, and tell the page size. The
//! [`PageSource`] trait captures them so tests (or embedders) can swap the
//! OS for something they control; [`Kernel`] is the real thing.

use std::{io, ptr::NonNull, sync::OnceLock};

/// Source of whole pages for chunks and pools.
///
/// Implementations must return memory that is readable, writable and
/// initialised (anonymous mappings are zero-filled), and must stay valid
/// until [`PageSource::return_memory`] is called for it.
pub trait PageSource: Send + Sync {
    /// Request a memory region of size `len` at an address of the source's choosing.
    fn request_memory(&self, len: usize) -> io::Result<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    ///
    /// # Safety
    ///
    /// `addr` and `len` must describe a region previously returned by
    /// [`PageSource::request_memory`] on this same source, and nothing may
    /// access that region afterwards.
    unsafe fn return_memory(&self, addr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size(&self) -> usize;
}

/// Page source backed by the operating system: `mmap`/`munmap` on unix,
/// `VirtualAlloc`/`VirtualFree` on windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

/// Page size reported by the OS, queried once.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

impl PageSource for Kernel {
    fn request_memory(&self, len: usize) -> io::Result<NonNull<u8>> {
        unsafe { platform::request_memory(len) }
    }

    unsafe fn return_memory(&self, addr: NonNull<u8>, len: usize) -> io::Result<()> {
        unsafe { platform::return_memory(addr, len) }
    }

    fn page_size(&self) -> usize {
        *PAGE_SIZE.get_or_init(|| unsafe { platform::page_size() })
    }
}

#[cfg(unix)]
mod platform {
    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        io,
        os::raw::{c_int, c_void},
        ptr::{self, NonNull},
    };

    pub(super) unsafe fn request_memory(len: usize) -> io::Result<NonNull<u8>> {
        // mmap parameters.
        const ADDR: *mut c_void = ptr::null_mut::<c_void>();
        // Read-Write only memory.
        const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
        const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        const FD: c_int = -1;
        const OFFSET: off_t = 0;

        let addr = unsafe { mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned a null mapping"))
    }

    pub(super) unsafe fn return_memory(addr: NonNull<u8>, len: usize) -> io::Result<()> {
        match unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub(super) unsafe fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }
}

#[cfg(windows)]
mod platform {
    use std::{io, mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    pub(super) unsafe fn request_memory(len: usize) -> io::Result<NonNull<u8>> {
        // Read-Write only.
        let protection = Memory::PAGE_READWRITE;

        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

        unsafe {
            let addr = Memory::VirtualAlloc(None, len, flags, protection);

            NonNull::new(addr.cast::<u8>()).ok_or_else(io::Error::last_os_error)
        }
    }

    pub(super) unsafe fn return_memory(addr: NonNull<u8>, _len: usize) -> io::Result<()> {
        // MEM_RELEASE requires a zero length and frees the whole reservation.
        unsafe {
            Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE)
                .map_err(|_| io::Error::last_os_error())
        }
    }

    pub(super) unsafe fn page_size() -> usize {
        unsafe {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}
