use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction over the OS page mapping facilities. The allocator only needs
/// to obtain whole regions of readable and writable memory and hand them
/// back, it does not care which kernel API provides them.
trait PageProvider {
    /// Requests a new private anonymous mapping where `length` bytes can be
    /// written safely, or `None` if the kernel refuses. The returned address
    /// is page aligned, which is more than enough for segment headers.
    unsafe fn map(length: usize) -> Pointer<u8>;

    /// Releases a mapping. The `(address, length)` pair must match a prior
    /// successful [`PageProvider::map`] call.
    unsafe fn unmap(address: NonNull<u8>, length: usize);
}

/// Zero sized type that implements [`PageProvider`] for each OS.
struct Platform;

/// Convenience wrapper for [`PageProvider::map`].
#[inline]
pub(crate) unsafe fn map(length: usize) -> Pointer<u8> {
    Platform::map(length)
}

/// Convenience wrapper for [`PageProvider::unmap`].
#[inline]
pub(crate) unsafe fn unmap(address: NonNull<u8>, length: usize) {
    Platform::unmap(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use libc;

    use super::{PageProvider, Platform};
    use crate::Pointer;

    impl PageProvider for Platform {
        unsafe fn map(length: usize) -> Pointer<u8> {
            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Memory should be private to our process and not mapped to any
            // file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn unmap(address: NonNull<u8>, length: usize) {
            // munmap only refuses pairs that no mmap call produced, and this
            // one comes straight from a successful map. Unmapping happens on
            // the drop path of a block, which has no way to report an error,
            // so a refused release leaves the region mapped and leaked.
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                debug_assert!(false, "munmap refused a region this allocator mapped");
            }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{PageProvider, Platform};
    use crate::Pointer;

    impl PageProvider for Platform {
        unsafe fn map(length: usize) -> Pointer<u8> {
            // Similar to mmap on Linux, Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            // This works a little bit different from mmap, memory has to be
            // reserved first and then committed in order to become usable. We
            // can do both at the same time with one single call.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            // For more detailed explanations of each parameter, see
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn unmap(address: NonNull<u8>, _length: usize) {
            // We can skip decommitting by specifying a length of 0 and the
            // MEM_RELEASE flag. See the docs for details:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            let address = address.cast().as_ptr();
            let length = 0;
            let flags = Memory::MEM_RELEASE;

            // MEM_RELEASE only fails for a base address VirtualAlloc never
            // returned. As with munmap above, the caller is a drop path that
            // cannot surface an error, so the region stays reserved and
            // leaks.
            if !Memory::VirtualFree(address, length, flags).as_bool() {
                debug_assert!(false, "VirtualFree refused a region this allocator mapped");
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When running under Miri we can't issue syscalls because there's no FFI
    //! support, so the global allocator stands in for the kernel. This also
    //! turns Miri's leak checker into a region leak detector for us: any
    //! block that is mapped but never unmapped shows up at the end of the
    //! test run.

    use std::{alloc, mem, ptr::NonNull};

    use super::{PageProvider, Platform};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, mem::align_of::<usize>()).unwrap()
    }

    impl PageProvider for Platform {
        unsafe fn map(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn unmap(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}
