//! Packing contiguous data into and out of staging buffers.
//!
//! Host-accessible memory is copied directly; device memory goes through
//! the copy transport's short operations.

use crate::error::Result;
use crate::transport::CopyEp;
use crate::types::MemoryType;

/// Copy `dest.len()` bytes from `src`, whose memory type is `mem_type`,
/// into `dest`. Returns the number of bytes packed.
///
/// # Safety
/// `src` must be valid for `dest.len()` bytes of reads and must not overlap
/// `dest`.
pub unsafe fn pack(ep: &CopyEp, dest: &mut [u8], src: u64, mem_type: MemoryType) -> Result<usize> {
    if mem_type.is_host_accessible() {
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dest.as_mut_ptr(), dest.len()) };
    } else {
        unsafe { ep.get_short(dest, src) }?;
    }
    Ok(dest.len())
}

/// Copy `src` into `dest`, whose memory type is `mem_type`. Returns the
/// number of bytes unpacked.
///
/// # Safety
/// `dest` must be valid for `src.len()` bytes of writes and must not
/// overlap `src`.
pub unsafe fn unpack(ep: &CopyEp, dest: u64, src: &[u8], mem_type: MemoryType) -> Result<usize> {
    if mem_type.is_host_accessible() {
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dest as *mut u8, src.len()) };
    } else {
        unsafe { ep.put_short(src, dest) }?;
    }
    Ok(src.len())
}
