//! Host-memory deployment, the other half of C6's "host memory or cobj
//! buffer" split. A boot-packaged component's bytes go into its [`Cobj`]
//! payload; a host-installed component's bytes, and the handful of
//! special-component payloads C9 §4.9 describes (the MPD manager's edge
//! graph, the config component's record array, the init-file component's
//! file copy, the boot component's concatenated cobjs), are instead
//! written directly into the address range the component was assigned —
//! this process shares the same virtual address space the installed
//! component will run in, so "loading" a section here is a private
//! anonymous mapping at a fixed address followed by a copy, exactly the
//! way the reference loader's own `mmap(MAP_FIXED)` calls work.
//!
//! That mapping step is abstracted behind [`HostMemory`] rather than
//! called directly, for the same reason [`crate::kernel::KernelControl`]
//! is a trait: tests substitute [`RecordingHostMemory`] so that exercising
//! the payload-construction logic never pokes a real fixed address out of
//! a test process.
//!
//! [`Cobj`]: crate::cobj::Cobj

use crate::error::{LoaderError, Result};

/// Somewhere a component's bytes can be deployed once its address window
/// is known: a private, fixed-address mapping, written once and never
/// unmapped by the loader (the component, once installed, owns it).
pub trait HostMemory {
    /// Maps `bytes.len()` bytes read-write at `addr` and copies `bytes` in.
    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<()>;
    /// Maps `len` zero-filled bytes at `addr` (BSS; no payload to copy).
    fn zero(&mut self, addr: u64, len: u64) -> Result<()>;
}

/// Real deployment target: anonymous, fixed-address mappings in this
/// process, matching the reference loader's own technique of mapping
/// every component directly into the address space it shares with the
/// installed kernel rather than handing bytes across an IPC boundary.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct AnonMmap;

#[cfg(unix)]
impl AnonMmap {
    fn map(&self, addr: u64, len: usize) -> Result<*mut u8> {
        if len == 0 {
            return Ok(std::ptr::null_mut());
        }
        // SAFETY: MAP_FIXED at a caller-supplied window address is exactly
        // the documented contract of this trait; the caller (C6/C9) owns
        // picking disjoint, page-aligned windows.
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(LoaderError::Io {
                path: format!("mmap(0x{addr:x}, {len})").into(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(ptr as *mut u8)
    }
}

#[cfg(unix)]
impl HostMemory for AnonMmap {
    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        let ptr = self.map(addr, bytes.len())?;
        if !ptr.is_null() {
            // SAFETY: `ptr` was just mapped read-write for exactly this length.
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        }
        Ok(())
    }

    fn zero(&mut self, addr: u64, len: u64) -> Result<()> {
        // Anonymous pages already come back zero-filled; mapping alone
        // reserves the range, matching the reference loader's BSS handling.
        self.map(addr, len as usize)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum HostMemoryEvent {
    Write { addr: u64, bytes: Vec<u8> },
    Zero { addr: u64, len: u64 },
}

/// Records every write instead of mapping real memory; used by tests and
/// by the runnable example, which has no business taking over a page of
/// its host process's address space.
#[derive(Debug, Default)]
pub struct RecordingHostMemory {
    pub events: Vec<HostMemoryEvent>,
}

impl HostMemory for RecordingHostMemory {
    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.events.push(HostMemoryEvent::Write {
            addr,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn zero(&mut self, addr: u64, len: u64) -> Result<()> {
        self.events.push(HostMemoryEvent::Zero { addr, len });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_host_memory_captures_writes_and_zeros() {
        let mut mem = RecordingHostMemory::default();
        mem.write(0x1000, &[1, 2, 3]).unwrap();
        mem.zero(0x2000, 4096).unwrap();

        assert_eq!(mem.events.len(), 2);
        match &mem.events[0] {
            HostMemoryEvent::Write { addr, bytes } => {
                assert_eq!(*addr, 0x1000);
                assert_eq!(bytes, &[1, 2, 3]);
            }
            _ => panic!("expected write"),
        }
        match &mem.events[1] {
            HostMemoryEvent::Zero { addr, len } => {
                assert_eq!(*addr, 0x2000);
                assert_eq!(*len, 4096);
            }
            _ => panic!("expected zero"),
        }
    }
}
