use crate::bitmap::{MAP_SIZE, Trace};
use std::io;
use std::ptr;
use std::sync::atomic::{Ordering, compiler_fence, fence};
use thiserror::Error;

/// Environment variable through which the target learns the segment id.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

#[derive(Error, Debug)]
pub enum ShmemError {
    #[error("shmget() failed for a {size}-byte segment (check kernel.shmmax / shmall): {source}")]
    Allocate { size: usize, source: io::Error },
    #[error("shmat() failed: {0}")]
    Attach(io::Error),
}

/// A System V shared memory segment holding the trace bitmap.
///
/// The segment is marked for removal on drop, so an aborted run does not
/// leak it past the last detach.
#[derive(Debug)]
pub struct SharedTrace {
    id: libc::c_int,
    map: *mut u8,
}

impl SharedTrace {
    pub fn new() -> Result<Self, ShmemError> {
        unsafe {
            let id = libc::shmget(
                libc::IPC_PRIVATE,
                MAP_SIZE,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            );
            if id < 0 {
                return Err(ShmemError::Allocate {
                    size: MAP_SIZE,
                    source: io::Error::last_os_error(),
                });
            }

            let map = libc::shmat(id, ptr::null(), 0) as *mut u8;
            if map.is_null() || map as isize == -1 {
                let err = io::Error::last_os_error();
                libc::shmctl(id, libc::IPC_RMID, ptr::null_mut());
                return Err(ShmemError::Attach(err));
            }

            Ok(Self { id, map })
        }
    }

    /// Value exported to the target through [`SHM_ENV_VAR`].
    pub fn id_string(&self) -> String {
        self.id.to_string()
    }

    pub fn trace(&self) -> &Trace {
        unsafe { &*(self.map as *const Trace) }
    }

    pub fn trace_mut(&mut self) -> &mut Trace {
        unsafe { &mut *(self.map as *mut Trace) }
    }

    /// Zeroes the map before the target is handed control.
    pub fn clear(&mut self) {
        self.trace_mut().fill(0);
        barrier();
    }
}

impl Drop for SharedTrace {
    fn drop(&mut self) {
        unsafe {
            libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut());
            libc::shmdt(self.map as *const libc::c_void);
        }
    }
}

/// Orders our accesses to the map against the child's run window.
#[inline]
pub fn barrier() {
    compiler_fence(Ordering::SeqCst);
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_starts_zeroed_and_can_be_cleared() {
        let mut shm = SharedTrace::new().expect("shared memory should be available");
        assert!(shm.trace().iter().all(|&b| b == 0));

        shm.trace_mut()[123] = 7;
        assert_eq!(shm.trace()[123], 7);

        shm.clear();
        assert_eq!(shm.trace()[123], 0);
        assert!(shm.id_string().parse::<i32>().is_ok());
    }
}
