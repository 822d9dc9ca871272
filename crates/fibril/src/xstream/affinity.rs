//! CPU affinity of execution streams

use crate::error::{Error, Result};
use std::thread::JoinHandle;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::io;
    use std::mem;
    use std::os::unix::thread::JoinHandleExt;

    pub(crate) type NativeThread = libc::pthread_t;

    pub(crate) fn current() -> NativeThread {
        // SAFETY: pthread_self has no preconditions
        unsafe { libc::pthread_self() }
    }

    pub(crate) fn of<T>(handle: &JoinHandle<T>) -> NativeThread {
        handle.as_pthread_t()
    }

    pub(crate) fn set(thread: NativeThread, cpus: &[usize]) -> Result<()> {
        let Some(&first) = cpus.first() else {
            return Err(Error::InvalidArg("empty cpu set"));
        };
        // SAFETY: cpu_set_t is plain data; all-zero is the empty set
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
        for &cpu in cpus {
            if cpu >= libc::CPU_SETSIZE as usize {
                return Err(Error::InvalidArg("cpu id out of range"));
            }
            // SAFETY: cpu is below CPU_SETSIZE
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
        // SAFETY: `thread` is a live, joinable thread of this process
        let rc = unsafe {
            libc::pthread_setaffinity_np(thread, mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(Error::CpuBind {
                cpu: first,
                source: io::Error::from_raw_os_error(rc),
            });
        }
        Ok(())
    }

    pub(crate) fn get(thread: NativeThread) -> Result<Vec<usize>> {
        // SAFETY: as in `set`
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
        let rc = unsafe {
            libc::pthread_getaffinity_np(thread, mem::size_of::<libc::cpu_set_t>(), &mut set)
        };
        if rc != 0 {
            return Err(Error::sys(
                "pthread_getaffinity_np",
                io::Error::from_raw_os_error(rc),
            ));
        }
        Ok((0..libc::CPU_SETSIZE as usize)
            // SAFETY: index is below CPU_SETSIZE
            .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
            .collect())
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub(crate) type NativeThread = ();

    pub(crate) fn current() -> NativeThread {}

    pub(crate) fn of<T>(_handle: &JoinHandle<T>) -> NativeThread {}

    pub(crate) fn set(_thread: NativeThread, _cpus: &[usize]) -> Result<()> {
        Err(Error::FeatureUnavailable("cpu affinity is only supported on Linux"))
    }

    pub(crate) fn get(_thread: NativeThread) -> Result<Vec<usize>> {
        Err(Error::FeatureUnavailable("cpu affinity is only supported on Linux"))
    }
}

pub(crate) use imp::{current, get, of, set, NativeThread};
