//! Linux I/O priority control.
//!
//! Values match `linux/include/linux/ioprio.h`. Background maintenance
//! drops itself to the idle class so foreground request latency is not
//! affected by defragmentation or inspection sweeps.

#[cfg(target_os = "linux")]
mod imp {
    const IOPRIO_CLASS_SHIFT: i32 = 13;
    const IOPRIO_WHO_PROCESS: libc::c_int = 1;

    pub const IOPRIO_CLASS_IDLE: i32 = 3;

    fn prio_value(class: i32, data: i32) -> i32 {
        (class << IOPRIO_CLASS_SHIFT) | data
    }

    /// Get the current thread's I/O priority, or `None` on error.
    pub fn get() -> Option<i32> {
        let ret = unsafe { libc::syscall(libc::SYS_ioprio_get, IOPRIO_WHO_PROCESS, 0) };
        if ret < 0 {
            None
        } else {
            Some(ret as i32)
        }
    }

    /// Set the current thread's raw I/O priority value.
    pub fn set(ioprio: i32) -> bool {
        let ret = unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, ioprio) };
        ret == 0
    }

    /// Move the current thread to the idle I/O class.
    ///
    /// Returns the previous priority so it can be restored on exit.
    pub fn set_idle() -> Option<i32> {
        let previous = get();
        if set(prio_value(IOPRIO_CLASS_IDLE, 0)) {
            previous
        } else {
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    pub fn get() -> Option<i32> {
        None
    }

    pub fn set(_ioprio: i32) -> bool {
        false
    }

    pub fn set_idle() -> Option<i32> {
        None
    }
}

pub use imp::*;
