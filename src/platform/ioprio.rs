//! Best-effort demotion to the idle I/O scheduling class.
//!
//! A dedup pass reads entire volumes; running it at normal priority starves
//! interactive workloads. Failure is ignored; the pass still works, just
//! less politely.

#![allow(unsafe_code)]

const IOPRIO_WHO_PROCESS: libc::c_int = 1;
const IOPRIO_CLASS_IDLE: libc::c_int = 3;
const IOPRIO_CLASS_SHIFT: libc::c_int = 13;

/// Move the calling process into the idle I/O class.
pub fn set_idle_priority() {
    let prio = IOPRIO_CLASS_IDLE << IOPRIO_CLASS_SHIFT;
    unsafe {
        libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, prio);
    }
}
