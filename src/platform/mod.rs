//! Kernel-facing layer: btrfs ioctls, inode attribute flags, extent maps,
//! the `/proc` writer sweep, and I/O priority.
//!
//! Everything `unsafe` in the crate lives below this module; the rest of the
//! code sees typed operations and classified errors.

pub mod btrfs;
pub mod chattr;
pub mod fiemap;
pub mod ioprio;
pub mod item;
pub mod proc_scan;
