//! btrfs-dedup-helper (bdh) — offline btrfs deduplication agent.
//!
//! The pipeline, stage by stage:
//! 1. **Scan** — walk a subvolume's b-tree for inode items newer than the
//!    volume's tracked generation and absorb them into a sqlite store.
//! 2. **Index** — group tracked inodes into same-size equivalence classes.
//! 3. **Lock** — freeze each class with the immutable inode attribute and
//!    verify no other process holds the files writable.
//! 4. **Compare + clone** — byte-exact comparison, then the kernel clone
//!    ioctl collapses duplicate extents into shared references.
//!
//! Files stay independent at the metadata level; they share storage until
//! one of them is modified again.

// The ioctl surface needs raw calls; everything unsafe is confined to
// `platform`, which opts back in per file.
#![deny(unsafe_code)]

pub mod core;
pub mod dedup;
pub mod platform;
pub mod registry;
pub mod scanner;
pub mod store;
