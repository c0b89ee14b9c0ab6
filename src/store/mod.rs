//! Durable state: volume registry, inode index, dedup event log.

pub mod db;

pub use db::{InodeRecord, ScannedInode, SizeClass, TrackingStore, VolumeRow};
