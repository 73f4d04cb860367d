//! teachos — the resource-management core of a small teaching kernel: a
//! block buffer cache and a physical frame allocator, each in two
//! renditions with identical semantics. The baseline forms guard each
//! structure with a single lock; the scaled forms shard the structure —
//! hash buckets for the cache, per-hart free lists for the allocator — so
//! parallel harts rarely contend.
//!
//! The crate consumes its surroundings through narrow seams: block I/O via
//! [`bio::BlockDevice`], preemption control and hart identity via
//! [`hart::HartRuntime`], and time via the [`clock`] tick word.

#![cfg_attr(not(test), no_std)]

pub mod bio;
pub mod clock;
pub mod hart;
pub mod kalloc;
pub mod param;
pub mod sleeplock;
pub mod spinlock;

