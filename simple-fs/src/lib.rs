//! A simple single-volume file system over a flat block device.
//!
//! Files are chains of fixed-size data blocks threaded through a FAT-style
//! chain table. The allocation bitmap, the directory and the chain table all
//! live in reserved regions of the same device and are written through on
//! every mutation, so a volume can be unmounted and mounted again at any
//! point between calls.
#![no_std]
#![deny(missing_docs)]
extern crate alloc;

/// Block size used when a volume is formatted without an explicit size
pub const DEFAULT_BLOCK_SZ: usize = 2048;
/// Blocks reserved for the directory unless told otherwise
pub const DEFAULT_DIRECTORY_BLOCKS: usize = 20;
/// The max length of a file name in bytes
pub const NAME_LENGTH_LIMIT: usize = 12;
/// Sentinel for "unused slot" in a chain entry or directory entry, and
/// "end of chain" in a `next` link
pub const NONE: u32 = u32::MAX;

/// Logical slot number in the chain table
pub type ChainIndex = u32;
/// Block number relative to the start of the data region
pub type BlockNumber = u32;

mod bitmap;
mod block_dev;
mod chain;
mod directory;
mod error;
mod layout;
mod sfs;
mod vfs;

pub use block_dev::{check_range, BlockDevice, MemoryDevice};
pub use error::{Resource, SfsError, SfsResult};
pub use layout::{FormatOptions, Geometry};
pub use sfs::SimpleFileSystem;
pub use vfs::FileHandle;
