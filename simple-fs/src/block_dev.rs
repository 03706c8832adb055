use alloc::{format, vec, vec::Vec};
use core::any::Any;

use spin::Mutex;

use crate::{SfsError, SfsResult};

/// A flat, fixed-size block device that simple-fs can live on.
///
/// Blocks are addressed `0..total_blocks()`. Both transfer calls move a
/// whole number of blocks: `buf.len()` must be a multiple of `block_size()`.
pub trait BlockDevice: Send + Sync + Any {
    /// Bytes per block
    fn block_size(&self) -> usize;
    /// Number of addressable blocks
    fn total_blocks(&self) -> usize;
    /// Read `buf.len() / block_size()` blocks starting at `start`
    fn read_blocks(&self, start: usize, buf: &mut [u8]) -> SfsResult<()>;
    /// Write `buf.len() / block_size()` blocks starting at `start`
    fn write_blocks(&self, start: usize, buf: &[u8]) -> SfsResult<()>;

    /// Read `count` blocks into a fresh buffer
    fn read_to_vec(&self, start: usize, count: usize) -> SfsResult<Vec<u8>> {
        let mut buf = vec![0u8; count * self.block_size()];
        self.read_blocks(start, &mut buf)?;
        Ok(buf)
    }
}

/// Check a request against the device bounds, shared by implementors.
pub fn check_range(dev: &dyn BlockDevice, start: usize, len: usize) -> SfsResult<usize> {
    let block_size = dev.block_size();
    if len % block_size != 0 {
        return Err(SfsError::Io {
            block: start,
            detail: format!("buffer of {} bytes is not a whole number of blocks", len),
        });
    }
    let count = len / block_size;
    if start.checked_add(count).map_or(true, |end| end > dev.total_blocks()) {
        return Err(SfsError::Io {
            block: start,
            detail: format!(
                "{} blocks past the end of a {} block device",
                count,
                dev.total_blocks()
            ),
        });
    }
    Ok(count)
}

/// A RAM disk, handy for tests and for kernels without a real driver
pub struct MemoryDevice {
    block_size: usize,
    total_blocks: usize,
    data: Mutex<Vec<u8>>,
}

impl MemoryDevice {
    /// A zeroed device of `total_blocks` blocks of `block_size` bytes
    pub fn new(block_size: usize, total_blocks: usize) -> Self {
        Self {
            block_size,
            total_blocks,
            data: Mutex::new(vec![0u8; block_size * total_blocks]),
        }
    }

    /// Copy of the whole image
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    fn read_blocks(&self, start: usize, buf: &mut [u8]) -> SfsResult<()> {
        check_range(self, start, buf.len())?;
        let offset = start * self.block_size;
        buf.copy_from_slice(&self.data.lock()[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_blocks(&self, start: usize, buf: &[u8]) -> SfsResult<()> {
        check_range(self, start, buf.len())?;
        let offset = start * self.block_size;
        self.data.lock()[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}
