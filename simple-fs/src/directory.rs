use alloc::{string::String, vec, vec::Vec};

use crate::{
    block_dev::BlockDevice,
    error::Resource,
    layout::{DirEntry, DIRENT_SZ},
    ChainIndex, SfsError, SfsResult,
};

/// In-memory mirror of the flat directory region
pub struct Directory {
    start_block: usize,
    blocks: usize,
    block_size: usize,
    entries: Vec<DirEntry>,
}

impl Directory {
    pub fn new_empty(start_block: usize, blocks: usize, block_size: usize) -> Self {
        let capacity = blocks * (block_size / DIRENT_SZ);
        Self {
            start_block,
            blocks,
            block_size,
            entries: vec![DirEntry::new_empty(); capacity],
        }
    }

    pub fn load(
        start_block: usize,
        blocks: usize,
        block_device: &dyn BlockDevice,
    ) -> SfsResult<Self> {
        let block_size = block_device.block_size();
        let raw = block_device.read_to_vec(start_block, blocks)?;
        let mut entries = Vec::with_capacity(blocks * (block_size / DIRENT_SZ));
        // entries never straddle a block boundary
        for block in raw.chunks_exact(block_size) {
            for slot in block.chunks_exact(DIRENT_SZ) {
                entries.push(DirEntry::decode(slot)?);
            }
        }
        Ok(Self {
            start_block,
            blocks,
            block_size,
            entries,
        })
    }

    /// Write the whole region through to the device
    pub fn sync(&self, block_device: &dyn BlockDevice) -> SfsResult<()> {
        let per_block = self.block_size / DIRENT_SZ;
        let mut raw = vec![0u8; self.blocks * self.block_size];
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = (i / per_block) * self.block_size + (i % per_block) * DIRENT_SZ;
            entry.encode(&mut raw[offset..offset + DIRENT_SZ]);
        }
        block_device.write_blocks(self.start_block, &raw)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| !entry.is_free() && entry.name == name)
    }

    /// Slot currently owning the chain starting at `head`
    pub fn find_by_head(&self, head: ChainIndex) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| !entry.is_free() && entry.head == head)
    }

    pub fn find_free_slot(&self) -> SfsResult<usize> {
        self.entries
            .iter()
            .position(DirEntry::is_free)
            .ok_or(SfsError::Full(Resource::Directory))
    }

    /// Record a new empty file; `name` must not be present yet
    pub fn create(
        &mut self,
        name: &str,
        head: ChainIndex,
        block_device: &dyn BlockDevice,
    ) -> SfsResult<usize> {
        debug_assert!(self.find(name).is_none());
        let slot = self.find_free_slot()?;
        self.entries[slot] = DirEntry::new(name, head);
        self.sync(block_device)?;
        Ok(slot)
    }

    pub fn update_size(
        &mut self,
        slot: usize,
        size: u32,
        block_device: &dyn BlockDevice,
    ) -> SfsResult<()> {
        self.entries[slot].size = size;
        self.sync(block_device)
    }

    /// Free a slot. Its chain must already be released.
    pub fn clear(&mut self, slot: usize, block_device: &dyn BlockDevice) -> SfsResult<()> {
        self.entries[slot] = DirEntry::new_empty();
        self.sync(block_device)
    }

    pub fn entry(&self, slot: usize) -> &DirEntry {
        &self.entries[slot]
    }

    /// In-use entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|entry| !entry.is_free())
    }

    pub fn list(&self) -> Vec<(String, u32)> {
        self.iter().map(|entry| (entry.name.clone(), entry.size)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDevice;

    #[test]
    fn slots_are_reused_first_fit() {
        let dev = MemoryDevice::new(64, 8);
        let mut dir = Directory::new_empty(2, 2, 64);
        // 64 / 24 = 2 slots per block
        assert_eq!(dir.entries.len(), 4);
        assert_eq!(dir.create("a", 0, &dev).unwrap(), 0);
        assert_eq!(dir.create("b", 1, &dev).unwrap(), 1);
        assert_eq!(dir.create("c", 2, &dev).unwrap(), 2);
        dir.clear(1, &dev).unwrap();
        assert_eq!(dir.find("b"), None);
        assert_eq!(dir.create("d", 3, &dev).unwrap(), 1);
        assert_eq!(dir.find_by_head(3), Some(1));
        let names: Vec<_> = dir.list().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["a", "d", "c"]);
    }

    #[test]
    fn full_directory_is_reported() {
        let dev = MemoryDevice::new(64, 8);
        let mut dir = Directory::new_empty(2, 1, 64);
        dir.create("x", 0, &dev).unwrap();
        dir.create("y", 1, &dev).unwrap();
        assert_eq!(dir.create("z", 2, &dev), Err(SfsError::Full(Resource::Directory)));
    }

    #[test]
    fn sizes_persist_across_reload() {
        let dev = MemoryDevice::new(64, 8);
        let mut dir = Directory::new_empty(2, 2, 64);
        dir.sync(&dev).unwrap();
        let slot = dir.create("report.md", 5, &dev).unwrap();
        dir.update_size(slot, 4242, &dev).unwrap();
        dir.create("zzz", 6, &dev).unwrap();
        let reloaded = Directory::load(2, 2, &dev).unwrap();
        assert_eq!(reloaded.list(), [(String::from("report.md"), 4242), (String::from("zzz"), 0)]);
        assert_eq!(reloaded.entry(slot).head, 5);
    }
}
