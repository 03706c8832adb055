use alloc::{format, vec, vec::Vec};

use crate::{
    bitmap::Bitmap,
    block_dev::BlockDevice,
    error::Resource,
    layout::{ChainEntry, CHAIN_ENTRY_SZ},
    BlockNumber, ChainIndex, SfsError, SfsResult, NONE,
};

/// In-memory mirror of the chain table region.
///
/// An arena of `{data_block, next}` slots: a file is the singly linked
/// list that starts at its directory entry's head. A slot whose
/// `data_block` is `NONE` is free. Every structural change is followed by
/// a write of the whole region.
pub struct ChainTable {
    start_block: usize,
    blocks: usize,
    block_size: usize,
    entries: Vec<ChainEntry>,
}

impl ChainTable {
    /// All `count` slots free
    pub fn new_empty(start_block: usize, blocks: usize, block_size: usize, count: usize) -> Self {
        Self {
            start_block,
            blocks,
            block_size,
            entries: vec![ChainEntry::EMPTY; count],
        }
    }

    /// Load the mirror, rejecting links that point outside the table
    pub fn load(
        start_block: usize,
        blocks: usize,
        count: usize,
        block_device: &dyn BlockDevice,
    ) -> SfsResult<Self> {
        let raw = block_device.read_to_vec(start_block, blocks)?;
        let entries: Vec<ChainEntry> = raw
            .chunks_exact(CHAIN_ENTRY_SZ)
            .take(count)
            .map(ChainEntry::decode)
            .collect();
        for (index, entry) in entries.iter().enumerate() {
            let in_range = |v: u32| v == NONE || (v as usize) < count;
            if !in_range(entry.data_block) || !in_range(entry.next) {
                return Err(SfsError::BadVolume(format!(
                    "chain entry {} out of range: {:?}",
                    index, entry
                )));
            }
        }
        Ok(Self {
            start_block,
            blocks,
            block_size: block_device.block_size(),
            entries,
        })
    }

    /// Write the whole region through to the device
    pub fn sync(&self, block_device: &dyn BlockDevice) -> SfsResult<()> {
        let mut raw = vec![0u8; self.blocks * self.block_size];
        for (entry, slot) in self.entries.iter().zip(raw.chunks_exact_mut(CHAIN_ENTRY_SZ)) {
            entry.encode(slot);
        }
        block_device.write_blocks(self.start_block, &raw)
    }

    /// First free slot; nothing is reserved until a data block is attached
    pub fn allocate_index(&self) -> SfsResult<ChainIndex> {
        self.entries
            .iter()
            .position(ChainEntry::is_free)
            .map(|index| index as ChainIndex)
            .ok_or(SfsError::Full(Resource::ChainIndex))
    }

    /// Take a free slot and a data block together. The slot only counts as
    /// used once `data_block` is set, so a failed block allocation leaves
    /// the table untouched.
    fn claim(
        &mut self,
        bitmap: &mut Bitmap,
        block_device: &dyn BlockDevice,
    ) -> SfsResult<ChainIndex> {
        let index = self.allocate_index()?;
        let block = bitmap.alloc(block_device)?;
        // scrub so skipped-over bytes read as zero
        let zeros = vec![0u8; self.block_size];
        let data_region_start = self.start_block + self.blocks;
        if let Err(err) = block_device.write_blocks(data_region_start + block as usize, &zeros) {
            bitmap.dealloc(block_device, block)?;
            return Err(err);
        }
        self.entries[index as usize] = ChainEntry {
            data_block: block,
            next: NONE,
        };
        Ok(index)
    }

    /// Give back a claimed slot whose table write failed
    fn unclaim(&mut self, index: ChainIndex, bitmap: &mut Bitmap, block_device: &dyn BlockDevice) {
        let block = self.entries[index as usize].data_block;
        self.entries[index as usize] = ChainEntry::EMPTY;
        if let Err(err) = bitmap.dealloc(block_device, block) {
            log::warn!("data block {} still marked in use: {}", block, err);
        }
    }

    /// Start a new one-block chain, returning its head
    pub fn start_chain(
        &mut self,
        bitmap: &mut Bitmap,
        block_device: &dyn BlockDevice,
    ) -> SfsResult<ChainIndex> {
        let head = self.claim(bitmap, block_device)?;
        if let Err(err) = self.sync(block_device) {
            self.unclaim(head, bitmap, block_device);
            return Err(err);
        }
        log::debug!(
            "chain {} started at data block {}",
            head,
            self.entries[head as usize].data_block
        );
        Ok(head)
    }

    /// Append one block after `tail`, which must be the end of its chain
    pub fn extend(
        &mut self,
        tail: ChainIndex,
        bitmap: &mut Bitmap,
        block_device: &dyn BlockDevice,
    ) -> SfsResult<ChainIndex> {
        debug_assert_eq!(self.entries[tail as usize].next, NONE);
        let index = self.claim(bitmap, block_device)?;
        self.entries[tail as usize].next = index;
        if let Err(err) = self.sync(block_device) {
            self.entries[tail as usize].next = NONE;
            self.unclaim(index, bitmap, block_device);
            return Err(err);
        }
        log::debug!("chain extended {} -> {}", tail, index);
        Ok(index)
    }

    /// Free every block on the chain starting at `head`. The chain is walked
    /// in full before anything is freed, so a corrupt chain stays as it was.
    pub fn release_chain(
        &mut self,
        head: ChainIndex,
        bitmap: &mut Bitmap,
        block_device: &dyn BlockDevice,
    ) -> SfsResult<()> {
        let slots = self.walk(head)?;
        for &index in &slots {
            bitmap.dealloc(block_device, self.entries[index as usize].data_block)?;
            self.entries[index as usize] = ChainEntry::EMPTY;
        }
        self.sync(block_device)?;
        log::debug!("chain {} released, {} blocks freed", head, slots.len());
        Ok(())
    }

    /// Walk `offset / block_size` links from `head`, returning the slot that
    /// holds byte `offset` and the offset inside its block.
    pub fn resolve(&self, head: ChainIndex, offset: usize) -> SfsResult<(ChainIndex, usize)> {
        let mut current = head;
        for _ in 0..offset / self.block_size {
            current = self.next(current)?;
            if current == NONE {
                return Err(SfsError::corrupt(head, format!("chain ends before byte {}", offset)));
            }
        }
        self.entry(current)?;
        Ok((current, offset % self.block_size))
    }

    /// Successor of a used slot (`NONE` at the end of the chain)
    pub fn next(&self, index: ChainIndex) -> SfsResult<ChainIndex> {
        Ok(self.entry(index)?.next)
    }

    /// Data block held by a used slot
    pub fn data_block(&self, index: ChainIndex) -> SfsResult<BlockNumber> {
        Ok(self.entry(index)?.data_block)
    }

    fn entry(&self, index: ChainIndex) -> SfsResult<ChainEntry> {
        match self.entries.get(index as usize) {
            Some(entry) if !entry.is_free() => Ok(*entry),
            _ => Err(SfsError::corrupt(index, "link to an unused chain slot")),
        }
    }

    /// Slots on the chain from `head`, in order, guarding against cycles
    pub fn walk(&self, head: ChainIndex) -> SfsResult<Vec<ChainIndex>> {
        let mut visited = Vec::new();
        let mut current = head;
        while current != NONE {
            if visited.len() == self.entries.len() {
                return Err(SfsError::corrupt(head, "chain does not terminate"));
            }
            visited.push(current);
            current = self.next(current)?;
        }
        Ok(visited)
    }

    /// Slots that are in use, in index order
    pub fn used(&self) -> impl Iterator<Item = (ChainIndex, &ChainEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_free())
            .map(|(index, entry)| (index as ChainIndex, entry))
    }

    #[cfg(test)]
    pub(crate) fn link(&mut self, from: ChainIndex, to: ChainIndex) {
        self.entries[from as usize].next = to;
    }
}
