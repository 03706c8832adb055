//! Open-file table and the cursor based read/write/seek algorithms.
use alloc::{vec, vec::Vec};

use crate::{
    block_dev::BlockDevice,
    sfs::{SimpleFileSystem, Volume},
    ChainIndex, SfsError, SfsResult, NAME_LENGTH_LIMIT, NONE,
};

/// Identifier of an open file, valid until it is closed.
///
/// Identifiers are small integers; a closed identifier is handed out again
/// by a later open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileHandle(usize);

impl FileHandle {
    /// Slot number of this handle
    pub fn id(&self) -> usize {
        self.0
    }
}

/// Cursor state of an open file. Reads and writes keep separate positions,
/// `seek` moves both.
#[derive(Clone, Copy, Debug)]
pub(crate) struct OpenFile {
    read_pos: u32,
    write_pos: u32,
    cached_size: u32,
    head: ChainIndex,
    // set when the file is removed underneath the handle
    stale: bool,
}

impl OpenFile {
    fn new(head: ChainIndex, size: u32) -> Self {
        Self {
            read_pos: 0,
            write_pos: size,
            cached_size: size,
            head,
            stale: false,
        }
    }
}

/// Handles keyed by slot, reusing the lowest closed slot first
#[derive(Default)]
pub(crate) struct HandleTable {
    slots: Vec<Option<OpenFile>>,
}

impl HandleTable {
    fn insert(&mut self, file: OpenFile) -> FileHandle {
        match self.slots.iter().position(Option::is_none) {
            Some(id) => {
                self.slots[id] = Some(file);
                FileHandle(id)
            }
            None => {
                self.slots.push(Some(file));
                FileHandle(self.slots.len() - 1)
            }
        }
    }

    fn find_by_head(&self, head: ChainIndex) -> Option<FileHandle> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |f| !f.stale && f.head == head))
            .map(FileHandle)
    }

    fn get(&self, handle: FileHandle) -> SfsResult<&OpenFile> {
        self.slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(SfsError::InvalidHandle(handle.0))
    }

    /// An open handle whose file still exists
    fn live(&self, handle: FileHandle) -> SfsResult<OpenFile> {
        let file = self.get(handle)?;
        if file.stale {
            log::warn!("handle {} used after its file was removed", handle.0);
            return Err(SfsError::StaleHandle(handle.0));
        }
        Ok(*file)
    }

    fn live_mut(&mut self, handle: FileHandle) -> SfsResult<&mut OpenFile> {
        self.live(handle)?;
        self.slots[handle.0]
            .as_mut()
            .ok_or(SfsError::InvalidHandle(handle.0))
    }

    fn remove(&mut self, handle: FileHandle) -> SfsResult<()> {
        self.get(handle)?;
        self.slots[handle.0] = None;
        Ok(())
    }

    /// Every handle on the chain at `head` now refers to a removed file
    pub(crate) fn mark_stale(&mut self, head: ChainIndex) {
        for file in self.slots.iter_mut().flatten() {
            if file.head == head {
                file.stale = true;
            }
        }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.slots.iter().flatten().filter(|file| !file.stale).count()
    }
}

pub(crate) fn check_name(name: &str) -> SfsResult<()> {
    if name.len() > NAME_LENGTH_LIMIT {
        return Err(SfsError::NameTooLong {
            name: name.into(),
            limit: NAME_LENGTH_LIMIT,
        });
    }
    if name.is_empty() || name.contains('\0') {
        return Err(SfsError::InvalidName(name.into()));
    }
    Ok(())
}

impl Volume {
    fn open(&mut self, block_device: &dyn BlockDevice, name: &str) -> SfsResult<FileHandle> {
        if let Some(slot) = self.directory.find(name) {
            let entry = self.directory.entry(slot);
            if let Some(handle) = self.handles.find_by_head(entry.head) {
                return Ok(handle);
            }
            return Ok(self.handles.insert(OpenFile::new(entry.head, entry.size)));
        }
        // claim the directory slot's availability before touching the chain table
        self.directory.find_free_slot()?;
        let head = self.chain.start_chain(&mut self.bitmap, block_device)?;
        if let Err(err) = self.directory.create(name, head, block_device) {
            self.chain.release_chain(head, &mut self.bitmap, block_device)?;
            return Err(err);
        }
        log::debug!("created {:?} with chain head {}", name, head);
        Ok(self.handles.insert(OpenFile::new(head, 0)))
    }

    fn next_or_extend(
        &mut self,
        block_device: &dyn BlockDevice,
        current: ChainIndex,
    ) -> SfsResult<ChainIndex> {
        match self.chain.next(current)? {
            NONE => self.chain.extend(current, &mut self.bitmap, block_device),
            next => Ok(next),
        }
    }

    fn read(
        &mut self,
        block_device: &dyn BlockDevice,
        handle: FileHandle,
        length: usize,
    ) -> SfsResult<Vec<u8>> {
        let file = self.handles.live(handle)?;
        let block_size = self.geometry.block_size;
        let len = length.min(file.cached_size.saturating_sub(file.read_pos) as usize);
        let mut out = Vec::with_capacity(len);
        if len > 0 {
            let (mut current, mut offset) = self.chain.resolve(file.head, file.read_pos as usize)?;
            let mut block = vec![0u8; block_size];
            loop {
                let n = (block_size - offset).min(len - out.len());
                let block_id = self.geometry.data_block_id(self.chain.data_block(current)?);
                log::trace!("read {} bytes from block {}", n, block_id);
                block_device.read_blocks(block_id, &mut block)?;
                out.extend_from_slice(&block[offset..offset + n]);
                if out.len() == len {
                    break;
                }
                current = self.chain.next(current)?;
                if current == NONE {
                    return Err(SfsError::corrupt(file.head, "chain shorter than recorded size"));
                }
                offset = 0;
            }
        }
        self.handles.live_mut(handle)?.read_pos += len as u32;
        Ok(out)
    }

    fn write(
        &mut self,
        block_device: &dyn BlockDevice,
        handle: FileHandle,
        buf: &[u8],
    ) -> SfsResult<usize> {
        let file = self.handles.live(handle)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let start = file.write_pos as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= u32::MAX as usize)
            .ok_or(SfsError::FileTooLarge)?;
        let block_size = self.geometry.block_size;

        // grow through any gap left by a seek past the end; new blocks are zeroed
        let mut current = file.head;
        for _ in 0..start / block_size {
            current = self.next_or_extend(block_device, current)?;
        }

        let mut offset = start % block_size;
        let mut written = 0;
        let mut block = vec![0u8; block_size];
        loop {
            let n = (block_size - offset).min(buf.len() - written);
            let block_id = self.geometry.data_block_id(self.chain.data_block(current)?);
            if n < block_size {
                block_device.read_blocks(block_id, &mut block)?;
            }
            block[offset..offset + n].copy_from_slice(&buf[written..written + n]);
            log::trace!("write {} bytes to block {}", n, block_id);
            block_device.write_blocks(block_id, &block)?;
            written += n;
            if written == buf.len() {
                break;
            }
            // blocks already written stay written if this fails
            current = self.next_or_extend(block_device, current)?;
            offset = 0;
        }

        let file = self.handles.live_mut(handle)?;
        file.write_pos = end as u32;
        if file.write_pos > file.cached_size {
            file.cached_size = file.write_pos;
            let (head, size) = (file.head, file.cached_size);
            if let Some(slot) = self.directory.find_by_head(head) {
                self.directory.update_size(slot, size, block_device)?;
            }
        }
        Ok(written)
    }
}

impl SimpleFileSystem {
    /// Open `name`, creating an empty file if it does not exist.
    ///
    /// Opening a file that is already open returns the handle it was opened
    /// with. A fresh handle reads from the start and writes at the end.
    pub fn open(&mut self, name: &str) -> SfsResult<FileHandle> {
        check_name(name)?;
        let (volume, block_device) = self.parts()?;
        volume.open(block_device, name)
    }

    /// Release a handle
    pub fn close(&mut self, handle: FileHandle) -> SfsResult<()> {
        let (volume, _) = self.parts()?;
        volume.handles.remove(handle)
    }

    /// Read up to `length` bytes at the read cursor. Returns fewer bytes,
    /// possibly none, when the cursor is near or at the end of the file.
    pub fn read(&mut self, handle: FileHandle, length: usize) -> SfsResult<Vec<u8>> {
        let (volume, block_device) = self.parts()?;
        volume.read(block_device, handle, length)
    }

    /// Write all of `buf` at the write cursor, growing the file as needed.
    ///
    /// If the volume fills up part way, the blocks written so far keep their
    /// new contents but neither the cursor nor the file size move.
    pub fn write(&mut self, handle: FileHandle, buf: &[u8]) -> SfsResult<usize> {
        let (volume, block_device) = self.parts()?;
        volume.write(block_device, handle, buf)
    }

    /// Move both the read and the write cursor to `offset`
    pub fn seek(&mut self, handle: FileHandle, offset: u32) -> SfsResult<()> {
        let (volume, _) = self.parts()?;
        let file = volume.handles.live_mut(handle)?;
        file.read_pos = offset;
        file.write_pos = offset;
        Ok(())
    }
}
