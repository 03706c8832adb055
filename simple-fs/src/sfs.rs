use alloc::{format, string::String, sync::Arc, vec, vec::Vec};

use crate::{
    bitmap::Bitmap,
    block_dev::BlockDevice,
    chain::ChainTable,
    directory::Directory,
    layout::{FormatOptions, Geometry, DESCRIPTOR_BLOCK},
    vfs::HandleTable,
    SfsError, SfsResult,
};

/// Everything that exists only while a volume is mounted
pub(crate) struct Volume {
    pub(crate) geometry: Geometry,
    pub(crate) bitmap: Bitmap,
    pub(crate) chain: ChainTable,
    pub(crate) directory: Directory,
    pub(crate) handles: HandleTable,
}

/// The volume manager: owns the device and, once mounted, the in-memory
/// mirrors of every metadata region plus the open-file table.
///
/// ```text
/// unmounted --format_and_mount/mount--> mounted --unmount--> unmounted
/// ```
///
/// Every call on an unmounted volume fails with [`SfsError::NotMounted`].
/// One value owns the device; callers that share it across threads must
/// serialize access themselves.
pub struct SimpleFileSystem {
    block_device: Arc<dyn BlockDevice>,
    volume: Option<Volume>,
}

impl SimpleFileSystem {
    /// Wrap a device without touching it
    pub fn new(block_device: Arc<dyn BlockDevice>) -> Self {
        Self {
            block_device,
            volume: None,
        }
    }

    /// Format `block_device` and mount the fresh volume
    pub fn create(block_device: Arc<dyn BlockDevice>, options: FormatOptions) -> SfsResult<Self> {
        let mut fs = Self::new(block_device);
        fs.format_and_mount(options)?;
        Ok(fs)
    }

    /// Mount the volume already on `block_device`
    pub fn load(block_device: Arc<dyn BlockDevice>) -> SfsResult<Self> {
        let mut fs = Self::new(block_device);
        fs.mount()?;
        Ok(fs)
    }

    /// Lay down an empty volume and mount it. Anything mounted before is
    /// dropped, including its open handles.
    pub fn format_and_mount(&mut self, options: FormatOptions) -> SfsResult<()> {
        self.volume = None;
        let dev = self.block_device.as_ref();
        let geometry = Geometry::plan(dev.block_size(), dev.total_blocks(), options)?;
        let bitmap = Bitmap::new_free(
            geometry.bitmap_block,
            geometry.block_size,
            geometry.data_blocks,
        );
        let directory = Directory::new_empty(
            geometry.directory_start,
            geometry.directory_blocks,
            geometry.block_size,
        );
        let chain = ChainTable::new_empty(
            geometry.chain_table_start,
            geometry.chain_table_blocks,
            geometry.block_size,
            geometry.data_blocks,
        );
        bitmap.sync(dev)?;
        directory.sync(dev)?;
        chain.sync(dev)?;
        // descriptor last, so a half-written format never mounts
        dev.write_blocks(DESCRIPTOR_BLOCK, &geometry.encode())?;
        log::debug!("formatted {:?}", geometry);
        self.volume = Some(Volume {
            geometry,
            bitmap,
            chain,
            directory,
            handles: HandleTable::default(),
        });
        Ok(())
    }

    /// Read the descriptor and metadata regions into memory
    pub fn mount(&mut self) -> SfsResult<()> {
        self.volume = None;
        let dev = self.block_device.as_ref();
        let geometry = Geometry::decode(&dev.read_to_vec(DESCRIPTOR_BLOCK, 1)?)?;
        if geometry.block_size != dev.block_size() || geometry.total_blocks != dev.total_blocks() {
            log::warn!(
                "descriptor says {} x {}B, device is {} x {}B",
                geometry.total_blocks,
                geometry.block_size,
                dev.total_blocks(),
                dev.block_size()
            );
            return Err(SfsError::BadVolume(format!(
                "volume was formatted as {} blocks of {} bytes, device has {} blocks of {} bytes",
                geometry.total_blocks,
                geometry.block_size,
                dev.total_blocks(),
                dev.block_size()
            )));
        }
        let bitmap = Bitmap::load(geometry.bitmap_block, geometry.data_blocks, dev)?;
        let directory = Directory::load(geometry.directory_start, geometry.directory_blocks, dev)?;
        let chain = ChainTable::load(
            geometry.chain_table_start,
            geometry.chain_table_blocks,
            geometry.data_blocks,
            dev,
        )?;
        log::debug!(
            "mounted {} files, {} of {} data blocks free",
            directory.iter().count(),
            bitmap.free_count(),
            geometry.data_blocks
        );
        self.volume = Some(Volume {
            geometry,
            bitmap,
            chain,
            directory,
            handles: HandleTable::default(),
        });
        Ok(())
    }

    /// Drop the in-memory state. Metadata is already on the device.
    pub fn unmount(&mut self) {
        if let Some(volume) = self.volume.take() {
            log::debug!("unmounted with {} handles open", volume.handles.open_count());
        }
    }

    /// Whether a volume is mounted
    pub fn is_mounted(&self) -> bool {
        self.volume.is_some()
    }

    /// The device this file system lives on
    pub fn block_device(&self) -> &Arc<dyn BlockDevice> {
        &self.block_device
    }

    pub(crate) fn volume(&self) -> SfsResult<&Volume> {
        self.volume.as_ref().ok_or(SfsError::NotMounted)
    }

    pub(crate) fn parts(&mut self) -> SfsResult<(&mut Volume, &dyn BlockDevice)> {
        let volume = self.volume.as_mut().ok_or(SfsError::NotMounted)?;
        Ok((volume, self.block_device.as_ref()))
    }

    /// Geometry of the mounted volume
    pub fn geometry(&self) -> SfsResult<Geometry> {
        Ok(self.volume()?.geometry)
    }

    /// `(name, size)` of every file, in directory slot order
    pub fn list(&self) -> SfsResult<Vec<(String, u32)>> {
        Ok(self.volume()?.directory.list())
    }

    /// Recorded size of `name`
    pub fn file_size(&self, name: &str) -> SfsResult<u32> {
        let directory = &self.volume()?.directory;
        directory
            .find(name)
            .map(|slot| directory.entry(slot).size)
            .ok_or_else(|| SfsError::NotFound(name.into()))
    }

    /// Number of unallocated data blocks
    pub fn free_blocks(&self) -> SfsResult<usize> {
        Ok(self.volume()?.bitmap.free_count())
    }

    /// Delete `name` and free its blocks. Handles still open on it turn stale.
    /// A file whose chain is corrupt is left in place.
    pub fn remove(&mut self, name: &str) -> SfsResult<()> {
        let (volume, dev) = self.parts()?;
        let slot = volume
            .directory
            .find(name)
            .ok_or_else(|| SfsError::NotFound(name.into()))?;
        let head = volume.directory.entry(slot).head;
        volume.chain.release_chain(head, &mut volume.bitmap, dev)?;
        volume.handles.mark_stale(head);
        volume.directory.clear(slot, dev)?;
        log::debug!("removed {:?}", name);
        Ok(())
    }

    /// Audit the metadata: every file's chain terminates, no chain slot or
    /// data block belongs to two files, recorded sizes fit their chains, and
    /// the bitmap's allocated set is exactly the set of blocks reachable from
    /// the directory.
    pub fn check(&self) -> SfsResult<()> {
        let volume = self.volume()?;
        let geometry = &volume.geometry;
        let mut owned = vec![false; geometry.data_blocks];
        let mut reachable = vec![false; geometry.data_blocks];
        for entry in volume.directory.iter() {
            let slots = volume.chain.walk(entry.head)?;
            if (entry.size as usize) > slots.len() * geometry.block_size {
                return Err(SfsError::corrupt(
                    entry.head,
                    format!(
                        "{:?} is {} bytes but owns {} blocks",
                        entry.name,
                        entry.size,
                        slots.len()
                    ),
                ));
            }
            for index in slots {
                if core::mem::replace(&mut owned[index as usize], true) {
                    return Err(SfsError::corrupt(index, "slot shared by two chains"));
                }
                let block = volume.chain.data_block(index)?;
                if core::mem::replace(&mut reachable[block as usize], true) {
                    let detail = format!("block {} referenced twice", block);
                    return Err(SfsError::corrupt(index, detail));
                }
                if volume.bitmap.is_free(block) {
                    let detail = format!("block {} in use but marked free", block);
                    return Err(SfsError::corrupt(index, detail));
                }
            }
        }
        if let Some((index, _)) = volume.chain.used().find(|(index, _)| !owned[*index as usize]) {
            return Err(SfsError::corrupt(index, "slot in use but owned by no file"));
        }
        let leaked = (0..geometry.data_blocks)
            .find(|b| !reachable[*b] && !volume.bitmap.is_free(*b as u32));
        if let Some(block) = leaked {
            return Err(SfsError::corrupt(
                crate::NONE,
                format!("block {} allocated but unreachable", block),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryDevice, Resource};
    use alloc::string::ToString;
    use rand::{Rng, RngCore};

    fn device(block_size: usize, data_blocks: usize, options: FormatOptions) -> Arc<MemoryDevice> {
        let total = Geometry::for_data_blocks(block_size, data_blocks, options);
        Arc::new(MemoryDevice::new(block_size, total))
    }

    #[test]
    fn unmounted_volume_rejects_everything() {
        let mut fs = SimpleFileSystem::new(Arc::new(MemoryDevice::new(256, 64)));
        assert_eq!(fs.open("a"), Err(SfsError::NotMounted));
        assert_eq!(fs.list(), Err(SfsError::NotMounted));
        assert_eq!(fs.remove("a"), Err(SfsError::NotMounted));
        assert!(!fs.is_mounted());
        fs.format_and_mount(FormatOptions::default()).unwrap();
        let fd = fs.open("a").unwrap();
        fs.unmount();
        assert_eq!(fs.write(fd, b"x"), Err(SfsError::NotMounted));
    }

    #[test]
    fn blank_device_does_not_mount() {
        let dev = Arc::new(MemoryDevice::new(256, 64));
        assert!(matches!(SimpleFileSystem::load(dev), Err(SfsError::BadVolume(_))));
    }

    #[test]
    fn geometry_mismatch_is_a_bad_volume() {
        let options = FormatOptions { directory_blocks: 2 };
        let dev = device(256, 32, options);
        SimpleFileSystem::create(dev.clone(), options).unwrap();
        // same bytes behind a device that claims to be larger
        let bigger = Arc::new(MemoryDevice::new(256, dev.total_blocks() + 8));
        bigger.write_blocks(0, &dev.snapshot()).unwrap();
        assert!(matches!(SimpleFileSystem::load(bigger), Err(SfsError::BadVolume(_))));
    }

    #[test]
    fn remount_reproduces_names_sizes_and_contents() {
        let mut rng = rand::thread_rng();
        let options = FormatOptions { directory_blocks: 2 };
        let dev = device(512, 400, options);
        let mut fs = SimpleFileSystem::create(dev.clone(), options).unwrap();
        let mut files = Vec::new();
        for i in 0..12 {
            let name = format!("file{}.bin", i);
            let mut content = vec![0u8; rng.gen_range(0..8 * 512)];
            rng.fill_bytes(&mut content);
            let fd = fs.open(&name).unwrap();
            fs.write(fd, &content).unwrap();
            fs.close(fd).unwrap();
            files.push((name, content));
        }
        let before = fs.list().unwrap();
        let free = fs.free_blocks().unwrap();
        drop(fs);

        let mut fs = SimpleFileSystem::load(dev).unwrap();
        assert_eq!(fs.list().unwrap(), before);
        assert_eq!(fs.free_blocks().unwrap(), free);
        fs.check().unwrap();
        for (name, content) in &files {
            assert_eq!(fs.file_size(name).unwrap() as usize, content.len());
            let fd = fs.open(name).unwrap();
            assert_eq!(&fs.read(fd, content.len() + 10).unwrap(), content);
        }
    }

    #[test]
    fn create_persists_before_first_write() {
        let options = FormatOptions { directory_blocks: 1 };
        let dev = device(256, 16, options);
        let mut fs = SimpleFileSystem::create(dev.clone(), options).unwrap();
        fs.open("empty").unwrap();
        let fs = SimpleFileSystem::load(dev).unwrap();
        assert_eq!(fs.list().unwrap(), [("empty".to_string(), 0)]);
        assert_eq!(fs.free_blocks().unwrap(), 15);
        fs.check().unwrap();
    }

    #[test]
    fn remove_frees_blocks_and_name() {
        let options = FormatOptions { directory_blocks: 1 };
        let mut fs = SimpleFileSystem::create(device(256, 32, options), options).unwrap();
        let fd = fs.open("a").unwrap();
        fs.write(fd, &[5u8; 1000]).unwrap();
        fs.open("b").unwrap();
        assert_eq!(fs.free_blocks().unwrap(), 27);
        fs.remove("a").unwrap();
        assert_eq!(fs.free_blocks().unwrap(), 31);
        assert_eq!(fs.file_size("a"), Err(SfsError::NotFound("a".into())));
        // slot 0 and block 0 come back first
        let fd = fs.open("a").unwrap();
        assert_eq!(fs.list().unwrap()[0], ("a".to_string(), 0));
        assert_eq!(fs.read(fd, 10).unwrap(), b"");
        fs.check().unwrap();
    }

    #[test]
    fn removing_a_missing_file_changes_nothing() {
        let options = FormatOptions { directory_blocks: 1 };
        let dev = device(256, 16, options);
        let mut fs = SimpleFileSystem::create(dev.clone(), options).unwrap();
        let fd = fs.open("keep").unwrap();
        fs.write(fd, b"data").unwrap();
        let image = dev.snapshot();
        assert_eq!(fs.remove("ghost"), Err(SfsError::NotFound("ghost".into())));
        assert_eq!(dev.snapshot(), image);
        assert_eq!(fs.list().unwrap().len(), 1);
    }

    #[test]
    fn directory_exhaustion_leaks_nothing() {
        let options = FormatOptions { directory_blocks: 1 };
        // 64 / 24 = 2 directory slots
        let mut fs = SimpleFileSystem::create(device(64, 16, options), options).unwrap();
        fs.open("a").unwrap();
        fs.open("b").unwrap();
        assert_eq!(fs.open("c"), Err(SfsError::Full(Resource::Directory)));
        assert_eq!(fs.free_blocks().unwrap(), 14);
        fs.check().unwrap();
    }

    #[test]
    fn bitmap_matches_reachable_blocks_under_random_churn() {
        let mut rng = rand::thread_rng();
        let options = FormatOptions { directory_blocks: 2 };
        let mut fs = SimpleFileSystem::create(device(128, 96, options), options).unwrap();
        let names = ["a", "b", "c", "d", "e", "f"];
        for _ in 0..300 {
            let name = names[rng.gen_range(0..names.len())];
            match rng.gen_range(0..3) {
                0 => {
                    let _ = fs.remove(name);
                }
                _ => {
                    let fd = match fs.open(name) {
                        Ok(fd) => fd,
                        Err(SfsError::Full(_)) => continue,
                        Err(err) => panic!("{}", err),
                    };
                    let chunk = vec![rng.gen::<u8>(); rng.gen_range(0..700)];
                    match fs.write(fd, &chunk) {
                        Ok(_) | Err(SfsError::Full(_)) => {}
                        Err(err) => panic!("{}", err),
                    }
                    if rng.gen_bool(0.5) {
                        fs.close(fd).unwrap();
                    }
                }
            }
            fs.check().unwrap();

            let volume = fs.volume().unwrap();
            let mut reachable: Vec<u32> = volume
                .directory
                .iter()
                .flat_map(|entry| volume.chain.walk(entry.head).unwrap())
                .map(|index| volume.chain.data_block(index).unwrap())
                .collect();
            reachable.sort_unstable();
            let allocated: Vec<u32> = (0..96u32).filter(|b| !volume.bitmap.is_free(*b)).collect();
            assert_eq!(reachable, allocated);
        }
    }

    #[test]
    fn audit_catches_a_cycle() {
        let options = FormatOptions { directory_blocks: 1 };
        let mut fs = SimpleFileSystem::create(device(64, 16, options), options).unwrap();
        let fd = fs.open("loop").unwrap();
        fs.write(fd, &[1u8; 200]).unwrap();
        fs.check().unwrap();
        let (volume, _) = fs.parts().unwrap();
        volume.chain.link(3, 0);
        assert!(matches!(fs.check(), Err(SfsError::CorruptChain { .. })));
    }

    #[test]
    fn removing_a_looped_file_leaves_everything_in_place() {
        let options = FormatOptions { directory_blocks: 1 };
        let mut fs = SimpleFileSystem::create(device(64, 16, options), options).unwrap();
        let fd = fs.open("loop").unwrap();
        fs.write(fd, &[1u8; 200]).unwrap();
        let (volume, _) = fs.parts().unwrap();
        volume.chain.link(3, 0);
        let audit = fs.check();
        assert!(matches!(audit, Err(SfsError::CorruptChain { index: 0, .. })));

        assert!(matches!(fs.remove("loop"), Err(SfsError::CorruptChain { .. })));
        assert_eq!(fs.list().unwrap(), [("loop".to_string(), 200)]);
        assert_eq!(fs.free_blocks().unwrap(), 12);
        // the next file must not land on the looped slots
        fs.open("new").unwrap();
        let volume = fs.volume().unwrap();
        let heads: Vec<u32> = volume.directory.iter().map(|entry| entry.head).collect();
        assert_eq!(heads, [0, 4]);
        assert_eq!(fs.check(), audit);
    }

    #[test]
    fn audit_catches_a_leaked_block() {
        let options = FormatOptions { directory_blocks: 1 };
        let mut fs = SimpleFileSystem::create(device(64, 16, options), options).unwrap();
        fs.open("f").unwrap();
        let (volume, dev) = fs.parts().unwrap();
        volume.bitmap.alloc(dev).unwrap();
        assert!(matches!(fs.check(), Err(SfsError::CorruptChain { .. })));
    }
}
