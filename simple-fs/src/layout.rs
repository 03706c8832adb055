use alloc::{
    format,
    string::{String, ToString},
    vec,
    vec::Vec,
};

use crate::{
    BlockNumber, ChainIndex, SfsError, SfsResult, DEFAULT_DIRECTORY_BLOCKS, NAME_LENGTH_LIMIT,
    NONE,
};

/// Magic number for sanity check
const SFS_MAGIC: u32 = 0x5346_5331;
/// Block holding the volume descriptor
pub const DESCRIPTOR_BLOCK: usize = 0;
/// Block holding the free-space bitmap
pub const BITMAP_BLOCK: usize = 1;
/// Size of the encoded descriptor (10 * u32)
const DESCRIPTOR_SZ: usize = 40;
/// Smallest block size that fits a descriptor and keeps entries aligned
const MIN_BLOCK_SZ: usize = 64;
/// Bytes reserved for a name inside a directory entry, NUL padded
const NAME_FIELD_SZ: usize = 16;
/// Size of a directory entry: name + size + head
pub const DIRENT_SZ: usize = NAME_FIELD_SZ + 8;
/// Size of a chain entry: data block + next
pub const CHAIN_ENTRY_SZ: usize = 8;

pub(crate) fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Knobs fixed when a volume is formatted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatOptions {
    /// Blocks given to the directory region
    pub directory_blocks: usize,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            directory_blocks: DEFAULT_DIRECTORY_BLOCKS,
        }
    }
}

/// Volume geometry, as recorded in the descriptor (block 0).
///
/// Layout, in block order:
/// descriptor | bitmap | directory region | chain table region | data region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Bytes per block
    pub block_size: usize,
    /// Blocks on the whole device
    pub total_blocks: usize,
    /// Block holding the bitmap
    pub bitmap_block: usize,
    /// First directory block
    pub directory_start: usize,
    /// Number of directory blocks
    pub directory_blocks: usize,
    /// First chain table block
    pub chain_table_start: usize,
    /// Number of chain table blocks
    pub chain_table_blocks: usize,
    /// First data block
    pub data_region_start: usize,
    /// Number of data blocks, also the number of chain entries
    pub data_blocks: usize,
}

fn chain_table_blocks_for(block_size: usize, data_blocks: usize) -> usize {
    (data_blocks * CHAIN_ENTRY_SZ).div_ceil(block_size)
}

fn check_block_size(block_size: usize) -> SfsResult<()> {
    if block_size < MIN_BLOCK_SZ || block_size % 8 != 0 {
        return Err(SfsError::BadVolume(format!(
            "unsupported block size {}",
            block_size
        )));
    }
    Ok(())
}

impl Geometry {
    /// Lay out a device of `total_blocks` blocks, giving the data region as
    /// many blocks as fit once its chain table is accounted for.
    pub fn plan(block_size: usize, total_blocks: usize, options: FormatOptions) -> SfsResult<Self> {
        check_block_size(block_size)?;
        if options.directory_blocks == 0 {
            return Err(SfsError::BadVolume("directory needs at least one block".to_string()));
        }
        let directory_start = BITMAP_BLOCK + 1;
        let available = total_blocks.saturating_sub(directory_start + options.directory_blocks);
        let cost = |n: usize| n + chain_table_blocks_for(block_size, n);
        // one bitmap block caps the data region
        let mut data_blocks = (available * block_size / (block_size + CHAIN_ENTRY_SZ))
            .min(block_size * 8);
        while data_blocks > 0 && cost(data_blocks) > available {
            data_blocks -= 1;
        }
        while data_blocks < block_size * 8 && cost(data_blocks + 1) <= available {
            data_blocks += 1;
        }
        if data_blocks == 0 {
            return Err(SfsError::BadVolume(format!(
                "{} blocks of {} bytes leave no room for data",
                total_blocks, block_size
            )));
        }
        let chain_table_start = directory_start + options.directory_blocks;
        let chain_table_blocks = chain_table_blocks_for(block_size, data_blocks);
        Ok(Self {
            block_size,
            total_blocks,
            bitmap_block: BITMAP_BLOCK,
            directory_start,
            directory_blocks: options.directory_blocks,
            chain_table_start,
            chain_table_blocks,
            data_region_start: chain_table_start + chain_table_blocks,
            data_blocks,
        })
    }

    /// Device size needed for exactly `data_blocks` data blocks.
    pub fn for_data_blocks(block_size: usize, data_blocks: usize, options: FormatOptions) -> usize {
        BITMAP_BLOCK
            + 1
            + options.directory_blocks
            + chain_table_blocks_for(block_size, data_blocks)
            + data_blocks
    }

    /// Directory slots that fit in the directory region
    pub fn directory_capacity(&self) -> usize {
        self.directory_blocks * (self.block_size / DIRENT_SZ)
    }

    /// Absolute device block of a data block
    pub fn data_block_id(&self, block: BlockNumber) -> usize {
        self.data_region_start + block as usize
    }

    /// Encode as a full descriptor block
    pub fn encode(&self) -> Vec<u8> {
        let mut block = vec![0u8; self.block_size];
        let fields = [
            SFS_MAGIC,
            self.block_size as u32,
            self.total_blocks as u32,
            self.bitmap_block as u32,
            self.directory_start as u32,
            self.directory_blocks as u32,
            self.chain_table_start as u32,
            self.chain_table_blocks as u32,
            self.data_region_start as u32,
            self.data_blocks as u32,
        ];
        for (i, field) in fields.iter().enumerate() {
            put_u32(&mut block, i * 4, *field);
        }
        block
    }

    /// Decode a descriptor block and check its internal arithmetic
    pub fn decode(block: &[u8]) -> SfsResult<Self> {
        if block.len() < DESCRIPTOR_SZ || get_u32(block, 0) != SFS_MAGIC {
            return Err(SfsError::BadVolume("missing volume descriptor".to_string()));
        }
        let field = |i: usize| get_u32(block, i * 4) as usize;
        let geometry = Self {
            block_size: field(1),
            total_blocks: field(2),
            bitmap_block: field(3),
            directory_start: field(4),
            directory_blocks: field(5),
            chain_table_start: field(6),
            chain_table_blocks: field(7),
            data_region_start: field(8),
            data_blocks: field(9),
        };
        check_block_size(geometry.block_size)?;
        let consistent = geometry.bitmap_block == BITMAP_BLOCK
            && geometry.directory_start == BITMAP_BLOCK + 1
            && geometry.directory_blocks > 0
            && geometry.chain_table_start == geometry.directory_start + geometry.directory_blocks
            && geometry.data_region_start
                == geometry.chain_table_start + geometry.chain_table_blocks
            && geometry.chain_table_blocks
                == chain_table_blocks_for(geometry.block_size, geometry.data_blocks)
            && geometry.data_blocks > 0
            && geometry.data_blocks <= geometry.block_size * 8
            && geometry.data_region_start + geometry.data_blocks <= geometry.total_blocks;
        if !consistent {
            return Err(SfsError::BadVolume(format!(
                "descriptor regions do not add up: {:?}",
                geometry
            )));
        }
        Ok(geometry)
    }
}

/// A directory entry. An empty name marks a free slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u32,
    pub head: ChainIndex,
}

impl DirEntry {
    pub fn new_empty() -> Self {
        Self {
            name: String::new(),
            size: 0,
            head: NONE,
        }
    }

    pub fn new(name: &str, head: ChainIndex) -> Self {
        debug_assert!(name.len() <= NAME_LENGTH_LIMIT);
        Self {
            name: name.to_string(),
            size: 0,
            head,
        }
    }

    pub fn is_free(&self) -> bool {
        self.name.is_empty()
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[..NAME_FIELD_SZ].fill(0);
        buf[..self.name.len()].copy_from_slice(self.name.as_bytes());
        put_u32(buf, NAME_FIELD_SZ, self.size);
        put_u32(buf, NAME_FIELD_SZ + 4, self.head);
    }

    pub fn decode(buf: &[u8]) -> SfsResult<Self> {
        let raw = &buf[..NAME_FIELD_SZ];
        let len = raw.iter().position(|c| *c == 0).unwrap_or(NAME_FIELD_SZ);
        if len > NAME_LENGTH_LIMIT {
            return Err(SfsError::BadVolume("directory name not terminated".to_string()));
        }
        let name = core::str::from_utf8(&raw[..len])
            .map_err(|_| SfsError::BadVolume("directory name is not utf-8".to_string()))?;
        Ok(Self {
            name: name.to_string(),
            size: get_u32(buf, NAME_FIELD_SZ),
            head: get_u32(buf, NAME_FIELD_SZ + 4),
        })
    }
}

/// One slot of the chain table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainEntry {
    pub data_block: BlockNumber,
    pub next: ChainIndex,
}

impl ChainEntry {
    pub const EMPTY: Self = Self {
        data_block: NONE,
        next: NONE,
    };

    pub fn is_free(&self) -> bool {
        self.data_block == NONE
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.data_block);
        put_u32(buf, 4, self.next);
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            data_block: get_u32(buf, 0),
            next: get_u32(buf, 4),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_fills_the_device() {
        let g = Geometry::plan(256, 2 + 1 + 2 + 64, FormatOptions { directory_blocks: 1 }).unwrap();
        assert_eq!(g.data_blocks, 64);
        assert_eq!(g.chain_table_blocks, 2);
        assert_eq!(g.chain_table_start, 3);
        assert_eq!(g.data_region_start, 5);
        assert_eq!(g.data_region_start + g.data_blocks, g.total_blocks);
    }

    #[test]
    fn for_data_blocks_inverts_plan() {
        let options = FormatOptions { directory_blocks: 3 };
        for (bs, n) in [(256, 64), (512, 100), (2048, 1000), (64, 7)] {
            let total = Geometry::for_data_blocks(bs, n, options);
            assert_eq!(Geometry::plan(bs, total, options).unwrap().data_blocks, n);
        }
    }

    #[test]
    fn plan_caps_data_at_one_bitmap_block() {
        let g = Geometry::plan(64, 10_000, FormatOptions::default()).unwrap();
        assert_eq!(g.data_blocks, 64 * 8);
    }

    #[test]
    fn plan_rejects_tiny_devices_and_odd_block_sizes() {
        assert!(matches!(
            Geometry::plan(256, 4, FormatOptions { directory_blocks: 2 }),
            Err(SfsError::BadVolume(_))
        ));
        assert!(Geometry::plan(100, 64, FormatOptions::default()).is_err());
    }

    #[test]
    fn descriptor_survives_encoding_and_rejects_garbage() {
        let g = Geometry::plan(512, 300, FormatOptions::default()).unwrap();
        assert_eq!(Geometry::decode(&g.encode()).unwrap(), g);
        assert!(Geometry::decode(&[0u8; 512]).is_err());
        let mut bad = g.encode();
        put_u32(&mut bad, 8 * 4, 9999);
        assert!(matches!(Geometry::decode(&bad), Err(SfsError::BadVolume(_))));
    }

    #[test]
    fn dirent_name_is_nul_padded() {
        let mut buf = [0xffu8; DIRENT_SZ];
        let mut entry = DirEntry::new("notes.txt", 3);
        entry.size = 77;
        entry.encode(&mut buf);
        assert_eq!(&buf[9..NAME_FIELD_SZ], &[0u8; 7]);
        assert_eq!(DirEntry::decode(&buf).unwrap(), entry);
        DirEntry::new_empty().encode(&mut buf);
        assert!(DirEntry::decode(&buf).unwrap().is_free());
    }
}
