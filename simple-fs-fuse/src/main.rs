mod logging;

use simple_fs::{
    check_range, BlockDevice, FormatOptions, SfsError, SfsResult, SimpleFileSystem,
    DEFAULT_BLOCK_SZ, DEFAULT_DIRECTORY_BLOCKS, NAME_LENGTH_LIMIT,
};
use structopt::StructOpt;

use std::{
    error::Error,
    fs::{read_dir, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Image size of the classic single-image layout: 1 + 2048 + 20 + 4 blocks
const DEFAULT_TOTAL_BLOCKS: usize = 1 + DEFAULT_BLOCK_SZ + DEFAULT_DIRECTORY_BLOCKS + 4;

/// A volume image on the host file system
struct BlockFile {
    file: Mutex<File>,
    block_size: usize,
    total_blocks: usize,
}

impl BlockFile {
    /// Create (or truncate) an image of `total_blocks` zeroed blocks
    fn create_volume(path: &Path, block_size: usize, total_blocks: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((block_size * total_blocks) as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            total_blocks,
        })
    }

    /// Attach an existing image, which must be exactly `total_blocks` long
    fn open_volume(path: &Path, block_size: usize, total_blocks: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len != (block_size * total_blocks) as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} is {} bytes, expected {} blocks of {} bytes",
                    path.display(),
                    len,
                    total_blocks,
                    block_size
                ),
            ));
        }
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            total_blocks,
        })
    }

    /// Attach an existing image, taking its block count from its length
    fn open_image(path: &Path, block_size: usize) -> io::Result<Self> {
        let len = std::fs::metadata(path)?.len() as usize;
        if len % block_size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a whole number of {}B blocks", path.display(), block_size),
            ));
        }
        Self::open_volume(path, block_size, len / block_size)
    }

    fn transfer<T>(
        &self,
        start: usize,
        len: usize,
        f: impl FnOnce(&mut File) -> io::Result<T>,
    ) -> SfsResult<T> {
        check_range(self, start, len)?;
        let io_error = |e: io::Error| SfsError::Io {
            block: start,
            detail: e.to_string(),
        };
        let mut file = self.file.lock().map_err(|_| SfsError::Io {
            block: start,
            detail: "image lock poisoned".into(),
        })?;
        file.seek(SeekFrom::Start((start * self.block_size) as u64))
            .map_err(io_error)?;
        f(&mut *file).map_err(io_error)
    }
}

impl BlockDevice for BlockFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    fn read_blocks(&self, start: usize, buf: &mut [u8]) -> SfsResult<()> {
        self.transfer(start, buf.len(), |file| file.read_exact(buf))
    }

    fn write_blocks(&self, start: usize, buf: &[u8]) -> SfsResult<()> {
        self.transfer(start, buf.len(), |file| file.write_all(buf))
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "simple-fs-fuse", about = "Build and inspect simple-fs volume images")]
struct Opt {
    #[structopt(short, long, parse(from_os_str), default_value = "sfs.img", help = "Volume image")]
    image: PathBuf,
    #[structopt(long, default_value = "2048", help = "Bytes per block")]
    block_size: usize,
    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Create a fresh, empty volume image
    Format {
        #[structopt(long, help = "Blocks in the image (default: 2073)")]
        blocks: Option<usize>,
        #[structopt(long, default_value = "20", help = "Blocks reserved for the directory")]
        dir_blocks: usize,
    },
    /// List files and their sizes
    Ls,
    /// Copy a host file into the volume, replacing any file of that name
    Put {
        #[structopt(parse(from_os_str))]
        host: PathBuf,
        #[structopt(short, long, help = "Name inside the volume (default: host file name)")]
        name: Option<String>,
    },
    /// Copy a file out of the volume
    Get {
        name: String,
        #[structopt(parse(from_os_str))]
        host: PathBuf,
    },
    /// Delete a file
    Rm { name: String },
    /// Copy every regular file of a host directory into the volume
    Pack {
        #[structopt(short, long, parse(from_os_str))]
        source: PathBuf,
    },
    /// Audit the volume's metadata
    Check,
}

/// Replace `name` with the contents of `data`
fn put(fs: &mut SimpleFileSystem, name: &str, data: &[u8]) -> SfsResult<()> {
    match fs.remove(name) {
        Ok(()) | Err(SfsError::NotFound(_)) => {}
        Err(err) => return Err(err),
    }
    let fd = fs.open(name)?;
    fs.write(fd, data)?;
    fs.close(fd)
}

/// Whole contents of `name`
fn get(fs: &mut SimpleFileSystem, name: &str) -> SfsResult<Vec<u8>> {
    let size = fs.file_size(name)?;
    let fd = fs.open(name)?;
    fs.seek(fd, 0)?;
    let data = fs.read(fd, size as usize)?;
    fs.close(fd)?;
    Ok(data)
}

fn host_file_name(path: &Path) -> io::Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| io::Error::other(format!("invalid file name: {}", path.display())))
}

/// Load every file of `source` that has a name the volume can hold
fn pack(fs: &mut SimpleFileSystem, source: &Path) -> Result<usize, Box<dyn Error>> {
    let mut size_total = 0;
    for dirent in read_dir(source)? {
        let path = dirent?.path();
        if !path.is_file() {
            continue;
        }
        let name = host_file_name(&path)?;
        if name.len() > NAME_LENGTH_LIMIT {
            log::warn!("skip {}: name longer than {} bytes", name, NAME_LENGTH_LIMIT);
            continue;
        }
        let mut all_data = Vec::new();
        File::open(&path)?.read_to_end(&mut all_data)?;
        println!("simple-fs-fuse: + {} {}B", name, all_data.len());
        size_total += all_data.len();
        put(fs, &name, &all_data)?;
    }
    Ok(size_total)
}

fn mount(image: &Path, block_size: usize) -> Result<SimpleFileSystem, Box<dyn Error>> {
    let block_file = Arc::new(BlockFile::open_image(image, block_size)?);
    Ok(SimpleFileSystem::load(block_file)?)
}

fn run(opt: Opt) -> Result<(), Box<dyn Error>> {
    log::debug!("simple-fs-fuse: {:?}", opt);
    let image = opt.image.as_path();
    match opt.cmd {
        Command::Format { blocks, dir_blocks } => {
            let blocks = blocks.unwrap_or(DEFAULT_TOTAL_BLOCKS);
            let block_file = Arc::new(BlockFile::create_volume(image, opt.block_size, blocks)?);
            let fs = SimpleFileSystem::create(
                block_file,
                FormatOptions {
                    directory_blocks: dir_blocks,
                },
            )?;
            let geometry = fs.geometry()?;
            println!(
                "{}: {} data blocks of {}B, {} directory slots",
                image.display(),
                geometry.data_blocks,
                geometry.block_size,
                geometry.directory_capacity()
            );
        }
        Command::Ls => {
            for (name, size) in mount(image, opt.block_size)?.list()? {
                println!("{:>12}: {}", name, size);
            }
        }
        Command::Put { host, name } => {
            let name = match name {
                Some(name) => name,
                None => host_file_name(&host)?,
            };
            let mut data = Vec::new();
            File::open(&host)?.read_to_end(&mut data)?;
            put(&mut mount(image, opt.block_size)?, &name, &data)?;
        }
        Command::Get { name, host } => {
            let data = get(&mut mount(image, opt.block_size)?, &name)?;
            File::create(&host)?.write_all(&data)?;
        }
        Command::Rm { name } => mount(image, opt.block_size)?.remove(&name)?,
        Command::Pack { source } => {
            let size_total = pack(&mut mount(image, opt.block_size)?, &source)?;
            println!("simple-fs-fuse: packed {}KB", size_total / 1024);
        }
        Command::Check => {
            let fs = mount(image, opt.block_size)?;
            fs.check()?;
            println!("{}: ok, {} blocks free", image.display(), fs.free_blocks()?);
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    logging::init();
    run(Opt::from_args())
}
