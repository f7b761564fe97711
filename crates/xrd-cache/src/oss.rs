//! Storage-system abstraction.
//!
//! The cache never touches the filesystem directly: every byte goes
//! through an [`Oss`]. The local implementation maps cache paths under two
//! roots, one per space (`data` for file bytes, `meta` for cinfo
//! sidecars).

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Which space a path lives in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Space {
    /// File bytes at natural offsets.
    Data,
    /// cinfo sidecars and snapshots.
    Meta,
}

/// Filesystem usage as seen by the purge loop.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatVs {
    /// Total bytes in the space.
    pub total_bytes: u64,
    /// Bytes currently free.
    pub free_bytes: u64,
}

impl StatVs {
    /// Bytes in use.
    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

/// Metadata for one stored object.
#[derive(Clone, Copy, Debug, Default)]
pub struct OssStat {
    /// Object size in bytes.
    pub size: u64,
    /// Modification time, unix seconds.
    pub mtime: i64,
    /// True when the entry is a directory.
    pub is_dir: bool,
}

/// An open stored object supporting positioned I/O.
pub trait OssFile: Send + Sync {
    /// Reads at `offset`, returning the bytes actually read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    /// Writes at `offset`, returning the bytes actually written.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
    /// Flushes data to stable storage.
    fn sync(&self) -> io::Result<()>;
    /// Current object size.
    fn size(&self) -> io::Result<u64>;
}

/// The disk abstraction consumed by the cache.
pub trait Oss: Send + Sync {
    /// Opens an existing object.
    fn open(&self, space: Space, path: &str) -> io::Result<Box<dyn OssFile>>;
    /// Creates (or truncates) an object, creating parent directories.
    fn create(&self, space: Space, path: &str) -> io::Result<Box<dyn OssFile>>;
    /// Stats an object.
    fn stat(&self, space: Space, path: &str) -> io::Result<OssStat>;
    /// Removes an object.
    fn unlink(&self, space: Space, path: &str) -> io::Result<()>;
    /// Lists the names under a directory.
    fn readdir(&self, space: Space, path: &str) -> io::Result<Vec<String>>;
    /// Reports usage of the data space.
    fn stat_vs(&self) -> io::Result<StatVs>;
}

/// Positioned-I/O wrapper over a local file.
pub struct LocalFile {
    file: File,
}

impl OssFile for LocalFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        #[cfg(unix)]
        {
            self.file.read_at(buf, offset)
        }
        #[cfg(not(unix))]
        {
            let _ = (buf, offset);
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        #[cfg(unix)]
        {
            self.file.write_at(buf, offset)
        }
        #[cfg(not(unix))]
        {
            let _ = (buf, offset);
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Local-filesystem OSS with one root directory per space.
pub struct LocalOss {
    data_root: PathBuf,
    meta_root: PathBuf,
}

impl LocalOss {
    /// Creates an OSS rooted at the given directories, creating them if
    /// needed.
    pub fn new(data_root: impl Into<PathBuf>, meta_root: impl Into<PathBuf>) -> io::Result<Self> {
        let data_root = data_root.into();
        let meta_root = meta_root.into();
        fs::create_dir_all(&data_root)?;
        fs::create_dir_all(&meta_root)?;
        Ok(Self {
            data_root,
            meta_root,
        })
    }

    fn resolve(&self, space: Space, path: &str) -> PathBuf {
        let root = match space {
            Space::Data => &self.data_root,
            Space::Meta => &self.meta_root,
        };
        // Cache paths are absolute-looking ("/store/f"); strip the leading
        // separators so they nest under the root.
        root.join(path.trim_start_matches('/'))
    }
}

impl Oss for LocalOss {
    fn open(&self, space: Space, path: &str) -> io::Result<Box<dyn OssFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.resolve(space, path))?;
        Ok(Box::new(LocalFile { file }))
    }

    fn create(&self, space: Space, path: &str) -> io::Result<Box<dyn OssFile>> {
        let full = self.resolve(space, path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(full)?;
        Ok(Box::new(LocalFile { file }))
    }

    fn stat(&self, space: Space, path: &str) -> io::Result<OssStat> {
        let meta = fs::metadata(self.resolve(space, path))?;
        let mtime = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(OssStat {
            size: meta.len(),
            mtime,
            is_dir: meta.is_dir(),
        })
    }

    fn unlink(&self, space: Space, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(space, path))
    }

    fn readdir(&self, space: Space, path: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.resolve(space, path))? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn stat_vs(&self) -> io::Result<StatVs> {
        #[cfg(unix)]
        {
            let stat = rustix::fs::statvfs(&self.data_root)
                .map_err(|err| io::Error::from_raw_os_error(err.raw_os_error()))?;
            let frag = stat.f_frsize;
            Ok(StatVs {
                total_bytes: stat.f_blocks.saturating_mul(frag),
                free_bytes: stat.f_bavail.saturating_mul(frag),
            })
        }
        #[cfg(not(unix))]
        {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }
}

fn relative_walk(
    oss: &dyn Oss,
    space: Space,
    dir: &str,
    out: &mut Vec<String>,
) -> io::Result<()> {
    for name in oss.readdir(space, dir)? {
        let child = if dir.is_empty() || dir == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", dir.trim_end_matches('/'))
        };
        match oss.stat(space, &child) {
            Ok(stat) if stat.is_dir => relative_walk(oss, space, &child, out)?,
            Ok(_) => out.push(child),
            Err(_) => {}
        }
    }
    Ok(())
}

/// Collects every regular object below `dir` in the given space.
pub fn walk(oss: &dyn Oss, space: Space, dir: &str) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    relative_walk(oss, space, dir, &mut out)?;
    Ok(out)
}

/// Convenience: reads a whole object.
pub fn read_all(oss: &dyn Oss, space: Space, path: &str) -> io::Result<Vec<u8>> {
    let file = oss.open(space, path)?;
    let size = file.size()? as usize;
    let mut buf = vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = file.read_at(&mut buf[done..], done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    buf.truncate(done);
    Ok(buf)
}

/// Convenience: replaces a whole object.
pub fn write_all(oss: &dyn Oss, space: Space, path: &str, bytes: &[u8]) -> io::Result<()> {
    let file = oss.create(space, path)?;
    let mut done = 0;
    while done < bytes.len() {
        let n = file.write_at(&bytes[done..], done as u64)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        done += n;
    }
    file.sync()
}

/// Builds a [`LocalOss`] with `data/` and `meta/` subdirectories under one
/// root.
pub fn local_single_root(root: &Path) -> io::Result<LocalOss> {
    LocalOss::new(root.join("data"), root.join("meta"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oss() -> (tempfile::TempDir, LocalOss) {
        let dir = tempfile::tempdir().expect("tempdir");
        let oss = LocalOss::new(dir.path().join("data"), dir.path().join("meta")).unwrap();
        (dir, oss)
    }

    #[test]
    fn create_write_read_round_trip() {
        let (_dir, oss) = oss();
        write_all(&oss, Space::Data, "/store/a/f.bin", b"hello blocks").unwrap();
        let bytes = read_all(&oss, Space::Data, "/store/a/f.bin").unwrap();
        assert_eq!(bytes, b"hello blocks");
    }

    #[test]
    fn spaces_are_disjoint() {
        let (_dir, oss) = oss();
        write_all(&oss, Space::Data, "/f", b"data").unwrap();
        write_all(&oss, Space::Meta, "/f", b"meta").unwrap();
        assert_eq!(read_all(&oss, Space::Data, "/f").unwrap(), b"data");
        assert_eq!(read_all(&oss, Space::Meta, "/f").unwrap(), b"meta");
    }

    #[test]
    fn positioned_io_works() {
        let (_dir, oss) = oss();
        let file = oss.create(Space::Data, "/sparse").unwrap();
        file.write_at(b"tail", 1000).unwrap();
        let mut buf = [0u8; 4];
        let n = file.read_at(&mut buf, 1000).unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert_eq!(file.size().unwrap(), 1004);
    }

    #[test]
    fn unlink_removes_and_stat_reports() {
        let (_dir, oss) = oss();
        write_all(&oss, Space::Data, "/gone", b"x").unwrap();
        assert_eq!(oss.stat(Space::Data, "/gone").unwrap().size, 1);
        oss.unlink(Space::Data, "/gone").unwrap();
        assert!(oss.stat(Space::Data, "/gone").is_err());
    }

    #[test]
    fn walk_collects_nested_objects() {
        let (_dir, oss) = oss();
        write_all(&oss, Space::Meta, "/a/one.cinfo", b"1").unwrap();
        write_all(&oss, Space::Meta, "/a/b/two.cinfo", b"2").unwrap();
        write_all(&oss, Space::Meta, "/three.cinfo", b"3").unwrap();

        let mut files = walk(&oss, Space::Meta, "/").unwrap();
        files.sort();
        assert_eq!(
            files,
            vec![
                "/a/b/two.cinfo".to_owned(),
                "/a/one.cinfo".to_owned(),
                "/three.cinfo".to_owned()
            ]
        );
    }

    #[test]
    fn stat_vs_reports_nonzero_totals() {
        let (_dir, oss) = oss();
        let usage = oss.stat_vs().unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.free_bytes <= usage.total_bytes);
    }
}
