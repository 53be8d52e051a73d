//! Disk-backed cache for encoded tile bytes

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use super::tile::TileCoord;

/// On-disk tile cache rooted at `<base>/tiles/<source>/`.
///
/// Lookups and stores may race across threads and processes; a reader that
/// hits a partially written or unreadable file simply sees a miss, and the
/// first writer of a key wins.
pub struct TileCache {
    root: PathBuf,
}

impl TileCache {
    pub fn new(base_dir: PathBuf, source: &str) -> Self {
        let mut root = base_dir;
        root.push("tiles");
        root.push(source);
        Self { root }
    }

    /// Cache rooted in the per-user cache directory, if the platform has one.
    pub fn in_user_cache_dir(source: &str) -> Option<Self> {
        dirs::cache_dir().map(|dir| Self::new(dir, source))
    }

    /// Full path of the cache entry for a tile
    pub fn tile_path(&self, coord: TileCoord) -> PathBuf {
        self.root.join(coord.to_file_name())
    }

    /// Read a tile's cached bytes. Any I/O failure is treated as a miss.
    pub fn lookup(&self, coord: TileCoord) -> Option<Vec<u8>> {
        fs::read(self.tile_path(coord)).ok()
    }

    /// Write a tile's bytes. Parent directories are created as needed and an
    /// already-present entry is left untouched.
    pub fn store(&self, coord: TileCoord, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.tile_path(coord))
        {
            Ok(file) => file,
            // Another writer got here first.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(()),
            Err(err) => return Err(err),
        };

        file.write_all(bytes)
    }
}
