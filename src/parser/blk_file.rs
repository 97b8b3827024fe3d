use crate::parser::errors::{OpError, OpErrorKind, OpResult};
use crate::parser::proto::BlockLocation;
use std::fs::{self, DirEntry, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

///
/// The `blk*.dat` files of a blocks directory, ordered by file number.
///
#[derive(Debug, Clone)]
pub struct BlkFile {
    files: Vec<(i32, PathBuf)>,
}

impl BlkFile {
    pub fn scan(path: &Path) -> OpResult<BlkFile> {
        let mut files = BlkFile::scan_path(path)?;
        files.sort_by_key(|(index, _)| *index);
        Ok(BlkFile { files })
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter().map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Read back the framed bytes of one block.
    pub fn read_range(path: &Path, location: &BlockLocation) -> OpResult<Vec<u8>> {
        let mut f = File::open(path)?;
        f.seek(SeekFrom::Start(location.offset))?;
        let mut buf = vec![0u8; location.length as usize];
        f.read_exact(&mut buf).map_err(|e| {
            OpError::from(e).join_msg(&format!(
                "{} offset {} length {}",
                path.display(),
                location.offset,
                location.length
            ))
        })?;
        Ok(buf)
    }

    fn scan_path(path: &Path) -> OpResult<Vec<(i32, PathBuf)>> {
        let mut collected = Vec::new();
        for entry in fs::read_dir(path)? {
            let path = BlkFile::resolve_path(&entry?)?;
            if !path.is_file() {
                continue;
            }
            let index = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(BlkFile::parse_blk_index);
            if let Some(index) = index {
                collected.push((index, path));
            }
        }
        if collected.is_empty() {
            Err(OpError::new(OpErrorKind::RuntimeError).join_msg("No blk files found!"))
        } else {
            Ok(collected)
        }
    }

    fn resolve_path(entry: &DirEntry) -> io::Result<PathBuf> {
        if entry.file_type()?.is_symlink() {
            fs::read_link(entry.path())
        } else {
            Ok(entry.path())
        }
    }

    fn parse_blk_index(file_name: &str) -> Option<i32> {
        let prefix = "blk";
        let ext = ".dat";
        if file_name.starts_with(prefix) && file_name.ends_with(ext) {
            file_name[prefix.len()..(file_name.len() - ext.len())]
                .parse::<i32>()
                .ok()
        } else {
            None
        }
    }
}
