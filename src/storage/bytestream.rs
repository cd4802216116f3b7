//! A single bytestream: a directory of offset-named, append-only files,
//! per spec.md sections 3 and 6.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// One on-disk segment of a bytestream. `committed_len` is the number of
/// bytes readers are allowed to see; it only ever grows via `INFORM`.
pub struct FileSpan {
    pub start: u64,
    pub committed_len: u64,
    /// Bytes actually extended on disk so far (may run ahead of
    /// `committed_len` between a zero-fill write and the matching
    /// `INFORM`).
    pub allocated_len: u64,
}

impl FileSpan {
    fn name(start: u64) -> String {
        format!("{:016x}", start)
    }
}

pub struct Bytestream {
    pub name: String,
    dir: PathBuf,
    pub per_file_max: u64,
    pub size_limit: u64,
    pub files: Vec<FileSpan>,
    pub has_writer: bool,
    writer_file: Option<File>,
    writer_file_start: u64,
}

impl Bytestream {
    /// Opens (creating the directory if writer-mode and absent) the
    /// on-disk bytestream, discovering any existing files by their
    /// offset-hex name.
    pub fn open(dir: &Path, writer: bool, per_file_max: u64, size_limit: u64) -> io::Result<Bytestream> {
        if writer {
            fs::create_dir_all(dir)?;
        } else if !dir.exists() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "bytestream does not exist"));
        }

        let mut files = Vec::new();
        if dir.exists() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let fname = entry.file_name();
                let fname = fname.to_string_lossy();
                if let Ok(start) = u64::from_str_radix(&fname, 16) {
                    let len = entry.metadata()?.len();
                    files.push(FileSpan {
                        start,
                        committed_len: len,
                        allocated_len: len,
                    });
                }
            }
        }
        files.sort_by_key(|f| f.start);

        Ok(Bytestream {
            name: dir.file_name().unwrap().to_string_lossy().into_owned(),
            dir: dir.to_path_buf(),
            per_file_max,
            size_limit,
            files,
            has_writer: writer,
            writer_file: None,
            writer_file_start: 0,
        })
    }

    pub fn first_offset(&self) -> Option<u64> {
        self.files.first().map(|f| f.start)
    }

    /// Sum of committed file sizes: the bytestream's logical, readable
    /// size (invariant #1 in spec.md section 8, modulo the first file's
    /// start offset which is always 0 in this implementation since files
    /// are never pruned below offset 0 without deleting the whole file).
    pub fn committed_size(&self) -> u64 {
        self.files.iter().map(|f| f.committed_len).sum()
    }

    pub fn writer_offset(&self) -> u64 {
        match self.files.last() {
            Some(f) => f.start + f.committed_len,
            None => 0,
        }
    }

    fn path_for(&self, start: u64) -> PathBuf {
        self.dir.join(FileSpan::name(start))
    }

    /// Opens (or starts) the writer's current file, creating a brand new
    /// one at `offset` if none exists yet.
    fn ensure_writer_file(&mut self, offset: u64) -> io::Result<()> {
        if self.writer_file.is_some() && self.writer_file_start <= offset {
            return Ok(());
        }
        let start = self.files.last().map(|f| f.start).unwrap_or(offset);
        let path = self.path_for(start);
        let file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
        if self.files.is_empty() {
            self.files.push(FileSpan {
                start,
                committed_len: 0,
                allocated_len: 0,
            });
        }
        self.writer_file = Some(file);
        self.writer_file_start = start;
        Ok(())
    }

    /// Validates and applies a writer REGION request: the file is
    /// extended with a zero-fill write, rolling over to a new file if the
    /// extension would cross `per_file_max`. Returns the path and the
    /// in-file byte offset the mmap window should start at.
    pub fn writer_region(&mut self, offset: u64, size: usize) -> Result<(PathBuf, u64), super::protocol::ErrorCode> {
        use super::protocol::ErrorCode;

        let current_end = self.writer_offset();
        if offset != current_end {
            // Would either create a gap (offset > current_end) or
            // overwrite already-committed bytes (offset < current_end).
            return Err(ErrorCode::Invalid);
        }
        let cur_file_start = self.files.last().map(|f| f.start).unwrap_or(offset);
        let mut in_file_offset = offset - cur_file_start;
        let mut would_be = in_file_offset + size as u64;

        if would_be > self.per_file_max && in_file_offset > 0 {
            // Roll over: close/truncate the current file to its committed
            // length, then register the new span and unbind the writer
            // handle *before* falling through to the extension below, so
            // `ensure_writer_file` creates and zero-fills the new file
            // instead of reopening the old one under the new name.
            self.close_writer_file_truncated()?;
            self.files.push(FileSpan {
                start: offset,
                committed_len: 0,
                allocated_len: 0,
            });
            self.writer_file = None;
            in_file_offset = 0;
            would_be = size as u64;
        }

        self.ensure_writer_file(offset).map_err(|_| ErrorCode::Invalid)?;
        let span = self.files.last_mut().unwrap();
        if would_be > span.allocated_len {
            let grow = would_be - span.allocated_len;
            let zeros = vec![0u8; grow as usize];
            let file = self.writer_file.as_mut().unwrap();
            file.write_all(&zeros).map_err(|_| ErrorCode::Invalid)?;
            span.allocated_len = would_be;
        }

        Ok((self.path_for(span.start), in_file_offset))
    }

    /// `S_INFORM`: bumps the current file's (and stream's) committed size.
    pub fn inform(&mut self, offset: u64) -> Result<(), super::protocol::ErrorCode> {
        use super::protocol::ErrorCode;
        let span = self.files.last_mut().ok_or(ErrorCode::Invalid)?;
        let in_file = offset.checked_sub(span.start).ok_or(ErrorCode::Invalid)?;
        if in_file > span.allocated_len {
            return Err(ErrorCode::Invalid);
        }
        span.committed_len = span.committed_len.max(in_file);
        Ok(())
    }

    /// Closes the writer's final (still-open) file at the committed
    /// length, truncating via close-then-truncate because the file is
    /// open in append mode (spec.md section 4.2 scheduler step 1).
    pub fn close_writer_file_truncated(&mut self) -> io::Result<()> {
        if let Some(span) = self.files.last() {
            let path = self.path_for(span.start);
            let committed = span.committed_len;
            self.writer_file = None;
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(committed)?;
        }
        Ok(())
    }

    pub fn close_writer(&mut self) -> io::Result<()> {
        self.close_writer_file_truncated()?;
        self.has_writer = false;
        Ok(())
    }

    /// Locates the file covering `offset`, if any.
    pub fn file_covering(&self, offset: u64) -> Option<&FileSpan> {
        self.files
            .iter()
            .rev()
            .find(|f| f.start <= offset && offset <= f.start + f.committed_len)
    }

    pub fn reader_path_for(&self, start: u64) -> PathBuf {
        self.path_for(start)
    }

    /// Deletes the oldest file, per the scheduler's size-bound eviction
    /// (spec.md section 4.2, scheduler step 2). Caller must have already
    /// confirmed there are no active readers on it.
    pub fn evict_oldest(&mut self) -> io::Result<()> {
        if self.files.is_empty() {
            return Ok(());
        }
        let span = self.files.remove(0);
        let path = self.path_for(span.start);
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_writer_on_new_stream_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("teststream");
        let bs = Bytestream::open(&path, true, 1 << 20, 1 << 30).unwrap();
        assert!(path.exists());
        assert_eq!(bs.committed_size(), 0);
    }

    #[test]
    fn reader_open_on_missing_stream_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing");
        assert!(Bytestream::open(&path, false, 1 << 20, 1 << 30).is_err());
    }

    #[test]
    fn writer_region_extends_then_inform_commits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s");
        let mut bs = Bytestream::open(&path, true, 1 << 20, 1 << 30).unwrap();
        let (file_path, in_file_off) = bs.writer_region(0, 128).unwrap();
        assert_eq!(in_file_off, 0);
        assert!(file_path.exists());
        assert_eq!(bs.committed_size(), 0);
        bs.inform(128).unwrap();
        assert_eq!(bs.committed_size(), 128);
    }

    #[test]
    fn writer_region_rolls_over_past_per_file_max() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s");
        let mut bs = Bytestream::open(&path, true, 64, 1 << 30).unwrap();
        bs.writer_region(0, 64).unwrap();
        bs.inform(64).unwrap();
        let (_file_path, in_file_off) = bs.writer_region(64, 32).unwrap();
        assert_eq!(in_file_off, 0, "new file should start fresh at in-file offset 0");
        assert_eq!(bs.files.len(), 2);
        assert_eq!(bs.files[1].start, 64);
    }

    #[test]
    fn writer_region_rejects_gap_and_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s");
        let mut bs = Bytestream::open(&path, true, 1 << 20, 1 << 30).unwrap();
        bs.writer_region(0, 64).unwrap();
        bs.inform(64).unwrap();
        assert!(bs.writer_region(128, 16).is_err(), "gap must be rejected");
        assert!(bs.writer_region(32, 16).is_err(), "overwrite must be rejected");
    }
}
