//! Follows a growing text file the way `tail -F` does.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Line follower over a single file.
///
/// Starts at the end of the file. When a read finds nothing new, the inode on
/// disk is compared with the one held open; a mismatch means the file was
/// rotated, and the new file is read from its beginning.
pub struct TailSource {
    path: PathBuf,
    reader: BufReader<File>,
    inode: u64,
    partial: Vec<u8>,
    total_lines: u64,
    current_lines: u64,
}

impl TailSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (reader, inode) = Self::open_at(&path, SeekFrom::End(0))?;
        debug!(path = %path.display(), inode, "following file");
        Ok(Self {
            path,
            reader,
            inode,
            partial: Vec::new(),
            total_lines: 0,
            current_lines: 0,
        })
    }

    fn open_at(path: &Path, pos: SeekFrom) -> io::Result<(BufReader<File>, u64)> {
        let mut file = File::open(path)?;
        file.seek(pos)?;
        let inode = file.metadata()?.ino();
        Ok((BufReader::new(file), inode))
    }

    /// Returns the next complete line without its terminator, or `None` when
    /// nothing new has been written. Bytes that are not UTF-8 are replaced
    /// rather than failing the read.
    pub fn poll(&mut self) -> io::Result<Option<String>> {
        loop {
            let n = self.reader.read_until(b'\n', &mut self.partial)?;
            if n > 0 {
                if self.partial.last() != Some(&b'\n') {
                    // writer hasn't finished the line yet
                    continue;
                }
                let raw = std::mem::take(&mut self.partial);
                self.total_lines += 1;
                self.current_lines += 1;
                let line = String::from_utf8_lossy(&raw);
                return Ok(Some(line.trim_end_matches(&['\n', '\r'][..]).to_string()));
            }

            let on_disk = fs::metadata(&self.path)?.ino();
            if on_disk == self.inode {
                return Ok(None);
            }
            info!(path = %self.path.display(), "file rotated, reopening");
            let (reader, inode) = Self::open_at(&self.path, SeekFrom::Start(0))?;
            self.reader = reader;
            self.inode = inode;
            self.partial.clear();
            self.current_lines = 0;
        }
    }

    /// Rewinds to the start of the same file after it was truncated in place.
    pub fn truncate(&mut self) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        self.partial.clear();
        self.current_lines = 0;
        Ok(())
    }

    /// Lines read since the file was opened, rotated or truncated.
    pub fn current_lines(&self) -> u64 {
        self.current_lines
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn append(path: &Path, text: &str) {
        append_bytes(path, text.as_bytes());
    }

    fn append_bytes(path: &Path, bytes: &[u8]) {
        let mut f = fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn starts_at_end_and_reads_new_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "old line\n").unwrap();

        let mut tail = TailSource::open(&path).unwrap();
        assert_eq!(tail.poll().unwrap(), None);

        append(&path, "first\nsecond\n");
        assert_eq!(tail.poll().unwrap().as_deref(), Some("first"));
        assert_eq!(tail.poll().unwrap().as_deref(), Some("second"));
        assert_eq!(tail.poll().unwrap(), None);
        assert_eq!(tail.current_lines(), 2);
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "").unwrap();
        let mut tail = TailSource::open(&path).unwrap();

        append(&path, "half");
        assert_eq!(tail.poll().unwrap(), None);
        append(&path, " done\n");
        assert_eq!(tail.poll().unwrap().as_deref(), Some("half done"));
    }

    #[test]
    fn invalid_utf8_does_not_stop_the_reader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "").unwrap();
        let mut tail = TailSource::open(&path).unwrap();

        append_bytes(&path, b"bad \xff\xfe line\nnext\n");
        let bad = tail.poll().unwrap().unwrap();
        assert!(bad.starts_with("bad "));
        assert!(bad.ends_with(" line"));
        assert_eq!(tail.poll().unwrap().as_deref(), Some("next"));
        assert_eq!(tail.current_lines(), 2);
    }

    #[test]
    fn follows_rotation_from_start_of_new_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "").unwrap();
        let mut tail = TailSource::open(&path).unwrap();
        append(&path, "before\n");
        assert_eq!(tail.poll().unwrap().as_deref(), Some("before"));

        fs::rename(&path, dir.path().join("out.log.1")).unwrap();
        fs::write(&path, "after\n").unwrap();

        assert_eq!(tail.poll().unwrap().as_deref(), Some("after"));
        assert_eq!(tail.current_lines(), 1);
        assert_eq!(tail.total_lines(), 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "").unwrap();
        let mut tail = TailSource::open(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(tail.poll().is_err());
    }

    #[test]
    fn truncate_rewinds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "").unwrap();
        let mut tail = TailSource::open(&path).unwrap();
        append(&path, "a\nb\n");
        tail.poll().unwrap();
        tail.poll().unwrap();

        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(0)
            .unwrap();
        tail.truncate().unwrap();
        assert_eq!(tail.current_lines(), 0);

        append(&path, "c\n");
        assert_eq!(tail.poll().unwrap().as_deref(), Some("c"));
    }
}
