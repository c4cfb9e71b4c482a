use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Writes segment payloads to disk strictly in index order.
///
/// Payloads that arrive ahead of the cursor wait in a holding map until the
/// gap below them is filled. Everything below the cursor is on disk and never
/// rewritten, which is what lets force-save copy the prefix without the lock.
/// A payload leaves the holding map only once it has been written in full.
pub struct OrderedWriter {
    path: PathBuf,
    file: Option<File>,
    cursor: usize,
    end: usize,
    pending: BTreeMap<usize, Vec<u8>>,
    written: u64,
    broken: bool,
}

impl OrderedWriter {
    /// Start a fresh output for indices `start..=end`, truncating `path`.
    pub fn create(path: impl Into<PathBuf>, start: usize, end: usize) -> CoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Some(file),
            cursor: start,
            end,
            pending: BTreeMap::new(),
            written: 0,
            broken: false,
        })
    }

    /// Reopen an earlier output whose first `cursor - start` segments, worth
    /// `written` bytes, are already on disk. Anything past that is cut off.
    /// Returns `None` when the file is missing or shorter than `written`.
    pub fn resume(
        path: impl Into<PathBuf>,
        cursor: usize,
        end: usize,
        written: u64,
    ) -> CoreResult<Option<Self>> {
        let path = path.into();
        let mut file = match OpenOptions::new().write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if file.metadata()?.len() < written {
            return Ok(None);
        }
        file.set_len(written)?;
        file.seek(SeekFrom::Start(written))?;
        debug!(path = %path.display(), cursor, written, "resumed output file");
        Ok(Some(Self {
            path,
            file: Some(file),
            cursor,
            end,
            pending: BTreeMap::new(),
            written,
            broken: false,
        }))
    }

    /// An output finalized by an earlier process.
    pub fn finished(path: impl Into<PathBuf>, end: usize, written: u64) -> Self {
        Self {
            path: path.into(),
            file: None,
            cursor: end + 1,
            end,
            pending: BTreeMap::new(),
            written,
            broken: false,
        }
    }

    /// Accept the payload for `index` and write every contiguous payload
    /// starting at the cursor. Returns how many segments reached the file.
    ///
    /// An error means the payload for `index` was not accepted and may be
    /// pushed again. When the failed write belongs to an earlier held
    /// payload and `index` itself already reached the file, the held payload
    /// stays queued and the push succeeds.
    pub fn push(&mut self, index: usize, payload: Vec<u8>) -> CoreResult<usize> {
        if index < self.cursor || index > self.end {
            return Err(CoreError::InvalidState(format!(
                "segment {index} is outside the writable window {}..={}",
                self.cursor, self.end
            )));
        }
        if self.pending.contains_key(&index) {
            return Err(CoreError::InvalidState(format!(
                "segment {index} was already handed to the writer"
            )));
        }
        self.ensure_writable()?;
        self.pending.insert(index, payload);

        let (drained, failure) = self.drain();
        match failure {
            None => Ok(drained),
            Some(err) if self.pending.remove(&index).is_some() => Err(err),
            Some(err) => {
                warn!(index, error = %err, "held segment could not be written yet");
                Ok(drained)
            }
        }
    }

    /// First index not yet on disk.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn written_bytes(&self) -> u64 {
        self.written
    }

    pub fn held(&self) -> usize {
        self.pending.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_complete(&self) -> bool {
        self.cursor > self.end
    }

    /// Flush and fsync. Returns the file and how many bytes of it form the
    /// in-order prefix.
    pub fn checkpoint(&mut self) -> CoreResult<(PathBuf, u64)> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            file.sync_data()?;
        }
        Ok((self.path.clone(), self.written))
    }

    /// Sync and move the finished output to `dest`. Later pushes fail.
    pub fn finalize(&mut self, dest: &Path) -> CoreResult<PathBuf> {
        if self.file.is_some() {
            if let (_, Some(err)) = self.drain() {
                return Err(err);
            }
        }
        if !self.is_complete() {
            return Err(CoreError::InvalidState(format!(
                "cannot finalize output with segment {} still missing",
                self.cursor
            )));
        }
        if let Some(file) = self.file.take() {
            file.sync_all()?;
            drop(file);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&self.path, dest)?;
            self.path = dest.to_path_buf();
        }
        Ok(self.path.clone())
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        if self.broken {
            return Err(CoreError::Io(format!(
                "output {} is unusable after a failed write",
                self.path.display()
            )));
        }
        if self.file.is_none() {
            return Err(CoreError::InvalidState("writer already finalized".to_string()));
        }
        Ok(())
    }

    /// Write held payloads from the cursor on. Stops at the first failed
    /// write, leaving that payload held and the file cut back to the prefix.
    fn drain(&mut self) -> (usize, Option<CoreError>) {
        let mut drained = 0usize;
        while let Some(payload) = self.pending.get(&self.cursor) {
            let Some(file) = self.file.as_mut() else {
                break;
            };
            let len = payload.len() as u64;
            if let Err(err) = file.write_all(payload) {
                let index = self.cursor;
                self.rewind();
                return (
                    drained,
                    Some(CoreError::Io(format!("failed to write segment {index}: {err}"))),
                );
            }
            self.pending.remove(&self.cursor);
            self.written += len;
            self.cursor += 1;
            drained += 1;
        }
        (drained, None)
    }

    /// Drop a partially written payload so the file ends at the prefix.
    fn rewind(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let written = self.written;
        let result = file.metadata().and_then(|meta| {
            if meta.is_file() {
                file.set_len(written)?;
            }
            file.seek(SeekFrom::Start(written)).map(|_| ())
        });
        if let Err(err) = result {
            warn!(path = %self.path.display(), error = %err, "could not cut output back to its prefix");
            self.file = None;
            self.broken = true;
        }
    }
}

/// Checkpoint under the writer lock, then copy the in-order prefix to `dest`
/// with the lock released. Returns the artifact path and its length.
pub fn force_save(writer: &Mutex<OrderedWriter>, dest: &Path) -> CoreResult<(PathBuf, u64)> {
    let (source, len) = {
        let mut writer = writer
            .lock()
            .map_err(|_| CoreError::Io("writer lock poisoned".to_string()))?;
        writer.checkpoint()?
    };
    copy_prefix(&source, dest, len)?;
    debug!(path = %dest.display(), bytes = len, "force-saved partial output");
    Ok((dest.to_path_buf(), len))
}

fn copy_prefix(source: &Path, dest: &Path, len: u64) -> CoreResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let input = File::open(source)?;
    let mut output = File::create(dest)?;
    let copied = io::copy(&mut input.take(len), &mut output)?;
    if copied != len {
        return Err(CoreError::Io(format!(
            "expected to copy {len} bytes from {} but got {copied}",
            source.display()
        )));
    }
    output.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_out_of_order_payloads_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.download");
        let mut writer = OrderedWriter::create(&path, 2, 5).unwrap();

        assert_eq!(writer.push(4, b"cc".to_vec()).unwrap(), 0);
        assert_eq!(writer.push(3, b"bb".to_vec()).unwrap(), 0);
        assert_eq!(writer.held(), 2);
        assert_eq!(writer.push(2, b"a".to_vec()).unwrap(), 3);
        assert_eq!(writer.cursor(), 5);
        assert!(!writer.is_complete());
        assert_eq!(writer.push(5, b"ddd".to_vec()).unwrap(), 1);
        assert!(writer.is_complete());
        assert_eq!(writer.written_bytes(), 8);

        let dest = dir.path().join("out.ts");
        writer.finalize(&dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"abbccddd");
        assert!(!path.exists());
        assert!(writer.push(6, b"x".to_vec()).is_err());
    }

    #[test]
    fn rejects_duplicates_and_out_of_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = OrderedWriter::create(dir.path().join("t.download"), 0, 3).unwrap();
        writer.push(0, b"a".to_vec()).unwrap();
        assert!(writer.push(0, b"a".to_vec()).is_err());
        writer.push(2, b"c".to_vec()).unwrap();
        assert!(writer.push(2, b"c".to_vec()).is_err());
        assert!(writer.push(4, b"e".to_vec()).is_err());
        assert!(writer.finalize(&dir.path().join("x.ts")).is_err());
    }

    #[test]
    fn force_save_copies_only_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Mutex::new(OrderedWriter::create(dir.path().join("t.download"), 0, 3).unwrap());
        {
            let mut guard = writer.lock().unwrap();
            guard.push(0, vec![1u8; 100]).unwrap();
            guard.push(1, vec![2u8; 50]).unwrap();
            guard.push(3, vec![4u8; 70]).unwrap();
        }
        let dest = dir.path().join("show.partial.ts");
        let (path, len) = force_save(&writer, &dest).unwrap();
        assert_eq!(path, dest);
        assert_eq!(len, 150);
        assert_eq!(fs::metadata(&dest).unwrap().len(), 150);

        writer.lock().unwrap().push(2, vec![3u8; 10]).unwrap();
        let (_, len) = force_save(&writer, &dest).unwrap();
        assert_eq!(len, 230);
        assert_eq!(fs::metadata(&dest).unwrap().len(), 230);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_write_keeps_payload_for_another_push() {
        let mut writer = OrderedWriter::create("/dev/full", 0, 3).unwrap();
        assert_eq!(writer.push(1, vec![7u8; 20 * 1024]).unwrap(), 0);

        let err = writer.push(0, vec![1u8; 10]).unwrap_err();
        assert!(matches!(&err, CoreError::Io(msg) if msg.contains("segment 0")));
        assert_eq!(writer.cursor(), 0);
        assert_eq!(writer.written_bytes(), 0);
        assert_eq!(writer.held(), 1);

        // the same index can be handed over again
        let err = writer.push(0, vec![1u8; 10]).unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
        assert_eq!(writer.cursor(), 0);
    }

    #[test]
    fn resume_truncates_to_known_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.download");
        fs::write(&path, b"aaabbbgarbage").unwrap();

        let mut writer = OrderedWriter::resume(&path, 2, 3, 6).unwrap().unwrap();
        assert_eq!(writer.cursor(), 2);
        writer.push(2, b"ccc".to_vec()).unwrap();
        writer.push(3, b"d".to_vec()).unwrap();
        let dest = dir.path().join("done.ts");
        writer.finalize(&dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"aaabbbcccd");

        assert!(OrderedWriter::resume(dir.path().join("missing"), 0, 1, 0)
            .unwrap()
            .is_none());
        fs::write(&path, b"ab").unwrap();
        assert!(OrderedWriter::resume(&path, 1, 1, 5).unwrap().is_none());
    }
}
