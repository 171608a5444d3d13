//! The append-only log file underlying the embedded engine. Each entry is:
//!
//! - Key length as big-endian u32.
//! - Value length as big-endian i32, or -1 for tombstones.
//! - Key as raw bytes.
//! - Value as raw bytes (absent for tombstones).

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs4::FileExt;

use crate::error::{CResult, Error};

/// Maps a key to the file offset and length of its current value.
/// Rebuilt by replaying the log on open.
pub type KeyDir = BTreeMap<Vec<u8>, (u64, u32)>;

pub struct Log {
    pub(crate) path: PathBuf,
    pub(crate) file: std::fs::File,
}

impl Log {
    pub fn new(path: PathBuf) -> CResult<Self> {
        Self::new_with_lock(path, true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        if try_lock {
            file.try_lock_exclusive().map_err(|_| {
                Error::Transient(format!("{} is locked by another process", path.display()))
            })?;
        }

        Ok(Self { path, file })
    }

    /// Replays the log from the start, rebuilding the keydir. A truncated
    /// entry at the tail (an unflushed partial write from a crash) is
    /// logged and the file is truncated to the last complete entry, rather
    /// than treated as corruption.
    pub fn build_keydir(&mut self) -> CResult<KeyDir> {
        let mut len_buf = [0u8; 4];
        let mut keydir = KeyDir::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);

        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            let mut read_entry = || -> Result<(Vec<u8>, u64, Option<u32>), std::io::Error> {
                r.read_exact(&mut len_buf)?;
                let key_len = u32::from_be_bytes(len_buf);
                r.read_exact(&mut len_buf)?;
                let value_len_or_tombstone = match i32::from_be_bytes(len_buf) {
                    l if l >= 0 => Some(l as u32),
                    _ => None,
                };
                let value_pos = pos + 4 + 4 + key_len as u64;

                let mut key = vec![0; key_len as usize];
                r.read_exact(&mut key)?;

                if let Some(value_len) = value_len_or_tombstone {
                    if value_pos + value_len as u64 > file_len {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "value extends beyond end of file",
                        ));
                    }
                    r.seek_relative(value_len as i64)?;
                }

                Ok((key, value_pos, value_len_or_tombstone))
            };

            match read_entry() {
                Ok((key, value_pos, Some(value_len))) => {
                    keydir.insert(key, (value_pos, value_len));
                    pos = value_pos + value_len as u64;
                }
                Ok((key, value_pos, None)) => {
                    keydir.remove(&key);
                    pos = value_pos;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::warn!(
                        "found incomplete log entry at offset {} in {}, truncating",
                        pos,
                        self.path.display()
                    );
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(keydir)
    }

    pub fn read_value(&mut self, value_pos: u64, value_len: u32) -> CResult<Vec<u8>> {
        let mut value = vec![0; value_len as usize];
        self.file.seek(SeekFrom::Start(value_pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Appends a key/value entry, or a tombstone if `value` is `None`.
    /// Returns the entry's start offset and total length.
    pub fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<(u64, u32)> {
        let key_len = key.len() as u32;
        let value_len = value.map_or(0, |v| v.len() as u32);
        let value_len_or_tombstone = value.map_or(-1, |v| v.len() as i32);
        let len = 4 + 4 + key_len + value_len;

        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(len as usize, &mut self.file);
        w.write_all(&key_len.to_be_bytes())?;
        w.write_all(&value_len_or_tombstone.to_be_bytes())?;
        w.write_all(key)?;
        if let Some(value) = value {
            w.write_all(value)?;
        }
        w.flush()?;

        Ok((pos, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_reopen_rebuilds_keydir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");

        let mut log = Log::new(path.clone()).unwrap();
        log.write_entry(b"a", Some(b"1")).unwrap();
        log.write_entry(b"b", Some(b"2")).unwrap();
        log.write_entry(b"a", None).unwrap();
        drop(log);

        let mut log = Log::new(path).unwrap();
        let keydir = log.build_keydir().unwrap();
        assert_eq!(keydir.len(), 1);
        assert!(keydir.contains_key(b"b".as_slice()));
    }

    #[test]
    fn second_open_without_unlock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let _first = Log::new(path.clone()).unwrap();
        assert!(Log::new(path).is_err());
    }

    #[test]
    fn truncated_tail_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");

        let mut log = Log::new(path.clone()).unwrap();
        log.write_entry(b"a", Some(b"1")).unwrap();
        let good_len = log.file.metadata().unwrap().len();
        log.write_entry(b"b", Some(b"longer-value")).unwrap();
        // Truncate mid-entry, simulating a torn crash write.
        log.file.set_len(good_len + 3).unwrap();
        drop(log);

        let mut log = Log::new_with_lock(path, false).unwrap();
        let keydir = log.build_keydir().unwrap();
        assert_eq!(keydir.len(), 1);
        assert!(keydir.contains_key(b"a".as_slice()));
        assert_eq!(log.file.metadata().unwrap().len(), good_len);
    }
}
