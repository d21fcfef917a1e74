use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Read, Write},
    path::Path,
    sync::Mutex,
};

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut};

struct WalInner {
    writer: BufWriter<File>,
    // Byte offset of the next record; doubles as a monotonically growing
    // log sequence number.
    offset: u64,
}

/// Append-only write-ahead log. The buffer pool forces it to the OS before
/// any dirty page leaves the cache, so log records always reach the file
/// ahead of the page bytes they describe.
pub struct Wal {
    inner: Mutex<WalInner>,
}

impl Wal {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .create_new(true)
            .write(true)
            .open(path)
            .context("failed to create WAL")?;

        Ok(Wal {
            inner: Mutex::new(WalInner {
                writer: BufWriter::new(file),
                offset: 0,
            }),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&path)
            .context("failed to open WAL")?;
        let offset = file.metadata().context("failed to stat WAL")?.len();

        Ok(Wal {
            inner: Mutex::new(WalInner {
                writer: BufWriter::new(file),
                offset,
            }),
        })
    }

    // Appends one length-prefixed record and returns its offset in the log.
    pub fn append(&self, record: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();

        let mut frame = Vec::with_capacity(4 + record.len());
        frame.put_u32_le(record.len() as u32);
        frame.put_slice(record);

        inner
            .writer
            .write_all(&frame)
            .context("failed to append WAL record")?;

        let offset = inner.offset;
        inner.offset += frame.len() as u64;
        Ok(offset)
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.writer.flush().context("failed to flush WAL")
    }

    // Replays every record currently in the log file.
    pub fn recover(path: impl AsRef<Path>) -> Result<Vec<Vec<u8>>> {
        let mut file = File::open(&path).context("failed to open WAL for recovery")?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .context("failed to read WAL for recovery")?;

        let mut buf = &raw[..];
        let mut records = Vec::new();
        while buf.remaining() >= 4 {
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                bail!("truncated WAL record of {} bytes", len);
            }
            records.push(buf.copy_to_bytes(len).to_vec());
        }

        Ok(records)
    }
}

#[cfg(test)]
pub mod test {
    use tempfile::tempdir;

    use super::Wal;

    #[test]
    fn append_flush_recover() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("basalt.wal");

        let wal = Wal::create(&path).unwrap();
        let first = wal.append(b"begin").unwrap();
        let second = wal.append(b"update page 0").unwrap();
        wal.flush().unwrap();

        assert_eq!(first, 0);
        assert!(second > first);

        let records = Wal::recover(&path).unwrap();
        assert_eq!(records, vec![b"begin".to_vec(), b"update page 0".to_vec()]);
    }

    #[test]
    fn reopen_continues_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("basalt.wal");

        {
            let wal = Wal::create(&path).unwrap();
            wal.append(b"first").unwrap();
            wal.flush().unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        let offset = wal.append(b"second").unwrap();
        wal.flush().unwrap();

        assert_eq!(offset, (4 + b"first".len()) as u64);
        assert_eq!(Wal::recover(&path).unwrap().len(), 2);
    }
}
