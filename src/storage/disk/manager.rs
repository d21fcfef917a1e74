use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use log::{debug, trace};

use crate::storage::page::page::{page_constants::PAGE_SIZE, PageId};

// The narrow capability surface the buffer pool consumes. Injected at pool
// construction so tests can substitute a mock.
pub trait DiskManager: Send {
    // Overwrites `buf` with the page's on-disk bytes.
    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()>;
    fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()>;
    // A hint; implementations may treat it as a no-op.
    fn deallocate_page(&mut self, page_id: PageId) -> Result<()>;
}

/// Page store backed by a single database file. Pages live at
/// `page_id * PAGE_SIZE`; reads past the end of the file yield zeroes, which
/// is what a never-written page looks like.
pub struct FileDiskManager {
    db_io: File,
    db_path: PathBuf,
    num_writes: u32,
    num_flushes: u32,
}

impl FileDiskManager {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db_io = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open database file {}", path.display()))?;

        Ok(FileDiskManager {
            db_io,
            db_path: path.to_path_buf(),
            num_writes: 0,
            num_flushes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn num_writes(&self) -> u32 {
        self.num_writes
    }

    pub fn num_flushes(&self) -> u32 {
        self.num_flushes
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id as u64 * PAGE_SIZE as u64
    }
}

impl DiskManager for FileDiskManager {
    fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            bail!(
                "write of {} bytes to page {}, expected a full page",
                data.len(),
                page_id
            );
        }

        self.db_io
            .seek(SeekFrom::Start(Self::page_offset(page_id)))
            .with_context(|| format!("I/O error while seeking page {}", page_id))?;
        self.db_io
            .write_all(data)
            .with_context(|| format!("I/O error while writing page {}", page_id))?;
        self.db_io
            .flush()
            .with_context(|| format!("error flushing page {}", page_id))?;

        self.num_writes += 1;
        self.num_flushes += 1;
        trace!("wrote page {} to {}", page_id, self.db_path.display());

        Ok(())
    }

    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            bail!(
                "read of {} bytes from page {}, expected a full page",
                buf.len(),
                page_id
            );
        }

        self.db_io
            .seek(SeekFrom::Start(Self::page_offset(page_id)))
            .with_context(|| format!("I/O error while seeking page {}", page_id))?;

        // The file grows lazily; a page beyond the current end, or a tail
        // that was never written, reads back as zeroes.
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .db_io
                .read(&mut buf[filled..])
                .with_context(|| format!("I/O error while reading page {}", page_id))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < buf.len() {
            debug!(
                "short read of page {} ({} of {} bytes), zero filling the rest",
                page_id,
                filled,
                buf.len()
            );
            buf[filled..].fill(0);
        }

        Ok(())
    }

    fn deallocate_page(&mut self, page_id: PageId) -> Result<()> {
        // The slot is left in place; monotonic allocation means the id will
        // never be handed out again.
        trace!("deallocate hint for page {}", page_id);
        Ok(())
    }
}

#[cfg(test)]
pub mod test {
    use tempfile::tempdir;

    use super::{DiskManager, FileDiskManager};
    use crate::storage::page::page::page_constants::PAGE_SIZE;

    #[test]
    fn db_io_round_trip() {
        let dir = tempdir().unwrap();
        let mut manager = FileDiskManager::new(dir.path().join("test.db")).unwrap();

        let data = [7u8; PAGE_SIZE];
        let mut buffer = [0u8; PAGE_SIZE];

        manager.write_page(3, &data).unwrap();
        manager.read_page(3, &mut buffer).unwrap();

        assert_eq!(data, buffer, "page read mismatch");
        assert_eq!(manager.num_writes(), 1);
    }

    #[test]
    fn unwritten_page_reads_as_zeroes() {
        let dir = tempdir().unwrap();
        let mut manager = FileDiskManager::new(dir.path().join("test.db")).unwrap();

        manager.write_page(0, &[1u8; PAGE_SIZE]).unwrap();

        // Page 5 was never written; the file ends long before its offset.
        let mut buffer = [9u8; PAGE_SIZE];
        manager.read_page(5, &mut buffer).unwrap();
        assert!(buffer.iter().all(|b| *b == 0));
    }

    #[test]
    fn partial_page_write_is_refused() {
        let dir = tempdir().unwrap();
        let mut manager = FileDiskManager::new(dir.path().join("test.db")).unwrap();

        assert!(manager.write_page(0, &[0u8; 16]).is_err());
    }
}
