use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::buffer::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{VellumDBError, VellumDBResult};

/// File-backed page store.
///
/// Pages are fixed-size slices of a single database file addressed by page
/// id. Page 0 is reserved so that `INVALID_PAGE_ID = 0` never aliases real
/// data. Reads past the end of the file come back zeroed, which lets freshly
/// allocated pages be fetched before their first write.
#[derive(Debug)]
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicU32,
    free_pages: Mutex<Vec<PageId>>,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> VellumDBResult<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path.as_ref())?;
        let file_pages = (db_file.metadata()?.len() as usize / PAGE_SIZE) as PageId;
        let next_page_id = file_pages.max(1);
        Ok(Self {
            db_file: Mutex::new(db_file),
            next_page_id: AtomicU32::new(next_page_id),
            free_pages: Mutex::new(Vec::new()),
        })
    }

    pub fn read_page(&self, page_id: PageId) -> VellumDBResult<BytesMut> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumDBError::Storage(
                "read_page: invalid page id".to_string(),
            ));
        }
        let mut buf = BytesMut::zeroed(PAGE_SIZE);
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break, // past EOF: rest stays zeroed
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> VellumDBResult<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumDBError::Storage(
                "write_page: invalid page id".to_string(),
            ));
        }
        if data.len() != PAGE_SIZE {
            return Err(VellumDBError::Storage(format!(
                "write_page: expected {} bytes, got {}",
                PAGE_SIZE,
                data.len()
            )));
        }
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    pub fn allocate_page(&self) -> VellumDBResult<PageId> {
        if let Some(page_id) = self.free_pages.lock().pop() {
            return Ok(page_id);
        }
        Ok(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn deallocate_page(&self, page_id: PageId) -> VellumDBResult<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumDBError::Storage(
                "deallocate_page: invalid page id".to_string(),
            ));
        }
        self.free_pages.lock().push(page_id);
        Ok(())
    }

    pub fn num_allocated_pages(&self) -> u32 {
        self.next_page_id.load(Ordering::SeqCst) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let disk = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();

        let page_id = disk.allocate_page().unwrap();
        let mut data = vec![0u8; PAGE_SIZE];
        data[0] = 0xde;
        data[PAGE_SIZE - 1] = 0xad;
        disk.write_page(page_id, &data).unwrap();

        let read_back = disk.read_page(page_id).unwrap();
        assert_eq!(&read_back[..], &data[..]);
    }

    #[test]
    fn unwritten_page_reads_zeroed() {
        let temp_dir = TempDir::new().unwrap();
        let disk = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();
        let page_id = disk.allocate_page().unwrap();
        let data = disk.read_page(page_id).unwrap();
        assert!(data.iter().all(|b| *b == 0));
    }

    #[test]
    fn deallocated_pages_are_recycled() {
        let temp_dir = TempDir::new().unwrap();
        let disk = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();
        let a = disk.allocate_page().unwrap();
        let b = disk.allocate_page().unwrap();
        assert_ne!(a, b);
        disk.deallocate_page(a).unwrap();
        assert_eq!(disk.allocate_page().unwrap(), a);
    }

    #[test]
    fn page_zero_is_reserved() {
        let temp_dir = TempDir::new().unwrap();
        let disk = DiskManager::try_new(temp_dir.path().join("test.db")).unwrap();
        assert_ne!(disk.allocate_page().unwrap(), INVALID_PAGE_ID);
        assert!(disk.read_page(INVALID_PAGE_ID).is_err());
    }
}
