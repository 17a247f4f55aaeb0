//! Backing store: raw page I/O against a file or an in-process page array.
//!
//! The file store owns the optional crypto backend. Page 0 (the meta page)
//! is always stored plaintext — it carries no user data and must be readable
//! before the encryption flag and KDF salt are known. Pages >= 1 are
//! encrypted when the database was created with a crypto backend; the
//! on-disk slot size then grows by the AEAD overhead.
//!
//! Checksums live here too: recomputed before every write, verified on
//! every read (after decryption, per the crypto contract). The memory store
//! needs neither — its pages never leave the process.

use std::fs::{File, OpenOptions};
use std::sync::Arc;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::crypto::{page_aad, CryptoBackend, DOMAIN_PAGE};
use crate::error::{KuraError, Result};
use crate::storage::page::{Page, PageId, PageType, PAGE_SIZE};

const MAGIC: &[u8; 8] = b"KURADB01";
pub const FORMAT_VERSION: u32 = 1;

/// Meta flag bit: pages >= 1 are AEAD-wrapped.
pub const FLAG_ENCRYPTED: u32 = 1;

/// Serialized meta block size (stored as cell 0 of page 0).
const META_SIZE: usize = 80;

/// Nonce-counter slack applied at open so a crash between meta flushes can
/// never reuse a counter value.
const WRITE_COUNTER_SLACK: u64 = 1 << 16;

/// Decoded meta page (page 0).
#[derive(Debug, Clone)]
pub struct Meta {
    pub version: u32,
    pub page_size: u32,
    pub page_count: u32,
    pub catalog_root: PageId,
    pub freelist_head: PageId,
    pub checkpoint_lsn: u64,
    pub next_txid: u64,
    pub write_counter: u64,
    pub db_id: u64,
    pub flags: u32,
    pub salt: [u8; 16],
}

impl Meta {
    pub fn new(db_id: u64, encrypted: bool, salt: [u8; 16]) -> Self {
        Meta {
            version: FORMAT_VERSION,
            page_size: PAGE_SIZE as u32,
            page_count: 1, // page 0 is the meta page
            catalog_root: 0,
            freelist_head: 0,
            checkpoint_lsn: 0,
            next_txid: 1,
            write_counter: 0,
            db_id,
            flags: if encrypted { FLAG_ENCRYPTED } else { 0 },
            salt,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Build the meta page image.
    pub fn encode_page(&self) -> Page {
        let mut buf = [0u8; META_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.page_count.to_le_bytes());
        buf[20..24].copy_from_slice(&self.catalog_root.to_le_bytes());
        buf[24..28].copy_from_slice(&self.freelist_head.to_le_bytes());
        buf[28..36].copy_from_slice(&self.checkpoint_lsn.to_le_bytes());
        buf[36..44].copy_from_slice(&self.next_txid.to_le_bytes());
        buf[44..52].copy_from_slice(&self.write_counter.to_le_bytes());
        buf[52..60].copy_from_slice(&self.db_id.to_le_bytes());
        buf[60..64].copy_from_slice(&self.flags.to_le_bytes());
        buf[64..80].copy_from_slice(&self.salt);

        let mut page = Page::new(0, PageType::Meta);
        page.push_cell(&buf).expect("meta block fits in page 0");
        page
    }

    pub fn decode_page(page: &Page) -> Result<Self> {
        let buf = page
            .cell(0)
            .ok_or_else(|| KuraError::Corruption("meta page has no header cell".into()))?;
        if buf.len() < META_SIZE {
            return Err(KuraError::Corruption("meta block truncated".into()));
        }
        if &buf[0..8] != MAGIC {
            return Err(KuraError::Corruption("bad database magic".into()));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version > FORMAT_VERSION {
            return Err(KuraError::Corruption(format!(
                "unsupported format version {}",
                version
            )));
        }
        let page_size = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        if page_size != PAGE_SIZE as u32 {
            return Err(KuraError::Corruption(format!(
                "unsupported page size {}",
                page_size
            )));
        }
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&buf[64..80]);
        Ok(Meta {
            version,
            page_size,
            page_count: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            catalog_root: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            freelist_head: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            checkpoint_lsn: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
            next_txid: u64::from_le_bytes(buf[36..44].try_into().unwrap()),
            write_counter: u64::from_le_bytes(buf[44..52].try_into().unwrap()),
            db_id: u64::from_le_bytes(buf[52..60].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[60..64].try_into().unwrap()),
            salt,
        })
    }
}

/// Read and decode page 0 without committing to an encryption mode.
pub fn probe_meta(path: &Path) -> Result<Meta> {
    let mut file = File::open(path)?;
    let mut data = Box::new([0u8; PAGE_SIZE]);
    file.read_exact(&mut data[..])?;
    let page = Page::from_bytes(0, data);
    page.verify_checksum()?;
    Meta::decode_page(&page)
}

pub enum BackingStore {
    File(FileStore),
    Memory(MemStore),
}

impl BackingStore {
    pub fn read_page(&mut self, pid: PageId) -> Result<Page> {
        match self {
            BackingStore::File(s) => s.read_page(pid),
            BackingStore::Memory(s) => s.read_page(pid),
        }
    }

    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        match self {
            BackingStore::File(s) => s.write_page(page),
            BackingStore::Memory(s) => s.write_page(page),
        }
    }

    pub fn sync(&mut self) -> Result<()> {
        match self {
            BackingStore::File(s) => s.sync(),
            BackingStore::Memory(_) => Ok(()),
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, BackingStore::Memory(_))
    }

    pub fn write_counter(&self) -> u64 {
        match self {
            BackingStore::File(s) => s.write_counter,
            BackingStore::Memory(_) => 0,
        }
    }
}

pub struct FileStore {
    file: File,
    crypto: Option<Arc<dyn CryptoBackend>>,
    db_id: u64,
    disk_page_size: usize,
    write_counter: u64,
}

impl FileStore {
    pub fn create(path: &Path, crypto: Option<Arc<dyn CryptoBackend>>, db_id: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self::build(file, crypto, db_id, 0))
    }

    pub fn open(path: &Path, crypto: Option<Arc<dyn CryptoBackend>>, meta: &Meta) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let counter = meta.write_counter.saturating_add(WRITE_COUNTER_SLACK);
        Ok(Self::build(file, crypto, meta.db_id, counter))
    }

    fn build(
        file: File,
        crypto: Option<Arc<dyn CryptoBackend>>,
        db_id: u64,
        write_counter: u64,
    ) -> Self {
        let disk_page_size = match &crypto {
            Some(c) => PAGE_SIZE + c.overhead(),
            None => PAGE_SIZE,
        };
        FileStore {
            file,
            crypto,
            db_id,
            disk_page_size,
            write_counter,
        }
    }

    fn offset(&self, pid: PageId) -> u64 {
        pid as u64 * self.disk_page_size as u64
    }

    pub fn read_page(&mut self, pid: PageId) -> Result<Page> {
        self.file.seek(SeekFrom::Start(self.offset(pid)))?;

        // Page 0 is plaintext regardless of mode.
        let page = if pid != 0 && self.crypto.is_some() {
            let mut encrypted = vec![0u8; self.disk_page_size];
            self.file.read_exact(&mut encrypted)?;
            let crypto = self.crypto.as_ref().unwrap();
            let plaintext = crypto.decrypt(&page_aad(self.db_id, pid), &encrypted)?;
            if plaintext.len() != PAGE_SIZE {
                return Err(KuraError::Corruption(format!(
                    "page {} decrypted to {} bytes",
                    pid,
                    plaintext.len()
                )));
            }
            let mut data = Box::new([0u8; PAGE_SIZE]);
            data.copy_from_slice(&plaintext);
            Page::from_bytes(pid, data)
        } else {
            let mut data = Box::new([0u8; PAGE_SIZE]);
            self.file.read_exact(&mut data[..])?;
            Page::from_bytes(pid, data)
        };

        page.verify_checksum()?;
        Ok(page)
    }

    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        let mut out = page.clone();
        out.update_checksum();

        self.file.seek(SeekFrom::Start(self.offset(page.id)))?;
        if page.id != 0 && self.crypto.is_some() {
            let crypto = self.crypto.as_ref().unwrap();
            let counter = self.write_counter;
            self.write_counter += 1;
            let encrypted = crypto.encrypt(
                DOMAIN_PAGE,
                counter,
                &page_aad(self.db_id, page.id),
                &out.data[..],
            )?;
            self.file.write_all(&encrypted)?;
        } else {
            self.file.write_all(&out.data[..])?;
            if self.crypto.is_some() {
                // Keep the page-0 slot the full on-disk size.
                let pad = vec![0u8; self.disk_page_size - PAGE_SIZE];
                self.file.write_all(&pad)?;
            }
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

pub struct MemStore {
    pages: Vec<Option<Page>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore { pages: Vec::new() }
    }

    pub fn read_page(&mut self, pid: PageId) -> Result<Page> {
        self.pages
            .get(pid as usize)
            .and_then(|p| p.clone())
            .ok_or_else(|| KuraError::Internal(format!("page {} not found", pid)))
    }

    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        let idx = page.id as usize;
        if idx >= self.pages.len() {
            self.pages.resize(idx + 1, None);
        }
        self.pages[idx] = Some(page.clone());
        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::{AeadBackend, MasterKey};
    use tempfile::TempDir;

    fn meta_page(meta: &Meta) -> Page {
        meta.encode_page()
    }

    #[test]
    fn test_meta_roundtrip() {
        let mut meta = Meta::new(0xDEADBEEF, true, [7u8; 16]);
        meta.page_count = 42;
        meta.catalog_root = 5;
        meta.checkpoint_lsn = 99;
        let page = meta_page(&meta);
        let decoded = Meta::decode_page(&page).unwrap();
        assert_eq!(decoded.page_count, 42);
        assert_eq!(decoded.catalog_root, 5);
        assert_eq!(decoded.checkpoint_lsn, 99);
        assert_eq!(decoded.db_id, 0xDEADBEEF);
        assert!(decoded.is_encrypted());
        assert_eq!(decoded.salt, [7u8; 16]);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let mut store = FileStore::create(&path, None, 1).unwrap();

        let mut page = Page::new(1, PageType::Leaf);
        page.push_cell(b"hello").unwrap();
        // Page 0 must exist so offsets line up.
        store.write_page(&Meta::new(1, false, [0u8; 16]).encode_page()).unwrap();
        store.write_page(&page).unwrap();

        let read = store.read_page(1).unwrap();
        assert_eq!(read.cell(0), Some(b"hello".as_slice()));
    }

    #[test]
    fn test_encrypted_store_wrong_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("enc.db");

        let key = MasterKey::new([0x42u8; 32]);
        let crypto: Arc<dyn CryptoBackend> = Arc::new(AeadBackend::new(&key));
        let mut store = FileStore::create(&path, Some(crypto), 9).unwrap();
        store.write_page(&Meta::new(9, true, [0u8; 16]).encode_page()).unwrap();
        let mut page = Page::new(1, PageType::Leaf);
        page.push_cell(b"secret").unwrap();
        store.write_page(&page).unwrap();
        drop(store);

        // Correct key reads back.
        let meta = probe_meta(&path).unwrap();
        assert!(meta.is_encrypted());
        let crypto: Arc<dyn CryptoBackend> = Arc::new(AeadBackend::new(&key));
        let mut store = FileStore::open(&path, Some(crypto), &meta).unwrap();
        assert_eq!(store.read_page(1).unwrap().cell(0), Some(b"secret".as_slice()));

        // Wrong key fails authentication.
        let wrong: Arc<dyn CryptoBackend> =
            Arc::new(AeadBackend::new(&MasterKey::new([0x99u8; 32])));
        let mut store = FileStore::open(&path, Some(wrong), &meta).unwrap();
        assert!(matches!(store.read_page(1), Err(KuraError::Crypto(_))));
    }

    #[test]
    fn test_corrupted_page_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.db");
        let mut store = FileStore::create(&path, None, 1).unwrap();
        store.write_page(&Meta::new(1, false, [0u8; 16]).encode_page()).unwrap();
        let mut page = Page::new(1, PageType::Leaf);
        page.push_cell(b"data").unwrap();
        store.write_page(&page).unwrap();
        drop(store);

        // Flip a byte inside page 1's body.
        use std::io::{Seek, SeekFrom, Write};
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(PAGE_SIZE as u64 + 200)).unwrap();
        f.write_all(&[0xFF]).unwrap();
        drop(f);

        let meta = probe_meta(&path).unwrap();
        let mut store = FileStore::open(&path, None, &meta).unwrap();
        assert!(matches!(
            store.read_page(1),
            Err(KuraError::Corruption(_))
        ));
    }

    #[test]
    fn test_mem_store() {
        let mut store = MemStore::new();
        let mut page = Page::new(3, PageType::Leaf);
        page.push_cell(b"mem").unwrap();
        store.write_page(&page).unwrap();
        assert_eq!(store.read_page(3).unwrap().cell(0), Some(b"mem".as_slice()));
        assert!(store.read_page(4).is_err());
    }
}
