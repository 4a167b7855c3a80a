use super::{PageNumber, PageStore};
use crate::error::{TxError, TxResult};
use std::path::Path;

/// 基于 sled 的持久化页存储
///
/// 页以大端页号为键保存在 `pages` 树中，元数据在 `meta` 树中。
pub struct SledPageStore {
    db: sled::Db,
    pages: sled::Tree,
    meta: sled::Tree,
}

impl SledPageStore {
    pub fn new<P: AsRef<Path>>(path: P) -> TxResult<Self> {
        let db = sled::open(path)?;
        let pages = db.open_tree("pages")?;
        let meta = db.open_tree("meta")?;
        Ok(Self { db, pages, meta })
    }

    /// 临时数据库，关闭后删除
    pub fn temporary() -> TxResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let pages = db.open_tree("pages")?;
        let meta = db.open_tree("meta")?;
        Ok(Self { db, pages, meta })
    }

    fn page_key(page: PageNumber) -> [u8; 4] {
        page.to_be_bytes()
    }

    fn decode_key(key: &[u8]) -> TxResult<PageNumber> {
        let bytes: [u8; 4] = key.try_into().map_err(|_| TxError::CorruptPage {
            page: 0,
            reason: format!("bad page key length {}", key.len()),
        })?;
        Ok(PageNumber::from_be_bytes(bytes))
    }
}

impl PageStore for SledPageStore {
    fn read_page(&self, page: PageNumber) -> TxResult<Option<Vec<u8>>> {
        Ok(self.pages.get(Self::page_key(page))?.map(|v| v.to_vec()))
    }

    fn write_page(&self, page: PageNumber, data: &[u8]) -> TxResult<()> {
        self.pages.insert(Self::page_key(page), data)?;
        Ok(())
    }

    fn page_count(&self) -> TxResult<PageNumber> {
        match self.pages.last()? {
            Some((key, _)) => Ok(Self::decode_key(&key)? + 1),
            None => Ok(0),
        }
    }

    fn sync(&self) -> TxResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn read_meta(&self, key: &str) -> TxResult<Option<Vec<u8>>> {
        Ok(self.meta.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn write_meta(&self, key: &str, value: &[u8]) -> TxResult<()> {
        self.meta.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn delete_meta(&self, key: &str) -> TxResult<()> {
        self.meta.remove(key.as_bytes())?;
        Ok(())
    }

    fn meta_keys(&self, prefix: &str) -> TxResult<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.meta.scan_prefix(prefix.as_bytes()).keys() {
            let key = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sled_pages_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledPageStore::new(dir.path()).unwrap();
            store.write_page(0, &[7; 16]).unwrap();
            store.write_page(258, &[9; 16]).unwrap();
            store.write_meta("tip.inventory", b"[1]").unwrap();
            store.sync().unwrap();
        }
        let store = SledPageStore::new(dir.path()).unwrap();
        // 大端键保证 page_count 按数值排序
        assert_eq!(store.page_count().unwrap(), 259);
        assert_eq!(store.read_page(258).unwrap(), Some(vec![9; 16]));
        assert_eq!(store.read_meta("tip.inventory").unwrap(), Some(b"[1]".to_vec()));
    }
}
