use super::{RawStore, StorageError};
use std::collections::BTreeMap;

/// RAM backed [`RawStore`] with fault injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, Vec<u8>>,
    capacity: Option<usize>,
    fail_reads: bool,
    fail_writes: bool,
    fail_removes: bool,
    /// Writes that succeed before every further write fails
    writes_before_failure: Option<usize>,
    torn_writes: bool,
    /// Removes that succeed before every further remove fails
    removes_before_failure: Option<usize>,
    write_attempts: usize,
}

impl MemoryStore {
    /// Limit the total number of stored bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn fail_removes(&mut self, fail: bool) {
        self.fail_removes = fail;
    }

    /// Allow `n` more writes, then fail. A torn failure leaves half the
    /// bytes behind, like power loss in the middle of a flash write.
    pub fn fail_after_writes(&mut self, n: usize, torn: bool) {
        self.writes_before_failure = Some(n);
        self.torn_writes = torn;
    }

    /// Allow `n` more removes, then fail.
    pub fn fail_after_removes(&mut self, n: usize) {
        self.removes_before_failure = Some(n);
    }

    /// Every `write` call so far, failed ones included.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts
    }

    /// Flip a byte in a stored blob.
    pub fn corrupt(&mut self, key: &str, offset: usize) {
        if let Some(bytes) = self.entries.get_mut(key) {
            if let Some(b) = bytes.get_mut(offset) {
                *b ^= 0xFF;
            }
        }
    }

    pub fn raw(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn used_excluding(&self, key: &str) -> usize {
        self.entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, v)| v.len())
            .sum()
    }
}

impl RawStore for MemoryStore {
    fn read(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if self.fail_reads {
            return Err(StorageError::ReadFailed(key.to_string()));
        }
        Ok(self.entries.get(key).cloned())
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.write_attempts += 1;
        if self.fail_writes {
            return Err(StorageError::WriteFailed(key.to_string()));
        }
        if let Some(remaining) = self.writes_before_failure {
            if remaining == 0 {
                if self.torn_writes {
                    self.entries
                        .insert(key.to_string(), value[..value.len() / 2].to_vec());
                }
                return Err(StorageError::WriteFailed(key.to_string()));
            }
            self.writes_before_failure = Some(remaining - 1);
        }
        if let Some(capacity) = self.capacity {
            if self.used_excluding(key) + value.len() > capacity {
                return Err(StorageError::Full(key.to_string()));
            }
        }
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        if self.fail_removes {
            return Err(StorageError::EraseFailed(key.to_string()));
        }
        if let Some(remaining) = self.removes_before_failure {
            if remaining == 0 {
                return Err(StorageError::EraseFailed(key.to_string()));
            }
            self.removes_before_failure = Some(remaining - 1);
        }
        self.entries.remove(key);
        Ok(())
    }
}
