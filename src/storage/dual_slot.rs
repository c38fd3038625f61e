//! Two-generation storage: every key owns slots `<key>.a`, `<key>.b` and an
//! active-slot marker `<key>.m`.
//!
//! A write goes to the slot the marker does not point at, is read back and
//! checked, and only then is the marker flipped. Losing power at any point
//! leaves either the previous or the new value readable, never neither.

use super::{KeyValueStore, RawStore, StorageError};

/// NVS keys are limited to 15 characters.
const MAX_RAW_KEY_LEN: usize = 15;
const HEADER_LEN: usize = 8;
pub const MAX_PAYLOAD_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    A,
    B,
}

impl Slot {
    fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Slot::A => ".a",
            Slot::B => ".b",
        }
    }

    fn marker_byte(self) -> u8 {
        match self {
            Slot::A => b'a',
            Slot::B => b'b',
        }
    }

    fn from_marker(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [b'a'] => Some(Slot::A),
            [b'b'] => Some(Slot::B),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum SlotContent {
    Missing,
    Invalid,
    Valid { generation: u32, payload: Vec<u8> },
}

impl SlotContent {
    fn generation(&self) -> Option<u32> {
        match self {
            SlotContent::Valid { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}

fn checksum(generation: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&generation.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn encode(generation: u32, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.extend_from_slice(&generation.to_le_bytes());
    record.extend_from_slice(&checksum(generation, payload).to_le_bytes());
    record.extend_from_slice(payload);
    record
}

fn decode(record: &[u8]) -> SlotContent {
    if record.len() < HEADER_LEN {
        return SlotContent::Invalid;
    }
    let (header, payload) = record.split_at(HEADER_LEN);
    let generation = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if crc != checksum(generation, payload) {
        return SlotContent::Invalid;
    }
    SlotContent::Valid {
        generation,
        payload: payload.to_vec(),
    }
}

/// Newer of two generations, tolerant of counter wrap.
fn newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

pub struct DualSlotStore<R: RawStore> {
    backend: R,
}

impl<R: RawStore> DualSlotStore<R> {
    pub fn new(backend: R) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &R {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut R {
        &mut self.backend
    }

    fn raw_key(key: &str, suffix: &str) -> Result<String, StorageError> {
        if key.is_empty() || key.len() + suffix.len() > MAX_RAW_KEY_LEN {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(format!("{key}{suffix}"))
    }

    fn read_marker(&mut self, key: &str) -> Result<Option<Slot>, StorageError> {
        let marker_key = Self::raw_key(key, ".m")?;
        Ok(self
            .backend
            .read(&marker_key)?
            .and_then(|bytes| Slot::from_marker(&bytes)))
    }

    fn read_slot(&mut self, key: &str, slot: Slot) -> Result<SlotContent, StorageError> {
        let slot_key = Self::raw_key(key, slot.suffix())?;
        Ok(match self.backend.read(&slot_key)? {
            None => SlotContent::Missing,
            Some(record) => decode(&record),
        })
    }

    fn pick(a: SlotContent, b: SlotContent) -> (Slot, SlotContent) {
        match (a.generation(), b.generation()) {
            (Some(ga), Some(gb)) if newer(gb, ga) => (Slot::B, b),
            (Some(_), _) => (Slot::A, a),
            (None, Some(_)) => (Slot::B, b),
            (None, None) => (Slot::A, a),
        }
    }
}

impl<R: RawStore> KeyValueStore for DualSlotStore<R> {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let marker = self.read_marker(key)?;
        let a = self.read_slot(key, Slot::A)?;
        let b = self.read_slot(key, Slot::B)?;

        let any_present = !matches!(a, SlotContent::Missing) || !matches!(b, SlotContent::Missing);

        let chosen = match marker {
            Some(Slot::A) if matches!(a, SlotContent::Valid { .. }) => a,
            Some(Slot::B) if matches!(b, SlotContent::Valid { .. }) => b,
            Some(active) => {
                log::warn!("NVS: Active slot {:?} of '{}' unreadable, using fallback", active, key);
                Self::pick(a, b).1
            }
            None => Self::pick(a, b).1,
        };

        match chosen {
            SlotContent::Valid { payload, .. } => Ok(Some(payload)),
            _ if any_present => Err(StorageError::Corrupt(key.to_string())),
            _ => Ok(None),
        }
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if value.len() > MAX_PAYLOAD_LEN {
            return Err(StorageError::TooLarge {
                len: value.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let marker = self.read_marker(key)?;
        let a = self.read_slot(key, Slot::A)?;
        let b = self.read_slot(key, Slot::B)?;

        let latest = match (a.generation(), b.generation()) {
            (Some(ga), Some(gb)) => Some(if newer(gb, ga) { gb } else { ga }),
            (ga, gb) => ga.or(gb),
        };
        let (newest_slot, _) = Self::pick(a, b);

        // Never overwrite the slot the marker vouches for
        let target = match marker {
            Some(active) => active.other(),
            None if latest.is_some() => newest_slot.other(),
            None => Slot::A,
        };
        let generation = latest.map_or(1, |g| g.wrapping_add(1));

        let slot_key = Self::raw_key(key, target.suffix())?;
        let record = encode(generation, value);
        self.backend.write(&slot_key, &record)?;

        match self.backend.read(&slot_key)? {
            Some(readback) if readback == record => {}
            _ => return Err(StorageError::VerifyFailed(key.to_string())),
        }

        let marker_key = Self::raw_key(key, ".m")?;
        self.backend.write(&marker_key, &[target.marker_byte()])?;
        Ok(())
    }

    fn erase(&mut self, key: &str) -> Result<(), StorageError> {
        let marker_key = Self::raw_key(key, ".m")?;
        let active = match self.read_marker(key).ok().flatten() {
            Some(slot) => slot,
            None => {
                let a = self.read_slot(key, Slot::A).unwrap_or(SlotContent::Invalid);
                let b = self.read_slot(key, Slot::B).unwrap_or(SlotContent::Invalid);
                Self::pick(a, b).0
            }
        };

        // Inactive slot first: it may hold an uncommitted write, which must
        // never outlive the marker.
        self.backend
            .remove(&Self::raw_key(key, active.other().suffix())?)?;
        self.backend.remove(&marker_key)?;
        self.backend.remove(&Self::raw_key(key, active.suffix())?)?;
        Ok(())
    }
}
