//! Purpose: Hold tables in memory and answer segmented scan requests against them.
//! Exports: `MemoryStore`, `MemoryTable`, `segment_of`, `DEFAULT_PAGE_LIMIT`.
//! Role: Reference `Transport` used by the local client, the HTTP server, and tests.
//! Invariants: Every item belongs to exactly one segment for a given segment count.
//! Invariants: Within a segment, items are returned in key order after the exclusive start key.
//! Invariants: The page limit counts evaluated items, so filtered pages may be empty.
use crate::core::attr::{Item, Key, key_of};
use crate::core::error::{Error, ErrorKind};
use crate::core::filter::Filter;
use crate::core::request::{ScanRequest, ScanResponse};
use crate::core::transport::Transport;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::ops::Bound;

pub const DEFAULT_PAGE_LIMIT: u32 = 100;

#[derive(Clone, Debug)]
pub struct MemoryTable {
    name: String,
    key_attributes: Vec<String>,
    items: BTreeMap<Key, Item>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>, key_attributes: Vec<String>) -> Self {
        Self {
            name: name.into(),
            key_attributes,
            items: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_attributes(&self) -> &[String] {
        &self.key_attributes
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts or replaces the item stored under its key.
    pub fn insert(&mut self, item: Item) -> Result<(), Error> {
        let key = key_of(&item, &self.key_attributes).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "item is missing key attributes {:?}",
                    self.key_attributes
                ))
                .with_table(self.name.clone())
        })?;
        self.items.insert(key, item);
        Ok(())
    }

    fn scan(&self, request: &ScanRequest, default_limit: u32) -> Result<ScanResponse, Error> {
        if request.total_segments == 0 || request.segment >= request.total_segments {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "segment {} is outside total segments {}",
                    request.segment, request.total_segments
                ))
                .with_table(self.name.clone()));
        }
        let filter = request.filter.as_ref().map(Filter::compile).transpose()?;
        let limit = request.limit.unwrap_or(default_limit).max(1) as usize;

        let start = match request.exclusive_start_key.as_ref().filter(|key| !key.is_empty()) {
            Some(key) => {
                if segment_of(key, request.total_segments)? != request.segment {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("exclusive start key belongs to a different segment")
                        .with_table(self.name.clone())
                        .with_segment(request.segment));
                }
                Bound::Excluded(key.clone())
            }
            None => Bound::Unbounded,
        };

        let mut candidates = self
            .items
            .range((start, Bound::Unbounded))
            .filter(|(key, _)| {
                segment_of(key, request.total_segments)
                    .is_ok_and(|segment| segment == request.segment)
            })
            .peekable();

        let mut items = Vec::new();
        let mut scanned = 0_u32;
        let mut last_key = None;
        while scanned < limit as u32 {
            let Some((key, item)) = candidates.next() else {
                break;
            };
            scanned += 1;
            last_key = Some(key);
            if filter.as_ref().is_none_or(|filter| filter.matches(item)) {
                items.push(item.clone());
            }
        }
        let last_evaluated_key = match (last_key, candidates.peek()) {
            (Some(key), Some(_)) => Some(key.clone()),
            _ => None,
        };

        Ok(ScanResponse {
            count: items.len() as u32,
            items,
            last_evaluated_key,
            scanned_count: scanned,
        })
    }
}

/// Deterministic segment for `key` out of `total_segments`.
pub fn segment_of(key: &Key, total_segments: u32) -> Result<u32, Error> {
    let encoded = serde_json::to_vec(key).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode key")
            .with_source(err)
    })?;
    let digest = Sha256::digest(&encoded);
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    Ok(prefix % total_segments.max(1))
}

#[derive(Clone, Debug)]
pub struct MemoryStore {
    tables: BTreeMap<String, MemoryTable>,
    page_limit: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn with_page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    pub fn with_table(mut self, table: MemoryTable) -> Self {
        self.insert_table(table);
        self
    }

    pub fn insert_table(&mut self, table: MemoryTable) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn table(&self, name: &str) -> Option<&MemoryTable> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn page_limit(&self) -> u32 {
        self.page_limit
    }

    pub fn scan(&self, request: &ScanRequest) -> Result<ScanResponse, Error> {
        let table = self.tables.get(&request.table).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("table not found")
                .with_table(request.table.clone())
        })?;
        table.scan(request, self.page_limit)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryStore {
    async fn execute(&self, request: ScanRequest) -> Result<ScanResponse, Error> {
        self.scan(&request)
    }
}
