// Resume points for interrupted scans, tracked per segment.
use crate::core::attr::Key;
use crate::core::request::Page;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a segment continues on the next call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Resume {
    /// Fetch from `start_key` (or the segment start) and drop the first `skip` items.
    At {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_key: Option<Key>,
        #[serde(default)]
        skip: usize,
    },
    Exhausted,
}

impl Resume {
    pub fn beginning() -> Self {
        Self::At {
            start_key: None,
            skip: 0,
        }
    }
}

/// Position of one delivered record inside its segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentPosition {
    pub segment: u32,
    /// The last-evaluated-key of the page the record came from; `None` on a terminal page.
    pub page_cursor: Option<Key>,
    /// Exact resume point immediately after this record.
    pub resume: Resume,
}

/// Everything the decode stage keeps about a page once its items are moved out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PageMark {
    pub segment: u32,
    pub start_key: Option<Key>,
    pub skipped: usize,
    pub continuation: Option<Key>,
    pub len: usize,
}

impl PageMark {
    pub fn new(segment: u32, page: &Page) -> Self {
        Self {
            segment,
            start_key: page.start_key.clone(),
            skipped: page.skipped,
            continuation: page.response.continuation().cloned(),
            len: page.response.items.len(),
        }
    }

    /// Position after `delivered` kept items of this page.
    pub fn position_after(&self, delivered: usize) -> SegmentPosition {
        let resume = if delivered >= self.len {
            self.end()
        } else {
            Resume::At {
                start_key: self.start_key.clone(),
                skip: self.skipped + delivered,
            }
        };
        SegmentPosition {
            segment: self.segment,
            page_cursor: self.continuation.clone(),
            resume,
        }
    }

    pub fn end(&self) -> Resume {
        match &self.continuation {
            Some(key) => Resume::At {
                start_key: Some(key.clone()),
                skip: 0,
            },
            None => Resume::Exhausted,
        }
    }
}

/// Resume state of a whole scan; feed it back through `ScanOptions::resume_from`.
///
/// Segments missing from `segments` start from the beginning. A cursor with a
/// `table` only resumes that table with the same filter; one without resumes any scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub total_segments: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// `Predicate::digest` of the filter; absent for unfiltered scans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_digest: Option<String>,
    #[serde(default)]
    pub segments: BTreeMap<u32, Resume>,
}

impl ScanCursor {
    pub fn new(total_segments: u32) -> Self {
        Self {
            total_segments,
            table: None,
            filter_digest: None,
            segments: BTreeMap::new(),
        }
    }

    pub fn bound_to(mut self, table: impl Into<String>, filter_digest: Option<String>) -> Self {
        self.table = Some(table.into());
        self.filter_digest = filter_digest;
        self
    }

    pub fn resume_for(&self, segment: u32) -> Resume {
        self.segments
            .get(&segment)
            .cloned()
            .unwrap_or_else(Resume::beginning)
    }

    pub fn set(&mut self, segment: u32, resume: Resume) {
        self.segments.insert(segment, resume);
    }

    pub fn advance(&mut self, position: &SegmentPosition) {
        self.set(position.segment, position.resume.clone());
    }

    pub fn is_complete(&self) -> bool {
        (0..self.total_segments)
            .all(|segment| matches!(self.segments.get(&segment), Some(Resume::Exhausted)))
    }
}
