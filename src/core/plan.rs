//! Purpose: Validate scan options and describe one scan's shared, read-only parameters.
//! Exports: `ScanOptions`, `ScanStart`, `ScanPlan`, `SegmentStart`, `plan_scan`.
//! Role: Pure planning layer used by the orchestrator; performs no I/O.
//! Invariants: Segment indexes are dense in `[0, total_segments)` and assigned once.
//! Invariants: Every request of a scan carries the same filter, consistency, and limit.
//! Invariants: An empty filter expression is rejected here, before any request exists.
use crate::core::attr::Key;
use crate::core::cursor::{Resume, ScanCursor};
use crate::core::error::{Error, ErrorKind};
use crate::core::request::{Predicate, ScanRequest, SegmentDescriptor};

/// Upper bound on segments per scan, matching the store's own segment limit.
pub const MAX_PARALLELISM: u32 = 1_000_000;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ScanStart {
    #[default]
    Beginning,
    /// The same exclusive start key for every segment (single-segment scans only).
    StartKey(Key),
    /// Per-segment resume points captured from an earlier scan.
    Cursor(ScanCursor),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanOptions {
    pub parallelism: u32,
    pub consistent_read: bool,
    pub page_limit: Option<u32>,
    pub start: ScanStart,
}

impl ScanOptions {
    pub fn new(parallelism: u32) -> Self {
        Self {
            parallelism,
            consistent_read: false,
            page_limit: None,
            start: ScanStart::Beginning,
        }
    }

    pub fn with_consistent_read(mut self, consistent_read: bool) -> Self {
        self.consistent_read = consistent_read;
        self
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = Some(limit);
        self
    }

    pub fn with_start_key(mut self, key: Key) -> Self {
        self.start = ScanStart::StartKey(key);
        self
    }

    pub fn resume_from(mut self, cursor: ScanCursor) -> Self {
        self.start = ScanStart::Cursor(cursor);
        self
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Where one segment's pagination loop begins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentStart {
    pub start_key: Option<Key>,
    pub skip: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanPlan {
    pub table: String,
    pub filter: Option<Predicate>,
    pub consistent_read: bool,
    pub total_segments: u32,
    pub limit: Option<u32>,
    filter_digest: Option<String>,
    starts: Vec<Option<SegmentStart>>,
}

impl ScanPlan {
    /// Builds the request for `segment` continuing after `start_key`.
    pub fn request(&self, segment: u32, start_key: Option<Key>) -> ScanRequest {
        ScanRequest {
            table: self.table.clone(),
            filter: self.filter.clone(),
            consistent_read: self.consistent_read,
            total_segments: self.total_segments,
            segment,
            exclusive_start_key: start_key,
            limit: self.limit,
        }
    }

    /// Segments that still have work, with their starting points.
    pub fn pending_segments(&self) -> impl Iterator<Item = (SegmentDescriptor, SegmentStart)> + '_ {
        let total = self.total_segments;
        SegmentDescriptor::all(total).filter_map(move |descriptor| {
            self.starts[descriptor.index as usize]
                .clone()
                .map(|start| (descriptor, start))
        })
    }

    /// The cursor a resumable scan starts from before any record is delivered.
    pub fn initial_cursor(&self) -> ScanCursor {
        let mut cursor = ScanCursor::new(self.total_segments)
            .bound_to(self.table.clone(), self.filter_digest.clone());
        for (index, start) in self.starts.iter().enumerate() {
            let resume = match start {
                Some(start) => Resume::At {
                    start_key: start.start_key.clone(),
                    skip: start.skip,
                },
                None => Resume::Exhausted,
            };
            cursor.set(index as u32, resume);
        }
        cursor
    }
}

pub fn ensure_predicate(predicate: &Predicate) -> Result<(), Error> {
    if predicate.is_empty() {
        return Err(Error::new(ErrorKind::InvalidExpression)
            .with_message("filter expression must not be empty")
            .with_hint("Pass an expression like `#status = :active`, or scan without a filter."));
    }
    Ok(())
}

pub fn plan_scan(
    table: &str,
    filter: Option<Predicate>,
    options: &ScanOptions,
) -> Result<ScanPlan, Error> {
    if let Some(predicate) = &filter {
        ensure_predicate(predicate)?;
    }
    if table.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("table name must not be empty"));
    }
    if options.parallelism == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("parallelism must be at least 1")
            .with_table(table));
    }
    if options.parallelism > MAX_PARALLELISM {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!(
                "parallelism {} exceeds the limit of {MAX_PARALLELISM}",
                options.parallelism
            ))
            .with_table(table));
    }
    if options.page_limit == Some(0) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("page limit must be greater than zero")
            .with_table(table));
    }

    let total = options.parallelism;
    let filter_digest = filter.as_ref().map(Predicate::digest).transpose()?;
    let starts = match &options.start {
        ScanStart::Beginning => vec![Some(SegmentStart::default()); total as usize],
        ScanStart::StartKey(key) => {
            if total > 1 {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("a single start key only applies to parallelism 1")
                    .with_hint("Resume parallel scans from a ScanCursor instead.")
                    .with_table(table));
            }
            vec![Some(SegmentStart {
                start_key: Some(key.clone()).filter(|key| !key.is_empty()),
                skip: 0,
            })]
        }
        ScanStart::Cursor(cursor) => {
            if cursor.total_segments != total {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!(
                        "cursor was captured with parallelism {}, not {total}",
                        cursor.total_segments
                    ))
                    .with_hint("Resume with the same parallelism the cursor was captured with.")
                    .with_table(table));
            }
            if let Some(captured) = cursor.table.as_deref() {
                if captured != table {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message(format!("cursor was captured on table {captured}"))
                        .with_hint("Resume a cursor only against the table it was captured on.")
                        .with_table(table));
                }
                if cursor.filter_digest != filter_digest {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("cursor was captured with a different filter")
                        .with_hint("Resume with the same filter expression and substitutions.")
                        .with_table(table));
                }
            }
            if let Some(segment) = cursor.segments.keys().find(|segment| **segment >= total) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("cursor names a segment outside the scan")
                    .with_segment(*segment)
                    .with_table(table));
            }
            (0..total)
                .map(|segment| match cursor.resume_for(segment) {
                    Resume::At { start_key, skip } => Some(SegmentStart { start_key, skip }),
                    Resume::Exhausted => None,
                })
                .collect()
        }
    };

    Ok(ScanPlan {
        table: table.to_string(),
        filter,
        consistent_read: options.consistent_read,
        total_segments: total,
        limit: options.page_limit,
        filter_digest,
        starts,
    })
}
