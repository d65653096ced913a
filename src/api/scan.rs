//! Purpose: Expose the scan entry points over any `Transport`.
//! Exports: `Scanner`, `ApiResult`.
//! Role: Thin composition of plan -> orchestrator -> decode stage; owns no scan state.
//! Invariants: Filtered scans reject an empty expression before any request is issued.
//! Invariants: Returned streams start fetching on first poll and stop when dropped.
#![allow(clippy::result_large_err)]

use crate::core::decode::{Decoder, RecordStream, ResumableScan, SerdeDecoder};
use crate::core::error::Error;
use crate::core::orchestrator::{PageStream, scan_pages};
use crate::core::plan::{ScanOptions, plan_scan};
use crate::core::request::Predicate;
use crate::core::transport::Transport;
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub type ApiResult<T> = Result<T, Error>;

/// Runs segmented scans through a shared transport.
pub struct Scanner<T> {
    transport: Arc<T>,
}

impl<T> Clone for Scanner<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<T: Transport> Scanner<T> {
    pub fn new(transport: T) -> Self {
        Self::from_shared(Arc::new(transport))
    }

    pub fn from_shared(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Scans `table` keeping only items that match `predicate`, decoded with serde.
    pub fn scan<R>(
        &self,
        table: &str,
        predicate: Predicate,
        options: ScanOptions,
    ) -> ApiResult<RecordStream<R, SerdeDecoder<R>>>
    where
        R: DeserializeOwned + 'static,
    {
        self.scan_with(table, Some(predicate), options, SerdeDecoder::new())
    }

    /// Scans every item of `table`, decoded with serde.
    pub fn scan_all<R>(
        &self,
        table: &str,
        options: ScanOptions,
    ) -> ApiResult<RecordStream<R, SerdeDecoder<R>>>
    where
        R: DeserializeOwned + 'static,
    {
        self.scan_with(table, None, options, SerdeDecoder::new())
    }

    pub fn scan_with<R, D>(
        &self,
        table: &str,
        predicate: Option<Predicate>,
        options: ScanOptions,
        decoder: D,
    ) -> ApiResult<RecordStream<R, D>>
    where
        D: Decoder<R>,
    {
        let pages = self.scan_pages(table, predicate, options)?;
        Ok(RecordStream::new(pages, decoder))
    }

    /// Scans `table` emitting each record with its resume position.
    ///
    /// Feed `ResumableScan::cursor()` back through `ScanOptions::resume_from` to
    /// continue after the last record consumed.
    pub fn scan_resumable<R>(
        &self,
        table: &str,
        options: ScanOptions,
    ) -> ApiResult<ResumableScan<R, SerdeDecoder<R>>>
    where
        R: DeserializeOwned + 'static,
    {
        self.scan_resumable_with(table, None, options, SerdeDecoder::new())
    }

    pub fn scan_resumable_with<R, D>(
        &self,
        table: &str,
        predicate: Option<Predicate>,
        options: ScanOptions,
        decoder: D,
    ) -> ApiResult<ResumableScan<R, D>>
    where
        D: Decoder<R>,
    {
        let plan = plan_scan(table, predicate, &options)?;
        let cursor = plan.initial_cursor();
        let pages = scan_pages(self.transport.clone(), plan);
        Ok(ResumableScan::new(pages, decoder, cursor))
    }

    /// Raw merged pages, each tagged with the segment that produced it.
    pub fn scan_pages(
        &self,
        table: &str,
        predicate: Option<Predicate>,
        options: ScanOptions,
    ) -> ApiResult<PageStream> {
        let plan = plan_scan(table, predicate, &options)?;
        Ok(scan_pages(self.transport.clone(), plan))
    }
}
