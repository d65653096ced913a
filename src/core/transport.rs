// Transport seam and the page fetcher built on top of it.
use crate::core::error::Error;
use crate::core::request::{Page, ScanRequest, ScanResponse, SegmentPassThrough};
use std::future::Future;
use std::sync::Arc;

/// Executes one scan request against the store.
///
/// Implementations own networking, retries, and connection reuse. The engine
/// shares one transport across all segment tasks and never mutates it.
pub trait Transport: Send + Sync + 'static {
    fn execute(
        &self,
        request: ScanRequest,
    ) -> impl Future<Output = Result<ScanResponse, Error>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn execute(
        &self,
        request: ScanRequest,
    ) -> impl Future<Output = Result<ScanResponse, Error>> + Send {
        self.as_ref().execute(request)
    }
}

/// Fetches one page for the request's segment. One round trip, no retry.
pub async fn fetch_page<T: Transport>(
    transport: &T,
    request: ScanRequest,
) -> Result<SegmentPassThrough<Page>, Error> {
    let segment = request.segment;
    let start_key = request.exclusive_start_key.clone();
    let table = request.table.clone();
    let response = transport.execute(request).await.map_err(|err| {
        let err = if err.table().is_none() {
            err.with_table(table.clone())
        } else {
            err
        };
        err.with_segment(segment)
    })?;
    tracing::debug!(
        table = %table,
        segment,
        items = response.items.len(),
        scanned = response.scanned_count,
        has_more = !response.is_terminal(),
        "fetched scan page"
    );
    Ok(SegmentPassThrough::new(
        segment,
        Page {
            start_key,
            skipped: 0,
            response,
        },
    ))
}
