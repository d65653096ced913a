//! Purpose: Run every pending segment loop concurrently and merge their pages into one stream.
//! Exports: `PageStream`, `scan_pages`.
//! Role: Fan-out/fan-in stage between the segment loops and the decode stage.
//! Invariants: One task per segment; the concurrency cap is the scan's parallelism.
//! Invariants: Pages are emitted first-ready-first-out; order is kept only within a segment.
//! Invariants: The merge channel is bounded, so fetching is paced by the consumer.
//! Invariants: The first error or task panic ends the stream and aborts every remaining segment task.
//! Invariants: Dropping the stream aborts all segment tasks and their in-flight requests.
use crate::core::error::{Error, ErrorKind};
use crate::core::plan::ScanPlan;
use crate::core::request::{Page, SegmentPassThrough};
use crate::core::segment::SegmentLoop;
use crate::core::transport::Transport;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;

/// Pages a segment task may hand off before it has to wait for the consumer.
const MERGE_CAPACITY: usize = 1;

type PageResult = Result<SegmentPassThrough<Page>, Error>;
type Launch = Box<dyn FnOnce(&mut JoinSet<()>) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamState {
    Merging,
    Draining,
    Finished,
}

/// Lazily started, merged page stream of one scan.
///
/// Segment tasks are spawned on the first poll, so building the stream performs
/// no I/O and needs no runtime.
pub struct PageStream {
    launch: Option<Launch>,
    receiver: ReceiverStream<PageResult>,
    tasks: JoinSet<()>,
    state: StreamState,
    table: String,
}

pub fn scan_pages<T: Transport>(transport: Arc<T>, plan: ScanPlan) -> PageStream {
    let (sender, receiver) = mpsc::channel::<PageResult>(MERGE_CAPACITY);
    let plan = Arc::new(plan);
    let table = plan.table.clone();
    let launch: Launch = Box::new(move |tasks: &mut JoinSet<()>| {
        let mut spawned = 0_u32;
        for (descriptor, start) in plan.pending_segments() {
            let segment = SegmentLoop::new(transport.clone(), plan.clone(), descriptor, start);
            tasks.spawn(run_segment(segment, sender.clone()));
            spawned += 1;
        }
        tracing::debug!(
            table = %plan.table,
            parallelism = plan.total_segments,
            spawned,
            "started segment tasks"
        );
    });
    PageStream {
        launch: Some(launch),
        receiver: ReceiverStream::new(receiver),
        tasks: JoinSet::new(),
        state: StreamState::Merging,
        table,
    }
}

async fn run_segment<T: Transport>(
    mut segment: SegmentLoop<T>,
    sender: mpsc::Sender<PageResult>,
) {
    loop {
        match segment.next_page().await {
            Ok(Some(page)) => {
                if sender.send(Ok(page)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                let _ = sender.send(Err(err)).await;
                return;
            }
        }
    }
}

impl PageStream {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Stops every segment task; the stream yields nothing afterwards.
    pub fn cancel(&mut self) {
        if self.state != StreamState::Finished && !self.tasks.is_empty() {
            tracing::debug!(
                table = %self.table,
                remaining = self.tasks.len(),
                "cancelling segment tasks"
            );
        }
        self.launch = None;
        self.tasks.abort_all();
        self.state = StreamState::Finished;
    }

    /// Reaps finished segment tasks. `Ready(None)` once all are done; a panic
    /// cancels the rest and fails the scan.
    fn poll_tasks(&mut self, cx: &mut Context<'_>) -> Poll<Option<Error>> {
        loop {
            match self.tasks.poll_join_next(cx) {
                Poll::Ready(Some(Ok(()))) => continue,
                Poll::Ready(Some(Err(err))) if err.is_panic() => {
                    let err = Error::new(ErrorKind::Internal)
                        .with_message("segment task panicked")
                        .with_table(self.table.clone())
                        .with_source(err);
                    tracing::warn!(table = %self.table, error = %err, "aborting scan");
                    self.cancel();
                    return Poll::Ready(Some(err));
                }
                Poll::Ready(Some(Err(_))) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<Option<PageResult>> {
        match self.poll_tasks(cx) {
            Poll::Ready(Some(err)) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => {
                self.state = StreamState::Finished;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_merged(&mut self, cx: &mut Context<'_>) -> Poll<Option<PageResult>> {
        if let Poll::Ready(Some(err)) = self.poll_tasks(cx) {
            return Poll::Ready(Some(Err(err)));
        }
        match Pin::new(&mut self.receiver).poll_next(cx) {
            Poll::Ready(Some(Ok(page))) => Poll::Ready(Some(Ok(page))),
            Poll::Ready(Some(Err(err))) => {
                tracing::warn!(
                    table = %self.table,
                    segment = ?err.segment(),
                    error = %err,
                    "segment failed; aborting scan"
                );
                self.cancel();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.state = StreamState::Draining;
                self.poll_drain(cx)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Stream for PageStream {
    type Item = PageResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(launch) = this.launch.take() {
            launch(&mut this.tasks);
        }
        match this.state {
            StreamState::Finished => Poll::Ready(None),
            StreamState::Draining => this.poll_drain(cx),
            StreamState::Merging => this.poll_merged(cx),
        }
    }
}

impl Drop for PageStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::scan_pages;
    use crate::core::attr::{AttributeValue, Item};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::plan::{ScanOptions, plan_scan};
    use crate::core::request::{ScanRequest, ScanResponse};
    use crate::core::transport::Transport;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    /// Every segment returns one page holding a single item named after it.
    struct OnePagePerSegment {
        failing_segment: Option<u32>,
    }

    impl Transport for OnePagePerSegment {
        async fn execute(&self, request: ScanRequest) -> Result<ScanResponse, Error> {
            if self.failing_segment == Some(request.segment) {
                return Err(Error::new(ErrorKind::Transport).with_message("unreachable"));
            }
            let mut item = Item::new();
            item.insert("segment".to_string(), AttributeValue::number(request.segment));
            Ok(ScanResponse {
                items: vec![item],
                last_evaluated_key: None,
                count: 1,
                scanned_count: 1,
            })
        }
    }

    #[tokio::test]
    async fn merges_one_page_from_every_segment() {
        let plan = plan_scan("t", None, &ScanOptions::new(4)).expect("plan");
        let transport = Arc::new(OnePagePerSegment {
            failing_segment: None,
        });
        let mut pages = scan_pages(transport, plan);
        let mut segments = BTreeSet::new();
        while let Some(page) = pages.next().await {
            let page = page.expect("page");
            let item = &page.payload.response.items[0];
            assert_eq!(item["segment"], AttributeValue::number(page.segment));
            segments.insert(page.segment);
        }
        assert_eq!(segments, (0..4).collect());
    }

    #[tokio::test]
    async fn first_error_ends_the_stream() {
        let plan = plan_scan("t", None, &ScanOptions::new(3)).expect("plan");
        let transport = Arc::new(OnePagePerSegment {
            failing_segment: Some(1),
        });
        let mut pages = scan_pages(transport, plan);
        let mut failed = false;
        while let Some(page) = pages.next().await {
            if let Err(err) = page {
                assert_eq!(err.kind(), ErrorKind::Transport);
                assert_eq!(err.segment(), Some(1));
                failed = true;
            }
        }
        assert!(failed);
        assert!(pages.next().await.is_none());
    }

    /// Segment 1 panics on its first request; every other segment pages forever.
    struct PanickingSegment;

    impl Transport for PanickingSegment {
        async fn execute(&self, request: ScanRequest) -> Result<ScanResponse, Error> {
            if request.segment == 1 {
                panic!("segment 1 blew up");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            let mut key = Item::new();
            key.insert("id".to_string(), AttributeValue::number(request.segment));
            Ok(ScanResponse {
                items: vec![key.clone()],
                last_evaluated_key: Some(key),
                count: 1,
                scanned_count: 1,
            })
        }
    }

    #[tokio::test]
    async fn task_panic_fails_the_stream_while_other_segments_run() {
        let plan = plan_scan("t", None, &ScanOptions::new(2)).expect("plan");
        let mut pages = scan_pages(Arc::new(PanickingSegment), plan);
        let mut delivered = 0;
        let err = loop {
            match pages.next().await {
                Some(Ok(_)) => delivered += 1,
                Some(Err(err)) => break err,
                None => panic!("stream ended without reporting the panic"),
            }
        };
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(delivered < 20, "panic surfaced after {delivered} pages");
        assert!(pages.next().await.is_none());
    }

    #[test]
    fn building_a_stream_needs_no_runtime() {
        let plan = plan_scan("t", None, &ScanOptions::new(2)).expect("plan");
        let transport = Arc::new(OnePagePerSegment {
            failing_segment: None,
        });
        drop(scan_pages(transport, plan));
    }
}
