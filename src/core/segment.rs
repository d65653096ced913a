//! Purpose: Drive one segment's server-side pagination until its cursor is exhausted.
//! Exports: `SegmentLoop`, `SegmentState`.
//! Role: Per-segment state machine owned by exactly one orchestrator task.
//! Invariants: Page k is requested with page k-1's continuation cursor for the same segment.
//! Invariants: Pagination is an explicit loop; no page is retained after it is emitted.
//! Invariants: The first fetch failure moves the loop to `Failed`; it is never retried here.
use crate::core::attr::Key;
use crate::core::error::Error;
use crate::core::plan::{ScanPlan, SegmentStart};
use crate::core::request::{Page, SegmentDescriptor, SegmentPassThrough};
use crate::core::transport::{Transport, fetch_page};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentState {
    Start,
    HasMore,
    Done,
    Failed,
}

pub struct SegmentLoop<T> {
    transport: Arc<T>,
    plan: Arc<ScanPlan>,
    segment: SegmentDescriptor,
    state: SegmentState,
    next_start: Option<Key>,
    skip: usize,
    pages: u64,
}

impl<T: Transport> SegmentLoop<T> {
    pub fn new(
        transport: Arc<T>,
        plan: Arc<ScanPlan>,
        segment: SegmentDescriptor,
        start: SegmentStart,
    ) -> Self {
        Self {
            transport,
            plan,
            segment,
            state: SegmentState::Start,
            next_start: start.start_key,
            skip: start.skip,
            pages: 0,
        }
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Fetches the next page, or `Ok(None)` once the segment is done or failed.
    ///
    /// Pages consumed entirely by a pending skip are not emitted unless they are
    /// terminal, so a resume point never moves past items that were not skipped yet.
    pub async fn next_page(&mut self) -> Result<Option<SegmentPassThrough<Page>>, Error> {
        loop {
            if matches!(self.state, SegmentState::Done | SegmentState::Failed) {
                return Ok(None);
            }

            let request = self.plan.request(self.segment.index, self.next_start.take());
            let mut page = match fetch_page(self.transport.as_ref(), request).await {
                Ok(page) => page,
                Err(err) => {
                    self.state = SegmentState::Failed;
                    return Err(err);
                }
            };
            self.pages += 1;

            match page.payload.response.continuation() {
                Some(key) => {
                    self.next_start = Some(key.clone());
                    self.state = SegmentState::HasMore;
                }
                None => {
                    self.state = SegmentState::Done;
                    tracing::debug!(
                        table = %self.plan.table,
                        segment = self.segment.index,
                        pages = self.pages,
                        "segment exhausted"
                    );
                }
            }

            if self.skip == 0 {
                return Ok(Some(page));
            }
            let items = &mut page.payload.response.items;
            let dropped = self.skip.min(items.len());
            items.drain(..dropped);
            self.skip -= dropped;
            if self.skip > 0 && self.state == SegmentState::HasMore {
                continue;
            }
            page.payload.skipped = dropped;
            return Ok(Some(page));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SegmentLoop, SegmentState};
    use crate::core::attr::{AttributeValue, Item, Key};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::plan::{ScanOptions, SegmentStart, plan_scan};
    use crate::core::request::{ScanRequest, ScanResponse, SegmentDescriptor};
    use crate::core::transport::Transport;
    use std::sync::{Arc, Mutex};

    fn key(n: u32) -> Key {
        let mut key = Key::new();
        key.insert("id".to_string(), AttributeValue::number(n));
        key
    }

    fn item(n: u32) -> Item {
        key(n)
    }

    /// Serves `pages` pages of two items each, recording every start key it sees.
    struct Paged {
        pages: u32,
        seen: Mutex<Vec<Option<Key>>>,
        fail_on: Option<u32>,
    }

    impl Transport for Paged {
        async fn execute(&self, request: ScanRequest) -> Result<ScanResponse, Error> {
            let page = {
                let mut seen = self.seen.lock().expect("lock");
                seen.push(request.exclusive_start_key.clone());
                seen.len() as u32 - 1
            };
            if self.fail_on == Some(page) {
                return Err(Error::new(ErrorKind::Transport).with_message("boom"));
            }
            let last = page == self.pages - 1;
            Ok(ScanResponse {
                items: vec![item(page * 2), item(page * 2 + 1)],
                last_evaluated_key: (!last).then(|| key(page * 2 + 1)),
                count: 2,
                scanned_count: 2,
            })
        }
    }

    fn segment_loop(transport: Arc<Paged>, start: SegmentStart) -> SegmentLoop<Paged> {
        let plan = Arc::new(plan_scan("t", None, &ScanOptions::new(1)).expect("plan"));
        let segment = SegmentDescriptor::all(1).next().expect("segment");
        SegmentLoop::new(transport, plan, segment, start)
    }

    #[tokio::test]
    async fn follows_continuation_cursor_until_exhausted() {
        let transport = Arc::new(Paged {
            pages: 3,
            seen: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let mut segment = segment_loop(transport.clone(), SegmentStart::default());
        assert_eq!(segment.state(), SegmentState::Start);

        let mut items = 0;
        while let Some(page) = segment.next_page().await.expect("page") {
            assert_eq!(page.segment, 0);
            items += page.payload.response.items.len();
        }
        assert_eq!(items, 6);
        assert_eq!(segment.state(), SegmentState::Done);
        assert!(segment.next_page().await.expect("done").is_none());

        let seen = transport.seen.lock().expect("lock").clone();
        assert_eq!(seen, vec![None, Some(key(1)), Some(key(3))]);
    }

    #[tokio::test]
    async fn failure_is_terminal() {
        let transport = Arc::new(Paged {
            pages: 3,
            seen: Mutex::new(Vec::new()),
            fail_on: Some(1),
        });
        let mut segment = segment_loop(transport.clone(), SegmentStart::default());
        segment.next_page().await.expect("first page");
        let err = segment.next_page().await.expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(segment.state(), SegmentState::Failed);
        assert!(segment.next_page().await.expect("failed").is_none());
        assert_eq!(transport.seen.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn skip_spans_pages() {
        let transport = Arc::new(Paged {
            pages: 3,
            seen: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let start = SegmentStart {
            start_key: None,
            skip: 3,
        };
        let mut segment = segment_loop(transport, start);

        let first = segment.next_page().await.expect("page").expect("some");
        assert_eq!(first.payload.skipped, 1);
        assert_eq!(first.payload.response.items, vec![item(3)]);
        assert_eq!(first.payload.start_key, Some(key(1)));

        let second = segment.next_page().await.expect("page").expect("some");
        assert_eq!(second.payload.skipped, 0);
        assert_eq!(second.payload.response.items.len(), 2);
        assert!(segment.next_page().await.expect("done").is_none());
    }

    #[tokio::test]
    async fn skip_past_the_end_emits_an_empty_terminal_page() {
        let transport = Arc::new(Paged {
            pages: 2,
            seen: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let start = SegmentStart {
            start_key: None,
            skip: 9,
        };
        let mut segment = segment_loop(transport, start);

        let page = segment.next_page().await.expect("page").expect("some");
        assert!(page.payload.response.items.is_empty());
        assert!(page.payload.response.is_terminal());
        assert_eq!(segment.state(), SegmentState::Done);
    }
}
