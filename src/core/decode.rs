//! Purpose: Flatten merged pages into typed records, optionally tagged with resume positions.
//! Exports: `Decoder`, `SerdeDecoder`, `RecordStream`, `ResumableScan`, `Resumable`.
//! Role: Last stage of a scan; the only place raw items become caller types.
//! Invariants: Items of one page are decoded in the order the store returned them.
//! Invariants: The first decode failure ends the stream and cancels the segment tasks.
//! Invariants: At most one page is held at a time; nothing is buffered across pages.
use crate::core::attr::{Item, item_to_json};
use crate::core::cursor::{PageMark, ScanCursor, SegmentPosition};
use crate::core::error::{Error, ErrorKind};
use crate::core::orchestrator::PageStream;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio_stream::Stream;

/// Turns one raw item into a caller record.
pub trait Decoder<T>: Send + 'static {
    fn decode(&self, item: Item) -> Result<T, Error>;
}

impl<T, F> Decoder<T> for F
where
    F: Fn(Item) -> Result<T, Error> + Send + 'static,
{
    fn decode(&self, item: Item) -> Result<T, Error> {
        self(item)
    }
}

/// Decodes items through serde by viewing them as plain JSON objects.
pub struct SerdeDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + 'static> Decoder<T> for SerdeDecoder<T> {
    fn decode(&self, item: Item) -> Result<T, Error> {
        serde_json::from_value(item_to_json(&item)).map_err(|err| {
            Error::new(ErrorKind::Decode)
                .with_message(format!("failed to decode item: {err}"))
                .with_source(err)
        })
    }
}

/// A record of a resumable scan with the position it was read at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resumable<T> {
    pub position: SegmentPosition,
    pub record: T,
}

struct CurrentPage {
    mark: PageMark,
    items: std::vec::IntoIter<Item>,
    delivered: usize,
}

struct Records<T, D> {
    pages: PageStream,
    decoder: D,
    current: Option<CurrentPage>,
    cursor: Option<ScanCursor>,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T, D: Decoder<T>> Records<T, D> {
    fn new(pages: PageStream, decoder: D, cursor: Option<ScanCursor>) -> Self {
        Self {
            pages,
            decoder,
            current: None,
            cursor,
            done: false,
            _marker: PhantomData,
        }
    }

    fn fail(&mut self, err: Error) -> Poll<Option<Result<(Option<SegmentPosition>, T), Error>>> {
        self.done = true;
        self.current = None;
        self.pages.cancel();
        Poll::Ready(Some(Err(err)))
    }

    fn poll_record(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(Option<SegmentPosition>, T), Error>>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }

            if let Some(page) = self.current.as_mut() {
                if let Some(item) = page.items.next() {
                    page.delivered += 1;
                    let segment = page.mark.segment;
                    let position = self
                        .cursor
                        .is_some()
                        .then(|| page.mark.position_after(page.delivered));
                    return match self.decoder.decode(item) {
                        Ok(record) => {
                            if let (Some(cursor), Some(position)) = (&mut self.cursor, &position) {
                                cursor.advance(position);
                            }
                            Poll::Ready(Some(Ok((position, record))))
                        }
                        Err(err) => {
                            let err = err.with_segment(segment);
                            let err = if err.table().is_none() {
                                err.with_table(self.pages.table().to_string())
                            } else {
                                err
                            };
                            self.fail(err)
                        }
                    };
                }
                if let (Some(cursor), Some(page)) = (&mut self.cursor, self.current.take()) {
                    cursor.set(page.mark.segment, page.mark.end());
                }
                self.current = None;
                continue;
            }

            match ready!(Pin::new(&mut self.pages).poll_next(cx)) {
                Some(Ok(tagged)) => {
                    let segment = tagged.segment;
                    let mut page = tagged.payload;
                    let mark = PageMark::new(segment, &page);
                    let items = std::mem::take(&mut page.response.items);
                    self.current = Some(CurrentPage {
                        mark,
                        items: items.into_iter(),
                        delivered: 0,
                    });
                }
                Some(Err(err)) => return self.fail(err),
                None => {
                    self.done = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

/// Lazily decoded records of a scan, in no particular cross-segment order.
pub struct RecordStream<T, D> {
    inner: Records<T, D>,
}

impl<T, D: Decoder<T>> RecordStream<T, D> {
    pub(crate) fn new(pages: PageStream, decoder: D) -> Self {
        Self {
            inner: Records::new(pages, decoder, None),
        }
    }

    /// Stops the scan; the stream yields nothing afterwards.
    pub fn cancel(&mut self) {
        self.inner.done = true;
        self.inner.current = None;
        self.inner.pages.cancel();
    }
}

impl<T, D> Unpin for RecordStream<T, D> {}

impl<T, D: Decoder<T>> Stream for RecordStream<T, D> {
    type Item = Result<T, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner
            .poll_record(cx)
            .map(|next| next.map(|result| result.map(|(_, record)| record)))
    }
}

/// Decoded records paired with resume positions; also tracks the running cursor.
pub struct ResumableScan<T, D> {
    inner: Records<T, D>,
}

impl<T, D: Decoder<T>> ResumableScan<T, D> {
    pub(crate) fn new(pages: PageStream, decoder: D, cursor: ScanCursor) -> Self {
        Self {
            inner: Records::new(pages, decoder, Some(cursor)),
        }
    }

    /// Resume point covering exactly the records delivered so far.
    pub fn cursor(&self) -> ScanCursor {
        self.inner
            .cursor
            .clone()
            .unwrap_or_else(|| ScanCursor::new(0))
    }

    pub fn cancel(&mut self) {
        self.inner.done = true;
        self.inner.current = None;
        self.inner.pages.cancel();
    }
}

impl<T, D> Unpin for ResumableScan<T, D> {}

impl<T, D: Decoder<T>> Stream for ResumableScan<T, D> {
    type Item = Result<Resumable<T>, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner.poll_record(cx).map(|next| {
            next.map(|result| {
                result.and_then(|(position, record)| {
                    let position = position.ok_or_else(|| {
                        Error::new(ErrorKind::Internal).with_message("record without position")
                    })?;
                    Ok(Resumable { position, record })
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Decoder, SerdeDecoder};
    use crate::core::attr::{AttributeValue, Item};
    use crate::core::error::{Error, ErrorKind};
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: String,
        age: u32,
    }

    fn item(id: &str, age: AttributeValue) -> Item {
        let mut item = Item::new();
        item.insert("id".to_string(), AttributeValue::string(id));
        item.insert("age".to_string(), age);
        item
    }

    #[test]
    fn serde_decoder_reads_plain_fields() {
        let decoder = SerdeDecoder::<User>::new();
        let user = decoder
            .decode(item("u1", AttributeValue::number(30)))
            .expect("user");
        assert_eq!(
            user,
            User {
                id: "u1".to_string(),
                age: 30
            }
        );
    }

    #[test]
    fn serde_decoder_reports_decode_kind() {
        let decoder = SerdeDecoder::<User>::new();
        let err = decoder
            .decode(item("u1", AttributeValue::string("thirty")))
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn closures_are_decoders() {
        let decoder = |item: Item| -> Result<String, Error> {
            match item.get("id") {
                Some(AttributeValue::S(id)) => Ok(id.clone()),
                _ => Err(Error::new(ErrorKind::Decode).with_message("missing id")),
            }
        };
        let id = decoder
            .decode(item("u7", AttributeValue::Null))
            .expect("id");
        assert_eq!(id, "u7");
    }
}
