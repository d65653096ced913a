//! Purpose: Define the stable public Rust API boundary for segscan.
//! Exports: Scanner entry points, clients, options, cursors, and the error model.
//! Role: Public, additive-only surface; hides engine internals.
//! Invariants: The CLI and server consume only what is re-exported here.
//! Invariants: Internal modules remain private and are not directly exposed.

mod client;
mod remote;
mod scan;

pub use crate::core::attr::{AttributeValue, Item, Key, item_from_json, item_to_json};
pub use crate::core::cursor::{Resume, ScanCursor, SegmentPosition};
pub use crate::core::decode::{Decoder, RecordStream, Resumable, ResumableScan, SerdeDecoder};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::orchestrator::PageStream;
pub use crate::core::plan::{MAX_PARALLELISM, ScanOptions, ScanStart, ensure_predicate};
pub use crate::core::request::{Page, Predicate, ScanRequest, ScanResponse, SegmentPassThrough};
pub use crate::core::store::{DEFAULT_PAGE_LIMIT, MemoryStore, MemoryTable};
pub use crate::core::transport::Transport;
pub use crate::table_paths::default_table_dir;
pub use client::LocalClient;
pub use remote::{DEFAULT_REMOTE_TIMEOUT, RemoteTransport};
pub use scan::{ApiResult, Scanner};
