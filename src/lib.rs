//! Purpose: Parallel segmented table scans over a partitioned key-value store.
//! Exports: `api` (scanner entry points, clients, options) and `core` (engine internals).
//! Role: Library backing the `segscan` CLI/server and embeddable by other services.
//! Invariants: `api` is the stable surface; `core` may change between releases.
//! Invariants: Every scan is lazy, consumer-paced, and cancelled when its stream is dropped.
pub mod api;
pub mod core;
mod table_paths;
