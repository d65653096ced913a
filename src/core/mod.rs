// Scan engine internals: data model, transport seam, pagination, merge, and decode.
pub mod attr;
pub mod cursor;
pub mod decode;
pub mod error;
pub mod filter;
pub mod orchestrator;
pub mod plan;
pub mod request;
pub mod segment;
pub mod store;
pub mod transport;
