//! SQL layer for both stores.
//!
//! The catalog store owns folders, documents, batches, connections, prompts,
//! and document types. The work store owns encoded bodies and response rows.
//! The two stores never share a transaction; every cross-store join happens
//! in application code, and every state transition in either store is a
//! conditional UPDATE guarded by the prior state.

// Catalog store.
pub mod batches;
pub mod connections;
pub mod document_types;
pub mod documents;
pub mod folders;
pub mod prompts;

// Work store.
pub mod bodies;
pub mod responses;
