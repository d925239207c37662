pub mod api;
pub mod batches;
pub mod breaker;
pub mod encode;
pub mod format;
pub mod monitor;
pub mod preprocess;
pub mod processor;
pub mod recovery;
pub mod retry;
pub mod rpc;
pub mod snapshot;
pub mod staging;

/// App bundles the two store pools and the shared RPC client. Every service
/// borrows from this; nothing else holds a pool.
#[derive(Clone)]
pub struct App {
    /// Catalog store: folders, documents, batches, connections, prompts.
    pub catalog: sqlx::PgPool,
    /// Work store: encoded bodies and response rows.
    pub work: sqlx::PgPool,
    pub rpc: rpc::Client,
}

impl App {
    pub fn new(catalog: sqlx::PgPool, work: sqlx::PgPool, rpc: rpc::Client) -> Self {
        Self { catalog, work, rpc }
    }
}
