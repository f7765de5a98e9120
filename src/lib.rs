pub mod analytics;
pub mod catalog;
pub mod config;
pub mod dsl;
pub mod engine;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod ingest;
pub mod models;
pub mod retention;
pub mod storage;

use std::sync::Arc;

use catalog::Catalog;
use engine::QueryEngine;
use extract::FieldExtractor;
use storage::StorageBackend;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn StorageBackend>,
    pub catalog: Arc<Catalog>,
    pub engine: Arc<QueryEngine>,
    pub extractor: Arc<FieldExtractor>,
}
