//! booksearch - semantic retrieval over large book catalogs.
//!
//! A catalog (CSV, TSV or JSON Lines) is turned into an index store: one
//! embedding per book, paired with a metadata table keyed by row id.
//! Free-text queries are embedded the same way and answered by exact
//! nearest-neighbour search, with calibrated similarity scores, an
//! optional cross-encoder rerank and an optional chat-model summary.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use booksearch::builder::IndexBuilder;
//! use booksearch::config::{BuildOptions, StoreLayout};
//! use booksearch::dataset::Dataset;
//! use booksearch::embedding::E5Embedder;
//! use booksearch::{DataDir, IndexStore, Retriever};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let embedder = Arc::new(E5Embedder::default());
//!
//! let dataset = Dataset::load("books.csv".as_ref(), None).unwrap();
//! IndexBuilder::new(embedder.as_ref(), BuildOptions::default())
//!     .build(&dataset, &data_dir.index_dir())
//!     .unwrap();
//!
//! let index_dir = data_dir.index_dir();
//! let store = IndexStore::open(&index_dir, StoreLayout::Flat).unwrap();
//! let retriever = Retriever::new(Arc::new(store), embedder);
//! for r in retriever.retrieve("a quiet novel about the sea", 5).unwrap() {
//!     println!("{}. {} ({}%)", r.rank, r.title, r.similarity_percent);
//! }
//! ```

pub mod builder;
pub mod cli;
pub mod config;
pub mod data_dir;
pub mod dataset;
pub mod embedding;
pub mod embedding_db;
pub mod error;
pub mod index;
pub mod metadata_db;
pub mod model_manager;
pub mod normalizer;
pub mod reranker;
pub mod retriever;
pub mod scoring;
pub mod search;
pub mod service;
pub mod store;
pub mod summarize;
pub mod text_util;
pub mod vector_file;

pub use builder::{BuildReport, IndexBuilder};
pub use data_dir::DataDir;
pub use dataset::{CatalogRecord, Dataset};
pub use embedding::{E5Embedder, Embedder, HashingEmbedder};
pub use embedding_db::EmbeddingDb;
pub use error::{Error, Result};
pub use metadata_db::MetadataDb;
pub use retriever::{RetrievalResult, Retriever};
pub use service::RetrievalService;
pub use store::IndexStore;
