//! docvault - a document archive that ingests files, keeps archive renditions
//! and thumbnails next to the originals, and maintains a full-text index.
//!
//! Work happens in task functions (see [`tasks`]) that operate on a shared
//! [`TaskContext`]: a redb document store, the media tree guarded by a
//! cross-process lock, and a [Tantivy](https://github.com/quickwit-oss/tantivy)
//! search index derived from the store.
//!
//! # Quick start
//!
//! ```no_run
//! use docvault::{DataDir, TaskContext, tasks::{self, ConsumeRequest}};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let ctx = TaskContext::open(data_dir).unwrap();
//!
//! let result = tasks::consume_file(
//!     &ctx,
//!     ConsumeRequest::new(std::path::Path::new("letter.txt")),
//! )
//! .unwrap();
//! println!("{result}");
//! println!("{}", tasks::sanity_check(&ctx).unwrap());
//! ```

pub mod archive_store;
pub mod archiver;
pub mod barcodes;
pub mod classifier;
pub mod consumer;
pub mod data_dir;
pub mod document;
pub mod document_db;
pub mod error;
pub mod index_sync;
pub mod notify;
pub mod parsers;
pub mod repair;
pub mod sanity;
pub mod settings;
pub mod signals;
pub mod tantivy_index;
pub mod tasks;

pub use archive_store::ArchiveStore;
pub use data_dir::DataDir;
pub use document::DocumentRecord;
pub use document_db::DocumentDb;
pub use error::{Error, Result};
pub use settings::Settings;
pub use tantivy_index::SearchIndex;
pub use tasks::TaskContext;
