//! Stepcache: a networked build-step cache.
//!
//! Clients store, per command, the set of input files (path + content
//! hash) a build step read and the outputs it produced. Entries live in
//! buckets; each bucket interns its paths and content keys into compact
//! tables and shares common input ranges between the entries of one
//! command so thousands of near-identical input lists stay small.
//!
//! The crate provides:
//! - Binary encoding primitives (`binary`) and fixed-width keys (`key`)
//! - The interning tables (`table`) and the entry compaction engine (`entries`)
//! - Buckets with persistence and table rebuilds (`bucket`)
//! - The content store seam (`store`) and the server itself (`server`)
//! - TCP framing, serving loop and client (`transport`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use stepcache::clock::SystemClock;
//! use stepcache::key::{BucketFlags, BucketId, CacheKey, ContentKey};
//! use stepcache::server::{CacheServer, CacheServerConfig};
//! use stepcache::store::MemoryContentStore;
//! use stepcache::transport::{CacheClient, LocalChannel};
//!
//! let server = Arc::new(
//!     CacheServer::open(
//!         CacheServerConfig::in_memory(),
//!         Arc::new(MemoryContentStore::new()),
//!         Arc::new(SystemClock),
//!     )
//!     .unwrap(),
//! );
//! let mut client = CacheClient::connect(LocalChannel::new(server), "example").unwrap();
//!
//! let bucket = BucketId::new(1, 0, BucketFlags::CASE_SENSITIVE);
//! let cmd = CacheKey::from_command("cc -c main.c");
//! let header = ContentKey::from_content(b"int x;");
//! client
//!     .store(bucket, &cmd, &[("main.h", header)], &[("main.o", b"obj")], b"")
//!     .unwrap();
//! let hits = client.fetch_entries(bucket, &cmd).unwrap();
//! assert_eq!(hits.len(), 1);
//! ```

pub mod binary;
pub mod bucket;
pub mod clock;
pub mod entries;
pub mod key;
pub mod server;
pub mod store;
pub mod table;
pub mod transport;

#[cfg(feature = "cli")]
pub mod cli;

