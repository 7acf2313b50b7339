//! Mercury serves cached binary values while refreshing them in the background.
//!
//! # Introduction
//! **Mercury** is a stale-while-revalidate cache coordinator: every cached entry has a
//! *freshness deadline* after which it is considered stale but still returnable, and a storage
//! side *hard retention* after which it disappears entirely. Callers hand in a **regeneration
//! function** together with each read. A fresh entry is returned as-is. A stale entry is returned
//! **immediately** while a single background job recomputes the replacement - the requesting
//! client is never slowed down by a refresh and the backing system is never hit by a thundering
//! herd, as an advisory per-key lock keeps at most one regeneration in flight.
//!
//! This trades guaranteed freshness for latency on purpose: serving slightly outdated content
//! quickly is, for many systems, strictly better than serving perfectly fresh content slowly.
//! Only a *cold miss* (no value at all) makes the caller wait for the regeneration function.
//!
//! # Components
//! * **Storage engines**: key-addressed byte storage with per-key freshness and advisory lock
//!   state behind the [Engine](engine::Engine) trait. Two reference engines are provided: a
//!   process-local map with a polling reaper ([MemoryEngine](engine::MemoryEngine)) and a Redis
//!   adapter which spreads each logical key over three physical keys
//!   ([RedisEngine](engine::RedisEngine)).
//! * **Worker pool**: a bounded job queue drained by a fixed set of workers
//!   ([WorkerPool](pool::WorkerPool)). When the queue is full, further refresh jobs wait instead
//!   of fanning out without limit.
//! * **Coordinator**: the read-path state machine ([Cache](cache::Cache)) which decides between
//!   serve, serve-and-refresh and generate-now, and the manual companion strategy
//!   ([BasicCache](basic::BasicCache)) for callers which want to read and write explicitly.
//!
//! Everything is built on [tokio](https://tokio.rs/) and async/await primitives; all background
//! work (refresh jobs, the reaper of the in-process engine) runs on ordinary tokio tasks.
//!
//! # Example
//! ```
//! # use std::sync::Arc;
//! # use std::time::{Duration, SystemTime};
//! # use mercury::cache::Cache;
//! # use mercury::engine::MemoryEngine;
//! #[tokio::main]
//! async fn main() {
//!     let engine = Arc::new(MemoryEngine::new(Duration::from_secs(30)));
//!     let cache = Cache::new(engine, 16, 2);
//!
//!     // A cold miss runs the regeneration function right away...
//!     let value = cache
//!         .get("greeting", SystemTime::now() + Duration::from_secs(60), || async {
//!             Ok("hello".as_bytes().to_vec())
//!         })
//!         .await
//!         .unwrap();
//!     assert_eq!(value, b"hello".to_vec());
//!
//!     // ...while any further read within the freshness window is served from the engine.
//!     let value = cache
//!         .get("greeting", SystemTime::now() + Duration::from_secs(60), || async {
//!             unreachable!("a fresh entry is never regenerated")
//!         })
//!         .await
//!         .unwrap();
//!     assert_eq!(value, b"hello".to_vec());
//! }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod basic;
pub mod cache;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pool;

/// Initializes the logging system.
///
/// Note that this only needs to be called by applications which do not install their own
/// [log](https://crates.io/crates/log) backend - all diagnostics of this crate are emitted via
/// the common **log** macros.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[tokio::main]
/// # async fn main() {
/// mercury::spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
