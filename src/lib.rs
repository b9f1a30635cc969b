//! # fscrawl
//!
//! An incremental file crawler that keeps a search index converged with a
//! document tree.
//!
//! Each configured job walks its tree periodically, indexes what changed
//! since the previous run, removes what vanished, and routes every document
//! through an ordered chain of filters and conditional outputs before it
//! reaches the backend through a batching, failover-aware client.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │ FileSource │──▶│   Crawler   │──▶│    Router    │──▶│ IndexClient│──▶ backend
//! │  (local)   │   │ scan + diff │   │ filters/outs │   │ bulk+pool  │
//! └────────────┘   └──────┬──────┘   └──────────────┘   └─────▲─────┘
//!                         │  deletion diff (search)            │
//!                         └────────────────────────────────────┘
//!                         │
//!                         ▼
//!                   ┌───────────┐
//!                   │ StateStore│  lastrun watermark per job
//!                   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fscrawl --config ./fscrawl.toml run               # loop every job until Ctrl-C
//! fscrawl --config ./fscrawl.toml run --loop 1      # one pass, then exit
//! fscrawl --config ./fscrawl.toml run --dry-run     # in-memory backend
//! fscrawl --config ./fscrawl.toml status
//! fscrawl --config ./fscrawl.toml restart --job docs
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Entries, documents, routing context, run state |
//! | [`ids`] | Virtual paths and stable document ids |
//! | [`source`] | Tree sources (local filesystem) |
//! | [`state`] | Run-state persistence |
//! | [`crawler`] | Incremental scan/diff engine |
//! | [`worker`] | Per-job scheduling loop and close signal |
//! | [`condition`] | Routing predicate compiler and evaluator |
//! | [`pipeline`] | Filter chain and output fan-out |
//! | [`registry`] | Plugin type → constructor |
//! | [`extract`] | Default content extractor |
//! | [`service`] | Document service contract and in-memory backend |
//! | [`client`] | Resilient batching HTTP client |
//! | [`runner`] | Command entry points |
//! | [`logging`] | Subscriber setup for the binary |
//! | [`error`] | Error types |

pub mod client;
pub mod condition;
pub mod config;
pub mod crawler;
pub mod error;
pub mod extract;
pub mod ids;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod service;
pub mod source;
pub mod state;
pub mod worker;
