//! Squall – a query execution engine that drives remote, per-dataset analytic
//! sessions through a compiled command list.
//!
//! Each dataset of a query is bound to one remote session holding its shards
//! for a time range. Commands successively *regroup* documents into numbered
//! result groups and finally stream per-field (term, group, stats) tuples out
//! of every session, merged into a single ordered stream.
//!
//! ## Modules
//! * [`groupkeys`] – Immutable, chained descriptions of the live groups at each
//!   pipeline stage (time buckets, metric ranges, year-months, term lists, masks).
//! * [`remote`] – The remote session and FTGS iterator contracts, rule types and
//!   the remote aggregate [`remote::StatTree`].
//! * [`merge`] – The k-way merge of per-session FTGS streams with its
//!   single-session fast path.
//! * [`aggregate`] – Per-group metrics and filters, evaluated locally or
//!   compiled into a stat tree.
//! * [`docfilter`] – Per-document metrics and filters compiled into push tokens
//!   or regroup [`actions`].
//! * [`commands`] – The executable command set.
//! * [`session`] – The orchestrator owning sessions, group key set and depth.
//! * [`memory`] – An in-process remote engine used by tests and the binary.
//!
//! ## Groups
//! Groups are numbered `1..=N`; group 0 means "not in any group". Every regroup
//! installs a new [`groupkeys::GroupKeySet`] referencing the previous one, so
//! any group can be traced back to its ancestors for output rendering and for
//! looking up statistics saved at an earlier depth.
//!
//! ## Quick Start
//! ```
//! use squall::commands::Command;
//! use squall::config::EngineConfig;
//! use squall::memory::{Document, MemoryDataset, MemoryEngine};
//! use squall::session::{DatasetRequest, Session};
//!
//! let docs = (0..10).map(|i| Document::builder(i * 1000).int("clicks", i).build()).collect();
//! let mut engine = MemoryEngine::new();
//! engine.add_dataset("jobs", MemoryDataset::new(docs));
//! let datasets = vec![DatasetRequest::new("jobs", 0, 86_400_000)];
//! let commands = vec![Command::count_per_group()];
//! let result = Session::create(&mut engine, datasets, commands, &EngineConfig::default()).unwrap();
//! assert_eq!(result.rows, vec!["10".to_string()]);
//! ```

use std::hash::BuildHasherDefault;

use seahash::SeaHasher;

pub mod actions;
pub mod aggregate;
pub mod commands;
pub mod config;
pub mod docfilter;
pub mod error;
pub mod format;
pub mod groupkeys;
pub mod memory;
pub mod merge;
pub mod remote;
pub mod session;
pub mod timer;

/// Hasher for maps keyed by dataset names, field names and pushes.
pub type NameHasher = BuildHasherDefault<SeaHasher>;

pub use error::{Result, SquallError};
