//! Pass infrastructure and the passes built on it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Compiler Pipeline                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  CompilerContext             Shared state of a run           │
//! │    ├─ Graphs                  (one per method, by signature) │
//! │    ├─ Processed / failed      methods                        │
//! │    └─ EventLog                                               │
//! │                                                              │
//! │  PassScheduler               Parallel per-method execution   │
//! │    ├─ run every pass over every method (rayon)               │
//! │    ├─ verify, roll back on failure                           │
//! │    └─ repeat until stable or max_iterations                  │
//! │                                                              │
//! │  SsaPass trait               Interface for all passes        │
//! │    ├─ run_on_method()         Per-method transformation      │
//! │    ├─ initialize()            One-time setup                 │
//! │    └─ finalize()              Cleanup                        │
//! │                                                              │
//! │  Passes                                                      │
//! │    └─ LoadStoreEliminationPass                               │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use heapscope::compiler::{CompilerConfig, CompilerContext, PassScheduler};
//!
//! let ctx = CompilerContext::with_graphs(CompilerConfig::default(), graphs);
//! let mut scheduler = PassScheduler::with_default_passes(&ctx);
//! scheduler.run_pipeline(&ctx)?;
//! println!("{}", ctx.events.summary());
//! ```

mod config;
mod context;
mod events;
mod pass;
pub mod passes;
mod scheduler;

pub use config::CompilerConfig;
pub use context::CompilerContext;
pub use events::{Event, EventBuilder, EventKind, EventLog};
pub use pass::SsaPass;
pub use passes::LoadStoreEliminationPass;
pub use scheduler::PassScheduler;
