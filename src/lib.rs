// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! # heapscope
//!
//! Load-store elimination and escape analysis over an SSA instruction graph.
//!
//! `heapscope` removes heap traffic a method does not need: loads whose value
//! is already known, stores nobody can observe, and allocations that only
//! ever served as a temporary bag of fields. Objects that escape on some paths
//! only are split, so the non-escaping paths keep their fields in SSA values
//! and the object is allocated where it actually escapes.
//!
//! ## Features
//!
//! - **🧱 Arena-indexed SSA graph** - Closed instruction set, use lists, builder and verifier
//! - **🔍 Escape analysis** - Singleton, removable and partial-escape classification
//! - **🗺️ Heap locations** - Instance fields, statics and array elements with a may-alias matrix
//! - **⚡ Load-store elimination** - Value forwarding through merges and loops with lazy phis
//! - **🔀 Partial escape** - Predicated accesses and materialization at escape points
//! - **🧪 Reference interpreter** - Differential checking of every transformation
//! - **📊 Event log** - Every change recorded with its method, instruction and pass
//!
//! ## Quick Start
//!
//! ```rust
//! use heapscope::prelude::*;
//!
//! let graph = GraphBuilder::new("int Main.f()").build(|f| {
//!     let point = f.class("Point", None);
//!     let x = f.field(point, "x", DataType::Int32);
//!     f.block(0, |b| {
//!         let o = b.new_instance(point);
//!         let one = b.int(1);
//!         b.set_field(o, x, one);
//!         let v = b.get_field(o, x);
//!         b.ret(v);
//!     });
//! })?;
//!
//! let ctx = CompilerContext::with_graphs(CompilerConfig::default(), [graph]);
//! let mut scheduler = PassScheduler::with_default_passes(&ctx);
//! scheduler.run_pipeline(&ctx)?;
//!
//! assert_eq!(ctx.events.count_kind(EventKind::AllocationRemoved), 1);
//! # Ok::<(), heapscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`ir`] - The instruction graph, its builder, verifier, dumps and interpreter
//! - [`analysis`] - Escape analysis, execution subgraphs and heap locations
//! - [`compiler`] - Pass trait, scheduler, events, configuration and the passes
//! - [`utils`] - Bit sets and generic graph algorithms
//! - [`prelude`] - Convenient re-exports of commonly used types
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade: bail-out reasons at `debug`,
//! per-instruction decisions at `trace` and rolled back passes at `warn`. No
//! logger is installed by the library.

#[macro_use]
pub(crate) mod error;

pub mod analysis;
pub mod compiler;
pub mod ir;
pub mod utils;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use heapscope::prelude::*;
///
/// let config = CompilerConfig::default().with_partial_escape(false);
/// let ctx = CompilerContext::new(config);
/// assert_eq!(ctx.method_count(), 0);
/// ```
pub mod prelude;

/// `heapscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `heapscope` Error type
///
/// # Examples
///
/// ```rust
/// use heapscope::{ir::GraphBuilder, Error};
///
/// // Block 0 is never terminated.
/// match GraphBuilder::new("void Main.f()").build(|f| f.block(0, |_| ())) {
///     Ok(_) => println!("built"),
///     Err(Error::InvalidGraph(message)) => println!("invalid: {}", message),
///     Err(e) => println!("error: {}", e),
/// }
/// ```
pub use error::Error;
