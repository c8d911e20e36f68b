#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::doc_markdown,
    clippy::float_cmp,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! Versioned, persisted state for iterative image generation.
//!
//! A [`Store`] keeps sessions, their iterations and an append-only cost
//! ledger in one SQLite file. A [`SessionManager`] is the cursor on top: it
//! tracks which iteration is current, supports undo without losing history,
//! and logs spend.

pub mod config;
pub mod cost;
pub mod db;
pub mod error;
pub mod session;
pub mod util;

pub use config::Config;
pub use cost::{CostEntry, CostSummary, DailyCost, ProviderCostSummary};
pub use db::{CancelToken, Store, StoreStats};
pub use error::{EntityKind, Error, Result};
pub use session::{Iteration, IterationMetadata, NewIteration, Operation, Session, SessionManager};
