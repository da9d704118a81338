//! # Sykli Core Library
//!
//! CI/CD pipeline runner: an SDK emits a JSON task graph, sykli validates
//! and schedules it level-parallel with content-addressed caching, and can
//! distribute tasks across cooperating daemons.
//!
//! ## Pipeline flow
//!
//! 1. **Load** - [`sdk`] runs the per-language emitter (`--emit`) and
//!    [`graph`] validates the document: outputs normalized, matrices
//!    expanded, cycles and artifact wiring checked
//! 2. **Schedule** - [`graph::topo`] layers tasks into dependency levels;
//!    [`exec`] fans out one worker per task per level
//! 3. **Execute** - each worker resolves artifacts, gates on its
//!    [`condition`], validates secrets, consults the [`cache`], then runs
//!    through a [`target`] driver with retries
//! 4. **Record** - [`history`] persists the run manifest and builds the
//!    occurrence document (error locations, git blame, regressions)
//!
//! ## Distribution
//!
//! [`mesh`] discovers peer daemons over multicast, places tasks by label
//! with try-next-on-failure, and dispatches over cookie-authenticated
//! JSON RPC. [`events`] is the process-local bus; reporters forward to the
//! coordinator role, which aggregates runs across nodes.
//!
//! ## Error codes
//!
//! All failures carry stable codes (see [`error::SykliError::code`]):
//!
//! | Range | Layer |
//! |-------|-------|
//! | E001..E003 | task execution |
//! | E010..E013 | graph validation |
//! | E020..E024 | SDK protocol |
//! | E030..E035 | runtime environment |
//! | E040 | internal |

pub mod cache;
pub mod condition;
pub mod config;
pub mod daemon;
pub mod delta;
pub mod error;
pub mod events;
pub mod exec;
pub mod gitctx;
pub mod graph;
pub mod history;
pub mod mesh;
pub mod planner;
pub mod sdk;
pub mod target;

pub use cache::{CacheDecision, CacheOutcome, CacheRepo, MissReason};
pub use error::{Result, SykliError};
pub use events::{Event, EventBus, EventKind};
pub use exec::{ExecOptions, Executor, RunSummary, TaskOutcome, TaskStatus};
pub use graph::{load_graph, Graph, Task};
pub use history::{HistoryStore, RunRecord};
pub use target::{create_target, Target};
