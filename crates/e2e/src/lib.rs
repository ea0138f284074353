//! cartcheck browser verification
//!
//! This crate drives real storefronts through a browser to check that a
//! cart refresh routine leaves the page in the same visual state as the
//! storefront's own add-to-cart button:
//! - Controls Playwright through a long-lived Node bridge
//! - Runs the per-subject verification procedure as an explicit state machine
//! - Compares screenshots with a perceptual pixel diff
//! - Schedules subjects on a bounded work-stealing pool
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     BatchRunner (Rust)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  subjects::load_csv -> worklist::build -> scheduler::run    │
//! │                                              │              │
//! │  Procedure::run(subject, idx)  <─────────────┘              │
//! │    ├── Navigate / ResolveTestableItem / BaselineCapture     │
//! │    ├── LocateTrigger / TriggerAndCapture / BaseDiff         │
//! │    ├── ResetEnvironment / ManualTrigger / DelegatedRefresh  │
//! │    ├── PostRefreshCapture / RefreshDiff                     │
//! │    └── Write -> Ledger::append                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  BrowserDriver / PageSession   (PlaywrightBridge)           │
//! │  PageInspector                 (StorefrontInspector)        │
//! │  RefreshCapability             (ScriptedRefresh)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod browser;
pub mod error;
pub mod navigation;
pub mod playwright;
pub mod preload;
pub mod procedure;
pub mod refresh;
pub mod runner;
pub mod scheduler;
pub mod storefront;
pub mod visual;

pub use browser::{BrowserDriver, NavigationResponse, PageSession};
pub use error::{E2eError, E2eResult, ErrorKind};
pub use procedure::{Procedure, ProcedureSettings, Step, TerminalReason};
pub use refresh::{RefreshCapability, RefreshVariant};
pub use runner::{BatchRunner, Collaborators, RunSummary};
pub use storefront::{PageInspector, TestableItem, Trigger, VariantInfo};
pub use visual::{DiffOutcome, ImageDiffer};
