//! Debugger core: session state machine, event classification and the
//! synchronous backend gateway.
//!
//! The crate is backend-agnostic. All VM access goes through the
//! [`vigil_backend::DebugBackend`] trait, serialized by a
//! [`gateway::RequestGateway`] worker thread with a deadlock timeout. On
//! top of that sit the breakpoint registry (configured breakpoints and
//! their live request sets), the event classifier (what an incoming VM
//! event means given the per-thread stepping state), the thread-tree
//! reconciler and the watch evaluator, all tied together by
//! [`session::Session`].

pub mod breakpoints;
pub mod classify;
pub mod config;
pub mod error;
pub mod gateway;
pub mod session;
pub mod threads;
pub mod watches;

pub use breakpoints::{Breakpoint, BreakpointId, BreakpointKind, BreakpointRegistry};
pub use classify::{Action, Decision, StopReason, ThreadStepState};
pub use config::{init_tracing, ConfigError, DebuggerConfig};
pub use error::{DebugError, DebugResult};
pub use gateway::RequestGateway;
pub use session::{Session, SessionState};
pub use threads::{
    status_label, GroupNode, LocalSlot, NodeId, ThreadNode, ThreadTree, TreeSnapshot,
};
pub use watches::{Watch, WatchId, WatchTarget, WatchValue};
