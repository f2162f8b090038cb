//! Event classification: decide what an incoming VM event means given the
//! thread's last action and stack depth.
//!
//! The check is two-level on purpose: a location is first resolved against
//! registered breakpoints (so a step mid-flight cannot silently swallow a
//! real breakpoint at the same frame depth), and only then interpreted
//! against the pending step, if any (so spurious hits cannot surface
//! mid-step).

use vigil_backend::{ObjectRef, StopContext};

use crate::breakpoints::{BreakpointId, BreakpointRegistry};

/// The last control action performed, recorded per session and per thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Start,
    Go,
    TraceInto,
    TraceOver,
    StepOut,
    BreakpointHit,
}

/// Per-thread stepping state: the last action performed on that thread and
/// the stack depth observed when it was issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadStepState {
    pub last_action: Action,
    pub last_depth: usize,
}

impl ThreadStepState {
    pub fn new(last_action: Action, last_depth: usize) -> Self {
        Self {
            last_action,
            last_depth,
        }
    }

    /// State for a thread seen for the first time via an event.
    ///
    /// The depth sentinel is `current + 1`: deep enough that neither the
    /// trace-over nor the step-out depth comparison can match prematurely.
    /// Historical behavior, preserved deliberately.
    pub fn first_sighting(current_depth: usize, stop_on_main_pending: bool) -> Self {
        Self {
            last_action: if stop_on_main_pending {
                Action::TraceInto
            } else {
                Action::Start
            },
            last_depth: current_depth + 1,
        }
    }
}

/// What to do with a classified event.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Nothing to surface; resume the debuggee.
    Continue,
    /// Re-issue a line-level step (resolved line is not presentable).
    StepOver,
    /// Step out of a frame with no debuggable source.
    StepOut,
    /// Surface as a hit of the given breakpoint. For exception breakpoints
    /// the thrown object rides along as the inspectable variable.
    Breakpoint {
        id: BreakpointId,
        exception: Option<ObjectRef>,
    },
    /// Surface a plain stop at this location.
    Stop(StopReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// A step completed at a presentable location.
    Step,
    /// No breakpoint matched a thrown exception.
    Exception { caught: bool },
}

/// Whether the thread's last stepping action is still in progress at
/// `current_depth`, meaning this event is not independently a breakpoint.
pub fn step_in_progress(state: ThreadStepState, current_depth: usize) -> bool {
    match state.last_action {
        Action::TraceInto => true,
        Action::TraceOver => current_depth <= state.last_depth,
        Action::StepOut => current_depth < state.last_depth,
        Action::Start | Action::Go | Action::BreakpointHit => false,
    }
}

/// Classify a located event (breakpoint hit or step completion).
///
/// `fired` carries the owning breakpoint of the fired request when that
/// breakpoint cannot be resolved by location (variable watchpoints); line
/// and method kinds resolve through the registry so step suppression still
/// applies to them.
pub fn classify(
    ctx: &StopContext,
    state: ThreadStepState,
    fired: Option<BreakpointId>,
    registry: &BreakpointRegistry,
) -> Decision {
    let pending = step_in_progress(state, ctx.stack_depth);

    // Method breakpoints are suppressed while a trace-over sits at the
    // depth it started from; every method entered at that depth belongs to
    // the line being stepped over.
    let skip_method_breakpoints =
        state.last_action == Action::TraceOver && ctx.stack_depth == state.last_depth;
    if let Some(id) = registry.match_location(
        &ctx.class_name,
        ctx.line,
        &ctx.method_name,
        skip_method_breakpoints,
    ) {
        tracing::debug!(
            class = %ctx.class_name,
            line = ctx.line,
            breakpoint = %id,
            "event resolved to breakpoint"
        );
        return Decision::Breakpoint {
            id,
            exception: None,
        };
    }

    if let Some(id) = fired {
        // A watchpoint fired; the stop belongs to its breakpoint even
        // though no line resolves to one.
        tracing::debug!(breakpoint = %id, "event resolved to the fired request's breakpoint");
        return Decision::Breakpoint {
            id,
            exception: None,
        };
    }

    if !pending {
        // Not stepping, no registered breakpoint wants this location and
        // the request has no live owner: a stale request fired. Resume
        // without bothering the user.
        tracing::debug!(class = %ctx.class_name, line = ctx.line, "ignoring stray event");
        return Decision::Continue;
    }

    if !ctx.has_source
        && matches!(state.last_action, Action::TraceOver | Action::StepOut)
    {
        // The step has not returned to debuggable code yet; keep going out
        // rather than surfacing a frame nobody can look at.
        return Decision::StepOut;
    }

    if !ctx.line_presentable {
        // Stopped on a line the editor cannot show; step by line until one
        // is presentable.
        return Decision::StepOver;
    }

    Decision::Stop(StopReason::Step)
}

/// Classify an exception event by the thrown class name.
pub fn classify_exception(
    exception: &ObjectRef,
    caught: bool,
    registry: &BreakpointRegistry,
) -> Decision {
    match registry.match_exception(&exception.runtime_type, caught) {
        Some(id) => Decision::Breakpoint {
            id,
            exception: Some(exception.clone()),
        },
        None => Decision::Stop(StopReason::Exception { caught }),
    }
}
