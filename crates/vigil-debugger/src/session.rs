//! The debug session state machine.
//!
//! A session moves between three states. `NotRunning` before start and
//! after teardown, `Running` while the debuggee executes, `Stopped` while
//! it is suspended with a current thread selected. Every transition into
//! `Stopped` goes through one path that suspends the VM, reconciles the
//! thread tree and re-evaluates watches, so views observe a consistent
//! world no matter what caused the stop.
//!
//! Terminal failures (deadlock, disconnect, process exit) tear the session
//! down to `NotRunning`; breakpoints and watches survive as configuration
//! and are re-armed by the next [`Session::start`] or
//! [`Session::reconnect`].

use std::collections::{BTreeMap, HashMap};

use vigil_backend::{
    BackendEvent, DebugBackend, FrameInfo, LocalVariable, Location, ObjectRef, RequestId,
    RequestKind, StepKind, StopContext, ThreadId, ThreadStatus,
};

use crate::breakpoints::{BreakpointId, BreakpointKind, BreakpointRegistry};
use crate::classify::{self, Action, Decision, StopReason, ThreadStepState};
use crate::config::DebuggerConfig;
use crate::error::{DebugError, DebugResult};
use crate::gateway::RequestGateway;
use crate::threads::{ThreadTree, TreeSnapshot};
use crate::watches::{Watch, WatchId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NotRunning,
    Running,
    Stopped,
}

pub struct Session {
    config: DebuggerConfig,
    gateway: Option<RequestGateway>,
    state: SessionState,
    /// The most recent control action, session-wide.
    last_action: Action,
    registry: BreakpointRegistry,
    tree: ThreadTree,
    /// Authoritative per-thread stepping state; tree nodes carry a mirror.
    step_states: HashMap<ThreadId, ThreadStepState>,
    watches: BTreeMap<WatchId, Watch>,
    next_watch: WatchId,
    current_thread: Option<ThreadId>,
    /// Stack depth of the current thread at the last stop.
    current_depth: usize,
    main_class: Option<String>,
    /// Class whose `main` the stop-on-main sequence targets; defaults to
    /// the main class.
    stop_class: Option<String>,
    /// Run-to-main is still outstanding: the next surfaced stop clears it.
    stop_on_main_pending: bool,
    /// Method traps on the stop class's `main`, cleared at the first stop.
    start_requests: Vec<RequestId>,
    stop_message: Option<String>,
}

impl Session {
    pub fn new(config: DebuggerConfig) -> Self {
        Self {
            config,
            gateway: None,
            state: SessionState::NotRunning,
            last_action: Action::Start,
            registry: BreakpointRegistry::new(),
            tree: ThreadTree::new(),
            step_states: HashMap::new(),
            watches: BTreeMap::new(),
            next_watch: 0,
            current_thread: None,
            current_depth: 0,
            main_class: None,
            stop_class: None,
            stop_on_main_pending: false,
            start_requests: Vec::new(),
            stop_message: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_action(&self) -> Action {
        self.last_action
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current_thread
    }

    /// Human-readable description of the last stop (or teardown).
    pub fn stop_message(&self) -> Option<&str> {
        self.stop_message.as_deref()
    }

    pub fn thread_tree(&self) -> &ThreadTree {
        &self.tree
    }

    pub fn breakpoints(&self) -> &BreakpointRegistry {
        &self.registry
    }

    // ---- lifecycle -------------------------------------------------------

    /// Launch the debuggee and enter `Running`. Arms every enabled
    /// breakpoint; when configured, additionally traps `main` of the stop
    /// class (the main class when none is given) so the session halts at
    /// the program entry.
    pub fn start(
        &mut self,
        backend: Box<dyn DebugBackend>,
        main_class: &str,
        args: &[String],
        stop_class: Option<&str>,
        kill: impl FnOnce() + Send + 'static,
    ) -> DebugResult<()> {
        if self.gateway.is_some() {
            return Err(DebugError::InvalidRequest(
                "a session is already active".to_string(),
            ));
        }

        let gateway = RequestGateway::new(backend, self.config.deadlock_timeout(), kill);
        let main = main_class.to_string();
        {
            let main = main.clone();
            let args = args.to_vec();
            gateway.run_blocking(move |backend| backend.launch(&main, &args))?;
        }
        tracing::info!(main_class = %main, "debuggee launched");

        self.gateway = Some(gateway);
        self.main_class = Some(main);
        self.stop_class = stop_class.map(str::to_string);
        self.stop_on_main_pending = self.config.stop_on_main;
        self.state = SessionState::Running;
        self.last_action = Action::Start;
        self.stop_message = None;

        let entry_class = self.effective_stop_class().unwrap_or_default().to_string();
        if let Some(gateway) = self.gateway.as_ref() {
            for id in self.registry.ids() {
                if self.registry.get(id).map_or(false, |bp| bp.is_enabled()) {
                    self.registry.arm(id, gateway)?;
                }
            }
            if self.stop_on_main_pending {
                self.start_requests = install_start_requests(gateway, &entry_class)?;
            }
            gateway.run_blocking_ignoring_errors(|backend| backend.resume_all());
        }
        Ok(())
    }

    /// Attach to an already-running debuggee, re-arming the configured
    /// breakpoints. Used after a connection drop.
    pub fn reconnect(
        &mut self,
        backend: Box<dyn DebugBackend>,
        kill: impl FnOnce() + Send + 'static,
    ) -> DebugResult<()> {
        if self.gateway.is_some() {
            return Err(DebugError::InvalidRequest(
                "a session is already active".to_string(),
            ));
        }

        self.gateway = Some(RequestGateway::new(
            backend,
            self.config.deadlock_timeout(),
            kill,
        ));
        self.state = SessionState::Running;
        self.last_action = Action::Start;
        self.stop_message = None;

        if let Some(gateway) = self.gateway.as_ref() {
            for id in self.registry.ids() {
                if self.registry.get(id).map_or(false, |bp| bp.is_enabled()) {
                    if let Err(err) = self.registry.arm(id, gateway) {
                        tracing::warn!(breakpoint = %id, %err, "re-arm after reconnect failed");
                    }
                }
            }
        }
        self.refresh_threads()
    }

    /// End the session deliberately: disconnect and tear down.
    pub fn finish(&mut self) {
        if let Some(gateway) = self.gateway.as_ref() {
            gateway.run_blocking_ignoring_errors(|backend| {
                backend.disconnect();
                Ok(())
            });
        }
        self.teardown();
        self.stop_message = Some("Debugging session finished".to_string());
    }

    // ---- event pump ------------------------------------------------------

    /// Drain and dispatch all pending backend events. Returns how many
    /// were handled.
    pub fn pump_events(&mut self) -> DebugResult<usize> {
        let mut handled = 0;
        loop {
            let polled = match self.gateway.as_ref() {
                Some(gateway) => gateway.run_blocking(|backend| backend.poll_event()),
                None => return Ok(handled),
            };
            match polled.map_err(|err| self.fail(err))? {
                Some(event) => {
                    self.handle_event(event)?;
                    handled += 1;
                }
                None => return Ok(handled),
            }
        }
    }

    pub fn handle_event(&mut self, event: BackendEvent) -> DebugResult<()> {
        tracing::debug!(?event, "backend event");
        match event {
            BackendEvent::BreakpointHit {
                request,
                thread,
                location,
            } => self.on_located_event(thread, location, Some(request)),
            BackendEvent::StepCompleted { thread, location } => {
                self.on_located_event(thread, location, None)
            }
            BackendEvent::ExceptionThrown {
                thread,
                location,
                exception,
                caught,
            } => self.on_exception(thread, location, exception, caught),
            BackendEvent::ClassPrepared { name, .. } => self.on_class_event(&name, false),
            BackendEvent::ClassUnloaded { name } => self.on_class_event(&name, true),
            BackendEvent::ThreadStarted { thread } => self.on_thread_started(thread),
            BackendEvent::ThreadDied { thread } => self.on_thread_died(thread),
            BackendEvent::ProcessExited { code } => {
                tracing::info!(code, "debuggee exited");
                self.teardown();
                self.stop_message = Some(format!("Debuggee exited with code {code}"));
                Ok(())
            }
        }
    }

    /// A breakpoint or step event carrying a code location.
    fn on_located_event(
        &mut self,
        thread: ThreadId,
        location: Location,
        request: Option<RequestId>,
    ) -> DebugResult<()> {
        let ctx = self.fetch_stop_context(thread, location)?;
        let hit = request.and_then(|request| self.registry.note_hit(request));
        // Line and method hits are resolved by location below (so a
        // trace-over can suppress method traps); watchpoint hits have no
        // such resolution and surface through the fired request's owner.
        let fired = hit.filter(|id| {
            matches!(
                self.registry.get(*id).map(|bp| bp.kind()),
                Some(BreakpointKind::Variable { .. })
            )
        });

        let pending_main = self.stop_on_main_pending;
        let state = *self
            .step_states
            .entry(thread)
            .or_insert_with(|| ThreadStepState::first_sighting(ctx.stack_depth, pending_main));

        let decision = classify::classify(&ctx, state, fired, &self.registry);
        self.apply_decision(thread, &ctx, decision)
    }

    fn on_exception(
        &mut self,
        thread: ThreadId,
        location: Location,
        exception: ObjectRef,
        caught: bool,
    ) -> DebugResult<()> {
        let ctx = self.fetch_stop_context(thread, location)?;

        let decision = classify::classify_exception(&exception, caught, &self.registry);
        if let Decision::Breakpoint { id, .. } = decision {
            self.registry.attach_exception(id, exception.clone());
        }
        self.step_states.insert(
            thread,
            ThreadStepState::new(Action::BreakpointHit, ctx.stack_depth),
        );
        self.last_action = Action::BreakpointHit;

        let qualifier = if caught { "caught" } else { "uncaught" };
        let message = format!(
            "Exception {} ({qualifier}) at {}.{}:{} in thread \"{}\"",
            exception.runtime_type, ctx.class_name, ctx.method_name, ctx.line, ctx.thread_name
        );
        self.on_stopped(thread, &ctx, message)
    }

    fn on_class_event(&mut self, name: &str, unload: bool) -> DebugResult<()> {
        if !unload {
            if let Some(gateway) = self.gateway.as_ref() {
                self.registry.on_class_prepared(name, gateway);
            }
            // The stop class may only now have a `main` to trap.
            if self.stop_on_main_pending && self.is_stop_class(name) {
                let entry_class = self.effective_stop_class().unwrap_or_default().to_string();
                if let Some(gateway) = self.gateway.as_ref() {
                    match install_start_requests(gateway, &entry_class) {
                        Ok(mut requests) => self.start_requests.append(&mut requests),
                        Err(err) => {
                            tracing::warn!(%err, "installing entry traps failed")
                        }
                    }
                }
            }
        }

        if let Some(id) = self.registry.match_class_event(name, unload) {
            let what = if unload { "unloaded" } else { "loaded" };
            self.stop_without_location(format!("Class {name} {what} ({id})"))
        } else {
            if self.state == SessionState::Running {
                self.resume_ignoring_errors();
            }
            Ok(())
        }
    }

    fn on_thread_started(&mut self, thread: ThreadId) -> DebugResult<()> {
        let info = match self.gateway.as_ref() {
            Some(gateway) => gateway.run_blocking(move |backend| backend.thread_info(thread)),
            None => return Ok(()),
        };
        match info {
            Ok(info) => {
                self.tree.adopt(info);
            }
            Err(err) => {
                let err = self.fail(err);
                if err.is_terminal() {
                    return Err(err);
                }
                // The thread can be gone again before we look at it.
                tracing::debug!(thread, %err, "started thread vanished");
            }
        }

        if let Some(id) = self.registry.match_thread_event(false) {
            self.stop_without_location(format!("Thread started ({id})"))
        } else {
            if self.state == SessionState::Running {
                self.resume_ignoring_errors();
            }
            Ok(())
        }
    }

    fn on_thread_died(&mut self, thread: ThreadId) -> DebugResult<()> {
        self.step_states.remove(&thread);
        self.tree.remove_thread(thread);
        if self.current_thread == Some(thread) {
            self.current_thread = None;
            self.tree.set_current(None);
        }

        if let Some(id) = self.registry.match_thread_event(true) {
            self.stop_without_location(format!("Thread died ({id})"))
        } else {
            if self.state == SessionState::Running {
                self.resume_ignoring_errors();
            }
            Ok(())
        }
    }

    fn apply_decision(
        &mut self,
        thread: ThreadId,
        ctx: &StopContext,
        decision: Decision,
    ) -> DebugResult<()> {
        match decision {
            Decision::Continue => {
                self.resume_ignoring_errors();
                Ok(())
            }
            Decision::StepOver => {
                self.issue_step(thread, ctx.stack_depth, StepKind::Over, Action::TraceOver)
            }
            Decision::StepOut => {
                self.issue_step(thread, ctx.stack_depth, StepKind::Out, Action::StepOut)
            }
            Decision::Breakpoint { id, exception } => {
                if let Some(exception) = exception {
                    self.registry.attach_exception(id, exception);
                }
                self.step_states.insert(
                    thread,
                    ThreadStepState::new(Action::BreakpointHit, ctx.stack_depth),
                );
                self.last_action = Action::BreakpointHit;
                let message = format!(
                    "Breakpoint hit at {}.{}:{} in thread \"{}\"",
                    ctx.class_name, ctx.method_name, ctx.line, ctx.thread_name
                );
                self.on_stopped(thread, ctx, message)
            }
            Decision::Stop(StopReason::Step) => {
                if let Some(state) = self.step_states.get_mut(&thread) {
                    state.last_depth = ctx.stack_depth;
                }
                let message = format!(
                    "Step completed at {}.{}:{} in thread \"{}\"",
                    ctx.class_name, ctx.method_name, ctx.line, ctx.thread_name
                );
                self.on_stopped(thread, ctx, message)
            }
            Decision::Stop(StopReason::Exception { caught }) => {
                let qualifier = if caught { "caught" } else { "uncaught" };
                let message = format!(
                    "Exception ({qualifier}) at {}.{}:{} in thread \"{}\"",
                    ctx.class_name, ctx.method_name, ctx.line, ctx.thread_name
                );
                self.on_stopped(thread, ctx, message)
            }
        }
    }

    /// The single path into `Stopped`.
    fn on_stopped(
        &mut self,
        thread: ThreadId,
        ctx: &StopContext,
        message: String,
    ) -> DebugResult<()> {
        tracing::info!(%message);
        self.state = SessionState::Stopped;
        self.current_thread = Some(thread);
        self.current_depth = ctx.stack_depth;
        self.stop_message = Some(message);
        self.clear_start_requests();

        if let Some(gateway) = self.gateway.as_ref() {
            gateway.run_blocking_ignoring_errors(|backend| backend.suspend_all());
        }
        self.refresh_threads()?;
        self.tree.set_current(Some(thread));
        self.refresh_watches();
        Ok(())
    }

    /// Stops not tied to a code location (class and thread trace events,
    /// user pause). The current thread selection is left alone.
    fn stop_without_location(&mut self, message: String) -> DebugResult<()> {
        tracing::info!(%message);
        self.state = SessionState::Stopped;
        self.stop_message = Some(message);
        if let Some(gateway) = self.gateway.as_ref() {
            gateway.run_blocking_ignoring_errors(|backend| backend.suspend_all());
        }
        self.refresh_threads()?;
        self.refresh_watches();
        Ok(())
    }

    // ---- user actions ----------------------------------------------------

    /// Resume the debuggee until the next stop.
    pub fn go(&mut self) -> DebugResult<()> {
        self.require_stopped()?;
        if let Some(thread) = self.current_thread {
            self.step_states
                .insert(thread, ThreadStepState::new(Action::Go, self.current_depth));
        }
        self.last_action = Action::Go;
        self.state = SessionState::Running;
        self.stop_message = None;
        self.tree.set_current(None);

        let result = match self.gateway.as_ref() {
            Some(gateway) => gateway.run_blocking(|backend| backend.resume_all()),
            None => return Err(DebugError::BackendUnavailable),
        };
        result.map_err(|err| self.fail(err))
    }

    pub fn trace_into(&mut self) -> DebugResult<()> {
        self.user_step(StepKind::Into, Action::TraceInto)
    }

    pub fn trace_over(&mut self) -> DebugResult<()> {
        self.user_step(StepKind::Over, Action::TraceOver)
    }

    pub fn step_out(&mut self) -> DebugResult<()> {
        self.user_step(StepKind::Out, Action::StepOut)
    }

    fn user_step(&mut self, kind: StepKind, action: Action) -> DebugResult<()> {
        self.require_stopped()?;
        let thread = self.current_thread.ok_or_else(|| {
            DebugError::InvalidRequest("no current thread to step".to_string())
        })?;
        self.last_action = action;
        self.state = SessionState::Running;
        self.stop_message = None;
        self.issue_step(thread, self.current_depth, kind, action)
    }

    fn issue_step(
        &mut self,
        thread: ThreadId,
        depth: usize,
        kind: StepKind,
        action: Action,
    ) -> DebugResult<()> {
        self.step_states
            .insert(thread, ThreadStepState::new(action, depth));
        let result = match self.gateway.as_ref() {
            Some(gateway) => gateway.run_blocking(move |backend| {
                backend.step(thread, kind)?;
                backend.resume_all()
            }),
            None => return Err(DebugError::BackendUnavailable),
        };
        result.map_err(|err| self.fail(err))
    }

    /// Suspend everything without an event, as a user pause.
    pub fn pause(&mut self) -> DebugResult<()> {
        if self.gateway.is_none() {
            return Err(DebugError::BackendUnavailable);
        }
        self.stop_without_location("Debuggee suspended".to_string())
    }

    pub fn suspend_thread(&mut self, thread: ThreadId) -> DebugResult<()> {
        let result = match self.gateway.as_ref() {
            Some(gateway) => gateway.run_blocking(move |backend| backend.suspend_thread(thread)),
            None => return Err(DebugError::BackendUnavailable),
        };
        result.map_err(|err| self.fail(err))?;
        if let Some(node) = self.tree.find_thread_mut(thread) {
            node.status = ThreadStatus::Suspended;
        }
        Ok(())
    }

    pub fn resume_thread(&mut self, thread: ThreadId) -> DebugResult<()> {
        let result = match self.gateway.as_ref() {
            Some(gateway) => gateway.run_blocking(move |backend| backend.resume_thread(thread)),
            None => return Err(DebugError::BackendUnavailable),
        };
        result.map_err(|err| self.fail(err))?;
        if let Some(node) = self.tree.find_thread_mut(thread) {
            node.status = ThreadStatus::Running;
        }
        Ok(())
    }

    /// Fetch the live call stack of `thread`.
    pub fn call_stack(&mut self, thread: ThreadId) -> DebugResult<Vec<FrameInfo>> {
        let result = match self.gateway.as_ref() {
            Some(gateway) => gateway.run_blocking(move |backend| backend.frames(thread)),
            None => return Err(DebugError::BackendUnavailable),
        };
        result.map_err(|err| self.fail(err))
    }

    /// Fetch the local variables of one stack frame of `thread`.
    pub fn frame_locals(
        &mut self,
        thread: ThreadId,
        frame: usize,
    ) -> DebugResult<Vec<LocalVariable>> {
        let result = match self.gateway.as_ref() {
            Some(gateway) => {
                gateway.run_blocking(move |backend| backend.frame_locals(thread, frame))
            }
            None => return Err(DebugError::BackendUnavailable),
        };
        result.map_err(|err| self.fail(err))
    }

    /// Make `thread` the context for stepping and watches.
    pub fn select_thread(&mut self, thread: ThreadId) -> DebugResult<()> {
        let depth = self
            .tree
            .find_thread(thread)
            .map(|node| node.frames.len())
            .ok_or_else(|| DebugError::InvalidRequest(format!("unknown thread {thread}")))?;
        self.current_thread = Some(thread);
        self.current_depth = depth;
        self.tree.set_current(Some(thread));
        if self.state == SessionState::Stopped {
            self.refresh_watches();
        }
        Ok(())
    }

    // ---- breakpoints -----------------------------------------------------

    /// Register a breakpoint; armed immediately when a session is active.
    pub fn add_breakpoint(&mut self, kind: BreakpointKind) -> DebugResult<BreakpointId> {
        let id = self.registry.create(kind);
        if let Some(gateway) = self.gateway.as_ref() {
            self.registry.arm(id, gateway)?;
        }
        Ok(id)
    }

    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> DebugResult<()> {
        match self.gateway.as_ref() {
            Some(gateway) => self.registry.remove(id, gateway),
            None => {
                self.registry.forget(id);
                Ok(())
            }
        }
    }

    pub fn set_breakpoint_enabled(&mut self, id: BreakpointId, enabled: bool) -> DebugResult<()> {
        match self.gateway.as_ref() {
            Some(gateway) => {
                self.registry.set_enabled(id, enabled, gateway)?;
                Ok(())
            }
            None => {
                self.registry.set_enabled_detached(id, enabled);
                Ok(())
            }
        }
    }

    // ---- watches ---------------------------------------------------------

    /// Register a watch expression. Hidden watches evaluate like visible
    /// ones but are skipped by [`Session::visible_watches`].
    pub fn add_watch(&mut self, expression: &str, hidden: bool) -> DebugResult<WatchId> {
        let mut watch = Watch::new(expression, hidden)?;
        if self.state == SessionState::Stopped {
            if let (Some(gateway), Some(thread)) = (self.gateway.as_ref(), self.current_thread) {
                if let Err(err) = watch.refresh(gateway, thread, 0) {
                    tracing::warn!(expression, %err, "initial watch evaluation failed");
                }
            }
        }
        self.next_watch += 1;
        let id = self.next_watch;
        self.watches.insert(id, watch);
        Ok(id)
    }

    pub fn remove_watch(&mut self, id: WatchId) {
        self.watches.remove(&id);
    }

    pub fn watch(&self, id: WatchId) -> Option<&Watch> {
        self.watches.get(&id)
    }

    pub fn visible_watches(&self) -> impl Iterator<Item = (WatchId, &Watch)> {
        self.watches
            .iter()
            .filter(|(_, w)| !w.is_hidden())
            .map(|(id, w)| (*id, w))
    }

    /// Parse and write a new value into a watched variable or field.
    pub fn set_watch_text(&mut self, id: WatchId, text: &str) -> DebugResult<()> {
        self.require_stopped()?;
        let thread = self.current_thread.ok_or_else(|| {
            DebugError::InvalidRequest("no current thread selected".to_string())
        })?;
        let Some(gateway) = self.gateway.as_ref() else {
            return Err(DebugError::BackendUnavailable);
        };
        let watch = self
            .watches
            .get_mut(&id)
            .ok_or_else(|| DebugError::InvalidRequest(format!("unknown watch {id}")))?;
        watch.set_as_text(gateway, thread, 0, text)
    }

    // ---- internals -------------------------------------------------------

    /// Re-sync the thread tree from the backend. Frames and locals are
    /// captured only while stopped.
    pub fn refresh_threads(&mut self) -> DebugResult<()> {
        let with_frames = self.state == SessionState::Stopped;
        let result = match self.gateway.as_ref() {
            Some(gateway) => {
                gateway.run_blocking(move |backend| TreeSnapshot::capture(backend, with_frames))
            }
            None => return Err(DebugError::BackendUnavailable),
        };
        let snapshot = result.map_err(|err| self.fail(err))?;
        self.tree.refresh(&snapshot);

        let states = &self.step_states;
        self.tree
            .for_each_thread_mut(|node| node.step = states.get(&node.handle).copied());
        Ok(())
    }

    fn refresh_watches(&mut self) {
        let Some(thread) = self.current_thread else {
            for watch in self.watches.values_mut() {
                watch.invalidate();
            }
            return;
        };
        let Some(gateway) = self.gateway.as_ref() else {
            return;
        };
        for watch in self.watches.values_mut() {
            if let Err(err) = watch.refresh(gateway, thread, 0) {
                tracing::warn!(expression = watch.expression(), %err, "watch refresh failed");
            }
        }
    }

    fn fetch_stop_context(
        &mut self,
        thread: ThreadId,
        location: Location,
    ) -> DebugResult<StopContext> {
        let result = match self.gateway.as_ref() {
            Some(gateway) => {
                gateway.run_blocking(move |backend| backend.stop_context(thread, &location))
            }
            None => return Err(DebugError::BackendUnavailable),
        };
        result.map_err(|err| self.fail(err))
    }

    fn clear_start_requests(&mut self) {
        self.stop_on_main_pending = false;
        let stale = std::mem::take(&mut self.start_requests);
        if stale.is_empty() {
            return;
        }
        if let Some(gateway) = self.gateway.as_ref() {
            gateway.run_blocking_ignoring_errors(move |backend| {
                for request in stale {
                    backend.clear_request(request)?;
                }
                Ok(())
            });
        }
    }

    fn resume_ignoring_errors(&self) {
        if let Some(gateway) = self.gateway.as_ref() {
            gateway.run_blocking_ignoring_errors(|backend| backend.resume_all());
        }
    }

    fn require_stopped(&self) -> DebugResult<()> {
        if self.state == SessionState::Stopped {
            Ok(())
        } else {
            Err(DebugError::InvalidRequest(
                "debuggee is not stopped".to_string(),
            ))
        }
    }

    fn effective_stop_class(&self) -> Option<&str> {
        self.stop_class.as_deref().or(self.main_class.as_deref())
    }

    fn is_stop_class(&self, name: &str) -> bool {
        self.effective_stop_class().map_or(false, |target| {
            name == target
                || name
                    .strip_prefix(target)
                    .map_or(false, |rest| rest.starts_with('$'))
        })
    }

    /// Terminal failures end the session; everything else passes through.
    fn fail(&mut self, err: DebugError) -> DebugError {
        if err.is_terminal() {
            tracing::error!(%err, "terminal backend failure; ending session");
            self.teardown();
            self.stop_message = Some(format!("Debugging session lost: {err}"));
        }
        err
    }

    /// Drop all live session state. Breakpoint and watch configuration
    /// survives for the next session; their runtime bindings do not.
    fn teardown(&mut self) {
        self.registry.discard_requests();
        for watch in self.watches.values_mut() {
            watch.invalidate();
        }
        self.tree.clear();
        self.step_states.clear();
        self.current_thread = None;
        self.current_depth = 0;
        self.stop_on_main_pending = false;
        self.start_requests.clear();
        self.state = SessionState::NotRunning;
        // Dropping the gateway closes the job channel; the worker loop ends
        // and disconnects the backend.
        self.gateway = None;
    }
}

/// Trap every `main` of the stop class, plus a class-prepare watch in case
/// the class is not loaded yet. Runs as a single gateway job.
fn install_start_requests(
    gateway: &RequestGateway,
    main_class: &str,
) -> DebugResult<Vec<RequestId>> {
    let class = main_class.to_string();
    gateway.run_blocking(move |backend| {
        let mut requests = Vec::new();
        for info in backend.classes_by_name(&class)? {
            for method in backend.methods(info.id)? {
                if method.name == "main" {
                    requests.push(backend.install_request(RequestKind::Method {
                        class: info.id,
                        method: method.id,
                    })?);
                }
            }
        }
        requests.push(backend.install_request(RequestKind::ClassPrepare {
            pattern: format!("{class}*"),
        })?);
        Ok(requests)
    })
}
