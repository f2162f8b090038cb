//! Breakpoint registry: configured breakpoint events and their live
//! backend request sets.
//!
//! Breakpoint kinds are a plain sum type; arming dispatches on the kind in
//! one place instead of an override chain. Class-scoped kinds resolve
//! against already-loaded classes and additionally install a class-prepare
//! watch, so classes loaded later are retro-armed automatically.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use vigil_backend::{BackendError, DebugBackend, ObjectRef, RequestId, RequestKind};

use crate::error::{DebugError, DebugResult};
use crate::gateway::RequestGateway;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointId(u32);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bp#{}", self.0)
    }
}

/// One configured breakpoint variant with its kind-specific fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointKind {
    Line {
        class: String,
        line: u32,
    },
    Method {
        class: String,
        /// `None` means every non-synthetic method of the class.
        method: Option<String>,
    },
    Exception {
        class: String,
        caught: bool,
        uncaught: bool,
    },
    Class {
        pattern: String,
        exclude: Option<String>,
        on_prepare: bool,
        on_unload: bool,
    },
    Thread {
        on_start: bool,
        on_death: bool,
    },
    Variable {
        class: String,
        field: String,
        on_access: bool,
        on_modify: bool,
    },
}

impl BreakpointKind {
    /// The class this breakpoint resolves against, for class-scoped kinds.
    fn target_class(&self) -> Option<&str> {
        match self {
            Self::Line { class, .. }
            | Self::Method { class, .. }
            | Self::Exception { class, .. }
            | Self::Variable { class, .. } => Some(class),
            Self::Class { .. } | Self::Thread { .. } => None,
        }
    }
}

/// The live backend watch/trap handles owned by one breakpoint.
#[derive(Debug, Default)]
pub struct RequestSet {
    requests: Vec<RequestId>,
}

impl RequestSet {
    pub fn ids(&self) -> &[RequestId] {
        &self.requests
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn contains(&self, request: RequestId) -> bool {
        self.requests.contains(&request)
    }

    fn extend(&mut self, requests: Vec<RequestId>) {
        self.requests.extend(requests);
    }

    fn take_all(&mut self) -> Vec<RequestId> {
        std::mem::take(&mut self.requests)
    }
}

#[derive(Debug)]
pub struct Breakpoint {
    id: BreakpointId,
    kind: BreakpointKind,
    enabled: bool,
    valid: bool,
    requests: RequestSet,
    prepare_watch: Option<RequestId>,
    last_exception: Option<ObjectRef>,
}

impl Breakpoint {
    pub fn id(&self) -> BreakpointId {
        self.id
    }

    pub fn kind(&self) -> &BreakpointKind {
        &self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A breakpoint is valid once a concrete request was installed, a
    /// deferred class-prepare watch is pending, or a request has fired.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn requests(&self) -> &RequestSet {
        &self.requests
    }

    /// The exception object delivered with the most recent hit, for
    /// exception breakpoints.
    pub fn last_exception(&self) -> Option<&ObjectRef> {
        self.last_exception.as_ref()
    }
}

/// Result of resolving one breakpoint against the loaded-class list.
struct InstallOutcome {
    requests: Vec<RequestId>,
    prepare_watch: Option<RequestId>,
}

pub struct BreakpointRegistry {
    next: u32,
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self {
            next: 0,
            breakpoints: BTreeMap::new(),
        }
    }

    pub fn create(&mut self, kind: BreakpointKind) -> BreakpointId {
        self.next += 1;
        let id = BreakpointId(self.next);
        self.breakpoints.insert(
            id,
            Breakpoint {
                id,
                kind,
                enabled: true,
                valid: false,
                requests: RequestSet::default(),
                prepare_watch: None,
                last_exception: None,
            },
        );
        id
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn ids(&self) -> Vec<BreakpointId> {
        self.breakpoints.keys().copied().collect()
    }

    /// Arm a breakpoint: always disarms any existing requests first, then
    /// re-resolves against the loaded-class list and installs on *every*
    /// matching class. Returns true iff the breakpoint ended up valid
    /// (concrete request installed or class-prepare watch pending).
    ///
    /// Backend disconnect is swallowed and leaves the breakpoint disarmed;
    /// once the VM is gone no breakpoint state is meaningful.
    pub fn arm(&mut self, id: BreakpointId, gateway: &RequestGateway) -> DebugResult<bool> {
        self.disarm(id, gateway)?;

        let bp = self
            .breakpoints
            .get(&id)
            .ok_or_else(|| DebugError::InvalidRequest(format!("unknown breakpoint {id}")))?;
        let kind = bp.kind.clone();

        let outcome = match gateway.run_blocking(move |backend| install_requests(backend, &kind)) {
            Ok(outcome) => outcome,
            Err(err) if err.is_terminal() => {
                tracing::warn!(breakpoint = %id, %err, "arm failed; treating as disarmed");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        let bp = self
            .breakpoints
            .get_mut(&id)
            .ok_or_else(|| DebugError::InvalidRequest(format!("unknown breakpoint {id}")))?;
        let valid = !outcome.requests.is_empty() || outcome.prepare_watch.is_some();
        bp.requests.extend(outcome.requests);
        bp.prepare_watch = outcome.prepare_watch;
        bp.valid = valid;
        tracing::debug!(
            breakpoint = %id,
            requests = bp.requests.ids().len(),
            pending = bp.prepare_watch.is_some(),
            "armed"
        );
        Ok(valid)
    }

    /// Remove all live requests of a breakpoint. A no-op when never armed.
    /// Backend failures are best-effort only; the local request set is
    /// cleared regardless.
    pub fn disarm(&mut self, id: BreakpointId, gateway: &RequestGateway) -> DebugResult<()> {
        let bp = self
            .breakpoints
            .get_mut(&id)
            .ok_or_else(|| DebugError::InvalidRequest(format!("unknown breakpoint {id}")))?;

        let mut stale = bp.requests.take_all();
        if let Some(watch) = bp.prepare_watch.take() {
            stale.push(watch);
        }
        bp.valid = false;

        if !stale.is_empty() {
            gateway.run_blocking_ignoring_errors(move |backend| {
                for request in stale {
                    backend.clear_request(request)?;
                }
                Ok(())
            });
        }
        Ok(())
    }

    /// Enable (arm) or disable (disarm) without forgetting the breakpoint.
    pub fn set_enabled(
        &mut self,
        id: BreakpointId,
        enabled: bool,
        gateway: &RequestGateway,
    ) -> DebugResult<bool> {
        if enabled {
            if let Some(bp) = self.breakpoints.get_mut(&id) {
                bp.enabled = true;
            }
            self.arm(id, gateway)
        } else {
            self.disarm(id, gateway)?;
            if let Some(bp) = self.breakpoints.get_mut(&id) {
                bp.enabled = false;
            }
            Ok(false)
        }
    }

    pub fn remove(&mut self, id: BreakpointId, gateway: &RequestGateway) -> DebugResult<()> {
        self.disarm(id, gateway)?;
        self.breakpoints.remove(&id);
        Ok(())
    }

    /// Drop a breakpoint while no session is attached. There are no live
    /// requests to clear in that case.
    pub fn forget(&mut self, id: BreakpointId) {
        self.breakpoints.remove(&id);
    }

    /// Flip the enabled flag while no session is attached; arming happens
    /// when the next session starts.
    pub fn set_enabled_detached(&mut self, id: BreakpointId, enabled: bool) {
        if let Some(bp) = self.breakpoints.get_mut(&id) {
            bp.enabled = enabled;
        }
    }

    /// A class was loaded: re-arm every enabled class-scoped breakpoint
    /// targeting it (idempotent, so existing requests survive re-resolve).
    pub fn on_class_prepared(&mut self, class_name: &str, gateway: &RequestGateway) {
        let matching: Vec<BreakpointId> = self
            .breakpoints
            .values()
            .filter(|bp| {
                bp.enabled
                    && bp
                        .kind
                        .target_class()
                        .is_some_and(|target| class_matches(target, class_name))
            })
            .map(|bp| bp.id)
            .collect();

        for id in matching {
            if let Err(err) = self.arm(id, gateway) {
                tracing::warn!(breakpoint = %id, class = class_name, %err, "retro-arm failed");
            }
        }
    }

    /// Map a fired backend request to its owning breakpoint and mark that
    /// breakpoint proven-valid.
    pub fn note_hit(&mut self, request: RequestId) -> Option<BreakpointId> {
        let bp = self
            .breakpoints
            .values_mut()
            .find(|bp| bp.requests.contains(request))?;
        bp.valid = true;
        Some(bp.id)
    }

    pub fn attach_exception(&mut self, id: BreakpointId, exception: ObjectRef) {
        if let Some(bp) = self.breakpoints.get_mut(&id) {
            bp.valid = true;
            bp.last_exception = Some(exception);
        }
    }

    /// Resolve a stop location against enabled line/method breakpoints.
    pub fn match_location(
        &self,
        class_name: &str,
        line: u32,
        method_name: &str,
        skip_method_breakpoints: bool,
    ) -> Option<BreakpointId> {
        self.breakpoints
            .values()
            .filter(|bp| bp.enabled)
            .find(|bp| match &bp.kind {
                BreakpointKind::Line {
                    class,
                    line: target,
                } => class_matches(class, class_name) && *target == line,
                BreakpointKind::Method { class, method } => {
                    !skip_method_breakpoints
                        && class_matches(class, class_name)
                        && method.as_deref().map_or(true, |m| m == method_name)
                }
                _ => false,
            })
            .map(|bp| bp.id)
    }

    pub fn match_exception(&self, thrown_class: &str, caught: bool) -> Option<BreakpointId> {
        self.breakpoints
            .values()
            .filter(|bp| bp.enabled)
            .find(|bp| match &bp.kind {
                BreakpointKind::Exception {
                    class,
                    caught: on_caught,
                    uncaught: on_uncaught,
                } => class == thrown_class && if caught { *on_caught } else { *on_uncaught },
                _ => false,
            })
            .map(|bp| bp.id)
    }

    pub fn match_class_event(&self, class_name: &str, unload: bool) -> Option<BreakpointId> {
        self.breakpoints
            .values()
            .filter(|bp| bp.enabled)
            .find(|bp| match &bp.kind {
                BreakpointKind::Class {
                    pattern,
                    exclude,
                    on_prepare,
                    on_unload,
                } => {
                    let wanted = if unload { *on_unload } else { *on_prepare };
                    wanted
                        && wild_match(pattern, class_name)
                        && !exclude
                            .as_deref()
                            .is_some_and(|ex| wild_match(ex, class_name))
                }
                _ => false,
            })
            .map(|bp| bp.id)
    }

    pub fn match_thread_event(&self, death: bool) -> Option<BreakpointId> {
        self.breakpoints
            .values()
            .filter(|bp| bp.enabled)
            .find(|bp| match bp.kind {
                BreakpointKind::Thread { on_start, on_death } => {
                    if death {
                        on_death
                    } else {
                        on_start
                    }
                }
                _ => false,
            })
            .map(|bp| bp.id)
    }

    /// Terminal teardown: forget all live requests without backend calls.
    pub fn discard_requests(&mut self) {
        for bp in self.breakpoints.values_mut() {
            bp.requests.take_all();
            bp.prepare_watch = None;
            bp.valid = false;
        }
    }
}

impl Default for BreakpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve one breakpoint kind against the backend and install requests on
/// every matching loaded class. Runs as a single gateway job.
fn install_requests(
    backend: &mut dyn DebugBackend,
    kind: &BreakpointKind,
) -> Result<InstallOutcome, BackendError> {
    let mut requests = Vec::new();
    let mut prepare_watch = None;

    match kind {
        BreakpointKind::Line { class, line } => {
            for info in backend.classes_by_name(class)? {
                if backend.line_is_executable(info.id, *line)? {
                    requests.push(backend.install_request(RequestKind::Line {
                        class: info.id,
                        line: *line,
                    })?);
                }
            }
            prepare_watch = Some(install_prepare_watch(backend, class)?);
        }
        BreakpointKind::Method { class, method } => {
            for info in backend.classes_by_name(class)? {
                for m in backend.methods(info.id)? {
                    if m.synthetic {
                        continue;
                    }
                    if method.as_deref().map_or(true, |name| name == m.name) {
                        requests.push(backend.install_request(RequestKind::Method {
                            class: info.id,
                            method: m.id,
                        })?);
                    }
                }
            }
            prepare_watch = Some(install_prepare_watch(backend, class)?);
        }
        BreakpointKind::Exception {
            class,
            caught,
            uncaught,
        } => {
            for info in backend.classes_by_name(class)? {
                requests.push(backend.install_request(RequestKind::Exception {
                    class: Some(info.id),
                    caught: *caught,
                    uncaught: *uncaught,
                })?);
            }
            prepare_watch = Some(install_prepare_watch(backend, class)?);
        }
        BreakpointKind::Class {
            pattern,
            on_prepare,
            on_unload,
            ..
        } => {
            if *on_prepare {
                requests.push(backend.install_request(RequestKind::ClassPrepare {
                    pattern: pattern.clone(),
                })?);
            }
            if *on_unload {
                requests.push(backend.install_request(RequestKind::ClassUnload {
                    pattern: pattern.clone(),
                })?);
            }
        }
        BreakpointKind::Thread { on_start, on_death } => {
            if *on_start {
                requests.push(backend.install_request(RequestKind::ThreadStart)?);
            }
            if *on_death {
                requests.push(backend.install_request(RequestKind::ThreadDeath)?);
            }
        }
        BreakpointKind::Variable {
            class,
            field,
            on_access,
            on_modify,
        } => {
            for info in backend.classes_by_name(class)? {
                if *on_access {
                    requests.push(backend.install_request(RequestKind::VariableAccess {
                        class: info.id,
                        field: field.clone(),
                    })?);
                }
                if *on_modify {
                    requests.push(backend.install_request(RequestKind::VariableModify {
                        class: info.id,
                        field: field.clone(),
                    })?);
                }
            }
            prepare_watch = Some(install_prepare_watch(backend, class)?);
        }
    }

    Ok(InstallOutcome {
        requests,
        prepare_watch,
    })
}

fn install_prepare_watch(
    backend: &mut dyn DebugBackend,
    class: &str,
) -> Result<RequestId, BackendError> {
    backend.install_request(RequestKind::ClassPrepare {
        pattern: format!("{class}*"),
    })
}

/// `target` matches itself and its nested/anonymous classes
/// (`Target$Inner`, `Target$1`), but not mere name prefixes.
fn class_matches(target: &str, class_name: &str) -> bool {
    class_name == target
        || class_name
            .strip_prefix(target)
            .is_some_and(|rest| rest.starts_with('$'))
}

fn wild_match(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}
