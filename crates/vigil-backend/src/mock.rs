use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{
    BackendError, BackendEvent, ClassId, ClassInfo, DebugBackend, FieldValue, FrameInfo, GroupId,
    GroupInfo, LocalVariable, Location, MethodId, MethodInfo, ObjectId, RequestId, RequestKind,
    StepKind, StopContext, ThreadId, ThreadInfo, ThreadStatus, Value,
};

#[derive(Clone, Debug)]
struct MockClass {
    name: String,
    has_source: bool,
    executable_lines: Vec<u32>,
    methods: Vec<MethodInfo>,
}

#[derive(Clone, Debug)]
struct MockThread {
    name: String,
    status: ThreadStatus,
    group: GroupId,
    frames: Vec<FrameInfo>,
    locals: HashMap<usize, Vec<LocalVariable>>,
    depth_override: Option<usize>,
}

#[derive(Clone, Debug)]
struct MockGroup {
    name: String,
    parent: Option<GroupId>,
}

#[derive(Default)]
struct VmState {
    launched: Option<(String, Vec<String>)>,
    disconnected: bool,

    next_request: RequestId,
    requests: BTreeMap<RequestId, RequestKind>,

    next_class: ClassId,
    classes: BTreeMap<ClassId, MockClass>,
    next_method: MethodId,

    next_group: GroupId,
    groups: BTreeMap<GroupId, MockGroup>,
    next_thread: ThreadId,
    threads: BTreeMap<ThreadId, MockThread>,

    objects: HashMap<ObjectId, Vec<FieldValue>>,

    events: VecDeque<BackendEvent>,

    stall: Option<Duration>,

    resume_all_calls: usize,
    suspend_all_calls: usize,
    resumed_threads: Vec<ThreadId>,
    suspended_threads: Vec<ThreadId>,
    step_calls: Vec<(ThreadId, StepKind)>,
}

impl VmState {
    fn check_connection(&self) -> Result<(), BackendError> {
        if self.disconnected {
            return Err(BackendError::Disconnected);
        }
        Ok(())
    }

    fn thread(&self, thread: ThreadId) -> Result<&MockThread, BackendError> {
        self.threads
            .get(&thread)
            .ok_or(BackendError::UnknownThread(thread))
    }

    fn thread_mut(&mut self, thread: ThreadId) -> Result<&mut MockThread, BackendError> {
        self.threads
            .get_mut(&thread)
            .ok_or(BackendError::UnknownThread(thread))
    }

    fn depth(&self, thread: &MockThread) -> usize {
        thread.depth_override.unwrap_or(thread.frames.len())
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

/// Deterministic, in-memory debugging backend test double.
///
/// Created together with a [`MockVm`] scripting handle; the backend side is
/// handed to the debugger (which moves it onto the gateway worker) while
/// the test keeps the handle to script threads, classes and events and to
/// inspect installed requests.
pub struct MockBackend {
    state: Arc<Mutex<VmState>>,
}

/// Test-side handle over the shared mock VM state.
#[derive(Clone)]
pub struct MockVm {
    state: Arc<Mutex<VmState>>,
}

impl MockBackend {
    pub fn new() -> (MockBackend, MockVm) {
        let state = Arc::new(Mutex::new(VmState::default()));
        (
            MockBackend {
                state: state.clone(),
            },
            MockVm { state },
        )
    }
}

impl MockVm {
    pub fn add_group(&self, parent: Option<GroupId>, name: &str) -> GroupId {
        let mut vm = self.state.lock();
        vm.next_group += 1;
        let id = vm.next_group;
        vm.groups.insert(
            id,
            MockGroup {
                name: name.to_string(),
                parent,
            },
        );
        id
    }

    pub fn add_thread(&self, group: GroupId, name: &str) -> ThreadId {
        let mut vm = self.state.lock();
        vm.next_thread += 1;
        let id = vm.next_thread;
        vm.threads.insert(
            id,
            MockThread {
                name: name.to_string(),
                status: ThreadStatus::Running,
                group,
                frames: Vec::new(),
                locals: HashMap::new(),
                depth_override: None,
            },
        );
        id
    }

    pub fn set_thread_status(&self, thread: ThreadId, status: ThreadStatus) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.status = status;
        }
    }

    pub fn remove_thread(&self, thread: ThreadId) {
        self.state.lock().threads.remove(&thread);
    }

    pub fn remove_group(&self, group: GroupId) {
        let mut vm = self.state.lock();
        vm.groups.remove(&group);
        vm.threads.retain(|_, t| t.group != group);
    }

    /// Register a class as already loaded, without emitting an event.
    pub fn define_class(&self, name: &str, executable_lines: &[u32], has_source: bool) -> ClassId {
        self.insert_class(name, executable_lines, has_source)
    }

    /// Load a class mid-session: registers it and, if a matching
    /// class-prepare watch is installed, emits `ClassPrepared`.
    pub fn prepare_class(&self, name: &str, executable_lines: &[u32], has_source: bool) -> ClassId {
        let class = self.insert_class(name, executable_lines, has_source);
        let mut vm = self.state.lock();
        let watched = vm.requests.values().any(|kind| {
            matches!(kind, RequestKind::ClassPrepare { pattern } if pattern_matches(pattern, name))
        });
        if watched {
            vm.events.push_back(BackendEvent::ClassPrepared {
                class,
                name: name.to_string(),
            });
        }
        class
    }

    fn insert_class(&self, name: &str, executable_lines: &[u32], has_source: bool) -> ClassId {
        let mut vm = self.state.lock();
        vm.next_class += 1;
        let id = vm.next_class;
        vm.classes.insert(
            id,
            MockClass {
                name: name.to_string(),
                has_source,
                executable_lines: executable_lines.to_vec(),
                methods: Vec::new(),
            },
        );
        id
    }

    pub fn add_method(&self, class: ClassId, name: &str, synthetic: bool) -> MethodId {
        let mut vm = self.state.lock();
        vm.next_method += 1;
        let id = vm.next_method;
        if let Some(c) = vm.classes.get_mut(&class) {
            c.methods.push(MethodInfo {
                id,
                name: name.to_string(),
                synthetic,
            });
        }
        id
    }

    pub fn set_frames(&self, thread: ThreadId, frames: Vec<FrameInfo>) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.frames = frames;
        }
    }

    pub fn set_stack_depth(&self, thread: ThreadId, depth: usize) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.depth_override = Some(depth);
        }
    }

    pub fn set_locals(&self, thread: ThreadId, frame: usize, locals: Vec<LocalVariable>) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.locals.insert(frame, locals);
        }
    }

    pub fn set_object_fields(&self, object: ObjectId, fields: Vec<FieldValue>) {
        self.state.lock().objects.insert(object, fields);
    }

    pub fn push_event(&self, event: BackendEvent) {
        self.state.lock().events.push_back(event);
    }

    /// Make the next thread-hierarchy query block for `pause`, to exercise
    /// the caller's deadlock timeout.
    pub fn stall_next_query(&self, pause: Duration) {
        self.state.lock().stall = Some(pause);
    }

    /// Simulate the debuggee going away: every subsequent backend call
    /// fails with [`BackendError::Disconnected`].
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().disconnected = disconnected;
    }

    pub fn installed_requests(&self) -> Vec<(RequestId, RequestKind)> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|(id, kind)| (*id, kind.clone()))
            .collect()
    }

    pub fn launched(&self) -> Option<(String, Vec<String>)> {
        self.state.lock().launched.clone()
    }

    pub fn resume_all_calls(&self) -> usize {
        self.state.lock().resume_all_calls
    }

    pub fn suspend_all_calls(&self) -> usize {
        self.state.lock().suspend_all_calls
    }

    pub fn resumed_threads(&self) -> Vec<ThreadId> {
        self.state.lock().resumed_threads.clone()
    }

    pub fn suspended_threads(&self) -> Vec<ThreadId> {
        self.state.lock().suspended_threads.clone()
    }

    pub fn step_calls(&self) -> Vec<(ThreadId, StepKind)> {
        self.state.lock().step_calls.clone()
    }
}

impl DebugBackend for MockBackend {
    fn launch(&mut self, main_class: &str, args: &[String]) -> Result<(), BackendError> {
        let mut vm = self.state.lock();
        vm.check_connection()?;
        vm.launched = Some((main_class.to_string(), args.to_vec()));
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state.lock().disconnected = true;
    }

    fn classes_by_name(&mut self, name: &str) -> Result<Vec<ClassInfo>, BackendError> {
        let vm = self.state.lock();
        vm.check_connection()?;
        let nested_prefix = format!("{name}$");
        Ok(vm
            .classes
            .iter()
            .filter(|(_, c)| c.name == name || c.name.starts_with(&nested_prefix))
            .map(|(id, c)| ClassInfo {
                id: *id,
                name: c.name.clone(),
                has_source: c.has_source,
            })
            .collect())
    }

    fn methods(&mut self, class: ClassId) -> Result<Vec<MethodInfo>, BackendError> {
        let vm = self.state.lock();
        vm.check_connection()?;
        vm.classes
            .get(&class)
            .map(|c| c.methods.clone())
            .ok_or_else(|| BackendError::UnknownClass(format!("#{class}")))
    }

    fn line_is_executable(&mut self, class: ClassId, line: u32) -> Result<bool, BackendError> {
        let vm = self.state.lock();
        vm.check_connection()?;
        vm.classes
            .get(&class)
            .map(|c| c.has_source && c.executable_lines.contains(&line))
            .ok_or_else(|| BackendError::UnknownClass(format!("#{class}")))
    }

    fn install_request(&mut self, kind: RequestKind) -> Result<RequestId, BackendError> {
        let mut vm = self.state.lock();
        vm.check_connection()?;
        vm.next_request += 1;
        let id = vm.next_request;
        tracing::trace!(request = id, ?kind, "mock backend: install request");
        vm.requests.insert(id, kind);
        Ok(id)
    }

    fn clear_request(&mut self, request: RequestId) -> Result<(), BackendError> {
        let mut vm = self.state.lock();
        vm.check_connection()?;
        vm.requests
            .remove(&request)
            .map(|_| ())
            .ok_or(BackendError::UnknownRequest(request))
    }

    fn top_level_groups(&mut self) -> Result<Vec<GroupId>, BackendError> {
        let stall = self.state.lock().stall.take();
        if let Some(pause) = stall {
            std::thread::sleep(pause);
        }
        let vm = self.state.lock();
        vm.check_connection()?;
        Ok(vm
            .groups
            .iter()
            .filter(|(_, g)| g.parent.is_none())
            .map(|(id, _)| *id)
            .collect())
    }

    fn group_info(&mut self, group: GroupId) -> Result<GroupInfo, BackendError> {
        let vm = self.state.lock();
        vm.check_connection()?;
        let info = vm
            .groups
            .get(&group)
            .ok_or_else(|| BackendError::Other(format!("unknown thread group {group}")))?;
        Ok(GroupInfo {
            id: group,
            name: info.name.clone(),
            child_groups: vm
                .groups
                .iter()
                .filter(|(_, g)| g.parent == Some(group))
                .map(|(id, _)| *id)
                .collect(),
            child_threads: vm
                .threads
                .iter()
                .filter(|(_, t)| t.group == group)
                .map(|(id, _)| *id)
                .collect(),
        })
    }

    fn thread_info(&mut self, thread: ThreadId) -> Result<ThreadInfo, BackendError> {
        let vm = self.state.lock();
        vm.check_connection()?;
        let t = vm.thread(thread)?;
        Ok(ThreadInfo {
            id: thread,
            name: t.name.clone(),
            status: t.status,
        })
    }

    fn suspend_all(&mut self) -> Result<(), BackendError> {
        let mut vm = self.state.lock();
        vm.check_connection()?;
        vm.suspend_all_calls += 1;
        Ok(())
    }

    fn resume_all(&mut self) -> Result<(), BackendError> {
        let mut vm = self.state.lock();
        vm.check_connection()?;
        vm.resume_all_calls += 1;
        Ok(())
    }

    fn suspend_thread(&mut self, thread: ThreadId) -> Result<(), BackendError> {
        let mut vm = self.state.lock();
        vm.check_connection()?;
        vm.thread(thread)?;
        vm.suspended_threads.push(thread);
        vm.thread_mut(thread)?.status = ThreadStatus::Suspended;
        Ok(())
    }

    fn resume_thread(&mut self, thread: ThreadId) -> Result<(), BackendError> {
        let mut vm = self.state.lock();
        vm.check_connection()?;
        vm.thread(thread)?;
        vm.resumed_threads.push(thread);
        vm.thread_mut(thread)?.status = ThreadStatus::Running;
        Ok(())
    }

    fn step(&mut self, thread: ThreadId, kind: StepKind) -> Result<(), BackendError> {
        let mut vm = self.state.lock();
        vm.check_connection()?;
        vm.thread(thread)?;
        vm.step_calls.push((thread, kind));
        Ok(())
    }

    fn frames(&mut self, thread: ThreadId) -> Result<Vec<FrameInfo>, BackendError> {
        let vm = self.state.lock();
        vm.check_connection()?;
        Ok(vm.thread(thread)?.frames.clone())
    }

    fn frame_locals(
        &mut self,
        thread: ThreadId,
        frame: usize,
    ) -> Result<Vec<LocalVariable>, BackendError> {
        let vm = self.state.lock();
        vm.check_connection()?;
        let t = vm.thread(thread)?;
        t.locals
            .get(&frame)
            .cloned()
            .ok_or(BackendError::InvalidFrame { thread, frame })
    }

    fn set_local(
        &mut self,
        thread: ThreadId,
        frame: usize,
        name: &str,
        value: Value,
    ) -> Result<(), BackendError> {
        let mut vm = self.state.lock();
        vm.check_connection()?;
        let t = vm.thread_mut(thread)?;
        let locals = t
            .locals
            .get_mut(&frame)
            .ok_or(BackendError::InvalidFrame { thread, frame })?;
        let slot = locals
            .iter_mut()
            .find(|l| l.name == name)
            .ok_or_else(|| BackendError::UnknownVariable(name.to_string()))?;
        slot.value = value;
        Ok(())
    }

    fn object_fields(&mut self, object: ObjectId) -> Result<Vec<FieldValue>, BackendError> {
        let vm = self.state.lock();
        vm.check_connection()?;
        vm.objects
            .get(&object)
            .cloned()
            .ok_or(BackendError::InvalidObjectId(object))
    }

    fn set_field(
        &mut self,
        object: ObjectId,
        field: &str,
        value: Value,
    ) -> Result<(), BackendError> {
        let mut vm = self.state.lock();
        vm.check_connection()?;
        let fields = vm
            .objects
            .get_mut(&object)
            .ok_or(BackendError::InvalidObjectId(object))?;
        let slot = fields
            .iter_mut()
            .find(|f| f.name == field)
            .ok_or_else(|| BackendError::UnknownVariable(field.to_string()))?;
        slot.value = value;
        Ok(())
    }

    fn stop_context(
        &mut self,
        thread: ThreadId,
        location: &Location,
    ) -> Result<StopContext, BackendError> {
        let vm = self.state.lock();
        vm.check_connection()?;
        let t = vm.thread(thread)?;
        let class = vm.classes.get(&location.class);
        let class_name = class
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "<unknown>".to_string());
        let method_name = class
            .and_then(|c| c.methods.iter().find(|m| m.id == location.method))
            .map(|m| m.name.clone())
            .unwrap_or_else(|| "<unknown>".to_string());
        let has_source = class.map(|c| c.has_source).unwrap_or(false);
        let line_presentable =
            has_source && class.is_some_and(|c| c.executable_lines.contains(&location.line));
        Ok(StopContext {
            class_name,
            method_name,
            line: location.line,
            thread_name: t.name.clone(),
            stack_depth: vm.depth(t),
            has_source,
            line_presentable,
        })
    }

    fn poll_event(&mut self) -> Result<Option<BackendEvent>, BackendError> {
        let mut vm = self.state.lock();
        vm.check_connection()?;
        Ok(vm.events.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_by_name_includes_nested_and_anonymous() {
        let (mut backend, vm) = MockBackend::new();
        vm.define_class("Foo", &[10], true);
        vm.define_class("Foo$Inner", &[12], true);
        vm.define_class("Foo$1", &[14], true);
        vm.define_class("FooBar", &[1], true);

        let names: Vec<_> = backend
            .classes_by_name("Foo")
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Foo", "Foo$Inner", "Foo$1"]);
    }

    #[test]
    fn prepare_class_emits_event_only_when_watched() {
        let (mut backend, vm) = MockBackend::new();
        vm.prepare_class("Silent", &[1], true);
        assert_eq!(backend.poll_event().unwrap(), None);

        backend
            .install_request(RequestKind::ClassPrepare {
                pattern: "Watched".to_string(),
            })
            .unwrap();
        vm.prepare_class("Watched", &[1], true);
        assert!(matches!(
            backend.poll_event().unwrap(),
            Some(BackendEvent::ClassPrepared { name, .. }) if name == "Watched"
        ));
    }

    #[test]
    fn disconnected_vm_fails_every_call() {
        let (mut backend, vm) = MockBackend::new();
        let g = vm.add_group(None, "main");
        let t = vm.add_thread(g, "main");
        vm.set_disconnected(true);

        assert!(matches!(
            backend.thread_info(t),
            Err(BackendError::Disconnected)
        ));
        assert!(matches!(
            backend.install_request(RequestKind::ThreadStart),
            Err(BackendError::Disconnected)
        ));
    }
}
