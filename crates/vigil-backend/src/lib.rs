//! Remote debugging backend abstraction for Vigil.
//!
//! The debugger core (`vigil-debugger`) is written once against the
//! [`DebugBackend`] trait; concrete protocol adapters (the legacy wire
//! protocol, JDWP/JDI) live out of tree and only need to satisfy this
//! surface: class lookup, event-request installation, thread control,
//! stack/variable introspection, and an event-delivery channel.
//!
//! Backends are not safe for concurrent calls from multiple threads, which
//! is why every method takes `&mut self` and the core funnels all access
//! through a single worker (see `vigil-debugger`'s request gateway).

mod mock;

use thiserror::Error;

pub use mock::{MockBackend, MockVm};

pub type ThreadId = u64;
pub type GroupId = u64;
pub type ClassId = u64;
pub type MethodId = u64;
pub type ObjectId = u64;
pub type RequestId = u32;

/// A value observed in the debuggee: a primitive, an object reference, or
/// the absence of either.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Void,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Object(ObjectRef),
}

impl Value {
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::Object(obj) => Some(obj.id),
            _ => None,
        }
    }

    /// Primitive type name used when rendering and when parsing user edits.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Void => "void",
            Self::Boolean(_) => "boolean",
            Self::Byte(_) => "byte",
            Self::Short(_) => "short",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Char(_) => "char",
            Self::Object(_) => "object",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub runtime_type: String,
}

/// A code location delivered with an event. Names are resolved lazily via
/// [`DebugBackend::stop_context`] so that event handling costs a single
/// backend round-trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location {
    pub class: ClassId,
    pub method: MethodId,
    pub line: u32,
}

/// Everything the classifier needs about a stop location, fetched in one
/// batched call rather than one call per attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct StopContext {
    pub class_name: String,
    pub method_name: String,
    pub line: u32,
    pub thread_name: String,
    pub stack_depth: usize,
    /// The declaring class has debuggable source at all.
    pub has_source: bool,
    /// The resolved line can be presented in an editor.
    pub line_presentable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: String,
    pub has_source: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
    pub id: MethodId,
    pub name: String,
    /// Compiler-generated bridge/accessor methods; breakpoint fan-out
    /// skips these.
    pub synthetic: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Suspended,
    AtBreakpoint,
    /// Terminated but still reported by the backend scan.
    Zombie,
    Unknown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupInfo {
    pub id: GroupId,
    pub name: String,
    pub child_groups: Vec<GroupId>,
    pub child_threads: Vec<ThreadId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FrameInfo {
    pub class_name: String,
    pub method_name: String,
    pub line: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocalVariable {
    pub name: String,
    pub type_name: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldValue {
    pub name: String,
    pub type_name: String,
    pub value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Into,
    Over,
    Out,
}

/// Kinds of live watch/trap requests a debugger can install.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Line {
        class: ClassId,
        line: u32,
    },
    Method {
        class: ClassId,
        method: MethodId,
    },
    Exception {
        /// `None` traps every thrown class.
        class: Option<ClassId>,
        caught: bool,
        uncaught: bool,
    },
    ClassPrepare {
        pattern: String,
    },
    ClassUnload {
        pattern: String,
    },
    ThreadStart,
    ThreadDeath,
    VariableAccess {
        class: ClassId,
        field: String,
    },
    VariableModify {
        class: ClassId,
        field: String,
    },
}

/// Asynchronous events delivered by the debuggee VM, in delivery order.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendEvent {
    BreakpointHit {
        request: RequestId,
        thread: ThreadId,
        location: Location,
    },
    StepCompleted {
        thread: ThreadId,
        location: Location,
    },
    ExceptionThrown {
        thread: ThreadId,
        location: Location,
        exception: ObjectRef,
        caught: bool,
    },
    ClassPrepared {
        class: ClassId,
        name: String,
    },
    ClassUnloaded {
        name: String,
    },
    ThreadStarted {
        thread: ThreadId,
    },
    ThreadDied {
        thread: ThreadId,
    },
    ProcessExited {
        code: i32,
    },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend is not connected")]
    NotConnected,
    #[error("unknown class `{0}`")]
    UnknownClass(String),
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),
    #[error("invalid frame {frame} for thread {thread}")]
    InvalidFrame { thread: ThreadId, frame: usize },
    #[error("no variable `{0}` in scope")]
    UnknownVariable(String),
    #[error("invalid object id {0}")]
    InvalidObjectId(ObjectId),
    #[error("debuggee process disconnected")]
    Disconnected,
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Terminal errors: the connection is gone and no retry is meaningful.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Disconnected)
    }
}

/// Synchronous, mock-friendly interface to a remote debugging backend.
///
/// All methods are blocking and must be called from a single thread at a
/// time; the core serializes access through its request gateway.
pub trait DebugBackend: Send {
    /// Launch or attach to the debuggee.
    fn launch(&mut self, main_class: &str, args: &[String]) -> Result<(), BackendError>;
    /// Drop the connection. Safe to call more than once.
    fn disconnect(&mut self);

    /// All loaded classes matching `name` exactly or as an enclosing class
    /// (`name$Inner`, anonymous classes included).
    fn classes_by_name(&mut self, name: &str) -> Result<Vec<ClassInfo>, BackendError>;
    fn methods(&mut self, class: ClassId) -> Result<Vec<MethodInfo>, BackendError>;
    /// Whether `line` maps to executable code in `class`.
    fn line_is_executable(&mut self, class: ClassId, line: u32) -> Result<bool, BackendError>;

    fn install_request(&mut self, kind: RequestKind) -> Result<RequestId, BackendError>;
    fn clear_request(&mut self, request: RequestId) -> Result<(), BackendError>;

    fn top_level_groups(&mut self) -> Result<Vec<GroupId>, BackendError>;
    fn group_info(&mut self, group: GroupId) -> Result<GroupInfo, BackendError>;
    fn thread_info(&mut self, thread: ThreadId) -> Result<ThreadInfo, BackendError>;

    fn suspend_all(&mut self) -> Result<(), BackendError>;
    fn resume_all(&mut self) -> Result<(), BackendError>;
    fn suspend_thread(&mut self, thread: ThreadId) -> Result<(), BackendError>;
    fn resume_thread(&mut self, thread: ThreadId) -> Result<(), BackendError>;
    fn step(&mut self, thread: ThreadId, kind: StepKind) -> Result<(), BackendError>;

    fn frames(&mut self, thread: ThreadId) -> Result<Vec<FrameInfo>, BackendError>;
    fn frame_locals(
        &mut self,
        thread: ThreadId,
        frame: usize,
    ) -> Result<Vec<LocalVariable>, BackendError>;
    fn set_local(
        &mut self,
        thread: ThreadId,
        frame: usize,
        name: &str,
        value: Value,
    ) -> Result<(), BackendError>;
    fn object_fields(&mut self, object: ObjectId) -> Result<Vec<FieldValue>, BackendError>;
    fn set_field(
        &mut self,
        object: ObjectId,
        field: &str,
        value: Value,
    ) -> Result<(), BackendError>;

    /// Resolve everything the classifier needs about a stop in one
    /// round-trip: class/method/thread names, line, and stack depth.
    fn stop_context(
        &mut self,
        thread: ThreadId,
        location: &Location,
    ) -> Result<StopContext, BackendError>;

    /// Pull the next pending VM event, if any. Events are delivered in
    /// order; `None` means the queue is currently empty.
    fn poll_event(&mut self) -> Result<Option<BackendEvent>, BackendError>;
}
