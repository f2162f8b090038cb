//! End-to-end session scenarios against the mock backend: breakpoint
//! hits while running free, stepping across breakpoints and undebuggable
//! frames, exception routing, and session teardown.

use vigil_backend::{
    BackendEvent, ClassId, Location, MethodId, MockBackend, MockVm, ObjectRef, RequestKind,
    StepKind, ThreadId,
};
use vigil_debugger::{
    BreakpointKind, DebugError, DebuggerConfig, Session, SessionState,
};

struct Fixture {
    session: Session,
    vm: MockVm,
    thread: ThreadId,
    class: ClassId,
    run: MethodId,
}

/// A session attached to a VM with one loaded class `App` (executable
/// lines 10..=14, method `run`) and one thread stopped nowhere yet.
fn start_session(stop_on_main: bool) -> Fixture {
    let (backend, vm) = MockBackend::new();
    let class = vm.define_class("App", &[10, 11, 12, 13, 14], true);
    let run = vm.add_method(class, "run", false);
    let group = vm.add_group(None, "main");
    let thread = vm.add_thread(group, "worker");

    let mut session = Session::new(DebuggerConfig {
        stop_on_main,
        ..DebuggerConfig::default()
    });
    session
        .start(Box::new(backend), "App", &[], None, || {})
        .expect("start");

    Fixture {
        session,
        vm,
        thread,
        class,
        run,
    }
}

fn at(class: ClassId, method: MethodId, line: u32) -> Location {
    Location {
        class,
        method,
        line,
    }
}

/// Install a line breakpoint and return the live request id the mock VM
/// assigned to it.
fn line_breakpoint(fx: &mut Fixture, line: u32) -> u32 {
    fx.session
        .add_breakpoint(BreakpointKind::Line {
            class: "App".to_string(),
            line,
        })
        .expect("add breakpoint");
    fx.vm
        .installed_requests()
        .into_iter()
        .find_map(|(id, kind)| match kind {
            RequestKind::Line { line: l, .. } if l == line => Some(id),
            _ => None,
        })
        .expect("line request installed")
}

#[test]
fn breakpoint_hit_while_running_stops_and_selects_thread() {
    let mut fx = start_session(false);
    let request = line_breakpoint(&mut fx, 12);
    fx.vm.set_stack_depth(fx.thread, 2);

    fx.vm.push_event(BackendEvent::BreakpointHit {
        request,
        thread: fx.thread,
        location: at(fx.class, fx.run, 12),
    });
    fx.session.pump_events().expect("pump");

    assert_eq!(fx.session.state(), SessionState::Stopped);
    assert_eq!(fx.session.current_thread(), Some(fx.thread));
    assert!(fx.vm.suspend_all_calls() >= 1);
    let message = fx.session.stop_message().expect("message");
    assert!(message.contains("Breakpoint hit at App.run:12"), "{message}");
    assert!(fx
        .session
        .thread_tree()
        .find_thread(fx.thread)
        .expect("thread in tree")
        .is_current);
}

#[test]
fn stray_event_without_breakpoint_resumes_silently() {
    let mut fx = start_session(false);
    fx.vm.set_stack_depth(fx.thread, 2);
    let resumes_before = fx.vm.resume_all_calls();

    // A request that belongs to no registered breakpoint (left over from a
    // deleted one) fires at an arbitrary line.
    fx.vm.push_event(BackendEvent::BreakpointHit {
        request: 9_999,
        thread: fx.thread,
        location: at(fx.class, fx.run, 13),
    });
    fx.session.pump_events().expect("pump");

    assert_eq!(fx.session.state(), SessionState::Running);
    assert_eq!(fx.session.current_thread(), None);
    assert_eq!(fx.vm.resume_all_calls(), resumes_before + 1);
}

#[test]
fn trace_over_completes_at_the_same_depth() {
    let mut fx = start_session(false);
    let request = line_breakpoint(&mut fx, 10);
    fx.vm.set_stack_depth(fx.thread, 2);
    fx.vm.push_event(BackendEvent::BreakpointHit {
        request,
        thread: fx.thread,
        location: at(fx.class, fx.run, 10),
    });
    fx.session.pump_events().expect("pump");
    assert_eq!(fx.session.state(), SessionState::Stopped);

    fx.session.trace_over().expect("trace over");
    assert_eq!(fx.session.state(), SessionState::Running);
    assert_eq!(fx.vm.step_calls(), vec![(fx.thread, StepKind::Over)]);

    // The step lands on the next line, still at depth 2.
    fx.vm.push_event(BackendEvent::StepCompleted {
        thread: fx.thread,
        location: at(fx.class, fx.run, 11),
    });
    fx.session.pump_events().expect("pump");

    assert_eq!(fx.session.state(), SessionState::Stopped);
    let message = fx.session.stop_message().expect("message");
    assert!(message.contains("Step completed at App.run:11"), "{message}");
}

#[test]
fn breakpoint_interrupts_a_step_in_flight() {
    let mut fx = start_session(false);
    let first = line_breakpoint(&mut fx, 10);
    line_breakpoint(&mut fx, 11);
    fx.vm.set_stack_depth(fx.thread, 2);
    fx.vm.push_event(BackendEvent::BreakpointHit {
        request: first,
        thread: fx.thread,
        location: at(fx.class, fx.run, 10),
    });
    fx.session.pump_events().expect("pump");

    fx.session.trace_over().expect("trace over");
    fx.vm.push_event(BackendEvent::StepCompleted {
        thread: fx.thread,
        location: at(fx.class, fx.run, 11),
    });
    fx.session.pump_events().expect("pump");

    // Line 11 carries its own breakpoint: the stop is attributed to it,
    // not reported as a completed step.
    assert_eq!(fx.session.state(), SessionState::Stopped);
    let message = fx.session.stop_message().expect("message");
    assert!(message.contains("Breakpoint hit at App.run:11"), "{message}");
}

#[test]
fn stepping_into_sourceless_code_keeps_stepping() {
    let mut fx = start_session(false);
    let request = line_breakpoint(&mut fx, 10);
    let lib = fx.vm.define_class("LibStub", &[], false);
    let invoke = fx.vm.add_method(lib, "invoke", false);

    fx.vm.set_stack_depth(fx.thread, 2);
    fx.vm.push_event(BackendEvent::BreakpointHit {
        request,
        thread: fx.thread,
        location: at(fx.class, fx.run, 10),
    });
    fx.session.pump_events().expect("pump");

    // Step out lands one frame up but inside a class with no source: the
    // session silently steps out again instead of surfacing the frame.
    fx.session.step_out().expect("step out");
    fx.vm.set_stack_depth(fx.thread, 1);
    fx.vm.push_event(BackendEvent::StepCompleted {
        thread: fx.thread,
        location: at(lib, invoke, 0),
    });
    fx.session.pump_events().expect("pump");

    assert_eq!(fx.session.state(), SessionState::Running);
    assert_eq!(
        fx.vm.step_calls(),
        vec![(fx.thread, StepKind::Out), (fx.thread, StepKind::Out)]
    );
}

#[test]
fn step_onto_unpresentable_line_reissues_a_line_step() {
    let mut fx = start_session(false);
    let request = line_breakpoint(&mut fx, 10);
    fx.vm.set_stack_depth(fx.thread, 2);
    fx.vm.push_event(BackendEvent::BreakpointHit {
        request,
        thread: fx.thread,
        location: at(fx.class, fx.run, 10),
    });
    fx.session.pump_events().expect("pump");

    fx.session.trace_into().expect("trace into");
    // Line 99 is not in the class's executable-line table.
    fx.vm.push_event(BackendEvent::StepCompleted {
        thread: fx.thread,
        location: at(fx.class, fx.run, 99),
    });
    fx.session.pump_events().expect("pump");

    assert_eq!(fx.session.state(), SessionState::Running);
    assert_eq!(
        fx.vm.step_calls(),
        vec![(fx.thread, StepKind::Into), (fx.thread, StepKind::Over)]
    );
}

#[test]
fn exception_routes_to_its_breakpoint_with_the_thrown_object() {
    let mut fx = start_session(false);
    let bp = fx
        .session
        .add_breakpoint(BreakpointKind::Exception {
            class: "java.io.IOException".to_string(),
            caught: true,
            uncaught: true,
        })
        .expect("add breakpoint");
    fx.vm.set_stack_depth(fx.thread, 3);

    let thrown = ObjectRef {
        id: 700,
        runtime_type: "java.io.IOException".to_string(),
    };
    fx.vm.push_event(BackendEvent::ExceptionThrown {
        thread: fx.thread,
        location: at(fx.class, fx.run, 13),
        exception: thrown.clone(),
        caught: true,
    });
    fx.session.pump_events().expect("pump");

    assert_eq!(fx.session.state(), SessionState::Stopped);
    assert_eq!(
        fx.session.breakpoints().get(bp).unwrap().last_exception(),
        Some(&thrown)
    );
    let message = fx.session.stop_message().expect("message");
    assert!(message.contains("java.io.IOException"), "{message}");
}

#[test]
fn variable_breakpoint_hit_stops_the_session() {
    let mut fx = start_session(false);
    let bp = fx
        .session
        .add_breakpoint(BreakpointKind::Variable {
            class: "App".to_string(),
            field: "count".to_string(),
            on_access: false,
            on_modify: true,
        })
        .expect("add breakpoint");
    let request = fx.session.breakpoints().get(bp).expect("armed").requests().ids()[0];
    fx.vm.set_stack_depth(fx.thread, 2);

    // The write to `count` happens on a line carrying no line breakpoint;
    // only the modify watch identifies the stop.
    fx.vm.push_event(BackendEvent::BreakpointHit {
        request,
        thread: fx.thread,
        location: at(fx.class, fx.run, 13),
    });
    fx.session.pump_events().expect("pump");

    assert_eq!(fx.session.state(), SessionState::Stopped);
    assert_eq!(fx.session.current_thread(), Some(fx.thread));
    let message = fx.session.stop_message().expect("message");
    assert!(message.contains("Breakpoint hit at App.run:13"), "{message}");
}

#[test]
fn breakpoint_on_class_loaded_later_arms_and_fires() {
    let mut fx = start_session(false);
    fx.session
        .add_breakpoint(BreakpointKind::Line {
            class: "Lazy".to_string(),
            line: 5,
        })
        .expect("add breakpoint");

    // Only the deferred class-prepare watch exists so far.
    assert!(!fx
        .vm
        .installed_requests()
        .iter()
        .any(|(_, k)| matches!(k, RequestKind::Line { line: 5, .. })));

    // The class loads; the mock emits ClassPrepared because of the watch,
    // and handling it retro-arms the breakpoint.
    fx.vm.prepare_class("Lazy", &[5], true);
    fx.session.pump_events().expect("pump");

    assert!(fx
        .vm
        .installed_requests()
        .iter()
        .any(|(_, k)| matches!(k, RequestKind::Line { line: 5, .. })));
    assert_eq!(fx.session.state(), SessionState::Running);
}

#[test]
fn stop_on_main_halts_at_the_entry_and_clears_its_traps() {
    let (backend, vm) = MockBackend::new();
    let class = vm.define_class("Main", &[1, 2], true);
    let main = vm.add_method(class, "main", false);
    let group = vm.add_group(None, "main");
    let thread = vm.add_thread(group, "main");
    vm.set_stack_depth(thread, 1);

    let mut session = Session::new(DebuggerConfig::default());
    session
        .start(Box::new(backend), "Main", &[], None, || {})
        .expect("start");

    let entry_request = vm
        .installed_requests()
        .into_iter()
        .find_map(|(id, kind)| match kind {
            RequestKind::Method { .. } => Some(id),
            _ => None,
        })
        .expect("entry trap installed");

    vm.push_event(BackendEvent::BreakpointHit {
        request: entry_request,
        thread,
        location: at(class, main, 1),
    });
    session.pump_events().expect("pump");

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.current_thread(), Some(thread));
    // The entry trap is one-shot: cleared once the session stopped.
    assert!(!vm
        .installed_requests()
        .iter()
        .any(|(_, k)| matches!(k, RequestKind::Method { .. })));
}

#[test]
fn queued_thread_starts_each_get_one_wrapper_in_the_right_group() {
    let mut fx = start_session(false);
    fx.session.refresh_threads().expect("refresh");

    let pool = fx.vm.add_group(None, "pool");
    let a = fx.vm.add_thread(pool, "pool-1");
    let b = fx.vm.add_thread(pool, "pool-2");
    fx.vm.push_event(BackendEvent::ThreadStarted { thread: a });
    fx.vm.push_event(BackendEvent::ThreadStarted { thread: b });
    fx.session.pump_events().expect("pump");
    fx.session.refresh_threads().expect("refresh");

    let tree = fx.session.thread_tree();
    let all: Vec<ThreadId> = tree.threads().iter().map(|t| t.handle).collect();
    assert_eq!(all.iter().filter(|t| **t == a).count(), 1);
    assert_eq!(all.iter().filter(|t| **t == b).count(), 1);

    // Both wrappers sit under the pool group, not under the root.
    assert!(tree.root().threads.is_empty());
    let pool_node = tree
        .root()
        .groups
        .iter()
        .find(|g| g.name == "pool")
        .expect("pool group");
    assert_eq!(pool_node.threads.len(), 2);
}

#[test]
fn thread_death_breakpoint_stops_the_session() {
    let mut fx = start_session(false);
    fx.session
        .add_breakpoint(BreakpointKind::Thread {
            on_start: false,
            on_death: true,
        })
        .expect("add breakpoint");
    fx.session.refresh_threads().expect("refresh");
    assert!(fx.session.thread_tree().find_thread(fx.thread).is_some());

    fx.vm.remove_thread(fx.thread);
    fx.vm.push_event(BackendEvent::ThreadDied { thread: fx.thread });
    fx.session.pump_events().expect("pump");

    assert_eq!(fx.session.state(), SessionState::Stopped);
    assert!(fx.session.thread_tree().find_thread(fx.thread).is_none());
    let message = fx.session.stop_message().expect("message");
    assert!(message.contains("Thread died"), "{message}");
}

#[test]
fn process_exit_tears_the_session_down() {
    let mut fx = start_session(false);
    line_breakpoint(&mut fx, 10);

    fx.vm.push_event(BackendEvent::ProcessExited { code: 3 });
    fx.session.pump_events().expect("pump");

    assert_eq!(fx.session.state(), SessionState::NotRunning);
    let message = fx.session.stop_message().expect("message");
    assert!(message.contains("exited with code 3"), "{message}");
    // Breakpoint configuration survives, its runtime binding does not.
    let bp = fx.session.breakpoints().iter().next().expect("breakpoint");
    assert!(!bp.is_valid());
    assert!(bp.requests().is_empty());
}

#[test]
fn disconnect_mid_pump_is_terminal() {
    let mut fx = start_session(false);
    fx.vm.set_disconnected(true);

    let err = fx.session.pump_events().expect_err("pump should fail");
    assert!(matches!(err, DebugError::ProcessDisconnected));
    assert_eq!(fx.session.state(), SessionState::NotRunning);
}

#[test]
fn gateway_deadlock_fires_the_kill_callback_and_ends_the_session() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    let (backend, vm) = MockBackend::new();
    vm.define_class("App", &[10], true);
    let group = vm.add_group(None, "main");
    vm.add_thread(group, "worker");

    let kills = Arc::new(AtomicUsize::new(0));
    let counter = kills.clone();
    let mut session = Session::new(DebuggerConfig {
        deadlock_timeout_ms: 50,
        stop_on_main: false,
        ..DebuggerConfig::default()
    });
    session
        .start(Box::new(backend), "App", &[], None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("start");

    vm.stall_next_query(Duration::from_secs(30));
    let err = session.refresh_threads().expect_err("hung call");
    assert!(matches!(err, DebugError::Deadlock));
    assert_eq!(session.state(), SessionState::NotRunning);
    assert_eq!(kills.load(Ordering::SeqCst), 1);

    // The torn-down session refuses further backend work and does not
    // fire the callback again.
    assert!(matches!(
        session.refresh_threads(),
        Err(DebugError::BackendUnavailable)
    ));
    assert_eq!(kills.load(Ordering::SeqCst), 1);
}

#[test]
fn watches_reevaluate_at_each_stop() {
    use vigil_backend::{LocalVariable, Value};

    let mut fx = start_session(false);
    let request = line_breakpoint(&mut fx, 10);
    fx.vm.set_stack_depth(fx.thread, 1);
    fx.vm.set_locals(
        fx.thread,
        0,
        vec![LocalVariable {
            name: "total".to_string(),
            type_name: "int".to_string(),
            value: Value::Int(5),
        }],
    );
    let watch = fx.session.add_watch("total", false).expect("add watch");

    fx.vm.push_event(BackendEvent::BreakpointHit {
        request,
        thread: fx.thread,
        location: at(fx.class, fx.run, 10),
    });
    fx.session.pump_events().expect("pump");

    let value = fx
        .session
        .watch(watch)
        .and_then(|w| w.value())
        .expect("watch resolved");
    assert_eq!(value.rendered, "5");

    // Edit through the watch, then step and stop again: the new value is
    // what the debuggee reports.
    fx.session.set_watch_text(watch, "9").expect("set");
    fx.session.trace_over().expect("trace over");
    fx.vm.push_event(BackendEvent::StepCompleted {
        thread: fx.thread,
        location: at(fx.class, fx.run, 11),
    });
    fx.session.pump_events().expect("pump");

    let value = fx
        .session
        .watch(watch)
        .and_then(|w| w.value())
        .expect("watch resolved");
    assert_eq!(value.rendered, "9");
}
