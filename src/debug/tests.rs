//! Event pump tests against the scripted mock target.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::core::debugger::{DebugError, Debugger, SessionConfig};
use crate::core::memory::MemoryExt;

use super::breakpoint::TRAP_OPCODE;
use super::mock::{wait_until, MockTarget};
use super::session::{DetachReason, EventHook};
use super::types::{
    ContinueStatus, DebugEvent, DebugEventKind, ExceptionCode, SessionNotice, SessionStatus,
};

const PID: u32 = 4242;
const CODE: u64 = 0x40_1000;

/// push rbp; mov rbp, rsp; nop; ret
const FUNCTION: &[u8] = &[0x55, 0x48, 0x89, 0xe5, 0x90, 0xc3];

fn setup() -> Debugger<MockTarget> {
    let target = MockTarget::new(PID);
    target.map(CODE, FUNCTION);
    target.add_thread(7);
    target.add_thread(8);
    Debugger::with_config(
        target,
        SessionConfig {
            event_timeout: Duration::from_millis(5),
            kill_on_exit: false,
        },
    )
}

fn counter() -> (Arc<AtomicUsize>, impl FnMut(&mut super::breakpoint::BreakpointHit) + Send) {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    (hits, move |_: &mut super::breakpoint::BreakpointHit| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
}

fn wait_continued(debugger: &Debugger<MockTarget>, count: usize) {
    assert!(
        wait_until(|| debugger.target().continued_count() >= count),
        "pump did not continue {} event(s)",
        count
    );
}

#[test]
fn test_retrap_cycle_rearms_breakpoint() {
    let mut debugger = setup();
    let (hits, handler) = counter();
    debugger.breakpoints().add(CODE, handler).unwrap();
    assert_eq!(debugger.target().byte(CODE), 0x55);

    debugger.attach().unwrap();
    assert!(debugger.is_attached());
    assert_eq!(debugger.target().byte(CODE), TRAP_OPCODE);

    debugger.target().hit(7, CODE);
    wait_continued(&debugger, 1);

    let context = debugger.target().context(7);
    assert_eq!(context.rip, CODE);
    assert!(context.trap_flag());
    assert_eq!(debugger.target().byte(CODE), 0x55);
    assert_eq!(debugger.target().suspend_depth(7), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    debugger.target().step(7);
    wait_continued(&debugger, 2);
    assert_eq!(debugger.target().byte(CODE), TRAP_OPCODE);
    assert!(debugger.breakpoints().get(CODE).unwrap().is_enabled());

    let report = debugger.detach().unwrap();
    assert_eq!(report.reason, DetachReason::Cancelled);
    assert!(report.is_clean());
    assert_eq!(debugger.target().byte(CODE), 0x55);
    assert!(debugger.target().was_stopped());
    assert_eq!(debugger.status(), SessionStatus::Detached);
}

#[test]
fn test_false_condition_still_completes_retrap() {
    let mut debugger = setup();
    let (hits, handler) = counter();
    debugger
        .breakpoints()
        .add_with_condition(CODE, handler, |_| false)
        .unwrap();
    debugger.attach().unwrap();

    debugger.target().hit(7, CODE);
    wait_continued(&debugger, 1);
    assert_eq!(debugger.target().byte(CODE), 0x55);
    assert!(debugger.target().context(7).trap_flag());

    debugger.target().step(7);
    wait_continued(&debugger, 2);
    assert_eq!(debugger.target().byte(CODE), TRAP_OPCODE);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_condition_sees_faulting_thread() {
    let mut debugger = setup();
    let (hits, handler) = counter();
    debugger
        .breakpoints()
        .add_with_condition(CODE, handler, |hit| hit.tid == 8)
        .unwrap();
    debugger.attach().unwrap();

    debugger.target().hit(7, CODE);
    wait_continued(&debugger, 1);
    debugger.target().step(7);
    debugger.target().hit(8, CODE);
    wait_continued(&debugger, 3);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handler_rewrites_registers() {
    let mut debugger = setup();
    debugger
        .breakpoints()
        .add(CODE, |hit| {
            hit.context.rax = 0x1337;
            hit.context.set_instruction_pointer(hit.address + 4);
        })
        .unwrap();
    debugger.attach().unwrap();

    debugger.target().hit(7, CODE);
    wait_continued(&debugger, 1);
    let context = debugger.target().context(7);
    assert_eq!(context.rax, 0x1337);
    assert_eq!(context.rip, CODE + 4);
    assert!(context.trap_flag());

    debugger.target().step(7);
    wait_continued(&debugger, 2);
    assert_eq!(debugger.target().byte(CODE), TRAP_OPCODE);
}

#[test]
fn test_handler_disable_skips_retrap() {
    let mut debugger = setup();
    let breakpoint = debugger
        .breakpoints()
        .add(CODE, |hit| hit.disable_breakpoint())
        .unwrap();
    debugger.attach().unwrap();

    debugger.target().hit(7, CODE);
    wait_continued(&debugger, 1);

    let context = debugger.target().context(7);
    assert_eq!(context.rip, CODE);
    assert!(!context.trap_flag());
    assert_eq!(debugger.target().byte(CODE), 0x55);
    assert!(!breakpoint.is_enabled());
    assert!(!breakpoint.is_armed());

    // Nothing is pending, so cancellation is immediate.
    let report = debugger.detach().unwrap();
    assert!(report.is_clean());
    assert_eq!(debugger.target().byte(CODE), 0x55);
}

#[test]
fn test_cancel_waits_for_pending_retrap() {
    let mut debugger = setup();
    let breakpoint = debugger.breakpoints().add(CODE, |_| {}).unwrap();
    debugger.attach().unwrap();

    debugger.target().hit(7, CODE);
    wait_continued(&debugger, 1);
    debugger.cancel();

    thread::sleep(Duration::from_millis(50));
    assert!(debugger.is_attached());
    assert!(!debugger.target().was_stopped());

    debugger.target().step(7);
    let report = debugger.wait().unwrap();
    assert_eq!(report.reason, DetachReason::Cancelled);
    assert_eq!(debugger.target().continued_count(), 2);
    assert_eq!(debugger.target().byte(CODE), 0x55);
    assert!(!breakpoint.is_enabled());
    assert!(debugger.target().was_stopped());
}

#[test]
fn test_detach_restores_every_breakpoint() {
    let mut debugger = setup();
    let addresses = [CODE, CODE + 4, CODE + 5];
    for address in addresses {
        debugger.breakpoints().add(address, |_| {}).unwrap();
    }
    debugger.attach().unwrap();
    for address in addresses {
        assert_eq!(debugger.target().byte(address), TRAP_OPCODE);
    }

    debugger.target().hit(8, CODE + 4);
    wait_continued(&debugger, 1);
    debugger.cancel();
    debugger.target().step(8);

    let report = debugger.wait().unwrap();
    assert!(report.is_clean());
    for (address, original) in addresses.iter().zip([0x55, 0x90, 0xc3]) {
        assert_eq!(debugger.target().byte(*address), original);
    }
    assert_eq!(debugger.target().suspend_depth(7), 0);
    assert_eq!(debugger.target().suspend_depth(8), 0);

    // Registrations survive for the next session.
    assert_eq!(debugger.breakpoints().len(), 3);
    debugger.attach().unwrap();
    assert_eq!(debugger.target().byte(CODE + 5), TRAP_OPCODE);
}

#[test]
fn test_threads_retrap_independently() {
    let mut debugger = setup();
    debugger.breakpoints().add(CODE, |_| {}).unwrap();
    debugger.breakpoints().add(CODE + 4, |_| {}).unwrap();
    debugger.attach().unwrap();

    debugger.target().hit(7, CODE);
    debugger.target().hit(8, CODE + 4);
    wait_continued(&debugger, 2);
    assert_eq!(debugger.target().byte(CODE), 0x55);
    assert_eq!(debugger.target().byte(CODE + 4), 0x90);

    debugger.target().step(8);
    wait_continued(&debugger, 3);
    assert_eq!(debugger.target().byte(CODE), 0x55);
    assert_eq!(debugger.target().byte(CODE + 4), TRAP_OPCODE);

    debugger.target().step(7);
    wait_continued(&debugger, 4);
    assert_eq!(debugger.target().byte(CODE), TRAP_OPCODE);
}

#[test]
fn test_thread_exit_rearms_pending_breakpoint() {
    let mut debugger = setup();
    debugger.breakpoints().add(CODE, |_| {}).unwrap();
    debugger.attach().unwrap();

    debugger.target().hit(7, CODE);
    wait_continued(&debugger, 1);
    debugger.target().push_event(DebugEvent::new(
        PID,
        7,
        DebugEventKind::ThreadExited { exit_code: 0 },
    ));
    wait_continued(&debugger, 2);
    assert_eq!(debugger.target().byte(CODE), TRAP_OPCODE);
}

#[test]
fn test_removed_during_retrap_is_not_rearmed() {
    let mut debugger = setup();
    debugger.breakpoints().add(CODE, |_| {}).unwrap();
    debugger.attach().unwrap();

    debugger.target().hit(7, CODE);
    wait_continued(&debugger, 1);
    assert!(debugger.breakpoints().remove(CODE).unwrap());

    debugger.target().step(7);
    wait_continued(&debugger, 2);
    assert_eq!(debugger.target().byte(CODE), 0x55);
}

#[test]
fn test_process_exit_skips_restoration() {
    let mut debugger = setup();
    let breakpoint = debugger.breakpoints().add(CODE, |_| {}).unwrap();
    let notices = debugger.subscribe();
    debugger.attach().unwrap();

    debugger.target().exit(3);
    let report = debugger.wait().unwrap();
    assert_eq!(report.reason, DetachReason::ProcessExited { exit_code: 3 });
    assert!(!breakpoint.is_enabled());
    assert!(!debugger.target().was_stopped());
    assert_eq!(debugger.status(), SessionStatus::Detached);

    let received: Vec<_> = notices.try_iter().collect();
    assert_eq!(
        received,
        vec![
            SessionNotice::Attached { pid: PID },
            SessionNotice::ProcessExited {
                pid: PID,
                exit_code: 3
            },
            SessionNotice::Detached {
                pid: PID,
                failures: Vec::new()
            },
        ]
    );
}

#[test]
fn test_foreign_events_are_passed_through() {
    let mut debugger = setup();
    debugger.attach().unwrap();

    // The attach breakpoint and a fault nobody asked about.
    debugger.target().hit(7, CODE + 2);
    debugger.target().push_event(DebugEvent::new(
        PID,
        8,
        DebugEventKind::Exception {
            code: ExceptionCode::Other(0xC000_0005),
            address: 0,
            first_chance: true,
        },
    ));
    wait_continued(&debugger, 2);

    let statuses: Vec<_> = debugger
        .target()
        .continued()
        .into_iter()
        .map(|(_, status)| status)
        .collect();
    assert_eq!(
        statuses,
        vec![ContinueStatus::Continue, ContinueStatus::ExceptionNotHandled]
    );
    assert_eq!(debugger.target().context(7).rip, CODE + 3);
    assert_eq!(debugger.target().byte(CODE + 2), 0x89);
}

#[test]
fn test_hook_receives_optional_events() {
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl EventHook for Recorder {
        fn module_loaded(&mut self, event: &DebugEvent) {
            if let DebugEventKind::ModuleLoaded { base_address } = event.kind {
                self.0.lock().unwrap().push(format!("load {:#x}", base_address));
            }
        }

        fn exception(&mut self, _event: &DebugEvent) -> ContinueStatus {
            self.0.lock().unwrap().push("exception".into());
            ContinueStatus::Continue
        }
    }

    let mut debugger = setup();
    let recorder = Recorder::default();
    debugger.set_hook(recorder.clone());
    debugger.attach().unwrap();

    debugger.target().push_event(DebugEvent::new(
        PID,
        7,
        DebugEventKind::ModuleLoaded {
            base_address: 0x7ff0_0000,
        },
    ));
    debugger.target().push_event(DebugEvent::new(
        PID,
        7,
        DebugEventKind::Exception {
            code: ExceptionCode::Other(0x4001_0006),
            address: 0x7ff0_1234,
            first_chance: true,
        },
    ));
    wait_continued(&debugger, 2);

    assert_eq!(
        *recorder.0.lock().unwrap(),
        vec!["load 0x7ff00000".to_string(), "exception".to_string()]
    );
    assert_eq!(debugger.target().continued()[1].1, ContinueStatus::Continue);
}

#[test]
fn test_context_failure_is_contained() {
    let mut debugger = setup();
    debugger.target().add_thread(9);
    debugger.target().fail_context_for(9);
    debugger.breakpoints().add(CODE, |_| {}).unwrap();
    let notices = debugger.subscribe();
    debugger.attach().unwrap();

    debugger.target().hit(9, CODE);
    wait_continued(&debugger, 1);
    assert_eq!(debugger.target().byte(CODE), TRAP_OPCODE);
    assert_eq!(debugger.target().suspend_depth(9), 0);

    assert_eq!(
        notices.recv_timeout(Duration::from_secs(1)).unwrap(),
        SessionNotice::Attached { pid: PID }
    );
    match notices.recv_timeout(Duration::from_secs(1)).unwrap() {
        SessionNotice::DispatchFailed { tid, address, .. } => {
            assert_eq!(tid, 9);
            assert_eq!(address, Some(CODE));
        }
        other => panic!("unexpected notice {:?}", other),
    }

    // The pump is still serving other threads.
    debugger.target().hit(7, CODE);
    wait_continued(&debugger, 2);
    assert_eq!(debugger.target().byte(CODE), 0x55);
}

#[test]
fn test_failed_restore_still_rewinds_thread() {
    let mut debugger = setup();
    debugger
        .breakpoints()
        .add(CODE, |hit| hit.context.rax = 0x1337)
        .unwrap();
    let notices = debugger.subscribe();
    debugger.attach().unwrap();

    debugger.target().fail_writes(true);
    debugger.target().hit(7, CODE);
    wait_continued(&debugger, 1);

    let context = debugger.target().context(7);
    assert_eq!(context.rip, CODE);
    assert_eq!(context.rax, 0x1337);
    assert!(!context.trap_flag());
    assert_eq!(debugger.target().byte(CODE), TRAP_OPCODE);
    assert_eq!(debugger.target().suspend_depth(7), 0);

    assert_eq!(
        notices.recv_timeout(Duration::from_secs(1)).unwrap(),
        SessionNotice::Attached { pid: PID }
    );
    assert!(matches!(
        notices.recv_timeout(Duration::from_secs(1)).unwrap(),
        SessionNotice::DispatchFailed { tid: 7, address: Some(CODE), .. }
    ));

    // No retrap is outstanding, so detach does not wait for a step.
    debugger.target().fail_writes(false);
    let report = debugger.detach().unwrap();
    assert_eq!(report.reason, DetachReason::Cancelled);
    assert!(report.is_clean());
    assert_eq!(debugger.target().byte(CODE), 0x55);
}

#[test]
fn test_enable_after_attach_does_not_rewrite() {
    let mut debugger = setup();
    debugger.breakpoints().add(CODE, |_| {}).unwrap();
    assert_eq!(debugger.target().writes_at(CODE), 0);

    debugger.attach().unwrap();
    assert_eq!(debugger.target().writes_at(CODE), 1);
    assert!(!debugger.breakpoints().enable(CODE).unwrap());
    assert_eq!(debugger.target().writes_at(CODE), 1);
    assert_eq!(debugger.target().byte(CODE), TRAP_OPCODE);
}

#[test]
fn test_breakpoint_added_while_attached_is_live() {
    let mut debugger = setup();
    debugger.attach().unwrap();
    debugger.breakpoints().add(CODE + 4, |_| {}).unwrap();
    assert_eq!(debugger.target().read_u8(CODE + 4).unwrap(), TRAP_OPCODE);
}

#[test]
fn test_attach_twice_is_rejected() {
    let mut debugger = setup();
    debugger.attach().unwrap();
    assert_eq!(
        debugger.attach(),
        Err(DebugError::AlreadyAttached { pid: PID })
    );
}

#[test]
fn test_attach_to_debugged_process_is_rejected() {
    let mut debugger = setup();
    debugger.target().set_being_debugged();
    assert_eq!(
        debugger.attach(),
        Err(DebugError::AlreadyBeingDebugged { pid: PID })
    );
    assert_eq!(debugger.status(), SessionStatus::Detached);
}

#[test]
fn test_attach_to_exited_process_is_rejected() {
    let mut debugger = setup();
    debugger.breakpoints().add(CODE, |_| {}).unwrap();
    debugger.target().exit(0);
    assert!(matches!(
        debugger.attach(),
        Err(DebugError::ProcessNotFound { pid: PID, .. })
    ));
    assert!(!debugger.target().is_debugging());
    assert_eq!(debugger.status(), SessionStatus::Detached);
    assert_eq!(debugger.target().byte(CODE), 0x55);
}

#[test]
fn test_attach_failure_leaves_memory_untouched() {
    let mut debugger = setup();
    debugger.breakpoints().add(CODE, |_| {}).unwrap();
    debugger.target().fail_begin(DebugError::AttachFailed {
        pid: PID,
        reason: "access denied".into(),
    });

    assert!(matches!(
        debugger.attach(),
        Err(DebugError::AttachFailed { .. })
    ));
    assert_eq!(debugger.status(), SessionStatus::Detached);
    assert_eq!(debugger.target().byte(CODE), 0x55);
    assert!(matches!(debugger.wait(), Err(DebugError::NotAttached { .. })));
}

#[test]
fn test_dispose_detaches() {
    let mut debugger = setup();
    debugger.breakpoints().add(CODE, |_| {}).unwrap();
    debugger.attach().unwrap();
    let breakpoints = debugger.breakpoints().clone();

    let report = debugger.dispose().unwrap().unwrap();
    assert!(report.is_clean());
    assert_eq!(breakpoints.memory().read_u8(CODE).unwrap(), 0x55);
}
