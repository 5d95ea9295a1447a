use super::*;
use crate::scheduler;
use crate::sync::semaphore;
use serial_test::serial;

extern "C" fn spin_entry(_argc: u64, _argv: *const *const u8) -> i64 {
    0
}

fn reset_world() {
    crate::process::reset();
    crate::scheduler::reset();
    crate::sync::semaphore::reset();
    crate::ipc::pipe::reset();
}

fn spawn_with(
    name: &str,
    priority: Priority,
    parent: Option<Pid>,
    is_background: bool,
) -> Pid {
    create_process(
        TaskEntry::Function(spin_entry),
        &[name],
        priority,
        parent,
        is_background,
    )
    .expect("process creation failed")
}

fn spawn(name: &str) -> Pid {
    spawn_with(name, Priority::Mid, None, true)
}

/// Occupy pids 0 and 1 with low-priority placeholders, mirroring the boot
/// layout where idle and init own those slots.
fn spawn_system_placeholders() {
    assert_eq!(spawn_with("idle", Priority::Min, None, true), IDLE_PROCESS_PID);
    assert_eq!(spawn_with("init", Priority::Min, None, true), INIT_PROCESS_PID);
}

/// Drive the scheduler until `pid` is the running process.
fn run_until_current(pid: Pid) {
    for tick in 0..400u64 {
        if scheduler::current_pid() == Some(pid) {
            return;
        }
        scheduler::schedule(0x9000 + tick);
    }
    panic!("pid {} never became current", pid);
}

#[test]
#[serial]
fn pids_are_allocated_round_robin() {
    reset_world();
    assert_eq!(spawn("a"), 0);
    assert_eq!(spawn("b"), 1);
    assert_eq!(spawn("c"), 2);
    let d = spawn("d");
    assert_eq!(d, 3);

    // Freeing a slot does not rewind the cursor; allocation continues past it.
    assert_eq!(kill(d), 0);
    assert_eq!(spawn("e"), 4);
}

#[test]
#[serial]
fn create_registers_child_and_copies_argv() {
    reset_world();
    let parent = spawn("parent");
    let child = create_process(
        TaskEntry::Function(spin_entry),
        &["child", "--flag", "value"],
        Priority::Mid,
        Some(parent),
        true,
    )
    .unwrap();

    assert!(with_process(parent, |p| p.children.contains(&child)).unwrap());

    let (entry_ok, argc, argv) = launch_parameters(child)
        .map(|(entry, argc, argv)| (matches!(entry, TaskEntry::Function(_)), argc, argv))
        .unwrap();
    assert!(entry_ok);
    assert_eq!(argc, 3);
    let first = unsafe { core::ffi::CStr::from_ptr(*argv as *const i8) };
    assert_eq!(first.to_str().unwrap(), "child");
    // argv is null-terminated, C style.
    assert!(unsafe { *argv.add(3) }.is_null());
}

#[test]
#[serial]
fn foreground_follows_creation_mode() {
    reset_world();
    spawn_system_placeholders();
    let shell = spawn("shell");
    assert_eq!(get_foreground_pid(), None);

    let fg = spawn_with("fg", Priority::Mid, Some(shell), false);
    assert_eq!(get_foreground_pid(), Some(fg));
    assert!(with_process(fg, |p| p.is_foreground).unwrap());

    // Killing the foreground process hands the console to its parent.
    assert_eq!(kill(fg), 0);
    assert_eq!(get_foreground_pid(), Some(shell));
}

#[test]
#[serial]
fn kill_of_ready_process_reaps_synchronously() {
    reset_world();
    spawn_system_placeholders();
    spawn("a");
    let victim = spawn("victim");

    assert_eq!(kill(victim), 0);
    assert!(get_process_info(victim).is_none());
    assert!(!scheduler::ready_queue_snapshot(Priority::Mid).contains(&victim));
    // The slot is gone, so a repeat kill reports an invalid pid.
    assert_eq!(kill(victim), -1);
}

#[test]
#[serial]
fn kill_of_running_process_is_deferred_and_idempotent() {
    reset_world();
    spawn_system_placeholders();
    let a = spawn("a");
    let b = spawn("b");
    run_until_current(a);

    assert_eq!(kill(a), 0);
    // Still on the CPU: the PCB survives until the scheduler switches away.
    assert_eq!(
        with_process(a, |p| p.state),
        Some(ProcessState::Terminated)
    );
    assert!(terminated_list_contains(a));
    assert_eq!(kill(a), 0);

    // The first entry still excludes the dying process, then reaps it.
    scheduler::schedule(0x100);
    assert_eq!(scheduler::current_pid(), Some(b));
    assert!(get_process_info(a).is_some());
    scheduler::schedule(0x200);
    assert!(get_process_info(a).is_none());
    assert!(!terminated_list_contains(a));
}

#[test]
#[serial]
fn killed_slot_is_reusable() {
    reset_world();
    spawn_system_placeholders();
    let a = spawn("a");
    run_until_current(a);
    assert_eq!(kill(a), 0);
    scheduler::schedule(0x100);
    scheduler::schedule(0x200);
    assert!(get_process_info(a).is_none());

    // Allocation wraps around and eventually hands the freed slot out again.
    let mut reused = false;
    for _ in 0..MAX_PROCESSES {
        match create_process(
            TaskEntry::Function(spin_entry),
            &["filler"],
            Priority::Mid,
            None,
            true,
        ) {
            Some(pid) if pid == a => {
                reused = true;
                break;
            }
            Some(_) => {}
            None => break,
        }
    }
    assert!(reused);
}

#[test]
#[serial]
fn protected_pids_cannot_be_killed_or_blocked() {
    reset_world();
    spawn_system_placeholders();
    assert_eq!(kill(IDLE_PROCESS_PID), -1);
    assert_eq!(kill(INIT_PROCESS_PID), -1);
    assert_eq!(block(IDLE_PROCESS_PID), -1);
    assert_eq!(kill(MAX_PROCESSES), -1);
}

#[test]
#[serial]
fn block_and_unblock_transitions() {
    reset_world();
    spawn_system_placeholders();
    let p = spawn("p");

    assert_eq!(unblock(p), -1); // Ready -> Ready is invalid
    assert_eq!(block(p), 0);
    assert_eq!(
        with_process(p, |q| q.state),
        Some(ProcessState::Blocked)
    );
    assert!(!scheduler::ready_queue_snapshot(Priority::Mid).contains(&p));

    assert_eq!(block(p), -1); // already blocked
    assert_eq!(unblock(p), 0);
    assert_eq!(with_process(p, |q| q.state), Some(ProcessState::Ready));
    assert!(scheduler::ready_queue_snapshot(Priority::Mid).contains(&p));
}

#[test]
#[serial]
fn blocked_running_process_is_switched_away_without_requeue() {
    reset_world();
    spawn_system_placeholders();
    let a = spawn("a");
    spawn("b");
    run_until_current(a);

    assert_eq!(block(a), 0);
    scheduler::schedule(0x300);
    assert_ne!(scheduler::current_pid(), Some(a));
    assert!(!scheduler::ready_queue_snapshot(Priority::Mid).contains(&a));
}

#[test]
#[serial]
fn nice_requeues_ready_process() {
    reset_world();
    let p = spawn("p");
    assert_eq!(nice(p, Priority::Max), 0);
    assert_eq!(with_process(p, |q| q.priority), Some(Priority::Max));
    assert!(scheduler::ready_queue_snapshot(Priority::Mid).is_empty());
    assert_eq!(
        scheduler::ready_queue_snapshot(Priority::Max),
        alloc::vec![p]
    );
}

#[test]
#[serial]
fn wait_pid_reaps_terminated_child() {
    reset_world();
    spawn_system_placeholders();
    let parent = spawn("parent");
    let child = spawn_with("child", Priority::Mid, Some(parent), true);

    // The child terminates itself; its PCB lingers until the scheduler has
    // switched away from it.
    run_until_current(child);
    assert_eq!(kill(child), 0);

    scheduler::schedule(0x400);
    assert_eq!(scheduler::current_pid(), Some(parent));
    assert_eq!(wait_pid(child), 0);
    assert!(!with_process(parent, |p| p.children.contains(&child)).unwrap());

    // Cleanup frees the slot; a second wait no longer finds the pid.
    scheduler::schedule(0x500);
    assert!(get_process_info(child).is_none());
    assert_eq!(wait_pid(child), -1);
}

#[test]
#[serial]
fn wait_pid_rejects_non_children() {
    reset_world();
    spawn_system_placeholders();
    let a = spawn("a");
    let b = spawn("b");
    run_until_current(a);
    assert_eq!(wait_pid(b), -1);
}

#[test]
#[serial]
fn joiner_blocked_on_wait_sem_is_woken_by_kill() {
    reset_world();
    spawn_system_placeholders();
    let parent = spawn("parent");
    let child = spawn_with("child", Priority::Mid, Some(parent), true);

    run_until_current(parent);
    assert_eq!(wait_pid(child), 0);
    // The parent parked itself on the child's wait semaphore.
    assert_eq!(
        with_process(parent, |p| p.state),
        Some(ProcessState::Blocked)
    );

    assert_eq!(kill(child), 0);
    assert_eq!(with_process(parent, |p| p.state), Some(ProcessState::Ready));
    assert!(get_process_info(child).is_none());
}

#[test]
#[serial]
fn wait_children_prunes_everything_and_is_idempotent() {
    reset_world();
    spawn_system_placeholders();
    let parent = spawn("parent");
    let c1 = spawn_with("c1", Priority::Mid, Some(parent), true);
    let c2 = spawn_with("c2", Priority::Mid, Some(parent), true);

    assert_eq!(kill(c1), 0);
    assert_eq!(kill(c2), 0);

    run_until_current(parent);
    assert_eq!(wait_children(), 0);
    assert_eq!(with_process(parent, |p| p.children.len()), Some(0));
    assert_eq!(wait_children(), 0);
}

#[test]
#[serial]
fn dead_parents_children_are_adopted() {
    reset_world();
    spawn_system_placeholders();
    let parent = spawn("parent");
    let child = spawn_with("child", Priority::Mid, Some(parent), true);

    assert_eq!(kill(parent), 0);

    // Orphans move to init (pid 1), which records them as children.
    assert_eq!(with_process(child, |c| c.ppid), Some(Some(INIT_PROCESS_PID)));
    assert!(
        with_process(INIT_PROCESS_PID, |p| p.children.contains(&child)).unwrap()
    );
}

#[test]
#[serial]
fn semaphore_wakeup_order_is_fifo() {
    reset_world();
    spawn_system_placeholders();
    let p1 = spawn("p1");
    let p2 = spawn("p2");
    let p3 = spawn("p3");
    let sem = semaphore::sem_init("gate", 0).unwrap();

    for &pid in &[p1, p2, p3] {
        run_until_current(pid);
        semaphore::wait(&sem);
        assert_eq!(
            with_process(pid, |p| p.state),
            Some(ProcessState::Blocked)
        );
    }
    assert_eq!(sem.blocked_count(), 3);

    for _ in 0..3 {
        semaphore::post(&sem);
    }

    // FIFO: the ready queue receives the waiters in their arrival order.
    assert_eq!(
        scheduler::ready_queue_snapshot(Priority::Mid),
        alloc::vec![p1, p2, p3]
    );
    assert_eq!(sem.blocked_count(), 0);
    assert_eq!(sem.count(), 0);
}

#[test]
#[serial]
fn destroy_releases_all_waiters() {
    reset_world();
    spawn_system_placeholders();
    let p1 = spawn("p1");
    let p2 = spawn("p2");
    let sem = semaphore::sem_init("doomed", 0).unwrap();

    run_until_current(p1);
    semaphore::wait(&sem);
    run_until_current(p2);
    semaphore::wait(&sem);

    semaphore::destroy(&sem);
    assert_eq!(with_process(p1, |p| p.state), Some(ProcessState::Ready));
    assert_eq!(with_process(p2, |p| p.state), Some(ProcessState::Ready));
}

#[test]
#[serial]
fn process_info_snapshot_is_complete() {
    reset_world();
    let p = spawn_with("snapshot", Priority::Max, None, false);
    let info = get_process_info(p).unwrap();

    assert_eq!(info.pid, p as i32);
    assert_eq!(&info.name[..8], b"snapshot");
    assert_eq!(info.priority, 2);
    assert_eq!(info.state, 0);
    assert_ne!(info.stack_base, 0);
    assert!(info.rsp > info.stack_base);
    assert_eq!(info.is_foreground, 1);

    assert!(get_process_info(MAX_PROCESSES).is_none());
}

#[test]
#[serial]
fn names_are_bounded() {
    reset_world();
    let long_name = "x".repeat(100);
    let p = spawn(&long_name);
    assert_eq!(
        with_process(p, |q| q.name.len()),
        Some(PROCESS_NAME_MAX_LENGTH - 1)
    );
}
