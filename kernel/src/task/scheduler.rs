//! Multilevel feedback queue scheduler
//!
//! All scheduler state lives in [`TaskManager`]: the task table, the MLFQ
//! rings, the responder stack, and the PID counter. The manager is pure
//! bookkeeping; it consumes the current tick as a parameter and emits
//! [`SwitchDecision`]s that the architecture layer turns into actual
//! context switches. That split keeps every policy here testable.
//!
//! Policy: a task starts in ring 0. Exhausting its quantum demotes it one
//! ring (interactive mode); yielding or blocking keeps its ring. Every
//! boost interval all runnable tasks return to ring 0 so starved
//! CPU-bound work recovers. The quantum doubles per ring.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::queue::RunQueue;
use super::responder::ResponderStack;
use super::tcb::{Context, Task};
use super::{Pid, SchedPolicy, TaskState};
use crate::mm::PhysicalAddress;

/// Upper bound on the number of rings.
pub const MAX_RINGS: usize = 8;

/// Scheduler tunables fixed at boot.
#[derive(Debug, Clone, Copy)]
pub struct SchedConfig {
    pub policy: SchedPolicy,
    /// Number of rings in use (1 for low-latency mode).
    pub rings: usize,
    /// Ring-0 quantum in ticks; ring q gets `base_quantum << q`.
    pub base_quantum: u64,
    /// Ticks between starvation boosts (interactive mode).
    pub boost_interval: u64,
}

impl SchedConfig {
    /// Round-robin across one shared ring.
    pub const fn low_latency() -> Self {
        Self {
            policy: SchedPolicy::LowLatency,
            rings: 1,
            base_quantum: 1,
            boost_interval: u64::MAX,
        }
    }

    /// Four rings, one-tick base quantum, one-second boost at the default
    /// 50 Hz tick.
    pub const fn interactive() -> Self {
        Self {
            policy: SchedPolicy::Interactive,
            rings: 4,
            base_quantum: 1,
            boost_interval: 50,
        }
    }
}

/// What the context-switch path needs to resume the next task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchDecision {
    /// Outgoing task, if it still exists (its live context is saved by the
    /// switch routine itself).
    pub prev: Option<Pid>,
    /// Incoming task.
    pub next: Pid,
    pub esp: u32,
    pub ebp: u32,
    pub eip: u32,
    /// Directory to load, when it differs from the outgoing one.
    pub cr3: Option<PhysicalAddress>,
}

/// Kernel-root object owning all task state.
pub struct TaskManager {
    pub(crate) config: SchedConfig,
    pub(crate) tasks: BTreeMap<Pid, Box<Task>>,
    pub(crate) rings: [RunQueue; MAX_RINGS],
    pub(crate) responders: ResponderStack,
    pub(crate) current: Option<Pid>,
    pub(crate) root: Option<Pid>,
    pub(crate) next_pid: u32,
    pub(crate) kb_pending: bool,
    pub(crate) mouse_pending: bool,
    pub(crate) last_boost: u64,
    /// Tick at which the current task was handed the CPU.
    pub(crate) dispatched_at: u64,
}

impl TaskManager {
    pub const fn new(config: SchedConfig) -> Self {
        Self {
            config,
            tasks: BTreeMap::new(),
            rings: [const { RunQueue::new() }; MAX_RINGS],
            responders: ResponderStack::new(),
            current: None,
            root: None,
            next_pid: 1,
            kb_pending: false,
            mouse_pending: false,
            last_boost: 0,
            dispatched_at: 0,
        }
    }

    /// Replace the scheduler configuration. Only valid before tasks exist.
    pub fn set_config(&mut self, config: SchedConfig) {
        debug_assert!(self.tasks.is_empty(), "reconfigured a live scheduler");
        let mut config = config;
        config.rings = config.rings.clamp(1, MAX_RINGS);
        if config.policy == SchedPolicy::LowLatency {
            config.rings = 1;
        }
        self.config = config;
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    fn ring_count(&self) -> usize {
        self.config.rings
    }

    /// Quantum for a ring: doubles per demotion level.
    pub fn quantum_for(&self, ring: usize) -> u64 {
        self.config.base_quantum << ring
    }

    // -----------------------------------------------------------------------
    // Task table access
    // -----------------------------------------------------------------------

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.get(&pid).map(|t| t.as_ref())
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.get_mut(&pid).map(|t| t.as_mut())
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    pub fn current(&self) -> Option<&Task> {
        self.current.and_then(|pid| self.task(pid))
    }

    pub fn root_pid(&self) -> Option<Pid> {
        self.root
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Iterate over every task (diagnostics; the `proc` listing).
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().map(|t| t.as_ref())
    }

    /// Raw pointer to a task's saved context, for the switch routine.
    /// TCBs are boxed, so the pointer is stable while the task lives.
    pub fn context_ptr(&mut self, pid: Option<Pid>) -> Option<*mut Context> {
        let task = self.tasks.get_mut(&pid?)?;
        Some(&mut task.context as *mut Context)
    }

    /// Print one line per task.
    pub fn dump_tasks(&self) {
        println!("pid   ring  state      lifespan  name");
        for task in self.tasks() {
            println!(
                "{:<5} {:<5} {:<10?} {:<9} {}",
                task.pid, task.ring, task.state, task.lifespan, task.name
            );
        }
    }

    // -----------------------------------------------------------------------
    // Ready rings
    // -----------------------------------------------------------------------

    pub(crate) fn enqueue(&mut self, pid: Pid, ring: usize) {
        if !self.rings[ring].enqueue(pid) {
            log::warn!("ring {ring} is full; pid {pid} was not queued");
        }
    }

    /// Next runnable task, scanning rings in ascending order. Entries whose
    /// task stopped being runnable (asynchronous block or kill) are stale
    /// tombstones and are dropped on encounter.
    fn pick_next(&mut self) -> Option<Pid> {
        for ring in 0..self.ring_count() {
            loop {
                let Some(pid) = self.rings[ring].dequeue() else {
                    break;
                };
                if self.tasks.get(&pid).is_some_and(|t| t.is_runnable()) {
                    return Some(pid);
                }
            }
        }
        None
    }

    /// Hottest ring holding at least one genuinely runnable task.
    fn hottest_ready_ring(&self) -> Option<usize> {
        for ring in 0..self.ring_count() {
            let any_runnable = self.rings[ring]
                .iter()
                .any(|pid| self.tasks.get(&pid).is_some_and(|t| t.is_runnable()));
            if any_runnable {
                return Some(ring);
            }
        }
        None
    }

    /// Restore every runnable task to ring 0, preserving relative order.
    fn boost(&mut self, now: u64) {
        let mut displaced: Vec<Pid> = Vec::new();
        for ring in 1..self.ring_count() {
            while let Some(pid) = self.rings[ring].dequeue() {
                displaced.push(pid);
            }
        }
        for pid in displaced {
            if let Some(task) = self.tasks.get_mut(&pid) {
                if task.is_runnable() {
                    task.ring = 0;
                    self.enqueue(pid, 0);
                }
            }
        }
        if let Some(cur) = self.current {
            if let Some(task) = self.tasks.get_mut(&cur) {
                task.ring = 0;
            }
        }
        self.last_boost = now;
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Account the outgoing task's run time.
    fn account_switch_out(&mut self, pid: Pid, now: u64) {
        let dispatched_at = self.dispatched_at;
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.lifespan += now.saturating_sub(dispatched_at);
            task.relinquished_at = now;
        }
    }

    /// Hand the CPU to `next` and describe the switch.
    fn dispatch(&mut self, next: Pid, now: u64) -> SwitchDecision {
        let prev = self.current;
        if let Some(prev_pid) = prev {
            self.account_switch_out(prev_pid, now);
        }

        let prev_dir = prev
            .and_then(|p| self.tasks.get(&p))
            .and_then(|t| t.space.as_ref())
            .map(|s| s.directory_addr());

        self.current = Some(next);
        self.dispatched_at = now;

        let next_task = self.tasks.get(&next).expect("dispatched task is in the table");
        let next_dir = next_task.space.as_ref().map(|s| s.directory_addr());
        let cr3 = if next_dir == prev_dir { None } else { next_dir };

        SwitchDecision {
            prev,
            next,
            esp: next_task.context.esp,
            ebp: next_task.context.ebp,
            eip: next_task.context.eip,
            cr3,
        }
    }

    /// Give the CPU away with no runnable successor: go idle.
    fn go_idle(&mut self, now: u64) {
        if let Some(cur) = self.current {
            self.account_switch_out(cur, now);
        }
        self.current = None;
        self.dispatched_at = now;
    }

    /// Pick a successor for a current task that can no longer run.
    fn switch_away(&mut self, now: u64) -> Option<SwitchDecision> {
        match self.pick_next() {
            Some(next) => Some(self.dispatch(next, now)),
            None => {
                self.go_idle(now);
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // The timer tick
    // -----------------------------------------------------------------------

    /// Scheduler tick: wake expired sleepers, boost on schedule, and decide
    /// whether to preempt. Returns the switch to perform, if any.
    pub fn tick(&mut self, now: u64) -> Option<SwitchDecision> {
        self.update_blocked_tasks(now);

        let mut boosted = false;
        if self.config.policy == SchedPolicy::Interactive
            && self.ring_count() > 1
            && now.saturating_sub(self.last_boost) >= self.config.boost_interval
        {
            self.boost(now);
            boosted = true;
        }

        let Some(cur) = self.current else {
            // CPU is idle; admit whoever became ready.
            let next = self.pick_next()?;
            return Some(self.dispatch(next, now));
        };

        if !self.tasks.get(&cur).is_some_and(|t| t.is_runnable()) {
            // The running task blocked or died out from under us.
            return self.switch_away(now);
        }

        let ring = self.tasks.get(&cur).map(|t| t.ring).unwrap_or(0);

        // A ready task in a hotter ring preempts immediately; the preempted
        // task keeps its ring (it did not burn its quantum).
        if self.hottest_ready_ring().is_some_and(|hot| hot < ring) {
            let next = self.pick_next()?;
            self.enqueue(cur, ring);
            return Some(self.dispatch(next, now));
        }

        let elapsed = now.saturating_sub(self.dispatched_at);
        if elapsed < self.quantum_for(ring) {
            return None;
        }

        // Quantum exhausted: the timer preempts and demotes. A tick that
        // just boosted rotates without demoting (the consumed quantum
        // predates the reset).
        let new_ring = match self.config.policy {
            SchedPolicy::Interactive if !boosted => (ring + 1).min(self.ring_count() - 1),
            _ => ring,
        };
        if let Some(task) = self.tasks.get_mut(&cur) {
            task.ring = new_ring;
        }
        self.enqueue(cur, new_ring);

        let next = self.pick_next()?;
        if next == cur {
            // Alone in the system: keep running on a fresh quantum.
            self.dispatched_at = now;
            return None;
        }
        Some(self.dispatch(next, now))
    }

    /// Voluntary yield: the task keeps its ring and goes to the back of it.
    pub fn yield_now(&mut self, now: u64) -> Option<SwitchDecision> {
        let cur = self.current?;
        let ring = self.tasks.get(&cur).map(|t| t.ring).unwrap_or(0);
        self.enqueue(cur, ring);
        let next = self.pick_next()?;
        if next == cur {
            self.dispatched_at = now;
            return None;
        }
        Some(self.dispatch(next, now))
    }

    // -----------------------------------------------------------------------
    // Blocking and waking
    // -----------------------------------------------------------------------

    /// Block the running task and switch away.
    pub fn block_current(
        &mut self,
        reason: TaskState,
        context: Option<usize>,
        now: u64,
    ) -> Option<SwitchDecision> {
        debug_assert!(reason.is_blocked(), "block reason must be a wait state");
        let cur = self.current?;
        if let Some(task) = self.tasks.get_mut(&cur) {
            task.state = reason;
            task.block_context = context;
        }
        self.switch_away(now)
    }

    /// Block an arbitrary task: set its state and pull it out of its ring.
    /// Safe against double removal; blocking the running task defers to
    /// [`Self::block_current`].
    pub fn block_task(
        &mut self,
        pid: Pid,
        reason: TaskState,
        context: Option<usize>,
        now: u64,
    ) -> Result<Option<SwitchDecision>, crate::KernelError> {
        if Some(pid) == self.current {
            return Ok(self.block_current(reason, context, now));
        }
        let Some(task) = self.tasks.get_mut(&pid) else {
            return Err(crate::KernelError::TaskNotFound { pid: pid.0 });
        };
        debug_assert!(reason.is_blocked(), "block reason must be a wait state");
        task.state = reason;
        task.block_context = context;
        let ring = task.ring;
        // The queue may or may not still hold the task (a quantum-boundary
        // preemption can race a block); removal is idempotent.
        self.rings[ring].remove(pid);
        Ok(None)
    }

    /// Put the running task to sleep for `duration` ticks.
    pub fn sleep_current(&mut self, duration: u64, now: u64) -> Option<SwitchDecision> {
        let cur = self.current?;
        if let Some(task) = self.tasks.get_mut(&cur) {
            task.wake_timestamp = now + duration;
        }
        self.block_current(TaskState::PitWait, None, now)
    }

    /// Make a blocked task runnable again in ring 0.
    pub fn wake(&mut self, pid: Pid) {
        let Some(task) = self.tasks.get_mut(&pid) else {
            return;
        };
        if !task.state.is_blocked() {
            return;
        }
        task.state = TaskState::Runnable;
        task.ring = 0;
        task.wake_timestamp = 0;
        task.block_context = None;
        self.enqueue(pid, 0);
    }

    /// Wake every blocked task whose condition now holds: expired sleeps,
    /// input for the first responder, exited children.
    pub fn update_blocked_tasks(&mut self, now: u64) {
        let responder = self.responders.top();
        let mut to_wake: Vec<Pid> = Vec::new();
        let mut consumed_kb = false;
        let mut consumed_mouse = false;

        for (pid, task) in self.tasks.iter() {
            match task.state {
                TaskState::PitWait if task.wake_timestamp <= now => to_wake.push(*pid),
                TaskState::KbWait if self.kb_pending && responder == Some(*pid) => {
                    to_wake.push(*pid);
                    consumed_kb = true;
                }
                TaskState::MouseWait if self.mouse_pending && responder == Some(*pid) => {
                    to_wake.push(*pid);
                    consumed_mouse = true;
                }
                TaskState::ChildWait => {
                    let child_exited = task
                        .children
                        .iter()
                        .any(|c| self.tasks.get(c).is_some_and(|t| t.is_zombie()));
                    if child_exited {
                        to_wake.push(*pid);
                    }
                }
                _ => {}
            }
        }

        if consumed_kb {
            self.kb_pending = false;
        }
        if consumed_mouse {
            self.mouse_pending = false;
        }
        for pid in to_wake {
            self.wake(pid);
        }
    }

    /// Keyboard driver signal: input is available for the first responder.
    pub fn signal_keyboard(&mut self) {
        self.kb_pending = true;
    }

    /// Mouse driver signal.
    pub fn signal_mouse(&mut self) {
        self.mouse_pending = true;
    }

    /// Immediately re-examine blocked tasks instead of waiting for the
    /// next tick (used by drivers right after raising a signal).
    pub fn force_wake_scan(&mut self, now: u64) {
        self.update_blocked_tasks(now);
    }

    // -----------------------------------------------------------------------
    // Responder stack
    // -----------------------------------------------------------------------

    /// Make the running task the first responder.
    pub fn become_first_responder(&mut self) {
        if let Some(cur) = self.current {
            self.responders.push(cur);
        }
    }

    /// Resign first-responder status. No-op unless the running task holds
    /// it.
    pub fn resign_first_responder(&mut self) {
        if let Some(cur) = self.current {
            self.responders.resign(cur);
        }
    }

    /// The task currently receiving input events.
    pub fn first_responder(&self) -> Option<Pid> {
        self.responders.top()
    }

    // -----------------------------------------------------------------------
    // Test support
    // -----------------------------------------------------------------------

    /// Check the structural invariants tying the table, the rings, the
    /// responder stack, and the parent/child links together.
    #[cfg(all(test, not(target_os = "none")))]
    pub(crate) fn assert_consistent(&self) {
        for (pid, task) in self.tasks.iter() {
            let queued: usize = self.rings[..self.ring_count()]
                .iter()
                .map(|r| r.iter().filter(|p| p == pid).count())
                .sum();
            if task.is_runnable() && Some(*pid) != self.current {
                assert_eq!(queued, 1, "runnable pid {pid} must sit in exactly one ring");
            } else {
                assert_eq!(queued, 0, "pid {pid} ({:?}) must not be queued", task.state);
            }

            if let Some(parent) = task.parent {
                let listed = self
                    .tasks
                    .get(&parent)
                    .map(|p| p.children.contains(pid))
                    .unwrap_or(false);
                assert!(listed, "pid {pid} missing from parent {parent}'s children");
            }
            for child in task.children.iter() {
                assert_eq!(
                    self.tasks.get(child).and_then(|c| c.parent),
                    Some(*pid),
                    "child {child} does not point back at {pid}"
                );
            }
        }

        if let Some(top) = self.responders.top() {
            let alive = self.tasks.get(&top).map(|t| !t.is_zombie()).unwrap_or(false);
            assert!(alive, "responder top {top} must not be a zombie");
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// Manager with a root task and `n` admitted worker tasks (pids 2..).
    fn manager_with(n: usize) -> TaskManager {
        let mut m = TaskManager::new(SchedConfig::interactive());
        m.bootstrap("kernel-root", 0);
        for i in 0..n {
            let pid = m.create_task("worker", 0x1000 + i as u32, 0);
            m.add_task(pid).expect("admission succeeds");
        }
        m
    }

    #[test]
    fn test_quantum_ladder_doubles_per_ring() {
        let m = TaskManager::new(SchedConfig::interactive());
        assert_eq!(m.quantum_for(0), 1);
        assert_eq!(m.quantum_for(1), 2);
        assert_eq!(m.quantum_for(2), 4);
        assert_eq!(m.quantum_for(3), 8);
    }

    #[test]
    fn test_round_robin_rotation() {
        let mut m = manager_with(2);
        // Root exhausts its ring-0 quantum; worker 2 takes over.
        let d = m.tick(1).expect("preemption");
        assert_eq!(d.next, Pid(2));
        assert_eq!(d.prev, Some(Pid(1)));
        // Worker 2 exhausts its quantum; worker 3 follows.
        let d = m.tick(2).expect("preemption");
        assert_eq!(d.next, Pid(3));
        m.assert_consistent();
    }

    // The demotion scenario: with four rings, a CPU-bound task slides to
    // the coldest ring, and a fresh ring-0 task preempts it within one
    // ring-0 quantum.
    #[test]
    fn test_cpu_bound_task_demotes_to_coldest_ring() {
        let mut m = manager_with(1);
        let cpu_bound = Pid(2);

        // Root sleeps far into the future, leaving the CPU-bound task alone.
        let d = m.sleep_current(1_000_000, 0);
        assert_eq!(d.expect("worker takes over").next, cpu_bound);

        // Each quantum expiry demotes one ring even with no competitor.
        let mut now = 0;
        for expected_ring in [1, 2, 3] {
            now += m.quantum_for(expected_ring - 1);
            assert!(m.tick(now).is_none(), "alone: keeps running");
            assert_eq!(m.task(cpu_bound).unwrap().ring, expected_ring);
        }
        // The ladder caps at the coldest ring.
        now += m.quantum_for(3);
        m.tick(now);
        assert_eq!(m.task(cpu_bound).unwrap().ring, 3);

        // A new ring-0 task preempts within one ring-0 quantum...
        let fresh = m.create_task("fresh", 0x2000, now);
        m.add_task(fresh).unwrap();
        let d = m.tick(now + 1).expect("hotter ring preempts");
        assert_eq!(d.next, fresh);
        // ...and the preempted task keeps its ring (no quantum burned).
        assert_eq!(m.task(cpu_bound).unwrap().ring, 3);
        m.assert_consistent();
    }

    #[test]
    fn test_voluntary_yield_keeps_ring() {
        let mut m = manager_with(1);
        // Root yields before its quantum expires: stays in ring 0.
        let d = m.yield_now(0).expect("worker runs");
        assert_eq!(d.next, Pid(2));
        assert_eq!(m.task(Pid(1)).unwrap().ring, 0);
        m.assert_consistent();
    }

    #[test]
    fn test_boost_restores_everyone_to_ring_zero() {
        let mut m = manager_with(2);
        // Let both workers sink into colder rings.
        let mut now = 0;
        for _ in 0..12 {
            now += 8;
            m.tick(now);
        }
        let sunk = m
            .tasks()
            .filter(|t| t.ring > 0)
            .count();
        assert!(sunk > 0, "some task must have been demoted by now");

        // Jump past the boost interval: everyone is back in ring 0.
        now += m.config().boost_interval;
        m.tick(now);
        for task in m.tasks() {
            assert_eq!(task.ring, 0, "pid {} boosted", task.pid);
        }
        m.assert_consistent();
    }

    // The sleep scenario: 100 ms at 50 Hz is 5 ticks; a task sleeping at
    // tick 1000 re-enters ring 0 at tick 1005.
    #[test]
    fn test_sleep_wakes_at_timestamp() {
        let mut m = manager_with(1);
        // Make the worker current (root exhausts its quantum at tick 1000).
        let d = m.tick(1000).expect("worker dispatched");
        assert_eq!(d.next, Pid(2));

        let d = m.sleep_current(5, 1000).expect("root resumes");
        assert_eq!(d.next, Pid(1));
        assert_eq!(m.task(Pid(2)).unwrap().state, TaskState::PitWait);
        assert_eq!(m.task(Pid(2)).unwrap().wake_timestamp, 1005);
        m.assert_consistent();

        // Not yet due.
        m.tick(1004);
        assert_eq!(m.task(Pid(2)).unwrap().state, TaskState::PitWait);

        // Due: re-admitted to ring 0.
        m.tick(1005);
        let task = m.task(Pid(2)).unwrap();
        assert!(task.is_runnable());
        assert_eq!(task.ring, 0);
        assert_eq!(task.wake_timestamp, 0);
        m.assert_consistent();
    }

    #[test]
    fn test_blocked_task_is_skipped_not_scheduled() {
        let mut m = manager_with(2);
        // Block worker 3 while it sits queued: it must be pulled from the
        // ring and never dispatched.
        m.block_task(Pid(3), TaskState::KbWait, None, 0)
            .expect("block succeeds");
        m.assert_consistent();

        let d = m.tick(1).expect("rotation");
        assert_eq!(d.next, Pid(2));
        let d = m.tick(2).expect("rotation");
        assert_eq!(d.next, Pid(1), "only root and worker 2 rotate");
    }

    #[test]
    fn test_block_is_safe_against_double_removal() {
        let mut m = manager_with(1);
        // First removal via an explicit block.
        m.block_task(Pid(2), TaskState::MouseWait, None, 0).unwrap();
        // A racing second block (e.g. quantum-boundary preemption landing
        // in block_task) must not corrupt the queues.
        m.block_task(Pid(2), TaskState::MouseWait, None, 0).unwrap();
        m.assert_consistent();
        m.wake(Pid(2));
        m.assert_consistent();
        // Exactly one queue entry after the wake.
        let entries: usize = m.rings.iter().map(|r| r.iter().filter(|p| *p == Pid(2)).count()).sum();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_block_context_round_trip() {
        let mut m = manager_with(1);
        m.block_task(Pid(2), TaskState::KbWait, Some(0xCAFE), 0)
            .unwrap();
        assert_eq!(m.task(Pid(2)).unwrap().block_context, Some(0xCAFE));
        m.wake(Pid(2));
        assert_eq!(m.task(Pid(2)).unwrap().block_context, None);
    }

    #[test]
    fn test_block_unknown_task_is_reported() {
        let mut m = manager_with(0);
        let err = m
            .block_task(Pid(77), TaskState::KbWait, None, 0)
            .unwrap_err();
        assert_eq!(err, crate::KernelError::TaskNotFound { pid: 77 });
    }

    // The responder scenario: A then B become first responder; a
    // keystroke wakes only B; after B resigns, the next keystroke wakes A.
    #[test]
    fn test_keystrokes_wake_only_first_responder() {
        let mut m = manager_with(2);
        let (a, b) = (Pid(2), Pid(3));

        // A becomes responder, then B (dispatch each in turn).
        let d = m.yield_now(0).unwrap();
        assert_eq!(d.next, a);
        m.become_first_responder();
        let d = m.yield_now(0).unwrap();
        assert_eq!(d.next, b);
        m.become_first_responder();
        assert_eq!(m.first_responder(), Some(b));

        // Both block on the keyboard.
        m.block_task(a, TaskState::KbWait, None, 0).unwrap();
        let d = m.block_current(TaskState::KbWait, None, 0);
        assert!(d.is_some(), "root still runnable");

        // Keystroke: only B wakes.
        m.signal_keyboard();
        m.force_wake_scan(1);
        assert!(m.task(b).unwrap().is_runnable());
        assert_eq!(m.task(a).unwrap().state, TaskState::KbWait);
        m.assert_consistent();

        // B resigns; the next keystroke reaches A.
        let d = m.tick(2).expect("b runs");
        assert_eq!(d.next, b);
        m.resign_first_responder();
        assert_eq!(m.first_responder(), Some(a));
        m.signal_keyboard();
        m.force_wake_scan(3);
        assert!(m.task(a).unwrap().is_runnable());
        m.assert_consistent();
    }

    #[test]
    fn test_resign_when_not_top_is_silent() {
        let mut m = manager_with(1);
        let d = m.yield_now(0).unwrap();
        assert_eq!(d.next, Pid(2));
        m.become_first_responder();

        // Root (not on top) resigning changes nothing.
        let d = m.tick(1).expect("rotate back to root");
        assert_eq!(d.next, Pid(1));
        m.resign_first_responder();
        assert_eq!(m.first_responder(), Some(Pid(2)));
    }

    #[test]
    fn test_mouse_wakes_responder_independently_of_keyboard() {
        let mut m = manager_with(1);
        let d = m.yield_now(0).unwrap();
        assert_eq!(d.next, Pid(2));
        m.become_first_responder();
        let d = m.block_current(TaskState::MouseWait, None, 0);
        assert!(d.is_some());

        // A keystroke does not satisfy a mouse wait.
        m.signal_keyboard();
        m.force_wake_scan(1);
        assert_eq!(m.task(Pid(2)).unwrap().state, TaskState::MouseWait);

        m.signal_mouse();
        m.force_wake_scan(2);
        assert!(m.task(Pid(2)).unwrap().is_runnable());
        m.assert_consistent();
    }

    #[test]
    fn test_input_signal_is_consumed_by_wake() {
        let mut m = manager_with(1);
        let d = m.yield_now(0).unwrap();
        assert_eq!(d.next, Pid(2));
        m.become_first_responder();
        m.block_current(TaskState::KbWait, None, 0);

        m.signal_keyboard();
        m.force_wake_scan(1);
        assert!(m.task(Pid(2)).unwrap().is_runnable());

        // The pulse was consumed: blocking again does not wake instantly.
        let d = m.tick(2).expect("worker runs");
        assert_eq!(d.next, Pid(2));
        m.block_current(TaskState::KbWait, None, 2);
        m.force_wake_scan(3);
        assert_eq!(m.task(Pid(2)).unwrap().state, TaskState::KbWait);
    }

    #[test]
    fn test_all_blocked_idles_then_resumes() {
        let mut m = manager_with(0);
        // Root sleeps with nothing else runnable: CPU goes idle.
        assert!(m.sleep_current(3, 10).is_none());
        assert_eq!(m.current_pid(), None);

        // Ticks pass; at the wake timestamp the sleeper is dispatched.
        assert!(m.tick(11).is_none());
        assert!(m.tick(12).is_none());
        let d = m.tick(13).expect("sleeper resumes");
        assert_eq!(d.next, Pid(1));
        assert_eq!(d.prev, None);
        m.assert_consistent();
    }

    #[test]
    fn test_update_blocked_wakes_child_waiter() {
        let mut m = manager_with(1);
        // Manufacture the parent/child relation directly.
        m.task_mut(Pid(2)).unwrap().parent = Some(Pid(1));
        m.task_mut(Pid(1)).unwrap().children.push(Pid(2));

        let d = m.block_current(TaskState::ChildWait, None, 0);
        assert_eq!(d.expect("worker runs").next, Pid(2));

        // No child exited: the waiter stays blocked across updates.
        m.update_blocked_tasks(1);
        assert_eq!(m.task(Pid(1)).unwrap().state, TaskState::ChildWait);

        // Child exits; the next scan wakes the parent.
        m.exit_current(0, 2);
        assert!(m.task(Pid(1)).unwrap().is_runnable());
        m.assert_consistent();
    }

    #[test]
    fn test_dispatch_reports_directory_switch_only_on_change() {
        extern crate alloc;
        use alloc::boxed::Box;

        use crate::boot::{BootInfo, FramebufferInfo, MemoryRegion, RegionKind};
        use crate::mm::paging::AddressSpace;
        use crate::mm::pmm::Pmm;
        use crate::mm::VirtualAddress;

        let fb = FramebufferInfo {
            address: 0xE000_0000,
            size: 0x0010_0000,
            width: 640,
            height: 480,
            bpp: 32,
        };
        let mut info = BootInfo::new(0x0010_0000, 0x0002_0000, fb);
        info.push_region(MemoryRegion::new(0x0010_0000, 0x0100_0000, RegionKind::Usable))
            .unwrap();
        let mut pmm = Box::new(Pmm::new());
        pmm.init(&info);

        let mut m = manager_with(2);
        m.task_mut(Pid(2)).unwrap().space = Some(
            AddressSpace::new(VirtualAddress::new(0x0040_0000), &mut pmm)
                .expect("pool has frames"),
        );

        // Root (kernel space) -> worker 2 (own directory): switch.
        let d = m.tick(1).expect("worker 2 runs");
        assert_eq!(d.next, Pid(2));
        assert!(d.cr3.is_some());

        // Worker 2 -> worker 3 (kernel space): back to no directory of its
        // own; the decision reports no reload target.
        let d = m.tick(2).expect("worker 3 runs");
        assert_eq!(d.next, Pid(3));
        assert!(d.cr3.is_none());
    }
}
