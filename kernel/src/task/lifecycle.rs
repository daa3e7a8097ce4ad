//! Task lifecycle: creation, fork, exit, kill, wait
//!
//! A task is created (not yet runnable), admitted to ring 0, mutated by
//! the scheduler, becomes a zombie on exit, and is destroyed only once its
//! parent has consumed the exit code through wait. Orphans are reparented
//! to the kernel root task so every zombie always has a reaper.

use alloc::boxed::Box;

use super::scheduler::{SwitchDecision, TaskManager};
use super::tcb::Task;
use super::{Pid, TaskState};
use crate::error::KernelError;
use crate::mm::pmm::Pmm;

/// Exit code recorded for a task killed from outside.
pub const KILLED_EXIT_CODE: i32 = -1;

impl TaskManager {
    fn alloc_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Install the kernel root task and make it the running task. Called
    /// once at boot from the boot stack, which the root task keeps.
    pub fn bootstrap(&mut self, name: &str, now: u64) -> Pid {
        debug_assert!(self.root.is_none(), "tasking bootstrapped twice");
        let pid = self.alloc_pid();
        let mut task = Task::new(name, pid, 0, now);
        task.kernel_stack = None;
        self.tasks.insert(pid, Box::new(task));
        self.root = Some(pid);
        self.current = Some(pid);
        self.dispatched_at = now;
        self.last_boost = now;
        log::info!("tasking: root task {name} (pid {pid})");
        pid
    }

    /// Build a task entering at `entry`. The task is not runnable until
    /// [`Self::add_task`] admits it.
    pub fn create_task(&mut self, name: &str, entry: u32, now: u64) -> Pid {
        let pid = self.alloc_pid();
        let mut task = Task::new(name, pid, entry, now);
        if let Some(cur) = self.current {
            task.parent = Some(cur);
        }
        self.tasks.insert(pid, Box::new(task));
        if let Some(parent) = self.tasks.get(&pid).and_then(|t| t.parent) {
            if let Some(parent_task) = self.tasks.get_mut(&parent) {
                parent_task.children.push(pid);
            }
        }
        pid
    }

    /// Admit a created task to ring 0.
    pub fn add_task(&mut self, pid: Pid) -> Result<(), KernelError> {
        let Some(task) = self.tasks.get_mut(&pid) else {
            return Err(KernelError::TaskNotFound { pid: pid.0 });
        };
        task.state = TaskState::Runnable;
        task.ring = 0;
        self.enqueue(pid, 0);
        Ok(())
    }

    /// Fork the running task.
    ///
    /// The child gets a deep clone of the parent's address space (kernel
    /// half linked, private pages copied), the parent's descriptor tables,
    /// and a copy of the saved context; it is admitted to ring 0 and
    /// recorded as a child of the parent. Returns the child PID, which the
    /// parent observes; the child itself observes 0 from the architecture
    /// fork path. Frame exhaustion is reported, not fatal: the parent
    /// continues without a child.
    pub fn fork_current(&mut self, pmm: &mut Pmm, now: u64) -> Result<Pid, KernelError> {
        let parent_pid = self.current.ok_or(KernelError::NotInitialized {
            subsystem: "tasking",
        })?;

        // Clone the address space first; it is the only fallible step.
        let space = match self.tasks.get(&parent_pid).and_then(|t| t.space.as_ref()) {
            Some(space) => Some(space.clone_directory(pmm)?),
            None => None,
        };

        let child_pid = self.alloc_pid();
        let parent = self
            .tasks
            .get_mut(&parent_pid)
            .ok_or(KernelError::TaskNotFound { pid: parent_pid.0 })?;

        let mut child = Task::new(&parent.name, child_pid, parent.context.eip, now);
        child.space = space;
        child.context = parent.context;
        child.files = parent.files;
        child.pipes = parent.pipes;
        child.next_fd = parent.next_fd;
        child.prog_break = parent.prog_break;
        child.bss_base = parent.bss_base;
        child.parent = Some(parent_pid);

        // Duplicate the parent's kernel stack so the child can unwind the
        // same call chain. The live esp/ebp relocation happens in the
        // architecture fork path; under test the copy alone is observable.
        if let (Some(parent_stack), Some(child_stack)) =
            (parent.kernel_stack.as_ref(), child.kernel_stack.as_mut())
        {
            child_stack.copy_from_slice(parent_stack);
        }

        parent.children.push(child_pid);
        self.tasks.insert(child_pid, Box::new(child));
        self.enqueue(child_pid, 0);

        log::info!("fork: pid {parent_pid} -> child {child_pid}");
        Ok(child_pid)
    }

    /// Terminate the running task and switch away immediately.
    pub fn exit_current(&mut self, code: i32, now: u64) -> Option<SwitchDecision> {
        let cur = self.current?;
        self.make_zombie(cur, code, now);
        self.current = None;
        self.switch_from_exit(now)
    }

    /// Kill an arbitrary task. Killing the running task exits it (and
    /// switches); killing another task reaps it from its ring in place.
    pub fn kill(
        &mut self,
        pid: Pid,
        now: u64,
    ) -> Result<Option<SwitchDecision>, KernelError> {
        if !self.tasks.contains_key(&pid) {
            return Err(KernelError::TaskNotFound { pid: pid.0 });
        }
        if Some(pid) == self.current {
            return Ok(self.exit_current(KILLED_EXIT_CODE, now));
        }
        self.make_zombie(pid, KILLED_EXIT_CODE, now);
        Ok(None)
    }

    /// Common exit path: mark the task a zombie, detach it from scheduler
    /// structures, hand its children to the root task, and wake a parent
    /// blocked in wait.
    fn make_zombie(&mut self, pid: Pid, code: i32, now: u64) {
        let is_current = Some(pid) == self.current;
        if is_current {
            // Final slice of run time.
            let dispatched_at = self.dispatched_at;
            if let Some(task) = self.tasks.get_mut(&pid) {
                task.lifespan += now.saturating_sub(dispatched_at);
            }
        }

        let (ring, children, parent) = {
            let Some(task) = self.tasks.get_mut(&pid) else {
                return;
            };
            task.state = TaskState::Zombie;
            task.exit_code = Some(code);
            task.ended_at = now;
            task.relinquished_at = now;
            (task.ring, core::mem::take(&mut task.children), task.parent)
        };

        self.rings[ring].remove(pid);
        self.responders.purge(pid);

        // Orphans go to the kernel root task.
        if let Some(root) = self.root {
            if root != pid {
                for child in children {
                    if let Some(child_task) = self.tasks.get_mut(&child) {
                        child_task.parent = Some(root);
                    }
                    if let Some(root_task) = self.tasks.get_mut(&root) {
                        root_task.children.push(child);
                    }
                }
            }
        }

        // A parent sleeping in wait() sees the exit immediately.
        if let Some(parent) = parent {
            let parent_waiting = self
                .tasks
                .get(&parent)
                .is_some_and(|t| t.state == TaskState::ChildWait);
            if parent_waiting {
                self.wake(parent);
            }
        }
        log::info!("exit: pid {pid} status {code}");
    }

    /// Successor selection after an exit (current is already cleared).
    fn switch_from_exit(&mut self, now: u64) -> Option<SwitchDecision> {
        self.dispatched_at = now;
        self.tick_idle_dispatch(now)
    }

    fn tick_idle_dispatch(&mut self, now: u64) -> Option<SwitchDecision> {
        // Reuse the idle-CPU path of the tick.
        self.tick(now)
    }

    /// Reap one exited child of the running task.
    ///
    /// `target` narrows the wait to a specific child. Returns the child's
    /// PID and exit code once one has exited, `None` when the caller
    /// should block in `ChildWait` and retry after being woken, or an
    /// error when there is nothing to wait for. Reaping destroys the
    /// child's TCB and returns its private frames to the PMM.
    pub fn try_wait(
        &mut self,
        target: Option<Pid>,
        pmm: &mut Pmm,
    ) -> Result<Option<(Pid, i32)>, KernelError> {
        let cur = self.current.ok_or(KernelError::NotInitialized {
            subsystem: "tasking",
        })?;

        let children = self
            .tasks
            .get(&cur)
            .map(|t| t.children.clone())
            .unwrap_or_default();

        if let Some(target) = target {
            if !children.contains(&target) {
                return Err(KernelError::NoSuchChild { pid: target.0 });
            }
        } else if children.is_empty() {
            return Err(KernelError::NoChildren);
        }

        let exited = children.into_iter().find(|c| {
            (target.is_none() || target == Some(*c))
                && self.tasks.get(c).is_some_and(|t| t.is_zombie())
        });

        let Some(child_pid) = exited else {
            return Ok(None);
        };
        let code = self.reap(child_pid, pmm);
        Ok(Some((child_pid, code)))
    }

    /// Destroy a zombie: drop the TCB and tear down its address space,
    /// returning data, table, and directory frames to the PMM.
    fn reap(&mut self, pid: Pid, pmm: &mut Pmm) -> i32 {
        let mut task = match self.tasks.remove(&pid) {
            Some(task) => task,
            None => return KILLED_EXIT_CODE,
        };
        debug_assert!(task.is_zombie(), "reaped a live task");

        if let Some(parent) = task.parent {
            if let Some(parent_task) = self.tasks.get_mut(&parent) {
                parent_task.children.retain(|&c| c != pid);
            }
        }
        if let Some(space) = task.space.take() {
            space.release(pmm);
        }
        task.exit_code.unwrap_or(KILLED_EXIT_CODE)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::boot::{BootInfo, FramebufferInfo, MemoryRegion, RegionKind};
    use crate::mm::paging::AddressSpace;
    use crate::mm::{PageFlags, VirtualAddress};
    use crate::task::{SchedConfig, SchedPolicy};
    extern crate alloc;
    use alloc::boxed::Box;

    fn test_pmm() -> Box<Pmm> {
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
        pmm
    }

    fn manager() -> TaskManager {
        let mut m = TaskManager::new(SchedConfig::interactive());
        m.bootstrap("kernel-root", 0);
        m
    }

    #[test]
    fn test_bootstrap_creates_running_root() {
        let m = manager();
        assert_eq!(m.current_pid(), Some(Pid(1)));
        assert_eq!(m.root_pid(), Some(Pid(1)));
        assert!(m.current().unwrap().is_runnable());
        m.assert_consistent();
    }

    #[test]
    fn test_create_is_not_runnable_until_added() {
        let mut m = manager();
        let pid = m.create_task("worker", 0x1000, 0);
        assert_eq!(pid, Pid(2));
        // Created but not admitted: in no ring, so the scheduler skips it.
        assert!(m.tick(10).is_none());
        m.add_task(pid).expect("admitting a created task succeeds");
        m.assert_consistent();
        // Parent/child linkage was recorded at creation.
        assert_eq!(m.task(pid).unwrap().parent, Some(Pid(1)));
        assert!(m.task(Pid(1)).unwrap().children.contains(&pid));
    }

    #[test]
    fn test_add_of_unknown_pid_is_reported() {
        let mut m = manager();
        assert_eq!(
            m.add_task(Pid(99)),
            Err(KernelError::TaskNotFound { pid: 99 })
        );
    }

    // The fork/exit/wait reference scenario: parent pid 1 forks child
    // pid 2; the child exits with status 7; the parent's wait returns
    // (2, 7) and the child's TCB is gone.
    #[test]
    fn test_fork_exit_wait_round_trip() {
        let mut pmm = test_pmm();
        let mut m = manager();

        let child = m.fork_current(&mut pmm, 0).expect("fork succeeds");
        assert_eq!(child, Pid(2));
        assert!(m.task(child).unwrap().is_runnable());
        assert_eq!(m.task(child).unwrap().ring, 0);
        assert!(m.task(Pid(1)).unwrap().children.contains(&child));
        m.assert_consistent();

        // Parent yields; the child runs.
        let decision = m.yield_now(1).expect("child takes over");
        assert_eq!(decision.next, child);
        assert_eq!(m.current_pid(), Some(child));

        // Child exits with status 7; the parent is dispatched again.
        let decision = m.exit_current(7, 2).expect("parent resumes");
        assert_eq!(decision.next, Pid(1));
        assert!(m.task(child).unwrap().is_zombie());
        assert_eq!(m.task(child).unwrap().exit_code, Some(7));
        m.assert_consistent();

        // Parent reaps.
        let reaped = m.try_wait(None, &mut pmm).expect("wait succeeds");
        assert_eq!(reaped, Some((child, 7)));
        assert!(m.task(child).is_none());
        assert!(m.task(Pid(1)).unwrap().children.is_empty());
        m.assert_consistent();
    }

    #[test]
    fn test_fork_clones_descriptor_tables_and_space() {
        let mut pmm = test_pmm();
        let mut m = manager();

        // Give the parent an address space with one private page, and an
        // open descriptor.
        let mut space =
            AddressSpace::new(VirtualAddress::new(0x0040_0000), &mut pmm).expect("pool has frames");
        let frame = pmm.alloc();
        space
            .map(
                VirtualAddress::new(0x0800_0000),
                frame,
                PageFlags::PRESENT | PageFlags::WRITABLE,
                &mut pmm,
            )
            .expect("map succeeds");
        m.task_mut(Pid(1)).unwrap().space = Some(space);
        m.task_mut(Pid(1)).unwrap().register_file(42).unwrap();

        let child = m.fork_current(&mut pmm, 5).expect("fork succeeds");
        let child_task = m.task(child).unwrap();

        // Descriptors came along, counter included.
        assert_eq!(child_task.files[0].unwrap().handle, 42);
        assert_eq!(child_task.next_fd, 1);
        assert_eq!(child_task.name, "kernel-root");
        assert_eq!(child_task.created_at, 5);

        // The child's space maps the same page to a different frame.
        let child_map = child_task
            .space
            .as_ref()
            .unwrap()
            .translate(VirtualAddress::new(0x0800_0000))
            .unwrap();
        assert_ne!(child_map.frame, frame);
    }

    #[test]
    fn test_fork_reports_frame_exhaustion() {
        let fb = FramebufferInfo {
            address: 0xE000_0000,
            size: 0x0010_0000,
            width: 640,
            height: 480,
            bpp: 32,
        };
        // Room for the parent's structures only: its directory, one page
        // table, and one private frame. The clone's first claim fails.
        let mut info = BootInfo::new(0x0010_0000, 0x0002_0000, fb);
        info.push_region(MemoryRegion::new(0x0022_0000, 0x3000, RegionKind::Usable))
            .unwrap();
        let mut pmm = Box::new(Pmm::new());
        pmm.init(&info);

        let mut m = manager();
        let mut space =
            AddressSpace::new(VirtualAddress::new(0x0040_0000), &mut pmm).expect("pool has frames");
        let frame = pmm.alloc();
        space
            .map(
                VirtualAddress::new(0x0800_0000),
                frame,
                PageFlags::PRESENT | PageFlags::WRITABLE,
                &mut pmm,
            )
            .expect("map succeeds");
        m.task_mut(Pid(1)).unwrap().space = Some(space);

        let err = m.fork_current(&mut pmm, 0).unwrap_err();
        assert!(matches!(err, KernelError::OutOfMemory { .. }));
        // The parent continues: still current, no child recorded.
        assert_eq!(m.current_pid(), Some(Pid(1)));
        assert!(m.task(Pid(1)).unwrap().children.is_empty());
        m.assert_consistent();
    }

    #[test]
    fn test_reap_returns_address_space_frames() {
        let mut pmm = test_pmm();
        let mut m = manager();
        let mut space =
            AddressSpace::new(VirtualAddress::new(0x0040_0000), &mut pmm).expect("pool has frames");
        let frame = pmm.alloc();
        space
            .map(
                VirtualAddress::new(0x0800_0000),
                frame,
                PageFlags::PRESENT | PageFlags::WRITABLE,
                &mut pmm,
            )
            .expect("map succeeds");
        m.task_mut(Pid(1)).unwrap().space = Some(space);

        let before_fork = pmm.allocated_count();
        let child = m.fork_current(&mut pmm, 0).expect("fork succeeds");
        // The clone claimed its directory, one table, and one data frame.
        assert_eq!(pmm.allocated_count(), before_fork + 3);

        // Reaping the child hands all three back.
        m.kill(child, 1).unwrap();
        assert_eq!(
            m.try_wait(Some(child), &mut pmm).unwrap(),
            Some((child, KILLED_EXIT_CODE))
        );
        assert_eq!(pmm.allocated_count(), before_fork);
        m.assert_consistent();
    }

    #[test]
    fn test_wait_blocks_until_child_exits() {
        let mut pmm = test_pmm();
        let mut m = manager();
        let child = m.fork_current(&mut pmm, 0).unwrap();

        // Nothing exited yet: the caller should block.
        assert_eq!(m.try_wait(None, &mut pmm).unwrap(), None);
        let decision = m
            .block_current(TaskState::ChildWait, None, 1)
            .expect("child is runnable");
        assert_eq!(decision.next, child);

        // Child exits; the waiting parent is woken into ring 0.
        m.exit_current(3, 2);
        assert!(m.task(Pid(1)).unwrap().is_runnable());
        assert_eq!(m.task(Pid(1)).unwrap().ring, 0);
        m.assert_consistent();

        // Parent resumes and reaps.
        assert_eq!(m.current_pid(), Some(Pid(1)));
        assert_eq!(m.try_wait(None, &mut pmm).unwrap(), Some((child, 3)));
    }

    #[test]
    fn test_waitpid_for_specific_child() {
        let mut pmm = test_pmm();
        let mut m = manager();
        let a = m.fork_current(&mut pmm, 0).unwrap();
        let b = m.fork_current(&mut pmm, 0).unwrap();

        // Kill b; waiting specifically for a still blocks.
        m.kill(b, 1).unwrap();
        assert_eq!(m.try_wait(Some(a), &mut pmm).unwrap(), None);
        // Waiting for b reaps it.
        assert_eq!(
            m.try_wait(Some(b), &mut pmm).unwrap(),
            Some((b, KILLED_EXIT_CODE))
        );
        m.assert_consistent();
    }

    #[test]
    fn test_wait_errors() {
        let mut pmm = test_pmm();
        let mut m = manager();
        assert_eq!(m.try_wait(None, &mut pmm), Err(KernelError::NoChildren));
        assert_eq!(
            m.try_wait(Some(Pid(42)), &mut pmm),
            Err(KernelError::NoSuchChild { pid: 42 })
        );
    }

    #[test]
    fn test_zombie_persists_until_reaped() {
        let mut pmm = test_pmm();
        let mut m = manager();
        let child = m.fork_current(&mut pmm, 0).unwrap();
        m.kill(child, 1).unwrap();

        // The TCB outlives the kill until the parent consumes the status.
        assert!(m.task(child).unwrap().is_zombie());
        m.tick(2);
        m.tick(3);
        assert!(m.task(child).is_some());
        assert_eq!(
            m.try_wait(None, &mut pmm).unwrap(),
            Some((child, KILLED_EXIT_CODE))
        );
        assert!(m.task(child).is_none());
    }

    #[test]
    fn test_kill_of_running_task_switches_immediately() {
        let mut pmm = test_pmm();
        let mut m = manager();
        let child = m.fork_current(&mut pmm, 0).unwrap();
        let decision = m.yield_now(1).unwrap();
        assert_eq!(decision.next, child);

        // Killing the running child hands the CPU back at once.
        let decision = m.kill(child, 2).unwrap().expect("switch happens");
        assert_eq!(decision.next, Pid(1));
        assert!(m.task(child).unwrap().is_zombie());
        m.assert_consistent();
    }

    #[test]
    fn test_exit_reparents_children_to_root() {
        let mut pmm = test_pmm();
        let mut m = manager();

        // root forks a; a runs and forks b; a exits.
        let a = m.fork_current(&mut pmm, 0).unwrap();
        let decision = m.yield_now(1).unwrap();
        assert_eq!(decision.next, a);
        let b = m.fork_current(&mut pmm, 1).unwrap();
        m.exit_current(0, 2);

        // b now belongs to the root task.
        assert_eq!(m.task(b).unwrap().parent, Some(Pid(1)));
        assert!(m.task(Pid(1)).unwrap().children.contains(&b));
        m.assert_consistent();

        // The root can reap both in turn.
        let first = m.try_wait(Some(a), &mut pmm).unwrap();
        assert_eq!(first, Some((a, 0)));
        assert_eq!(m.task(b).unwrap().parent, Some(Pid(1)));
    }

    #[test]
    fn test_exit_purges_responder_entries() {
        let mut pmm = test_pmm();
        let mut m = manager();
        let child = m.fork_current(&mut pmm, 0).unwrap();
        let decision = m.yield_now(1).unwrap();
        assert_eq!(decision.next, child);
        m.become_first_responder();
        assert_eq!(m.first_responder(), Some(child));

        m.exit_current(0, 2);
        assert_eq!(m.first_responder(), None);
        m.assert_consistent();
    }

    #[test]
    fn test_lifespan_accumulates_run_time() {
        let mut pmm = test_pmm();
        let mut m = manager();
        let child = m.fork_current(&mut pmm, 0).unwrap();

        // Parent runs ticks 0..5, then yields.
        let decision = m.yield_now(5).unwrap();
        assert_eq!(decision.next, child);
        assert_eq!(m.task(Pid(1)).unwrap().lifespan, 5);
        assert_eq!(m.task(Pid(1)).unwrap().relinquished_at, 5);

        // Child runs 5..12, then exits; its final slice is recorded.
        m.exit_current(0, 12);
        assert_eq!(m.task(child).unwrap().lifespan, 7);
        assert_eq!(m.task(child).unwrap().ended_at, 12);
    }

    #[test]
    fn test_low_latency_single_ring() {
        let mut m = TaskManager::new(SchedConfig::interactive());
        m.set_config(SchedConfig::low_latency());
        assert_eq!(m.config().rings, 1);
        assert_eq!(m.config().policy, SchedPolicy::LowLatency);
        m.bootstrap("kernel-root", 0);

        let a = m.create_task("a", 0, 0);
        m.add_task(a).unwrap();

        // Quantum expiry rotates round-robin without demotion.
        let decision = m.tick(1).expect("rotation happens");
        assert_eq!(decision.next, a);
        assert_eq!(m.task(a).unwrap().ring, 0);
        assert_eq!(m.task(Pid(1)).unwrap().ring, 0);
    }
}
