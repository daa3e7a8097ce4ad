//! Task management
//!
//! Task control blocks, the multilevel-feedback-queue scheduler, blocking
//! and wake primitives, the responder stack, and the fork/exit/wait
//! lifecycle. All mutable state lives in one [`TaskManager`] owned by the
//! kernel root and reached through the [`with_manager`] accessor, which
//! masks interrupts for the duration of the access: the queues and the
//! responder stack are touched from the timer IRQ as well as task context.

mod lifecycle;
mod queue;
mod responder;
mod scheduler;
mod tcb;

pub use queue::{RunQueue, QUEUE_CAPACITY};
pub use responder::ResponderStack;
pub use scheduler::{SchedConfig, SwitchDecision, TaskManager, MAX_RINGS};
pub use tcb::{Context, FileSlot, PipeSlot, Task, KERNEL_STACK_SIZE};

use core::fmt;

use spin::Mutex;

use crate::sync::hold_interrupts;

/// Process identifier. Monotonic; a u32 never wraps in this kernel's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible to run; present in exactly one MLFQ ring.
    Runnable,
    /// Exited but not yet reaped by the parent.
    Zombie,
    /// Blocked until a keystroke arrives for this task.
    KbWait,
    /// Blocked until the wake timestamp passes.
    PitWait,
    /// Blocked until a mouse event arrives for this task.
    MouseWait,
    /// Blocked until a child exits.
    ChildWait,
}

impl TaskState {
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            TaskState::KbWait | TaskState::PitWait | TaskState::MouseWait | TaskState::ChildWait
        )
    }
}

/// Scheduler behavior selected at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// One shared ring, round-robin: minimal latency between tasks.
    LowLatency,
    /// Several rings with demotion and periodic boost: interactive tasks
    /// dominate CPU-bound ones.
    Interactive,
}

/// Global task manager instance.
static TASK_MANAGER: Mutex<TaskManager> = Mutex::new(TaskManager::new(SchedConfig::interactive()));

/// Run `f` with exclusive, interrupt-masked access to the task manager.
pub fn with_manager<R>(f: impl FnOnce(&mut TaskManager) -> R) -> R {
    let _guard = hold_interrupts();
    f(&mut TASK_MANAGER.lock())
}

/// Install tasking: apply the scheduler configuration, create the kernel
/// root task on the boot stack, and (on hardware) hook the scheduler to
/// the timer vector and start the idle task.
pub fn init(config: SchedConfig, root_name: &str) -> Pid {
    let now = crate::timer::ticks();
    let root = with_manager(|m| {
        m.set_config(config);
        m.bootstrap(root_name, now)
    });

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        crate::interrupts::register_handler(crate::interrupts::VECTOR_TIMER, switch::timer_tick);
        // The idle task keeps pick-next total: blocking always has a
        // successor to switch to.
        let idle = with_manager(|m| m.create_task("idle", switch::idle_entry as u32, now));
        with_manager(|m| m.add_task(idle)).ok();
    }

    root
}

/// Keyboard driver entry point: input is available; wake the first
/// responder if it is waiting on the keyboard.
pub fn keyboard_event() {
    let now = crate::timer::ticks();
    with_manager(|m| {
        m.signal_keyboard();
        m.force_wake_scan(now);
    });
}

/// Mouse driver entry point.
pub fn mouse_event() {
    let now = crate::timer::ticks();
    with_manager(|m| {
        m.signal_mouse();
        m.force_wake_scan(now);
    });
}

/// PID and name of the running task, for the panic path. Never blocks: a
/// panic inside the scheduler must still get a report out.
pub fn panic_context() -> Option<(Pid, [u8; 32])> {
    let manager = TASK_MANAGER.try_lock()?;
    let task = manager.current()?;
    let mut name = [0u8; 32];
    let bytes = task.name.as_bytes();
    let take = bytes.len().min(name.len());
    name[..take].copy_from_slice(&bytes[..take]);
    Some((task.pid, name))
}

// ---------------------------------------------------------------------------
// Bare-metal glue: context switching and the timer hook
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod switch {
    use spin::Mutex;

    use super::*;
    use crate::arch::x86::context::{current_ebp, current_esp, jump_to, read_eip, RESUME_SENTINEL};

    /// Deferred switch decision taken inside the timer IRQ; performed
    /// after the end-of-interrupt signal.
    static PENDING: Mutex<Option<SwitchDecision>> = Mutex::new(None);

    /// Timer IRQ body: bump the tick counter and record any preemption
    /// decision for after EOI.
    pub fn timer_tick(_frame: &mut crate::interrupts::InterruptFrame) {
        let now = crate::timer::record_tick();
        let decision = with_manager(|m| m.tick(now));
        *PENDING.lock() = decision;
    }

    /// Called by the trap stub after EOI: complete a deferred preemption.
    pub fn run_pending_switch() {
        let decision = PENDING.lock().take();
        if let Some(decision) = decision {
            perform_switch(decision);
        }
    }

    /// Voluntarily give up the CPU, staying in the current ring.
    pub fn yield_now() {
        let now = crate::timer::ticks();
        if let Some(decision) = with_manager(|m| m.yield_now(now)) {
            perform_switch(decision);
        }
    }

    /// Sleep for at least `ms` milliseconds (tick resolution).
    pub fn sleep(ms: u64) {
        let ticks = crate::timer::ticks_for_ms(ms);
        let now = crate::timer::ticks();
        if let Some(decision) = with_manager(|m| m.sleep_current(ticks, now)) {
            perform_switch(decision);
        }
    }

    /// Entry point of the idle task: wait for the next interrupt, forever.
    pub extern "C" fn idle_entry() -> ! {
        loop {
            // SAFETY: sti+hlt in ring 0; the timer wakes us to reschedule.
            unsafe {
                crate::arch::enable_interrupts();
                core::arch::asm!("hlt");
            }
        }
    }

    /// Fork the running task.
    ///
    /// Returns the child PID in the parent and 0 in the child (the child
    /// resumes at the capture point below and takes the sentinel branch).
    /// On failure the parent gets a negative indicator and continues.
    pub fn fork() -> i32 {
        let now = crate::timer::ticks();

        let child = {
            let mut pmm = crate::mm::pmm::PMM.lock();
            match with_manager(|m| m.fork_current(&mut pmm, now)) {
                Ok(child) => child,
                Err(err) => {
                    log::warn!("fork failed: {err}");
                    return -1;
                }
            }
        };

        // Capture the live context for the child. The child's copied stack
        // sits at a different base, so the saved pointers are rebased.
        let esp = current_esp();
        let ebp = current_ebp();
        let eip = read_eip();
        if eip == RESUME_SENTINEL {
            // We are the child, scheduled for the first time.
            return 0;
        }

        with_manager(|m| {
            let parent_base = m
                .current_pid()
                .and_then(|p| m.task(p))
                .and_then(|t| t.kernel_stack.as_ref())
                .map(|s| s.as_ptr() as usize as u32);
            if let (Some(parent_base), Some(task)) = (parent_base, m.task_mut(child)) {
                if let Some(child_stack) = task.kernel_stack.as_ref() {
                    let delta = (child_stack.as_ptr() as usize as u32).wrapping_sub(parent_base);
                    task.context = Context {
                        esp: esp.wrapping_add(delta),
                        ebp: ebp.wrapping_add(delta),
                        eip,
                    };
                }
            }
        });

        child.0 as i32
    }

    /// Suspend until a child exits; returns its PID and exit code.
    pub fn wait() -> Result<(Pid, i32), crate::KernelError> {
        waitpid(None)
    }

    /// Suspend until the given child (or any, for `None`) exits.
    pub fn waitpid(target: Option<Pid>) -> Result<(Pid, i32), crate::KernelError> {
        loop {
            let reaped = {
                let mut pmm = crate::mm::pmm::PMM.lock();
                with_manager(|m| m.try_wait(target, &mut pmm))?
            };
            if let Some(result) = reaped {
                return Ok(result);
            }

            // Nothing to reap yet: block and retry once woken.
            let now = crate::timer::ticks();
            let decision =
                with_manager(|m| m.block_current(TaskState::ChildWait, None, now));
            if let Some(decision) = decision {
                perform_switch(decision);
            }
        }
    }

    /// Terminate the running task. Never returns: a zombie is not
    /// schedulable.
    pub fn exit(code: i32) -> ! {
        let now = crate::timer::ticks();
        if let Some(decision) = with_manager(|m| m.exit_current(code, now)) {
            perform_switch(decision);
        }
        crate::arch::halt_loop()
    }

    /// Kill an arbitrary task; killing the running task switches away
    /// immediately.
    pub fn kill(pid: Pid) -> Result<(), crate::KernelError> {
        let now = crate::timer::ticks();
        let decision = with_manager(|m| m.kill(pid, now))?;
        if let Some(decision) = decision {
            perform_switch(decision);
        }
        Ok(())
    }

    /// Execute a switch decision: checkpoint the outgoing task and resume
    /// the incoming one.
    ///
    /// The outgoing task's saved instruction pointer is the address
    /// `read_eip` returns, immediately after its own call site; when the
    /// task is switched back in it resumes there with the sentinel in eax
    /// and simply returns.
    pub fn perform_switch(decision: SwitchDecision) {
        let _guard = crate::sync::hold_interrupts();

        let prev_ctx = with_manager(|m| m.context_ptr(decision.prev));

        let eip = read_eip();
        if eip == RESUME_SENTINEL {
            // We are the incoming task, freshly resumed.
            return;
        }

        if let Some(prev_ctx) = prev_ctx {
            // SAFETY: TCBs are boxed and never move; the pointer was taken
            // under the manager lock and interrupts are masked, so the TCB
            // cannot be reaped while we store into it.
            unsafe {
                (*prev_ctx).esp = current_esp();
                (*prev_ctx).ebp = current_ebp();
                (*prev_ctx).eip = eip;
            }
        }

        // SAFETY: The incoming context was saved by this same routine (or
        // built by task creation), and its directory is a live address
        // space owned by the incoming task.
        unsafe {
            jump_to(
                decision.esp,
                decision.ebp,
                decision.eip,
                decision.cr3.map_or(0, |d| d.as_u32()),
            );
        }
    }
}
