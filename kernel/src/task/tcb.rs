//! Task control block

use alloc::boxed::Box;
use alloc::string::String;
use alloc::string::ToString;
use alloc::vec::Vec;

use super::{Pid, TaskState};
use crate::mm::paging::AddressSpace;

/// Kernel stack size per task.
pub const KERNEL_STACK_SIZE: usize = 8 * 1024;

/// File descriptor slots per task.
pub const MAX_TASK_FILES: usize = 16;

/// Pipe slots per task.
pub const MAX_TASK_PIPES: usize = 8;

/// A file open in this task's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlot {
    /// Descriptor handed to the task.
    pub fd: u32,
    /// Opaque handle owned by the filesystem layer.
    pub handle: u32,
}

/// A pipe endpoint in this task's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeSlot {
    /// Descriptor handed to the task.
    pub fd: u32,
    /// Opaque pipe identifier owned by the IPC layer.
    pub pipe: u32,
}

/// Saved execution context: what the switch routine checkpoints.
///
/// `eip` is always the return address produced inside the switch routine
/// itself, so a resumed task returns into the switch's epilogue (or, for a
/// forked child, into the fork routine's child path, which returns 0).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub esp: u32,
    pub ebp: u32,
    pub eip: u32,
}

impl Context {
    /// Context for a task that has never run: it enters at `entry` on a
    /// fresh stack.
    pub fn initial(entry: u32, stack_top: u32) -> Self {
        Self {
            esp: stack_top,
            ebp: stack_top,
            eip: entry,
        }
    }
}

/// Task control block (TCB)
pub struct Task {
    /// User-printable task name.
    pub name: String,
    /// Process ID.
    pub pid: Pid,
    /// MLFQ ring this task is slotted in.
    pub ring: usize,
    /// Current state.
    pub state: TaskState,
    /// Tick at which to wake; meaningful only in `PitWait`.
    pub wake_timestamp: u64,
    /// Tick of creation.
    pub created_at: u64,
    /// Tick of exit; meaningful only once `Zombie`.
    pub ended_at: u64,
    /// Tick at which the task last gave up the CPU.
    pub relinquished_at: u64,
    /// Accumulated run time in ticks.
    pub lifespan: u64,
    /// Saved execution context.
    pub context: Context,
    /// Kernel stack backing; the boot task keeps the boot stack.
    pub kernel_stack: Option<Box<[u8]>>,
    /// Owning address space; kernel-resident tasks share the kernel's.
    pub space: Option<AddressSpace>,
    /// Open file slots.
    pub files: [Option<FileSlot>; MAX_TASK_FILES],
    /// Open pipe slots.
    pub pipes: [Option<PipeSlot>; MAX_TASK_PIPES],
    /// Next descriptor to hand out; monotonically increasing.
    pub next_fd: u32,
    /// Program break (top of the data segment); loaded tasks only.
    pub prog_break: u32,
    /// Base of the BSS segment; loaded tasks only.
    pub bss_base: u32,
    /// Parent task, resolved through the task table by PID.
    pub parent: Option<Pid>,
    /// Children spawned by fork, reaped by wait.
    pub children: Vec<Pid>,
    /// Exit status; meaningful only once `Zombie`.
    pub exit_code: Option<i32>,
    /// Opaque context stored by whoever blocked this task.
    pub block_context: Option<usize>,
}

impl Task {
    /// Build a TCB. The task is not runnable until the scheduler admits it.
    pub fn new(name: &str, pid: Pid, entry: u32, now: u64) -> Self {
        let kernel_stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let stack_top =
            (kernel_stack.as_ptr() as usize as u32).wrapping_add(KERNEL_STACK_SIZE as u32);
        Self {
            name: name.to_string(),
            pid,
            ring: 0,
            state: TaskState::Runnable,
            wake_timestamp: 0,
            created_at: now,
            ended_at: 0,
            relinquished_at: now,
            lifespan: 0,
            context: Context::initial(entry, stack_top),
            kernel_stack: Some(kernel_stack),
            space: None,
            files: [None; MAX_TASK_FILES],
            pipes: [None; MAX_TASK_PIPES],
            next_fd: 0,
            prog_break: 0,
            bss_base: 0,
            parent: None,
            children: Vec::new(),
            exit_code: None,
            block_context: None,
        }
    }

    /// Register a file in the slot table, assigning the next descriptor.
    pub fn register_file(&mut self, handle: u32) -> Option<u32> {
        let slot = self.files.iter_mut().find(|s| s.is_none())?;
        let fd = self.next_fd;
        self.next_fd += 1;
        *slot = Some(FileSlot { fd, handle });
        Some(fd)
    }

    /// Register a pipe endpoint, assigning the next descriptor.
    pub fn register_pipe(&mut self, pipe: u32) -> Option<u32> {
        let slot = self.pipes.iter_mut().find(|s| s.is_none())?;
        let fd = self.next_fd;
        self.next_fd += 1;
        *slot = Some(PipeSlot { fd, pipe });
        Some(fd)
    }

    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Runnable
    }

    pub fn is_zombie(&self) -> bool {
        self.state == TaskState::Zombie
    }
}
