//! First-responder stack
//!
//! LIFO of tasks entitled to keyboard and mouse input; only the task on
//! top is woken by input events. The scheduler purges a task's entries
//! when it dies, so the top never refers to a zombie.

use alloc::vec::Vec;

use super::Pid;

pub struct ResponderStack {
    stack: Vec<Pid>,
}

impl ResponderStack {
    pub const fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Make `pid` the first responder.
    pub fn push(&mut self, pid: Pid) {
        self.stack.push(pid);
    }

    /// Relinquish first-responder status. A task that is not on top
    /// resigns nothing (silent no-op); the previous holder resumes.
    pub fn resign(&mut self, pid: Pid) -> bool {
        if self.stack.last() == Some(&pid) {
            self.stack.pop();
            true
        } else {
            false
        }
    }

    /// The current first responder.
    pub fn top(&self) -> Option<Pid> {
        self.stack.last().copied()
    }

    pub fn is_top(&self, pid: Pid) -> bool {
        self.top() == Some(pid)
    }

    /// Drop every entry for a task (called when it dies).
    pub fn purge(&mut self, pid: Pid) {
        self.stack.retain(|&p| p != pid);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

impl Default for ResponderStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_order() {
        let mut r = ResponderStack::new();
        assert_eq!(r.top(), None);
        r.push(Pid(1));
        r.push(Pid(2));
        assert!(r.is_top(Pid(2)));
        assert!(r.resign(Pid(2)));
        assert!(r.is_top(Pid(1)));
    }

    #[test]
    fn test_resign_when_not_top_is_noop() {
        let mut r = ResponderStack::new();
        r.push(Pid(1));
        r.push(Pid(2));
        assert!(!r.resign(Pid(1)));
        assert_eq!(r.len(), 2);
        assert!(r.is_top(Pid(2)));
    }

    #[test]
    fn test_purge_removes_buried_entries() {
        let mut r = ResponderStack::new();
        r.push(Pid(1));
        r.push(Pid(2));
        r.push(Pid(1));
        r.purge(Pid(1));
        assert_eq!(r.len(), 1);
        assert!(r.is_top(Pid(2)));
    }
}
