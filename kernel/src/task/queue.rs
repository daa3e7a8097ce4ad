//! Ready queue for one scheduler ring

use super::Pid;

/// Maximum runnable tasks per ring.
pub const QUEUE_CAPACITY: usize = 64;

/// Fixed-capacity circular queue of PIDs.
///
/// Queues hold indices into the task table, never task ownership; a PID in
/// a queue is a claim that the task is runnable, checked lazily when it is
/// dequeued.
pub struct RunQueue {
    slots: [Option<Pid>; QUEUE_CAPACITY],
    head: usize,
    tail: usize,
    count: usize,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            slots: [None; QUEUE_CAPACITY],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == QUEUE_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Append a PID; false if the ring is full.
    pub fn enqueue(&mut self, pid: Pid) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots[self.tail] = Some(pid);
        self.tail = (self.tail + 1) % QUEUE_CAPACITY;
        self.count += 1;
        true
    }

    /// Pop the PID that has waited longest.
    pub fn dequeue(&mut self) -> Option<Pid> {
        if self.is_empty() {
            return None;
        }
        let pid = self.slots[self.head].take();
        self.head = (self.head + 1) % QUEUE_CAPACITY;
        self.count -= 1;
        pid
    }

    /// Remove a specific PID, preserving the order of the rest.
    /// Returns false when the PID was not queued (idempotent).
    pub fn remove(&mut self, target: Pid) -> bool {
        if self.is_empty() {
            return false;
        }

        let mut found = false;
        let mut kept = [None; QUEUE_CAPACITY];
        let mut kept_count = 0;

        let mut idx = self.head;
        for _ in 0..self.count {
            if let Some(pid) = self.slots[idx] {
                if pid == target {
                    found = true;
                } else {
                    kept[kept_count] = Some(pid);
                    kept_count += 1;
                }
            }
            idx = (idx + 1) % QUEUE_CAPACITY;
        }

        if found {
            self.slots = kept;
            self.head = 0;
            self.tail = kept_count % QUEUE_CAPACITY;
            self.count = kept_count;
        }

        found
    }

    pub fn contains(&self, target: Pid) -> bool {
        self.iter().any(|pid| pid == target)
    }

    /// Queue contents in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        (0..self.count).filter_map(move |i| self.slots[(self.head + i) % QUEUE_CAPACITY])
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}
