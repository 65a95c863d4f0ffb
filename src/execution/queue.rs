//! Command Queue - priority queue for venue commands

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::command::{Command, CommandKind, CommandPriority, CommandStatus, CommandTarget};
use crate::error::CommandError;

/// Wraps a command for priority ordering
#[derive(Debug)]
struct PrioritizedCommand {
    command: Command,
    sequence: u64, // FIFO within a priority tier
    /// Retry backoff: not dispatchable before this instant
    ready_at: Option<Instant>,
}

impl PartialEq for PrioritizedCommand {
    fn eq(&self, other: &Self) -> bool {
        self.command.priority == other.command.priority && self.sequence == other.sequence
    }
}

impl Eq for PrioritizedCommand {}

impl PartialOrd for PrioritizedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedCommand {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower priority value first (Critical=0 > High=1 > Normal=2 > Low=3)
        match other.command.priority.cmp(&self.command.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

/// Priority queue drained by the single execution worker
pub struct CommandQueue {
    heap: BinaryHeap<PrioritizedCommand>,
    sequence_counter: u64,
    max_size: usize,
    enqueued_count: u64,
    dequeued_count: u64,
    cancelled_count: u64,
}

impl CommandQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            sequence_counter: 0,
            max_size,
            enqueued_count: 0,
            dequeued_count: 0,
            cancelled_count: 0,
        }
    }

    /// Enqueue a command.
    ///
    /// Critical commands are always admitted; anything else is refused
    /// when the queue is full rather than displacing queued work.
    pub fn enqueue(&mut self, command: Command) -> Result<(), CommandError> {
        self.enqueue_at(command, None)
    }

    /// Enqueue a command that may not dispatch before `ready_at`
    pub fn enqueue_at(&mut self, mut command: Command, ready_at: Option<Instant>) -> Result<(), CommandError> {
        if self.heap.len() >= self.max_size && command.priority != CommandPriority::Critical {
            warn!(
                "Queue full ({}), refusing {} for {}",
                self.max_size, command.kind, command.target
            );
            return Err(CommandError::QueueFull {
                capacity: self.max_size,
            });
        }

        command.status = CommandStatus::Queued;
        let sequence = self.sequence_counter;
        self.sequence_counter += 1;

        debug!(
            "Enqueuing command {} ({} {}) with priority {}",
            command.id, command.kind, command.target, command.priority
        );

        self.heap.push(PrioritizedCommand {
            command,
            sequence,
            ready_at,
        });
        self.enqueued_count += 1;
        Ok(())
    }

    /// Take the most urgent command that is ready at `now`
    pub fn dequeue_ready(&mut self, now: Instant) -> Option<Command> {
        let mut deferred = Vec::new();
        let mut found = None;
        while let Some(item) = self.heap.pop() {
            if item.ready_at.map(|t| t > now).unwrap_or(false) {
                deferred.push(item);
                continue;
            }
            found = Some(item.command);
            break;
        }
        for item in deferred {
            self.heap.push(item);
        }
        if found.is_some() {
            self.dequeued_count += 1;
        }
        found
    }

    /// Earliest instant at which a deferred command becomes ready
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.heap.iter().filter_map(|i| i.ready_at).min()
    }

    pub fn peek(&self) -> Option<&Command> {
        self.heap.peek().map(|p| &p.command)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Whether a command for `kind`/`target` at least as urgent as
    /// `priority` is queued
    pub fn contains(&self, kind: CommandKind, target: &CommandTarget, priority: CommandPriority) -> bool {
        self.heap.iter().any(|i| {
            i.command.kind == kind && &i.command.target == target && i.command.priority <= priority
        })
    }

    /// Remove every command less urgent than `priority`, in dispatch order
    pub fn drain_below(&mut self, priority: CommandPriority) -> Vec<Command> {
        let items: Vec<_> = std::mem::take(&mut self.heap).into_sorted_vec();
        let mut drained = Vec::new();

        // into_sorted_vec is ascending; the most urgent item is last.
        for item in items.into_iter().rev() {
            if item.command.priority > priority {
                drained.push(item.command);
            } else {
                self.heap.push(item);
            }
        }
        self.cancelled_count += drained.len() as u64;
        if !drained.is_empty() {
            debug!("Drained {} commands below {}", drained.len(), priority);
        }
        drained
    }

    /// Snapshot of queued commands in dispatch order
    pub fn snapshot(&self) -> Vec<Command> {
        let mut items: Vec<&PrioritizedCommand> = self.heap.iter().collect();
        items.sort_by(|a, b| b.cmp(a));
        items.into_iter().map(|i| i.command.clone()).collect()
    }

    pub fn stats(&self) -> QueueStats {
        let mut priority_counts = [0usize; 4];
        for item in self.heap.iter() {
            let idx = item.command.priority as usize;
            if idx < 4 {
                priority_counts[idx] += 1;
            }
        }

        QueueStats {
            current_size: self.heap.len(),
            max_size: self.max_size,
            enqueued_total: self.enqueued_count,
            dequeued_total: self.dequeued_count,
            cancelled_total: self.cancelled_count,
            critical_count: priority_counts[0],
            high_count: priority_counts[1],
            normal_count: priority_counts[2],
            low_count: priority_counts[3],
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub current_size: usize,
    pub max_size: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub cancelled_total: u64,
    pub critical_count: usize,
    pub high_count: usize,
    pub normal_count: usize,
    pub low_count: usize,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Queue[{}/{}, enq={}, deq={}, cxl={}, C={}/H={}/N={}/L={}]",
            self.current_size,
            self.max_size,
            self.enqueued_total,
            self.dequeued_total,
            self.cancelled_total,
            self.critical_count,
            self.high_count,
            self.normal_count,
            self.low_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cmd(level: &str, priority: CommandPriority) -> Command {
        Command::new(
            CommandKind::ActivateLevel,
            priority,
            CommandTarget::Level(level.into()),
        )
    }

    fn level_of(c: Command) -> String {
        c.level_id().unwrap_or_default().to_string()
    }

    #[test]
    fn test_priority_ordering() {
        let mut queue = CommandQueue::new(100);
        let now = Instant::now();

        queue.enqueue(cmd("a1", CommandPriority::Normal)).unwrap();
        queue.enqueue(cmd("a2", CommandPriority::Low)).unwrap();
        queue.enqueue(cmd("a3", CommandPriority::Critical)).unwrap();
        queue.enqueue(cmd("a4", CommandPriority::High)).unwrap();

        assert_eq!(level_of(queue.dequeue_ready(now).unwrap()), "a3");
        assert_eq!(level_of(queue.dequeue_ready(now).unwrap()), "a4");
        assert_eq!(level_of(queue.dequeue_ready(now).unwrap()), "a1");
        assert_eq!(level_of(queue.dequeue_ready(now).unwrap()), "a2");
    }

    #[test]
    fn test_fifo_same_priority() {
        let mut queue = CommandQueue::new(100);
        let now = Instant::now();

        queue.enqueue(cmd("first", CommandPriority::Normal)).unwrap();
        queue.enqueue(cmd("second", CommandPriority::Normal)).unwrap();
        queue.enqueue(cmd("third", CommandPriority::Normal)).unwrap();

        assert_eq!(level_of(queue.dequeue_ready(now).unwrap()), "first");
        assert_eq!(level_of(queue.dequeue_ready(now).unwrap()), "second");
        assert_eq!(level_of(queue.dequeue_ready(now).unwrap()), "third");
    }

    #[test]
    fn test_queue_full_admits_only_critical() {
        let mut queue = CommandQueue::new(2);

        queue.enqueue(cmd("a1", CommandPriority::Normal)).unwrap();
        queue.enqueue(cmd("a2", CommandPriority::Normal)).unwrap();
        assert!(queue.enqueue(cmd("a3", CommandPriority::High)).is_err());

        queue.enqueue(Command::emergency_stop()).unwrap();
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_deferred_commands_wait() {
        let mut queue = CommandQueue::new(10);
        let now = Instant::now();
        queue
            .enqueue_at(cmd("later", CommandPriority::Critical), Some(now + Duration::from_secs(2)))
            .unwrap();
        queue.enqueue(cmd("now", CommandPriority::Low)).unwrap();

        assert_eq!(level_of(queue.dequeue_ready(now).unwrap()), "now");
        assert!(queue.dequeue_ready(now).is_none());
        assert_eq!(queue.next_ready_at(), Some(now + Duration::from_secs(2)));
        assert_eq!(
            level_of(queue.dequeue_ready(now + Duration::from_secs(2)).unwrap()),
            "later"
        );
    }

    #[test]
    fn test_contains_respects_urgency() {
        let mut queue = CommandQueue::new(10);
        queue.enqueue(cmd("L1", CommandPriority::Normal)).unwrap();
        let target = CommandTarget::Level("L1".into());
        assert!(queue.contains(CommandKind::ActivateLevel, &target, CommandPriority::Normal));
        assert!(queue.contains(CommandKind::ActivateLevel, &target, CommandPriority::Low));
        assert!(!queue.contains(CommandKind::ActivateLevel, &target, CommandPriority::Critical));
    }

    #[test]
    fn test_drain_below_keeps_critical() {
        let mut queue = CommandQueue::new(10);
        queue.enqueue(cmd("n", CommandPriority::Normal)).unwrap();
        queue.enqueue(Command::emergency_stop()).unwrap();
        queue.enqueue(cmd("h", CommandPriority::High)).unwrap();

        let drained = queue.drain_below(CommandPriority::Critical);
        assert_eq!(drained.len(), 2);
        assert_eq!(level_of(drained[0].clone()), "h");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().critical_count, 1);
        assert_eq!(queue.stats().cancelled_total, 2);
    }
}
