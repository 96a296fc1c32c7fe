//! Priority classes, processing tasks, and the four bounded frame queues.
//!
//! One queue per priority class, ordered by capture timestamp
//! (earliest-first) within the class. Admission is strictly non-blocking:
//! a full queue rejects the incoming frame — the policy sheds newcomers,
//! never queued elders — so a slow consumer can never stall a producer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::StreamId;

/// Task urgency tier, declared in dispatch order.
///
/// `Critical` dispatches strictly before `High`, and so on down to `Low`,
/// whenever both queues are non-empty. Sustained Critical-class load can
/// therefore starve the lower classes; that is the documented contract of
/// strict-priority dispatch, not a defect. Do not add variants without
/// revisiting that starvation analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    /// Most urgent tier — dispatched ahead of everything else.
    Critical,
    /// Elevated tier, ahead of `Normal`.
    High,
    /// Standard tier for most streams.
    #[default]
    Normal,
    /// Background tier — dispatched only when all others are empty.
    Low,
}

impl PriorityClass {
    /// All classes in dispatch (rank) order.
    pub const ALL: [PriorityClass; 4] = [
        PriorityClass::Critical,
        PriorityClass::High,
        PriorityClass::Normal,
        PriorityClass::Low,
    ];

    /// Urgency rank, 1 (Critical) through 4 (Low). Lower dispatches first.
    pub fn rank(self) -> u8 {
        match self {
            PriorityClass::Critical => 1,
            PriorityClass::High => 2,
            PriorityClass::Normal => 3,
            PriorityClass::Low => 4,
        }
    }

    /// Lowercase label, used for log fields and metric label values.
    pub fn as_str(self) -> &'static str {
        match self {
            PriorityClass::Critical => "critical",
            PriorityClass::High => "high",
            PriorityClass::Normal => "normal",
            PriorityClass::Low => "low",
        }
    }

    /// Parse a class from a name string (`"low"`, `"normal"`, `"high"`,
    /// `"critical"`). Returns `None` for unrecognised strings.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(PriorityClass::Critical),
            "high" => Some(PriorityClass::High),
            "normal" => Some(PriorityClass::Normal),
            "low" => Some(PriorityClass::Low),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self.rank() as usize - 1
    }
}

/// One admitted unit of work: a single frame of a single stream.
///
/// The priority class and algorithm set are copied from the stream config
/// at admission time; later `adjust_stream_priority` calls affect future
/// submissions only and never reorder tasks already queued.
#[derive(Debug, Clone)]
pub struct ProcessingTask {
    /// Owning stream.
    pub stream_id: StreamId,
    /// Opaque decoded frame payload, borrowed by executors for the task's
    /// duration.
    pub frame: Bytes,
    /// Capture timestamp in seconds.
    pub timestamp: f64,
    /// Monotonically increasing frame sequence number within the stream.
    pub sequence: u64,
    /// Priority class at admission time.
    pub priority: PriorityClass,
    /// Algorithm names requested for this frame.
    pub algorithms: Vec<String>,
    /// Dispatch attempts that found no available processor. Starts at 0;
    /// the task is dropped once it reaches the configured retry ceiling.
    pub retries: u32,
}

/// Heap entry: earliest capture timestamp wins, sequence then admission
/// ticket break ties so ordering is total and stable.
struct QueuedTask {
    task: ProcessingTask,
    ticket: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.ticket == other.ticket
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse so the earliest timestamp is
        // the greatest element.
        other
            .task
            .timestamp
            .total_cmp(&self.task.timestamp)
            .then_with(|| other.task.sequence.cmp(&self.task.sequence))
            .then_with(|| other.ticket.cmp(&self.ticket))
    }
}

/// Error returned by a bounded queue that refuses a newcomer.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

impl std::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("queue full")
    }
}

impl std::error::Error for QueueFull {}

/// One bounded, timestamp-ordered queue.
struct FrameQueue {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    capacity: usize,
}

impl FrameQueue {
    fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
        }
    }

    fn try_push(&self, entry: QueuedTask) -> Result<(), QueueFull> {
        let mut heap = self.heap.lock();
        if heap.len() >= self.capacity {
            return Err(QueueFull);
        }
        heap.push(entry);
        Ok(())
    }

    /// Insert without the capacity check. Reserved for dispatch-retry
    /// re-entry: the task was already admitted once, and bouncing it now
    /// would turn the reject-newcomers policy into evict-elders.
    fn push_unchecked(&self, entry: QueuedTask) {
        self.heap.lock().push(entry);
    }

    fn pop(&self) -> Option<ProcessingTask> {
        self.heap.lock().pop().map(|q| q.task)
    }

    fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

/// The four per-class queues behind `submit_frame` and the dispatch loop.
///
/// Many producers enqueue concurrently; a single dispatch loop dequeues.
/// Each queue has its own lock, so unrelated classes never contend.
pub struct QueueBank {
    queues: [FrameQueue; 4],
    ticket: AtomicU64,
}

impl QueueBank {
    /// Create four empty queues, each bounded to `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: [
                FrameQueue::new(capacity),
                FrameQueue::new(capacity),
                FrameQueue::new(capacity),
                FrameQueue::new(capacity),
            ],
            ticket: AtomicU64::new(0),
        }
    }

    fn next_ticket(&self) -> u64 {
        self.ticket.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Non-blocking insert into the task's class queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueFull`] when the class queue is at capacity; the
    /// rejected task is discarded and nothing in the queue changes.
    pub fn try_push(&self, task: ProcessingTask) -> Result<(), QueueFull> {
        let queue = &self.queues[task.priority.index()];
        let class = task.priority;
        queue.try_push(QueuedTask {
            task,
            ticket: self.next_ticket(),
        })?;
        debug!(class = class.as_str(), depth = queue.len(), "frame enqueued");
        Ok(())
    }

    /// Re-insert a task whose dispatch attempt found no processor.
    ///
    /// Bypasses the capacity check; see [`FrameQueue::push_unchecked`].
    pub fn requeue(&self, task: ProcessingTask) {
        let queue = &self.queues[task.priority.index()];
        queue.push_unchecked(QueuedTask {
            task,
            ticket: self.next_ticket(),
        });
    }

    /// Pop the head of the first non-empty queue in strict rank order.
    pub fn pop_highest(&self) -> Option<ProcessingTask> {
        for class in PriorityClass::ALL {
            if let Some(task) = self.queues[class.index()].pop() {
                return Some(task);
            }
        }
        None
    }

    /// Current depth of one class queue.
    pub fn depth(&self, class: PriorityClass) -> usize {
        self.queues[class.index()].len()
    }

    /// Current depth of all four queues, in rank order.
    pub fn depths(&self) -> [usize; 4] {
        [
            self.depth(PriorityClass::Critical),
            self.depth(PriorityClass::High),
            self.depth(PriorityClass::Normal),
            self.depth(PriorityClass::Low),
        ]
    }

    /// True when every queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.len() == 0)
    }
}
