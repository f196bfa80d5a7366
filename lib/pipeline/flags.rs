use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Which pool a worker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    Enumerator,
    Detail,
    Media,
    Comment,
    Writer,
}

impl WorkerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enumerator => "enumerator",
            Self::Detail => "detail",
            Self::Media => "media",
            Self::Comment => "comment",
            Self::Writer => "writer",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct FlagState {
    idle: AtomicBool,
    alive: AtomicBool,
}

/// A worker's self-reported state, read by the quiescence monitor.
///
/// Workers start busy. An exited worker always reads as idle since it holds no work.
#[derive(Debug, Clone)]
pub struct WorkerFlag {
    role: WorkerRole,
    index: usize,
    state: Arc<FlagState>,
}

impl WorkerFlag {
    fn new(role: WorkerRole, index: usize) -> Self {
        Self {
            role,
            index,
            state: Arc::new(FlagState {
                idle: AtomicBool::new(false),
                alive: AtomicBool::new(true),
            }),
        }
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_idle(&self, idle: bool) {
        self.state.idle.store(idle, Ordering::SeqCst);
    }

    pub fn is_idle(&self) -> bool {
        self.state.idle.load(Ordering::SeqCst)
    }

    pub fn mark_exited(&self) {
        self.state.idle.store(true, Ordering::SeqCst);
        self.state.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }
}

/// Idle/alive flags for every worker of one run.
#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    enumerator: WorkerFlag,
    detail: Vec<WorkerFlag>,
    media: Vec<WorkerFlag>,
    comment: Vec<WorkerFlag>,
    writer: WorkerFlag,
}

impl WorkerRegistry {
    pub fn new(detail_workers: usize, media_workers: usize, comment_workers: usize) -> Self {
        let pool = |role, count| {
            (0..count)
                .map(|index| WorkerFlag::new(role, index))
                .collect()
        };
        Self {
            enumerator: WorkerFlag::new(WorkerRole::Enumerator, 0),
            detail: pool(WorkerRole::Detail, detail_workers),
            media: pool(WorkerRole::Media, media_workers),
            comment: pool(WorkerRole::Comment, comment_workers),
            writer: WorkerFlag::new(WorkerRole::Writer, 0),
        }
    }

    pub fn enumerator(&self) -> &WorkerFlag {
        &self.enumerator
    }

    pub fn writer(&self) -> &WorkerFlag {
        &self.writer
    }

    pub fn pool(&self, role: WorkerRole) -> &[WorkerFlag] {
        match role {
            WorkerRole::Enumerator => std::slice::from_ref(&self.enumerator),
            WorkerRole::Detail => &self.detail,
            WorkerRole::Media => &self.media,
            WorkerRole::Comment => &self.comment,
            WorkerRole::Writer => std::slice::from_ref(&self.writer),
        }
    }

    fn all(&self) -> impl Iterator<Item = &WorkerFlag> {
        std::iter::once(&self.enumerator)
            .chain(self.detail.iter())
            .chain(self.media.iter())
            .chain(self.comment.iter())
            .chain(std::iter::once(&self.writer))
    }

    pub fn all_idle(&self) -> bool {
        self.all().all(WorkerFlag::is_idle)
    }

    pub fn busy_count(&self) -> usize {
        self.all().filter(|flag| !flag.is_idle()).count()
    }

    pub fn live_count(&self, role: WorkerRole) -> usize {
        self.pool(role).iter().filter(|flag| flag.is_alive()).count()
    }

    /// The first fetcher pool whose every worker has exited, if any.
    pub fn dead_fetcher_pool(&self) -> Option<WorkerRole> {
        [WorkerRole::Detail, WorkerRole::Media, WorkerRole::Comment]
            .into_iter()
            .find(|role| !self.pool(*role).is_empty() && self.live_count(*role) == 0)
    }
}

/// Counters shared between the enumerator, the monitor, and the run summary.
#[derive(Debug)]
pub struct RunProgress {
    remaining_budget: AtomicI64,
    pages_enumerated: AtomicU64,
    items_enqueued: AtomicU64,
    deleted_items: AtomicU64,
}

impl RunProgress {
    pub fn new(remaining_budget: i64) -> Self {
        Self {
            remaining_budget: AtomicI64::new(remaining_budget),
            pages_enumerated: AtomicU64::new(0),
            items_enqueued: AtomicU64::new(0),
            deleted_items: AtomicU64::new(0),
        }
    }

    pub fn remaining_budget(&self) -> i64 {
        self.remaining_budget.load(Ordering::SeqCst)
    }

    /// Records one enqueued task.
    pub fn consume_budget(&self) {
        self.remaining_budget.fetch_sub(1, Ordering::SeqCst);
        self.items_enqueued.fetch_add(1, Ordering::SeqCst);
    }

    /// The catalog is exhausted; nothing more will be enqueued.
    pub fn exhaust_budget(&self) {
        self.remaining_budget.store(0, Ordering::SeqCst);
    }

    pub fn record_page(&self) {
        self.pages_enumerated.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_deleted(&self) {
        self.deleted_items.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pages_enumerated(&self) -> u64 {
        self.pages_enumerated.load(Ordering::SeqCst)
    }

    pub fn items_enqueued(&self) -> u64 {
        self.items_enqueued.load(Ordering::SeqCst)
    }

    pub fn deleted_items(&self) -> u64 {
        self.deleted_items.load(Ordering::SeqCst)
    }
}
