//! In-memory conversation state, serialized per thread.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::conversation::{DedupKey, ThreadKey, Turn, TurnPayload};

/// Outcome of an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Appended {
    /// The turn was stored at the given position.
    New(u64),
    /// A turn with the same dedup key is already stored, nothing changed.
    Duplicate,
}

impl Appended {
    /// Returns `true` if nothing was appended.
    #[inline]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Appended::Duplicate)
    }
}

#[derive(Default)]
struct Log {
    turns: Vec<Turn>,
    dedup_keys: HashSet<DedupKey>,
}

impl Log {
    fn push(&mut self, payload: TurnPayload) -> Appended {
        if let Some(key) = payload.dedup_key() {
            if !self.dedup_keys.insert(key) {
                return Appended::Duplicate;
            }
        }
        let position = self.turns.len() as u64;
        self.turns.push(Turn {
            position,
            timestamp: Utc::now(),
            payload,
        });
        Appended::New(position)
    }
}

struct Thread {
    writer: Arc<AsyncMutex<()>>,
    log: RwLock<Log>,
}

impl Thread {
    fn snapshot(&self) -> Arc<[Turn]> {
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        Arc::from(log.turns.as_slice())
    }

    fn snapshot_tail(&self, max: usize) -> Arc<[Turn]> {
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        let turns = &log.turns;
        if max == 0 {
            return Arc::from(Vec::new());
        }
        let mut start = turns.len().saturating_sub(max);
        // Tool groups are stored as all requests followed by all results, a
        // tail must begin at the first request of a group.
        while start > 0 && start < turns.len() {
            let inside_group = match &turns[start].payload {
                TurnPayload::ToolResult(_) => true,
                TurnPayload::ToolRequest(_) => {
                    matches!(turns[start - 1].payload, TurnPayload::ToolRequest(_))
                }
                _ => false,
            };
            if !inside_group {
                break;
            }
            start -= 1;
        }
        // The latest user message always stays visible.
        if let Some(user) = turns
            .iter()
            .rposition(|turn| matches!(turn.payload, TurnPayload::UserMessage { .. }))
        {
            start = start.min(user);
        }
        Arc::from(&turns[start..])
    }
}

/// Stores the conversations of all threads.
///
/// Appends go through a [`ThreadGuard`], which holds the thread's writer
/// lock. Snapshots never wait for the writer lock, so they can be taken
/// while a loop is running.
#[derive(Default)]
pub struct ConversationStore {
    threads: Mutex<HashMap<ThreadKey, Arc<Thread>>>,
}

impl ConversationStore {
    /// Creates an empty store.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    fn threads(&self) -> MutexGuard<'_, HashMap<ThreadKey, Arc<Thread>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn thread(&self, key: &ThreadKey) -> Arc<Thread> {
        let mut threads = self.threads();
        let thread = threads.entry(key.clone()).or_insert_with(|| {
            trace!(thread = %key, "creating conversation");
            Arc::new(Thread {
                writer: Default::default(),
                log: Default::default(),
            })
        });
        Arc::clone(thread)
    }

    /// Waits for exclusive write access to a thread, creating it on first
    /// use.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe, no lock is held if the future is dropped
    /// before completion.
    pub async fn lock(&self, key: &ThreadKey) -> ThreadGuard {
        let thread = self.thread(key);
        let permit = Arc::clone(&thread.writer).lock_owned().await;
        ThreadGuard {
            key: key.clone(),
            thread,
            _permit: permit,
        }
    }

    /// Returns all turns of a thread in append order.
    pub fn snapshot(&self, key: &ThreadKey) -> Arc<[Turn]> {
        let thread = self.threads().get(key).cloned();
        match thread {
            Some(thread) => thread.snapshot(),
            None => Arc::from(Vec::new()),
        }
    }

    /// Returns at most `max` of the latest turns of a thread.
    ///
    /// The tail is extended backwards so that it never begins inside a tool
    /// group and always contains the latest user message, so the result may
    /// be longer than `max`.
    pub fn snapshot_tail(&self, key: &ThreadKey, max: usize) -> Arc<[Turn]> {
        let thread = self.threads().get(key).cloned();
        match thread {
            Some(thread) => thread.snapshot_tail(max),
            None => Arc::from(Vec::new()),
        }
    }

    /// Returns the keys of all known threads, sorted.
    pub fn thread_keys(&self) -> Vec<ThreadKey> {
        let mut keys: Vec<_> = self.threads().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Exclusive write access to one thread.
///
/// Dropping the guard lets the next writer of the same thread proceed.
pub struct ThreadGuard {
    key: ThreadKey,
    thread: Arc<Thread>,
    _permit: OwnedMutexGuard<()>,
}

impl ThreadGuard {
    /// Returns the key of the locked thread.
    #[inline]
    pub fn key(&self) -> &ThreadKey {
        &self.key
    }

    fn log(&self) -> std::sync::RwLockWriteGuard<'_, Log> {
        self.thread
            .log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a turn.
    pub fn append(&mut self, payload: TurnPayload) -> Appended {
        let appended = self.log().push(payload);
        if appended.is_duplicate() {
            debug!(thread = %self.key, "skipped a duplicate turn");
        }
        appended
    }

    /// Appends several turns at once; readers never observe a part of
    /// them.
    pub fn append_batch<I>(&mut self, payloads: I) -> Vec<Appended>
    where
        I: IntoIterator<Item = TurnPayload>,
    {
        let mut log = self.log();
        payloads.into_iter().map(|payload| log.push(payload)).collect()
    }

    /// Returns `true` if a tool request with this invocation id is stored.
    pub fn has_invocation(&self, id: &str) -> bool {
        let log = self
            .thread
            .log
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        log.dedup_keys.contains(&DedupKey::Request(id.to_owned()))
    }

    /// Returns the number of stored turns.
    pub fn len(&self) -> usize {
        let log = self
            .thread
            .log
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        log.turns.len()
    }

    /// Returns `true` if the thread has no turns yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same as [`ConversationStore::snapshot`].
    #[inline]
    pub fn snapshot(&self) -> Arc<[Turn]> {
        self.thread.snapshot()
    }

    /// Same as [`ConversationStore::snapshot_tail`].
    #[inline]
    pub fn snapshot_tail(&self, max: usize) -> Arc<[Turn]> {
        self.thread.snapshot_tail(max)
    }
}
