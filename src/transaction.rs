// src/transaction.rs

//! The transaction table shared across Connection, Session and Handle
//! (spec §3, §4.2). A transaction pairs one outbound request with its
//! eventual completion; ownership is checked by reference identity at close
//! time so a response routed to the wrong level is silently dropped rather
//! than corrupting another owner's transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::CoreError;
use crate::message::Envelope;

/// Upper bound for the random seed / wraparound point of the transaction-id
/// counter (spec §3: "uniformly-random seed in `[0, MAX_SAFE)`, wrapping to
/// 0 at the ceiling"). `2^53` mirrors JS's `Number.MAX_SAFE_INTEGER`, which
/// is what the source actually wraps at.
const MAX_SAFE: u64 = 1 << 53;

/// Process-wide monotonic transaction-id counter, seeded randomly once per
/// process so ids are probabilistically unique across process instances and
/// exactly unique within one (spec §3).
pub struct TransactionIdAllocator {
    counter: std::sync::atomic::AtomicU64,
}

impl TransactionIdAllocator {
    pub fn new() -> Self {
        let seed = rand::thread_rng().gen_range(0..MAX_SAFE);
        TransactionIdAllocator { counter: std::sync::atomic::AtomicU64::new(seed) }
    }

    /// Returns the next id as a decimal string and advances the counter,
    /// wrapping to 0 at `MAX_SAFE`.
    pub fn next(&self) -> String {
        use std::sync::atomic::Ordering;
        let mut current = self.counter.load(Ordering::Relaxed);
        loop {
            let next = if current + 1 >= MAX_SAFE { 0 } else { current + 1 };
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current.to_string(),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for TransactionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// An opaque, reference-identity-comparable handle to whichever component
/// owns a transaction (Connection, Session or Handle). Each owning
/// component hands out one of these (backed by an `Arc` it already holds)
/// when it registers a transaction, and presents the same value again when
/// closing it; the manager compares with `Arc::ptr_eq` so a mismatched
/// owner is rejected without needing to know anything about what the owner
/// actually is.
#[derive(Clone)]
pub struct OwnerToken(Arc<()>);

impl OwnerToken {
    pub fn new() -> Self {
        OwnerToken(Arc::new(()))
    }

    fn same(&self, other: &OwnerToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Public identity comparison, used by session/handle routing to find
    /// which child object a given transaction belongs to.
    pub fn is(&self, other: &OwnerToken) -> bool {
        self.same(other)
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The request verb a pending transaction was opened for. Routing at the
/// session and handle level depends on this (spec §3: "retained because
/// routing decisions depend on it").
pub type RequestVerb = String;

struct PendingTransaction {
    owner: OwnerToken,
    request: RequestVerb,
    done: Option<oneshot::Sender<Result<Envelope, CoreError>>>,
    timeout_task: Option<JoinHandle<()>>,
}

/// Shared transaction table. One instance lives on `Connection`; `Session`
/// and `Handle` borrow a clone of the `Arc` to register their own
/// transactions into the same table.
pub struct TransactionManager {
    table: Mutex<HashMap<String, PendingTransaction>>,
    ids: TransactionIdAllocator,
    debug_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(TransactionManager {
            table: Mutex::new(HashMap::new()),
            ids: TransactionIdAllocator::new(),
            debug_task: Mutex::new(None),
        })
    }

    pub fn generate_id(&self) -> String {
        self.ids.next()
    }

    /// Registers a new transaction. Returns `None` if `id` is already in use
    /// (spec §4.2: "returns the new record if `id` is unused, else
    /// nothing").
    pub fn create(
        self: &Arc<Self>,
        id: String,
        owner: OwnerToken,
        request: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Option<oneshot::Receiver<Result<Envelope, CoreError>>> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock();
        if table.contains_key(&id) {
            return None;
        }

        let timeout_task = timeout.map(|dur| {
            let mgr = Arc::clone(self);
            let timeout_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(dur).await;
                mgr.close_on_timeout(&timeout_id);
            })
        });

        table.insert(
            id,
            PendingTransaction {
                owner,
                request: request.into(),
                done: Some(tx),
                timeout_task,
            },
        );
        Some(rx)
    }

    /// The request verb a still-pending transaction was opened for, used by
    /// session-level routing to recognize the keepalive ack special case
    /// (spec §4.4 rule 2).
    pub fn request_of(&self, id: &str) -> Option<String> {
        self.table.lock().get(id).map(|t| t.request.clone())
    }

    /// Whether `owner` currently owns transaction `id`, used by
    /// session-level routing rule 2 to find the special-case trickle ack
    /// whose owner is a handle but which arrives without a `sender` field.
    pub fn owner_of(&self, id: &str) -> Option<OwnerToken> {
        self.table.lock().get(id).map(|t| t.owner.clone())
    }

    pub fn is_owned_by(&self, id: &str, owner: &OwnerToken) -> bool {
        self.table.lock().get(id).map(|t| t.owner.same(owner)).unwrap_or(false)
    }

    pub fn close_with_success(&self, id: &str, owner: &OwnerToken, data: Envelope) {
        self.close(id, owner, Ok(data));
    }

    pub fn close_with_error(&self, id: &str, owner: &OwnerToken, err: CoreError) {
        self.close(id, owner, Err(err));
    }

    fn close(&self, id: &str, owner: &OwnerToken, outcome: Result<Envelope, CoreError>) {
        let removed = {
            let mut table = self.table.lock();
            match table.get(id) {
                Some(t) if t.owner.same(owner) => table.remove(id),
                Some(_) => {
                    warn!("transaction {id} close rejected: owner mismatch");
                    None
                }
                None => None,
            }
        };
        if let Some(mut pending) = removed {
            if let Some(task) = pending.timeout_task.take() {
                task.abort();
            }
            if let Some(done) = pending.done.take() {
                let _ = done.send(outcome);
            }
        }
    }

    fn close_on_timeout(&self, id: &str) {
        let removed = self.table.lock().remove(id);
        if let Some(mut pending) = removed {
            pending.timeout_task = None;
            if let Some(done) = pending.done.take() {
                let _ = done.send(Err(CoreError::Timeout("Transaction timed out!".to_string())));
            }
        }
    }

    /// Closes every transaction owned by `owner`, or every transaction in
    /// the table if `owner` is `None` (spec §4.2 `closeAllWithError`).
    pub fn close_all_with_error(&self, owner: Option<&OwnerToken>, message: &str) {
        let removed: Vec<PendingTransaction> = {
            let mut table = self.table.lock();
            match owner {
                Some(owner) => {
                    let ids: Vec<String> = table
                        .iter()
                        .filter(|(_, t)| t.owner.same(owner))
                        .map(|(id, _)| id.clone())
                        .collect();
                    ids.into_iter().filter_map(|id| table.remove(&id)).collect()
                }
                None => table.drain().map(|(_, t)| t).collect(),
            }
        };
        for mut pending in removed {
            if let Some(task) = pending.timeout_task.take() {
                task.abort();
            }
            if let Some(done) = pending.done.take() {
                let _ = done.send(Err(CoreError::Lifecycle(message.to_string())));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enables the debug-mode periodic table-size log (spec §4.2, enabled by
    /// `--debug-tx`).
    pub fn enable_debug_logging(self: &Arc<Self>) {
        let mgr = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                debug!("transaction table size: {}", mgr.len());
            }
        });
        *self.debug_task.lock() = Some(task);
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        if let Some(task) = self.debug_task.lock().take() {
            task.abort();
        }
    }
}
