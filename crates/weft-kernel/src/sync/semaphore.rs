//! Task-aware counting semaphore
//!
//! Unlike an OS semaphore, this one blocks tasks while the scheduling thread
//! keeps running other tasks. Decrement waiters queue FIFO with their
//! requested amounts; zero-waiters wake as one unordered batch the instant
//! the value reaches zero. The table owns the state; waking suspended tasks
//! is the scheduler's job, so wake-ups are driven from the effect handlers.

use crate::error::TaskError;
use crate::scheduler::TaskId;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Unique identifier for a semaphore
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SemaphoreId(u64);

impl SemaphoreId {
    /// The numeric id value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an id from its numeric value
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }
}

/// Errors raised by semaphore operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SemaphoreError {
    /// The id does not name a semaphore of this kernel
    #[error("Semaphore {0:?} not found")]
    NotFound(SemaphoreId),

    /// The semaphore has been destroyed
    #[error("Semaphore has been destroyed")]
    Destroyed,

    /// Negative amounts are malformed requests
    #[error("Invalid semaphore amount: {0}")]
    InvalidAmount(i64),
}

impl From<SemaphoreError> for TaskError {
    fn from(err: SemaphoreError) -> Self {
        let kind = match err {
            SemaphoreError::Destroyed => crate::error::TaskErrorKind::SemaphoreDestroyed,
            _ => crate::error::TaskErrorKind::Invalid,
        };
        TaskError::new(kind, err.to_string())
    }
}

/// A counting semaphore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Semaphore {
    value: i64,
    active: bool,
    /// FIFO queue of (waiting task, requested amount)
    waiters: VecDeque<(TaskId, i64)>,
    /// Tasks blocked until the value reaches zero
    zero_waiters: Vec<TaskId>,
}

impl Semaphore {
    fn new(initial: i64) -> Self {
        Self {
            value: initial,
            active: true,
            waiters: VecDeque::new(),
            zero_waiters: Vec::new(),
        }
    }

    /// Current value
    pub fn value(&self) -> i64 {
        self.value
    }

    /// Whether the semaphore has not been destroyed
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Number of queued decrement waiters
    pub fn waiting_count(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn add(&mut self, amount: i64) {
        self.value += amount;
    }

    pub(crate) fn subtract(&mut self, amount: i64) {
        self.value -= amount;
    }

    pub(crate) fn force_zero(&mut self) {
        self.value = 0;
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
    }

    pub(crate) fn push_waiter(&mut self, task: TaskId, amount: i64) {
        self.waiters.push_back((task, amount));
    }

    pub(crate) fn push_zero_waiter(&mut self, task: TaskId) {
        self.zero_waiters.push(task);
    }

    /// Pop the front waiter if its amount is now satisfiable
    pub(crate) fn pop_satisfiable(&mut self) -> Option<(TaskId, i64)> {
        match self.waiters.front().copied() {
            Some((task, amount)) if self.value >= amount => {
                self.waiters.pop_front();
                Some((task, amount))
            }
            _ => None,
        }
    }

    /// Remove the first queued decrement wait registered by `task`
    pub(crate) fn remove_waiter(&mut self, task: TaskId) {
        if let Some(pos) = self.waiters.iter().position(|(t, _)| *t == task) {
            self.waiters.remove(pos);
        }
    }

    /// Remove the first zero wait registered by `task`
    pub(crate) fn remove_zero_waiter(&mut self, task: TaskId) {
        if let Some(pos) = self.zero_waiters.iter().position(|t| *t == task) {
            self.zero_waiters.remove(pos);
        }
    }

    pub(crate) fn drain_waiters(&mut self) -> Vec<(TaskId, i64)> {
        self.waiters.drain(..).collect()
    }

    pub(crate) fn drain_zero_waiters(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.zero_waiters)
    }
}

/// Id-indexed arena of all semaphores owned by one kernel
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SemaphoreTable {
    next_id: u64,
    entries: FxHashMap<SemaphoreId, Semaphore>,
}

impl SemaphoreTable {
    /// Create a semaphore and return its id
    pub fn create(&mut self, initial: i64) -> SemaphoreId {
        while self.entries.contains_key(&SemaphoreId(self.next_id)) {
            self.next_id += 1;
        }
        let id = SemaphoreId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, Semaphore::new(initial));
        id
    }

    /// Look up a semaphore, destroyed or not
    pub fn get(&self, id: SemaphoreId) -> Result<&Semaphore, SemaphoreError> {
        self.entries.get(&id).ok_or(SemaphoreError::NotFound(id))
    }

    pub(crate) fn get_mut(&mut self, id: SemaphoreId) -> Result<&mut Semaphore, SemaphoreError> {
        self.entries.get_mut(&id).ok_or(SemaphoreError::NotFound(id))
    }

    /// Look up an active semaphore
    pub fn get_active(&self, id: SemaphoreId) -> Result<&Semaphore, SemaphoreError> {
        let sem = self.get(id)?;
        if !sem.active {
            return Err(SemaphoreError::Destroyed);
        }
        Ok(sem)
    }

    pub(crate) fn get_active_mut(
        &mut self,
        id: SemaphoreId,
    ) -> Result<&mut Semaphore, SemaphoreError> {
        let sem = self.entries.get_mut(&id).ok_or(SemaphoreError::NotFound(id))?;
        if !sem.active {
            return Err(SemaphoreError::Destroyed);
        }
        Ok(sem)
    }

    /// Whether the id names an active semaphore
    pub fn is_active(&self, id: SemaphoreId) -> bool {
        self.entries.get(&id).map(|s| s.active).unwrap_or(false)
    }

    /// Number of semaphores in the table
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every semaphore not in the retained set
    pub(crate) fn retain(&mut self, keep: &rustc_hash::FxHashSet<SemaphoreId>) {
        self.entries.retain(|id, _| keep.contains(id));
    }
}

/// Validate a user-supplied amount
pub(crate) fn check_amount(amount: i64) -> Result<(), SemaphoreError> {
    if amount < 0 {
        return Err(SemaphoreError::InvalidAmount(amount));
    }
    Ok(())
}
