//! Synchronization primitives
//!
//! Counting semaphores and bounded channels. Both block *tasks*, never the
//! host thread: a blocked task parks in a wait list and the scheduler wakes
//! it when the condition is met.

pub mod channel;
pub mod semaphore;

pub use channel::{
    channel, close, read, write, Channel, ChannelError, ChannelId, ChannelTable, OverflowPolicy,
};
pub use semaphore::{Semaphore, SemaphoreError, SemaphoreId, SemaphoreTable};
