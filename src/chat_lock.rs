use super::*;
use std::future::Future;
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

struct ChatSlot {
    lock: Arc<Mutex<()>>,
    holders: usize,
}

/// FIFO mutual exclusion keyed by chat id.
///
/// A slot lives only while someone holds or waits for it, so chats that
/// stop talking to the bot do not leave anything behind.
#[derive(Clone, Default)]
pub(super) struct ChatLocks {
    slots: Arc<StdMutex<HashMap<i64, ChatSlot>>>,
}

impl ChatLocks {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Runs `fut` once every operation queued earlier for `chat_id` has finished.
    pub(super) async fn with_chat_lock<F, T>(&self, chat_id: i64, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire(chat_id).await;
        fut.await
    }

    pub(super) async fn acquire(&self, chat_id: i64) -> ChatLockGuard {
        let (lock, ticket) = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = slots.entry(chat_id).or_insert_with(|| ChatSlot {
                lock: Arc::new(Mutex::new(())),
                holders: 0,
            });
            slot.holders += 1;
            let ticket = SlotTicket {
                slots: self.slots.clone(),
                chat_id,
            };
            (slot.lock.clone(), ticket)
        };
        // The ticket is released on drop, including when this future is
        // dropped while still queued.
        let guard = lock.lock_owned().await;
        ChatLockGuard {
            _guard: guard,
            _ticket: ticket,
        }
    }

    #[cfg(test)]
    pub(super) fn active_slots(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive access to one chat. Field order matters: the mutex is released
/// before the slot bookkeeping runs.
pub(super) struct ChatLockGuard {
    _guard: OwnedMutexGuard<()>,
    _ticket: SlotTicket,
}

struct SlotTicket {
    slots: Arc<StdMutex<HashMap<i64, ChatSlot>>>,
    chat_id: i64,
}

impl Drop for SlotTicket {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let drained = match slots.get_mut(&self.chat_id) {
            Some(slot) => {
                slot.holders = slot.holders.saturating_sub(1);
                slot.holders == 0
            }
            None => false,
        };
        if drained {
            slots.remove(&self.chat_id);
        }
    }
}
