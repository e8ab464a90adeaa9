use crate::{StoreError, StoreResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// The daemon's single shared execution context. Whoever holds the guard is
/// the only task allowed to touch shared state; blocking backend calls must
/// be bracketed by `suspend`/`resume` (or `unlocked`) so other tasks can run
/// in the meantime. This is the only sanctioned place code blocks without
/// holding the context.
pub struct CoreLock {
    slot: Mutex<()>,
    canceled: AtomicBool,
}

impl CoreLock {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(()),
            canceled: AtomicBool::new(false),
        }
    }

    pub async fn enter(&self) -> StoreResult<CoreGuard<'_>> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(StoreError::Aborted("core lock canceled".to_string()));
        }
        let held = self.slot.lock().await;
        Ok(CoreGuard {
            lock: self,
            held: Some(held),
        })
    }

    /// Cancel every task currently suspended; their `resume` fails with
    /// `Aborted`. New `enter` calls fail the same way.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl Default for CoreLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Receipt for a released execution slot; hand it back to `resume`.
#[must_use = "a suspended core guard must be resumed"]
pub struct SuspendHandle {
    reason: String,
}

pub struct CoreGuard<'a> {
    lock: &'a CoreLock,
    held: Option<MutexGuard<'a, ()>>,
}

impl<'a> CoreGuard<'a> {
    /// Release the execution slot before a blocking call. No DB cursor or
    /// open transaction may be alive at this point.
    pub fn suspend(&mut self, reason: &str) -> SuspendHandle {
        debug!("CoreLock: suspend ({})", reason);
        self.held.take();
        SuspendHandle {
            reason: reason.to_string(),
        }
    }

    /// Reacquire the execution slot. Fails with `Aborted` if the lock was
    /// canceled while this task was suspended; the caller's operation must
    /// propagate that instead of touching shared state.
    pub async fn resume(&mut self, handle: SuspendHandle) -> StoreResult<()> {
        let held = self.lock.slot.lock().await;
        if self.lock.canceled.load(Ordering::SeqCst) {
            warn!("CoreLock: resume aborted ({})", handle.reason);
            return Err(StoreError::Aborted(format!(
                "canceled while suspended: {}",
                handle.reason
            )));
        }
        debug!("CoreLock: resume ({})", handle.reason);
        self.held = Some(held);
        Ok(())
    }

    /// Run a blocking future with the slot released, then reacquire.
    pub async fn unlocked<F, T>(&mut self, reason: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = T>,
    {
        let handle = self.suspend(reason);
        let out = fut.await;
        self.resume(handle).await?;
        Ok(out)
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}
