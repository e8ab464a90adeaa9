use crate::StoreMetaDb;
use block_lib::{BlockBackend, CoreGuard, StoreError, StoreResult};
use std::sync::Arc;

const SWEEP_BATCH: usize = 64;

/// Reclaims blocks whose reference count dropped to zero. Always runs
/// outside any ambient transaction: the caller schedules a sweep only after
/// the transaction that decremented the refcounts has committed, and the
/// backend delete itself may block or open transactions of its own.
pub struct DeadBlockCollector {
    db: Arc<StoreMetaDb>,
    backend: Arc<dyn BlockBackend>,
}

impl DeadBlockCollector {
    pub fn new(db: Arc<StoreMetaDb>, backend: Arc<dyn BlockBackend>) -> Self {
        Self { db, backend }
    }

    /// One best-effort pass; returns how many blocks were reclaimed.
    ///
    /// Each batch is materialized before anything suspends, so no DB cursor
    /// is ever held across a yield point. Eligibility is re-checked row by
    /// row: another operation may have re-referenced a hash since the batch
    /// was fetched.
    pub async fn sweep(&self, core: &mut CoreGuard<'_>) -> StoreResult<usize> {
        let mut reclaimed = 0usize;
        loop {
            let batch = self.db.get_dead_blocks(SWEEP_BATCH)?;
            if batch.is_empty() {
                break;
            }

            for hash in &batch {
                // short committed transaction first, backend delete after
                if !self.db.remove_dead_block(hash)? {
                    debug!("DeadBlockCollector: {} re-referenced, skipped", hash);
                    continue;
                }

                let deleted = core
                    .unlocked("backend delete block", self.backend.delete_block(hash))
                    .await?;
                match deleted {
                    Ok(()) => reclaimed += 1,
                    Err(e) => {
                        // refcounts stay authoritative; nothing references
                        // this hash anymore, the orphan is harmless
                        warn!("DeadBlockCollector: backend delete {} failed! {}", hash, e);
                    }
                }
            }

            if batch.len() < SWEEP_BATCH {
                break;
            }
        }

        if reclaimed > 0 {
            info!("DeadBlockCollector: reclaimed {} dead blocks", reclaimed);
        }
        Ok(reclaimed)
    }
}

/// Convenience used by commit-action handling: a sweep failure is logged
/// and retried on the next scheduled pass, but a cooperative abort must
/// still reach the caller.
pub(crate) async fn sweep_best_effort(
    collector: &DeadBlockCollector,
    core: &mut CoreGuard<'_>,
) -> StoreResult<()> {
    match collector.sweep(core).await {
        Ok(_) => Ok(()),
        Err(err @ StoreError::Aborted(_)) => Err(err),
        Err(e) => {
            warn!("DeadBlockCollector: sweep failed, will retry later! {}", e);
            Ok(())
        }
    }
}
