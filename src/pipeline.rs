//! Offload and prune: moving context into long-term memory and letting
//! mid-importance facts decay out of it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::memory::MemoryStore;
use crate::provider::Compressor;
use crate::scoring::ImportanceScorer;

/// What one offload pass did for one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OffloadReport {
    pub examined: usize,
    pub promoted: usize,
    pub skipped: usize,
    pub cleared: usize,
}

/// What one prune pass did for one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub eternal: usize,
    pub evicted: usize,
    pub rerated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Totals for a run over every known user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub users: usize,
    pub promoted: usize,
    pub cleared: usize,
    pub evicted: usize,
    pub rerated: usize,
    pub failed_users: Vec<String>,
}

/// Periodic job over both memory tiers.
///
/// Runs never overlap: a run requested while another is in progress is
/// skipped. Entries are processed one at a time, each fully scored,
/// compressed and promoted before the next is looked at.
pub struct OffloadPipeline {
    store: Arc<MemoryStore>,
    scorer: Arc<dyn ImportanceScorer>,
    compressor: Arc<dyn Compressor>,
    running: Mutex<()>,
}

impl OffloadPipeline {
    pub fn new(
        store: Arc<MemoryStore>,
        scorer: Arc<dyn ImportanceScorer>,
        compressor: Arc<dyn Compressor>,
    ) -> Self {
        Self {
            store,
            scorer,
            compressor,
            running: Mutex::new(()),
        }
    }

    /// Promote a user's important context turns, then clear the turns that
    /// were examined.
    ///
    /// Turns appended while the pass is running stay for the next run. A
    /// transient collaborator failure stops the pass before the clear, so
    /// the remaining turns are retried on the next run. A malformed reply
    /// only skips the turn it concerns.
    pub async fn offload(&self, user_id: &str) -> Result<OffloadReport> {
        let context = self.store.context();
        let long_term = self.store.long_term();
        let entries = context.dump_all(user_id)?;
        let examined: Vec<i64> = entries.iter().map(|e| e.id).collect();
        let mut report = OffloadReport {
            examined: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            let date = entry.date();

            let importance = match self.scorer.score(&entry.summary, date).await {
                Ok(importance) => importance,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(user_id, id = entry.id, error = %e, "Could not rate context turn, skipping");
                    report.skipped += 1;
                    continue;
                }
            };
            if !importance.is_important {
                report.skipped += 1;
                continue;
            }

            let fact = match self.compressor.extract_fact(&entry.summary, date).await {
                Ok(fact) => fact,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(user_id, id = entry.id, error = %e, "Could not extract fact, skipping");
                    report.skipped += 1;
                    continue;
                }
            };
            if fact.trim().is_empty() {
                report.skipped += 1;
                continue;
            }

            long_term
                .promote_on(user_id, entry.role, &entry.content, &fact, importance.rating, date)
                .await?;
            report.promoted += 1;
        }

        report.cleared = context.clear_entries(user_id, &examined)?;
        info!(
            user_id,
            examined = report.examined,
            promoted = report.promoted,
            "Offloaded context"
        );
        Ok(report)
    }

    /// Re-rate a user's long-term facts, evicting those no longer important.
    ///
    /// Facts at or above the eternal rating are never re-rated. A failure
    /// rating one fact leaves that fact as it is.
    pub async fn prune(&self, user_id: &str) -> Result<PruneReport> {
        let long_term = self.store.long_term();
        let eternal_rating = self.store.config().eternal_rating;
        let mut report = PruneReport::default();

        for fact in long_term.facts(user_id)? {
            if fact.is_eternal(eternal_rating) {
                report.eternal += 1;
                continue;
            }

            let importance = match self.scorer.score(&fact.summary, fact.date).await {
                Ok(importance) => importance,
                Err(e) => {
                    warn!(user_id, id = fact.id, error = %e, "Could not re-rate fact, keeping it");
                    report.failed += 1;
                    continue;
                }
            };

            if !importance.is_important {
                long_term.evict(user_id, &fact.summary)?;
                report.evicted += 1;
            } else if importance.rating != fact.rate {
                long_term.rerate(user_id, &fact.summary, importance.rating)?;
                report.rerated += 1;
            } else {
                report.unchanged += 1;
            }
        }

        debug!(
            user_id,
            evicted = report.evicted,
            rerated = report.rerated,
            "Pruned long-term memory"
        );
        Ok(report)
    }

    /// Offload then prune every user with stored memory.
    ///
    /// Returns `None` when another run is already in progress. One user's
    /// failure is logged and does not stop the others.
    pub async fn run_all(&self) -> Result<Option<RunReport>> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("Offload already running, skipping");
            return Ok(None);
        };

        let users = self.store.known_users()?;
        let mut report = RunReport {
            users: users.len(),
            ..Default::default()
        };

        for user_id in users {
            match self.run_user_locked(&user_id).await {
                Ok((offload, prune)) => {
                    report.promoted += offload.promoted;
                    report.cleared += offload.cleared;
                    report.evicted += prune.evicted;
                    report.rerated += prune.rerated;
                }
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Offload failed for user");
                    report.failed_users.push(user_id);
                }
            }
        }

        info!(
            users = report.users,
            promoted = report.promoted,
            evicted = report.evicted,
            failed = report.failed_users.len(),
            "Offload run finished"
        );
        Ok(Some(report))
    }

    /// Offload then prune a single user, unless a run is in progress
    pub async fn run_user(&self, user_id: &str) -> Result<Option<(OffloadReport, PruneReport)>> {
        let Ok(_guard) = self.running.try_lock() else {
            return Ok(None);
        };
        self.run_user_locked(user_id).await.map(Some)
    }

    async fn run_user_locked(&self, user_id: &str) -> Result<(OffloadReport, PruneReport)> {
        let offload = self.offload(user_id).await?;
        let prune = self.prune(user_id).await?;
        Ok((offload, prune))
    }

    /// Run over all users every `interval`, forever.
    ///
    /// The first run happens one interval after start. Ticks missed while a
    /// run is still going are dropped rather than replayed.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_all().await {
                warn!(error = %e, "Offload run failed");
            }
        }
    }
}
