//! Lease Manager (C4, §4.4): time-bounded exclusive ownership over a
//! task, built directly atop the assignment ledger. A [`Lease`] *is* an
//! [`Assignment`] — the ledger is the lease's durable state.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use marcus_db::ledger::AssignmentLedger;
use marcus_db::model::{Assignment, AssignmentStatus};

use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, EventTopic};

pub type Lease = Assignment;

#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub default_minutes: i64,
    pub max_minutes: i64,
    pub max_renewals: u32,
    pub heartbeat_timeout_minutes: i64,
    pub auto_renew_threshold_minutes: i64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_minutes: 30,
            max_minutes: 240,
            max_renewals: 5,
            heartbeat_timeout_minutes: 10,
            auto_renew_threshold_minutes: 10,
        }
    }
}

pub struct LeaseManager {
    ledger: Arc<AssignmentLedger>,
    events: Arc<EventBus>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(ledger: Arc<AssignmentLedger>, events: Arc<EventBus>, config: LeaseConfig) -> Self {
        Self { ledger, events, config }
    }

    /// Acquire a lease for `task_id` on behalf of `agent_id`. Returns
    /// `None` if an active, non-expired lease already exists for the
    /// task (held by any agent). Callers are expected to hold the global
    /// assignment mutex across this call and the subsequent Board/ledger
    /// writes (§5).
    pub async fn acquire(&self, task_id: &str, agent_id: &str) -> CoreResult<Option<Lease>> {
        let Some(lease) = self.pending_lease(task_id, agent_id).await? else {
            return Ok(None);
        };
        self.persist_lease(lease.clone()).await?;
        Ok(Some(lease))
    }

    /// Phase one of the §5 ordering guarantee: decide whether a lease
    /// *could* be granted, without writing anything. The coordinator
    /// calls this before the Board update and only calls
    /// [`persist_lease`](Self::persist_lease) once that update succeeds.
    pub async fn pending_lease(&self, task_id: &str, agent_id: &str) -> CoreResult<Option<Lease>> {
        if let Some(existing) = self
            .ledger
            .load_by_task(task_id)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
        {
            if existing.status == AssignmentStatus::Active && existing.lease_expires_at > Utc::now() {
                return Ok(None);
            }
        }

        let now = Utc::now();
        Ok(Some(Lease {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            assigned_at: now,
            lease_expires_at: now + Duration::minutes(self.config.default_minutes),
            last_heartbeat: now,
            renewal_count: 0,
            status: AssignmentStatus::Active,
            metadata: serde_json::json!({}),
        }))
    }

    /// Phase two: durably record a lease already decided via
    /// [`pending_lease`](Self::pending_lease) and publish the acquisition event.
    pub async fn persist_lease(&self, lease: Lease) -> CoreResult<()> {
        self.ledger
            .save(&lease.agent_id, lease.clone())
            .await
            .map_err(|e| CoreError::LedgerWriteError(e.to_string()))?;

        self.events
            .publish(EventTopic::AssignmentAcquired, serde_json::json!({"task_id": lease.task_id, "agent_id": lease.agent_id}))
            .await;
        Ok(())
    }

    /// Update `last_heartbeat`; auto-renews if the remaining lease time
    /// is below the auto-renew threshold and renewals remain.
    pub async fn heartbeat(&self, task_id: &str, agent_id: &str) -> CoreResult<bool> {
        let Some(mut lease) = self.active_lease_for(task_id, agent_id).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        lease.last_heartbeat = now;

        let remaining = lease.lease_expires_at - now;
        if remaining < Duration::minutes(self.config.auto_renew_threshold_minutes) && lease.renewal_count < self.config.max_renewals {
            lease.lease_expires_at = self.capped_expiry(lease.assigned_at, now + Duration::minutes(self.config.default_minutes));
            lease.renewal_count += 1;
            self.events
                .publish(EventTopic::LeaseRenewed, serde_json::json!({"task_id": task_id, "agent_id": agent_id, "auto": true}))
                .await;
        }

        self.ledger
            .save(agent_id, lease)
            .await
            .map_err(|e| CoreError::LedgerWriteError(e.to_string()))?;
        self.events
            .publish(EventTopic::LeaseHeartbeat, serde_json::json!({"task_id": task_id, "agent_id": agent_id}))
            .await;
        Ok(true)
    }

    /// Explicit renewal by `extra_minutes`, capped at `max_minutes` total
    /// lease span and `max_renewals` renewal count.
    pub async fn renew(&self, task_id: &str, agent_id: &str, extra_minutes: i64) -> CoreResult<bool> {
        let Some(mut lease) = self.active_lease_for(task_id, agent_id).await? else {
            return Ok(false);
        };
        if lease.renewal_count >= self.config.max_renewals {
            return Ok(false);
        }

        lease.lease_expires_at = self.capped_expiry(lease.assigned_at, lease.lease_expires_at + Duration::minutes(extra_minutes));
        lease.renewal_count += 1;
        self.ledger
            .save(agent_id, lease)
            .await
            .map_err(|e| CoreError::LedgerWriteError(e.to_string()))?;
        self.events
            .publish(EventTopic::LeaseRenewed, serde_json::json!({"task_id": task_id, "agent_id": agent_id, "auto": false}))
            .await;
        Ok(true)
    }

    /// Normal end of a lease: the agent finished, failed, or released
    /// explicitly. Idempotent: releasing an already-absent lease is not
    /// an error (§8).
    pub async fn release(&self, task_id: &str, agent_id: &str) -> CoreResult<()> {
        if self.active_lease_for(task_id, agent_id).await?.is_some() {
            self.ledger
                .remove(agent_id)
                .await
                .map_err(|e| CoreError::LedgerWriteError(e.to_string()))?;
            self.events
                .publish(EventTopic::AssignmentReleased, serde_json::json!({"task_id": task_id, "agent_id": agent_id}))
                .await;
        }
        Ok(())
    }

    /// Admin/reconciler path: force-release regardless of holder.
    pub async fn force_release(&self, task_id: &str, reason: &str) -> CoreResult<()> {
        if let Some(assignment) = self
            .ledger
            .load_by_task(task_id)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
        {
            self.ledger
                .remove(&assignment.agent_id)
                .await
                .map_err(|e| CoreError::LedgerWriteError(e.to_string()))?;
            self.events
                .publish(
                    EventTopic::LeaseForcedRelease,
                    serde_json::json!({"task_id": task_id, "agent_id": assignment.agent_id, "reason": reason}),
                )
                .await;
        }
        Ok(())
    }

    /// Scan for expired leases; mark EXPIRED, remove from the ledger,
    /// publish `LEASE_EXPIRED` for each. Returns the task ids expired.
    pub async fn tick(&self) -> CoreResult<Vec<String>> {
        let all = self.ledger.load().await.map_err(|e| CoreError::Internal(e.to_string()))?;
        let now = Utc::now();
        let mut expired = Vec::new();

        for (agent_id, assignment) in all {
            if assignment.status == AssignmentStatus::Active && assignment.lease_expires_at <= now {
                self.ledger
                    .remove(&agent_id)
                    .await
                    .map_err(|e| CoreError::LedgerWriteError(e.to_string()))?;
                self.events
                    .publish(
                        EventTopic::LeaseExpired,
                        serde_json::json!({"task_id": assignment.task_id, "agent_id": agent_id}),
                    )
                    .await;
                expired.push(assignment.task_id);
            }
        }
        Ok(expired)
    }

    async fn active_lease_for(&self, task_id: &str, agent_id: &str) -> CoreResult<Option<Lease>> {
        let Some(assignment) = self
            .ledger
            .load_by_task(task_id)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
        else {
            return Ok(None);
        };
        if assignment.agent_id != agent_id || assignment.status != AssignmentStatus::Active {
            return Ok(None);
        }
        Ok(Some(assignment))
    }

    fn capped_expiry(&self, assigned_at: DateTime<Utc>, candidate: DateTime<Utc>) -> DateTime<Utc> {
        let cap = assigned_at + Duration::minutes(self.config.max_minutes);
        candidate.min(cap)
    }
}
