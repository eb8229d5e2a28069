use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_std::sync::RwLock;
use common::errors::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::MetastoreError;

/// Minimum TTL enforced on grant, per spec recommendation (4.5).
pub const MIN_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: u64,
    pub ttl: Duration,
    pub deadline: Instant,
    pub attached_keys: HashSet<Vec<u8>>,
}

pub struct LeaseInfo {
    pub ttl: Duration,
    pub granted_ttl: Duration,
    pub keys: Option<Vec<Vec<u8>>>,
}

/// A lease's wire-stable fields for snapshotting. `deadline` is a monotonic
/// `Instant` and cannot be serialized meaningfully across a restart
/// boundary, so only the remaining duration travels; the receiving node
/// recomputes `deadline = now + remaining` against its own clock, per the
/// "never trust wall-clock differences between nodes" rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSnapshot {
    pub lease_id: u64,
    pub ttl_millis: u64,
    pub remaining_millis: u64,
    pub attached_keys: Vec<Vec<u8>>,
}

/// C5: grants, renews, and revokes TTL-bound leases, cascading revocation
/// to attached keys.
///
/// Deadlines are always computed from the local monotonic clock at the
/// moment a grant/renewal is *applied* (i.e. committed), never from the
/// moment the request arrived and never from wall-clock time; see
/// `common::time`. This is what makes a leader that crashes after
/// receiving but before committing a renewal unable to have granted extra
/// life to a lease it never actually committed.
pub struct LeaseManager {
    leases: RwLock<HashMap<u64, Lease>>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
        }
    }

    /// Allocates (or reuses, if requested and free) a lease id and records
    /// its deadline relative to `now`. `now` is passed in rather than read
    /// internally so the apply pipeline can supply the commit-time
    /// monotonic instant uniformly across a replayed log and a live one.
    pub async fn grant(&self, ttl: Duration, requested_id: Option<u64>, now: Instant) -> Result<u64> {
        let ttl = ttl.max(MIN_TTL);
        let mut leases = self.leases.write().await;

        let lease_id = match requested_id {
            Some(id) if !leases.contains_key(&id) => id,
            Some(_) => return Err(err_msg("requested lease id already in use")),
            None => loop {
                let candidate: u64 = rand::thread_rng().gen_range(1..=u64::MAX);
                if !leases.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        leases.insert(
            lease_id,
            Lease {
                lease_id,
                ttl,
                deadline: now + ttl,
                attached_keys: HashSet::new(),
            },
        );

        Ok(lease_id)
    }

    /// Removes the lease and returns the keys that were attached to it, for
    /// the caller (the apply pipeline) to delete as one atomic step sharing
    /// a single new revision.
    pub async fn revoke(&self, lease_id: u64) -> Option<HashSet<Vec<u8>>> {
        self.leases.write().await.remove(&lease_id).map(|lease| lease.attached_keys)
    }

    pub async fn keep_alive(&self, lease_id: u64, new_ttl: Option<Duration>, now: Instant) -> Result<Duration> {
        let mut leases = self.leases.write().await;
        let lease = leases
            .get_mut(&lease_id)
            .ok_or(MetastoreError::LeaseNotFound { lease_id })?;
        if let Some(ttl) = new_ttl {
            lease.ttl = ttl.max(MIN_TTL);
        }
        lease.deadline = now + lease.ttl;
        Ok(lease.ttl)
    }

    pub async fn attach(&self, lease_id: u64, key: &[u8]) -> Result<()> {
        if lease_id == 0 {
            return Ok(());
        }
        let mut leases = self.leases.write().await;
        let lease = leases
            .get_mut(&lease_id)
            .ok_or(MetastoreError::LeaseNotFound { lease_id })?;
        lease.attached_keys.insert(key.to_vec());
        Ok(())
    }

    /// Unlike `attach`, detaching from a lease that no longer exists is not
    /// an error: the lease may have just been revoked in the same apply
    /// step that is now cleaning up the key's old association.
    pub async fn detach(&self, lease_id: u64, key: &[u8]) {
        if lease_id == 0 {
            return;
        }
        if let Some(lease) = self.leases.write().await.get_mut(&lease_id) {
            lease.attached_keys.remove(key);
        }
    }

    pub async fn time_to_live(&self, lease_id: u64, want_keys: bool, now: Instant) -> Result<LeaseInfo> {
        let leases = self.leases.read().await;
        let lease = leases.get(&lease_id).ok_or(MetastoreError::LeaseNotFound { lease_id })?;
        let remaining = lease.deadline.saturating_duration_since(now);
        Ok(LeaseInfo {
            ttl: remaining,
            granted_ttl: lease.ttl,
            keys: if want_keys {
                Some(lease.attached_keys.iter().cloned().collect())
            } else {
                None
            },
        })
    }

    /// Collects the ids of leases whose deadline has passed. Takes only a
    /// read lock, per the deadlock-prevention policy (§5): the caller
    /// proposes revocations outside of any lock this function held.
    pub async fn expired_leases(&self, now: Instant) -> Vec<u64> {
        self.leases
            .read()
            .await
            .values()
            .filter(|lease| now >= lease.deadline)
            .map(|lease| lease.lease_id)
            .collect()
    }

    /// Produces a consistent point-in-time view of all leases for state
    /// machine snapshotting (C9).
    pub async fn snapshot(&self, now: Instant) -> Vec<LeaseSnapshot> {
        self.leases
            .read()
            .await
            .values()
            .map(|lease| LeaseSnapshot {
                lease_id: lease.lease_id,
                ttl_millis: lease.ttl.as_millis() as u64,
                remaining_millis: lease.deadline.saturating_duration_since(now).as_millis() as u64,
                attached_keys: lease.attached_keys.iter().cloned().collect(),
            })
            .collect()
    }

    /// Replaces all lease state from a snapshot, recomputing each deadline
    /// against this node's own monotonic clock.
    pub async fn restore(&self, snapshot: Vec<LeaseSnapshot>, now: Instant) {
        let mut leases = self.leases.write().await;
        leases.clear();
        for entry in snapshot {
            leases.insert(
                entry.lease_id,
                Lease {
                    lease_id: entry.lease_id,
                    ttl: Duration::from_millis(entry.ttl_millis),
                    deadline: now + Duration::from_millis(entry.remaining_millis),
                    attached_keys: entry.attached_keys.into_iter().collect(),
                },
            );
        }
    }
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn grant_enforces_the_minimum_ttl() {
        let leases = LeaseManager::new();
        let now = Instant::now();
        let lease_id = leases.grant(Duration::from_millis(1), None, now).await.unwrap();
        let info = leases.time_to_live(lease_id, false, now).await.unwrap();
        assert_eq!(info.granted_ttl, MIN_TTL);
    }

    #[async_std::test]
    async fn requested_id_already_in_use_is_rejected() {
        let leases = LeaseManager::new();
        let now = Instant::now();
        let lease_id = leases.grant(Duration::from_secs(10), None, now).await.unwrap();
        assert!(leases.grant(Duration::from_secs(10), Some(lease_id), now).await.is_err());
    }

    #[async_std::test]
    async fn keep_alive_pushes_the_deadline_out_from_now() {
        let leases = LeaseManager::new();
        let now = Instant::now();
        let lease_id = leases.grant(Duration::from_secs(5), None, now).await.unwrap();

        let later = now + Duration::from_secs(4);
        leases.keep_alive(lease_id, None, later).await.unwrap();

        let info = leases.time_to_live(lease_id, false, later).await.unwrap();
        assert!(info.ttl >= Duration::from_secs(4));
    }

    #[async_std::test]
    async fn revoke_returns_attached_keys_and_forgets_the_lease() {
        let leases = LeaseManager::new();
        let now = Instant::now();
        let lease_id = leases.grant(Duration::from_secs(60), None, now).await.unwrap();
        leases.attach(lease_id, b"a").await.unwrap();
        leases.attach(lease_id, b"b").await.unwrap();

        let keys = leases.revoke(lease_id).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(leases.time_to_live(lease_id, false, now).await.is_err());
    }

    #[async_std::test]
    async fn expired_leases_reports_only_past_deadline_ids() {
        let leases = LeaseManager::new();
        let now = Instant::now();
        let short = leases.grant(Duration::from_secs(1), None, now).await.unwrap();
        let long = leases.grant(Duration::from_secs(60), None, now).await.unwrap();

        let later = now + Duration::from_secs(2);
        let expired = leases.expired_leases(later).await;
        assert_eq!(expired, vec![short]);
        assert_ne!(expired.first(), Some(&long));
    }

    #[async_std::test]
    async fn snapshot_then_restore_round_trips_ttl_and_keys() {
        let leases = LeaseManager::new();
        let now = Instant::now();
        let lease_id = leases.grant(Duration::from_secs(30), None, now).await.unwrap();
        leases.attach(lease_id, b"k").await.unwrap();

        let snapshot = leases.snapshot(now).await;

        let restored = LeaseManager::new();
        restored.restore(snapshot, now).await;

        let info = restored.time_to_live(lease_id, true, now).await.unwrap();
        assert_eq!(info.keys, Some(vec![b"k".to_vec()]));
    }
}
