//! In-memory bookkeeping of in-flight sessions, for introspection only.
//!
//! Grounded on the teacher's `AppState` (a `DashMap`-backed registry of
//! agents/connections/sessions in `manhpham90vn-tunnel`'s `server/src/
//! main.rs`): this is additive observability, not load-bearing for
//! correctness — `finish` does not depend on it (spec.md §9 SPEC_FULL
//! supplement).

use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionStat {
    pub user: String,
    pub device_uid: String,
}

#[derive(Default)]
pub struct BrokerStats {
    active: DashMap<Uuid, SessionStat>,
}

impl BrokerStats {
    pub fn mark_registered(&self, uid: Uuid, user: &str, device_uid: &str) {
        self.active.insert(
            uid,
            SessionStat {
                user: user.to_string(),
                device_uid: device_uid.to_string(),
            },
        );
    }

    pub fn mark_finished(&self, uid: Uuid) {
        self.active.remove(&uid);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_session_counts_as_active_until_finished() {
        let stats = BrokerStats::default();
        let uid = Uuid::new_v4();
        stats.mark_registered(uid, "alice", "uid-A");
        assert_eq!(stats.active_count(), 1);

        stats.mark_finished(uid);
        assert_eq!(stats.active_count(), 0);
    }

    #[test]
    fn finishing_an_unregistered_uid_is_a_noop() {
        let stats = BrokerStats::default();
        stats.mark_finished(Uuid::new_v4());
        assert_eq!(stats.active_count(), 0);
    }
}
