//! Condition bookkeeping for target status gates.
//!
//! Gates are ordered; a gate is only evaluated once every upstream gate is
//! True, and a regressing gate forces every downstream gate to Unknown with
//! reason `Blocked`.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

pub const REASON_BLOCKED: &str = "Blocked";

/// Readiness gates in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Gate {
    Validated,
    EncryptionConfigured,
    Bootstrapped,
    SnapshotSynced,
    EventStreamLive,
    Ready,
}

impl Gate {
    pub const ORDER: [Gate; 6] = [
        Gate::Validated,
        Gate::EncryptionConfigured,
        Gate::Bootstrapped,
        Gate::SnapshotSynced,
        Gate::EventStreamLive,
        Gate::Ready,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Gate::Validated => "Validated",
            Gate::EncryptionConfigured => "EncryptionConfigured",
            Gate::Bootstrapped => "Bootstrapped",
            Gate::SnapshotSynced => "SnapshotSynced",
            Gate::EventStreamLive => "EventStreamLive",
            Gate::Ready => "Ready",
        }
    }

    /// Gates strictly after this one in evaluation order.
    pub fn downstream(self) -> &'static [Gate] {
        let idx = Gate::ORDER.iter().position(|g| *g == self).unwrap_or(0);
        &Gate::ORDER[idx + 1..]
    }
}

pub fn find<'a>(conditions: &'a [Condition], gate: Gate) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == gate.as_str())
}

pub fn is_true(conditions: &[Condition], gate: Gate) -> bool {
    find(conditions, gate).is_some_and(|c| c.status == STATUS_TRUE)
}

/// Insert or update a gate condition. `last_transition_time` only moves when
/// the status value actually changes; reason, message, and
/// observed_generation are refreshed unconditionally.
pub fn upsert(
    conditions: &mut Vec<Condition>,
    gate: Gate,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
) {
    match conditions.iter_mut().find(|c| c.type_ == gate.as_str()) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Time(now);
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = observed_generation;
        }
        None => conditions.push(Condition {
            type_: gate.as_str().to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Time(now),
            observed_generation,
        }),
    }
}

/// Force every gate downstream of `gate` to Unknown with reason `Blocked`.
pub fn block_downstream(
    conditions: &mut Vec<Condition>,
    gate: Gate,
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
) {
    for downstream in gate.downstream() {
        upsert(
            conditions,
            *downstream,
            STATUS_UNKNOWN,
            REASON_BLOCKED,
            &format!("waiting for {} to succeed", gate.as_str()),
            observed_generation,
            now,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn transition_time_moves_only_on_status_change() {
        let mut conditions = Vec::new();
        upsert(
            &mut conditions,
            Gate::Validated,
            STATUS_TRUE,
            "Validated",
            "ok",
            Some(1),
            ts(100),
        );
        upsert(
            &mut conditions,
            Gate::Validated,
            STATUS_TRUE,
            "Validated",
            "still ok",
            Some(2),
            ts(200),
        );
        let c = find(&conditions, Gate::Validated).unwrap();
        assert_eq!(c.last_transition_time, Time(ts(100)));
        assert_eq!(c.message, "still ok");
        assert_eq!(c.observed_generation, Some(2));

        upsert(
            &mut conditions,
            Gate::Validated,
            STATUS_FALSE,
            "BranchNotAllowed",
            "nope",
            Some(3),
            ts(300),
        );
        let c = find(&conditions, Gate::Validated).unwrap();
        assert_eq!(c.last_transition_time, Time(ts(300)));
    }

    #[test]
    fn blocking_covers_every_downstream_gate() {
        let mut conditions = Vec::new();
        for gate in Gate::ORDER {
            upsert(
                &mut conditions,
                gate,
                STATUS_TRUE,
                "ok",
                "",
                None,
                ts(10),
            );
        }
        block_downstream(&mut conditions, Gate::EncryptionConfigured, None, ts(20));

        assert!(is_true(&conditions, Gate::Validated));
        assert!(is_true(&conditions, Gate::EncryptionConfigured));
        for gate in [
            Gate::Bootstrapped,
            Gate::SnapshotSynced,
            Gate::EventStreamLive,
            Gate::Ready,
        ] {
            let c = find(&conditions, gate).unwrap();
            assert_eq!(c.status, STATUS_UNKNOWN);
            assert_eq!(c.reason, REASON_BLOCKED);
        }
    }

    #[test]
    fn downstream_of_ready_is_empty() {
        assert!(Gate::Ready.downstream().is_empty());
    }
}
