//! Status conditions shared by every kind.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_SYNCED: &str = "Synced";
pub const CONDITION_ENDED: &str = "Ended";
pub const CONDITION_RECYCLABLE: &str = "recyclable";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

/// Implemented by every kind whose status carries conditions.
pub trait Conditional {
    fn conditions(&self) -> &[Condition];
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).map_or(false, |c| c.status == STATUS_TRUE)
}

/// Upserts a condition. The transition time only moves when the status flips.
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let status = if status { STATUS_TRUE } else { STATUS_FALSE };
    let message = message.into();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(c) => {
            if c.status != status {
                c.last_transition_time = Time(now);
            }
            c.status = status.to_string();
            c.reason = reason.to_string();
            c.message = message;
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message,
            last_transition_time: Time(now),
            observed_generation: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_transition_time_moves_only_on_flip() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);
        let t2 = t1 + Duration::seconds(30);
        let mut conds = vec![];

        set(&mut conds, CONDITION_READY, false, "Pending", "waiting", t0);
        set(&mut conds, CONDITION_READY, false, "Pending", "still waiting", t1);
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].last_transition_time, Time(t0));
        assert_eq!(conds[0].message, "still waiting");

        set(&mut conds, CONDITION_READY, true, "AllReady", "", t2);
        assert_eq!(conds[0].last_transition_time, Time(t2));
        assert!(is_true(&conds, CONDITION_READY));
        assert!(!is_true(&conds, CONDITION_SYNCED));
    }
}
