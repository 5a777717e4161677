//! Count- and age-based retention
//!
//! Pruning is a pure function over record metadata, called inline after a
//! write. No background cleanup task exists.

use chrono::{DateTime, Duration, Utc};

/// Limits applied to one group of records
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Keep at most this many records (newest win)
    pub max_count: usize,
    /// Drop records older than this
    pub max_age: Duration,
}

/// Anything with a creation timestamp and an id
pub trait Retained {
    fn retained_id(&self) -> &str;
    fn retained_at(&self) -> DateTime<Utc>;
}

/// Ids of records that fall outside `policy`, oldest first.
pub fn select_expired<T: Retained>(
    items: &[T],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut ordered: Vec<&T> = items.iter().collect();
    // Newest first; ties broken by id so the choice is stable
    ordered.sort_by(|a, b| {
        b.retained_at()
            .cmp(&a.retained_at())
            .then_with(|| b.retained_id().cmp(a.retained_id()))
    });

    let cutoff = now - policy.max_age;
    let mut expired: Vec<&T> = ordered
        .iter()
        .enumerate()
        .filter(|(idx, item)| *idx >= policy.max_count || item.retained_at() < cutoff)
        .map(|(_, item)| *item)
        .collect();

    expired.reverse();
    expired
        .into_iter()
        .map(|item| item.retained_id().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rec {
        id: String,
        at: DateTime<Utc>,
    }

    impl Retained for Rec {
        fn retained_id(&self) -> &str {
            &self.id
        }
        fn retained_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    fn recs(now: DateTime<Utc>, ages_secs: &[i64]) -> Vec<Rec> {
        ages_secs
            .iter()
            .enumerate()
            .map(|(i, age)| Rec {
                id: format!("r{}", i),
                at: now - Duration::seconds(*age),
            })
            .collect()
    }

    #[test]
    fn test_count_limit_drops_oldest() {
        let now = Utc::now();
        let items = recs(now, &[10, 40, 20, 30]);
        let policy = RetentionPolicy {
            max_count: 2,
            max_age: Duration::hours(1),
        };
        // r1 (40s) and r3 (30s) are the two oldest
        assert_eq!(select_expired(&items, &policy, now), vec!["r1", "r3"]);
    }

    #[test]
    fn test_age_limit() {
        let now = Utc::now();
        let items = recs(now, &[5, 7200, 10]);
        let policy = RetentionPolicy {
            max_count: 10,
            max_age: Duration::hours(1),
        };
        assert_eq!(select_expired(&items, &policy, now), vec!["r1"]);
    }

    #[test]
    fn test_nothing_expired() {
        let now = Utc::now();
        let items = recs(now, &[1, 2]);
        let policy = RetentionPolicy {
            max_count: 5,
            max_age: Duration::days(1),
        };
        assert!(select_expired(&items, &policy, now).is_empty());
    }
}
