//! Pure worker selection over a registry snapshot

use super::WorkerSnapshot;

/// Where a start request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    Worker(String),
    /// The strategy is pinned to a worker that is not alive
    PinnedUnavailable(String),
    /// No live worker has a free slot
    NoCapacity,
}

/// Pick a worker: pinned name, then the caller's hint, then the least loaded.
///
/// A pinned worker is chosen whenever it is alive, full or not. A hint is
/// only honoured when that worker has a free slot. Ties on load go to the
/// lexicographically smallest name.
pub fn assign_worker(pinned: Option<&str>, hint: Option<&str>, workers: &[WorkerSnapshot]) -> Assignment {
    if let Some(pinned) = pinned {
        return match workers.iter().find(|w| w.identity.name == pinned) {
            Some(w) => Assignment::Worker(w.identity.name.clone()),
            None => Assignment::PinnedUnavailable(pinned.to_string()),
        };
    }

    if let Some(hint) = hint {
        if let Some(w) = workers
            .iter()
            .find(|w| w.identity.name == hint && w.free_slots() > 0)
        {
            return Assignment::Worker(w.identity.name.clone());
        }
    }

    workers
        .iter()
        .filter(|w| w.free_slots() > 0)
        .min_by(|a, b| {
            a.running
                .cmp(&b.running)
                .then_with(|| a.identity.name.cmp(&b.identity.name))
        })
        .map(|w| Assignment::Worker(w.identity.name.clone()))
        .unwrap_or(Assignment::NoCapacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::WorkerIdentity;
    use chrono::Utc;

    fn worker(name: &str, running: usize, capacity: usize) -> WorkerSnapshot {
        WorkerSnapshot {
            identity: WorkerIdentity::new(name, "h", "10.0.0.1"),
            control_addr: None,
            capacity,
            running,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_pinned_wins() {
        let workers = vec![worker("a", 0, 4), worker("b", 4, 4)];
        assert_eq!(
            assign_worker(Some("b"), Some("a"), &workers),
            Assignment::Worker("b".into())
        );
        assert_eq!(
            assign_worker(Some("c"), None, &workers),
            Assignment::PinnedUnavailable("c".into())
        );
    }

    #[test]
    fn test_hint_needs_capacity() {
        let workers = vec![worker("a", 1, 4), worker("b", 4, 4), worker("c", 2, 4)];
        assert_eq!(assign_worker(None, Some("c"), &workers), Assignment::Worker("c".into()));
        assert_eq!(assign_worker(None, Some("b"), &workers), Assignment::Worker("a".into()));
    }

    #[test]
    fn test_least_loaded_with_name_tiebreak() {
        let workers = vec![worker("z", 1, 4), worker("m", 1, 4), worker("q", 3, 4)];
        assert_eq!(assign_worker(None, None, &workers), Assignment::Worker("m".into()));
        assert_eq!(assign_worker(None, None, &[worker("x", 2, 2)]), Assignment::NoCapacity);
        assert_eq!(assign_worker(None, None, &[]), Assignment::NoCapacity);
    }
}
