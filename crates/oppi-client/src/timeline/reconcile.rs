//! Decide how a new history snapshot relates to what is rendered.

/// How to apply a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePlan {
    /// Same id sequence and nothing local changed.
    Unchanged,
    /// The snapshot extends the rendered sequence; render events `from..`.
    Incremental { from: usize },
    /// Map every event from scratch.
    FullRebuild,
}

/// Compare the id sequence of the last rendered snapshot with a new one.
///
/// A set `dirty` flag (local mutation since the last reconciliation) always
/// forces a full rebuild. A strictly longer sequence that starts with every
/// rendered id is an incremental append; anything else (divergent prefix,
/// shorter or reordered trace) is a full rebuild.
pub fn plan_reconciliation<S: AsRef<str>>(
    rendered: &[S],
    new: &[S],
    dirty: bool,
) -> ReconcilePlan {
    if dirty {
        return ReconcilePlan::FullRebuild;
    }
    let same_prefix = |len: usize| {
        rendered
            .iter()
            .zip(&new[..len])
            .all(|(a, b)| a.as_ref() == b.as_ref())
    };
    if rendered.len() == new.len() && same_prefix(new.len()) {
        return ReconcilePlan::Unchanged;
    }
    if new.len() > rendered.len() && same_prefix(rendered.len()) {
        return ReconcilePlan::Incremental {
            from: rendered.len(),
        };
    }
    ReconcilePlan::FullRebuild
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("e{i}")).collect()
    }

    #[test]
    fn test_pure_suffix_is_incremental() {
        assert_eq!(
            plan_reconciliation(&ids(3), &ids(5), false),
            ReconcilePlan::Incremental { from: 3 }
        );
    }

    #[test]
    fn test_identical_is_unchanged() {
        assert_eq!(
            plan_reconciliation(&ids(4), &ids(4), false),
            ReconcilePlan::Unchanged
        );
        let empty: Vec<String> = vec![];
        assert_eq!(
            plan_reconciliation(&empty, &empty, false),
            ReconcilePlan::Unchanged
        );
    }

    #[test]
    fn test_dirty_forces_rebuild() {
        assert_eq!(
            plan_reconciliation(&ids(3), &ids(5), true),
            ReconcilePlan::FullRebuild
        );
        assert_eq!(
            plan_reconciliation(&ids(3), &ids(3), true),
            ReconcilePlan::FullRebuild
        );
    }

    #[test]
    fn test_divergent_prefix_rebuilds() {
        let mut new = ids(5);
        new[1] = "other".to_string();
        assert_eq!(
            plan_reconciliation(&ids(3), &new, false),
            ReconcilePlan::FullRebuild
        );
    }

    #[test]
    fn test_shorter_trace_rebuilds() {
        assert_eq!(
            plan_reconciliation(&ids(5), &ids(3), false),
            ReconcilePlan::FullRebuild
        );
    }

    #[test]
    fn test_first_snapshot_is_incremental_from_zero() {
        let empty: Vec<String> = vec![];
        assert_eq!(
            plan_reconciliation(&empty, &ids(2), false),
            ReconcilePlan::Incremental { from: 0 }
        );
    }
}
