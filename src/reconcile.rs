//! Removal of answers that no longer belong to any track.

use crate::database::Database;
use crate::error::HubResult;

/// Delete every answer whose session has no track; returns how many went.
///
/// Safe to run any number of times. Runs as one statement, so it cannot
/// observe a half-written upload.
pub fn reconcile_orphans(db: &Database) -> HubResult<usize> {
    let deleted = db.delete_orphan_answers()?;
    if deleted > 0 {
        tracing::info!("Deleted {} orphaned answers", deleted);
    } else {
        tracing::debug!("No orphaned answers");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Answer, Track};

    #[test]
    fn test_orphan_removed_matched_kept() {
        let db = Database::new_in_memory().unwrap();
        db.insert_track(&Track::new("s2", 0, Some(10))).unwrap();
        db.upsert_answer(&Answer::new("s1", "u", "q")).unwrap();
        db.upsert_answer(&Answer::new("s2", "u", "q")).unwrap();

        assert_eq!(reconcile_orphans(&db).unwrap(), 1);
        assert!(db.get_answer("s1").unwrap().is_none());
        assert!(db.get_answer("s2").unwrap().is_some());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let db = Database::new_in_memory().unwrap();
        db.upsert_answer(&Answer::new("s1", "u", "q")).unwrap();

        assert_eq!(reconcile_orphans(&db).unwrap(), 1);
        assert_eq!(reconcile_orphans(&db).unwrap(), 0);
        assert_eq!(db.counts().unwrap().answers, 0);
    }

    #[test]
    fn test_empty_store() {
        let db = Database::new_in_memory().unwrap();
        assert_eq!(reconcile_orphans(&db).unwrap(), 0);
    }
}
