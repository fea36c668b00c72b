// 🔀 Registrant Merger - Collapse two duplicate records into one
// Re-points every dependent record from the discarded registrant onto the
// kept one, deduplicating where the kept registrant already covers the same
// ground, then removes the duplicate. The caller owns the transaction; all
// steps commit or none do.

use log::info;
use rusqlite::{params, OptionalExtension, Transaction};
use thiserror::Error;

use crate::db::{self, Event, ImportKind};

// ============================================================================
// ERROR TAXONOMY
// ============================================================================

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("cannot merge a registrant into itself (id {0})")]
    SameRegistrant(i64),
    #[error("registrant {0} not found")]
    NotFound(i64),
    #[error("storage error during merge")]
    Storage(#[from] rusqlite::Error),
    #[error("failed to record merge audit event")]
    Audit(#[source] anyhow::Error),
}

// ============================================================================
// MERGE
// ============================================================================

/// Merge `discard_id` into `keep_id` within the caller's transaction.
///
/// After the merge, the kept registrant's history (consents, triages,
/// vaccinations, assessments, import memberships) is the union of both
/// registrants' histories, with nothing lost and nothing duplicated, and
/// the discarded registrant no longer exists.
pub fn merge_registrants(
    tx: &Transaction,
    keep_id: i64,
    discard_id: i64,
) -> Result<(), MergeError> {
    if keep_id == discard_id {
        return Err(MergeError::SameRegistrant(keep_id));
    }
    ensure_exists(tx, keep_id)?;
    ensure_exists(tx, discard_id)?;

    // Append-only history re-points directly; no keys to collide on.
    tx.execute(
        "UPDATE consents SET registrant_id = ?1 WHERE registrant_id = ?2",
        params![keep_id, discard_id],
    )?;
    tx.execute(
        "UPDATE triages SET registrant_id = ?1 WHERE registrant_id = ?2",
        params![keep_id, discard_id],
    )?;

    reassign_school_moves(tx, keep_id, discard_id)?;
    reassign_guardian_relationships(tx, keep_id, discard_id)?;
    fold_session_participations(tx, keep_id, discard_id)?;
    union_import_memberships(tx, keep_id, discard_id)?;

    // The kept registrant inherits the discarded one's population group if
    // it has none of its own.
    tx.execute(
        "UPDATE registrants
         SET organisation_id = (SELECT organisation_id FROM registrants WHERE id = ?2)
         WHERE id = ?1 AND organisation_id IS NULL",
        params![keep_id, discard_id],
    )?;

    tx.execute("DELETE FROM registrants WHERE id = ?1", params![discard_id])?;

    let event = Event::new(
        "registrant_merged",
        "registrant",
        &keep_id.to_string(),
        serde_json::json!({ "kept_id": keep_id, "discarded_id": discard_id }),
        "merger",
    );
    db::insert_event(tx, &event).map_err(MergeError::Audit)?;

    info!("merged registrant {} into {}", discard_id, keep_id);
    Ok(())
}

fn ensure_exists(tx: &Transaction, registrant_id: i64) -> Result<(), MergeError> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT id FROM registrants WHERE id = ?1",
            params![registrant_id],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(MergeError::NotFound(registrant_id)),
    }
}

/// A school move the kept registrant already has (same school, organisation
/// and home-education key) is dropped; anything else is re-pointed.
fn reassign_school_moves(
    tx: &Transaction,
    keep_id: i64,
    discard_id: i64,
) -> Result<(), MergeError> {
    tx.execute(
        "DELETE FROM school_moves
         WHERE registrant_id = ?2
           AND EXISTS (
             SELECT 1 FROM school_moves k
             WHERE k.registrant_id = ?1
               AND k.school_id IS school_moves.school_id
               AND k.organisation_id IS school_moves.organisation_id
               AND k.home_educated = school_moves.home_educated
           )",
        params![keep_id, discard_id],
    )?;
    tx.execute(
        "UPDATE school_moves SET registrant_id = ?1 WHERE registrant_id = ?2",
        params![keep_id, discard_id],
    )?;
    Ok(())
}

/// A relationship to a guardian the kept registrant already has is dropped;
/// other relationships are re-pointed.
fn reassign_guardian_relationships(
    tx: &Transaction,
    keep_id: i64,
    discard_id: i64,
) -> Result<(), MergeError> {
    tx.execute(
        "DELETE FROM guardian_relationships
         WHERE registrant_id = ?2
           AND guardian_id IN (
             SELECT guardian_id FROM guardian_relationships WHERE registrant_id = ?1
           )",
        params![keep_id, discard_id],
    )?;
    tx.execute(
        "UPDATE guardian_relationships SET registrant_id = ?1 WHERE registrant_id = ?2",
        params![keep_id, discard_id],
    )?;
    Ok(())
}

/// Where both registrants attended the same session, the discarded side's
/// clinical sub-records fold into the kept side's participation; otherwise
/// the whole participation is re-pointed. No participation of the discarded
/// registrant survives.
fn fold_session_participations(
    tx: &Transaction,
    keep_id: i64,
    discard_id: i64,
) -> Result<(), MergeError> {
    struct Overlap {
        discard_participation: i64,
        keep_participation: i64,
    }

    let overlaps: Vec<Overlap> = {
        let mut stmt = tx.prepare(
            "SELECT d.id, k.id
             FROM session_participations d
             JOIN session_participations k ON k.session_id = d.session_id
             WHERE d.registrant_id = ?2 AND k.registrant_id = ?1",
        )?;
        let rows = stmt.query_map(params![keep_id, discard_id], |row| {
            Ok(Overlap {
                discard_participation: row.get(0)?,
                keep_participation: row.get(1)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    for overlap in &overlaps {
        tx.execute(
            "UPDATE assessments SET participation_id = ?1 WHERE participation_id = ?2",
            params![overlap.keep_participation, overlap.discard_participation],
        )?;
        tx.execute(
            "UPDATE vaccination_records SET participation_id = ?1 WHERE participation_id = ?2",
            params![overlap.keep_participation, overlap.discard_participation],
        )?;
        tx.execute(
            "DELETE FROM session_participations WHERE id = ?1",
            params![overlap.discard_participation],
        )?;
    }

    tx.execute(
        "UPDATE session_participations SET registrant_id = ?1 WHERE registrant_id = ?2",
        params![keep_id, discard_id],
    )?;
    Ok(())
}

/// Import-batch memberships union into the kept registrant's; the unique
/// key on (import, registrant) keeps existing memberships from duplicating.
fn union_import_memberships(
    tx: &Transaction,
    keep_id: i64,
    discard_id: i64,
) -> Result<(), MergeError> {
    for kind in ImportKind::ALL {
        let table = kind.membership_table();
        tx.execute(
            &format!(
                "INSERT OR IGNORE INTO {table} (import_id, registrant_id)
                 SELECT import_id, ?1 FROM {table} WHERE registrant_id = ?2"
            ),
            params![keep_id, discard_id],
        )?;
        tx.execute(
            &format!("DELETE FROM {table} WHERE registrant_id = ?1"),
            params![discard_id],
        )?;
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
