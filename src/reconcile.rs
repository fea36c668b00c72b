// 🔄 Reconciler - One row through the whole pipeline
// Wires the matcher, stager, guardian linker and school-move resolver
// together: one row in, one unit of work out. Nothing touches storage until
// the caller persists the outcome, so a row either lands completely or not
// at all.

use anyhow::{Context, Result};
use log::debug;
use rusqlite::{Connection, Transaction};

use crate::db::{self, Event, ImportKind, Registrant, SchoolMove};
use crate::fields::ImportRow;
use crate::guardians::{FamilyConnections, GuardianLinker};
use crate::matching::{IdentityMatcher, MatchQuery};
use crate::school_moves::SchoolMoveResolver;
use crate::staging::ChangeStager;

// ============================================================================
// OPTIONS + OUTCOME
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Bulk uploads defer guardian and school-move changes while identity
    /// changes on the registrant are awaiting review.
    pub bulk_mode: bool,
    /// Stage the registration code for review instead of applying it.
    pub stage_registration: bool,
}

/// Everything one row produced, to be persisted as a single unit of work.
pub struct ReconciliationOutcome {
    pub registrant: Registrant,
    pub connections: FamilyConnections,
    pub school_move: Option<SchoolMove>,
    /// Whether the row matched an existing registrant or created a new one.
    pub matched_existing: bool,
}

impl ReconciliationOutcome {
    pub fn needs_review(&self) -> bool {
        !self.registrant.pending_changes.is_empty()
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct Reconciler {
    matcher: IdentityMatcher,
    stager: ChangeStager,
    linker: GuardianLinker,
    resolver: SchoolMoveResolver,
}

impl Reconciler {
    pub fn new(options: ReconcileOptions) -> Self {
        Reconciler {
            matcher: IdentityMatcher::new(),
            stager: ChangeStager::new(options.stage_registration),
            linker: GuardianLinker::new(options.bulk_mode),
            resolver: SchoolMoveResolver::new(options.bulk_mode),
        }
    }

    /// Run one row through match, stage, link and resolve. Reads from the
    /// register but never writes; persist the outcome with
    /// [`persist_outcome`].
    pub fn reconcile_row(&self, conn: &Connection, row: &ImportRow) -> Result<ReconciliationOutcome> {
        let query = MatchQuery::from_row(row);
        let existing = self.matcher.find_one(conn, &query)?;
        let matched_existing = existing.is_some();

        let mut registrant = self.stager.stage(existing, row);

        // When the row's identity changes are held for review, its guardian
        // and school fields ride along in the pending set so the reviewer
        // decides on the whole row at once.
        if !registrant.pending_changes.is_empty() {
            registrant.pending_changes.guardians = row.guardian_slots();
            let school_fields = row.school_move_fields();
            if !school_fields.is_empty() {
                registrant.pending_changes.school = Some(school_fields);
            }
            debug!(
                "row for {} {} held for review",
                registrant.given_name, registrant.family_name
            );
        }

        let connections = self
            .linker
            .link(conn, &registrant, &row.guardian_slots())?;
        let school_move = self
            .resolver
            .resolve(conn, &registrant, &row.school_move_fields())?;

        Ok(ReconciliationOutcome {
            registrant,
            connections,
            school_move,
            matched_existing,
        })
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

/// Persist one row's outcome inside the caller's transaction: registrant,
/// family connections, school move, import membership and the audit event.
pub fn persist_outcome(
    tx: &Transaction,
    outcome: &mut ReconciliationOutcome,
    import: Option<(ImportKind, i64)>,
) -> Result<()> {
    let registrant_id = db::save_registrant(tx, &mut outcome.registrant)
        .context("failed to save registrant")?;

    outcome
        .connections
        .save(tx, registrant_id)
        .context("failed to save family connections")?;

    if let Some(school_move) = &mut outcome.school_move {
        school_move.registrant_id = Some(registrant_id);
        db::save_school_move(tx, school_move).context("failed to save school move")?;
    }

    if let Some((kind, import_id)) = import {
        db::link_registrant_to_import(tx, kind, import_id, registrant_id)?;
    }

    let event = Event::new(
        "row_reconciled",
        "registrant",
        &registrant_id.to_string(),
        serde_json::json!({
            "matched_existing": outcome.matched_existing,
            "needs_review": outcome.needs_review(),
            "guardians": outcome.connections.guardians.len(),
            "school_move": outcome.school_move.is_some(),
        }),
        "importer",
    );
    db::insert_event(tx, &event)?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
