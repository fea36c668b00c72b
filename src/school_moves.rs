// 🏫 School Move Resolver - Detect changes of school or home education
// A row implies a school move when the registrant is new, the school or
// home-education status it reports differs from the record, or the
// registrant is not yet linked to the importing organisation. Moves are
// keyed so that re-importing the same row updates the existing move instead
// of piling up duplicates.

use anyhow::Result;
use log::{debug, warn};
use rusqlite::Connection;

use crate::db::{self, Registrant, SchoolMove, SchoolMoveSource};
use crate::fields::SchoolMoveFields;

pub struct SchoolMoveResolver {
    /// Mirrors the guardian linker: in bulk mode, school moves stand down
    /// while identity changes on the registrant are awaiting review.
    bulk_mode: bool,
}

impl SchoolMoveResolver {
    pub fn new(bulk_mode: bool) -> Self {
        SchoolMoveResolver { bulk_mode }
    }

    /// Decide whether the row implies a school move for this registrant and
    /// return the move to persist, reusing an existing one when the key
    /// already exists. Returns `None` when nothing changed.
    pub fn resolve(
        &self,
        conn: &Connection,
        registrant: &Registrant,
        fields: &SchoolMoveFields,
    ) -> Result<Option<SchoolMove>> {
        if fields.is_empty() {
            return Ok(None);
        }
        if self.bulk_mode && !registrant.pending_changes.is_empty() {
            debug!("school move suppressed while changes await review");
            return Ok(None);
        }
        if !self.move_implied(registrant, fields) {
            return Ok(None);
        }

        let home_educated = fields.home_educated.unwrap_or(false);
        let source = fields.source.unwrap_or(SchoolMoveSource::CohortImport);

        // A school reference only keys the move when it resolves to a known
        // school; an unresolvable reference falls back to the organisation
        // key rather than failing the row.
        let school_id = match fields.school_id {
            Some(id) => {
                let known = db::get_school(conn, id)?.map(|school| school.id);
                if known.is_none() {
                    warn!("unknown school {} on row; keying move on organisation", id);
                }
                known
            }
            None => None,
        };

        let mut school_move = self.find_or_init(
            conn,
            registrant,
            school_id,
            fields.organisation_id,
            home_educated,
            source,
        )?;
        school_move.home_educated = home_educated;
        school_move.source = source;
        Ok(Some(school_move))
    }

    fn move_implied(&self, registrant: &Registrant, fields: &SchoolMoveFields) -> bool {
        if registrant.is_new() {
            return true;
        }
        if fields.school_id != registrant.school_id {
            return true;
        }
        if fields
            .home_educated
            .map(|h| h != registrant.home_educated)
            .unwrap_or(false)
        {
            return true;
        }
        fields
            .organisation_id
            .map(|o| registrant.not_in_organisation(o))
            .unwrap_or(false)
    }

    /// Keyed on (registrant, school) when a known school is named,
    /// otherwise on (registrant, organisation, home_educated).
    fn find_or_init(
        &self,
        conn: &Connection,
        registrant: &Registrant,
        school_id: Option<i64>,
        organisation_id: Option<i64>,
        home_educated: bool,
        source: SchoolMoveSource,
    ) -> Result<SchoolMove> {
        let existing = match (registrant.id, school_id, organisation_id) {
            (Some(registrant_id), Some(school_id), _) => {
                db::find_school_move_by_school(conn, registrant_id, school_id)?
            }
            (Some(registrant_id), None, Some(organisation_id)) => {
                db::find_school_move_by_organisation(
                    conn,
                    registrant_id,
                    organisation_id,
                    home_educated,
                )?
            }
            _ => None,
        };

        Ok(existing.unwrap_or(SchoolMove {
            id: None,
            registrant_id: registrant.id,
            school_id,
            // The organisation key only applies when no school is named;
            // a known school carries its own organisation.
            organisation_id: if school_id.is_some() {
                None
            } else {
                organisation_id
            },
            home_educated,
            source,
        }))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_school, save_registrant, save_school_move, setup_database};
    use crate::staging::RegistrantAttribute;
    use serde_json::Value;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn saved_registrant(conn: &Connection, school_id: Option<i64>) -> Registrant {
        let mut registrant = Registrant {
            given_name: "Amy".to_string(),
            family_name: "Lee".to_string(),
            school_id,
            organisation_id: Some(1),
            ..Default::default()
        };
        save_registrant(conn, &mut registrant).unwrap();
        registrant
    }

    fn class_list_fields(school_id: i64) -> SchoolMoveFields {
        SchoolMoveFields {
            home_educated: Some(false),
            school_id: Some(school_id),
            organisation_id: Some(1),
            source: Some(SchoolMoveSource::ClassListImport),
        }
    }

    #[test]
    fn test_new_registrant_always_gets_a_move() {
        let conn = test_conn();
        let school_id = insert_school(&conn, "Hilltop Primary", Some(1)).unwrap();
        let registrant = Registrant::default();

        let resolver = SchoolMoveResolver::new(false);
        let school_move = resolver
            .resolve(&conn, &registrant, &class_list_fields(school_id))
            .unwrap()
            .unwrap();

        assert_eq!(school_move.school_id, Some(school_id));
        assert_eq!(school_move.source, SchoolMoveSource::ClassListImport);
    }

    #[test]
    fn test_unchanged_school_yields_no_move() {
        let conn = test_conn();
        let school_id = insert_school(&conn, "Hilltop Primary", Some(1)).unwrap();
        let registrant = saved_registrant(&conn, Some(school_id));

        let resolver = SchoolMoveResolver::new(false);
        let school_move = resolver
            .resolve(&conn, &registrant, &class_list_fields(school_id))
            .unwrap();

        assert!(school_move.is_none());
    }

    #[test]
    fn test_changed_school_triggers_a_move() {
        let conn = test_conn();
        let old_school = insert_school(&conn, "Hilltop Primary", Some(1)).unwrap();
        let new_school = insert_school(&conn, "Riverside Primary", Some(1)).unwrap();
        let registrant = saved_registrant(&conn, Some(old_school));

        let resolver = SchoolMoveResolver::new(false);
        let school_move = resolver
            .resolve(&conn, &registrant, &class_list_fields(new_school))
            .unwrap()
            .unwrap();

        assert_eq!(school_move.school_id, Some(new_school));
        assert_eq!(school_move.registrant_id, registrant.id);
    }

    #[test]
    fn test_home_educated_change_triggers_a_move() {
        let conn = test_conn();
        let school_id = insert_school(&conn, "Hilltop Primary", Some(1)).unwrap();
        let mut registrant = saved_registrant(&conn, Some(school_id));
        registrant.home_educated = true;
        save_registrant(&conn, &mut registrant).unwrap();

        let resolver = SchoolMoveResolver::new(false);
        let school_move = resolver
            .resolve(&conn, &registrant, &class_list_fields(school_id))
            .unwrap();

        assert!(school_move.is_some());
    }

    #[test]
    fn test_unlinked_organisation_triggers_a_move() {
        let conn = test_conn();
        let school_id = insert_school(&conn, "Hilltop Primary", Some(2)).unwrap();
        let mut registrant = saved_registrant(&conn, Some(school_id));
        registrant.organisation_id = None;
        save_registrant(&conn, &mut registrant).unwrap();

        let resolver = SchoolMoveResolver::new(false);
        let school_move = resolver
            .resolve(&conn, &registrant, &class_list_fields(school_id))
            .unwrap();

        assert!(school_move.is_some());
    }

    #[test]
    fn test_home_education_keyed_by_organisation() {
        let conn = test_conn();
        let school_id = insert_school(&conn, "Hilltop Primary", Some(1)).unwrap();
        let registrant = saved_registrant(&conn, Some(school_id));

        let fields = SchoolMoveFields {
            home_educated: Some(true),
            school_id: None,
            organisation_id: Some(1),
            source: Some(SchoolMoveSource::CohortImport),
        };

        let resolver = SchoolMoveResolver::new(false);
        let school_move = resolver.resolve(&conn, &registrant, &fields).unwrap().unwrap();

        assert_eq!(school_move.school_id, None);
        assert_eq!(school_move.organisation_id, Some(1));
        assert!(school_move.home_educated);
    }

    #[test]
    fn test_existing_move_reused_and_restamped() {
        let conn = test_conn();
        let old_school = insert_school(&conn, "Hilltop Primary", Some(1)).unwrap();
        let new_school = insert_school(&conn, "Riverside Primary", Some(1)).unwrap();
        let registrant = saved_registrant(&conn, Some(old_school));

        let mut earlier = SchoolMove {
            id: None,
            registrant_id: registrant.id,
            school_id: Some(new_school),
            organisation_id: None,
            home_educated: false,
            source: SchoolMoveSource::ParentalConsentForm,
        };
        save_school_move(&conn, &mut earlier).unwrap();

        let resolver = SchoolMoveResolver::new(false);
        let school_move = resolver
            .resolve(&conn, &registrant, &class_list_fields(new_school))
            .unwrap()
            .unwrap();

        assert_eq!(school_move.id, earlier.id, "same key, same move");
        assert_eq!(school_move.source, SchoolMoveSource::ClassListImport);
    }

    #[test]
    fn test_unknown_school_falls_back_to_organisation_key() {
        let conn = test_conn();
        let old_school = insert_school(&conn, "Hilltop Primary", Some(1)).unwrap();
        let registrant = saved_registrant(&conn, Some(old_school));

        // 999 resolves to no school row
        let resolver = SchoolMoveResolver::new(false);
        let mut school_move = resolver
            .resolve(&conn, &registrant, &class_list_fields(999))
            .unwrap()
            .unwrap();

        assert_eq!(school_move.school_id, None, "unresolvable reference dropped");
        assert_eq!(school_move.organisation_id, Some(1));
        save_school_move(&conn, &mut school_move).unwrap();
    }

    #[test]
    fn test_suppressed_in_bulk_mode_with_pending_changes() {
        let conn = test_conn();
        let new_school = insert_school(&conn, "Riverside Primary", Some(1)).unwrap();
        let mut registrant = saved_registrant(&conn, None);
        registrant.pending_changes.attributes.insert(
            RegistrantAttribute::GivenName,
            Value::String("Amelia".to_string()),
        );

        let resolver = SchoolMoveResolver::new(true);
        let school_move = resolver
            .resolve(&conn, &registrant, &class_list_fields(new_school))
            .unwrap();

        assert!(school_move.is_none(), "bulk mode defers to the review");
    }
}
