// 👪 Guardian Linker - Resolve row contacts to guardian records
// Each row may carry guardian slots (name/email/phone/relationship). The
// linker matches them against guardians already connected to the registrant,
// updates contact details without ever blanking data out, and find-or-inits
// the relationship between guardian and registrant.

use anyhow::Result;
use log::debug;
use rusqlite::Connection;

use crate::db::{
    self, Guardian, GuardianRelationship, Registrant, RelationshipKind,
};
use crate::fields::{is_blank, name_key, GuardianSlot};

// ============================================================================
// RELATIONSHIP NORMALIZATION
// ============================================================================

/// Map a free-text relationship label to a relationship kind. Unrecognized
/// labels become `Other` with the original text retained.
pub fn normalize_relationship(raw: Option<&str>) -> (RelationshipKind, Option<String>) {
    let trimmed = raw.map(str::trim).unwrap_or("");
    if trimmed.is_empty() {
        return (RelationshipKind::Unknown, None);
    }
    match trimmed.to_lowercase().as_str() {
        "unknown" => (RelationshipKind::Unknown, None),
        "mother" | "mum" => (RelationshipKind::Mother, None),
        "father" | "dad" => (RelationshipKind::Father, None),
        "guardian" => (RelationshipKind::Guardian, None),
        _ => (RelationshipKind::Other, Some(trimmed.to_string())),
    }
}

// ============================================================================
// FAMILY CONNECTIONS
// ============================================================================

/// The guardian and relationship updates produced for one row, paired by
/// index and persisted together once the registrant itself is saved.
#[derive(Debug, Default)]
pub struct FamilyConnections {
    pub guardians: Vec<Guardian>,
    pub relationships: Vec<GuardianRelationship>,
}

impl FamilyConnections {
    pub fn is_empty(&self) -> bool {
        self.guardians.is_empty()
    }

    /// Persist guardians first, then their relationships to the registrant.
    pub fn save(&mut self, conn: &Connection, registrant_id: i64) -> Result<()> {
        for (guardian, relationship) in
            self.guardians.iter_mut().zip(self.relationships.iter_mut())
        {
            let guardian_id = db::save_guardian(conn, guardian)?;
            relationship.guardian_id = Some(guardian_id);
            relationship.registrant_id = Some(registrant_id);
            db::save_relationship(conn, relationship)?;
        }
        Ok(())
    }
}

// ============================================================================
// GUARDIAN LINKER
// ============================================================================

pub struct GuardianLinker {
    /// In bulk mode, guardian changes stand down while identity changes on
    /// the registrant are awaiting review.
    bulk_mode: bool,
}

impl GuardianLinker {
    pub fn new(bulk_mode: bool) -> Self {
        GuardianLinker { bulk_mode }
    }

    /// Resolve the row's guardian slots against the registrant's existing
    /// guardians. Nothing is persisted here; the caller saves the returned
    /// connections together with the registrant.
    pub fn link(
        &self,
        conn: &Connection,
        registrant: &Registrant,
        slots: &[GuardianSlot],
    ) -> Result<FamilyConnections> {
        if self.bulk_mode && !registrant.pending_changes.is_empty() {
            debug!("guardian linking suppressed while changes await review");
            return Ok(FamilyConnections::default());
        }

        let linked = match registrant.id {
            Some(id) => db::guardians_for_registrant(conn, id)?,
            None => Vec::new(),
        };

        let mut connections = FamilyConnections::default();
        for slot in slots.iter().filter(|s| s.exists()) {
            let mut guardian = Self::match_existing(&linked, slot).unwrap_or_default();
            Self::update_guardian(&mut guardian, slot);

            let mut relationship = self.find_or_init_relationship(conn, &guardian, registrant)?;
            let (kind, other_label) = normalize_relationship(slot.relationship.as_deref());
            relationship.kind = kind;
            relationship.other_label = other_label;

            connections.guardians.push(guardian);
            connections.relationships.push(relationship);
        }

        Ok(connections)
    }

    /// A guardian already linked to the registrant matches a slot when its
    /// email, phone, or full name lines up with the slot's value.
    fn match_existing(linked: &[Guardian], slot: &GuardianSlot) -> Option<Guardian> {
        linked
            .iter()
            .find(|g| {
                matches_value(&g.email, &slot.email)
                    || matches_value(&g.phone, &slot.phone)
                    || matches_name(&g.full_name, &slot.name)
            })
            .cloned()
    }

    /// Apply a slot's contact details. Incoming blanks never erase stored
    /// values; a guardian with no phone cannot receive updates.
    fn update_guardian(guardian: &mut Guardian, slot: &GuardianSlot) {
        if !is_blank(&slot.email) {
            guardian.email = slot.email.clone();
        }
        if !is_blank(&slot.name) {
            guardian.full_name = slot.name.clone();
        }
        if !is_blank(&slot.phone) {
            guardian.phone = slot.phone.clone();
        }
        if is_blank(&guardian.phone) {
            guardian.receives_updates = false;
        }
    }

    fn find_or_init_relationship(
        &self,
        conn: &Connection,
        guardian: &Guardian,
        registrant: &Registrant,
    ) -> Result<GuardianRelationship> {
        let mut relationship = match (guardian.id, registrant.id) {
            (Some(guardian_id), Some(registrant_id)) => {
                db::find_relationship(conn, guardian_id, registrant_id)?.unwrap_or_default()
            }
            _ => GuardianRelationship::default(),
        };
        relationship.guardian_id = guardian.id;
        relationship.registrant_id = registrant.id;
        Ok(relationship)
    }
}

fn matches_value(stored: &Option<String>, incoming: &Option<String>) -> bool {
    match (stored, incoming) {
        (Some(s), Some(i)) if !i.trim().is_empty() => s == i,
        _ => false,
    }
}

fn matches_name(stored: &Option<String>, incoming: &Option<String>) -> bool {
    match (stored, incoming) {
        (Some(s), Some(i)) if !i.trim().is_empty() => name_key(s) == name_key(i),
        _ => false,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{save_guardian, save_registrant, save_relationship, setup_database};
    use crate::staging::RegistrantAttribute;
    use serde_json::Value;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn saved_registrant(conn: &Connection) -> Registrant {
        let mut registrant = Registrant {
            given_name: "Amy".to_string(),
            family_name: "Lee".to_string(),
            ..Default::default()
        };
        save_registrant(conn, &mut registrant).unwrap();
        registrant
    }

    fn slot(name: &str, email: &str, phone: &str, relationship: &str) -> GuardianSlot {
        fn opt(v: &str) -> Option<String> {
            (!v.is_empty()).then(|| v.to_string())
        }
        GuardianSlot {
            name: opt(name),
            email: opt(email),
            phone: opt(phone),
            relationship: opt(relationship),
        }
    }

    fn link_and_assign(
        conn: &Connection,
        registrant: &Registrant,
        slots: &[GuardianSlot],
        bulk_mode: bool,
    ) -> FamilyConnections {
        GuardianLinker::new(bulk_mode)
            .link(conn, registrant, slots)
            .unwrap()
    }

    #[test]
    fn test_relationship_normalization() {
        let cases = [
            ("Mum", RelationshipKind::Mother),
            ("MOTHER", RelationshipKind::Mother),
            ("dad", RelationshipKind::Father),
            ("Father", RelationshipKind::Father),
            ("guardian", RelationshipKind::Guardian),
            ("unknown", RelationshipKind::Unknown),
        ];
        for (raw, expected) in cases {
            let (kind, label) = normalize_relationship(Some(raw));
            assert_eq!(kind, expected, "label {:?}", raw);
            assert_eq!(label, None);
        }

        assert_eq!(normalize_relationship(None), (RelationshipKind::Unknown, None));
        assert_eq!(normalize_relationship(Some("  ")), (RelationshipKind::Unknown, None));
        assert_eq!(
            normalize_relationship(Some("Step-aunt")),
            (RelationshipKind::Other, Some("Step-aunt".to_string())),
            "unrecognized label kept as free text"
        );
    }

    #[test]
    fn test_new_guardian_created_from_slot() {
        let conn = test_conn();
        let registrant = saved_registrant(&conn);

        let slots = [slot("Jane Lee", "jane@example.com", "07700900123", "Mum")];
        let connections = link_and_assign(&conn, &registrant, &slots, false);

        assert_eq!(connections.guardians.len(), 1);
        let guardian = &connections.guardians[0];
        assert!(guardian.id.is_none());
        assert_eq!(guardian.full_name, Some("Jane Lee".to_string()));
        assert_eq!(connections.relationships[0].kind, RelationshipKind::Mother);
    }

    #[test]
    fn test_blank_slots_ignored() {
        let conn = test_conn();
        let registrant = saved_registrant(&conn);

        let slots = [GuardianSlot::default(), slot("", "", "", "mother")];
        let connections = link_and_assign(&conn, &registrant, &slots, false);

        assert!(
            connections.is_empty(),
            "a relationship label alone does not make a guardian"
        );
    }

    #[test]
    fn test_matches_existing_guardian_by_email() {
        let conn = test_conn();
        let registrant = saved_registrant(&conn);

        let mut existing = Guardian {
            full_name: Some("J Lee".to_string()),
            email: Some("jane@example.com".to_string()),
            receives_updates: false,
            ..Default::default()
        };
        save_guardian(&conn, &mut existing).unwrap();
        let mut relationship = GuardianRelationship {
            guardian_id: existing.id,
            registrant_id: registrant.id,
            kind: RelationshipKind::Unknown,
            ..Default::default()
        };
        save_relationship(&conn, &mut relationship).unwrap();

        let slots = [slot("Jane Lee", "jane@example.com", "", "Mum")];
        let connections = link_and_assign(&conn, &registrant, &slots, false);

        let guardian = &connections.guardians[0];
        assert_eq!(guardian.id, existing.id, "matched, not duplicated");
        assert_eq!(
            guardian.full_name,
            Some("Jane Lee".to_string()),
            "non-blank name update applied"
        );
        assert_eq!(connections.relationships[0].id, relationship.id);
        assert_eq!(connections.relationships[0].kind, RelationshipKind::Mother);
    }

    #[test]
    fn test_blank_fields_never_erase_contact_data() {
        let conn = test_conn();
        let registrant = saved_registrant(&conn);

        let mut existing = Guardian {
            full_name: Some("Jane Lee".to_string()),
            email: Some("jane@example.com".to_string()),
            phone: Some("07700900123".to_string()),
            receives_updates: true,
            ..Default::default()
        };
        save_guardian(&conn, &mut existing).unwrap();
        let mut relationship = GuardianRelationship {
            guardian_id: existing.id,
            registrant_id: registrant.id,
            kind: RelationshipKind::Mother,
            ..Default::default()
        };
        save_relationship(&conn, &mut relationship).unwrap();

        let slots = [slot("Jane Lee", "", "", "Mum")];
        let connections = link_and_assign(&conn, &registrant, &slots, false);

        let guardian = &connections.guardians[0];
        assert_eq!(guardian.email, Some("jane@example.com".to_string()));
        assert_eq!(guardian.phone, Some("07700900123".to_string()));
        assert!(guardian.receives_updates, "phone still present, flag kept");
    }

    #[test]
    fn test_receives_updates_forced_false_without_phone() {
        let conn = test_conn();
        let registrant = saved_registrant(&conn);

        let slots = [slot("Jane Lee", "jane@example.com", "", "Mum")];
        let connections = link_and_assign(&conn, &registrant, &slots, false);

        assert!(!connections.guardians[0].receives_updates);
    }

    #[test]
    fn test_suppressed_in_bulk_mode_with_pending_changes() {
        let conn = test_conn();
        let mut registrant = saved_registrant(&conn);
        registrant.pending_changes.attributes.insert(
            RegistrantAttribute::GivenName,
            Value::String("Amelia".to_string()),
        );

        let slots = [slot("Jane Lee", "jane@example.com", "", "Mum")];

        let suppressed = link_and_assign(&conn, &registrant, &slots, true);
        assert!(suppressed.is_empty(), "bulk mode defers to the review");

        let linked = link_and_assign(&conn, &registrant, &slots, false);
        assert_eq!(linked.guardians.len(), 1, "non-bulk linking still runs");
    }

    #[test]
    fn test_two_slots_kept_in_row_order() {
        let conn = test_conn();
        let registrant = saved_registrant(&conn);

        let slots = [
            slot("Jane Lee", "jane@example.com", "", "Mum"),
            slot("John Lee", "john@example.com", "07700900456", "Dad"),
        ];
        let connections = link_and_assign(&conn, &registrant, &slots, false);

        assert_eq!(connections.guardians.len(), 2);
        assert_eq!(connections.guardians[0].full_name, Some("Jane Lee".to_string()));
        assert_eq!(connections.relationships[0].kind, RelationshipKind::Mother);
        assert_eq!(connections.relationships[1].kind, RelationshipKind::Father);
    }

    #[test]
    fn test_save_persists_guardians_and_relationships() {
        let conn = test_conn();
        let registrant = saved_registrant(&conn);
        let registrant_id = registrant.id.unwrap();

        let slots = [slot("Jane Lee", "jane@example.com", "07700900123", "Mum")];
        let mut connections = link_and_assign(&conn, &registrant, &slots, false);
        connections.save(&conn, registrant_id).unwrap();

        let linked = db::guardians_for_registrant(&conn, registrant_id).unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].email, Some("jane@example.com".to_string()));

        // Running the same row again matches instead of duplicating
        let mut again = link_and_assign(&conn, &registrant, &slots, false);
        again.save(&conn, registrant_id).unwrap();
        assert_eq!(db::guardians_for_registrant(&conn, registrant_id).unwrap().len(), 1);
    }
}
