// 🗄️ Storage Layer - Population register over SQLite
// Entities, schema setup (WAL mode), row mapping, and the audit event log.
// Every function takes &Connection so it also works inside a transaction.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::staging::PendingChanges;

// ============================================================================
// GENDER CODE
// ============================================================================

/// Gender code on a registrant. `NotKnown` is the unset default; only
/// `Male`, `Female` and `NotSpecified` count as deliberately recorded values
/// for auto-accept purposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenderCode {
    #[default]
    NotKnown,
    Male,
    Female,
    NotSpecified,
}

impl GenderCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenderCode::NotKnown => "not_known",
            GenderCode::Male => "male",
            GenderCode::Female => "female",
            GenderCode::NotSpecified => "not_specified",
        }
    }

    /// Parse a normalized code; anything unrecognized maps to `NotKnown`.
    pub fn parse(raw: &str) -> GenderCode {
        match raw {
            "male" => GenderCode::Male,
            "female" => GenderCode::Female,
            "not_specified" => GenderCode::NotSpecified,
            _ => GenderCode::NotKnown,
        }
    }

    /// True for the deliberately recorded values: male, female, not_specified.
    pub fn is_specified(&self) -> bool {
        !matches!(self, GenderCode::NotKnown)
    }
}

/// Validity predicate for incoming raw gender codes.
pub fn gender_code_is_valid(raw: &str) -> bool {
    matches!(raw, "male" | "female" | "not_specified")
}

// ============================================================================
// RELATIONSHIP KIND
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Mother,
    Father,
    Guardian,
    Other,
    #[default]
    Unknown,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::Mother => "mother",
            RelationshipKind::Father => "father",
            RelationshipKind::Guardian => "guardian",
            RelationshipKind::Other => "other",
            RelationshipKind::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> RelationshipKind {
        match raw {
            "mother" => RelationshipKind::Mother,
            "father" => RelationshipKind::Father,
            "guardian" => RelationshipKind::Guardian,
            "other" => RelationshipKind::Other,
            _ => RelationshipKind::Unknown,
        }
    }
}

// ============================================================================
// SCHOOL MOVE SOURCE
// ============================================================================

/// Why a school move was proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchoolMoveSource {
    ParentalConsentForm,
    ClassListImport,
    CohortImport,
}

impl SchoolMoveSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchoolMoveSource::ParentalConsentForm => "parental_consent_form",
            SchoolMoveSource::ClassListImport => "class_list_import",
            SchoolMoveSource::CohortImport => "cohort_import",
        }
    }

    pub fn parse(raw: &str) -> Option<SchoolMoveSource> {
        match raw.trim().to_lowercase().as_str() {
            "parental_consent_form" => Some(SchoolMoveSource::ParentalConsentForm),
            "class_list_import" => Some(SchoolMoveSource::ClassListImport),
            "cohort_import" => Some(SchoolMoveSource::CohortImport),
            _ => None,
        }
    }
}

// ============================================================================
// REGISTRANT
// ============================================================================

/// The canonical person record.
///
/// A registrant carries at most one pending-change set at a time. While the
/// set is non-empty, the live attributes stay untouched by this engine;
/// only a confirmed review applies them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registrant {
    /// Rowid; `None` until first persisted.
    pub id: Option<i64>,
    /// NHS-style unique number; globally unique when present.
    pub unique_number: Option<String>,
    pub given_name: String,
    pub family_name: String,
    pub preferred_given_name: Option<String>,
    pub preferred_family_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub birth_academic_year: Option<i32>,
    pub gender_code: GenderCode,
    pub address_line_1: Option<String>,
    pub address_line_2: Option<String>,
    pub address_town: Option<String>,
    pub address_postcode: Option<String>,
    pub school_id: Option<i64>,
    pub home_educated: bool,
    /// School class/form code, academic-year scoped.
    pub registration: Option<String>,
    pub organisation_id: Option<i64>,
    /// Staged diff awaiting human review. Persisted as a JSON column.
    pub pending_changes: PendingChanges,
}

impl Registrant {
    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    /// True when the registrant is not linked to the given population group.
    pub fn not_in_organisation(&self, organisation_id: i64) -> bool {
        self.organisation_id != Some(organisation_id)
    }
}

// ============================================================================
// GUARDIAN + RELATIONSHIP
// ============================================================================

/// A parent/guardian contact record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Guardian {
    pub id: Option<i64>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Derived: forced false whenever phone is absent.
    pub receives_updates: bool,
}

/// Link between a guardian and a registrant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardianRelationship {
    pub id: Option<i64>,
    pub guardian_id: Option<i64>,
    pub registrant_id: Option<i64>,
    pub kind: RelationshipKind,
    /// Free-text label retained when the kind is `Other`.
    pub other_label: Option<String>,
}

// ============================================================================
// SCHOOL + SCHOOL MOVE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct School {
    pub id: i64,
    pub name: String,
    pub organisation_id: Option<i64>,
}

/// A pending instruction to change a registrant's school or home-education
/// status. Keyed on (registrant, school) when the school is known, otherwise
/// on (registrant, organisation, home_educated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolMove {
    pub id: Option<i64>,
    pub registrant_id: Option<i64>,
    pub school_id: Option<i64>,
    pub organisation_id: Option<i64>,
    pub home_educated: bool,
    pub source: SchoolMoveSource,
}

// ============================================================================
// IMPORT BATCH KIND
// ============================================================================

/// Which membership table an import batch links registrants through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    ClassList,
    Cohort,
    Immunisation,
}

impl ImportKind {
    pub fn membership_table(&self) -> &'static str {
        match self {
            ImportKind::ClassList => "class_import_registrants",
            ImportKind::Cohort => "cohort_import_registrants",
            ImportKind::Immunisation => "immunisation_import_registrants",
        }
    }

    pub const ALL: [ImportKind; 3] = [
        ImportKind::ClassList,
        ImportKind::Cohort,
        ImportKind::Immunisation,
    ];
}

// ============================================================================
// AUDIT EVENT
// ============================================================================

/// Audit trail entry: every merge and every reconciliation commit is an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA SETUP
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schools (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            organisation_id INTEGER
        );

        CREATE TABLE IF NOT EXISTS registrants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            unique_number TEXT UNIQUE,
            given_name TEXT NOT NULL,
            family_name TEXT NOT NULL,
            preferred_given_name TEXT,
            preferred_family_name TEXT,
            date_of_birth TEXT,
            birth_academic_year INTEGER,
            gender_code TEXT NOT NULL DEFAULT 'not_known',
            address_line_1 TEXT,
            address_line_2 TEXT,
            address_town TEXT,
            address_postcode TEXT,
            school_id INTEGER REFERENCES schools(id),
            home_educated INTEGER NOT NULL DEFAULT 0,
            registration TEXT,
            organisation_id INTEGER,
            pending_changes TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS guardians (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            full_name TEXT,
            email TEXT,
            phone TEXT,
            receives_updates INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS guardian_relationships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            guardian_id INTEGER NOT NULL REFERENCES guardians(id),
            registrant_id INTEGER NOT NULL REFERENCES registrants(id),
            kind TEXT NOT NULL DEFAULT 'unknown',
            other_label TEXT,
            UNIQUE(guardian_id, registrant_id)
        );

        CREATE TABLE IF NOT EXISTS school_moves (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            registrant_id INTEGER NOT NULL REFERENCES registrants(id),
            school_id INTEGER REFERENCES schools(id),
            organisation_id INTEGER,
            home_educated INTEGER NOT NULL DEFAULT 0,
            source TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(registrant_id, school_id),
            UNIQUE(registrant_id, home_educated, organisation_id)
        );

        CREATE TABLE IF NOT EXISTS consents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            registrant_id INTEGER NOT NULL REFERENCES registrants(id),
            response TEXT,
            recorded_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS triages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            registrant_id INTEGER NOT NULL REFERENCES registrants(id),
            outcome TEXT,
            recorded_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS session_participations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            registrant_id INTEGER NOT NULL REFERENCES registrants(id),
            session_id INTEGER NOT NULL,
            UNIQUE(registrant_id, session_id)
        );

        CREATE TABLE IF NOT EXISTS assessments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            participation_id INTEGER NOT NULL REFERENCES session_participations(id),
            outcome TEXT,
            recorded_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS vaccination_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            participation_id INTEGER NOT NULL REFERENCES session_participations(id),
            vaccine TEXT,
            administered_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS class_import_registrants (
            import_id INTEGER NOT NULL,
            registrant_id INTEGER NOT NULL REFERENCES registrants(id),
            UNIQUE(import_id, registrant_id)
        );

        CREATE TABLE IF NOT EXISTS cohort_import_registrants (
            import_id INTEGER NOT NULL,
            registrant_id INTEGER NOT NULL REFERENCES registrants(id),
            UNIQUE(import_id, registrant_id)
        );

        CREATE TABLE IF NOT EXISTS immunisation_import_registrants (
            import_id INTEGER NOT NULL,
            registrant_id INTEGER NOT NULL REFERENCES registrants(id),
            UNIQUE(import_id, registrant_id)
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_registrants_dob ON registrants(date_of_birth);
        CREATE INDEX IF NOT EXISTS idx_registrants_unique_number ON registrants(unique_number);
        CREATE INDEX IF NOT EXISTS idx_consents_registrant ON consents(registrant_id);
        CREATE INDEX IF NOT EXISTS idx_triages_registrant ON triages(registrant_id);
        CREATE INDEX IF NOT EXISTS idx_school_moves_registrant ON school_moves(registrant_id);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        ",
    )?;

    Ok(())
}

// ============================================================================
// REGISTRANT QUERIES
// ============================================================================

const REGISTRANT_COLUMNS: &str = "id, unique_number, given_name, family_name, \
     preferred_given_name, preferred_family_name, date_of_birth, \
     birth_academic_year, gender_code, address_line_1, address_line_2, \
     address_town, address_postcode, school_id, home_educated, registration, \
     organisation_id, pending_changes";

fn registrant_from_row(row: &rusqlite::Row) -> rusqlite::Result<Registrant> {
    let date_of_birth: Option<String> = row.get(6)?;
    let gender_code: String = row.get(8)?;
    let pending_json: Option<String> = row.get(17)?;

    Ok(Registrant {
        id: Some(row.get(0)?),
        unique_number: row.get(1)?,
        given_name: row.get(2)?,
        family_name: row.get(3)?,
        preferred_given_name: row.get(4)?,
        preferred_family_name: row.get(5)?,
        date_of_birth: date_of_birth
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        birth_academic_year: row.get(7)?,
        gender_code: GenderCode::parse(&gender_code),
        address_line_1: row.get(9)?,
        address_line_2: row.get(10)?,
        address_town: row.get(11)?,
        address_postcode: row.get(12)?,
        school_id: row.get(13)?,
        home_educated: row.get(14)?,
        registration: row.get(15)?,
        organisation_id: row.get(16)?,
        pending_changes: pending_json
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default(),
    })
}

/// Insert or update a registrant; sets the id on insert and returns it.
pub fn save_registrant(conn: &Connection, registrant: &mut Registrant) -> Result<i64> {
    let date_of_birth = registrant
        .date_of_birth
        .map(|d| d.format("%Y-%m-%d").to_string());
    let pending_json = if registrant.pending_changes.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&registrant.pending_changes)?)
    };

    match registrant.id {
        Some(id) => {
            conn.execute(
                "UPDATE registrants SET
                    unique_number = ?1, given_name = ?2, family_name = ?3,
                    preferred_given_name = ?4, preferred_family_name = ?5,
                    date_of_birth = ?6, birth_academic_year = ?7,
                    gender_code = ?8, address_line_1 = ?9, address_line_2 = ?10,
                    address_town = ?11, address_postcode = ?12, school_id = ?13,
                    home_educated = ?14, registration = ?15, organisation_id = ?16,
                    pending_changes = ?17, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?18",
                params![
                    registrant.unique_number,
                    registrant.given_name,
                    registrant.family_name,
                    registrant.preferred_given_name,
                    registrant.preferred_family_name,
                    date_of_birth,
                    registrant.birth_academic_year,
                    registrant.gender_code.as_str(),
                    registrant.address_line_1,
                    registrant.address_line_2,
                    registrant.address_town,
                    registrant.address_postcode,
                    registrant.school_id,
                    registrant.home_educated,
                    registrant.registration,
                    registrant.organisation_id,
                    pending_json,
                    id,
                ],
            )?;
            Ok(id)
        }
        None => {
            conn.execute(
                "INSERT INTO registrants (
                    unique_number, given_name, family_name,
                    preferred_given_name, preferred_family_name,
                    date_of_birth, birth_academic_year, gender_code,
                    address_line_1, address_line_2, address_town,
                    address_postcode, school_id, home_educated, registration,
                    organisation_id, pending_changes
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    registrant.unique_number,
                    registrant.given_name,
                    registrant.family_name,
                    registrant.preferred_given_name,
                    registrant.preferred_family_name,
                    date_of_birth,
                    registrant.birth_academic_year,
                    registrant.gender_code.as_str(),
                    registrant.address_line_1,
                    registrant.address_line_2,
                    registrant.address_town,
                    registrant.address_postcode,
                    registrant.school_id,
                    registrant.home_educated,
                    registrant.registration,
                    registrant.organisation_id,
                    pending_json,
                ],
            )?;
            let id = conn.last_insert_rowid();
            registrant.id = Some(id);
            Ok(id)
        }
    }
}

pub fn get_registrant(conn: &Connection, id: i64) -> Result<Option<Registrant>> {
    let query = format!("SELECT {REGISTRANT_COLUMNS} FROM registrants WHERE id = ?1");
    let registrant = conn
        .query_row(&query, params![id], registrant_from_row)
        .optional()?;
    Ok(registrant)
}

/// Registrants holding exactly this unique number.
pub fn registrants_by_unique_number(
    conn: &Connection,
    unique_number: &str,
) -> Result<Vec<Registrant>> {
    let query = format!(
        "SELECT {REGISTRANT_COLUMNS} FROM registrants WHERE unique_number = ?1 ORDER BY id"
    );
    let mut stmt = conn.prepare(&query)?;
    let registrants = stmt
        .query_map(params![unique_number], registrant_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(registrants)
}

/// All registrants born on a given date, ordered by id. Name comparison is
/// done in Rust so that whitespace normalization matches the row's.
pub fn registrants_born_on(conn: &Connection, date_of_birth: NaiveDate) -> Result<Vec<Registrant>> {
    let query = format!(
        "SELECT {REGISTRANT_COLUMNS} FROM registrants WHERE date_of_birth = ?1 ORDER BY id"
    );
    let mut stmt = conn.prepare(&query)?;
    let registrants = stmt
        .query_map(
            params![date_of_birth.format("%Y-%m-%d").to_string()],
            registrant_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(registrants)
}

pub fn registrant_count(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM registrants", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// GUARDIAN QUERIES
// ============================================================================

fn guardian_from_row(row: &rusqlite::Row) -> rusqlite::Result<Guardian> {
    Ok(Guardian {
        id: Some(row.get(0)?),
        full_name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        receives_updates: row.get(4)?,
    })
}

pub fn save_guardian(conn: &Connection, guardian: &mut Guardian) -> Result<i64> {
    match guardian.id {
        Some(id) => {
            conn.execute(
                "UPDATE guardians SET full_name = ?1, email = ?2, phone = ?3,
                     receives_updates = ?4 WHERE id = ?5",
                params![
                    guardian.full_name,
                    guardian.email,
                    guardian.phone,
                    guardian.receives_updates,
                    id,
                ],
            )?;
            Ok(id)
        }
        None => {
            conn.execute(
                "INSERT INTO guardians (full_name, email, phone, receives_updates)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    guardian.full_name,
                    guardian.email,
                    guardian.phone,
                    guardian.receives_updates,
                ],
            )?;
            let id = conn.last_insert_rowid();
            guardian.id = Some(id);
            Ok(id)
        }
    }
}

/// Guardians already linked to a registrant, in relationship order.
pub fn guardians_for_registrant(conn: &Connection, registrant_id: i64) -> Result<Vec<Guardian>> {
    let mut stmt = conn.prepare(
        "SELECT g.id, g.full_name, g.email, g.phone, g.receives_updates
         FROM guardians g
         JOIN guardian_relationships r ON r.guardian_id = g.id
         WHERE r.registrant_id = ?1
         ORDER BY r.id",
    )?;
    let guardians = stmt
        .query_map(params![registrant_id], guardian_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(guardians)
}

pub fn find_relationship(
    conn: &Connection,
    guardian_id: i64,
    registrant_id: i64,
) -> Result<Option<GuardianRelationship>> {
    let relationship = conn
        .query_row(
            "SELECT id, guardian_id, registrant_id, kind, other_label
             FROM guardian_relationships
             WHERE guardian_id = ?1 AND registrant_id = ?2",
            params![guardian_id, registrant_id],
            |row| {
                let kind: String = row.get(3)?;
                Ok(GuardianRelationship {
                    id: Some(row.get(0)?),
                    guardian_id: Some(row.get(1)?),
                    registrant_id: Some(row.get(2)?),
                    kind: RelationshipKind::parse(&kind),
                    other_label: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(relationship)
}

pub fn save_relationship(
    conn: &Connection,
    relationship: &mut GuardianRelationship,
) -> Result<i64> {
    match relationship.id {
        Some(id) => {
            conn.execute(
                "UPDATE guardian_relationships
                 SET guardian_id = ?1, registrant_id = ?2, kind = ?3, other_label = ?4
                 WHERE id = ?5",
                params![
                    relationship.guardian_id,
                    relationship.registrant_id,
                    relationship.kind.as_str(),
                    relationship.other_label,
                    id,
                ],
            )?;
            Ok(id)
        }
        None => {
            conn.execute(
                "INSERT INTO guardian_relationships (guardian_id, registrant_id, kind, other_label)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(guardian_id, registrant_id)
                 DO UPDATE SET kind = excluded.kind, other_label = excluded.other_label",
                params![
                    relationship.guardian_id,
                    relationship.registrant_id,
                    relationship.kind.as_str(),
                    relationship.other_label,
                ],
            )?;
            let id = conn.last_insert_rowid();
            relationship.id = Some(id);
            Ok(id)
        }
    }
}

// ============================================================================
// SCHOOL + SCHOOL MOVE QUERIES
// ============================================================================

pub fn insert_school(conn: &Connection, name: &str, organisation_id: Option<i64>) -> Result<i64> {
    conn.execute(
        "INSERT INTO schools (name, organisation_id) VALUES (?1, ?2)",
        params![name, organisation_id],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_school(conn: &Connection, id: i64) -> Result<Option<School>> {
    let school = conn
        .query_row(
            "SELECT id, name, organisation_id FROM schools WHERE id = ?1",
            params![id],
            |row| {
                Ok(School {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    organisation_id: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(school)
}

fn school_move_from_row(row: &rusqlite::Row) -> rusqlite::Result<SchoolMove> {
    let source: String = row.get(5)?;
    Ok(SchoolMove {
        id: Some(row.get(0)?),
        registrant_id: Some(row.get(1)?),
        school_id: row.get(2)?,
        organisation_id: row.get(3)?,
        home_educated: row.get(4)?,
        source: SchoolMoveSource::parse(&source).unwrap_or(SchoolMoveSource::CohortImport),
    })
}

pub fn find_school_move_by_school(
    conn: &Connection,
    registrant_id: i64,
    school_id: i64,
) -> Result<Option<SchoolMove>> {
    let school_move = conn
        .query_row(
            "SELECT id, registrant_id, school_id, organisation_id, home_educated, source
             FROM school_moves WHERE registrant_id = ?1 AND school_id = ?2",
            params![registrant_id, school_id],
            school_move_from_row,
        )
        .optional()?;
    Ok(school_move)
}

pub fn find_school_move_by_organisation(
    conn: &Connection,
    registrant_id: i64,
    organisation_id: i64,
    home_educated: bool,
) -> Result<Option<SchoolMove>> {
    let school_move = conn
        .query_row(
            "SELECT id, registrant_id, school_id, organisation_id, home_educated, source
             FROM school_moves
             WHERE registrant_id = ?1 AND organisation_id = ?2 AND home_educated = ?3",
            params![registrant_id, organisation_id, home_educated],
            school_move_from_row,
        )
        .optional()?;
    Ok(school_move)
}

pub fn save_school_move(conn: &Connection, school_move: &mut SchoolMove) -> Result<i64> {
    match school_move.id {
        Some(id) => {
            conn.execute(
                "UPDATE school_moves
                 SET registrant_id = ?1, school_id = ?2, organisation_id = ?3,
                     home_educated = ?4, source = ?5
                 WHERE id = ?6",
                params![
                    school_move.registrant_id,
                    school_move.school_id,
                    school_move.organisation_id,
                    school_move.home_educated,
                    school_move.source.as_str(),
                    id,
                ],
            )?;
            Ok(id)
        }
        None => {
            conn.execute(
                "INSERT INTO school_moves
                    (registrant_id, school_id, organisation_id, home_educated, source)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    school_move.registrant_id,
                    school_move.school_id,
                    school_move.organisation_id,
                    school_move.home_educated,
                    school_move.source.as_str(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            school_move.id = Some(id);
            Ok(id)
        }
    }
}

// ============================================================================
// IMPORT MEMBERSHIP
// ============================================================================

/// Record that a registrant was touched by an import batch. Idempotent.
pub fn link_registrant_to_import(
    conn: &Connection,
    kind: ImportKind,
    import_id: i64,
    registrant_id: i64,
) -> Result<()> {
    let query = format!(
        "INSERT OR IGNORE INTO {} (import_id, registrant_id) VALUES (?1, ?2)",
        kind.membership_table()
    );
    conn.execute(&query, params![import_id, registrant_id])?;
    Ok(())
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(events)
}

// ============================================================================
// TESTS
// ============================================================================
