// 📋 Import Fields - Typed row for one uploaded child record
// Strongly-typed replacement for the loosely-typed field bags that bulk
// uploads arrive as: every field is explicitly optional, guardians are an
// ordered list of slots, and all normalization happens once at load time.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::db::SchoolMoveSource;

// ============================================================================
// STRING NORMALIZATION
// ============================================================================

/// Trim a raw field; blank fields become `None`.
pub fn presence(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// True when an optional field is absent or blank.
pub fn is_blank(value: &Option<String>) -> bool {
    match value {
        Some(v) => v.trim().is_empty(),
        None => true,
    }
}

/// Collapse internal whitespace and trim (used for name comparison).
pub fn normalize_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case/whitespace-insensitive comparison key for names.
pub fn name_key(raw: &str) -> String {
    normalize_whitespace(raw).to_lowercase()
}

/// Normalize a UK-style postcode: uppercase, strip internal whitespace,
/// re-insert the single space before the 3-character inward code.
pub fn normalize_postcode(raw: &str) -> Option<String> {
    let compact: Vec<char> = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect();

    if compact.is_empty() {
        return None;
    }

    // Split on character count; the input is arbitrary CSV text.
    if compact.len() > 3 {
        let (outward, inward) = compact.split_at(compact.len() - 3);
        let outward: String = outward.iter().collect();
        let inward: String = inward.iter().collect();
        Some(format!("{} {}", outward, inward))
    } else {
        Some(compact.into_iter().collect())
    }
}

/// Phones compare with all whitespace stripped.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        None
    } else {
        Some(compact)
    }
}

/// Emails compare lowercased.
pub fn normalize_email(raw: &str) -> Option<String> {
    presence(raw).map(|e| e.to_lowercase())
}

/// Unique numbers (NHS-style) compare with all whitespace stripped.
pub fn normalize_unique_number(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        None
    } else {
        Some(compact)
    }
}

/// Gender codes compare lowercased with spaces collapsed to underscores.
pub fn normalize_gender_code(raw: &str) -> Option<String> {
    presence(raw).map(|g| g.to_lowercase().replace(' ', "_"))
}

/// Academic year a date falls in (academic years start 1 September).
pub fn academic_year_of(date: NaiveDate) -> i32 {
    if date.month() >= 9 {
        date.year()
    } else {
        date.year() - 1
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .ok()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

// ============================================================================
// GUARDIAN SLOT
// ============================================================================

/// One guardian contact supplied by a row. Rows may carry any number of
/// slots (uploads currently send up to two); the order is meaningful.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardianSlot {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub relationship: Option<String>,
}

impl GuardianSlot {
    /// A slot exists when it supplies any non-blank contact detail.
    pub fn exists(&self) -> bool {
        !is_blank(&self.name) || !is_blank(&self.email) || !is_blank(&self.phone)
    }
}

// ============================================================================
// SCHOOL MOVE FIELDS
// ============================================================================

/// The school-related fields of a row, grouped so they can be folded into a
/// pending-change set when identity changes are awaiting review.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchoolMoveFields {
    pub home_educated: Option<bool>,
    pub school_id: Option<i64>,
    pub organisation_id: Option<i64>,
    pub source: Option<SchoolMoveSource>,
}

impl SchoolMoveFields {
    pub fn is_empty(&self) -> bool {
        self.home_educated.is_none() && self.school_id.is_none() && self.organisation_id.is_none()
    }
}

// ============================================================================
// IMPORT ROW
// ============================================================================

/// One normalized row from a bulk upload.
///
/// All fields are advisory: blank values are `None` and are simply skipped
/// by downstream components. Normalization (postcode formatting, email
/// lowercasing, phone whitespace stripping) is done once, here, so that
/// matching and staging only ever see canonical values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportRow {
    pub unique_number: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub preferred_given_name: Option<String>,
    pub preferred_family_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub birth_academic_year: Option<i32>,
    pub gender_code: Option<String>,
    pub address_line_1: Option<String>,
    pub address_line_2: Option<String>,
    pub address_town: Option<String>,
    pub address_postcode: Option<String>,
    pub registration: Option<String>,
    pub guardians: Vec<GuardianSlot>,
    pub school_move_home_educated: Option<bool>,
    pub school_move_source: Option<SchoolMoveSource>,
    pub school_move_school_id: Option<i64>,
    pub school_move_organisation_id: Option<i64>,
}

impl ImportRow {
    /// Birth academic year: explicit value wins, otherwise derived from the
    /// date of birth.
    pub fn birth_academic_year_value(&self) -> Option<i32> {
        self.birth_academic_year
            .or_else(|| self.date_of_birth.map(academic_year_of))
    }

    /// Guardian slots that actually carry data, in row order.
    pub fn guardian_slots(&self) -> Vec<GuardianSlot> {
        self.guardians.iter().filter(|s| s.exists()).cloned().collect()
    }

    /// The school-related fields of this row.
    pub fn school_move_fields(&self) -> SchoolMoveFields {
        SchoolMoveFields {
            home_educated: self.school_move_home_educated,
            school_id: self.school_move_school_id,
            organisation_id: self.school_move_organisation_id,
            source: self.school_move_source,
        }
    }

    /// Hash for skipping duplicate rows within one batch.
    /// NOTE: this is for DEDUPLICATION of rows, not registrant identity.
    pub fn idempotency_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_string(self).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// CSV LOADING
// ============================================================================

/// Raw CSV row, one column per named field. Guardian slots arrive as the
/// flat `guardian_1_*` / `guardian_2_*` columns and are folded into the
/// ordered slot list during normalization.
#[derive(Debug, Default, Deserialize)]
struct RawRow {
    #[serde(default)]
    unique_number: Option<String>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    preferred_given_name: Option<String>,
    #[serde(default)]
    preferred_family_name: Option<String>,
    #[serde(default)]
    date_of_birth: Option<String>,
    #[serde(default)]
    birth_academic_year: Option<String>,
    #[serde(default)]
    gender_code: Option<String>,
    #[serde(default)]
    address_line_1: Option<String>,
    #[serde(default)]
    address_line_2: Option<String>,
    #[serde(default)]
    address_town: Option<String>,
    #[serde(default)]
    address_postcode: Option<String>,
    #[serde(default)]
    registration: Option<String>,
    #[serde(default)]
    guardian_1_name: Option<String>,
    #[serde(default)]
    guardian_1_email: Option<String>,
    #[serde(default)]
    guardian_1_phone: Option<String>,
    #[serde(default)]
    guardian_1_relationship: Option<String>,
    #[serde(default)]
    guardian_2_name: Option<String>,
    #[serde(default)]
    guardian_2_email: Option<String>,
    #[serde(default)]
    guardian_2_phone: Option<String>,
    #[serde(default)]
    guardian_2_relationship: Option<String>,
    #[serde(default)]
    school_move_home_educated: Option<String>,
    #[serde(default)]
    school_move_source: Option<String>,
    #[serde(default)]
    school_move_school_id: Option<i64>,
    #[serde(default)]
    school_move_organisation_id: Option<i64>,
}

fn opt(field: &Option<String>) -> Option<String> {
    field.as_deref().and_then(presence)
}

impl RawRow {
    fn guardian_slot(
        name: &Option<String>,
        email: &Option<String>,
        phone: &Option<String>,
        relationship: &Option<String>,
    ) -> GuardianSlot {
        GuardianSlot {
            name: opt(name).map(|n| normalize_whitespace(&n)),
            email: email.as_deref().and_then(normalize_email),
            phone: phone.as_deref().and_then(normalize_phone),
            relationship: opt(relationship),
        }
    }

    fn into_row(self) -> ImportRow {
        let guardians = vec![
            Self::guardian_slot(
                &self.guardian_1_name,
                &self.guardian_1_email,
                &self.guardian_1_phone,
                &self.guardian_1_relationship,
            ),
            Self::guardian_slot(
                &self.guardian_2_name,
                &self.guardian_2_email,
                &self.guardian_2_phone,
                &self.guardian_2_relationship,
            ),
        ]
        .into_iter()
        .filter(GuardianSlot::exists)
        .collect();

        ImportRow {
            unique_number: self.unique_number.as_deref().and_then(normalize_unique_number),
            given_name: opt(&self.given_name),
            family_name: opt(&self.family_name),
            preferred_given_name: opt(&self.preferred_given_name),
            preferred_family_name: opt(&self.preferred_family_name),
            date_of_birth: self.date_of_birth.as_deref().and_then(parse_date),
            birth_academic_year: self
                .birth_academic_year
                .as_deref()
                .and_then(|y| y.trim().parse().ok()),
            gender_code: self.gender_code.as_deref().and_then(normalize_gender_code),
            address_line_1: opt(&self.address_line_1),
            address_line_2: opt(&self.address_line_2),
            address_town: opt(&self.address_town),
            address_postcode: self.address_postcode.as_deref().and_then(normalize_postcode),
            registration: opt(&self.registration),
            guardians,
            school_move_home_educated: self
                .school_move_home_educated
                .as_deref()
                .and_then(parse_bool),
            school_move_source: self
                .school_move_source
                .as_deref()
                .and_then(SchoolMoveSource::parse),
            school_move_school_id: self.school_move_school_id,
            school_move_organisation_id: self.school_move_organisation_id,
        }
    }
}

/// Load and normalize rows from a CSV upload.
pub fn load_rows(csv_path: &Path) -> Result<Vec<ImportRow>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut rows = Vec::new();

    for result in rdr.deserialize() {
        let raw: RawRow = result.context("Failed to deserialize import row")?;
        rows.push(raw.into_row());
    }

    Ok(rows)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_blank_handling() {
        assert_eq!(presence("  "), None);
        assert_eq!(presence(""), None);
        assert_eq!(presence(" Amy "), Some("Amy".to_string()));
    }

    #[test]
    fn test_normalize_postcode() {
        assert_eq!(normalize_postcode("sw1a1aa"), Some("SW1A 1AA".to_string()));
        assert_eq!(normalize_postcode(" SW1A  1AA "), Some("SW1A 1AA".to_string()));
        assert_eq!(normalize_postcode(""), None);
    }

    #[test]
    fn test_normalize_postcode_handles_non_ascii() {
        // Multi-byte characters must split on character boundaries
        assert_eq!(normalize_postcode("AÀÀ"), Some("AÀÀ".to_string()));
        assert_eq!(normalize_postcode("éà1a 1àa"), Some("ÉÀ1A 1ÀA".to_string()));
        assert_eq!(normalize_postcode("ü"), Some("Ü".to_string()));
    }

    #[test]
    fn test_normalize_phone_strips_whitespace() {
        assert_eq!(
            normalize_phone("07700 900 982"),
            Some("07700900982".to_string())
        );
        assert_eq!(normalize_phone("   "), None);
    }

    #[test]
    fn test_normalize_gender_code() {
        assert_eq!(
            normalize_gender_code("Not Specified"),
            Some("not_specified".to_string())
        );
        assert_eq!(normalize_gender_code("FEMALE"), Some("female".to_string()));
    }

    #[test]
    fn test_academic_year_boundary() {
        let august = NaiveDate::from_ymd_opt(2014, 8, 31).unwrap();
        let september = NaiveDate::from_ymd_opt(2014, 9, 1).unwrap();

        assert_eq!(academic_year_of(august), 2013);
        assert_eq!(academic_year_of(september), 2014);
    }

    #[test]
    fn test_guardian_slot_exists() {
        let empty = GuardianSlot::default();
        assert!(!empty.exists());

        let with_relationship_only = GuardianSlot {
            relationship: Some("mum".to_string()),
            ..Default::default()
        };
        assert!(!with_relationship_only.exists());

        let with_phone = GuardianSlot {
            phone: Some("07700900982".to_string()),
            ..Default::default()
        };
        assert!(with_phone.exists());
    }

    #[test]
    fn test_birth_academic_year_prefers_explicit_value() {
        let row = ImportRow {
            date_of_birth: NaiveDate::from_ymd_opt(2014, 3, 2),
            birth_academic_year: Some(2014),
            ..Default::default()
        };
        assert_eq!(row.birth_academic_year_value(), Some(2014));

        let derived = ImportRow {
            date_of_birth: NaiveDate::from_ymd_opt(2014, 3, 2),
            ..Default::default()
        };
        assert_eq!(derived.birth_academic_year_value(), Some(2013));
    }

    #[test]
    fn test_idempotency_hash_stable() {
        let row = ImportRow {
            given_name: Some("Amy".to_string()),
            family_name: Some("Lee".to_string()),
            date_of_birth: NaiveDate::from_ymd_opt(2014, 3, 2),
            ..Default::default()
        };

        let hash1 = row.idempotency_hash();
        let hash2 = row.idempotency_hash();

        assert_eq!(hash1, hash2, "same row should produce same hash");
        assert_eq!(hash1.len(), 64, "SHA-256 hash should be 64 hex characters");

        let other = ImportRow {
            given_name: Some("Ben".to_string()),
            ..row.clone()
        };
        assert_ne!(hash1, other.idempotency_hash());
    }
}
