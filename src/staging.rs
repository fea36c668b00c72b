// 📝 Change Stager - Decide what applies live and what awaits review
// Computes the delta between a registrant's current attributes and an
// incoming row, applies the narrow auto-accept rules, and stages everything
// else as a pending-change set for human review. If anything at all needs
// review, auto-accepted values are reverted and folded into the pending set
// so a reviewer always sees the complete diff in one place.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::db::{gender_code_is_valid, GenderCode, Registrant};
use crate::fields::{GuardianSlot, ImportRow, SchoolMoveFields};

// ============================================================================
// REGISTRANT ATTRIBUTES
// ============================================================================

/// The registrant attributes a row may propose changes to. Typed keys keep
/// the pending-change set free of stringly-typed lookups while still
/// serializing to a plain JSON map.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RegistrantAttribute {
    UniqueNumber,
    GivenName,
    FamilyName,
    PreferredGivenName,
    PreferredFamilyName,
    DateOfBirth,
    BirthAcademicYear,
    GenderCode,
    AddressLine1,
    AddressLine2,
    AddressTown,
    AddressPostcode,
    Registration,
}

fn value_str(value: &Value) -> Option<String> {
    value.as_str().map(|s| s.to_string())
}

impl Registrant {
    /// Current value of an attribute as its canonical JSON representation.
    pub fn attribute(&self, attr: RegistrantAttribute) -> Value {
        fn opt(value: &Option<String>) -> Value {
            match value {
                Some(v) => Value::String(v.clone()),
                None => Value::Null,
            }
        }

        match attr {
            RegistrantAttribute::UniqueNumber => opt(&self.unique_number),
            RegistrantAttribute::GivenName => Value::String(self.given_name.clone()),
            RegistrantAttribute::FamilyName => Value::String(self.family_name.clone()),
            RegistrantAttribute::PreferredGivenName => opt(&self.preferred_given_name),
            RegistrantAttribute::PreferredFamilyName => opt(&self.preferred_family_name),
            RegistrantAttribute::DateOfBirth => match self.date_of_birth {
                Some(d) => Value::String(d.format("%Y-%m-%d").to_string()),
                None => Value::Null,
            },
            RegistrantAttribute::BirthAcademicYear => match self.birth_academic_year {
                Some(y) => Value::from(y),
                None => Value::Null,
            },
            RegistrantAttribute::GenderCode => {
                Value::String(self.gender_code.as_str().to_string())
            }
            RegistrantAttribute::AddressLine1 => opt(&self.address_line_1),
            RegistrantAttribute::AddressLine2 => opt(&self.address_line_2),
            RegistrantAttribute::AddressTown => opt(&self.address_town),
            RegistrantAttribute::AddressPostcode => opt(&self.address_postcode),
            RegistrantAttribute::Registration => opt(&self.registration),
        }
    }

    /// Set an attribute from its canonical JSON representation.
    pub fn set_attribute(&mut self, attr: RegistrantAttribute, value: &Value) {
        match attr {
            RegistrantAttribute::UniqueNumber => self.unique_number = value_str(value),
            RegistrantAttribute::GivenName => {
                if let Some(v) = value_str(value) {
                    self.given_name = v;
                }
            }
            RegistrantAttribute::FamilyName => {
                if let Some(v) = value_str(value) {
                    self.family_name = v;
                }
            }
            RegistrantAttribute::PreferredGivenName => {
                self.preferred_given_name = value_str(value)
            }
            RegistrantAttribute::PreferredFamilyName => {
                self.preferred_family_name = value_str(value)
            }
            RegistrantAttribute::DateOfBirth => {
                self.date_of_birth = value
                    .as_str()
                    .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
            }
            RegistrantAttribute::BirthAcademicYear => {
                self.birth_academic_year = value.as_i64().map(|y| y as i32);
            }
            RegistrantAttribute::GenderCode => {
                self.gender_code = value
                    .as_str()
                    .map(GenderCode::parse)
                    .unwrap_or(GenderCode::NotKnown);
            }
            RegistrantAttribute::AddressLine1 => self.address_line_1 = value_str(value),
            RegistrantAttribute::AddressLine2 => self.address_line_2 = value_str(value),
            RegistrantAttribute::AddressTown => self.address_town = value_str(value),
            RegistrantAttribute::AddressPostcode => self.address_postcode = value_str(value),
            RegistrantAttribute::Registration => self.registration = value_str(value),
        }
    }

    /// Apply the whole pending-change set to the live record and clear it.
    /// Called by the review workflow once a human has confirmed the diff.
    pub fn apply_pending_changes(&mut self) {
        let attributes = self.pending_changes.attributes.clone();
        for (attr, value) in &attributes {
            self.set_attribute(*attr, value);
        }
        self.pending_changes = PendingChanges::default();
    }

    /// Throw away the pending-change set without touching live attributes.
    pub fn discard_pending_changes(&mut self) {
        self.pending_changes = PendingChanges::default();
    }
}

// ============================================================================
// PENDING CHANGES
// ============================================================================

/// A staged diff on a registrant awaiting human review.
///
/// Alongside the attribute diff, the guardian slots and school fields of the
/// row are recorded so the reviewer can act on the whole row at once; those
/// sections never make the set "non-empty" on their own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingChanges {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<RegistrantAttribute, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guardians: Vec<GuardianSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school: Option<SchoolMoveFields>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn proposed(&self, attr: RegistrantAttribute) -> Option<&Value> {
        self.attributes.get(&attr)
    }
}

// ============================================================================
// CHANGE STAGER
// ============================================================================

/// Stages one row's proposed changes onto an existing or new registrant.
pub struct ChangeStager {
    /// When set, the registration code is staged for review even though it
    /// would otherwise be applied directly.
    stage_registration: bool,
}

impl ChangeStager {
    pub fn new(stage_registration: bool) -> Self {
        ChangeStager { stage_registration }
    }

    /// Compute the target state for a registrant given an incoming row.
    ///
    /// No persistence happens here; the returned registrant carries either
    /// directly-applied attributes or a pending-change set holding the full
    /// proposed diff.
    pub fn stage(&self, existing: Option<Registrant>, row: &ImportRow) -> Registrant {
        match existing {
            Some(registrant) => self.prepare_changes(registrant, row),
            None => Self::new_registrant(row),
        }
    }

    /// Construct a brand-new registrant straight from the row; there is
    /// nothing to conflict with, so nothing is staged.
    fn new_registrant(row: &ImportRow) -> Registrant {
        let mut registrant = Registrant {
            home_educated: false,
            ..Default::default()
        };
        for (attr, value) in incoming_attributes(row) {
            registrant.set_attribute(attr, &value);
        }
        registrant
    }

    fn prepare_changes(&self, mut registrant: Registrant, row: &ImportRow) -> Registrant {
        let mut incoming = incoming_attributes(row);
        // Every direct application this pass, with old and new values, so it
        // can be reverted if anything ends up needing review.
        let mut applied: Vec<(RegistrantAttribute, Value, Value)> = Vec::new();

        if !self.stage_registration {
            if let Some(value) = incoming.remove(&RegistrantAttribute::Registration) {
                apply_direct(&mut registrant, RegistrantAttribute::Registration, value, &mut applied);
            }
        }

        self.auto_accept_attributes(&mut registrant, &mut incoming, &mut applied);
        self.handle_address_updates(&mut registrant, &mut incoming, &mut applied);
        self.stage_remaining(&mut registrant, incoming);

        // Review atomicity: once anything is pending, partial application is
        // not allowed. Revert the auto-accepted values and fold them into the
        // pending set so reviewers see and approve the complete diff - when
        // resolving twins, a caller must never find one child's data already
        // half-merged into the other's record.
        if !registrant.pending_changes.is_empty() {
            for (attr, old_value, new_value) in applied {
                registrant
                    .pending_changes
                    .attributes
                    .insert(attr, new_value);
                registrant.set_attribute(attr, &old_value);
            }
        }

        registrant
    }

    /// Auto-accept rules: apply the incoming value directly when it
    /// satisfies the validity predicate and the current value does not.
    fn auto_accept_attributes(
        &self,
        registrant: &mut Registrant,
        incoming: &mut BTreeMap<RegistrantAttribute, Value>,
        applied: &mut Vec<(RegistrantAttribute, Value, Value)>,
    ) {
        let gender_valid_in_import = incoming
            .get(&RegistrantAttribute::GenderCode)
            .and_then(|v| v.as_str())
            .map(gender_code_is_valid)
            .unwrap_or(false);
        if gender_valid_in_import && !registrant.gender_code.is_specified() {
            let value = incoming
                .remove(&RegistrantAttribute::GenderCode)
                .unwrap_or(Value::Null);
            apply_direct(registrant, RegistrantAttribute::GenderCode, value, applied);
        }

        for attr in [
            RegistrantAttribute::PreferredGivenName,
            RegistrantAttribute::PreferredFamilyName,
        ] {
            let present_in_import = incoming.contains_key(&attr);
            let present_in_registrant = !registrant.attribute(attr).is_null();
            if present_in_import && !present_in_registrant {
                let value = incoming.remove(&attr).unwrap_or(Value::Null);
                apply_direct(registrant, attr, value, applied);
            }
        }
    }

    /// Address rule: a changed postcode means the whole address goes to
    /// review; an unchanged postcode is enough confidence to apply line/town
    /// corrections directly.
    fn handle_address_updates(
        &self,
        registrant: &mut Registrant,
        incoming: &mut BTreeMap<RegistrantAttribute, Value>,
        applied: &mut Vec<(RegistrantAttribute, Value, Value)>,
    ) {
        let incoming_postcode = incoming
            .get(&RegistrantAttribute::AddressPostcode)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let line_attrs = [
            RegistrantAttribute::AddressLine1,
            RegistrantAttribute::AddressLine2,
            RegistrantAttribute::AddressTown,
        ];

        match &incoming_postcode {
            Some(postcode) if registrant.address_postcode.as_deref() != Some(postcode) => {
                // Postcode changed: leave the lines in the incoming set so
                // the full address is staged for review.
            }
            _ => {
                let any_line_present = line_attrs.iter().any(|a| incoming.contains_key(a));
                let postcode_unchanged = registrant.address_postcode.as_deref()
                    == incoming_postcode.as_deref();
                if postcode_unchanged && any_line_present {
                    for attr in line_attrs {
                        let value = incoming.remove(&attr).unwrap_or(Value::Null);
                        apply_direct(registrant, attr, value, applied);
                    }
                }
            }
        }
    }

    /// Everything still in the incoming set is staged as a value-level diff
    /// against the current attributes, merged over any previously-queued
    /// pending changes.
    fn stage_remaining(
        &self,
        registrant: &mut Registrant,
        incoming: BTreeMap<RegistrantAttribute, Value>,
    ) {
        for (attr, value) in incoming {
            if registrant.attribute(attr) != value {
                debug!("staging {:?} for review", attr);
                registrant.pending_changes.attributes.insert(attr, value);
            }
        }
    }
}

fn apply_direct(
    registrant: &mut Registrant,
    attr: RegistrantAttribute,
    value: Value,
    applied: &mut Vec<(RegistrantAttribute, Value, Value)>,
) {
    let old_value = registrant.attribute(attr);
    if old_value != value {
        registrant.set_attribute(attr, &value);
        applied.push((attr, old_value, value));
    }
}

/// The registrant attributes a row proposes, with blank values compacted
/// away. Values are the canonical JSON representations used by the
/// pending-change set.
fn incoming_attributes(row: &ImportRow) -> BTreeMap<RegistrantAttribute, Value> {
    let mut attributes = BTreeMap::new();

    let mut put_str = |attr: RegistrantAttribute, value: &Option<String>| {
        if let Some(v) = value {
            if !v.trim().is_empty() {
                attributes.insert(attr, Value::String(v.clone()));
            }
        }
    };

    put_str(RegistrantAttribute::UniqueNumber, &row.unique_number);
    put_str(RegistrantAttribute::GivenName, &row.given_name);
    put_str(RegistrantAttribute::FamilyName, &row.family_name);
    put_str(
        RegistrantAttribute::PreferredGivenName,
        &row.preferred_given_name,
    );
    put_str(
        RegistrantAttribute::PreferredFamilyName,
        &row.preferred_family_name,
    );
    put_str(RegistrantAttribute::GenderCode, &row.gender_code);
    put_str(RegistrantAttribute::AddressLine1, &row.address_line_1);
    put_str(RegistrantAttribute::AddressLine2, &row.address_line_2);
    put_str(RegistrantAttribute::AddressTown, &row.address_town);
    put_str(RegistrantAttribute::AddressPostcode, &row.address_postcode);
    put_str(RegistrantAttribute::Registration, &row.registration);

    if let Some(date_of_birth) = row.date_of_birth {
        attributes.insert(
            RegistrantAttribute::DateOfBirth,
            Value::String(date_of_birth.format("%Y-%m-%d").to_string()),
        );
    }
    if let Some(year) = row.birth_academic_year_value() {
        attributes.insert(RegistrantAttribute::BirthAcademicYear, Value::from(year));
    }

    attributes
}

// ============================================================================
// TESTS
// ============================================================================
