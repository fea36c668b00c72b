// 🔍 Identity Matcher - Deterministic candidate lookup for incoming rows
// Finds the existing registrants an incoming row could refer to, in a fixed
// strategy order so every match is explainable. Matching is conservative:
// missing identity keys mean "no match" and a new record, never a guess.

use anyhow::Result;
use chrono::NaiveDate;
use log::warn;
use rusqlite::Connection;
use std::collections::HashSet;

use crate::db::{self, Registrant};
use crate::fields::{name_key, normalize_postcode, ImportRow};

// ============================================================================
// MATCH QUERY
// ============================================================================

/// The identity keys extracted from a row, pre-normalized for comparison.
#[derive(Debug, Clone, Default)]
pub struct MatchQuery {
    pub unique_number: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub address_postcode: Option<String>,
}

impl MatchQuery {
    pub fn from_row(row: &ImportRow) -> MatchQuery {
        fn key(value: &Option<String>) -> Option<String> {
            value.as_deref().map(name_key).filter(|k| !k.is_empty())
        }

        MatchQuery {
            unique_number: row.unique_number.clone().filter(|n| !n.trim().is_empty()),
            given_name: key(&row.given_name),
            family_name: key(&row.family_name),
            date_of_birth: row.date_of_birth,
            address_postcode: row
                .address_postcode
                .as_deref()
                .and_then(normalize_postcode),
        }
    }

    /// The demographic strategies need all three of given name, family name
    /// and date of birth.
    fn has_demographic_keys(&self) -> bool {
        self.given_name.is_some() && self.family_name.is_some() && self.date_of_birth.is_some()
    }
}

// ============================================================================
// STRATEGIES
// ============================================================================

/// How a candidate was found, in decreasing order of confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchStrategy {
    /// Exact match on the registrant's unique number.
    UniqueNumber,
    /// Names and date of birth match, and so does the postcode.
    NameDobPostcode,
    /// Names and date of birth match; no postcode corroboration.
    NameDob,
}

/// One possible existing registrant for a row, with the strategy that
/// produced it.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub registrant: Registrant,
    pub strategy: MatchStrategy,
}

// ============================================================================
// IDENTITY MATCHER
// ============================================================================

pub struct IdentityMatcher;

impl IdentityMatcher {
    pub fn new() -> Self {
        IdentityMatcher
    }

    /// All candidate registrants for a query, strongest strategy first,
    /// deduplicated, ties broken by id ascending.
    ///
    /// Name and date of birth are mandatory keys: without all three of
    /// given name, family name and date of birth no matching happens at
    /// all, a unique number alone is never enough.
    pub fn find(&self, conn: &Connection, query: &MatchQuery) -> Result<Vec<MatchCandidate>> {
        if !query.has_demographic_keys() {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<MatchCandidate> = Vec::new();

        if let Some(unique_number) = &query.unique_number {
            for registrant in db::registrants_by_unique_number(conn, unique_number)? {
                candidates.push(MatchCandidate {
                    registrant,
                    strategy: MatchStrategy::UniqueNumber,
                });
            }
        }

        if let Some(date_of_birth) = query.date_of_birth {
            let mut demographic: Vec<MatchCandidate> =
                db::registrants_born_on(conn, date_of_birth)?
                    .into_iter()
                    .filter(|r| Self::names_match(r, query))
                    .filter(|r| !Self::unique_number_conflicts(r, query))
                    .map(|registrant| {
                        let strategy = if Self::postcodes_match(&registrant, query) {
                            MatchStrategy::NameDobPostcode
                        } else {
                            MatchStrategy::NameDob
                        };
                        MatchCandidate {
                            registrant,
                            strategy,
                        }
                    })
                    .collect();
            candidates.append(&mut demographic);
        }

        candidates.sort_by_key(|c| (c.strategy, c.registrant.id));
        let mut seen = HashSet::new();
        candidates.retain(|c| match c.registrant.id {
            Some(id) => seen.insert(id),
            None => true,
        });

        if candidates.len() > 1 {
            warn!(
                "{} match candidates for query {:?}; taking the first",
                candidates.len(),
                query
            );
        }

        Ok(candidates)
    }

    /// The single registrant a row reconciles against, if any. First match
    /// in strategy order wins.
    pub fn find_one(&self, conn: &Connection, query: &MatchQuery) -> Result<Option<Registrant>> {
        Ok(self
            .find(conn, query)?
            .into_iter()
            .next()
            .map(|c| c.registrant))
    }

    fn names_match(registrant: &Registrant, query: &MatchQuery) -> bool {
        Some(name_key(&registrant.given_name)) == query.given_name
            && Some(name_key(&registrant.family_name)) == query.family_name
    }

    /// A stored unique number different from the query's rules the
    /// candidate out; two children can share a name and birthday.
    fn unique_number_conflicts(registrant: &Registrant, query: &MatchQuery) -> bool {
        match (&registrant.unique_number, &query.unique_number) {
            (Some(stored), Some(queried)) => stored != queried,
            _ => false,
        }
    }

    fn postcodes_match(registrant: &Registrant, query: &MatchQuery) -> bool {
        match (&registrant.address_postcode, &query.address_postcode) {
            (Some(stored), Some(queried)) => {
                normalize_postcode(stored).as_deref() == Some(queried.as_str())
            }
            _ => false,
        }
    }
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        IdentityMatcher::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{save_registrant, setup_database};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn saved(
        conn: &Connection,
        given: &str,
        family: &str,
        dob: (i32, u32, u32),
        postcode: Option<&str>,
        unique_number: Option<&str>,
    ) -> i64 {
        let mut registrant = Registrant {
            given_name: given.to_string(),
            family_name: family.to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(dob.0, dob.1, dob.2),
            address_postcode: postcode.map(|p| p.to_string()),
            unique_number: unique_number.map(|n| n.to_string()),
            ..Default::default()
        };
        save_registrant(conn, &mut registrant).unwrap()
    }

    fn query(given: &str, family: &str, dob: (i32, u32, u32)) -> MatchQuery {
        MatchQuery {
            given_name: Some(name_key(given)),
            family_name: Some(name_key(family)),
            date_of_birth: NaiveDate::from_ymd_opt(dob.0, dob.1, dob.2),
            ..Default::default()
        }
    }

    #[test]
    fn test_blank_keys_never_match() {
        // P1: a row missing any identity key matches nothing
        let conn = test_conn();
        saved(&conn, "Amy", "Lee", (2014, 3, 2), None, None);

        let matcher = IdentityMatcher::new();
        let mut q = query("Amy", "Lee", (2014, 3, 2));
        q.date_of_birth = None;

        assert!(
            matcher.find(&conn, &q).unwrap().is_empty(),
            "no date of birth means no demographic matching"
        );

        let q = MatchQuery {
            family_name: Some(name_key("Lee")),
            date_of_birth: NaiveDate::from_ymd_opt(2014, 3, 2),
            ..Default::default()
        };
        assert!(matcher.find(&conn, &q).unwrap().is_empty());
    }

    #[test]
    fn test_unique_number_alone_never_matches() {
        // P1: the unique number is a supporting signal, not a matching key
        let conn = test_conn();
        saved(&conn, "Amy", "Lee", (2014, 3, 2), None, Some("1111111111"));

        let matcher = IdentityMatcher::new();
        let q = MatchQuery {
            unique_number: Some("1111111111".to_string()),
            ..Default::default()
        };

        assert!(
            matcher.find(&conn, &q).unwrap().is_empty(),
            "a row with only a unique number must not match"
        );

        let mut partial = query("Amy", "Lee", (2014, 3, 2));
        partial.given_name = None;
        partial.unique_number = Some("1111111111".to_string());
        assert!(
            matcher.find(&conn, &partial).unwrap().is_empty(),
            "a blank name key disables matching even with a unique number"
        );
    }

    #[test]
    fn test_name_dob_match_is_case_and_space_insensitive() {
        let conn = test_conn();
        let id = saved(&conn, "Amy", "Lee", (2014, 3, 2), None, None);

        let matcher = IdentityMatcher::new();
        let q = query("  aMY ", "LEE", (2014, 3, 2));
        let found = matcher.find_one(&conn, &q).unwrap();

        assert_eq!(found.and_then(|r| r.id), Some(id));
    }

    #[test]
    fn test_unique_number_outranks_demographics() {
        let conn = test_conn();
        let by_name = saved(&conn, "Amy", "Lee", (2014, 3, 2), None, None);
        let by_number = saved(&conn, "Amelia", "Leigh", (2013, 9, 9), None, Some("9876543210"));

        let matcher = IdentityMatcher::new();
        let mut q = query("Amy", "Lee", (2014, 3, 2));
        q.unique_number = Some("9876543210".to_string());

        let candidates = matcher.find(&conn, &q).unwrap();
        assert_eq!(candidates[0].registrant.id, Some(by_number));
        assert_eq!(candidates[0].strategy, MatchStrategy::UniqueNumber);
        assert!(candidates.iter().any(|c| c.registrant.id == Some(by_name)));
    }

    #[test]
    fn test_postcode_corroboration_ranks_first() {
        let conn = test_conn();
        let far = saved(&conn, "Amy", "Lee", (2014, 3, 2), Some("E1 6AN"), None);
        let near = saved(&conn, "Amy", "Lee", (2014, 3, 2), Some("SW1A 1AA"), None);

        let matcher = IdentityMatcher::new();
        let mut q = query("Amy", "Lee", (2014, 3, 2));
        q.address_postcode = normalize_postcode("sw1a1aa");

        let candidates = matcher.find(&conn, &q).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].registrant.id, Some(near));
        assert_eq!(candidates[0].strategy, MatchStrategy::NameDobPostcode);
        assert_eq!(candidates[1].registrant.id, Some(far));
        assert_eq!(candidates[1].strategy, MatchStrategy::NameDob);
    }

    #[test]
    fn test_conflicting_unique_number_excludes_candidate() {
        let conn = test_conn();
        saved(&conn, "Amy", "Lee", (2014, 3, 2), None, Some("1111111111"));

        let matcher = IdentityMatcher::new();
        let mut q = query("Amy", "Lee", (2014, 3, 2));
        q.unique_number = Some("2222222222".to_string());

        assert!(
            matcher.find(&conn, &q).unwrap().is_empty(),
            "same name and birthday but a different unique number is a different child"
        );
    }

    #[test]
    fn test_candidate_found_by_both_routes_reported_once() {
        let conn = test_conn();
        let id = saved(&conn, "Amy", "Lee", (2014, 3, 2), None, Some("1111111111"));

        let matcher = IdentityMatcher::new();
        let mut q = query("Amy", "Lee", (2014, 3, 2));
        q.unique_number = Some("1111111111".to_string());

        let candidates = matcher.find(&conn, &q).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].registrant.id, Some(id));
        assert_eq!(candidates[0].strategy, MatchStrategy::UniqueNumber);
    }

    #[test]
    fn test_ties_broken_by_id_ascending() {
        let conn = test_conn();
        let first = saved(&conn, "Amy", "Lee", (2014, 3, 2), None, None);
        saved(&conn, "Amy", "Lee", (2014, 3, 2), None, None);

        let matcher = IdentityMatcher::new();
        let found = matcher
            .find_one(&conn, &query("Amy", "Lee", (2014, 3, 2)))
            .unwrap();

        assert_eq!(found.and_then(|r| r.id), Some(first));
    }
}
