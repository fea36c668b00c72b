// Child Register Reconciliation - Core Library
// Exposes all modules for use in the CLI and tests

pub mod db;
pub mod fields;
pub mod matching;
pub mod staging;
pub mod guardians;
pub mod school_moves;
pub mod merge;
pub mod reconcile;

// Re-export commonly used types
pub use db::{
    setup_database, Event, GenderCode, Guardian, GuardianRelationship, ImportKind,
    Registrant, RelationshipKind, School, SchoolMove, SchoolMoveSource,
};
pub use fields::{load_rows, GuardianSlot, ImportRow, SchoolMoveFields};
pub use guardians::{FamilyConnections, GuardianLinker};
pub use matching::{IdentityMatcher, MatchCandidate, MatchQuery, MatchStrategy};
pub use merge::{merge_registrants, MergeError};
pub use reconcile::{
    persist_outcome, ReconcileOptions, ReconciliationOutcome, Reconciler,
};
pub use school_moves::SchoolMoveResolver;
pub use staging::{ChangeStager, PendingChanges, RegistrantAttribute};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
