//! Sync status classifier.
//!
//! Derives a display/filter status for an entity from its sync record
//! and the source system's write timestamp. This is not a
//! correctness-critical path: unparsable timestamps degrade to `synced`
//! instead of raising.

use chrono::{DateTime, NaiveDateTime, Utc};
use mercato_db::SyncRecord;
use serde::{Deserialize, Serialize};

/// Tolerance absorbing clock skew and near-simultaneous writes.
const MODIFIED_TOLERANCE_SECS: i64 = 10;

/// Derived sync status of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    NeverSynced,
    Synced,
    Modified,
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::NeverSynced => write!(f, "never_synced"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Modified => write!(f, "modified"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// Classify one entity.
///
/// Precedence:
/// 1. `error` when the record's error flag is set;
/// 2. `never_synced` when there is no record or no `last_synced_at`;
/// 3. `modified` when the source wrote more than the tolerance after
///    the last sync;
/// 4. `synced` otherwise.
#[must_use]
pub fn classify(source_write_date: Option<&str>, record: Option<&SyncRecord>) -> SyncStatus {
    let Some(record) = record else {
        return SyncStatus::NeverSynced;
    };

    if record.error {
        return SyncStatus::Error;
    }

    let Some(last_synced) = record.last_synced_at else {
        return SyncStatus::NeverSynced;
    };

    let Some(write_date) = source_write_date else {
        return SyncStatus::Synced;
    };
    let Some(written_at) = parse_source_datetime(write_date) else {
        // Display concern only: degrade instead of raising.
        return SyncStatus::Synced;
    };

    if written_at > last_synced + chrono::Duration::seconds(MODIFIED_TOLERANCE_SECS) {
        SyncStatus::Modified
    } else {
        SyncStatus::Synced
    }
}

/// Parse the source system's timestamp format.
///
/// The source emits naive UTC timestamps as `"YYYY-MM-DD HH:MM:SS"`;
/// RFC 3339 is accepted as well.
#[must_use]
pub fn parse_source_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(error: bool, last_synced_at: Option<DateTime<Utc>>) -> SyncRecord {
        let now = Utc::now();
        SyncRecord {
            id: Uuid::new_v4(),
            source_id: 1,
            sink_id: Some(10),
            tenant_id: Uuid::new_v4(),
            name: Some("Desk".to_string()),
            created: false,
            updated: false,
            skipped: false,
            error,
            needs_sync: false,
            message: None,
            error_details: None,
            source_write_date: None,
            last_synced_at,
            created_at: now,
            updated_at: now,
        }
    }

    fn fmt(dt: DateTime<Utc>) -> String {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    #[test]
    fn test_no_record_is_never_synced() {
        assert_eq!(classify(None, None), SyncStatus::NeverSynced);
    }

    #[test]
    fn test_no_last_synced_is_never_synced() {
        let record = record(false, None);
        assert_eq!(
            classify(Some("2024-01-15 10:30:45"), Some(&record)),
            SyncStatus::NeverSynced
        );
    }

    #[test]
    fn test_error_takes_precedence() {
        let record = record(true, Some(Utc::now()));
        assert_eq!(classify(None, Some(&record)), SyncStatus::Error);
    }

    #[test]
    fn test_write_within_tolerance_is_synced() {
        let synced_at = Utc::now();
        let record = record(false, Some(synced_at));
        let written = synced_at + chrono::Duration::seconds(5);
        assert_eq!(
            classify(Some(&fmt(written)), Some(&record)),
            SyncStatus::Synced
        );
    }

    #[test]
    fn test_write_past_tolerance_is_modified() {
        let synced_at = Utc::now();
        let record = record(false, Some(synced_at));
        let written = synced_at + chrono::Duration::seconds(11);
        assert_eq!(
            classify(Some(&fmt(written)), Some(&record)),
            SyncStatus::Modified
        );
    }

    #[test]
    fn test_unparsable_timestamp_degrades_to_synced() {
        let record = record(false, Some(Utc::now()));
        assert_eq!(
            classify(Some("not a timestamp"), Some(&record)),
            SyncStatus::Synced
        );
    }

    #[test]
    fn test_missing_write_date_is_synced() {
        let record = record(false, Some(Utc::now()));
        assert_eq!(classify(None, Some(&record)), SyncStatus::Synced);
    }

    #[test]
    fn test_parse_rfc3339_accepted() {
        assert!(parse_source_datetime("2024-01-15T10:30:45Z").is_some());
        assert!(parse_source_datetime("2024-01-15 10:30:45").is_some());
    }
}
