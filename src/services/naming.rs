//! Deterministic photo naming.
//!
//! Pure functions from (user, date, sequence) to directory paths and
//! basenames. No I/O; collision avoidance within a batch comes from the
//! caller handing out unique sequence numbers.

use crate::services::{PhotoError, PhotoResult};
use chrono::{Datelike, NaiveDate};
use std::path::{Path, PathBuf};

/// Basename prefix for every stored photo, e.g. `IMG_0001`.
const BASE_NAME_TAG: &str = "IMG_";

/// Parse a `YYYY-MM-DD` date string.
pub fn parse_date(date: &str) -> PhotoResult<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|err| PhotoError::Validation(format!("invalid date `{}`: {}", date, err)))
}

/// Directory a user's photos for one calendar date live in:
/// `{storage_dir}/photo/{user_id}/{year}/{month}/{day}/`.
pub fn directory_for(storage_dir: &Path, user_id: i64, date: NaiveDate) -> PathBuf {
    storage_dir
        .join("photo")
        .join(user_id.to_string())
        .join(format!("{:04}", date.year()))
        .join(format!("{:02}", date.month()))
        .join(format!("{:02}", date.day()))
}

/// Extension-free basename for a sequence number. Zero-padded to four
/// digits; larger numbers render wider rather than truncating.
pub fn base_name_for(sequence: i64) -> String {
    format!("{}{:04}", BASE_NAME_TAG, sequence)
}

/// Next sequence number given how many photos already exist for the date.
/// Numbering starts at 1, so the first photo becomes `IMG_0001`.
pub fn next_sequence(existing_count: i64) -> i64 {
    existing_count + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iso_dates() {
        let date = parse_date("2024-05-01").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
    }

    #[test]
    fn rejects_malformed_dates() {
        assert!(matches!(parse_date("2024/05/01"), Err(PhotoError::Validation(_))));
        assert!(matches!(parse_date("not-a-date"), Err(PhotoError::Validation(_))));
    }

    #[test]
    fn directory_layout_is_user_then_date() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let dir = directory_for(Path::new("/srv/storage"), 42, date);
        assert_eq!(dir, PathBuf::from("/srv/storage/photo/42/2024/05/01"));
    }

    #[test]
    fn base_names_are_zero_padded() {
        assert_eq!(base_name_for(1), "IMG_0001");
        assert_eq!(base_name_for(123), "IMG_0123");
        assert_eq!(base_name_for(9999), "IMG_9999");
    }

    #[test]
    fn base_names_widen_past_padding() {
        assert_eq!(base_name_for(10000), "IMG_10000");
        assert_eq!(base_name_for(123456), "IMG_123456");
    }

    #[test]
    fn sequences_start_at_one() {
        assert_eq!(next_sequence(0), 1);
        assert_eq!(next_sequence(7), 8);
    }
}
