//! Assertion helpers for batch reports.

use appkeep_backup::BatchReport;
use appkeep_core::Error;

/// Assert every instance of a report succeeded
pub fn assert_all_succeeded<T: std::fmt::Debug>(report: &BatchReport<T>) {
    assert!(
        report.is_success(),
        "Expected every instance to succeed, got: {:?}",
        report.first_error()
    );
}

/// The only outcome's error; panics when the report has a different shape
pub fn single_error<T: std::fmt::Debug>(report: &BatchReport<T>) -> &Error {
    assert_eq!(report.outcomes.len(), 1, "Expected exactly one outcome");
    match &report.outcomes[0].result {
        Err(e) => e,
        Ok(value) => panic!("Expected failure, got {:?}", value),
    }
}

/// The only outcome's value; panics on failure
pub fn single_success<T: std::fmt::Debug>(report: &BatchReport<T>) -> &T {
    assert_eq!(report.outcomes.len(), 1, "Expected exactly one outcome");
    match &report.outcomes[0].result {
        Ok(value) => value,
        Err(e) => panic!("Expected success, got {}", e),
    }
}
