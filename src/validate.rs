//! Startup validation entry: check the category-contiguity invariant over
//! the whole feature set and fail fast with a descriptive report.

use anyhow::{Result, bail};

use crate::core::contiguity::validate_contiguity;
use crate::io::store::Store;

/// Validate the store's feature set. Non-recoverable on violation: the
/// caller prints the error and exits non-zero. No auto-repair is attempted.
pub fn validate_store(store: &Store) -> Result<()> {
    let features = store.all_features()?;
    let errors = validate_contiguity(&features);
    if !errors.is_empty() {
        bail!(
            "category contiguity violations:\n- {}",
            errors.join("\n- ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spec;

    #[test]
    fn contiguous_store_passes() {
        let mut store = Store::in_memory().expect("store");
        store
            .ingest(&[spec(1, "a", "cat-x"), spec(2, "b", "cat-x"), spec(3, "c", "cat-y")])
            .expect("ingest");
        validate_store(&store).expect("valid");
    }

    #[test]
    fn interleaved_store_fails_with_descriptive_report() {
        let mut store = Store::in_memory().expect("store");
        store
            .ingest(&[spec(1, "a", "cat-x"), spec(2, "b", "cat-y"), spec(3, "c", "cat-x")])
            .expect("ingest");
        let err = validate_store(&store).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cat-x"), "{message}");
        assert!(message.contains("feature 3"), "{message}");
    }

    #[test]
    fn empty_store_is_valid() {
        let store = Store::in_memory().expect("store");
        validate_store(&store).expect("valid");
    }
}
