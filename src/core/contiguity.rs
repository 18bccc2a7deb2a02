//! Category-contiguity check over the ingested feature set.
//!
//! The batcher assumes that for every category, the member ids form one
//! contiguous block in the global id order: a category opens once, closes
//! when a different category's id appears, and never reappears. Id order
//! inside a category is how feature authors encode dependency order, so an
//! interleaved category would split dependent work across unrelated
//! sessions.

use std::collections::HashMap;

use crate::core::types::Feature;

/// Check the contiguity invariant. `features` must be sorted by ascending id
/// (the store's enumeration order). Returns one message per violation,
/// naming the reopened category and the offending id. Empty input is valid.
pub fn validate_contiguity(features: &[Feature]) -> Vec<String> {
    let mut errors = Vec::new();
    // category -> id of its last member before the category closed
    let mut closed: HashMap<&str, i64> = HashMap::new();
    let mut current: Option<&str> = None;
    let mut last_id = 0i64;

    for feature in features {
        let category = feature.category.as_str();
        if current != Some(category) {
            if let Some(previous) = current {
                closed.insert(previous, last_id);
            }
            if let Some(&closed_at) = closed.get(category) {
                errors.push(format!(
                    "category '{category}' is not contiguous: feature {} reopens it after it closed at feature {closed_at}",
                    feature.id
                ));
            }
            current = Some(category);
        }
        last_id = feature.id;
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::feature;

    #[test]
    fn empty_set_is_valid() {
        assert!(validate_contiguity(&[]).is_empty());
    }

    #[test]
    fn contiguous_categories_pass() {
        let features = vec![
            feature(1, "cat-x"),
            feature(2, "cat-x"),
            feature(3, "cat-y"),
            feature(4, "cat-y"),
            feature(5, "cat-z"),
        ];
        assert!(validate_contiguity(&features).is_empty());
    }

    #[test]
    fn interleaved_category_is_reported_with_offending_id() {
        let features = vec![feature(1, "cat-x"), feature(2, "cat-y"), feature(3, "cat-x")];
        let errors = validate_contiguity(&features);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("cat-x"), "names the category: {errors:?}");
        assert!(errors[0].contains("feature 3"), "names the offending id: {errors:?}");
        assert!(errors[0].contains("feature 1"), "names where it closed: {errors:?}");
    }

    #[test]
    fn every_reopening_is_reported() {
        let features = vec![
            feature(1, "a"),
            feature(2, "b"),
            feature(3, "a"),
            feature(4, "b"),
        ];
        let errors = validate_contiguity(&features);
        assert_eq!(errors.len(), 2);
    }
}
