//! `MergeSchema`: the fixed table mapping a path suffix to the field that
//! identifies "the same item" in a list living at that path, so schema-aware
//! list merges can union fields on a match instead of treating the list as
//! an opaque bag of scalars.

/// Returns the merge key field for a path whose last segment is `suffix`,
/// or `None` if lists at that path should fall back to dedupe-by-deep-equality.
pub fn merge_key_for_suffix(suffix: &str) -> Option<&'static str> {
    match suffix {
        "tags" => Some("key"),
        "volumes" => Some("name"),
        "taints" => Some("key"),
        "securityGroups" => None,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_suffixes_resolve_their_merge_key() {
        assert_eq!(merge_key_for_suffix("tags"), Some("key"));
        assert_eq!(merge_key_for_suffix("volumes"), Some("name"));
    }

    #[test]
    fn unknown_suffix_has_no_merge_key() {
        assert_eq!(merge_key_for_suffix("securityGroups"), None);
        assert_eq!(merge_key_for_suffix("somethingElse"), None);
    }
}
