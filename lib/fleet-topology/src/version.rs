//! Version merging for aggregated status

use std::collections::BTreeSet;

/// Distinct versions, sorted and joined with `/`. Inputs may themselves be
/// merged strings; empty entries are ignored.
pub fn merge_versions<'a>(versions: impl IntoIterator<Item = &'a str>) -> String {
    versions
        .into_iter()
        .flat_map(|v| v.split('/'))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_versions() {
        assert_eq!(merge_versions(["v1", "v2"]), "v1/v2");
        assert_eq!(merge_versions(["v2", "v1", "v2"]), "v1/v2");
        assert_eq!(merge_versions(["v2/v1", "v3", ""]), "v1/v2/v3");
        assert_eq!(merge_versions(Vec::<&str>::new()), "");
    }
}
