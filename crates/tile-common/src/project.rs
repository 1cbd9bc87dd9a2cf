//! Project and storage name sanitization.

use unicode_normalization::UnicodeNormalization;

/// Sanitize a project identifier.
///
/// NFKD-folds the input so accented characters decompose to their base
/// letter, lowercases, and keeps only `[a-z0-9_-]`. Returns None when
/// nothing survives.
pub fn sanitize_project_id(raw: &str) -> Option<String> {
    let folded: String = raw
        .nfkd()
        .filter(|c| c.is_ascii())
        .collect::<String>()
        .to_lowercase();

    let id: String = folded
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();

    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Sanitize a layer/theme name into an on-disk directory name.
///
/// Non-alphanumeric characters other than `._-` become `_`. Leading dots
/// are folded away so the result can never traverse upwards.
pub fn sanitize_storage_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    while out.starts_with('.') {
        out.remove(0);
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_folding() {
        assert_eq!(sanitize_project_id("Örto Photos").unwrap(), "ortophotos");
        assert_eq!(sanitize_project_id("städer_2024").unwrap(), "stader_2024");
        assert_eq!(sanitize_project_id("my-project").unwrap(), "my-project");
        assert!(sanitize_project_id("!!!").is_none());
        assert!(sanitize_project_id("").is_none());
    }

    #[test]
    fn test_storage_name() {
        assert_eq!(sanitize_storage_name("roads & rails"), "roads___rails");
        assert_eq!(sanitize_storage_name("../../etc"), "_.._etc");
        assert_eq!(sanitize_storage_name("ok-name_1.0"), "ok-name_1.0");
        assert_eq!(sanitize_storage_name("..."), "_");
    }

    #[test]
    fn test_storage_name_no_traversal() {
        let n = sanitize_storage_name("..\\windows");
        assert!(!n.contains('\\'));
        assert!(!n.starts_with('.'));
    }
}
