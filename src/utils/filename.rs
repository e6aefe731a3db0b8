//! Download filename sanitization.

/// Maximum length of a sanitized filename stem.
const MAX_STEM_LEN: usize = 100;

/// Replace characters that are invalid in filenames on common filesystems
/// and cap the length. Used for the `Content-Disposition` download name,
/// never for paths the pipeline itself writes to.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(MAX_STEM_LEN));
    for c in name.chars().take(MAX_STEM_LEN) {
        match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => out.push('_'),
            c if c.is_control() => out.push('_'),
            c => out.push(c),
        }
    }
    let trimmed = out.trim().trim_matches('.');
    if trimmed.is_empty() {
        "media".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaces_invalid_characters() {
        assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_filename("what? \"why\""), "what_ _why_");
    }

    #[test]
    fn test_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_filename(&long).len(), MAX_STEM_LEN);
    }

    #[test]
    fn test_empty_falls_back() {
        assert_eq!(sanitize_filename(""), "media");
        assert_eq!(sanitize_filename("..."), "media");
    }
}
