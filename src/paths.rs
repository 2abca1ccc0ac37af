//! Path normalization for coverage files and context sources.
//!
//! Normalization is purely lexical: no filesystem access, so behavior is
//! identical on every platform. Case folding is driven by an explicit
//! flag rather than by sensing the running OS.

use crate::errors::WarningCode;

/// Canonical separator used in every normalized path.
const SEP: char = '/';

/// Normalize a raw path to a repo-relative, separator-normalized form.
///
/// Returns the normalized path plus an optional warning code. Absolute
/// paths outside `repo_root` stay absolute and are flagged; paths that
/// cannot be resolved are returned unchanged with `PATH_UNRESOLVED`.
/// Never panics on malformed input.
pub fn normalize(
    raw: &str,
    repo_root: &str,
    case_insensitive: bool,
) -> (String, Option<WarningCode>) {
    if raw.is_empty() {
        return (raw.to_string(), Some(WarningCode::PathUnresolved));
    }

    let Some(path) = resolve_lexical(raw) else {
        return (raw.to_string(), Some(WarningCode::PathUnresolved));
    };
    let path = fold_case(&path, case_insensitive);

    if !is_absolute(&path) {
        // Relative inputs are taken as already repo-relative.
        return (path, None);
    }

    let root = resolve_lexical(repo_root)
        .map(|root| fold_case(&root, case_insensitive))
        .unwrap_or_default();
    if root.is_empty() {
        return (path, Some(WarningCode::PathOutsideRepo));
    }

    if path == root {
        return (String::from("."), None);
    }
    let prefix = format!("{root}{SEP}");
    if let Some(relative) = path.strip_prefix(&prefix) {
        return (relative.to_string(), None);
    }
    (path, Some(WarningCode::PathOutsideRepo))
}

/// Resolve separators and `.`/`..` segments without touching the
/// filesystem. Returns `None` when `..` escapes an absolute root.
fn resolve_lexical(raw: &str) -> Option<String> {
    let unified = raw.replace('\\', "/");
    let absolute = is_absolute(&unified);
    let trimmed = unified.trim_end_matches('/');

    let mut stack: Vec<&str> = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => match stack.last() {
                Some(&last) if last != ".." && !is_drive(last) => {
                    stack.pop();
                }
                Some(_) if absolute => return None,
                None if absolute => return None,
                _ => stack.push(".."),
            },
            other => stack.push(other),
        }
    }

    let joined = stack.join("/");
    if absolute && unified.starts_with('/') {
        Some(format!("/{joined}"))
    } else if joined.is_empty() {
        Some(String::from("."))
    } else {
        Some(joined)
    }
}

fn is_absolute(path: &str) -> bool {
    if path.starts_with('/') {
        return true;
    }
    // Windows drive prefix, e.g. "C:/repo".
    let mut chars = path.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic()
    )
}

fn is_drive(segment: &str) -> bool {
    segment.len() == 2 && segment.ends_with(':')
}

fn fold_case(path: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        path.to_lowercase()
    } else {
        path.to_string()
    }
}
