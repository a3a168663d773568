//! Path validation keeping every file operation inside the workspace root.
//!
//! All checks are lexical and run before a command is built. Sandbox-side
//! symlink resolution is handled separately by the executor.

/// Collapse `.` segments and duplicate slashes into an absolute path.
///
/// `..` segments pop the previous segment and never climb above `/`.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Whether `path` is `root` itself or lies below it. Both must be normalized.
pub fn is_within(root: &str, path: &str) -> bool {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return path.starts_with('/');
    }
    path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

fn has_traversal(path: &str) -> bool {
    path.split('/').any(|segment| segment == "..")
}

/// Whether `text` holds any control character, tabs and newlines included.
pub(crate) fn has_control_chars(text: &str) -> bool {
    text.chars().any(char::is_control)
}

/// Resolve a caller-supplied path to an absolute path under `root`.
///
/// Relative paths are joined onto `root`. Returns `None` for traversal
/// sequences, control characters, or anything landing outside the root.
pub fn resolve(root: &str, path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() || has_traversal(path) || has_control_chars(path) {
        return None;
    }
    let root = normalize(root);
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", root, path)
    };
    let resolved = normalize(&joined);
    is_within(&root, &resolved).then_some(resolved)
}

/// Parent directory of an absolute, normalized path.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Final component of a path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/workspace";

    #[test]
    fn normalizes_dots_and_slashes() {
        assert_eq!(normalize("/workspace//src/./main.py"), "/workspace/src/main.py");
        assert_eq!(normalize("/workspace/../etc"), "/etc");
        assert_eq!(normalize("/../../"), "/");
    }

    #[test]
    fn relative_paths_join_the_root() {
        assert_eq!(resolve(ROOT, "main.py").as_deref(), Some("/workspace/main.py"));
        assert_eq!(resolve(ROOT, "src/app.js").as_deref(), Some("/workspace/src/app.js"));
        assert_eq!(resolve(ROOT, "/workspace").as_deref(), Some("/workspace"));
    }

    #[test]
    fn rejects_escapes() {
        assert_eq!(resolve(ROOT, "/workspace/../etc"), None);
        assert_eq!(resolve(ROOT, "../etc/passwd"), None);
        assert_eq!(resolve(ROOT, "/etc/passwd"), None);
        assert_eq!(resolve(ROOT, "/workspace-other/file"), None);
        assert_eq!(resolve(ROOT, "a/../../b"), None);
        assert_eq!(resolve(ROOT, ""), None);
        assert_eq!(resolve(ROOT, "bad\nname"), None);
    }

    #[test]
    fn prefix_siblings_are_not_within() {
        assert!(is_within("/workspace", "/workspace/a"));
        assert!(is_within("/workspace/", "/workspace"));
        assert!(!is_within("/workspace", "/workspaces"));
    }

    #[test]
    fn control_characters_are_rejected() {
        assert!(has_control_chars("a\tb"));
        assert!(has_control_chars("a\u{1b}[0m"));
        assert!(!has_control_chars("/workspace/src/main.rs"));
        assert_eq!(resolve(ROOT, "bad\u{7f}name"), None);
        assert_eq!(resolve(ROOT, "bell\u{7}"), None);
    }

    #[test]
    fn parent_and_file_name() {
        assert_eq!(parent("/workspace/src/main.py"), "/workspace/src");
        assert_eq!(parent("/main.py"), "/");
        assert_eq!(file_name("/workspace/src/main.py"), "main.py");
    }
}
