//! Static deny-list checked before any command reaches a sandbox.
//!
//! This is a guard against accidental self-harm, not an isolation boundary;
//! the provider's container is what actually contains candidate code.

/// A blocked shell fragment.
struct Pattern {
    needle: &'static str,
    reason: &'static str,
    /// Only match when the fragment ends a word, so `rm -rf /` does not
    /// also block `rm -rf /workspace/build`.
    word_end: bool,
}

const BLOCKED: &[Pattern] = &[
    Pattern { needle: "rm -rf /", reason: "recursive deletion of the root filesystem", word_end: true },
    Pattern { needle: "rm -rf /*", reason: "recursive deletion of the root filesystem", word_end: false },
    Pattern { needle: "rm -fr /", reason: "recursive deletion of the root filesystem", word_end: true },
    Pattern { needle: "rm -rf ~", reason: "recursive deletion of the home directory", word_end: true },
    Pattern { needle: "rm -rf --no-preserve-root", reason: "recursive deletion of the root filesystem", word_end: false },
    Pattern { needle: ":(){ :|:& };:", reason: "fork bomb", word_end: false },
    Pattern { needle: ":(){:|:&};:", reason: "fork bomb", word_end: false },
    Pattern { needle: "mkfs", reason: "filesystem formatting", word_end: false },
    Pattern { needle: "dd if=/dev/zero of=/dev/", reason: "raw disk write", word_end: false },
    Pattern { needle: "dd if=/dev/random of=/dev/", reason: "raw disk write", word_end: false },
    Pattern { needle: "> /dev/sda", reason: "raw disk write", word_end: false },
    Pattern { needle: "of=/dev/sda", reason: "raw disk write", word_end: false },
    Pattern { needle: "chmod -r 777 /", reason: "recursive permission change of the root filesystem", word_end: true },
    Pattern { needle: "shutdown", reason: "system shutdown", word_end: true },
    Pattern { needle: "reboot", reason: "system reboot", word_end: true },
    Pattern { needle: "poweroff", reason: "system shutdown", word_end: true },
    Pattern { needle: "halt", reason: "system shutdown", word_end: true },
    Pattern { needle: "init 0", reason: "system shutdown", word_end: true },
];

/// Why a command was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocked {
    pub pattern: &'static str,
    pub reason: &'static str,
}

impl std::fmt::Display for Blocked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command blocked ({}): matched `{}`", self.reason, self.pattern)
    }
}

/// Check a command against the deny-list.
///
/// Matching is case-insensitive on the command with runs of whitespace
/// collapsed, so `RM  -RF /` is caught as well.
pub fn check_command(command: &str) -> Result<(), Blocked> {
    let normalized = normalize(command);
    for pattern in BLOCKED {
        if contains_pattern(&normalized, pattern) {
            return Err(Blocked {
                pattern: pattern.needle,
                reason: pattern.reason,
            });
        }
    }
    Ok(())
}

fn normalize(command: &str) -> String {
    command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn contains_pattern(haystack: &str, pattern: &Pattern) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(pattern.needle) {
        let begin = start + pos;
        let end = begin + pattern.needle.len();
        if !pattern.word_end || is_boundary(haystack[end..].chars().next()) {
            // Words like "shutdown" must also start on a boundary.
            let starts_clean = !pattern.word_end
                || !pattern.needle.starts_with(|c: char| c.is_ascii_alphabetic())
                || is_boundary(haystack[..begin].chars().next_back());
            if starts_clean {
                return true;
            }
        }
        start = begin + 1;
        while !haystack.is_char_boundary(start) {
            start += 1;
        }
    }
    false
}

fn is_boundary(c: Option<char>) -> bool {
    match c {
        None => true,
        Some(c) => c.is_whitespace() || matches!(c, ';' | '&' | '|' | '*' | ')' | '(' | '`' | '"' | '\''),
    }
}
