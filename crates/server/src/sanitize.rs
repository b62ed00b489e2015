//! Free-text sanitization for prompts and command arguments.
//!
//! Neutralizes shell-metacharacter injection sequences and truncates
//! to a maximum length. Must be idempotent: sanitizing already-clean
//! text is a no-op.

/// Maximum prompt length after sanitization
pub const MAX_PROMPT_CHARS: usize = 50_000;

/// Command patterns that are unconditionally appended to every
/// request's denylist, regardless of role.
pub const DANGEROUS_COMMAND_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "mkfs*",
    "dd if=*",
    ":(){ :|:& };:",
    "chmod -R 777 /",
    "> /dev/sda",
    "shutdown*",
    "reboot*",
];

/// Sanitize free text before it reaches the backend.
///
/// Substitution sequences (`$(`, backtick, `${`) are neutralized by
/// escaping the introducing character; control characters other than
/// newline and tab are stripped. Escapes are only added when the
/// character is not already escaped, which keeps the function
/// idempotent.
pub fn sanitize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();

    let mut emitted = 0usize;
    let mut i = 0;
    while i < chars.len() && emitted < MAX_PROMPT_CHARS {
        let c = chars[i];
        let prev_escaped = out.ends_with('\\');

        match c {
            '`' if !prev_escaped => {
                out.push('\\');
                out.push('`');
                emitted += 2;
            }
            '$' if !prev_escaped && matches!(chars.get(i + 1), Some('(') | Some('{')) => {
                out.push('\\');
                out.push('$');
                emitted += 2;
            }
            c if c.is_control() && c != '\n' && c != '\t' => {
                // dropped
            }
            c => {
                out.push(c);
                emitted += 1;
            }
        }
        i += 1;
    }

    truncate_chars(&out, MAX_PROMPT_CHARS)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

/// Prefix-wildcard match: a pattern ending in `*` matches any string
/// with that prefix, otherwise the match is exact.
pub fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => candidate.starts_with(prefix),
        None => candidate == pattern,
    }
}

/// Append the fixed dangerous patterns to a denylist, skipping ones
/// already present so repeated merging stays stable.
pub fn append_dangerous_patterns(denied: &mut Vec<String>) {
    for pattern in DANGEROUS_COMMAND_PATTERNS {
        if !denied.iter().any(|d| d == pattern) {
            denied.push((*pattern).to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutralizes_command_substitution() {
        let out = sanitize_text("echo $(whoami) and `id`");
        assert_eq!(out, r"echo \$(whoami) and \`id\`");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_text("run `ls` with $(pwd) and ${HOME}\x07");
        let twice = sanitize_text(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn plain_dollar_is_untouched() {
        assert_eq!(sanitize_text("costs $5"), "costs $5");
    }

    #[test]
    fn strips_control_chars_keeps_newlines() {
        let out = sanitize_text("line1\nline2\tindent\x00\x1b[31m");
        assert_eq!(out, "line1\nline2\tindent[31m");
    }

    #[test]
    fn truncates_to_max() {
        let long = "a".repeat(MAX_PROMPT_CHARS + 100);
        assert_eq!(sanitize_text(&long).chars().count(), MAX_PROMPT_CHARS);
    }

    #[test]
    fn prefix_wildcard_matching() {
        assert!(pattern_matches("mkfs*", "mkfs.ext4"));
        assert!(pattern_matches("/help", "/help"));
        assert!(!pattern_matches("/help", "/helper"));
        assert!(pattern_matches("/debug*", "/debug-verbose"));
    }

    #[test]
    fn dangerous_patterns_merge_is_stable() {
        let mut denied = vec!["custom".to_string()];
        append_dangerous_patterns(&mut denied);
        let len = denied.len();
        append_dangerous_patterns(&mut denied);
        assert_eq!(denied.len(), len);
        assert!(denied.iter().any(|d| d == "rm -rf /"));
    }
}
