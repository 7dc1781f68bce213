//! PowerShell equivalents of the POSIX line utilities.

use super::command::{CommandSpec, CommandSyntax};
use crate::model::pattern::PatternSpec;

#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsSyntax;

/// Quote for a single-quoted PowerShell string literal
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn powershell(script: String) -> CommandSpec {
    CommandSpec::new("powershell")
        .arg("-NoProfile")
        .arg("-NonInteractive")
        .arg("-Command")
        .arg(script)
}

impl CommandSyntax for WindowsSyntax {
    fn range(&self, path: &str, start: usize, end: usize) -> CommandSpec {
        powershell(format!(
            "Get-Content -LiteralPath {} | Select-Object -Skip {} -First {}",
            quote(path),
            start,
            end.saturating_sub(start)
        ))
    }

    fn count_lines(&self, path: &str) -> CommandSpec {
        powershell(format!(
            "$n = 0; Get-Content -LiteralPath {} -ReadCount 1000 | ForEach-Object {{ $n += $_.Count }}; $n",
            quote(path)
        ))
    }

    fn matching(&self, path: &str, pattern: &PatternSpec) -> CommandSpec {
        let mut expr = if pattern.is_regex {
            pattern.pattern.clone()
        } else {
            // Select-String -SimpleMatch cannot be combined with word bounds
            escape_regex(&pattern.pattern)
        };
        if pattern.whole_word {
            expr = format!(r"\b(?:{})\b", expr);
        }
        let case = if pattern.case_sensitive {
            " -CaseSensitive"
        } else {
            ""
        };
        powershell(format!(
            "Select-String -LiteralPath {} -Pattern {}{} | ForEach-Object {{ '{{0}}:{{1}}' -f $_.LineNumber, $_.Line }}",
            quote(path),
            quote(&expr),
            case
        ))
    }

    fn follow(&self, path: &str) -> CommandSpec {
        powershell(format!(
            "Get-Content -LiteralPath {} -Tail 0 -Wait",
            quote(path)
        ))
    }
}

fn escape_regex(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if "\\.+*?()|[]{}^$#".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quotes_are_doubled() {
        assert_eq!(quote("C:\\it's.log"), "'C:\\it''s.log'");
    }

    #[test]
    fn test_range_uses_skip_and_first() {
        let spec = WindowsSyntax.range("C:\\a.log", 1000, 2000);
        assert_eq!(spec.program, "powershell");
        assert_eq!(
            spec.args.last().map(String::as_str),
            Some("Get-Content -LiteralPath 'C:\\a.log' | Select-Object -Skip 1000 -First 1000")
        );
    }

    #[test]
    fn test_literal_match_is_escaped() {
        let spec = WindowsSyntax.matching("a", &PatternSpec::literal("1.5"));
        let script = spec.args.last().cloned().unwrap_or_default();
        assert!(script.contains(r"-Pattern '1\.5' -CaseSensitive"));

        let insensitive = WindowsSyntax.matching("a", &PatternSpec::regex("x+").case_sensitive(false));
        let script = insensitive.args.last().cloned().unwrap_or_default();
        assert!(!script.contains("-CaseSensitive"));
    }
}
