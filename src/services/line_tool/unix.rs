//! POSIX utilities: sed, awk, grep, tail.

use super::command::{CommandSpec, CommandSyntax};
use super::LineQuery;
use crate::model::pattern::PatternSpec;

#[derive(Debug, Clone, Copy, Default)]
pub struct UnixSyntax;

impl CommandSyntax for UnixSyntax {
    fn range(&self, path: &str, start: usize, end: usize) -> CommandSpec {
        // sed addresses are 1-based and inclusive; quit after the last line
        // so large files are not read to the end.
        CommandSpec::new("sed")
            .arg("-n")
            .arg(format!("{},{}p;{}q", start + 1, end, end))
            .arg("--")
            .arg(path)
    }

    fn count_lines(&self, path: &str) -> CommandSpec {
        // awk counts an unterminated last line, unlike `wc -l`
        CommandSpec::new("awk").arg("END { print NR }").arg(path)
    }

    fn matching(&self, path: &str, pattern: &PatternSpec) -> CommandSpec {
        // Patterns are validated with the `regex` crate, whose escapes
        // (\d, \s, \b) are Perl syntax; grep's -E does not know them.
        // -a keeps non-UTF-8 files from being reported as binary.
        let mut spec = CommandSpec::new("grep").arg("-n").arg("-a");
        spec = spec.arg(if pattern.is_regex { "-P" } else { "-F" });
        if !pattern.case_sensitive {
            spec = spec.arg("-i");
        }
        if pattern.whole_word {
            spec = spec.arg("-w");
        }
        spec.arg("-e").arg(pattern.pattern.as_str()).arg("--").arg(path)
    }

    fn follow(&self, path: &str) -> CommandSpec {
        CommandSpec::new("tail")
            .arg("-n")
            .arg("0")
            .arg("-F")
            .arg("--")
            .arg(path)
    }

    fn is_success(&self, query: &LineQuery, exit_code: Option<i32>) -> bool {
        match query {
            // grep exits 1 when nothing matched
            LineQuery::Match(_) => matches!(exit_code, Some(0) | Some(1)),
            _ => exit_code == Some(0),
        }
    }
}
