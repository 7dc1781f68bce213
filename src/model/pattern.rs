//! Filter and search helpers.
//!
//! Patterns are validated locally with `regex` before any remote scan is
//! started, so an invalid expression never reaches the line tool and never
//! disturbs existing filter/search state. The remote tool only selects the
//! matching lines; match columns are computed here.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A filter or search expression
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternSpec {
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    #[serde(default)]
    pub whole_word: bool,
}

fn default_true() -> bool {
    true
}

impl PatternSpec {
    pub fn literal(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            is_regex: false,
            case_sensitive: true,
            whole_word: false,
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            is_regex: true,
            ..Self::literal(pattern)
        }
    }

    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.case_sensitive = yes;
        self
    }

    pub fn whole_word(mut self, yes: bool) -> Self {
        self.whole_word = yes;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    /// Validate and compile the expression.
    pub fn compile(&self) -> Result<CompiledPattern, EngineError> {
        let body = if self.is_regex {
            self.pattern.clone()
        } else {
            regex::escape(&self.pattern)
        };
        let source = if self.whole_word {
            format!(r"\b(?:{body})\b")
        } else {
            body
        };

        let regex = RegexBuilder::new(&source)
            .case_insensitive(!self.case_sensitive)
            .build()
            .map_err(|e| EngineError::Pattern {
                pattern: self.pattern.clone(),
                reason: e.to_string(),
            })?;

        Ok(CompiledPattern {
            spec: self.clone(),
            regex,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    spec: PatternSpec,
    regex: Regex,
}

impl CompiledPattern {
    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    /// Every non-empty match in `line` as `(column, length)` in characters.
    pub fn find_all(&self, line: &str) -> Vec<(usize, usize)> {
        self.regex
            .find_iter(line)
            .filter(|m| !m.is_empty())
            .map(|m| {
                let column = line[..m.start()].chars().count();
                (column, m.as_str().chars().count())
            })
            .collect()
    }
}

/// A line paired with its 0-based line number in the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberedLine {
    pub line: usize,
    pub text: String,
}

impl NumberedLine {
    pub fn new(line: usize, text: impl Into<String>) -> Self {
        Self {
            line,
            text: text.into(),
        }
    }
}

/// One search hit; `line` is 0-based, `column`/`length` count characters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub line: usize,
    pub column: usize,
    pub length: usize,
    pub text: String,
}

/// Active filter, owned by the browse engine
#[derive(Debug, Clone)]
pub struct FilterState {
    pub compiled: CompiledPattern,
    pub matched: Vec<NumberedLine>,
    pub total_count: usize,
}

impl FilterState {
    pub fn matched_count(&self) -> usize {
        self.matched.len()
    }

    /// Match freshly appended lines and keep the ones that pass.
    pub fn absorb(&mut self, first_line: usize, lines: &[String]) -> usize {
        let before = self.matched.len();
        for (offset, text) in lines.iter().enumerate() {
            if self.compiled.is_match(text) {
                self.matched.push(NumberedLine::new(first_line + offset, text.clone()));
            }
        }
        self.total_count += lines.len();
        self.matched.len() - before
    }
}

/// Last completed search, owned by the browse engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchState {
    pub spec: PatternSpec,
    pub result_count: usize,
}

/// Parse `N:text` match output (1-based line numbers) into numbered lines.
///
/// Lines that do not carry a number prefix are skipped.
pub fn parse_numbered_output(stdout: &str) -> Vec<NumberedLine> {
    stdout
        .lines()
        .filter_map(|raw| {
            let (number, text) = raw.split_once(':')?;
            let number: usize = number.trim().parse().ok()?;
            if number == 0 {
                return None;
            }
            Some(NumberedLine::new(number - 1, text))
        })
        .collect()
}

/// Expand matched lines into individual hits, in file order.
pub fn search_matches(compiled: &CompiledPattern, lines: &[NumberedLine]) -> Vec<SearchMatch> {
    let mut matches = Vec::new();
    for line in lines {
        let hits = compiled.find_all(&line.text);
        if hits.is_empty() {
            tracing::debug!(
                "Line {} selected remotely but has no local match for {:?}",
                line.line,
                compiled.spec().pattern
            );
        }
        for (column, length) in hits {
            matches.push(SearchMatch {
                line: line.line,
                column,
                length,
                text: line.text.clone(),
            });
        }
    }
    matches.sort_by_key(|m| (m.line, m.column));
    matches
}
