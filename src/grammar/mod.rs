//! Grammar-constrained sampling.
//!
//! Grammars use a GBNF-style notation:
//!
//! ```text
//! root   ::= answer ("," answer)*
//! answer ::= "yes" | "no" | [0-9]+
//! ```
//!
//! Supported: string literals with escapes, character classes (`[a-z]`,
//! `[^"]`), `.` for any character, rule references, parenthesized groups,
//! `*` `+` `?` repetition and `#` comments. A rule ends at a newline unless
//! it is inside parentheses. A `root` rule is required.
//!
//! Groups and repetitions are lowered into generated rules, so the matcher
//! only ever sees sequences of character sets and rule references.

pub mod constraint;
pub mod parser;

pub use constraint::GrammarConstraint;

/// Index of a rule inside a [`Grammar`].
pub type RuleId = usize;

/// Set of characters matched by one grammar element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharSet {
    /// Inclusive ranges.
    pub ranges: Vec<(char, char)>,
    /// Match everything except the ranges.
    pub negated: bool,
}

impl CharSet {
    /// A single character.
    pub fn single(c: char) -> Self {
        Self {
            ranges: vec![(c, c)],
            negated: false,
        }
    }

    /// Any character.
    pub fn any() -> Self {
        Self {
            ranges: Vec::new(),
            negated: true,
        }
    }

    /// Whether `c` belongs to the set.
    pub fn matches(&self, c: char) -> bool {
        let in_ranges = self.ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
        in_ranges != self.negated
    }
}

/// One step of an alternative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// Match one character from the set.
    Char(CharSet),
    /// Match the referenced rule.
    Rule(RuleId),
}

/// A sequence of elements. Empty alternatives match the empty string.
pub type Alternative = Vec<Element>;

/// A parsed grammar.
#[derive(Debug, Clone, PartialEq)]
pub struct Grammar {
    /// Alternatives of each rule, indexed by [`RuleId`].
    rules: Vec<Vec<Alternative>>,
    /// Rule names (generated rules are named `<parent>_<n>`).
    names: Vec<String>,
    /// The `root` rule.
    root: RuleId,
}

impl Grammar {
    /// Parse grammar source.
    pub fn parse(src: &str) -> crate::Result<Self> {
        parser::parse(src)
    }

    /// Number of rules, including generated ones.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// The start rule.
    pub fn root(&self) -> RuleId {
        self.root
    }

    /// Look up a rule by name.
    pub fn rule_id(&self, name: &str) -> Option<RuleId> {
        self.names.iter().position(|n| n == name)
    }

    /// Name of a rule.
    pub fn rule_name(&self, id: RuleId) -> &str {
        &self.names[id]
    }

    /// Alternatives of a rule.
    pub fn alternatives(&self, id: RuleId) -> &[Alternative] {
        &self.rules[id]
    }
}
