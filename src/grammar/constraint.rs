//! Incremental grammar matching over generated text.
//!
//! The matcher tracks every way the text so far can continue as a set of
//! parse stacks. Each stack lists grammar positions still to be matched,
//! innermost last, and is kept expanded so its top is always a character
//! set. An empty stack means the grammar has been matched completely.
//!
//! ```text
//! root ::= "a" b      stacks after "a":   [root.1 → b.0]
//! b    ::= [0-9]+                         top = [0-9]
//! ```

use std::sync::Arc;

use tracing::debug;

use super::{Element, Grammar, RuleId};
use crate::engine::sampler::Candidates;
use crate::error::{Error, Result};
use crate::runtime::{Token, Vocabulary};

/// Position of the next element to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GrammarPos {
    rule: RuleId,
    alt: usize,
    elem: usize,
}

type Stack = Vec<GrammarPos>;

/// An active grammar plus its parse state.
#[derive(Debug, Clone)]
pub struct GrammarConstraint {
    grammar: Arc<Grammar>,
    stacks: Vec<Stack>,
    override_temperature: bool,
}

impl GrammarConstraint {
    /// Start matching `grammar` from its root rule.
    pub fn new(grammar: Grammar, override_temperature: bool) -> Result<Self> {
        let grammar = Arc::new(grammar);
        let stacks = initial_stacks(&grammar);
        if stacks.is_empty() {
            return Err(Error::Grammar("grammar has no usable start state".into()));
        }
        Ok(Self {
            grammar,
            stacks,
            override_temperature,
        })
    }

    /// Parse `src` and start matching it.
    pub fn parse(src: &str, override_temperature: bool) -> Result<Self> {
        Self::new(Grammar::parse(src)?, override_temperature)
    }

    /// The underlying grammar.
    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    /// Whether the grammar forces greedy selection.
    pub fn overrides_temperature(&self) -> bool {
        self.override_temperature
    }

    /// Whether the text accepted so far is a complete match.
    pub fn is_complete(&self) -> bool {
        self.stacks.iter().any(|s| s.is_empty())
    }

    /// Forget everything accepted so far.
    pub fn reset(&mut self) {
        self.stacks = initial_stacks(&self.grammar);
    }

    /// Whether `text` can extend the current parse state.
    pub fn allows_text(&self, text: &str) -> bool {
        advance_text(&self.grammar, &self.stacks, text).is_some()
    }

    /// Drop candidates the grammar cannot accept next.
    ///
    /// End-of-sequence is only allowed once the grammar is complete, and
    /// tokens without text are never allowed.
    pub fn apply<V: Vocabulary + ?Sized>(
        &self,
        candidates: &mut Candidates,
        vocab: &V,
    ) -> Result<()> {
        let eos = vocab.eos_token();
        let complete = self.is_complete();

        candidates.retain(|c| {
            if c.id == eos {
                return complete;
            }
            match vocab.token_to_piece(c.id) {
                Ok(piece) if !piece.is_empty() => self.allows_text(&piece),
                _ => false,
            }
        });

        if candidates.is_empty() {
            return Err(Error::Grammar("no candidate token satisfies the grammar".into()));
        }
        Ok(())
    }

    /// Advance the parse state past `token`.
    pub fn accept<V: Vocabulary + ?Sized>(&mut self, token: Token, vocab: &V) -> Result<()> {
        if token == vocab.eos_token() {
            return Ok(());
        }

        let piece = vocab.token_to_piece(token)?;
        let stacks = advance_text(&self.grammar, &self.stacks, &piece).ok_or_else(|| {
            Error::Grammar(format!("token {token} ({piece:?}) is not allowed by the grammar"))
        })?;
        debug!(token, stacks = stacks.len(), "grammar accepted token");
        self.stacks = stacks;
        Ok(())
    }
}

fn initial_stacks(grammar: &Grammar) -> Vec<Stack> {
    let root = grammar.root();
    let mut stacks = Vec::new();
    for (alt, elements) in grammar.alternatives(root).iter().enumerate() {
        let mut stack = Stack::new();
        if !elements.is_empty() {
            stack.push(GrammarPos { rule: root, alt, elem: 0 });
        }
        expand(grammar, stack, &mut stacks);
    }
    stacks
}

fn element(grammar: &Grammar, pos: GrammarPos) -> &Element {
    &grammar.alternatives(pos.rule)[pos.alt][pos.elem]
}

fn next_pos(grammar: &Grammar, pos: GrammarPos) -> Option<GrammarPos> {
    let len = grammar.alternatives(pos.rule)[pos.alt].len();
    (pos.elem + 1 < len).then_some(GrammarPos {
        elem: pos.elem + 1,
        ..pos
    })
}

/// Expand rule references on top of `stack` until every resulting stack
/// is empty or has a character set on top.
fn expand(grammar: &Grammar, mut stack: Stack, out: &mut Vec<Stack>) {
    let Some(&top) = stack.last() else {
        push_unique(out, stack);
        return;
    };

    match element(grammar, top) {
        Element::Char(_) => push_unique(out, stack),
        Element::Rule(rule) => {
            let rule = *rule;
            stack.pop();
            if let Some(next) = next_pos(grammar, top) {
                stack.push(next);
            }
            for (alt, elements) in grammar.alternatives(rule).iter().enumerate() {
                let mut branch = stack.clone();
                if !elements.is_empty() {
                    branch.push(GrammarPos { rule, alt, elem: 0 });
                }
                expand(grammar, branch, out);
            }
        }
    }
}

fn push_unique(out: &mut Vec<Stack>, stack: Stack) {
    if !out.contains(&stack) {
        out.push(stack);
    }
}

fn advance_char(grammar: &Grammar, stacks: &[Stack], c: char) -> Vec<Stack> {
    let mut out = Vec::new();
    for stack in stacks {
        let Some(&top) = stack.last() else {
            continue;
        };
        let Element::Char(set) = element(grammar, top) else {
            continue;
        };
        if !set.matches(c) {
            continue;
        }
        let mut next = stack.clone();
        next.pop();
        if let Some(pos) = next_pos(grammar, top) {
            next.push(pos);
        }
        expand(grammar, next, &mut out);
    }
    out
}

fn advance_text(grammar: &Grammar, stacks: &[Stack], text: &str) -> Option<Vec<Stack>> {
    let mut current = stacks.to_vec();
    for c in text.chars() {
        current = advance_char(grammar, &current, c);
        if current.is_empty() {
            return None;
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_sequence() {
        let g = GrammarConstraint::parse("root ::= \"ab\"", false).unwrap();
        assert!(g.allows_text("a"));
        assert!(g.allows_text("ab"));
        assert!(!g.allows_text("b"));
        assert!(!g.allows_text("abc"));
        assert!(!g.is_complete());
    }

    #[test]
    fn test_repetition_and_completion() {
        let g = GrammarConstraint::parse("root ::= [0-9]+ \"!\"?", false).unwrap();
        assert!(g.allows_text("123"));
        assert!(g.allows_text("12!"));
        assert!(!g.allows_text("!"));
        assert!(!g.allows_text("1!!"));
    }

    #[test]
    fn test_negated_class() {
        let g = GrammarConstraint::parse("root ::= \"\\\"\" [^\"]* \"\\\"\"", false).unwrap();
        assert!(g.allows_text("\"hello world\""));
        assert!(!g.allows_text("\"a\"b"));
    }

    #[test]
    fn test_empty_root_alternative_is_complete() {
        let g = GrammarConstraint::parse("root ::= \"a\" | ", false).unwrap();
        assert!(g.is_complete());
    }
}
