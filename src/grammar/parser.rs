//! GBNF-style grammar parser.

use std::collections::HashMap;

use super::{Alternative, CharSet, Element, Grammar, RuleId};
use crate::error::{Error, Result};

/// Name of the start rule.
pub const ROOT_RULE: &str = "root";

/// Parse grammar source into a [`Grammar`].
pub fn parse(src: &str) -> Result<Grammar> {
    let mut parser = Parser::new(src);
    parser.parse_rules()?;
    parser.finish()
}

struct Parser {
    src: Vec<char>,
    pos: usize,
    symbols: HashMap<String, RuleId>,
    names: Vec<String>,
    rules: Vec<Option<Vec<Alternative>>>,
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            src: src.chars().collect(),
            pos: 0,
            symbols: HashMap::new(),
            names: Vec::new(),
            rules: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.src.get(self.pos + offset).copied()
    }

    fn error(&self, msg: impl AsRef<str>) -> Error {
        Error::Grammar(format!("{} at offset {}", msg.as_ref(), self.pos))
    }

    fn symbol_id(&mut self, name: &str) -> RuleId {
        if let Some(&id) = self.symbols.get(name) {
            return id;
        }
        let id = self.names.len();
        self.symbols.insert(name.to_string(), id);
        self.names.push(name.to_string());
        self.rules.push(None);
        id
    }

    fn generate_symbol(&mut self, base: &str) -> RuleId {
        let name = format!("{base}_{}", self.names.len());
        self.symbol_id(&name)
    }

    fn skip_space(&mut self, newline_ok: bool) {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' => self.pos += 1,
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' || c == '\r' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                '\r' | '\n' if newline_ok => self.pos += 1,
                _ => break,
            }
        }
    }

    fn parse_rules(&mut self) -> Result<()> {
        self.skip_space(true);
        while self.peek().is_some() {
            let name = self.parse_name()?;
            self.skip_space(false);
            if !self.src[self.pos..].starts_with(&[':', ':', '=']) {
                return Err(self.error("expecting ::="));
            }
            self.pos += 3;
            self.skip_space(true);

            let id = self.symbol_id(&name);
            let alternatives = self.parse_alternates(&name, false)?;
            if self.rules[id].is_some() {
                return Err(self.error(format!("rule '{name}' defined twice")));
            }
            self.rules[id] = Some(alternatives);

            match self.peek() {
                None | Some('\n') | Some('\r') => {}
                Some(c) => return Err(self.error(format!("expecting newline or end, found '{c}'"))),
            }
            self.skip_space(true);
        }
        Ok(())
    }

    fn parse_name(&mut self) -> Result<String> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expecting name"));
        }
        Ok(self.src[start..self.pos].iter().collect())
    }

    fn parse_alternates(&mut self, rule_name: &str, nested: bool) -> Result<Vec<Alternative>> {
        let mut alternatives = vec![self.parse_sequence(rule_name, nested)?];
        while self.peek() == Some('|') {
            self.pos += 1;
            self.skip_space(true);
            alternatives.push(self.parse_sequence(rule_name, nested)?);
        }
        Ok(alternatives)
    }

    fn parse_sequence(&mut self, rule_name: &str, nested: bool) -> Result<Alternative> {
        let mut seq: Alternative = Vec::new();
        let mut last_start = seq.len();

        while let Some(c) = self.peek() {
            match c {
                '"' => {
                    self.pos += 1;
                    last_start = seq.len();
                    loop {
                        match self.peek() {
                            None => return Err(self.error("unexpected end of input in literal")),
                            Some('"') => {
                                self.pos += 1;
                                break;
                            }
                            Some(_) => {
                                let c = self.parse_char()?;
                                seq.push(Element::Char(CharSet::single(c)));
                            }
                        }
                    }
                }
                '[' => {
                    self.pos += 1;
                    last_start = seq.len();
                    let set = self.parse_class()?;
                    seq.push(Element::Char(set));
                }
                '.' => {
                    self.pos += 1;
                    last_start = seq.len();
                    seq.push(Element::Char(CharSet::any()));
                }
                '(' => {
                    self.pos += 1;
                    self.skip_space(true);
                    last_start = seq.len();
                    let sub = self.generate_symbol(rule_name);
                    let alternatives = self.parse_alternates(rule_name, true)?;
                    self.rules[sub] = Some(alternatives);
                    if self.peek() != Some(')') {
                        return Err(self.error("expecting ')'"));
                    }
                    self.pos += 1;
                    seq.push(Element::Rule(sub));
                }
                '*' | '+' | '?' => {
                    if last_start == seq.len() {
                        return Err(self.error(format!("expecting preceding item to '{c}'")));
                    }
                    self.pos += 1;
                    let item = seq.split_off(last_start);
                    let sub = self.generate_symbol(rule_name);
                    let rule = match c {
                        '*' => {
                            let mut repeat = item;
                            repeat.push(Element::Rule(sub));
                            vec![repeat, Vec::new()]
                        }
                        '+' => {
                            let mut repeat = item.clone();
                            repeat.push(Element::Rule(sub));
                            vec![repeat, item]
                        }
                        _ => vec![item, Vec::new()],
                    };
                    self.rules[sub] = Some(rule);
                    seq.push(Element::Rule(sub));
                }
                c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => {
                    last_start = seq.len();
                    let name = self.parse_name()?;
                    let id = self.symbol_id(&name);
                    seq.push(Element::Rule(id));
                }
                _ => break,
            }
            self.skip_space(nested);
        }

        Ok(seq)
    }

    fn parse_class(&mut self) -> Result<CharSet> {
        let negated = self.peek() == Some('^');
        if negated {
            self.pos += 1;
        }

        let mut ranges = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unexpected end of input in character class")),
                Some(']') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let lo = self.parse_char()?;
                    let hi = if self.peek() == Some('-') && self.peek_at(1).is_some_and(|c| c != ']') {
                        self.pos += 1;
                        self.parse_char()?
                    } else {
                        lo
                    };
                    if hi < lo {
                        return Err(self.error(format!("invalid range {lo:?}-{hi:?}")));
                    }
                    ranges.push((lo, hi));
                }
            }
        }

        Ok(CharSet { ranges, negated })
    }

    fn parse_char(&mut self) -> Result<char> {
        let c = self
            .peek()
            .ok_or_else(|| self.error("unexpected end of input"))?;
        self.pos += 1;
        if c != '\\' {
            return Ok(c);
        }

        let escape = self
            .peek()
            .ok_or_else(|| self.error("unexpected end of input in escape"))?;
        self.pos += 1;
        match escape {
            'n' => Ok('\n'),
            'r' => Ok('\r'),
            't' => Ok('\t'),
            '\\' | '"' | '[' | ']' | '-' | '^' => Ok(escape),
            'x' => self.parse_hex(2),
            'u' => self.parse_hex(4),
            'U' => self.parse_hex(8),
            other => Err(self.error(format!("unknown escape '\\{other}'"))),
        }
    }

    fn parse_hex(&mut self, digits: usize) -> Result<char> {
        let end = self.pos + digits;
        if end > self.src.len() {
            return Err(self.error("truncated hex escape"));
        }
        let hex: String = self.src[self.pos..end].iter().collect();
        let value = u32::from_str_radix(&hex, 16)
            .map_err(|_| self.error(format!("invalid hex escape '{hex}'")))?;
        self.pos = end;
        char::from_u32(value).ok_or_else(|| self.error(format!("invalid code point {value:#x}")))
    }

    fn finish(self) -> Result<Grammar> {
        if self.rules.is_empty() {
            return Err(Error::Grammar("grammar has no rules".into()));
        }

        let mut rules = Vec::with_capacity(self.rules.len());
        for (id, rule) in self.rules.into_iter().enumerate() {
            match rule {
                Some(alternatives) => rules.push(alternatives),
                None => {
                    return Err(Error::Grammar(format!(
                        "undefined rule '{}'",
                        self.names[id]
                    )))
                }
            }
        }

        let root = *self
            .symbols
            .get(ROOT_RULE)
            .ok_or_else(|| Error::Grammar("grammar does not define a root rule".into()))?;

        let grammar = Grammar {
            rules,
            names: self.names,
            root,
        };
        check_left_recursion(&grammar)?;
        Ok(grammar)
    }
}

/// Reject rules that can reach themselves without consuming a character.
/// The matcher expands rule references eagerly and would never terminate.
fn check_left_recursion(grammar: &Grammar) -> Result<()> {
    let n = grammar.rule_count();

    let mut nullable = vec![false; n];
    let mut changed = true;
    while changed {
        changed = false;
        for id in 0..n {
            if nullable[id] {
                continue;
            }
            let is_nullable = grammar.alternatives(id).iter().any(|alt| {
                alt.iter().all(|e| match e {
                    Element::Char(_) => false,
                    Element::Rule(r) => nullable[*r],
                })
            });
            if is_nullable {
                nullable[id] = true;
                changed = true;
            }
        }
    }

    let mut leading: Vec<Vec<RuleId>> = vec![Vec::new(); n];
    for (id, edges) in leading.iter_mut().enumerate() {
        for alt in grammar.alternatives(id) {
            for element in alt {
                match element {
                    Element::Char(_) => break,
                    Element::Rule(r) => {
                        edges.push(*r);
                        if !nullable[*r] {
                            break;
                        }
                    }
                }
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(id: RuleId, leading: &[Vec<RuleId>], marks: &mut [Mark]) -> Option<RuleId> {
        marks[id] = Mark::Active;
        for &next in &leading[id] {
            match marks[next] {
                Mark::Active => return Some(next),
                Mark::New => {
                    if let Some(found) = visit(next, leading, marks) {
                        return Some(found);
                    }
                }
                Mark::Done => {}
            }
        }
        marks[id] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; n];
    for id in 0..n {
        if marks[id] == Mark::New {
            if let Some(rule) = visit(id, &leading, &mut marks) {
                return Err(Error::Grammar(format!(
                    "left recursion in rule '{}'",
                    grammar.rule_name(rule)
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_rules() {
        let g = parse("root ::= \"a\" b\nb ::= [0-9]").unwrap();
        assert_eq!(g.rule_count(), 2);
        assert_eq!(g.root(), 0);
        assert_eq!(g.rule_id("b"), Some(1));
        assert_eq!(
            g.alternatives(0),
            &[vec![Element::Char(CharSet::single('a')), Element::Rule(1)]]
        );
    }

    #[test]
    fn test_repetition_generates_rules() {
        let g = parse("root ::= \"x\"*").unwrap();
        assert_eq!(g.rule_count(), 2);
        let sub = g.alternatives(1);
        assert_eq!(sub.len(), 2);
        assert!(sub[1].is_empty());
    }

    #[test]
    fn test_nested_group_spans_lines() {
        let g = parse("root ::= (\n  \"a\" |\n  \"b\"\n)\n").unwrap();
        assert_eq!(g.alternatives(1).len(), 2);
    }

    #[test]
    fn test_comments_and_escapes() {
        let g = parse("# leading\nroot ::= \"\\n\" [\\x41-\\x43] # trailing\n").unwrap();
        let alt = &g.alternatives(0)[0];
        assert_eq!(alt[0], Element::Char(CharSet::single('\n')));
        assert_eq!(
            alt[1],
            Element::Char(CharSet {
                ranges: vec![('A', 'C')],
                negated: false
            })
        );
    }

    #[test]
    fn test_errors() {
        assert!(parse("").is_err());
        assert!(parse("start ::= \"a\"").is_err());
        assert!(parse("root ::= missing").is_err());
        assert!(parse("root ::= \"a").is_err());
        assert!(parse("root ::= *").is_err());
        assert!(parse("root ::= root \"a\"").is_err());
        assert!(parse("root ::= \"a\"\nroot ::= \"b\"").is_err());
    }
}
