//! Smart folder criteria and their string form.
//!
//! A [`CriteriaTree`] is a boolean expression over [`Criteria`] leaves. Its
//! canonical serialization is
//!
//! ```text
//! condition:Any (folder Under "News")(condition:All (Read Is "0")(Author Contains "bob"))
//! ```
//!
//! and is stored verbatim in the `smart_folders` table, so the grammar must
//! stay stable across versions.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::field::{field_by_name, Field, FieldTag, FieldType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CriteriaError {
    #[error("criteria syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("unknown condition: {0}")]
    UnknownCondition(String),

    #[error("operator {operator} cannot be applied to field {field}")]
    OperatorMismatch { field: String, operator: String },

    #[error("invalid value {value:?} for field {field}")]
    InvalidValue { field: String, value: String },
}

/// How the children of a [`CriteriaTree`] combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    All,
    Any,
    None,
    Invalid,
}

impl Condition {
    pub fn name(self) -> &'static str {
        match self {
            Condition::All => "All",
            Condition::Any => "Any",
            Condition::None => "None",
            Condition::Invalid => "Invalid",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            Condition::All,
            Condition::Any,
            Condition::None,
            Condition::Invalid,
        ]
        .into_iter()
        .find(|c| c.name().eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Is,
    IsNot,
    IsLessThan,
    IsLessThanOrEqual,
    IsGreaterThan,
    IsGreaterThanOrEqual,
    Contains,
    NotContains,
    IsBefore,
    IsAfter,
    IsOnOrBefore,
    IsOnOrAfter,
    Under,
    NotUnder,
}

const OPERATORS: [Operator; 14] = [
    Operator::Is,
    Operator::IsNot,
    Operator::IsLessThan,
    Operator::IsLessThanOrEqual,
    Operator::IsGreaterThan,
    Operator::IsGreaterThanOrEqual,
    Operator::Contains,
    Operator::NotContains,
    Operator::IsBefore,
    Operator::IsAfter,
    Operator::IsOnOrBefore,
    Operator::IsOnOrAfter,
    Operator::Under,
    Operator::NotUnder,
];

impl Operator {
    pub fn name(self) -> &'static str {
        match self {
            Operator::Is => "Is",
            Operator::IsNot => "IsNot",
            Operator::IsLessThan => "IsLessThan",
            Operator::IsLessThanOrEqual => "IsLessThanOrEqual",
            Operator::IsGreaterThan => "IsGreaterThan",
            Operator::IsGreaterThanOrEqual => "IsGreaterThanOrEqual",
            Operator::Contains => "Contains",
            Operator::NotContains => "NotContains",
            Operator::IsBefore => "IsBefore",
            Operator::IsAfter => "IsAfter",
            Operator::IsOnOrBefore => "IsOnOrBefore",
            Operator::IsOnOrAfter => "IsOnOrAfter",
            Operator::Under => "Under",
            Operator::NotUnder => "NotUnder",
        }
    }

    /// Parse an operator name. `OnOrBefore`/`OnOrAfter` are accepted as
    /// aliases of the `Is`-prefixed forms.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("OnOrBefore") {
            return Some(Operator::IsOnOrBefore);
        }
        if name.eq_ignore_ascii_case("OnOrAfter") {
            return Some(Operator::IsOnOrAfter);
        }
        OPERATORS
            .into_iter()
            .find(|op| op.name().eq_ignore_ascii_case(name))
    }

    /// Whether this operator is meaningful for a field of the given type.
    pub fn applies_to(self, field_type: FieldType) -> bool {
        use Operator::*;
        match field_type {
            FieldType::String => matches!(self, Is | IsNot | Contains | NotContains),
            FieldType::Date => matches!(
                self,
                Is | IsNot | IsBefore | IsAfter | IsOnOrBefore | IsOnOrAfter
            ),
            FieldType::Integer => matches!(
                self,
                Is | IsNot | IsLessThan | IsLessThanOrEqual | IsGreaterThan | IsGreaterThanOrEqual
            ),
            FieldType::Flag => matches!(self, Is | IsNot),
            FieldType::Folder => matches!(self, Is | IsNot | Under | NotUnder),
        }
    }
}

/// A single predicate: `field operator value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criteria {
    pub field: String,
    pub operator: Operator,
    pub value: String,
}

impl Criteria {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Resolve the field through the registry and check the operator fits.
    pub fn resolve(&self) -> Result<&'static Field, CriteriaError> {
        let field = field_by_name(&self.field)
            .ok_or_else(|| CriteriaError::UnknownField(self.field.clone()))?;
        if !self.operator.applies_to(field.field_type) {
            return Err(CriteriaError::OperatorMismatch {
                field: self.field.clone(),
                operator: self.operator.name().to_string(),
            });
        }
        Ok(field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CriteriaNode {
    Leaf(Criteria),
    Tree(CriteriaTree),
}

/// A boolean combination of criteria and nested trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriteriaTree {
    pub condition: Condition,
    pub children: Vec<CriteriaNode>,
}

impl CriteriaTree {
    pub fn new(condition: Condition) -> Self {
        Self {
            condition,
            children: Vec::new(),
        }
    }

    pub fn with_leaf(mut self, criteria: Criteria) -> Self {
        self.children.push(CriteriaNode::Leaf(criteria));
        self
    }

    pub fn with_tree(mut self, tree: CriteriaTree) -> Self {
        self.children.push(CriteriaNode::Tree(tree));
        self
    }

    /// Whether any leaf in the tree tests the given field.
    pub fn references(&self, tag: FieldTag) -> bool {
        self.children.iter().any(|child| match child {
            CriteriaNode::Leaf(c) => field_by_name(&c.field).is_some_and(|f| f.tag == tag),
            CriteriaNode::Tree(t) => t.references(tag),
        })
    }

    /// Iterate over every leaf, depth first.
    pub fn leaves(&self) -> Vec<&Criteria> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Criteria>) {
        for child in &self.children {
            match child {
                CriteriaNode::Leaf(c) => out.push(c),
                CriteriaNode::Tree(t) => t.collect_leaves(out),
            }
        }
    }
}

// ============================================================================
// Serialization
// ============================================================================

const CONDITION_PREFIX: &str = "condition:";

impl fmt::Display for CriteriaTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", CONDITION_PREFIX, self.condition.name())?;
        if !self.children.is_empty() {
            f.write_str(" ")?;
        }
        for child in &self.children {
            match child {
                CriteriaNode::Leaf(c) => write!(f, "({c})")?,
                CriteriaNode::Tree(t) => write!(f, "({t})")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} \"", self.field, self.operator.name())?;
        for c in self.value.chars() {
            if c == '"' || c == '\\' {
                f.write_str("\\")?;
            }
            write!(f, "{c}")?;
        }
        f.write_str("\"")
    }
}

impl FromStr for CriteriaTree {
    type Err = CriteriaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser { src: s, pos: 0 };
        let tree = parser.tree()?;
        parser.skip_ws();
        if parser.pos != s.len() {
            return Err(parser.error("trailing input after criteria"));
        }
        Ok(tree)
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn error(&self, message: &str) -> CriteriaError {
        CriteriaError::Syntax {
            offset: self.pos,
            message: message.to_string(),
        }
    }

    fn expect(&mut self, c: char) -> Result<(), CriteriaError> {
        if self.peek() == Some(c) {
            self.bump();
            Ok(())
        } else {
            Err(self.error(&format!("expected '{c}'")))
        }
    }

    fn starts_with_condition(&self) -> bool {
        self.rest()
            .get(..CONDITION_PREFIX.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(CONDITION_PREFIX))
    }

    fn tree(&mut self) -> Result<CriteriaTree, CriteriaError> {
        self.skip_ws();
        if !self.starts_with_condition() {
            return Err(self.error("expected 'condition:'"));
        }
        self.pos += CONDITION_PREFIX.len();
        self.skip_ws();
        let name = self.word();
        let condition =
            Condition::from_name(&name).ok_or(CriteriaError::UnknownCondition(name))?;

        let mut tree = CriteriaTree::new(condition);
        loop {
            self.skip_ws();
            if self.peek() != Some('(') {
                break;
            }
            self.bump();
            self.skip_ws();
            let node = if self.starts_with_condition() {
                CriteriaNode::Tree(self.tree()?)
            } else {
                CriteriaNode::Leaf(self.leaf()?)
            };
            self.skip_ws();
            self.expect(')')?;
            tree.children.push(node);
        }
        Ok(tree)
    }

    fn leaf(&mut self) -> Result<Criteria, CriteriaError> {
        let field = self.word();
        if field.is_empty() {
            return Err(self.error("expected field name"));
        }
        self.skip_ws();
        let op_name = self.word();
        let operator =
            Operator::from_name(&op_name).ok_or(CriteriaError::UnknownOperator(op_name))?;
        self.skip_ws();
        let value = self.value()?;
        Ok(Criteria {
            field,
            operator,
            value,
        })
    }

    /// A run of characters up to whitespace, a parenthesis or a quote.
    fn word(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                break;
            }
            out.push(c);
            self.bump();
        }
        out
    }

    fn value(&mut self) -> Result<String, CriteriaError> {
        if self.peek() != Some('"') {
            let bare = self.word();
            if bare.is_empty() {
                return Err(self.error("expected value"));
            }
            return Ok(bare);
        }
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated quoted value")),
            }
        }
    }
}
