//! Conformance expressions.
//!
//! A conformance expression states whether an element is mandatory, optional,
//! provisional, unsupported or described in prose, possibly conditioned on
//! feature flags. Examples: `M`, `LT | DF`, `[!OO]`, `HS & (Lt | oo), [CT]`.
//!
//! Operators, in descending precedence: `( ... )` and `[ ... ]` groups, `!`,
//! `&`, `|` and finally the otherwise operator `,`.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{multispace0, satisfy},
    combinator::{all_consuming, map, recognize},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded},
    IResult, Parser,
};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::warn;

use crate::Conformant;

/// Result of evaluating a conformance expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum Conformance {
    Mandatory,
    Optional,
    Provisional,
    NotSupported,
    /// Context dependent conformance that can only be described in prose.
    Desc,
}

impl Conformance {
    /// Boolean negation. Only mandatory/notSupported have a boolean meaning,
    /// every other outcome is passed through.
    pub fn invert(self) -> Conformance {
        match self {
            Conformance::Mandatory => Conformance::NotSupported,
            Conformance::NotSupported => Conformance::Mandatory,
            other => other,
        }
    }

    fn and(self, other: Conformance) -> Conformance {
        use Conformance::*;
        match (self, other) {
            (NotSupported, _) | (_, NotSupported) => NotSupported,
            (Mandatory, x) | (x, Mandatory) => x,
            (Provisional, _) | (_, Provisional) => Provisional,
            _ => Optional,
        }
    }

    fn or(self, other: Conformance) -> Conformance {
        use Conformance::*;
        match (self, other) {
            (Mandatory, _) | (_, Mandatory) => Mandatory,
            (NotSupported, x) | (x, NotSupported) => x,
            (Optional, _) | (_, Optional) => Optional,
            _ => Provisional,
        }
    }

    fn demote(self) -> Conformance {
        match self {
            Conformance::Mandatory => Conformance::Optional,
            other => other,
        }
    }
}

/// A malformed conformance expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot evaluate conformance expression '{expression}': {reason}")]
pub struct ConformanceError {
    pub expression: String,
    pub reason: String,
}

/// Parsed form of a conformance expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Mandatory,
    Optional,
    Provisional,
    NotSupported,
    Desc,
    Term(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `[ ... ]`, demotes mandatory to optional.
    Bracket(Box<Expr>),
    /// `a, b, ...`: the first alternative that is not `notSupported`.
    Otherwise(Vec<Expr>),
}

/// Values of the terms (features, elements) an expression may reference.
pub trait Terms {
    fn value(&self, term: &str) -> Option<bool>;
}

impl<K: Borrow<str> + Hash + Eq> Terms for HashMap<K, bool> {
    fn value(&self, term: &str) -> Option<bool> {
        self.get(term).copied()
    }
}

impl<K: Borrow<str> + Ord> Terms for BTreeMap<K, bool> {
    fn value(&self, term: &str) -> Option<bool> {
        self.get(term).copied()
    }
}

impl<T: Terms + ?Sized> Terms for &T {
    fn value(&self, term: &str) -> Option<bool> {
        (**self).value(term)
    }
}

fn literal(id: &str) -> Option<Expr> {
    let literal = match id.to_ascii_lowercase().as_str() {
        "m" => Expr::Mandatory,
        "o" => Expr::Optional,
        "p" => Expr::Provisional,
        "d" | "x" => Expr::NotSupported,
        "desc" => Expr::Desc,
        _ => return None,
    };
    Some(literal)
}

/// Whether `id` is one of the reserved literal tokens (case insensitive).
pub fn is_literal(id: &str) -> bool {
    literal(id).is_some()
}

fn ws<'a, O, P>(inner: P) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    P: Parser<&'a str, O, nom::error::Error<&'a str>>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(span: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic()),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(span)
}

fn primary(span: &str) -> IResult<&str, Expr> {
    alt((
        delimited(ws(tag("(")), otherwise, ws(tag(")"))),
        map(
            delimited(ws(tag("[")), otherwise, ws(tag("]"))),
            |e| Expr::Bracket(Box::new(e)),
        ),
        map(ws(identifier), |id| {
            literal(id).unwrap_or_else(|| Expr::Term(id.to_string()))
        }),
    ))
    .parse(span)
}

fn unary(span: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(tag("!")), unary), |e| Expr::Not(Box::new(e))),
        primary,
    ))
    .parse(span)
}

fn binary<'a>(
    operand: fn(&'a str) -> IResult<&'a str, Expr>,
    op: &'static str,
    combine: fn(Box<Expr>, Box<Expr>) -> Expr,
) -> impl FnMut(&'a str) -> IResult<&'a str, Expr> {
    move |span| {
        let (span, first) = operand(span)?;
        let (span, rest) = many0(preceded(ws(tag(op)), operand)).parse(span)?;
        Ok((
            span,
            rest.into_iter()
                .fold(first, |acc, e| combine(Box::new(acc), Box::new(e))),
        ))
    }
}

fn and_expr(span: &str) -> IResult<&str, Expr> {
    binary(unary, "&", Expr::And)(span)
}

fn or_expr(span: &str) -> IResult<&str, Expr> {
    binary(and_expr, "|", Expr::Or)(span)
}

fn otherwise(span: &str) -> IResult<&str, Expr> {
    map(separated_list1(ws(tag(",")), or_expr), |mut parts| {
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expr::Otherwise(parts)
        }
    })
    .parse(span)
}

impl Expr {
    pub fn parse(expression: &str) -> Result<Expr, ConformanceError> {
        all_consuming(otherwise)
            .parse(expression)
            .map(|(_, e)| e)
            .map_err(|e| ConformanceError {
                expression: expression.to_string(),
                reason: format!("{}", e),
            })
    }

    fn contains_desc(&self) -> bool {
        match self {
            Expr::Desc => true,
            Expr::Not(e) | Expr::Bracket(e) => e.contains_desc(),
            Expr::And(a, b) | Expr::Or(a, b) => a.contains_desc() || b.contains_desc(),
            Expr::Otherwise(parts) => parts.iter().any(Expr::contains_desc),
            _ => false,
        }
    }

    pub fn evaluate(&self, terms: &impl Terms) -> Conformance {
        // a description anywhere makes the whole outcome context dependent
        if self.contains_desc() {
            return Conformance::Desc;
        }
        self.evaluate_inner(terms)
    }

    fn evaluate_inner(&self, terms: &impl Terms) -> Conformance {
        match self {
            Expr::Mandatory => Conformance::Mandatory,
            Expr::Optional => Conformance::Optional,
            Expr::Provisional => Conformance::Provisional,
            Expr::NotSupported => Conformance::NotSupported,
            Expr::Desc => Conformance::Desc,
            Expr::Term(t) => match terms.value(t) {
                Some(true) => Conformance::Mandatory,
                _ => Conformance::NotSupported,
            },
            Expr::Not(e) => e.evaluate_inner(terms).invert(),
            Expr::And(a, b) => a.evaluate_inner(terms).and(b.evaluate_inner(terms)),
            Expr::Or(a, b) => a.evaluate_inner(terms).or(b.evaluate_inner(terms)),
            Expr::Bracket(e) => e.evaluate_inner(terms).demote(),
            Expr::Otherwise(parts) => parts
                .iter()
                .map(|p| p.evaluate_inner(terms))
                .find(|c| *c != Conformance::NotSupported)
                .unwrap_or(Conformance::NotSupported),
        }
    }
}

/// Evaluates `expression`, reporting malformed input as an error.
pub fn try_evaluate(expression: &str, terms: &impl Terms) -> Result<Conformance, ConformanceError> {
    Ok(Expr::parse(expression)?.evaluate(terms))
}

/// Evaluates `expression`. Malformed expressions degrade to `notSupported`.
///
/// ```
/// use std::collections::HashMap;
/// use zcl_data_model::conformance::{evaluate, Conformance};
///
/// let features = HashMap::from([("HS", true), ("Lt", true), ("oo", false)]);
/// assert_eq!(evaluate("HS & (Lt | oo)", &features), Conformance::Mandatory);
/// assert_eq!(evaluate("[oo]", &features), Conformance::NotSupported);
/// ```
pub fn evaluate(expression: &str, terms: &impl Terms) -> Conformance {
    match try_evaluate(expression, terms) {
        Ok(c) => c,
        Err(e) => {
            warn!("{}", e);
            Conformance::NotSupported
        }
    }
}

/// All identifier tokens of an expression, in order of appearance.
///
/// Works on malformed expressions as well.
pub fn terms(expression: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut rest = expression;
    while !rest.is_empty() {
        match identifier(rest) {
            Ok((tail, id)) => {
                result.push(id);
                rest = tail;
            }
            Err(_) => {
                // skip one char (operators, whitespace, digits outside of ids)
                let mut chars = rest.chars();
                chars.next();
                rest = chars.as_str();
            }
        }
    }
    result
}

/// Whether `expression` references exactly the token `term`.
pub fn has_term(expression: &str, term: &str) -> bool {
    terms(expression).into_iter().any(|t| t == term)
}

/// Whether `expression` contains a `desc` term.
pub fn has_desc(expression: &str) -> bool {
    terms(expression)
        .into_iter()
        .any(|t| t.eq_ignore_ascii_case("desc"))
}

/// Terms that are neither literals nor known to `terms`.
pub fn missing_terms<'a>(expression: &'a str, known: &impl Terms) -> Vec<&'a str> {
    let mut missing: Vec<&str> = Vec::new();
    for t in terms(expression) {
        if !is_literal(t) && known.value(t).is_none() && !missing.contains(&t) {
            missing.push(t);
        }
    }
    missing
}

/// Elements whose conformance cannot be determined mechanically (contain `desc`).
pub fn filter_desc_elements<'a, T: Conformant>(elements: &'a [T]) -> Vec<&'a T> {
    elements
        .iter()
        .filter(|e| has_desc(e.conformance()))
        .collect()
}

/// Elements whose conformance contains `desc` AND references `feature_code`.
pub fn filter_related_desc_elements<'a, T: Conformant>(
    elements: &'a [T],
    feature_code: &str,
) -> Vec<&'a T> {
    filter_desc_elements(elements)
        .into_iter()
        .filter(|e| has_term(e.conformance(), feature_code))
        .collect()
}
