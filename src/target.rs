//! Target expression expander.
//!
//! Turns a target expression into a concrete ordered host list against a
//! namespace snapshot. Supported grammar:
//!
//! - bracket ranges: `foo[1-10].example.com` expands to the inclusive
//!   integer range, zero-padded to the width of the lower bound
//! - bracket alternation: `foo[1,3,5].example.com`
//! - tag references: `%db`
//! - union: `%db,%web` or `foo1,bar[1-3]` (commas outside brackets)
//! - set difference: `expr - expr` (the `-` must stand alone)
//!
//! Expansion is a pure function of `(expression, namespace)`: duplicates are
//! removed preserving first occurrence, and the output order is stable.

use thiserror::Error;

use crate::error::PogoError;
use crate::namespace::Namespace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("Unknown tag: {0}")]
    UnknownTag(String),

    #[error("Unparseable range in {0}")]
    UnparseableRange(String),

    #[error("Target expression expands to no hosts")]
    EmptyExpansion,
}

impl From<TargetError> for PogoError {
    fn from(e: TargetError) -> Self {
        match e {
            TargetError::UnknownTag(tag) => PogoError::UnknownTag(tag),
            other => PogoError::InvalidSpec(other.to_string()),
        }
    }
}

/// Expand a target expression to an ordered, deduplicated host list.
pub fn expand(expression: &str, namespace: &Namespace) -> Result<Vec<String>, TargetError> {
    let mut terms = expression.split_whitespace().peekable();
    let first = terms.next().ok_or(TargetError::EmptyExpansion)?;
    if first == "-" {
        return Err(TargetError::UnparseableRange(expression.to_string()));
    }

    let mut hosts = expand_term(first, namespace)?;
    while let Some(op) = terms.next() {
        if op != "-" {
            return Err(TargetError::UnparseableRange(expression.to_string()));
        }
        let rhs_term = terms
            .next()
            .ok_or_else(|| TargetError::UnparseableRange(expression.to_string()))?;
        let rhs: std::collections::HashSet<String> =
            expand_term(rhs_term, namespace)?.into_iter().collect();
        hosts.retain(|h| !rhs.contains(h));
    }

    let deduped = dedup_stable(hosts);
    if deduped.is_empty() {
        return Err(TargetError::EmptyExpansion);
    }
    Ok(deduped)
}

fn expand_term(term: &str, namespace: &Namespace) -> Result<Vec<String>, TargetError> {
    let mut out = Vec::new();
    for piece in split_union(term) {
        if let Some(tag) = piece.strip_prefix('%') {
            if tag.is_empty() || !namespace.knows_tag(tag) {
                return Err(TargetError::UnknownTag(tag.to_string()));
            }
            out.extend(namespace.hosts_with_tag(tag));
        } else {
            out.extend(expand_pattern(piece)?);
        }
    }
    Ok(out)
}

/// Split on commas that sit outside bracket groups.
fn split_union(term: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in term.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                pieces.push(&term[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&term[start..]);
    pieces
}

/// Expand the leftmost bracket group, then recurse on each result so
/// multiple groups multiply out left to right.
fn expand_pattern(pattern: &str) -> Result<Vec<String>, TargetError> {
    let Some(open) = pattern.find('[') else {
        if pattern.contains(']') {
            return Err(TargetError::UnparseableRange(pattern.to_string()));
        }
        return Ok(vec![pattern.to_string()]);
    };
    let close = pattern[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| TargetError::UnparseableRange(pattern.to_string()))?;

    let prefix = &pattern[..open];
    let body = &pattern[open + 1..close];
    let suffix = &pattern[close + 1..];

    let mut out = Vec::new();
    for piece in body.split(',') {
        for number in expand_piece(piece, pattern)? {
            let candidate = format!("{}{}{}", prefix, number, suffix);
            out.extend(expand_pattern(&candidate)?);
        }
    }
    Ok(out)
}

/// One comma-separated piece of a bracket body: a single integer or an
/// inclusive `low-high` range padded to the width of `low`.
fn expand_piece(piece: &str, pattern: &str) -> Result<Vec<String>, TargetError> {
    let unparseable = || TargetError::UnparseableRange(pattern.to_string());

    if let Some((low, high)) = piece.split_once('-') {
        let width = low.len();
        let low_n: u64 = low.parse().map_err(|_| unparseable())?;
        let high_n: u64 = high.parse().map_err(|_| unparseable())?;
        if high_n < low_n {
            return Err(unparseable());
        }
        Ok((low_n..=high_n)
            .map(|n| format!("{:0width$}", n, width = width))
            .collect())
    } else {
        let width = piece.len();
        let n: u64 = piece.parse().map_err(|_| unparseable())?;
        Ok(vec![format!("{:0width$}", n, width = width)])
    }
}

fn dedup_stable(hosts: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    hosts.into_iter().filter(|h| seen.insert(h.clone())).collect()
}
