//! Change sets: the operational-transformation algebra.
//!
//! A change set describes one edit as the full sequence of the resulting
//! text, where every element either points back at a position in the prior
//! text (`Kept`) or carries a new unit (`Inserted`):
//!
//! ```text
//!   before:  A  B  C                (length_before = 3)
//!   items:   X  1  Y                (Inserted X, Kept(1), Inserted Y)
//!   after:   X  B  Y                (length_after = 3)
//! ```
//!
//! Deletions are implicit: any prior position not referenced is gone.
//!
//! ## Operations
//!
//! | Operation | Precondition | Result |
//! |-----------|--------------|--------|
//! | `compose(a, b)` | `a.after == b.before` | `a` then `b` in one step |
//! | `merge(a, b)` | `a.before == b.before` | commutative union of both edits |
//! | `follow(a, b)` | `a.before == b.before` | what to apply on top of `a` to also get `b` |
//! | `forward_positions` | positions in `0..=before` | gap offsets in the new text |
//!
//! The convergence contract: `apply(apply(t, a), follow(a, b)) ==
//! apply(apply(t, b), follow(b, a))`.
//!
//! ## Text forms
//!
//! - Wire JSON: `{"lengthBefore":3,"lengthAfter":3,"items":[{"glyph":"X"},1,{"glyph":"Y"}]}`
//! - Diagnostic: `3>X,1,Y` (logs and tests only)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Write as _};
use std::str::FromStr;
use thiserror::Error;

use crate::unit::{CharUnit, CharUnitError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangeSetError {
    #[error("change set expects length {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("kept index {index} is out of range for length {length}")]
    KeptOutOfRange { index: usize, length: usize },
    #[error("kept index {index} follows {previous}; kept indices must be strictly increasing")]
    KeptOutOfOrder { previous: usize, index: usize },
    #[error("lengthAfter is {declared} but there are {actual} items")]
    LengthAfterMismatch { declared: usize, actual: usize },
    #[error("malformed diagnostic string: {0}")]
    MalformedDiag(String),
    #[error("malformed change set JSON: {0}")]
    Json(String),
}

impl From<CharUnitError> for ChangeSetError {
    fn from(e: CharUnitError) -> Self {
        ChangeSetError::MalformedDiag(e.to_string())
    }
}

/// One element of a change set's resulting text.
///
/// On the wire a kept index is a bare integer and an insertion is a unit
/// object, so the untagged representation is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Item {
    /// Position in the prior text whose unit survives.
    Kept(usize),
    /// New unit.
    Inserted(CharUnit),
}

impl Item {
    pub fn as_kept(&self) -> Option<usize> {
        match self {
            Item::Kept(ix) => Some(*ix),
            Item::Inserted(_) => None,
        }
    }

    pub fn as_inserted(&self) -> Option<&CharUnit> {
        match self {
            Item::Inserted(unit) => Some(unit),
            Item::Kept(_) => None,
        }
    }
}

/// An immutable description of one edit.
///
/// Values built by this module (`identity`, `compose`, `merge`, `follow`,
/// the builder) are valid by construction. Values decoded from JSON carry
/// whatever the peer sent and must pass [`ChangeSet::validate`] before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    length_before: usize,
    length_after: usize,
    items: Vec<Item>,
}

impl ChangeSet {
    /// The change set that keeps every unit of a text of length `n`.
    pub fn identity(n: usize) -> Self {
        Self {
            length_before: n,
            length_after: n,
            items: (0..n).map(Item::Kept).collect(),
        }
    }

    /// Start building a change set over a text of length `length_before`.
    pub fn builder(length_before: usize) -> ChangeSetBuilder {
        ChangeSetBuilder {
            length_before,
            items: Vec::new(),
        }
    }

    pub fn length_before(&self) -> usize {
        self.length_before
    }

    pub fn length_after(&self) -> usize {
        self.length_after
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// True if the change set leaves its input untouched.
    pub fn is_identity(&self) -> bool {
        self.length_before == self.length_after
            && self
                .items
                .iter()
                .enumerate()
                .all(|(i, item)| item.as_kept() == Some(i))
    }

    // ─── Validation ───────────────────────────────────────────────────

    /// Check the structural invariants: `length_after` equals the item
    /// count, and kept indices are strictly increasing and `< length_before`.
    pub fn validate(&self) -> Result<(), ChangeSetError> {
        if self.length_after != self.items.len() {
            return Err(ChangeSetError::LengthAfterMismatch {
                declared: self.length_after,
                actual: self.items.len(),
            });
        }
        let mut previous: Option<usize> = None;
        for index in self.items.iter().filter_map(Item::as_kept) {
            if index >= self.length_before {
                return Err(ChangeSetError::KeptOutOfRange {
                    index,
                    length: self.length_before,
                });
            }
            if let Some(previous) = previous {
                if index <= previous {
                    return Err(ChangeSetError::KeptOutOfOrder { previous, index });
                }
            }
            previous = Some(index);
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    // ─── Application ──────────────────────────────────────────────────

    /// Produce the text that results from applying this change to `text`.
    pub fn apply(&self, text: &[CharUnit]) -> Result<Vec<CharUnit>, ChangeSetError> {
        if text.len() != self.length_before {
            return Err(ChangeSetError::LengthMismatch {
                expected: self.length_before,
                actual: text.len(),
            });
        }
        self.items
            .iter()
            .map(|item| match item {
                Item::Kept(ix) => text.get(*ix).cloned().ok_or(ChangeSetError::KeptOutOfRange {
                    index: *ix,
                    length: text.len(),
                }),
                Item::Inserted(unit) => Ok(unit.clone()),
            })
            .collect()
    }

    /// Map gap positions in the prior text to gap positions in the new text.
    ///
    /// Position `p` is the gap before prior unit `p` (`length_before` is the
    /// end). While scanning, a kept index `i` resolves `p == i + 1` to the
    /// gap right after that unit in the output, and any `p <= i` to the gap
    /// before it. Each position resolves once; unresolved ones land at the
    /// end of the new text.
    ///
    /// Preferring the gap after the upcoming kept unit means a caret sitting
    /// where another peer inserts stays in front of the insertion.
    pub fn forward_positions(&self, positions: &mut [usize]) {
        let mut resolved = vec![false; positions.len()];
        let mut cursor = 0usize;
        for item in &self.items {
            if let Item::Kept(ix) = item {
                for (pos, done) in positions.iter_mut().zip(resolved.iter_mut()) {
                    if *done {
                        continue;
                    }
                    if *pos == ix + 1 {
                        *pos = cursor + 1;
                        *done = true;
                    } else if *pos <= *ix {
                        *pos = cursor;
                        *done = true;
                    }
                }
            }
            cursor += 1;
        }
        for (pos, done) in positions.iter_mut().zip(resolved) {
            if !done {
                *pos = cursor;
            }
        }
    }

    // ─── Algebra ──────────────────────────────────────────────────────

    /// The change equivalent to applying `self` and then `b`.
    pub fn compose(&self, b: &ChangeSet) -> Result<ChangeSet, ChangeSetError> {
        if self.length_after != b.length_before {
            return Err(ChangeSetError::LengthMismatch {
                expected: self.length_after,
                actual: b.length_before,
            });
        }
        let items = b
            .items
            .iter()
            .map(|item| match item {
                Item::Inserted(_) => Ok(item.clone()),
                Item::Kept(ix) => {
                    self.items
                        .get(*ix)
                        .cloned()
                        .ok_or(ChangeSetError::KeptOutOfRange {
                            index: *ix,
                            length: self.items.len(),
                        })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ChangeSet {
            length_before: self.length_before,
            length_after: items.len(),
            items,
        })
    }

    /// Union of two concurrent edits on the same text.
    ///
    /// A unit survives only if both sides keep it; every insertion from
    /// either side survives. Insertions facing each other are emitted in
    /// [`CharUnit`] order, so `a.merge(b) == b.merge(a)`.
    pub fn merge(&self, b: &ChangeSet) -> Result<ChangeSet, ChangeSetError> {
        self.check_same_base(b)?;
        let (a_items, b_items) = (&self.items, &b.items);
        let mut items = Vec::with_capacity(a_items.len().max(b_items.len()));
        let (mut ia, mut ib) = (0, 0);
        while ia < a_items.len() || ib < b_items.len() {
            let (Some(xa), Some(xb)) = (a_items.get(ia), b_items.get(ib)) else {
                // One side is exhausted: only its partner's insertions remain
                if let Some(Item::Inserted(unit)) = a_items.get(ia) {
                    items.push(Item::Inserted(unit.clone()));
                }
                if let Some(Item::Inserted(unit)) = b_items.get(ib) {
                    items.push(Item::Inserted(unit.clone()));
                }
                ia += 1;
                ib += 1;
                continue;
            };
            match (xa, xb) {
                (Item::Kept(ka), Item::Kept(kb)) => match ka.cmp(kb) {
                    Ordering::Equal => {
                        items.push(Item::Kept(*ka));
                        ia += 1;
                        ib += 1;
                    }
                    Ordering::Less => ia += 1,
                    Ordering::Greater => ib += 1,
                },
                (Item::Inserted(ua), Item::Inserted(ub)) => {
                    let (first, second) = if ua < ub { (ua, ub) } else { (ub, ua) };
                    items.push(Item::Inserted(first.clone()));
                    items.push(Item::Inserted(second.clone()));
                    ia += 1;
                    ib += 1;
                }
                (Item::Inserted(ua), Item::Kept(_)) => {
                    items.push(Item::Inserted(ua.clone()));
                    ia += 1;
                }
                (Item::Kept(_), Item::Inserted(ub)) => {
                    items.push(Item::Inserted(ub.clone()));
                    ib += 1;
                }
            }
        }
        Ok(ChangeSet {
            length_before: self.length_before,
            length_after: items.len(),
            items,
        })
    }

    /// The change to apply on top of `self`'s result so that it also
    /// contains `b`'s edit (the OT transform).
    ///
    /// The result's base is `self`'s resulting text, so kept positions are
    /// `self` item indices: `self`'s insertions become kept references,
    /// `b`'s insertions stay insertions, and units kept by both stay kept.
    /// When both sides insert into the same gap, the two runs of consecutive
    /// insertions are ordered as whole sequences (lexicographically by
    /// [`CharUnit`]) and the lesser run is emitted first. Equal runs produce
    /// the same text in either order, so both directions converge.
    pub fn follow(&self, b: &ChangeSet) -> Result<ChangeSet, ChangeSetError> {
        self.check_same_base(b)?;
        let (a_items, b_items) = (&self.items, &b.items);
        let mut items = Vec::with_capacity(a_items.len() + b_items.len());
        let (mut ia, mut ib) = (0, 0);
        while ia < a_items.len() || ib < b_items.len() {
            match (a_items.get(ia), b_items.get(ib)) {
                (Some(Item::Kept(ka)), Some(Item::Kept(kb))) => match ka.cmp(kb) {
                    Ordering::Equal => {
                        items.push(Item::Kept(ia));
                        ia += 1;
                        ib += 1;
                    }
                    Ordering::Less => ia += 1,
                    Ordering::Greater => ib += 1,
                },
                (Some(Item::Inserted(_)), Some(Item::Inserted(_))) => {
                    let run_a = insertion_run(&a_items[ia..]);
                    let run_b = insertion_run(&b_items[ib..]);
                    if run_a <= run_b {
                        items.extend((ia..ia + run_a.len()).map(Item::Kept));
                        ia += run_a.len();
                    } else {
                        ib += run_b.len();
                        items.extend(run_b.into_iter().cloned().map(Item::Inserted));
                    }
                }
                (Some(Item::Inserted(_)), _) => {
                    items.push(Item::Kept(ia));
                    ia += 1;
                }
                (_, Some(Item::Inserted(ub))) => {
                    items.push(Item::Inserted(ub.clone()));
                    ib += 1;
                }
                // A kept unit facing nothing was deleted by the other side
                (Some(Item::Kept(_)), None) => ia += 1,
                (None, Some(Item::Kept(_))) => ib += 1,
                (None, None) => break,
            }
        }
        Ok(ChangeSet {
            length_before: self.length_after,
            length_after: items.len(),
            items,
        })
    }

    fn check_same_base(&self, b: &ChangeSet) -> Result<(), ChangeSetError> {
        if self.length_before != b.length_before {
            return Err(ChangeSetError::LengthMismatch {
                expected: self.length_before,
                actual: b.length_before,
            });
        }
        Ok(())
    }

    // ─── Serialization ────────────────────────────────────────────────

    /// Encode to the wire JSON form.
    pub fn to_json(&self) -> Result<String, ChangeSetError> {
        serde_json::to_string(self).map_err(|e| ChangeSetError::Json(e.to_string()))
    }

    /// Decode from the wire JSON form. The result is *not* validated.
    pub fn from_json(json: &str) -> Result<Self, ChangeSetError> {
        serde_json::from_str(json).map_err(|e| ChangeSetError::Json(e.to_string()))
    }

    /// Encode to the diagnostic form, e.g. `13>0,X,5,6,\n`.
    pub fn to_diag_string(&self) -> String {
        self.to_string()
    }
}

/// Incremental construction; the only place a change set is mutated.
#[derive(Debug, Clone)]
pub struct ChangeSetBuilder {
    length_before: usize,
    items: Vec<Item>,
}

impl ChangeSetBuilder {
    /// Keep prior units `first..=last`.
    pub fn keep_range(mut self, first: usize, last: usize) -> Self {
        self.items.extend((first..=last).map(Item::Kept));
        self
    }

    pub fn keep(self, index: usize) -> Self {
        self.keep_range(index, index)
    }

    pub fn insert(mut self, unit: CharUnit) -> Self {
        self.items.push(Item::Inserted(unit));
        self
    }

    /// Insert every `char` of `s` as a plain unit.
    pub fn insert_str(mut self, s: &str) -> Self {
        self.items.extend(s.chars().map(|c| Item::Inserted(CharUnit::from_char(c))));
        self
    }

    /// Finish, checking that the kept ranges were appended in order.
    pub fn build(self) -> Result<ChangeSet, ChangeSetError> {
        let cs = ChangeSet {
            length_before: self.length_before,
            length_after: self.items.len(),
            items: self.items,
        };
        cs.validate()?;
        Ok(cs)
    }
}

/// The units inserted consecutively at the start of `items`.
fn insertion_run(items: &[Item]) -> Vec<&CharUnit> {
    items.iter().map_while(Item::as_inserted).collect()
}

// ─── Diagnostic form ──────────────────────────────────────────────────

/// Glyphs that would read back as something else are backslash-escaped.
fn needs_escape(glyph: &str) -> bool {
    matches!(glyph, "," | "\\") || glyph.chars().all(|c| c.is_ascii_digit())
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>", self.length_before)?;
        for (i, item) in self.items.iter().enumerate() {
            if i != 0 {
                f.write_char(',')?;
            }
            match item {
                Item::Kept(ix) => write!(f, "{ix}")?,
                Item::Inserted(unit) => {
                    match unit.glyph() {
                        "\n" => f.write_str("\\n")?,
                        g if needs_escape(g) => write!(f, "\\{g}")?,
                        g => f.write_str(g)?,
                    }
                    if let Some(reading) = unit.reading() {
                        f.write_char('(')?;
                        for c in reading.chars() {
                            if matches!(c, ',' | '\\') {
                                f.write_char('\\')?;
                            }
                            f.write_char(c)?;
                        }
                        f.write_char(')')?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_diag_unit(part: &str) -> Result<CharUnit, ChangeSetError> {
    let malformed = || ChangeSetError::MalformedDiag(format!("bad item {part:?}"));
    let mut chars = part.chars();
    let first = chars.next().ok_or_else(malformed)?;
    let glyph = if first == '\\' {
        match chars.next().ok_or_else(malformed)? {
            'n' => '\n',
            escaped => escaped,
        }
    } else {
        first
    };
    let rest = chars.as_str();
    if rest.is_empty() {
        return Ok(CharUnit::from_char(glyph));
    }
    let escaped = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(malformed)?;
    let mut reading = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        reading.push(if c == '\\' { chars.next().ok_or_else(malformed)? } else { c });
    }
    Ok(CharUnit::with_reading(glyph.to_string(), reading)?)
}

/// Split on commas that are not backslash-escaped.
fn split_diag_items(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            ',' => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

impl FromStr for ChangeSet {
    type Err = ChangeSetError;

    /// Parse the diagnostic form. Only the syntax is checked; run
    /// [`ChangeSet::validate`] for the invariants.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (len_str, items_str) = s
            .split_once('>')
            .ok_or_else(|| ChangeSetError::MalformedDiag(format!("missing '>' in {s:?}")))?;
        let length_before = len_str
            .parse::<usize>()
            .map_err(|e| ChangeSetError::MalformedDiag(format!("bad length {len_str:?}: {e}")))?;
        let mut items = Vec::new();
        if !items_str.is_empty() {
            for part in split_diag_items(items_str) {
                let item = match part.parse::<usize>() {
                    Ok(ix) => Item::Kept(ix),
                    Err(_) => Item::Inserted(parse_diag_unit(part)?),
                };
                items.push(item);
            }
        }
        Ok(ChangeSet {
            length_before,
            length_after: items.len(),
            items,
        })
    }
}
