// Splits a requested range into ordered serve-from-disk / fetch-from-network actions.

use std::fmt;

use super::fragment::{ByteRange, FragmentSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action {
    pub kind: ActionKind,
    pub range: ByteRange,
}

impl Action {
    pub fn local(range: ByteRange) -> Self {
        Self {
            kind: ActionKind::Local,
            range,
        }
    }

    pub fn remote(range: ByteRange) -> Self {
        Self {
            kind: ActionKind::Remote,
            range,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.range)
    }
}

/// Plan the actions needed to deliver `range`.
///
/// The result tiles `range` exactly, in ascending offset order. Local actions are
/// at most `package_size` bytes long; remote actions cover each uncached gap whole.
pub fn plan_actions(range: ByteRange, fragments: &FragmentSet, package_size: u64) -> Vec<Action> {
    let package_size = package_size.max(1);

    let mut locals = Vec::new();
    for hit in fragments.query(&range) {
        let mut start = hit.start;
        while start < hit.end {
            let end = start.saturating_add(package_size).min(hit.end);
            if let Some(piece) = ByteRange::new(start, end) {
                locals.push(Action::local(piece));
            }
            start = end;
        }
    }

    if locals.is_empty() {
        return vec![Action::remote(range)];
    }

    let mut actions = Vec::with_capacity(locals.len() * 2 + 1);
    let mut cursor = range.start;
    for local in locals {
        if let Some(gap) = ByteRange::new(cursor, local.range.start) {
            actions.push(Action::remote(gap));
        }
        cursor = local.range.end;
        actions.push(local);
    }
    if let Some(tail) = ByteRange::new(cursor, range.end) {
        actions.push(Action::remote(tail));
    }

    actions
}
