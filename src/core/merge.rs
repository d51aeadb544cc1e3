//! Duplicate-eliding ordered merge of two sorted logs.

use std::cmp::Ordering;

use super::event::{Event, compare};

/// Two-pointer union of two sorted logs.
///
/// Duplicates (equal by `compare`) emit one copy. When one log sits entirely
/// after the other, the result is a straight concatenation. The output
/// capacity is preallocated to `|a| + |b|`.
///
/// Commutative and associative up to equality.
pub fn merge(a: &[Event], b: &[Event]) -> Vec<Event> {
    if a.is_empty() {
        return b.to_vec();
    }
    if b.is_empty() {
        return a.to_vec();
    }

    let mut merged = Vec::with_capacity(a.len() + b.len());

    // Fast paths: the most recent event of one log predates the oldest of
    // the other, so no interleaving is possible.
    if compare(&a[0], &b[b.len() - 1]) == Ordering::Greater {
        merged.extend_from_slice(b);
        merged.extend_from_slice(a);
        return merged;
    }
    if compare(&b[0], &a[a.len() - 1]) == Ordering::Greater {
        merged.extend_from_slice(a);
        merged.extend_from_slice(b);
        return merged;
    }

    let push_dedup = |merged: &mut Vec<Event>, e: &Event| {
        if merged
            .last()
            .is_none_or(|last| compare(e, last) != Ordering::Equal)
        {
            merged.push(e.clone());
        }
    };

    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        if i == a.len() {
            push_dedup(&mut merged, &b[j]);
            j += 1;
        } else if j == b.len() {
            push_dedup(&mut merged, &a[i]);
            i += 1;
        } else {
            match compare(&a[i], &b[j]) {
                Ordering::Less => {
                    push_dedup(&mut merged, &a[i]);
                    i += 1;
                }
                Ordering::Greater => {
                    push_dedup(&mut merged, &b[j]);
                    j += 1;
                }
                Ordering::Equal => {
                    // Same event on both sides; advance one pointer only and
                    // let the other copy dedup against the output tail.
                    i += 1;
                }
            }
        }
    }
    merged
}
