//! Entity resolution: who owns a stored blob.
//!
//! Records attached to user, course, category, or system contexts name
//! their owner directly. Everything else (activity modules, blocks, ...)
//! is attributed to the nearest enclosing course found by scanning the
//! context path from leaf toward root. Content that resolves to nothing
//! lands in the `other` bucket.

use tracing::warn;

use crate::models::{ContentRecord, ContextKind, CourseLookup};

/// The owning entity of a single inventory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    User(i64),
    /// A course, together with the category it lives in.
    Course { course: i64, category: i64 },
    Category(i64),
    /// Site-level or unattributable content.
    Other(i64),
}

/// Split a `/1/3/15/27` style path into context ids, root first.
///
/// Empty segments are ignored. Any non-numeric segment makes the whole
/// path malformed, which yields an empty chain.
pub fn parse_context_path(path: &str) -> Vec<i64> {
    let mut ids = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        match segment.trim().parse::<i64>() {
            Ok(id) => ids.push(id),
            Err(_) => return Vec::new(),
        }
    }
    ids
}

/// The record's own context id: the last element of its path.
pub fn context_id(path: &str) -> Option<i64> {
    parse_context_path(path).last().copied()
}

/// Find the nearest enclosing course for a context path.
///
/// The leaf (the context itself) is skipped; ancestors are scanned from
/// the leaf's parent toward the root and the first one present in the
/// lookup wins.
pub fn resolve_course<'a>(
    path: &str,
    lookup: &'a CourseLookup,
) -> Option<&'a crate::models::CourseInfo> {
    let ids = parse_context_path(path);
    let (_, ancestors) = ids.split_last()?;
    ancestors
        .iter()
        .rev()
        .find_map(|id| lookup.by_context(*id))
}

/// Classify a record by context kind and resolve its owner.
pub fn classify(record: &ContentRecord, lookup: &CourseLookup) -> Owner {
    match record.context_kind {
        ContextKind::User => Owner::User(record.owner_hint),
        ContextKind::Category => Owner::Category(record.owner_hint),
        ContextKind::System => Owner::Other(record.owner_hint),
        ContextKind::Course => classify_course(record, lookup),
        ContextKind::Other => classify_nested(record, lookup),
    }
}

fn classify_course(record: &ContentRecord, lookup: &CourseLookup) -> Owner {
    let info = context_id(&record.context_path).and_then(|ctx| lookup.by_context(ctx));
    match info {
        Some(info) => Owner::Course {
            course: info.course_id,
            category: info.category_id,
        },
        None => {
            warn!(
                record = record.id,
                course = record.owner_hint,
                path = %record.context_path,
                "course context missing from course lookup; counting as other"
            );
            Owner::Other(record.owner_hint)
        }
    }
}

fn classify_nested(record: &ContentRecord, lookup: &CourseLookup) -> Owner {
    match resolve_course(&record.context_path, lookup) {
        Some(info) => Owner::Course {
            course: info.course_id,
            category: info.category_id,
        },
        None => {
            warn!(
                record = record.id,
                path = %record.context_path,
                "no enclosing course; counting as other"
            );
            Owner::Other(record.owner_hint)
        }
    }
}
