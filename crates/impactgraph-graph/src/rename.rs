use std::collections::BTreeSet;

use impactgraph_core::{EntityRef, Fact, Location};
use similar::TextDiff;

/// A retract+assert pair treated as one rename.
#[derive(Debug, Clone, PartialEq)]
pub struct RenameCandidate {
    pub from: EntityRef,
    pub to: EntityRef,
    pub location: Location,
    pub similarity: f64,
}

/// Character-level similarity in `[0, 1]`.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    f64::from(TextDiff::from_chars(a, b).ratio())
}

fn declarations(facts: &[Fact]) -> Vec<(&EntityRef, Location)> {
    facts
        .iter()
        .filter_map(|f| match f {
            Fact::Declares { entity, location } => Some((entity, *location)),
            Fact::Relates { .. } => None,
        })
        .collect()
}

/// Pairs retracted and asserted declarations of the same kind on the same
/// line whose names are similar enough.
///
/// `still_declared` are refs the artifact declares after the change and
/// `was_declared` those it declared before; a ref in either set on the
/// wrong side is a move, not a rename.
pub fn detect_renames(
    removed: &[Fact],
    added: &[Fact],
    was_declared: &BTreeSet<EntityRef>,
    still_declared: &BTreeSet<EntityRef>,
    threshold: f64,
) -> Vec<RenameCandidate> {
    let mut retracted: Vec<(&EntityRef, Location)> = declarations(removed)
        .into_iter()
        .filter(|(r, _)| !still_declared.contains(*r))
        .collect();
    retracted.sort();
    let asserted: Vec<(&EntityRef, Location)> = declarations(added)
        .into_iter()
        .filter(|(r, _)| !was_declared.contains(*r))
        .collect();

    let mut used: BTreeSet<&EntityRef> = BTreeSet::new();
    let mut renames = Vec::new();
    for (old, location) in retracted {
        let best = asserted
            .iter()
            .filter(|(new, loc)| {
                new.kind == old.kind && loc.line == location.line && !used.contains(*new)
            })
            .map(|(new, _)| (*new, name_similarity(&old.name, &new.name)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|(a_ref, a), (b_ref, b)| a.total_cmp(b).then_with(|| b_ref.cmp(a_ref)));

        if let Some((new, similarity)) = best {
            used.insert(new);
            renames.push(RenameCandidate {
                from: old.clone(),
                to: new.clone(),
                location,
                similarity,
            });
        }
    }
    renames
}

#[cfg(test)]
mod tests {
    use super::*;
    use impactgraph_core::EntityKind;

    fn declared(facts: &[Fact]) -> BTreeSet<EntityRef> {
        declarations(facts).into_iter().map(|(r, _)| r.clone()).collect()
    }

    #[test]
    fn similar_name_on_same_line_is_a_rename() {
        let removed = vec![Fact::declares(EntityKind::Method, "UserService.findUserById", 12)];
        let added = vec![Fact::declares(EntityKind::Method, "UserService.findById", 12)];
        let renames = detect_renames(
            &removed,
            &added,
            &declared(&removed),
            &declared(&added),
            0.6,
        );
        assert_eq!(renames.len(), 1);
        assert_eq!(renames[0].to.name, "UserService.findById");
        assert!(renames[0].similarity > 0.8);
    }

    #[test]
    fn different_line_kind_or_name_is_not_a_rename() {
        let removed = vec![Fact::declares(EntityKind::Method, "UserService.findUserById", 12)];
        for added in [
            vec![Fact::declares(EntityKind::Method, "UserService.findById", 13)],
            vec![Fact::declares(EntityKind::Field, "UserService.findById", 12)],
            vec![Fact::declares(EntityKind::Method, "Cache.evict", 12)],
        ] {
            let renames = detect_renames(
                &removed,
                &added,
                &declared(&removed),
                &declared(&added),
                0.6,
            );
            assert!(renames.is_empty(), "{:?}", added);
        }
    }

    #[test]
    fn moved_declaration_is_not_a_rename() {
        let removed = vec![Fact::declares(EntityKind::Method, "UserService.save", 4)];
        let added = vec![Fact::declares(EntityKind::Method, "UserService.saved", 4)];
        let mut still = declared(&added);
        still.insert(EntityRef::new(EntityKind::Method, "UserService.save"));
        let renames = detect_renames(&removed, &added, &declared(&removed), &still, 0.6);
        assert!(renames.is_empty());
    }
}
