//! Identity resolution over the store's key and alias indexes.
//!
//! A raw mention resolves, in order, to:
//! 1. the entity owning its canonical key (tombstoned entities included, so a
//!    re-declared symbol revives with its old id);
//! 2. the single live entity of the same kind that carries the mention's
//!    canonical key as an alias (`findUserById` -> `UserService.findUserById`);
//! 3. an entity whose canonical key equals one of the mention's derived
//!    aliases (a qualified declaration absorbing an earlier bare reference),
//!    unless that entity already answers to some other qualified name.
//!
//! Ambiguous alias matches never merge.

use std::collections::BTreeSet;

use impactgraph_core::{AliasKey, CanonicalKey, EntityId, EntityKind, EntityRef, TransformRegistry};

/// Read access to identity indexes. Implemented by snapshots and by the
/// updater's in-transaction overlay.
pub trait IdentityIndex {
    fn by_key(&self, key: &CanonicalKey) -> Option<EntityId>;

    /// Live entities of `kind` answering to `alias`.
    fn by_alias(&self, alias: &AliasKey, kind: EntityKind) -> BTreeSet<EntityId>;

    fn alias_keys_of(&self, id: EntityId) -> BTreeSet<AliasKey>;
}

/// Which index matched, for logging and read tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Key(EntityId),
    Alias(EntityId),
    Unresolved,
}

impl Resolution {
    pub fn id(self) -> Option<EntityId> {
        match self {
            Resolution::Key(id) | Resolution::Alias(id) => Some(id),
            Resolution::Unresolved => None,
        }
    }
}

pub fn resolve_identity<I: IdentityIndex + ?Sized>(
    index: &I,
    registry: &TransformRegistry,
    entity: &EntityRef,
) -> Resolution {
    let key = registry.canonical_key(entity);
    if let Some(id) = index.by_key(&key) {
        return Resolution::Key(id);
    }

    let aliases = registry.alias_keys(entity);
    if let Some(own) = aliases.first() {
        let candidates = index.by_alias(own, entity.kind);
        if candidates.len() == 1 {
            if let Some(id) = candidates.into_iter().next() {
                return Resolution::Alias(id);
            }
        }
    }

    for derived in aliases.iter().skip(1) {
        if let Some(id) = index.by_key(&CanonicalKey::new(entity.kind, derived.key.clone())) {
            if index
                .alias_keys_of(id)
                .iter()
                .all(|existing| aliases.contains(existing))
            {
                return Resolution::Alias(id);
            }
        }
    }
    Resolution::Unresolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use impactgraph_core::NamingScope;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MapIndex {
        keys: BTreeMap<CanonicalKey, EntityId>,
        aliases: BTreeMap<AliasKey, BTreeSet<EntityId>>,
    }

    impl IdentityIndex for MapIndex {
        fn by_key(&self, key: &CanonicalKey) -> Option<EntityId> {
            self.keys.get(key).copied()
        }

        fn by_alias(&self, alias: &AliasKey, _kind: EntityKind) -> BTreeSet<EntityId> {
            self.aliases.get(alias).cloned().unwrap_or_default()
        }

        fn alias_keys_of(&self, id: EntityId) -> BTreeSet<AliasKey> {
            self.aliases
                .iter()
                .filter(|(_, ids)| ids.contains(&id))
                .map(|(alias, _)| alias.clone())
                .collect()
        }
    }

    impl MapIndex {
        fn add(&mut self, registry: &TransformRegistry, entity: &EntityRef) -> EntityId {
            let id = EntityId::new();
            self.keys.insert(registry.canonical_key(entity), id);
            for alias in registry.alias_keys(entity) {
                self.aliases.entry(alias).or_default().insert(id);
            }
            id
        }
    }

    #[test]
    fn bare_reference_resolves_to_qualified_declaration() {
        let registry = TransformRegistry::default();
        let mut index = MapIndex::default();
        let id = index.add(
            &registry,
            &EntityRef::new(EntityKind::Method, "UserService.findUserById"),
        );

        let bare = EntityRef::new(EntityKind::Method, "findUserById");
        assert_eq!(resolve_identity(&index, &registry, &bare), Resolution::Alias(id));

        let exact = EntityRef::new(EntityKind::Method, "UserService#findUserById(Long)");
        assert_eq!(resolve_identity(&index, &registry, &exact), Resolution::Key(id));
    }

    #[test]
    fn ambiguous_aliases_do_not_merge() {
        let registry = TransformRegistry::default();
        let mut index = MapIndex::default();
        index.add(&registry, &EntityRef::new(EntityKind::Method, "UserService.save"));
        index.add(&registry, &EntityRef::new(EntityKind::Method, "OrderService.save"));

        let bare = EntityRef::new(EntityKind::Method, "save");
        assert_eq!(
            resolve_identity(&index, &registry, &bare),
            Resolution::Unresolved
        );
    }

    #[test]
    fn qualified_declaration_absorbs_bare_reference() {
        let registry = TransformRegistry::default();
        let mut index = MapIndex::default();
        let bare = index.add(&registry, &EntityRef::new(EntityKind::Method, "findUserById"));

        let qualified = EntityRef::new(EntityKind::Method, "UserService.findUserById");
        assert_eq!(
            resolve_identity(&index, &registry, &qualified),
            Resolution::Alias(bare)
        );
        assert_eq!(
            registry.alias_keys(&qualified)[1],
            AliasKey::new(NamingScope::Code, "find_user_by_id")
        );
    }

    #[test]
    fn bare_entity_is_absorbed_by_one_qualified_name_only() {
        let registry = TransformRegistry::default();
        let mut index = MapIndex::default();
        let bare = index.add(&registry, &EntityRef::new(EntityKind::Method, "save"));
        index
            .aliases
            .entry(AliasKey::new(NamingScope::Code, "user_service.save"))
            .or_default()
            .insert(bare);

        let other = EntityRef::new(EntityKind::Method, "OrderService.save");
        assert_eq!(
            resolve_identity(&index, &registry, &other),
            Resolution::Unresolved
        );
        let same = EntityRef::new(EntityKind::Method, "UserService.save");
        assert_eq!(
            resolve_identity(&index, &registry, &same),
            Resolution::Alias(bare)
        );
    }
}
