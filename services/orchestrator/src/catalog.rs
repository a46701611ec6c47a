//! Factory catalog: which factories each isolate can instantiate.
//!
//! The catalog is the hard compatibility gate for placement.

use std::collections::{BTreeMap, BTreeSet};

use orbit_id::{FactoryName, IsolateId, RuntimeKind};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Declaration {
    kind: RuntimeKind,
    factories: BTreeSet<FactoryName>,
}

/// isolate -> declared (kind, factories).
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    declarations: BTreeMap<IsolateId, Declaration>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the declaration of `isolate`.
    pub fn declare(
        &mut self,
        isolate: &IsolateId,
        kind: &RuntimeKind,
        factories: impl IntoIterator<Item = FactoryName>,
    ) {
        self.declarations.insert(
            isolate.clone(),
            Declaration {
                kind: kind.clone(),
                factories: factories.into_iter().collect(),
            },
        );
    }

    /// True if `isolate` declared `factory` for runtime `kind`.
    pub fn supports(&self, isolate: &IsolateId, factory: &FactoryName, kind: &RuntimeKind) -> bool {
        self.declarations
            .get(isolate)
            .is_some_and(|d| d.kind == *kind && d.factories.contains(factory))
    }

    /// Forgets the declaration of a tombstoned isolate.
    pub fn clear(&mut self, isolate: &IsolateId) {
        self.declarations.remove(isolate);
    }

    /// Declared factories of `isolate`, in name order.
    pub fn factories(&self, isolate: &IsolateId) -> Vec<FactoryName> {
        self.declarations
            .get(isolate)
            .map(|d| d.factories.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn catalog() -> Catalog {
        let mut catalog = Catalog::new();
        catalog.declare(
            &"iso-A".parse().unwrap(),
            &"python".parse().unwrap(),
            ["F".parse().unwrap(), "G".parse().unwrap()],
        );
        catalog
    }

    #[rstest]
    #[case("iso-A", "F", "python", true)]
    #[case("iso-A", "G", "python", true)]
    #[case("iso-A", "H", "python", false)]
    #[case("iso-A", "F", "java", false)]
    #[case("iso-B", "F", "python", false)]
    fn test_supports(
        #[case] isolate: &str,
        #[case] factory: &str,
        #[case] kind: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(
            catalog().supports(
                &isolate.parse().unwrap(),
                &factory.parse().unwrap(),
                &kind.parse().unwrap()
            ),
            expected
        );
    }

    #[test]
    fn test_declare_replaces() {
        let mut catalog = catalog();
        let iso: IsolateId = "iso-A".parse().unwrap();
        catalog.declare(&iso, &"python".parse().unwrap(), ["H".parse().unwrap()]);
        assert_eq!(catalog.factories(&iso), vec!["H".parse::<FactoryName>().unwrap()]);
    }

    #[test]
    fn test_clear() {
        let mut catalog = catalog();
        let iso: IsolateId = "iso-A".parse().unwrap();
        catalog.clear(&iso);
        assert!(catalog.factories(&iso).is_empty());
        assert!(!catalog.supports(&iso, &"F".parse().unwrap(), &"python".parse().unwrap()));
    }
}
