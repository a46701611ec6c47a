//! Composition model: component specs and nested composites.
//!
//! A [`Composition`] is a tree of [`Composite`]s. The orchestrator only ever
//! works with the flattened, validated list of [`ComponentSpec`]s produced
//! by [`Composition::flatten`].

use std::collections::{BTreeMap, BTreeSet};

use orbit_id::{ComponentName, CompositionName, FactoryName, IsolateId, NodeName, RuntimeKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CompositionError;

// =============================================================================
// Component Spec
// =============================================================================

/// Hard placement constraint of a component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Any compatible isolate.
    #[default]
    None,
    /// Only this isolate.
    Isolate(IsolateId),
    /// Any compatible isolate on this node.
    Node(NodeName),
}

impl Constraint {
    /// Returns true if the constraint names a specific target.
    pub fn is_explicit(&self) -> bool {
        !matches!(self, Constraint::None)
    }

    /// Returns true if an isolate with `id` on `node` satisfies the constraint.
    pub fn admits(&self, id: &IsolateId, node: &NodeName) -> bool {
        match self {
            Constraint::None => true,
            Constraint::Isolate(target) => target == id,
            Constraint::Node(target) => target == node,
        }
    }
}

/// An immutable component declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: ComponentName,
    pub factory: FactoryName,
    pub kind: RuntimeKind,

    #[serde(default)]
    pub constraint: Constraint,

    /// Soft node preference, used by the distance criterion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_node: Option<NodeName>,

    /// Opaque configuration forwarded with the placement command.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,

    /// Field name -> target component. Validated, never interpreted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wires: BTreeMap<String, ComponentName>,
}

impl ComponentSpec {
    pub fn new(name: ComponentName, factory: FactoryName, kind: RuntimeKind) -> Self {
        Self {
            name,
            factory,
            kind,
            constraint: Constraint::None,
            preferred_node: None,
            properties: Map::new(),
            wires: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = constraint;
        self
    }

    #[must_use]
    pub fn preferring(mut self, node: NodeName) -> Self {
        self.preferred_node = Some(node);
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_wire(mut self, field: impl Into<String>, target: ComponentName) -> Self {
        self.wires.insert(field.into(), target);
        self
    }

    /// The node this component should land on, if any.
    ///
    /// A hard node constraint wins over the soft preference.
    pub fn target_node(&self) -> Option<&NodeName> {
        match &self.constraint {
            Constraint::Node(node) => Some(node),
            _ => self.preferred_node.as_ref(),
        }
    }
}

// =============================================================================
// Composites
// =============================================================================

/// A named group of components and nested composites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Composite {
    pub name: String,

    #[serde(default)]
    pub components: Vec<ComponentSpec>,

    #[serde(default)]
    pub composites: Vec<Composite>,
}

impl Composite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
            composites: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_component(mut self, spec: ComponentSpec) -> Self {
        self.components.push(spec);
        self
    }

    #[must_use]
    pub fn with_composite(mut self, child: Composite) -> Self {
        self.composites.push(child);
        self
    }

    fn collect(&self, out: &mut Vec<ComponentSpec>) -> Result<(), CompositionError> {
        if self.name.is_empty() || self.name.contains('.') {
            return Err(CompositionError::InvalidCompositeName(self.name.clone()));
        }
        out.extend(self.components.iter().cloned());
        for child in &self.composites {
            child.collect(out)?;
        }
        Ok(())
    }
}

/// A declarative application: a name plus a root composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    pub name: CompositionName,
    pub root: Composite,
}

impl Composition {
    /// A composition whose root holds `components` directly.
    pub fn new(name: CompositionName, components: Vec<ComponentSpec>) -> Self {
        let root = Composite {
            name: name.to_string().replace('.', "_"),
            components,
            composites: Vec::new(),
        };
        Self { name, root }
    }

    /// Flattens the composite tree into declaration order and validates it.
    ///
    /// Components of a composite come before those of its children; children
    /// are visited in declaration order.
    pub fn flatten(&self) -> Result<Vec<ComponentSpec>, CompositionError> {
        let mut specs = Vec::new();
        self.root.collect(&mut specs)?;
        validate_specs(&specs, &BTreeSet::new())?;
        Ok(specs)
    }
}

/// Checks names are unique and every wire resolves.
///
/// `known` holds components that already exist outside `specs`, so wires to
/// them are accepted.
pub(crate) fn validate_specs(
    specs: &[ComponentSpec],
    known: &BTreeSet<ComponentName>,
) -> Result<(), CompositionError> {
    let mut names = BTreeSet::new();
    for spec in specs {
        if known.contains(&spec.name) || !names.insert(spec.name.clone()) {
            return Err(CompositionError::DuplicateComponent(spec.name.clone()));
        }
    }
    for spec in specs {
        for (field, target) in &spec.wires {
            if !names.contains(target) && !known.contains(target) {
                return Err(CompositionError::DanglingWire {
                    component: spec.name.clone(),
                    field: field.clone(),
                    target: target.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ComponentSpec {
        ComponentSpec::new(
            name.parse().unwrap(),
            "F".parse().unwrap(),
            "python".parse().unwrap(),
        )
    }

    #[test]
    fn test_flatten_declaration_order() {
        let root = Composite::new("root")
            .with_component(spec("a"))
            .with_composite(
                Composite::new("inner")
                    .with_component(spec("c"))
                    .with_composite(Composite::new("leaf").with_component(spec("d"))),
            )
            .with_component(spec("b"))
            .with_composite(Composite::new("second").with_component(spec("e")));
        let composition = Composition {
            name: "app".parse().unwrap(),
            root,
        };

        let names: Vec<String> = composition
            .flatten()
            .unwrap()
            .iter()
            .map(|s| s.name.to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_flatten_rejects_duplicates() {
        let root = Composite::new("root")
            .with_component(spec("a"))
            .with_composite(Composite::new("inner").with_component(spec("a")));
        let composition = Composition {
            name: "app".parse().unwrap(),
            root,
        };
        assert_eq!(
            composition.flatten(),
            Err(CompositionError::DuplicateComponent("a".parse().unwrap()))
        );
    }

    #[test]
    fn test_flatten_rejects_dotted_composite() {
        let root = Composite::new("root").with_composite(Composite::new("a.b"));
        let composition = Composition {
            name: "app".parse().unwrap(),
            root,
        };
        assert!(matches!(
            composition.flatten(),
            Err(CompositionError::InvalidCompositeName(name)) if name == "a.b"
        ));
    }

    #[test]
    fn test_flatten_rejects_dangling_wire() {
        let a = spec("a").with_wire("logger", "missing".parse().unwrap());
        let composition = Composition::new("app".parse().unwrap(), vec![a, spec("b")]);
        assert!(matches!(
            composition.flatten(),
            Err(CompositionError::DanglingWire { field, .. }) if field == "logger"
        ));
    }

    #[test]
    fn test_wire_to_sibling_composite_resolves() {
        let root = Composite::new("root")
            .with_component(spec("a").with_wire("store", "b".parse().unwrap()))
            .with_composite(Composite::new("storage").with_component(spec("b")));
        let composition = Composition {
            name: "app".parse().unwrap(),
            root,
        };
        assert_eq!(composition.flatten().unwrap().len(), 2);
    }

    #[test]
    fn test_target_node_prefers_hard_constraint() {
        let s = spec("a")
            .preferring("n2".parse().unwrap())
            .with_constraint(Constraint::Node("n1".parse().unwrap()));
        assert_eq!(s.target_node().map(|n| n.as_str()), Some("n1"));
        assert_eq!(
            spec("b").preferring("n2".parse().unwrap()).target_node().map(|n| n.as_str()),
            Some("n2")
        );
    }

    #[test]
    fn test_spec_deserialize_defaults() {
        let s: ComponentSpec = serde_json::from_value(serde_json::json!({
            "name": "c1",
            "factory": "F",
            "kind": "python",
            "constraint": { "isolate": "iso-Z" }
        }))
        .unwrap();
        assert_eq!(s.constraint, Constraint::Isolate("iso-Z".parse().unwrap()));
        assert!(s.properties.is_empty());
        assert!(s.wires.is_empty());
    }
}
