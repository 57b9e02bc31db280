use std::sync::OnceLock;

use tracing::trace;

use crate::{
    element::Elem,
    schema::{Attr, Schema, SeqItem},
    Map, Set,
};

/// One type flattened through its extension chain and group references:
/// base attributes and child order come ahead of the subtype's own.
#[derive(Debug, Clone, Default)]
struct Flat {
    attrs: Vec<Attr>,
    order: Vec<String>,
    has_id: bool,
}

/// Reorders unordered bags of output elements into schema-valid child
/// order, and answers attribute-level questions the export path needs
/// ("is this required", "does this type carry an identifier").
#[derive(Debug, Default)]
pub struct Sequencer {
    flat: Map<String, Flat>,
    element_types: Map<String, String>,
}

impl Sequencer {
    pub fn new(schema: &Schema) -> Self {
        let mut seq = Sequencer {
            flat: Map::new(),
            element_types: schema.element_types.clone(),
        };
        for name in schema.types.keys() {
            let mut visited = Set::new();
            let flat = flatten(schema, name, &mut visited);
            seq.flat.insert(name.to_string(), flat);
        }
        seq
    }

    /// Process-wide sequencer over the bundled core schema; built once.
    pub fn core() -> &'static Sequencer {
        static CORE: OnceLock<Sequencer> = OnceLock::new();
        CORE.get_or_init(|| Sequencer::new(Schema::core()))
    }

    fn flat_of(&self, tag: &str) -> Option<&Flat> {
        if let Some(t) = self.element_types.get(tag) {
            return self.flat.get(t);
        }
        self.flat.get(tag)
    }

    /// Stable bucket sort of `children` into the schema order declared for
    /// `tag`. Unknown tags sort past the end, keeping their relative
    /// insertion order.
    pub fn order_children(&self, tag: &str, children: Vec<Elem>) -> Vec<Elem> {
        let flat = match self.flat_of(tag) {
            Some(f) => f,
            None => {
                trace!("No schema order for <{}>, keeping insertion order", tag);
                return children;
            }
        };
        let rank = |c: &Elem| {
            flat.order
                .iter()
                .position(|t| *t == c.tag)
                .unwrap_or(flat.order.len())
        };
        let mut keyed: Vec<(usize, Elem)> = children.into_iter().map(|c| (rank(&c), c)).collect();
        keyed.sort_by_key(|(r, _)| *r);
        keyed.into_iter().map(|(_, c)| c).collect()
    }

    /// Recursively order an element's children, bottom-up.
    pub fn order_tree(&self, mut elem: Elem) -> Elem {
        let children = std::mem::take(&mut elem.children);
        let children = children
            .into_iter()
            .map(|c| self.order_tree(c))
            .collect();
        elem.children = self.order_children(&elem.tag, children);
        elem
    }

    pub fn is_required(&self, tag: &str, attr: &str) -> bool {
        self.flat_of(tag)
            .map(|f| f.attrs.iter().any(|a| a.name == attr && a.required))
            .unwrap_or(false)
    }

    pub fn has_id(&self, tag: &str) -> bool {
        self.flat_of(tag).map(|f| f.has_id).unwrap_or(false)
    }

    /// Declaration rank of an attribute in the flattened attribute list;
    /// used to break name-mapping ties on export.
    pub fn attr_rank(&self, tag: &str, attr: &str) -> Option<usize> {
        self.flat_of(tag)?
            .attrs
            .iter()
            .position(|a| a.name == attr)
    }

    pub fn knows(&self, tag: &str) -> bool {
        self.flat_of(tag).is_some()
    }
}

fn flatten(schema: &Schema, name: &str, visited: &mut Set<String>) -> Flat {
    // Cycle safety: a type reached twice contributes nothing the second time.
    if !visited.insert(name.to_string()) {
        return Flat::default();
    }
    let ty = match schema.types.get(name) {
        Some(t) => t,
        None => return Flat::default(),
    };
    let mut flat = Flat::default();
    if let Some(base) = &ty.base {
        let b = flatten(schema, base, visited);
        flat.attrs.extend(b.attrs);
        flat.order.extend(b.order);
    }
    flat.attrs.extend(ty.attrs.iter().cloned());
    for item in &ty.sequence {
        match item {
            SeqItem::Element(e) => flat.order.push(e.to_string()),
            SeqItem::Group(g) => {
                if let Some(items) = schema.groups.get(g) {
                    for it in items {
                        match it {
                            SeqItem::Element(e) => flat.order.push(e.to_string()),
                            SeqItem::Group(h) => {
                                trace!("Nested group {} in {} ignored", h, g)
                            }
                        }
                    }
                } else {
                    trace!("Unresolved group {} in {}", g, name);
                }
            }
        }
    }
    flat.has_id = flat.attrs.iter().any(|a| a.name == "id");
    flat
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::Schema;

    fn toy() -> Sequencer {
        let xsd = r#"<?xml version="1.0"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:complexType name="Holder">
    <xs:sequence>
      <xs:element name="A" type="xs:string"/>
      <xs:element name="B" type="xs:string"/>
      <xs:element name="C" type="xs:string"/>
    </xs:sequence>
    <xs:attribute name="id" type="xs:string" use="required"/>
    <xs:attribute name="flavour" type="xs:string"/>
  </xs:complexType>
  <xs:element name="holder" type="Holder"/>
</xs:schema>"#;
        Sequencer::new(&Schema::parse(xsd).unwrap())
    }

    #[test]
    fn orders_bag_by_declaration() {
        let seq = toy();
        let bag = vec![
            Elem::new("C").with_attr("n", "c"),
            Elem::new("A").with_attr("n", "a1"),
            Elem::new("A").with_attr("n", "a2"),
        ];
        let out = seq.order_children("holder", bag);
        let tags: Vec<_> = out.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, vec!["A", "A", "C"]);
        assert_eq!(out[0].attr("n"), Some("a1"));
        assert_eq!(out[1].attr("n"), Some("a2"));
    }

    #[test]
    fn unknown_tags_sort_last() {
        let seq = toy();
        let bag = vec![
            Elem::new("Z"),
            Elem::new("C"),
            Elem::new("Y"),
            Elem::new("A"),
        ];
        let out = seq.order_children("holder", bag);
        let tags: Vec<_> = out.iter().map(|e| e.tag.as_str()).collect();
        // Z and Y keep their relative insertion order past the end
        assert_eq!(tags, vec!["A", "C", "Z", "Y"]);
    }

    #[test]
    fn required_and_id() {
        let seq = toy();
        assert!(seq.is_required("holder", "id"));
        assert!(!seq.is_required("holder", "flavour"));
        assert!(seq.has_id("holder"));
        assert_eq!(seq.attr_rank("holder", "flavour"), Some(1));
    }

    #[test]
    fn core_flattening_inherits_base() {
        let seq = Sequencer::core();
        // Cell extends Standalone extends Base: id comes from Base, the
        // metadata group's notes slot precedes the subtype's own children.
        assert!(seq.is_required("cell", "id"));
        let bag = vec![
            Elem::new("biophysicalProperties"),
            Elem::new("morphology"),
            Elem::new("notes"),
        ];
        let out = seq.order_children("cell", bag);
        let tags: Vec<_> = out.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, vec!["notes", "morphology", "biophysicalProperties"]);
    }
}
