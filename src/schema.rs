use std::sync::OnceLock;

use roxmltree::{Document, Node};
use tracing::trace;

use crate::{
    error::{schema_error, Result},
    Map,
};

/// One attribute slot of a schema type, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub name: String,
    pub required: bool,
}

/// One slot of a type's ordered child sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqItem {
    Element(String),
    Group(String),
}

/// A digested complex type: attribute list, child order, base link. Bases
/// and groups are still symbolic here; the sequencer flattens them.
#[derive(Debug, Clone, Default)]
pub struct SchemaType {
    pub name: String,
    pub base: Option<String>,
    pub attrs: Vec<Attr>,
    pub sequence: Vec<SeqItem>,
}

/// Ordering/required/tag tables pulled out of an XSD-like schema. Only the
/// structure needed by the sequencer and the catalog survives digestion;
/// facets, restrictions and documentation are dropped.
#[derive(Debug, Default)]
pub struct Schema {
    pub types: Map<String, SchemaType>,
    pub groups: Map<String, Vec<SeqItem>>,
    /// element tag -> type name; first declaration wins
    pub element_types: Map<String, String>,
}

impl Schema {
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml)?;
        let root = doc.root_element();
        if root.tag_name().name() != "schema" {
            return Err(schema_error(format!(
                "Not a schema document: <{}>",
                root.tag_name().name()
            )));
        }
        let mut schema = Schema::default();
        for node in root.children().filter(|n| n.is_element()) {
            match node.tag_name().name() {
                "complexType" => schema.complex_type(&node)?,
                "group" => schema.group_def(&node)?,
                "element" => {
                    if let (Some(n), Some(t)) = (node.attribute("name"), node.attribute("type")) {
                        schema
                            .element_types
                            .entry(n.to_string())
                            .or_insert_with(|| t.to_string());
                    }
                }
                "simpleType" | "annotation" | "import" => {}
                t => trace!("Ignoring <{}> at schema top level", t),
            }
        }
        Ok(schema)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let xml = std::fs::read_to_string(path)?;
        Self::parse(&xml)
    }

    /// The bundled core of the interchange schemas.
    pub fn core() -> &'static Schema {
        static CORE: OnceLock<Schema> = OnceLock::new();
        CORE.get_or_init(|| {
            Schema::parse(include_str!("../data/core.xsd"))
                .expect("bundled schema must digest")
        })
    }

    fn complex_type(&mut self, node: &Node) -> Result<()> {
        let name = node
            .attribute("name")
            .ok_or_else(|| schema_error("Unnamed complex type"))?
            .to_string();
        let mut ty = SchemaType {
            name: name.clone(),
            ..Default::default()
        };
        self.type_body(node, &mut ty)?;
        self.types.insert(name, ty);
        Ok(())
    }

    fn type_body(&mut self, node: &Node, ty: &mut SchemaType) -> Result<()> {
        for child in node.children().filter(|n| n.is_element()) {
            match child.tag_name().name() {
                "sequence" | "choice" | "all" => self.sequence(&child, &mut ty.sequence)?,
                "attribute" => ty.attrs.push(attribute(&child)?),
                "anyAttribute" | "annotation" => {}
                "complexContent" => {
                    for ext in child.children().filter(|n| n.is_element()) {
                        if ext.tag_name().name() == "extension" {
                            ty.base = Some(
                                ext.attribute("base")
                                    .ok_or_else(|| {
                                        schema_error(format!("Extension without base in {}", ty.name))
                                    })?
                                    .to_string(),
                            );
                            self.type_body(&ext, ty)?;
                        }
                    }
                }
                t => trace!("Ignoring <{}> in type {}", t, ty.name),
            }
        }
        Ok(())
    }

    fn sequence(&mut self, node: &Node, out: &mut Vec<SeqItem>) -> Result<()> {
        for child in node.children().filter(|n| n.is_element()) {
            match child.tag_name().name() {
                "element" => {
                    let name = child
                        .attribute("name")
                        .ok_or_else(|| schema_error("Element without name in sequence"))?;
                    out.push(SeqItem::Element(name.to_string()));
                    if let Some(t) = child.attribute("type") {
                        self.element_types
                            .entry(name.to_string())
                            .or_insert_with(|| t.to_string());
                    }
                }
                "group" => {
                    let name = child
                        .attribute("ref")
                        .ok_or_else(|| schema_error("Group reference without ref"))?;
                    out.push(SeqItem::Group(name.to_string()));
                }
                "sequence" | "choice" | "all" => self.sequence(&child, out)?,
                "any" | "annotation" => {}
                t => {
                    return Err(schema_error(format!("Unexpected <{}> in sequence", t)));
                }
            }
        }
        Ok(())
    }

    fn group_def(&mut self, node: &Node) -> Result<()> {
        let name = node
            .attribute("name")
            .ok_or_else(|| schema_error("Unnamed group definition"))?
            .to_string();
        let mut items = Vec::new();
        for child in node.children().filter(|n| n.is_element()) {
            match child.tag_name().name() {
                "sequence" | "choice" | "all" => self.sequence(&child, &mut items)?,
                "annotation" => {}
                t => {
                    return Err(schema_error(format!("Unexpected <{}> in group {}", t, name)));
                }
            }
        }
        self.groups.insert(name, items);
        Ok(())
    }

}

fn attribute(node: &Node) -> Result<Attr> {
    let name = node
        .attribute("name")
        .ok_or_else(|| schema_error("Attribute without name"))?
        .to_string();
    let required = node.attribute("use") == Some("required");
    Ok(Attr { name, required })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digest_core() {
        let s = Schema::core();
        let cell = s.types.get("Cell").unwrap();
        assert_eq!(cell.base.as_deref(), Some("Standalone"));
        let seg = s.types.get("Segment").unwrap();
        assert_eq!(
            seg.sequence,
            vec![
                SeqItem::Element("parent".to_string()),
                SeqItem::Element("proximal".to_string()),
                SeqItem::Element("distal".to_string()),
            ]
        );
        assert!(seg.attrs.iter().any(|a| a.name == "id" && a.required));
        assert_eq!(
            s.element_types.get("segment").map(|s| s.as_str()),
            Some("Segment")
        );
    }

    #[test]
    fn group_and_extension() {
        let s = Schema::core();
        assert!(s.groups.contains_key("metadata"));
        let st = s.types.get("Standalone").unwrap();
        assert!(st.sequence.contains(&SeqItem::Group("metadata".to_string())));
        // Extension carries the base's attributes only after flattening;
        // here the base link must survive digestion.
        assert_eq!(st.base.as_deref(), Some("Base"));
    }
}
