use serde::{Deserialize, Serialize};

use crate::{
    error::{model_error, Result},
    expr::{Boolean, Expr, Quantity},
    Map,
};

/// Generic key-ordered tree node. The legacy store kept everything in one
/// untyped associative document; here the shape is a closed variant so merge
/// and traversal are exhaustive matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf(String),
    Tree(Map<String, Node>),
    Part(Box<Part>),
}

impl Node {
    pub fn tree() -> Self {
        Node::Tree(Map::new())
    }

    pub fn get(&self, path: &[&str]) -> Option<&Node> {
        let mut cur = self;
        for k in path {
            match cur {
                Node::Tree(m) => cur = m.get(*k)?,
                _ => return None,
            }
        }
        Some(cur)
    }

    pub fn get_str(&self, path: &[&str]) -> Option<&str> {
        if let Some(Node::Leaf(s)) = self.get(path) {
            Some(s)
        } else {
            None
        }
    }

    /// Set a leaf value, creating intermediate trees along the path.
    pub fn set(&mut self, path: &[&str], value: &str) {
        let mut cur = self;
        for k in path {
            if !matches!(cur, Node::Tree(_)) {
                *cur = Node::tree();
            }
            cur = match cur {
                Node::Tree(m) => m.entry(k.to_string()).or_insert_with(Node::tree),
                _ => unreachable!(),
            };
        }
        *cur = Node::Leaf(value.to_string());
    }

    /// Deep merge: `other`'s leaves shadow ours, trees merge recursively.
    pub fn merge(&mut self, other: &Node) {
        match (self, other) {
            (Node::Tree(a), Node::Tree(b)) => {
                for (k, v) in b {
                    match a.get_mut(k) {
                        Some(x) => x.merge(v),
                        None => {
                            a.insert(k.to_string(), v.clone());
                        }
                    }
                }
            }
            (a, b) => *a = b.clone(),
        }
    }

    /// Deep merge that only fills gaps; existing leaves stay untouched.
    pub fn merge_missing(&mut self, other: &Node) {
        match (self, other) {
            (Node::Tree(a), Node::Tree(b)) => {
                for (k, v) in b {
                    match a.get_mut(k) {
                        Some(x) => x.merge_missing(v),
                        None => {
                            a.insert(k.to_string(), v.clone());
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

/// Clause reduction when several clauses fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Combine {
    Replace,
    Add,
    Multiply,
}

/// Values bound by a clause: a plain quantity, a full expression, or an
/// opaque string (species names, file names and the like).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Quantity(Quantity),
    Expr(Expr),
    Text(String),
}

impl Value {
    /// Equation-context parse: quantities, then full expressions, then raw
    /// text.
    pub fn parse(input: &str) -> Self {
        if let Ok(q) = Quantity::parse(input) {
            Value::Quantity(q)
        } else if let Ok(e) = Expr::parse(input) {
            Value::Expr(e)
        } else {
            Value::Text(input.to_string())
        }
    }

    /// Attribute-context parse: attribute values are quantities or opaque
    /// strings, never expressions. A bare identifier is a name here.
    pub fn parse_attribute(input: &str) -> Self {
        if let Ok(q) = Quantity::parse(input) {
            Value::Quantity(q)
        } else {
            Value::Text(input.to_string())
        }
    }

    pub fn print_to_string(&self) -> String {
        match self {
            Value::Quantity(q) => q.to_string(),
            Value::Expr(e) => e.print_to_string(),
            Value::Text(s) => s.to_string(),
        }
    }

    pub fn as_quantity(&self) -> Option<&Quantity> {
        if let Value::Quantity(q) = self {
            Some(q)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub condition: Option<Boolean>,
    pub value: Value,
}

/// Ordered clauses plus a combiner. At most one clause may be the default
/// (empty condition). An empty clause list revokes an inherited variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiClause {
    pub clauses: Vec<Clause>,
    pub combine: Combine,
}

impl MultiClause {
    pub fn constant(value: Value) -> Self {
        MultiClause {
            clauses: vec![Clause {
                condition: None,
                value,
            }],
            combine: Combine::Replace,
        }
    }

    pub fn quantity(q: Quantity) -> Self {
        Self::constant(Value::Quantity(q))
    }

    pub fn text(s: &str) -> Self {
        Self::constant(Value::Text(s.to_string()))
    }

    pub fn revoked() -> Self {
        MultiClause {
            clauses: Vec::new(),
            combine: Combine::Replace,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The single unconditional value, if this is a plain constant.
    pub fn default_value(&self) -> Option<&Value> {
        match &self.clauses[..] {
            [Clause {
                condition: None,
                value,
            }] => Some(value),
            _ => None,
        }
    }

    pub fn check(&self) -> Result<()> {
        let defaults = self
            .clauses
            .iter()
            .filter(|c| c.condition.is_none())
            .count();
        if defaults > 1 {
            return Err(model_error("More than one default clause"));
        }
        Ok(())
    }
}

/// A node in the internal model tree. `inherits` names other parts; the
/// legacy format renders it as a comma-joined string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub inherits: Vec<String>,
    pub variables: Map<String, MultiClause>,
    pub children: Map<String, Part>,
    pub metadata: Node,
}

impl Part {
    pub fn new(id: &str) -> Self {
        Part {
            id: id.to_string(),
            inherits: Vec::new(),
            variables: Map::new(),
            children: Map::new(),
            metadata: Node::tree(),
        }
    }

    pub fn with_inherits(id: &str, inherits: &[&str]) -> Self {
        let mut p = Part::new(id);
        p.inherits = inherits.iter().map(|s| s.to_string()).collect();
        p
    }

    pub fn inherits_string(&self) -> String {
        self.inherits.join(",")
    }

    pub fn parse_inherits(s: &str) -> Vec<String> {
        s.split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect()
    }

    pub fn set_variable(&mut self, name: &str, mc: MultiClause) {
        self.variables.insert(name.to_string(), mc);
    }

    pub fn variable(&self, name: &str) -> Option<&MultiClause> {
        self.variables.get(name)
    }

    /// Constant quantity bound to `name`, if any.
    pub fn quantity(&self, name: &str) -> Option<&Quantity> {
        self.variables
            .get(name)?
            .default_value()?
            .as_quantity()
    }

    pub fn meta(&self, path: &[&str]) -> Option<&str> {
        self.metadata.get_str(path)
    }

    pub fn set_meta(&mut self, path: &[&str], value: &str) {
        self.metadata.set(path, value);
    }

    /// Destination element name recorded by a previous translation.
    pub fn xml_tag(&self) -> Option<&str> {
        self.meta(&["xml", "tag"])
    }

    /// Schema role: "cell", "segment", "network", "synapse", ...
    pub fn xml_role(&self) -> Option<&str> {
        self.meta(&["xml", "role"])
    }

    pub fn original_id(&self) -> Option<&str> {
        self.meta(&["xml", "id"])
    }

    /// Splice `other`'s declarations under this part without overriding
    /// anything declared locally. Used when a shared definition is merged
    /// into its referrer.
    pub fn merge_from(&mut self, other: &Part) {
        for (k, v) in &other.variables {
            self.variables
                .entry(k.to_string())
                .or_insert_with(|| v.clone());
        }
        for (k, v) in &other.children {
            self.children
                .entry(k.to_string())
                .or_insert_with(|| v.clone());
        }
        self.metadata.merge_missing(&other.metadata);
        for sup in &other.inherits {
            if !self.inherits.contains(sup) {
                self.inherits.push(sup.to_string());
            }
        }
    }

    /// Effective definition: deep merge, in inheritance order, of our own
    /// declarations over our ancestors'. Ancestor fields are shadowed, not
    /// deleted, unless revoked by an empty clause list.
    pub fn flatten(&self, lookup: &dyn Fn(&str) -> Option<Part>) -> Result<Part> {
        let mut result = Part::new(&self.id);
        for sup in &self.inherits {
            let base = lookup(sup)
                .ok_or_else(|| model_error(format!("Unknown ancestor {} of {}", sup, self.id)))?;
            let base = base.flatten(lookup)?;
            for (k, v) in base.variables {
                result.variables.insert(k, v);
            }
            for (k, v) in base.children {
                result.children.insert(k, v);
            }
            result.metadata.merge(&base.metadata);
        }
        for (k, v) in &self.variables {
            if v.is_revoked() {
                result.variables.remove(k);
            } else {
                result.variables.insert(k.to_string(), v.clone());
            }
        }
        for (k, v) in &self.children {
            result.children.insert(k.to_string(), v.clone());
        }
        result.metadata.merge(&self.metadata);
        Ok(result)
    }

    /// Value-deep equality over a normalized snapshot with connection
    /// bindings stripped; used for structural dedup on export.
    pub fn base_snapshot(&self) -> Part {
        let mut base = self.clone();
        base.id = String::new();
        for k in ["A", "B", "weight", "delay", "condition", "population"] {
            base.variables.remove(k);
        }
        if let Node::Tree(ref mut m) = base.metadata {
            m.remove("xml");
        }
        base.children = base
            .children
            .iter()
            .map(|(k, v)| (k.clone(), v.base_snapshot()))
            .collect();
        base
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expr::Quantity;

    fn leak(p: Part) -> impl Fn(&str) -> Option<Part> {
        move |n: &str| {
            if n == p.id {
                Some(p.clone())
            } else {
                None
            }
        }
    }

    #[test]
    fn inheritance_shadows() {
        let mut base = Part::new("base");
        base.set_variable("a", MultiClause::quantity(Quantity::number(1.0)));
        base.set_variable("b", MultiClause::quantity(Quantity::number(2.0)));

        let mut sub = Part::with_inherits("sub", &["base"]);
        sub.set_variable("b", MultiClause::quantity(Quantity::number(3.0)));

        let flat = sub.flatten(&leak(base)).unwrap();
        assert_eq!(flat.quantity("a").unwrap().value, 1.0);
        assert_eq!(flat.quantity("b").unwrap().value, 3.0);
    }

    #[test]
    fn inheritance_revokes() {
        let mut base = Part::new("base");
        base.set_variable("a", MultiClause::quantity(Quantity::number(1.0)));

        let mut sub = Part::with_inherits("sub", &["base"]);
        sub.set_variable("a", MultiClause::revoked());

        let flat = sub.flatten(&leak(base)).unwrap();
        assert!(flat.variable("a").is_none());
    }

    #[test]
    fn inherits_roundtrip() {
        let p = Part::with_inherits("p", &["x", "y"]);
        assert_eq!(p.inherits_string(), "x,y");
        assert_eq!(Part::parse_inherits("x, y"), vec!["x", "y"]);
    }

    #[test]
    fn metadata_paths() {
        let mut p = Part::new("p");
        p.set_meta(&["xml", "tag"], "cell");
        p.set_meta(&["xml", "role"], "cell");
        assert_eq!(p.xml_tag(), Some("cell"));
        assert_eq!(p.xml_role(), Some("cell"));
        assert_eq!(p.meta(&["xml", "missing"]), None);
    }

    #[test]
    fn base_snapshot_strips_bindings() {
        let mut a = Part::new("syn0");
        a.set_variable("gbase", MultiClause::quantity(Quantity::number(1.0)));
        a.set_variable("A", MultiClause::text("pre"));
        let mut b = Part::new("syn1");
        b.set_variable("gbase", MultiClause::quantity(Quantity::number(1.0)));
        b.set_variable("B", MultiClause::text("post"));
        assert_eq!(a.base_snapshot(), b.base_snapshot());
    }
}
