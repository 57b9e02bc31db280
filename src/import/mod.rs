use std::path::PathBuf;

use roxmltree::{Document, Node};
use tracing::{info, trace};

use crate::{
    catalog::Catalog,
    error::{import_error, Result},
    expr::Quantity,
    part::{MultiClause, Part, Value},
    report::Report,
    xml::{elements, req_attr},
    Map, Set,
};

pub mod cell;
pub mod dynamics;
pub mod network;

/// What happens to a shared definition once all its references are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    MergeOnce,
    MergeEverywhere,
    Promote,
    Retain,
}

/// Book-keeping for one referenced sub-part: created when the first
/// reference is seen, mutated as more turn up, consumed by resolution.
#[derive(Debug, Default, Clone)]
pub struct DependencyRecord {
    pub count: usize,
    pub endpoint: bool,
    pub component_type: bool,
    /// paths of referrers, root part id first
    pub referrers: Vec<Vec<String>>,
}

/// Result of one import job.
#[derive(Debug)]
pub struct Import {
    pub parts: Map<String, Part>,
    pub dispositions: Map<String, Disposition>,
    pub report: Report,
}

pub struct ImportJob {
    catalog: &'static Catalog,
    pub parts: Map<String, Part>,
    deps: Map<String, DependencyRecord>,
    resolved: Map<String, Disposition>,
    pub report: Report,
}

/// Import a document set into the internal part tree. Only failing to read
/// or parse the first (root) document is fatal; everything else degrades
/// into report entries.
pub fn import_files(paths: &[String]) -> Result<Import> {
    let mut job = ImportJob::new();
    let mut todo: Vec<PathBuf> = Vec::new();
    for p in paths.iter().rev() {
        todo.push(PathBuf::from(p));
    }
    let mut seen: Set<PathBuf> = Set::new();
    let mut first = true;
    while let Some(path) = todo.pop() {
        let path = match path.canonicalize() {
            Ok(p) => p,
            Err(e) if first => return Err(e.into()),
            Err(e) => {
                job.report
                    .error(format!("Cannot resolve include {:?}: {}", path, e));
                continue;
            }
        };
        if !seen.insert(path.clone()) {
            continue;
        }
        trace!("Reading document {:?}", path);
        let xml = match std::fs::read_to_string(&path) {
            Ok(x) => x,
            Err(e) if first => return Err(e.into()),
            Err(e) => {
                job.report
                    .error(format!("Cannot read include {:?}: {}", path, e));
                continue;
            }
        };
        match job.document(&xml, Some(&path), &mut todo) {
            Ok(()) => {}
            Err(e) if first => return Err(e),
            Err(e) => job.report.capture(&format!("Include {:?}", path), e),
        }
        first = false;
    }
    Ok(job.finish())
}

/// Import a single in-memory document; includes are not followed.
pub fn import_str(xml: &str) -> Result<Import> {
    let mut job = ImportJob::new();
    job.document(xml, None, &mut Vec::new())?;
    Ok(job.finish())
}

impl ImportJob {
    pub fn new() -> Self {
        ImportJob {
            catalog: Catalog::core(),
            parts: Map::new(),
            deps: Map::new(),
            resolved: Map::new(),
            report: Report::new(),
        }
    }

    fn finish(mut self) -> Import {
        self.resolve();
        self.refuse();
        // Records are consumed; what remains is the disposition table.
        self.deps.clear();
        Import {
            parts: self.parts,
            dispositions: self.resolved,
            report: self.report,
        }
    }

    fn document(&mut self, xml: &str, path: Option<&PathBuf>, todo: &mut Vec<PathBuf>) -> Result<()> {
        let doc = Document::parse(xml)?;
        let root = doc.root_element();
        let tag = root.tag_name().name();
        if tag != "neuroml" && tag != "Lems" {
            return Err(import_error(format!("Not an interchange document: <{}>", tag)));
        }
        // Structural containers referenced by id later in this document.
        let mut morphologies: Map<String, Node> = Map::new();
        let mut biophysics: Map<String, Node> = Map::new();
        for node in elements(&root) {
            match node.tag_name().name() {
                "morphology" => {
                    if let Some(id) = node.attribute("id") {
                        morphologies.insert(id.to_string(), node);
                    }
                }
                "biophysicalProperties" => {
                    if let Some(id) = node.attribute("id") {
                        biophysics.insert(id.to_string(), node);
                    }
                }
                _ => {}
            }
        }
        for node in elements(&root) {
            let tag = node.tag_name().name();
            let outcome = match tag {
                "include" | "Include" => {
                    let href = node.attribute("href").or_else(|| node.attribute("file"));
                    match (href, path) {
                        (Some(h), Some(p)) => {
                            let mut inc = p.parent().map(|d| d.to_path_buf()).unwrap_or_default();
                            inc.push(h);
                            todo.push(inc);
                        }
                        (Some(h), None) => {
                            self.report
                                .warn(format!("Include {} ignored for in-memory document", h))
                        }
                        (None, _) => self.report.warn("Include without href".to_string()),
                    }
                    Ok(())
                }
                "morphology" | "biophysicalProperties" | "notes" | "property" | "annotation" => {
                    Ok(())
                }
                "cell" => cell::import_cell(self, &node, &morphologies, &biophysics),
                "network" => network::import_network(self, &node),
                "ComponentType" => dynamics::import_component_type(self, &node),
                "Simulation" => self.import_simulation(&node),
                "Target" | "Dimension" | "Unit" | "Component" => Ok(()),
                t => {
                    if self.catalog.part_type_for_tag(t).is_some() {
                        self.import_leaf(&node).map(|_| ())
                    } else {
                        self.report.warn(format!("Skipping unknown element <{}>", t));
                        Ok(())
                    }
                }
            };
            if let Err(e) = outcome {
                self.report.capture(&format!("<{}>", tag), e);
            }
        }
        Ok(())
    }

    /// Translate a leaf element (channel, synapse, source, ...) into a Part
    /// with attribute-level name mapping, children included.
    pub fn import_leaf(&mut self, node: &Node) -> Result<Part> {
        let tag = node.tag_name().name();
        let part_type = self
            .catalog
            .part_type_for_tag(tag)
            .ok_or_else(|| import_error(format!("No part type for <{}>", tag)))?
            .to_string();
        let id = node
            .attribute("id")
            .map(|s| s.to_string())
            .unwrap_or_else(|| tag.to_string());
        let mut part = Part::new(&id);
        part.set_meta(&["xml", "tag"], tag);
        part.set_meta(&["xml", "role"], &role_of(&part_type));
        part.set_meta(&["xml", "id"], &id);
        part.inherits.push(part_type.to_string());
        for attr in node.attributes() {
            let key = attr.name();
            if key == "id" || key == "neuroLexId" || key == "metaid" {
                continue;
            }
            let internal = self.catalog.import_name(&part_type, key);
            part.set_variable(
                &internal,
                MultiClause::constant(Value::parse_attribute(attr.value())),
            );
        }
        for child in elements(node) {
            let ctag = child.tag_name().name();
            match ctag {
                "notes" => {
                    if let Some(t) = child.text() {
                        part.set_meta(&["notes"], t.trim());
                    }
                }
                "property" | "annotation" => {}
                _ if self.catalog.part_type_for_tag(ctag).is_some() => {
                    let sub = self.import_leaf(&child)?;
                    part.children.insert(sub.id.to_string(), sub);
                }
                t => {
                    self.report
                        .warn(format!("Skipping <{}> inside <{}> {}", t, tag, id));
                }
            }
        }
        if self.is_toplevel(node) {
            self.parts.insert(part.id.to_string(), part.clone());
        }
        Ok(part)
    }

    fn is_toplevel(&self, node: &Node) -> bool {
        node.parent_element()
            .map(|p| {
                let t = p.tag_name().name();
                t == "neuroml" || t == "Lems"
            })
            .unwrap_or(false)
    }

    fn import_simulation(&mut self, node: &Node) -> Result<()> {
        let id = req_attr(node, "id")?;
        let mut part = Part::new(&id);
        part.set_meta(&["xml", "tag"], "Simulation");
        part.set_meta(&["xml", "role"], "simulation");
        for (attr, var) in [("length", "duration"), ("step", "dt"), ("target", "target")] {
            match node.attribute(attr) {
                Some(v) => {
                    part.set_variable(var, MultiClause::constant(Value::parse_attribute(v)))
                }
                None => self
                    .report
                    .warn(format!("Simulation {} lacks {}", id, attr)),
            }
        }
        if let Some(t) = node.attribute("target") {
            self.note_reference(t, &[id.to_string()], false);
        }
        for child in elements(node) {
            if child.tag_name().name() != "OutputFile" {
                continue;
            }
            let oid = req_attr(&child, "id")?;
            let mut out = Part::new(&oid);
            out.set_meta(&["xml", "role"], "output");
            if let Some(f) = child.attribute("fileName") {
                out.set_variable("file", MultiClause::text(f));
            }
            for col in elements(&child) {
                if col.tag_name().name() == "OutputColumn" {
                    let cid = req_attr(&col, "id")?;
                    let q = col.attribute("quantity").unwrap_or_default();
                    out.set_meta(&["columns", &cid], q);
                }
            }
            part.children.insert(oid, out);
        }
        info!("Imported simulation {}", part.id);
        self.parts.insert(part.id.to_string(), part);
        Ok(())
    }

    /// Record a reference to a (possibly not yet seen) shared definition.
    pub fn note_reference(&mut self, name: &str, referrer: &[String], endpoint: bool) {
        let rec = self.deps.entry(name.to_string()).or_default();
        rec.count += 1;
        rec.endpoint |= endpoint;
        rec.referrers.push(referrer.to_vec());
    }

    pub fn note_component_type_use(&mut self, name: &str) {
        let rec = self.deps.entry(name.to_string()).or_default();
        rec.component_type = true;
    }

    /// Fixed point over outstanding references: resolve each definition's
    /// own references before the definition itself so merges never happen
    /// out of order.
    fn resolve(&mut self) {
        let names: Vec<String> = self.deps.keys().cloned().collect();
        for name in names {
            self.resolve_one(&name, &mut Vec::new());
        }
    }

    fn resolve_one(&mut self, name: &str, stack: &mut Vec<String>) {
        if self.resolved.contains_key(name) || stack.iter().any(|s| s == name) {
            return;
        }
        stack.push(name.to_string());
        let inner: Vec<String> = self
            .parts
            .get(name)
            .map(references_of)
            .unwrap_or_default()
            .into_iter()
            .filter(|r| self.deps.contains_key(r) && r != name)
            .collect();
        for r in inner {
            self.resolve_one(&r, stack);
        }
        stack.pop();

        let rec = match self.deps.get(name) {
            Some(r) => r.clone(),
            None => return,
        };
        let def = match self.parts.get(name) {
            Some(d) => d.clone(),
            None => {
                // Connection endpoints usually name a nested part (a
                // population inside its network); those are retained where
                // they already live.
                if find_nested(&self.parts, name) {
                    trace!("Reference to nested part {}, retained in place", name);
                } else {
                    self.report
                        .warn(format!("Reference to missing definition {}", name));
                }
                self.resolved
                    .insert(name.to_string(), Disposition::Retain);
                return;
            }
        };
        let heavy = !def.children.is_empty();
        let disposition = if rec.endpoint && rec.count > 1 {
            Disposition::Retain
        } else if rec.component_type || (rec.count > 1 && heavy) {
            Disposition::Promote
        } else if rec.count > 1 {
            Disposition::MergeEverywhere
        } else if rec.count == 1 && !rec.endpoint {
            Disposition::MergeOnce
        } else {
            Disposition::Retain
        };
        trace!("Resolving {} as {:?}", name, disposition);
        match disposition {
            Disposition::MergeOnce | Disposition::MergeEverywhere => {
                let mut merged_all = true;
                for path in &rec.referrers {
                    match part_at_mut(&mut self.parts, path) {
                        Some(p) => {
                            p.merge_from(&def);
                            p.inherits.retain(|s| s != name);
                            drop_dangling_refs(p, name);
                        }
                        None => {
                            merged_all = false;
                            self.report.warn(format!(
                                "Referrer {:?} of {} vanished before merge",
                                path, name
                            ));
                        }
                    }
                }
                // The shared definition is deleted only after every
                // referrer got its copy.
                if merged_all {
                    self.parts.remove(name);
                }
            }
            Disposition::Promote => {
                if let Some(p) = self.parts.get_mut(name) {
                    p.set_meta(&["xml", "promoted"], "true");
                }
            }
            Disposition::Retain => {}
        }
        self.resolved.insert(name.to_string(), disposition);
    }

    /// Reconcile parts retained despite never being the ultimate target of
    /// a connection: a single consumer re-fuses the definition after all.
    fn refuse(&mut self) {
        let names: Vec<String> = self
            .resolved
            .iter()
            .filter(|(_, d)| **d == Disposition::Retain)
            .map(|(n, _)| n.to_string())
            .collect();
        for name in names {
            let rec = match self.deps.get(&name) {
                Some(r) => r.clone(),
                None => continue,
            };
            if rec.count != 1 || !rec.endpoint {
                continue;
            }
            let def = match self.parts.get(&name) {
                Some(d) => d.clone(),
                None => continue,
            };
            // Only lightweight roles re-fuse; a cell or network retained as
            // an endpoint stays a separately addressable model.
            match def.xml_role() {
                Some("cell") | Some("network") | Some("population") | Some("simulation")
                | Some("componentType") => continue,
                _ => {}
            }
            if let Some(p) = part_at_mut(&mut self.parts, &rec.referrers[0]) {
                info!("Re-fusing single-consumer endpoint {}", name);
                p.merge_from(&def);
                p.inherits.retain(|s| s != &name);
                drop_dangling_refs(p, &name);
                self.parts.remove(&name);
                self.resolved.insert(name, Disposition::MergeOnce);
            }
        }
    }
}

impl Default for ImportJob {
    fn default() -> Self {
        Self::new()
    }
}

/// Names referenced from anywhere inside a part's subtree.
fn references_of(part: &Part) -> Vec<String> {
    let mut out = Vec::new();
    collect_references(part, &mut out);
    out
}

fn collect_references(part: &Part, out: &mut Vec<String>) {
    for sup in &part.inherits {
        if !out.contains(sup) {
            out.push(sup.to_string());
        }
    }
    for name in ["A", "B", "via", "source", "target", "of"] {
        if let Some(mc) = part.variables.get(name) {
            if let Some(Value::Text(t)) = mc.default_value() {
                let t = t.split('/').next().unwrap_or(t).to_string();
                if !out.contains(&t) {
                    out.push(t);
                }
            }
        }
    }
    for child in part.children.values() {
        collect_references(child, out);
    }
}

/// After a merge the referrer's pointer variables to the deleted
/// definition would dangle; drop them.
fn drop_dangling_refs(part: &mut Part, name: &str) {
    let keys: Vec<String> = part
        .variables
        .iter()
        .filter(|(k, mc)| {
            ["via", "source", "of"].contains(&k.as_str())
                && matches!(mc.default_value(), Some(Value::Text(t)) if t == name)
        })
        .map(|(k, _)| k.to_string())
        .collect();
    for k in keys {
        part.variables.remove(&k);
    }
}

/// Does any top-level part hold a nested child with this id?
fn find_nested(parts: &Map<String, Part>, name: &str) -> bool {
    fn walk(part: &Part, name: &str) -> bool {
        part.children
            .values()
            .any(|c| c.id == name || walk(c, name))
    }
    parts.values().any(|p| walk(p, name))
}

/// Navigate to a nested part along a path of ids rooted in the top-level
/// table.
fn part_at_mut<'a>(parts: &'a mut Map<String, Part>, path: &[String]) -> Option<&'a mut Part> {
    let (head, rest) = path.split_first()?;
    let mut cur = parts.get_mut(head)?;
    for key in rest {
        cur = cur.children.get_mut(key)?;
    }
    Some(cur)
}

fn role_of(part_type: &str) -> String {
    match part_type {
        "Cell" => "cell",
        "Compartment" => "segment",
        "Channel" => "channel",
        "Synapse" => "synapse",
        "GapJunction" => "coupling",
        "PulseSource" | "SpikeSource" | "Input" => "input",
        "Network" => "network",
        "Population" => "population",
        "Projection" => "projection",
        "Simulation" => "simulation",
        _ => "component",
    }
    .to_string()
}

/// Quantities are normalised on entry so later passes never see raw text.
pub fn parse_quantity(input: &str, report: &mut Report) -> Quantity {
    match Quantity::parse(input) {
        Ok(q) => q,
        Err(_) => {
            report.warn(format!("Unparseable quantity {:?}, defaulting to 0", input));
            Quantity::number(0.0)
        }
    }
}
