use std::fmt::Write as _;

use tracing::{info, trace};

use crate::{
    catalog::Catalog,
    element::Elem,
    error::{export_error, Result},
    expr::Quantity,
    part::{Part, Value},
    report::Report,
    sequencer::Sequencer,
    units::{negotiate, UsedUnits},
    Map,
};

pub mod cell;
pub mod dynamics;
pub mod network;

/// One output file of an export job.
#[derive(Debug, Clone, PartialEq)]
pub struct OutFile {
    pub name: String,
    pub content: String,
}

/// Result of one export job: the generated file set, the recorded job
/// metadata and the diagnostic report.
#[derive(Debug)]
pub struct Export {
    pub files: Vec<OutFile>,
    pub duration: Option<Quantity>,
    pub manifest: String,
    pub report: Report,
}

/// Walks a fully resolved part model (inheritance already flattened by the
/// equation subsystem) and re-derives the external element tree.
pub struct ExportJob<'m> {
    pub seq: &'static Sequencer,
    pub catalog: &'static Catalog,
    pub library: &'m Map<String, Part>,
    pub report: Report,
    pub units: UsedUnits,
    /// structural dedup: (tag, normalized snapshot) -> emitted id
    emitted: Vec<(String, Part, String)>,
    /// shared definitions emitted so far (channels, synapses, cells)
    pub defs: Vec<Elem>,
    /// generated declarative component types
    pub ctypes: Vec<Elem>,
}

/// Export one model part against a library of named shared models.
pub fn export_model(root: &Part, library: &Map<String, Part>) -> Result<Export> {
    let mut job = ExportJob::new(library);
    let main = match job.dispatch(root) {
        Ok(e) => e,
        Err(e) => {
            // A failed root still yields whatever shared definitions were
            // constructed along the way.
            job.report.capture(&format!("Export of {}", root.id), e);
            None
        }
    };
    Ok(job.assemble(root, main))
}

impl<'m> ExportJob<'m> {
    pub fn new(library: &'m Map<String, Part>) -> Self {
        ExportJob {
            seq: Sequencer::core(),
            catalog: Catalog::core(),
            library,
            report: Report::new(),
            units: UsedUnits::default(),
            emitted: Vec::new(),
            defs: Vec::new(),
            ctypes: Vec::new(),
        }
    }

    /// Classify the root part by its declared schema role and construct the
    /// matching element subtree.
    pub fn dispatch(&mut self, part: &Part) -> Result<Option<Elem>> {
        let role = part.xml_role().unwrap_or("component").to_string();
        trace!("Exporting {} as {}", part.id, role);
        let elem = match role.as_str() {
            "network" => Some(network::export_network(self, part)?),
            "cell" | "segment" => Some(cell::export_cell(self, part)?),
            "synapse" | "channel" | "input" | "coupling" => {
                Some(self.specialised_or_generic(part)?)
            }
            "simulation" => None, // folded into the file set at assembly
            _ => Some(dynamics::export_generic(self, part)?),
        };
        Ok(elem)
    }

    /// Parts with a recorded destination tag are laid out attribute-wise;
    /// anything else goes through the generic component path.
    fn specialised_or_generic(&mut self, part: &Part) -> Result<Elem> {
        dynamics::export_generic(self, part)
    }

    /// Render a quantity through unit negotiation, recording what was used.
    pub fn quantity(&mut self, q: &Quantity) -> String {
        let n = negotiate(q);
        self.units.record(&n);
        n.to_string()
    }

    pub fn value(&mut self, v: &Value) -> String {
        match v {
            Value::Quantity(q) => self.quantity(q),
            v => v.print_to_string(),
        }
    }

    /// Emit a shared definition once: structurally identical parts reuse
    /// the element produced for the first of them.
    pub fn emit_def(&mut self, part: &Part) -> Result<String> {
        let tag = self.tag_of(part);
        let snap = part.base_snapshot();
        if let Some((_, _, id)) = self
            .emitted
            .iter()
            .find(|(t, s, _)| *t == tag && *s == snap)
        {
            trace!("Deduplicated {} against {}", part.id, id);
            return Ok(id.to_string());
        }
        let elem = dynamics::export_generic(self, part)?;
        let id = elem.attr("id").unwrap_or(&part.id).to_string();
        self.defs.push(elem);
        self.emitted.push((tag, snap, id.clone()));
        Ok(id)
    }

    /// Preferred destination tag: recorded hint first, catalog second.
    pub fn tag_of(&self, part: &Part) -> String {
        if let Some(t) = part.xml_tag() {
            return t.to_string();
        }
        for sup in &part.inherits {
            if let Some(t) = self.catalog.tag_for(sup) {
                return t.to_string();
            }
        }
        "Component".to_string()
    }

    /// Internal part type used for name mapping.
    pub fn part_type_of(&self, part: &Part) -> Option<String> {
        for sup in &part.inherits {
            if self.catalog.entry(sup).is_some() {
                return Some(sup.to_string());
            }
        }
        if let Some(tag) = part.xml_tag() {
            return self.catalog.part_type_for_tag(tag).map(|s| s.to_string());
        }
        None
    }

    pub fn lookup(&self, name: &str) -> Option<&Part> {
        self.library.get(name)
    }

    fn assemble(mut self, root: &Part, main: Option<Elem>) -> Export {
        let mut files = Vec::new();
        let id = &root.id;
        let simulation = self
            .library
            .values()
            .find(|p| p.xml_role() == Some("simulation"));
        let produced = main.is_some() || !self.defs.is_empty();

        if self.ctypes.is_empty() {
            // The native format carries its own unit vocabulary; a single
            // document suffices.
            let mut doc = Elem::new("neuroml").with_attr("id", id);
            for d in std::mem::take(&mut self.defs) {
                doc.push(d);
            }
            if let Some(m) = main {
                doc.push(m);
            }
            let doc = self.seq.order_tree(doc);
            files.push(OutFile {
                name: format!("{}.nml", id),
                content: doc.to_document(),
            });
        } else {
            // Declarative types present: primary LEMS document plus three
            // included documents and a target declaration.
            let cells_file = format!("{}_cells.nml", id);
            let net_file = format!("{}_net.nml", id);
            let sim_file = format!("{}_sim.xml", id);

            let mut cells = Elem::new("neuroml").with_attr("id", &format!("{}_cells", id));
            for d in std::mem::take(&mut self.defs) {
                cells.push(d);
            }
            let cells = self.seq.order_tree(cells);
            files.push(OutFile {
                name: cells_file.clone(),
                content: cells.to_document(),
            });

            let mut net = Elem::new("neuroml").with_attr("id", &format!("{}_net", id));
            if let Some(m) = main {
                net.push(m);
            }
            let net = self.seq.order_tree(net);
            files.push(OutFile {
                name: net_file.clone(),
                content: net.to_document(),
            });

            let mut sim = Elem::new("Lems");
            if let Some(s) = simulation {
                match self.simulation_elem(s) {
                    Ok(e) => sim.push(e),
                    Err(e) => self.report.capture("Simulation", e),
                }
            }
            let sim = self.seq.order_tree(sim);
            files.push(OutFile {
                name: sim_file.clone(),
                content: sim.to_document(),
            });

            let mut lems = Elem::new("Lems");
            let target = simulation
                .map(|s| s.id.to_string())
                .unwrap_or_else(|| id.to_string());
            lems.push(Elem::new("Target").with_attr("component", &target));
            for f in [&cells_file, &net_file, &sim_file] {
                lems.push(Elem::new("Include").with_attr("file", f));
            }
            // Only a generated document needs unit/dimension declarations.
            let (units, dims) = self.units.declarations();
            for d in dims {
                lems.push(
                    Elem::new("Dimension")
                        .with_attr("name", &d.name)
                        .with_attr("m", &d.m.to_string())
                        .with_attr("l", &d.l.to_string())
                        .with_attr("t", &d.t.to_string())
                        .with_attr("i", &d.i.to_string())
                        .with_attr("k", &d.k.to_string())
                        .with_attr("n", &d.n.to_string()),
                );
            }
            for u in units {
                lems.push(
                    Elem::new("Unit")
                        .with_attr("symbol", &u.symbol)
                        .with_attr("dimension", &u.dimension)
                        .with_attr("power", &u.power.to_string()),
                );
            }
            for ct in std::mem::take(&mut self.ctypes) {
                lems.push(ct);
            }
            let lems = self.seq.order_tree(lems);
            files.push(OutFile {
                name: format!("{}.xml", id),
                content: lems.to_document(),
            });
        }

        let duration = simulation
            .and_then(|s| s.quantity("duration"))
            .cloned();
        let manifest = simulation
            .map(|s| self.manifest(s))
            .unwrap_or_default();
        info!(
            "Export of {} finished: {} files, outcome {:?}",
            id,
            files.len(),
            self.report.outcome(produced)
        );
        Export {
            files,
            duration,
            manifest,
            report: self.report,
        }
    }

    fn simulation_elem(&mut self, part: &Part) -> Result<Elem> {
        let mut e = Elem::new("Simulation").with_attr("id", &part.id);
        for (var, attr) in [("duration", "length"), ("dt", "step"), ("target", "target")] {
            match part.variable(var).and_then(|m| m.default_value()) {
                Some(v) => {
                    let v = self.value(v);
                    e.set_attr(attr, &v);
                }
                None if self.seq.is_required("Simulation", attr) => {
                    return Err(export_error(format!(
                        "Simulation {} lacks required {}",
                        part.id, var
                    )));
                }
                None => {}
            }
        }
        for out in part.children.values() {
            if out.xml_role() != Some("output") {
                continue;
            }
            let mut o = Elem::new("OutputFile").with_attr("id", &out.id);
            if let Some(Value::Text(f)) = out.variable("file").and_then(|m| m.default_value()) {
                o.set_attr("fileName", f);
            }
            if let Some(crate::part::Node::Tree(cols)) = out.metadata.get(&["columns"]) {
                for (cid, q) in cols {
                    if let crate::part::Node::Leaf(quantity) = q {
                        o.push(
                            Elem::new("OutputColumn")
                                .with_attr("id", cid)
                                .with_attr("quantity", quantity),
                        );
                    }
                }
            }
            e.push(o);
        }
        Ok(e)
    }

    /// Line-oriented key:value manifest, one block per output channel.
    fn manifest(&self, simulation: &Part) -> String {
        let mut out = String::new();
        if let Some(d) = simulation.quantity("duration") {
            let _ = writeln!(out, "duration: {}", negotiate(d));
        }
        for file in simulation.children.values() {
            if file.xml_role() != Some("output") {
                continue;
            }
            let _ = writeln!(out);
            if let Some(Value::Text(f)) = file.variable("file").and_then(|m| m.default_value()) {
                let _ = writeln!(out, "file: {}", f);
            }
            let mut columns = vec!["t".to_string()];
            if let Some(crate::part::Node::Tree(cols)) = file.metadata.get(&["columns"]) {
                columns.extend(cols.keys().cloned());
            }
            let _ = writeln!(out, "columns: {}", columns.join(", "));
            let _ = writeln!(out, "scale: 1");
            let _ = writeln!(out, "units: ms, mV");
        }
        out
    }
}
