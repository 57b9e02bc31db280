use std::sync::OnceLock;

use tracing::trace;

use crate::{
    part::Part,
    sequencer::Sequencer,
    Map, Set,
};

/// Translation entry for one internal part type: acceptable external tags
/// (first is preferred on export), variable dictionaries in both
/// directions, containment links, and the computed container set.
#[derive(Debug, Clone, Default)]
pub struct CatalogEntry {
    pub tags: Vec<String>,
    /// internal variable -> external names, first preferred
    pub to_external: Map<String, Vec<String>>,
    /// external attribute -> internal variable
    pub to_internal: Map<String, String>,
    /// part types this one may contain
    pub children: Set<String>,
    /// part types that may contain this one, propagated through extends
    pub containers: Set<String>,
    pub extends: Vec<String>,
}

/// Bidirectional name/type map between internal part vocabulary and
/// external tag/attribute vocabulary. Built once from the schema-tagged
/// parts of the model library, then read-only.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: Map<String, CatalogEntry>,
    /// (external tag, internal name) -> external name; hard type-specific
    /// overrides consulted before any rank-based resolution
    overrides: Map<(String, String), String>,
}

impl Catalog {
    /// Two passes: collect every tagged part, then distribute containment
    /// and container-derived name mappings to a fixed point.
    pub fn build(library: &[Part]) -> Self {
        let mut cat = Catalog::default();
        for part in library {
            if part.xml_tag().is_none() {
                trace!("Part {} carries no schema tag, skipped", part.id);
                continue;
            }
            cat.entries.insert(part.id.to_string(), entry_of(part));
        }
        cat.propagate();
        cat
    }

    /// Catalog over the built-in library; constructed on first use.
    pub fn core() -> &'static Catalog {
        static CORE: OnceLock<Catalog> = OnceLock::new();
        CORE.get_or_init(|| {
            let mut cat = Catalog::build(&core_library());
            cat.overrides.insert(
                ("ionChannel".to_string(), "species".to_string()),
                "species".to_string(),
            );
            cat.overrides.insert(
                ("channelDensity".to_string(), "species".to_string()),
                "ion".to_string(),
            );
            cat
        })
    }

    fn propagate(&mut self) {
        // Containers from direct containment links.
        let mut containers: Map<String, Set<String>> = Map::new();
        for (name, entry) in &self.entries {
            for child in &entry.children {
                containers
                    .entry(child.to_string())
                    .or_default()
                    .insert(name.to_string());
            }
        }
        for (name, entry) in self.entries.iter_mut() {
            if let Some(cs) = containers.get(name) {
                entry.containers.extend(cs.iter().cloned());
            }
        }
        // Each entry inherits the container set of everything it extends,
        // breadth-first over the extends graph.
        let names: Vec<String> = self.entries.keys().cloned().collect();
        for name in &names {
            let mut todo: Vec<String> = self.entries[name].extends.clone();
            let mut seen = Set::new();
            let mut inherited = Set::new();
            while let Some(base) = todo.pop() {
                if !seen.insert(base.clone()) {
                    continue;
                }
                if let Some(b) = self.entries.get(&base) {
                    inherited.extend(b.containers.iter().cloned());
                    todo.extend(b.extends.iter().cloned());
                }
            }
            self.entries
                .get_mut(name)
                .unwrap()
                .containers
                .extend(inherited);
        }
        // Distribute container name mappings into contained entries so a
        // part nested inside an inherited part still resolves its
        // container's variable names. Fixed point, nothing overwritten.
        loop {
            let mut changed = false;
            let names: Vec<String> = self.entries.keys().cloned().collect();
            for name in &names {
                let containers: Vec<String> =
                    self.entries[name].containers.iter().cloned().collect();
                for c in containers {
                    let (ext, int) = match self.entries.get(&c) {
                        Some(e) => (e.to_external.clone(), e.to_internal.clone()),
                        None => continue,
                    };
                    let entry = self.entries.get_mut(name).unwrap();
                    for (k, v) in ext {
                        if !entry.to_external.contains_key(&k) {
                            entry.to_external.insert(k, v);
                            changed = true;
                        }
                    }
                    for (k, v) in int {
                        if !entry.to_internal.contains_key(&k) {
                            entry.to_internal.insert(k, v);
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    pub fn entry(&self, part_type: &str) -> Option<&CatalogEntry> {
        self.entries.get(part_type)
    }

    /// Internal part type registered for an external tag.
    pub fn part_type_for_tag(&self, tag: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, e)| e.tags.iter().any(|t| t == tag))
            .map(|(n, _)| n.as_str())
    }

    /// Preferred export tag for an internal part type.
    pub fn tag_for(&self, part_type: &str) -> Option<&str> {
        self.entries
            .get(part_type)?
            .tags
            .first()
            .map(|s| s.as_str())
    }

    /// External attribute -> internal name; identity when unmapped.
    pub fn import_name(&self, part_type: &str, external: &str) -> String {
        self.entries
            .get(part_type)
            .and_then(|e| e.to_internal.get(external))
            .cloned()
            .unwrap_or_else(|| external.to_string())
    }

    /// Internal name -> external attribute; identity when unmapped.
    /// Ambiguity is resolved by (a) the override table, (b) the attribute's
    /// declaration rank in the destination type, (c) first registered.
    pub fn export_name(&self, part_type: &str, internal: &str, tag_hint: Option<&str>) -> String {
        let entry = match self.entries.get(part_type) {
            Some(e) => e,
            None => return internal.to_string(),
        };
        let cands = match entry.to_external.get(internal) {
            Some(cs) if !cs.is_empty() => cs,
            _ => return internal.to_string(),
        };
        let tag = tag_hint
            .map(|s| s.to_string())
            .or_else(|| entry.tags.first().cloned());
        if let Some(tag) = &tag {
            if let Some(o) = self.overrides.get(&(tag.to_string(), internal.to_string())) {
                return o.to_string();
            }
            if cands.len() > 1 {
                let seq = Sequencer::core();
                let best = cands
                    .iter()
                    .filter_map(|c| seq.attr_rank(tag, c).map(|r| (r, c)))
                    .min_by_key(|(r, _)| *r);
                if let Some((_, c)) = best {
                    return c.to_string();
                }
            }
        }
        cands[0].to_string()
    }
}

fn entry_of(part: &Part) -> CatalogEntry {
    let mut entry = CatalogEntry {
        extends: part.inherits.clone(),
        ..Default::default()
    };
    if let Some(tag) = part.xml_tag() {
        if !tag.is_empty() {
            entry.tags.push(tag.to_string());
        }
    }
    if let Some(alts) = part.meta(&["xml", "alt"]) {
        entry
            .tags
            .extend(Part::parse_inherits(alts).into_iter());
    }
    if let Some(kids) = part.meta(&["xml", "children"]) {
        entry.children = Part::parse_inherits(kids).into_iter().collect();
    }
    if let Some(crate::part::Node::Tree(names)) = part.metadata.get(&["xml", "names"]) {
        for (internal, v) in names {
            if let crate::part::Node::Leaf(externals) = v {
                let exts = Part::parse_inherits(externals);
                for e in &exts {
                    entry
                        .to_internal
                        .entry(e.to_string())
                        .or_insert_with(|| internal.to_string());
                }
                entry.to_external.insert(internal.to_string(), exts);
            }
        }
    }
    entry
}

/// The built-in library of schema-tagged catalog parts: one part per
/// internal type, carrying its external vocabulary in the reserved
/// metadata subtree.
pub fn core_library() -> Vec<Part> {
    fn tagged(id: &str, tag: &str, names: &[(&str, &str)]) -> Part {
        let mut p = Part::new(id);
        p.set_meta(&["xml", "tag"], tag);
        for (int, ext) in names {
            p.set_meta(&["xml", "names", int], ext);
        }
        p
    }

    let mut lib = Vec::new();

    let mut cell = tagged("Cell", "cell", &[("v0", "initMembPotential"), ("cm", "specificCapacitance")]);
    cell.set_meta(&["xml", "children"], "Compartment");
    lib.push(cell);

    let compartment = tagged("Compartment", "segment", &[]);
    lib.push(compartment);

    let mut channel = tagged(
        "Channel",
        "ionChannel",
        &[
            ("density", "condDensity"),
            ("reversal", "erev"),
            ("conductance", "conductance"),
            ("species", "species,ion"),
        ],
    );
    channel.set_meta(&["xml", "alt"], "ionChannelHH,ionChannelPassive");
    channel.set_meta(&["xml", "children"], "Gate");
    lib.push(channel);

    let gate = tagged(
        "Gate",
        "gateHHrates",
        &[("order", "instances"), ("rate", "rate"), ("mid", "midpoint"), ("scale", "scale")],
    );
    lib.push(gate);

    let two_point = tagged("TwoPointPart", "", &[]);
    lib.push(two_point);

    let mut synapse = tagged(
        "Synapse",
        "expTwoSynapse",
        &[
            ("gmax", "gbase"),
            ("reversal", "erev"),
            ("rise", "tauRise"),
            ("decay", "tauDecay"),
        ],
    );
    synapse.inherits.push("TwoPointPart".to_string());
    lib.push(synapse);

    let mut gap = tagged("GapJunction", "gapJunction", &[("conductance", "conductance")]);
    gap.inherits.push("TwoPointPart".to_string());
    lib.push(gap);

    let pulse = tagged(
        "PulseSource",
        "pulseGenerator",
        &[("start", "delay"), ("width", "duration"), ("amplitude", "amplitude")],
    );
    lib.push(pulse);

    let spike = tagged("SpikeSource", "spikeGenerator", &[("interval", "period")]);
    lib.push(spike);

    let mut network = tagged("Network", "network", &[("temperature", "temperature")]);
    network.set_meta(&["xml", "children"], "Population,Projection,Input");
    lib.push(network);

    let population = tagged(
        "Population",
        "population",
        &[("count", "size"), ("of", "component")],
    );
    lib.push(population);

    let mut projection = tagged(
        "Projection",
        "projection",
        &[
            ("A", "presynapticPopulation"),
            ("B", "postsynapticPopulation"),
            ("via", "synapse"),
        ],
    );
    projection.set_meta(&["xml", "children"], "Synapse,GapJunction");
    lib.push(projection);

    let input = tagged(
        "Input",
        "explicitInput",
        &[("target", "target"), ("source", "input")],
    );
    lib.push(input);

    let mut simulation = tagged(
        "Simulation",
        "Simulation",
        &[("duration", "length"), ("dt", "step"), ("target", "target")],
    );
    simulation.set_meta(&["xml", "children"], "OutputFile");
    lib.push(simulation);

    let output = tagged("OutputFile", "OutputFile", &[("file", "fileName")]);
    lib.push(output);

    let column = tagged("OutputColumn", "OutputColumn", &[("select", "quantity")]);
    lib.push(column);

    lib
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_for_unknown() {
        let cat = Catalog::core();
        assert_eq!(cat.import_name("NoSuchPart", "anything"), "anything");
        assert_eq!(cat.export_name("NoSuchPart", "anything", None), "anything");
    }

    #[test]
    fn bijection_on_unique_mappings() {
        let cat = Catalog::core();
        for (int, tag) in [
            ("gmax", "expTwoSynapse"),
            ("rise", "expTwoSynapse"),
            ("decay", "expTwoSynapse"),
        ] {
            let ext = cat.export_name("Synapse", int, Some(tag));
            assert_eq!(cat.import_name("Synapse", &ext), int);
        }
    }

    #[test]
    fn ambiguity_resolved_by_override() {
        let cat = Catalog::core();
        // species maps to both "species" and "ion"; the override table
        // pins the choice per destination tag.
        assert_eq!(
            cat.export_name("Channel", "species", Some("ionChannel")),
            "species"
        );
        assert_eq!(
            cat.export_name("Channel", "species", Some("channelDensity")),
            "ion"
        );
    }

    #[test]
    fn ambiguity_resolved_by_schema_rank() {
        let mut p = Part::new("Channel2");
        p.set_meta(&["xml", "tag"], "ionChannel");
        p.set_meta(&["xml", "names", "species"], "ion,species");
        let cat = Catalog::build(&[p]);
        // "ion" registered first, but the destination type only declares
        // "species", so declaration rank decides.
        assert_eq!(
            cat.export_name("Channel2", "species", Some("ionChannel")),
            "species"
        );
        // With no rankable candidate the first registration wins.
        assert_eq!(
            cat.export_name("Channel2", "species", Some("mysteryTag")),
            "ion"
        );
    }

    #[test]
    fn containers_propagate_through_extends() {
        let cat = Catalog::core();
        // Synapse extends TwoPointPart; Projection lists Synapse as a
        // child, so both Synapse and (via inheritance) GapJunction peers
        // see Projection's vocabulary.
        let syn = cat.entry("Synapse").unwrap();
        assert!(syn.containers.contains("Projection"));
        assert_eq!(cat.import_name("Synapse", "presynapticPopulation"), "A");
    }

    #[test]
    fn tag_lookup() {
        let cat = Catalog::core();
        assert_eq!(cat.part_type_for_tag("ionChannelHH"), Some("Channel"));
        assert_eq!(cat.tag_for("Channel"), Some("ionChannel"));
    }
}
