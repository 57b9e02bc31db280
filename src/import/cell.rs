use roxmltree::Node;
use tracing::{info, trace};

use crate::{
    error::{import_error, Result},
    expr::Filter,
    morph::{self, Point, PropertyColumn, Scope, Segment},
    part::{Clause, Combine, MultiClause, Part, Value},
    xml::{elements, parse_attr, parse_attr_or, req_attr},
    Map,
};

use super::ImportJob;

/// One translated property declaration: the matrix column plus the
/// variables it contributes to every member of its scope.
struct PropertyDecl {
    column: PropertyColumn,
    variables: Vec<(String, MultiClause)>,
    /// referenced shared definition (ion channel, concentration model)
    reference: Option<String>,
}

/// Import a cell element: morphology scan, property collection, then the
/// partitioning pass that turns overlapping declared groups into the
/// minimal set of sub-parts.
pub fn import_cell(
    job: &mut ImportJob,
    node: &Node,
    morphologies: &Map<String, Node>,
    biophysics: &Map<String, Node>,
) -> Result<()> {
    let id = req_attr(node, "id")?;
    let mut part = Part::new(&id);
    part.set_meta(&["xml", "tag"], "cell");
    part.set_meta(&["xml", "role"], "cell");
    part.set_meta(&["xml", "id"], &id);

    let morphology = find_section(node, morphologies, "morphology")
        .ok_or_else(|| import_error(format!("Cell {} has no morphology", id)))?;
    let (mut segments, declared) = scan_morphology(job, &morphology)?;
    if let Err(e) = morph::propagate_proximal(&mut segments) {
        job.report.capture(&format!("Cell {} geometry", id), e);
    }

    let mut properties = Vec::new();
    if let Some(bpp) = find_section(node, biophysics, "biophysicalProperties") {
        properties = scan_biophysics(job, &bpp)?;
    } else {
        job.report
            .warn(format!("Cell {} has no biophysical properties", id));
    }

    let columns: Vec<PropertyColumn> = properties.iter().map(|p| p.column.clone()).collect();
    let partition = morph::partition(&segments, &columns, &declared)?;
    info!(
        "Cell {}: {} segments, {} properties, {} merged groups",
        id,
        segments.len(),
        columns.len(),
        partition.groups.len()
    );

    // One sub-part per merged group: population count, the union of
    // property equations that apply, original geometry in metadata.
    for group in &partition.groups {
        let mut sub = Part::new(&group.name);
        sub.set_meta(&["xml", "role"], "segment");
        sub.set_variable(
            "population",
            MultiClause::quantity(crate::expr::Quantity::number(group.segments.len() as f64)),
        );
        for &c in &group.properties {
            let decl = &properties[c];
            if let Some(r) = &decl.reference {
                let mut dep = Part::with_inherits(&decl.column.name, &[r]);
                dep.set_meta(&["xml", "role"], "channel");
                for (k, v) in &decl.variables {
                    dep.set_variable(k, v.clone());
                }
                sub.children.insert(decl.column.name.to_string(), dep);
                job.note_reference(
                    r,
                    &[
                        id.to_string(),
                        group.name.to_string(),
                        decl.column.name.to_string(),
                    ],
                    false,
                );
            } else {
                for (k, v) in &decl.variables {
                    sub.set_variable(k, v.clone());
                }
            }
        }
        for (ix, sid) in group.segments.iter().enumerate() {
            let seg = segments.iter().find(|s| s.id == *sid).unwrap();
            sub.set_meta(&["geometry", &ix.to_string()], &geometry_string(seg));
            sub.set_meta(&["segments", &ix.to_string()], &sid.to_string());
            if let Some(n) = &seg.name {
                sub.set_meta(&["names", &ix.to_string()], n);
            }
        }
        part.children.insert(group.name.to_string(), sub);
    }

    // Structural parent/child relations become explicit couplings; the
    // filter encodes the index pairing once either side has several
    // members.
    for ((pg, cg), pairs) in morph::couplings(&segments, &partition.groups) {
        let pname = &partition.groups[pg].name;
        let cname = &partition.groups[cg].name;
        let mut link = Part::new(&format!("{}_{}", pname, cname));
        link.set_meta(&["xml", "role"], "coupling");
        link.set_variable("A", MultiClause::text(pname));
        link.set_variable("B", MultiClause::text(cname));
        let singletons =
            partition.groups[pg].segments.len() == 1 && partition.groups[cg].segments.len() == 1;
        if !singletons {
            let clauses = pairs
                .iter()
                .filter_map(|(a, b)| {
                    Filter {
                        a: Some(*a),
                        b: Some(*b),
                    }
                    .to_boolean()
                    .map(|cond| Clause {
                        condition: Some(cond),
                        value: Value::Quantity(crate::expr::Quantity::number(1.0)),
                    })
                })
                .collect();
            link.set_variable(
                "condition",
                MultiClause {
                    clauses,
                    combine: Combine::Replace,
                },
            );
        }
        part.children.insert(link.id.to_string(), link);
    }

    // Declared groups survive as metadata so export can reconstruct them.
    for (name, spans) in &partition.declared_spans {
        let names: Vec<String> = spans
            .iter()
            .map(|&m| partition.groups[m].name.to_string())
            .collect();
        part.set_meta(&["xml", "groups", name], &names.join(","));
    }

    job.parts.insert(id, part);
    Ok(())
}

/// Inline section, or a buffered top-level one referenced by id.
fn find_section<'a, 'i>(
    node: &Node<'a, 'i>,
    buffered: &Map<String, Node<'a, 'i>>,
    tag: &str,
) -> Option<Node<'a, 'i>> {
    if let Some(n) = elements(node).find(|n| n.tag_name().name() == tag) {
        return Some(n);
    }
    node.attribute(tag).and_then(|id| buffered.get(id).copied())
}

fn scan_morphology(
    job: &mut ImportJob,
    node: &Node,
) -> Result<(Vec<Segment>, Map<String, Vec<i64>>)> {
    let mut segments = Vec::new();
    for seg in elements(node).filter(|n| n.tag_name().name() == "segment") {
        match scan_segment(&seg) {
            Ok(s) => segments.push(s),
            Err(e) => job.report.capture("<segment>", e),
        }
    }
    // Declared groups may include other declared groups; collect members
    // first, then expand includes to a fixed point.
    let mut declared: Map<String, Vec<i64>> = Map::new();
    let mut includes: Vec<(String, String)> = Vec::new();
    for grp in elements(node).filter(|n| n.tag_name().name() == "segmentGroup") {
        let gid = match grp.attribute("id") {
            Some(g) => g.to_string(),
            None => {
                job.report.warn("segmentGroup without id".to_string());
                continue;
            }
        };
        let mut members = Vec::new();
        for m in elements(&grp) {
            match m.tag_name().name() {
                "member" => match parse_attr::<i64>(&m, "segment") {
                    Ok(Some(s)) => members.push(s),
                    _ => job
                        .report
                        .warn(format!("Bad member in group {}", gid)),
                },
                "include" => {
                    if let Some(other) = m.attribute("segmentGroup") {
                        includes.push((gid.to_string(), other.to_string()));
                    }
                }
                _ => {}
            }
        }
        declared.insert(gid, members);
    }
    loop {
        let mut changed = false;
        for (gid, other) in &includes {
            let extra = declared.get(other).cloned().unwrap_or_default();
            let mine = declared.entry(gid.to_string()).or_default();
            for e in extra {
                if !mine.contains(&e) {
                    mine.push(e);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    Ok((segments, declared))
}

fn scan_segment(node: &Node) -> Result<Segment> {
    let id = parse_attr::<i64>(node, "id")?
        .ok_or_else(|| import_error("Segment without id"))?;
    let name = node.attribute("name").map(|s| s.to_string());
    let mut parent = None;
    let mut fraction_along = 1.0;
    let mut proximal = None;
    let mut distal = None;
    for child in elements(node) {
        match child.tag_name().name() {
            "parent" => {
                parent = parse_attr::<i64>(&child, "segment")?;
                fraction_along = parse_attr_or(&child, "fractionAlong", 1.0)?;
            }
            "proximal" => proximal = Some(scan_point(&child)?),
            "distal" => distal = Some(scan_point(&child)?),
            t => trace!("Ignoring <{}> in segment {}", t, id),
        }
    }
    let distal = distal.ok_or_else(|| import_error(format!("Segment {} has no distal point", id)))?;
    Ok(Segment {
        id,
        name,
        parent,
        fraction_along,
        proximal,
        distal,
    })
}

fn scan_point(node: &Node) -> Result<Point> {
    Ok(Point {
        x: parse_attr_or(node, "x", 0.0)?,
        y: parse_attr_or(node, "y", 0.0)?,
        z: parse_attr_or(node, "z", 0.0)?,
        d: parse_attr_or(node, "diameter", 0.0)?,
    })
}

fn scan_biophysics(job: &mut ImportJob, node: &Node) -> Result<Vec<PropertyDecl>> {
    let mut out = Vec::new();
    for section in elements(node) {
        match section.tag_name().name() {
            "membraneProperties" => {
                for item in elements(&section) {
                    match scan_membrane_item(job, &item) {
                        Ok(Some(d)) => out.push(d),
                        Ok(None) => {}
                        Err(e) => job.report.capture("membrane property", e),
                    }
                }
            }
            "intracellularProperties" => {
                for item in elements(&section) {
                    match scan_intracellular_item(job, &item) {
                        Ok(Some(d)) => out.push(d),
                        Ok(None) => {}
                        Err(e) => job.report.capture("intracellular property", e),
                    }
                }
            }
            t => trace!("Ignoring <{}> in biophysics", t),
        }
    }
    Ok(out)
}

fn scope_of(node: &Node) -> Result<Scope> {
    if let Some(s) = node.attribute("segment") {
        let id = s
            .parse::<i64>()
            .map_err(|_| import_error(format!("Bad segment id {:?}", s)))?;
        return Ok(Scope::One(id));
    }
    match node.attribute("segmentGroup") {
        Some(g) if g != "all" => Ok(Scope::Group(g.to_string())),
        _ => Ok(Scope::All),
    }
}

fn quantity_clause(job: &mut ImportJob, raw: &str) -> MultiClause {
    MultiClause::quantity(super::parse_quantity(raw, &mut job.report))
}

fn scan_membrane_item(job: &mut ImportJob, node: &Node) -> Result<Option<PropertyDecl>> {
    let tag = node.tag_name().name();
    match tag {
        "channelDensity" => {
            let channel = req_attr(node, "ionChannel")?;
            let name = node
                .attribute("id")
                .map(|s| s.to_string())
                .unwrap_or_else(|| channel.to_string());
            let mut variables = Vec::new();
            if let Some(v) = node.attribute("condDensity") {
                variables.push(("density".to_string(), quantity_clause(job, v)));
            }
            if let Some(v) = node.attribute("erev") {
                variables.push(("reversal".to_string(), quantity_clause(job, v)));
            }
            if let Some(v) = node.attribute("ion") {
                variables.push(("species".to_string(), MultiClause::text(v)));
            }
            Ok(Some(PropertyDecl {
                column: PropertyColumn {
                    name,
                    scope: scope_of(node)?,
                },
                variables,
                reference: Some(channel),
            }))
        }
        "specificCapacitance" | "initMembPotential" | "spikeThresh" => {
            let internal = match tag {
                "specificCapacitance" => "cm",
                "initMembPotential" => "v0",
                _ => "thresh",
            };
            let v = req_attr(node, "value")?;
            Ok(Some(PropertyDecl {
                column: PropertyColumn {
                    name: internal.to_string(),
                    scope: scope_of(node)?,
                },
                variables: vec![(internal.to_string(), quantity_clause(job, &v))],
                reference: None,
            }))
        }
        t => {
            trace!("Ignoring <{}> in membrane properties", t);
            Ok(None)
        }
    }
}

fn scan_intracellular_item(job: &mut ImportJob, node: &Node) -> Result<Option<PropertyDecl>> {
    match node.tag_name().name() {
        "resistivity" => {
            let v = req_attr(node, "value")?;
            Ok(Some(PropertyDecl {
                column: PropertyColumn {
                    name: "ra".to_string(),
                    scope: scope_of(node)?,
                },
                variables: vec![("ra".to_string(), quantity_clause(job, &v))],
                reference: None,
            }))
        }
        "species" => {
            let id = req_attr(node, "id")?;
            let mut variables = Vec::new();
            if let Some(v) = node.attribute("initialConcentration") {
                variables.push(("concentration".to_string(), quantity_clause(job, v)));
            }
            if let Some(v) = node.attribute("initialExtConcentration") {
                variables.push(("concentration_ext".to_string(), quantity_clause(job, v)));
            }
            let reference = node.attribute("concentrationModel").map(|s| s.to_string());
            Ok(Some(PropertyDecl {
                column: PropertyColumn {
                    name: id,
                    scope: scope_of(node)?,
                },
                variables,
                reference,
            }))
        }
        t => {
            trace!("Ignoring <{}> in intracellular properties", t);
            Ok(None)
        }
    }
}

fn geometry_string(seg: &Segment) -> String {
    let p = seg.proximal.unwrap_or(seg.distal);
    let d = seg.distal;
    format!(
        "{} {} {} {} {} {} {} {} {}",
        p.x, p.y, p.z, p.d, d.x, d.y, d.z, d.d, seg.fraction_along
    )
}

/// Parse a geometry string written by `geometry_string`.
pub fn geometry_from_string(s: &str) -> Option<(Point, Point, f64)> {
    let vs: Vec<f64> = s
        .split_whitespace()
        .filter_map(|x| x.parse::<f64>().ok())
        .collect();
    if vs.len() != 9 {
        return None;
    }
    Some((
        Point {
            x: vs[0],
            y: vs[1],
            z: vs[2],
            d: vs[3],
        },
        Point {
            x: vs[4],
            y: vs[5],
            z: vs[6],
            d: vs[7],
        },
        vs[8],
    ))
}
