use tracing::trace;

use crate::{
    element::Elem,
    error::{export_error, Result},
    expr::Filter,
    import::cell::geometry_from_string,
    morph::{self, Segment},
    part::{Node, Part, Value},
    Map,
};

use super::ExportJob;

/// Re-derive a cell element from its partitioned form: group sub-parts
/// carry population counts and per-member geometry, coupling children carry
/// the structural parent/child relations.
pub fn export_cell(job: &mut ExportJob, part: &Part) -> Result<Elem> {
    let groups: Vec<&Part> = part
        .children
        .values()
        .filter(|c| c.xml_role() == Some("segment"))
        .collect();
    if groups.is_empty() {
        return Err(export_error(format!("Cell {} has no compartments", part.id)));
    }
    let couplings: Vec<&Part> = part
        .children
        .values()
        .filter(|c| c.xml_role() == Some("coupling"))
        .collect();

    let (segments, members) = rebuild_segments(job, part, &groups, &couplings)?;

    let mut cell =
        Elem::new("cell").with_attr("id", part.original_id().unwrap_or(&part.id));
    cell.push(morphology_elem(job, part, &segments, &groups, &members));
    cell.push(biophysics_elem(job, part, &groups, &members)?);
    Ok(cell)
}

/// Rebuild the flat segment list. Returns the finalized segments and, per
/// group name, the exported segment ids of its members in member order.
fn rebuild_segments(
    job: &mut ExportJob,
    part: &Part,
    groups: &[&Part],
    couplings: &[&Part],
) -> Result<(Vec<Segment>, Map<String, Vec<i64>>)> {
    // Provisional ids are dense in (group, member) declaration order.
    let mut provisional: Map<(String, i64), i64> = Map::new();
    let mut segments = Vec::new();
    let mut next = 0i64;
    for group in groups {
        let n = population_of(group);
        for ix in 0..n {
            let (proximal, distal, fraction) = group
                .meta(&["geometry", &ix.to_string()])
                .and_then(geometry_from_string)
                .map(|(p, d, f)| (Some(p), d, f))
                .unwrap_or_else(|| {
                    (
                        None,
                        crate::morph::Point {
                            x: 0.0,
                            y: 0.0,
                            z: 0.0,
                            d: 1.0,
                        },
                        1.0,
                    )
                });
            let name = group
                .meta(&["names", &ix.to_string()])
                .map(|s| s.to_string())
                .or_else(|| {
                    if n == 1 {
                        Some(group.id.to_string())
                    } else {
                        None
                    }
                });
            provisional.insert((group.id.to_string(), ix), next);
            segments.push(Segment {
                id: next,
                name,
                parent: None,
                fraction_along: fraction,
                proximal,
                distal,
            });
            next += 1;
        }
    }

    // Couplings bind (parent group, index) -> (child group, index).
    for link in couplings {
        let a = text_var(link, "A");
        let b = text_var(link, "B");
        let (a, b) = match (a, b) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                job.report
                    .warn(format!("Coupling {} lacks endpoints", link.id));
                continue;
            }
        };
        let na = groups
            .iter()
            .find(|g| g.id == a)
            .map(|g| population_of(g))
            .unwrap_or(0);
        let nb = groups
            .iter()
            .find(|g| g.id == b)
            .map(|g| population_of(g))
            .unwrap_or(0);
        let pairs = coupling_pairs(job, link, na, nb);
        for (pix, cix) in pairs {
            let parent = provisional.get(&(a.to_string(), pix));
            let child = provisional.get(&(b.to_string(), cix));
            match (parent, child) {
                (Some(&p), Some(&c)) => {
                    if let Some(seg) = segments.iter_mut().find(|s| s.id == c) {
                        seg.parent = Some(p);
                    }
                }
                _ => job.report.warn(format!(
                    "Coupling {} pairs ({}, {}) outside its populations",
                    link.id, pix, cix
                )),
            }
        }
    }

    let remap = morph::assign_ids_depth_first(&mut segments)?;
    let mut members: Map<String, Vec<i64>> = Map::new();
    for ((group, _), old) in &provisional {
        members
            .entry(group.to_string())
            .or_default()
            .push(remap[old]);
    }
    trace!(
        "Cell {}: rebuilt {} segments from {} groups",
        part.id,
        segments.len(),
        groups.len()
    );
    Ok((segments, members))
}

/// Index pairs bound by one coupling part. A filter condition enumerates
/// them; singletons pair up directly; anything else falls back to an
/// index-wise zip.
fn coupling_pairs(job: &mut ExportJob, link: &Part, na: i64, nb: i64) -> Vec<(i64, i64)> {
    if let Some(mc) = link.variable("condition") {
        let mut pairs = Vec::new();
        for clause in &mc.clauses {
            if let Some(cond) = &clause.condition {
                match Filter::from_boolean(cond) {
                    Ok(f) => pairs.extend(f.pairs(na, nb)),
                    Err(e) => job
                        .report
                        .capture(&format!("Coupling {} filter", link.id), e),
                }
            }
        }
        return pairs;
    }
    if na == 1 && nb == 1 {
        return vec![(0, 0)];
    }
    if na == nb {
        return (0..na).map(|i| (i, i)).collect();
    }
    job.report.warn(format!(
        "Coupling {} has no filter over populations {}x{}",
        link.id, na, nb
    ));
    vec![(0, 0)]
}

fn morphology_elem(
    job: &mut ExportJob,
    part: &Part,
    segments: &[Segment],
    groups: &[&Part],
    members: &Map<String, Vec<i64>>,
) -> Elem {
    let mut m = Elem::new("morphology").with_attr("id", &format!("{}_morphology", part.id));
    for seg in segments {
        let mut e = Elem::new("segment").with_attr("id", &seg.id.to_string());
        if let Some(n) = &seg.name {
            e.set_attr("name", n);
        }
        if let Some(p) = seg.parent {
            let mut pe = Elem::new("parent").with_attr("segment", &p.to_string());
            if (seg.fraction_along - 1.0).abs() > f64::EPSILON {
                pe.set_attr("fractionAlong", &seg.fraction_along.to_string());
            }
            e.push(pe);
        }
        if let Some(p) = seg.proximal {
            if seg.parent.is_none() {
                e.push(point_elem("proximal", &p));
            }
        }
        e.push(point_elem("distal", &seg.distal));
        m.push(e);
    }
    // One group per merged sub-part, then the declared groups recovered
    // from the recorded spans.
    for group in groups {
        if let Some(ids) = members.get(&group.id) {
            m.push(group_elem(&group.id, ids));
        }
    }
    if let Some(Node::Tree(declared)) = part.metadata.get(&["xml", "groups"]) {
        for (name, spans) in declared {
            if members.contains_key(name) {
                continue; // already emitted as a merged group
            }
            if let Node::Leaf(spans) = spans {
                let mut ids = Vec::new();
                for g in Part::parse_inherits(spans) {
                    match members.get(&g) {
                        Some(ms) => ids.extend(ms.iter().copied()),
                        None => job.report.warn(format!(
                            "Declared group {} spans unknown group {}",
                            name, g
                        )),
                    }
                }
                ids.sort_unstable();
                m.push(group_elem(name, &ids));
            }
        }
    }
    m
}

fn group_elem(name: &str, ids: &[i64]) -> Elem {
    let mut g = Elem::new("segmentGroup").with_attr("id", name);
    for id in ids {
        g.push(Elem::new("member").with_attr("segment", &id.to_string()));
    }
    g
}

fn point_elem(tag: &str, p: &crate::morph::Point) -> Elem {
    Elem::new(tag)
        .with_attr("x", &p.x.to_string())
        .with_attr("y", &p.y.to_string())
        .with_attr("z", &p.z.to_string())
        .with_attr("diameter", &p.d.to_string())
}

fn biophysics_elem(
    job: &mut ExportJob,
    part: &Part,
    groups: &[&Part],
    members: &Map<String, Vec<i64>>,
) -> Result<Elem> {
    let mut membrane = Elem::new("membraneProperties");
    let mut intra = Elem::new("intracellularProperties");
    for group in groups {
        let everywhere = members.len() == 1;
        let scope: Option<&str> = if everywhere { None } else { Some(&group.id) };
        // Channel placements are children referencing (or fully carrying)
        // the shared channel definition.
        for chan in group
            .children
            .values()
            .filter(|c| c.xml_role() == Some("channel"))
        {
            match channel_density(job, chan, scope) {
                Ok(e) => membrane.push(e),
                Err(e) => job
                    .report
                    .capture(&format!("Channel {} on {}", chan.id, group.id), e),
            }
        }
        for (var, tag) in [
            ("cm", "specificCapacitance"),
            ("v0", "initMembPotential"),
            ("thresh", "spikeThresh"),
        ] {
            if let Some(q) = group.quantity(var) {
                let v = job.quantity(q);
                let mut e = Elem::new(tag).with_attr("value", &v);
                if let Some(s) = scope {
                    e.set_attr("segmentGroup", s);
                }
                membrane.push(e);
            }
        }
        if let Some(q) = group.quantity("ra") {
            let v = job.quantity(q);
            let mut e = Elem::new("resistivity").with_attr("value", &v);
            if let Some(s) = scope {
                e.set_attr("segmentGroup", s);
            }
            intra.push(e);
        }
    }
    let mut bpp =
        Elem::new("biophysicalProperties").with_attr("id", &format!("{}_biophys", part.id));
    bpp.push(membrane);
    if !intra.children.is_empty() {
        bpp.push(intra);
    }
    Ok(bpp)
}

fn channel_density(job: &mut ExportJob, chan: &Part, scope: Option<&str>) -> Result<Elem> {
    // The referenced definition may still live in the library (promoted)
    // or have been spliced into this part wholesale.
    let referenced = chan
        .inherits
        .iter()
        .find_map(|s| job.lookup(s).cloned());
    let channel_id = match referenced {
        Some(def) => job.emit_def(&def)?,
        None => job.emit_def(chan)?,
    };
    let mut e = Elem::new("channelDensity")
        .with_attr("id", &chan.id)
        .with_attr("ionChannel", &channel_id);
    if let Some(q) = chan.quantity("density") {
        let v = job.quantity(q);
        e.set_attr("condDensity", &v);
    }
    if let Some(q) = chan.quantity("reversal") {
        let v = job.quantity(q);
        e.set_attr("erev", &v);
    }
    if let Some(Value::Text(ion)) = chan.variable("species").and_then(|m| m.default_value()) {
        let attr = job.catalog.export_name("Channel", "species", Some("channelDensity"));
        e.set_attr(&attr, ion);
    }
    if let Some(s) = scope {
        e.set_attr("segmentGroup", s);
    }
    Ok(e)
}

fn population_of(part: &Part) -> i64 {
    part.quantity("population")
        .map(|q| q.value as i64)
        .unwrap_or(1)
}

fn text_var<'a>(part: &'a Part, name: &str) -> Option<&'a str> {
    match part.variable(name)?.default_value()? {
        Value::Text(t) => Some(t),
        _ => None,
    }
}
