use roxmltree::Node;
use tracing::{info, trace};

use crate::{
    error::{import_error, Result},
    expr::Filter,
    part::{Clause, Combine, MultiClause, Part, Value},
    xml::{elements, req_attr},
};

use super::ImportJob;

/// Import a network element: populations, projections and explicit inputs
/// become children of one network part; referenced components are counted
/// for the dependency pass.
pub fn import_network(job: &mut ImportJob, node: &Node) -> Result<()> {
    let id = req_attr(node, "id")?;
    let mut part = Part::new(&id);
    part.set_meta(&["xml", "tag"], "network");
    part.set_meta(&["xml", "role"], "network");
    part.set_meta(&["xml", "id"], &id);
    if let Some(t) = node.attribute("temperature") {
        part.set_variable(
            "temperature",
            MultiClause::quantity(super::parse_quantity(t, &mut job.report)),
        );
    }

    let mut inputs = 0usize;
    for child in elements(node) {
        let tag = child.tag_name().name();
        let outcome = match tag {
            "population" => population(job, &id, &mut part, &child),
            "projection" => projection(job, &id, &mut part, &child),
            "explicitInput" => {
                inputs += 1;
                explicit_input(job, &id, &mut part, &child, inputs)
            }
            "inputList" => input_list(job, &id, &mut part, &child),
            "notes" | "property" | "annotation" => Ok(()),
            t => {
                trace!("Ignoring <{}> in network {}", t, id);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            job.report.capture(&format!("<{}> in network {}", tag, id), e);
        }
    }
    info!("Imported network {} ({} children)", id, part.children.len());
    job.parts.insert(id, part);
    Ok(())
}

fn population(job: &mut ImportJob, net: &str, part: &mut Part, node: &Node) -> Result<()> {
    let id = req_attr(node, "id")?;
    let component = req_attr(node, "component")?;
    let size = node
        .attribute("size")
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(1);
    let mut pop = Part::with_inherits(&id, &[&component]);
    pop.set_meta(&["xml", "role"], "population");
    pop.set_variable(
        "population",
        MultiClause::quantity(crate::expr::Quantity::number(size as f64)),
    );
    // A population is itself a connectable endpoint, so its component is
    // transitively one too.
    job.note_reference(&component, &[net.to_string(), id.to_string()], true);
    part.children.insert(id, pop);
    Ok(())
}

/// Index of the cell within its population, from a reference of the form
/// `../population/3/Component` or a bare index.
pub fn parse_cell_ref(s: &str) -> Option<i64> {
    let pieces: Vec<&str> = s.split('/').filter(|p| !p.is_empty() && *p != "..").collect();
    match pieces.as_slice() {
        [_, ix, ..] => ix.parse().ok(),
        [ix] => ix.parse().ok(),
        _ => None,
    }
}

fn projection(job: &mut ImportJob, net: &str, part: &mut Part, node: &Node) -> Result<()> {
    let id = req_attr(node, "id")?;
    let pre = req_attr(node, "presynapticPopulation")?;
    let post = req_attr(node, "postsynapticPopulation")?;
    let synapse = req_attr(node, "synapse")?;
    let mut proj = Part::new(&id);
    proj.set_meta(&["xml", "role"], "projection");
    proj.set_variable("A", MultiClause::text(&pre));
    proj.set_variable("B", MultiClause::text(&post));
    proj.set_variable("via", MultiClause::text(&synapse));
    // Populations are connection endpoints; the synapse itself is an
    // ordinary reference and may be spliced in when nothing else uses it.
    let path = vec![net.to_string(), id.to_string()];
    job.note_reference(&pre, &path, true);
    job.note_reference(&post, &path, true);
    job.note_reference(&synapse, &path, false);

    let mut clauses = Vec::new();
    let mut weight = None;
    let mut delay = None;
    for conn in elements(node) {
        let tag = conn.tag_name().name();
        if tag != "connection" && tag != "connectionWD" {
            continue;
        }
        let a = conn.attribute("preCellId").and_then(parse_cell_ref);
        let b = conn.attribute("postCellId").and_then(parse_cell_ref);
        if a.is_none() && b.is_none() {
            job.report
                .warn(format!("Connection in {} without resolvable endpoints", id));
            continue;
        }
        if let Some(cond) = (Filter { a, b }).to_boolean() {
            clauses.push(Clause {
                condition: Some(cond),
                value: Value::Quantity(crate::expr::Quantity::number(1.0)),
            });
        }
        if tag == "connectionWD" {
            let w = conn
                .attribute("weight")
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(1.0);
            match weight {
                None => weight = Some(w),
                Some(prev) if (prev - w).abs() > f64::EPSILON => {
                    job.report.warn(format!(
                        "Projection {} mixes connection weights; keeping {}",
                        id, prev
                    ));
                }
                _ => {}
            }
            if delay.is_none() {
                if let Some(d) = conn.attribute("delay") {
                    delay = Some(super::parse_quantity(d, &mut job.report));
                }
            }
        }
    }
    if !clauses.is_empty() {
        proj.set_variable(
            "condition",
            MultiClause {
                clauses,
                combine: Combine::Replace,
            },
        );
    }
    if let Some(w) = weight {
        proj.set_variable(
            "weight",
            MultiClause::quantity(crate::expr::Quantity::number(w)),
        );
    }
    if let Some(d) = delay {
        proj.set_variable("delay", MultiClause::quantity(d));
    }
    part.children.insert(id, proj);
    Ok(())
}

fn explicit_input(
    job: &mut ImportJob,
    net: &str,
    part: &mut Part,
    node: &Node,
    nth: usize,
) -> Result<()> {
    let target = req_attr(node, "target")?;
    let input = req_attr(node, "input")?;
    let id = format!("input_{}", nth);
    let mut inp = Part::new(&id);
    inp.set_meta(&["xml", "role"], "input");
    inp.set_variable("source", MultiClause::text(&input));
    inp.set_variable("target", MultiClause::text(&target));
    let path = vec![net.to_string(), id.to_string()];
    job.note_reference(&input, &path, false);
    // The target cell is an endpoint; a single consumer is re-fused later.
    let tgt = target.split('/').next().unwrap_or(&target).to_string();
    job.note_reference(&tgt, &path, true);
    part.children.insert(id, inp);
    Ok(())
}

fn input_list(job: &mut ImportJob, net: &str, part: &mut Part, node: &Node) -> Result<()> {
    let id = req_attr(node, "id")?;
    let component = req_attr(node, "component")?;
    let population = req_attr(node, "population")?;
    let mut nth = 0usize;
    for item in elements(node).filter(|n| n.tag_name().name() == "input") {
        nth += 1;
        let iid = format!("{}_{}", id, nth);
        let mut inp = Part::new(&iid);
        inp.set_meta(&["xml", "role"], "input");
        inp.set_variable("source", MultiClause::text(&component));
        let target = item
            .attribute("target")
            .map(|s| s.to_string())
            .unwrap_or_else(|| population.to_string());
        inp.set_variable("target", MultiClause::text(&target));
        if let Some(seg) = item.attribute("segmentId") {
            inp.set_variable("segment", MultiClause::constant(Value::parse_attribute(seg)));
        }
        if let Some(f) = item.attribute("fractionAlong") {
            inp.set_variable("fraction", MultiClause::constant(Value::parse_attribute(f)));
        }
        let path = vec![net.to_string(), iid.to_string()];
        job.note_reference(&component, &path, false);
        job.note_reference(&population, &path, true);
        part.children.insert(iid, inp);
    }
    if nth == 0 {
        return Err(import_error(format!("Input list {} is empty", id)));
    }
    Ok(())
}
