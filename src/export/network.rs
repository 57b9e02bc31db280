use tracing::trace;

use crate::{
    element::Elem,
    error::{export_error, Result},
    expr::Filter,
    part::{Part, Value},
};

use super::ExportJob;

/// Export a network part: populations, unpacked projections and explicit
/// inputs. Referenced component models are emitted as shared definitions
/// through the dedup path.
pub fn export_network(job: &mut ExportJob, part: &Part) -> Result<Elem> {
    let mut net = Elem::new("network").with_attr("id", part.original_id().unwrap_or(&part.id));
    if let Some(q) = part.quantity("temperature") {
        let v = job.quantity(q);
        net.set_attr("temperature", &v);
        net.set_attr("type", "networkWithTemperature");
    }

    for child in part.children.values() {
        let role = child.xml_role().unwrap_or("component");
        let outcome = match role {
            "population" => population(job, child).map(|e| net.push(e)),
            "projection" => projection(job, part, child).map(|e| net.push(e)),
            "input" => explicit_input(job, child).map(|e| net.push(e)),
            _ => {
                trace!("Ignoring {} ({}) in network {}", child.id, role, part.id);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            job.report
                .capture(&format!("{} in network {}", child.id, part.id), e);
        }
    }
    Ok(net)
}

fn population(job: &mut ExportJob, part: &Part) -> Result<Elem> {
    let size = part
        .quantity("population")
        .map(|q| q.value as i64)
        .unwrap_or(1);
    // The component model is either a promoted library entry or spliced
    // into the population part itself.
    let component = match part
        .inherits
        .iter()
        .find_map(|s| job.lookup(s).cloned())
    {
        Some(def) => match def.xml_role() {
            Some("cell") => {
                let e = super::cell::export_cell(job, &def)?;
                let id = def.id.to_string();
                if !job.defs.iter().any(|d| d.attr("id") == Some(&id)) {
                    job.defs.push(e);
                }
                id
            }
            _ => job.emit_def(&def)?,
        },
        None => {
            let mut local = part.clone();
            local.variables.remove("population");
            job.emit_def(&local)?
        }
    };
    Ok(Elem::new("population")
        .with_attr("id", &part.id)
        .with_attr("component", &component)
        .with_attr("size", &size.to_string()))
}

/// Unpack a binary connection part into one connection element per
/// satisfied filter condition; with no filter every pairwise combination of
/// the endpoint population sizes is instantiated, self-pairs included.
fn projection(job: &mut ExportJob, net: &Part, part: &Part) -> Result<Elem> {
    let a = text_var(part, "A")
        .ok_or_else(|| export_error(format!("Projection {} lacks endpoint A", part.id)))?;
    let b = text_var(part, "B")
        .ok_or_else(|| export_error(format!("Projection {} lacks endpoint B", part.id)))?;
    let na = population_size(net, job, &a);
    let nb = population_size(net, job, &b);

    let synapse = match text_var(part, "via") {
        Some(s) => match job.lookup(&s).cloned() {
            Some(def) => job.emit_def(&def)?,
            None => s,
        },
        None => {
            // A spliced synapse leaves its parameters on the projection.
            job.emit_def(part)?
        }
    };

    let mut proj = Elem::new("projection")
        .with_attr("id", &part.id)
        .with_attr("presynapticPopulation", &a)
        .with_attr("postsynapticPopulation", &b)
        .with_attr("synapse", &synapse);

    let pairs = match part.variable("condition") {
        Some(mc) => {
            let mut ps = Vec::new();
            for clause in &mc.clauses {
                match &clause.condition {
                    Some(cond) => match Filter::from_boolean(cond) {
                        Ok(f) => ps.extend(f.pairs(na, nb)),
                        Err(e) => job
                            .report
                            .capture(&format!("Projection {} filter", part.id), e),
                    },
                    None => ps.extend(Filter::default().pairs(na, nb)),
                }
            }
            ps
        }
        None => Filter::default().pairs(na, nb),
    };

    let weight = part.quantity("weight").cloned();
    let delay = part.quantity("delay").cloned();
    for (n, (i, j)) in pairs.iter().enumerate() {
        let tag = if weight.is_some() || delay.is_some() {
            "connectionWD"
        } else {
            "connection"
        };
        let mut c = Elem::new(tag)
            .with_attr("id", &n.to_string())
            .with_attr("preCellId", &format!("../{}/{}/{}", a, i, a))
            .with_attr("postCellId", &format!("../{}/{}/{}", b, j, b));
        if let Some(w) = &weight {
            c.set_attr("weight", &w.value.to_string());
        }
        if let Some(d) = &delay {
            let v = job.quantity(d);
            c.set_attr("delay", &v);
        }
        proj.push(c);
    }
    Ok(proj)
}

fn explicit_input(job: &mut ExportJob, part: &Part) -> Result<Elem> {
    let source = match text_var(part, "source") {
        Some(s) => match job.lookup(&s).cloned() {
            Some(def) => job.emit_def(&def)?,
            None => s,
        },
        None => job.emit_def(part)?,
    };
    let target = text_var(part, "target")
        .ok_or_else(|| export_error(format!("Input {} lacks a target", part.id)))?;
    Ok(Elem::new("explicitInput")
        .with_attr("target", &target)
        .with_attr("input", &source))
}

fn population_size(net: &Part, job: &ExportJob, name: &str) -> i64 {
    if let Some(p) = net.children.get(name) {
        if let Some(q) = p.quantity("population") {
            return q.value as i64;
        }
    }
    if let Some(p) = job.lookup(name) {
        if let Some(q) = p.quantity("population") {
            return q.value as i64;
        }
    }
    1
}

fn text_var(part: &Part, name: &str) -> Option<String> {
    match part.variable(name)?.default_value()? {
        Value::Text(t) => Some(t.to_string()),
        _ => None,
    }
}
