use tracing::trace;

use crate::{
    element::Elem,
    error::Result,
    expr::Quantity,
    import::dynamics::boolean_to_external,
    part::{Combine, MultiClause, Node, Part, Value},
    units,
};

use super::ExportJob;

/// Variables that bind structure or carry per-connection overrides; never
/// serialized as attributes of a generic component.
const STRUCTURAL: [&str; 10] = [
    "A",
    "B",
    "via",
    "of",
    "condition",
    "population",
    "source",
    "target",
    "weight",
    "delay",
];

/// Serialize a part not covered by a specialised exporter: constant fields
/// map onto attributes, anything richer (expressions, clauses, regimes,
/// event wiring) triggers a generated declarative component type.
pub fn export_generic(job: &mut ExportJob, part: &Part) -> Result<Elem> {
    let tag = job.tag_of(part);
    if part.xml_role() == Some("componentType") || tag == "ComponentType" {
        let ct = component_type_elem(job, part)?;
        job.ctypes.push(ct.clone());
        return Ok(ct);
    }
    let part_type = job.part_type_of(part);
    let mut elem = Elem::new(&tag);
    if job.seq.has_id(&tag) {
        // The original external identifier survives a round trip.
        elem.set_attr("id", part.original_id().unwrap_or(&part.id));
    }
    if let Some(notes) = part.meta(&["notes"]) {
        elem.push(Elem::new("notes").with_text(notes));
    }

    let mut needs_type = false;
    for (name, mc) in &part.variables {
        if STRUCTURAL.contains(&name.as_str()) {
            continue;
        }
        if name.ends_with('\'') {
            needs_type = true;
            continue;
        }
        match mc.default_value() {
            Some(Value::Quantity(q)) if mc.combine == Combine::Replace => {
                let ext = external_name(job, &part_type, name, &tag);
                let v = job.quantity(q);
                elem.set_attr(&ext, &v);
            }
            Some(Value::Text(t)) if mc.combine == Combine::Replace => {
                let ext = external_name(job, &part_type, name, &tag);
                elem.set_attr(&ext, t);
            }
            _ => {
                // Expression-valued override or a multi-clause equation.
                needs_type = true;
            }
        }
    }
    needs_type |= part.children.values().any(|c| {
        matches!(
            c.xml_role(),
            Some("event") | Some("condition") | Some("regime")
        )
    });
    needs_type |= part.metadata.get(&["xml", "exposures"]).is_some()
        || part.metadata.get(&["xml", "state"]).is_some()
        || part.metadata.get(&["xml", "ports"]).is_some();

    for child in part.children.values() {
        match child.xml_role() {
            Some("event") | Some("condition") | Some("regime") | None => {}
            Some(_) if job.catalog.entry(child.inherits.first().map(|s| s.as_str()).unwrap_or("")).is_some() => {
                // Nested catalog parts (gates and the like) serialize as
                // nested elements.
                match export_generic(job, child) {
                    Ok(e) => elem.push(e),
                    Err(e) => job
                        .report
                        .capture(&format!("{} in {}", child.id, part.id), e),
                }
            }
            Some(r) => trace!("Leaving {} ({}) to the component type", child.id, r),
        }
    }

    if needs_type {
        let ct = component_type_elem(job, part)?;
        let name = ct
            .attr("name")
            .unwrap_or("generatedType")
            .to_string();
        job.ctypes.push(ct);
        elem.set_attr("type", &name);
    }
    Ok(elem)
}

fn external_name(
    job: &ExportJob,
    part_type: &Option<String>,
    internal: &str,
    tag: &str,
) -> String {
    match part_type {
        Some(t) => job.catalog.export_name(t, internal, Some(tag)),
        None => internal.to_string(),
    }
}

/// Inter-part references use dotted paths internally; the declarative
/// format wants slash-separated selectors.
fn render_selector(path: &str) -> String {
    path.replace('.', "/")
}

fn dimension_of(q: &Quantity) -> String {
    q.unit
        .as_deref()
        .and_then(|u| units::table().unit(u))
        .map(|u| u.dimension.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Generate the declarative component-type definition capturing a part's
/// extra dynamics: constants, state variables with derivatives, derived and
/// conditional variables, regimes, and event wiring.
pub fn component_type_elem(job: &mut ExportJob, part: &Part) -> Result<Elem> {
    let name = if part.xml_role() == Some("componentType") {
        part.id.to_string()
    } else {
        format!("{}_type", part.id)
    };
    let mut ct = Elem::new("ComponentType").with_attr("name", &name);
    if let Some(base) = part.inherits.iter().find(|s| job.lookup(s).is_some()) {
        ct.set_attr("extends", base);
    }

    for (kind, tag) in [("params", "Parameter"), ("requires", "Requirement")] {
        if let Some(Node::Tree(m)) = part.metadata.get(&["xml", kind]) {
            for (n, d) in m {
                let mut e = Elem::new(tag).with_attr("name", n);
                if let Node::Leaf(d) = d {
                    if d != "none" {
                        e.set_attr("dimension", d);
                    }
                }
                ct.push(e);
            }
        }
    }
    if let Some(Node::Tree(m)) = part.metadata.get(&["xml", "exposures"]) {
        for (n, d) in m {
            let mut e = Elem::new("Exposure").with_attr("name", n);
            if let Node::Leaf(d) = d {
                if d != "none" {
                    e.set_attr("dimension", d);
                }
            }
            ct.push(e);
        }
    }
    if let Some(Node::Tree(m)) = part.metadata.get(&["xml", "ports"]) {
        for (n, d) in m {
            let direction = match d {
                Node::Leaf(d) => d.as_str(),
                _ => "in",
            };
            ct.push(
                Elem::new("EventPort")
                    .with_attr("name", n)
                    .with_attr("direction", direction),
            );
        }
    }

    // For a generic component the constants already sit on the element as
    // attributes; only an authored component type declares them here.
    let declare_constants = part.xml_role() == Some("componentType");

    let states = state_variables(part);
    let mut dynamics = Elem::new("Dynamics");
    for s in &states {
        let mut e = Elem::new("StateVariable").with_attr("name", s);
        if let Some(d) = part.meta(&["xml", "state", s]) {
            if d != "none" {
                e.set_attr("dimension", d);
            }
        }
        dynamics.push(e);
    }

    let mut on_start = Vec::new();
    for (vname, mc) in &part.variables {
        if STRUCTURAL.contains(&vname.as_str()) {
            continue;
        }
        if let Some(base) = vname.strip_suffix('\'') {
            // Derivative equation for a state variable.
            if let Some(v) = mc.default_value() {
                dynamics.push(
                    Elem::new("TimeDerivative")
                        .with_attr("variable", base)
                        .with_attr("value", &render_value(v)),
                );
            }
            continue;
        }
        if states.contains(vname) {
            // Initial value lands in OnStart.
            if let Some(v) = mc.default_value() {
                on_start.push(
                    Elem::new("StateAssignment")
                        .with_attr("variable", vname)
                        .with_attr("value", &render_value(v)),
                );
            }
            continue;
        }
        match variable_kind(mc) {
            Kind::Constant(v) => {
                if declare_constants {
                    let mut e = Elem::new("Constant")
                        .with_attr("name", vname)
                        .with_attr("value", &v.to_string());
                    let d = dimension_of(&v);
                    if d != "none" {
                        e.set_attr("dimension", &d);
                    }
                    ct.push(e);
                }
            }
            Kind::Select(sel, reduce) => {
                let mut e = Elem::new("DerivedVariable")
                    .with_attr("name", vname)
                    .with_attr("select", &render_selector(&sel));
                if let Some(r) = reduce {
                    e.set_attr("reduce", r);
                }
                dynamics.push(e);
            }
            Kind::Derived(v) => {
                dynamics.push(
                    Elem::new("DerivedVariable")
                        .with_attr("name", vname)
                        .with_attr("value", &v),
                );
            }
            Kind::Conditional => {
                let mut e = Elem::new("ConditionalDerivedVariable").with_attr("name", vname);
                for clause in &mc.clauses {
                    let mut case =
                        Elem::new("Case").with_attr("value", &render_value(&clause.value));
                    if let Some(c) = &clause.condition {
                        case.set_attr("condition", &boolean_to_external(c));
                    }
                    e.push(case);
                }
                dynamics.push(e);
            }
        }
    }
    if !on_start.is_empty() {
        let mut e = Elem::new("OnStart");
        for sa in on_start {
            e.push(sa);
        }
        dynamics.push(e);
    }

    for child in part.children.values() {
        match child.xml_role() {
            Some("event") => dynamics.push(event_elem(child, "OnEvent")),
            Some("condition") => dynamics.push(condition_elem(child)),
            Some("regime") => dynamics.push(regime_elem(child)),
            _ => {}
        }
    }

    if !dynamics.children.is_empty() {
        ct.push(dynamics);
    }
    Ok(ct)
}

/// State variables are those with a derivative equation or declared in the
/// recorded state table.
fn state_variables(part: &Part) -> Vec<String> {
    let mut states = Vec::new();
    if let Some(Node::Tree(m)) = part.metadata.get(&["xml", "state"]) {
        states.extend(m.keys().cloned());
    }
    for name in part.variables.keys() {
        if let Some(base) = name.strip_suffix('\'') {
            if !states.iter().any(|s| s == base) {
                states.push(base.to_string());
            }
        }
    }
    states
}

enum Kind {
    Constant(Quantity),
    Derived(String),
    Conditional,
    Select(String, Option<&'static str>),
}

fn variable_kind(mc: &MultiClause) -> Kind {
    let reduce = match mc.combine {
        Combine::Add => Some("add"),
        Combine::Multiply => Some("multiply"),
        Combine::Replace => None,
    };
    match mc.default_value() {
        Some(Value::Quantity(q)) if reduce.is_none() => Kind::Constant(q.clone()),
        Some(Value::Text(t)) => Kind::Select(t.to_string(), reduce),
        Some(Value::Expr(e)) if reduce.is_none() => Kind::Derived(e.print_to_string()),
        _ if mc.clauses.len() > 1 => Kind::Conditional,
        Some(v) => Kind::Derived(render_value(v)),
        None => Kind::Conditional,
    }
}

fn render_value(v: &Value) -> String {
    match v {
        Value::Expr(e) => e.print_to_string(),
        Value::Quantity(q) => q.to_string(),
        Value::Text(t) => render_selector(t),
    }
}

fn event_elem(part: &Part, tag: &str) -> Elem {
    let port = part.id.strip_prefix("on_").unwrap_or(&part.id);
    let mut e = Elem::new(tag).with_attr("port", port);
    push_assignments(&mut e, part);
    e
}

fn condition_elem(part: &Part) -> Elem {
    let test = part
        .variable("test")
        .and_then(|mc| mc.clauses.first().and_then(|c| c.condition.clone()))
        .map(|b| boolean_to_external(&b))
        .unwrap_or_default();
    let mut e = Elem::new("OnCondition").with_attr("test", &test);
    push_assignments(&mut e, part);
    e
}

fn push_assignments(e: &mut Elem, part: &Part) {
    for (v, mc) in &part.variables {
        if v == "test" {
            continue;
        }
        if let Some(val) = mc.default_value() {
            e.push(
                Elem::new("StateAssignment")
                    .with_attr("variable", v)
                    .with_attr("value", &render_value(val)),
            );
        }
    }
    if let Some(p) = part.meta(&["xml", "emits"]) {
        e.push(Elem::new("EventOut").with_attr("port", p));
    }
    if let Some(r) = part.meta(&["xml", "transition"]) {
        e.push(Elem::new("Transition").with_attr("regime", r));
    }
}

fn regime_elem(part: &Part) -> Elem {
    let mut e = Elem::new("Regime").with_attr("name", &part.id);
    if part.meta(&["xml", "initial"]) == Some("true") {
        e.set_attr("initial", "true");
    }
    let mut entry = Vec::new();
    for (v, mc) in &part.variables {
        if let Some(base) = v.strip_suffix('\'') {
            if let Some(val) = mc.default_value() {
                e.push(
                    Elem::new("TimeDerivative")
                        .with_attr("variable", base)
                        .with_attr("value", &render_value(val)),
                );
            }
        } else if let Some(val) = mc.default_value() {
            entry.push(
                Elem::new("StateAssignment")
                    .with_attr("variable", v)
                    .with_attr("value", &render_value(val)),
            );
        }
    }
    if !entry.is_empty() {
        let mut oe = Elem::new("OnEntry");
        for sa in entry {
            oe.push(sa);
        }
        e.push(oe);
    }
    for child in part.children.values() {
        if child.xml_role() == Some("condition") {
            e.push(condition_elem(child));
        }
    }
    e
}
