use roxmltree::Node;
use tracing::{info, trace};

use crate::{
    error::{import_error, Result},
    expr::Boolean,
    part::{Clause, Combine, MultiClause, Part, Value},
    xml::{elements, req_attr},
};

use super::ImportJob;

/// External condition syntax uses dotted operators; rewrite to the internal
/// grammar before parsing.
pub fn boolean_from_external(s: &str) -> Result<Boolean> {
    let mut t = s.to_string();
    for (ext, int) in [
        (" .neq. ", " != "),
        (" .eq. ", " == "),
        (" .geq. ", " >= "),
        (" .leq. ", " <= "),
        (" .gt. ", " > "),
        (" .lt. ", " < "),
        (" .and. ", " && "),
        (" .or. ", " || "),
    ] {
        t = t.replace(ext, int);
    }
    Boolean::parse(&t)
}

pub fn boolean_to_external(b: &Boolean) -> String {
    let mut t = b.print_to_string();
    for (int, ext) in [
        (" != ", " .neq. "),
        (" == ", " .eq. "),
        (" >= ", " .geq. "),
        (" <= ", " .leq. "),
        (" > ", " .gt. "),
        (" < ", " .lt. "),
        (" && ", " .and. "),
        (" || ", " .or. "),
    ] {
        t = t.replace(int, ext);
    }
    t
}

/// Import a declarative component-type definition: constants, dynamics,
/// regimes and event wiring all land in one part with role componentType.
pub fn import_component_type(job: &mut ImportJob, node: &Node) -> Result<()> {
    let name = req_attr(node, "name")?;
    let mut part = Part::new(&name);
    part.set_meta(&["xml", "tag"], "ComponentType");
    part.set_meta(&["xml", "role"], "componentType");
    if let Some(base) = node.attribute("extends") {
        part.inherits.push(base.to_string());
        job.note_reference(base, &[name.to_string()], false);
        job.note_component_type_use(base);
    }
    for child in elements(node) {
        let tag = child.tag_name().name();
        let outcome = match tag {
            "Constant" => constant(job, &mut part, &child),
            "Parameter" | "Requirement" => {
                let n = req_attr(&child, "name")?;
                let kind = if tag == "Parameter" { "params" } else { "requires" };
                let d = child.attribute("dimension").unwrap_or("none");
                part.set_meta(&["xml", kind, &n], d);
                Ok(())
            }
            "Exposure" => {
                let n = req_attr(&child, "name")?;
                let d = child.attribute("dimension").unwrap_or("none");
                part.set_meta(&["xml", "exposures", &n], d);
                Ok(())
            }
            "EventPort" => {
                let n = req_attr(&child, "name")?;
                let d = child.attribute("direction").unwrap_or("in");
                part.set_meta(&["xml", "ports", &n], d);
                Ok(())
            }
            "Dynamics" => dynamics(job, &mut part, &child),
            t => {
                trace!("Ignoring <{}> in ComponentType {}", t, name);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            job.report
                .capture(&format!("<{}> in ComponentType {}", tag, name), e);
        }
    }
    info!("Imported component type {}", name);
    job.parts.insert(name, part);
    Ok(())
}

fn constant(job: &mut ImportJob, part: &mut Part, node: &Node) -> Result<()> {
    let n = req_attr(node, "name")?;
    let v = req_attr(node, "value")?;
    part.set_variable(
        &n,
        MultiClause::quantity(super::parse_quantity(&v, &mut job.report)),
    );
    Ok(())
}

fn dynamics(job: &mut ImportJob, part: &mut Part, node: &Node) -> Result<()> {
    let mut whens = 0usize;
    for child in elements(node) {
        let tag = child.tag_name().name();
        let outcome = match tag {
            "StateVariable" => {
                let n = req_attr(&child, "name")?;
                if let Some(d) = child.attribute("dimension") {
                    part.set_meta(&["xml", "state", &n], d);
                } else {
                    part.set_meta(&["xml", "state", &n], "none");
                }
                Ok(())
            }
            "DerivedVariable" => derived_variable(part, &child),
            "ConditionalDerivedVariable" => conditional_derived(part, &child),
            "TimeDerivative" => {
                let v = req_attr(&child, "variable")?;
                let e = req_attr(&child, "value")?;
                part.set_variable(
                    &format!("{}'", v),
                    MultiClause::constant(Value::parse(&e)),
                );
                Ok(())
            }
            "OnStart" => {
                for sa in elements(&child).filter(|n| n.tag_name().name() == "StateAssignment") {
                    let v = req_attr(&sa, "variable")?;
                    let e = req_attr(&sa, "value")?;
                    part.set_variable(&v, MultiClause::constant(Value::parse(&e)));
                }
                Ok(())
            }
            "OnEvent" => {
                let port = req_attr(&child, "port")?;
                let sub = event_handler(&child, &format!("on_{}", port), "event")?;
                part.children.insert(sub.id.to_string(), sub);
                Ok(())
            }
            "OnCondition" => {
                whens += 1;
                let test = req_attr(&child, "test")?;
                let mut sub = event_handler(&child, &format!("when_{}", whens), "condition")?;
                let cond = boolean_from_external(&test)?;
                sub.set_variable(
                    "test",
                    MultiClause {
                        clauses: vec![Clause {
                            condition: Some(cond),
                            value: Value::Quantity(crate::expr::Quantity::number(1.0)),
                        }],
                        combine: Combine::Replace,
                    },
                );
                part.children.insert(sub.id.to_string(), sub);
                Ok(())
            }
            "Regime" => regime(part, &child),
            t => {
                trace!("Ignoring <{}> in Dynamics", t);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            job.report.capture(&format!("<{}> in Dynamics", tag), e);
        }
    }
    Ok(())
}

fn derived_variable(part: &mut Part, node: &Node) -> Result<()> {
    let n = req_attr(node, "name")?;
    if let Some(sel) = node.attribute("select") {
        let combine = match node.attribute("reduce") {
            Some("add") => Combine::Add,
            Some("multiply") => Combine::Multiply,
            None => Combine::Replace,
            Some(x) => return Err(import_error(format!("Unknown reduction {}", x))),
        };
        part.set_variable(
            &n,
            MultiClause {
                clauses: vec![Clause {
                    condition: None,
                    value: Value::Text(sel.to_string()),
                }],
                combine,
            },
        );
    } else if let Some(v) = node.attribute("value") {
        part.set_variable(&n, MultiClause::constant(Value::parse(v)));
    } else {
        return Err(import_error(format!("Derived variable {} has no value", n)));
    }
    Ok(())
}

fn conditional_derived(part: &mut Part, node: &Node) -> Result<()> {
    let n = req_attr(node, "name")?;
    let mut clauses = Vec::new();
    for case in elements(node).filter(|c| c.tag_name().name() == "Case") {
        let value = Value::parse(&req_attr(&case, "value")?);
        let condition = match case.attribute("condition") {
            Some(c) => Some(boolean_from_external(c)?),
            None => None,
        };
        clauses.push(Clause { condition, value });
    }
    let mc = MultiClause {
        clauses,
        combine: Combine::Replace,
    };
    mc.check()?;
    part.set_variable(&n, mc);
    Ok(())
}

fn event_handler(node: &Node, id: &str, role: &str) -> Result<Part> {
    let mut sub = Part::new(id);
    sub.set_meta(&["xml", "role"], role);
    for item in elements(node) {
        match item.tag_name().name() {
            "StateAssignment" => {
                let v = req_attr(&item, "variable")?;
                let e = req_attr(&item, "value")?;
                sub.set_variable(&v, MultiClause::constant(Value::parse(&e)));
            }
            "EventOut" => {
                let p = req_attr(&item, "port")?;
                sub.set_meta(&["xml", "emits"], &p);
            }
            "Transition" => {
                let r = req_attr(&item, "regime")?;
                sub.set_meta(&["xml", "transition"], &r);
            }
            t => trace!("Ignoring <{}> in event handler {}", t, id),
        }
    }
    Ok(sub)
}

fn regime(part: &mut Part, node: &Node) -> Result<()> {
    let name = req_attr(node, "name")?;
    let mut sub = Part::new(&name);
    sub.set_meta(&["xml", "role"], "regime");
    if node.attribute("initial") == Some("true") {
        sub.set_meta(&["xml", "initial"], "true");
    }
    let mut whens = 0usize;
    for item in elements(node) {
        match item.tag_name().name() {
            "TimeDerivative" => {
                let v = req_attr(&item, "variable")?;
                let e = req_attr(&item, "value")?;
                sub.set_variable(&format!("{}'", v), MultiClause::constant(Value::parse(&e)));
            }
            "OnEntry" => {
                for sa in elements(&item).filter(|n| n.tag_name().name() == "StateAssignment") {
                    let v = req_attr(&sa, "variable")?;
                    let e = req_attr(&sa, "value")?;
                    sub.set_variable(&v, MultiClause::constant(Value::parse(&e)));
                }
            }
            "OnCondition" => {
                whens += 1;
                let test = req_attr(&item, "test")?;
                let mut h = event_handler(&item, &format!("when_{}", whens), "condition")?;
                let cond = boolean_from_external(&test)?;
                h.set_variable(
                    "test",
                    MultiClause {
                        clauses: vec![Clause {
                            condition: Some(cond),
                            value: Value::Quantity(crate::expr::Quantity::number(1.0)),
                        }],
                        combine: Combine::Replace,
                    },
                );
                sub.children.insert(h.id.to_string(), h);
            }
            t => trace!("Ignoring <{}> in regime {}", t, name),
        }
    }
    part.children.insert(name, sub);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn external_boolean_syntax() {
        let b = boolean_from_external("v .gt. 10 .and. t .leq. 5").unwrap();
        assert_eq!(b.print_to_string(), "v > 10 && t <= 5");
        assert_eq!(boolean_to_external(&b), "v .gt. 10 .and. t .leq. 5");
    }
}
