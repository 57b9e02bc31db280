use nmlio::{
    expr::{Expr, Quantity},
    export::export_model,
    part::{Clause, Combine, MultiClause, Part, Value},
    Map,
};

use pretty_assertions::assert_eq;

fn quantity(v: f64, u: &str) -> MultiClause {
    MultiClause::quantity(Quantity {
        value: v,
        unit: Some(u.to_string()),
    })
}

fn synapse(id: &str) -> Part {
    let mut p = Part::with_inherits(id, &["Synapse"]);
    p.set_meta(&["xml", "tag"], "expTwoSynapse");
    p.set_meta(&["xml", "role"], "synapse");
    p.set_variable("gmax", quantity(1.0, "nS"));
    p.set_variable("reversal", quantity(0.0, "mV"));
    p.set_variable("rise", quantity(1.0, "ms"));
    p.set_variable("decay", quantity(5.0, "ms"));
    p
}

fn spike_source(id: &str) -> Part {
    let mut p = Part::with_inherits(id, &["SpikeSource"]);
    p.set_meta(&["xml", "tag"], "spikeGenerator");
    p.set_meta(&["xml", "role"], "input");
    p.set_variable("interval", quantity(20.0, "ms"));
    p
}

fn population(id: &str, component: &str, size: f64) -> Part {
    let mut p = Part::with_inherits(id, &[component]);
    p.set_meta(&["xml", "role"], "population");
    p.set_variable("population", MultiClause::quantity(Quantity::number(size)));
    p
}

fn projection(id: &str, a: &str, b: &str, via: &str) -> Part {
    let mut p = Part::new(id);
    p.set_meta(&["xml", "role"], "projection");
    p.set_variable("A", MultiClause::text(a));
    p.set_variable("B", MultiClause::text(b));
    p.set_variable("via", MultiClause::text(via));
    p
}

fn network(children: Vec<Part>) -> Part {
    let mut net = Part::new("net");
    net.set_meta(&["xml", "role"], "network");
    for c in children {
        net.children.insert(c.id.to_string(), c);
    }
    net
}

#[test]
fn structurally_identical_synapses_deduplicate() {
    let mut library = Map::new();
    library.insert("syn1".to_string(), synapse("syn1"));
    library.insert("syn2".to_string(), synapse("syn2"));
    library.insert("gen".to_string(), spike_source("gen"));

    let net = network(vec![
        population("popA", "gen", 1.0),
        population("popB", "gen", 1.0),
        projection("p0", "popA", "popB", "syn1"),
        projection("p1", "popA", "popB", "syn2"),
    ]);

    let out = export_model(&net, &library).unwrap();
    assert_eq!(out.files.len(), 1);
    let doc = &out.files[0].content;
    // One emitted synapse element, referenced from both projections.
    assert_eq!(doc.matches("<expTwoSynapse").count(), 1);
    assert_eq!(doc.matches("synapse=\"syn1\"").count(), 2);
    // The spike source also deduplicates across the two populations.
    assert_eq!(doc.matches("<spikeGenerator").count(), 1);
}

#[test]
fn filterless_connection_unpacks_to_full_product() {
    let mut library = Map::new();
    library.insert("syn1".to_string(), synapse("syn1"));
    library.insert("gen".to_string(), spike_source("gen"));

    let net = network(vec![
        population("popA", "gen", 2.0),
        population("popB", "gen", 2.0),
        projection("p0", "popA", "popB", "syn1"),
    ]);

    let out = export_model(&net, &library).unwrap();
    let doc = &out.files[0].content;
    assert_eq!(doc.matches("<connection ").count(), 4);
    assert!(doc.contains("preCellId=\"../popA/0/popA\""));
    assert!(doc.contains("preCellId=\"../popA/1/popA\""));
    assert!(doc.contains("postCellId=\"../popB/1/popB\""));
}

#[test]
fn filtered_connection_unpacks_to_single_pair() {
    let mut library = Map::new();
    library.insert("syn1".to_string(), synapse("syn1"));
    library.insert("gen".to_string(), spike_source("gen"));

    let mut proj = projection("p0", "popA", "popB", "syn1");
    let cond = nmlio::expr::Filter {
        a: Some(1),
        b: Some(0),
    }
    .to_boolean()
    .unwrap();
    proj.set_variable(
        "condition",
        MultiClause {
            clauses: vec![Clause {
                condition: Some(cond),
                value: Value::Quantity(Quantity::number(1.0)),
            }],
            combine: Combine::Replace,
        },
    );
    let net = network(vec![
        population("popA", "gen", 3.0),
        population("popB", "gen", 3.0),
        proj,
    ]);

    let out = export_model(&net, &library).unwrap();
    let doc = &out.files[0].content;
    assert_eq!(doc.matches("<connection ").count(), 1);
    assert!(doc.contains("preCellId=\"../popA/1/popA\""));
    assert!(doc.contains("postCellId=\"../popB/0/popB\""));
}

#[test]
fn shared_definitions_precede_the_network_in_schema_order() {
    let mut library = Map::new();
    library.insert("syn1".to_string(), synapse("syn1"));
    library.insert("gen".to_string(), spike_source("gen"));

    let net = network(vec![
        population("popA", "gen", 1.0),
        population("popB", "gen", 1.0),
        projection("p0", "popA", "popB", "syn1"),
    ]);

    let out = export_model(&net, &library).unwrap();
    let doc = &out.files[0].content;
    let syn_at = doc.find("<expTwoSynapse").unwrap();
    let gen_at = doc.find("<spikeGenerator").unwrap();
    let net_at = doc.find("<network").unwrap();
    assert!(syn_at < net_at);
    assert!(gen_at < net_at);
}

#[test]
fn expression_override_generates_component_type() {
    let mut gen = Part::with_inherits("gen", &["PulseSource"]);
    gen.set_meta(&["xml", "role"], "input");
    gen.set_variable("start", quantity(10.0, "ms"));
    gen.set_variable("width", quantity(100.0, "ms"));
    gen.set_variable(
        "amplitude",
        MultiClause::constant(Value::Expr(Expr::parse("0.1 * noise").unwrap())),
    );
    let library = Map::new();

    let out = export_model(&gen, &library).unwrap();
    // Declarative types force the four-document layout with a target.
    assert_eq!(out.files.len(), 4);
    let main = out
        .files
        .iter()
        .find(|f| f.name == "gen.xml")
        .expect("primary LEMS document");
    assert!(main.content.contains("<ComponentType name=\"gen_type\""));
    assert!(main.content.contains("<Target"));
    assert!(main.content.contains("<Include file=\"gen_cells.nml\""));
    let net = out.files.iter().find(|f| f.name == "gen_net.nml").unwrap();
    // Constant fields stay attributes under their external names.
    assert!(net.content.contains("delay=\"10 ms\""));
    assert!(net.content.contains("type=\"gen_type\""));
}

#[test]
fn unit_negotiation_rescales_attribute_values() {
    let mut syn = synapse("syn1");
    // 0.0001 s should come out as 0.1 ms, not stay in seconds.
    syn.set_variable("rise", quantity(0.0001, "s"));
    let mut library = Map::new();
    library.insert("syn1".to_string(), syn);
    library.insert("gen".to_string(), spike_source("gen"));

    let net = network(vec![
        population("popA", "gen", 1.0),
        population("popB", "gen", 1.0),
        projection("p0", "popA", "popB", "syn1"),
    ]);

    let out = export_model(&net, &library).unwrap();
    let doc = &out.files[0].content;
    assert!(doc.contains("tauRise=\"0.1 ms\""));
}

#[test]
fn export_failure_in_one_subtree_keeps_the_rest() {
    let mut library = Map::new();
    library.insert("gen".to_string(), spike_source("gen"));

    let mut bad = Part::new("bad");
    bad.set_meta(&["xml", "role"], "projection"); // lacks endpoints
    let net = network(vec![population("popA", "gen", 1.0), bad]);

    let out = export_model(&net, &library).unwrap();
    assert!(!out.report.errors().is_empty());
    let doc = &out.files[0].content;
    assert!(doc.contains("<population"));
}
