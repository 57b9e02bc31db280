use nmlio::import::{import_str, Disposition};
use nmlio::part::Value;

use pretty_assertions::assert_eq;

#[test]
fn synapse_used_once_is_merged_and_removed() {
    let imp = import_str(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<neuroml id="doc">
  <expTwoSynapse id="syn" gbase="1 nS" erev="0 mV" tauRise="1 ms" tauDecay="5 ms"/>
  <network id="net">
    <population id="popA" component="cellA" size="2"/>
    <population id="popB" component="cellA" size="2"/>
    <projection id="p0" presynapticPopulation="popA" postsynapticPopulation="popB" synapse="syn"/>
  </network>
</neuroml>"#,
    )
    .unwrap();
    assert_eq!(imp.dispositions["syn"], Disposition::MergeOnce);
    assert!(!imp.parts.contains_key("syn"));
    let proj = &imp.parts["net"].children["p0"];
    // The synapse parameters were spliced in under internal names and the
    // dangling pointer dropped.
    assert!(proj.variable("gmax").is_some());
    assert!(proj.variable("rise").is_some());
    assert!(proj.variable("via").is_none());
}

#[test]
fn light_shared_channel_is_merged_everywhere() {
    let cell = |id: &str| {
        format!(
            r#"<cell id="{}">
    <morphology id="m_{}">
      <segment id="0"><proximal x="0" y="0" z="0" diameter="10"/><distal x="10" y="0" z="0" diameter="10"/></segment>
    </morphology>
    <biophysicalProperties id="b_{}">
      <membraneProperties>
        <channelDensity id="pas" ionChannel="leak" condDensity="0.3 mS_per_cm2" erev="-54 mV"/>
      </membraneProperties>
    </biophysicalProperties>
  </cell>"#,
            id, id, id
        )
    };
    let doc = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<neuroml id="doc">
  <ionChannel id="leak" conductance="10 pS"/>
  {}
  {}
  {}
</neuroml>"#,
        cell("c0"),
        cell("c1"),
        cell("c2")
    );
    let imp = import_str(&doc).unwrap();
    assert_eq!(imp.dispositions["leak"], Disposition::MergeEverywhere);
    assert!(!imp.parts.contains_key("leak"));
    for c in ["c0", "c1", "c2"] {
        let dep = &imp.parts[c].children["group_0"].children["pas"];
        assert!(dep.variable("conductance").is_some());
        assert!(dep.variable("density").is_some());
    }
}

#[test]
fn heavy_shared_channel_is_promoted() {
    let cell = |id: &str| {
        format!(
            r#"<cell id="{}">
    <morphology id="m_{}">
      <segment id="0"><proximal x="0" y="0" z="0" diameter="10"/><distal x="10" y="0" z="0" diameter="10"/></segment>
    </morphology>
    <biophysicalProperties id="b_{}">
      <membraneProperties>
        <channelDensity id="na" ionChannel="naChan" condDensity="100 mS_per_cm2"/>
      </membraneProperties>
    </biophysicalProperties>
  </cell>"#,
            id, id, id
        )
    };
    let doc = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<neuroml id="doc">
  <ionChannel id="naChan" conductance="10 pS">
    <gateHHrates id="m" instances="3"/>
  </ionChannel>
  {}
  {}
  {}
</neuroml>"#,
        cell("c0"),
        cell("c1"),
        cell("c2")
    );
    let imp = import_str(&doc).unwrap();
    assert_eq!(imp.dispositions["naChan"], Disposition::Promote);
    // The definition stays separately addressable and referrers point to it
    // by name.
    let def = &imp.parts["naChan"];
    assert_eq!(def.meta(&["xml", "promoted"]), Some("true"));
    assert!(def.children.contains_key("m"));
    for c in ["c0", "c1", "c2"] {
        let dep = &imp.parts[c].children["group_0"].children["na"];
        assert!(dep.inherits.iter().any(|s| s == "naChan"));
    }
}

#[test]
fn component_type_use_promotes_its_base() {
    let imp = import_str(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<neuroml id="doc">
  <expTwoSynapse id="base" gbase="1 nS" erev="0 mV" tauRise="1 ms" tauDecay="5 ms"/>
  <ComponentType name="myType" extends="base">
    <Constant name="kTemp" value="37"/>
  </ComponentType>
</neuroml>"#,
    )
    .unwrap();
    assert_eq!(imp.dispositions["base"], Disposition::Promote);
    assert!(imp.parts.contains_key("base"));
    assert!(imp.parts["myType"].variable("kTemp").is_some());
}

#[test]
fn single_consumer_input_source_is_fused() {
    let imp = import_str(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<neuroml id="doc">
  <pulseGenerator id="stim" delay="10 ms" duration="100 ms" amplitude="0.1 nA"/>
  <network id="net">
    <population id="pop" component="cellA" size="1"/>
    <explicitInput target="pop" input="stim"/>
  </network>
</neuroml>"#,
    )
    .unwrap();
    assert!(!imp.parts.contains_key("stim"));
    let input = &imp.parts["net"].children["input_1"];
    // delay/duration arrive under their internal names
    assert!(input.variable("start").is_some());
    assert!(input.variable("width").is_some());
    assert!(input.variable("amplitude").is_some());
}

#[test]
fn cell_shared_by_populations_is_retained() {
    let imp = import_str(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<neuroml id="doc">
  <cell id="c0">
    <morphology id="m0">
      <segment id="0"><proximal x="0" y="0" z="0" diameter="10"/><distal x="10" y="0" z="0" diameter="10"/></segment>
    </morphology>
    <biophysicalProperties id="b0">
      <membraneProperties>
        <specificCapacitance value="1 uF_per_cm2"/>
      </membraneProperties>
    </biophysicalProperties>
  </cell>
  <network id="net">
    <population id="popA" component="c0" size="3"/>
    <population id="popB" component="c0" size="2"/>
  </network>
</neuroml>"#,
    )
    .unwrap();
    assert_eq!(imp.dispositions["c0"], Disposition::Retain);
    assert!(imp.parts.contains_key("c0"));
    let pop = &imp.parts["net"].children["popA"];
    assert!(pop.inherits.iter().any(|s| s == "c0"));
    assert_eq!(pop.quantity("population").unwrap().value, 3.0);
}

#[test]
fn two_segment_cell_partitions_into_two_groups() {
    let imp = import_str(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<neuroml id="doc">
  <ionChannel id="naChan" conductance="10 pS"/>
  <ionChannel id="kChan" conductance="10 pS"/>
  <cell id="cc">
    <morphology id="m">
      <segment id="0" name="soma">
        <proximal x="0" y="0" z="0" diameter="10"/>
        <distal x="10" y="0" z="0" diameter="10"/>
      </segment>
      <segment id="1" name="dend">
        <parent segment="0"/>
        <distal x="30" y="0" z="0" diameter="2"/>
      </segment>
    </morphology>
    <biophysicalProperties id="b">
      <membraneProperties>
        <channelDensity id="na" ionChannel="naChan" condDensity="100 mS_per_cm2" segment="0"/>
        <channelDensity id="k" ionChannel="kChan" condDensity="30 mS_per_cm2" segment="1"/>
      </membraneProperties>
    </biophysicalProperties>
  </cell>
</neuroml>"#,
    )
    .unwrap();
    let cell = &imp.parts["cc"];
    // Two merged groups, one per segment, population 1 each.
    let groups: Vec<_> = cell
        .children
        .values()
        .filter(|c| c.xml_role() == Some("segment"))
        .collect();
    assert_eq!(groups.len(), 2);
    for g in &groups {
        assert_eq!(g.quantity("population").unwrap().value, 1.0);
    }
    // One coupling with no filter condition since both ends are singletons.
    let couplings: Vec<_> = cell
        .children
        .values()
        .filter(|c| c.xml_role() == Some("coupling"))
        .collect();
    assert_eq!(couplings.len(), 1);
    assert!(couplings[0].variable("condition").is_none());
    assert!(matches!(
        couplings[0].variable("A").unwrap().default_value(),
        Some(Value::Text(_))
    ));
    // Each group carries its own channel placement.
    assert!(cell.children["group_0"].children.contains_key("na"));
    assert!(cell.children["group_1"].children.contains_key("k"));
}

#[test]
fn malformed_elements_degrade_into_report_entries() {
    let imp = import_str(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<neuroml id="doc">
  <cell id="broken"/>
  <expTwoSynapse id="ok" gbase="1 nS" erev="0 mV" tauRise="1 ms" tauDecay="5 ms"/>
</neuroml>"#,
    )
    .unwrap();
    // The broken cell is reported, the rest of the job continues.
    assert!(!imp.report.errors().is_empty());
    assert!(imp.parts.contains_key("ok"));
    assert!(!imp.parts.contains_key("broken"));
}
