use serde::{Deserialize, Serialize};

use crate::{
    error::{model_error, Result},
    matrix::BooleanIncidenceMatrix,
    Map,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub d: f64,
}

/// Node of the strictly tree-shaped compartment hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub name: Option<String>,
    pub parent: Option<i64>,
    pub fraction_along: f64,
    pub proximal: Option<Point>,
    pub distal: Point,
}

/// Scope of one property declaration before partitioning.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    All,
    Group(String),
    One(i64),
}

/// A named property (membrane parameter, channel placement, concentration
/// model) attached to a subset of segments.
#[derive(Debug, Clone)]
pub struct PropertyColumn {
    pub name: String,
    pub scope: Scope,
}

/// Maximal subset of segments sharing an identical property pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedGroup {
    pub name: String,
    /// original segment ids, in declaration order; index in this list is
    /// the member's index within the group's population
    pub segments: Vec<i64>,
    /// indices into the property list that apply to every member
    pub properties: Vec<usize>,
}

/// Result of the shared segment/property partitioning pass.
#[derive(Debug, Clone)]
pub struct Partition {
    pub groups: Vec<MergedGroup>,
    /// per declared group, which merged groups its members landed in
    pub declared_spans: Map<String, Vec<usize>>,
}

/// Finalize an imported tree: every segment missing a proximal point takes
/// it from its parent, interpolated to the attachment fraction.
pub fn propagate_proximal(segments: &mut [Segment]) -> Result<()> {
    let by_id: Map<i64, Segment> = segments.iter().map(|s| (s.id, s.clone())).collect();
    for seg in segments.iter_mut() {
        if seg.proximal.is_some() {
            continue;
        }
        let pid = match seg.parent {
            Some(p) => p,
            None => {
                return Err(model_error(format!(
                    "Root segment {} lacks a proximal point",
                    seg.id
                )))
            }
        };
        let parent = by_id
            .get(&pid)
            .ok_or_else(|| model_error(format!("Segment {} has unknown parent {}", seg.id, pid)))?;
        let f = seg.fraction_along;
        let p = match (parent.proximal, f) {
            (_, f) if (f - 1.0).abs() < f64::EPSILON => parent.distal,
            (Some(pp), f) => Point {
                x: pp.x + (parent.distal.x - pp.x) * f,
                y: pp.y + (parent.distal.y - pp.y) * f,
                z: pp.z + (parent.distal.z - pp.z) * f,
                d: pp.d + (parent.distal.d - pp.d) * f,
            },
            (None, _) => parent.distal,
        };
        seg.proximal = Some(p);
    }
    Ok(())
}

/// Finalize a tree for export: depth-first renumbering so ids are dense and
/// parents precede children. Returns old id -> new id.
pub fn assign_ids_depth_first(segments: &mut [Segment]) -> Result<Map<i64, i64>> {
    let mut children: Map<Option<i64>, Vec<usize>> = Map::new();
    for (ix, s) in segments.iter().enumerate() {
        children.entry(s.parent).or_default().push(ix);
    }
    let roots = children.get(&None).cloned().unwrap_or_default();
    if roots.is_empty() && !segments.is_empty() {
        return Err(model_error("Compartment tree has no root"));
    }
    let mut order = Vec::with_capacity(segments.len());
    let mut todo: Vec<usize> = roots.into_iter().rev().collect();
    while let Some(ix) = todo.pop() {
        order.push(ix);
        if let Some(kids) = children.get(&Some(segments[ix].id)) {
            todo.extend(kids.iter().rev());
        }
    }
    if order.len() != segments.len() {
        return Err(model_error("Compartment tree is not connected"));
    }
    let remap: Map<i64, i64> = order
        .iter()
        .enumerate()
        .map(|(new, &ix)| (segments[ix].id, new as i64))
        .collect();
    for s in segments.iter_mut() {
        s.id = remap[&s.id];
        if let Some(p) = s.parent {
            s.parent = Some(remap[&p]);
        }
    }
    segments.sort_by_key(|s| s.id);
    Ok(remap)
}

/// Collapse declared per-segment/per-group/everywhere property scopes into
/// the minimal partition that actually needs separate sub-parts. Each
/// declared group is also mapped onto the merged groups it spans, and a
/// merged group whose pattern coincides exactly with a declared group takes
/// that group's name.
pub fn partition(
    segments: &[Segment],
    properties: &[PropertyColumn],
    declared: &Map<String, Vec<i64>>,
) -> Result<Partition> {
    let row_of: Map<i64, usize> = segments.iter().enumerate().map(|(r, s)| (s.id, r)).collect();
    let mut matrix = BooleanIncidenceMatrix::new(segments.len(), properties.len());
    for (c, prop) in properties.iter().enumerate() {
        match &prop.scope {
            Scope::All => {
                for r in 0..segments.len() {
                    matrix.set(r, c);
                }
            }
            Scope::Group(g) => {
                let members = declared
                    .get(g)
                    .ok_or_else(|| model_error(format!("Unknown segment group {}", g)))?;
                if members.is_empty() {
                    return Err(model_error(format!("Property {} has empty scope", prop.name)));
                }
                for id in members {
                    let r = row_of.get(id).ok_or_else(|| {
                        model_error(format!("Group {} names unknown segment {}", g, id))
                    })?;
                    matrix.set(*r, c);
                }
            }
            Scope::One(id) => {
                let r = row_of
                    .get(id)
                    .ok_or_else(|| model_error(format!("Property on unknown segment {}", id)))?;
                matrix.set(*r, c);
            }
        }
        if matrix.column_norm0(c) == 0 {
            return Err(model_error(format!("Property {} has empty scope", prop.name)));
        }
    }

    let fold = matrix.fold_rows(None);
    let mut groups: Vec<MergedGroup> = fold
        .merged
        .iter()
        .enumerate()
        .map(|(m, pat)| MergedGroup {
            name: format!("group_{}", m),
            segments: segments
                .iter()
                .enumerate()
                .filter(|(r, _)| fold.row_of[*r] == m)
                .map(|(_, s)| s.id)
                .collect(),
            properties: pat
                .iter()
                .enumerate()
                .filter(|(_, &b)| b)
                .map(|(c, _)| c)
                .collect(),
        })
        .collect();

    // Cosmetic renaming: a merged group that is exactly a declared group
    // keeps the declared name.
    for (name, members) in declared {
        let mut sorted = members.clone();
        sorted.sort_unstable();
        for g in groups.iter_mut() {
            let mut mine = g.segments.clone();
            mine.sort_unstable();
            if mine == sorted {
                g.name = name.to_string();
                break;
            }
        }
    }

    let mut declared_spans: Map<String, Vec<usize>> = Map::new();
    for (name, members) in declared {
        let mut spans = Vec::new();
        for id in members {
            if let Some(&r) = row_of.get(id) {
                let m = fold.row_of[r];
                if !spans.contains(&m) {
                    spans.push(m);
                }
            }
        }
        spans.sort_unstable();
        declared_spans.insert(name.to_string(), spans);
    }

    Ok(Partition {
        groups,
        declared_spans,
    })
}

/// Parent/child pairings between merged groups: for every structural
/// parent/child segment pair, the group each side lives in and the member
/// indices within those groups.
pub fn couplings(
    segments: &[Segment],
    groups: &[MergedGroup],
) -> Vec<((usize, usize), Vec<(i64, i64)>)> {
    let group_of: Map<i64, (usize, i64)> = groups
        .iter()
        .enumerate()
        .flat_map(|(g, mg)| {
            mg.segments
                .iter()
                .enumerate()
                .map(move |(ix, id)| (*id, (g, ix as i64)))
        })
        .collect();
    let mut out: Vec<((usize, usize), Vec<(i64, i64)>)> = Vec::new();
    for seg in segments {
        let pid = match seg.parent {
            Some(p) => p,
            None => continue,
        };
        let (pg, pix) = match group_of.get(&pid) {
            Some(x) => *x,
            None => continue,
        };
        let (cg, cix) = match group_of.get(&seg.id) {
            Some(x) => *x,
            None => continue,
        };
        match out.iter_mut().find(|((a, b), _)| *a == pg && *b == cg) {
            Some((_, pairs)) => pairs.push((pix, cix)),
            None => out.push(((pg, cg), vec![(pix, cix)])),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn pt(x: f64) -> Point {
        Point {
            x,
            y: 0.0,
            z: 0.0,
            d: 1.0,
        }
    }

    fn two_segments() -> Vec<Segment> {
        vec![
            Segment {
                id: 0,
                name: Some("soma".to_string()),
                parent: None,
                fraction_along: 1.0,
                proximal: Some(pt(0.0)),
                distal: pt(10.0),
            },
            Segment {
                id: 1,
                name: Some("dend".to_string()),
                parent: Some(0),
                fraction_along: 1.0,
                proximal: None,
                distal: pt(30.0),
            },
        ]
    }

    #[test]
    fn proximal_propagates_from_parent() {
        let mut segs = two_segments();
        propagate_proximal(&mut segs).unwrap();
        assert_eq!(segs[1].proximal, Some(pt(10.0)));
    }

    #[test]
    fn depth_first_ids() {
        let mut segs = vec![
            Segment {
                id: 7,
                name: None,
                parent: Some(3),
                fraction_along: 1.0,
                proximal: None,
                distal: pt(1.0),
            },
            Segment {
                id: 3,
                name: None,
                parent: None,
                fraction_along: 1.0,
                proximal: Some(pt(0.0)),
                distal: pt(1.0),
            },
        ];
        let remap = assign_ids_depth_first(&mut segs).unwrap();
        assert_eq!(remap[&3], 0);
        assert_eq!(remap[&7], 1);
        assert_eq!(segs[0].parent, None);
        assert_eq!(segs[1].parent, Some(0));
    }

    #[test]
    fn partition_two_distinct_segments() {
        let segs = two_segments();
        let props = vec![
            PropertyColumn {
                name: "na".to_string(),
                scope: Scope::One(0),
            },
            PropertyColumn {
                name: "k".to_string(),
                scope: Scope::One(1),
            },
        ];
        let p = partition(&segs, &props, &Map::new()).unwrap();
        assert_eq!(p.groups.len(), 2);
        assert_eq!(p.groups[0].segments, vec![0]);
        assert_eq!(p.groups[1].segments, vec![1]);
        let c = couplings(&segs, &p.groups);
        assert_eq!(c, vec![((0, 1), vec![(0, 0)])]);
    }

    #[test]
    fn partition_takes_declared_name() {
        let segs = two_segments();
        let mut declared = Map::new();
        declared.insert("soma_group".to_string(), vec![0]);
        let props = vec![
            PropertyColumn {
                name: "pas".to_string(),
                scope: Scope::Group("soma_group".to_string()),
            },
            PropertyColumn {
                name: "cm".to_string(),
                scope: Scope::All,
            },
        ];
        let p = partition(&segs, &props, &declared).unwrap();
        assert_eq!(p.groups.len(), 2);
        let soma = p
            .groups
            .iter()
            .position(|g| g.name == "soma_group")
            .unwrap();
        assert_eq!(p.groups[soma].segments, vec![0]);
        assert_eq!(p.declared_spans["soma_group"], vec![soma]);
    }

    #[test]
    fn empty_scope_is_an_error() {
        let segs = two_segments();
        let props = vec![PropertyColumn {
            name: "nowhere".to_string(),
            scope: Scope::One(99),
        }];
        assert!(partition(&segs, &props, &Map::new()).is_err());
    }
}
