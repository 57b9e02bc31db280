use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    error::{unit_error, Result},
    expr::Quantity,
    Map, Set,
};

/// Dimension = mass^m length^l time^t current^i temperature^k amount^n
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub m: i64,
    pub l: i64,
    pub t: i64,
    pub i: i64,
    pub k: i64,
    pub n: i64,
}

/// Unit = dimension scaled by 10^power * scale (+ offset, which we refuse).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub symbol: String,
    pub dimension: String,
    pub power: i64,
    pub scale: f64,
    pub offset: f64,
}

impl Unit {
    fn new(symbol: &str, dimension: &str, power: i64) -> Self {
        Unit {
            symbol: symbol.to_string(),
            dimension: dimension.to_string(),
            power,
            scale: 1.0,
            offset: 0.0,
        }
    }
}

/// Fixed unit vocabulary plus the per-dimension canonical subset used to
/// normalise literals on export.
#[derive(Debug, Default)]
pub struct UnitTable {
    pub units: Map<String, Unit>,
    pub dimensions: Map<String, Dimension>,
    /// dimension -> canonical units, preferred first
    pub canonical: Map<String, Vec<Unit>>,
}

fn dim(name: &str, m: i64, l: i64, t: i64, i: i64, k: i64, n: i64) -> Dimension {
    Dimension {
        name: name.to_string(),
        m,
        l,
        t,
        i,
        k,
        n,
    }
}

impl UnitTable {
    fn build() -> Self {
        let dimensions = [
            dim("voltage", 1, 2, -3, -1, 0, 0),
            dim("time", 0, 0, 1, 0, 0, 0),
            dim("per_time", 0, 0, -1, 0, 0, 0),
            dim("length", 0, 1, 0, 0, 0, 0),
            dim("area", 0, 2, 0, 0, 0, 0),
            dim("current", 0, 0, 0, 1, 0, 0),
            dim("conductance", -1, -2, 3, 2, 0, 0),
            dim("conductanceDensity", -1, -4, 3, 2, 0, 0),
            dim("capacitance", -1, -2, 4, 2, 0, 0),
            dim("specificCapacitance", -1, -4, 4, 2, 0, 0),
            dim("resistance", 1, 2, -3, -2, 0, 0),
            dim("resistivity", 1, 3, -3, -2, 0, 0),
            dim("concentration", 0, -3, 0, 0, 0, 1),
            dim("temperature", 0, 0, 0, 0, 1, 0),
        ];
        let units = [
            Unit::new("V", "voltage", 0),
            Unit::new("mV", "voltage", -3),
            Unit::new("uV", "voltage", -6),
            Unit::new("s", "time", 0),
            Unit::new("ms", "time", -3),
            Unit::new("us", "time", -6),
            Unit::new("per_s", "per_time", 0),
            Unit::new("per_ms", "per_time", 3),
            Unit::new("m", "length", 0),
            Unit::new("cm", "length", -2),
            Unit::new("um", "length", -6),
            Unit::new("cm2", "area", -4),
            Unit::new("um2", "area", -12),
            Unit::new("A", "current", 0),
            Unit::new("mA", "current", -3),
            Unit::new("uA", "current", -6),
            Unit::new("nA", "current", -9),
            Unit::new("pA", "current", -12),
            Unit::new("S", "conductance", 0),
            Unit::new("mS", "conductance", -3),
            Unit::new("uS", "conductance", -6),
            Unit::new("nS", "conductance", -9),
            Unit::new("pS", "conductance", -12),
            Unit::new("S_per_m2", "conductanceDensity", 0),
            Unit::new("S_per_cm2", "conductanceDensity", 4),
            Unit::new("mS_per_cm2", "conductanceDensity", 1),
            Unit::new("F", "capacitance", 0),
            Unit::new("uF", "capacitance", -6),
            Unit::new("nF", "capacitance", -9),
            Unit::new("pF", "capacitance", -12),
            Unit::new("F_per_m2", "specificCapacitance", 0),
            Unit::new("uF_per_cm2", "specificCapacitance", -2),
            Unit::new("ohm", "resistance", 0),
            Unit::new("kohm", "resistance", 3),
            Unit::new("Mohm", "resistance", 6),
            Unit::new("ohm_m", "resistivity", 0),
            Unit::new("ohm_cm", "resistivity", -2),
            Unit::new("kohm_cm", "resistivity", 1),
            Unit::new("mol_per_m3", "concentration", 0),
            Unit::new("mol_per_cm3", "concentration", 6),
            Unit::new("mM", "concentration", 0),
            Unit::new("K", "temperature", 0),
        ];
        // Physiological units preferred by the destination format.
        let canonical = [
            ("voltage", vec!["mV"]),
            ("time", vec!["ms", "s"]),
            ("per_time", vec!["per_ms", "per_s"]),
            ("length", vec!["um", "cm"]),
            ("area", vec!["cm2"]),
            ("current", vec!["nA", "uA", "pA"]),
            ("conductance", vec!["nS", "uS", "pS"]),
            ("conductanceDensity", vec!["mS_per_cm2", "S_per_cm2"]),
            ("capacitance", vec!["pF", "nF", "uF"]),
            ("specificCapacitance", vec!["uF_per_cm2"]),
            ("resistance", vec!["kohm", "Mohm", "ohm"]),
            ("resistivity", vec!["kohm_cm", "ohm_cm"]),
            ("concentration", vec!["mM", "mol_per_cm3"]),
            ("temperature", vec!["K"]),
        ];

        let units: Map<String, Unit> = units
            .iter()
            .map(|u| (u.symbol.to_string(), u.clone()))
            .collect();
        let dimensions = dimensions
            .iter()
            .map(|d| (d.name.to_string(), d.clone()))
            .collect();
        let canonical = canonical
            .iter()
            .map(|(d, us)| {
                (
                    d.to_string(),
                    us.iter().map(|u| units[*u].clone()).collect(),
                )
            })
            .collect();
        UnitTable {
            units,
            dimensions,
            canonical,
        }
    }

    pub fn unit(&self, symbol: &str) -> Option<&Unit> {
        self.units.get(symbol)
    }
}

/// Process-wide unit vocabulary; read-only after first use.
pub fn table() -> &'static UnitTable {
    static TABLE: OnceLock<UnitTable> = OnceLock::new();
    TABLE.get_or_init(UnitTable::build)
}

/// Conversion factor taking a value in `from` to a value in `to`.
fn factor(from: &Unit, to: &Unit) -> Result<f64> {
    if from.dimension != to.dimension {
        return Err(unit_error(format!(
            "Cannot convert {} to {}",
            from.symbol, to.symbol
        )));
    }
    // Offsets would need affine handling; nothing in the catalog carries one.
    if from.offset != 0.0 || to.offset != 0.0 {
        return Err(unit_error(format!(
            "Offset units unsupported: {} -> {}",
            from.symbol, to.symbol
        )));
    }
    let e = (from.power - to.power) as i32;
    Ok((from.scale / to.scale) * f64::powi(10.0, e))
}

/// Rescale a quantity to the closest canonical unit of its dimension. A
/// candidate landing the value in [1, 1000] wins; otherwise the candidate
/// with the smallest magnitude mismatch is taken. Unknown units pass
/// through unchanged.
pub fn negotiate(q: &Quantity) -> Quantity {
    let sym = match q.unit.as_deref() {
        Some(s) => s,
        None => return q.clone(),
    };
    let tbl = table();
    let from = match tbl.unit(sym) {
        Some(u) => u,
        None => {
            trace!("No unit {} in catalog, passing through", sym);
            return q.clone();
        }
    };
    let cands = match tbl.canonical.get(&from.dimension) {
        Some(cs) => cs,
        None => return q.clone(),
    };
    let mut best: Option<(bool, f64, f64, &Unit)> = None;
    for c in cands {
        let f = match factor(from, c) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let value = q.value * f;
        let mag = value.abs();
        let in_range = (1.0..=1000.0).contains(&mag);
        let miss = if mag > 0.0 { mag.log10().abs() } else { 0.0 };
        let better = match best {
            None => true,
            Some((was_in_range, best_miss, _, _)) => {
                (in_range && !was_in_range) || (in_range == was_in_range && miss < best_miss)
            }
        };
        if better {
            best = Some((in_range, miss, value, c));
        }
    }
    match best {
        Some((_, _, value, c)) => Quantity {
            value,
            unit: Some(c.symbol.to_string()),
        },
        None => q.clone(),
    }
}

/// Units and dimensions actually used by one export job; emitted as
/// schema-level declarations only where the destination format lacks them.
#[derive(Debug, Default)]
pub struct UsedUnits {
    pub units: Set<String>,
}

impl UsedUnits {
    pub fn record(&mut self, q: &Quantity) {
        if let Some(u) = &q.unit {
            self.units.insert(u.to_string());
        }
    }

    pub fn declarations(&self) -> (Vec<Unit>, Vec<Dimension>) {
        let tbl = table();
        let mut units = Vec::new();
        let mut dims: Set<String> = Set::new();
        for s in &self.units {
            if let Some(u) = tbl.unit(s) {
                units.push(u.clone());
                dims.insert(u.dimension.to_string());
            }
        }
        let dims = dims
            .iter()
            .filter_map(|d| tbl.dimensions.get(d).cloned())
            .collect();
        (units, dims)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negotiate_prefers_scale_up() {
        // 0.04 V -> 40 mV: a factor of 1000, at the bound, still preferred
        let q = Quantity {
            value: 0.04,
            unit: Some("V".to_string()),
        };
        let r = negotiate(&q);
        assert_eq!(r.unit.as_deref(), Some("mV"));
        assert!((r.value - 40.0).abs() < 1e-9);
    }

    #[test]
    fn negotiate_scales_down_into_range() {
        let q = Quantity {
            value: 1500.0,
            unit: Some("uV".to_string()),
        };
        let r = negotiate(&q);
        assert_eq!(r.unit.as_deref(), Some("mV"));
        assert!((r.value - 1.5).abs() < 1e-9);
    }

    #[test]
    fn negotiate_keeps_values_already_in_range() {
        let q = Quantity {
            value: 2.0,
            unit: Some("s".to_string()),
        };
        let r = negotiate(&q);
        // 2 s is in range; 2000 ms would overshoot the bound
        assert_eq!(r.unit.as_deref(), Some("s"));
        assert!((r.value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn negotiate_small_values_pick_the_closer_unit() {
        let q = Quantity {
            value: 0.0001,
            unit: Some("s".to_string()),
        };
        let r = negotiate(&q);
        assert_eq!(r.unit.as_deref(), Some("ms"));
        assert!((r.value - 0.1).abs() < 1e-9);
    }

    #[test]
    fn negotiate_unknown_passes_through() {
        let q = Quantity {
            value: 3.0,
            unit: Some("parsec".to_string()),
        };
        assert_eq!(negotiate(&q), q);
    }

    #[test]
    fn negotiate_dimensionless() {
        let q = Quantity {
            value: 3.0,
            unit: None,
        };
        assert_eq!(negotiate(&q), q);
    }
}
