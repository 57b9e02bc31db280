use serde::{Deserialize, Serialize};

use crate::error::{parse_error, Result};

/// Numeric literal with an optional unit suffix, eg '-70 mV'.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: Option<String>,
}

impl Quantity {
    pub fn parse(input: &str) -> Result<Self> {
        match parse::quantity(input) {
            Ok((rest, result)) if rest.trim().is_empty() => Ok(result),
            _ => Err(parse_error(format!("Could not parse quantity {:?}", input))),
        }
    }

    pub fn number(value: f64) -> Self {
        Quantity { value, unit: None }
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.unit {
            Some(u) => write!(f, "{} {}", self.value, u),
            None => write!(f, "{}", self.value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Cmp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

/// Arithmetic expression over variables and plain numbers.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Expr {
    F64(f64),
    Var(String),
    Add(Vec<Expr>),
    Mul(Vec<Expr>),
    Pow(Vec<Expr>),
    Exp(Box<Expr>),
}

impl Expr {
    pub fn parse(input: &str) -> Result<Self> {
        match parse::add(input) {
            Ok((rest, result)) if rest.trim().is_empty() => Ok(result.simplify()),
            _ => Err(parse_error(format!("Could not parse {:?}", input))),
        }
    }

    pub fn map(&self, f: &impl Fn(&Expr) -> Expr) -> Expr {
        match self {
            Expr::Add(vs) => Expr::Add(vs.iter().map(|v| v.map(f)).collect()),
            Expr::Mul(vs) => Expr::Mul(vs.iter().map(|v| v.map(f)).collect()),
            Expr::Pow(vs) => Expr::Pow(vs.iter().map(|v| v.map(f)).collect()),
            Expr::Exp(b) => Expr::Exp(Box::new(b.map(f))),
            e => f(e),
        }
    }

    pub fn fold<T>(&self, acc: &mut T, f: &impl Fn(&Expr, &mut T)) {
        match self {
            Expr::Add(vs) => vs.iter().for_each(|v| v.fold(acc, f)),
            Expr::Mul(vs) => vs.iter().for_each(|v| v.fold(acc, f)),
            Expr::Pow(vs) => vs.iter().for_each(|v| v.fold(acc, f)),
            Expr::Exp(b) => b.fold(acc, f),
            e => f(e, acc),
        }
    }

    /// All variable names mentioned, in no particular order.
    pub fn variables(&self) -> Vec<String> {
        let mut vs = Vec::new();
        self.fold(&mut vs, &|e, acc: &mut Vec<String>| {
            if let Expr::Var(v) = e {
                if !acc.contains(v) {
                    acc.push(v.to_string());
                }
            }
        });
        vs
    }

    /// Substitute variables by name.
    pub fn rename(&self, f: &impl Fn(&str) -> String) -> Expr {
        self.map(&|e| {
            if let Expr::Var(v) = e {
                Expr::Var(f(v))
            } else {
                e.clone()
            }
        })
    }

    pub fn print_to_string(&self) -> String {
        match &self {
            Expr::F64(x) => format!("{}", x),
            Expr::Var(x) => x.to_string(),
            Expr::Exp(x) => format!("exp({})", x.print_to_string()),
            Expr::Add(xs) => xs
                .iter()
                .map(|x| x.print_to_string())
                .collect::<Vec<_>>()
                .join(" + "),
            Expr::Mul(xs) => xs
                .iter()
                .map(|x| {
                    if let Expr::Add(_) = x {
                        format!("({})", x.print_to_string())
                    } else {
                        x.print_to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" * "),
            Expr::Pow(xs) => xs
                .iter()
                .map(|x| match x {
                    Expr::Add(_) | Expr::Mul(_) => format!("({})", x.print_to_string()),
                    _ => x.print_to_string(),
                })
                .collect::<Vec<_>>()
                .join("^"),
        }
    }

    pub fn simplify(&self) -> Self {
        let mut done = false;
        let mut old = self.clone();
        while !done {
            let new = match &old {
                Expr::Pow(vs) => simplify_pow(vs),
                Expr::Add(vs) => simplify_add(vs),
                Expr::Mul(vs) => simplify_mul(vs),
                Expr::Exp(vs) => simplify_exp(vs),
                e => e.clone(),
            };
            done = old == new;
            old = new
        }
        old
    }
}

/// Boolean condition over expressions; used for equation clauses and
/// connection filters alike.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Boolean {
    Cmp(Cmp, Expr, Expr),
    And(Box<Boolean>, Box<Boolean>),
    Or(Box<Boolean>, Box<Boolean>),
}

impl Boolean {
    pub fn parse(input: &str) -> Result<Self> {
        match parse::boolean(input) {
            Ok((rest, result)) if rest.trim().is_empty() => Ok(result),
            _ => Err(parse_error(format!("Could not parse condition {:?}", input))),
        }
    }

    pub fn print_to_string(&self) -> String {
        match self {
            Boolean::Cmp(o, l, r) => {
                let op = match o {
                    Cmp::Eq => "==",
                    Cmp::Ne => "!=",
                    Cmp::Ge => ">=",
                    Cmp::Le => "<=",
                    Cmp::Gt => ">",
                    Cmp::Lt => "<",
                };
                format!("{} {} {}", l.print_to_string(), op, r.print_to_string())
            }
            Boolean::And(l, r) => {
                format!("{} && {}", l.print_to_string(), r.print_to_string())
            }
            Boolean::Or(l, r) => {
                format!("({}) || ({})", l.print_to_string(), r.print_to_string())
            }
        }
    }

    /// Conjunction terms, flattened.
    fn conjuncts(&self) -> Vec<&Boolean> {
        match self {
            Boolean::And(a, b) => {
                let mut r = a.conjuncts();
                r.extend(b.conjuncts());
                r
            }
            b => vec![b],
        }
    }
}

/// A connection filter: per-endpoint index equalities on the two bound ends
/// of a binary relation. `A.index == 1 && B.index == 2` constrains both
/// ends, one-sided filters constrain one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Serialize, Deserialize, Default)]
pub struct Filter {
    pub a: Option<i64>,
    pub b: Option<i64>,
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self> {
        Self::from_boolean(&Boolean::parse(input)?)
    }

    pub fn from_boolean(b: &Boolean) -> Result<Self> {
        let mut f = Filter::default();
        for c in b.conjuncts() {
            match c {
                Boolean::Cmp(Cmp::Eq, Expr::Var(v), Expr::F64(x)) => {
                    let ix = *x as i64;
                    match v.as_str() {
                        "A.index" => f.a = Some(ix),
                        "B.index" => f.b = Some(ix),
                        _ => {
                            return Err(parse_error(format!("Not an endpoint index: {}", v)));
                        }
                    }
                }
                _ => {
                    return Err(parse_error(format!(
                        "Not an index equality: {}",
                        c.print_to_string()
                    )));
                }
            }
        }
        Ok(f)
    }

    pub fn to_boolean(&self) -> Option<Boolean> {
        let cmp = |v: &str, x: i64| {
            Boolean::Cmp(Cmp::Eq, Expr::Var(v.to_string()), Expr::F64(x as f64))
        };
        match (self.a, self.b) {
            (Some(a), Some(b)) => Some(Boolean::And(
                Box::new(cmp("A.index", a)),
                Box::new(cmp("B.index", b)),
            )),
            (Some(a), None) => Some(cmp("A.index", a)),
            (None, Some(b)) => Some(cmp("B.index", b)),
            (None, None) => None,
        }
    }

    /// Index pairs satisfying the filter over populations of size na x nb.
    /// Without a filter this is the full pairwise product, self-pairs
    /// included.
    pub fn pairs(&self, na: i64, nb: i64) -> Vec<(i64, i64)> {
        let sa: Vec<i64> = match self.a {
            Some(a) if a < na => vec![a],
            Some(_) => vec![],
            None => (0..na).collect(),
        };
        let sb: Vec<i64> = match self.b {
            Some(b) if b < nb => vec![b],
            Some(_) => vec![],
            None => (0..nb).collect(),
        };
        let mut res = Vec::new();
        for &a in &sa {
            for &b in &sb {
                res.push((a, b));
            }
        }
        res
    }
}

mod parse {
    use nom::{
        branch::alt,
        bytes::complete::{tag, take_while, take_while1},
        character::complete::{one_of, space0},
        character::is_alphanumeric,
        combinator::{fail, opt},
        multi::{fold_many0, separated_list1},
        number::complete::double,
        sequence::{delimited, pair, preceded, tuple},
        IResult,
    };

    use super::{Boolean, Cmp, Expr, Quantity};

    pub fn quantity(input: &str) -> IResult<&str, Quantity> {
        let (input, _) = space0(input)?;
        let (input, f) = double(input)?;
        let (input, _) = space0(input)?;
        let (input, u) = take_while(|c| is_alphanumeric(c as u8) || '_' == c)(input)?;
        let unit = if u.is_empty() { None } else { Some(u.to_string()) };
        Ok((input, Quantity { value: f, unit }))
    }

    pub fn expr(input: &str) -> IResult<&str, Expr> {
        add(input)
    }

    fn lit(input: &str) -> IResult<&str, Expr> {
        if input.starts_with("inf") || input.starts_with("nan") || input.starts_with('+') {
            fail::<_, &str, _>(input)?;
        }
        let (input, f) = double(input)?;
        Ok((input, Expr::F64(f)))
    }

    fn var(input: &str) -> IResult<&str, Expr> {
        let (input, v) =
            take_while1(|c| is_alphanumeric(c as u8) || '_' == c || '.' == c || '\'' == c)(input)?;
        if v.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true) {
            fail::<_, &str, _>(input)?;
        }
        Ok((input, Expr::Var(v.to_string())))
    }

    fn parenthised(input: &str) -> IResult<&str, Expr> {
        delimited(
            delimited(space0, tag("("), space0),
            expr,
            delimited(space0, tag(")"), space0),
        )(input)
    }

    fn exp(input: &str) -> IResult<&str, Expr> {
        let (input, e) = preceded(tag("exp"), parenthised)(input)?;
        Ok((input, Expr::Exp(Box::new(e))))
    }

    fn atom(input: &str) -> IResult<&str, Expr> {
        let (input, sign) = opt(delimited(space0, tag("-"), space0))(input)?;
        let (input, result) = delimited(space0, alt((parenthised, exp, lit, var)), space0)(input)?;
        if sign.is_some() {
            Ok((input, Expr::Mul(vec![Expr::F64(-1.0), result])))
        } else {
            Ok((input, result))
        }
    }

    fn pow(input: &str) -> IResult<&str, Expr> {
        let (input, sum) = separated_list1(delimited(space0, tag("^"), space0), atom)(input)?;
        if sum.len() == 1 {
            Ok((input, sum.last().unwrap().clone()))
        } else {
            Ok((input, Expr::Pow(sum)))
        }
    }

    fn mul(input: &str) -> IResult<&str, Expr> {
        let (input, init) = pow(input)?;
        let (input, sum) = fold_many0(
            pair(delimited(space0, one_of("*/"), space0), pow),
            || vec![init.clone()],
            |mut acc: Vec<_>, (o, ref mut x)| {
                if '/' == o {
                    acc.push(Expr::Pow(vec![x.clone(), Expr::F64(-1.0)]));
                } else {
                    acc.push(x.clone());
                }
                acc
            },
        )(input)?;
        if sum.len() == 1 {
            Ok((input, sum.last().unwrap().clone()))
        } else {
            Ok((input, Expr::Mul(sum)))
        }
    }

    pub fn add(input: &str) -> IResult<&str, Expr> {
        let (input, init) = mul(input)?;
        let (input, sum) = fold_many0(
            pair(delimited(space0, one_of("+-"), space0), mul),
            || vec![init.clone()],
            |mut acc: Vec<_>, (o, ref mut x)| {
                if '-' == o {
                    acc.push(Expr::Mul(vec![Expr::F64(-1.0), x.clone()]));
                } else {
                    acc.push(x.clone());
                }
                acc
            },
        )(input)?;
        if sum.len() == 1 {
            Ok((input, sum.last().unwrap().clone()))
        } else {
            Ok((input, Expr::Add(sum)))
        }
    }

    fn cmp(input: &str) -> IResult<&str, Boolean> {
        let (input, (l, o, r)) = tuple((
            add,
            delimited(
                space0,
                alt((
                    tag("=="),
                    tag("!="),
                    tag(">="),
                    tag("<="),
                    tag(">"),
                    tag("<"),
                )),
                space0,
            ),
            add,
        ))(input)?;
        let op = match o {
            "==" => Cmp::Eq,
            "!=" => Cmp::Ne,
            ">=" => Cmp::Ge,
            "<=" => Cmp::Le,
            ">" => Cmp::Gt,
            "<" => Cmp::Lt,
            _ => unreachable!(),
        };
        Ok((input, Boolean::Cmp(op, l, r)))
    }

    fn bool_atom(input: &str) -> IResult<&str, Boolean> {
        alt((
            delimited(
                delimited(space0, tag("("), space0),
                boolean,
                delimited(space0, tag(")"), space0),
            ),
            cmp,
        ))(input)
    }

    pub fn boolean(input: &str) -> IResult<&str, Boolean> {
        let (input, init) = bool_atom(input)?;
        fold_many0(
            pair(
                delimited(space0, alt((tag("&&"), tag("||"))), space0),
                bool_atom,
            ),
            move || init.clone(),
            |acc, (o, x)| {
                if o == "&&" {
                    Boolean::And(Box::new(acc), Box::new(x))
                } else {
                    Boolean::Or(Box::new(acc), Box::new(x))
                }
            },
        )(input)
    }
}

fn simplify_pow(es: &[Expr]) -> Expr {
    let mut result = es.iter().map(|e| e.simplify()).collect::<Vec<_>>();
    let z = result.iter().position(|e| {
        if let Expr::F64(x) = *e {
            x.abs() < f64::EPSILON
        } else {
            false
        }
    });
    if let Some(ix) = z {
        if ix >= 1 {
            // a^..^b^0^c^.. collapses to a^..^b
            result.truncate(ix - 1);
        } else {
            result = vec![Expr::F64(0.0)];
        }
    }
    let o = result.iter().position(|e| {
        if let Expr::F64(x) = *e {
            (x - 1.0).abs() < f64::EPSILON
        } else {
            false
        }
    });
    if let Some(ix) = o {
        result.truncate(ix);
    }
    match &result[..] {
        [] => Expr::F64(1.0),
        [e] => e.clone(),
        [xs @ .., Expr::F64(x), Expr::F64(y)] => {
            let mut res = xs.to_vec();
            res.push(Expr::F64(x.powf(*y)));
            if res.len() == 1 {
                res.last().unwrap().clone()
            } else {
                Expr::Pow(res)
            }
        }
        es => Expr::Pow(es.to_vec()),
    }
}

fn simplify_mul(es: &[Expr]) -> Expr {
    let mut result = Vec::new();
    let mut lit = 1.0;
    let mut todo = es.to_vec();
    while let Some(e) = todo.pop() {
        match e.simplify() {
            Expr::F64(z) => lit *= z,
            Expr::Mul(zs) => todo.extend(zs),
            k => result.push(k),
        }
    }
    if lit == 0.0 {
        return Expr::F64(0.0);
    }
    if (lit - 1.0).abs() > f64::EPSILON {
        result.push(Expr::F64(lit));
    }
    result.sort_by(|a, b| a.partial_cmp(b).unwrap());
    match result.len() {
        0 => Expr::F64(1.0),
        1 => result.last().unwrap().clone(),
        _ => Expr::Mul(result),
    }
}

fn simplify_add(es: &[Expr]) -> Expr {
    let mut todo = es.to_vec();
    let mut result = Vec::new();
    let mut lit = 0.0;
    while let Some(e) = todo.pop() {
        match e.simplify() {
            Expr::F64(z) => lit += z,
            Expr::Add(zs) => todo.extend(zs),
            k => result.push(k),
        }
    }
    if lit != 0.0 {
        result.push(Expr::F64(lit));
    }
    result.sort_by(|a, b| a.partial_cmp(b).unwrap());
    match result.len() {
        0 => Expr::F64(0.0),
        1 => result.last().unwrap().clone(),
        _ => Expr::Add(result),
    }
}

fn simplify_exp(es: &Expr) -> Expr {
    let xs = es.simplify();
    if let Expr::F64(x) = xs {
        Expr::F64(x.exp())
    } else {
        Expr::Exp(Box::new(xs))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_quantity() {
        assert_eq!(
            Quantity::parse("-70 mV").unwrap(),
            Quantity {
                value: -70.0,
                unit: Some("mV".to_string())
            }
        );
        assert_eq!(
            Quantity::parse("0.5").unwrap(),
            Quantity {
                value: 0.5,
                unit: None
            }
        );
        assert!(Quantity::parse("bare words").is_err());
    }

    #[test]
    fn parse_expr() {
        assert_eq!(Expr::parse(" 1.0  ").unwrap(), Expr::F64(1.0));
        assert_eq!(Expr::parse("1+2 + 3 +3  *4").unwrap(), Expr::F64(18.0));
        assert_eq!(Expr::parse("2*x -x").unwrap(), Expr::Var(String::from("x")));
        assert_eq!(Expr::parse("exp(1 - 1)").unwrap(), Expr::F64(1.0));
    }

    #[test]
    fn map_and_fold() {
        let e = Expr::parse("a + 2*b").unwrap();
        assert_eq!(e.variables(), vec!["a".to_string(), "b".to_string()]);
        let r = e.rename(&|v| format!("cell_{}", v));
        assert_eq!(r.print_to_string(), "cell_a + 2 * cell_b");
    }

    #[test]
    fn parse_boolean() {
        let b = Boolean::parse("A.index == 1 && B.index == 2").unwrap();
        assert_eq!(
            b.print_to_string(),
            "A.index == 1 && B.index == 2".to_string()
        );
    }

    #[test]
    fn filter_pairs() {
        let f = Filter::parse("A.index == 1 && B.index == 2").unwrap();
        assert_eq!(f.pairs(3, 3), vec![(1, 2)]);
        let f = Filter::default();
        assert_eq!(
            f.pairs(2, 2),
            vec![(0, 0), (0, 1), (1, 0), (1, 1)]
        );
        let f = Filter::parse("A.index == 0").unwrap();
        assert_eq!(f.pairs(2, 2), vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn filter_roundtrip() {
        let f = Filter { a: Some(3), b: Some(0) };
        let b = f.to_boolean().unwrap();
        assert_eq!(Filter::from_boolean(&b).unwrap(), f);
    }
}
