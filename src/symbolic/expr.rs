use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Builtin single-argument functions understood by the parser, the
/// differentiator and the compiler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryFn {
    Cos,
    Sin,
    Tan,
    Exp,
    Log,
    Sqrt,
    Abs,
}

impl UnaryFn {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "cos" => Self::Cos,
            "sin" => Self::Sin,
            "tan" => Self::Tan,
            "exp" => Self::Exp,
            "log" | "ln" => Self::Log,
            "sqrt" => Self::Sqrt,
            "abs" => Self::Abs,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Cos => "cos",
            Self::Sin => "sin",
            Self::Tan => "tan",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sqrt => "sqrt",
            Self::Abs => "abs",
        }
    }

    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Cos => x.cos(),
            Self::Sin => x.sin(),
            Self::Tan => x.tan(),
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Sqrt => x.sqrt(),
            Self::Abs => x.abs(),
        }
    }
}

/// A symbolic arithmetic expression tree.
///
/// `Call` nodes are unresolved named functions straight out of the parser;
/// inlining replaces them with their bodies (or reports them as unknown).
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Unary(UnaryFn, Box<Expr>),
    Call(String, Vec<Expr>),
}

fn bx(e: Expr) -> Box<Expr> {
    Box::new(e)
}

impl Expr {
    pub fn num(v: f64) -> Self {
        Expr::Num(v)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    /// Collect the free variables of the expression.
    pub fn free_vars(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(name) => {
                out.insert(name.clone());
            }
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b)
            | Expr::Pow(a, b) => {
                a.free_vars(out);
                b.free_vars(out);
            }
            Expr::Neg(a) | Expr::Unary(_, a) => a.free_vars(out),
            Expr::Call(_, args) => {
                for a in args {
                    a.free_vars(out);
                }
            }
        }
    }

    /// Names of all unresolved function calls.
    pub fn call_names(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Num(_) | Expr::Var(_) => {}
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b)
            | Expr::Pow(a, b) => {
                a.call_names(out);
                b.call_names(out);
            }
            Expr::Neg(a) | Expr::Unary(_, a) => a.call_names(out),
            Expr::Call(name, args) => {
                out.insert(name.clone());
                for a in args {
                    a.call_names(out);
                }
            }
        }
    }

    /// Substitute variables by expressions.
    pub fn subst(&self, map: &HashMap<String, Expr>) -> Expr {
        match self {
            Expr::Num(v) => Expr::Num(*v),
            Expr::Var(name) => map.get(name).cloned().unwrap_or_else(|| self.clone()),
            Expr::Add(a, b) => Expr::Add(bx(a.subst(map)), bx(b.subst(map))),
            Expr::Sub(a, b) => Expr::Sub(bx(a.subst(map)), bx(b.subst(map))),
            Expr::Mul(a, b) => Expr::Mul(bx(a.subst(map)), bx(b.subst(map))),
            Expr::Div(a, b) => Expr::Div(bx(a.subst(map)), bx(b.subst(map))),
            Expr::Pow(a, b) => Expr::Pow(bx(a.subst(map)), bx(b.subst(map))),
            Expr::Neg(a) => Expr::Neg(bx(a.subst(map))),
            Expr::Unary(f, a) => Expr::Unary(*f, bx(a.subst(map))),
            Expr::Call(name, args) => {
                Expr::Call(name.clone(), args.iter().map(|a| a.subst(map)).collect())
            }
        }
    }

    /// Evaluate the tree directly. `None` if a variable is missing or an
    /// unresolved call remains; used as the reference for compiled programs.
    pub fn eval_map(&self, vars: &HashMap<String, f64>) -> Option<f64> {
        Some(match self {
            Expr::Num(v) => *v,
            Expr::Var(name) => *vars.get(name)?,
            Expr::Add(a, b) => a.eval_map(vars)? + b.eval_map(vars)?,
            Expr::Sub(a, b) => a.eval_map(vars)? - b.eval_map(vars)?,
            Expr::Mul(a, b) => a.eval_map(vars)? * b.eval_map(vars)?,
            Expr::Div(a, b) => a.eval_map(vars)? / b.eval_map(vars)?,
            Expr::Pow(a, b) => a.eval_map(vars)?.powf(b.eval_map(vars)?),
            Expr::Neg(a) => -a.eval_map(vars)?,
            Expr::Unary(f, a) => f.apply(a.eval_map(vars)?),
            Expr::Call(..) => return None,
        })
    }

    /// Symbolic partial derivative with respect to `var`. The result is not
    /// simplified; callers usually follow up with [`Expr::simplify`].
    pub fn diff(&self, var: &str) -> Expr {
        match self {
            Expr::Num(_) => Expr::Num(0.0),
            Expr::Var(name) => Expr::Num(if name == var { 1.0 } else { 0.0 }),
            Expr::Add(a, b) => Expr::Add(bx(a.diff(var)), bx(b.diff(var))),
            Expr::Sub(a, b) => Expr::Sub(bx(a.diff(var)), bx(b.diff(var))),
            Expr::Mul(a, b) => Expr::Add(
                bx(Expr::Mul(bx(a.diff(var)), b.clone())),
                bx(Expr::Mul(a.clone(), bx(b.diff(var)))),
            ),
            Expr::Div(a, b) => Expr::Div(
                bx(Expr::Sub(
                    bx(Expr::Mul(bx(a.diff(var)), b.clone())),
                    bx(Expr::Mul(a.clone(), bx(b.diff(var)))),
                )),
                bx(Expr::Pow(b.clone(), bx(Expr::Num(2.0)))),
            ),
            Expr::Pow(a, b) => match b.as_ref() {
                // d/dx u^n = n * u^(n-1) * u'
                Expr::Num(n) => Expr::Mul(
                    bx(Expr::Mul(
                        bx(Expr::Num(*n)),
                        bx(Expr::Pow(a.clone(), bx(Expr::Num(n - 1.0)))),
                    )),
                    bx(a.diff(var)),
                ),
                // d/dx u^v = u^v * (v' ln u + v u'/u)
                _ => Expr::Mul(
                    bx(self.clone()),
                    bx(Expr::Add(
                        bx(Expr::Mul(
                            bx(b.diff(var)),
                            bx(Expr::Unary(UnaryFn::Log, a.clone())),
                        )),
                        bx(Expr::Div(
                            bx(Expr::Mul(b.clone(), bx(a.diff(var)))),
                            a.clone(),
                        )),
                    )),
                ),
            },
            Expr::Neg(a) => Expr::Neg(bx(a.diff(var))),
            Expr::Unary(f, a) => {
                let inner = a.diff(var);
                let outer = match f {
                    UnaryFn::Cos => Expr::Neg(bx(Expr::Unary(UnaryFn::Sin, a.clone()))),
                    UnaryFn::Sin => Expr::Unary(UnaryFn::Cos, a.clone()),
                    UnaryFn::Tan => Expr::Div(
                        bx(Expr::Num(1.0)),
                        bx(Expr::Pow(
                            bx(Expr::Unary(UnaryFn::Cos, a.clone())),
                            bx(Expr::Num(2.0)),
                        )),
                    ),
                    UnaryFn::Exp => self.clone(),
                    UnaryFn::Log => Expr::Div(bx(Expr::Num(1.0)), a.clone()),
                    UnaryFn::Sqrt => Expr::Div(
                        bx(Expr::Num(0.5)),
                        bx(Expr::Unary(UnaryFn::Sqrt, a.clone())),
                    ),
                    UnaryFn::Abs => Expr::Div(a.clone(), bx(self.clone())),
                };
                Expr::Mul(bx(outer), bx(inner))
            }
            Expr::Call(..) => {
                // calls are inlined before differentiation
                Expr::Num(f64::NAN)
            }
        }
    }

    /// Algebraic simplification: constant folding and the usual
    /// additive/multiplicative identities, applied bottom-up.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Num(_) | Expr::Var(_) => self.clone(),
            Expr::Add(a, b) => match (a.simplify(), b.simplify()) {
                (Expr::Num(x), Expr::Num(y)) => Expr::Num(x + y),
                (Expr::Num(x), e) | (e, Expr::Num(x)) if x == 0.0 => e,
                // pull numeric factors together one level
                (Expr::Num(x), Expr::Add(c, d)) | (Expr::Add(c, d), Expr::Num(x)) => {
                    match (c.as_ref(), d.as_ref()) {
                        (Expr::Num(y), _) => Expr::Add(bx(Expr::Num(x + y)), d).simplify(),
                        (_, Expr::Num(y)) => Expr::Add(bx(Expr::Num(x + y)), c).simplify(),
                        _ => Expr::Add(bx(Expr::Num(x)), bx(Expr::Add(c, d))),
                    }
                }
                (x, y) => Expr::Add(bx(x), bx(y)),
            },
            Expr::Sub(a, b) => match (a.simplify(), b.simplify()) {
                (Expr::Num(x), Expr::Num(y)) => Expr::Num(x - y),
                (e, Expr::Num(y)) if y == 0.0 => e,
                (Expr::Num(x), e) if x == 0.0 => Expr::Neg(bx(e)).simplify(),
                (x, y) => Expr::Sub(bx(x), bx(y)),
            },
            Expr::Mul(a, b) => match (a.simplify(), b.simplify()) {
                (Expr::Num(x), Expr::Num(y)) => Expr::Num(x * y),
                (Expr::Num(x), _) | (_, Expr::Num(x)) if x == 0.0 => Expr::Num(0.0),
                (Expr::Num(x), e) | (e, Expr::Num(x)) if x == 1.0 => e,
                (Expr::Num(x), Expr::Mul(c, d)) | (Expr::Mul(c, d), Expr::Num(x)) => {
                    match (c.as_ref(), d.as_ref()) {
                        (Expr::Num(y), _) => Expr::Mul(bx(Expr::Num(x * y)), d).simplify(),
                        (_, Expr::Num(y)) => Expr::Mul(bx(Expr::Num(x * y)), c).simplify(),
                        _ => Expr::Mul(bx(Expr::Num(x)), bx(Expr::Mul(c, d))),
                    }
                }
                (Expr::Num(x), Expr::Neg(e)) | (Expr::Neg(e), Expr::Num(x)) => {
                    Expr::Mul(bx(Expr::Num(-x)), e).simplify()
                }
                (x, y) => Expr::Mul(bx(x), bx(y)),
            },
            Expr::Div(a, b) => match (a.simplify(), b.simplify()) {
                (Expr::Num(x), Expr::Num(y)) if y != 0.0 => Expr::Num(x / y),
                (e, Expr::Num(y)) if y == 1.0 => e,
                (Expr::Num(x), _) if x == 0.0 => Expr::Num(0.0),
                (x, y) => Expr::Div(bx(x), bx(y)),
            },
            Expr::Pow(a, b) => match (a.simplify(), b.simplify()) {
                (Expr::Num(x), Expr::Num(y)) => Expr::Num(x.powf(y)),
                (e, Expr::Num(y)) if y == 1.0 => e,
                (_, Expr::Num(y)) if y == 0.0 => Expr::Num(1.0),
                (x, y) => Expr::Pow(bx(x), bx(y)),
            },
            Expr::Neg(a) => match a.simplify() {
                Expr::Num(x) => Expr::Num(-x),
                Expr::Neg(inner) => *inner,
                e => Expr::Neg(bx(e)),
            },
            Expr::Unary(f, a) => match a.simplify() {
                Expr::Num(x) => {
                    let v = f.apply(x);
                    if v.is_finite() {
                        Expr::Num(v)
                    } else {
                        Expr::Unary(*f, bx(Expr::Num(x)))
                    }
                }
                e => Expr::Unary(*f, bx(e)),
            },
            Expr::Call(name, args) => {
                Expr::Call(name.clone(), args.iter().map(Expr::simplify).collect())
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num(v) => {
                if *v < 0.0 {
                    write!(f, "({v})")
                } else {
                    write!(f, "{v}")
                }
            }
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Add(a, b) => write!(f, "({a} + {b})"),
            Expr::Sub(a, b) => write!(f, "({a} - {b})"),
            Expr::Mul(a, b) => write!(f, "({a} * {b})"),
            Expr::Div(a, b) => write!(f, "({a} / {b})"),
            Expr::Pow(a, b) => write!(f, "({a} ^ {b})"),
            Expr::Neg(a) => write!(f, "(-{a})"),
            Expr::Unary(func, a) => write!(f, "{}({a})", func.name()),
            Expr::Call(name, args) => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn diff_of_square_is_linear() {
        let x2 = Expr::Pow(Box::new(Expr::var("x")), Box::new(Expr::num(2.0)));
        let d = x2.diff("x").simplify();
        for x in [-1.5, 0.0, 0.25, 3.0] {
            let v = d.eval_map(&vars(&[("x", x)])).unwrap();
            assert!((v - 2.0 * x).abs() < 1e-12, "d(x^2)/dx at {x} gave {v}");
        }
    }

    #[test]
    fn chain_rule_through_builtins() {
        // d/dx exp(3x) = 3 exp(3x)
        let e = Expr::Unary(
            UnaryFn::Exp,
            Box::new(Expr::Mul(Box::new(Expr::num(3.0)), Box::new(Expr::var("x")))),
        );
        let d = e.diff("x").simplify();
        for x in [-0.7f64, 0.1, 1.2] {
            let expected = 3.0 * (3.0 * x).exp();
            let v = d.eval_map(&vars(&[("x", x)])).unwrap();
            assert!((v - expected).abs() < 1e-9 * expected.abs().max(1.0));
        }
    }

    #[test]
    fn simplify_folds_constants() {
        // 2 * (3 * x) -> 6 * x, x + 0 -> x, x^1 -> x
        let e = Expr::Mul(
            Box::new(Expr::num(2.0)),
            Box::new(Expr::Mul(Box::new(Expr::num(3.0)), Box::new(Expr::var("x")))),
        );
        assert_eq!(
            e.simplify(),
            Expr::Mul(Box::new(Expr::num(6.0)), Box::new(Expr::var("x")))
        );
        let e = Expr::Add(Box::new(Expr::var("x")), Box::new(Expr::num(0.0)));
        assert_eq!(e.simplify(), Expr::var("x"));
        let e = Expr::Pow(Box::new(Expr::var("x")), Box::new(Expr::num(1.0)));
        assert_eq!(e.simplify(), Expr::var("x"));
    }

    #[test]
    fn display_round_trips_through_parser() {
        let e = Expr::Sub(
            Box::new(Expr::Pow(Box::new(Expr::var("x")), Box::new(Expr::num(2.0)))),
            Box::new(Expr::Unary(UnaryFn::Cos, Box::new(Expr::var("y")))),
        );
        let text = e.to_string();
        let parsed = crate::symbolic::parser::parse(&text).unwrap();
        let values = vars(&[("x", 1.3), ("y", -0.4)]);
        assert_eq!(parsed.eval_map(&values), e.eval_map(&values));
    }
}
