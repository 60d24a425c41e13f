pub mod compile;
pub mod expr;
pub mod parser;

pub use compile::{CompileOptions, CompiledProg};
pub use expr::{Expr, UnaryFn};
pub use parser::{ParseError, parse};

use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};

/// A user-defined function: `id(args...) = body`, inlined wherever it is
/// called. `name` is the human-readable label used in error messages.
#[derive(Clone, Debug)]
pub struct SymbolicFunction {
    pub id: String,
    pub name: String,
    pub args: Vec<String>,
    pub body: String,
}

const MAX_INLINE_DEPTH: usize = 1024;

/// A batch of parsed symbolic expressions over a declared variable set.
///
/// Parsing validates every symbol against the declared variables, constants
/// and functions; failures are stored on the instance (`is_valid` /
/// `error_message`) rather than returned, since expression editing is
/// expected to be transiently invalid. Compilation consumes the source and
/// yields a [`CompiledProg`], so a compiled batch can no longer be
/// relabelled or rescaled by construction.
pub struct SymbolicSource {
    expr_original: Vec<Expr>,
    expr_inlined: Vec<Expr>,
    variables: Vec<String>,
    valid: bool,
    error_message: String,
}

impl SymbolicSource {
    pub fn new(
        expressions: &[&str],
        variables: &[String],
        constants: &[(String, f64)],
        functions: &[SymbolicFunction],
    ) -> Self {
        let mut source = Self {
            expr_original: Vec::new(),
            expr_inlined: Vec::new(),
            variables: variables.to_vec(),
            valid: false,
            error_message: String::new(),
        };
        if let Err(message) = source.parse_all(expressions, constants, functions) {
            warn!("{message}");
            source.error_message = message;
            return source;
        }
        source.valid = true;
        source
    }

    /// Single-expression convenience constructor.
    pub fn new_single(
        expression: &str,
        variables: &[String],
        constants: &[(String, f64)],
        functions: &[SymbolicFunction],
    ) -> Self {
        Self::new(&[expression], variables, constants, functions)
    }

    fn parse_all(
        &mut self,
        expressions: &[&str],
        constants: &[(String, f64)],
        functions: &[SymbolicFunction],
    ) -> Result<(), String> {
        // function bodies are parsed once up front
        let mut bodies: HashMap<&str, (&SymbolicFunction, Expr)> = HashMap::new();
        for f in functions {
            let body = parser::parse(&f.body)
                .map_err(|e| format!("Error parsing function '{}': {e}", f.name))?;
            bodies.insert(f.id.as_str(), (f, body));
        }
        let constant_map: HashMap<String, Expr> = constants
            .iter()
            .map(|(name, value)| (name.clone(), Expr::Num(*value)))
            .collect();
        for &expression in expressions {
            debug!("parsing expression '{expression}'");
            let parsed = parser::parse(expression)
                .map_err(|e| format!("Error parsing expression '{expression}': {e}"))?;
            let inlined = inline_functions(&parsed, &bodies)
                .map_err(|e| format!("Error parsing expression '{expression}': {e}"))?;
            let inlined = inlined.subst(&constant_map).simplify();
            // every remaining call is unknown by now
            let mut calls = BTreeSet::new();
            inlined.call_names(&mut calls);
            if let Some(name) = calls.first() {
                return Err(format!(
                    "Error parsing expression '{expression}': Unknown function '{name}'"
                ));
            }
            // and every remaining free symbol must be a declared variable
            let mut free = BTreeSet::new();
            inlined.free_vars(&mut free);
            for symbol in &free {
                if !self.variables.contains(symbol) {
                    let position = expression
                        .find(symbol.as_str())
                        .map(|p| format!(" at position {p}"))
                        .unwrap_or_default();
                    return Err(format!(
                        "Error parsing expression '{expression}': Unknown symbol '{symbol}'{position}"
                    ));
                }
            }
            self.expr_original.push(parsed);
            self.expr_inlined.push(inlined);
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn n_expressions(&self) -> usize {
        self.expr_inlined.len()
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// The parsed (unsimplified, uninlined) form of expression `i`.
    pub fn expr(&self, i: usize) -> String {
        self.expr_original[i].to_string()
    }

    /// Expression `i` with constants and function bodies substituted in and
    /// algebraically simplified.
    pub fn inlined_expr(&self, i: usize) -> String {
        self.expr_inlined[i].to_string()
    }

    pub fn inlined(&self, i: usize) -> &Expr {
        &self.expr_inlined[i]
    }

    /// Simplified symbolic partial derivative of expression `i` with respect
    /// to `var`.
    pub fn diff(&self, var: &str, i: usize) -> String {
        self.expr_inlined[i].diff(var).simplify().to_string()
    }

    pub fn diff_expr(&self, var: &str, i: usize) -> Expr {
        self.expr_inlined[i].diff(var).simplify()
    }

    /// Rename the free-variable set in declaration order. A length mismatch
    /// is logged and ignored, leaving the source unchanged.
    pub fn relabel(&mut self, new_variables: &[String]) {
        if new_variables.len() != self.variables.len() {
            warn!(
                "cannot relabel variables: newVariables size {} does not match number of existing variables {}",
                new_variables.len(),
                self.variables.len()
            );
            return;
        }
        let map: HashMap<String, Expr> = self
            .variables
            .iter()
            .zip(new_variables)
            .map(|(old, new)| (old.clone(), Expr::var(new.clone())))
            .collect();
        for e in self.expr_inlined.iter_mut().chain(&mut self.expr_original) {
            *e = e.subst(&map);
        }
        self.variables = new_variables.to_vec();
    }

    /// Multiply every non-excluded variable occurrence by `factor`, e.g. to
    /// nondimensionalize reaction terms.
    pub fn rescale(&mut self, factor: f64, exclusions: &[String]) {
        let map: HashMap<String, Expr> = self
            .variables
            .iter()
            .filter(|v| !exclusions.contains(v))
            .map(|v| {
                (
                    v.clone(),
                    Expr::Mul(Box::new(Expr::Num(factor)), Box::new(Expr::var(v.clone()))),
                )
            })
            .collect();
        for e in self.expr_inlined.iter_mut().chain(&mut self.expr_original) {
            *e = e.subst(&map).simplify();
        }
    }

    /// Ahead-of-time compilation of all expressions into one batch-evaluatable
    /// program. Consumes the source: a compiled batch cannot be relabelled or
    /// rescaled, by construction rather than by runtime check.
    pub fn compile(self, options: CompileOptions) -> Result<CompiledProg, String> {
        if !self.valid {
            return Err(format!(
                "Error compiling expression: {}",
                self.error_message
            ));
        }
        CompiledProg::build(&self.expr_inlined, &self.variables, options)
            .map_err(|e| format!("Error compiling expression: {e}"))
    }
}

fn inline_functions(
    expr: &Expr,
    functions: &HashMap<&str, (&SymbolicFunction, Expr)>,
) -> Result<Expr, String> {
    let mut current = expr.clone();
    for _ in 0..MAX_INLINE_DEPTH {
        let mut calls = BTreeSet::new();
        current.call_names(&mut calls);
        if !calls.iter().any(|c| functions.contains_key(c.as_str())) {
            return Ok(current);
        }
        current = replace_calls(&current, functions)?;
    }
    Err("Recursive function calls are not supported".to_string())
}

fn replace_calls(
    expr: &Expr,
    functions: &HashMap<&str, (&SymbolicFunction, Expr)>,
) -> Result<Expr, String> {
    let recurse = |e: &Expr| replace_calls(e, functions);
    Ok(match expr {
        Expr::Num(_) | Expr::Var(_) => expr.clone(),
        Expr::Add(a, b) => Expr::Add(Box::new(recurse(a)?), Box::new(recurse(b)?)),
        Expr::Sub(a, b) => Expr::Sub(Box::new(recurse(a)?), Box::new(recurse(b)?)),
        Expr::Mul(a, b) => Expr::Mul(Box::new(recurse(a)?), Box::new(recurse(b)?)),
        Expr::Div(a, b) => Expr::Div(Box::new(recurse(a)?), Box::new(recurse(b)?)),
        Expr::Pow(a, b) => Expr::Pow(Box::new(recurse(a)?), Box::new(recurse(b)?)),
        Expr::Neg(a) => Expr::Neg(Box::new(recurse(a)?)),
        Expr::Unary(f, a) => Expr::Unary(*f, Box::new(recurse(a)?)),
        Expr::Call(name, args) => {
            let args: Vec<Expr> = args.iter().map(recurse).collect::<Result<_, _>>()?;
            match functions.get(name.as_str()) {
                None => Expr::Call(name.clone(), args),
                Some((f, body)) => {
                    if args.len() != f.args.len() {
                        return Err(format!(
                            "Function '{}' requires {} argument(s), found {}",
                            f.name,
                            f.args.len(),
                            args.len()
                        ));
                    }
                    let arg_map: HashMap<String, Expr> =
                        f.args.iter().cloned().zip(args).collect();
                    body.subst(&arg_map)
                }
            }
        }
    })
}
