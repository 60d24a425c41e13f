use crate::symbolic::expr::{Expr, UnaryFn};
use std::collections::HashMap;

/// Knobs for the ahead-of-time lowering of expression trees.
///
/// `opt_level`: 0 = plain lowering, >= 1 constant folding, >= 3 also
/// strength-reduces small integer powers. Common-subexpression elimination
/// has its own switch so it can be toggled at any optimization level.
#[derive(Clone, Copy, Debug)]
pub struct CompileOptions {
    pub do_cse: bool,
    pub opt_level: u8,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            do_cse: true,
            opt_level: 3,
        }
    }
}

/// One operation of the flat register program. Instruction `i` writes slot
/// `n_vars + i`; variable values occupy the first `n_vars` slots.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Instr {
    Const(f64),
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    Pow(usize, usize),
    Powi(usize, i32),
    Neg(usize),
    Un(UnaryFn, usize),
}

/// Hashable structural key of an instruction, for CSE.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum InstrKey {
    Const(u64),
    Bin(u8, usize, usize),
    Powi(usize, i32),
    Neg(usize),
    Un(UnaryFn, usize),
}

fn key_of(instr: &Instr) -> InstrKey {
    match *instr {
        Instr::Const(v) => InstrKey::Const(v.to_bits()),
        Instr::Add(a, b) => InstrKey::Bin(0, a, b),
        Instr::Sub(a, b) => InstrKey::Bin(1, a, b),
        Instr::Mul(a, b) => InstrKey::Bin(2, a, b),
        Instr::Div(a, b) => InstrKey::Bin(3, a, b),
        Instr::Pow(a, b) => InstrKey::Bin(4, a, b),
        Instr::Powi(a, n) => InstrKey::Powi(a, n),
        Instr::Neg(a) => InstrKey::Neg(a),
        Instr::Un(f, a) => InstrKey::Un(f, a),
    }
}

/// A batch of expressions compiled to a flat numeric program.
///
/// Evaluation-only: the symbolic source it came from is gone, so the
/// relabel/rescale operations are not available on this type at all.
/// Move-only by default (no `Clone` needed, none derived) and safe to share
/// across worker threads once built.
pub struct CompiledProg {
    instrs: Vec<Instr>,
    result_slots: Vec<usize>,
    n_vars: usize,
}

struct Lowerer<'a> {
    instrs: Vec<Instr>,
    // slot -> known constant value, for folding
    const_values: Vec<Option<f64>>,
    memo: HashMap<InstrKey, usize>,
    options: CompileOptions,
    var_slots: &'a HashMap<&'a str, usize>,
    n_vars: usize,
}

impl<'a> Lowerer<'a> {
    fn emit(&mut self, instr: Instr) -> usize {
        // constant folding: if all operands are known, evaluate now
        if self.options.opt_level >= 1 {
            let value = match instr {
                Instr::Const(v) => Some(v),
                Instr::Add(a, b) => self.fold2(a, b, |x, y| x + y),
                Instr::Sub(a, b) => self.fold2(a, b, |x, y| x - y),
                Instr::Mul(a, b) => self.fold2(a, b, |x, y| x * y),
                Instr::Div(a, b) => self.fold2(a, b, |x, y| x / y),
                Instr::Pow(a, b) => self.fold2(a, b, f64::powf),
                Instr::Powi(a, n) => self.slot_const(a).map(|x| x.powi(n)),
                Instr::Neg(a) => self.slot_const(a).map(|x| -x),
                Instr::Un(f, a) => self.slot_const(a).map(|x| f.apply(x)),
            };
            if let Some(v) = value {
                if !matches!(instr, Instr::Const(_)) {
                    return self.emit(Instr::Const(v));
                }
            }
        }
        if self.options.do_cse {
            let key = key_of(&instr);
            if let Some(&slot) = self.memo.get(&key) {
                return slot;
            }
            let slot = self.push(instr);
            self.memo.insert(key, slot);
            return slot;
        }
        self.push(instr)
    }

    fn push(&mut self, instr: Instr) -> usize {
        let slot = self.n_vars + self.instrs.len();
        self.const_values.push(match instr {
            Instr::Const(v) => Some(v),
            _ => None,
        });
        self.instrs.push(instr);
        slot
    }

    fn slot_const(&self, slot: usize) -> Option<f64> {
        if slot < self.n_vars {
            return None;
        }
        self.const_values[slot - self.n_vars]
    }

    fn fold2(&self, a: usize, b: usize, f: impl Fn(f64, f64) -> f64) -> Option<f64> {
        Some(f(self.slot_const(a)?, self.slot_const(b)?))
    }

    fn lower(&mut self, expr: &Expr) -> Result<usize, String> {
        Ok(match expr {
            Expr::Num(v) => self.emit(Instr::Const(*v)),
            Expr::Var(name) => *self
                .var_slots
                .get(name.as_str())
                .ok_or_else(|| format!("Unknown symbol '{name}'"))?,
            Expr::Add(a, b) => {
                let (a, b) = (self.lower(a)?, self.lower(b)?);
                self.emit(Instr::Add(a, b))
            }
            Expr::Sub(a, b) => {
                let (a, b) = (self.lower(a)?, self.lower(b)?);
                self.emit(Instr::Sub(a, b))
            }
            Expr::Mul(a, b) => {
                let (a, b) = (self.lower(a)?, self.lower(b)?);
                self.emit(Instr::Mul(a, b))
            }
            Expr::Div(a, b) => {
                let (a, b) = (self.lower(a)?, self.lower(b)?);
                self.emit(Instr::Div(a, b))
            }
            Expr::Pow(a, b) => {
                // strength-reduce x^n for small integer n
                if self.options.opt_level >= 3 {
                    if let Expr::Num(n) = **b {
                        if n.fract() == 0.0 && n.abs() <= 8.0 {
                            let base = self.lower(a)?;
                            return Ok(self.emit(Instr::Powi(base, n as i32)));
                        }
                    }
                }
                let (a, b) = (self.lower(a)?, self.lower(b)?);
                self.emit(Instr::Pow(a, b))
            }
            Expr::Neg(a) => {
                let a = self.lower(a)?;
                self.emit(Instr::Neg(a))
            }
            Expr::Unary(f, a) => {
                let a = self.lower(a)?;
                self.emit(Instr::Un(*f, a))
            }
            Expr::Call(name, _) => {
                return Err(format!("Unknown function '{name}'"));
            }
        })
    }
}

impl CompiledProg {
    pub(crate) fn build(
        expressions: &[Expr],
        variables: &[String],
        options: CompileOptions,
    ) -> Result<Self, String> {
        let var_slots: HashMap<&str, usize> = variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.as_str(), i))
            .collect();
        let mut lowerer = Lowerer {
            instrs: Vec::new(),
            const_values: Vec::new(),
            memo: HashMap::new(),
            options,
            var_slots: &var_slots,
            n_vars: variables.len(),
        };
        let result_slots = expressions
            .iter()
            .map(|e| lowerer.lower(e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            instrs: lowerer.instrs,
            result_slots,
            n_vars: variables.len(),
        })
    }

    pub fn n_expressions(&self) -> usize {
        self.result_slots.len()
    }

    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    pub fn n_instructions(&self) -> usize {
        self.instrs.len()
    }

    /// Scratch buffer sized for [`CompiledProg::eval_with_scratch`]. Workers
    /// evaluating in parallel each keep their own.
    pub fn make_scratch(&self) -> Vec<f64> {
        vec![0.0; self.n_vars + self.instrs.len()]
    }

    /// Evaluate all expressions: `vars` in declaration order, one result per
    /// expression written to `results`.
    #[inline]
    pub fn eval_with_scratch(&self, scratch: &mut [f64], results: &mut [f64], vars: &[f64]) {
        debug_assert_eq!(vars.len(), self.n_vars);
        debug_assert_eq!(scratch.len(), self.n_vars + self.instrs.len());
        scratch[..self.n_vars].copy_from_slice(vars);
        for (i, instr) in self.instrs.iter().enumerate() {
            scratch[self.n_vars + i] = match *instr {
                Instr::Const(v) => v,
                Instr::Add(a, b) => scratch[a] + scratch[b],
                Instr::Sub(a, b) => scratch[a] - scratch[b],
                Instr::Mul(a, b) => scratch[a] * scratch[b],
                Instr::Div(a, b) => scratch[a] / scratch[b],
                Instr::Pow(a, b) => scratch[a].powf(scratch[b]),
                Instr::Powi(a, n) => scratch[a].powi(n),
                Instr::Neg(a) => -scratch[a],
                Instr::Un(f, a) => f.apply(scratch[a]),
            };
        }
        for (r, &slot) in results.iter_mut().zip(&self.result_slots) {
            *r = scratch[slot];
        }
    }

    /// Allocating convenience wrapper around
    /// [`CompiledProg::eval_with_scratch`].
    pub fn eval(&self, results: &mut [f64], vars: &[f64]) {
        let mut scratch = self.make_scratch();
        self.eval_with_scratch(&mut scratch, results, vars);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::SymbolicSource;

    fn compile(exprs: &[&str], vars: &[&str], options: CompileOptions) -> CompiledProg {
        let variables: Vec<String> = vars.iter().map(|s| s.to_string()).collect();
        let source = SymbolicSource::new(exprs, &variables, &[], &[]);
        assert!(source.is_valid(), "{}", source.error_message());
        source.compile(options).unwrap()
    }

    #[test]
    fn compiled_matches_direct_evaluation() {
        let prog = compile(&["x^2 + cos(x)"], &["x"], CompileOptions::default());
        let x = 1.345;
        let mut out = [0.0];
        prog.eval(&mut out, &[x]);
        assert!((out[0] - (x * x + x.cos())).abs() < 1e-9);
    }

    #[test]
    fn all_opt_levels_agree() {
        let exprs = ["(a + b)^3 / (1 + exp(-a)) + sqrt(b) * (a + b)^3"];
        let inputs = [[0.3, 2.1], [1.0, 1.0], [-0.5, 4.0]];
        let reference = compile(&exprs, &["a", "b"], CompileOptions {
            do_cse: false,
            opt_level: 0,
        });
        for do_cse in [false, true] {
            for opt_level in 0..=3 {
                let prog = compile(&exprs, &["a", "b"], CompileOptions { do_cse, opt_level });
                for input in &inputs {
                    let (mut out, mut expected) = ([0.0], [0.0]);
                    prog.eval(&mut out, input);
                    reference.eval(&mut expected, input);
                    assert!(
                        (out[0] - expected[0]).abs() < 1e-12 * expected[0].abs().max(1.0),
                        "cse={do_cse} opt={opt_level}: {} vs {}",
                        out[0],
                        expected[0]
                    );
                }
            }
        }
    }

    #[test]
    fn cse_shares_repeated_subtrees() {
        let with = compile(
            &["sin(a + b) * sin(a + b)"],
            &["a", "b"],
            CompileOptions { do_cse: true, opt_level: 0 },
        );
        let without = compile(
            &["sin(a + b) * sin(a + b)"],
            &["a", "b"],
            CompileOptions { do_cse: false, opt_level: 0 },
        );
        assert!(with.n_instructions() < without.n_instructions());
    }

    #[test]
    fn batch_results_are_in_expression_order() {
        let prog = compile(&["x + y", "x * y", "42"], &["x", "y"], CompileOptions::default());
        let mut out = [0.0; 3];
        prog.eval(&mut out, &[3.0, 4.0]);
        assert_eq!(out, [7.0, 12.0, 42.0]);
    }
}
