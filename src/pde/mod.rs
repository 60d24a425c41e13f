use crate::symbolic::{Expr, SymbolicFunction, SymbolicSource};
use log::debug;
use nalgebra::DMatrix;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdeError {
    #[error("unknown reaction id '{0}'")]
    UnknownReaction(String),
    #[error("{0}")]
    InvalidExpression(String),
}

/// How a species concentration field starts off.
#[derive(Clone, Debug)]
pub enum InitialConcentration {
    Uniform(f64),
    /// Analytic expression of the physical coordinates `x` and `y`.
    Analytic(String),
    /// Per-pixel values in raster order over the full geometry image,
    /// multiplied by `scale`.
    Image { values: Vec<f64>, scale: f64 },
}

#[derive(Clone, Debug)]
pub struct CompartmentDef {
    pub id: String,
    pub colour: u32,
}

#[derive(Clone, Debug)]
pub struct MembraneDef {
    pub id: String,
    pub compartment_a: String,
    pub compartment_b: String,
}

#[derive(Clone, Debug)]
pub struct SpeciesDef {
    pub id: String,
    pub compartment_id: String,
    pub diffusion_constant: f64,
    pub initial: InitialConcentration,
    /// Non-spatial species are treated as well-mixed: their rate of change
    /// is spatially averaged each step.
    pub is_spatial: bool,
}

/// One reaction of the model: a rate law attached to a compartment or
/// membrane, with signed stoichiometry (consumption negative, production
/// positive) and reaction-local named constants.
#[derive(Clone, Debug)]
pub struct ReactionDef {
    pub id: String,
    pub domain_id: String,
    pub rate_expression: String,
    pub stoichiometry: Vec<(String, f64)>,
    pub constants: Vec<(String, f64)>,
}

/// The consumed model-bookkeeping contract: id lists, stoichiometry source
/// data and rate-law strings for one spatial model. The full SBML document
/// handling lives outside this crate; this is the part the assembler and
/// simulator read.
#[derive(Clone, Debug, Default)]
pub struct Model {
    pub name: String,
    pub compartments: Vec<CompartmentDef>,
    pub membranes: Vec<MembraneDef>,
    pub species: Vec<SpeciesDef>,
    pub reactions: Vec<ReactionDef>,
    pub constants: Vec<(String, f64)>,
    pub functions: Vec<SymbolicFunction>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn species_ids_in(&self, compartment_id: &str) -> Vec<String> {
        self.species
            .iter()
            .filter(|s| s.compartment_id == compartment_id)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn reaction_ids_in(&self, domain_id: &str) -> Vec<String> {
        self.reactions
            .iter()
            .filter(|r| r.domain_id == domain_id)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn species(&self, id: &str) -> Option<&SpeciesDef> {
        self.species.iter().find(|s| s.id == id)
    }

    pub fn reaction(&self, id: &str) -> Option<&ReactionDef> {
        self.reactions.iter().find(|r| r.id == id)
    }
}

/// Stoichiometry matrix and rate-law strings for one simulation domain.
///
/// `matrix[(i, j)]` is the signed coefficient of species `i` in reaction
/// `j`; species outside the requested list simply do not appear.
pub struct Reaction {
    species_ids: Vec<String>,
    expressions: Vec<String>,
    matrix: DMatrix<f64>,
    constants: Vec<Vec<(String, f64)>>,
}

impl Reaction {
    pub fn new(
        model: &Model,
        species_ids: &[String],
        reaction_ids: &[String],
    ) -> Result<Self, PdeError> {
        let mut matrix = DMatrix::zeros(species_ids.len(), reaction_ids.len());
        let mut expressions = Vec::with_capacity(reaction_ids.len());
        let mut constants = Vec::with_capacity(reaction_ids.len());
        for (j, reaction_id) in reaction_ids.iter().enumerate() {
            let reaction = model
                .reaction(reaction_id)
                .ok_or_else(|| PdeError::UnknownReaction(reaction_id.clone()))?;
            for (species_id, coefficient) in &reaction.stoichiometry {
                if let Some(i) = species_ids.iter().position(|s| s == species_id) {
                    matrix[(i, j)] += coefficient;
                }
            }
            expressions.push(reaction.rate_expression.clone());
            constants.push(reaction.constants.clone());
            debug!(
                "reaction {}: rate '{}'",
                reaction_id, reaction.rate_expression
            );
        }
        Ok(Self {
            species_ids: species_ids.to_vec(),
            expressions,
            matrix,
            constants,
        })
    }

    pub fn size(&self) -> usize {
        self.expressions.len()
    }

    pub fn species_ids(&self) -> &[String] {
        &self.species_ids
    }

    pub fn expression(&self, reaction_index: usize) -> &str {
        &self.expressions[reaction_index]
    }

    pub fn matrix_element(&self, species_index: usize, reaction_index: usize) -> f64 {
        self.matrix[(species_index, reaction_index)]
    }

    pub fn constants(&self, reaction_index: usize) -> &[(String, f64)] {
        &self.constants[reaction_index]
    }
}

/// Rescaling applied while assembling the PDE, for nondimensionalized units.
#[derive(Clone, Copy, Debug)]
pub struct PdeScaleFactors {
    pub species: f64,
    pub reaction: f64,
}

impl Default for PdeScaleFactors {
    fn default() -> Self {
        Self {
            species: 1.0,
            reaction: 1.0,
        }
    }
}

/// Optional knobs for [`Pde::new`]; the defaults assemble the plain
/// unscaled system in the model's own species names.
#[derive(Clone, Debug, Default)]
pub struct PdeOptions {
    /// Rename species in the assembled expressions, e.g. to evaluate the
    /// same PDE in a finite-difference neighbour context.
    pub relabelled_species_ids: Vec<String>,
    pub scale_factors: PdeScaleFactors,
    /// Extra free variables the rate laws may reference (e.g. time and the
    /// spatial coordinates). Never rescaled.
    pub extra_variables: Vec<String>,
    pub relabelled_extra_variables: Vec<String>,
    /// Name/value overrides applied on top of the model constants.
    pub substitutions: Vec<(String, f64)>,
}

/// The assembled reaction part of the PDE for one domain: for each species
/// `i`, `RHS_i = reactionScale * sum_j M[i][j] * rate_j(speciesScale *
/// species)`, plus the full Jacobian `dRHS_i/dvar_k` over all declared
/// variables. Immutable once constructed.
#[derive(Debug)]
pub struct Pde {
    rhs: Vec<String>,
    jacobian: Vec<Vec<String>>,
}

impl Pde {
    pub fn new(
        model: &Model,
        species_ids: &[String],
        reaction_ids: &[String],
        options: &PdeOptions,
    ) -> Result<Self, PdeError> {
        let reaction = Reaction::new(model, species_ids, reaction_ids)?;
        let mut variables = species_ids.to_vec();
        variables.extend(options.extra_variables.iter().cloned());

        // parse and inline each rate law against the declared variable set
        let mut rates: Vec<Expr> = Vec::with_capacity(reaction.size());
        for j in 0..reaction.size() {
            let mut constants = model.constants.clone();
            constants.extend(reaction.constants(j).iter().cloned());
            constants.extend(options.substitutions.iter().cloned());
            let source = SymbolicSource::new_single(
                reaction.expression(j),
                &variables,
                &constants,
                &model.functions,
            );
            if !source.is_valid() {
                return Err(PdeError::InvalidExpression(
                    source.error_message().to_string(),
                ));
            }
            rates.push(source.inlined(0).clone());
        }

        // species rescaling: v -> speciesScale * v, extra variables excluded
        let species_scale_map: HashMap<String, Expr> = if options.scale_factors.species != 1.0 {
            species_ids
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        Expr::Mul(
                            Box::new(Expr::Num(options.scale_factors.species)),
                            Box::new(Expr::var(id.clone())),
                        ),
                    )
                })
                .collect()
        } else {
            HashMap::new()
        };

        let relabel_map: HashMap<String, Expr> = {
            let mut map = HashMap::new();
            if !options.relabelled_species_ids.is_empty() {
                assert_eq!(
                    options.relabelled_species_ids.len(),
                    species_ids.len(),
                    "relabelled species ids must match species ids"
                );
                for (old, new) in species_ids.iter().zip(&options.relabelled_species_ids) {
                    map.insert(old.clone(), Expr::var(new.clone()));
                }
            }
            if !options.relabelled_extra_variables.is_empty() {
                assert_eq!(
                    options.relabelled_extra_variables.len(),
                    options.extra_variables.len(),
                    "relabelled extra variables must match extra variables"
                );
                for (old, new) in options
                    .extra_variables
                    .iter()
                    .zip(&options.relabelled_extra_variables)
                {
                    map.insert(old.clone(), Expr::var(new.clone()));
                }
            }
            map
        };

        let mut rhs = Vec::with_capacity(species_ids.len());
        let mut jacobian = Vec::with_capacity(species_ids.len());
        for i in 0..species_ids.len() {
            let mut sum: Option<Expr> = None;
            for (j, rate) in rates.iter().enumerate() {
                let m = reaction.matrix_element(i, j);
                if m == 0.0 {
                    continue;
                }
                let term = Expr::Mul(Box::new(Expr::Num(m)), Box::new(rate.clone()));
                sum = Some(match sum {
                    None => term,
                    Some(acc) => Expr::Add(Box::new(acc), Box::new(term)),
                });
            }
            // a domain without reactions still has a well-formed all-zero RHS
            let mut expr = sum.unwrap_or(Expr::Num(0.0));
            if !species_scale_map.is_empty() {
                expr = expr.subst(&species_scale_map);
            }
            if options.scale_factors.reaction != 1.0 {
                expr = Expr::Mul(
                    Box::new(Expr::Num(options.scale_factors.reaction)),
                    Box::new(expr),
                );
            }
            let expr = expr.simplify();
            let mut jac_row = Vec::with_capacity(variables.len());
            for var in &variables {
                let mut d = expr.diff(var).simplify();
                if !relabel_map.is_empty() {
                    d = d.subst(&relabel_map);
                }
                jac_row.push(d.to_string());
            }
            let expr = if relabel_map.is_empty() {
                expr
            } else {
                expr.subst(&relabel_map)
            };
            debug!("RHS[{}] = {}", species_ids[i], expr);
            rhs.push(expr.to_string());
            jacobian.push(jac_row);
        }
        Ok(Self { rhs, jacobian })
    }

    pub fn rhs(&self) -> &[String] {
        &self.rhs
    }

    pub fn jacobian(&self) -> &[Vec<String>] {
        &self.jacobian
    }
}
