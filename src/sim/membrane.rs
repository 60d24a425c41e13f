use crate::geometry::{FluxDirection, PixelMembrane};
use crate::pde::{Model, Pde, PdeOptions};
use crate::sim::compartment::SimCompartment;
use crate::sim::{IntegratorOptions, SimulatorError};
use crate::symbolic::{CompiledProg, SymbolicSource};
use glam::DVec2;
use log::debug;

/// Transport reactions across one membrane, evaluated per pixel pair.
///
/// The compiled rate gives a surface flux (amount per membrane area);
/// dividing by the voxel length in the flux direction converts it to a
/// concentration change in the two adjacent pixels.
pub struct SimMembrane {
    membrane_id: String,
    membrane: PixelMembrane,
    prog: CompiledProg,
    n_species_a: usize,
    n_species_b: usize,
    n_extra_vars: usize,
    pixel_size: DVec2,
}

impl SimMembrane {
    pub fn new(
        model: &Model,
        membrane_id: &str,
        membrane: PixelMembrane,
        comp_a: &SimCompartment,
        comp_b: &SimCompartment,
        time_dependent: bool,
        space_dependent: bool,
        pixel_size: DVec2,
        options: &IntegratorOptions,
    ) -> Result<Self, SimulatorError> {
        let mut species_ids: Vec<String> = comp_a.species_ids().to_vec();
        species_ids.extend(comp_b.species_ids().iter().cloned());
        let n_species_a = comp_a.species_ids().len();
        let n_species_b = comp_b.species_ids().len();

        let mut extra_variables = Vec::new();
        if time_dependent {
            extra_variables.push("time".to_string());
        }
        if space_dependent {
            extra_variables.push("x".to_string());
            extra_variables.push("y".to_string());
        }
        let n_extra_vars = extra_variables.len();
        let reaction_ids = model.reaction_ids_in(membrane_id);
        debug!(
            "membrane {}: {} reactions, {} pixel pairs",
            membrane_id,
            reaction_ids.len(),
            membrane.n_pairs()
        );
        let pde_options = PdeOptions {
            extra_variables: extra_variables.clone(),
            ..PdeOptions::default()
        };
        let pde = Pde::new(model, &species_ids, &reaction_ids, &pde_options)?;
        let mut expressions: Vec<String> = pde.rhs().to_vec();
        if time_dependent {
            expressions.push("1".to_string());
        }
        if space_dependent {
            expressions.push("0".to_string());
            expressions.push("0".to_string());
        }
        let mut variables = species_ids;
        variables.extend(extra_variables);
        let expression_refs: Vec<&str> = expressions.iter().map(String::as_str).collect();
        let source = SymbolicSource::new(&expression_refs, &variables, &[], &[]);
        if !source.is_valid() {
            return Err(SimulatorError::Compile(source.error_message().to_string()));
        }
        let prog = source
            .compile(options.compile)
            .map_err(SimulatorError::Compile)?;
        Ok(Self {
            membrane_id: membrane_id.to_string(),
            membrane,
            prog,
            n_species_a,
            n_species_b,
            n_extra_vars,
            pixel_size,
        })
    }

    pub fn membrane_id(&self) -> &str {
        &self.membrane_id
    }

    /// Index of compartment A/B in the simulator's compartment list.
    pub fn compartment_a(&self) -> usize {
        self.membrane.compartment_a()
    }

    pub fn compartment_b(&self) -> usize {
        self.membrane.compartment_b()
    }

    /// Add the membrane reaction contributions to both compartments' dc/dt.
    pub fn evaluate_reactions(&self, a: &mut SimCompartment, b: &mut SimCompartment) {
        let ns_tot_a = a.n_species_with_extras();
        let ns_tot_b = b.n_species_with_extras();
        let (n_a, n_b, n_extra) = (self.n_species_a, self.n_species_b, self.n_extra_vars);
        let (conc_a, dcdt_a) = a.conc_and_dcdt_mut();
        let (conc_b, dcdt_b) = b.conc_and_dcdt_mut();
        let mut species = vec![0.0; n_a + n_b + n_extra];
        let mut result = vec![0.0; n_a + n_b + n_extra];
        let mut scratch = self.prog.make_scratch();
        for (direction, flux_length) in [
            (FluxDirection::X, self.pixel_size.x),
            (FluxDirection::Y, self.pixel_size.y),
        ] {
            for &(ia, ib) in self.membrane.index_pairs(direction) {
                species[..n_a].copy_from_slice(&conc_a[ia * ns_tot_a..ia * ns_tot_a + n_a]);
                species[n_a..n_a + n_b]
                    .copy_from_slice(&conc_b[ib * ns_tot_b..ib * ns_tot_b + n_b]);
                // time/space values are shared, take them from side A
                species[n_a + n_b..]
                    .copy_from_slice(&conc_a[ia * ns_tot_a + n_a..ia * ns_tot_a + n_a + n_extra]);
                self.prog
                    .eval_with_scratch(&mut scratch, &mut result, &species);
                for is in 0..n_a {
                    dcdt_a[ia * ns_tot_a + is] += result[is] / flux_length;
                }
                for is in 0..n_b {
                    dcdt_b[ib * ns_tot_b + is] += result[n_a + is] / flux_length;
                }
            }
        }
    }
}
