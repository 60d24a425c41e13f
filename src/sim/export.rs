use crate::mesh::Mesh2d;
use crate::pde::{InitialConcentration, Model};
use std::fmt::Write as _;

/// Ini-style configuration consumed by the external finite-element solver,
/// paired with the Gmsh mesh from [`Mesh2d::to_msh`]. Only the input
/// contract is produced here; the solver itself lives outside this crate.
pub fn export_ini(model: &Model, mesh: &Mesh2d, mesh_filename: &str) -> String {
    let mut ini = String::new();
    let _ = writeln!(ini, "[model]");
    let _ = writeln!(ini, "name = {}", model.name);
    let _ = writeln!(ini);
    let _ = writeln!(ini, "[mesh]");
    let _ = writeln!(ini, "file = {mesh_filename}");
    let _ = writeln!(ini, "vertices = {}", mesh.vertices().len());
    let _ = writeln!(ini, "compartments = {}", mesh.n_compartments());
    for (i, compartment) in model.compartments.iter().enumerate() {
        let _ = writeln!(ini);
        let _ = writeln!(ini, "[compartment.{}]", compartment.id);
        let _ = writeln!(ini, "region = {}", i + 1);
        let species_ids = model.species_ids_in(&compartment.id);
        let _ = writeln!(ini, "species = {}", species_ids.join(" "));
        for id in &species_ids {
            let species = model.species(id).expect("species listed for compartment");
            let _ = writeln!(ini, "diffusion.{id} = {}", species.diffusion_constant);
            match &species.initial {
                InitialConcentration::Uniform(value) => {
                    let _ = writeln!(ini, "initial.{id} = {value}");
                }
                InitialConcentration::Analytic(expression) => {
                    let _ = writeln!(ini, "initial.{id} = {expression}");
                }
                InitialConcentration::Image { scale, .. } => {
                    let _ = writeln!(ini, "initial.{id} = field:{scale}");
                }
            }
        }
        for reaction_id in model.reaction_ids_in(&compartment.id) {
            let reaction = model.reaction(&reaction_id).expect("reaction exists");
            let _ = writeln!(ini, "reaction.{reaction_id} = {}", reaction.rate_expression);
        }
    }
    for membrane in &model.membranes {
        let reaction_ids = model.reaction_ids_in(&membrane.id);
        if reaction_ids.is_empty() {
            continue;
        }
        let _ = writeln!(ini);
        let _ = writeln!(ini, "[membrane.{}]", membrane.id);
        let _ = writeln!(
            ini,
            "compartments = {} {}",
            membrane.compartment_a, membrane.compartment_b
        );
        for reaction_id in reaction_ids {
            let reaction = model.reaction(&reaction_id).expect("reaction exists");
            let _ = writeln!(ini, "reaction.{reaction_id} = {}", reaction.rate_expression);
        }
    }
    ini
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::LabelImage;
    use crate::pde::{CompartmentDef, SpeciesDef};
    use glam::DVec2;

    #[test]
    fn ini_lists_mesh_and_species_sections() {
        let image = LabelImage::filled(6, 4, 7);
        let mesh = Mesh2d::new(&image, &[7], &[], &[1e9], DVec2::ONE, DVec2::ZERO).unwrap();
        let mut model = Model::new("demo");
        model.compartments.push(CompartmentDef {
            id: "cyto".to_string(),
            colour: 7,
        });
        model.species.push(SpeciesDef {
            id: "A".to_string(),
            compartment_id: "cyto".to_string(),
            diffusion_constant: 0.5,
            initial: InitialConcentration::Uniform(2.0),
            is_spatial: true,
        });
        let ini = export_ini(&model, &mesh, "demo.msh");
        assert!(ini.contains("[mesh]\nfile = demo.msh"));
        assert!(ini.contains("[compartment.cyto]"));
        assert!(ini.contains("diffusion.A = 0.5"));
        assert!(ini.contains("initial.A = 2"));
    }
}
