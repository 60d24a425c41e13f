use crate::sim::AvgMinMax;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Write data to CSV file with headers
pub fn write_csv<P: AsRef<Path>>(path: P, headers: &[&str], data: &[Vec<f64>]) -> io::Result<()> {
    if !headers.is_empty() && !data.is_empty() && headers.len() != data.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Headers count ({}) doesn't match data columns ({})",
                headers.len(),
                data.len()
            ),
        ));
    }

    let mut file = File::create(path)?;

    writeln!(file, "{}", headers.join(","))?;

    let n_rows = data.iter().map(|col| col.len()).max().unwrap_or(0);

    for i in 0..n_rows {
        let row: Vec<String> = data
            .iter()
            .map(|col| {
                if i < col.len() {
                    format!("{:.15e}", col[i])
                } else {
                    String::new()
                }
            })
            .collect();
        writeln!(file, "{}", row.join(","))?;
    }

    Ok(())
}

/// Write a per-pixel concentration field as `x,y,conc` rows.
pub fn write_concentration_field<P: AsRef<Path>>(
    path: P,
    voxels: &[(usize, usize)],
    values: &[f64],
) -> io::Result<()> {
    if voxels.len() != values.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Voxel and value lengths don't match ({} vs {})",
                voxels.len(),
                values.len()
            ),
        ));
    }
    let xs: Vec<f64> = voxels.iter().map(|&(x, _)| x as f64).collect();
    let ys: Vec<f64> = voxels.iter().map(|&(_, y)| y as f64).collect();
    write_csv(path, &["x", "y", "conc"], &[xs, ys, values.to_vec()])
}

/// Write the time evolution of one species' summary statistics.
pub fn write_species_stats<P: AsRef<Path>>(
    path: P,
    times: &[f64],
    stats: &[AvgMinMax],
) -> io::Result<()> {
    if times.len() != stats.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Time and stats lengths don't match ({} vs {})",
                times.len(),
                stats.len()
            ),
        ));
    }
    write_csv(
        path,
        &["time", "avg", "min", "max"],
        &[
            times.to_vec(),
            stats.iter().map(|s| s.avg).collect(),
            stats.iter().map(|s| s.min).collect(),
            stats.iter().map(|s| s.max).collect(),
        ],
    )
}
