use crate::cli::AberrationsArgs;
use crate::error::Result;
use stemsim::core::optics::aberration::{
    Aberration, normalize_and_override, read_aberrations_from_path,
};
use stemsim::core::optics::probe::electron_wavelength;
use stemsim::engine::error::EngineError;
use tracing::info;

pub fn run(args: AberrationsArgs) -> Result<()> {
    let terms = read_aberrations_from_path(&args.path).map_err(EngineError::from)?;
    let wavelength = electron_wavelength(args.energy);
    info!(
        wavelength,
        parsed = terms.len(),
        "Normalizing aberration table."
    );

    let normalized = normalize_and_override(terms, args.c1, args.c3, args.c5, wavelength);
    print!("{}", format_table(&normalized));
    Ok(())
}

fn format_table(terms: &[Aberration]) -> String {
    let mut table = format!("{:>3} {:>3} {:>16} {:>10}\n", "m", "n", "magnitude", "angle");
    for term in terms {
        table.push_str(&format!(
            "{:>3} {:>3} {:>16.6e} {:>10.3}\n",
            term.m, term.n, term.magnitude, term.angle
        ));
    }
    table
}
