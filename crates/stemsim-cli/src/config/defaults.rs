/// Built-in values for every setting the config file and CLI may leave out.
pub struct DefaultsConfig {
    pub algorithm: &'static str,
    pub energy_kev: f64,
    pub probe_semiangle_mrad: f64,
    pub pixel_size: [f64; 2],
    pub probe_step: [f64; 2],
    pub potential_bound: f64,
    pub interpolation_factor: [usize; 2],
    pub tile: [usize; 3],
    pub num_fp: usize,
    pub include_thermal_effects: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            algorithm: "prism",
            energy_kev: 80.0,
            probe_semiangle_mrad: 20.0,
            pixel_size: [0.1, 0.1],
            probe_step: [0.25, 0.25],
            potential_bound: 3.0,
            interpolation_factor: [4, 4],
            tile: [1, 1, 1],
            num_fp: 1,
            include_thermal_effects: true,
        }
    }
}
