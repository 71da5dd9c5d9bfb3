pub struct DefaultsConfig {
    pub protocol: &'static str,
    pub workflow: &'static str,
    pub optimizer: &'static str,
    pub iters: usize,
    pub tries: usize,
    pub semigreedy_models: usize,
    pub use_plddt: bool,
    pub save_best: bool,
    pub profile_smoothing: f64,
    pub num_recycle: usize,
    pub verbose: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            protocol: "fixbb",
            workflow: "3stage",
            optimizer: "sgd",
            iters: 100,
            tries: 20,
            semigreedy_models: 1,
            use_plddt: true,
            save_best: true,
            profile_smoothing: 0.1,
            num_recycle: 3,
            verbose: 10,
        }
    }
}
