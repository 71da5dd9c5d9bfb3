use rand::SeedableRng;
use rand::rngs::StdRng;

/// A single-use random key. Each stochastic decision takes one key and turns
/// it into its own generator, so draws never share state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrngKey(u64);

impl PrngKey {
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn rng(self) -> StdRng {
        StdRng::seed_from_u64(self.0)
    }
}

/// Counter-based key generator. The n-th key depends only on the seed and n.
#[derive(Debug, Clone)]
pub struct KeyStream {
    seed: u64,
    counter: u64,
}

impl KeyStream {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            seed: seed.unwrap_or_else(rand::random),
            counter: 0,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of keys handed out so far.
    pub fn consumed(&self) -> u64 {
        self.counter
    }

    pub fn next_key(&mut self) -> PrngKey {
        let key = splitmix64(self.seed ^ splitmix64(self.counter));
        self.counter += 1;
        PrngKey(key)
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
