// Parameter initialization
//
// Parameters are recorded in the graph together with HOW the engine should
// fill them. Weights default to Glorot/Xavier uniform: U(-a, a) with
// a = sqrt(6 / (fan_in + fan_out)); biases and statistics start constant.
//
// Every Xavier init carries its own seed, drawn from the network's random
// generator, so that a build with the same seed yields the same values and
// every weight still gets an independent stream.

use rand::rngs::StdRng;
use rand::Rng;

use wren_core::Init;

/// Seeds are kept below 2^31 so every engine can take them as int32.
pub const MAX_SEED: u64 = 1 << 31;

/// Draw a fresh seed.
pub fn seed(rng: &mut StdRng) -> u64 {
    rng.gen_range(0..MAX_SEED)
}

/// Glorot/Xavier uniform with a fresh seed.
pub fn xavier_uniform(rng: &mut StdRng) -> Init {
    Init::XavierUniform { seed: seed(rng) }
}

pub fn zeros() -> Init {
    Init::Constant(0.0)
}

pub fn ones() -> Init {
    Init::Constant(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_seeds_are_reproducible() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let sa: Vec<u64> = (0..4).map(|_| seed(&mut a)).collect();
        let sb: Vec<u64> = (0..4).map(|_| seed(&mut b)).collect();
        assert_eq!(sa, sb);
        assert!(sa.iter().all(|s| *s < MAX_SEED));
    }
}
