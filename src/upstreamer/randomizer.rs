//! Randomness source for endpoint selection, injectable for tests.

use rand::Rng;

pub trait Randomizer: Send + Sync {
    /// Two distinct indices in `0..len`. `len` is at least 2.
    fn pick_pair(&self, len: usize) -> (usize, usize);

    /// Uniform draw in `[0, upper]`.
    fn draw(&self, upper: f64) -> f64;
}

/// Thread-local RNG backed randomizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandomizer;

impl Randomizer for ThreadRandomizer {
    fn pick_pair(&self, len: usize) -> (usize, usize) {
        let mut rng = rand::thread_rng();
        let picked = rand::seq::index::sample(&mut rng, len, 2);
        (picked.index(0), picked.index(1))
    }

    fn draw(&self, upper: f64) -> f64 {
        if !upper.is_finite() || upper <= 0.0 {
            return 0.0;
        }
        // Scaling a unit draw stays finite for any finite bound.
        rand::thread_rng().gen::<f64>() * upper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_are_distinct_and_in_range() {
        let r = ThreadRandomizer;
        for _ in 0..500 {
            let (a, b) = r.pick_pair(3);
            assert_ne!(a, b);
            assert!(a < 3 && b < 3);
        }
    }

    #[test]
    fn draw_stays_in_bounds() {
        let r = ThreadRandomizer;
        assert_eq!(r.draw(0.0), 0.0);
        for _ in 0..500 {
            let d = r.draw(0.3);
            assert!((0.0..=0.3).contains(&d));
        }
    }

    #[test]
    fn draw_tolerates_extreme_bounds() {
        let r = ThreadRandomizer;
        assert_eq!(r.draw(f64::INFINITY), 0.0);
        assert_eq!(r.draw(f64::NAN), 0.0);
        assert_eq!(r.draw(-1.0), 0.0);
        for _ in 0..100 {
            let d = r.draw(f64::MAX);
            assert!(d.is_finite() && d >= 0.0);
        }
    }
}
