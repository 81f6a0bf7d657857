//! KV cache admission control for sweep grid points

use serde::{Deserialize, Serialize};

/// One point of the prompt length x generation length x parallelism grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPoint {
    pub prompt_len: usize,
    pub gen_len: usize,
    pub parallelism: usize,
}

impl GridPoint {
    pub fn new(prompt_len: usize, gen_len: usize, parallelism: usize) -> Self {
        Self {
            prompt_len,
            gen_len,
            parallelism,
        }
    }

    /// KV cache slots needed to run this point to completion
    ///
    /// With a shared prefill the prompt is cached once and every sequence
    /// only adds its own generated tokens.
    pub fn required_slots(&self, shared_prefill: bool) -> usize {
        if shared_prefill {
            self.parallelism
                .saturating_mul(self.gen_len)
                .saturating_add(self.prompt_len)
        } else {
            self.parallelism
                .saturating_mul(self.prompt_len.saturating_add(self.gen_len))
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { required_slots: usize },
    Rejected { required_slots: usize },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }

    pub fn required_slots(&self) -> usize {
        match *self {
            Admission::Admitted { required_slots } | Admission::Rejected { required_slots } => {
                required_slots
            }
        }
    }
}

/// Decide whether `point` fits in a cache of `cache_budget` slots.
/// An exact fit is admitted.
pub fn admit(point: &GridPoint, shared_prefill: bool, cache_budget: usize) -> Admission {
    let required_slots = point.required_slots(shared_prefill);
    if required_slots <= cache_budget && required_slots != usize::MAX {
        Admission::Admitted { required_slots }
    } else {
        Admission::Rejected { required_slots }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_slots_table() {
        let cases = [
            // (pp, tg, pl, shared, expected)
            (128, 32, 1, false, 160),
            (128, 32, 2, false, 320),
            (128, 32, 2, true, 192),
            (512, 128, 4, false, 2560),
            (512, 128, 4, true, 1024),
            (0, 16, 8, false, 128),
            (0, 16, 8, true, 128),
            (64, 0, 3, false, 192),
            (64, 0, 3, true, 64),
            (7680, 256, 32, false, 253_952),
        ];

        for (pp, tg, pl, shared, expected) in cases {
            let point = GridPoint::new(pp, tg, pl);
            assert_eq!(
                point.required_slots(shared),
                expected,
                "pp={} tg={} pl={} shared={}",
                pp,
                tg,
                pl,
                shared
            );
        }
    }

    #[test]
    fn test_exact_fit_is_admitted() {
        let point = GridPoint::new(100, 50, 2);
        assert_eq!(admit(&point, false, 300), Admission::Admitted { required_slots: 300 });
        assert_eq!(admit(&point, false, 299), Admission::Rejected { required_slots: 300 });
    }

    #[test]
    fn test_shared_prefill_admits_more() {
        let point = GridPoint::new(128, 32, 2);
        assert!(!admit(&point, false, 300).is_admitted());
        assert!(admit(&point, true, 300).is_admitted());
    }

    #[test]
    fn test_overflow_is_rejected() {
        let point = GridPoint::new(usize::MAX, 1, 2);
        let admission = admit(&point, false, usize::MAX);
        assert!(!admission.is_admitted());
        assert_eq!(admission.required_slots(), usize::MAX);
    }
}
