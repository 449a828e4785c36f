use crate::mutator::Mutator;
use crate::recombinator::Recombinator;
use rand::Rng;
use std::collections::BTreeMap;

/// One variation operator of either family, as picked by the strategy and
/// recorded in a chromosome's lineage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariationOp {
    Mutate(Mutator),
    Recombine(Recombinator),
}

impl VariationOp {
    pub fn name(self) -> &'static str {
        match self {
            VariationOp::Mutate(m) => m.name(),
            VariationOp::Recombine(r) => r.name(),
        }
    }

    /// Whether this operator needs a second parent.
    pub fn is_binary(self) -> bool {
        match self {
            VariationOp::Mutate(_) => false,
            VariationOp::Recombine(r) => r.is_binary(),
        }
    }
}

/// Adaptive operator selection.
///
/// The strategy keeps one weight table per family. Families alternate by a
/// `p_recomb` coin; within a family an operator is drawn proportionally to
/// its current weight. Operators that produce admitted children are
/// rewarded multiplicatively (`×(1+α)`), serialization failures are
/// penalized (`×(1−α)`); weights are renormalized per family and floored
/// so no operator ever starves completely.
#[derive(Debug, Clone)]
pub struct FuzzingStrategy {
    mutators: Vec<(Mutator, f64)>,
    recombinators: Vec<(Recombinator, f64)>,
    p_recomb: f64,
    alpha: f64,
    min_weight: f64,
}

impl FuzzingStrategy {
    /// Uniform weights within each family.
    pub fn new(p_recomb: f64, alpha: f64, min_weight: f64) -> Self {
        let mut strategy = FuzzingStrategy {
            mutators: Mutator::ALL.iter().map(|&m| (m, 1.0)).collect(),
            recombinators: Recombinator::ALL.iter().map(|&r| (r, 1.0)).collect(),
            p_recomb,
            alpha,
            min_weight,
        };
        strategy.normalize();
        strategy
    }

    /// Applies configured initial weights (by operator name) on top of the
    /// uniform default. Unknown names are ignored by the config layer
    /// before they get here.
    pub fn with_initial_weights(
        mut self,
        mutators: &BTreeMap<String, f64>,
        recombinators: &BTreeMap<String, f64>,
    ) -> Self {
        for (op, w) in &mut self.mutators {
            if let Some(&configured) = mutators.get(op.name()) {
                *w = configured.max(0.0);
            }
        }
        for (op, w) in &mut self.recombinators {
            if let Some(&configured) = recombinators.get(op.name()) {
                *w = configured.max(0.0);
            }
        }
        self.normalize();
        self
    }

    /// Draws the next operator: family first, then weight-proportional
    /// within the family.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> VariationOp {
        if rng.random_bool(self.p_recomb) {
            VariationOp::Recombine(weighted_pick(rng, &self.recombinators))
        } else {
            VariationOp::Mutate(weighted_pick(rng, &self.mutators))
        }
    }

    /// Rewards an operator whose child was admitted to the corpus.
    pub fn reward(&mut self, op: VariationOp) {
        self.scale(op, 1.0 + self.alpha);
    }

    /// Penalizes an operator whose child failed to serialize.
    pub fn penalize(&mut self, op: VariationOp) {
        self.scale(op, 1.0 - self.alpha);
    }

    pub fn weight_of(&self, op: VariationOp) -> f64 {
        match op {
            VariationOp::Mutate(m) => {
                self.mutators
                    .iter()
                    .find(|(op, _)| *op == m)
                    .expect("mutator table is total")
                    .1
            }
            VariationOp::Recombine(r) => {
                self.recombinators
                    .iter()
                    .find(|(op, _)| *op == r)
                    .expect("recombinator table is total")
                    .1
            }
        }
    }

    fn scale(&mut self, op: VariationOp, factor: f64) {
        match op {
            VariationOp::Mutate(m) => {
                if let Some(entry) = self.mutators.iter_mut().find(|(op, _)| *op == m) {
                    entry.1 *= factor;
                }
            }
            VariationOp::Recombine(r) => {
                if let Some(entry) = self.recombinators.iter_mut().find(|(op, _)| *op == r) {
                    entry.1 *= factor;
                }
            }
        }
        self.normalize();
    }

    /// Floors, then renormalizes each family's weights to sum to one.
    fn normalize(&mut self) {
        normalize_table(&mut self.mutators, self.min_weight);
        normalize_table(&mut self.recombinators, self.min_weight);
    }
}

fn normalize_table<T>(table: &mut [(T, f64)], floor: f64) {
    for (_, w) in table.iter_mut() {
        if *w < floor {
            *w = floor;
        }
    }
    let total: f64 = table.iter().map(|(_, w)| w).sum();
    if total > 0.0 {
        for (_, w) in table.iter_mut() {
            *w /= total;
        }
    }
}

fn weighted_pick<R: Rng + ?Sized, T: Copy>(rng: &mut R, table: &[(T, f64)]) -> T {
    let total: f64 = table.iter().map(|(_, w)| w).sum();
    let mut ticket = rng.random_range(0.0..total);
    for &(op, w) in table {
        if ticket < w {
            return op;
        }
        ticket -= w;
    }
    // Floating point slop can exhaust the loop; fall back to the last row.
    table.last().expect("weight table is never empty").0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn initial_weights_are_uniform_within_each_family() {
        let strategy = FuzzingStrategy::new(0.5, 0.1, 0.01);
        let w = strategy.weight_of(VariationOp::Mutate(Mutator::BitFlip));
        for m in Mutator::ALL {
            assert!((strategy.weight_of(VariationOp::Mutate(m)) - w).abs() < 1e-12);
        }
        let w = strategy.weight_of(VariationOp::Recombine(Recombinator::GeneSwap));
        for r in Recombinator::ALL {
            assert!((strategy.weight_of(VariationOp::Recombine(r)) - w).abs() < 1e-12);
        }
    }

    #[test]
    fn reward_shifts_mass_toward_the_operator() {
        let mut strategy = FuzzingStrategy::new(0.5, 0.1, 0.01);
        let op = VariationOp::Mutate(Mutator::BoundaryValue);
        let before = strategy.weight_of(op);
        strategy.reward(op);
        let after = strategy.weight_of(op);
        assert!(after > before);
        // The family still sums to one.
        let total: f64 = Mutator::ALL
            .iter()
            .map(|&m| strategy.weight_of(VariationOp::Mutate(m)))
            .sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn penalty_shrinks_but_the_floor_preserves_exploration() {
        let mut strategy = FuzzingStrategy::new(0.5, 0.1, 0.01);
        let op = VariationOp::Recombine(Recombinator::GeneSplice);
        for _ in 0..200 {
            strategy.penalize(op);
        }
        assert!(strategy.weight_of(op) >= 0.005, "floor must hold");
        let total: f64 = Recombinator::ALL
            .iter()
            .map(|&r| strategy.weight_of(VariationOp::Recombine(r)))
            .sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rewarded_operators_are_picked_more_often() {
        let mut strategy = FuzzingStrategy::new(0.0, 0.1, 0.01); // mutators only
        let favored = VariationOp::Mutate(Mutator::RandomByte);
        for _ in 0..40 {
            strategy.reward(favored);
        }
        let mut rng = ChaCha8Rng::from_seed([60; 32]);
        let hits = (0..2000)
            .filter(|_| strategy.pick(&mut rng) == favored)
            .count();
        // Uniform would land near 2000/9 ≈ 222.
        assert!(hits > 800, "favored operator picked only {hits} times");
    }

    #[test]
    fn p_recomb_drives_family_choice() {
        let strategy = FuzzingStrategy::new(1.0, 0.1, 0.01);
        let mut rng = ChaCha8Rng::from_seed([61; 32]);
        for _ in 0..100 {
            assert!(matches!(
                strategy.pick(&mut rng),
                VariationOp::Recombine(_)
            ));
        }

        let strategy = FuzzingStrategy::new(0.0, 0.1, 0.01);
        for _ in 0..100 {
            assert!(matches!(strategy.pick(&mut rng), VariationOp::Mutate(_)));
        }
    }

    #[test]
    fn configured_initial_weights_are_applied() {
        let mut mutators = BTreeMap::new();
        mutators.insert("bit_flip".to_string(), 8.0);
        let strategy =
            FuzzingStrategy::new(0.5, 0.1, 0.01).with_initial_weights(&mutators, &BTreeMap::new());
        let favored = strategy.weight_of(VariationOp::Mutate(Mutator::BitFlip));
        let other = strategy.weight_of(VariationOp::Mutate(Mutator::ByteSwap));
        assert!(favored > other * 5.0);
    }
}
