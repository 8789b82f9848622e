use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// Picks one position per sequence: uniformly at random with probability
/// `eps`, otherwise the position with the highest score. Empty sequences
/// yield `None`.
pub fn eps_greedy_sample<R: Rng + ?Sized>(
    scores: &[f32],
    lod: &[usize],
    eps: f64,
    rng: &mut R,
) -> Vec<Option<usize>> {
    lod.windows(2)
        .map(|w| {
            let sequence = &scores[w[0]..w[1]];
            if sequence.is_empty() {
                None
            } else if rng.gen::<f64>() < eps {
                Some(rng.gen_range(0..sequence.len()))
            } else {
                argmax(sequence)
            }
        })
        .collect()
}

/// Picks one position per sequence with probability `softmax(scores)` taken
/// over that sequence.
pub fn softmax_sample<R: Rng + ?Sized>(
    scores: &[f32],
    lod: &[usize],
    rng: &mut R,
) -> Vec<Option<usize>> {
    lod.windows(2)
        .map(|w| {
            let sequence = &scores[w[0]..w[1]];
            let max = sequence.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let weights: Vec<f64> = sequence
                .iter()
                .map(|&score| f64::from(score - max).exp())
                .collect();
            match WeightedIndex::new(&weights) {
                Ok(dist) => Some(dist.sample(rng)),
                Err(_) => argmax(sequence),
            }
        })
        .collect()
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (idx, &value)| match best {
            Some((_, best_value)) if best_value >= value => best,
            _ => Some((idx, value)),
        })
        .map(|(idx, _)| idx)
}
