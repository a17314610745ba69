//! Brute-force Hamming matcher with Lowe's ratio filter.

use crate::features::base::{Descriptors, Match};

/// k-nearest-neighbour (k = 2) Hamming matcher.
///
/// Brute force is the right tool here: descriptor sets stay in the low
/// thousands and popcount distance is a handful of instructions per row.
pub struct HammingMatcher {
    ratio: f32,
}

impl HammingMatcher {
    /// `ratio` is the Lowe threshold: a best match survives only when its
    /// distance is below `ratio` times the second-best distance.
    pub fn new(ratio: f32) -> Self {
        Self { ratio }
    }

    /// Match every query descriptor against the train set and keep the
    /// unambiguous best matches.
    ///
    /// Either side with fewer than two rows yields no matches, since the
    /// ratio test needs a second-best candidate to compare against.
    pub fn ratio_match(&self, query: &Descriptors, train: &Descriptors) -> Vec<Match> {
        let mut matches = Vec::new();

        if query.count < 2 || train.count < 2 || query.size != train.size {
            return matches;
        }

        for (qi, q) in query.data.chunks_exact(query.size).enumerate() {
            let mut best = u32::MAX;
            let mut second = u32::MAX;
            let mut best_idx = 0usize;

            for (ti, t) in train.data.chunks_exact(train.size).enumerate() {
                let d = hamming(q, t);
                if d < best {
                    second = best;
                    best = d;
                    best_idx = ti;
                } else if d < second {
                    second = d;
                }
            }

            if (best as f32) < self.ratio * second as f32 {
                matches.push(Match {
                    query_idx: qi as u32,
                    train_idx: best_idx as u32,
                    distance: best as f32,
                });
            }
        }

        matches
    }
}

/// Hamming distance between two equal-length descriptor rows.
#[inline]
fn hamming(a: &[u8], b: &[u8]) -> u32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x ^ y).count_ones())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::base::DESCRIPTOR_SIZE;

    fn row(fill: u8) -> [u8; DESCRIPTOR_SIZE] {
        [fill; DESCRIPTOR_SIZE]
    }

    fn descriptors_of(rows: &[[u8; DESCRIPTOR_SIZE]]) -> Descriptors {
        let mut descriptors = Descriptors::new();
        for r in rows {
            descriptors.push(r);
        }
        descriptors
    }

    #[test]
    fn hamming_counts_differing_bits() {
        assert_eq!(hamming(&row(0), &row(0)), 0);
        assert_eq!(hamming(&row(0), &row(1)), DESCRIPTOR_SIZE as u32);
        assert_eq!(hamming(&row(0), &row(0xff)), DESCRIPTOR_SIZE as u32 * 8);
    }

    #[test]
    fn unambiguous_match_survives_ratio_test() {
        let query = descriptors_of(&[row(0b0000_0001), row(0b1111_0000)]);
        let train = descriptors_of(&[row(0b0000_0001), row(0b1111_1111)]);

        let matcher = HammingMatcher::new(0.8);
        let matches = matcher.ratio_match(&query, &train);

        let m = matches
            .iter()
            .find(|m| m.query_idx == 0)
            .expect("query 0 matched");
        assert_eq!(m.train_idx, 0);
        assert_eq!(m.distance, 0.0);
    }

    #[test]
    fn ambiguous_match_is_dropped() {
        // Both train rows are equidistant from the query; the ratio test
        // must reject the pairing, including the exact-tie-at-zero case.
        let query = descriptors_of(&[row(0), row(0x0f)]);
        let train = descriptors_of(&[row(0), row(0)]);

        let matcher = HammingMatcher::new(0.8);
        let matches = matcher.ratio_match(&query, &train);
        assert!(matches.iter().all(|m| m.query_idx != 0));
    }

    #[test]
    fn degenerate_sides_produce_no_matches() {
        let one = descriptors_of(&[row(0)]);
        let two = descriptors_of(&[row(0), row(1)]);

        let matcher = HammingMatcher::new(0.8);
        assert!(matcher.ratio_match(&one, &two).is_empty());
        assert!(matcher.ratio_match(&two, &one).is_empty());
        assert!(matcher
            .ratio_match(&Descriptors::new(), &two)
            .is_empty());
    }
}
