// src/utils/barcode.rs: exact and approximate barcode lookup
use fxhash::FxHashMap;

use crate::config::defs::PipelineError;

const ALPHABET: [u8; 5] = [b'A', b'C', b'G', b'T', b'N'];

/// Number of positions at which `a` and `b` differ. Both must have the same length.
pub fn hamming_distance(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).filter(|(x, y)| x != y).count()
}

/// All strings at substitution distance <= `distance` from `barcode`, over `ACGTN`.
/// The barcode itself is included.
pub fn hamming_ball(barcode: &[u8], distance: usize) -> Vec<Vec<u8>> {
    let mut ball = vec![barcode.to_vec()];
    let mut frontier = vec![(barcode.to_vec(), 0usize)];
    // Only substitute at positions right of the last one touched, so each string is built once.
    for _ in 0..distance.min(barcode.len()) {
        let mut next = Vec::new();
        for (seq, first_free) in &frontier {
            for pos in *first_free..seq.len() {
                for &base in ALPHABET.iter() {
                    if base == barcode[pos] {
                        continue;
                    }
                    let mut variant = seq.clone();
                    variant[pos] = base;
                    ball.push(variant.clone());
                    next.push((variant, pos + 1));
                }
            }
        }
        frontier = next;
    }
    ball
}

/// How a read's barcode was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarcodeMatch {
    /// Identical to the sample barcode at this index.
    Exact(usize),
    /// Within the hamming tolerance of the sample barcode at this index.
    Ball(usize),
    NoMatch,
}

/// Two-pass barcode lookup: exact dictionary first, then the precomputed hamming balls.
///
/// A ball string belongs to the sample whose barcode is closest to it. When two
/// barcodes are equally close the one registered first keeps it.
#[derive(Debug)]
pub struct BarcodeMatcher {
    barcode_len: usize,
    exact: FxHashMap<Vec<u8>, usize>,
    ball: FxHashMap<Vec<u8>, (usize, usize)>,
    ties: usize,
}

impl BarcodeMatcher {
    pub fn new<B: AsRef<[u8]>>(barcodes: &[B], distance: usize) -> Result<Self, PipelineError> {
        let barcode_len = barcodes.first().map(|b| b.as_ref().len()).unwrap_or(0);
        let mut exact = FxHashMap::default();
        for (idx, bc) in barcodes.iter().enumerate() {
            let bc = bc.as_ref().to_ascii_uppercase();
            if bc.len() != barcode_len {
                return Err(PipelineError::InvalidConfig(format!(
                    "barcode {} has length {}, expected {}",
                    String::from_utf8_lossy(&bc),
                    bc.len(),
                    barcode_len
                )));
            }
            if exact.insert(bc.clone(), idx).is_some() {
                return Err(PipelineError::InvalidConfig(format!(
                    "barcode {} is not unique",
                    String::from_utf8_lossy(&bc)
                )));
            }
        }

        let mut ball: FxHashMap<Vec<u8>, (usize, usize)> = FxHashMap::default();
        let mut ties = 0;
        for (idx, bc) in barcodes.iter().enumerate() {
            let bc = bc.as_ref().to_ascii_uppercase();
            for member in hamming_ball(&bc, distance) {
                let d = hamming_distance(&member, &bc);
                match ball.get_mut(&member) {
                    None => {
                        ball.insert(member, (idx, d));
                    }
                    Some(owner) => {
                        if d < owner.1 {
                            *owner = (idx, d);
                        } else if d == owner.1 {
                            ties += 1;
                        }
                    }
                }
            }
        }
        Ok(BarcodeMatcher { barcode_len, exact, ball, ties })
    }

    pub fn barcode_len(&self) -> usize {
        self.barcode_len
    }

    /// Ball strings that were equally close to more than one barcode.
    pub fn ambiguous_keys(&self) -> usize {
        self.ties
    }

    pub fn ball_size(&self) -> usize {
        self.ball.len()
    }

    pub fn classify(&self, barcode: &[u8]) -> BarcodeMatch {
        if let Some(&idx) = self.exact.get(barcode) {
            return BarcodeMatch::Exact(idx);
        }
        match self.ball.get(barcode) {
            Some(&(idx, _)) => BarcodeMatch::Ball(idx),
            None => BarcodeMatch::NoMatch,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn all_strings(len: usize) -> Vec<Vec<u8>> {
        let mut out = vec![Vec::new()];
        for _ in 0..len {
            out = out
                .into_iter()
                .flat_map(|s| {
                    ALPHABET.iter().map(move |&b| {
                        let mut t = s.clone();
                        t.push(b);
                        t
                    })
                })
                .collect();
        }
        out
    }

    #[test]
    fn test_ball_sizes() {
        assert_eq!(hamming_ball(b"ACGT", 0), vec![b"ACGT".to_vec()]);
        // 1 + 4 positions * 4 substitutions
        assert_eq!(hamming_ball(b"ACGT", 1).len(), 17);
        // 1 + 16 + C(4,2) * 4^2
        assert_eq!(hamming_ball(b"ACGT", 2).len(), 113);
        let mut ball = hamming_ball(b"ACGT", 2);
        ball.sort();
        ball.dedup();
        assert_eq!(ball.len(), 113);
    }

    #[test]
    fn test_ball_membership_matches_distance() {
        let bc = b"GATC";
        for d in 0..=2 {
            let ball = hamming_ball(bc, d);
            for s in all_strings(4) {
                let inside = ball.contains(&s);
                assert_eq!(inside, hamming_distance(&s, bc) <= d, "{:?} d={}", String::from_utf8_lossy(&s), d);
            }
        }
    }

    #[test]
    fn test_three_sample_routing() -> Result<(), PipelineError> {
        let m = BarcodeMatcher::new(&["AAAA", "AAAT", "GGGG"], 1)?;
        assert_eq!(m.classify(b"AAAA"), BarcodeMatch::Exact(0));
        assert_eq!(m.classify(b"AAAT"), BarcodeMatch::Exact(1));
        assert_eq!(m.classify(b"AAAG"), BarcodeMatch::Ball(0));
        assert_eq!(m.classify(b"GGGC"), BarcodeMatch::Ball(2));
        assert_eq!(m.classify(b"CCCC"), BarcodeMatch::NoMatch);
        assert!(m.ambiguous_keys() > 0);
        Ok(())
    }

    #[test]
    fn test_exact_beats_ball_of_other_sample() -> Result<(), PipelineError> {
        // AAAT lies in the ball of AAAA, but is itself a registered barcode.
        let m = BarcodeMatcher::new(&["AAAA", "AAAT"], 2)?;
        assert_eq!(m.classify(b"AAAT"), BarcodeMatch::Exact(1));
        assert_eq!(m.classify(b"AAAA"), BarcodeMatch::Exact(0));
        Ok(())
    }

    #[test]
    fn test_closest_barcode_wins() -> Result<(), PipelineError> {
        // CCAA is 2 from AAAA and 1 from CCAT, so the later CCAT keeps it.
        let m = BarcodeMatcher::new(&["AAAA", "CCAT"], 2)?;
        assert_eq!(m.classify(b"CCAA"), BarcodeMatch::Ball(1));
        Ok(())
    }

    #[test]
    fn test_invalid_barcode_sets() {
        assert!(BarcodeMatcher::new(&["AAAA", "AAA"], 1).is_err());
        assert!(BarcodeMatcher::new(&["AAAA", "AAAA"], 1).is_err());
    }
}
