//! Distance-to-score calibration.
//!
//! For unit vectors the squared L2 distance is `2 - 2cos`, so cosine
//! similarity is recovered as `1 - d/2`. Presentation scores are derived
//! per query from that value and are never stored.

/// Keeps the set-relative score finite when every candidate ties.
pub const RELATIVE_EPSILON: f32 = 1e-8;
/// Lowest set-relative percentage, given to the weakest hit of a query.
pub const RELATIVE_FLOOR: f32 = 10.0;

/// Cosine similarity recovered from a squared L2 distance, clamped to
/// `[0, 1]`.
///
/// # Examples
///
/// ```
/// use booksearch::scoring::cosine_from_squared_l2;
///
/// assert_eq!(cosine_from_squared_l2(0.0), 1.0);
/// assert_eq!(cosine_from_squared_l2(1.0), 0.5);
/// assert_eq!(cosine_from_squared_l2(3.5), 0.0);
/// ```
pub fn cosine_from_squared_l2(distance: f32) -> f32 {
    let c = 1.0 - distance / 2.0;
    if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) }
}

/// `round(c * 100)`.
pub fn similarity_percent(cosine: f32) -> u8 {
    (cosine.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Five-star rating in half-star steps, never below half a star.
pub fn star_rating(cosine: f32) -> f32 {
    ((cosine.clamp(0.0, 1.0) * 10.0).round() / 2.0).max(0.5)
}

/// Position of each score within the query's own result set, mapped to
/// `10..=100`. The best hit gets 100 unless every score ties, in which
/// case all get the floor.
pub fn set_relative_percents(cosines: &[f32]) -> Vec<u8> {
    let Some(max) = cosines.iter().copied().reduce(f32::max) else {
        return Vec::new();
    };
    let min = cosines.iter().copied().fold(max, f32::min);
    let span = max - min + RELATIVE_EPSILON;
    cosines
        .iter()
        .map(|&c| {
            let rel =
                RELATIVE_FLOOR + (100.0 - RELATIVE_FLOOR) * (c - min) / span;
            rel.round().clamp(RELATIVE_FLOOR, 100.0) as u8
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn cosine_is_clamped() {
        assert_eq!(cosine_from_squared_l2(-0.01), 1.0);
        assert_eq!(cosine_from_squared_l2(4.0), 0.0);
        assert_eq!(cosine_from_squared_l2(f32::NAN), 0.0);
    }

    #[test]
    fn percent_rounds_to_nearest() {
        assert_eq!(similarity_percent(0.0), 0);
        assert_eq!(similarity_percent(0.874), 87);
        assert_eq!(similarity_percent(0.876), 88);
        assert_eq!(similarity_percent(1.0), 100);
    }

    #[test]
    fn stars_in_half_steps_with_floor() {
        assert_eq!(star_rating(0.0), 0.5);
        assert_eq!(star_rating(0.02), 0.5);
        assert_eq!(star_rating(0.5), 2.5);
        assert_eq!(star_rating(0.83), 4.0);
        assert_eq!(star_rating(1.0), 5.0);
    }

    #[test]
    fn relative_spans_floor_to_hundred() {
        let rel = set_relative_percents(&[0.9, 0.7, 0.5]);
        assert_eq!(rel, vec![100, 55, 10]);
    }

    #[test]
    fn relative_ties_stay_at_floor() {
        assert_eq!(set_relative_percents(&[0.8, 0.8]), vec![10, 10]);
        assert_eq!(set_relative_percents(&[0.3]), vec![10]);
        assert!(set_relative_percents(&[]).is_empty());
    }

    proptest! {
        #[test]
        fn cosine_always_in_unit_interval(d in -10.0f32..10.0) {
            let c = cosine_from_squared_l2(d);
            prop_assert!((0.0..=1.0).contains(&c));
        }

        #[test]
        fn stars_are_half_steps(c in 0.0f32..=1.0) {
            let s = star_rating(c);
            prop_assert!((0.5..=5.0).contains(&s));
            prop_assert_eq!((s * 2.0).fract(), 0.0);
        }

        #[test]
        fn relative_top_is_hundred_when_scores_differ(
            mut cosines in proptest::collection::vec(0.0f32..=1.0, 2..30),
        ) {
            cosines.sort_by(|a, b| b.total_cmp(a));
            prop_assume!(cosines[0] - cosines[cosines.len() - 1] > 1e-3);
            let rel = set_relative_percents(&cosines);
            prop_assert_eq!(rel[0], 100);
            prop_assert_eq!(rel[rel.len() - 1], 10);
            prop_assert!(rel.windows(2).all(|w| w[0] >= w[1]));
        }
    }
}
