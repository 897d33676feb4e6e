use serde::{Deserialize, Serialize};

/// Scoring policy for comparing a query histogram against indexed clusters.
///
/// Flags combine freely; `MIN_FREQ` replaces the multiplicative term rule
/// with `min()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryRules(u8);

impl QueryRules {
    /// Raw counts multiplied together.
    pub const FREQ: QueryRules = QueryRules(0);
    /// Counts divided by their histogram's normalization constant.
    pub const NORMALIZED_FREQ: QueryRules = QueryRules(1);
    /// Terms weighted by inverse document frequency.
    pub const IDF: QueryRules = QueryRules(2);
    /// `min(query, cluster)` instead of the product.
    pub const MIN_FREQ: QueryRules = QueryRules(4);
    /// Counts clamped to 1.
    pub const BIN_FREQ: QueryRules = QueryRules(8);
    pub const IDF_NORMALIZED: QueryRules = QueryRules(3);

    const ALL_BITS: u8 = 0b1111;

    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL_BITS == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: QueryRules) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: QueryRules) -> bool {
        self.0 & other.0 != 0
    }

    pub fn normalized(self) -> bool {
        self.contains(Self::NORMALIZED_FREQ)
    }

    pub fn idf(self) -> bool {
        self.contains(Self::IDF)
    }

    pub fn min_freq(self) -> bool {
        self.contains(Self::MIN_FREQ)
    }

    pub fn bin_freq(self) -> bool {
        self.contains(Self::BIN_FREQ)
    }

    /// Whether a cluster's normalization constant differs from its raw total.
    pub fn needs_weighted_sum(self) -> bool {
        self.intersects(Self::BIN_FREQ | Self::IDF)
    }

    /// Whether the final score is divided by the query's total at read time.
    pub fn divides_by_query_total(self) -> bool {
        self.normalized() && !self.intersects(Self::MIN_FREQ | Self::BIN_FREQ)
    }

    /// Every one of the sixteen flag combinations.
    pub fn all_combinations() -> impl Iterator<Item = QueryRules> {
        (0..=Self::ALL_BITS).map(QueryRules)
    }
}

impl std::ops::BitOr for QueryRules {
    type Output = QueryRules;

    fn bitor(self, rhs: QueryRules) -> QueryRules {
        QueryRules(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for QueryRules {
    fn bitor_assign(&mut self, rhs: QueryRules) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Display for QueryRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = [
            (Self::NORMALIZED_FREQ, "normalized"),
            (Self::IDF, "idf"),
            (Self::MIN_FREQ, "min"),
            (Self::BIN_FREQ, "bin"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        if names.is_empty() {
            write!(f, "freq")
        } else {
            write!(f, "{}", names.join("+"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_idf_normalized_combines_both_flags() {
        assert_eq!(
            QueryRules::IDF_NORMALIZED,
            QueryRules::NORMALIZED_FREQ | QueryRules::IDF
        );
    }

    #[test]
    fn test_from_bits_rejects_unknown_flags() {
        assert_eq!(QueryRules::from_bits(5), Some(QueryRules(5)));
        assert_eq!(QueryRules::from_bits(16), None);
    }

    #[rstest]
    #[case::freq(QueryRules::FREQ, false)]
    #[case::normalized(QueryRules::NORMALIZED_FREQ, true)]
    #[case::normalized_idf(QueryRules::IDF_NORMALIZED, true)]
    #[case::normalized_min(QueryRules::NORMALIZED_FREQ | QueryRules::MIN_FREQ, false)]
    #[case::normalized_bin(QueryRules::NORMALIZED_FREQ | QueryRules::BIN_FREQ, false)]
    fn test_divides_by_query_total(#[case] rules: QueryRules, #[case] expected: bool) {
        assert_eq!(rules.divides_by_query_total(), expected);
    }

    #[rstest]
    #[case::freq(QueryRules::FREQ, false)]
    #[case::normalized(QueryRules::NORMALIZED_FREQ, false)]
    #[case::idf(QueryRules::IDF, true)]
    #[case::bin(QueryRules::BIN_FREQ, true)]
    fn test_needs_weighted_sum(#[case] rules: QueryRules, #[case] expected: bool) {
        assert_eq!(rules.needs_weighted_sum(), expected);
    }

    #[test]
    fn test_display_lists_flags() {
        assert_eq!(QueryRules::FREQ.to_string(), "freq");
        assert_eq!(QueryRules::IDF_NORMALIZED.to_string(), "normalized+idf");
        assert_eq!(
            (QueryRules::MIN_FREQ | QueryRules::BIN_FREQ).to_string(),
            "min+bin"
        );
    }

    #[test]
    fn test_all_combinations_has_sixteen_entries() {
        assert_eq!(QueryRules::all_combinations().count(), 16);
    }

    #[test]
    fn test_serializes_as_plain_number() {
        let json = serde_json::to_string(&QueryRules::IDF_NORMALIZED).unwrap();
        assert_eq!(json, "3");
        let back: QueryRules = serde_json::from_str("9").unwrap();
        assert!(back.normalized() && back.bin_freq());
    }
}
