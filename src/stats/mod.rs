//! Statistic reduction over metric samples.

pub mod window;

/// Reduction applied to a series of samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Stat {
    #[default]
    None,
    Avg,
    Percentile99,
    Percentile95,
    Percentile90,
    Percentile10,
    Percentile05,
    Percentile01,
    Max,
    Min,
    MidPoint,
    NonZeroAvg,
}

impl Stat {
    pub const ALL: &'static [Stat] = &[
        Stat::None,
        Stat::Avg,
        Stat::Percentile99,
        Stat::Percentile95,
        Stat::Percentile90,
        Stat::Percentile10,
        Stat::Percentile05,
        Stat::Percentile01,
        Stat::Max,
        Stat::Min,
        Stat::MidPoint,
        Stat::NonZeroAvg,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Stat::None => "none",
            Stat::Avg => "avg",
            Stat::Percentile99 => "percentile_99",
            Stat::Percentile95 => "percentile_95",
            Stat::Percentile90 => "percentile_90",
            Stat::Percentile10 => "percentile_10",
            Stat::Percentile05 => "percentile_05",
            Stat::Percentile01 => "percentile_01",
            Stat::Max => "max",
            Stat::Min => "min",
            Stat::MidPoint => "mid_point",
            Stat::NonZeroAvg => "non_zero_avg",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == name)
    }

    /// Rank in `[0, 1]` for percentile stats.
    pub const fn percentile(self) -> Option<f64> {
        match self {
            Stat::Percentile99 => Some(0.99),
            Stat::Percentile95 => Some(0.95),
            Stat::Percentile90 => Some(0.90),
            Stat::Percentile10 => Some(0.10),
            Stat::Percentile05 => Some(0.05),
            Stat::Percentile01 => Some(0.01),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reduce `samples` with `stat`.
///
/// `invert` flips percentile ranks and swaps min/max, for series where a
/// lower value is better (frame times reported as frame rates). A single
/// sample is returned unchanged for every stat; an empty series yields 0.
pub fn calculate_statistic(samples: &[f64], stat: Stat, invert: bool) -> f64 {
    match samples.len() {
        0 => return 0.0,
        1 => return samples[0],
        _ => {}
    }

    let n = samples.len();
    match stat {
        Stat::None => 0.0,
        Stat::Avg => samples.iter().sum::<f64>() / n as f64,
        Stat::NonZeroAvg => {
            let (sum, count) = samples
                .iter()
                .filter(|&&v| v != 0.0)
                .fold((0.0, 0usize), |(s, c), &v| (s + v, c + 1));
            if count == 0 {
                0.0
            } else {
                sum / count as f64
            }
        }
        Stat::MidPoint => samples[n / 2],
        Stat::Max if invert => min(samples),
        Stat::Max => max(samples),
        Stat::Min if invert => max(samples),
        Stat::Min => min(samples),
        Stat::Percentile99
        | Stat::Percentile95
        | Stat::Percentile90
        | Stat::Percentile10
        | Stat::Percentile05
        | Stat::Percentile01 => {
            let p = stat.percentile().unwrap_or(0.5);
            percentile(samples, if invert { 1.0 - p } else { p })
        }
    }
}

/// Linear interpolation between the closest ranks.
fn percentile(samples: &[f64], p: f64) -> f64 {
    let n = samples.len();
    let pos = p.clamp(0.0, 1.0) * n as f64;
    let idx = pos.floor() as usize;
    let frac = pos - idx as f64;

    if idx >= n - 1 {
        return max(samples);
    }

    let mut sorted = samples.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    sorted[idx] + frac * (sorted[idx + 1] - sorted[idx])
}

fn max(samples: &[f64]) -> f64 {
    samples.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn min(samples: &[f64]) -> f64 {
    samples.iter().copied().fold(f64::INFINITY, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_sample_returns_sample_for_every_stat() {
        for &stat in Stat::ALL {
            for invert in [false, true] {
                assert_eq!(calculate_statistic(&[4.25], stat, invert), 4.25, "{stat} {invert}");
            }
        }
    }

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(calculate_statistic(&[], Stat::Avg, false), 0.0);
        assert_eq!(calculate_statistic(&[], Stat::Percentile99, true), 0.0);
    }

    #[test]
    fn test_basic_reductions() {
        let s = [3.0, 0.0, 9.0, 6.0];
        assert_eq!(calculate_statistic(&s, Stat::Avg, false), 4.5);
        assert_eq!(calculate_statistic(&s, Stat::NonZeroAvg, false), 6.0);
        assert_eq!(calculate_statistic(&s, Stat::Max, false), 9.0);
        assert_eq!(calculate_statistic(&s, Stat::Min, false), 0.0);
        assert_eq!(calculate_statistic(&s, Stat::Max, true), 0.0);
        assert_eq!(calculate_statistic(&s, Stat::Min, true), 9.0);
        // Middle of the raw sequence, not of the sorted one.
        assert_eq!(calculate_statistic(&s, Stat::MidPoint, false), 9.0);
        assert_eq!(calculate_statistic(&s, Stat::None, false), 0.0);
        assert_eq!(calculate_statistic(&[0.0, 0.0], Stat::NonZeroAvg, false), 0.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let s: Vec<f64> = (1..=10).rev().map(f64::from).collect();
        // pos = 0.1 * 10 = 1.0 -> sorted[1]
        assert!((calculate_statistic(&s, Stat::Percentile10, false) - 2.0).abs() < 1e-12);
        // pos = 0.05 * 10 = 0.5 -> halfway between 1 and 2
        assert!((calculate_statistic(&s, Stat::Percentile05, false) - 1.5).abs() < 1e-12);
        // pos = 9.9 -> idx 9 >= n - 1 -> max
        assert_eq!(calculate_statistic(&s, Stat::Percentile99, false), 10.0);
    }

    #[test]
    fn test_inverted_percentile() {
        let s: Vec<f64> = (1..=10).map(f64::from).collect();
        let low = calculate_statistic(&s, Stat::Percentile90, true);
        let direct = calculate_statistic(&s, Stat::Percentile10, false);
        assert!((low - direct).abs() < 1e-9);
    }

    #[test]
    fn test_stat_names() {
        for &s in Stat::ALL {
            assert_eq!(Stat::from_name(s.as_str()), Some(s));
        }
        assert_eq!(Stat::from_name("median"), None);
    }
}
