//! Summary statistics for probe repeatability

use heapless::Vec;
use libm::sqrt;

/// Most samples a repeatability test may take
pub const MAX_REPEATABILITY_SAMPLES: usize = 50;

/// Summary of a set of probe readings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Repeatability {
    pub mean: f64,
    /// Upper median, `sorted[n / 2]`
    pub median: f64,
    /// Value of the longest run of identical readings, or the median when there is no single one
    pub mode: f64,
    pub low: f64,
    pub high: f64,
    /// Population standard deviation
    pub std_dev: f64,
}

/// Mean and population standard deviation
pub fn mean_and_sigma(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / n;
    (mean, sqrt(var))
}

/// Summarises up to [`MAX_REPEATABILITY_SAMPLES`] readings; extra readings are ignored
pub fn repeatability(samples: &[f64]) -> Option<Repeatability> {
    let mut sorted: Vec<f64, MAX_REPEATABILITY_SAMPLES> = Vec::new();
    for s in samples.iter().take(MAX_REPEATABILITY_SAMPLES) {
        let _ = sorted.push(*s);
    }
    if sorted.is_empty() {
        return None;
    }
    let (mean, std_dev) = mean_and_sigma(&sorted);
    sorted.sort_unstable_by(f64::total_cmp);
    let n = sorted.len();
    Some(Repeatability {
        mean,
        median: sorted[n / 2],
        mode: mode(&sorted),
        low: sorted[0],
        high: sorted[n - 1],
        std_dev,
    })
}

/// Mode of sorted readings
///
/// Runs of equal values are compared by length. Ties between the longest runs count as
/// bimodal and fall back to the median, as does a set with no repeated value.
fn mode(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    let median = sorted[n / 2];
    let mut i = 0;
    let mut longest = 0;
    let mut previous = 0;
    let mut mode = None;
    let mut bimodal = false;

    while i + 1 < n {
        let mut run = 0;
        while i + 1 < n && sorted[i] == sorted[i + 1] {
            run += 1;
            i += 1;
        }
        if run > 0 && run >= longest {
            mode = Some(sorted[i]);
            if run > longest {
                bimodal = false;
            }
            previous = longest;
            longest = run;
        }
        if run > 0 && previous == longest {
            bimodal = true;
        }
        if run == 0 {
            i += 1;
        }
    }

    match mode {
        Some(m) if !bimodal => m,
        _ => median,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn summary_of_simple_set() {
        let r = repeatability(&[0.3, 0.1, 0.2, 0.2, 0.4]).unwrap();
        assert_abs_diff_eq!(r.mean, 0.24, epsilon = 1e-12);
        assert_eq!(r.median, 0.2);
        assert_eq!(r.mode, 0.2);
        assert_eq!(r.low, 0.1);
        assert_eq!(r.high, 0.4);
        // population variance of the set is 0.0104
        assert_abs_diff_eq!(r.std_dev, sqrt(0.0104), epsilon = 1e-12);
    }

    #[test]
    fn no_repeats_gives_median() {
        let r = repeatability(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(r.median, 3.0);
        assert_eq!(r.mode, 3.0);
    }

    #[test]
    fn tied_runs_are_bimodal() {
        assert_eq!(mode(&[1.0, 1.0, 2.0, 3.0, 3.0]), 2.0);
    }

    #[test]
    fn longer_run_wins_after_a_tie() {
        assert_eq!(mode(&[1.0, 1.0, 2.0, 2.0, 5.0, 5.0, 5.0]), 5.0);
    }

    #[test]
    fn zero_is_a_valid_mode() {
        assert_eq!(mode(&[-1.0, 0.0, 0.0, 0.5, 2.0]), 0.0);
    }

    #[test]
    fn empty_set_has_no_summary() {
        assert_eq!(repeatability(&[]), None);
        assert_eq!(mean_and_sigma(&[]), (0.0, 0.0));
    }
}
