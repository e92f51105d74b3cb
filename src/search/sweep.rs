use serde::{Deserialize, Serialize};

/// `n` geometrically spaced points from `start` to `stop`, both included.
///
/// Works in either direction; a descending sweep is produced when
/// `start > stop`.
pub fn geomspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let ratio = (stop / start).ln() / (n - 1) as f64;
            (0..n)
                .map(|i| match i {
                    0 => start,
                    i if i == n - 1 => stop,
                    i => start * (ratio * i as f64).exp(),
                })
                .collect()
        }
    }
}

/// `n` logarithmically spaced frequencies covering `[f_min, f_max]`.
#[inline]
pub fn logspace(f_min: f64, f_max: f64, n: usize) -> Vec<f64> {
    geomspace(f_min, f_max, n)
}

/// A fixed geometric grid with `points_per_decade` points per decade,
/// anchored at 1.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometricGrid {
    pub points_per_decade: u32,
}

impl GeometricGrid {
    pub fn new(points_per_decade: u32) -> Self {
        Self { points_per_decade }
    }

    /// Rounds `x > 0` to the nearest grid point in log space.
    pub fn snap(&self, x: f64) -> f64 {
        if !(x > 0.0) || self.points_per_decade == 0 {
            return x;
        }
        let n = self.points_per_decade as f64;
        let k = (x.log10() * n).round();
        10f64.powf(k / n)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_geomspace_endpoints() {
        let pts = geomspace(100e-6, 1e-6, 30);
        assert_eq!(pts.len(), 30);
        assert_eq!(pts[0], 100e-6);
        assert_eq!(pts[29], 1e-6);
        for w in pts.windows(2) {
            assert!(w[0] > w[1]);
            assert_relative_eq!(w[0] / w[1], pts[0] / pts[1], max_relative = 1e-9);
        }
    }

    #[test]
    fn test_logspace_decades() {
        let f = logspace(1e3, 1e8, 6);
        for (got, want) in f.iter().zip([1e3, 1e4, 1e5, 1e6, 1e7, 1e8]) {
            assert_relative_eq!(*got, want, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_degenerate_sweeps() {
        assert!(geomspace(1.0, 2.0, 0).is_empty());
        assert_eq!(geomspace(3.0, 2.0, 1), vec![3.0]);
    }

    #[test]
    fn test_grid_snap() {
        let grid = GeometricGrid::new(10);
        assert_relative_eq!(grid.snap(1e-6), 1e-6, max_relative = 1e-12);
        let snapped = grid.snap(1.3e-5);
        assert_relative_eq!(snapped, 10f64.powf(-49.0 / 10.0), max_relative = 1e-12);
        assert_relative_eq!(grid.snap(snapped), snapped, max_relative = 1e-12);
        assert_eq!(grid.snap(0.0), 0.0);
    }
}
