//! Integration tests: generate synthetic peak lists from a known UB matrix,
//! run the full direction search, and verify the recovered matrix indexes
//! the peaks and is lattice-equivalent to the generator.

use autoindex::indexer::{find_all_ub_matrices, find_ub_matrix, scan_directions, IndexConfig};
use autoindex::{Matrix3d, ObservedPeak, Vector3, Vector3d};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Peaks on every lattice point of `ub` with |h|, |k|, |l| <= range,
/// excluding the origin.
fn lattice_peaks(ub: &Matrix3d, range: i32) -> Vec<ObservedPeak> {
    let mut peaks = Vec::new();
    for h in -range..=range {
        for k in -range..=range {
            for l in -range..=range {
                if h == 0 && k == 0 && l == 0 {
                    continue;
                }
                let q = ub * Vector3d::new(h as f64, k as f64, l as f64);
                peaks.push(ObservedPeak::new(
                    Vector3::new(q.x as f32, q.y as f32, q.z as f32),
                    100,
                ));
            }
        }
    }
    peaks
}

/// Config sized for small synthetic lattices: coarse grid, small candidate
/// pool, sequential scan for reproducibility.
fn test_config() -> IndexConfig {
    IndexConfig {
        max_cell_edge: 8.0,
        initial_grid: 0.04,
        min_grid: 0.02,
        min_candidates: 5,
        parallel: false,
        ..Default::default()
    }
}

/// Whether `found` generates the same lattice as `generator`: the change of
/// basis between them must be an integer matrix with |det| = 1.
fn lattice_equivalent(found: &Matrix3d, generator: &Matrix3d) -> bool {
    let inv = match found.try_inverse() {
        Some(inv) => inv,
        None => return false,
    };
    let basis_change = inv * generator;
    let integral = basis_change
        .iter()
        .all(|v| (v - v.round()).abs() < 0.05);
    integral && (basis_change.determinant().abs() - 1.0).abs() < 0.05
}

#[test]
fn test_recovers_known_orthorhombic_ub() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    // ── Step 1: synthetic noise-free peaks from a known cell ──
    // Orthorhombic, a = 4, b = 5, c = 6 Angstroms, axis-aligned.
    let ub_true = Matrix3d::from_diagonal(&Vector3d::new(0.25, 0.2, 1.0 / 6.0));
    let peaks = lattice_peaks(&ub_true, 2);
    println!("Generated {} synthetic peaks", peaks.len());

    // ── Step 2: full search ──
    let solution = find_ub_matrix(&peaks, &test_config()).expect("search failed");
    println!("UB = {}", solution.ub);
    println!("indexed {:.1}% at 0.2", solution.stats.percent_at(0.2));

    // ── Step 3: verify ──
    // Noise-free data must index essentially completely...
    assert!(
        solution.stats.percent_at(0.2) >= 99.0,
        "only {:.1}% indexed",
        solution.stats.percent_at(0.2)
    );
    // ...and the recovered matrix must describe the generating lattice
    // (axis order and sign are free to differ).
    assert!(
        lattice_equivalent(&solution.ub, &ub_true),
        "recovered matrix generates a different lattice: {}",
        solution.ub
    );
    // Cell volume check: 4 * 5 * 6 = 120 cubic Angstroms.
    assert!(
        (solution.lattice.volume - 120.0).abs() < 1.0,
        "cell volume {} != 120",
        solution.lattice.volume
    );
}

#[test]
fn test_recovers_skewed_triclinic_ub() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    // A skewed cell with no axis-aligned shortcut: the hemisphere sweep has
    // to find the primitive lattice, not a supercell of it.
    let ub_true = Matrix3d::new(
        0.21, 0.03, 0.01, //
        0.0, 0.18, 0.02, //
        0.01, 0.0, 0.15,
    );
    let peaks = lattice_peaks(&ub_true, 2);

    let config = IndexConfig {
        max_cell_edge: 10.0,
        ..Default::default()
    };
    let solution = find_ub_matrix(&peaks, &config).expect("search failed");
    assert!(
        solution.stats.percent_at(0.2) >= 99.0,
        "only {:.1}% indexed",
        solution.stats.percent_at(0.2)
    );
    assert!(
        lattice_equivalent(&solution.ub, &ub_true),
        "recovered matrix generates a different lattice: {}",
        solution.ub
    );
    // The primitive cell volume, not an integer multiple of it.
    let true_volume = 1.0 / ub_true.determinant();
    assert!(
        (solution.lattice.volume - true_volume).abs() < 2.0,
        "cell volume {} != {:.1}",
        solution.lattice.volume,
        true_volume
    );
}

#[test]
fn test_tolerates_measurement_noise() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let ub_true = Matrix3d::from_diagonal(&Vector3d::new(0.25, 0.2, 1.0 / 6.0));
    let mut rng = StdRng::seed_from_u64(11);
    let jitter = Normal::new(0.0f32, 0.002).unwrap();
    let peaks: Vec<ObservedPeak> = lattice_peaks(&ub_true, 2)
        .into_iter()
        .map(|pk| {
            let q = pk.q + Vector3::new(
                jitter.sample(&mut rng),
                jitter.sample(&mut rng),
                jitter.sample(&mut rng),
            );
            ObservedPeak::new(q, pk.ipk_obs)
        })
        .collect();

    let solution = find_ub_matrix(&peaks, &test_config()).expect("search failed");
    assert!(
        solution.stats.percent_at(0.2) >= 99.0,
        "only {:.1}% indexed",
        solution.stats.percent_at(0.2)
    );
    assert!(lattice_equivalent(&solution.ub, &ub_true));
}

#[test]
fn test_sequential_scan_is_reproducible() {
    let ub_true = Matrix3d::from_diagonal(&Vector3d::new(0.25, 0.2, 1.0 / 6.0));
    let peaks = lattice_peaks(&ub_true, 2);

    let first = scan_directions(&peaks, None, 0.1, 8.0, false);
    let second = scan_directions(&peaks, None, 0.1, 8.0, false);

    assert_eq!(first.len(), second.len());
    let a = first.best().expect("empty scan");
    let b = second.best().expect("empty scan");
    assert_eq!(a.x, b.x);
    assert_eq!(a.y, b.y);
    assert_eq!(a.period, b.period);
    assert_eq!(a.correlation, b.correlation);
}

#[test]
fn test_degenerate_peaks_report_no_directions() {
    // Two peaks cannot carry periodicity on any projection axis.
    let peaks = vec![
        ObservedPeak::new(Vector3::new(0.0, 0.0, 0.2), 100),
        ObservedPeak::new(Vector3::new(0.0, 0.0, 0.4), 100),
    ];
    let config = IndexConfig {
        max_cell_edge: 2.0,
        initial_grid: 0.1,
        min_grid: 0.06,
        min_candidates: 4,
        parallel: false,
        ..Default::default()
    };
    let err = find_ub_matrix(&peaks, &config).unwrap_err();
    assert!(
        err.to_string().contains("directions"),
        "unexpected error: {}",
        err
    );
}

#[test]
fn test_empty_peak_list_is_an_error() {
    assert!(find_ub_matrix(&[], &test_config()).is_err());
}

#[test]
fn test_exhaustive_search_ranks_by_indexing_quality() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

    let ub_true = Matrix3d::from_diagonal(&Vector3d::new(0.25, 0.2, 1.0 / 6.0));
    let peaks = lattice_peaks(&ub_true, 2);

    let config = IndexConfig {
        max_matrices: 4,
        ..test_config()
    };
    let results = find_all_ub_matrices(&peaks, &config).expect("exhaustive search failed");
    assert!(!results.is_empty());

    // Best matrix first, and the best one indexes the lattice.
    for pair in results.windows(2) {
        assert!(pair[0].stats.percent_at(0.2) >= pair[1].stats.percent_at(0.2));
    }
    assert!(results[0].stats.percent_at(0.2) >= 99.0);
    assert!(lattice_equivalent(&results[0].ub, &ub_true));
}
