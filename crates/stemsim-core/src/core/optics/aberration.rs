use ndarray::{Array2, Zip};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Trimmed lines this short mark the end of an aberration table.
const TABLE_TERMINATOR_MAX_LEN: usize = 3;

#[derive(Debug, Error)]
pub enum AberrationError {
    #[error("Failed to read aberration file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Error getting aberration from line {line}: {text}")]
    Parse { line: usize, text: String },
    #[error("Bad input data: no aberrations were found")]
    Empty,
}

/// One term of the wavefront aberration expansion.
///
/// `m` is the azimuthal order and `n` the radial order. Only terms with
/// `m <= n` and even `m + n` belong to the basis; [`normalize_and_override`]
/// enforces that together with uniqueness of `(m, n)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aberration {
    pub m: u32,
    pub n: u32,
    pub magnitude: f64,
    pub angle: f64,
}

impl Aberration {
    pub fn new(m: u32, n: u32, magnitude: f64, angle: f64) -> Self {
        Self {
            m,
            n,
            magnitude,
            angle,
        }
    }

    pub fn order(&self) -> (u32, u32) {
        (self.m, self.n)
    }

    /// Whether the term is a member of the aberration basis.
    pub fn is_valid_basis_member(&self) -> bool {
        self.m <= self.n && (self.m + self.n) % 2 == 0
    }
}

/// Parses an aberration table.
///
/// The first line is a header and is discarded. Every following line holds
/// `m, n, magnitude, angle` separated by commas and/or whitespace. A trimmed
/// line of three characters or fewer ends the table.
///
/// # Errors
///
/// Returns [`AberrationError::Parse`] with the 1-based line number for any line
/// whose fields are missing or not numeric, and [`AberrationError::Empty`] when
/// the table holds no terms.
pub fn read_aberrations(reader: impl BufRead) -> Result<Vec<Aberration>, AberrationError> {
    let mut terms = Vec::new();
    let mut lines = reader.lines().enumerate();

    if let Some((_, header)) = lines.next() {
        header.map_err(|e| AberrationError::Io {
            path: "<input>".to_string(),
            source: e,
        })?;
    }

    for (idx, line_res) in lines {
        let line_num = idx + 1;
        let line = line_res.map_err(|e| AberrationError::Io {
            path: "<input>".to_string(),
            source: e,
        })?;
        let trimmed = line.trim();
        if trimmed.len() <= TABLE_TERMINATOR_MAX_LEN {
            break;
        }
        terms.push(parse_term(trimmed, line_num)?);
    }

    if terms.is_empty() {
        return Err(AberrationError::Empty);
    }
    info!(count = terms.len(), "Extracted aberration terms.");
    Ok(terms)
}

pub fn read_aberrations_from_path(path: &Path) -> Result<Vec<Aberration>, AberrationError> {
    let file = File::open(path).map_err(|e| AberrationError::Io {
        path: path.to_string_lossy().to_string(),
        source: e,
    })?;
    read_aberrations(BufReader::new(file))
}

fn parse_term(line: &str, line_num: usize) -> Result<Aberration, AberrationError> {
    let parse_error = || AberrationError::Parse {
        line: line_num,
        text: line.to_string(),
    };
    let mut fields = line
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty());
    let mut next = || fields.next().ok_or_else(parse_error);

    let m = next()?.parse::<u32>().map_err(|_| parse_error())?;
    let n = next()?.parse::<u32>().map_err(|_| parse_error())?;
    let magnitude = next()?.parse::<f64>().map_err(|_| parse_error())?;
    let angle = next()?.parse::<f64>().map_err(|_| parse_error())?;

    Ok(Aberration::new(m, n, magnitude, angle))
}

/// Canonicalizes a term list and folds in the C1/C3/C5 overrides.
///
/// Terms are stably sorted by `(m, n)`; for duplicated orders the first term
/// wins and the rest are dropped with a warning. Terms outside the basis are
/// removed. Each non-zero override (in Angstroms) replaces the magnitude of
/// `(0,2)`, `(0,4)` or `(0,6)` with `value * pi / (k * wavelength)`, `k = 1, 2, 3`,
/// and resets its angle to zero, appending a new term if the order is absent.
pub fn normalize_and_override(
    mut terms: Vec<Aberration>,
    c1: f64,
    c3: f64,
    c5: f64,
    wavelength: f64,
) -> Vec<Aberration> {
    terms.sort_by_key(Aberration::order);
    terms.dedup_by(|later, kept| {
        let duplicate = later.order() == kept.order();
        if duplicate {
            warn!(
                m = later.m,
                n = later.n,
                dropped_magnitude = later.magnitude,
                kept_magnitude = kept.magnitude,
                "Duplicate aberration order; keeping the first occurrence."
            );
        }
        duplicate
    });
    terms.retain(Aberration::is_valid_basis_member);

    let overrides = [(2, c1, 1.0), (4, c3, 2.0), (6, c5, 3.0)];
    for (n, value, k) in overrides {
        if value.abs() > 0.0 {
            let magnitude = value * PI / (k * wavelength);
            match terms.iter_mut().find(|t| t.order() == (0, n)) {
                Some(term) => {
                    term.magnitude = magnitude;
                    term.angle = 0.0;
                }
                None => terms.push(Aberration::new(0, n, magnitude, 0.0)),
            }
        }
    }

    terms
}

/// Evaluates the aberration function over a spatial-frequency grid.
///
/// The result carries the phase surface in its real part; the imaginary part is
/// zero. No special handling is applied at `q = 0`.
///
/// # Panics
///
/// Panics if `q` and `q_theta` do not have the same shape.
pub fn build_aberration_surface(
    q: &Array2<f64>,
    q_theta: &Array2<f64>,
    wavelength: f64,
    terms: &[Aberration],
) -> Array2<Complex64> {
    assert_eq!(
        q.dim(),
        q_theta.dim(),
        "frequency magnitude and azimuth grids must share a shape"
    );
    let mut chi = Array2::<Complex64>::zeros(q.dim());

    for term in terms {
        let rad = term.angle * PI / 180.0;
        let phase = f64::from(term.n) * rad;
        let cx = if term.m == 0 {
            term.magnitude
        } else {
            term.magnitude * phase.cos()
        };
        let cy = term.magnitude * phase.sin();
        let m = f64::from(term.m);
        let n = term.n as i32;

        Zip::from(&mut chi)
            .and(q)
            .and(q_theta)
            .for_each(|value, &q_mag, &theta| {
                let radial = (wavelength * q_mag).powi(n);
                value.re += cx * radial * (m * theta).cos() + cy * radial * (m * theta).sin();
            });
    }

    chi
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::optics::probe::FrequencyGrid;
    use std::io::Cursor;

    const LAMBDA: f64 = 0.0197;

    #[test]
    fn reads_terms_after_header() {
        let input = "# header\n0,2,1.5,0\n2,2,0.3,45\n";
        let terms = read_aberrations(Cursor::new(input)).unwrap();
        assert_eq!(
            terms,
            vec![
                Aberration::new(0, 2, 1.5, 0.0),
                Aberration::new(2, 2, 0.3, 45.0)
            ]
        );
    }

    #[test]
    fn accepts_whitespace_and_mixed_separators() {
        let input = "m n mag angle\n  1 1   2.5e-1 10\n3, 3 ,1 , 0\n";
        let terms = read_aberrations(Cursor::new(input)).unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0], Aberration::new(1, 1, 0.25, 10.0));
        assert_eq!(terms[1], Aberration::new(3, 3, 1.0, 0.0));
    }

    #[test]
    fn malformed_line_reports_its_line_number() {
        let input = "# header\n0,2,1.5,0\n2,2,abc,45\n";
        let err = read_aberrations(Cursor::new(input)).unwrap_err();
        match err {
            AberrationError::Parse { line, text } => {
                assert_eq!(line, 3);
                assert_eq!(text, "2,2,abc,45");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_fields_and_negative_orders_are_parse_errors() {
        let err = read_aberrations(Cursor::new("h\n0,2,1.5\n")).unwrap_err();
        assert!(matches!(err, AberrationError::Parse { line: 2, .. }));

        let err = read_aberrations(Cursor::new("h\n-1,2,1.5,0\n")).unwrap_err();
        assert!(matches!(err, AberrationError::Parse { line: 2, .. }));
    }

    #[test]
    fn short_line_terminates_table() {
        let input = "h\n0,2,1.5,0\n\n2,2,0.3,45\n";
        let terms = read_aberrations(Cursor::new(input)).unwrap();
        assert_eq!(terms.len(), 1);
    }

    #[test]
    fn empty_table_is_an_error() {
        assert!(matches!(
            read_aberrations(Cursor::new("only header\n")),
            Err(AberrationError::Empty)
        ));
        assert!(matches!(
            read_aberrations(Cursor::new("")),
            Err(AberrationError::Empty)
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = read_aberrations_from_path(Path::new("/nonexistent/aberrations.txt"));
        assert!(matches!(err, Err(AberrationError::Io { .. })));
    }

    #[test]
    fn normalization_yields_unique_valid_terms() {
        let terms = vec![
            Aberration::new(2, 2, 1.0, 0.0),
            Aberration::new(0, 2, 5.0, 0.0),
            Aberration::new(3, 1, 1.0, 0.0),
            Aberration::new(1, 2, 1.0, 0.0),
            Aberration::new(0, 2, 7.0, 0.0),
            Aberration::new(1, 3, 2.0, 30.0),
            Aberration::new(2, 2, 9.0, 0.0),
        ];
        let normalized = normalize_and_override(terms, 0.0, 0.0, 0.0, LAMBDA);

        for (i, a) in normalized.iter().enumerate() {
            assert!(a.m <= a.n && (a.m + a.n) % 2 == 0, "invalid term {a:?}");
            for b in &normalized[i + 1..] {
                assert_ne!(a.order(), b.order());
            }
        }
        assert_eq!(
            normalized,
            vec![
                Aberration::new(0, 2, 5.0, 0.0),
                Aberration::new(1, 3, 2.0, 30.0),
                Aberration::new(2, 2, 1.0, 0.0),
            ]
        );
    }

    #[test]
    fn defocus_override_replaces_existing_term() {
        let terms = vec![Aberration::new(0, 2, 3.0, 12.0), Aberration::new(2, 2, 1.0, 0.0)];
        let normalized = normalize_and_override(terms, 100.0, 0.0, 0.0, LAMBDA);
        let c1 = normalized.iter().find(|t| t.order() == (0, 2)).unwrap();
        assert!((c1.magnitude - 100.0 * PI / LAMBDA).abs() < 1e-9);
        assert_eq!(c1.angle, 0.0);
        assert_eq!(normalized.len(), 2);
    }

    #[test]
    fn defocus_override_appends_missing_term_with_zero_angle() {
        let normalized = normalize_and_override(Vec::new(), 100.0, 0.0, 0.0, LAMBDA);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].order(), (0, 2));
        assert!((normalized[0].magnitude - 100.0 * PI / LAMBDA).abs() < 1e-9);
        assert_eq!(normalized[0].angle, 0.0);
    }

    #[test]
    fn spherical_overrides_use_their_scale_factors() {
        let normalized = normalize_and_override(Vec::new(), 0.0, 1e7, 3e9, LAMBDA);
        let c3 = normalized.iter().find(|t| t.order() == (0, 4)).unwrap();
        let c5 = normalized.iter().find(|t| t.order() == (0, 6)).unwrap();
        assert!((c3.magnitude - 1e7 * PI / (2.0 * LAMBDA)).abs() < 1e-3);
        assert!((c5.magnitude - 3e9 * PI / (3.0 * LAMBDA)).abs() < 1e-1);
        assert!(normalized.iter().all(|t| t.order() != (0, 2)));
    }

    #[test]
    fn repeated_overrides_are_stable() {
        let once = normalize_and_override(Vec::new(), -50.0, 0.0, 0.0, LAMBDA);
        let twice = normalize_and_override(once.clone(), -50.0, 0.0, 0.0, LAMBDA);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_term_list_gives_zero_surface() {
        let grid = FrequencyGrid::new((5, 7), (0.1, 0.1));
        let chi = build_aberration_surface(grid.q(), grid.q_theta(), LAMBDA, &[]);
        assert_eq!(chi.dim(), (5, 7));
        assert!(chi.iter().all(|c| c.re == 0.0 && c.im == 0.0));
    }

    #[test]
    fn defocus_surface_is_radially_symmetric_quadratic() {
        let grid = FrequencyGrid::new((8, 8), (0.2, 0.2));
        let term = Aberration::new(0, 2, 2.0, 37.0);
        let chi = build_aberration_surface(grid.q(), grid.q_theta(), LAMBDA, &[term]);

        for ((j, i), value) in chi.indexed_iter() {
            let q = grid.q()[[j, i]];
            let expected = 2.0 * (LAMBDA * q).powi(2);
            assert!((value.re - expected).abs() < 1e-15);
            assert_eq!(value.im, 0.0);
        }
    }

    #[test]
    fn astigmatism_surface_depends_on_azimuth() {
        let grid = FrequencyGrid::new((8, 8), (0.2, 0.2));
        let term = Aberration::new(2, 2, 1.0, 0.0);
        let chi = build_aberration_surface(grid.q(), grid.q_theta(), 1.0, &[term]);

        // Along +x (theta = 0) cos(2 theta) = 1, along +y it is -1.
        let along_x = chi[[0, 1]].re;
        let along_y = chi[[1, 0]].re;
        assert!(along_x > 0.0);
        assert!((along_x + along_y).abs() < 1e-12);
    }
}
