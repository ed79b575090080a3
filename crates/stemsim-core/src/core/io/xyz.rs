use crate::core::io::traits::StructureFile;
use crate::core::models::structure::{Atom, Structure};
use nalgebra::{Point3, Vector3};
use std::io::{self, BufRead, Write};
use thiserror::Error;

const END_OF_RECORDS: &str = "-1";

#[derive(Debug, Error)]
pub enum XyzError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error on line {line}: {kind}")]
    Parse { line: usize, kind: XyzParseErrorKind },
    #[error("Missing required record: {0}")]
    MissingRecord(&'static str),
}

#[derive(Debug, Error)]
pub enum XyzParseErrorKind {
    #[error("Expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("Invalid integer in field {field} (value: '{value}')")]
    InvalidInt { field: usize, value: String },
    #[error("Invalid float in field {field} (value: '{value}')")]
    InvalidFloat { field: usize, value: String },
    #[error("Cell dimensions must be positive")]
    NonPositiveCell,
}

/// The XYZ-style specimen format.
///
/// Layout: a comment line, a line with the three cell dimensions in Angstroms,
/// then one `Z x y z occupancy sigma` record per atom. Occupancy and sigma may be
/// omitted and default to `1.0` and `0.0`. Records end at a line containing `-1`
/// or at end of file. Fields may be separated by whitespace and/or commas.
pub struct XyzFile;

fn split_fields(line: &str) -> Vec<&str> {
    line.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_float(value: &str, field: usize, line: usize) -> Result<f64, XyzError> {
    value.parse().map_err(|_| XyzError::Parse {
        line,
        kind: XyzParseErrorKind::InvalidFloat {
            field,
            value: value.to_string(),
        },
    })
}

impl StructureFile for XyzFile {
    type Error = XyzError;

    fn read_from(reader: &mut impl BufRead) -> Result<Structure, Self::Error> {
        let mut lines = reader.lines().enumerate();

        match lines.next() {
            Some((_, line)) => {
                line?;
            }
            None => return Err(XyzError::MissingRecord("comment line")),
        }

        let (cell_idx, cell_line) = match lines.next() {
            Some((idx, line)) => (idx + 1, line?),
            None => return Err(XyzError::MissingRecord("cell dimensions")),
        };
        let fields = split_fields(&cell_line);
        if fields.len() < 3 {
            return Err(XyzError::Parse {
                line: cell_idx,
                kind: XyzParseErrorKind::FieldCount {
                    expected: 3,
                    found: fields.len(),
                },
            });
        }
        let cell = Vector3::new(
            parse_float(fields[0], 1, cell_idx)?,
            parse_float(fields[1], 2, cell_idx)?,
            parse_float(fields[2], 3, cell_idx)?,
        );
        if cell.iter().any(|&d| d <= 0.0) {
            return Err(XyzError::Parse {
                line: cell_idx,
                kind: XyzParseErrorKind::NonPositiveCell,
            });
        }

        let mut atoms = Vec::new();
        for (idx, line_res) in lines {
            let line = line_res?;
            let line_num = idx + 1;
            let trimmed = line.trim();
            if trimmed == END_OF_RECORDS {
                break;
            }
            if trimmed.is_empty() {
                continue;
            }

            let fields = split_fields(trimmed);
            if fields.len() < 4 {
                return Err(XyzError::Parse {
                    line: line_num,
                    kind: XyzParseErrorKind::FieldCount {
                        expected: 4,
                        found: fields.len(),
                    },
                });
            }

            let atomic_number: u32 = fields[0].parse().map_err(|_| XyzError::Parse {
                line: line_num,
                kind: XyzParseErrorKind::InvalidInt {
                    field: 1,
                    value: fields[0].to_string(),
                },
            })?;
            let position = Point3::new(
                parse_float(fields[1], 2, line_num)?,
                parse_float(fields[2], 3, line_num)?,
                parse_float(fields[3], 4, line_num)?,
            );
            let occupancy = match fields.get(4) {
                Some(v) => parse_float(v, 5, line_num)?,
                None => 1.0,
            };
            let thermal_sigma = match fields.get(5) {
                Some(v) => parse_float(v, 6, line_num)?,
                None => 0.0,
            };

            atoms.push(
                Atom::new(atomic_number, position)
                    .with_occupancy(occupancy)
                    .with_thermal_sigma(thermal_sigma),
            );
        }

        Ok(Structure::new(cell, atoms))
    }

    fn write_to(
        structure: &Structure,
        comment: &str,
        writer: &mut impl Write,
    ) -> Result<(), Self::Error> {
        let cell = structure.cell_dimensions();
        writeln!(writer, "{}", comment.lines().next().unwrap_or(""))?;
        writeln!(writer, "    {:.6} {:.6} {:.6}", cell.x, cell.y, cell.z)?;
        for atom in structure.atoms() {
            writeln!(
                writer,
                "{} {:.6} {:.6} {:.6} {:.4} {:.4}",
                atom.atomic_number,
                atom.position.x,
                atom.position.y,
                atom.position.z,
                atom.occupancy,
                atom.thermal_sigma
            )?;
        }
        writeln!(writer, "{}", END_OF_RECORDS)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SILICON: &str = "\
one unit cell of Si
    5.43 5.43 5.43
14 0.0 0.0 0.0 1.0 0.076
14, 2.715, 2.715, 0.0, 1.0, 0.076
14 1.3575 1.3575 1.3575
-1
";

    #[test]
    fn reads_cell_and_atoms_with_optional_fields() {
        let structure = XyzFile::read_from(&mut Cursor::new(SILICON)).unwrap();

        assert_eq!(structure.cell_dimensions(), Vector3::new(5.43, 5.43, 5.43));
        assert_eq!(structure.len(), 3);
        assert_eq!(structure.atoms()[1].position, Point3::new(2.715, 2.715, 0.0));
        assert_eq!(structure.atoms()[2].occupancy, 1.0);
        assert_eq!(structure.atoms()[2].thermal_sigma, 0.0);
        assert_eq!(structure.atoms()[0].thermal_sigma, 0.076);
    }

    #[test]
    fn stops_at_terminator_record() {
        let input = format!("{}79 0 0 0\n", SILICON);
        let structure = XyzFile::read_from(&mut Cursor::new(input)).unwrap();
        assert_eq!(structure.len(), 3);
    }

    #[test]
    fn reports_line_of_malformed_record() {
        let input = "c\n5 5 5\n14 0 0 0\nSi 1 1 1\n";
        let err = XyzFile::read_from(&mut Cursor::new(input)).unwrap_err();
        assert!(matches!(
            err,
            XyzError::Parse {
                line: 4,
                kind: XyzParseErrorKind::InvalidInt { field: 1, .. }
            }
        ));
    }

    #[test]
    fn rejects_missing_or_invalid_cell() {
        let err = XyzFile::read_from(&mut Cursor::new("only a comment\n")).unwrap_err();
        assert!(matches!(err, XyzError::MissingRecord("cell dimensions")));

        let err = XyzFile::read_from(&mut Cursor::new("c\n5 0 5\n")).unwrap_err();
        assert!(matches!(
            err,
            XyzError::Parse {
                kind: XyzParseErrorKind::NonPositiveCell,
                ..
            }
        ));
    }

    #[test]
    fn written_file_reads_back_to_same_structure() {
        let structure = XyzFile::read_from(&mut Cursor::new(SILICON)).unwrap();
        let mut buffer = Vec::new();
        XyzFile::write_to(&structure, "roundtrip", &mut buffer).unwrap();

        let reread = XyzFile::read_from(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(reread.len(), structure.len());
        assert!((reread.atoms()[1].position.x - 2.715).abs() < 1e-9);
    }
}
