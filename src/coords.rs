//! Coordinate file codec
//!
//! Coordinate files are tab-separated, one `<x>\t<y>` line per LED, with no
//! header. Line order is the LED addressing order and is never changed.
//! Integral values are written without a fractional part so scanner output
//! round-trips byte for byte.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::transform::Point;

#[derive(Debug, Error)]
pub enum CoordsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: invalid {field} coordinate {value:?}")]
    Parse {
        line: usize,
        field: &'static str,
        value: String,
    },
}

/// Parse one `x<TAB>y` line; `line_no` is 1-based and only used for errors
pub fn parse_line(line: &str, line_no: usize) -> Result<Point, CoordsError> {
    let mut fields = line.split('\t');
    let x = parse_field(fields.next(), "x", line_no)?;
    let y = parse_field(fields.next(), "y", line_no)?;
    Ok(Point::new(x, y))
}

fn parse_field(field: Option<&str>, name: &'static str, line: usize) -> Result<f64, CoordsError> {
    let raw = field.unwrap_or("");
    raw.trim().parse::<f64>().map_err(|_| CoordsError::Parse {
        line,
        field: name,
        value: raw.to_string(),
    })
}

/// Read every point, failing on the first malformed line
pub fn read_points<R: Read>(reader: R) -> Result<Vec<Point>, CoordsError> {
    let mut points = Vec::new();
    for (idx, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        points.push(parse_line(line.trim_end_matches('\r'), idx + 1)?);
    }
    Ok(points)
}

/// Read every point, skipping malformed lines with a warning
pub fn read_points_lenient<R: Read>(reader: R, source: &str) -> Result<Vec<Point>, CoordsError> {
    let mut points = Vec::new();
    for (idx, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line.trim_end_matches('\r'), idx + 1) {
            Ok(p) => points.push(p),
            Err(e) => warn!("Skipping invalid data in {}: {}", source, e),
        }
    }
    Ok(points)
}

/// Format a coordinate in its shortest exact decimal form (`100`, `0.5`)
pub fn format_coord(v: f64) -> String {
    format!("{}", v)
}

/// Line-oriented coordinate writer
pub struct CoordinateWriter<W: Write> {
    inner: W,
    written: usize,
}

impl CoordinateWriter<BufWriter<File>> {
    /// Create (or truncate) a coordinate file
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> CoordinateWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn write_point(&mut self, p: Point) -> io::Result<()> {
        writeln!(self.inner, "{}\t{}", format_coord(p.x), format_coord(p.y))?;
        self.written += 1;
        Ok(())
    }

    pub fn write_all<I: IntoIterator<Item = Point>>(&mut self, points: I) -> io::Result<()> {
        for p in points {
            self.write_point(p)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Number of points written so far
    pub fn written(&self) -> usize {
        self.written
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Write a whole point sequence to `path`
pub fn write_points_file(path: &Path, points: &[Point]) -> io::Result<()> {
    let mut writer = CoordinateWriter::create(path)?;
    writer.write_all(points.iter().copied())?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_round_trip_is_byte_exact() {
        let input = "12\t480\n0\t7\n-3\t15\n";
        let points = read_points(input.as_bytes()).unwrap();
        assert_eq!(points.len(), 3);

        let mut writer = CoordinateWriter::new(Vec::new());
        writer.write_all(points).unwrap();
        assert_eq!(writer.written(), 3);
        assert_eq!(String::from_utf8(writer.into_inner()).unwrap(), input);
    }

    #[test]
    fn test_format_fractional() {
        assert_eq!(format_coord(0.5), "0.5");
        assert_eq!(format_coord(1280.0), "1280");
        assert_eq!(format_coord(-2.25), "-2.25");
    }

    #[test]
    fn test_strict_reader_rejects_bad_field() {
        let err = read_points("1\t2\nabc\t4\n".as_bytes()).unwrap_err();
        match err {
            CoordsError::Parse { line, field, value } => {
                assert_eq!(line, 2);
                assert_eq!(field, "x");
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_strict_reader_rejects_missing_column() {
        assert!(matches!(
            read_points("5\n".as_bytes()),
            Err(CoordsError::Parse { field: "y", .. })
        ));
    }

    #[test]
    fn test_lenient_reader_skips_bad_lines() {
        let input = "1\t2\nx\t3\n4\tnope\n5.5\t6\n";
        let points = read_points_lenient(input.as_bytes(), "test").unwrap();
        assert_eq!(points, vec![Point::new(1.0, 2.0), Point::new(5.5, 6.0)]);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let points = read_points("1\t2\r\n\n3\t4\r\n".as_bytes()).unwrap();
        assert_eq!(points, vec![Point::new(1.0, 2.0), Point::new(3.0, 4.0)]);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.tsv");
        let points = vec![Point::new(1.0, 2.0), Point::new(3.5, -4.0)];
        write_points_file(&path, &points).unwrap();

        let read = read_points(File::open(&path).unwrap()).unwrap();
        assert_eq!(read, points);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\t2\n3.5\t-4\n");
    }
}
