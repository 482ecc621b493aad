//! Delimited text I/O for count matrices, per-id vectors and transformed output

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use csv::{ReaderBuilder, Trim, WriterBuilder};
use ndarray::{Array1, Array2};

use crate::data::CountMatrix;
use crate::error::{Result, RlogError};

/// Tab if the first line has one, comma otherwise
fn detect_delimiter(path: &Path) -> Result<u8> {
    let mut first = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first)?;
    Ok(if first.contains('\t') { b'\t' } else { b',' })
}

/// Read a count matrix from a CSV or TSV file.
///
/// The header holds the sample ids after one leading cell; each following row is a
/// gene id followed by one count per sample.
pub fn read_count_matrix<P: AsRef<Path>>(path: P) -> Result<CountMatrix> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .delimiter(detect_delimiter(path)?)
        .trim(Trim::All)
        .from_path(path)?;

    let header = reader.headers()?.clone();
    if header.len() < 2 {
        return Err(RlogError::InvalidCountMatrix {
            reason: "header needs a gene id column and at least one sample".to_string(),
        });
    }
    let sample_ids: Vec<String> = header.iter().skip(1).map(str::to_string).collect();
    let n_samples = sample_ids.len();

    let mut gene_ids = Vec::new();
    let mut values: Vec<f64> = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let mut fields = record.iter();
        let gene = fields.next().unwrap_or_default().to_string();
        for field in fields {
            let v = field.parse::<f64>().map_err(|_| RlogError::InvalidCountMatrix {
                reason: format!("line {}: invalid count '{}' for gene '{}'", line + 2, field, gene),
            })?;
            values.push(v);
        }
        gene_ids.push(gene);
    }

    if gene_ids.is_empty() {
        return Err(RlogError::EmptyData {
            reason: "no genes found in count matrix".to_string(),
        });
    }

    let counts = Array2::from_shape_vec((gene_ids.len(), n_samples), values).map_err(|e| {
        RlogError::InvalidCountMatrix {
            reason: format!("ragged count matrix: {}", e),
        }
    })?;
    log::info!("Read {} genes x {} samples", gene_ids.len(), n_samples);

    CountMatrix::new(counts, gene_ids, sample_ids)
}

/// Read `id, value` pairs. A first row whose value is not numeric is a header.
pub fn read_named_vector<P: AsRef<Path>>(path: P) -> Result<Vec<(String, f64)>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .delimiter(detect_delimiter(path)?)
        .has_headers(false)
        .trim(Trim::All)
        .from_path(path)?;

    let mut pairs = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() < 2 {
            return Err(RlogError::InvalidInput {
                reason: format!("{}: line {} needs an id and a value", path.display(), line + 1),
            });
        }
        let raw = &record[1];
        let value = match raw.parse::<f64>() {
            Ok(v) => v,
            Err(_) if line == 0 => continue,
            Err(_) if raw.eq_ignore_ascii_case("na") => f64::NAN,
            Err(_) => {
                return Err(RlogError::InvalidInput {
                    reason: format!("{}: line {}: invalid value '{}'", path.display(), line + 1, raw),
                })
            }
        };
        pairs.push((record[0].to_string(), value));
    }
    Ok(pairs)
}

/// Order `pairs` by `ids`; every id must be present exactly once
pub fn align_to_ids(pairs: &[(String, f64)], ids: &[String], what: &str) -> Result<Array1<f64>> {
    if pairs.len() != ids.len() {
        return Err(RlogError::DimensionMismatch {
            expected: format!("{} {}", ids.len(), what),
            got: format!("{}", pairs.len()),
        });
    }
    ids.iter()
        .map(|id| {
            pairs
                .iter()
                .find(|(name, _)| name == id)
                .map(|&(_, v)| v)
                .ok_or_else(|| RlogError::InvalidInput {
                    reason: format!("no {} entry for '{}'", what, id),
                })
        })
        .collect()
}

/// Write a labelled matrix as TSV with 10 decimals
pub fn write_matrix<P: AsRef<Path>>(
    path: P,
    gene_ids: &[String],
    sample_ids: &[String],
    data: &Array2<f64>,
) -> Result<()> {
    if data.dim() != (gene_ids.len(), sample_ids.len()) {
        return Err(RlogError::DimensionMismatch {
            expected: format!("{} x {} matrix", gene_ids.len(), sample_ids.len()),
            got: format!("{} x {}", data.nrows(), data.ncols()),
        });
    }

    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(std::iter::once("gene_id").chain(sample_ids.iter().map(String::as_str)))?;
    for (gene, row) in gene_ids.iter().zip(data.rows()) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(gene.clone());
        record.extend(row.iter().map(|v| format!("{:.10}", v)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_read_count_matrix_tsv_and_csv() {
        let tsv = temp_file("gene\ts1\ts2\ng1\t10\t20\ng2\t0\t5\n");
        let m = read_count_matrix(tsv.path()).unwrap();
        assert_eq!(m.sample_ids(), &["s1", "s2"]);
        assert_eq!(m.counts(), array![[10.0, 20.0], [0.0, 5.0]]);

        let csv = temp_file("\"\",\"a\",\"b\",\"c\"\n\"x\",1,2,3\n");
        let m = read_count_matrix(csv.path()).unwrap();
        assert_eq!(m.gene_ids(), &["x"]);
        assert_eq!(m.n_samples(), 3);
    }

    #[test]
    fn test_read_count_matrix_rejects_text() {
        let file = temp_file("gene,s1\ng1,abc\n");
        let err = read_count_matrix(file.path()).unwrap_err();
        assert!(matches!(err, RlogError::InvalidCountMatrix { .. }));
    }

    #[test]
    fn test_named_vector_with_header_aligns() {
        let file = temp_file("sample,size_factor\ns2,1.5\ns1,0.5\n");
        let pairs = read_named_vector(file.path()).unwrap();
        assert_eq!(pairs.len(), 2);
        let sf = align_to_ids(&pairs, &["s1".to_string(), "s2".to_string()], "size factors").unwrap();
        assert_eq!(sf, array![0.5, 1.5]);

        let err = align_to_ids(&pairs, &["s1".to_string(), "s3".to_string()], "size factors").unwrap_err();
        assert!(matches!(err, RlogError::InvalidInput { .. }));
    }

    #[test]
    fn test_write_matrix() {
        let out = NamedTempFile::new().unwrap();
        write_matrix(
            out.path(),
            &["g1".to_string()],
            &["a".to_string(), "b".to_string()],
            &array![[1.25, -0.5]],
        )
        .unwrap();
        let text = std::fs::read_to_string(out.path()).unwrap();
        assert_eq!(text, "gene_id\ta\tb\ng1\t1.2500000000\t-0.5000000000\n");
    }
}
