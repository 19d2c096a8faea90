use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::info;

use crate::error::PostProcessError;
use crate::record::DocumentRecord;

pub const CSV_HEADER: [&str; 2] = ["api_docs", "explanatory_text"];

/// Convert the exported JSON array into a CSV with one row per record.
///
/// List fields are written as their JSON array text. Returns the number of data rows.
pub fn json_to_csv(json_path: &Path, csv_path: &Path) -> Result<usize, PostProcessError> {
    let raw = fs::read_to_string(json_path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => PostProcessError::MissingOutput {
            path: json_path.to_path_buf(),
        },
        _ => PostProcessError::Read {
            path: json_path.to_path_buf(),
            source,
        },
    })?;

    let records: Vec<DocumentRecord> =
        serde_json::from_str(&raw).map_err(|source| PostProcessError::Parse {
            path: json_path.to_path_buf(),
            source,
        })?;

    write_csv(&records, csv_path)?;
    info!(
        "Converted {} records from {} to {}",
        records.len(),
        json_path.display(),
        csv_path.display()
    );
    Ok(records.len())
}

fn write_csv(records: &[DocumentRecord], csv_path: &Path) -> Result<(), PostProcessError> {
    let write_err = |source| PostProcessError::Write {
        path: csv_path.to_path_buf(),
        source,
    };

    if let Some(parent) = csv_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| write_err(e.into()))?;
    }

    let mut wtr = csv::Writer::from_path(csv_path).map_err(write_err)?;
    wtr.write_record(CSV_HEADER).map_err(write_err)?;
    for r in records {
        wtr.write_record([list_text(&r.api_docs), list_text(&r.explanatory_text)])
            .map_err(write_err)?;
    }
    wtr.flush().map_err(|e| write_err(e.into()))?;
    Ok(())
}

fn list_text(items: &[String]) -> String {
    // Serializing a slice of strings cannot fail.
    serde_json::to_string(items).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::JsonExporter;

    fn export(path: &Path, records: &[DocumentRecord]) {
        let mut exporter = JsonExporter::create(path).unwrap();
        for r in records {
            exporter.export(r).unwrap();
        }
        exporter.finish().unwrap();
    }

    fn read_rows(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
        let mut rdr = csv::Reader::from_path(path).unwrap();
        let header = rdr.headers().unwrap().iter().map(String::from).collect();
        let rows = rdr
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect();
        (header, rows)
    }

    #[test]
    fn one_row_per_record_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("items.json");
        let csv_path = dir.path().join("output.csv");
        export(
            &json,
            &[
                DocumentRecord {
                    api_docs: vec!["X".into()],
                    explanatory_text: vec!["A".into(), "B".into()],
                },
                DocumentRecord {
                    api_docs: vec![],
                    explanatory_text: vec!["second, with comma".into()],
                },
            ],
        );

        assert_eq!(json_to_csv(&json, &csv_path).unwrap(), 2);

        let (header, rows) = read_rows(&csv_path);
        assert_eq!(header, vec!["api_docs", "explanatory_text"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec![r#"["X"]"#, r#"["A","B"]"#]);
        assert_eq!(rows[1], vec!["[]", r#"["second, with comma"]"#]);
    }

    #[test]
    fn empty_array_gives_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("items.json");
        let csv_path = dir.path().join("output.csv");
        export(&json, &[]);

        assert_eq!(json_to_csv(&json, &csv_path).unwrap(), 0);
        let (header, rows) = read_rows(&csv_path);
        assert_eq!(header.len(), 2);
        assert!(rows.is_empty());
    }

    #[test]
    fn missing_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("output.csv");
        let err = json_to_csv(&dir.path().join("nope.json"), &csv_path).unwrap_err();
        assert!(matches!(err, PostProcessError::MissingOutput { .. }));
        assert!(!csv_path.exists());
    }

    #[test]
    fn garbage_json_is_a_parse_error_and_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("items.json");
        fs::write(&json, "[{\"api_docs\": [").unwrap();

        let err = json_to_csv(&json, &dir.path().join("output.csv")).unwrap_err();
        assert!(matches!(err, PostProcessError::Parse { .. }));
        assert_eq!(fs::read_to_string(&json).unwrap(), "[{\"api_docs\": [");
    }
}
