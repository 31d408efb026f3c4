//! Seeding the imaging queues from CSV files or OMOP extract directories.

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use models::{ExtractRequest, Priority};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// `extract_summary.json` at the root of an OMOP extract directory.
#[derive(Debug, Deserialize)]
pub struct ExtractSummary {
    pub project_name: String,
    pub extract_datetime: DateTime<Utc>,
    #[serde(default)]
    pub source_hash: Option<String>,
}

/// Build messages from `path`: a CSV file, or an OMOP extract directory
/// with parquet inputs and an extract summary.
pub fn load_messages(path: &Path, priority: Priority) -> anyhow::Result<Vec<ExtractRequest>> {
    if path.is_dir() {
        from_parquet_extract(path, priority)
    } else {
        from_csv(path, priority)
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    project_slug: String,
    mrn: String,
    accession_number: String,
    #[serde(default)]
    study_uid: Option<String>,
    study_datetime: String,
}

fn parse_datetime(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&parsed));
    }
    if let Ok(parsed) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&parsed.and_hms_opt(0, 0, 0).expect("midnight")));
    }
    anyhow::bail!("unparseable study datetime {value:?}")
}

fn from_csv(path: &Path, priority: Priority) -> anyhow::Result<Vec<ExtractRequest>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let extract_datetime = Utc::now();

    let mut messages = Vec::new();
    for row in reader.deserialize::<CsvRow>() {
        let row = row.context("reading CSV row")?;
        messages.push(ExtractRequest {
            mrn: row.mrn,
            accession_number: row.accession_number,
            study_uid: row.study_uid.filter(|uid| !uid.trim().is_empty()),
            study_date: parse_datetime(&row.study_datetime)?,
            project_name: row.project_slug,
            extract_datetime,
            priority,
        });
    }
    Ok(messages)
}

pub fn read_summary(dir: &Path) -> anyhow::Result<ExtractSummary> {
    let path = dir.join("extract_summary.json");
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn from_parquet_extract(dir: &Path, priority: Priority) -> anyhow::Result<Vec<ExtractRequest>> {
    let summary = read_summary(dir)?;

    // person_id -> MRN
    let mut mrns: HashMap<i64, String> = HashMap::new();
    for_each_row(&dir.join("private/PERSON_LINKS.parquet"), |row| {
        if let (Some(person), Some(mrn)) = (int_column(row, "person_id"), str_column(row, "mrn")) {
            mrns.insert(person, mrn);
        }
        Ok(())
    })?;

    // procedure_occurrence_id -> accession number
    let mut accessions: HashMap<i64, String> = HashMap::new();
    for_each_row(
        &dir.join("private/PROCEDURE_OCCURRENCE_LINKS.parquet"),
        |row| {
            if let (Some(procedure), Some(accession)) = (
                int_column(row, "procedure_occurrence_id"),
                str_column(row, "accession_number"),
            ) {
                accessions.insert(procedure, accession);
            }
            Ok(())
        },
    )?;

    let mut messages = Vec::new();
    let mut unmatched = 0usize;
    for_each_row(&dir.join("public/PROCEDURE_OCCURRENCE.parquet"), |row| {
        let procedure = int_column(row, "procedure_occurrence_id");
        let person = int_column(row, "person_id");
        let study_date = datetime_column(row, "procedure_datetime")
            .or_else(|| datetime_column(row, "procedure_date"));

        let (Some(procedure), Some(person), Some(study_date)) = (procedure, person, study_date)
        else {
            unmatched += 1;
            return Ok(());
        };
        let (Some(mrn), Some(accession)) = (mrns.get(&person), accessions.get(&procedure)) else {
            unmatched += 1;
            return Ok(());
        };

        messages.push(ExtractRequest {
            mrn: mrn.clone(),
            accession_number: accession.clone(),
            study_uid: None,
            study_date,
            project_name: summary.project_name.clone(),
            extract_datetime: summary.extract_datetime,
            priority,
        });
        Ok(())
    })?;

    if unmatched > 0 {
        tracing::warn!(unmatched, "procedures without person/accession links were dropped");
    }
    tracing::info!(
        project = %summary.project_name,
        messages = messages.len(),
        source_hash = summary.source_hash.as_deref().unwrap_or("-"),
        "built messages from OMOP extract",
    );
    Ok(messages)
}

fn for_each_row(
    path: &Path,
    mut visit: impl FnMut(&Row) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let file =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("reading parquet {}", path.display()))?;
    for row in reader
        .get_row_iter(None)
        .with_context(|| format!("iterating {}", path.display()))?
    {
        let row = row.with_context(|| format!("decoding a row of {}", path.display()))?;
        visit(&row)?;
    }
    Ok(())
}

fn column<'a>(row: &'a Row, name: &str) -> Option<&'a Field> {
    row.get_column_iter()
        .find(|(column, _)| column.as_str() == name)
        .map(|(_, field)| field)
}

fn int_column(row: &Row, name: &str) -> Option<i64> {
    match column(row, name)? {
        Field::Byte(v) => Some(i64::from(*v)),
        Field::Short(v) => Some(i64::from(*v)),
        Field::Int(v) => Some(i64::from(*v)),
        Field::Long(v) => Some(*v),
        Field::UByte(v) => Some(i64::from(*v)),
        Field::UShort(v) => Some(i64::from(*v)),
        Field::UInt(v) => Some(i64::from(*v)),
        Field::ULong(v) => i64::try_from(*v).ok(),
        Field::Str(v) => v.trim().parse().ok(),
        _ => None,
    }
}

fn str_column(row: &Row, name: &str) -> Option<String> {
    match column(row, name)? {
        Field::Str(v) => Some(v.clone()),
        Field::Long(v) => Some(v.to_string()),
        Field::Int(v) => Some(v.to_string()),
        _ => None,
    }
}

fn datetime_column(row: &Row, name: &str) -> Option<DateTime<Utc>> {
    match column(row, name)? {
        Field::TimestampMillis(ms) => Utc.timestamp_millis_opt(*ms).single(),
        Field::TimestampMicros(us) => Utc.timestamp_micros(*us).single(),
        Field::Date(days) => Utc
            .timestamp_opt(i64::from(*days) * 86_400, 0)
            .single(),
        Field::Str(v) => parse_datetime(v).ok(),
        _ => None,
    }
}
