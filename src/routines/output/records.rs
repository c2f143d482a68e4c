use csv::WriterBuilder;
use eyre::Result;

use crate::routines::output::OutputFile;
use crate::structs::history::{Record, RefinementHistory};

/// Column names of a set of records, in order of first appearance
pub fn columns(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for (name, _) in record.fields() {
            if !columns.iter().any(|c| c == name) {
                columns.push(name.clone());
            }
        }
    }
    columns
}

/// Writes the iteration log of `history` to `records.csv`
///
/// Records may carry different fields, e.g. when methods were run one after the other on the
/// same history. Missing values are left empty.
pub fn write_records(history: &RefinementHistory, folder: &str) -> Result<()> {
    tracing::debug!("Writing records...");
    let records = history.records();
    let columns = columns(records);

    let outputfile = OutputFile::new(folder, "records.csv")?;
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_writer(outputfile.file());

    writer.write_field("iteration")?;
    for column in &columns {
        writer.write_field(column)?;
    }
    writer.write_record(None::<&[u8]>)?;

    for record in records {
        writer.write_field(format!("{}", record.iteration()))?;
        for column in &columns {
            match record.get(column) {
                Some(value) => writer.write_field(format!("{}", value))?,
                None => writer.write_field("")?,
            }
        }
        writer.write_record(None::<&[u8]>)?;
    }
    writer.flush()?;
    tracing::debug!(
        "{} record(s) written to {:?}",
        records.len(),
        outputfile.relative_path()
    );
    Ok(())
}
