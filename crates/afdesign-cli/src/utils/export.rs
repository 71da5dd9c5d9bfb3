use crate::error::{CliError, Result};
use afdesign::engine::state::LossRecord;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const FASTA_LINE_WIDTH: usize = 60;
const FIXED_COLUMNS: [&str; 8] = [
    "step", "loss", "seqid", "hard", "soft", "temp", "recycles", "models",
];

pub struct FastaRecord {
    pub header: String,
    pub sequence: String,
}

pub fn write_fasta(path: &Path, records: &[FastaRecord]) -> Result<()> {
    let export_err = |e: std::io::Error| CliError::Export {
        path: path.to_path_buf(),
        source: e.into(),
    };
    let mut writer = BufWriter::new(File::create(path).map_err(export_err)?);
    for record in records {
        writeln!(writer, ">{}", record.header).map_err(export_err)?;
        let residues: Vec<char> = record.sequence.chars().collect();
        for line in residues.chunks(FASTA_LINE_WIDTH) {
            writeln!(writer, "{}", line.iter().collect::<String>()).map_err(export_err)?;
        }
    }
    writer.flush().map_err(export_err)
}

/// Writes one row per step. Loss terms become extra columns after the fixed
/// ones, sorted by name; absent values are left empty.
pub fn write_trajectory_csv(path: &Path, losses: &[LossRecord]) -> Result<()> {
    let export_err = |e: csv::Error| CliError::Export {
        path: path.to_path_buf(),
        source: e.into(),
    };
    let terms: BTreeSet<&str> = losses
        .iter()
        .flat_map(|record| record.terms.keys().map(String::as_str))
        .filter(|term| !FIXED_COLUMNS.contains(term))
        .collect();

    let mut writer = csv::Writer::from_path(path).map_err(export_err)?;
    let header = FIXED_COLUMNS.iter().copied().chain(terms.iter().copied());
    writer.write_record(header).map_err(export_err)?;

    for (step, record) in losses.iter().enumerate() {
        let models = record
            .models
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(";");
        let mut row = vec![
            (step + 1).to_string(),
            record.loss.to_string(),
            record.seqid.map(|v| v.to_string()).unwrap_or_default(),
            record.hard.to_string(),
            record.soft.to_string(),
            record.temp.to_string(),
            record.recycles.to_string(),
            models,
        ];
        row.extend(
            terms
                .iter()
                .map(|term| record.terms.get(*term).map(f64::to_string).unwrap_or_default()),
        );
        writer.write_record(&row).map_err(export_err)?;
    }
    writer
        .flush()
        .map_err(|e| CliError::Export {
            path: path.to_path_buf(),
            source: e.into(),
        })
}
