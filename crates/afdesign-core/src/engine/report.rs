use super::config::LossWeights;
use super::state::LossRecord;

/// Keys printed in a step summary, in display order. Anything else the
/// predictor reports is kept in the trajectory but not printed.
pub const SUMMARY_KEYS: [&str; 19] = [
    "models",
    "recycles",
    "hard",
    "soft",
    "temp",
    "seqid",
    "loss",
    "msa_ent",
    "plddt",
    "pae",
    "helix",
    "con",
    "i_pae",
    "i_con",
    "sc_fape",
    "sc_rmsd",
    "dgram_cce",
    "fape",
    "rmsd",
];

/// Printed even when their configured weight is zero.
const ALWAYS_SHOWN: [&str; 2] = ["loss", "rmsd"];

/// Formats `record` as a single line prefixed with `step`, e.g.
/// `12 models [0, 3] recycles 1 hard 0.00 soft 1.00 temp 0.50 loss 1.23 plddt 0.41`.
///
/// Terms whose weight is exactly zero are hidden; missing keys are skipped.
pub fn summary_line(step: usize, record: &LossRecord, weights: &LossWeights) -> String {
    let mut line = step.to_string();
    for key in SUMMARY_KEYS {
        let muted = weights.get(key).is_some_and(|w| *w == 0.0);
        if muted && !ALWAYS_SHOWN.contains(&key) {
            continue;
        }
        let value = match key {
            "models" => format!("{:?}", record.models),
            "recycles" => record.recycles.to_string(),
            _ => match record.value(key) {
                Some(v) => format!("{:.2}", v),
                None => continue,
            },
        };
        line.push(' ');
        line.push_str(key);
        line.push(' ');
        line.push_str(&value);
    }
    line
}
