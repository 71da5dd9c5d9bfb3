use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const ALPHABET_SIZE: usize = 20;

/// Index used for an unknown residue (`X`). It never equals a designed
/// residue index, so unknown reference positions always count as mismatches.
pub const UNKNOWN_INDEX: usize = ALPHABET_SIZE;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum AlphabetError {
    #[error("Unrecognized residue code '{0}'")]
    UnknownResidue(String),

    #[error("Residue index {0} is outside the 20-letter alphabet")]
    IndexOutOfRange(usize),
}

/// The 20 standard amino acids, in the column order of the design logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AminoAcid {
    Alanine,       // A
    Arginine,      // R
    Asparagine,    // N
    AsparticAcid,  // D
    Cysteine,      // C
    Glutamine,     // Q
    GlutamicAcid,  // E
    Glycine,       // G
    Histidine,     // H
    Isoleucine,    // I
    Leucine,       // L
    Lysine,        // K
    Methionine,    // M
    Phenylalanine, // F
    Proline,       // P
    Serine,        // S
    Threonine,     // T
    Tryptophan,    // W
    Tyrosine,      // Y
    Valine,        // V
}

impl AminoAcid {
    pub const ALL: [AminoAcid; ALPHABET_SIZE] = [
        AminoAcid::Alanine,
        AminoAcid::Arginine,
        AminoAcid::Asparagine,
        AminoAcid::AsparticAcid,
        AminoAcid::Cysteine,
        AminoAcid::Glutamine,
        AminoAcid::GlutamicAcid,
        AminoAcid::Glycine,
        AminoAcid::Histidine,
        AminoAcid::Isoleucine,
        AminoAcid::Leucine,
        AminoAcid::Lysine,
        AminoAcid::Methionine,
        AminoAcid::Phenylalanine,
        AminoAcid::Proline,
        AminoAcid::Serine,
        AminoAcid::Threonine,
        AminoAcid::Tryptophan,
        AminoAcid::Tyrosine,
        AminoAcid::Valine,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Result<Self, AlphabetError> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or(AlphabetError::IndexOutOfRange(index))
    }

    pub fn to_one_letter(self) -> char {
        b"ARNDCQEGHILKMFPSTWYV"[self.index()] as char
    }

    pub fn to_three_letter(self) -> &'static str {
        match self {
            AminoAcid::Alanine => "ALA",
            AminoAcid::Arginine => "ARG",
            AminoAcid::Asparagine => "ASN",
            AminoAcid::AsparticAcid => "ASP",
            AminoAcid::Cysteine => "CYS",
            AminoAcid::Glutamine => "GLN",
            AminoAcid::GlutamicAcid => "GLU",
            AminoAcid::Glycine => "GLY",
            AminoAcid::Histidine => "HIS",
            AminoAcid::Isoleucine => "ILE",
            AminoAcid::Leucine => "LEU",
            AminoAcid::Lysine => "LYS",
            AminoAcid::Methionine => "MET",
            AminoAcid::Phenylalanine => "PHE",
            AminoAcid::Proline => "PRO",
            AminoAcid::Serine => "SER",
            AminoAcid::Threonine => "THR",
            AminoAcid::Tryptophan => "TRP",
            AminoAcid::Tyrosine => "TYR",
            AminoAcid::Valine => "VAL",
        }
    }

    pub fn from_one_letter(code: char) -> Option<Self> {
        let upper = code.to_ascii_uppercase();
        Self::ALL.iter().copied().find(|aa| aa.to_one_letter() == upper)
    }
}

impl fmt::Display for AminoAcid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_three_letter())
    }
}

impl FromStr for AminoAcid {
    type Err = AlphabetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut chars = trimmed.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return Self::from_one_letter(c)
                .ok_or_else(|| AlphabetError::UnknownResidue(s.to_string()));
        }
        let upper = trimmed.to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|aa| aa.to_three_letter() == upper)
            .ok_or_else(|| AlphabetError::UnknownResidue(s.to_string()))
    }
}

/// Parses a one-letter sequence into alphabet indices. `X` maps to
/// [`UNKNOWN_INDEX`]; whitespace is ignored.
pub fn parse_sequence(sequence: &str) -> Result<Vec<usize>, AlphabetError> {
    sequence
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| {
            if c.eq_ignore_ascii_case(&'X') {
                Ok(UNKNOWN_INDEX)
            } else {
                AminoAcid::from_one_letter(c)
                    .map(AminoAcid::index)
                    .ok_or_else(|| AlphabetError::UnknownResidue(c.to_string()))
            }
        })
        .collect()
}

pub fn sequence_to_string(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|&i| AminoAcid::from_index(i).map_or('X', AminoAcid::to_one_letter))
        .collect()
}
