//! Chromosome name/code mapping, matching `chr_from_text`/`chr_names` in
//! `gassembler.c`: autosomes `1`..`22`, then `X`, `Y`; `0` is reserved for
//! "no such chromosome" and never returned by [`chr_from_text`].

pub const CHR_MAX_AUTOSOME: u8 = 22;
pub const CHR_X: u8 = 23;
pub const CHR_Y: u8 = 24;

const NAMES: [&str; 25] = [
    "INVALID", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17", "18", "19",
    "20", "21", "22", "X", "Y",
];

/// Parses a chromosome name to its numeric code, or `None` if it names
/// neither an autosome `1`-`22` nor `X`/`Y`.
pub fn chr_from_text(name: &str) -> Option<u8> {
    match name {
        "X" => Some(CHR_X),
        "Y" => Some(CHR_Y),
        _ => {
            let val: u8 = name.parse().ok()?;
            (val >= 1 && val <= CHR_MAX_AUTOSOME).then_some(val)
        }
    }
}

/// Renders a chromosome code back to its display name.
pub fn chr_name(chr: u8) -> &'static str {
    NAMES.get(chr as usize).copied().unwrap_or("INVALID")
}
