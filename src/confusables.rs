use std::collections::HashMap;

use lazy_static::lazy_static;
use serde::Serialize;

/// Bumped whenever an entry is added, removed or reordered.
pub const TABLE_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Script {
    Cyrillic,
    Greek,
    Armenian,
    MathBold,
    MathMonospace,
}

impl Script {
    pub fn as_str(&self) -> &'static str {
        match self {
            Script::Cyrillic => "cyrillic",
            Script::Greek => "greek",
            Script::Armenian => "armenian",
            Script::MathBold => "math-bold",
            Script::MathMonospace => "math-monospace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confusable {
    pub ch: char,
    pub script: Script,
}

/// Latin letter -> look-alike codepoints, primary entry first.
pub struct ConfusableTable {
    version: &'static str,
    entries: HashMap<char, Vec<Confusable>>,
}

lazy_static! {
    static ref TABLE: ConfusableTable = ConfusableTable::build();
}

impl ConfusableTable {
    pub fn global() -> &'static ConfusableTable {
        &TABLE
    }

    pub fn version(&self) -> &'static str {
        self.version
    }

    pub fn lookup(&self, ch: char) -> &[Confusable] {
        self.entries.get(&ch).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn primary(&self, ch: char) -> Option<Confusable> {
        self.lookup(ch).first().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn build() -> Self {
        let mut entries: HashMap<char, Vec<Confusable>> = HashMap::new();

        let scripted = [
            // Cyrillic lowercase
            ('a', '\u{0430}', Script::Cyrillic), ('c', '\u{0441}', Script::Cyrillic),
            ('d', '\u{0501}', Script::Cyrillic), ('e', '\u{0435}', Script::Cyrillic),
            ('h', '\u{04BB}', Script::Cyrillic), ('i', '\u{0456}', Script::Cyrillic),
            ('j', '\u{0458}', Script::Cyrillic), ('l', '\u{04CF}', Script::Cyrillic),
            ('o', '\u{043E}', Script::Cyrillic), ('p', '\u{0440}', Script::Cyrillic),
            ('q', '\u{051B}', Script::Cyrillic), ('s', '\u{0455}', Script::Cyrillic),
            ('w', '\u{051D}', Script::Cyrillic), ('x', '\u{0445}', Script::Cyrillic),
            ('y', '\u{0443}', Script::Cyrillic),
            // Cyrillic uppercase
            ('A', '\u{0410}', Script::Cyrillic), ('B', '\u{0412}', Script::Cyrillic),
            ('C', '\u{0421}', Script::Cyrillic), ('E', '\u{0415}', Script::Cyrillic),
            ('H', '\u{041D}', Script::Cyrillic), ('I', '\u{0406}', Script::Cyrillic),
            ('J', '\u{0408}', Script::Cyrillic), ('K', '\u{041A}', Script::Cyrillic),
            ('M', '\u{041C}', Script::Cyrillic), ('O', '\u{041E}', Script::Cyrillic),
            ('P', '\u{0420}', Script::Cyrillic), ('S', '\u{0405}', Script::Cyrillic),
            ('T', '\u{0422}', Script::Cyrillic), ('X', '\u{0425}', Script::Cyrillic),
            ('Y', '\u{04AE}', Script::Cyrillic),
            // Greek lowercase
            ('a', '\u{03B1}', Script::Greek), ('i', '\u{03B9}', Script::Greek),
            ('k', '\u{03BA}', Script::Greek), ('o', '\u{03BF}', Script::Greek),
            ('p', '\u{03C1}', Script::Greek), ('t', '\u{03C4}', Script::Greek),
            ('u', '\u{03C5}', Script::Greek), ('v', '\u{03BD}', Script::Greek),
            ('w', '\u{03C9}', Script::Greek),
            // Greek uppercase
            ('A', '\u{0391}', Script::Greek), ('B', '\u{0392}', Script::Greek),
            ('E', '\u{0395}', Script::Greek), ('H', '\u{0397}', Script::Greek),
            ('I', '\u{0399}', Script::Greek), ('K', '\u{039A}', Script::Greek),
            ('M', '\u{039C}', Script::Greek), ('N', '\u{039D}', Script::Greek),
            ('O', '\u{039F}', Script::Greek), ('P', '\u{03A1}', Script::Greek),
            ('T', '\u{03A4}', Script::Greek), ('X', '\u{03A7}', Script::Greek),
            ('Y', '\u{03A5}', Script::Greek), ('Z', '\u{0396}', Script::Greek),
            // Armenian
            ('g', '\u{0581}', Script::Armenian), ('h', '\u{0570}', Script::Armenian),
            ('n', '\u{0578}', Script::Armenian), ('o', '\u{0585}', Script::Armenian),
            ('u', '\u{057D}', Script::Armenian),
        ];

        for &(latin, lookalike, script) in &scripted {
            entries
                .entry(latin)
                .or_default()
                .push(Confusable { ch: lookalike, script });
        }

        // Mathematical alphanumeric blocks have no holes for bold and monospace.
        let math_blocks = [
            ('a', 0x1D41A, Script::MathBold),
            ('A', 0x1D400, Script::MathBold),
            ('a', 0x1D68A, Script::MathMonospace),
            ('A', 0x1D670, Script::MathMonospace),
        ];

        for &(first, base, script) in &math_blocks {
            for offset in 0..26u32 {
                let latin = char::from_u32(first as u32 + offset);
                let lookalike = char::from_u32(base + offset);
                if let (Some(latin), Some(lookalike)) = (latin, lookalike) {
                    entries
                        .entry(latin)
                        .or_default()
                        .push(Confusable { ch: lookalike, script });
                }
            }
        }

        ConfusableTable {
            version: TABLE_VERSION,
            entries,
        }
    }
}
