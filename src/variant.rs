use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::confusables::{Confusable, ConfusableTable, Script};

pub const ZERO_WIDTH_CHARS: [(char, &str); 3] = [
    ('\u{200B}', "zwsp"),
    ('\u{200C}', "zwnj"),
    ('\u{200D}', "zwj"),
];

const MIXED_HOMOGRAPH_SAMPLE: usize = 3;
const MIXED_ZERO_WIDTH_SAMPLE: usize = 3;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    Homograph,
    ZeroWidth,
    Punycode,
    Mixed,
}

impl Technique {
    pub const ALL: [Technique; 4] = [
        Technique::Homograph,
        Technique::ZeroWidth,
        Technique::Punycode,
        Technique::Mixed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Technique::Homograph => "homograph",
            Technique::ZeroWidth => "zero_width",
            Technique::Punycode => "punycode",
            Technique::Mixed => "mixed",
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Technique {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "homograph" => Ok(Technique::Homograph),
            "zero_width" | "zerowidth" => Ok(Technique::ZeroWidth),
            "punycode" => Ok(Technique::Punycode),
            "mixed" => Ok(Technique::Mixed),
            other => Err(format!("unknown technique: {other}")),
        }
    }
}

/// One codepoint edit, indexed by char position in the original email.
/// Insertions carry no `original`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodepointChange {
    pub index: usize,
    pub original: Option<char>,
    pub replacement: char,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub original: String,
    pub transformed: String,
    pub technique: Technique,
    pub subtechnique: String,
    pub codepoints_changed: Vec<CodepointChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VariantStats {
    pub total: usize,
    pub by_technique: BTreeMap<Technique, usize>,
    pub unique_codepoints: usize,
}

impl VariantStats {
    pub fn from_variants(variants: &[Variant]) -> Self {
        let mut by_technique = BTreeMap::new();
        let mut codepoints = HashSet::new();

        for variant in variants {
            *by_technique.entry(variant.technique).or_insert(0) += 1;
            codepoints.extend(variant.codepoints_changed.iter().map(|c| c.replacement));
        }

        VariantStats {
            total: variants.len(),
            by_technique,
            unique_codepoints: codepoints.len(),
        }
    }
}

pub fn strip_zero_width(s: &str) -> String {
    s.chars()
        .filter(|c| !ZERO_WIDTH_CHARS.iter().any(|(zw, _)| zw == c))
        .collect()
}

/// IDNA-decodes a domain; `None` when any label is invalid.
pub fn decode_punycode_domain(domain: &str) -> Option<String> {
    match idna::domain_to_unicode(domain) {
        (decoded, Ok(())) => Some(decoded),
        (_, Err(_)) => None,
    }
}

pub struct VariantGenerator {
    rng: StdRng,
    table: &'static ConfusableTable,
}

impl Default for VariantGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl VariantGenerator {
    pub fn new() -> Self {
        VariantGenerator {
            rng: StdRng::from_entropy(),
            table: ConfusableTable::global(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        VariantGenerator {
            rng: StdRng::seed_from_u64(seed),
            table: ConfusableTable::global(),
        }
    }

    /// Produces up to `max_variants` distinct variants, interleaving the
    /// requested techniques so a small budget still covers each of them.
    /// Returns fewer when the substitution space runs out.
    pub fn generate(
        &mut self,
        email: &str,
        max_variants: usize,
        techniques: &[Technique],
    ) -> Vec<Variant> {
        let mut variants = Vec::new();

        let Some((local, domain)) = email.split_once('@') else {
            warn!(email, "invalid email format, no variants generated");
            return variants;
        };
        if local.is_empty() || domain.is_empty() || max_variants == 0 {
            return variants;
        }

        info!(email, max_variants, table_version = self.table.version(), "generating variants");

        let mut pools: Vec<VecDeque<Variant>> = Vec::new();
        for technique in Technique::ALL {
            if !techniques.contains(&technique) {
                continue;
            }
            let candidates = match technique {
                Technique::Homograph => self.homograph_variants(local, domain, max_variants),
                Technique::ZeroWidth => self.zero_width_variants(local, domain, max_variants),
                Technique::Punycode => self.punycode_variants(local, domain, max_variants),
                Technique::Mixed => self.mixed_variants(local, domain, max_variants),
            };
            debug!(%technique, candidates = candidates.len(), "technique candidates");
            pools.push(candidates.into());
        }

        let mut seen = HashSet::new();
        seen.insert(email.to_string());

        loop {
            let mut progressed = false;
            for pool in pools.iter_mut() {
                if variants.len() >= max_variants {
                    break;
                }
                while let Some(variant) = pool.pop_front() {
                    if seen.insert(variant.transformed.clone()) {
                        variants.push(variant);
                        progressed = true;
                        break;
                    }
                }
            }
            if !progressed || variants.len() >= max_variants {
                break;
            }
        }

        info!(total = variants.len(), "variant generation complete");
        variants
    }

    fn homograph_variants(&self, local: &str, domain: &str, cap: usize) -> Vec<Variant> {
        let mut variants = Vec::new();
        let original = format!("{}@{}", local, domain);
        let chars: Vec<char> = original.chars().collect();

        let positions: Vec<usize> = chars
            .iter()
            .enumerate()
            .filter(|(_, &ch)| self.table.primary(ch).is_some())
            .map(|(i, _)| i)
            .collect();

        // Single substitutions, every look-alike of every position
        for &i in &positions {
            for confusable in self.table.lookup(chars[i]) {
                if variants.len() >= cap {
                    return variants;
                }
                let mut new_chars = chars.clone();
                new_chars[i] = confusable.ch;
                variants.push(Variant {
                    original: original.clone(),
                    transformed: new_chars.into_iter().collect(),
                    technique: Technique::Homograph,
                    subtechnique: confusable.script.as_str().to_string(),
                    codepoints_changed: vec![CodepointChange {
                        index: i,
                        original: Some(chars[i]),
                        replacement: confusable.ch,
                    }],
                });
            }
        }

        // Multi-position combinations with each position's primary look-alike
        for k in 2..=positions.len() {
            let mut combo: Vec<usize> = (0..k).collect();
            loop {
                if variants.len() >= cap {
                    return variants;
                }
                let mut new_chars = chars.clone();
                let mut changes = Vec::with_capacity(k);
                for &slot in &combo {
                    let i = positions[slot];
                    if let Some(confusable) = self.table.primary(chars[i]) {
                        new_chars[i] = confusable.ch;
                        changes.push(CodepointChange {
                            index: i,
                            original: Some(chars[i]),
                            replacement: confusable.ch,
                        });
                    }
                }
                variants.push(Variant {
                    original: original.clone(),
                    transformed: new_chars.into_iter().collect(),
                    technique: Technique::Homograph,
                    subtechnique: format!("{}-position", k),
                    codepoints_changed: changes,
                });
                if !next_combination(&mut combo, positions.len()) {
                    break;
                }
            }
        }

        variants
    }

    fn zero_width_variants(&self, local: &str, domain: &str, cap: usize) -> Vec<Variant> {
        let mut variants = Vec::new();
        let original = format!("{}@{}", local, domain);
        let local_chars: Vec<char> = local.chars().collect();

        // Boundary local_chars.len() is the one right before '@'
        for boundary in 0..=local_chars.len() {
            for &(zw, name) in &ZERO_WIDTH_CHARS {
                if variants.len() >= cap {
                    return variants;
                }
                let mut new_local: String = local_chars[..boundary].iter().collect();
                new_local.push(zw);
                new_local.extend(&local_chars[boundary..]);

                variants.push(Variant {
                    original: original.clone(),
                    transformed: format!("{}@{}", new_local, domain),
                    technique: Technique::ZeroWidth,
                    subtechnique: name.to_string(),
                    codepoints_changed: vec![CodepointChange {
                        index: boundary,
                        original: None,
                        replacement: zw,
                    }],
                });
            }
        }

        variants
    }

    fn punycode_variants(&self, local: &str, domain: &str, cap: usize) -> Vec<Variant> {
        let mut variants = Vec::new();
        let original = format!("{}@{}", local, domain);

        // IDNA maps upper case away, so substitute into the canonical form
        let domain = domain.to_lowercase();
        let Some((label, rest)) = domain.split_once('.') else {
            return variants;
        };
        if label.is_empty() || rest.is_empty() {
            return variants;
        }

        let label_chars: Vec<char> = label.chars().collect();
        let label_offset = local.chars().count() + 1;

        for (i, &ch) in label_chars.iter().enumerate() {
            for confusable in self.table.lookup(ch) {
                if variants.len() >= cap {
                    return variants;
                }
                if !is_idna_valid(confusable) {
                    continue;
                }
                let mut new_label = label_chars.clone();
                new_label[i] = confusable.ch;
                let unicode_domain = format!("{}.{}", new_label.into_iter().collect::<String>(), rest);

                let Some(ace_domain) = encode_domain(&unicode_domain) else {
                    debug!(domain = %unicode_domain, "IDNA encoding rejected");
                    continue;
                };

                variants.push(Variant {
                    original: original.clone(),
                    transformed: format!("{}@{}", local, ace_domain),
                    technique: Technique::Punycode,
                    subtechnique: format!("idna-{}", confusable.script.as_str()),
                    codepoints_changed: vec![CodepointChange {
                        index: label_offset + i,
                        original: Some(ch),
                        replacement: confusable.ch,
                    }],
                });
            }
        }

        variants
    }

    fn mixed_variants(&mut self, local: &str, domain: &str, cap: usize) -> Vec<Variant> {
        let mut variants = Vec::new();
        let original = format!("{}@{}", local, domain);
        let local_chars: Vec<char> = local.chars().collect();
        let domain_chars: Vec<char> = domain.chars().collect();
        let domain_offset = local_chars.len() + 1;
        let table = self.table;

        let homographs: Vec<(usize, Confusable)> = local_chars
            .iter()
            .enumerate()
            .flat_map(|(i, &ch)| table.lookup(ch).iter().map(move |c| (i, *c)))
            .collect();
        let insertions: Vec<(usize, char, &str)> = (1..domain_chars.len())
            .flat_map(|boundary| ZERO_WIDTH_CHARS.iter().map(move |&(zw, name)| (boundary, zw, name)))
            .collect();

        let homograph_sample: Vec<(usize, Confusable)> = homographs
            .choose_multiple(&mut self.rng, MIXED_HOMOGRAPH_SAMPLE)
            .copied()
            .collect();
        let insertion_sample: Vec<(usize, char, &str)> = insertions
            .choose_multiple(&mut self.rng, MIXED_ZERO_WIDTH_SAMPLE)
            .copied()
            .collect();

        for &(i, confusable) in &homograph_sample {
            for &(boundary, zw, name) in &insertion_sample {
                if variants.len() >= cap {
                    return variants;
                }
                let mut new_local = local_chars.clone();
                new_local[i] = confusable.ch;
                let new_local: String = new_local.into_iter().collect();

                let mut new_domain: String = domain_chars[..boundary].iter().collect();
                new_domain.push(zw);
                new_domain.extend(&domain_chars[boundary..]);

                variants.push(Variant {
                    original: original.clone(),
                    transformed: format!("{}@{}", new_local, new_domain),
                    technique: Technique::Mixed,
                    subtechnique: format!("{}+{}", confusable.script.as_str(), name),
                    codepoints_changed: vec![
                        CodepointChange {
                            index: i,
                            original: Some(local_chars[i]),
                            replacement: confusable.ch,
                        },
                        CodepointChange {
                            index: domain_offset + boundary,
                            original: None,
                            replacement: zw,
                        },
                    ],
                });
            }
        }

        variants
    }
}

// Math alphanumerics and capitals are mapped by UTS 46, so they never
// survive in an A-label.
fn is_idna_valid(confusable: &Confusable) -> bool {
    matches!(
        confusable.script,
        Script::Cyrillic | Script::Greek | Script::Armenian
    ) && !confusable.ch.is_uppercase()
}

fn encode_domain(unicode_domain: &str) -> Option<String> {
    let ascii = idna::domain_to_ascii(unicode_domain).ok()?;
    // Only keep domains that decode back to exactly what was substituted
    match decode_punycode_domain(&ascii) {
        Some(decoded) if decoded == unicode_domain && ascii.starts_with("xn--") => Some(ascii),
        _ => None,
    }
}

// Advances `combo` to the next k-subset of 0..n in lexicographic order.
fn next_combination(combo: &mut [usize], n: usize) -> bool {
    let k = combo.len();
    let mut i = k;
    while i > 0 {
        i -= 1;
        if combo[i] < n - k + i {
            combo[i] += 1;
            for j in i + 1..k {
                combo[j] = combo[j - 1] + 1;
            }
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_ok, assert_some_eq};
    use proptest::prelude::*;

    const EMAIL: &str = "admin@example.com";

    fn generate(max: usize, techniques: &[Technique]) -> Vec<Variant> {
        VariantGenerator::with_seed(7).generate(EMAIL, max, techniques)
    }

    #[test]
    fn first_homograph_replaces_leading_a_with_cyrillic() {
        let variants = generate(1, &[Technique::Homograph]);
        assert_eq!(variants.len(), 1);

        let variant = &variants[0];
        assert_eq!(variant.transformed, "\u{0430}dmin@example.com");
        let first = variant.transformed.chars().next().map(|c| c as u32);
        assert_some_eq!(first, 0x0430);
        assert_ne!(first, Some(0x61));
        assert_eq!(variant.transformed.chars().count(), EMAIL.chars().count());
        assert_eq!(
            variant.codepoints_changed,
            vec![CodepointChange { index: 0, original: Some('a'), replacement: '\u{0430}' }]
        );
    }

    #[test]
    fn homograph_singles_come_before_combinations() {
        let variants = generate(500, &[Technique::Homograph]);
        let first_combo = variants
            .iter()
            .position(|v| v.codepoints_changed.len() > 1)
            .expect("combinations present");
        assert!(variants[..first_combo].iter().all(|v| v.codepoints_changed.len() == 1));
        assert!(variants[first_combo..].iter().all(|v| v.codepoints_changed.len() > 1));
    }

    #[test]
    fn homograph_never_substitutes_separators() {
        for variant in generate(300, &[Technique::Homograph]) {
            assert_eq!(variant.transformed.matches('@').count(), 1);
            assert_eq!(variant.transformed.matches('.').count(), 1);
            let mut indices: Vec<usize> =
                variant.codepoints_changed.iter().map(|c| c.index).collect();
            indices.dedup();
            assert_eq!(indices.len(), variant.codepoints_changed.len());
        }
    }

    #[test]
    fn zero_width_covers_every_local_boundary() {
        let variants = generate(100, &[Technique::ZeroWidth]);
        // "admin" has 6 boundaries, three invisible characters each
        assert_eq!(variants.len(), 18);
        assert!(variants.iter().any(|v| v.transformed == "admin\u{200B}@example.com"));
        assert!(variants.iter().any(|v| v.transformed == "\u{200D}admin@example.com"));
    }

    #[test]
    fn punycode_domain_decodes_to_substituted_label() {
        let variants = generate(10, &[Technique::Punycode]);
        assert!(!variants.is_empty());
        for variant in &variants {
            let (_, domain) = variant.transformed.split_once('@').unwrap();
            assert!(domain.starts_with("xn--"));
            assert!(domain.is_ascii());

            let change = &variant.codepoints_changed[0];
            let mut expected: Vec<char> = "example.com".chars().collect();
            expected[change.index - "admin@".len()] = change.replacement;
            let expected: String = expected.into_iter().collect();

            let (decoded, result) = idna::domain_to_unicode(domain);
            assert_ok!(result);
            assert_eq!(decoded, expected);
            assert_ne!(expected, "example.com");
        }
    }

    #[test]
    fn punycode_only_uses_scripts_idna_keeps() {
        let variants = generate(200, &[Technique::Punycode]);
        assert!(!variants.is_empty());
        for variant in &variants {
            assert!(
                matches!(
                    variant.subtechnique.as_str(),
                    "idna-cyrillic" | "idna-greek" | "idna-armenian"
                ),
                "unexpected {}",
                variant.subtechnique
            );
            let (_, domain) = variant.transformed.split_once('@').unwrap();
            assert_ok!(idna::domain_to_unicode(domain).1);
        }
    }

    #[test]
    fn punycode_lowercases_the_domain_before_substituting() {
        let variants =
            VariantGenerator::with_seed(7).generate("admin@Example.COM", 200, &[Technique::Punycode]);
        assert!(!variants.is_empty());
        for variant in &variants {
            assert_eq!(variant.original, "admin@Example.COM");
            let (local, domain) = variant.transformed.split_once('@').unwrap();
            assert_eq!(local, "admin");
            assert!(domain.starts_with("xn--"));
            assert!(domain.ends_with(".com"));
            assert!(!domain.bytes().any(|b| b.is_ascii_uppercase()));

            let change = &variant.codepoints_changed[0];
            let mut expected: Vec<char> = "example.com".chars().collect();
            expected[change.index - "admin@".len()] = change.replacement;
            let expected: String = expected.into_iter().collect();

            let (decoded, result) = idna::domain_to_unicode(domain);
            assert_ok!(result);
            assert_eq!(decoded, expected);
        }
    }

    #[test]
    fn mixed_variants_are_bounded_and_touch_both_halves() {
        let variants = generate(100, &[Technique::Mixed]);
        assert!(!variants.is_empty());
        assert!(variants.len() <= MIXED_HOMOGRAPH_SAMPLE * MIXED_ZERO_WIDTH_SAMPLE);
        for variant in &variants {
            let (local, domain) = variant.transformed.split_once('@').unwrap();
            assert!(!local.is_ascii());
            assert_ne!(strip_zero_width(domain), domain);
            assert_eq!(strip_zero_width(domain), "example.com");
        }
    }

    #[test]
    fn small_budget_is_spread_across_all_techniques() {
        let variants = generate(4, &Technique::ALL);
        assert_eq!(variants.len(), 4);

        let techniques: HashSet<Technique> = variants.iter().map(|v| v.technique).collect();
        assert_eq!(techniques.len(), 4);

        let unique: HashSet<&str> = variants.iter().map(|v| v.transformed.as_str()).collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn same_seed_gives_same_variants() {
        let first = VariantGenerator::with_seed(42).generate(EMAIL, 50, &Technique::ALL);
        let second = VariantGenerator::with_seed(42).generate(EMAIL, 50, &Technique::ALL);
        assert_eq!(first, second);
    }

    #[test]
    fn exhaustion_returns_fewer_without_error() {
        let variants = VariantGenerator::with_seed(1).generate("a@b.c", 10_000, &[Technique::ZeroWidth]);
        assert_eq!(variants.len(), 6);
    }

    #[test]
    fn malformed_email_yields_nothing() {
        assert!(generate_for("not-an-email").is_empty());
        assert!(generate_for("@example.com").is_empty());
        assert!(generate_for("admin@").is_empty());
    }

    fn generate_for(email: &str) -> Vec<Variant> {
        VariantGenerator::with_seed(3).generate(email, 20, &Technique::ALL)
    }

    #[test]
    fn stats_count_techniques_and_codepoints() {
        let variants = generate(4, &Technique::ALL);
        let stats = VariantStats::from_variants(&variants);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_technique.values().sum::<usize>(), 4);
        assert!(stats.unique_codepoints >= 3);
    }

    #[test]
    fn technique_parses_from_cli_spelling() {
        assert_eq!("zero-width".parse::<Technique>(), Ok(Technique::ZeroWidth));
        assert_eq!("Punycode".parse::<Technique>(), Ok(Technique::Punycode));
        assert!("bitsquat".parse::<Technique>().is_err());
    }

    #[test]
    fn next_combination_walks_all_pairs() {
        let mut combo = vec![0, 1];
        let mut seen = vec![combo.clone()];
        while next_combination(&mut combo, 4) {
            seen.push(combo.clone());
        }
        assert_eq!(seen, vec![vec![0, 1], vec![0, 2], vec![0, 3], vec![1, 2], vec![1, 3], vec![2, 3]]);
    }

    proptest! {
        #[test]
        fn generated_variants_respect_budget_and_uniqueness(
            local in "[a-z]{1,8}",
            label in "[a-z]{2,8}",
            max in 1usize..60,
            seed in any::<u64>(),
        ) {
            let email = format!("{}@{}.com", local, label);
            let variants = VariantGenerator::with_seed(seed).generate(&email, max, &Technique::ALL);

            prop_assert!(variants.len() <= max);
            let unique: HashSet<&str> = variants.iter().map(|v| v.transformed.as_str()).collect();
            prop_assert_eq!(unique.len(), variants.len());
            for variant in &variants {
                prop_assert_ne!(&variant.transformed, &email);
                prop_assert_eq!(&variant.original, &email);
            }
        }

        #[test]
        fn stripping_zero_width_restores_original(
            local in "[a-zA-Z0-9._]{1,10}",
            label in "[a-z]{2,8}",
        ) {
            let email = format!("{}@{}.org", local, label);
            let variants = VariantGenerator::with_seed(0).generate(&email, 200, &[Technique::ZeroWidth]);
            prop_assert!(!variants.is_empty());
            for variant in &variants {
                prop_assert_eq!(strip_zero_width(&variant.transformed), email.clone());
            }
        }

        #[test]
        fn punycode_labels_round_trip_to_substituted_form(label in "[a-z]{2,10}") {
            let email = format!("user@{}.net", label);
            let variants = VariantGenerator::with_seed(0).generate(&email, 50, &[Technique::Punycode]);
            for variant in &variants {
                let (_, domain) = variant.transformed.split_once('@').unwrap();
                let (decoded, result) = idna::domain_to_unicode(domain);
                prop_assert!(result.is_ok());
                prop_assert!(decoded.ends_with(".net"));
                prop_assert_ne!(decoded.clone(), format!("{}.net", label));
                prop_assert_eq!(decoded.chars().count(), label.chars().count() + 4);
            }
        }
    }
}
