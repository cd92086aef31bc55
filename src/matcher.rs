//! Decides whether two venue names denote the same place.
//!
//! Heuristics run cheapest first and any one of them is enough. `Loose`
//! adds chain-alias and global edit-ratio acceptance and is only used when
//! re-verifying earlier rejects.

use once_cell::sync::Lazy;
use serde::Serialize;
use strsim::levenshtein;

use crate::normalize::{char_len, core_name, fold_width, han_only, latin_tokens, normalize};

const MIN_OVERLAP_CHARS: usize = 2;
const MIN_TOKEN_CONTAINMENT_CHARS: usize = 4;
const CORE_DISTANCE_LIMIT: usize = 2;
const LOOSE_RATIO_LIMIT: f64 = 0.45;

/// Spellings of well-known chains across scripts. Edit distance cannot
/// bridge Hangul and Kanji, so loose mode treats these as one name.
const CHAIN_ALIASES: &[&[&str]] = &[
    &["一蘭", "ichiran", "이치란"],
    &["一風堂", "ippudo", "잇푸도"],
    &["丸亀製麺", "marugame", "마루가메"],
    &["スターバックス", "starbucks", "스타벅스"],
    &["ドン・キホーテ", "donquijote", "돈키호테"],
    &["無印良品", "muji", "무인양품"],
    &["ユニクロ", "uniqlo", "유니클로"],
    &["くら寿司", "kurasushi", "쿠라스시"],
    &["スシロー", "sushiro", "스시로"],
];

static CHAINS: Lazy<Vec<Vec<String>>> = Lazy::new(|| {
    CHAIN_ALIASES
        .iter()
        .map(|aliases| {
            aliases
                .iter()
                .map(|alias| normalize(alias))
                .filter(|alias| char_len(alias) >= MIN_OVERLAP_CHARS)
                .collect()
        })
        .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Strict,
    Loose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    Exact,
    Containment,
    Prefix,
    CoreName,
    EditDistance,
    BrandToken,
    Ideographic,
    ChainAlias,
    LooseRatio,
}

pub fn is_match(a: &str, b: &str, mode: MatchMode) -> bool {
    match_rule(a, b, mode).is_some()
}

/// The first heuristic that accepts the pair, if any.
pub fn match_rule(a: &str, b: &str, mode: MatchMode) -> Option<MatchRule> {
    let pair = NamePair::new(a, b);

    if pair.exact() {
        return Some(MatchRule::Exact);
    }
    if pair.normalized_empty() {
        return None;
    }
    if pair.containment() {
        return Some(MatchRule::Containment);
    }
    if pair.prefix() {
        return Some(MatchRule::Prefix);
    }
    if pair.core_containment() {
        return Some(MatchRule::CoreName);
    }
    if pair.edit_distance() {
        return Some(MatchRule::EditDistance);
    }
    if pair.brand_token(a, b) {
        return Some(MatchRule::BrandToken);
    }
    if pair.ideographic() {
        return Some(MatchRule::Ideographic);
    }
    if mode == MatchMode::Strict {
        return None;
    }
    if pair.same_chain() {
        return Some(MatchRule::ChainAlias);
    }
    if pair.loose_ratio() <= LOOSE_RATIO_LIMIT {
        return Some(MatchRule::LooseRatio);
    }
    None
}

/// Normalized edit distance in `[0, 1]`, the lower of full and core forms.
pub fn edit_ratio(a: &str, b: &str) -> f64 {
    NamePair::new(a, b).loose_ratio()
}

struct NamePair {
    raw_a: String,
    raw_b: String,
    a: String,
    b: String,
    core_a: String,
    core_b: String,
}

impl NamePair {
    fn new(a: &str, b: &str) -> Self {
        Self {
            raw_a: fold_width(a).trim().to_string(),
            raw_b: fold_width(b).trim().to_string(),
            a: normalize(a),
            b: normalize(b),
            core_a: core_name(a),
            core_b: core_name(b),
        }
    }

    fn normalized_empty(&self) -> bool {
        self.a.is_empty() || self.b.is_empty()
    }

    fn exact(&self) -> bool {
        if self.normalized_empty() {
            // names that normalize away entirely only match themselves verbatim
            return self.a.is_empty()
                && self.b.is_empty()
                && !self.raw_a.is_empty()
                && self.raw_a == self.raw_b;
        }
        self.a == self.b
    }

    fn shorter_len(&self) -> usize {
        char_len(&self.a).min(char_len(&self.b))
    }

    fn containment(&self) -> bool {
        self.shorter_len() >= MIN_OVERLAP_CHARS
            && (self.a.contains(self.b.as_str()) || self.b.contains(self.a.as_str()))
    }

    fn prefix(&self) -> bool {
        self.shorter_len() >= MIN_OVERLAP_CHARS
            && (self.a.starts_with(self.b.as_str()) || self.b.starts_with(self.a.as_str()))
    }

    fn core_containment(&self) -> bool {
        let core_a_len = char_len(&self.core_a);
        let core_b_len = char_len(&self.core_b);
        let cross = core_a_len.min(core_b_len) >= MIN_OVERLAP_CHARS
            && (self.core_a.contains(self.core_b.as_str())
                || self.core_b.contains(self.core_a.as_str()));
        let a_in_b = core_a_len >= MIN_OVERLAP_CHARS && self.b.contains(self.core_a.as_str());
        let b_in_a = core_b_len >= MIN_OVERLAP_CHARS && self.a.contains(self.core_b.as_str());
        cross || a_in_b || b_in_a
    }

    fn edit_distance(&self) -> bool {
        let shorter = self.shorter_len();
        let limit = 2.max(shorter / 4);
        if within(levenshtein(&self.a, &self.b), limit, shorter) {
            return true;
        }
        let core_shorter = char_len(&self.core_a).min(char_len(&self.core_b));
        within(
            levenshtein(&self.core_a, &self.core_b),
            CORE_DISTANCE_LIMIT,
            core_shorter,
        )
    }

    fn brand_token(&self, a: &str, b: &str) -> bool {
        let tokens_a = latin_tokens(a);
        let tokens_b = latin_tokens(b);
        tokens_a.iter().any(|left| {
            tokens_b.iter().any(|right| {
                left == right
                    || (char_len(left).min(char_len(right)) >= MIN_TOKEN_CONTAINMENT_CHARS
                        && (left.contains(right.as_str()) || right.contains(left.as_str())))
            })
        })
    }

    fn ideographic(&self) -> bool {
        let han_a = han_only(&self.core_a);
        let han_b = han_only(&self.core_b);
        let shorter = char_len(&han_a).min(char_len(&han_b));
        if shorter < MIN_OVERLAP_CHARS {
            return false;
        }
        if han_a.contains(han_b.as_str()) || han_b.contains(han_a.as_str()) {
            return true;
        }
        let limit = 1.max((shorter as f64 * 0.3).floor() as usize);
        within(levenshtein(&han_a, &han_b), limit, shorter)
    }

    fn same_chain(&self) -> bool {
        CHAINS.iter().any(|aliases| {
            let named = |name: &str| aliases.iter().any(|alias| name.contains(alias.as_str()));
            named(&self.a) && named(&self.b)
        })
    }

    fn loose_ratio(&self) -> f64 {
        ratio(&self.a, &self.b).min(ratio(&self.core_a, &self.core_b))
    }
}

/// Distance at or under the limit, and strictly under the shorter length so
/// two fully disjoint short names never pass.
fn within(distance: usize, limit: usize, shorter: usize) -> bool {
    shorter > 0 && distance <= limit && distance < shorter
}

fn ratio(a: &str, b: &str) -> f64 {
    let longest = char_len(a).max(char_len(b));
    if a.is_empty() || b.is_empty() || longest == 0 {
        return 1.0;
    }
    levenshtein(a, b) as f64 / longest as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: &[&str] = &[
        "紅蘭亭",
        "紅蘭亭 下通本店",
        "B-speak",
        "B-speak 由布院本店",
        "모츠나베 맛집",
        "〒810-0001 福岡県福岡市中央区天神2丁目",
        "一蘭 天神西通り店",
        "이치란",
        "Marugame",
        "Malgami",
        "ホテル日航福岡",
        "Cafe La Ruche",
        "〒810-0001",
        "ab",
        "cd",
        "スターバックス",
        "Starbucks Coffee",
    ];

    #[test]
    fn every_name_matches_itself() {
        for name in NAMES {
            assert!(is_match(name, name, MatchMode::Strict), "not reflexive: {name}");
        }
    }

    #[test]
    fn matching_is_symmetric() {
        for a in NAMES {
            for b in NAMES {
                for mode in [MatchMode::Strict, MatchMode::Loose] {
                    assert_eq!(
                        is_match(a, b, mode),
                        is_match(b, a, mode),
                        "asymmetric for {a} / {b} in {mode:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn loose_accepts_everything_strict_does() {
        for a in NAMES {
            for b in NAMES {
                if is_match(a, b, MatchMode::Strict) {
                    assert!(is_match(a, b, MatchMode::Loose), "{a} / {b}");
                }
            }
        }
    }

    #[test]
    fn branch_suffix_does_not_block_a_match() {
        assert!(is_match("紅蘭亭", "紅蘭亭 下通本店", MatchMode::Strict));
    }

    #[test]
    fn brand_token_survives_native_suffix() {
        assert!(is_match("B-speak", "B-speak 由布院本店", MatchMode::Strict));
        assert!(is_match("ビースピーク B-speak", "b speak", MatchMode::Strict));
    }

    #[test]
    fn address_returned_as_name_is_not_a_match() {
        let address = "〒810-0001 福岡県福岡市中央区天神2丁目";
        assert!(!is_match("모츠나베 맛집", address, MatchMode::Strict));
        assert!(!is_match("모츠나베 맛집", address, MatchMode::Loose));
        assert!(!is_match("〒810-0001", "〒810-0002", MatchMode::Strict));
    }

    #[test]
    fn short_disjoint_names_do_not_match() {
        assert!(!is_match("ab", "cd", MatchMode::Strict));
        assert!(!is_match("Cafe La Ruche", "Malgami", MatchMode::Loose));
    }

    #[test]
    fn loose_mode_recovers_transliteration_variance() {
        assert!(!is_match("Marugame", "Malgami", MatchMode::Strict));
        assert!(edit_ratio("Marugame", "Malgami") <= LOOSE_RATIO_LIMIT);
        assert_eq!(
            match_rule("Marugame", "Malgami", MatchMode::Loose),
            Some(MatchRule::LooseRatio)
        );
    }

    #[test]
    fn loose_mode_bridges_hangul_and_kanji_chain_names() {
        let observed = "一蘭 天神西通り店";
        assert!(!is_match("이치란", observed, MatchMode::Strict));
        assert_eq!(
            match_rule("이치란", observed, MatchMode::Loose),
            Some(MatchRule::ChainAlias)
        );
        assert_eq!(
            match_rule("スターバックス", "Starbucks Coffee 天神店", MatchMode::Loose),
            Some(MatchRule::ChainAlias)
        );
        // different chains stay apart
        assert!(!is_match("쿠라스시", "Sushiro", MatchMode::Loose));
    }

    #[test]
    fn ideographic_core_overlap_matches() {
        assert_eq!(
            match_rule("一蘭本店", "一蘭 天神西通り店", MatchMode::Strict),
            Some(MatchRule::CoreName)
        );
        assert_eq!(
            match_rule("一蘭ICHIRAN", "一蘭いちらん", MatchMode::Strict),
            Some(MatchRule::Ideographic)
        );
    }
}
