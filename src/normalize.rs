//! Canonical forms of venue names for comparison.
//!
//! `normalize` folds width variants, drops parentheticals, address fragments
//! and separator punctuation, and folds katakana to hiragana. `core_name`
//! additionally strips category prefixes and branch/venue-type suffixes.
//! Both run their passes to a fixpoint, so applying either twice is the same
//! as applying it once.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

const MAX_PASSES: usize = 8;
const CORE_NAME_MAX_CHARS: usize = 10;
const MIN_CORE_CHARS: usize = 2;
const MIN_TOKEN_CHARS: usize = 3;

static PARENTHETICAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[(\[【「『〔][^()\[\]【】「」『』〔〕]*[)\]】」』〕]")
        .expect("parenthetical pattern")
});

static ADDRESS_FRAGMENTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // postal codes, with or without the postal mark
        r"〒\s*\d{3}\s*[\-‐‑‒–—―−ー]?\s*\d{4}",
        r"\d{3}\s*[\-‐‑‒–—―−]\s*\d{4}",
        // chome / banchi / go block numbers
        r"\d+\s*丁目",
        r"\d+\s*番地?",
        r"\d+\s*号",
        r"\d+(?:\s*[\-‐‑‒–—―−ー]\s*\d+){1,3}",
        // prefecture level
        r"東京都|北海道|京都府|大阪府|\p{Han}{2,3}県",
        r"^日本国?[、,]?",
        r"〒",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("address pattern"))
    .collect()
});

static ADDRESS_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"〒|\d+\s*丁目|\d+\s*番地",
        r"|\d+(?:\s*[\-‐‑‒–—―−]\s*\d+){2}",
        r"|[都道府県][^\s]{1,6}[市区町村]",
    ))
    .expect("address shape pattern")
});

const CATEGORY_PREFIXES: &[&str] = &[
    "レストラン", "restaurant", "カフェ", "cafe", "喫茶", "居酒屋", "izakaya", "ホテル", "hotel",
    "旅館", "ryokan", "食堂", "焼肉", "寿司", "鮨", "ラーメン", "中華そば", "레스토랑", "카페",
    "호텔", "이자카야", "료칸", "식당",
];

const VENUE_SUFFIXES: &[&str] = &[
    "本店", "支店", "店", "本館", "別館", "ビル", "building", "museum", "美術館", "博物館",
    "記念館", "神社", "寺", "温泉", "旅館", "ホテル", "hotel", "honten", "branch", "store",
    "본점", "지점", "점", "박물관", "미술관", "신사", "호텔", "빌딩",
];

const GENERIC_TOKENS: &[&str] = &[
    "the", "and", "cafe", "coffee", "tea", "hotel", "inn", "restaurant", "bar", "ramen",
    "sushi", "izakaya", "shop", "store", "honten", "branch", "japan", "kitchen", "dining",
    "house",
];

static NORMALIZED_PREFIXES: Lazy<Vec<String>> =
    Lazy::new(|| normalized_vocabulary(CATEGORY_PREFIXES));
static NORMALIZED_SUFFIXES: Lazy<Vec<String>> = Lazy::new(|| normalized_vocabulary(VENUE_SUFFIXES));

/// Canonical comparison form of a display name.
pub fn normalize(raw: &str) -> String {
    fixpoint(raw.to_string(), normalize_pass)
}

/// `normalize` plus category prefix / branch suffix stripping, length-capped.
pub fn core_name(raw: &str) -> String {
    fixpoint(raw.to_string(), |current| {
        let stripped = strip_affixes(&normalize(current));
        stripped.chars().take(CORE_NAME_MAX_CHARS).collect()
    })
}

/// Latin/digit tokens of at least three characters with internal `-`, `_`
/// and `.` removed. Generic venue words and pure numbers are skipped.
pub fn latin_tokens(raw: &str) -> Vec<String> {
    let folded = fold_width(raw);
    let mut tokens: Vec<String> = folded
        .split(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .map(|token| token.chars().filter(char::is_ascii_alphanumeric).collect::<String>())
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit()))
        .filter(|token| !GENERIC_TOKENS.contains(&token.as_str()))
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

/// Ideographic characters of `value`, in order.
pub fn han_only(value: &str) -> String {
    value.chars().filter(|c| is_han(*c)).collect()
}

/// True when the text reads like a postal address rather than a venue name.
pub fn looks_like_address(raw: &str) -> bool {
    ADDRESS_SHAPE.is_match(&fold_width(raw))
}

pub fn char_len(value: &str) -> usize {
    value.chars().count()
}

/// Width folding plus lowercasing, without any stripping.
pub fn fold_width(raw: &str) -> String {
    raw.nfkc().collect::<String>().to_lowercase()
}

fn normalize_pass(raw: &str) -> String {
    let mut text = fold_width(raw);
    text = fixpoint(text, |current| PARENTHETICAL.replace_all(current, "").into_owned());
    for pattern in ADDRESS_FRAGMENTS.iter() {
        text = pattern.replace_all(&text, "").into_owned();
    }
    text.chars()
        .filter(|c| !is_separator(*c))
        .map(katakana_to_hiragana)
        .collect()
}

fn strip_affixes(normalized: &str) -> String {
    let mut current = normalized.to_string();
    for prefix in NORMALIZED_PREFIXES.iter() {
        if let Some(rest) = current.strip_prefix(prefix.as_str()) {
            if char_len(rest) >= MIN_CORE_CHARS {
                current = rest.to_string();
                break;
            }
        }
    }
    for suffix in NORMALIZED_SUFFIXES.iter() {
        if let Some(rest) = current.strip_suffix(suffix.as_str()) {
            if char_len(rest) >= MIN_CORE_CHARS {
                current = rest.to_string();
                break;
            }
        }
    }
    current
}

fn normalized_vocabulary(terms: &[&str]) -> Vec<String> {
    let mut normalized: Vec<String> = terms
        .iter()
        .map(|term| normalize(term))
        .filter(|term| !term.is_empty())
        .collect();
    // longest first so "本店" wins over "店"
    normalized.sort_by(|a, b| char_len(b).cmp(&char_len(a)).then_with(|| a.cmp(b)));
    normalized.dedup();
    normalized
}

fn fixpoint(mut current: String, pass: impl Fn(&str) -> String) -> String {
    for _ in 0..MAX_PASSES {
        let next = pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

const SEPARATORS: &[char] = &[
    '・', '·', '•', '&', '+', '/', ',', '、', '-', '‐', '‑', '‒', '–', '—', '―', '−',
];

fn is_separator(c: char) -> bool {
    c.is_whitespace() || SEPARATORS.contains(&c)
}

fn katakana_to_hiragana(c: char) -> char {
    match c {
        '\u{30A1}'..='\u{30F6}' | '\u{30FD}'..='\u{30FE}' => {
            char::from_u32(c as u32 - 0x60).unwrap_or(c)
        }
        _ => c,
    }
}

pub fn is_han(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{3005}'
    )
}
