//! Deterministic seeded word stream. Every party that knows the match seed
//! reproduces the identical round text locally; the server never pushes it.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    fn comma_rate(self) -> f64 {
        match self {
            Difficulty::Easy => 0.08,
            Difficulty::Medium => 0.12,
            Difficulty::Hard => 0.20,
        }
    }

    fn period_rate(self) -> f64 {
        match self {
            Difficulty::Easy | Difficulty::Medium => 0.10,
            Difficulty::Hard => 0.15,
        }
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Non-zero fallback when a seed string hashes to zero.
const SEED_FALLBACK: u64 = 0x9e37_79b9_7f4a_7c15;

fn seed_hash(seed: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in seed.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    if hash == 0 {
        SEED_FALLBACK
    } else {
        hash
    }
}

const MID_PUNCTUATION: [char; 3] = [',', ';', ':'];

const WORDS: &[&str] = &[
    "the", "be", "of", "and", "a", "to", "in", "he", "have", "it", "that", "for", "they",
    "with", "as", "not", "on", "she", "at", "by", "this", "we", "you", "do", "but", "from",
    "or", "which", "one", "would", "all", "will", "there", "say", "who", "make", "when",
    "can", "more", "if", "no", "man", "out", "other", "so", "what", "time", "up", "go",
    "about", "than", "into", "could", "state", "only", "new", "year", "some", "take",
    "come", "these", "know", "see", "use", "get", "like", "then", "first", "any", "work",
    "now", "may", "such", "give", "over", "think", "most", "even", "find", "day", "also",
    "after", "way", "many", "must", "look", "before", "great", "back", "through", "long",
    "where", "much", "should", "well", "people", "down", "own", "just", "because", "good",
    "each", "those", "feel", "seem", "how", "high", "too", "place", "little", "world",
    "very", "still", "nation", "hand", "old", "life", "tell", "write", "become", "here",
    "show", "house", "both", "between", "need", "mean", "call", "develop", "under", "last",
    "right", "move", "thing", "general", "school", "never", "same", "another", "begin",
    "while", "number", "part", "turn", "real", "leave", "might", "want", "point", "form",
    "off", "child", "few", "small", "since", "against", "ask", "late", "home", "interest",
    "large", "person", "end", "open", "public", "follow", "during", "present", "without",
    "again", "hold", "govern", "around", "possible", "head", "consider", "word", "program",
    "problem", "however", "lead", "system", "set", "order", "eye", "plan", "run", "keep",
    "face", "fact", "group", "play", "stand", "increase", "early", "course", "change",
    "help", "line",
];

/// Deterministic word/punctuation stream.
///
/// Two calls with equal `(seed, target_length, difficulty, punctuation)`
/// return equal strings. The result is trimmed to `target_length` on a word
/// boundary when one exists.
pub fn generate(seed: &str, target_length: usize, difficulty: Difficulty, punctuation: bool) -> String {
    if target_length == 0 {
        return String::new();
    }

    let mut rng = SmallRng::seed_from_u64(seed_hash(seed));
    let mut text = String::with_capacity(target_length + 16);

    while text.len() < target_length {
        if !text.is_empty() {
            text.push(' ');
        }
        let word = WORDS[rng.gen_range(0..WORDS.len())];
        text.push_str(word);

        if punctuation {
            if rng.gen_bool(difficulty.comma_rate()) {
                text.push(MID_PUNCTUATION[rng.gen_range(0..MID_PUNCTUATION.len())]);
            } else if rng.gen_bool(difficulty.period_rate()) {
                text.push('.');
            }
        }
    }

    trim_to_word_boundary(&text, target_length)
}

/// Text for one round of a match, derived from the match seed so that late
/// reconnecters regenerate it without server help.
pub fn round_text(
    match_seed: &str,
    round: u32,
    target_length: usize,
    difficulty: Difficulty,
    punctuation: bool,
) -> String {
    generate(&format!("{match_seed}-{round}"), target_length, difficulty, punctuation)
}

fn trim_to_word_boundary(text: &str, target_length: usize) -> String {
    if text.len() <= target_length {
        return text.to_string();
    }
    let head = &text[..target_length];
    match head.rfind(' ') {
        Some(cut) if cut > 0 => head[..cut].to_string(),
        _ => head.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_pure() {
        let a = generate("match-42-1", 250, Difficulty::Medium, true);
        let b = generate("match-42-1", 250, Difficulty::Medium, true);
        assert_eq!(a, b);
        assert!(!a.is_empty());
        assert!(a.len() <= 250);
    }

    #[test]
    fn different_seeds_differ() {
        let a = generate("seed-a", 200, Difficulty::Medium, false);
        let b = generate("seed-b", 200, Difficulty::Medium, false);
        assert_ne!(a, b);
    }

    #[test]
    fn round_text_matches_suffixed_seed() {
        let direct = generate("abc-3", 180, Difficulty::Hard, true);
        let derived = round_text("abc", 3, 180, Difficulty::Hard, true);
        assert_eq!(direct, derived);
    }

    #[test]
    fn no_punctuation_when_disabled() {
        let text = generate("plain", 300, Difficulty::Hard, false);
        assert!(text.chars().all(|c| c.is_ascii_lowercase() || c == ' '));
    }

    #[test]
    fn trims_on_word_boundary() {
        let text = generate("boundary", 120, Difficulty::Easy, false);
        assert!(!text.ends_with(' '));
        assert!(text.len() <= 120);
    }

    #[test]
    fn zero_hash_falls_back() {
        // Not a zero-hashing string, but the fallback path must still produce
        // stable output for whatever reaches it.
        assert_eq!(seed_hash(""), FNV_OFFSET);
        let a = generate("", 80, Difficulty::Easy, false);
        let b = generate("", 80, Difficulty::Easy, false);
        assert_eq!(a, b);
    }
}
