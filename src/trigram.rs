//! Trigram word-similarity, computed in Rust over candidate rows.
//!
//! Words are lower-cased alphanumeric runs padded with two leading spaces
//! and one trailing space, so `"word"` yields `"  w"`, `" wo"`, `"wor"`,
//! `"ord"`, `"rd "`. [`word_similarity`] returns the best Jaccard score
//! between the query's trigram set and any contiguous extent of the text's
//! trigram sequence, which lets a short query match part of a long entry.

use std::collections::HashSet;

type Trigram = [char; 3];

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Trigrams of `text` in order of appearance (duplicates kept).
fn trigram_sequence(text: &str) -> Vec<Trigram> {
    let mut seq = Vec::new();
    for word in words(text) {
        let padded: Vec<char> = "  ".chars().chain(word.chars()).chain(" ".chars()).collect();
        seq.extend(padded.windows(3).map(|w| [w[0], w[1], w[2]]));
    }
    seq
}

fn trigram_set(text: &str) -> HashSet<Trigram> {
    trigram_sequence(text).into_iter().collect()
}

/// Greatest similarity between the trigrams of `query` and any contiguous
/// extent of `text`. In `[0.0, 1.0]`; `0.0` when either side has no words.
pub fn word_similarity(query: &str, text: &str) -> f64 {
    let q = trigram_set(query);
    if q.is_empty() {
        return 0.0;
    }
    let seq = trigram_sequence(text);
    let max_span = q.len() * 2;
    let mut best = 0.0f64;

    for start in 0..seq.len() {
        if !q.contains(&seq[start]) {
            continue;
        }
        let mut seen: HashSet<Trigram> = HashSet::new();
        let mut shared = 0usize;
        for tri in seq.iter().skip(start).take(max_span) {
            let in_query = q.contains(tri);
            if seen.insert(*tri) && in_query {
                shared += 1;
            }
            // Extents ending on a non-query trigram can only score lower.
            if in_query {
                let score = shared as f64 / (q.len() + seen.len() - shared) as f64;
                if score > best {
                    best = score;
                }
            }
        }
        if best >= 1.0 {
            break;
        }
    }

    best
}
