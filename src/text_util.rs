use std::collections::BTreeSet;

use tantivy::tokenizer::{
    Language,
    LowerCaser,
    RemoveLongFilter,
    SimpleTokenizer,
    Stemmer,
    StopWordFilter,
    TextAnalyzer,
    TokenStream,
};

/// Maximum number of characters in a citation excerpt before truncation.
pub const DEFAULT_EXCERPT_MAX_CHARS: usize = 240;

/// Punctuation kept by [`normalize_text`] on top of letters, digits and
/// whitespace. Covers units, ranges and comparison operators found in
/// clinical text.
const CLINICAL_PUNCTUATION: &[char] = &[
    '.', ',', ':', ';', '-', '(', ')', '[', ']', '%', '+', '/', '<', '>', '=',
    '\'', '"', '°', 'µ', '≤', '≥', '±', '×', '·', '?', '!',
];

/// English stop words, shared by the embedders and the keyword matcher.
pub const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am",
    "an", "and", "any", "are", "as", "at", "be", "because", "been", "before",
    "being", "below", "between", "both", "but", "by", "can", "could", "did",
    "do", "does", "doing", "down", "during", "each", "few", "for", "from",
    "further", "had", "has", "have", "having", "he", "her", "here", "hers",
    "herself", "him", "himself", "his", "how", "i", "if", "in", "into", "is",
    "it", "its", "itself", "just", "may", "me", "might", "more", "most",
    "must", "my", "myself", "no", "nor", "not", "now", "of", "off", "on",
    "once", "only", "or", "other", "our", "ours", "ourselves", "out", "over",
    "own", "same", "shall", "she", "should", "so", "some", "such", "than",
    "that", "the", "their", "theirs", "them", "themselves", "then", "there",
    "these", "they", "this", "those", "through", "to", "too", "under",
    "until", "up", "very", "was", "we", "were", "what", "when", "where",
    "which", "while", "who", "whom", "why", "will", "with", "would", "you",
    "your", "yours", "yourself", "yourselves",
];

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.binary_search(&word).is_ok()
}

/// Normalize extracted text.
///
/// Drops characters outside letters, digits, whitespace and
/// [`CLINICAL_PUNCTUATION`], then collapses whitespace runs to one space.
/// With `strip_page_numbers`, a lone 1-4 digit token at the very start or
/// end of the text (a running page number) is removed as well.
pub fn normalize_text(raw: &str, strip_page_numbers: bool) -> String {
    let filtered: String = raw
        .chars()
        .map(|c| {
            if c.is_whitespace() {
                ' '
            } else {
                c
            }
        })
        .filter(|&c| {
            c == ' ' || c.is_alphanumeric() || CLINICAL_PUNCTUATION.contains(&c)
        })
        .collect();

    let mut words: Vec<&str> = filtered.split_whitespace().collect();
    if strip_page_numbers {
        if words.first().is_some_and(|w| is_page_number(w)) {
            words.remove(0);
        }
        if words.last().is_some_and(|w| is_page_number(w)) {
            words.pop();
        }
    }
    words.join(" ")
}

fn is_page_number(token: &str) -> bool {
    (1..=4).contains(&token.len()) && token.bytes().all(|b| b.is_ascii_digit())
}

/// Build the analyzer used to turn text into embedding features: simple
/// tokenization, long-token removal, lowercasing, stop words and English
/// stemming.
pub fn analyzer() -> TextAnalyzer {
    let stop_words: Vec<String> =
        STOP_WORDS.iter().map(|w| w.to_string()).collect();
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(StopWordFilter::remove(stop_words))
        .filter(Stemmer::new(Language::English))
        .build()
}

/// Run `text` through `analyzer`, returning the token texts in order.
pub fn analyze(analyzer: &mut TextAnalyzer, text: &str) -> Vec<String> {
    let mut stream = analyzer.token_stream(text);
    let mut tokens = Vec::new();
    while stream.advance() {
        tokens.push(stream.token().text.clone());
    }
    tokens
}

/// Lowercase alphanumeric tokens of `text` with stop words removed.
pub fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !is_stop_word(w))
        .collect()
}

/// Split text into sentences at `.`, `!` or `?` followed by whitespace, and
/// at line breaks. Returned slices are trimmed and never empty.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        let boundary = match c {
            '\n' => Some(idx),
            '.' | '!' | '?' => match chars.peek() {
                Some((_, next)) if next.is_whitespace() => {
                    Some(idx + c.len_utf8())
                }
                None => Some(idx + c.len_utf8()),
                _ => None,
            },
            _ => None,
        };

        if let Some(end) = boundary {
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Truncate `text` to at most `max_chars` characters, cutting at the last
/// word boundary and appending `...` when anything was dropped.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return text.to_string();
    };

    let head = &text[..cut];
    let head = match head.rfind(' ') {
        Some(space) if space > 0 => &head[..space],
        _ => head,
    };
    format!("{}...", head.trim_end())
}

/// Excerpt starting at the first sentence that mentions a keyword of
/// `query`. Falls back to the head of `text`.
pub fn excerpt_around(text: &str, query: &str, max_chars: usize) -> String {
    let wanted = keywords(query);
    if wanted.is_empty() {
        return excerpt(text, max_chars);
    }

    for sentence in split_sentences(text) {
        if keywords(sentence).iter().any(|k| wanted.contains(k)) {
            let offset = text.find(sentence).unwrap_or(0);
            return excerpt(&text[offset..], max_chars);
        }
    }
    excerpt(text, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_words_are_sorted_for_binary_search() {
        let mut sorted = STOP_WORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOP_WORDS);
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(
            normalize_text("Insulin   dosing\n\tguide", false),
            "Insulin dosing guide"
        );
    }

    #[test]
    fn normalize_keeps_clinical_notation() {
        let text = "HbA1c ≥ 6.5% and β-blocker 5 µg/kg at 37 °C, α < 0.05";
        assert_eq!(normalize_text(text, true), text);
    }

    #[test]
    fn normalize_drops_artifacts() {
        assert_eq!(normalize_text("• Aspirin © 2020 ™", false), "Aspirin 2020");
    }

    #[test]
    fn normalize_strips_running_page_numbers() {
        assert_eq!(
            normalize_text("412 Heart failure management 413", true),
            "Heart failure management"
        );
        assert_eq!(
            normalize_text("type 2 diabetes", true),
            "type 2 diabetes"
        );
    }

    #[test]
    fn normalize_leaves_numbers_in_flat_text() {
        assert_eq!(normalize_text("12 weeks of 500", false), "12 weeks of 500");
    }

    #[test]
    fn analyze_stems_and_drops_stop_words() {
        let mut analyzer = analyzer();
        let tokens = analyze(&mut analyzer, "The treatments for Diabetes");
        assert_eq!(tokens, vec!["treatment", "diabet"]);
    }

    #[test]
    fn keywords_lowercase_without_stop_words() {
        let kw = keywords("What is the first-line treatment for diabetes?");
        let expected: BTreeSet<String> = ["first", "line", "treatment", "diabetes"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(kw, expected);
    }

    #[test]
    fn split_sentences_on_terminators_and_lines() {
        let text = "First one. Second one! Third?\n[Source: a.pdf - Page 2]\nv1.5 dose";
        assert_eq!(
            split_sentences(text),
            vec![
                "First one.",
                "Second one!",
                "Third?",
                "[Source: a.pdf - Page 2]",
                "v1.5 dose"
            ]
        );
    }

    #[test]
    fn split_sentences_empty() {
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn excerpt_short_text_unchanged() {
        assert_eq!(excerpt("short text", 100), "short text");
    }

    #[test]
    fn excerpt_truncates_at_word_boundary() {
        let result = excerpt("alpha beta gamma delta", 12);
        assert_eq!(result, "alpha beta...");
    }

    #[test]
    fn excerpt_handles_multibyte() {
        let text = "αβγ ".repeat(50);
        let result = excerpt(&text, 10);
        assert!(result.ends_with("..."));
        assert!(result.chars().count() <= 13);
    }

    #[test]
    fn excerpt_around_starts_at_matching_sentence() {
        let text = "Hypertension is common. Metformin lowers glucose. Diet helps.";
        let result = excerpt_around(text, "metformin dosing", 100);
        assert!(result.starts_with("Metformin lowers glucose."));
    }

    #[test]
    fn excerpt_around_without_match_uses_head() {
        let text = "Hypertension is common. Diet helps.";
        assert_eq!(
            excerpt_around(text, "oncology", 100),
            "Hypertension is common. Diet helps."
        );
    }
}
