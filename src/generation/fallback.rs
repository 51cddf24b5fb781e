use std::collections::BTreeSet;

use crate::text_util::{keywords, split_sentences};

/// Appended to every extractive answer.
pub const DISCLOSURE: &str =
    "Note: limited response mode. This answer quotes the knowledge base directly because no language model was available.";

/// Returned when no sentence of the context relates to the question.
pub const INSUFFICIENT_INFORMATION: &str =
    "Insufficient information in the knowledge base to answer this query.";

const MAX_SCANNED_SENTENCES: usize = 20;
const MAX_SELECTED_SENTENCES: usize = 4;

/// Build an answer offline by quoting context sentences that share a
/// keyword with the question.
///
/// Deterministic and never empty.
pub fn extractive_answer(question: &str, context: &str) -> String {
    let wanted = keywords(question);
    if wanted.is_empty() {
        return INSUFFICIENT_INFORMATION.to_string();
    }

    let selected: Vec<&str> = split_sentences(context)
        .into_iter()
        .filter(|s| !s.starts_with("[Source:"))
        .take(MAX_SCANNED_SENTENCES)
        .filter(|s| shares_keyword(s, &wanted))
        .take(MAX_SELECTED_SENTENCES)
        .collect();

    if selected.is_empty() {
        return INSUFFICIENT_INFORMATION.to_string();
    }

    let mut answer = selected.join(" ");
    if !answer.ends_with(['.', '!', '?']) {
        answer.push('.');
    }
    answer.push_str("\n\n");
    answer.push_str(DISCLOSURE);
    answer
}

fn shares_keyword(sentence: &str, wanted: &BTreeSet<String>) -> bool {
    keywords(sentence).iter().any(|k| wanted.contains(k))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn selects_matching_sentences() {
        let context = "[Source: dm.pdf - Page 4]\nMetformin is first-line therapy. Sulfonylureas cause hypoglycemia. Metformin is contraindicated in severe renal impairment.";
        let answer = extractive_answer("When is metformin contraindicated?", context);
        assert_eq!(
            answer,
            format!(
                "Metformin is first-line therapy. Metformin is contraindicated in severe renal impairment.\n\n{DISCLOSURE}"
            )
        );
    }

    #[test]
    fn header_lines_are_never_quoted() {
        let context = "[Source: metformin.pdf - Page 1]\nUnrelated text about fractures.";
        assert_eq!(
            extractive_answer("metformin", context),
            INSUFFICIENT_INFORMATION
        );
    }

    #[test]
    fn stops_after_four_sentences() {
        let context = (0..10)
            .map(|i| format!("Insulin fact number {i}."))
            .collect::<Vec<_>>()
            .join(" ");
        let answer = extractive_answer("insulin", &context);
        let body = answer.strip_suffix(DISCLOSURE).unwrap();
        assert_eq!(body.matches("Insulin fact").count(), 4);
    }

    #[test]
    fn scans_only_the_first_twenty_sentences() {
        let mut sentences: Vec<String> =
            (0..20).map(|i| format!("Filler sentence {i}.")).collect();
        sentences.push("Warfarin needs INR monitoring.".to_string());
        let answer = extractive_answer("warfarin", &sentences.join(" "));
        assert_eq!(answer, INSUFFICIENT_INFORMATION);
    }

    #[test]
    fn stop_word_overlap_does_not_count() {
        let answer = extractive_answer("what is the dose", "The patient is stable.");
        assert_eq!(answer, INSUFFICIENT_INFORMATION);
    }

    #[test]
    fn empty_context() {
        assert_eq!(extractive_answer("metformin", ""), INSUFFICIENT_INFORMATION);
    }

    proptest! {
        #[test]
        fn answer_is_never_empty(question in ".{0,80}", context in ".{0,400}") {
            let answer = extractive_answer(&question, &context);
            prop_assert!(!answer.trim().is_empty());
        }

        #[test]
        fn answer_is_deterministic(
            question in "[a-z ]{0,40}",
            context in "[a-zA-Z .!?\n]{0,300}",
        ) {
            prop_assert_eq!(
                extractive_answer(&question, &context),
                extractive_answer(&question, &context)
            );
        }
    }
}
