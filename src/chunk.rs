//! Sentence-boundary passage splitter.
//!
//! Splits normalized document text into passages of at most `max_length`
//! characters. Passages always end on a sentence boundary:
//!
//! - a Latin terminator (`.`, `!`, `?`) followed by whitespace, or
//! - a CJK terminator (`。`, `！`, `？`, `…`) or a newline.
//!
//! Consecutive sentences are packed greedily until the next one would push
//! the passage past the limit. Nothing is trimmed or dropped: concatenating
//! the passages gives back the input text exactly.
//!
//! If the first sentence of a document is longer than `max_length`, the
//! limit for that document grows in steps of [`GROWTH_STEP`] until the first
//! sentence fits (see [`find_boundary_limit`]). A sentence later in the text
//! that is longer than the limit becomes a passage on its own.
//!
//! Lengths are counted in Unicode scalar values, not bytes.

use std::sync::OnceLock;

use regex::Regex;

/// Default maximum passage length in characters.
pub const DEFAULT_MAX_LENGTH: usize = 400;

/// Amount the limit grows by when the first sentence does not fit.
pub const GROWTH_STEP: usize = 10;

fn boundary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[.!?]\s|[。！？…\n]").expect("boundary pattern is valid"))
}

/// End of a sentence boundary, as a byte offset and a char offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoundaryEnd {
    byte: usize,
    chars: usize,
}

/// All sentence boundary ends in `text`, in ascending order.
fn boundary_ends(text: &str) -> Vec<BoundaryEnd> {
    let mut ends = Vec::new();
    let mut last_byte = 0;
    let mut chars = 0;
    for m in boundary_pattern().find_iter(text) {
        chars += text[last_byte..m.end()].chars().count();
        last_byte = m.end();
        ends.push(BoundaryEnd {
            byte: m.end(),
            chars,
        });
    }
    ends
}

/// Smallest limit `initial_limit + k * step` (k ≥ 0) under which a passage
/// starting at offset 0 can end on the first sentence boundary.
///
/// Returns `None` when `text` contains no boundary at all. Otherwise the
/// result is at most `max(initial_limit, first_boundary + step - 1)`, so
/// growth is bounded by the text length.
///
/// ```rust
/// use intelligent_search::chunk::find_boundary_limit;
///
/// assert_eq!(find_boundary_limit("Short. Rest.", 20, 10), Some(20));
/// let long_opening = format!("{}. tail", "x".repeat(44));
/// assert_eq!(find_boundary_limit(&long_opening, 20, 10), Some(50));
/// assert_eq!(find_boundary_limit("no terminator here", 20, 10), None);
/// ```
pub fn find_boundary_limit(text: &str, initial_limit: usize, step: usize) -> Option<usize> {
    let first = boundary_pattern()
        .find(text)
        .map(|m| text[..m.end()].chars().count())?;
    Some(grow_limit(first, initial_limit, step))
}

fn grow_limit(first_boundary: usize, initial_limit: usize, step: usize) -> usize {
    if first_boundary <= initial_limit {
        return initial_limit;
    }
    let step = step.max(1);
    initial_limit + (first_boundary - initial_limit).div_ceil(step) * step
}

/// Output of [`split_passages`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub passages: Vec<String>,
    /// Limit actually used for packing. Larger than the requested limit when
    /// the opening sentence forced growth; equal to the text length when the
    /// text has no boundary at all.
    pub effective_limit: usize,
}

/// Split `text` into passages of at most `max_length` chars with the default
/// growth step.
pub fn split_text(text: &str, max_length: usize) -> Vec<String> {
    split_passages(text, max_length, GROWTH_STEP).passages
}

/// Split `text` into boundary-aligned passages.
///
/// Empty text yields no passages. Text without any boundary yields a single
/// passage holding all of it.
pub fn split_passages(text: &str, max_length: usize, step: usize) -> Split {
    if text.is_empty() {
        return Split {
            passages: Vec::new(),
            effective_limit: max_length,
        };
    }

    let mut ends = boundary_ends(text);
    let Some(first) = ends.first() else {
        return Split {
            passages: vec![text.to_string()],
            effective_limit: text.chars().count(),
        };
    };
    let limit = grow_limit(first.chars, max_length, step);

    // Trailing text after the last boundary is kept as a final sentence.
    if let Some(last) = ends.last().copied() {
        if last.byte < text.len() {
            ends.push(BoundaryEnd {
                byte: text.len(),
                chars: last.chars + text[last.byte..].chars().count(),
            });
        }
    }

    let mut passages = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    let mut start = BoundaryEnd { byte: 0, chars: 0 };

    for end in ends {
        let sentence = &text[start.byte..end.byte];
        let sentence_len = end.chars - start.chars;

        if current_len + sentence_len <= limit {
            current.push_str(sentence);
            current_len += sentence_len;
        } else {
            if !current.is_empty() {
                passages.push(std::mem::take(&mut current));
            }
            current.push_str(sentence);
            current_len = sentence_len;
        }
        start = end;
    }

    if !current.is_empty() {
        passages.push(current);
    }

    Split {
        passages,
        effective_limit: limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn char_len(s: &str) -> usize {
        s.chars().count()
    }

    #[test]
    fn test_mixed_script_scenario() {
        let text = "Hello world. This is a test! 次は日本語です。";
        let passages = split_text(text, 20);
        assert_eq!(
            passages,
            vec!["Hello world. ", "This is a test! ", "次は日本語です。"]
        );
        for p in &passages {
            assert!(char_len(p) <= 20);
            let last = p.trim_end().chars().last().unwrap();
            assert!(matches!(last, '.' | '!' | '。'), "unexpected end: {:?}", p);
        }
        assert_eq!(passages.concat(), text);
    }

    #[test]
    fn test_sentences_packed_up_to_limit() {
        let text = "One. Two. Three. Four. Five.";
        let passages = split_text(text, 12);
        assert_eq!(passages, vec!["One. Two. ", "Three. ", "Four. Five."]);
    }

    #[test]
    fn test_concatenation_reproduces_input() {
        let texts = [
            "Plain sentence. Another one? Yes! And trailing words without end",
            "一行目。\n二行目！三行目？終わり…",
            "Line one\nLine two\n\nLine four.\n",
            "Mixed.日本語。English again! ",
            "   leading spaces. then more.   ",
            "no boundary whatsoever in this text",
            "A very long opening sentence that certainly exceeds the tiny limit. short.",
        ];
        for text in texts {
            for limit in [1, 5, 12, 40, 400] {
                let split = split_passages(text, limit, GROWTH_STEP);
                assert_eq!(split.passages.concat(), text, "limit {}", limit);
                assert!(split.passages.iter().all(|p| !p.is_empty()));
            }
        }
    }

    #[test]
    fn test_passages_bounded_when_sentences_fit() {
        let sentence = "Twelve chars. ";
        let text = sentence.repeat(30);
        let split = split_passages(&text, 50, GROWTH_STEP);
        assert_eq!(split.effective_limit, 50);
        for p in &split.passages {
            assert!(char_len(p) <= 50);
            assert!(p.ends_with(". "));
        }
    }

    #[test]
    fn test_limit_grows_for_long_opening_sentence() {
        let opening = format!("{}. ", "a".repeat(33)); // 35 chars
        let text = format!("{}Next. After.", opening);
        let split = split_passages(&text, 20, 10);
        assert!(split.effective_limit > 20);
        assert_eq!(split.effective_limit, 40);
        assert!(split.passages[0].starts_with(&opening));
        assert!(char_len(&split.passages[0]) <= split.effective_limit);
        assert_eq!(split.passages.concat(), text);
    }

    #[test]
    fn test_oversized_middle_sentence_is_own_passage() {
        let long = format!("{}. ", "b".repeat(60));
        let text = format!("Short one. {}Tail.", long);
        let passages = split_text(&text, 20);
        assert_eq!(passages, vec!["Short one. ".to_string(), long, "Tail.".to_string()]);
    }

    #[test]
    fn test_cjk_and_newline_boundaries() {
        let text = "今日は晴れ。明日は雨！\n明後日は？";
        let passages = split_text(text, 7);
        assert_eq!(passages, vec!["今日は晴れ。", "明日は雨！\n", "明後日は？"]);
    }

    #[test]
    fn test_latin_terminator_requires_whitespace() {
        // "3.14" must not split; "v1.2." at end of text has no trailing space.
        let text = "Pi is 3.14 roughly. Version v1.2.";
        let passages = split_text(text, 20);
        assert_eq!(passages, vec!["Pi is 3.14 roughly. ", "Version v1.2."]);
    }

    #[test]
    fn test_no_boundary_single_passage() {
        let text = "x".repeat(1000);
        let split = split_passages(&text, 400, GROWTH_STEP);
        assert_eq!(split.passages, vec![text.clone()]);
        assert_eq!(split.effective_limit, 1000);
        assert_eq!(find_boundary_limit(&text, 400, 10), None);
    }

    #[test]
    fn test_empty_text() {
        let split = split_passages("", 400, GROWTH_STEP);
        assert!(split.passages.is_empty());
    }

    #[test]
    fn test_find_boundary_limit_closed_form() {
        assert_eq!(find_boundary_limit("Hi. there.", 400, 10), Some(400));
        // First boundary ends at char 22: 20 + ceil(2 / 10) * 10.
        let text = format!("{}. x", "c".repeat(20));
        assert_eq!(find_boundary_limit(&text, 20, 10), Some(30));
        // A period at the very end of the text is not followed by whitespace.
        let text = format!("{}.", "c".repeat(20));
        assert_eq!(find_boundary_limit(&text, 20, 10), None);
        // Exactly reaching a step multiple does not overshoot.
        let text = format!("{}。", "字".repeat(29));
        assert_eq!(find_boundary_limit(&text, 20, 10), Some(30));
        // Zero step is treated as one.
        assert_eq!(find_boundary_limit(&text, 20, 0), Some(30));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha. Beta! Gamma? Delta。Epsilon\nZeta.";
        assert_eq!(split_text(text, 10), split_text(text, 10));
    }
}
