//! Sentence-boundary chunking for LLM output.
//!
//! A naive `split_sentences` that splits on every `. ` (as the teacher's
//! `voice/coordinator.rs` placeholder does) fragments "Mr. Smith" and "3.14"
//! mid-word. This scans for a terminator followed by whitespace-and-capital
//! (or end of input) and backs off when the token before the terminator
//! looks like a known abbreviation or the terminator sits between two
//! digits.

const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "inc", "ltd", "co", "gen",
    "rep", "sen", "gov", "lt", "col", "maj", "capt", "ave", "blvd", "dept", "no",
    // multi-period abbreviations ("e.g.", "i.e.") are matched against their
    // embedded periods stripped out — see is_abbreviation_before.
    "eg", "ie",
];

/// Accumulates streamed text and yields complete sentences as boundaries are
/// found, holding back anything after the last boundary for the next call.
#[derive(Debug, Default)]
pub struct SentenceBuffer {
    buf: String,
}

impl SentenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a text delta and returns any newly-completed sentences, in
    /// order, leaving the trailing partial sentence buffered.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buf.push_str(delta);
        let mut out = Vec::new();
        loop {
            match find_boundary(&self.buf) {
                Some(at) => {
                    let sentence = self.buf[..at].trim().to_string();
                    self.buf.drain(..at);
                    if !sentence.is_empty() {
                        out.push(sentence);
                    }
                }
                None => break,
            }
        }
        out
    }

    /// Called on `text_done`: flushes whatever remains, even if it never
    /// matched a boundary.
    pub fn flush(&mut self) -> Option<String> {
        let remainder = self.buf.trim().to_string();
        self.buf.clear();
        if remainder.is_empty() {
            None
        } else {
            Some(remainder)
        }
    }
}

/// Returns the byte offset just past a confirmed sentence terminator, or
/// `None` if no confirmed boundary exists yet in `text`.
fn find_boundary(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'.' && b != b'?' && b != b'!' {
            continue;
        }

        // A boundary must be followed by whitespace (or be at the very end
        // of buffered text, in which case we don't yet know — wait for more
        // input rather than guess).
        let next = bytes.get(i + 1).copied();
        match next {
            None => continue,
            Some(c) if !c.is_ascii_whitespace() => continue,
            _ => {}
        }

        if b == b'.' {
            if is_decimal_point(bytes, i) {
                continue;
            }
            if is_abbreviation_before(text, i) {
                continue;
            }
        }

        return Some(i + 1);
    }
    None
}

fn is_decimal_point(bytes: &[u8], dot_index: usize) -> bool {
    let before_digit = dot_index > 0 && bytes[dot_index - 1].is_ascii_digit();
    let after_digit = bytes.get(dot_index + 1).is_some_and(u8::is_ascii_digit);
    before_digit && after_digit
}

fn is_abbreviation_before(text: &str, dot_index: usize) -> bool {
    let before = &text[..dot_index];
    let word_start = before
        .rfind(|c: char| c.is_whitespace() || c == '(' || c == '"')
        .map(|i| i + 1)
        .unwrap_or(0);
    let word = &before[word_start..];
    if word.is_empty() {
        return false;
    }
    // Strip embedded periods so multi-period abbreviations like "e.g" and
    // "i.e" (the text up to but excluding the terminating period under
    // consideration) normalize to "eg"/"ie" before the lookup.
    let normalized = word.replace('.', "").to_lowercase();
    ABBREVIATIONS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_simple_sentence_boundary() {
        let mut buf = SentenceBuffer::new();
        let sentences = buf.push("Hello there. How are you");
        assert_eq!(sentences, vec!["Hello there.".to_string()]);
    }

    #[test]
    fn does_not_split_on_abbreviation() {
        let mut buf = SentenceBuffer::new();
        let sentences = buf.push("Please ask Dr. Smith for the results. Thanks");
        assert_eq!(sentences, vec!["Please ask Dr. Smith for the results.".to_string()]);
    }

    #[test]
    fn does_not_split_on_multi_period_abbreviation() {
        let mut buf = SentenceBuffer::new();
        let sentences = buf.push("Bring ID, e.g. a passport. That should work");
        assert_eq!(sentences, vec!["Bring ID, e.g. a passport.".to_string()]);
        let mut buf2 = SentenceBuffer::new();
        let sentences2 = buf2.push("Some fruits, i.e. apples and pears. Got it");
        assert_eq!(sentences2, vec!["Some fruits, i.e. apples and pears.".to_string()]);
    }

    #[test]
    fn does_not_split_on_decimal_number() {
        let mut buf = SentenceBuffer::new();
        let sentences = buf.push("The total comes to 3.14 dollars today. Anything else");
        assert_eq!(sentences, vec!["The total comes to 3.14 dollars today.".to_string()]);
    }

    #[test]
    fn flush_returns_trailing_partial_sentence() {
        let mut buf = SentenceBuffer::new();
        buf.push("No boundary yet");
        assert_eq!(buf.flush(), Some("No boundary yet".to_string()));
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn handles_question_and_exclamation_marks() {
        let mut buf = SentenceBuffer::new();
        let sentences = buf.push("Are you there? Yes! Great");
        assert_eq!(sentences, vec!["Are you there?".to_string(), "Yes!".to_string()]);
    }
}
