/// Result of feeding one decoded chunk through the stop-string checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// A configured stop string was found; the caller should stop without
    /// yielding anything further. Carries the buffered text accumulated
    /// before the match, which is discarded (the stop string itself is
    /// never emitted, per the glossary's definition of "stop string").
    Matched,
    /// The buffered text ends with a proper prefix of some stop string;
    /// nothing is yielded this step in case the rest of the match arrives
    /// in a later chunk.
    Withheld,
    /// No stop string can possibly match against the current buffer; the
    /// given text is safe to emit to the client.
    Yield(String),
}

/// Detects client-supplied stop strings across token boundaries.
///
/// A stop string can be split arbitrarily across generated tokens, so the
/// checker keeps a small rolling buffer: `feed` appends the new chunk,
/// checks for a full match, then checks whether the tail of the buffer is
/// a prefix of any stop string (in which case it must be withheld, since
/// the rest of the match might still arrive).
#[derive(Debug, Clone)]
pub struct StopChecker {
    stops: Vec<String>,
    buffer: String,
}

impl StopChecker {
    pub fn new(stops: Vec<String>) -> Self {
        Self {
            stops,
            buffer: String::new(),
        }
    }

    pub fn feed(&mut self, chunk: &str) -> StopOutcome {
        if self.stops.is_empty() {
            return StopOutcome::Yield(chunk.to_owned());
        }

        self.buffer.push_str(chunk);

        if self.stops.iter().any(|s| self.buffer.contains(s.as_str())) {
            return StopOutcome::Matched;
        }

        if self.longest_held_suffix_len() > 0 {
            return StopOutcome::Withheld;
        }

        let out = std::mem::take(&mut self.buffer);
        StopOutcome::Yield(out)
    }

    /// Length (in chars) of the longest suffix of the buffer that is a
    /// proper prefix of some stop string, or 0 if none withholds.
    fn longest_held_suffix_len(&self) -> usize {
        let buf_chars: Vec<char> = self.buffer.chars().collect();
        let mut best = 0;
        for stop in &self.stops {
            let stop_chars: Vec<char> = stop.chars().collect();
            let max_len = buf_chars.len().min(stop_chars.len().saturating_sub(1));
            for len in (1..=max_len).rev() {
                if buf_chars[buf_chars.len() - len..] == stop_chars[..len] {
                    best = best.max(len);
                    break;
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_immediately_with_no_stop_strings() {
        let mut checker = StopChecker::new(vec![]);
        assert_eq!(checker.feed("hello"), StopOutcome::Yield("hello".into()));
    }

    #[test]
    fn withholds_a_partial_stop_then_matches() {
        // stop = "###", tokens arrive as "##" then "#end"
        let mut checker = StopChecker::new(vec!["###".into()]);
        assert_eq!(checker.feed("##"), StopOutcome::Withheld);
        assert_eq!(checker.feed("#end"), StopOutcome::Matched);
    }

    #[test]
    fn never_yields_a_chunk_containing_the_stop_string() {
        // The stop string arrives whole in one chunk: it must be
        // detected as a match, never handed back to the caller as text.
        let mut checker = StopChecker::new(vec!["STOP".into()]);
        assert_eq!(checker.feed("before STOP after"), StopOutcome::Matched);
    }

    #[test]
    fn withholds_a_false_start_then_yields_unrelated_text() {
        // "STO" is a proper prefix of "STOP" and must be withheld; once
        // the next chunk diverges from the stop string, both the
        // withheld prefix and the new text are safe to yield... but the
        // checker only yields forward, so feeding a chunk that cannot
        // possibly complete the match releases the buffer as-is.
        let mut checker = StopChecker::new(vec!["STOP".into()]);
        assert_eq!(checker.feed("STO"), StopOutcome::Withheld);
        assert_eq!(checker.feed("ne"), StopOutcome::Yield("STOne".into()));
    }

    #[test]
    fn yields_text_with_no_relation_to_any_stop() {
        let mut checker = StopChecker::new(vec!["###".into()]);
        assert_eq!(checker.feed("hello "), StopOutcome::Yield("hello ".into()));
        assert_eq!(checker.feed("world"), StopOutcome::Yield("world".into()));
    }
}
