use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal states a completion status can settle into. `Running` is the
/// only state under which the status exists in a generator's in-flight
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionState {
    Running,
    Done,
    Interrupted,
}

/// Per-request telemetry tracked for the lifetime of a generation.
///
/// Created when a request is accepted into the generation loop, updated
/// once per emitted token, and finalized when the loop exits for any
/// reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub request_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub input_text: String,
    pub generated_text: String,
    pub generated_tokens: u32,
    pub state: CompletionState,
}

impl CompletionStatus {
    pub fn new(request_id: Uuid, input_text: String) -> Self {
        Self {
            request_id,
            started_at: Utc::now(),
            input_text,
            generated_text: String::new(),
            generated_tokens: 0,
            state: CompletionState::Running,
        }
    }

    pub fn push_token(&mut self, text: &str) {
        self.generated_text.push_str(text);
        self.generated_tokens += 1;
    }

    /// Counts one raw generated token, independent of whether its decoded
    /// text is ever handed to the client. Call this as soon as a token is
    /// accepted, before the stop-string checker gets a chance to withhold
    /// or discard the text it decodes to.
    pub fn count_token(&mut self) {
        self.generated_tokens += 1;
    }

    /// Appends client-visible text without touching the token count;
    /// pair with `count_token` when the two need to happen at different
    /// points in the generation loop.
    pub fn append_text(&mut self, text: &str) {
        self.generated_text.push_str(text);
    }

    pub fn finish(&mut self, state: CompletionState) {
        self.state = state;
    }

    pub fn elapsed_secs(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn tokens_per_second(&self) -> f64 {
        let elapsed = self.elapsed_secs();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.generated_tokens as f64 / elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_generated_text_in_order() {
        let mut status = CompletionStatus::new(Uuid::new_v4(), "hi".into());
        status.push_token("Hel");
        status.push_token("lo");
        assert_eq!(status.generated_text, "Hello");
        assert_eq!(status.generated_tokens, 2);
    }

    #[test]
    fn starts_running_and_can_be_finalized() {
        let mut status = CompletionStatus::new(Uuid::new_v4(), "hi".into());
        assert_eq!(status.state, CompletionState::Running);
        status.finish(CompletionState::Interrupted);
        assert_eq!(status.state, CompletionState::Interrupted);
    }
}
