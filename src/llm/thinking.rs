//! Reasoning-block truncation for streamed content.
//!
//! Some models emit `<think>…</think>` traces in the content channel. The
//! filter watches the stream for those markers and, once the token budget
//! inside an open block is spent, splices in a synthetic close tag and a
//! truncation marker, then drops the rest of the block. Answer text after
//! the block is unaffected.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";
const TRUNCATION_SPLICE: &str = "</think>\n[Thinking truncated]\n";

/// Stateful filter applied to each streamed content delta.
#[derive(Debug)]
pub struct ThinkingFilter {
    max_tokens: usize,
    in_block: bool,
    suppressing: bool,
    tokens_in_block: usize,
    truncated: bool,
}

impl ThinkingFilter {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            in_block: false,
            suppressing: false,
            tokens_in_block: 0,
            truncated: false,
        }
    }

    /// Whether any block was truncated so far.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Feed one streamed delta; returns the text to emit for it.
    ///
    /// Each delta that lands wholly inside an open block counts as one token
    /// against the budget, matching how chat endpoints stream one token per
    /// SSE event.
    pub fn feed(&mut self, delta: &str) -> String {
        let mut out = String::new();
        let mut rest = delta;

        loop {
            if !self.in_block {
                match rest.find(OPEN_TAG) {
                    Some(i) => {
                        let end = i + OPEN_TAG.len();
                        out.push_str(&rest[..end]);
                        self.in_block = true;
                        self.suppressing = false;
                        self.tokens_in_block = 0;
                        rest = &rest[end..];
                    }
                    None => {
                        out.push_str(rest);
                        break;
                    }
                }
            } else {
                match rest.find(CLOSE_TAG) {
                    Some(i) => {
                        let end = i + CLOSE_TAG.len();
                        if !self.suppressing {
                            out.push_str(&rest[..end]);
                        }
                        self.in_block = false;
                        self.suppressing = false;
                        rest = &rest[end..];
                    }
                    None => {
                        if !self.suppressing && !rest.is_empty() {
                            self.tokens_in_block += 1;
                            if self.tokens_in_block > self.max_tokens {
                                out.push_str(TRUNCATION_SPLICE);
                                self.suppressing = true;
                                self.truncated = true;
                            } else {
                                out.push_str(rest);
                            }
                        }
                        break;
                    }
                }
            }
        }

        out
    }
}
