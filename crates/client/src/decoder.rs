//! Incremental text reconstruction from cumulative frames
//!
//! Workers send the whole generation in every frame. The decoder turns that
//! into append-only pieces for display, skipping the echoed prompt and
//! holding back a trailing nonspacing mark (general category Mn) until a
//! later frame shows what follows it. Spacing marks are shown as they come.

use chatfleet_common::error::{ChatFleetError, Result};
use chatfleet_proto::GenerationFrame;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TRAILING_NONSPACING_MARK: Regex = Regex::new(r"\p{Mn}\z").unwrap();
}

/// Offsets are counted in chars
#[derive(Debug, Clone)]
pub struct StreamDecoder {
    skip_echo_len: usize,
    pos: usize,
    last_text: String,
}

fn char_tail(text: &str, from: usize) -> &str {
    match text.char_indices().nth(from) {
        Some((offset, _)) => &text[offset..],
        None => "",
    }
}

impl StreamDecoder {
    pub fn new(skip_echo_len: usize) -> Self {
        Self {
            skip_echo_len,
            pos: skip_echo_len,
            last_text: String::new(),
        }
    }

    /// Decoder for a request whose frames start with `prompt` when echoed
    pub fn for_prompt(prompt: &str, echo: bool) -> Self {
        Self::new(if echo { prompt.chars().count() } else { 0 })
    }

    /// Feed one frame's text; returns the newly displayable piece, if any
    pub fn push_text(&mut self, text: &str) -> Option<String> {
        let len = text.chars().count();
        self.last_text.clear();
        self.last_text.push_str(text);

        if len <= self.skip_echo_len {
            return None;
        }

        self.pos = self.pos.max(self.skip_echo_len);
        let candidate = char_tail(text, self.pos);
        let last = candidate.chars().next_back()?;

        let piece = if TRAILING_NONSPACING_MARK.is_match(candidate) {
            self.pos = len - 1;
            &candidate[..candidate.len() - last.len_utf8()]
        } else {
            self.pos = len;
            candidate
        };
        (!piece.is_empty()).then(|| piece.to_string())
    }

    /// Feed one frame; error frames end decoding with their code and text
    pub fn push(&mut self, frame: &GenerationFrame) -> Result<Option<String>> {
        if frame.is_error() {
            return Err(ChatFleetError::Generation {
                code: frame.error_code,
                text: frame.text.clone(),
            });
        }
        Ok(self.push_text(&frame.text))
    }

    /// Whatever is left of the last frame after the stream ended
    pub fn finish(self) -> Option<String> {
        let rest = char_tail(&self.last_text, self.pos);
        (!rest.is_empty()).then(|| rest.to_string())
    }
}
