//! Stop-string matching for backends without native stop support

/// Outcome of checking accumulated text against the stop strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCheck {
    /// A stop string completed; the text is truncated before it
    Stopped(String),
    /// The text ends with a proper prefix of a stop string
    Hold,
    /// Safe to stream
    Emit,
}

#[derive(Debug, Clone, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
}

impl StopMatcher {
    pub fn new(stops: Vec<String>) -> Self {
        Self {
            stops: stops.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    pub fn check(&self, text: &str) -> StopCheck {
        let earliest = self
            .stops
            .iter()
            .filter_map(|stop| text.find(stop.as_str()))
            .min();
        if let Some(at) = earliest {
            return StopCheck::Stopped(text[..at].to_string());
        }

        if self.could_be_stop(text) {
            StopCheck::Hold
        } else {
            StopCheck::Emit
        }
    }

    /// Whether `text` ends with the beginning of some stop string
    fn could_be_stop(&self, text: &str) -> bool {
        self.stops.iter().any(|stop| {
            stop.char_indices()
                .skip(1)
                .any(|(end, _)| text.ends_with(&stop[..end]))
        })
    }
}
