//! Sentinel-based termination detection.

use super::team::AgentSpec;

/// Result of checking one candidate turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationCheck {
    pub terminal: bool,
    /// Content with every sentinel occurrence removed.
    pub content: String,
    pub sentinel_seen: bool,
}

#[derive(Debug, Clone)]
pub struct TerminationDetector {
    sentinel: String,
}

impl TerminationDetector {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// Case-sensitive match; only speakers allowed to terminate can end the
    /// conversation. The sentinel is stripped whether or not it counts.
    pub fn evaluate(&self, content: &str, speaker: &AgentSpec) -> TerminationCheck {
        let sentinel_seen = !self.sentinel.is_empty() && content.contains(&self.sentinel);
        TerminationCheck {
            terminal: sentinel_seen && speaker.can_terminate,
            content: if sentinel_seen {
                self.strip(content)
            } else {
                content.to_string()
            },
            sentinel_seen,
        }
    }

    fn strip(&self, content: &str) -> String {
        let pieces: Vec<&str> = content.split(self.sentinel.as_str()).collect();
        let last = pieces.len() - 1;
        pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| {
                let piece = if i > 0 { piece.trim_start() } else { piece };
                if i < last {
                    piece.trim_end()
                } else {
                    piece
                }
            })
            .filter(|piece| !piece.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }
}
