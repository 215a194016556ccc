//! Deterministic splitting of generated text into chunk payloads.
//!
//! Sizes are counted in extended grapheme clusters, so a chunk boundary
//! never falls inside a grapheme (and therefore never inside a UTF-8
//! sequence). The concatenation of the chunks is always the original text
//! and no chunk is empty.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{Error, Result};

/// Default chunk window in graphemes.
pub const DEFAULT_CHUNK_WINDOW: usize = 50;

/// Where a full window may be cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryMode {
    /// Cut after the last whitespace grapheme in the window, if any.
    #[default]
    Word,
    /// Always cut at the window edge.
    Grapheme,
}

impl FromStr for BoundaryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "word" => Ok(Self::Word),
            "grapheme" => Ok(Self::Grapheme),
            other => Err(Error::configuration(format!(
                "unknown chunk boundary mode '{other}' (expected 'word' or 'grapheme')"
            ))),
        }
    }
}

impl std::fmt::Display for BoundaryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Word => f.write_str("word"),
            Self::Grapheme => f.write_str("grapheme"),
        }
    }
}

/// Splits text into chunk payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    window: usize,
    mode: BoundaryMode,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            window: DEFAULT_CHUNK_WINDOW,
            mode: BoundaryMode::Word,
        }
    }
}

impl Chunker {
    /// Creates a chunker with a window of `window` graphemes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if `window` is zero.
    pub fn new(window: usize, mode: BoundaryMode) -> Result<Self> {
        if window == 0 {
            return Err(Error::configuration("chunk window must be at least 1"));
        }
        Ok(Self { window, mode })
    }

    /// Returns the window size in graphemes.
    #[must_use]
    pub const fn window(&self) -> usize {
        self.window
    }

    /// Returns the boundary mode.
    #[must_use]
    pub const fn mode(&self) -> BoundaryMode {
        self.mode
    }

    /// Splits `text` into payloads.
    #[must_use]
    pub fn split<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let graphemes: Vec<(usize, &str)> = text.grapheme_indices(true).collect();
        let offset = |index: usize| graphemes.get(index).map_or(text.len(), |(at, _)| *at);

        let mut chunks = Vec::with_capacity(graphemes.len() / self.window + 1);
        let mut start = 0;
        while start < graphemes.len() {
            let mut end = (start + self.window).min(graphemes.len());
            if end < graphemes.len() && self.mode == BoundaryMode::Word {
                if let Some(space) = graphemes[start..end]
                    .iter()
                    .rposition(|(_, g)| g.chars().all(char::is_whitespace))
                {
                    end = start + space + 1;
                }
            }
            chunks.push(&text[offset(start)..offset(end)]);
            start = end;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn word_mode_cuts_after_whitespace() -> Result<()> {
        let chunker = Chunker::new(5, BoundaryMode::Word)?;
        assert_eq!(chunker.split("Hi there"), ["Hi ", "there"]);
        Ok(())
    }

    #[test]
    fn grapheme_mode_cuts_at_window_edge() -> Result<()> {
        let chunker = Chunker::new(5, BoundaryMode::Grapheme)?;
        assert_eq!(chunker.split("Hi there"), ["Hi th", "ere"]);
        Ok(())
    }

    #[test]
    fn long_word_falls_back_to_hard_cut() -> Result<()> {
        let chunker = Chunker::new(4, BoundaryMode::Word)?;
        assert_eq!(chunker.split("abcdefghij k"), ["abcd", "efgh", "ij ", "k"]);
        Ok(())
    }

    #[test]
    fn graphemes_are_never_split() -> Result<()> {
        let chunker = Chunker::new(1, BoundaryMode::Grapheme)?;
        let text = "e\u{301}👍🏽a";
        assert_eq!(chunker.split(text), ["e\u{301}", "👍🏽", "a"]);
        Ok(())
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(Chunker::default().split("").is_empty());
    }

    #[test]
    fn zero_window_is_rejected() {
        assert!(Chunker::new(0, BoundaryMode::Word).is_err());
    }

    #[test]
    fn boundary_mode_parses() -> Result<()> {
        assert_eq!("Word".parse::<BoundaryMode>()?, BoundaryMode::Word);
        assert_eq!("grapheme".parse::<BoundaryMode>()?, BoundaryMode::Grapheme);
        assert!("token".parse::<BoundaryMode>().is_err());
        Ok(())
    }

    proptest! {
        #[test]
        fn split_reassembles_without_empty_chunks(
            text in "\\PC{0,200}",
            window in 1usize..64,
            word in any::<bool>(),
        ) {
            let mode = if word { BoundaryMode::Word } else { BoundaryMode::Grapheme };
            let chunker = Chunker::new(window, mode).expect("window >= 1");
            let chunks = chunker.split(&text);

            prop_assert_eq!(chunks.concat(), text.clone());
            for chunk in &chunks {
                prop_assert!(!chunk.is_empty());
                prop_assert!(chunk.graphemes(true).count() <= window);
            }
            prop_assert_eq!(chunker.split(&text), chunks);
        }
    }
}
