//! Parser capability. Parse workers hand a stored body to a `Parser` and get
//! back discovered links plus a few document fields; the engine knows nothing
//! about HTML beyond this interface.

pub mod html;

use url::Url;

use trawler_core::Extracted;

/// Parse failures split into transient (worth a retry: truncated read, bad
/// encoding that a refetch may fix) and permanent (the document will never
/// parse).
#[derive(Debug)]
pub struct ParseFailure {
    pub permanent: bool,
    pub reason: String,
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for ParseFailure {}

pub trait Parser: Send + Sync + 'static {
    /// Extract links and document fields from a stored body. `base` is the
    /// final URL of the fetch, used to absolutize relative links.
    fn parse(&self, body: &[u8], base: &Url) -> Result<Extracted, ParseFailure>;
}

pub use html::HtmlParser;
