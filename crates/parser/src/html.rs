use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use trawler_core::canonical::canonicalize_discovered;
use trawler_core::Extracted;

use crate::{ParseFailure, Parser};

/// Max bytes to parse (5 MB). Larger bodies are truncated before parsing.
const MAX_PARSE_SIZE: usize = 5 * 1024 * 1024;

static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("static selector"));
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("static selector"));
static META_DESCRIPTION: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta[name='description']").expect("static selector"));
static HTML_TAG: Lazy<Selector> = Lazy::new(|| Selector::parse("html").expect("static selector"));
static CANONICAL_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse("link[rel='canonical']").expect("static selector"));

/// Link and field extraction over scraper's DOM.
#[derive(Default)]
pub struct HtmlParser;

impl HtmlParser {
    pub fn new() -> Self {
        Self
    }
}

impl Parser for HtmlParser {
    fn parse(&self, body: &[u8], base: &Url) -> Result<Extracted, ParseFailure> {
        if body.is_empty() {
            return Err(ParseFailure {
                permanent: true,
                reason: "empty body".into(),
            });
        }
        let body = if body.len() > MAX_PARSE_SIZE {
            &body[..MAX_PARSE_SIZE]
        } else {
            body
        };
        let text = String::from_utf8_lossy(body);
        let document = Html::parse_document(&text);

        let mut links: Vec<String> = Vec::new();
        let hrefs = document
            .select(&ANCHOR)
            .filter_map(|el| el.value().attr("href"));
        let canonicals = document
            .select(&CANONICAL_LINK)
            .filter_map(|el| el.value().attr("href"));
        for href in hrefs.chain(canonicals) {
            match canonicalize_discovered(base, href) {
                Ok(url) => links.push(url),
                Err(e) => debug!(href, "skipping link: {e}"),
            }
        }
        links.sort();
        links.dedup();

        let title = document
            .select(&TITLE)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty());

        let meta_description = document
            .select(&META_DESCRIPTION)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(str::to_owned);

        let language = document
            .select(&HTML_TAG)
            .next()
            .and_then(|el| el.value().attr("lang"))
            .map(str::to_owned);

        Ok(Extracted {
            links,
            title,
            meta_description,
            language,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(html: &str, base: &str) -> Extracted {
        let base = Url::parse(base).unwrap();
        HtmlParser::new().parse(html.as_bytes(), &base).unwrap()
    }

    #[test]
    fn extracts_and_absolutizes_links() {
        let extracted = parse(
            r##"<html><body>
                <a href="/x">x</a>
                <a href="http://other.com/y#frag">y</a>
                <a href="mailto:a@b.c">mail</a>
                <a href="#top">top</a>
            </body></html>"##,
            "http://a.com/page",
        );
        assert_eq!(
            extracted.links,
            ["http://a.com/x", "http://other.com/y"]
        );
    }

    #[test]
    fn duplicate_links_collapse() {
        let extracted = parse(
            r#"<a href="/x">1</a><a href="http://a.com/x">2</a><a href="/x#frag">3</a>"#,
            "http://a.com/",
        );
        assert_eq!(extracted.links, ["http://a.com/x"]);
    }

    #[test]
    fn extracts_document_fields() {
        let extracted = parse(
            r#"<html lang="en"><head>
                <title> Hello </title>
                <meta name="description" content="a page">
            </head><body></body></html>"#,
            "http://a.com/",
        );
        assert_eq!(extracted.title.as_deref(), Some("Hello"));
        assert_eq!(extracted.meta_description.as_deref(), Some("a page"));
        assert_eq!(extracted.language.as_deref(), Some("en"));
    }

    #[test]
    fn empty_body_is_permanent_failure() {
        let base = Url::parse("http://a.com/").unwrap();
        let err = HtmlParser::new().parse(b"", &base).unwrap_err();
        assert!(err.permanent);
    }

    #[test]
    fn canonical_link_counts_as_discovery() {
        let extracted = parse(
            r#"<head><link rel="canonical" href="http://a.com/real"></head>"#,
            "http://a.com/alias",
        );
        assert_eq!(extracted.links, ["http://a.com/real"]);
    }
}
