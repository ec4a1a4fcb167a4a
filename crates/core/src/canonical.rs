use sha2::{Digest, Sha256};
use url::Url;

use crate::error::CrawlError;

/// Canonicalize a URL so that equivalent spellings collapse to one string:
/// lowercase scheme and host, default ports stripped, fragment removed,
/// dot-segments resolved, query pairs sorted by name then value, and an empty
/// path rendered as `/`. The result parses back to itself, so the operation
/// is idempotent.
pub fn canonicalize(raw: &str) -> Result<String, CrawlError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CrawlError::InvalidUrl("empty URL".into()));
    }

    // Url::parse already lowercases scheme/host, strips default ports and
    // resolves dot-segments per RFC 3986.
    let mut url = Url::parse(trimmed).map_err(|e| CrawlError::InvalidUrl(e.to_string()))?;

    if !url.has_host() {
        return Err(CrawlError::InvalidUrl(format!("no host in {trimmed}")));
    }

    url.set_fragment(None);

    if url.path().is_empty() {
        url.set_path("/");
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
        url.set_query(Some(&serializer.finish()));
    }

    Ok(url.to_string())
}

/// Resolve a possibly-relative link against a base page, then canonicalize.
/// Fragments-only links and non-http(s) schemes are rejected.
pub fn canonicalize_discovered(base: &Url, raw: &str) -> Result<String, CrawlError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Err(CrawlError::InvalidUrl(format!("bad link: {raw}")));
    }

    let joined = match Url::parse(trimmed) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => base
            .join(trimmed)
            .map_err(|e| CrawlError::InvalidUrl(e.to_string()))?,
        Err(e) => return Err(CrawlError::InvalidUrl(e.to_string())),
    };

    if joined.scheme() != "http" && joined.scheme() != "https" {
        return Err(CrawlError::InvalidUrl(format!(
            "unaccepted scheme: {}",
            joined.scheme()
        )));
    }

    canonicalize(joined.as_str())
}

/// Stable identity of a URL: hex SHA-256 of its canonical form.
pub fn fingerprint(canonical_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_url.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_scheme_and_host() {
        assert_eq!(
            canonicalize("HTTP://Example.COM/Path").unwrap(),
            "http://example.com/Path"
        );
    }

    #[test]
    fn strips_default_port_and_fragment() {
        assert_eq!(
            canonicalize("https://example.com:443/a#frag").unwrap(),
            "https://example.com/a"
        );
        assert_eq!(
            canonicalize("http://example.com:8080/a").unwrap(),
            "http://example.com:8080/a"
        );
    }

    #[test]
    fn sorts_query_pairs() {
        assert_eq!(
            canonicalize("http://a.com/p?b=2&a=1&b=1").unwrap(),
            "http://a.com/p?a=1&b=1&b=2"
        );
    }

    #[test]
    fn host_only_gets_root_path() {
        assert_eq!(canonicalize("http://a.com").unwrap(), "http://a.com/");
    }

    #[test]
    fn removes_dot_segments() {
        assert_eq!(
            canonicalize("http://a.com/x/../y/./z").unwrap(),
            "http://a.com/y/z"
        );
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let urls = [
            "HTTP://Example.COM:80/x/../y?b=2&a=1#f",
            "https://a.b.c/",
            "http://a.com/p?z=9&a=0",
        ];
        for raw in urls {
            let once = canonicalize(raw).unwrap();
            assert_eq!(canonicalize(&once).unwrap(), once);
        }
    }

    #[test]
    fn fingerprints_agree_iff_canonical_forms_agree() {
        let a = canonicalize("http://A.com/?x=1&y=2").unwrap();
        let b = canonicalize("http://a.com?y=2&x=1").unwrap();
        assert_eq!(a, b);
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = canonicalize("http://a.com/?x=1&y=3").unwrap();
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn resolves_relative_links() {
        let base = Url::parse("https://site.org/docs/page.html").unwrap();
        assert_eq!(
            canonicalize_discovered(&base, "../other").unwrap(),
            "https://site.org/other"
        );
        assert!(canonicalize_discovered(&base, "#section").is_err());
        assert!(canonicalize_discovered(&base, "mailto:x@y.z").is_err());
    }
}
