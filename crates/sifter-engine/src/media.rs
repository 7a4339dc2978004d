use std::collections::HashSet;
use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use sifter_contracts::{EncodedImage, SifterError, SifterResult};
use tracing::{debug, warn};

use crate::text::truncate_text;

const MEDIA_EXTENSIONS: &[&str] = &[
    "gif", "png", "jpg", "jpeg", "webp", "bmp", "svg", "avif", "tif", "tiff", "ico", "heic",
];
/// Hosts that serve animations without an image extension in the path.
const MEDIA_HOSTS: &[&str] = &[
    "giphy.com",
    "media.giphy.com",
    "tenor.com",
    "media.tenor.com",
    "imgur.com",
    "i.imgur.com",
    "gfycat.com",
];
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Pulls image and GIF URLs out of CSV text, first occurrence first.
pub fn extract_media_urls(csv: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in csv.split(|ch: char| ch == ',' || ch == ';' || ch == '\t' || ch.is_whitespace()) {
        let candidate = token.trim_matches(|ch: char| matches!(ch, '"' | '\'' | '<' | '>' | '(' | ')' | '[' | ']'));
        if !is_media_url(candidate) {
            continue;
        }
        if seen.insert(candidate.to_string()) {
            out.push(candidate.to_string());
        }
    }
    out
}

pub fn is_media_url(candidate: &str) -> bool {
    let lowered = candidate.to_ascii_lowercase();
    let Some(rest) = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
    else {
        return false;
    };
    let (host, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, ""),
    };
    let host = host.rsplit('@').next().unwrap_or(host);
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() || !host.contains('.') {
        return false;
    }
    let path = path
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let has_media_extension = path
        .rsplit_once('.')
        .map(|(_, ext)| MEDIA_EXTENSIONS.contains(&ext))
        .unwrap_or(false);
    has_media_extension
        || MEDIA_HOSTS
            .iter()
            .any(|known| host == *known || host.ends_with(&format!(".{known}")))
}

/// Downloads one media URL for the download proxy.
pub fn fetch_media(url: &str, timeout: Duration) -> SifterResult<EncodedImage> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(SifterError::MalformedInput("URL is required".to_string()));
    }
    let response = HttpClient::new()
        .get(trimmed)
        .timeout(timeout)
        .send()
        .map_err(|err| SifterError::ExternalCollaborator(format!("fetch of {trimmed} failed: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        warn!(url = trimmed, status = status.as_u16(), "media fetch rejected");
        return Err(SifterError::Fetch {
            status: status.as_u16(),
            message: format!("Failed to fetch image. Status: {}", status.as_u16()),
        });
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    let bytes = response.bytes().map_err(|err| {
        SifterError::ExternalCollaborator(format!(
            "body read for {} failed: {err}",
            truncate_text(trimmed, 120)
        ))
    })?;
    debug!(url = trimmed, bytes = bytes.len(), content_type = %content_type, "fetched media");
    Ok(EncodedImage::new(bytes.to_vec(), content_type))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sifter_contracts::SifterError;

    use super::{extract_media_urls, fetch_media, is_media_url};

    #[test]
    fn csv_urls_are_filtered_and_deduplicated() {
        let csv = "id,url,notes\n\
                   1,https://example.com/a.gif,\"see https://example.com/page\"\n\
                   2,\"https://cdn.example.org/img/b.PNG?w=200\",ok\n\
                   3,https://media.giphy.com/media/xyz/giphy,\n\
                   4,https://example.com/a.gif,dup\n\
                   5,ftp://example.com/c.gif,nope\n";
        assert_eq!(
            extract_media_urls(csv),
            vec![
                "https://example.com/a.gif",
                "https://cdn.example.org/img/b.PNG?w=200",
                "https://media.giphy.com/media/xyz/giphy",
            ]
        );
    }

    #[test]
    fn media_url_heuristic() {
        assert!(is_media_url("http://host.io/pic.jpeg#frag"));
        assert!(is_media_url("https://i.imgur.com/abc"));
        assert!(!is_media_url("https://example.com/report.pdf"));
        assert!(!is_media_url("https://localhost/a.gif"));
        assert!(!is_media_url("example.com/a.gif"));
        assert!(!is_media_url("https://gif.example.com/"));
    }

    #[test]
    fn empty_url_is_rejected_before_any_request() {
        assert!(matches!(
            fetch_media("  ", Duration::from_secs(1)),
            Err(SifterError::MalformedInput(_))
        ));
    }
}
