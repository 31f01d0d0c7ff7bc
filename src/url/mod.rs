use crate::error::{Error, Result};

/// Parsed information from a Notion page or database URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotionUrlInfo {
    /// Page (or database) ID in dashed form.
    pub page_id: String,
    /// Database view ID from `?v=`, if present.
    pub view_id: Option<String>,
}

/// Parse a Notion URL into its component identifiers.
///
/// Supported URL patterns:
/// - `https://www.notion.so/<workspace>/<Title-Words>-<32 hex>`
/// - `https://www.notion.so/<32 hex>`
/// - `https://www.notion.so/<workspace>/<32 hex>?v=<32 hex>` (database with view)
/// - `https://www.notion.so/<...>?p=<32 hex>` (page opened as a peek)
/// - `https://<team>.notion.site/<Title>-<32 hex>`
pub fn parse_notion_url(input: &str) -> Result<NotionUrlInfo> {
    let url = url::Url::parse(input).map_err(|e| Error::UrlParse(e.to_string()))?;

    let host = url.host_str().unwrap_or("");
    if !host.ends_with("notion.so") && !host.ends_with("notion.site") {
        return Err(Error::UrlParse(format!("not a Notion URL: {input}")));
    }

    let mut peek_id = None;
    let mut view_id = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "p" => peek_id = Some(normalize_id(&value)?),
            "v" => view_id = Some(normalize_id(&value)?),
            _ => {}
        }
    }

    if let Some(page_id) = peek_id {
        return Ok(NotionUrlInfo { page_id, view_id });
    }

    let last = url
        .path_segments()
        .and_then(|mut s| s.rfind(|seg| !seg.is_empty()))
        .unwrap_or("");

    let candidate = trailing_id(last)
        .ok_or_else(|| Error::UrlParse(format!("no page ID in URL: {input}")))?;

    Ok(NotionUrlInfo {
        page_id: normalize_id(candidate)?,
        view_id,
    })
}

/// Take the trailing 32-hex-digit ID from a slug like `My-Task-<id>`.
fn trailing_id(segment: &str) -> Option<&str> {
    let compact_len = 32;
    if segment.len() < compact_len {
        // Might already be a dashed ID
        return is_dashed_id(segment).then_some(segment);
    }
    if is_dashed_id(segment) {
        return Some(segment);
    }
    let tail = segment.get(segment.len() - compact_len..)?;
    tail.chars().all(|c| c.is_ascii_hexdigit()).then_some(tail)
}

fn is_dashed_id(s: &str) -> bool {
    let parts: Vec<&str> = s.split('-').collect();
    parts.len() == 5
        && parts
            .iter()
            .zip([8usize, 4, 4, 4, 12])
            .all(|(p, len)| p.len() == len && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Normalize a page ID to the dashed, lowercase 8-4-4-4-12 form.
///
/// Accepts the dashed form, the compact 32-character form, or either with
/// surrounding whitespace.
pub fn normalize_id(input: &str) -> Result<String> {
    let compact: String = input.trim().chars().filter(|c| *c != '-').collect();
    if compact.len() != 32 || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidIdentifier(format!(
            "'{input}' is not a Notion ID or URL"
        )));
    }
    let c = compact.to_lowercase();
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &c[0..8],
        &c[8..12],
        &c[12..16],
        &c[16..20],
        &c[20..32]
    ))
}

/// Strip dashes from an ID, the form used inside page links.
pub fn compact_id(id: &str) -> String {
    id.chars().filter(|c| *c != '-').collect()
}

/// Resolve an identifier that may be a raw ID or a Notion URL into a dashed ID.
pub fn resolve_id(identifier: &str) -> Result<String> {
    let trimmed = identifier.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") || trimmed.contains("notion.") {
        let with_scheme = if trimmed.starts_with("http") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };
        return parse_notion_url(&with_scheme).map(|info| info.page_id);
    }
    normalize_id(trimmed)
}

/// Build a browser link for a page.
pub fn page_url(id: &str) -> String {
    format!("https://www.notion.so/{}", compact_id(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DASHED: &str = "268c4871-39fd-4c78-9681-4d62ae34dcee";
    const COMPACT: &str = "268c487139fd4c7896814d62ae34dcee";

    #[test]
    fn test_normalize_compact_id() {
        assert_eq!(normalize_id(COMPACT).unwrap(), DASHED);
    }

    #[test]
    fn test_normalize_dashed_id_is_stable() {
        assert_eq!(normalize_id(DASHED).unwrap(), DASHED);
        assert_eq!(normalize_id(&DASHED.to_uppercase()).unwrap(), DASHED);
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_id("12345").is_err());
        assert!(normalize_id("zz8c487139fd4c7896814d62ae34dcee").is_err());
    }

    #[test]
    fn test_parse_slug_url() {
        let info = parse_notion_url(&format!(
            "https://www.notion.so/acme/Build-tracker-prototype-{COMPACT}"
        ))
        .unwrap();
        assert_eq!(info.page_id, DASHED);
        assert_eq!(info.view_id, None);
    }

    #[test]
    fn test_parse_database_url_with_view() {
        let info = parse_notion_url(&format!(
            "https://www.notion.so/acme/{COMPACT}?v=4ca9a281ae6d49e7b859279809a30401"
        ))
        .unwrap();
        assert_eq!(info.page_id, DASHED);
        assert_eq!(
            info.view_id.as_deref(),
            Some("4ca9a281-ae6d-49e7-b859-279809a30401")
        );
    }

    #[test]
    fn test_parse_peek_url_prefers_page() {
        let info = parse_notion_url(&format!(
            "https://www.notion.so/acme/4ca9a281ae6d49e7b859279809a30401?v=6eff59b93453498ca6087246c8ae186d&p={COMPACT}"
        ))
        .unwrap();
        assert_eq!(info.page_id, DASHED);
    }

    #[test]
    fn test_parse_notion_site() {
        let info = parse_notion_url(&format!("https://acme.notion.site/Roadmap-{COMPACT}")).unwrap();
        assert_eq!(info.page_id, DASHED);
    }

    #[test]
    fn test_parse_rejects_other_hosts() {
        assert!(parse_notion_url(&format!("https://example.com/{COMPACT}")).is_err());
    }

    #[test]
    fn test_resolve_id_variants() {
        assert_eq!(resolve_id(COMPACT).unwrap(), DASHED);
        assert_eq!(resolve_id(DASHED).unwrap(), DASHED);
        assert_eq!(resolve_id(&format!("notion.so/{COMPACT}")).unwrap(), DASHED);
        assert!(resolve_id("not-an-id").is_err());
    }

    #[test]
    fn test_page_url() {
        assert_eq!(page_url(DASHED), format!("https://www.notion.so/{COMPACT}"));
    }
}
