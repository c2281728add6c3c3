//! PROPFIND bodies and multistatus parsing.

use chrono::{DateTime, Utc};
use pkd_core::{TransferError, TransferResult};
use quick_xml::events::Event;
use quick_xml::Reader;

/// One `<d:response>` of a multistatus body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DavResource {
    pub href: String,
    pub content_length: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub is_collection: bool,
    /// `false` when the propstat carrying the properties was not `200`.
    pub found: bool,
}

pub const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:getcontentlength/>
    <d:getlastmodified/>
    <d:getetag/>
    <d:resourcetype/>
  </d:prop>
</d:propfind>"#;

/// `getlastmodified` uses the RFC 1123 form of HTTP dates.
pub fn parse_http_date(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(text.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Extract the local name from a possibly-namespaced XML tag.
fn local_name(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    match s.rfind(':') {
        Some(pos) => s[pos + 1..].to_string(),
        None => s.to_string(),
    }
}

/// Parse a WebDAV multistatus body.
pub fn parse_multistatus(xml: &str) -> TransferResult<Vec<DavResource>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut resources = Vec::new();
    let mut current: Option<DavResource> = None;
    let mut current_tag: Option<String> = None;
    let mut in_resourcetype = false;
    let mut propstat_ok = true;
    let mut staged = DavResource::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    "response" => {
                        current = Some(DavResource::default());
                    }
                    "propstat" => {
                        staged = DavResource::default();
                        propstat_ok = true;
                    }
                    "resourcetype" => in_resourcetype = true,
                    "collection" if in_resourcetype => staged.is_collection = true,
                    "href" | "getcontentlength" | "getlastmodified" | "getetag" | "status" => {
                        current_tag = Some(local);
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                if in_resourcetype && local_name(e.name().as_ref()) == "collection" {
                    staged.is_collection = true;
                }
            }
            Ok(Event::Text(ref e)) => {
                let (Some(tag), Some(res)) = (current_tag.as_deref(), current.as_mut()) else {
                    continue;
                };
                let text = e
                    .unescape()
                    .map_err(|err| TransferError::protocol(format!("bad XML text: {}", err)))?
                    .to_string();
                match tag {
                    "href" => res.href = text,
                    "getcontentlength" => staged.content_length = text.trim().parse().ok(),
                    "getlastmodified" => staged.last_modified = parse_http_date(&text),
                    "getetag" => staged.etag = Some(text.trim_matches('"').to_string()),
                    "status" => propstat_ok = text.split_whitespace().nth(1) == Some("200"),
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    "propstat" => {
                        if let Some(res) = current.as_mut() {
                            if propstat_ok {
                                res.content_length = staged.content_length;
                                res.last_modified = staged.last_modified;
                                res.etag = staged.etag.take();
                                res.is_collection = staged.is_collection;
                                res.found = true;
                            }
                        }
                    }
                    "response" => {
                        if let Some(res) = current.take() {
                            resources.push(res);
                        }
                    }
                    "resourcetype" => in_resourcetype = false,
                    _ => {
                        if current_tag.as_deref() == Some(local.as_str()) {
                            current_tag = None;
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(TransferError::protocol(format!(
                    "malformed multistatus XML at {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(resources)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode `%XX` escapes in an href path. `+` is left alone.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(h), Some(l)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push((h << 4) | l);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Turn an href (absolute URL or absolute path) into a remote path relative
/// to the server's DAV root `base_path`.
pub fn href_to_path(href: &str, base_path: &str) -> String {
    let path_part = match href.find("://") {
        Some(scheme_end) => {
            let rest = &href[scheme_end + 3..];
            rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
        }
        None => href,
    };
    let decoded = percent_decode(path_part);
    let base = percent_decode(base_path.trim_end_matches('/'));
    let relative = decoded.strip_prefix(base.as_str()).unwrap_or(&decoded);
    let trimmed = relative.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
