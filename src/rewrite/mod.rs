//! Response body URL rewriting
//!
//! Upstream services emit absolute URLs pointing at themselves (OData
//! metadata, atom links, plain JSON references). Before a response leaves
//! the gateway those references are rewritten so downstream clients only
//! ever see proxy URLs.
//!
//! `rewrite` is a pure function over the body and a base-URL pair. Bodies
//! that parse as XML are rewritten element-by-element (attributes and leaf
//! text); anything else falls back to a case-insensitive textual
//! replacement. The function is idempotent: applying it twice produces the
//! same output, and already-proxied prefixes are never rewritten again.

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use std::io::Cursor;

/// Rewrite upstream URL references in `body`.
///
/// `original_host`/`original_path` describe the upstream base being
/// replaced, `proxy_host`/`proxy_path` the proxy base replacing it. Hosts
/// carry the scheme (`http://up:8020`), paths start with `/`. Trailing
/// slashes on either base are ignored.
pub fn rewrite(
    body: &str,
    original_host: &str,
    original_path: &str,
    proxy_host: &str,
    proxy_path: &str,
) -> String {
    let original_base = join_base(original_host, original_path);
    let proxy_base = join_base(proxy_host, proxy_path);

    if original_base.is_empty() {
        return body.to_string();
    }

    if body.trim_start().starts_with('<') {
        if let Ok(rewritten) =
            rewrite_xml(body, &original_base, &proxy_base, proxy_host, proxy_path)
        {
            return rewritten;
        }
    }

    rewrite_plain_text(body, &original_base, &proxy_base)
}

fn join_base(host: &str, path: &str) -> String {
    format!("{host}{path}").trim_end_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// XML path
// ---------------------------------------------------------------------------

/// Any malformed-XML condition; the caller falls back to the textual rule
struct NotXml;

fn rewrite_xml(
    body: &str,
    original_base: &str,
    proxy_base: &str,
    proxy_host: &str,
    proxy_path: &str,
) -> Result<String, NotXml> {
    let mut reader = Reader::from_str(body);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut saw_element = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                saw_element = true;
                let rewritten = rewrite_element(&e, original_base, proxy_base, proxy_path)?;
                writer.write_event(Event::Start(rewritten)).map_err(|_| NotXml)?;
            }
            Ok(Event::Empty(e)) => {
                saw_element = true;
                let rewritten = rewrite_element(&e, original_base, proxy_base, proxy_path)?;
                writer.write_event(Event::Empty(rewritten)).map_err(|_| NotXml)?;
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|_| NotXml)?;
                let rewritten = rewrite_text_node(&text, original_base, proxy_base, proxy_host);
                writer
                    .write_event(Event::Text(BytesText::new(&rewritten)))
                    .map_err(|_| NotXml)?;
            }
            Ok(Event::Eof) => break,
            Ok(other) => writer.write_event(other).map_err(|_| NotXml)?,
            Err(_) => return Err(NotXml),
        }
    }

    if !saw_element {
        // Pure text slipped past the '<' sniff; let the textual rule handle it
        return Err(NotXml);
    }

    String::from_utf8(writer.into_inner().into_inner()).map_err(|_| NotXml)
}

fn rewrite_element(
    element: &BytesStart<'_>,
    original_base: &str,
    proxy_base: &str,
    proxy_path: &str,
) -> Result<BytesStart<'static>, NotXml> {
    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let mut rewritten = BytesStart::new(name);

    for attr in element.attributes() {
        let attr = attr.map_err(|_| NotXml)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|_| NotXml)?.into_owned();
        let local = attr.key.local_name();
        let new_value = rewrite_attribute(
            &key,
            local.as_ref(),
            &value,
            original_base,
            proxy_base,
            proxy_path,
        );
        rewritten.push_attribute((key.as_str(), new_value.as_str()));
    }

    Ok(rewritten)
}

/// Attribute rewriting rules, in priority order:
/// namespace declarations pass through; values under the original base move
/// to the proxy base; values already under the proxy base stay; bare
/// relative `href` values are anchored under the proxy path.
fn rewrite_attribute(
    key: &str,
    local_name: &[u8],
    value: &str,
    original_base: &str,
    proxy_base: &str,
    proxy_path: &str,
) -> String {
    if key == "xmlns" || key.starts_with("xmlns:") {
        return value.to_string();
    }

    // Covers both the xml:base attribute and ordinary link attributes
    if let Some(rest) = value.strip_prefix(original_base) {
        return format!("{proxy_base}{rest}");
    }

    if value.starts_with(proxy_base) {
        return value.to_string();
    }

    if local_name == b"href" && !value.starts_with("http") && !value.starts_with('/') {
        let prefixed = format!("{proxy_path}/{value}");
        return prefixed.trim_end_matches('/').to_string();
    }

    value.to_string()
}

/// Leaf text whose content begins with the original base is moved to the
/// proxy base; any proxy-host occurrence left in the tail (OData `<id>`
/// values echo the request host) is normalized to the proxy base as well.
fn rewrite_text_node(
    text: &str,
    original_base: &str,
    proxy_base: &str,
    proxy_host: &str,
) -> String {
    match text.strip_prefix(original_base) {
        Some(tail) => {
            let tail = tail.replace(proxy_host, proxy_base);
            format!("{proxy_base}{tail}")
        }
        None => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Textual fallback
// ---------------------------------------------------------------------------

/// Case-insensitive replacement of the original base, optionally followed
/// by a path suffix, across an opaque text body. Matches already sitting on
/// the proxy base are left alone so a second pass is a no-op.
fn rewrite_plain_text(body: &str, original_base: &str, proxy_base: &str) -> String {
    let pattern = format!(r#"(?i){}(/[^"'\s]*)?"#, regex::escape(original_base));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return body.to_string(),
    };

    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    for caps in re.captures_iter(body) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&body[last..whole.start()]);

        if body[whole.start()..].starts_with(proxy_base) {
            out.push_str(whole.as_str());
        } else {
            let suffix = caps.get(1).map(|s| s.as_str()).unwrap_or("");
            out.push_str(proxy_base);
            out.push_str(suffix);
        }
        last = whole.end();
    }
    out.push_str(&body[last..]);
    out
}
