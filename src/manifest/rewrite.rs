//! M3U8 link rewriting.

use url::Url;
use vodrelay_common::encoding::encode_component;

/// What every rewritten link must carry back to the proxy.
#[derive(Debug, Clone)]
pub struct LinkContext {
    /// Scheme, host and port of this proxy as seen by the client, no trailing slash.
    pub proxy_base: String,
    pub auth_token: Option<String>,
    /// The `headers` parameter exactly as the client sent it (already query-decoded).
    pub headers_param: Option<String>,
}

impl LinkContext {
    /// `<base>/proxy?url=<enc>&auth=<enc>[&headers=<enc>]`
    pub fn proxy_url(&self, target: &str) -> String {
        let mut link = format!(
            "{}/proxy?url={}&auth={}",
            self.proxy_base,
            encode_component(target),
            encode_component(self.auth_token.as_deref().unwrap_or_default())
        );
        if let Some(headers) = self.headers_param.as_deref().filter(|h| !h.is_empty()) {
            link.push_str("&headers=");
            link.push_str(&encode_component(headers));
        }
        link
    }
}

/// Rewrite every URI line of `text` into a proxy link.
///
/// Comment and blank lines are kept verbatim. URI lines are trimmed and
/// resolved against `manifest_url`; lines that cannot be resolved are kept
/// as they are. The output has exactly as many lines as the input.
pub fn rewrite_manifest(text: &str, manifest_url: &Url, link: &LinkContext) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
            continue;
        }

        match manifest_url.join(trimmed) {
            Ok(absolute) if matches!(absolute.scheme(), "http" | "https") => {
                out.push_str(&link.proxy_url(absolute.as_str()));
                if line.ends_with('\r') {
                    out.push('\r');
                }
            }
            _ => {
                tracing::debug!(line = trimmed, "Keeping unresolvable manifest line");
                out.push_str(line);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use percent_encoding::percent_decode_str;

    fn ctx() -> LinkContext {
        LinkContext {
            proxy_base: "http://proxy.local:5757".into(),
            auth_token: Some("s3cret".into()),
            headers_param: None,
        }
    }

    fn url_param(link: &str) -> String {
        let query = link.split_once('?').unwrap().1;
        let raw = query
            .split('&')
            .find_map(|kv| kv.strip_prefix("url="))
            .unwrap();
        percent_decode_str(raw).decode_utf8().unwrap().into_owned()
    }

    #[test]
    fn rewrites_relative_segment() {
        let base = Url::parse("http://o.example/a/index.m3u8").unwrap();
        let out = rewrite_manifest("#EXTM3U\n#EXTINF:10,\nseg1.ts\n", &base, &ctx());
        let lines: Vec<&str> = out.split('\n').collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXTINF:10,");
        assert!(lines[2].starts_with("http://proxy.local:5757/proxy?url="));
        assert!(lines[2].ends_with("&auth=s3cret"));
        assert_eq!(url_param(lines[2]), "http://o.example/a/seg1.ts");
        assert_eq!(lines[3], "");
    }

    #[test]
    fn absolute_and_root_relative_lines() {
        let base = Url::parse("https://o.example/a/b/index.m3u8").unwrap();
        let text = "https://cdn.example/x.ts?sig=a&b=c\n/root/y.ts\n../up/z.m3u8";
        let out = rewrite_manifest(text, &base, &ctx());
        let decoded: Vec<String> = out.lines().map(url_param).collect();
        assert_eq!(
            decoded,
            vec![
                "https://cdn.example/x.ts?sig=a&b=c",
                "https://o.example/root/y.ts",
                "https://o.example/a/up/z.m3u8",
            ]
        );
    }

    #[test]
    fn preserves_line_count_and_crlf() {
        let base = Url::parse("http://o.example/index.m3u8").unwrap();
        let text = "#EXTM3U\r\n\r\n#EXT-X-KEY:METHOD=NONE\r\n  seg.ts  \r\n";
        let out = rewrite_manifest(text, &base, &ctx());
        assert_eq!(out.split('\n').count(), text.split('\n').count());
        let lines: Vec<&str> = out.split('\n').collect();
        assert_eq!(lines[0], "#EXTM3U\r");
        assert_eq!(lines[2], "#EXT-X-KEY:METHOD=NONE\r");
        assert!(lines[3].ends_with('\r'));
    }

    #[test]
    fn unresolvable_lines_are_kept() {
        let base = Url::parse("http://o.example/index.m3u8").unwrap();
        let out = rewrite_manifest("mailto:someone@example.com", &base, &ctx());
        assert_eq!(out, "mailto:someone@example.com");
    }

    #[test]
    fn headers_param_is_appended_encoded() {
        let link = LinkContext {
            headers_param: Some(r#"{"Referer":"http://r/"}"#.into()),
            ..ctx()
        };
        let out = link.proxy_url("http://o.example/seg.ts");
        assert!(out.contains("&headers=%7B%22Referer%22%3A%22http%3A%2F%2Fr%2F%22%7D"));
    }
}
