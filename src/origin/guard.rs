//! Target validation: scheme check and private-network blocking.

use std::net::{IpAddr, Ipv4Addr};

use url::{Host, Url};
use vodrelay_common::{Error, Result};

/// Parse `raw` and reject targets the proxy must not fetch.
///
/// Non-http(s) URLs are invalid input. Unless `allow_private` is set, hosts
/// named `localhost` or resolving to loopback or private IPv4 ranges are
/// forbidden. Hosts that fail to resolve are let through so the fetch
/// itself reports the origin as unreachable.
pub async fn validate_target(raw: &str, allow_private: bool) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::invalid_input(format!("invalid url '{raw}': {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::invalid_input(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    let host = url
        .host()
        .ok_or_else(|| Error::invalid_input("url has no host"))?;

    if allow_private {
        return Ok(url);
    }

    let blocked = match host {
        Host::Domain(name) => {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            if name == "localhost" || name.ends_with(".localhost") {
                true
            } else {
                let port = url.port_or_known_default().unwrap_or(80);
                match tokio::net::lookup_host((name.as_str(), port)).await {
                    Ok(addrs) => addrs.into_iter().any(|addr| is_blocked_ip(addr.ip())),
                    Err(e) => {
                        tracing::debug!(host = %name, error = %e, "Target host did not resolve");
                        false
                    }
                }
            }
        }
        Host::Ipv4(ip) => is_blocked_ipv4(ip),
        Host::Ipv6(ip) => is_blocked_ip(IpAddr::V6(ip)),
    };

    if blocked {
        tracing::warn!(url = %url, "Blocked request to private network target");
        return Err(Error::Forbidden(format!(
            "target host '{}' is on a private network",
            url.host_str().unwrap_or_default()
        )));
    }

    Ok(url)
}

pub(crate) fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(is_blocked_ipv4)
        }
    }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    // 10/8, 172.16/12, 192.168/16, 127/8, 169.254/16, 0.0.0.0
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}
