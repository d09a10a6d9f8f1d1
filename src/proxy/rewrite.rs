//! Backend host references in response headers rewritten to the public host

use crate::listener::Target;
use std::net::IpAddr;

/// `https://host[:port]`, with the port left out when it is 443
pub fn https_origin(host: &str, port: u16) -> String {
    let host = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]", host),
        _ => host.to_string(),
    };
    if port == 443 {
        format!("https://{}", host)
    } else {
        format!("https://{}:{}", host, port)
    }
}

/// Rewrite an absolute `Location` that points at the backend so it points
/// at the public host on `public_port` instead. Relative and foreign
/// locations are left alone (`None`).
pub fn rewrite_location(value: &str, target: &Target, public_host: &str, public_port: u16) -> Option<String> {
    let rest = value
        .strip_prefix("http://")
        .or_else(|| value.strip_prefix("https://"))?;

    let (authority, path) = match rest.find(['/', '?', '#']) {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    let host = strip_port(authority);
    if !host.eq_ignore_ascii_case(&target.host) && !authority.eq_ignore_ascii_case(&target.addr()) {
        return None;
    }

    let path = if path.is_empty() { "/" } else { path };
    Some(format!("{}{}", https_origin(public_host, public_port), path))
}

/// Replace a `Domain=` attribute naming the backend host with the public host
pub fn rewrite_set_cookie(value: &str, backend_host: &str, public_host: &str) -> Option<String> {
    let mut changed = false;
    let parts: Vec<String> = value
        .split(';')
        .map(|part| {
            let trimmed = part.trim();
            if let Some((name, domain)) = trimmed.split_once('=') {
                if name.trim().eq_ignore_ascii_case("domain")
                    && domain.trim().trim_start_matches('.').eq_ignore_ascii_case(backend_host)
                {
                    changed = true;
                    return format!(" Domain={}", public_host);
                }
            }
            part.to_string()
        })
        .collect();

    changed.then(|| parts.join(";"))
}

fn strip_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}
