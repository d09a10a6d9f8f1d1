//! Hostname sniffing for transparent listeners.
//!
//! Reads the first chunk of a connection and extracts either the SNI from a
//! TLS ClientHello or the Host header from a plaintext HTTP request, without
//! terminating anything. Every length field is bounds checked; input that
//! does not parse is treated as carrying no hostname.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::debug;

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

const TLS_HANDSHAKE: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

/// Bytes read while sniffing plus the hostname they carried, if any.
/// The caller must replay `buffered` to the backend before splicing.
#[derive(Debug, Default)]
pub struct Sniffed {
    pub buffered: Vec<u8>,
    pub hostname: Option<String>,
}

/// Validate and normalize a hostname taken from SNI or a Host header.
///
/// Strips a port and a trailing dot, lowercases, and rejects anything that
/// is not made of DNS-safe characters.
pub fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();

    // [v6]:port or a bare v6 literal
    if let Some(rest) = raw.strip_prefix('[') {
        let inner = &rest[..rest.find(']')?];
        inner.parse::<std::net::Ipv6Addr>().ok()?;
        return Some(inner.to_ascii_lowercase());
    }
    if raw.matches(':').count() > 1 {
        raw.parse::<std::net::Ipv6Addr>().ok()?;
        return Some(raw.to_ascii_lowercase());
    }

    let host = raw.split(':').next()?;
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return None;
    }

    Some(host.to_ascii_lowercase())
}

/// Bounds-checked big-endian reader
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.bytes(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.bytes(3)?;
        Some(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.bytes(n).map(|_| ())
    }
}

/// Extract the SNI hostname from a buffer starting with a TLS record.
///
/// Record layout: type(1) version(2) length(2), then the handshake header
/// type(1) length(3), then the ClientHello body: version(2) random(32)
/// session_id<1> cipher_suites<2> compression<1> extensions<2>.
pub fn parse_client_hello_sni(data: &[u8]) -> Option<String> {
    let mut record = Cursor::new(data);
    if record.u8()? != TLS_HANDSHAKE {
        return None;
    }
    record.skip(2)?;
    let record_len = record.u16()? as usize;
    let available = data.len().saturating_sub(5).min(record_len);
    let mut hs = Cursor::new(record.bytes(available)?);

    if hs.u8()? != CLIENT_HELLO {
        return None;
    }
    let hello_len = hs.u24()?;
    let remaining = hs.data.len() - hs.pos;
    let mut hello = Cursor::new(hs.bytes(hello_len.min(remaining))?);

    hello.skip(2 + 32)?;
    let session_id_len = hello.u8()? as usize;
    hello.skip(session_id_len)?;
    let suites_len = hello.u16()? as usize;
    hello.skip(suites_len)?;
    let compression_len = hello.u8()? as usize;
    hello.skip(compression_len)?;

    let extensions_len = hello.u16()? as usize;
    let mut extensions = Cursor::new(hello.bytes(extensions_len)?);

    while let Some(ext_type) = extensions.u16() {
        let ext_len = extensions.u16()? as usize;
        let body = extensions.bytes(ext_len)?;
        if ext_type == EXT_SERVER_NAME {
            return parse_server_name_extension(body);
        }
    }

    None
}

fn parse_server_name_extension(body: &[u8]) -> Option<String> {
    let mut ext = Cursor::new(body);
    let list_len = ext.u16()? as usize;
    let mut list = Cursor::new(ext.bytes(list_len)?);

    while let Some(name_type) = list.u8() {
        let name_len = list.u16()? as usize;
        let name = list.bytes(name_len)?;
        if name_type == NAME_TYPE_HOST {
            let name = std::str::from_utf8(name).ok()?;
            return normalize_host(name);
        }
    }

    None
}

/// Extract the Host header from the start of a plaintext HTTP/1.x request
pub fn parse_http_host(data: &[u8]) -> Option<String> {
    let head_end = find_subsequence(data, b"\r\n\r\n").unwrap_or(data.len());
    let head = String::from_utf8_lossy(&data[..head_end]);

    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    if !request_line.contains(" HTTP/1.") {
        return None;
    }

    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                return normalize_host(value);
            }
        }
    }
    None
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Whether `data` holds enough bytes to decide
fn is_complete(data: &[u8]) -> bool {
    if data.first() == Some(&TLS_HANDSHAKE) {
        if data.len() < 5 {
            return false;
        }
        let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
        data.len() >= 5 + record_len
    } else {
        find_subsequence(data, b"\r\n\r\n").is_some()
    }
}

fn extract(data: &[u8]) -> Option<String> {
    if data.first() == Some(&TLS_HANDSHAKE) {
        parse_client_hello_sni(data)
    } else {
        parse_http_host(data)
    }
}

/// Read from `stream` until a hostname can be extracted, the peer stops
/// sending, `max_bytes` is buffered, or `timeout` elapses.
pub async fn sniff<R>(stream: &mut R, timeout: Duration, max_bytes: usize) -> std::io::Result<Sniffed>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut buffered = Vec::with_capacity(max_bytes.min(4096));
    let mut chunk = vec![0u8; 4096];

    while buffered.len() < max_bytes {
        let want = (max_bytes - buffered.len()).min(chunk.len());
        match tokio::time::timeout_at(deadline, stream.read(&mut chunk[..want])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                buffered.extend_from_slice(&chunk[..n]);
                if is_complete(&buffered) {
                    break;
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(bytes = buffered.len(), "Sniff timeout");
                break;
            }
        }
    }

    let hostname = extract(&buffered);
    Ok(Sniffed { buffered, hostname })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal TLS 1.2 ClientHello carrying `host` as SNI
    pub(crate) fn client_hello(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni.push(0x00);
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        let mut extensions = Vec::new();
        // an unrelated extension first
        extensions.extend_from_slice(&[0x00, 0x0b, 0x00, 0x02, 0x01, 0x00]);
        extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni);

        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]);
        hello.extend_from_slice(&[0u8; 32]);
        hello.push(0); // session id
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        hello.extend_from_slice(&[0x01, 0x00]);
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![CLIENT_HELLO];
        let len = hello.len();
        handshake.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_parse_sni() {
        let data = client_hello("App.Example.COM");
        assert_eq!(
            parse_client_hello_sni(&data),
            Some("app.example.com".to_string())
        );
    }

    #[test]
    fn test_truncated_client_hello_is_no_sni() {
        let data = client_hello("app.example.com");
        for cut in [0, 1, 5, 9, 40, data.len() - 3] {
            assert_eq!(parse_client_hello_sni(&data[..cut]), None, "cut at {}", cut);
        }
    }

    #[test]
    fn test_lying_length_fields_do_not_panic() {
        let mut data = client_hello("app.example.com");
        // claim a huge extensions block
        let ext_len_pos = 5 + 4 + 2 + 32 + 1 + 4 + 2;
        data[ext_len_pos] = 0xff;
        data[ext_len_pos + 1] = 0xff;
        assert_eq!(parse_client_hello_sni(&data), None);

        let garbage: Vec<u8> = (0..512).map(|i| (i * 37 % 251) as u8).collect();
        let mut tls_garbage = vec![TLS_HANDSHAKE, 3, 1, 0xff, 0xff, CLIENT_HELLO];
        tls_garbage.extend_from_slice(&garbage);
        assert_eq!(parse_client_hello_sni(&tls_garbage), None);
    }

    #[test]
    fn test_not_tls() {
        assert_eq!(parse_client_hello_sni(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_parse_http_host() {
        let req = b"GET /index.html HTTP/1.1\r\nUser-Agent: x\r\nhost: Shop.Example.com:8080\r\n\r\n";
        assert_eq!(parse_http_host(req), Some("shop.example.com".to_string()));

        let partial = b"GET / HTTP/1.1\r\nHost: partial.example.com\r\n";
        assert_eq!(
            parse_http_host(partial),
            Some("partial.example.com".to_string())
        );

        assert_eq!(parse_http_host(b"SSH-2.0-OpenSSH_9.0\r\n"), None);
        assert_eq!(parse_http_host(b"GET / HTTP/1.1\r\n\r\n"), None);
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM"), Some("example.com".into()));
        assert_eq!(normalize_host("example.com:443"), Some("example.com".into()));
        assert_eq!(normalize_host("example.com."), Some("example.com".into()));
        assert_eq!(normalize_host("[::1]:8443"), Some("::1".into()));
        assert_eq!(normalize_host("bad host"), None);
        assert_eq!(normalize_host("evil\r\nhost"), None);
        assert_eq!(normalize_host(""), None);
        assert_eq!(normalize_host(&"a".repeat(254)), None);
    }

    #[tokio::test]
    async fn test_sniff_reads_until_complete() {
        let hello = client_hello("sniffed.example.com");
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let payload = hello.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            // split across writes to exercise reassembly
            let (a, b) = payload.split_at(10);
            client.write_all(a).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b).await.unwrap();
            // keep the pipe open until the reader is done
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let sniffed = sniff(&mut server, Duration::from_millis(800), 16 * 1024)
            .await
            .unwrap();
        assert_eq!(sniffed.hostname.as_deref(), Some("sniffed.example.com"));
        assert_eq!(sniffed.buffered, hello);
    }

    #[tokio::test]
    async fn test_sniff_times_out_with_partial_data() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(b"\x16\x03\x01").await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let sniffed = sniff(&mut server, Duration::from_millis(100), 16 * 1024)
            .await
            .unwrap();
        assert_eq!(sniffed.hostname, None);
        assert_eq!(sniffed.buffered, b"\x16\x03\x01");
    }
}
