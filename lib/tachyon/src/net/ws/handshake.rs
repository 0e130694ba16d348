//! The HTTP/1.1 upgrade exchange that precedes WebSocket framing, done by hand so malformed
//! requests can be told apart from transport errors.
use crate::net::shared::{fatal, ErrorType, NetworkError, NetworkResult};
use std::str;
use tungstenite::handshake::derive_accept_key;

/// Upper bound on an upgrade request or response head.
pub const MAX_REQUEST_SIZE: usize = 4096;

/// Returns the length of the header block (terminator included), once it is complete.
pub fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n").map(|at| at + 4)
}

/// Validates an upgrade request head and returns the client's `Sec-WebSocket-Key`.
pub fn parse_request(head: &[u8]) -> NetworkResult<String> {
    let text = str::from_utf8(head).map_err(|_| malformed())?;
    let mut lines = text.split("\r\n");

    let mut request_line = lines.next().ok_or_else(malformed)?.split_whitespace();
    match (request_line.next(), request_line.next(), request_line.next()) {
        (Some("GET"), Some(_), Some("HTTP/1.1")) => (),
        _ => return fatal(ErrorType::MalformedHandshake),
    }

    let mut key = None;
    let mut upgrade = false;
    let mut connection = false;
    let mut version = false;

    for (name, value) in headers(lines)? {
        if name.eq_ignore_ascii_case("upgrade") {
            upgrade = value.eq_ignore_ascii_case("websocket");
        } else if name.eq_ignore_ascii_case("connection") {
            connection = value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        } else if name.eq_ignore_ascii_case("sec-websocket-version") {
            version = value == "13";
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.to_string());
        }
    }

    match key {
        Some(key) if upgrade && connection && version && !key.is_empty() => Ok(key),
        _ => fatal(ErrorType::MalformedHandshake),
    }
}

/// The `101 Switching Protocols` response to a request carrying `key`.
pub fn accept_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key.as_bytes())
    )
}

/// Upgrade request sent by the client.
pub fn client_request(host: &str, key: &str) -> String {
    format!(
        "GET / HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        host, key
    )
}

/// Checks the server accepted the upgrade for our `key`.
pub fn parse_response(head: &[u8], key: &str) -> NetworkResult<()> {
    let text = str::from_utf8(head).map_err(|_| malformed())?;
    let mut lines = text.split("\r\n");

    let mut status_line = lines.next().ok_or_else(malformed)?.split_whitespace();
    if (status_line.next(), status_line.next()) != (Some("HTTP/1.1"), Some("101")) {
        return fatal(ErrorType::MalformedHandshake);
    }

    let expected = derive_accept_key(key.as_bytes());
    let accepted = headers(lines)?
        .into_iter()
        .any(|(name, value)| name.eq_ignore_ascii_case("sec-websocket-accept") && value == expected);

    if !accepted {
        return fatal(ErrorType::MalformedHandshake);
    }

    Ok(())
}

fn headers<'a, I: Iterator<Item = &'a str>>(lines: I) -> NetworkResult<Vec<(&'a str, &'a str)>> {
    let mut headers = Vec::new();

    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line.split_once(':').ok_or_else(malformed)?;
        headers.push((name.trim(), value.trim()));
    }

    Ok(headers)
}

#[inline]
fn malformed() -> NetworkError {
    NetworkError::Fatal(ErrorType::MalformedHandshake)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    #[test]
    fn test_find_terminator() {
        assert_eq!(find_terminator(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
        assert_eq!(find_terminator(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
    }

    #[test]
    fn test_client_request_accepted() {
        let request = client_request("localhost", KEY);
        assert_eq!(parse_request(request.as_bytes()).unwrap(), KEY);
    }

    #[test]
    fn test_accept_key() {
        let response = accept_response(KEY);

        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(parse_response(response.as_bytes(), KEY).is_ok());
        assert!(parse_response(response.as_bytes(), "b3RoZXIga2V5IGVudGlyZWx5").is_err());
    }

    #[test]
    fn test_headers_case_insensitive() {
        let request = "GET /chat HTTP/1.1\r\nhost: x\r\nUPGRADE: WebSocket\r\nconnection: keep-alive, Upgrade\r\n\
                       sec-websocket-key: abc\r\nsec-websocket-version: 13\r\n\r\n";

        assert_eq!(parse_request(request.as_bytes()).unwrap(), "abc");
    }

    #[test]
    fn test_malformed_requests() {
        let cases: [&[u8]; 5] = [
            b"POST / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n",
            b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n",
            b"GET / HTTP/1.1\r\nbroken header\r\n\r\n",
            b"\xFF\xFE\r\n\r\n",
            b"",
        ];

        for case in cases.iter() {
            assert_eq!(
                parse_request(case),
                Err(NetworkError::Fatal(ErrorType::MalformedHandshake))
            );
        }
    }

    #[test]
    fn test_rejected_response() {
        let response = "HTTP/1.1 400 Bad Request\r\n\r\n";
        assert!(parse_response(response.as_bytes(), KEY).is_err());
    }
}
