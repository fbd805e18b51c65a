//! The HTTP `CONNECT` front-end of the forward path.
//!
//! Only the request head is read.  The request target is an authority followed by a query,
//! `host:port?nodeId=<id>[&nodeId=<id>...]`, which generic URI parsers reject, so the head
//! is parsed with `httparse` directly.

use bytes::BytesMut;
use http::StatusCode;
use snafu::{ensure, ResultExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    BufferNotEmptySnafu, HeadTooLargeSnafu, InvalidNodeIdSnafu, InvalidTargetSnafu,
    InvalidUrlSnafu, MalformedRequestSnafu, MissingNodeIdSnafu, ProxyError, ReadRequestSnafu,
    UnexpectedEofSnafu,
};
use crate::{
    address::{Address, Host},
    defaults::MAX_REQUEST_HEAD_SIZE,
    key::NodeId,
};

const MAX_HEADERS: usize = 32;

/// The parts of a request head the proxy looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectRequest {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) authorization: Option<String>,
}

/// Reads a request head.
///
/// The client must wait for the response before sending anything else, bytes following
/// the head are rejected.
pub(crate) async fn read_request<R>(reader: &mut R) -> Result<ConnectRequest, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let read = reader.read_buf(&mut buf).await.context(ReadRequestSnafu)?;
        ensure!(read > 0, UnexpectedEofSnafu);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf).context(MalformedRequestSnafu)? {
            httparse::Status::Complete(len) => {
                ensure!(
                    len == buf.len(),
                    BufferNotEmptySnafu {
                        len: buf.len() - len
                    }
                );
                let authorization = request
                    .headers
                    .iter()
                    .find(|header| header.name.eq_ignore_ascii_case("proxy-authorization"))
                    .and_then(|header| std::str::from_utf8(header.value).ok())
                    .map(str::to_string);
                return Ok(ConnectRequest {
                    method: request.method.unwrap_or_default().to_string(),
                    target: request.path.unwrap_or_default().to_string(),
                    authorization,
                });
            }
            httparse::Status::Partial => {
                ensure!(buf.len() < MAX_REQUEST_HEAD_SIZE, HeadTooLargeSnafu);
            }
        }
    }
}

/// Parses `host:port?nodeId=<id>[&nodeId=<id>...]`.
pub(crate) fn parse_target(target: &str) -> Result<(Address, Vec<NodeId>), ProxyError> {
    let (authority, query) = target.split_once('?').unwrap_or((target, ""));
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| InvalidUrlSnafu { url: target }.build())?;
    let host: Host = host
        .parse()
        .map_err(|_| InvalidUrlSnafu { url: target }.build())?;
    let port: u16 = port
        .parse()
        .map_err(|_| InvalidUrlSnafu { url: target }.build())?;
    let address = Address::target(host, port).context(InvalidTargetSnafu)?;

    let node_ids = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == "nodeId")
        .map(|(_, value)| value.parse::<NodeId>())
        .collect::<Result<Vec<_>, _>>()
        .context(InvalidNodeIdSnafu)?;
    ensure!(!node_ids.is_empty(), MissingNodeIdSnafu);
    Ok((address, node_ids))
}

/// Checks a `Proxy-Authorization` header value against the token.
///
/// Accepts `Basic base64(":" + token)`, with any user name, and `Bearer token`.
pub(crate) fn is_authorized(authorization: Option<&str>, token: &str) -> bool {
    let Some((scheme, credentials)) = authorization.and_then(|value| value.trim().split_once(' '))
    else {
        return false;
    };
    let credentials = credentials.trim();
    if scheme.eq_ignore_ascii_case("basic") {
        data_encoding::BASE64
            .decode(credentials.as_bytes())
            .ok()
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|decoded| {
                decoded
                    .split_once(':')
                    .map(|(_user, password)| password == token)
            })
            .unwrap_or(false)
    } else if scheme.eq_ignore_ascii_case("bearer") {
        credentials == token
    } else {
        false
    }
}

/// The reason phrase sent with `status`.
pub(crate) fn reason_phrase(status: StatusCode) -> &'static str {
    match status.as_u16() {
        200 => "Connection Established",
        524 => "A Timeout Occurred",
        526 => "Invalid SSL Certificate",
        _ => status.canonical_reason().unwrap_or("Unknown"),
    }
}

/// Encodes a response head without body.
pub(crate) fn response(status: StatusCode) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\n\r\n",
        status.as_u16(),
        reason_phrase(status)
    )
    .into_bytes()
}

/// Writes an error response and closes the write half.
pub(crate) async fn write_response<W>(writer: &mut W, status: StatusCode) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response(status)).await?;
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CertifiedNode;

    #[tokio::test]
    async fn test_read_request() {
        let mut head: &[u8] = b"CONNECT 127.0.0.1:80?nodeId=x HTTP/1.1\r\nHost: 127.0.0.1:80\r\nProxy-Authorization: Bearer abc\r\n\r\n";
        let request = read_request(&mut head).await.unwrap();
        assert_eq!(request.method, "CONNECT");
        assert_eq!(request.target, "127.0.0.1:80?nodeId=x");
        assert_eq!(request.authorization.as_deref(), Some("Bearer abc"));
    }

    #[tokio::test]
    async fn test_read_request_rejects_pipelined_bytes() {
        let mut head: &[u8] = b"CONNECT 127.0.0.1:80 HTTP/1.1\r\n\r\nhello";
        let err = read_request(&mut head).await.unwrap_err();
        assert!(matches!(err, ProxyError::BufferNotEmpty { len: 5, .. }));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_read_request_eof() {
        let mut head: &[u8] = b"CONNECT 127.0.0.1:80 HT";
        let err = read_request(&mut head).await.unwrap_err();
        assert!(matches!(err, ProxyError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_parse_target() {
        let a = CertifiedNode::self_signed().node_id;
        let b = CertifiedNode::self_signed().node_id;
        let target = format!("10.0.0.1:4000?nodeId={a}&other=1&nodeId={b}");
        let (address, node_ids) = parse_target(&target).unwrap();
        assert_eq!(address.to_string(), "10.0.0.1:4000");
        assert_eq!(node_ids, vec![a, b]);

        let (address, _) = parse_target(&format!("[::1]:4000?nodeId={a}")).unwrap();
        assert_eq!(address.to_string(), "[::1]:4000");
    }

    #[test]
    fn test_parse_target_errors() {
        let a = CertifiedNode::self_signed().node_id;
        assert!(matches!(
            parse_target("10.0.0.1:4000"),
            Err(ProxyError::MissingNodeId { .. })
        ));
        assert!(matches!(
            parse_target("10.0.0.1:4000?nodeId=garbage"),
            Err(ProxyError::InvalidNodeId { .. })
        ));
        assert!(matches!(
            parse_target(&format!("example.com:4000?nodeId={a}")),
            Err(ProxyError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_target(&format!("0.0.0.0:4000?nodeId={a}")),
            Err(ProxyError::InvalidTarget { .. })
        ));
        assert!(matches!(
            parse_target(&format!("10.0.0.1:99999?nodeId={a}")),
            Err(ProxyError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_is_authorized() {
        let basic = format!("Basic {}", data_encoding::BASE64.encode(b":secret"));
        assert!(is_authorized(Some(&basic), "secret"));
        assert!(is_authorized(Some("Bearer secret"), "secret"));
        assert!(is_authorized(Some("bearer  secret "), "secret"));
        assert!(!is_authorized(Some("Bearer wrong"), "secret"));
        assert!(!is_authorized(Some("Digest secret"), "secret"));
        assert!(!is_authorized(Some("Basic !!!"), "secret"));
        assert!(!is_authorized(None, "secret"));
    }

    #[test]
    fn test_response() {
        assert_eq!(
            response(StatusCode::OK),
            b"HTTP/1.1 200 Connection Established\r\n\r\n"
        );
        let status = StatusCode::from_u16(526).unwrap();
        assert_eq!(
            response(status),
            b"HTTP/1.1 526 Invalid SSL Certificate\r\n\r\n"
        );
        assert_eq!(
            response(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n"
        );
    }
}
