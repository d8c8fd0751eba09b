use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::VerdictCache;
use crate::cert::{interception_server_config, CertificateProvider};
use crate::config::Config;
use crate::corpus::CorpusMatch;
use crate::error::{ProxyError, ScanError};
use crate::scan::Scanner;
use crate::site::{CanonicalSite, SuffixList};
use crate::warning;

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// The intercepting forward proxy. Plain HTTP requests are replayed
/// upstream and classified from the buffered response; CONNECT tunnels are
/// re-terminated with a dynamically issued certificate so the first
/// decrypted request can be classified before traffic is spliced through.
pub struct ProxyServer {
    config: Arc<Config>,
    cache: Arc<VerdictCache>,
    scanner: Arc<Scanner>,
    suffixes: Arc<SuffixList>,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    upstream: reqwest::Client,
    admission: Arc<Semaphore>,
}

impl ProxyServer {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<VerdictCache>,
        scanner: Arc<Scanner>,
        suffixes: Arc<SuffixList>,
        certificates: Arc<dyn CertificateProvider>,
    ) -> anyhow::Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        let native_certs =
            rustls_native_certs::load_native_certs().context("loading native root certificates")?;
        for cert in native_certs {
            let _ = root_store.add(&rustls::Certificate(cert.0));
        }
        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let upstream = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeouts.fetch())
            .build()
            .context("building upstream HTTP client")?;

        Ok(Self {
            acceptor: TlsAcceptor::from(interception_server_config(certificates)),
            connector: TlsConnector::from(Arc::new(client_config)),
            admission: Arc::new(Semaphore::new(config.max_connections)),
            config,
            cache,
            scanner,
            suffixes,
            upstream,
        })
    }

    /// Binds the listener and serves forever.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port)).await?;
        info!(port = self.config.listen_port, "proxy listening");
        self.serve(listener).await
    }

    /// Accept loop, one task per connection. Neither a failing connection
    /// nor a transient accept error (fd exhaustion, aborted handshake) takes
    /// down the listener.
    async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };
            let Ok(permit) = Arc::clone(&self.admission).acquire_owned().await else {
                break;
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = server.handle_connection(stream).await {
                    debug!(%peer, error = %e, "connection closed with error");
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), ProxyError> {
        let (head, buffered) =
            read_request_head(&mut stream, self.config.timeouts.head_read()).await?;

        if head.method == "CONNECT" {
            self.handle_connect(stream, &head).await
        } else {
            self.handle_plain(stream, head, buffered).await
        }
    }

    /// Plain-HTTP path: replay the request upstream, buffer the response,
    /// classify it when it can contain HTML, then block or forward.
    async fn handle_plain(
        &self,
        mut stream: TcpStream,
        head: RequestHead,
        mut buffered: Vec<u8>,
    ) -> Result<(), ProxyError> {
        let Ok(target) = Url::parse(&head.target) else {
            stream
                .write_all(&warning::error_response(
                    400,
                    "Bad Request",
                    "Proxy requests must use an absolute URL",
                ))
                .await?;
            return Ok(());
        };
        let Some(host) = target.host_str().map(str::to_string) else {
            stream
                .write_all(&warning::error_response(
                    400,
                    "Bad Request",
                    "Request URL has no host",
                ))
                .await?;
            return Ok(());
        };

        let body = self.read_plain_body(&mut stream, &head, &mut buffered).await?;
        let response = match self.replay_upstream(&head, &target, body).await {
            Ok(response) => response,
            Err(e) => {
                warn!(target = %target, error = %e, "upstream request failed");
                stream
                    .write_all(&warning::error_response(
                        503,
                        "Service Unavailable",
                        "Error processing request",
                    ))
                    .await?;
                return Ok(());
            }
        };

        let site = match CanonicalSite::resolve(&self.suffixes, &host, target.path()) {
            Ok(site) => site,
            Err(_) => {
                stream
                    .write_all(&warning::error_response(
                        500,
                        "Internal Server Error",
                        "Unprocessable domain name",
                    ))
                    .await?;
                return Ok(());
            }
        };
        let key = site.key();

        let verdict = match self.cache.get(&key) {
            Some(phishing) => Some((phishing, None)),
            None if scannable_response(&response) => {
                match self
                    .scanner
                    .classify("http://", &site, Some(&response.body))
                    .await
                {
                    Ok(v) => Some((v.phishing, v.matched)),
                    Err(e) => {
                        error!(site = %key, error = %e, "scan failed");
                        stream
                            .write_all(&warning::error_response(
                                500,
                                "Internal Server Error",
                                "Error while scanning webpage",
                            ))
                            .await?;
                        return Ok(());
                    }
                }
            }
            // Non-scannable content with no cached verdict passes through.
            None => None,
        };

        if let Some((true, matched)) = verdict {
            self.block(&mut stream, &key, matched.as_ref()).await?;
            return Ok(());
        }

        stream.write_all(&response.serialize()).await?;
        Ok(())
    }

    async fn read_plain_body(
        &self,
        stream: &mut TcpStream,
        head: &RequestHead,
        buffered: &mut Vec<u8>,
    ) -> Result<Vec<u8>, ProxyError> {
        let chunked = head
            .header("transfer-encoding")
            .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            // The body is re-framed with Content-Length on replay.
            return read_chunked_body(stream, std::mem::take(buffered)).await;
        }

        let content_length: usize = head
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = std::mem::take(buffered);
        while body.len() < content_length {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(content_length);
        Ok(body)
    }

    async fn replay_upstream(
        &self,
        head: &RequestHead,
        target: &Url,
        body: Vec<u8>,
    ) -> Result<BufferedResponse, ProxyError> {
        let method = reqwest::Method::from_bytes(head.method.as_bytes())
            .map_err(|_| ProxyError::BadRequest)?;

        let mut request = self.upstream.request(method, target.clone());
        for (name, value) in &head.headers {
            if strips_request_header(name) {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        // The client strips Content-Encoding when it decompresses, so the
        // header surviving here means the body is still compressed.
        let encoded = response
            .headers()
            .contains_key(reqwest::header::CONTENT_ENCODING);
        let headers: Vec<(String, Vec<u8>)> = response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?
            .to_vec();

        Ok(BufferedResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            content_type,
            encoded,
            headers,
            body,
        })
    }

    /// CONNECT path: dial the real upstream over TLS, take over the client
    /// socket, re-terminate TLS, classify the first decrypted GET, then
    /// either block in-tunnel or splice both sides transparently.
    async fn handle_connect(
        &self,
        mut stream: TcpStream,
        head: &RequestHead,
    ) -> Result<(), ProxyError> {
        let (host, port) = parse_connect_target(&head.target);

        let upstream = match self.dial_upstream(&host, port).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(host = %host, port, error = %e, "CONNECT upstream dial failed");
                stream
                    .write_all(&warning::error_response(
                        503,
                        "Service Unavailable",
                        "Unable to reach upstream server",
                    ))
                    .await?;
                return Ok(());
            }
        };

        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;

        // Protocol takeover: the raw socket now speaks TLS with our
        // dynamically issued certificate.
        let mut client = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        let (peeked, request) =
            peek_tunneled_request(&mut client, self.config.timeouts.head_read()).await?;

        // Only GET requests are classified; everything else tunnels through
        // unscanned.
        if let Some(request) = &request {
            if request.method == "GET" {
                let host_header = request
                    .header("host")
                    .map(|h| h.split(':').next().unwrap_or(h).to_string())
                    .unwrap_or_else(|| host.clone());

                match CanonicalSite::resolve(&self.suffixes, &host_header, &request.target) {
                    Ok(site) => {
                        let key = site.key();
                        let verdict = match self.cache.get(&key) {
                            Some(phishing) => Ok((phishing, None)),
                            None => self
                                .scanner
                                .classify("https://", &site, None)
                                .await
                                .map(|v| (v.phishing, v.matched)),
                        };
                        match verdict {
                            Ok((true, matched)) => {
                                self.block(&mut client, &key, matched.as_ref()).await?;
                                return Ok(());
                            }
                            Ok((false, _)) => {}
                            Err(e) => {
                                error!(site = %key, error = %e, "tunnel scan failed");
                                client
                                    .write_all(&warning::error_response(
                                        503,
                                        "Service Unavailable",
                                        "Error while scanning webpage",
                                    ))
                                    .await?;
                                client.shutdown().await?;
                                return Ok(());
                            }
                        }
                    }
                    Err(ScanError::InvalidDomain(domain)) => {
                        debug!(domain = %domain, "unresolvable CONNECT host, tunneling unscanned");
                    }
                    Err(_) => {}
                }
            }
        }

        // Clean or unclassifiable: replay the intercepted bytes and splice.
        let mut upstream = upstream;
        upstream.write_all(&peeked).await?;
        splice(client, upstream).await;
        Ok(())
    }

    async fn dial_upstream(
        &self,
        host: &str,
        port: u16,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProxyError> {
        let tcp = tokio::time::timeout(
            self.config.timeouts.dial(),
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let server_name = rustls::ServerName::try_from(host)
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        self.connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    }

    async fn block<S>(
        &self,
        stream: &mut S,
        blocked: &str,
        matched: Option<&CorpusMatch>,
    ) -> Result<(), ProxyError>
    where
        S: AsyncWrite + Unpin,
    {
        let (matched_site, algorithm, score) = match matched {
            Some(m) => (m.matched_site.as_str(), m.algorithm, m.score),
            None => ("(unknown)", "CACHED", -1),
        };
        info!(
            blocked,
            matched = matched_site,
            algorithm,
            score,
            "blocking phishing site"
        );
        let page = warning::warning_page(blocked, matched_site, algorithm, score);
        stream
            .write_all(&warning::html_response(503, "Service Unavailable", &page))
            .await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// A fully buffered upstream response, replayed to the client only after
/// classification.
struct BufferedResponse {
    status: u16,
    reason: String,
    content_type: String,
    /// The body still carries a Content-Encoding the client must undo.
    encoded: bool,
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
}

impl BufferedResponse {
    fn serialize(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).into_bytes();
        for (name, value) in &self.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(
            format!("Content-Length: {}\r\nConnection: close\r\n\r\n", self.body.len()).as_bytes(),
        );
        out.extend_from_slice(&self.body);
        out
    }
}

/// Parsed request head: method, target, and headers. Deliberately not a
/// full HTTP parser; the pipeline only needs method, path, and host.
#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parses a request head from raw bytes. Returns the head and the offset
/// where the body starts.
fn parse_head(buf: &[u8]) -> Option<(RequestHead, usize)> {
    let end = find_subsequence(buf, b"\r\n\r\n")?;
    let text = std::str::from_utf8(&buf[..end]).ok()?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    parts.next()?; // HTTP version

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((
        RequestHead {
            method,
            target,
            headers,
        },
        end + 4,
    ))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Reads until the end of the request head, returning the parsed head and
/// any body bytes that arrived with it.
async fn read_request_head<S>(
    stream: &mut S,
    timeout: std::time::Duration,
) -> Result<(RequestHead, Vec<u8>), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    loop {
        if let Some((head, body_start)) = parse_head(&buf) {
            return Ok((head, buf[body_start..].to_vec()));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::BadRequest);
        }

        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        if n == 0 {
            return Err(ProxyError::BadRequest);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Decodes a `Transfer-Encoding: chunked` request body, starting from any
/// bytes that arrived with the request head. Chunk extensions are ignored
/// and trailers are consumed and dropped.
async fn read_chunked_body<S>(stream: &mut S, mut buf: Vec<u8>) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let size_line = read_crlf_line(stream, &mut buf).await?;
        let size_text = size_line.split(';').next().unwrap_or("").trim();
        let size =
            usize::from_str_radix(size_text, 16).map_err(|_| ProxyError::BadRequest)?;

        if size == 0 {
            loop {
                if read_crlf_line(stream, &mut buf).await?.is_empty() {
                    return Ok(body);
                }
            }
        }
        if body.len() + size > MAX_BODY_BYTES {
            return Err(ProxyError::BadRequest);
        }

        // Chunk data plus its trailing CRLF.
        while buf.len() < size + 2 {
            fill_from(stream, &mut buf).await?;
        }
        body.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
    }
}

async fn read_crlf_line<S>(stream: &mut S, buf: &mut Vec<u8>) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_subsequence(buf, b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
            buf.drain(..pos + 2);
            return Ok(line);
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::BadRequest);
        }
        fill_from(stream, buf).await?;
    }
}

async fn fill_from<S>(stream: &mut S, buf: &mut Vec<u8>) -> Result<(), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
        return Err(ProxyError::BadRequest);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

/// Peeks the first decrypted request inside a fresh tunnel. The raw bytes
/// are preserved for replay; the parse may fail on non-HTTP traffic, which
/// simply tunnels through.
async fn peek_tunneled_request<S>(
    stream: &mut S,
    timeout: std::time::Duration,
) -> Result<(Vec<u8>, Option<RequestHead>), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    loop {
        if let Some((head, _)) = parse_head(&buf) {
            return Ok((buf, Some(head)));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Ok((buf, None));
        }

        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        if n == 0 {
            return Ok((buf, None));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_connect_target(target: &str) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(443),
        ),
        None => (target.to_string(), 443),
    }
}

/// Only content that can carry HTML is worth scanning.
fn scannable_content_type(content_type: &str) -> bool {
    content_type.is_empty() || content_type == "text/html" || content_type == "text/plain"
}

/// A body that is still compressed cannot be sniffed or fingerprinted; it
/// passes through unscanned rather than cache a verdict it never earned.
fn scannable_response(response: &BufferedResponse) -> bool {
    !response.encoded && scannable_content_type(&response.content_type)
}

/// Headers dropped from the replayed upstream request. Accept-Encoding is
/// excluded on top of the hop-by-hop set so the upstream client negotiates
/// only encodings it can actually decode.
fn strips_request_header(name: &str) -> bool {
    is_hop_by_hop(name) || name.eq_ignore_ascii_case("accept-encoding")
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "proxy-connection"
            | "proxy-authorization"
            | "keep-alive"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

/// Bidirectional byte splice. Each half copies until EOF and then shuts
/// down its peer's write side, so closing either half winds down the whole
/// tunnel.
async fn splice<A, B>(client: A, upstream: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let _ = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
    };
    let upstream_to_client = async {
        let _ = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
    };
    tokio::join!(client_to_upstream, upstream_to_client);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_request_line() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let (head, body_start) = parse_head(raw).unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.header("HOST"), Some("example.com:443"));
        assert_eq!(body_start, raw.len());
    }

    #[test]
    fn parses_absolute_form_get_with_body_offset() {
        let raw = b"POST http://example.com/submit HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd";
        let (head, body_start) = parse_head(raw).unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "http://example.com/submit");
        assert_eq!(head.header("content-length"), Some("4"));
        assert_eq!(&raw[body_start..], b"abcd");
    }

    #[test]
    fn incomplete_head_is_not_parsed() {
        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: x").is_none());
    }

    #[test]
    fn connect_target_defaults_to_443() {
        assert_eq!(
            parse_connect_target("example.com:8443"),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_connect_target("example.com"),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn scannable_types_are_html_plain_or_empty() {
        assert!(scannable_content_type(""));
        assert!(scannable_content_type("text/html"));
        assert!(scannable_content_type("text/plain"));
        assert!(!scannable_content_type("application/json"));
        assert!(!scannable_content_type("image/png"));
    }

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("Content-Type"));
    }

    fn html_response(encoded: bool, headers: Vec<(String, Vec<u8>)>) -> BufferedResponse {
        BufferedResponse {
            status: 200,
            reason: "OK".to_string(),
            content_type: "text/html".to_string(),
            encoded,
            headers,
            body: b"<html></html>".to_vec(),
        }
    }

    #[test]
    fn buffered_response_serializes_with_recomputed_length() {
        let response = html_response(
            false,
            vec![
                ("content-type".to_string(), b"text/html".to_vec()),
                ("connection".to_string(), b"keep-alive".to_vec()),
            ],
        );
        let text = String::from_utf8(response.serialize()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: text/html\r\n"));
        assert!(!text.contains("keep-alive"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.ends_with("<html></html>"));
    }

    #[test]
    fn still_compressed_response_keeps_encoding_and_skips_scan() {
        // An encoding the upstream client could not decode survives intact;
        // the body must reach the browser labeled as what it is, and must
        // never be sniffed as page content.
        let response = html_response(
            true,
            vec![("content-encoding".to_string(), b"deflate".to_vec())],
        );
        let text = String::from_utf8(response.serialize()).unwrap();
        assert!(text.contains("content-encoding: deflate\r\n"));
        assert!(!scannable_response(&response));

        assert!(scannable_response(&html_response(false, Vec::new())));
    }

    #[test]
    fn accept_encoding_is_not_replayed_upstream() {
        assert!(strips_request_header("Accept-Encoding"));
        assert!(strips_request_header("connection"));
        assert!(!strips_request_header("User-Agent"));
        assert!(!strips_request_header("Cookie"));
    }

    #[tokio::test]
    async fn read_request_head_returns_leftover_body() {
        let raw = b"GET http://a.com/ HTTP/1.1\r\nHost: a.com\r\n\r\npartial".to_vec();
        let mut reader = std::io::Cursor::new(raw);
        let (head, leftover) =
            read_request_head(&mut reader, std::time::Duration::from_secs(1))
                .await
                .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(leftover, b"partial");
    }

    #[tokio::test]
    async fn chunked_request_body_is_decoded() {
        let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n".to_vec();
        let mut reader = std::io::Cursor::new(raw);
        let body = read_chunked_body(&mut reader, Vec::new()).await.unwrap();
        assert_eq!(body, b"Wikipedia");
    }

    #[tokio::test]
    async fn chunked_body_honors_leftover_extensions_and_trailers() {
        // The first chunk arrived together with the request head.
        let leftover = b"3;ext=1\r\nabc".to_vec();
        let raw = b"\r\n0\r\nExpires: never\r\n\r\n".to_vec();
        let mut reader = std::io::Cursor::new(raw);
        let body = read_chunked_body(&mut reader, leftover).await.unwrap();
        assert_eq!(body, b"abc");
    }

    #[tokio::test]
    async fn chunked_body_rejects_malformed_size_line() {
        let mut reader = std::io::Cursor::new(b"zz\r\n".to_vec());
        let err = read_chunked_body(&mut reader, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest));
    }

    #[tokio::test]
    async fn peek_returns_raw_bytes_even_when_unparseable() {
        let raw = b"\x16\x03\x01 not http at all".to_vec();
        let mut reader = std::io::Cursor::new(raw.clone());
        let (peeked, head) =
            peek_tunneled_request(&mut reader, std::time::Duration::from_secs(1))
                .await
                .unwrap();
        assert_eq!(peeked, raw);
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn splice_copies_both_directions_and_propagates_close() {
        let (mut client_near, client_far) = tokio::io::duplex(1024);
        let (mut upstream_near, upstream_far) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(client_far, upstream_far));

        client_near.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_near.write_all(b"pong").await.unwrap();
        client_near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one side winds the whole tunnel down.
        drop(client_near);
        drop(upstream_near);
        task.await.unwrap();
    }

    struct DisabledRenderer;

    #[async_trait::async_trait]
    impl crate::render::Renderer for DisabledRenderer {
        async fn render(&self, _url: &str) -> Result<Vec<u8>, crate::error::RenderError> {
            Err(crate::error::RenderError::Failed("disabled".to_string()))
        }
    }

    #[tokio::test]
    async fn listener_survives_failing_connections() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::default());
        let cache = Arc::new(VerdictCache::new());
        let corpus = crate::corpus::Corpus::open_in_memory().await.unwrap();
        let scanner = Arc::new(
            Scanner::new(
                corpus,
                Arc::clone(&cache),
                Arc::new(DisabledRenderer),
                Arc::clone(&config),
            )
            .unwrap(),
        );
        let certificates = Arc::new(
            crate::cert::IssuingCa::load_or_generate(
                &dir.path().join("ca.crt"),
                &dir.path().join("ca.key"),
            )
            .unwrap(),
        );
        let server = Arc::new(
            ProxyServer::new(
                config,
                cache,
                scanner,
                Arc::new(crate::site::SuffixList::from_lines("")),
                certificates,
            )
            .unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).serve(listener));

        // Each connection errors inside its handler; later connections must
        // still be accepted.
        for _ in 0..3 {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            conn.write_all(b"garbage\r\n\r\n").await.unwrap();
            conn.shutdown().await.unwrap();
            let mut rest = Vec::new();
            let _ = conn.read_to_end(&mut rest).await;
        }
    }
}
