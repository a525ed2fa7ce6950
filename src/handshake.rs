use crate::config::ClientConfig;
use crate::error::Error;
use crate::stream::BlipStream;
use crate::utils::{generate_websocket_accept_value, generate_websocket_key};
use bytes::BytesMut;
use log::debug;
use pki_types::ServerName;
use rustls::{ClientConfig as RustlsConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsConnector;
use url::Url;

/// The one subprotocol a sync endpoint speaks.
pub const BLIP_SUBPROTOCOL: &str = "BLIP_3+CBMobile_3";

const HTTP_RESPONSE_DELIMITER: &[u8] = b"\r\n\r\n";
const MAX_RESPONSE_SIZE: usize = 16 * 1024;

/// Performs the WebSocket client upgrade against a `ws[s]://` URL, offering
/// the BLIP subprotocol and the caller's auth headers.
///
/// A non-101 response fails with `Error::Client` carrying the HTTP status,
/// so 401/500/501 from the endpoint surface verbatim.
pub async fn connect_async(
    ws_url: &str,
    headers: &[(String, String)],
    config: &ClientConfig,
) -> Result<BlipStream, Error> {
    let key = generate_websocket_key();
    let (request, host_with_port, host, use_tls) = build_upgrade_request(ws_url, &key, headers)?;

    let tcp = TcpStream::connect(&host_with_port).await?;
    let mut stream = if use_tls {
        BlipStream::Secure(Box::new(tls_connect(tcp, &host, config).await?))
    } else {
        BlipStream::Plain(tcp)
    };

    stream.write_all(request.as_bytes()).await?;
    let response = read_http_response(&mut stream).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Response::new(&mut header_storage);
    if parsed.parse(&response)?.is_partial() {
        return Err(Error::IncompleteHTTPResponse);
    }

    let status = parsed.code.ok_or(Error::IncompleteHTTPResponse)?;
    if status != 101 {
        return Err(Error::Client {
            status,
            message: parsed.reason.unwrap_or("").to_string(),
        });
    }

    let accept = parsed
        .headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("sec-websocket-accept"))
        .map(|header| String::from_utf8_lossy(header.value).trim().to_string());
    if accept.as_deref() != Some(generate_websocket_accept_value(&key).as_str()) {
        return Err(Error::InvalidAcceptKey);
    }

    debug!("websocket upgrade accepted by {}", host_with_port);
    Ok(stream)
}

// Parses the ws/wss URL into the upgrade request plus the TCP connection
// string. The request is plain text all the way; everything on the wire is
// bytes anyway, so there is no point going through an HTTP request type.
fn build_upgrade_request(
    ws_url: &str,
    key: &str,
    headers: &[(String, String)],
) -> Result<(String, String, String, bool), Error> {
    let parsed_url = Url::parse(ws_url)?;

    let (default_port, use_tls) = match parsed_url.scheme() {
        "ws" => (80u16, false),
        "wss" => (443u16, true),
        _ => return Err(Error::InvalidSchemeURL),
    };

    let host = parsed_url.host_str().ok_or(Error::URLNoHost)?;
    let port = parsed_url.port().unwrap_or(default_port);

    // Host header keeps the explicit port only when the URL carried one
    let request_host_field = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => String::from(host),
    };
    let host_with_port = format!("{}:{}", host, port);

    let request_path = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: {}\r\n",
        request_path, request_host_field, key, BLIP_SUBPROTOCOL,
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");

    Ok((request, host_with_port, String::from(host), use_tls))
}

// Reads the upgrade response up to the blank line, bounded in both size and
// time so a stalled endpoint can't wedge the connect.
async fn read_http_response(stream: &mut BlipStream) -> Result<Vec<u8>, Error> {
    let mut response = BytesMut::with_capacity(1024);
    timeout(Duration::from_secs(10), async {
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::IncompleteHTTPResponse);
            }
            response.extend_from_slice(&chunk[..n]);
            if response
                .windows(HTTP_RESPONSE_DELIMITER.len())
                .any(|window| window == HTTP_RESPONSE_DELIMITER)
            {
                return Ok(());
            }
            if response.len() > MAX_RESPONSE_SIZE {
                return Err(Error::IncompleteHTTPResponse);
            }
        }
    })
    .await??;
    Ok(response.to_vec())
}

async fn tls_connect(
    tcp: TcpStream,
    host: &str,
    config: &ClientConfig,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_file) = &config.ca_file {
        let mut reader = StdBufReader::new(File::open(ca_file)?);
        for cert in rustls_pemfile::certs(&mut reader) {
            roots.add(cert?)?;
        }
    }

    let tls_config = RustlsConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(host.to_string())?;
    Ok(connector.connect(server_name, tcp).await?)
}
