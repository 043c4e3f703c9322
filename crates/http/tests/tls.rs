use rcgen::CertifiedKey;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use sprout_http::config::ServerConfig;
use sprout_http::handler::HandlerError;
use sprout_http::protocol::{Request, Response};
use sprout_http::server::{HttpServer, ServerHandle};
use sprout_http::socket::TlsConfig;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

struct Certificate {
    cert_path: PathBuf,
    key_path: PathBuf,
    roots: RootCertStore,
}

impl Drop for Certificate {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.cert_path);
        let _ = fs::remove_file(&self.key_path);
    }
}

fn self_signed(name: &str) -> Certificate {
    let CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();

    let dir = std::env::temp_dir();
    let cert_path = dir.join(format!("sprout-{name}-{}-cert.pem", std::process::id()));
    let key_path = dir.join(format!("sprout-{name}-{}-key.pem", std::process::id()));
    fs::write(&cert_path, cert.pem()).unwrap();
    fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert.der().clone()).unwrap();
    Certificate { cert_path, key_path, roots }
}

fn echo(request: &mut Request, response: &mut Response) -> Result<(), HandlerError> {
    if request.body().is_empty() {
        response.set_body(format!("{} {}", request.method(), request.path()));
    } else {
        response.set_body(request.body().clone());
    }
    Ok(())
}

fn start(certificate: &Certificate) -> ServerHandle {
    let config = ServerConfig {
        port: 0,
        min_workers: 1,
        max_workers: 4,
        tls: Some(TlsConfig::new(&certificate.cert_path, &certificate.key_path)),
        ..ServerConfig::default()
    };
    let server = HttpServer::new(config, echo).start().unwrap();
    server.await_until_start();
    server
}

fn connect(server: &ServerHandle, certificate: &Certificate) -> TlsStream {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(certificate.roots.clone())
        .with_no_client_auth();
    let connection = ClientConnection::new(Arc::new(config), ServerName::try_from("localhost").unwrap()).unwrap();

    let tcp = TcpStream::connect(server.local_addr()).unwrap();
    tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    StreamOwned::new(connection, tcp)
}

fn exchange(stream: &mut TlsStream, method: &str, path: &str, body: &[u8]) -> (u16, Vec<u8>) {
    let head = format!("{method} {path} HTTP/1.1\r\nhost: localhost\r\ncontent-length: {}\r\n\r\n", body.len());
    stream.write_all(head.as_bytes()).unwrap();
    stream.write_all(body).unwrap();
    stream.flush().unwrap();

    let mut received = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before the response was complete");
        received.extend_from_slice(&chunk[..n]);

        let Some(head_end) = received.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&received[..head_end]).into_owned();
        let mut lines = head.split("\r\n");
        let status = lines.next().unwrap().split(' ').nth(1).unwrap().parse().unwrap();
        let length: usize = lines
            .filter_map(|line| line.split_once(": "))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .map_or(0, |(_, value)| value.parse().unwrap());

        let body_start = head_end + 4;
        if received.len() >= body_start + length {
            return (status, received[body_start..body_start + length].to_vec());
        }
    }
}

#[test]
fn keep_alive_requests_over_tls() {
    let certificate = self_signed("keep-alive");
    let server = start(&certificate);
    assert!(server.host_url().starts_with("https://"));

    let mut stream = connect(&server, &certificate);
    for path in ["/first", "/second", "/third"] {
        let (status, body) = exchange(&mut stream, "GET", path, b"");
        assert_eq!(status, 200);
        assert_eq!(body, format!("GET {path}").into_bytes());
    }
    assert_eq!(server.connections(), 1);

    server.stop();
}

#[test]
fn large_bodies_cross_many_tls_records() {
    let certificate = self_signed("large-body");
    let server = start(&certificate);
    let payload: Vec<u8> = (0..100 * 1024).map(|i| u8::try_from(i % 251).unwrap()).collect();

    let mut stream = connect(&server, &certificate);
    for _ in 0..2 {
        let (status, body) = exchange(&mut stream, "POST", "/upload", &payload);
        assert_eq!(status, 200);
        assert_eq!(body.len(), payload.len());
        assert!(body == payload, "echoed body differs from the upload");
    }

    server.stop();
}
