//! Integration tests for the secure listener.
//!
//! These tests run the real agent on an ephemeral port and talk to it the
//! way the operator tool does: mutual TLS, then plain HTTP/1.1 requests.

#![allow(clippy::unwrap_used)] // unwrap is acceptable in tests

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use sideload_agent::{AgentConfig, AgentHandle, AgentState, SideloadServer, crypto_provider};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("sideload_agent=debug,sideload=debug")
            .with_test_writer()
            .init();
    });
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A certificate authority that can issue leaf certificates.
struct TestCa {
    cert: Certificate,
    key: KeyPair,
}

impl TestCa {
    fn new(name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    fn issue(&self, name: &str, usage: ExtendedKeyUsagePurpose) -> Leaf {
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![usage];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        Leaf { cert, key }
    }

    fn pem(&self) -> String {
        self.cert.pem()
    }

    fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }
}

struct Leaf {
    cert: Certificate,
    key: KeyPair,
}

/// A running agent plus everything a client needs to reach it.
struct TestAgent {
    dir: TempDir,
    handle: AgentHandle,
    server_ca: TestCa,
    client_ca: TestCa,
}

impl TestAgent {
    async fn start() -> Self {
        init_tracing();

        let dir = TempDir::new().unwrap();
        let server_ca = TestCa::new("Sideload Test Server CA");
        let client_ca = TestCa::new("Sideload Test Operator CA");
        let server = server_ca.issue("localhost", ExtendedKeyUsagePurpose::ServerAuth);

        let certs = dir.path().join("certs_keys");
        std::fs::create_dir_all(&certs).unwrap();
        std::fs::write(certs.join("server.pem.cert"), server.cert.pem()).unwrap();
        std::fs::write(certs.join("server.pem.key"), server.key.serialize_pem()).unwrap();
        std::fs::write(certs.join("client.pem.cert"), client_ca.pem()).unwrap();

        let config = AgentConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            sideload_dir: dir.path().join("sideloaded"),
            default_app_dir: dir.path().join("default"),
            server_cert: certs.join("server.pem.cert"),
            server_key: certs.join("server.pem.key"),
            client_ca: certs.join("client.pem.cert"),
            python: "/bin/sh".into(),
            ..AgentConfig::default()
        };

        let state = Arc::new(AgentState::from_config(&config));
        let handle = SideloadServer::bind(&config, state).await.unwrap().spawn();

        Self {
            dir,
            handle,
            server_ca,
            client_ca,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    fn sideload_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("sideloaded")
    }

    fn default_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("default")
    }

    /// Client presenting a certificate issued by the trusted operator CA.
    fn operator(&self) -> TestClient {
        let leaf = self
            .client_ca
            .issue("operator", ExtendedKeyUsagePurpose::ClientAuth);
        TestClient::new(self.addr(), &self.server_ca, Some(leaf))
    }

    /// Client presenting no certificate at all.
    fn anonymous(&self) -> TestClient {
        TestClient::new(self.addr(), &self.server_ca, None)
    }

    /// Client presenting a certificate from a CA the agent does not trust.
    fn impostor(&self) -> TestClient {
        let rogue = TestCa::new("Rogue CA");
        let leaf = rogue.issue("operator", ExtendedKeyUsagePurpose::ClientAuth);
        TestClient::new(self.addr(), &self.server_ca, Some(leaf))
    }
}

struct TestClient {
    addr: SocketAddr,
    connector: TlsConnector,
}

impl TestClient {
    fn new(addr: SocketAddr, server_ca: &TestCa, identity: Option<Leaf>) -> Self {
        let mut roots = RootCertStore::empty();
        roots.add(server_ca.der()).unwrap();

        let builder = ClientConfig::builder_with_provider(Arc::new(crypto_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots);
        let config = match identity {
            Some(leaf) => builder
                .with_client_auth_cert(
                    vec![leaf.cert.der().clone()],
                    PrivatePkcs8KeyDer::from(leaf.key.serialize_der()).into(),
                )
                .unwrap(),
            None => builder.with_no_client_auth(),
        };

        Self {
            addr,
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Send one request on a fresh connection.
    async fn send(
        &self,
        method: Method,
        path: &str,
        mtime: Option<&str>,
        body: &[u8],
    ) -> Result<(StatusCode, Value), BoxError> {
        let tcp = TcpStream::connect(self.addr).await?;
        let tls = self
            .connector
            .connect(ServerName::try_from("localhost")?, tcp)
            .await?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut request = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "localhost");
        if let Some(mtime) = mtime {
            request = request.header("mtime", mtime);
        }
        let request = request.body(Full::new(Bytes::from(body.to_vec())))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, value))
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        mtime: Option<&str>,
        body: &[u8],
    ) -> (StatusCode, Value) {
        tokio::time::timeout(Duration::from_secs(30), self.send(method, path, mtime, body))
            .await
            .unwrap()
            .unwrap()
    }
}

fn write_script(dir: &Path, name: &str, body: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(name), body).unwrap();
}

#[tokio::test]
async fn test_upload_and_list_round_trip() {
    let agent = TestAgent::start().await;
    let client = agent.operator();

    let (status, body) = client
        .call(
            Method::PUT,
            "/files/app/main.py",
            Some("2024-01-01T00:00:00"),
            b"print(1)\n",
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (status, listing) = client.call(Method::GET, "/files", None, b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        listing,
        json!([{"filepath": "app/main.py", "mtime": "2024-01-01T00:00:00", "size": 9}])
    );

    let on_disk = std::fs::read(agent.sideload_dir().join("app/main.py")).unwrap();
    assert_eq!(on_disk, b"print(1)\n");

    agent.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_is_idempotent_over_the_wire() {
    let agent = TestAgent::start().await;
    let client = agent.operator();

    client
        .call(
            Method::PUT,
            "/files/data/labels.txt",
            Some("2024-05-01T12:00:00"),
            b"person\ncar\n",
        )
        .await;

    let first = client
        .call(Method::DELETE, "/files/data/labels.txt", None, b"")
        .await;
    let second = client
        .call(Method::DELETE, "/files/data/labels.txt", None, b"")
        .await;
    assert_eq!(first, (StatusCode::OK, json!({})));
    assert_eq!(first, second);

    let (_, listing) = client.call(Method::GET, "/files", None, b"").await;
    assert_eq!(listing, json!([]));

    agent.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_upload_escaping_sandbox_is_rejected() {
    let agent = TestAgent::start().await;
    let client = agent.operator();

    let (status, body) = client
        .call(
            Method::PUT,
            "/files/app/..%2F..%2Foutside.txt",
            Some("2024-01-01T00:00:00"),
            b"nope",
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert!(!agent.dir.path().join("outside.txt").exists());

    agent.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_without_entrypoint_reports_launch_failure() {
    let agent = TestAgent::start().await;
    let client = agent.operator();

    let (status, body) = client.call(Method::POST, "/application", None, b"").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("entrypoint"));

    let (_, state) = client.call(Method::GET, "/application", None, b"").await;
    assert_eq!(state, json!({"running": false}));

    agent.handle.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_start_conflict_then_stop() {
    let agent = TestAgent::start().await;
    let client = agent.operator();

    client
        .call(
            Method::PUT,
            "/files/main.sh",
            Some("2024-01-01T00:00:00"),
            b"exec sleep 30\n",
        )
        .await;

    let (status, _) = client.call(Method::POST, "/application", None, b"").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = client.call(Method::POST, "/application", None, b"").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already exists"));

    let (status, body) = client.call(Method::DELETE, "/application", None, b"").await;
    assert_eq!((status, body), (StatusCode::OK, json!({})));

    let (_, state) = client.call(Method::GET, "/application", None, b"").await;
    assert_eq!(state, json!({"running": false}));

    let (status, _) = client.call(Method::DELETE, "/application", None, b"").await;
    assert_eq!(status, StatusCode::CONFLICT);

    agent.handle.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_sideloaded_entrypoint_wins_over_default() {
    let agent = TestAgent::start().await;
    let client = agent.operator();

    write_script(&agent.default_dir(), "main.sh", "exec sleep 30\n");
    client
        .call(
            Method::PUT,
            "/files/main.py",
            Some("2024-01-01T00:00:00"),
            b"exec sleep 30\n",
        )
        .await;

    let (status, _) = client.call(Method::POST, "/application", None, b"").await;
    assert_eq!(status, StatusCode::OK);

    let (_, state) = client.call(Method::GET, "/application", None, b"").await;
    let entrypoint = state["entrypoint"].as_str().unwrap();
    assert!(
        entrypoint.ends_with("sideloaded/main.py"),
        "launched {entrypoint}"
    );

    client.call(Method::DELETE, "/application", None, b"").await;
    agent.handle.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_concurrent_starts_over_the_wire() {
    let agent = TestAgent::start().await;
    let client = Arc::new(agent.operator());

    client
        .call(
            Method::PUT,
            "/files/main.sh",
            Some("2024-01-01T00:00:00"),
            b"exec sleep 30\n",
        )
        .await;

    let requests: Vec<_> = (0..6)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call(Method::POST, "/application", None, b"").await })
        })
        .collect();

    let mut statuses = Vec::new();
    for request in requests {
        statuses.push(request.await.unwrap().0);
    }
    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 1);
    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == StatusCode::CONFLICT)
            .count(),
        5
    );

    client.call(Method::DELETE, "/application", None, b"").await;
    agent.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_without_certificate_gets_no_response() {
    let agent = TestAgent::start().await;

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        agent.anonymous().send(Method::GET, "/files", None, b""),
    )
    .await
    .unwrap();
    assert!(result.is_err(), "unauthenticated client got {:?}", result);

    // The listener keeps serving authenticated clients afterwards.
    let (status, _) = agent.operator().call(Method::GET, "/files", None, b"").await;
    assert_eq!(status, StatusCode::OK);

    agent.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_with_untrusted_certificate_gets_no_response() {
    let agent = TestAgent::start().await;

    let result = tokio::time::timeout(
        Duration::from_secs(30),
        agent.impostor().send(Method::GET, "/files", None, b""),
    )
    .await
    .unwrap();
    assert!(result.is_err(), "untrusted client got {:?}", result);

    agent.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let agent = TestAgent::start().await;
    let client = agent.operator();

    let (status, body) = client.call(Method::GET, "/status", None, b"").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    agent.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_refuses_new_connections() {
    let agent = TestAgent::start().await;
    let addr = agent.addr();
    let client = agent.operator();

    let (status, _) = client.call(Method::GET, "/files", None, b"").await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::timeout(Duration::from_secs(10), agent.handle.shutdown())
        .await
        .unwrap()
        .unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}
