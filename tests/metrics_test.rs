use ldap_server_rs::directory::{DirectoryHandler, DirectoryStore, InMemoryDirectory};
use ldap_server_rs::handler::ConnectionInfo;
use ldap_server_rs::ldap::LdapServer;
use ldap_server_rs::ldap_lib::{encode_integer, encode_message, encode_octet_string, encode_tlv, tag};
use ldap_server_rs::{api, metrics};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const BASE_DN: &str = "dc=example,dc=com";

fn sample_store() -> Arc<dyn DirectoryStore> {
    Arc::new(InMemoryDirectory::sample(BASE_DN).unwrap())
}

async fn start_test_server(store: Arc<dyn DirectoryStore>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::create_router(store);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

async fn fetch_metrics(base_url: &str) -> String {
    let response = reqwest::Client::new()
        .get(format!("{}/metrics", base_url))
        .send()
        .await
        .expect("Failed to call /metrics");

    assert_eq!(response.status(), 200, "Metrics endpoint should return 200 OK");
    response.text().await.expect("Failed to read response body")
}

#[tokio::test]
async fn test_metrics_endpoint_exists() {
    metrics::record_session_opened();
    metrics::record_session_closed();

    let base_url = start_test_server(sample_store()).await;
    let body = fetch_metrics(&base_url).await;

    // Verify it's Prometheus format (should have metric names and values)
    assert!(!body.is_empty(), "Metrics response should not be empty");
    assert!(
        body.contains("# TYPE"),
        "Response should contain Prometheus TYPE declarations"
    );
    assert!(body.contains("ldap_sessions_total"));
    assert!(body.contains("ldap_sessions_active"));
}

#[tokio::test]
async fn test_ldap_operations_are_tracked() {
    let store = sample_store();
    let base_url = start_test_server(store.clone()).await;

    let server = LdapServer::new(move |info: &ConnectionInfo| {
        DirectoryHandler::new(store.clone(), BASE_DN, info)
    });
    let listener = server.bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { server.serve(listener, None, std::future::pending()).await });

    // one failed simple bind
    let mut body = encode_integer(tag::INTEGER, 3);
    body.extend(encode_octet_string(b"uid=brian,ou=people,dc=example,dc=com"));
    body.extend(encode_tlv(0x80, b"not-the-password"));
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(&encode_message(1, &encode_tlv(tag::BIND_REQUEST, &body)))
        .await
        .unwrap();
    let mut response = [0u8; 14];
    stream.read_exact(&mut response).await.unwrap();
    assert_eq!(response[9], 49);

    let body = fetch_metrics(&base_url).await;
    assert!(
        body.contains(r#"ldap_operations_total{operation="bind",result="invalidCredentials"}"#),
        "Failed binds should be counted by result code"
    );
    assert!(body.contains("ldap_operation_duration_seconds_bucket"));
}
