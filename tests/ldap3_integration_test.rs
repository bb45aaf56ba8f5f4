/// Integration tests using the ldap3 client against an in-process server
/// These tests verify LDAP protocol compliance and correct search results
use ldap3::exop::{WhoAmI, WhoAmIResp};
use ldap3::{LdapConnAsync, Scope, SearchEntry, SearchOptions};
use ldap_server_rs::directory::{DirectoryHandler, DirectoryStore, InMemoryDirectory};
use ldap_server_rs::handler::ConnectionInfo;
use ldap_server_rs::ldap::LdapServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

const BASE_DN: &str = "dc=example,dc=com";
const BRIAN: &str = "uid=brian,ou=people,dc=example,dc=com";
const CAROLINE: &str = "uid=caroline,ou=people,dc=example,dc=com";

struct TestServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_server() -> TestServer {
    let store: Arc<dyn DirectoryStore> =
        Arc::new(InMemoryDirectory::sample(BASE_DN).expect("Failed to build sample directory"));
    let server = LdapServer::new(move |info: &ConnectionInfo| {
        DirectoryHandler::new(store.clone(), BASE_DN, info)
    });
    let listener = server.bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        server
            .serve(listener, None, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        url: format!("ldap://{}", addr),
        shutdown: Some(tx),
    }
}

async fn connect(server: &TestServer) -> ldap3::Ldap {
    let (conn, ldap) = LdapConnAsync::new(&server.url)
        .await
        .expect("Failed to connect to LDAP server");

    // Drive the connection in the background
    tokio::spawn(async move {
        if let Err(e) = conn.drive().await {
            eprintln!("Connection driver error: {}", e);
        }
    });
    ldap
}

async fn search_dns(ldap: &mut ldap3::Ldap, filter: &str) -> Vec<String> {
    let search = timeout(
        Duration::from_secs(2),
        ldap.search(BASE_DN, Scope::Subtree, filter, vec!["uid"]),
    )
    .await
    .expect("Search should not timeout")
    .expect("Search should succeed");
    let (rs, res) = search.success().expect("Should get search results");
    assert_eq!(res.rc, 0);

    let mut dns: Vec<String> = rs
        .into_iter()
        .map(|e| SearchEntry::construct(e).dn)
        .collect();
    dns.sort();
    dns
}

#[tokio::test]
async fn test_ldap3_bind_success() {
    let server = start_server().await;
    let mut ldap = connect(&server).await;

    let result = ldap.simple_bind(BRIAN, "foobar").await.unwrap();
    assert_eq!(result.rc, 0, "Bind result code should be 0 (success)");

    let _ = ldap.unbind().await;
}

#[tokio::test]
async fn test_ldap3_bind_invalid_credentials() {
    let server = start_server().await;
    let mut ldap = connect(&server).await;

    let result = ldap.simple_bind(BRIAN, "wrongpassword").await.unwrap();
    assert_eq!(result.rc, 49, "Bind should fail with invalidCredentials");

    let result = ldap
        .simple_bind("uid=nobody,ou=people,dc=example,dc=com", "foobar")
        .await
        .unwrap();
    assert_eq!(result.rc, 49);

    // the connection stays usable after a failed bind
    let result = ldap.simple_bind(CAROLINE, "boing").await.unwrap();
    assert_eq!(result.rc, 0);

    let _ = ldap.unbind().await;
}

#[tokio::test]
async fn test_ldap3_search_with_attribute_selection() {
    let server = start_server().await;
    let mut ldap = connect(&server).await;

    let search = ldap
        .search(BASE_DN, Scope::Subtree, "(uid=brian)", vec!["maildir"])
        .await
        .unwrap();
    let (rs, res) = search.success().unwrap();
    assert_eq!(res.rc, 0);
    assert_eq!(rs.len(), 1);

    let entry = SearchEntry::construct(rs.into_iter().next().unwrap());
    assert_eq!(entry.dn, BRIAN);
    assert_eq!(entry.attrs.len(), 1);
    assert_eq!(entry.attrs["maildir"], vec!["/netapp/brian/".to_string()]);

    let _ = ldap.unbind().await;
}

#[tokio::test]
async fn test_ldap3_search_filters() {
    let server = start_server().await;
    let mut ldap = connect(&server).await;

    assert_eq!(
        search_dns(&mut ldap, "(objectClass=inetOrgPerson)").await,
        vec![BRIAN, CAROLINE]
    );
    assert_eq!(search_dns(&mut ldap, "(uid=car*)").await, vec![CAROLINE]);
    assert_eq!(
        search_dns(&mut ldap, "(&(objectClass=person)(!(uid=brian)))").await,
        vec![CAROLINE]
    );
    assert_eq!(
        search_dns(&mut ldap, "(|(uid=brian)(mail=caroline@example.com))").await,
        vec![BRIAN, CAROLINE]
    );
    assert_eq!(search_dns(&mut ldap, "(uid~=brian)").await, vec![BRIAN]);
    assert_eq!(
        search_dns(&mut ldap, "(uid:caseIgnoreMatch:=BRIAN)").await,
        vec![BRIAN]
    );
    assert_eq!(search_dns(&mut ldap, "(employeeNumber>=2)").await, vec![CAROLINE]);
    assert!(search_dns(&mut ldap, "(uid=BRIAN)").await.is_empty());
    assert!(search_dns(&mut ldap, "(telephoneNumber=*)").await.is_empty());

    let _ = ldap.unbind().await;
}

#[tokio::test]
async fn test_ldap3_search_unknown_base() {
    let server = start_server().await;
    let mut ldap = connect(&server).await;

    let search = ldap
        .search("dc=other,dc=org", Scope::Subtree, "(objectClass=*)", vec!["*"])
        .await
        .unwrap();
    assert_eq!(search.1.rc, 32, "Search should fail with noSuchObject");
    assert!(search.0.is_empty());

    let _ = ldap.unbind().await;
}

#[tokio::test]
async fn test_ldap3_search_size_limit() {
    let server = start_server().await;
    let mut ldap = connect(&server).await;

    let search = ldap
        .with_search_options(SearchOptions::new().sizelimit(1))
        .search(BASE_DN, Scope::Subtree, "(objectClass=*)", vec!["1.1"])
        .await
        .unwrap();
    assert_eq!(search.1.rc, 4, "Search should stop with sizeLimitExceeded");
    assert_eq!(search.0.len(), 1);

    let _ = ldap.unbind().await;
}

#[tokio::test]
async fn test_ldap3_compare() {
    let server = start_server().await;
    let mut ldap = connect(&server).await;

    let equal = ldap.compare(BRIAN, "mail", "brian@example.com").await.unwrap();
    assert!(equal.equal().unwrap());

    let different = ldap.compare(BRIAN, "uid", "caroline").await.unwrap();
    assert!(!different.equal().unwrap());

    let missing = ldap
        .compare("uid=nobody,ou=people,dc=example,dc=com", "uid", "nobody")
        .await
        .unwrap();
    assert_eq!(missing.0.rc, 32);

    let _ = ldap.unbind().await;
}

#[tokio::test]
async fn test_ldap3_whoami() {
    let server = start_server().await;
    let mut ldap = connect(&server).await;

    let (exop, res) = ldap.extended(WhoAmI).await.unwrap().success().unwrap();
    assert_eq!(res.rc, 0);
    let whoami: WhoAmIResp = exop.parse();
    assert_eq!(whoami.authzid, "");

    ldap.simple_bind(CAROLINE, "boing").await.unwrap().success().unwrap();
    let (exop, _res) = ldap.extended(WhoAmI).await.unwrap().success().unwrap();
    let whoami: WhoAmIResp = exop.parse();
    assert_eq!(whoami.authzid, format!("dn:{}", CAROLINE));

    let _ = ldap.unbind().await;
}

#[tokio::test]
async fn test_ldap3_unsupported_operation() {
    let server = start_server().await;
    let mut ldap = connect(&server).await;

    let result = ldap.delete(BRIAN).await.unwrap();
    assert_eq!(result.rc, 53, "Delete should be unwillingToPerform");

    // the session keeps serving requests
    let result = ldap.simple_bind(BRIAN, "foobar").await.unwrap();
    assert_eq!(result.rc, 0);

    let _ = ldap.unbind().await;
}

#[tokio::test]
async fn test_ldap3_concurrent_sessions() {
    let server = start_server().await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let url = server.url.clone();
        tasks.push(tokio::spawn(async move {
            let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
            tokio::spawn(async move {
                let _ = conn.drive().await;
            });

            let (dn, password, uid) = if i % 2 == 0 {
                (BRIAN, "foobar", "brian")
            } else {
                (CAROLINE, "boing", "caroline")
            };
            ldap.simple_bind(dn, password).await.unwrap().success().unwrap();

            for _ in 0..10 {
                let (rs, _res) = ldap
                    .search(BASE_DN, Scope::Subtree, &format!("(uid={})", uid), vec!["uid"])
                    .await
                    .unwrap()
                    .success()
                    .unwrap();
                assert_eq!(rs.len(), 1);
                assert_eq!(SearchEntry::construct(rs.into_iter().next().unwrap()).dn, dn);
            }

            // each session keeps its own bind state
            let (exop, _res) = ldap.extended(WhoAmI).await.unwrap().success().unwrap();
            let whoami: WhoAmIResp = exop.parse();
            assert_eq!(whoami.authzid, format!("dn:{}", dn));

            let _ = ldap.unbind().await;
        }));
    }

    for task in tasks {
        timeout(Duration::from_secs(10), task)
            .await
            .expect("Session should finish")
            .unwrap();
    }
}
