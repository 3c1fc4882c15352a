use super::*;
use crate::client::{Credentials, KeyboardInteractiveAuthResponse, Prompt};

async fn publickey_login(key: &str) -> (TestServer, bool) {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (mut handle, _running) = connect_pair(
        server_config(),
        client::Config::default(),
        server.clone(),
        TestClient::default(),
    )
    .await;
    let key = keys::load_secret_key(fixture(key)).unwrap();
    let result = handle.authenticate(Credentials::new(USER).key(key)).await;
    (server, result.is_ok())
}

#[tokio::test]
async fn rsa_publickey() {
    let (server, authenticated) = publickey_login("id_rsa").await;
    assert!(authenticated);
    assert_eq!(
        server.seen().publickeys,
        vec![SeenKey {
            key_type: "ssh-rsa".to_string(),
            algorithm: "rsa-sha2-512".to_string(),
            signed_with: Some("rsa-sha2-512".to_string()),
            verified: true,
        }]
    );
}

#[tokio::test]
async fn dsa_publickey() {
    let (server, authenticated) = publickey_login("id_dsa").await;
    assert!(authenticated);
    assert_eq!(
        server.seen().publickeys,
        vec![SeenKey {
            key_type: "ssh-dss".to_string(),
            algorithm: "ssh-dss".to_string(),
            signed_with: Some("ssh-dss".to_string()),
            verified: true,
        }]
    );
}

#[tokio::test]
async fn ed25519_publickey() {
    let (server, authenticated) = publickey_login("host_ed25519").await;
    assert!(authenticated);
    let seen = server.seen();
    assert_eq!(seen.publickeys.len(), 1);
    assert_eq!(seen.publickeys[0].algorithm, "ssh-ed25519");
    assert_eq!(seen.publickeys[0].signed_with.as_deref(), Some("ssh-ed25519"));
}

#[tokio::test]
async fn timed_out_authentication_ends_the_connection() {
    let _ = env_logger::try_init();
    let server = TestServer {
        password_delay: Duration::from_millis(300),
        ..Default::default()
    };
    let (mut handle, running) = connect_pair(
        server_config(),
        client::Config {
            ready_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        },
        server.clone(),
        TestClient::default(),
    )
    .await;
    let result = handle
        .authenticate(Credentials::new(USER).password(PASSWORD))
        .await;
    assert!(matches!(result, Err(Error::ConnectionTimeout)), "{result:?}");

    // The late success must not be taken for the answer to a new attempt.
    let retry = handle.authenticate_password(USER, PASSWORD).await;
    assert!(retry.is_err(), "{retry:?}");
    assert!(!handle.is_authenticated());

    handle.await.unwrap();
    // The server may fail writing its late answer to the closed pipe.
    if let Err(e) = running.await {
        debug!("server ended with {e:?}");
    }
    assert_eq!(server.seen().disconnects.len(), 1);
    assert_eq!(server.seen().passwords, 1);
}

#[tokio::test]
async fn password() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (handle, _running) = logged_in(server.clone()).await;
    assert!(handle.is_authenticated());
    assert_eq!(server.seen().passwords, 1);
}

#[tokio::test]
async fn keyboard_interactive() {
    let _ = env_logger::try_init();
    let (mut handle, _running) = connect_pair(
        server_config(),
        client::Config::default(),
        TestServer::default(),
        TestClient::default(),
    )
    .await;
    let asked = Arc::new(Mutex::new(Vec::new()));
    let prompts_seen = asked.clone();
    let credentials = Credentials::new(USER).keyboard_interactive(
        move |name: &str, _: &str, prompts: &[Prompt]| {
            prompts_seen.lock().unwrap().push(name.to_string());
            assert_eq!(prompts.len(), 1);
            assert!(!prompts[0].echo);
            vec![PASSWORD.to_string()]
        },
    );
    handle.authenticate(credentials).await.unwrap();
    assert_eq!(*asked.lock().unwrap(), vec!["Login".to_string()]);
}

#[tokio::test]
async fn keyboard_interactive_step_by_step() {
    let _ = env_logger::try_init();
    let (mut handle, _running) = connect_pair(
        server_config(),
        client::Config::default(),
        TestServer::default(),
        TestClient::default(),
    )
    .await;
    let response = handle
        .authenticate_keyboard_interactive_start(USER, None::<String>)
        .await
        .unwrap();
    let KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } = response else {
        panic!("expected prompts, got {response:?}");
    };
    assert_eq!(prompts[0].prompt, "Password: ");
    let response = handle
        .authenticate_keyboard_interactive_respond(vec!["wrong".to_string()])
        .await
        .unwrap();
    assert!(matches!(
        response,
        KeyboardInteractiveAuthResponse::Failure { partial_success: false, .. }
    ));
    assert!(!handle.is_authenticated());
}

#[tokio::test]
async fn no_more_methods() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (mut handle, running) = connect_pair(
        server_config(),
        client::Config::default(),
        server.clone(),
        TestClient::default(),
    )
    .await;
    let result = handle
        .authenticate(Credentials::new(USER).password("not the password"))
        .await;
    assert!(matches!(result, Err(Error::NoMoreAuthMethods)), "{result:?}");
    running.await.unwrap();
    assert!(matches!(
        server.seen().disconnects.as_slice(),
        [DisconnectReason::ReceivedDisconnect {
            reason: Some(Disconnect::NoMoreAuthMethodsAvailable),
            ..
        }]
    ));
}

#[tokio::test]
async fn too_many_failures() {
    let _ = env_logger::try_init();
    let client = TestClient::default();
    let (mut handle, _running) = connect_pair(
        server::Config {
            max_auth_attempts: 2,
            ..server_config()
        },
        client::Config::default(),
        TestServer::default(),
        client.clone(),
    )
    .await;
    let first = handle.authenticate_password(USER, "nope").await.unwrap();
    assert!(!first.success());
    let second = handle.authenticate_password(USER, "still nope").await;
    assert!(matches!(second, Err(Error::ConnectionClosed)), "{second:?}");
    handle.await.unwrap();
    assert!(matches!(
        client.disconnects.lock().unwrap().as_slice(),
        [DisconnectReason::ReceivedDisconnect {
            reason: Some(Disconnect::NoMoreAuthMethodsAvailable),
            ..
        }]
    ));
}

#[tokio::test]
async fn unadvertised_methods_are_skipped() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (mut handle, _running) = connect_pair(
        server::Config {
            methods: MethodSet::from(&[MethodKind::PublicKey][..]),
            ..server_config()
        },
        client::Config::default(),
        server.clone(),
        TestClient::default(),
    )
    .await;
    let key = keys::load_secret_key(fixture("id_rsa")).unwrap();
    handle
        .authenticate(Credentials::new(USER).password(PASSWORD).key(key))
        .await
        .unwrap();
    assert_eq!(server.seen().passwords, 0);
    assert_eq!(server.seen().publickeys.len(), 1);
}

#[tokio::test]
async fn host_fingerprint() {
    let _ = env_logger::try_init();
    let client = TestClient::default();
    let (_handle, _running) = connect_pair(
        server_config(),
        client::Config {
            host_hash: Some(HostHash::Md5),
            ..Default::default()
        },
        TestServer::default(),
        client.clone(),
    )
    .await;
    let expected = keys::fingerprint(HostHash::Md5, host_key().public_key()).unwrap();
    assert_eq!(expected.len(), 32);
    assert_eq!(*client.fingerprint.lock().unwrap(), Some(expected));
}

#[tokio::test]
async fn channels_need_authentication() {
    let _ = env_logger::try_init();
    let (handle, _running) = connect_pair(
        server_config(),
        client::Config::default(),
        TestServer::default(),
        TestClient::default(),
    )
    .await;
    let result = handle.channel_open_session().await;
    assert!(matches!(result, Err(Error::NotAuthenticated)));
}

#[tokio::test]
async fn methods_not_offered_wait_the_full_rejection_time() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (mut handle, _running) = connect_pair(
        server::Config {
            methods: MethodSet::from(&[MethodKind::PublicKey][..]),
            auth_rejection_time: Duration::from_millis(200),
            ..server_config()
        },
        client::Config::default(),
        server.clone(),
        TestClient::default(),
    )
    .await;

    let started = std::time::Instant::now();
    let none = handle.authenticate_none(USER).await.unwrap();
    assert!(!none.success());
    assert!(started.elapsed() < Duration::from_millis(200));

    let started = std::time::Instant::now();
    let password = handle.authenticate_password(USER, PASSWORD).await.unwrap();
    assert!(!password.success());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(server.seen().passwords, 0);
}
