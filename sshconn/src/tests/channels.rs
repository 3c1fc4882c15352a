use super::*;

#[tokio::test]
async fn echo_through_small_windows() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (mut handle, _running) = connect_pair(
        server::Config {
            window_size: 4096,
            maximum_packet_size: 1024,
            ..server_config()
        },
        client::Config::default(),
        server.clone(),
        TestClient::default(),
    )
    .await;
    handle
        .authenticate(client::Credentials::new(USER).password(PASSWORD))
        .await
        .unwrap();

    let channel = handle.channel_open_session().await.unwrap();
    let (mut read, write) = channel.split();
    let payload: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
    let sent = payload.clone();
    let writer = tokio::spawn(async move { write.data(&sent[..]).await });

    let mut echoed = Vec::new();
    while echoed.len() < payload.len() {
        match read.wait().await {
            Some(ChannelMsg::Data { data }) => echoed.extend_from_slice(&data),
            Some(_) => {}
            None => panic!("channel closed after {} bytes", echoed.len()),
        }
    }
    writer.await.unwrap().unwrap();
    assert_eq!(echoed, payload);
    assert_eq!(server.seen().data, payload);
}

#[tokio::test]
async fn refused_channel() {
    let _ = env_logger::try_init();
    let (handle, _running) = logged_in(TestServer {
        accept_channels: false,
        ..Default::default()
    })
    .await;

    for _ in 0..2 {
        let result = handle.channel_open_session().await;
        assert!(
            matches!(
                result,
                Err(Error::ChannelOpenFailure {
                    reason: ChannelOpenFailure::AdministrativelyProhibited,
                    ..
                })
            ),
            "{result:?}"
        );
    }
}

#[tokio::test]
async fn server_handle_writes_to_a_channel() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (handle, running) = logged_in(server.clone()).await;

    let channel = handle.channel_open_session().await.unwrap();
    let id = server.channels.lock().unwrap()[0].id();
    let server_handle = running.handle();
    server_handle
        .data(id, Bytes::from_static(b"hello"))
        .await
        .unwrap();
    server_handle.exit_status_request(id, 3).await.unwrap();
    server_handle.close(id).await.unwrap();

    let output = channel.output().await.unwrap();
    assert_eq!(output.stdout, b"hello");
    assert_eq!(output.exit_status, Some(ExitStatus::Code(3)));
}

#[tokio::test]
async fn server_handle_waits_for_the_client_window() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (mut handle, running) = connect_pair(
        server_config(),
        client::Config {
            window_size: 2048,
            maximum_packet_size: 512,
            ..Default::default()
        },
        server.clone(),
        TestClient::default(),
    )
    .await;
    handle
        .authenticate(client::Credentials::new(USER).password(PASSWORD))
        .await
        .unwrap();
    let channel = handle.channel_open_session().await.unwrap();
    let id = server.channels.lock().unwrap()[0].id();

    let payload: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
    let server_handle = running.handle();
    let sent = Bytes::from(payload.clone());
    let writer = tokio::spawn(async move {
        server_handle.data(id, sent).await?;
        server_handle.close(id).await
    });
    let output = channel.output().await.unwrap();
    writer.await.unwrap().unwrap();
    assert_eq!(output.stdout, payload);

    let unknown = running.handle().data(ChannelId(77), Bytes::from_static(b"x")).await;
    assert!(matches!(unknown, Err(Error::WrongChannel)), "{unknown:?}");
}

#[tokio::test]
async fn disconnect_is_reported_once() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let client = TestClient::default();
    let (mut handle, running) = connect_pair(
        server_config(),
        client::Config::default(),
        server.clone(),
        client.clone(),
    )
    .await;
    handle
        .authenticate(client::Credentials::new(USER).password(PASSWORD))
        .await
        .unwrap();
    let _channel = handle.channel_open_session().await.unwrap();

    handle
        .disconnect(Disconnect::ByApplication, "bye", "en")
        .await
        .unwrap();
    handle.await.unwrap();
    running.await.unwrap();

    assert_eq!(*client.disconnects.lock().unwrap(), vec![DisconnectReason::Local]);
    assert_eq!(
        server.seen().disconnects,
        vec![DisconnectReason::ReceivedDisconnect {
            reason: Some(Disconnect::ByApplication),
            description: "bye".to_string(),
        }]
    );
}

#[tokio::test]
async fn server_disconnect_ends_channels() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let client = TestClient::default();
    let (mut handle, running) = connect_pair(
        server_config(),
        client::Config::default(),
        server.clone(),
        client.clone(),
    )
    .await;
    let key = keys::load_secret_key(fixture("id_rsa")).unwrap();
    handle
        .authenticate(client::Credentials::new(USER).key(key))
        .await
        .unwrap();
    let channel = handle.channel_open_session().await.unwrap();
    let id = server.channels.lock().unwrap()[0].id();

    let server_handle = running.handle();
    server_handle
        .disconnect(Disconnect::ByApplication, "maintenance".into(), "en".into())
        .await
        .unwrap();
    assert!(matches!(channel.output().await, Err(Error::ConnectionClosed)));
    handle.await.unwrap();
    running.await.unwrap();

    assert_eq!(
        *client.disconnects.lock().unwrap(),
        vec![DisconnectReason::ReceivedDisconnect {
            reason: Some(Disconnect::ByApplication),
            description: "maintenance".to_string(),
        }]
    );
    assert_eq!(server.seen().disconnects, vec![DisconnectReason::Local]);
    // The connection is gone for the server's handle as well.
    assert!(server_handle
        .data(id, Bytes::from_static(b"late"))
        .await
        .is_err());
}

#[tokio::test]
async fn dropping_the_handle_disconnects() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (handle, running) = logged_in(server.clone()).await;
    drop(handle);
    running.await.unwrap();
    assert!(matches!(
        server.seen().disconnects.as_slice(),
        [DisconnectReason::ReceivedDisconnect {
            reason: Some(Disconnect::ByApplication),
            ..
        }]
    ));
}
