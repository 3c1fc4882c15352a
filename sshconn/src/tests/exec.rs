use std::collections::HashMap;

use super::*;
use crate::client::ExecOptions;

#[tokio::test]
async fn exec_output() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (handle, _running) = logged_in(server.clone()).await;

    let channel = handle.exec("foo --bar", ExecOptions::default()).await?;
    let output = channel.output().await?;
    assert_eq!(output.stdout, b"stdout data!\n");
    assert_eq!(output.stderr, b"stderr data!\n");
    assert_eq!(output.exit_status, Some(ExitStatus::Code(100)));

    let seen = server.seen();
    assert_eq!(seen.processes.len(), 1);
    let process = &seen.processes[0];
    assert_eq!(process.command(), Some("foo --bar"));
    assert!(process.pty.is_none());
    assert!(process.x11.is_none());
    assert!(!process.agent_forward);
    assert!(process.env.is_empty());
    Ok(())
}

#[tokio::test]
async fn exec_with_requests() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (handle, _running) = logged_in(server.clone()).await;

    let pty = PtyInfo {
        rows: 2,
        cols: 4,
        width: 640,
        height: 480,
        term: "vt220".to_string(),
        modes: vec![(Pty::VINTR, 3), (Pty::ECHO, 1), (Pty::TTY_OP_OSPEED, 38400)],
    };
    let options = ExecOptions {
        env: HashMap::from([("SSH2NODETEST".to_string(), "foo".to_string())]),
        pty: Some(pty.clone()),
        x11: true,
        agent_forward: true,
    };
    let channel = handle.exec("foo --bar", options).await.unwrap();
    assert_eq!(channel.output().await.unwrap().exit_status.and_then(|s| s.code()), Some(100));

    let seen = server.seen();
    assert_eq!(
        seen.requests,
        vec!["env", "pty-req", "x11-req", "auth-agent-req@openssh.com"]
    );
    let process = &seen.processes[0];
    assert_eq!(process.env.get("SSH2NODETEST").map(String::as_str), Some("foo"));
    assert_eq!(process.pty.as_ref(), Some(&pty));
    let x11 = process.x11.as_ref().unwrap();
    assert_eq!(x11.auth_protocol, "MIT-MAGIC-COOKIE-1");
    assert!(process.agent_forward);
}

#[tokio::test]
async fn shell_with_pty() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let (handle, _running) = logged_in(TestServer::default()).await;

    let channel = handle.shell(ExecOptions::with_pty()).await?;
    let output = channel.output().await?;
    assert_eq!(output.stdout, b"Cowabunga dude! true");
    assert_eq!(output.exit_status, Some(ExitStatus::Code(0)));
    Ok(())
}

#[tokio::test]
async fn refused_exec() {
    let _ = env_logger::try_init();
    let (handle, _running) = logged_in(TestServer::default()).await;

    let result = handle.exec("refuse", ExecOptions::default()).await;
    assert!(matches!(result, Err(Error::RequestDenied)), "{result:?}");
}

#[tokio::test]
async fn one_program_per_channel() {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (handle, _running) = logged_in(server.clone()).await;

    let channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "sleep 10").await.unwrap();
    let second = channel.exec(true, "foo --bar").await;
    assert!(matches!(second, Err(Error::RequestDenied)), "{second:?}");
    // Environment changes are too late as well.
    let env = channel.set_env(true, "LANG", "C").await;
    assert!(matches!(env, Err(Error::RequestDenied)), "{env:?}");

    let seen = server.seen();
    assert_eq!(seen.processes.len(), 1);
    assert!(seen.requests.is_empty());
}

#[tokio::test]
async fn killed_by_a_signal() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let (handle, _running) = logged_in(TestServer::default()).await;

    let output = handle
        .exec("killed", ExecOptions::default())
        .await?
        .output()
        .await?;
    // Neither the second exit report nor the late data get through.
    assert_eq!(output.stdout, b"partial");
    assert_eq!(
        output.exit_status,
        Some(ExitStatus::Signal {
            signal: Sig::KILL,
            core_dumped: true,
            error_message: "killed".to_string(),
        })
    );
    Ok(())
}

#[tokio::test]
async fn window_changes_and_signals_reach_the_server() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let server = TestServer::default();
    let (handle, _running) = logged_in(server.clone()).await;

    let channel = handle.channel_open_session().await?;
    channel.exec(true, "sleep 10").await?;
    channel.window_change(100, 50, 0, 0).await?;
    channel.signal(Sig::TERM).await?;
    let output = channel.output().await?;
    assert_eq!(
        output.exit_status,
        Some(ExitStatus::Signal {
            signal: Sig::TERM,
            core_dumped: false,
            error_message: String::new(),
        })
    );
    assert_eq!(
        server.seen().requests,
        vec!["window-change 100x50", "signal TERM"]
    );
    Ok(())
}
