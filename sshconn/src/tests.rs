#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)] // Allow unwraps, expects and panics in the test suite

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use ssh_encoding::Decode;
use ssh_key::{PrivateKey, PublicKey};

use super::*;
use crate::keys::HostHash;
use crate::server::{Auth, PublicKeyAttempt};

mod auth;
mod channels;
mod exec;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn host_key() -> PrivateKey {
    keys::load_secret_key(fixture("host_ed25519")).unwrap()
}

fn server_config() -> server::Config {
    server::Config {
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: None,
        ..Default::default()
    }
}

/// Runs a server session and connects a client to it over an
/// in-memory pipe.
async fn connect_pair(
    server_config: server::Config,
    client_config: client::Config,
    server: TestServer,
    client: TestClient,
) -> (client::Handle<TestClient>, server::RunningSession<TestServer>) {
    let (a, b) = tokio::io::duplex(65536);
    let host_key = host_key();
    let (server_transport, client_transport) =
        tokio::join!(ClearTransport::server(a, &host_key), ClearTransport::client(b));
    let running = server::run_stream(Arc::new(server_config), server_transport.unwrap(), server);
    let handle = client::connect(Arc::new(client_config), client_transport.unwrap(), client)
        .await
        .unwrap();
    (handle, running)
}

/// Connects and authenticates with the password the test server knows.
async fn logged_in(
    server: TestServer,
) -> (client::Handle<TestClient>, server::RunningSession<TestServer>) {
    let (mut handle, running) = connect_pair(
        server_config(),
        client::Config::default(),
        server,
        TestClient::default(),
    )
    .await;
    handle
        .authenticate(client::Credentials::new(USER).password(PASSWORD))
        .await
        .unwrap();
    (handle, running)
}

const USER: &str = "nodejs";
const PASSWORD: &str = "FLUXCAPACITORISTHEPOWER";

/// A signed public key attempt.
#[derive(Debug, PartialEq)]
struct SeenKey {
    key_type: String,
    /// Named in the request.
    algorithm: String,
    /// Named in the signature blob.
    signed_with: Option<String>,
    verified: bool,
}

/// What the test server saw.
#[derive(Debug, Default)]
struct Seen {
    publickeys: Vec<SeenKey>,
    passwords: usize,
    requests: Vec<String>,
    processes: Vec<ProcessRequest>,
    data: Vec<u8>,
    disconnects: Vec<DisconnectReason>,
}

#[derive(Clone)]
struct TestServer {
    seen: Arc<Mutex<Seen>>,
    accept_channels: bool,
    channels: Arc<Mutex<Vec<Channel<server::Msg>>>>,
    /// How long password checks take.
    password_delay: Duration,
}

impl Default for TestServer {
    fn default() -> Self {
        TestServer {
            seen: Arc::default(),
            accept_channels: true,
            channels: Arc::default(),
            password_delay: Duration::ZERO,
        }
    }
}

impl TestServer {
    fn seen(&self) -> std::sync::MutexGuard<'_, Seen> {
        self.seen.lock().unwrap()
    }

    fn request(&self, name: &str) -> Decision {
        self.seen().requests.push(name.to_string());
        Decision::Accept
    }
}

impl server::Handler for TestServer {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Error> {
        self.seen().passwords += 1;
        tokio::time::sleep(self.password_delay).await;
        if user == USER && password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey(&mut self, user: &str, attempt: &PublicKeyAttempt) -> Result<Auth, Error> {
        if attempt.signature.is_none() {
            return Ok(Auth::Accept);
        }
        let verified = attempt.verify_signature();
        let signed_with = attempt
            .signature
            .as_deref()
            .and_then(|mut sig| keys::Signature::decode(&mut sig).ok())
            .map(|sig| sig.algorithm().as_str().to_string());
        self.seen().publickeys.push(SeenKey {
            key_type: keys::algorithm_tag(&attempt.key),
            algorithm: attempt.algorithm.clone(),
            signed_with,
            verified,
        });
        if user == USER && verified {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _: &str,
        response: Option<&[String]>,
    ) -> Result<Auth, Error> {
        match response {
            None => Ok(Auth::Prompt {
                name: "Login".into(),
                instructions: "".into(),
                prompts: Cow::Owned(vec![(Cow::Borrowed("Password: "), false)]),
            }),
            Some([password]) if user == USER && password == PASSWORD => Ok(Auth::Accept),
            Some(_) => Ok(Auth::reject()),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<server::Msg>,
        _: &mut server::Session,
    ) -> Result<bool, Error> {
        self.channels.lock().unwrap().push(channel);
        Ok(self.accept_channels)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut server::Session,
    ) -> Result<(), Error> {
        self.seen().data.extend_from_slice(data);
        session.data(channel, Bytes::copy_from_slice(data))
    }

    async fn pty_request(
        &mut self,
        _: ChannelId,
        _: &PtyInfo,
        _: &mut server::Session,
    ) -> Result<Decision, Error> {
        Ok(self.request("pty-req"))
    }

    async fn env_request(
        &mut self,
        _: ChannelId,
        _: &str,
        _: &str,
        _: &mut server::Session,
    ) -> Result<Decision, Error> {
        Ok(self.request("env"))
    }

    async fn x11_request(
        &mut self,
        _: ChannelId,
        _: &X11Request,
        _: &mut server::Session,
    ) -> Result<Decision, Error> {
        Ok(self.request("x11-req"))
    }

    async fn agent_request(&mut self, _: ChannelId, _: &mut server::Session) -> Result<Decision, Error> {
        Ok(self.request("auth-agent-req@openssh.com"))
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        process: &ProcessRequest,
        session: &mut server::Session,
    ) -> Result<Decision, Error> {
        debug!("exec {:?}", process.command());
        self.seen().processes.push(process.clone());
        match process.command() {
            Some("foo --bar") => {
                session.extended_data(channel, 1, Bytes::from_static(b"stderr data!\n"))?;
                session.data(channel, Bytes::from_static(b"stdout data!\n"))?;
                session.exit_status_request(channel, 100)?;
                session.eof(channel)?;
                session.close(channel)?;
                Ok(Decision::Accept)
            }
            Some("killed") => {
                session.data(channel, Bytes::from_static(b"partial"))?;
                session.exit_signal_request(channel, Sig::KILL, true, "killed", "en")?;
                // Both are past the end of the program.
                session.exit_status_request(channel, 1)?;
                session.data(channel, Bytes::from_static(b"late"))?;
                session.close(channel)?;
                Ok(Decision::Accept)
            }
            Some("refuse") => Ok(Decision::Reject),
            // Keeps running until the client closes the channel.
            _ => Ok(Decision::Accept),
        }
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        process: &ProcessRequest,
        session: &mut server::Session,
    ) -> Result<Decision, Error> {
        self.seen().processes.push(process.clone());
        let greeting = format!("Cowabunga dude! {}", process.pty.is_some());
        session.data(channel, greeting.into())?;
        session.exit_status_request(channel, 0)?;
        session.close(channel)?;
        Ok(Decision::Accept)
    }

    async fn window_change_request(
        &mut self,
        _: ChannelId,
        cols: u32,
        rows: u32,
        _: u32,
        _: u32,
        _: &mut server::Session,
    ) -> Result<(), Error> {
        self.seen().requests.push(format!("window-change {cols}x{rows}"));
        Ok(())
    }

    /// Ends the program as if the signal killed it.
    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut server::Session,
    ) -> Result<(), Error> {
        self.seen().requests.push(format!("signal {signal:?}"));
        session.exit_signal_request(channel, signal, false, "", "en")?;
        session.close(channel)
    }

    async fn disconnected(&mut self, reason: DisconnectReason) -> Result<(), Error> {
        self.seen().disconnects.push(reason);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct TestClient {
    fingerprint: Arc<Mutex<Option<String>>>,
    disconnects: Arc<Mutex<Vec<DisconnectReason>>>,
}

impl client::Handler for TestClient {
    type Error = Error;

    async fn check_server_key(&mut self, _: &PublicKey) -> Result<bool, Error> {
        Ok(true)
    }

    async fn verify_host_fingerprint(&mut self, _: HostHash, fingerprint: &str) -> Result<bool, Error> {
        *self.fingerprint.lock().unwrap() = Some(fingerprint.to_string());
        Ok(true)
    }

    async fn disconnected(&mut self, reason: DisconnectReason) -> Result<(), Error> {
        self.disconnects.lock().unwrap().push(reason);
        Ok(())
    }
}
