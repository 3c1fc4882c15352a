// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use std::sync::Arc;

use log::{debug, warn};
use ssh_encoding::{Decode, Encode};
use ssh_key::PrivateKey;

use super::{Handle, Handler, Reply, Session};
use crate::auth::{
    publickey_signed_data, AuthResult, Method, MethodKind, MethodSet, Prompt, CONNECTION_SERVICE,
    USERAUTH_SERVICE,
};
use crate::helpers::NameList;
use crate::{keys, msg, Disconnect, Error};

/// Answers the prompts of a keyboard-interactive exchange.
pub trait KeyboardInteractive: Send {
    /// Returns one response per prompt, in order.
    fn respond(&mut self, name: &str, instructions: &str, prompts: &[Prompt]) -> Vec<String>;
}

impl<F> KeyboardInteractive for F
where
    F: FnMut(&str, &str, &[Prompt]) -> Vec<String> + Send,
{
    fn respond(&mut self, name: &str, instructions: &str, prompts: &[Prompt]) -> Vec<String> {
        self(name, instructions, prompts)
    }
}

/// How [`Handle::authenticate`] walks through the credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPolicy {
    /// Do not try methods missing from the server's last list of
    /// methods that can continue.
    pub skip_unadvertised: bool,
    /// Give up as soon as a method is only partially successful,
    /// instead of trying the next credentials for the next factor.
    pub stop_after_partial_success: bool,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        AuthPolicy {
            skip_unadvertised: true,
            stop_after_partial_success: false,
        }
    }
}

enum Candidate {
    Password(String),
    Key(Arc<PrivateKey>),
    KeyboardInteractive {
        submethods: String,
        responder: Box<dyn KeyboardInteractive>,
    },
}

impl Candidate {
    fn kind(&self) -> MethodKind {
        match self {
            Candidate::Password(_) => MethodKind::Password,
            Candidate::Key(_) => MethodKind::PublicKey,
            Candidate::KeyboardInteractive { .. } => MethodKind::KeyboardInteractive,
        }
    }
}

/// What a client can authenticate with, tried in the order they were
/// added.
///
/// ```
/// use sshconn::client::Credentials;
///
/// let credentials = Credentials::new("nodejs")
///     .password("FLUXCAPACITORISTHEPOWER")
///     .keyboard_interactive(|_: &str, _: &str, prompts: &[sshconn::client::Prompt]| {
///         prompts.iter().map(|_| "1234".to_string()).collect()
///     });
/// ```
pub struct Credentials {
    user: String,
    candidates: Vec<Candidate>,
    policy: AuthPolicy,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field(
                "methods",
                &self.candidates.iter().map(|c| c.kind()).collect::<Vec<_>>(),
            )
            .field("policy", &self.policy)
            .finish()
    }
}

impl Credentials {
    pub fn new<U: Into<String>>(user: U) -> Self {
        Credentials {
            user: user.into(),
            candidates: Vec::new(),
            policy: AuthPolicy::default(),
        }
    }

    pub fn password<P: Into<String>>(mut self, password: P) -> Self {
        self.candidates.push(Candidate::Password(password.into()));
        self
    }

    pub fn key<K: Into<Arc<PrivateKey>>>(mut self, key: K) -> Self {
        self.candidates.push(Candidate::Key(key.into()));
        self
    }

    pub fn keyboard_interactive<R: KeyboardInteractive + 'static>(self, responder: R) -> Self {
        self.keyboard_interactive_with_submethods("", responder)
    }

    pub fn keyboard_interactive_with_submethods<S: Into<String>, R: KeyboardInteractive + 'static>(
        mut self,
        submethods: S,
        responder: R,
    ) -> Self {
        self.candidates.push(Candidate::KeyboardInteractive {
            submethods: submethods.into(),
            responder: Box::new(responder),
        });
        self
    }

    pub fn policy(mut self, policy: AuthPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// The outcome of one step of a keyboard-interactive exchange.
#[derive(Debug)]
pub enum KeyboardInteractiveAuthResponse {
    Success,
    Failure {
        /// The server suggests to proceed with these auth methods
        remaining_methods: MethodSet,
        /// The server says that though auth method has been accepted,
        /// further authentication is required
        partial_success: bool,
    },
    InfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
}

impl<H: Handler> Handle<H> {
    /// Authenticates with the first credentials the server accepts.
    ///
    /// A `none` request goes first, to learn which methods the server
    /// offers, then each credential is tried in turn, waiting for the
    /// server's answer before the next one. When every credential was
    /// rejected, the connection is closed with
    /// [`Disconnect::NoMoreAuthMethodsAvailable`] and
    /// [`Error::NoMoreAuthMethods`] is returned. The whole negotiation is
    /// bounded by [`super::Config::ready_timeout`]: past it, the
    /// connection is closed and every later authentication call on this
    /// handle fails with [`Error::ConnectionTimeout`].
    pub async fn authenticate(&mut self, credentials: Credentials) -> Result<(), Error> {
        let sleep = crate::future_or_pending(self.config().ready_timeout, tokio::time::sleep);
        tokio::select! {
            r = self.negotiate(credentials) => r,
            () = sleep => {
                debug!("authentication timed out");
                self.abandon_authentication();
                if let Err(e) = self
                    .disconnect(Disconnect::ByApplication, "authentication timed out", "en")
                    .await
                {
                    debug!("could not disconnect: {:?}", e);
                }
                Err(Error::ConnectionTimeout)
            }
        }
    }

    async fn negotiate(&mut self, credentials: Credentials) -> Result<(), Error> {
        let Credentials {
            user,
            candidates,
            policy,
        } = credentials;
        let mut advertised = match self.authenticate_none(user.as_str()).await? {
            AuthResult::Success => return Ok(()),
            AuthResult::Failure {
                remaining_methods, ..
            } => remaining_methods,
        };
        debug!("server offers {:?}", advertised);

        for candidate in candidates {
            let kind = candidate.kind();
            if policy.skip_unadvertised && !advertised.contains(&kind) {
                debug!("skipping {:?}, not offered by the server", kind);
                continue;
            }
            let result = match candidate {
                Candidate::Password(password) => {
                    self.authenticate_password(user.as_str(), password).await?
                }
                Candidate::Key(key) => self.authenticate_publickey(user.as_str(), key).await?,
                Candidate::KeyboardInteractive {
                    submethods,
                    mut responder,
                } => {
                    self.keyboard_interactive(user.as_str(), submethods, responder.as_mut())
                        .await?
                }
            };
            match result {
                AuthResult::Success => return Ok(()),
                AuthResult::Failure {
                    remaining_methods,
                    partial_success,
                } => {
                    debug!(
                        "{:?} rejected (partial success: {}), remaining {:?}",
                        kind, partial_success, remaining_methods
                    );
                    if partial_success && policy.stop_after_partial_success {
                        break;
                    }
                    advertised = remaining_methods;
                }
            }
        }

        self.disconnect(
            Disconnect::NoMoreAuthMethodsAvailable,
            "No more authentication methods available",
            "en",
        )
        .await?;
        Err(Error::NoMoreAuthMethods)
    }

    async fn keyboard_interactive(
        &mut self,
        user: &str,
        submethods: String,
        responder: &mut dyn KeyboardInteractive,
    ) -> Result<AuthResult, Error> {
        let mut response = self
            .authenticate_keyboard_interactive_start(user, submethods)
            .await?;
        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(AuthResult::Success),
                KeyboardInteractiveAuthResponse::Failure {
                    remaining_methods,
                    partial_success,
                } => {
                    return Ok(AuthResult::Failure {
                        remaining_methods,
                        partial_success,
                    })
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    let responses = responder.respond(&name, &instructions, &prompts);
                    response = self
                        .authenticate_keyboard_interactive_respond(responses)
                        .await?;
                }
            }
        }
    }
}

/// The event loop's view of authentication.
#[derive(Debug, Default)]
pub(crate) struct AuthState {
    service_accepted: bool,
    pub authenticated: bool,
    /// The attempt whose answer we are waiting for.
    current: Option<MethodKind>,
    /// An attempt made before the server accepted the service request.
    queued: Option<(String, Method)>,
}

impl Session {
    pub(crate) fn request_userauth_service(&mut self) -> Result<(), Error> {
        self.common.write.packet(|w| {
            msg::SERVICE_REQUEST.encode(w)?;
            USERAUTH_SERVICE.encode(w)
        })
    }

    pub(crate) fn authenticate(&mut self, user: String, method: Method) -> Result<(), Error> {
        if self.auth.authenticated {
            debug!("already authenticated");
            return self.reply(Reply::AuthSuccess);
        }
        if !self.auth.service_accepted {
            debug!("waiting for the service to be accepted");
            self.auth.queued = Some((user, method));
            return Ok(());
        }
        self.write_auth_request(&user, &method)
    }

    pub(crate) fn service_accepted(&mut self, r: &mut &[u8]) -> Result<(), Error> {
        let service = String::decode(r)?;
        if service != USERAUTH_SERVICE {
            warn!("unexpected service accepted: {:?}", service);
            return Ok(());
        }
        debug!("{} accepted", service);
        self.auth.service_accepted = true;
        if let Some((user, method)) = self.auth.queued.take() {
            self.write_auth_request(&user, &method)?;
        }
        Ok(())
    }

    fn write_auth_request(&mut self, user: &str, method: &Method) -> Result<(), Error> {
        debug!("trying {:?} for {:?}", method.kind(), user);
        let mut w = Vec::new();
        msg::USERAUTH_REQUEST.encode(&mut w)?;
        user.encode(&mut w)?;
        CONNECTION_SERVICE.encode(&mut w)?;
        match method {
            Method::None => "none".encode(&mut w)?,
            Method::Password { password } => {
                "password".encode(&mut w)?;
                false.encode(&mut w)?;
                password.encode(&mut w)?;
            }
            Method::PublicKey { key } => {
                let algorithm = keys::signature_algorithm(key.public_key());
                let blob = keys::public_key_blob(key.public_key())?;
                let signed = publickey_signed_data(&self.common.session_id, user, &algorithm, &blob)?;
                "publickey".encode(&mut w)?;
                true.encode(&mut w)?;
                algorithm.encode(&mut w)?;
                blob.encode(&mut w)?;
                keys::sign(key, &algorithm, &signed)?.encode(&mut w)?;
            }
            Method::KeyboardInteractive { submethods } => {
                "keyboard-interactive".encode(&mut w)?;
                "".encode(&mut w)?; // language tag, deprecated
                submethods.encode(&mut w)?;
            }
        }
        self.common.write.push(w);
        self.common.auth_user = user.to_string();
        self.auth.current = Some(method.kind());
        Ok(())
    }

    pub(crate) fn auth_info_response(&mut self, responses: Vec<String>) -> Result<(), Error> {
        if self.auth.current != Some(MethodKind::KeyboardInteractive) {
            warn!("no keyboard-interactive exchange in progress");
            return Ok(());
        }
        self.common.write.packet(|w| {
            msg::USERAUTH_INFO_RESPONSE.encode(w)?;
            (responses.len() as u32).encode(w)?;
            for response in &responses {
                response.encode(w)?;
            }
            Ok(())
        })
    }

    /// `USERAUTH_SUCCESS`, `USERAUTH_FAILURE` and `USERAUTH_INFO_REQUEST`.
    pub(crate) fn auth_reply(&mut self, typ: u8, r: &mut &[u8]) -> Result<(), Error> {
        if self.auth.authenticated || self.auth.current.is_none() {
            warn!("unexpected {}", msg::name(typ));
            return Ok(());
        }
        match typ {
            msg::USERAUTH_SUCCESS => {
                debug!("authenticated as {:?}", self.common.auth_user);
                self.auth.authenticated = true;
                self.auth.current = None;
                self.reply(Reply::AuthSuccess)
            }
            msg::USERAUTH_FAILURE => {
                let remaining = NameList::decode(r)?;
                let partial_success = bool::decode(r)?;
                debug!("{:?} failed, remaining {:?}", self.auth.current, remaining);
                self.auth.current = None;
                self.reply(Reply::AuthFailure {
                    proceed_with_methods: MethodSet::from(&remaining),
                    partial_success,
                })
            }
            _ if self.auth.current == Some(MethodKind::KeyboardInteractive) => {
                let name = String::decode(r)?;
                let instructions = String::decode(r)?;
                let _language_tag = String::decode(r)?;
                let n = u32::decode(r)?;
                let mut prompts = Vec::new();
                for _ in 0..n {
                    prompts.push(Prompt {
                        prompt: String::decode(r)?,
                        echo: bool::decode(r)?,
                    });
                }
                self.reply(Reply::AuthInfoRequest {
                    name,
                    instructions,
                    prompts,
                })
            }
            _ => {
                // Public keys are sent signed, without a query first.
                debug!("ignoring USERAUTH_PK_OK");
                Ok(())
            }
        }
    }

    fn reply(&mut self, reply: Reply) -> Result<(), Error> {
        self.sender.send(reply).map_err(|_| Error::SendError)
    }
}
