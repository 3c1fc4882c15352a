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

use std::str::FromStr;
use std::time::Duration;

use log::{debug, warn};
use ssh_encoding::{Decode, Encode};
use ssh_key::PublicKey;
use tokio::time::Instant;

use super::{Auth, Handler, Session};
use crate::auth::{publickey_signed_data, MethodKind, MethodSet, CONNECTION_SERVICE, USERAUTH_SERVICE};
use crate::helpers::NameList;
use crate::{keys, msg, Disconnect, Error};

/// A `publickey` authentication request.
#[derive(Debug, Clone)]
pub struct PublicKeyAttempt {
    /// The signature algorithm the client named, e.g. `ssh-ed25519` or
    /// `rsa-sha2-512`. The key's own type is `key.algorithm()`.
    pub algorithm: String,
    pub key: PublicKey,
    /// The key as the client sent it.
    pub key_blob: Vec<u8>,
    /// `None` when the client only asks whether the key is acceptable.
    pub signature: Option<Vec<u8>>,
    /// The bytes the signature is supposed to cover.
    pub signed_data: Vec<u8>,
}

impl PublicKeyAttempt {
    /// Whether the signature was made by the key over the session's
    /// data, with the announced algorithm. A query without a signature
    /// never verifies.
    pub fn verify_signature(&self) -> bool {
        match &self.signature {
            Some(signature) => keys::verify(&self.key, &self.algorithm, &self.signed_data, signature),
            None => false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct AuthState {
    service_accepted: bool,
    pub authenticated: bool,
    /// Advertised in failures.
    methods: MethodSet,
    attempts: usize,
    probed: bool,
    /// User and submethods of a keyboard-interactive exchange in progress.
    keyboard_interactive: Option<(String, String)>,
}

impl AuthState {
    pub fn new(methods: MethodSet) -> Self {
        AuthState {
            service_accepted: false,
            authenticated: false,
            methods,
            attempts: 0,
            probed: false,
            keyboard_interactive: None,
        }
    }
}

impl Session {
    pub(super) fn service_request(&mut self, r: &mut &[u8]) -> Result<(), Error> {
        let service = String::decode(r)?;
        if self.auth.service_accepted {
            warn!("duplicate service request {:?}", service);
            return Ok(());
        }
        if service != USERAUTH_SERVICE {
            debug!("service {:?} not available", service);
            return self.common.disconnect(
                Disconnect::ServiceNotAvailable,
                "service not available",
                "en",
            );
        }
        self.auth.service_accepted = true;
        self.common.write.packet(|w| {
            msg::SERVICE_ACCEPT.encode(w)?;
            USERAUTH_SERVICE.encode(w)
        })?;
        if let Some(banner) = self.common.config.auth_banner {
            self.common.write.packet(|w| {
                msg::USERAUTH_BANNER.encode(w)?;
                banner.encode(w)?;
                "".encode(w)
            })?;
        }
        Ok(())
    }

    fn write_auth_failure(&mut self, partial_success: bool) -> Result<(), Error> {
        let methods = NameList::from(&self.auth.methods);
        debug!("auth failure, proceed with {:?}", methods);
        self.common.write.packet(|w| {
            msg::USERAUTH_FAILURE.encode(w)?;
            methods.encode(w)?;
            partial_success.encode(w)
        })
    }

    /// Only the first `none` request may be answered early.
    fn rejection_time(&mut self, kind: MethodKind) -> Duration {
        let config = &self.common.config;
        if kind == MethodKind::None && !self.auth.probed {
            self.auth.probed = true;
            config
                .auth_rejection_time_initial
                .unwrap_or(config.auth_rejection_time)
        } else {
            self.full_rejection_time()
        }
    }

    /// The delay for methods or services that are not offered at all.
    fn full_rejection_time(&self) -> Duration {
        self.common.config.auth_rejection_time
    }
}

/// `USERAUTH_REQUEST`.
pub(super) async fn userauth_request<H: Handler>(
    session: &mut Session,
    handler: &mut H,
    r: &mut &[u8],
) -> Result<(), H::Error> {
    if session.auth.authenticated {
        warn!("authentication request after success, ignored");
        return Ok(());
    }
    if !session.auth.service_accepted {
        warn!("authentication request before the service request, ignored");
        return Ok(());
    }
    let started = Instant::now();
    let user = String::decode(r).map_err(Error::from)?;
    let service = String::decode(r).map_err(Error::from)?;
    let method = String::decode(r).map_err(Error::from)?;
    debug!("{} auth for {:?}", method, user);
    session.auth.keyboard_interactive = None;

    let kind = MethodKind::from_str(&method)
        .ok()
        .filter(|kind| session.auth.methods.contains(kind) || *kind == MethodKind::None);
    let Some(kind) = kind.filter(|_| service == CONNECTION_SERVICE) else {
        debug!("method {:?} for service {:?} not offered", method, service);
        let delay = session.full_rejection_time();
        return Ok(reject(session, started + delay).await?);
    };

    let auth = match kind {
        MethodKind::None if !session.auth.methods.contains(&MethodKind::None) => Auth::reject(),
        MethodKind::None => handler.auth_none(&user).await?,
        MethodKind::Password => {
            let _change = bool::decode(r).map_err(Error::from)?;
            let password = String::decode(r).map_err(Error::from)?;
            handler.auth_password(&user, &password).await?
        }
        MethodKind::PublicKey => {
            let signed = bool::decode(r).map_err(Error::from)?;
            let algorithm = String::decode(r).map_err(Error::from)?;
            let key_blob = Vec::<u8>::decode(r).map_err(Error::from)?;
            let key = match keys::parse_public_key(&key_blob) {
                Ok(key) => key,
                Err(e) => {
                    debug!("unreadable public key: {:?}", e);
                    let delay = session.rejection_time(kind);
                    return Ok(reject(session, started + delay).await?);
                }
            };
            let signature = if signed {
                Some(Vec::<u8>::decode(r).map_err(Error::from)?)
            } else {
                None
            };
            let signed_data =
                publickey_signed_data(&session.common.session_id, &user, &algorithm, &key_blob)
                    .map_err(Error::from)?;
            let attempt = PublicKeyAttempt {
                algorithm,
                key,
                key_blob,
                signature,
                signed_data,
            };
            let auth = handler.auth_publickey(&user, &attempt).await?;
            if auth == Auth::Accept && attempt.signature.is_none() {
                debug!("public key acceptable, waiting for a signature");
                session.common.write.packet(|w| {
                    msg::USERAUTH_INFO_REQUEST_OR_USERAUTH_PK_OK.encode(w)?;
                    attempt.algorithm.encode(w)?;
                    attempt.key_blob.encode(w)
                })?;
                return Ok(());
            }
            auth
        }
        MethodKind::KeyboardInteractive => {
            let _language_tag = String::decode(r).map_err(Error::from)?;
            let submethods = String::decode(r).map_err(Error::from)?;
            session.auth.keyboard_interactive = Some((user.clone(), submethods.clone()));
            handler
                .auth_keyboard_interactive(&user, &submethods, None)
                .await?
        }
    };
    apply(session, handler, &user, kind, auth, started).await
}

/// `USERAUTH_INFO_RESPONSE`.
pub(super) async fn info_response<H: Handler>(
    session: &mut Session,
    handler: &mut H,
    r: &mut &[u8],
) -> Result<(), H::Error> {
    let Some((user, submethods)) = session.auth.keyboard_interactive.clone() else {
        warn!("unexpected keyboard-interactive response, ignored");
        return Ok(());
    };
    let started = Instant::now();
    let n = u32::decode(r).map_err(Error::from)?;
    let mut responses = Vec::new();
    for _ in 0..n {
        responses.push(String::decode(r).map_err(Error::from)?);
    }
    let auth = handler
        .auth_keyboard_interactive(&user, &submethods, Some(&responses))
        .await?;
    apply(
        session,
        handler,
        &user,
        MethodKind::KeyboardInteractive,
        auth,
        started,
    )
    .await
}

async fn apply<H: Handler>(
    session: &mut Session,
    handler: &mut H,
    user: &str,
    kind: MethodKind,
    auth: Auth,
    started: Instant,
) -> Result<(), H::Error> {
    match auth {
        Auth::Accept => {
            debug!("{:?} authenticated with {:?}", user, kind);
            session.auth.keyboard_interactive = None;
            session.auth.authenticated = true;
            session.common.auth_user = user.to_string();
            session
                .common
                .write
                .packet(|w| msg::USERAUTH_SUCCESS.encode(w))?;
            handler.auth_succeeded(session).await?;
        }
        Auth::Partial {
            proceed_with_methods,
        } => {
            session.auth.keyboard_interactive = None;
            session.auth.methods = proceed_with_methods;
            session.write_auth_failure(true)?;
        }
        Auth::Prompt {
            name,
            instructions,
            prompts,
        } if kind == MethodKind::KeyboardInteractive => {
            session.common.write.packet(|w| {
                msg::USERAUTH_INFO_REQUEST_OR_USERAUTH_PK_OK.encode(w)?;
                name.as_ref().encode(w)?;
                instructions.as_ref().encode(w)?;
                "".encode(w)?; // language tag, deprecated
                (prompts.len() as u32).encode(w)?;
                for (prompt, echo) in prompts.iter() {
                    prompt.as_ref().encode(w)?;
                    echo.encode(w)?;
                }
                Ok(())
            })?;
        }
        Auth::Prompt { .. } => {
            warn!("prompts are only possible with keyboard-interactive");
            let delay = session.rejection_time(kind);
            reject(session, started + delay).await?;
        }
        Auth::Reject {
            proceed_with_methods,
        } => {
            session.auth.keyboard_interactive = None;
            if let Some(methods) = proceed_with_methods {
                session.auth.methods = methods;
            }
            let delay = session.rejection_time(kind);
            if kind != MethodKind::None {
                session.auth.attempts += 1;
            }
            reject(session, started + delay).await?;
        }
    }
    Ok(())
}

async fn reject(session: &mut Session, deadline: Instant) -> Result<(), Error> {
    tokio::time::sleep_until(deadline).await;
    if session.auth.attempts >= session.common.config.max_auth_attempts {
        debug!("too many authentication failures");
        return session.common.disconnect(
            Disconnect::NoMoreAuthMethodsAvailable,
            "too many authentication failures",
            "en",
        );
    }
    session.write_auth_failure(false)
}
