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

use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use ssh_encoding::Encode;
use ssh_key::PrivateKey;

use crate::helpers::NameList;
use crate::msg;

/// The name of the service requested before authentication.
pub(crate) const USERAUTH_SERVICE: &str = "ssh-userauth";
/// The service authenticated users get access to.
pub(crate) const CONNECTION_SERVICE: &str = "ssh-connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    None,
    Password,
    PublicKey,
    KeyboardInteractive,
}

impl From<&MethodKind> for &'static str {
    fn from(value: &MethodKind) -> Self {
        match value {
            MethodKind::None => "none",
            MethodKind::Password => "password",
            MethodKind::PublicKey => "publickey",
            MethodKind::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

impl FromStr for MethodKind {
    fn from_str(b: &str) -> Result<MethodKind, Self::Err> {
        match b {
            "none" => Ok(MethodKind::None),
            "password" => Ok(MethodKind::Password),
            "publickey" => Ok(MethodKind::PublicKey),
            "keyboard-interactive" => Ok(MethodKind::KeyboardInteractive),
            _ => Err(()),
        }
    }

    type Err = ();
}

impl From<&MethodKind> for String {
    fn from(value: &MethodKind) -> Self {
        <&str>::from(value).to_string()
    }
}

/// An ordered set of authentication methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSet(Vec<MethodKind>);

impl Deref for MethodSet {
    type Target = [MethodKind];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&[MethodKind]> for MethodSet {
    fn from(value: &[MethodKind]) -> Self {
        let mut this = Self::empty();
        for method in value {
            this.push(*method);
        }
        this
    }
}

impl From<&MethodSet> for NameList {
    fn from(value: &MethodSet) -> Self {
        Self(
            value
                .iter()
                .filter(|x| **x != MethodKind::None)
                .map(|x| x.into())
                .collect(),
        )
    }
}

impl From<&NameList> for MethodSet {
    fn from(value: &NameList) -> Self {
        Self(
            value
                .0
                .iter()
                .filter_map(|x| MethodKind::from_str(x).ok())
                .collect(),
        )
    }
}

impl MethodSet {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn all() -> Self {
        Self(vec![
            MethodKind::None,
            MethodKind::Password,
            MethodKind::PublicKey,
            MethodKind::KeyboardInteractive,
        ])
    }

    pub fn remove(&mut self, method: MethodKind) {
        self.0.retain(|x| *x != method);
    }

    /// Push a method to the end of the list.
    /// If the method is already in the list, it is moved to the end.
    pub fn push(&mut self, method: MethodKind) {
        self.remove(method);
        self.0.push(method);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    Failure {
        /// The server suggests to proceed with these auth methods
        remaining_methods: MethodSet,
        /// The server says that though auth method has been accepted,
        /// further authentication is required
        partial_success: bool,
    },
}

impl AuthResult {
    pub fn success(&self) -> bool {
        matches!(self, AuthResult::Success)
    }
}

/// One authentication attempt, as sent by the client.
#[derive(Debug, Clone)]
pub enum Method {
    None,
    Password { password: String },
    PublicKey { key: Arc<PrivateKey> },
    KeyboardInteractive { submethods: String },
}

impl Method {
    pub(crate) fn kind(&self) -> MethodKind {
        match self {
            Method::None => MethodKind::None,
            Method::Password { .. } => MethodKind::Password,
            Method::PublicKey { .. } => MethodKind::PublicKey,
            Method::KeyboardInteractive { .. } => MethodKind::KeyboardInteractive,
        }
    }
}

/// A prompt of a keyboard-interactive exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub prompt: String,
    pub echo: bool,
}

/// The bytes covered by a `publickey` signature
/// ([RFC 4252 §7](https://tools.ietf.org/html/rfc4252#section-7)).
pub(crate) fn publickey_signed_data(
    session_id: &[u8],
    user: &str,
    algorithm: &str,
    key_blob: &[u8],
) -> Result<Vec<u8>, ssh_encoding::Error> {
    let mut buf = Vec::new();
    session_id.encode(&mut buf)?;
    msg::USERAUTH_REQUEST.encode(&mut buf)?;
    user.encode(&mut buf)?;
    CONNECTION_SERVICE.encode(&mut buf)?;
    "publickey".encode(&mut buf)?;
    true.encode(&mut buf)?;
    algorithm.encode(&mut buf)?;
    key_blob.encode(&mut buf)?;
    Ok(buf)
}
