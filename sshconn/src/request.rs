//! Channel requests
//! ([RFC 4254 §6](https://tools.ietf.org/html/rfc4254#section-6)) and
//! the per-channel bookkeeping around them.
//!
//! Requests on a `session` channel go through a [`SessionRouter`]
//! before any handler sees them. The router knows where the session
//! stands (before or after its process started) and refuses requests
//! that make no sense at that point, such as a second `exec`. What
//! the handlers accepted is remembered and handed over, with the
//! command, as a [`ProcessRequest`].

use std::collections::{HashMap, VecDeque};

use data_encoding::HEXLOWER;
use log::{debug, warn};
use rand::RngCore;
use ssh_encoding::{Decode, Encode};
use tokio::sync::oneshot;

use crate::{msg, Error, PtyInfo, Sig};

/// A request on a channel, with its type-specific fields.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChannelRequest {
    Pty(PtyInfo),
    Env {
        name: String,
        value: String,
    },
    Exec {
        command: String,
    },
    Shell,
    Subsystem {
        name: String,
    },
    X11(X11Request),
    AgentForward,
    WindowChange {
        cols: u32,
        rows: u32,
        width: u32,
        height: u32,
    },
    Signal(Sig),
    ExitStatus(u32),
    ExitSignal {
        signal: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    XonXoff {
        client_can_do: bool,
    },
    /// Anything else. Always refused.
    Unknown {
        name: String,
    },
}

const AGENT_REQUEST: &str = "auth-agent-req@openssh.com";

impl ChannelRequest {
    /// The request type, as sent on the wire.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequest::Pty(_) => "pty-req",
            ChannelRequest::Env { .. } => "env",
            ChannelRequest::Exec { .. } => "exec",
            ChannelRequest::Shell => "shell",
            ChannelRequest::Subsystem { .. } => "subsystem",
            ChannelRequest::X11(_) => "x11-req",
            ChannelRequest::AgentForward => AGENT_REQUEST,
            ChannelRequest::WindowChange { .. } => "window-change",
            ChannelRequest::Signal(_) => "signal",
            ChannelRequest::ExitStatus(_) => "exit-status",
            ChannelRequest::ExitSignal { .. } => "exit-signal",
            ChannelRequest::XonXoff { .. } => "xon-xoff",
            ChannelRequest::Unknown { name } => name,
        }
    }

    /// Encodes a complete `CHANNEL_REQUEST` message.
    pub(crate) fn message(&self, recipient_channel: u32, want_reply: bool) -> Result<Vec<u8>, Error> {
        let mut w = Vec::new();
        msg::CHANNEL_REQUEST.encode(&mut w)?;
        recipient_channel.encode(&mut w)?;
        self.name().encode(&mut w)?;
        want_reply.encode(&mut w)?;
        match self {
            ChannelRequest::Pty(pty) => pty.encode(&mut w)?,
            ChannelRequest::Env { name, value } => {
                name.encode(&mut w)?;
                value.encode(&mut w)?;
            }
            ChannelRequest::Exec { command } => command.encode(&mut w)?,
            ChannelRequest::Subsystem { name } => name.encode(&mut w)?,
            ChannelRequest::X11(x11) => {
                x11.single_connection.encode(&mut w)?;
                x11.auth_protocol.encode(&mut w)?;
                x11.auth_cookie.encode(&mut w)?;
                x11.screen_number.encode(&mut w)?;
            }
            ChannelRequest::WindowChange {
                cols,
                rows,
                width,
                height,
            } => {
                cols.encode(&mut w)?;
                rows.encode(&mut w)?;
                width.encode(&mut w)?;
                height.encode(&mut w)?;
            }
            ChannelRequest::Signal(sig) => sig.name().encode(&mut w)?,
            ChannelRequest::ExitStatus(status) => status.encode(&mut w)?,
            ChannelRequest::ExitSignal {
                signal,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                signal.name().encode(&mut w)?;
                core_dumped.encode(&mut w)?;
                error_message.encode(&mut w)?;
                lang_tag.encode(&mut w)?;
            }
            ChannelRequest::XonXoff { client_can_do } => client_can_do.encode(&mut w)?,
            ChannelRequest::Shell | ChannelRequest::AgentForward | ChannelRequest::Unknown { .. } => {}
        }
        Ok(w)
    }

    /// Decodes the type-specific part of a request named `name`.
    pub(crate) fn decode(name: &str, r: &mut &[u8]) -> Result<Self, Error> {
        Ok(match name {
            "pty-req" => ChannelRequest::Pty(PtyInfo::decode(r)?),
            "env" => ChannelRequest::Env {
                name: String::decode(r)?,
                value: String::decode(r)?,
            },
            "exec" => ChannelRequest::Exec {
                command: String::decode(r)?,
            },
            "shell" => ChannelRequest::Shell,
            "subsystem" => ChannelRequest::Subsystem {
                name: String::decode(r)?,
            },
            "x11-req" => ChannelRequest::X11(X11Request {
                single_connection: bool::decode(r)?,
                auth_protocol: String::decode(r)?,
                auth_cookie: String::decode(r)?,
                screen_number: u32::decode(r)?,
            }),
            AGENT_REQUEST | "auth-agent-req" => ChannelRequest::AgentForward,
            "window-change" => ChannelRequest::WindowChange {
                cols: u32::decode(r)?,
                rows: u32::decode(r)?,
                width: u32::decode(r)?,
                height: u32::decode(r)?,
            },
            "signal" => ChannelRequest::Signal(Sig::from_name(&String::decode(r)?)),
            "exit-status" => ChannelRequest::ExitStatus(u32::decode(r)?),
            "exit-signal" => {
                let signal = Sig::from_name(&String::decode(r)?);
                let core_dumped = bool::decode(r)?;
                let error_message = String::decode(r)?;
                // Some implementations leave the language tag out.
                let lang_tag = String::decode(r).unwrap_or_default();
                ChannelRequest::ExitSignal {
                    signal,
                    core_dumped,
                    error_message,
                    lang_tag,
                }
            }
            "xon-xoff" => ChannelRequest::XonXoff {
                client_can_do: bool::decode(r)?,
            },
            name => ChannelRequest::Unknown {
                name: name.to_string(),
            },
        })
    }
}

/// An `x11-req`. See
/// [RFC 4254 §6.3.1](https://tools.ietf.org/html/rfc4254#section-6.3.1)
/// about the cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Request {
    pub single_connection: bool,
    pub auth_protocol: String,
    pub auth_cookie: String,
    pub screen_number: u32,
}

impl X11Request {
    /// An `MIT-MAGIC-COOKIE-1` request for screen 0 with a fresh
    /// random cookie.
    pub fn with_random_cookie() -> Self {
        let mut cookie = [0; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        X11Request {
            single_connection: false,
            auth_protocol: "MIT-MAGIC-COOKIE-1".to_string(),
            auth_cookie: HEXLOWER.encode(&cookie),
            screen_number: 0,
        }
    }
}

/// The answer of a handler to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub fn accepted(self) -> bool {
        self == Decision::Accept
    }
}

impl From<bool> for Decision {
    fn from(accept: bool) -> Self {
        if accept {
            Decision::Accept
        } else {
            Decision::Reject
        }
    }
}

/// What a session channel is asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessKind {
    Exec(String),
    Shell,
    Subsystem(String),
}

/// Everything the process layer needs to start the program of a
/// session: the program, and what the client asked for before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub kind: ProcessKind,
    /// Variables accepted by `env_request`.
    pub env: HashMap<String, String>,
    /// The terminal accepted by `pty_request`, if any.
    pub pty: Option<PtyInfo>,
    pub x11: Option<X11Request>,
    pub agent_forward: bool,
}

impl ProcessRequest {
    /// The command line of an `exec`.
    pub fn command(&self) -> Option<&str> {
        match &self.kind {
            ProcessKind::Exec(command) => Some(command),
            _ => None,
        }
    }
}

/// Which side sent a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Peer {
    Client,
    Server,
}

/// What to do with an incoming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Ask the application.
    Dispatch,
    /// Answer with `CHANNEL_FAILURE` without involving the application.
    Refuse(&'static str),
    /// Drop silently.
    Ignore,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    #[default]
    Opened,
    /// A program was started.
    Active,
    /// The program's exit status or signal was seen.
    Exited,
}

/// The state of one `session` channel.
#[derive(Debug, Default)]
pub(crate) struct SessionRouter {
    state: SessionState,
    env: HashMap<String, String>,
    pty: Option<PtyInfo>,
    x11: Option<X11Request>,
    agent_forward: bool,
}

impl SessionRouter {
    pub fn admit(&self, request: &ChannelRequest, from: Peer) -> Route {
        use ChannelRequest::*;
        let opened = self.state == SessionState::Opened;
        match (from, request) {
            (Peer::Client, Pty(_)) if !opened => Route::Refuse("pty-req after the program started"),
            (Peer::Client, Pty(_)) if self.pty.is_some() => Route::Refuse("pty already allocated"),
            (Peer::Client, Pty(_)) => Route::Dispatch,
            (Peer::Client, Env { .. } | X11(_) | AgentForward) if !opened => {
                Route::Refuse("the program already started")
            }
            (Peer::Client, Env { .. } | X11(_) | AgentForward) => Route::Dispatch,
            (Peer::Client, Exec { .. } | Shell | Subsystem { .. }) if !opened => {
                Route::Refuse("a program already runs on this channel")
            }
            (Peer::Client, Exec { .. } | Shell | Subsystem { .. }) => Route::Dispatch,
            (Peer::Client, WindowChange { .. }) if self.state == SessionState::Active => {
                Route::Dispatch
            }
            (Peer::Client, WindowChange { .. }) => Route::Refuse("no running program"),
            (Peer::Client, Signal(_)) if self.state == SessionState::Active => Route::Dispatch,
            (Peer::Client, Signal(_)) => Route::Ignore,
            (Peer::Server, ExitStatus(_) | ExitSignal { .. }) if self.state == SessionState::Exited => {
                Route::Ignore
            }
            (Peer::Server, ExitStatus(_) | ExitSignal { .. } | XonXoff { .. }) => Route::Dispatch,
            (Peer::Client, ExitStatus(_) | ExitSignal { .. } | XonXoff { .. }) => Route::Ignore,
            _ => Route::Refuse("unsupported request"),
        }
    }

    /// Records a request the application accepted.
    pub fn accepted(&mut self, request: &ChannelRequest) {
        match request {
            ChannelRequest::Pty(pty) => self.pty = Some(pty.clone()),
            ChannelRequest::Env { name, value } => {
                self.env.insert(name.clone(), value.clone());
            }
            ChannelRequest::X11(x11) => self.x11 = Some(x11.clone()),
            ChannelRequest::AgentForward => self.agent_forward = true,
            ChannelRequest::Exec { .. }
            | ChannelRequest::Shell
            | ChannelRequest::Subsystem { .. } => self.state = SessionState::Active,
            ChannelRequest::ExitStatus(_) | ChannelRequest::ExitSignal { .. } => {
                self.state = SessionState::Exited
            }
            _ => {}
        }
    }

    /// The hand-off for an `exec`, `shell` or `subsystem` request.
    pub fn process_request(&self, request: &ChannelRequest) -> Option<ProcessRequest> {
        let kind = match request {
            ChannelRequest::Exec { command } => ProcessKind::Exec(command.clone()),
            ChannelRequest::Shell => ProcessKind::Shell,
            ChannelRequest::Subsystem { name } => ProcessKind::Subsystem(name.clone()),
            _ => return None,
        };
        Some(ProcessRequest {
            kind,
            env: self.env.clone(),
            pty: self.pty.clone(),
            x11: self.x11.clone(),
            agent_forward: self.agent_forward,
        })
    }
}

/// Identifies a slot of a [`ReplyQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplyToken(u64);

/// The replies we owe to the peer's `want_reply` requests on one
/// channel. Replies leave in the order the requests arrived, whatever
/// the order in which they are decided, and each slot is resolved at
/// most once.
#[derive(Debug, Default)]
pub(crate) struct ReplyQueue {
    next: u64,
    slots: VecDeque<(ReplyToken, Option<bool>)>,
}

impl ReplyQueue {
    pub fn push(&mut self) -> ReplyToken {
        let token = ReplyToken(self.next);
        self.next += 1;
        self.slots.push_back((token, None));
        token
    }

    /// Records a decision. Returns `false`, and changes nothing, if the
    /// slot was already resolved or does not exist.
    pub fn resolve(&mut self, token: ReplyToken, accepted: bool) -> bool {
        match self.slots.iter_mut().find(|(t, _)| *t == token) {
            Some((_, slot @ None)) => {
                *slot = Some(accepted);
                true
            }
            Some((_, Some(_))) => {
                warn!("request {:?} was already answered", token);
                false
            }
            None => {
                warn!("no pending request {:?}", token);
                false
            }
        }
    }

    /// Takes the decisions that can be sent now, in order.
    pub fn ready(&mut self) -> Vec<bool> {
        let mut ready = Vec::new();
        while let Some((_, Some(accepted))) = self.slots.front() {
            ready.push(*accepted);
            self.slots.pop_front();
        }
        ready
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Our requests that are waiting for the peer's reply, oldest first.
#[derive(Debug, Default)]
pub(crate) struct AwaitingReplies(VecDeque<oneshot::Sender<bool>>);

impl AwaitingReplies {
    pub fn push(&mut self, reply: oneshot::Sender<bool>) {
        self.0.push_back(reply)
    }

    /// Resolves the oldest request. Returns `false` if nothing was
    /// waiting for a reply.
    pub fn resolve(&mut self, success: bool) -> bool {
        match self.0.pop_front() {
            Some(reply) => {
                if reply.send(success).is_err() {
                    debug!("request reply dropped by the caller");
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(command: &str) -> ChannelRequest {
        ChannelRequest::Exec {
            command: command.into(),
        }
    }

    #[test]
    fn requests_round_trip() {
        let requests = [
            ChannelRequest::Pty(PtyInfo {
                rows: 2,
                cols: 4,
                width: 0,
                height: 0,
                term: "vt220".into(),
                modes: vec![],
            }),
            ChannelRequest::Env {
                name: "SSH2NODETEST".into(),
                value: "foo".into(),
            },
            exec("foo --bar"),
            ChannelRequest::Shell,
            ChannelRequest::X11(X11Request::with_random_cookie()),
            ChannelRequest::AgentForward,
            ChannelRequest::Signal(Sig::INT),
            ChannelRequest::ExitSignal {
                signal: Sig::KILL,
                core_dumped: true,
                error_message: "killed".into(),
                lang_tag: String::new(),
            },
        ];
        for request in requests {
            let payload = request.message(7, true).unwrap();
            let mut r = &payload[..];
            assert_eq!(u8::decode(&mut r).unwrap(), msg::CHANNEL_REQUEST);
            assert_eq!(u32::decode(&mut r).unwrap(), 7);
            let name = String::decode(&mut r).unwrap();
            assert!(bool::decode(&mut r).unwrap());
            assert_eq!(ChannelRequest::decode(&name, &mut r).unwrap(), request);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn old_agent_request_name_is_understood() {
        let mut r: &[u8] = &[];
        assert_eq!(
            ChannelRequest::decode("auth-agent-req", &mut r).unwrap(),
            ChannelRequest::AgentForward
        );
        assert_eq!(ChannelRequest::AgentForward.name(), AGENT_REQUEST);
    }

    #[test]
    fn commands_must_be_utf8() {
        let mut payload = Vec::new();
        [b'l', b's', 0xff].as_slice().encode(&mut payload).unwrap();
        assert!(ChannelRequest::decode("exec", &mut &payload[..]).is_err());

        let mut payload = Vec::new();
        "ls -l".encode(&mut payload).unwrap();
        assert_eq!(
            ChannelRequest::decode("exec", &mut &payload[..]).unwrap(),
            exec("ls -l")
        );
    }

    #[test]
    fn random_cookies_differ() {
        let a = X11Request::with_random_cookie();
        let b = X11Request::with_random_cookie();
        assert_eq!(a.auth_cookie.len(), 32);
        assert_ne!(a.auth_cookie, b.auth_cookie);
    }

    #[test]
    fn one_program_per_session() {
        let mut router = SessionRouter::default();
        let env = ChannelRequest::Env {
            name: "A".into(),
            value: "1".into(),
        };
        assert_eq!(router.admit(&env, Peer::Client), Route::Dispatch);
        router.accepted(&env);
        let rejected = ChannelRequest::Env {
            name: "B".into(),
            value: "2".into(),
        };
        assert_eq!(router.admit(&rejected, Peer::Client), Route::Dispatch);
        // not accepted: absent from the hand-off

        let first = exec("true");
        assert_eq!(router.admit(&first, Peer::Client), Route::Dispatch);
        let process = router.process_request(&first).unwrap();
        assert_eq!(process.command(), Some("true"));
        assert_eq!(process.env.len(), 1);
        assert_eq!(process.env.get("A").map(|s| s.as_str()), Some("1"));
        assert!(process.pty.is_none());
        router.accepted(&first);

        assert!(matches!(
            router.admit(&exec("false"), Peer::Client),
            Route::Refuse(_)
        ));
        assert!(matches!(
            router.admit(&ChannelRequest::Shell, Peer::Client),
            Route::Refuse(_)
        ));
        assert!(matches!(
            router.admit(&env, Peer::Client),
            Route::Refuse(_)
        ));
        let resize = ChannelRequest::WindowChange {
            cols: 80,
            rows: 24,
            width: 0,
            height: 0,
        };
        assert_eq!(router.admit(&resize, Peer::Client), Route::Dispatch);
    }

    #[test]
    fn pty_only_once_and_before_the_program() {
        let mut router = SessionRouter::default();
        let pty = ChannelRequest::Pty(PtyInfo::default());
        assert_eq!(router.admit(&pty, Peer::Client), Route::Dispatch);
        router.accepted(&pty);
        assert!(matches!(router.admit(&pty, Peer::Client), Route::Refuse(_)));
        assert_eq!(
            router.admit(&ChannelRequest::Signal(Sig::TERM), Peer::Client),
            Route::Ignore
        );
        let shell = ChannelRequest::Shell;
        let process = router.process_request(&shell).unwrap();
        assert_eq!(process.kind, ProcessKind::Shell);
        assert_eq!(process.pty, Some(PtyInfo::default()));
    }

    #[test]
    fn at_most_one_exit_report() {
        let mut router = SessionRouter::default();
        let status = ChannelRequest::ExitStatus(100);
        assert_eq!(router.admit(&status, Peer::Server), Route::Dispatch);
        router.accepted(&status);
        assert_eq!(router.admit(&status, Peer::Server), Route::Ignore);
        assert_eq!(
            router.admit(
                &ChannelRequest::ExitSignal {
                    signal: Sig::KILL,
                    core_dumped: false,
                    error_message: String::new(),
                    lang_tag: String::new(),
                },
                Peer::Server
            ),
            Route::Ignore
        );
        assert!(matches!(
            router.admit(&exec("ls"), Peer::Server),
            Route::Refuse(_)
        ));
    }

    #[test]
    fn replies_leave_in_request_order() {
        let mut queue = ReplyQueue::default();
        let a = queue.push();
        let b = queue.push();
        let c = queue.push();
        assert!(queue.resolve(b, false));
        assert!(queue.ready().is_empty());
        assert!(queue.resolve(a, true));
        assert_eq!(queue.ready(), vec![true, false]);
        assert!(!queue.resolve(a, false));
        assert!(queue.resolve(c, true));
        assert!(!queue.resolve(c, false));
        assert_eq!(queue.ready(), vec![true]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn awaiting_replies_resolve_oldest_first() {
        let mut awaiting = AwaitingReplies::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        awaiting.push(tx1);
        awaiting.push(tx2);
        assert!(awaiting.resolve(false));
        assert!(awaiting.resolve(true));
        assert!(!awaiting.resolve(true));
        assert!(!rx1.await.unwrap());
        assert!(rx2.await.unwrap());

        let (tx3, rx3) = oneshot::channel();
        awaiting.push(tx3);
        drop(awaiting);
        assert!(rx3.await.is_err());
    }
}
