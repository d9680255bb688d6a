//! The per-session SMTP submission engine.
//!
//! One engine instance owns one connection's protocol state: the command
//! state machine, the accepted recipient list and the message body being
//! uploaded.  Delivery goes through [`Store::insert_message`] as a single
//! transaction once the `.` terminator arrives.

use std::sync::Arc;
use std::time::Duration;

use bridgemail_smtp::{greeting, parse_path, Reply, Request};
use log::{debug, error, info};

use crate::framer::{LineEvent, LineFramer};
use crate::server::{Engine, Reaction};
use crate::store::Store;

/// Longest accepted command line including CRLF (RFC 5321 section
/// 4.5.3.1.6).  Content lines during DATA are not capped.
pub const LINE_MAX: usize = 1000;

/// Idle limit for a submission session (RFC 5321 section 4.5.3.2.7).
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Copy, Clone, Debug, PartialEq)]
enum State {
    /// Connected, banner sent, no HELO yet.
    Init,
    /// Greeted; between mail transactions.
    Helo,
    /// Reverse-path accepted.
    Mail,
    /// At least one forward-path accepted.
    Rcpt,
    /// Message content upload in progress.
    Data,
}

pub struct SmtpEngine {
    store: Arc<Store>,
    hostname: String,
    state: State,
    framer: LineFramer,
    /// Accepted forward-paths in arrival order, duplicates preserved.
    rcpt: Vec<String>,
    /// Accumulated message content, dots unstuffed, CRLF per line.
    body: Vec<u8>,
}

impl SmtpEngine {
    pub fn new(store: Arc<Store>, hostname: String) -> SmtpEngine {
        SmtpEngine {
            store,
            hostname,
            state: State::Init,
            framer: LineFramer::new(Some(LINE_MAX)),
            rcpt: Vec::new(),
            body: Vec::new(),
        }
    }

    fn reply(&self, reply: Reply, out: &mut Vec<u8>) {
        debug!("smtp: reply {}", reply.code());
        out.extend_from_slice(reply.as_str().as_bytes());
    }

    /// Handle one framed command line.  Returns true when the session
    /// must close (QUIT acknowledged).
    fn command(&mut self, line: &[u8], out: &mut Vec<u8>) -> bool {
        let line = String::from_utf8_lossy(line);
        debug!("smtp: got command: [{}]", line);

        let req = match Request::parse(&line) {
            Ok(req) => req,
            Err(reply) => {
                self.reply(reply, out);
                return false;
            }
        };

        match req {
            Request::HELO(_) | Request::EHLO(_) => {
                if self.state != State::Init {
                    self.reply(Reply::BadSequence, out);
                } else {
                    self.state = State::Helo;
                    self.reply(Reply::Ok, out);
                }
            }
            Request::RSET => {
                if self.state != State::Init {
                    self.state = State::Helo;
                }
                self.rcpt.clear();
                self.body.clear();
                self.reply(Reply::Ok, out);
            }
            Request::NOOP => self.reply(Reply::Ok, out),
            Request::VRFY(_) => self.reply(Reply::VrfyUnverified, out),
            Request::MAIL(arg) => {
                if self.state != State::Helo {
                    self.reply(Reply::BadSequence, out);
                } else {
                    match parse_path("FROM", &arg) {
                        None => self.reply(Reply::SyntaxError, out),
                        Some(sender) => match self.store.mailbox_exists(&sender) {
                            Ok(true) => {
                                self.state = State::Mail;
                                self.reply(Reply::Ok, out);
                            }
                            Ok(false) => self.reply(Reply::MailboxNotFound, out),
                            Err(err) => {
                                error!("smtp: sender lookup failed: {:#}", err);
                                self.reply(Reply::LocalError, out);
                            }
                        },
                    }
                }
            }
            Request::RCPT(arg) => {
                if self.state != State::Mail && self.state != State::Rcpt {
                    self.reply(Reply::BadSequence, out);
                } else {
                    match parse_path("TO", &arg) {
                        None => self.reply(Reply::SyntaxError, out),
                        Some(recipient) => match self.store.mailbox_exists(&recipient) {
                            Ok(true) => {
                                self.rcpt.push(recipient);
                                self.state = State::Rcpt;
                                self.reply(Reply::Ok, out);
                            }
                            Ok(false) => self.reply(Reply::MailboxNotFound, out),
                            Err(err) => {
                                error!("smtp: recipient lookup failed: {:#}", err);
                                self.reply(Reply::LocalError, out);
                            }
                        },
                    }
                }
            }
            Request::DATA => {
                if self.state != State::Rcpt {
                    self.reply(Reply::BadSequence, out);
                } else {
                    self.state = State::Data;
                    self.framer.set_limit(None);
                    self.reply(Reply::StartMailInput, out);
                }
            }
            Request::QUIT => {
                if self.state == State::Init {
                    self.reply(Reply::BadSequence, out);
                } else {
                    self.reply(Reply::Closing, out);
                    return true;
                }
            }
        }

        false
    }

    /// Handle one content line during DATA.
    fn content(&mut self, line: Vec<u8>, out: &mut Vec<u8>) {
        if line == b"." {
            self.deliver(out);
            self.state = State::Helo;
            self.framer.set_limit(Some(LINE_MAX));
            self.rcpt.clear();
            self.body.clear();
            return;
        }

        // A stuffed leading dot comes off before the line is stored.
        let content = match line.split_first() {
            Some((&b'.', rest)) => rest,
            _ => &line[..],
        };

        self.body.extend_from_slice(content);
        self.body.extend_from_slice(b"\r\n");
    }

    fn deliver(&mut self, out: &mut Vec<u8>) {
        match self.store.insert_message(&self.body, &self.rcpt) {
            Ok(id) => {
                info!(
                    "smtp: delivered message {} ({} bytes) to {} recipient(s)",
                    id,
                    self.body.len(),
                    self.rcpt.len()
                );
                self.reply(Reply::Ok, out);
            }
            Err(err) => {
                error!("smtp: delivery failed: {:#}", err);
                self.reply(Reply::LocalError, out);
            }
        }
    }
}

impl Engine for SmtpEngine {
    fn greeting(&self) -> Vec<u8> {
        greeting(&self.hostname).into_bytes()
    }

    fn idle_timeout(&self) -> Duration {
        IDLE_TIMEOUT
    }

    fn process(&mut self, chunk: &[u8]) -> Reaction {
        let mut out = Vec::new();
        let mut input = chunk;

        while let Some(event) = self.framer.next_line(&mut input) {
            match event {
                LineEvent::Overflow => self.reply(Reply::CommandUnrecognized, &mut out),
                LineEvent::Line(line) => {
                    if self.state == State::Data {
                        self.content(line, &mut out);
                    } else if self.command(&line, &mut out) {
                        // Pipelined input past QUIT is dropped.
                        return Reaction { output: out, close: true };
                    }
                }
            }
        }

        Reaction { output: out, close: false }
    }
}
