//! The per-session POP3 retrieval engine.
//!
//! After USER/PASS the maildrop is read once into a session snapshot;
//! from then on the client sees 1-based ordinals into that frozen list.
//! DELE only marks entries, and the marks become membership deletions in
//! one batch when the session ends with QUIT.

use std::sync::Arc;
use std::time::Duration;

use bridgemail_pop3::{Request, Response};
use log::{debug, error, info};

use crate::framer::{LineEvent, LineFramer};
use crate::server::{Engine, Reaction};
use crate::store::Store;

/// Longest accepted command line, 87 bytes: a 4-char verb, two 40-char
/// arguments with their separating spaces, and the line terminator.
pub const LINE_MAX: usize = 4 + (1 + 40) * 2 + 1;

/// Idle limit for a retrieval session (RFC 1939 section 3).
const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Copy, Clone, Debug, PartialEq)]
enum State {
    /// Connected, banner sent.
    Init,
    /// USER accepted, waiting for PASS.
    Auth,
    /// Authenticated, snapshot loaded.
    Transaction,
}

/// One snapshot entry: a message this mailbox held at login.
struct Entry {
    id: i64,
    size: u64,
    deleted: bool,
}

pub struct Pop3Engine {
    store: Arc<Store>,
    hostname: String,
    state: State,
    framer: LineFramer,
    username: String,
    snapshot: Vec<Entry>,
}

impl Pop3Engine {
    pub fn new(store: Arc<Store>, hostname: String) -> Pop3Engine {
        Pop3Engine {
            store,
            hostname,
            state: State::Init,
            framer: LineFramer::new(Some(LINE_MAX)),
            username: String::new(),
            snapshot: Vec::new(),
        }
    }

    fn reply(&self, response: Response, out: &mut Vec<u8>) {
        out.extend_from_slice(&response.to_bytes());
    }

    /// The live (not tentatively deleted) entry at a 1-based ordinal.
    fn live_entry(&self, ordinal: usize) -> Option<&Entry> {
        match ordinal.checked_sub(1).and_then(|i| self.snapshot.get(i)) {
            Some(entry) if !entry.deleted => Some(entry),
            _ => None,
        }
    }

    /// Handle one framed command line.  Returns true when the session
    /// must close.
    fn command(&mut self, line: &[u8], out: &mut Vec<u8>) -> bool {
        let line = String::from_utf8_lossy(line);
        debug!("pop3: got command: [{}]", line);

        let req = match Request::parse(&line) {
            Ok(req) => req,
            Err(err) => {
                debug!("pop3: rejected command: {:#}", err);
                self.reply(Response::Err, out);
                return false;
            }
        };

        match req {
            Request::USER(name) => {
                if self.state != State::Init {
                    self.reply(Response::Err, out);
                } else {
                    self.username = name;
                    self.state = State::Auth;
                    self.reply(Response::Ok, out);
                }
            }
            Request::PASS(secret) => {
                if self.state != State::Auth {
                    self.reply(Response::Err, out);
                } else {
                    self.login(&secret, out);
                }
            }
            Request::STAT => {
                if self.state != State::Transaction {
                    self.reply(Response::Err, out);
                } else {
                    let live = self.snapshot.iter().filter(|e| !e.deleted);
                    let (count, size) = live.fold((0, 0), |(n, s), e| (n + 1, s + e.size));
                    self.reply(Response::Stat { count, size }, out);
                }
            }
            Request::LIST(None) => {
                if self.state != State::Transaction {
                    self.reply(Response::Err, out);
                } else {
                    let entries = self
                        .snapshot
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| !e.deleted)
                        .map(|(i, e)| (i + 1, e.size))
                        .collect();
                    self.reply(Response::List(entries), out);
                }
            }
            Request::LIST(Some(ordinal)) => {
                if self.state != State::Transaction {
                    self.reply(Response::Err, out);
                } else {
                    match self.live_entry(ordinal) {
                        Some(entry) => {
                            let size = entry.size;
                            self.reply(Response::ListSingle { ordinal, size }, out);
                        }
                        None => self.reply(Response::Err, out),
                    }
                }
            }
            Request::RETR(ordinal) => {
                if self.state != State::Transaction {
                    self.reply(Response::Err, out);
                } else {
                    self.retrieve(ordinal, out);
                }
            }
            Request::DELE(ordinal) => {
                if self.state != State::Transaction {
                    self.reply(Response::Err, out);
                } else {
                    match ordinal.checked_sub(1).and_then(|i| self.snapshot.get_mut(i)) {
                        Some(entry) if !entry.deleted => {
                            entry.deleted = true;
                            self.reply(Response::Ok, out);
                        }
                        _ => self.reply(Response::Err, out),
                    }
                }
            }
            Request::NOOP => {
                if self.state != State::Transaction {
                    self.reply(Response::Err, out);
                } else {
                    self.reply(Response::Ok, out);
                }
            }
            Request::RSET => {
                if self.state != State::Transaction {
                    self.reply(Response::Err, out);
                } else {
                    for entry in self.snapshot.iter_mut() {
                        entry.deleted = false;
                    }
                    self.reply(Response::Ok, out);
                }
            }
            Request::TOP { .. } | Request::UIDL(_) => {
                // Acknowledged only; the listings are not implemented.
                if self.state != State::Transaction {
                    self.reply(Response::Err, out);
                } else {
                    self.reply(Response::Ok, out);
                }
            }
            Request::QUIT => {
                self.quit(out);
                return true;
            }
        }

        false
    }

    fn login(&mut self, secret: &str, out: &mut Vec<u8>) {
        match self.store.check_login(&self.username, secret) {
            Ok(true) => {}
            Ok(false) => {
                // Stay in AUTH so the client may try PASS again.
                info!("pop3: login failed for {}", self.username);
                self.reply(Response::Err, out);
                return;
            }
            Err(err) => {
                error!("pop3: login check failed: {:#}", err);
                self.reply(Response::Err, out);
                return;
            }
        }

        match self.store.list_messages(&self.username) {
            Ok(messages) => {
                self.snapshot = messages
                    .into_iter()
                    .map(|(id, size)| Entry {
                        id,
                        size,
                        deleted: false,
                    })
                    .collect();
                self.state = State::Transaction;
                info!(
                    "pop3: {} logged in, {} message(s)",
                    self.username,
                    self.snapshot.len()
                );
                self.reply(Response::Ok, out);
            }
            Err(err) => {
                error!("pop3: maildrop listing failed: {:#}", err);
                self.reply(Response::Err, out);
            }
        }
    }

    fn retrieve(&mut self, ordinal: usize, out: &mut Vec<u8>) {
        let id = match self.live_entry(ordinal) {
            Some(entry) => entry.id,
            None => {
                self.reply(Response::Err, out);
                return;
            }
        };

        match self.store.fetch_message(&self.username, id) {
            Ok(Some(body)) => self.reply(Response::Retr(body), out),
            Ok(None) => self.reply(Response::Err, out),
            Err(err) => {
                error!("pop3: fetch of message {} failed: {:#}", id, err);
                self.reply(Response::Err, out);
            }
        }
    }

    /// Commit the tentative deletes, reply and close.
    ///
    /// A commit failure is reported as -ERR but closes the session all
    /// the same; outside TRANSACTION there is nothing to commit.
    fn quit(&mut self, out: &mut Vec<u8>) {
        if self.state != State::Transaction {
            self.reply(Response::Ok, out);
            return;
        }

        let doomed: Vec<i64> = self
            .snapshot
            .iter()
            .filter(|e| e.deleted)
            .map(|e| e.id)
            .collect();

        if doomed.is_empty() {
            self.reply(Response::Ok, out);
            return;
        }

        match self.store.delete_memberships(&self.username, &doomed) {
            Ok(()) => {
                info!(
                    "pop3: {} deleted {} message(s) on quit",
                    self.username,
                    doomed.len()
                );
                self.reply(Response::Ok, out);
            }
            Err(err) => {
                error!("pop3: delete on quit failed: {:#}", err);
                self.reply(Response::Err, out);
            }
        }
    }
}

impl Engine for Pop3Engine {
    fn greeting(&self) -> Vec<u8> {
        Response::Greet(self.hostname.clone()).to_bytes()
    }

    fn idle_timeout(&self) -> Duration {
        IDLE_TIMEOUT
    }

    fn process(&mut self, chunk: &[u8]) -> Reaction {
        let mut out = Vec::new();
        let mut input = chunk;

        while let Some(event) = self.framer.next_line(&mut input) {
            match event {
                LineEvent::Overflow => self.reply(Response::Err, &mut out),
                LineEvent::Line(line) => {
                    if self.command(&line, &mut out) {
                        // Pipelined input past QUIT is dropped.
                        return Reaction { output: out, close: true };
                    }
                }
            }
        }

        Reaction { output: out, close: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::open_seeded;
    use tempfile::TempDir;

    fn engine_with_messages(bodies: &[&[u8]]) -> (TempDir, Arc<Store>, Pop3Engine) {
        let (dir, store) = open_seeded(&[("alice", "pw"), ("bob", "pw")]);
        let store = Arc::new(store);
        for body in bodies {
            store.insert_message(body, &["bob".to_string()]).unwrap();
        }
        let engine = Pop3Engine::new(store.clone(), "mx.test".to_string());
        (dir, store, engine)
    }

    fn send(engine: &mut Pop3Engine, input: &[u8]) -> (Vec<u8>, bool) {
        let reaction = engine.process(input);
        (reaction.output, reaction.close)
    }

    fn login(engine: &mut Pop3Engine) {
        let (out, _) = send(engine, b"USER bob\r\nPASS pw\r\n");
        assert_eq!(out, b"+OK\r\n+OK\r\n");
    }

    #[test]
    fn greeting_carries_hostname() {
        let (_dir, _store, engine) = engine_with_messages(&[]);
        assert_eq!(engine.greeting(), b"+OK POP3 server ready <mx.test>\r\n");
    }

    #[test]
    fn commands_before_login_are_rejected() {
        let (_dir, _store, mut engine) = engine_with_messages(&[b"hi\r\n"]);

        let (out, _) = send(&mut engine, b"STAT\r\nLIST\r\nRETR 1\r\n");
        assert_eq!(out, b"-ERR\r\n-ERR\r\n-ERR\r\n");
    }

    #[test]
    fn pass_before_user_is_rejected() {
        let (_dir, _store, mut engine) = engine_with_messages(&[]);
        let (out, _) = send(&mut engine, b"PASS pw\r\n");
        assert_eq!(out, b"-ERR\r\n");
    }

    #[test]
    fn wrong_password_permits_retry() {
        let (_dir, _store, mut engine) = engine_with_messages(&[b"hi\r\n"]);

        let (out, _) = send(&mut engine, b"USER bob\r\nPASS wrong\r\n");
        assert_eq!(out, b"+OK\r\n-ERR\r\n");

        // Still in AUTH: a second PASS may succeed.
        let (out, _) = send(&mut engine, b"PASS pw\r\nSTAT\r\n");
        assert_eq!(out, b"+OK\r\n+OK 1 4\r\n");
    }

    #[test]
    fn stat_counts_live_messages() {
        let (_dir, _store, mut engine) = engine_with_messages(&[b"hi\r\n", b"hello!\r\n"]);
        login(&mut engine);

        let (out, _) = send(&mut engine, b"STAT\r\n");
        assert_eq!(out, b"+OK 2 12\r\n");
    }

    #[test]
    fn list_skips_deleted_entries_but_keeps_ordinals() {
        let (_dir, _store, mut engine) = engine_with_messages(&[b"a\r\n", b"bb\r\n", b"ccc\r\n"]);
        login(&mut engine);

        let (out, _) = send(&mut engine, b"DELE 2\r\nLIST\r\n");
        assert_eq!(out, b"+OK\r\n+OK\r\n1 3\r\n3 5\r\n.\r\n");

        let (out, _) = send(&mut engine, b"LIST 2\r\n");
        assert_eq!(out, b"-ERR\r\n");
        let (out, _) = send(&mut engine, b"LIST 3\r\n");
        assert_eq!(out, b"+OK 3 5\r\n");
    }

    #[test]
    fn retr_returns_the_stored_bytes() {
        let (_dir, _store, mut engine) = engine_with_messages(&[b"hi\r\n"]);
        login(&mut engine);

        let (out, _) = send(&mut engine, b"RETR 1\r\n");
        assert_eq!(out, b"+OK\r\nhi\r\n.\r\n");

        // Unchanged on a second call.
        let (out, _) = send(&mut engine, b"RETR 1\r\n");
        assert_eq!(out, b"+OK\r\nhi\r\n.\r\n");
    }

    #[test]
    fn retr_stuffs_dotted_lines() {
        let (_dir, _store, mut engine) = engine_with_messages(&[b".hidden\r\n"]);
        login(&mut engine);

        let (out, _) = send(&mut engine, b"RETR 1\r\n");
        assert_eq!(out, b"+OK\r\n..hidden\r\n.\r\n");
    }

    #[test]
    fn retr_out_of_range_is_rejected() {
        let (_dir, _store, mut engine) = engine_with_messages(&[b"hi\r\n"]);
        login(&mut engine);

        let (out, _) = send(&mut engine, b"RETR 0\r\nRETR 2\r\n");
        assert_eq!(out, b"-ERR\r\n-ERR\r\n");
    }

    #[test]
    fn dele_marks_once_and_hides_the_entry() {
        let (_dir, _store, mut engine) = engine_with_messages(&[b"hi\r\n"]);
        login(&mut engine);

        let (out, _) = send(&mut engine, b"DELE 1\r\nDELE 1\r\nRETR 1\r\nSTAT\r\n");
        assert_eq!(out, b"+OK\r\n-ERR\r\n-ERR\r\n+OK 0 0\r\n");
    }

    #[test]
    fn rset_restores_the_snapshot() {
        let (_dir, _store, mut engine) = engine_with_messages(&[b"hi\r\n"]);
        login(&mut engine);

        let (out, _) = send(&mut engine, b"DELE 1\r\nRSET\r\nSTAT\r\n");
        assert_eq!(out, b"+OK\r\n+OK\r\n+OK 1 4\r\n");
    }

    #[test]
    fn quit_commits_the_marked_deletes() {
        let (_dir, store, mut engine) = engine_with_messages(&[b"hi\r\n", b"bye\r\n"]);
        login(&mut engine);

        let (out, close) = send(&mut engine, b"DELE 1\r\nQUIT\r\n");
        assert_eq!(out, b"+OK\r\n+OK\r\n");
        assert!(close);

        let remaining = store.list_messages("bob").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1, 5);
    }

    #[test]
    fn dropping_the_session_commits_nothing() {
        let (_dir, store, mut engine) = engine_with_messages(&[b"hi\r\n"]);
        login(&mut engine);

        send(&mut engine, b"DELE 1\r\n");
        drop(engine);

        assert_eq!(store.list_messages("bob").unwrap().len(), 1);
    }

    #[test]
    fn quit_before_login_just_closes() {
        let (_dir, _store, mut engine) = engine_with_messages(&[]);
        let (out, close) = send(&mut engine, b"QUIT\r\n");
        assert_eq!(out, b"+OK\r\n");
        assert!(close);
    }

    #[test]
    fn snapshot_is_frozen_at_login() {
        let (_dir, store, mut engine) = engine_with_messages(&[b"hi\r\n"]);
        login(&mut engine);

        // New mail after login is invisible to this session.
        store.insert_message(b"late\r\n", &["bob".to_string()]).unwrap();

        let (out, _) = send(&mut engine, b"STAT\r\n");
        assert_eq!(out, b"+OK 1 4\r\n");
    }

    #[test]
    fn overflowing_line_draws_one_err() {
        let (_dir, _store, mut engine) = engine_with_messages(&[]);

        let mut line = vec![b'x'; 200];
        line.extend_from_slice(b"\r\n");
        let (out, _) = send(&mut engine, &line);
        assert_eq!(out, b"-ERR\r\n");
    }

    #[test]
    fn unknown_and_malformed_commands_are_rejected() {
        let (_dir, _store, mut engine) = engine_with_messages(&[b"hi\r\n"]);
        login(&mut engine);

        let (out, _) = send(&mut engine, b"CAPA\r\nRETR x\r\n\r\n");
        assert_eq!(out, b"-ERR\r\n-ERR\r\n-ERR\r\n");
    }

    #[test]
    fn top_and_uidl_are_acknowledged() {
        let (_dir, _store, mut engine) = engine_with_messages(&[b"hi\r\n"]);
        login(&mut engine);

        let (out, _) = send(&mut engine, b"TOP 1 3\r\nUIDL\r\nUIDL 1\r\n");
        assert_eq!(out, b"+OK\r\n+OK\r\n+OK\r\n");

        let (out, _) = send(&mut engine, b"TOP\r\n");
        assert_eq!(out, b"-ERR\r\n");
    }
}
