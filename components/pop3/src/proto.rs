use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Longest argument the server accepts for USER and PASS.
///
/// Mailbox ids are at most 40 characters in the store, so anything longer
/// can be rejected before it is looked up.
pub const ARG_MAX: usize = 40;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// USER is used to send the mailbox name.
    ///
    /// # Restrictions
    ///
    /// Only be given in the AUTHORIZATION state, before PASS.
    ///
    /// # Discussion
    ///
    /// To authenticate using the USER and PASS command combination, the
    /// client must first issue the USER command.  The name is held until
    /// the matching PASS arrives; nothing is checked against the store
    /// yet, so USER succeeds even for a mailbox that does not exist.
    ///
    /// # Syntax
    ///
    /// C: USER <name>
    /// S: +OK
    USER,
    /// PASS is used to send the mailbox secret.
    ///
    /// # Restrictions
    ///
    /// Only be given immediately after a successful USER command.
    ///
    /// # Discussion
    ///
    /// The server checks the USER/PASS pair against the store.  On
    /// success the maildrop is read once and frozen for the rest of the
    /// session; on failure the session stays where it was and the client
    /// may try PASS again.
    ///
    /// Since the PASS command has exactly one argument, a POP3 server
    /// may treat spaces in the argument as part of the password, instead
    /// of as argument separators.
    ///
    /// # Syntax
    ///
    /// C: PASS <secret>
    /// S: +OK
    PASS,
    /// STAT reports the maildrop totals.
    ///
    /// The reply carries the number of messages and their summed size in
    /// octets, skipping messages marked as deleted.
    ///
    /// # Syntax
    ///
    /// C: STAT
    /// S: +OK <count> <size>
    STAT,
    /// LIST reports per-message scan listings.
    ///
    /// # Discussion
    ///
    /// Without an argument the reply is multi-line: one `<n> <size>`
    /// line per message that is not marked deleted, closed by a lone
    /// `.`.  With an argument the reply is the single scan listing of
    /// that message, or -ERR if the message number is out of range or
    /// the message is marked deleted.
    ///
    /// # Syntax
    ///
    /// C: LIST [n]
    /// S: +OK ...
    LIST,
    /// RETR transfers one full message.
    ///
    /// After the +OK line the message bytes follow, byte-stuffed, and a
    /// lone `.` line closes the response.
    ///
    /// # Syntax
    ///
    /// C: RETR <n>
    /// S: +OK
    /// S: <message content>
    /// S: .
    RETR,
    /// DELE marks one message as deleted.
    ///
    /// The mark is session-local: the membership row is only removed
    /// when the session ends with QUIT.  A message already marked is
    /// answered -ERR.
    DELE,
    /// NOOP does nothing and replies +OK.
    NOOP,
    /// RSET unmarks every message marked as deleted in this session.
    RSET,
    /// TOP is acknowledged but not served.
    ///
    /// The command is accepted with its message-number argument and
    /// answered +OK without content; header and body-line extraction is
    /// not implemented.
    TOP,
    /// UIDL is acknowledged but not served.
    ///
    /// Answered +OK with or without an argument; unique-id listings are
    /// not implemented.
    UIDL,
    /// QUIT ends the session.
    ///
    /// Issued in the TRANSACTION state it commits the pending deletes;
    /// anywhere else it simply closes.
    QUIT,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "USER" => Command::USER,
            "PASS" => Command::PASS,
            "STAT" => Command::STAT,
            "LIST" => Command::LIST,
            "RETR" => Command::RETR,
            "DELE" => Command::DELE,
            "NOOP" => Command::NOOP,
            "RSET" => Command::RSET,
            "TOP" => Command::TOP,
            "UIDL" => Command::UIDL,
            "QUIT" => Command::QUIT,
            _ => return Err(anyhow::anyhow!("invalid command: {}", s)),
        })
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let v = match self {
            Command::USER => "USER",
            Command::PASS => "PASS",
            Command::STAT => "STAT",
            Command::LIST => "LIST",
            Command::RETR => "RETR",
            Command::DELE => "DELE",
            Command::NOOP => "NOOP",
            Command::RSET => "RSET",
            Command::TOP => "TOP",
            Command::UIDL => "UIDL",
            Command::QUIT => "QUIT",
        };

        write!(f, "{}", v)
    }
}

/// A parsed command line.  Message numbers are the client-visible
/// 1-based ordinals into the session snapshot.
#[derive(Debug, PartialEq)]
pub enum Request {
    USER(String),
    PASS(String),
    STAT,
    LIST(Option<usize>),
    RETR(usize),
    DELE(usize),
    NOOP,
    RSET,
    TOP { id: usize, lines: Option<usize> },
    UIDL(Option<usize>),
    QUIT,
}

impl Request {
    /// Parse one command line (CRLF already removed).
    ///
    /// Any failure maps to the bare -ERR reply, so the error carries a
    /// description for the log only.
    pub fn parse(v: &str) -> anyhow::Result<Request> {
        // USER and PASS keep their argument verbatim, spaces included.
        let mut head = v.splitn(2, ' ');
        let verb = head.next().unwrap_or("");
        let cmd = Command::from_str(verb)?;

        if let Command::USER | Command::PASS = cmd {
            let arg = match head.next() {
                Some(arg) if !arg.is_empty() => arg,
                _ => return Err(anyhow::anyhow!("invalid request for {}: {}", cmd, v)),
            };

            if arg.len() > ARG_MAX {
                return Err(anyhow::anyhow!("argument too long for {}: {}", cmd, v));
            }

            return Ok(match cmd {
                Command::USER => Request::USER(arg.to_string()),
                _ => Request::PASS(arg.to_string()),
            });
        }

        let vs: Vec<&str> = v.split(' ').filter(|s| !s.is_empty()).collect();

        let req = match cmd {
            Command::STAT => {
                if vs.len() != 1 {
                    return Err(anyhow::anyhow!("invalid request for {}: {}", cmd, v));
                }

                Request::STAT
            }
            Command::LIST => match vs.len() {
                1 => Request::LIST(None),
                2 => Request::LIST(Some(usize::from_str(vs[1])?)),
                _ => {
                    return Err(anyhow::anyhow!("invalid request for {}: {}", cmd, v));
                }
            },
            Command::RETR => {
                if vs.len() != 2 {
                    return Err(anyhow::anyhow!("invalid request for {}: {}", cmd, v));
                }

                Request::RETR(usize::from_str(vs[1])?)
            }
            Command::DELE => {
                if vs.len() != 2 {
                    return Err(anyhow::anyhow!("invalid request for {}: {}", cmd, v));
                }

                Request::DELE(usize::from_str(vs[1])?)
            }
            Command::NOOP => {
                if vs.len() != 1 {
                    return Err(anyhow::anyhow!("invalid request for {}: {}", cmd, v));
                }

                Request::NOOP
            }
            Command::RSET => {
                if vs.len() != 1 {
                    return Err(anyhow::anyhow!("invalid request for {}: {}", cmd, v));
                }

                Request::RSET
            }
            Command::TOP => match vs.len() {
                2 => Request::TOP {
                    id: usize::from_str(vs[1])?,
                    lines: None,
                },
                3 => Request::TOP {
                    id: usize::from_str(vs[1])?,
                    lines: Some(usize::from_str(vs[2])?),
                },
                _ => {
                    return Err(anyhow::anyhow!("invalid request for {}: {}", cmd, v));
                }
            },
            Command::UIDL => match vs.len() {
                1 => Request::UIDL(None),
                2 => Request::UIDL(Some(usize::from_str(vs[1])?)),
                _ => {
                    return Err(anyhow::anyhow!("invalid request for {}: {}", cmd, v));
                }
            },
            Command::QUIT => {
                if vs.len() != 1 {
                    return Err(anyhow::anyhow!("invalid request for {}: {}", cmd, v));
                }

                Request::QUIT
            }
            Command::USER | Command::PASS => unreachable!(),
        };

        Ok(req)
    }
}

/// Everything the server sends back.
///
/// Message content is carried as raw bytes: a stored body is not
/// guaranteed to be valid UTF-8.
#[derive(Debug, PartialEq)]
pub enum Response {
    /// The one-time banner sent when a session opens.
    Greet(String),
    Ok,
    Err,
    Stat { count: usize, size: u64 },
    /// The full multi-line scan listing: `(ordinal, size)` per entry.
    List(Vec<(usize, u64)>),
    /// The single scan listing for one message.
    ListSingle { ordinal: usize, size: u64 },
    /// One full message, byte-stuffed on the way out.
    Retr(Vec<u8>),
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::Greet(host) => format!("+OK POP3 server ready <{}>\r\n", host).into_bytes(),
            Response::Ok => b"+OK\r\n".to_vec(),
            Response::Err => b"-ERR\r\n".to_vec(),
            Response::Stat { count, size } => format!("+OK {} {}\r\n", count, size).into_bytes(),
            Response::List(entries) => {
                let mut f = String::from("+OK\r\n");
                for (ordinal, size) in entries.iter() {
                    f.push_str(&format!("{} {}\r\n", ordinal, size));
                }
                f.push_str(".\r\n");
                f.into_bytes()
            }
            Response::ListSingle { ordinal, size } => {
                format!("+OK {} {}\r\n", ordinal, size).into_bytes()
            }
            Response::Retr(body) => {
                let mut f = b"+OK\r\n".to_vec();
                stuff_body(body, &mut f);
                f.extend_from_slice(b".\r\n");
                f
            }
        }
    }
}

/// Append `body` to `out` with byte-stuffing applied: any line beginning
/// with `.` is written as `..` so it cannot be mistaken for the
/// terminator.  A missing final CRLF is added so the closing `.` always
/// stands on its own line.
pub fn stuff_body(body: &[u8], out: &mut Vec<u8>) {
    let mut line_start = true;

    for &b in body {
        if line_start && b == b'.' {
            out.push(b'.');
        }

        out.push(b);
        line_start = b == b'\n';
    }

    if !body.is_empty() && !body.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
}
