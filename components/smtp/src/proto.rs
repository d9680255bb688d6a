use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// HELO is used to identify the SMTP client to the SMTP server.
    ///
    /// # Restrictions
    ///
    /// Only accepted at the start of a session, before any mail
    /// transaction has been opened.
    ///
    /// # Discussion
    ///
    /// The argument clause contains the fully-qualified domain name of
    /// the SMTP client, if one is available.  In situations in which the
    /// SMTP client system does not have a meaningful domain name, the
    /// client SHOULD send an address literal.  The server accepts the
    /// argument without inspecting it; no DNS resolution is performed.
    ///
    /// # Syntax
    ///
    /// C: HELO <domain>
    /// S: 250 OK
    HELO,
    /// EHLO opens a session the same way HELO does.
    ///
    /// No extensions are advertised, so the reply is identical to the
    /// HELO reply.
    EHLO,
    /// MAIL initiates a mail transaction and carries the reverse-path.
    ///
    /// # Restrictions
    ///
    /// Only accepted after a successful HELO or EHLO, while no
    /// transaction is in progress.
    ///
    /// # Discussion
    ///
    /// The reverse-path is carried as `FROM:<local@domain>`.  Only the
    /// local part identifies a mailbox here; the domain is accepted and
    /// discarded.  A reverse-path whose local part does not name a known
    /// mailbox is rejected with 550.
    ///
    /// # Syntax
    ///
    /// C: MAIL FROM:<reverse-path>
    /// S: 250 OK
    MAIL,
    /// RCPT adds one forward-path to the transaction.
    ///
    /// # Restrictions
    ///
    /// Only accepted after MAIL, or after a previous RCPT.
    ///
    /// # Discussion
    ///
    /// May be repeated to fan a message out to several mailboxes.  Each
    /// accepted forward-path is remembered in arrival order, duplicates
    /// included.  An unknown mailbox is rejected with 550 and leaves the
    /// transaction otherwise untouched.
    ///
    /// # Syntax
    ///
    /// C: RCPT TO:<forward-path>
    /// S: 250 OK
    RCPT,
    /// DATA starts the transfer of the message content.
    ///
    /// # Restrictions
    ///
    /// Only accepted once at least one RCPT has been accepted.
    ///
    /// # Discussion
    ///
    /// After the 354 reply the client sends the message as CRLF-separated
    /// lines, ending with a line containing only `.`.  A content line
    /// beginning with `.` is transmitted with that dot doubled
    /// (dot-stuffing) and stored with it stripped.
    ///
    /// # Syntax
    ///
    /// C: DATA
    /// S: 354 Start mail input; end with <CRLF>.<CRLF>
    /// C: <message content>
    /// C: .
    /// S: 250 OK
    DATA,
    /// RSET aborts the current mail transaction.
    ///
    /// Any stored reverse-path, forward-paths and message content are
    /// discarded.  The session itself stays open.
    RSET,
    /// NOOP does nothing and replies 250.
    NOOP,
    /// VRFY asks the server to confirm that an address names a user.
    ///
    /// Verification is not performed; the server always answers 252 and
    /// lets delivery decide.
    VRFY,
    /// QUIT ends the session after a 221 reply.
    QUIT,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "HELO" => Command::HELO,
            "EHLO" => Command::EHLO,
            "MAIL" => Command::MAIL,
            "RCPT" => Command::RCPT,
            "DATA" => Command::DATA,
            "RSET" => Command::RSET,
            "NOOP" => Command::NOOP,
            "VRFY" => Command::VRFY,
            "QUIT" => Command::QUIT,
            _ => return Err(anyhow::anyhow!("invalid command: {}", s)),
        })
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let v = match self {
            Command::HELO => "HELO",
            Command::EHLO => "EHLO",
            Command::MAIL => "MAIL",
            Command::RCPT => "RCPT",
            Command::DATA => "DATA",
            Command::RSET => "RSET",
            Command::NOOP => "NOOP",
            Command::VRFY => "VRFY",
            Command::QUIT => "QUIT",
        };

        write!(f, "{}", v)
    }
}

/// A parsed command line, before any state checking.
///
/// MAIL and RCPT keep their argument clause raw: whether `FROM:<..>` /
/// `TO:<..>` parses is decided after the session state has been checked,
/// so that a command sent out of sequence is answered 503 no matter how
/// its arguments look.
#[derive(Debug, PartialEq)]
pub enum Request {
    HELO(String),
    EHLO(String),
    MAIL(String),
    RCPT(String),
    DATA,
    RSET,
    NOOP,
    VRFY(String),
    QUIT,
}

impl Request {
    /// Parse one command line (CRLF already removed).
    ///
    /// Trailing spaces are trimmed first, then the verb is split off at
    /// the first space.  Errors are returned as the reply the server
    /// must send: 500 for an empty line or unknown verb, 501 for a
    /// missing or forbidden argument clause.
    pub fn parse(line: &str) -> Result<Request, Reply> {
        let line = line.trim_end_matches(' ');

        let mut vs = line.splitn(2, ' ');
        let verb = match vs.next() {
            Some(v) if !v.is_empty() => v,
            _ => return Err(Reply::CommandUnrecognized),
        };
        let arg = vs.next();

        let cmd = match Command::from_str(verb) {
            Ok(cmd) => cmd,
            Err(_) => return Err(Reply::CommandUnrecognized),
        };

        let req = match cmd {
            Command::HELO => Request::HELO(required(arg)?),
            Command::EHLO => Request::EHLO(required(arg)?),
            Command::MAIL => Request::MAIL(required(arg)?),
            Command::RCPT => Request::RCPT(required(arg)?),
            Command::VRFY => Request::VRFY(required(arg)?),
            Command::DATA => {
                forbidden(arg)?;
                Request::DATA
            }
            Command::RSET => {
                forbidden(arg)?;
                Request::RSET
            }
            Command::QUIT => {
                forbidden(arg)?;
                Request::QUIT
            }
            // NOOP takes no argument of its own but tolerates one.
            Command::NOOP => Request::NOOP,
        };

        Ok(req)
    }
}

fn required(arg: Option<&str>) -> Result<String, Reply> {
    match arg {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(Reply::SyntaxError),
    }
}

fn forbidden(arg: Option<&str>) -> Result<(), Reply> {
    match arg {
        Some(v) if !v.is_empty() => Err(Reply::SyntaxError),
        _ => Ok(()),
    }
}

/// Extract the mailbox from a `FROM:<local@domain>` / `TO:<local@domain>`
/// argument clause.
///
/// The keyword comparison is case-insensitive, the colon must follow it
/// immediately and the `<` must follow the colon, with the closing `>` as
/// the last character of the clause.  What is returned is the local part:
/// the text between `<` and the first `@` or `>`.  The domain is ignored.
pub fn parse_path(keyword: &str, arg: &str) -> Option<String> {
    let rest = arg
        .get(..keyword.len())
        .filter(|head| head.eq_ignore_ascii_case(keyword))
        .map(|_| &arg[keyword.len()..])?;

    let rest = rest.strip_prefix(':')?;
    let rest = rest.strip_prefix('<')?;

    if !rest.ends_with('>') {
        return None;
    }

    let end = rest.find(|c| c == '@' || c == '>').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

/// Every reply this server sends, one line each.
///
/// The wording follows RFC 5321 where it gives one.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Reply {
    /// 221, answer to QUIT.
    Closing,
    /// 250, the general success reply.
    Ok,
    /// 252, answer to VRFY: not verified, delivery will tell.
    VrfyUnverified,
    /// 354, answer to DATA: go ahead with the content.
    StartMailInput,
    /// 451, a store failure aborted the transaction.
    LocalError,
    /// 500, empty line or unknown verb.
    CommandUnrecognized,
    /// 501, bad or missing arguments for a known verb.
    SyntaxError,
    /// 503, known verb in the wrong session state.
    BadSequence,
    /// 550, reverse- or forward-path names no known mailbox.
    MailboxNotFound,
}

impl Reply {
    pub fn code(&self) -> u16 {
        match self {
            Reply::Closing => 221,
            Reply::Ok => 250,
            Reply::VrfyUnverified => 252,
            Reply::StartMailInput => 354,
            Reply::LocalError => 451,
            Reply::CommandUnrecognized => 500,
            Reply::SyntaxError => 501,
            Reply::BadSequence => 503,
            Reply::MailboxNotFound => 550,
        }
    }

    /// The full wire line, CRLF included.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Closing => "221 Service closing transmission channel\r\n",
            Reply::Ok => "250 OK\r\n",
            Reply::VrfyUnverified => {
                "252 Cannot VRFY user, but will accept message and attempt delivery\r\n"
            }
            Reply::StartMailInput => "354 Start mail input; end with <CRLF>.<CRLF>\r\n",
            Reply::LocalError => "451 Requested action aborted: local error in processing\r\n",
            Reply::CommandUnrecognized => "500 Syntax error, command unrecognized\r\n",
            Reply::SyntaxError => "501 Syntax error in parameters or arguments\r\n",
            Reply::BadSequence => "503 Bad sequence of commands\r\n",
            Reply::MailboxNotFound => "550 Mailbox not found\r\n",
        }
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The one-time banner sent when a session opens.
pub fn greeting(hostname: &str) -> String {
    format!("220 {}\r\n", hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_is_case_insensitive() {
        assert_eq!(Request::parse("helo there"), Ok(Request::HELO("there".to_string())));
        assert_eq!(Request::parse("QuIt"), Ok(Request::QUIT));
    }

    #[test]
    fn empty_line_is_unrecognized() {
        assert_eq!(Request::parse(""), Err(Reply::CommandUnrecognized));
        assert_eq!(Request::parse("   "), Err(Reply::CommandUnrecognized));
    }

    #[test]
    fn unknown_verb_is_unrecognized() {
        assert_eq!(Request::parse("EXPN list"), Err(Reply::CommandUnrecognized));
    }

    #[test]
    fn trailing_spaces_are_trimmed() {
        assert_eq!(Request::parse("QUIT   "), Ok(Request::QUIT));
        assert_eq!(
            Request::parse("MAIL FROM:<a@x>  "),
            Ok(Request::MAIL("FROM:<a@x>".to_string()))
        );
    }

    #[test]
    fn missing_argument_is_syntax_error() {
        assert_eq!(Request::parse("HELO"), Err(Reply::SyntaxError));
        assert_eq!(Request::parse("MAIL"), Err(Reply::SyntaxError));
        assert_eq!(Request::parse("RCPT"), Err(Reply::SyntaxError));
        assert_eq!(Request::parse("VRFY"), Err(Reply::SyntaxError));
    }

    #[test]
    fn forbidden_argument_is_syntax_error() {
        assert_eq!(Request::parse("DATA now"), Err(Reply::SyntaxError));
        assert_eq!(Request::parse("RSET x"), Err(Reply::SyntaxError));
        assert_eq!(Request::parse("QUIT x"), Err(Reply::SyntaxError));
    }

    #[test]
    fn noop_tolerates_arguments() {
        assert_eq!(Request::parse("NOOP"), Ok(Request::NOOP));
        assert_eq!(Request::parse("NOOP ping"), Ok(Request::NOOP));
    }

    #[test]
    fn path_extracts_local_part() {
        assert_eq!(parse_path("FROM", "FROM:<alice@example.org>"), Some("alice".to_string()));
        assert_eq!(parse_path("TO", "TO:<bob@x>"), Some("bob".to_string()));
        assert_eq!(parse_path("TO", "to:<bob@x>"), Some("bob".to_string()));
    }

    #[test]
    fn path_without_domain_reads_to_closing_bracket() {
        assert_eq!(parse_path("FROM", "FROM:<postmaster>"), Some("postmaster".to_string()));
    }

    #[test]
    fn path_rejects_malformed_clauses() {
        assert_eq!(parse_path("FROM", "FROM alice"), None);
        assert_eq!(parse_path("FROM", "FROM:alice@x"), None);
        assert_eq!(parse_path("FROM", "FROM: <alice@x>"), None);
        assert_eq!(parse_path("FROM", "FROM:<alice@x"), None);
        assert_eq!(parse_path("FROM", "FROM:<alice@x> extra"), None);
        assert_eq!(parse_path("TO", "FROM:<alice@x>"), None);
    }

    #[test]
    fn path_may_be_empty() {
        // "<>" is the null reverse-path; the store lookup will reject it.
        assert_eq!(parse_path("FROM", "FROM:<>"), Some(String::new()));
    }

    #[test]
    fn replies_render_code_and_crlf() {
        assert_eq!(Reply::Ok.as_str(), "250 OK\r\n");
        assert_eq!(Reply::BadSequence.code(), 503);
        assert!(Reply::StartMailInput.as_str().ends_with("\r\n"));
    }

    #[test]
    fn greeting_carries_hostname() {
        assert_eq!(greeting("mx.local"), "220 mx.local\r\n");
    }
}
