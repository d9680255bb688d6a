/// # Example SMTP Session
///
/// S: <wait for connection on TCP port 25>
/// C: <open connection>
/// S:    220 mx.local
/// C:    HELO client.local
/// S:    250 OK
/// C:    MAIL FROM:<alice@example.org>
/// S:    250 OK
/// C:    RCPT TO:<bob@example.org>
/// S:    250 OK
/// C:    DATA
/// S:    354 Start mail input; end with <CRLF>.<CRLF>
/// C:    Subject: hello
/// C:
/// C:    hi bob
/// C:    .
/// S:    250 OK
/// C:    QUIT
/// S:    221 Service closing transmission channel
/// C:  <close connection>
/// S:  <wait for next connection>
pub use proto::*;

mod proto;
