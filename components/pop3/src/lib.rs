/// # Example POP3 Session
///
/// S: <wait for connection on TCP port 110>
/// C: <open connection>
/// S:    +OK POP3 server ready <mx.local>
/// C:    USER bob
/// S:    +OK
/// C:    PASS secret
/// S:    +OK
/// C:    STAT
/// S:    +OK 2 320
/// C:    LIST
/// S:    +OK
/// S:    1 120
/// S:    2 200
/// S:    .
/// C:    RETR 1
/// S:    +OK
/// S:    <the POP3 server sends message 1>
/// S:    .
/// C:    DELE 1
/// S:    +OK
/// C:    QUIT
/// S:    +OK
/// C:  <close connection>
/// S:  <wait for next connection>
pub use proto::*;

mod proto;
