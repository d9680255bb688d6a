use std::env;
use std::path::PathBuf;

pub const DEFAULT_SMTP_PORT: u16 = 25;
pub const DEFAULT_POP3_PORT: u16 = 110;

#[derive(Debug, Clone)]
pub struct Config {
    pub smtp_port: u16,
    pub pop3_port: u16,
    pub store_path: PathBuf,
    /// Name announced in the SMTP and POP3 banners.
    pub hostname: String,
}

impl Config {
    pub fn new(smtp_port: u16, pop3_port: u16, store_path: PathBuf) -> Config {
        Config {
            smtp_port,
            pop3_port,
            store_path,
            hostname: lookup_hostname(),
        }
    }
}

/// The banner hostname: `$HOSTNAME` if set, else the system hostname,
/// else `localhost`.  Never an error; a nameless host still serves.
pub fn lookup_hostname() -> String {
    if let Ok(name) = env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }

    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
