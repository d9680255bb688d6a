//! The shared mailbox store.
//!
//! One SQLite database holds three relations: `mailbox(id, auth)`,
//! `message(id, data)` and the `mailbox_message` membership linking them.
//! The schema is provisioned out-of-band; the server opens an existing
//! database read-write and refuses to create one.
//!
//! All sessions share one connection behind a mutex, so store access is
//! serialized across sessions.  Statements are prepared once per
//! connection and cached.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open an existing store.
    ///
    /// A missing or unreadable database is a startup failure.  Foreign
    /// keys are enforced for the lifetime of the connection so a
    /// membership row can never outlive its mailbox or message.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .with_context(|| format!("failed to open database {}", path.display()))?;

        conn.execute_batch("PRAGMA foreign_keys = ON")
            .context("failed to enable foreign keys")?;

        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store mutex poisoned"))
    }

    /// True iff a mailbox with this id is present.
    pub fn mailbox_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT EXISTS (SELECT 1 FROM mailbox WHERE id = ?)")?;
        let exists = stmt.query_row(params![id], |row| row.get(0))?;
        Ok(exists)
    }

    /// True iff the mailbox exists and its secret matches.
    pub fn check_login(&self, id: &str, secret: &str) -> Result<bool> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT EXISTS (SELECT 1 FROM mailbox WHERE id = ? AND auth = ?)")?;
        let ok = stmt.query_row(params![id, secret], |row| row.get(0))?;
        Ok(ok)
    }

    /// Every `(message id, size in bytes)` held by a mailbox, ascending
    /// by message id.
    ///
    /// The order is what a POP3 session freezes into its snapshot, so it
    /// has to be stable across calls.
    pub fn list_messages(&self, mailbox: &str) -> Result<Vec<(i64, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT b.id, LENGTH(b.data) FROM mailbox_message a \
             INNER JOIN message b ON a.message_id = b.id \
             WHERE a.mailbox_id = ? ORDER BY b.id",
        )?;

        let rows = stmt.query_map(params![mailbox], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as u64))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }

        Ok(messages)
    }

    /// The raw body of one message, or `None` when the mailbox does not
    /// hold it (no membership row).
    pub fn fetch_message(&self, mailbox: &str, id: i64) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT b.data FROM mailbox_message a \
             INNER JOIN message b ON a.message_id = b.id \
             WHERE a.mailbox_id = ? AND a.message_id = ?",
        )?;

        let body = stmt
            .query_row(params![mailbox, id], |row| row.get(0))
            .optional()?;

        Ok(body)
    }

    /// Deliver one message to a set of mailboxes.
    ///
    /// The message row and every membership row are written in a single
    /// transaction: either the whole fan-out lands or none of it does.
    /// Returns the id assigned to the new message.
    pub fn insert_message(&self, body: &[u8], recipients: &[String]) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare_cached("INSERT INTO message(data) VALUES(?)")?;
            stmt.execute(params![body])?;
        }

        let id = tx.last_insert_rowid();

        {
            let mut stmt = tx
                .prepare_cached("INSERT INTO mailbox_message(mailbox_id, message_id) VALUES(?, ?)")?;
            for recipient in recipients {
                stmt.execute(params![recipient, id])?;
            }
        }

        tx.commit()?;
        Ok(id)
    }

    /// Remove a batch of memberships for one mailbox, reaping any
    /// message left with no mailbox at all.
    ///
    /// Used by POP3 QUIT to commit the session's tentative deletes; the
    /// batch is one transaction.
    pub fn delete_memberships(&self, mailbox: &str, ids: &[i64]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare_cached(
                "DELETE FROM mailbox_message WHERE mailbox_id = ? AND message_id = ?",
            )?;
            let mut reap = tx.prepare_cached(
                "DELETE FROM message WHERE id = ? AND NOT EXISTS \
                 (SELECT 1 FROM mailbox_message WHERE message_id = message.id)",
            )?;

            for id in ids {
                stmt.execute(params![mailbox, id])?;
                reap.execute(params![id])?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use rusqlite::{params, Connection};
    use tempfile::TempDir;

    use super::Store;

    /// The out-of-band provisioned schema, as the server expects it.
    pub(crate) const SCHEMA: &str = "
        CREATE TABLE mailbox (
            id TEXT PRIMARY KEY,
            auth TEXT NOT NULL
        );
        CREATE TABLE message (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            data BLOB NOT NULL
        );
        CREATE TABLE mailbox_message (
            mailbox_id TEXT REFERENCES mailbox(id),
            message_id INTEGER REFERENCES message(id) ON DELETE CASCADE,
            PRIMARY KEY (mailbox_id, message_id)
        );
    ";

    /// A freshly provisioned store holding the given `(id, auth)`
    /// mailboxes.  The TempDir keeps the database file alive.
    pub(crate) fn open_seeded(mailboxes: &[(&str, &str)]) -> (TempDir, Store) {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("mail.db");

        let conn = Connection::open(&path).expect("create database");
        conn.execute_batch(SCHEMA).expect("create schema");
        for (id, auth) in mailboxes {
            conn.execute("INSERT INTO mailbox(id, auth) VALUES(?, ?)", params![id, auth])
                .expect("seed mailbox");
        }
        drop(conn);

        (dir, Store::open(path).expect("open store"))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::open_seeded;
    use super::*;

    #[test]
    fn open_refuses_missing_database() {
        assert!(Store::open("/nonexistent/mail.db").is_err());
    }

    #[test]
    fn mailbox_lookup() {
        let (_dir, store) = open_seeded(&[("alice", "pw")]);

        assert!(store.mailbox_exists("alice").unwrap());
        assert!(!store.mailbox_exists("ghost").unwrap());
        assert!(!store.mailbox_exists("").unwrap());
    }

    #[test]
    fn login_requires_matching_secret() {
        let (_dir, store) = open_seeded(&[("alice", "pw")]);

        assert!(store.check_login("alice", "pw").unwrap());
        assert!(!store.check_login("alice", "wrong").unwrap());
        assert!(!store.check_login("ghost", "pw").unwrap());
    }

    #[test]
    fn delivery_fans_out_to_each_recipient() {
        let (_dir, store) = open_seeded(&[("alice", "pw"), ("bob", "pw")]);

        let id = store
            .insert_message(b"hi\r\n", &["alice".to_string(), "bob".to_string()])
            .unwrap();

        assert_eq!(store.list_messages("alice").unwrap(), vec![(id, 4)]);
        assert_eq!(store.list_messages("bob").unwrap(), vec![(id, 4)]);
        assert_eq!(store.fetch_message("bob", id).unwrap().unwrap(), b"hi\r\n");
    }

    #[test]
    fn delivery_to_unknown_mailbox_leaves_no_rows() {
        let (_dir, store) = open_seeded(&[("alice", "pw")]);

        // The foreign key rejects the membership; the message row must
        // roll back with it.
        let result = store.insert_message(b"hi\r\n", &["ghost".to_string()]);
        assert!(result.is_err());

        assert_eq!(store.list_messages("alice").unwrap(), vec![]);
        let probe = rusqlite::Connection::open(_dir.path().join("mail.db")).unwrap();
        let messages: i64 = probe
            .query_row("SELECT COUNT(*) FROM message", [], |row| row.get(0))
            .unwrap();
        assert_eq!(messages, 0);
    }

    #[test]
    fn list_is_ordered_by_message_id() {
        let (_dir, store) = open_seeded(&[("bob", "pw")]);

        let first = store.insert_message(b"one\r\n", &["bob".to_string()]).unwrap();
        let second = store.insert_message(b"two!\r\n", &["bob".to_string()]).unwrap();

        assert!(first < second);
        assert_eq!(
            store.list_messages("bob").unwrap(),
            vec![(first, 5), (second, 6)]
        );
    }

    #[test]
    fn fetch_requires_membership() {
        let (_dir, store) = open_seeded(&[("alice", "pw"), ("bob", "pw")]);

        let id = store.insert_message(b"hi\r\n", &["bob".to_string()]).unwrap();

        assert!(store.fetch_message("alice", id).unwrap().is_none());
        assert!(store.fetch_message("bob", id).unwrap().is_some());
    }

    #[test]
    fn delete_reaps_unreferenced_messages() {
        let (_dir, store) = open_seeded(&[("alice", "pw"), ("bob", "pw")]);

        let shared = store
            .insert_message(b"both\r\n", &["alice".to_string(), "bob".to_string()])
            .unwrap();
        let only_bob = store.insert_message(b"solo\r\n", &["bob".to_string()]).unwrap();

        store.delete_memberships("bob", &[shared, only_bob]).unwrap();

        assert_eq!(store.list_messages("bob").unwrap(), vec![]);
        // Still referenced by alice, so the shared body survives.
        assert_eq!(store.fetch_message("alice", shared).unwrap().unwrap(), b"both\r\n");

        // The solo message lost its last reference and was reaped.
        let probe = rusqlite::Connection::open(_dir.path().join("mail.db")).unwrap();
        let orphans: i64 = probe
            .query_row(
                "SELECT COUNT(*) FROM message WHERE id = ?",
                params![only_bob],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn delete_of_empty_batch_is_a_noop() {
        let (_dir, store) = open_seeded(&[("bob", "pw")]);
        store.delete_memberships("bob", &[]).unwrap();
    }
}
