use crate::Database;
use crate::models::{
    NonceConsumption, NonceRow, OtpRedemption, OtpRow, PurgeCounts, SessionRow, UserRow,
};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

const USER_COLUMNS: &str = "id, eth_address, username, created_at, updated_at, last_login";

impl Database {
    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    // -- Users --

    /// Create a user directly (admin tooling). Wallet users are created by
    /// `consume_nonce_for_login` instead.
    pub fn create_user(&self, username: &str, eth_address: Option<&str>) -> Result<UserRow> {
        let now = Utc::now();
        let user = UserRow {
            id: Uuid::new_v4().to_string(),
            eth_address: eth_address.map(str::to_lowercase),
            username: username.to_string(),
            created_at: now,
            updated_at: now,
            last_login: None,
        };

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, eth_address, username, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                params![user.id, user.eth_address, user.username, now],
            )?;
            Ok(())
        })?;

        Ok(user)
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    pub fn get_user_by_address(&self, eth_address: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_address(conn, eth_address))
    }

    // -- Nonces --

    pub fn insert_nonce(&self, value: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO nonces (value, expires_at) VALUES (?1, ?2)",
                params![value, expires_at.timestamp()],
            )?;
            Ok(())
        })
    }

    pub fn get_nonce(&self, value: &str) -> Result<Option<NonceRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT value, expires_at FROM nonces WHERE value = ?1",
                    [value],
                    |row| {
                        Ok(NonceRow {
                            value: row.get(0)?,
                            expires_at: from_unix(row.get(1)?),
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Delete an unexpired nonce and get-or-create the user for `eth_address`
    /// in one transaction.
    ///
    /// The delete is conditional on expiry, so of two concurrent consumers at
    /// most one sees an affected row. Expired nonces are left in place.
    pub fn consume_nonce_for_login(
        &self,
        value: &str,
        eth_address: &str,
        now: DateTime<Utc>,
    ) -> Result<NonceConsumption> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let deleted = tx.execute(
                "DELETE FROM nonces WHERE value = ?1 AND expires_at > ?2",
                params![value, now.timestamp()],
            )?;

            if deleted == 0 {
                let exists = tx
                    .query_row("SELECT 1 FROM nonces WHERE value = ?1", [value], |_| Ok(()))
                    .optional()?
                    .is_some();
                return Ok(if exists {
                    NonceConsumption::Expired
                } else {
                    NonceConsumption::Missing
                });
            }

            let (user, created) = get_or_create_user_by_address(&tx, eth_address, now)?;
            tx.commit()?;

            Ok(NonceConsumption::Consumed { user, created })
        })
    }

    // -- OTPs --

    /// Insert an OTP. Returns `false` when the code is already taken so the
    /// caller can draw a new one.
    pub fn insert_otp(&self, code: &str, user_id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let res = conn.execute(
                "INSERT INTO otps (code, user_id, expires_at) VALUES (?1, ?2, ?3)",
                params![code, user_id, expires_at.timestamp()],
            );

            match res {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_otp(&self, code: &str) -> Result<Option<OtpRow>> {
        self.with_conn(|conn| query_otp(conn, code))
    }

    /// Look up, check and delete an OTP in one transaction. Expired codes are
    /// not deleted so they keep reporting as expired.
    pub fn redeem_otp(&self, code: &str, now: DateTime<Utc>) -> Result<OtpRedemption> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let otp = match query_otp(&tx, code)? {
                None => return Ok(OtpRedemption::Missing),
                Some(otp) if otp.expires_at <= now => return Ok(OtpRedemption::Expired),
                Some(otp) => otp,
            };

            let deleted = tx.execute("DELETE FROM otps WHERE code = ?1", [code])?;
            if deleted == 0 {
                return Ok(OtpRedemption::Missing);
            }

            tx.execute(
                "UPDATE users SET last_login = ?1, updated_at = ?1 WHERE id = ?2",
                params![now, otp.user_id],
            )?;
            let user = query_user_by_id(&tx, &otp.user_id)?
                .ok_or_else(|| anyhow!("OTP owner {} missing", otp.user_id))?;

            tx.commit()?;
            Ok(OtpRedemption::Redeemed { user })
        })
    }

    // -- Sessions --

    pub fn insert_session(
        &self,
        digest: &str,
        user_id: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO sessions (digest, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![digest, user_id, created_at.timestamp(), expires_at.timestamp()],
            )?;
            Ok(())
        })
    }

    pub fn get_session(&self, digest: &str) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT digest, user_id, created_at, expires_at FROM sessions WHERE digest = ?1",
                    [digest],
                    |row| {
                        Ok(SessionRow {
                            digest: row.get(0)?,
                            user_id: row.get(1)?,
                            created_at: from_unix(row.get(2)?),
                            expires_at: from_unix(row.get(3)?),
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn extend_session(&self, digest: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE sessions SET expires_at = ?1 WHERE digest = ?2",
                params![expires_at.timestamp(), digest],
            )?;
            Ok(n > 0)
        })
    }

    pub fn delete_session(&self, digest: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM sessions WHERE digest = ?1", [digest])?;
            Ok(n > 0)
        })
    }

    pub fn delete_user_sessions(&self, user_id: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM sessions WHERE user_id = ?1", [user_id])?;
            Ok(n)
        })
    }

    pub fn count_active_sessions(&self, user_id: &str, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE user_id = ?1 AND expires_at > ?2",
                params![user_id, now.timestamp()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    // -- Cleanup --

    /// Remove every expired nonce, OTP and session.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeCounts> {
        let cutoff = now.timestamp();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let counts = PurgeCounts {
                nonces: tx.execute("DELETE FROM nonces WHERE expires_at <= ?1", [cutoff])?,
                otps: tx.execute("DELETE FROM otps WHERE expires_at <= ?1", [cutoff])?,
                sessions: tx.execute("DELETE FROM sessions WHERE expires_at <= ?1", [cutoff])?,
            };
            tx.commit()?;
            Ok(counts)
        })
    }
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        eth_address: row.get(1)?,
        username: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        last_login: row.get(5)?,
    })
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], map_user).optional()?)
}

// eth_address is COLLATE NOCASE, so this match is case-insensitive
fn query_user_by_address(conn: &Connection, eth_address: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE eth_address = ?1");
    Ok(conn.query_row(&sql, [eth_address], map_user).optional()?)
}

fn query_otp(conn: &Connection, code: &str) -> Result<Option<OtpRow>> {
    let row = conn
        .query_row(
            "SELECT code, user_id, expires_at FROM otps WHERE code = ?1",
            [code],
            |row| {
                Ok(OtpRow {
                    code: row.get(0)?,
                    user_id: row.get(1)?,
                    expires_at: from_unix(row.get(2)?),
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Find the wallet user or create one named after the address, stamping the
/// login either way. Returns `(user, created)`.
fn get_or_create_user_by_address(
    conn: &Connection,
    eth_address: &str,
    now: DateTime<Utc>,
) -> Result<(UserRow, bool)> {
    let eth_address = eth_address.to_lowercase();

    if let Some(user) = query_user_by_address(conn, &eth_address)? {
        conn.execute(
            "UPDATE users SET last_login = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, user.id],
        )?;
        return Ok((
            UserRow {
                updated_at: now,
                last_login: Some(now),
                ..user
            },
            false,
        ));
    }

    let user = UserRow {
        id: Uuid::new_v4().to_string(),
        eth_address: Some(eth_address.clone()),
        username: eth_address,
        created_at: now,
        updated_at: now,
        last_login: Some(now),
    };
    conn.execute(
        "INSERT INTO users (id, eth_address, username, created_at, updated_at, last_login)
         VALUES (?1, ?2, ?3, ?4, ?4, ?4)",
        params![user.id, user.eth_address, user.username, now],
    )?;

    Ok((user, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const ADDRESS: &str = "0xAbCdEf0123456789aBcDeF0123456789AbCdEf01";

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn nonce_is_consumed_once() {
        let db = db();
        let now = Utc::now();
        db.insert_nonce("n1", now + Duration::minutes(15)).unwrap();

        match db.consume_nonce_for_login("n1", ADDRESS, now).unwrap() {
            NonceConsumption::Consumed { user, created } => {
                assert!(created);
                assert_eq!(user.eth_address.as_deref(), Some(ADDRESS.to_lowercase().as_str()));
                assert_eq!(user.username, ADDRESS.to_lowercase());
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(db.get_nonce("n1").unwrap().is_none());
        assert!(matches!(
            db.consume_nonce_for_login("n1", ADDRESS, now).unwrap(),
            NonceConsumption::Missing
        ));
    }

    #[test]
    fn expired_nonce_stays_expired() {
        let db = db();
        let now = Utc::now();
        db.insert_nonce("old", now - Duration::seconds(1)).unwrap();

        for _ in 0..2 {
            assert!(matches!(
                db.consume_nonce_for_login("old", ADDRESS, now).unwrap(),
                NonceConsumption::Expired
            ));
        }
        // rejected nonces do not create users
        assert!(db.get_user_by_address(ADDRESS).unwrap().is_none());
    }

    #[test]
    fn address_lookup_is_case_insensitive() {
        let db = db();
        let now = Utc::now();
        db.insert_nonce("a", now + Duration::minutes(1)).unwrap();
        db.insert_nonce("b", now + Duration::minutes(1)).unwrap();

        let first = match db.consume_nonce_for_login("a", ADDRESS, now).unwrap() {
            NonceConsumption::Consumed { user, .. } => user,
            other => panic!("unexpected {:?}", other),
        };
        match db
            .consume_nonce_for_login("b", &ADDRESS.to_uppercase().replace("0X", "0x"), now)
            .unwrap()
        {
            NonceConsumption::Consumed { user, created } => {
                assert!(!created);
                assert_eq!(user.id, first.id);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn otp_collision_is_reported() {
        let db = db();
        let user = db.create_user("admin", None).unwrap();
        let expires = Utc::now() + Duration::minutes(5);

        assert!(db.insert_otp("abc123", &user.id, expires).unwrap());
        assert!(!db.insert_otp("abc123", &user.id, expires).unwrap());
    }

    #[test]
    fn otp_redeems_once_and_expired_stays_expired() {
        let db = db();
        let user = db.create_user("player", Some(ADDRESS)).unwrap();
        let now = Utc::now();
        db.insert_otp("aaaaaa", &user.id, now + Duration::minutes(5)).unwrap();
        db.insert_otp("bbbbbb", &user.id, now - Duration::minutes(1)).unwrap();

        match db.redeem_otp("aaaaaa", now).unwrap() {
            OtpRedemption::Redeemed { user: owner } => {
                assert_eq!(owner.id, user.id);
                assert!(owner.last_login.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(db.redeem_otp("aaaaaa", now).unwrap(), OtpRedemption::Missing));

        for _ in 0..2 {
            assert!(matches!(db.redeem_otp("bbbbbb", now).unwrap(), OtpRedemption::Expired));
        }
    }

    #[test]
    fn session_lifecycle() {
        let db = db();
        let user = db.create_user("player", None).unwrap();
        let now = Utc::now();

        db.insert_session("d1", &user.id, now, now + Duration::days(7)).unwrap();
        db.insert_session("d2", &user.id, now, now + Duration::days(7)).unwrap();
        assert_eq!(db.count_active_sessions(&user.id, now).unwrap(), 2);

        assert!(db.delete_session("d1").unwrap());
        assert!(!db.delete_session("d1").unwrap());
        assert_eq!(db.delete_user_sessions(&user.id).unwrap(), 1);
        assert!(db.get_session("d2").unwrap().is_none());
    }

    #[test]
    fn purge_removes_only_expired() {
        let db = db();
        let user = db.create_user("player", None).unwrap();
        let now = Utc::now();
        let past = now - Duration::minutes(1);
        let future = now + Duration::minutes(1);

        db.insert_nonce("old", past).unwrap();
        db.insert_nonce("new", future).unwrap();
        db.insert_otp("111111", &user.id, past).unwrap();
        db.insert_session("stale", &user.id, past, past).unwrap();
        db.insert_session("live", &user.id, now, future).unwrap();

        let counts = db.purge_expired(now).unwrap();
        assert_eq!(
            counts,
            PurgeCounts {
                nonces: 1,
                otps: 1,
                sessions: 1
            }
        );
        assert!(db.get_nonce("new").unwrap().is_some());
        assert!(db.get_session("live").unwrap().is_some());
    }
}
