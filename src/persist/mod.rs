//! Persistent storage for the provider.
//!
//! Backs the parts of the system that outlive a single request: consent
//! approvals (the opaque "ref" an identity manager hands back from
//! `ApproveScopes`), issued refresh tokens (so single-use can be enforced
//! under compare-and-swap), and in-flight authorization codes. SQLite with
//! secure file permissions, refinery migrations, and the same cross-platform
//! migration lock used for any other sqlite-backed bootstrap.

use anyhow::{Context, Result};
use refinery::Runner;
use refinery::embed_migrations;
use rusqlite::{Connection, OptionalExtension, params};

embed_migrations!("migrations/sqlite");

#[cfg(unix)]
use fs2::FileExt;
#[cfg(unix)]
use std::fs::OpenOptions;
#[cfg(unix)]
use std::time::Instant;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[cfg(windows)]
use std::ffi::OsStr;
#[cfg(windows)]
use std::os::windows::ffi::OsStrExt;

#[cfg(windows)]
mod windows_lock {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Threading::{CreateMutexW, ReleaseMutex, WaitForSingleObject};
    use windows::core::PCWSTR;

    pub struct NamedMutexGuard(HANDLE);

    impl Drop for NamedMutexGuard {
        fn drop(&mut self) {
            unsafe {
                let _ = ReleaseMutex(self.0);
                let _ = CloseHandle(self.0);
            }
        }
    }

    fn mutex_name_from_lock_path(lock_path: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(lock_path.to_string_lossy().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("Global\\idpd_migrate_{}", digest)
    }

    pub fn acquire(lock_path: &Path, timeout: Duration) -> anyhow::Result<NamedMutexGuard> {
        let name = mutex_name_from_lock_path(lock_path);
        let wide: Vec<u16> = OsStr::new(&name)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let pcw = PCWSTR(wide.as_ptr());

        unsafe {
            let handle = CreateMutexW(None, false, pcw)?;
            let ms: u32 = match timeout.as_millis().try_into() {
                Ok(v) => v,
                Err(_) => u32::MAX,
            };
            let wait = WaitForSingleObject(handle, ms);
            let wait_val: u32 = wait.0 as u32;
            if wait_val == 0 {
                return Ok(NamedMutexGuard(handle));
            }
            let _ = CloseHandle(handle);
            if wait_val == 0x102 {
                return Err(anyhow::anyhow!("timeout waiting for named mutex"));
            }
            Err(anyhow::anyhow!(
                "waiting for named mutex failed: {}",
                wait_val
            ))
        }
    }
}

/// Opens a lock file with retry logic for Unix systems.
#[cfg(unix)]
fn open_lock_file_with_retry(lock_path: &Path, timeout: Duration) -> anyhow::Result<std::fs::File> {
    use std::thread::sleep;

    let start = Instant::now();
    loop {
        match OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(lock_path)
        {
            Ok(f) => match f.try_lock_exclusive() {
                Ok(()) => return Ok(f),
                Err(_) => {
                    if start.elapsed() > timeout {
                        return Err(anyhow::anyhow!(
                            "timeout acquiring migration lock {}: {}",
                            lock_path.display(),
                            timeout.as_secs()
                        ));
                    }
                    sleep(Duration::from_millis(100));
                }
            },
            Err(e) => {
                if start.elapsed() > timeout {
                    return Err(anyhow::anyhow!(
                        "timeout opening migration lock file {}: {}",
                        lock_path.display(),
                        e
                    ));
                }
                tracing::debug!(
                    "open migration lock {} failed (will retry): {}",
                    lock_path.display(),
                    e
                );
                sleep(Duration::from_millis(100));
            }
        }
    }
}

#[cfg(windows)]
type LockGuard = windows_lock::NamedMutexGuard;
#[cfg(unix)]
type LockGuard = (std::fs::File, PathBuf);

/// Cross-platform migration lock guard; serializes bootstrap across processes
/// sharing one database file.
#[allow(dead_code)]
struct MigrationLockGuard(LockGuard);

fn open_db_connection(db_path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening sqlite db at {}", db_path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "busy_timeout", 5000i64).ok();
    Ok(conn)
}

impl MigrationLockGuard {
    fn new(lock_path: &Path, timeout: Duration) -> anyhow::Result<Self> {
        #[cfg(windows)]
        {
            let guard = windows_lock::acquire(lock_path, timeout)
                .with_context(|| format!("acquiring named mutex for {}", lock_path.display()))?;
            tracing::debug!("Acquired Windows named-mutex for {}", lock_path.display());
            Ok(MigrationLockGuard(guard))
        }
        #[cfg(unix)]
        {
            let file = open_lock_file_with_retry(lock_path, timeout)?;
            tracing::debug!("Acquired Unix file lock for {}", lock_path.display());
            Ok(MigrationLockGuard((file, lock_path.to_path_buf())))
        }
    }
}

impl Drop for MigrationLockGuard {
    fn drop(&mut self) {
        #[cfg(windows)]
        {
            // NamedMutexGuard handles cleanup automatically
        }
        #[cfg(unix)]
        {
            let (file, path) = &self.0;
            let _ = file.unlock();
            let _ = fs::remove_file(path);
        }
    }
}

/// Applies database migrations, preferring filesystem migrations if available.
///
/// If `IDPD_MIGRATIONS_DIR` is set, loads and applies migrations from that
/// directory. Otherwise applies the migrations embedded in the binary.
fn apply_migrations(db_path: &Path, migrations_dir: Option<&str>) -> anyhow::Result<()> {
    if let Some(dir) = migrations_dir {
        let dir_path = PathBuf::from(dir);
        if !dir_path.exists() {
            tracing::warn!(
                "IDPD_MIGRATIONS_DIR {} does not exist; skipping filesystem migrations",
                dir_path.display()
            );
            return Ok(());
        }

        tracing::info!("Applying filesystem migrations from {}", dir);
        let migrations = refinery::load_sql_migrations(&dir_path)
            .with_context(|| format!("loading migrations from {}", dir_path.display()))?;

        let mut conn = open_db_connection(db_path)?;
        let runner = Runner::new(&migrations)
            .set_abort_divergent(true)
            .set_abort_missing(true);
        runner
            .run(&mut conn)
            .with_context(|| "applying filesystem migrations via refinery")?;
    } else {
        tracing::info!("Applying embedded refinery migrations");
        let mut conn = open_db_connection(db_path)?;
        migrations::runner()
            .run(&mut conn)
            .with_context(|| "applying embedded migrations")?;
    }
    Ok(())
}

use tokio::task;

use crate::utility::{set_secure_dir_permissions, set_secure_file_permissions};

pub mod models;
pub use models::{AuthorizationCodeRecord, ConsentApprovalRecord, RefreshTokenRecord};

/// SQLite-backed persistence handle for consent approvals, refresh tokens and
/// authorization codes.
#[derive(Clone, Debug)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Opens (creating if necessary) the database at the default path,
    /// running bootstrap migrations and hardening file permissions.
    pub fn new() -> Result<Self> {
        let path = resolve_db_path()?;
        Self::with_path(path)
    }

    /// Opens the database at an explicit path. Used by tests and by callers
    /// overriding the default location.
    pub fn with_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tracing::debug!("Initializing database at: {}", path.display());
        ensure_parent_dir(&path)?;
        let db = Self {
            db_path: path.clone(),
        };
        db.run_bootstrap_migrations()?;

        if path.exists() {
            set_secure_file_permissions(&path).with_context(|| {
                format!(
                    "setting secure permissions on database file {}",
                    path.display()
                )
            })?;
        }

        Ok(db)
    }

    fn open(&self) -> Result<Connection> {
        open_db_connection(&self.db_path)
    }

    fn run_bootstrap_migrations(&self) -> Result<()> {
        let auto = env::var("IDPD_AUTO_APPLY_MIGRATIONS").unwrap_or_else(|_| "true".into());
        if auto.eq_ignore_ascii_case("false") {
            tracing::info!(
                "Automatic migration application disabled via IDPD_AUTO_APPLY_MIGRATIONS"
            );
            return Ok(());
        }

        let _guard = MigrationLockGuard::new(
            &self.db_path.with_extension("migrate.lock"),
            Duration::from_secs(30),
        )?;
        let migrations_dir = env::var("IDPD_MIGRATIONS_DIR").ok();
        apply_migrations(&self.db_path, migrations_dir.as_deref())?;
        Ok(())
    }

    // ---------------- Consent approvals ----------------

    /// Persists a scope approval under a freshly-generated opaque reference
    /// and returns that reference. Backs `IdentityManager::approve_scopes`.
    pub async fn save_consent_approval_async(
        &self,
        record: ConsentApprovalRecord,
    ) -> Result<()> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = open_db_connection(&db_path)?;
            let scopes_json = serde_json::to_string(&record.approved_scopes)?;
            conn.execute(
                r#"
                INSERT INTO consent_approvals(ref, subject, audience, approved_scopes, created_epoch)
                VALUES(?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(ref) DO UPDATE SET approved_scopes = excluded.approved_scopes
                "#,
                params![
                    record.reference,
                    record.subject,
                    record.audience,
                    scopes_json,
                    record.created_epoch
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Retrieves a previously approved scope set by (subject, audience, ref).
    /// Backs `IdentityManager::approved_scopes`.
    pub async fn get_consent_approval_async(
        &self,
        subject: String,
        audience: String,
        reference: String,
    ) -> Result<Option<Vec<String>>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Option<Vec<String>>> {
            let conn = open_db_connection(&db_path)?;
            let scopes_json: Option<String> = conn
                .query_row(
                    r#"SELECT approved_scopes FROM consent_approvals
                       WHERE ref = ?1 AND subject = ?2 AND audience = ?3"#,
                    params![reference, subject, audience],
                    |row| row.get(0),
                )
                .optional()?;
            match scopes_json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    // ---------------- Authorization codes ----------------

    pub async fn save_authorization_code_async(
        &self,
        record: AuthorizationCodeRecord,
    ) -> Result<()> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = open_db_connection(&db_path)?;
            let scopes_json = serde_json::to_string(&record.scopes)?;
            let claims_json = serde_json::to_string(&record.claims)?;
            conn.execute(
                r#"
                INSERT INTO authorization_codes(
                    code, client_id, subject, redirect_uri, scopes, nonce,
                    code_hash_alg, expiry_epoch, consumed, claims_json, auth_time
                ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10)
                "#,
                params![
                    record.code,
                    record.client_id,
                    record.subject,
                    record.redirect_uri,
                    scopes_json,
                    record.nonce,
                    record.code_hash_alg,
                    record.expiry_epoch,
                    claims_json,
                    record.auth_time,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Consumes (single use) an authorization code in one atomic statement.
    /// Returns the record only on the first successful consumption.
    pub async fn consume_authorization_code_async(
        &self,
        code: String,
    ) -> Result<Option<AuthorizationCodeRecord>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Option<AuthorizationCodeRecord>> {
            let mut conn = open_db_connection(&db_path)?;
            let tx = conn.transaction()?;
            let row: Option<(String, String, String, String, i64, Option<String>, String, i64, String, i64)> = tx
                .query_row(
                    r#"SELECT client_id, subject, redirect_uri, scopes, expiry_epoch, nonce, code_hash_alg, consumed, claims_json, auth_time
                       FROM authorization_codes WHERE code = ?1"#,
                    params![code],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                        ))
                    },
                )
                .optional()?;

            let Some((client_id, subject, redirect_uri, scopes_json, expiry_epoch, nonce, code_hash_alg, consumed, claims_json, auth_time)) = row
            else {
                return Ok(None);
            };
            if consumed != 0 {
                return Ok(None);
            }

            let updated = tx.execute(
                "UPDATE authorization_codes SET consumed = 1 WHERE code = ?1 AND consumed = 0",
                params![code],
            )?;
            if updated == 0 {
                // Raced with another consumer.
                tx.commit()?;
                return Ok(None);
            }
            tx.commit()?;

            Ok(Some(AuthorizationCodeRecord {
                code,
                client_id,
                subject,
                redirect_uri,
                scopes: serde_json::from_str(&scopes_json)?,
                nonce,
                code_hash_alg,
                expiry_epoch,
                claims: serde_json::from_str(&claims_json)?,
                auth_time,
            }))
        })
        .await?
    }

    pub async fn cleanup_expired_codes_async(&self) -> Result<usize> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<usize> {
            let conn = open_db_connection(&db_path)?;
            let now = chrono::Utc::now().timestamp();
            let n = conn.execute(
                "DELETE FROM authorization_codes WHERE expiry_epoch <= ?1",
                params![now],
            )?;
            Ok(n)
        })
        .await?
    }

    // ---------------- Refresh tokens ----------------

    pub async fn save_refresh_token_async(&self, record: RefreshTokenRecord) -> Result<()> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<()> {
            let conn = open_db_connection(&db_path)?;
            let scopes_json = serde_json::to_string(&record.scopes)?;
            let claims_json = serde_json::to_string(&record.claims)?;
            conn.execute(
                r#"
                INSERT INTO refresh_tokens(
                    token_id, client_id, subject, scopes, manager_ref, expiry_epoch, consumed,
                    claims_json, auth_time
                ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)
                "#,
                params![
                    record.token_id,
                    record.client_id,
                    record.subject,
                    scopes_json,
                    record.manager_ref,
                    record.expiry_epoch,
                    claims_json,
                    record.auth_time,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Atomically marks a refresh token consumed. Enforces single-use
    /// acceptance: the second caller to consume the same token id observes
    /// `Ok(false)`, never partial state.
    pub async fn consume_refresh_token_async(&self, token_id: String) -> Result<bool> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<bool> {
            let conn = open_db_connection(&db_path)?;
            let n = conn.execute(
                "UPDATE refresh_tokens SET consumed = 1 WHERE token_id = ?1 AND consumed = 0",
                params![token_id],
            )?;
            Ok(n > 0)
        })
        .await?
    }

    pub async fn get_refresh_token_async(
        &self,
        token_id: String,
    ) -> Result<Option<RefreshTokenRecord>> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<Option<RefreshTokenRecord>> {
            let conn = open_db_connection(&db_path)?;
            let row: Option<(String, String, String, Option<String>, i64, i64, String, i64)> = conn
                .query_row(
                    r#"SELECT client_id, subject, scopes, manager_ref, expiry_epoch, consumed, claims_json, auth_time
                       FROM refresh_tokens WHERE token_id = ?1"#,
                    params![token_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                Some((client_id, subject, scopes_json, manager_ref, expiry_epoch, consumed, claims_json, auth_time)) => {
                    let _ = consumed;
                    Ok(Some(RefreshTokenRecord {
                        token_id,
                        client_id,
                        subject,
                        scopes: serde_json::from_str(&scopes_json)?,
                        manager_ref,
                        expiry_epoch,
                        claims: serde_json::from_str(&claims_json)?,
                        auth_time,
                    }))
                }
                None => Ok(None),
            }
        })
        .await?
    }

    pub async fn cleanup_expired_refresh_tokens_async(&self) -> Result<usize> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<usize> {
            let conn = open_db_connection(&db_path)?;
            let now = chrono::Utc::now().timestamp();
            let n = conn.execute(
                "DELETE FROM refresh_tokens WHERE expiry_epoch <= ?1",
                params![now],
            )?;
            Ok(n)
        })
        .await?
    }
}

/// Resolves the default database file path.
///
/// Checks `IDPD_DB_PATH` first, then falls back to a platform default.
fn resolve_db_path() -> Result<PathBuf> {
    if let Ok(p) = env::var("IDPD_DB_PATH") {
        return Ok(PathBuf::from(p));
    }

    #[cfg(target_os = "windows")]
    {
        let program_data =
            env::var("PROGRAMDATA").unwrap_or_else(|_| r"C:\ProgramData".to_string());
        Ok(Path::new(&program_data).join("idpd").join("idpd.db"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        Ok(PathBuf::from("/var/lib/idpd/idpd.db"))
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating parent dir {}", parent.display()))?;

        let test_file = parent.join(".idpd_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&test_file)
        {
            Ok(mut f) => {
                use std::io::Write;
                if let Err(e) = f.write_all(b"ok") {
                    let _ = std::fs::remove_file(&test_file);
                    return Err(anyhow::anyhow!(
                        "parent dir not writable {}: {}",
                        parent.display(),
                        e
                    ));
                }
                let _ = std::fs::remove_file(&test_file);
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "parent dir not writable {}: {}",
                    parent.display(),
                    e
                ));
            }
        }

        if let Err(e) = set_secure_dir_permissions(parent) {
            return Err(anyhow::anyhow!(
                "setting secure permissions on {}: {}",
                parent.display(),
                e
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::with_path(dir.path().join("idpd.db")).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn consent_approval_round_trips() {
        let (_dir, db) = test_db();
        let record = ConsentApprovalRecord {
            reference: "ref1".into(),
            subject: "u1".into(),
            audience: "c1".into(),
            approved_scopes: vec!["openid".into(), "profile".into()],
            created_epoch: 0,
        };
        db.save_consent_approval_async(record).await.unwrap();
        let scopes = db
            .get_consent_approval_async("u1".into(), "c1".into(), "ref1".into())
            .await
            .unwrap();
        assert_eq!(
            scopes,
            Some(vec!["openid".to_string(), "profile".to_string()])
        );

        let miss = db
            .get_consent_approval_async("u1".into(), "c1".into(), "nope".into())
            .await
            .unwrap();
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn authorization_code_is_single_use() {
        let (_dir, db) = test_db();
        let record = AuthorizationCodeRecord {
            code: "code1".into(),
            client_id: "c1".into(),
            subject: "u1".into(),
            redirect_uri: "https://rp/cb".into(),
            scopes: vec!["openid".into()],
            nonce: Some("n1".into()),
            code_hash_alg: "RS256".into(),
            expiry_epoch: chrono::Utc::now().timestamp() + 600,
            claims: serde_json::Map::new(),
            auth_time: chrono::Utc::now().timestamp(),
        };
        db.save_authorization_code_async(record).await.unwrap();

        let first = db
            .consume_authorization_code_async("code1".into())
            .await
            .unwrap();
        assert!(first.is_some());

        let second = db
            .consume_authorization_code_async("code1".into())
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn refresh_token_single_use_under_concurrent_consume() {
        let (_dir, db) = test_db();
        let record = RefreshTokenRecord {
            token_id: "rt1".into(),
            client_id: "c1".into(),
            subject: "u1".into(),
            scopes: vec!["openid".into(), "offline_access".into()],
            manager_ref: None,
            expiry_epoch: chrono::Utc::now().timestamp() + 3600,
            claims: serde_json::Map::new(),
            auth_time: chrono::Utc::now().timestamp(),
        };
        db.save_refresh_token_async(record).await.unwrap();

        let a = db.consume_refresh_token_async("rt1".into());
        let b = db.consume_refresh_token_async("rt1".into());
        let (ra, rb) = tokio::join!(a, b);
        let accepted = [ra.unwrap(), rb.unwrap()]
            .into_iter()
            .filter(|x| *x)
            .count();
        assert_eq!(accepted, 1);
    }
}
