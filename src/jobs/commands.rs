//! Technology-specific scripts run inside execution units
//!
//! Scripts read connection details from `DB_HOST`, `DB_PORT`, `DB_USER` and
//! `DB_PASSWORD` (see [`super::connection_env`]) and write under
//! [`super::BACKUP_MOUNT_PATH`]. When `S3_BUCKET` is set the backup directory
//! is synced with the bucket using the AWS CLI.

use crate::crd::{BackupMethod, Technology};
use crate::error::{Error, Result};

/// Client image for a technology at a version
pub fn client_image(technology: Technology, version: &str) -> Result<String> {
    let repository = match technology {
        Technology::PostgreSQL => "postgres",
        Technology::MongoDB => "mongo",
        Technology::Redis => "redis",
        Technology::Elasticsearch => "elasticsearch",
        Technology::SQLite => return Err(Error::not_implemented(technology, "backup")),
    };
    Ok(format!("{}:{}", repository, version))
}

const BACKUP_NAME: &str = r#"BACKUP_NAME="${DB_NAME}-$(date +%Y%m%d-%H%M%S)""#;

const S3_UPLOAD: &str = r#"if [ -n "$S3_BUCKET" ]; then
  command -v aws >/dev/null || { echo "aws cli not available for S3 upload" >&2; exit 1; }
  aws ${S3_ENDPOINT:+--endpoint-url "$S3_ENDPOINT"} s3 sync /backup "s3://${S3_BUCKET}/${DB_NAME}/"
fi"#;

const S3_DOWNLOAD: &str = r#"if [ -n "$S3_BUCKET" ]; then
  command -v aws >/dev/null || { echo "aws cli not available for S3 download" >&2; exit 1; }
  aws ${S3_ENDPOINT:+--endpoint-url "$S3_ENDPOINT"} s3 sync "s3://${S3_BUCKET}/${DB_NAME}/${BACKUP_NAME}" "/backup/${BACKUP_NAME}"
fi"#;

fn wrap(body: &str, trailer: &str) -> String {
    format!("set -e\n{}\n{}\n{}\n", BACKUP_NAME, body, trailer)
}

/// Backup script for a technology and method
pub fn backup_script(technology: Technology, method: BackupMethod) -> Result<String> {
    let body = match (technology, method) {
        (Technology::PostgreSQL, BackupMethod::Dump) => {
            r#"export PGPASSWORD="$DB_PASSWORD"
pg_dump -h "$DB_HOST" -p "$DB_PORT" -U "$DB_USER" -Fc -f "/backup/${BACKUP_NAME}.backup" postgres"#
        }
        (Technology::PostgreSQL, BackupMethod::Snapshot) => {
            r#"export PGPASSWORD="$DB_PASSWORD"
pg_basebackup -h "$DB_HOST" -p "$DB_PORT" -U "$DB_USER" -D "/backup/${BACKUP_NAME}" -Ft -z -X fetch"#
        }
        (Technology::PostgreSQL, BackupMethod::WAL) => {
            r#"export PGPASSWORD="$DB_PASSWORD"
pg_basebackup -h "$DB_HOST" -p "$DB_PORT" -U "$DB_USER" -D "/backup/${BACKUP_NAME}" -Ft -z -X stream"#
        }
        (Technology::MongoDB, BackupMethod::Dump | BackupMethod::Snapshot) => {
            r#"mongodump --host="$DB_HOST" --port="$DB_PORT" --username="$DB_USER" --password="$DB_PASSWORD" --gzip --archive="/backup/${BACKUP_NAME}.archive""#
        }
        (Technology::Redis, BackupMethod::Dump | BackupMethod::Snapshot) => {
            r#"REDISCLI_AUTH="$DB_PASSWORD" redis-cli -h "$DB_HOST" -p "$DB_PORT" --user "$DB_USER" --rdb "/backup/${BACKUP_NAME}.rdb""#
        }
        _ => return Err(Error::not_implemented(technology, backup_operation(method))),
    };
    Ok(wrap(body, S3_UPLOAD))
}

fn backup_operation(method: BackupMethod) -> &'static str {
    match method {
        BackupMethod::Snapshot => "snapshot backup",
        BackupMethod::Dump => "dump backup",
        BackupMethod::WAL => "WAL backup",
        BackupMethod::Incremental => "incremental backup",
    }
}

/// Restore script for a technology
///
/// Replays a physical base backup (`base.tar.gz`, optional `pg_wal.tar.gz`)
/// into an empty data directory before the workload starts. Expects
/// `BACKUP_NAME`, `PGDATA` and optionally `RECOVERY_TARGET_TIME`.
pub fn restore_script(technology: Technology) -> Result<String> {
    let body = match technology {
        Technology::PostgreSQL => {
            r#"if [ -n "$(ls -A "$PGDATA" 2>/dev/null)" ]; then
  echo "data directory $PGDATA is not empty, refusing to restore over it" >&2
  exit 1
fi
test -f "/backup/${BACKUP_NAME}/base.tar.gz" || { echo "backup ${BACKUP_NAME} not found" >&2; exit 1; }
mkdir -p "$PGDATA"
tar -xzf "/backup/${BACKUP_NAME}/base.tar.gz" -C "$PGDATA"
if [ -f "/backup/${BACKUP_NAME}/pg_wal.tar.gz" ]; then
  mkdir -p "$PGDATA/pg_wal"
  tar -xzf "/backup/${BACKUP_NAME}/pg_wal.tar.gz" -C "$PGDATA/pg_wal"
fi
if [ -n "$RECOVERY_TARGET_TIME" ]; then
  touch "$PGDATA/recovery.signal"
  echo "recovery_target_time = '${RECOVERY_TARGET_TIME}'" >> "$PGDATA/postgresql.auto.conf"
fi
chown -R 999:999 "$PGDATA"
chmod 700 "$PGDATA""#
        }
        _ => return Err(Error::not_implemented(technology, "restore")),
    };
    Ok(format!("set -e\n{}\n{}\n", S3_DOWNLOAD, body))
}

/// Script granting the new credential on the managed service
///
/// Connects with the current credentials (`DB_*`) and creates or updates
/// the role named by `NEW_USERNAME` with `NEW_PASSWORD`. Safe to re-run.
pub fn grant_script(technology: Technology) -> Result<String> {
    match technology {
        Technology::PostgreSQL => Ok(r#"set -e
export PGPASSWORD="$DB_PASSWORD"
psql -v ON_ERROR_STOP=1 -h "$DB_HOST" -p "$DB_PORT" -U "$DB_USER" -d postgres <<SQL
DO \$\$
BEGIN
  IF EXISTS (SELECT FROM pg_roles WHERE rolname = '${NEW_USERNAME}') THEN
    ALTER ROLE "${NEW_USERNAME}" WITH LOGIN SUPERUSER PASSWORD '${NEW_PASSWORD}';
  ELSE
    CREATE ROLE "${NEW_USERNAME}" WITH LOGIN SUPERUSER PASSWORD '${NEW_PASSWORD}';
  END IF;
END
\$\$;
SQL
"#
        .to_string()),
        _ => Err(Error::not_implemented(technology, "credential rotation")),
    }
}

/// Script revoking the previous credential
///
/// Connects with the current (already promoted) credentials and disables
/// `OLD_USERNAME`. The bootstrap role cannot be dropped, so login is revoked
/// first and the drop is best effort. Safe to re-run.
pub fn revoke_script(technology: Technology) -> Result<String> {
    match technology {
        Technology::PostgreSQL => Ok(r#"set -e
export PGPASSWORD="$DB_PASSWORD"
if [ "$OLD_USERNAME" = "$DB_USER" ]; then
  echo "old and current credentials share a role, nothing to revoke"
  exit 0
fi
psql -v ON_ERROR_STOP=1 -h "$DB_HOST" -p "$DB_PORT" -U "$DB_USER" -d postgres <<SQL
DO \$\$
BEGIN
  IF EXISTS (SELECT FROM pg_roles WHERE rolname = '${OLD_USERNAME}') THEN
    ALTER ROLE "${OLD_USERNAME}" WITH NOLOGIN PASSWORD NULL;
  END IF;
END
\$\$;
SQL
psql -h "$DB_HOST" -p "$DB_PORT" -U "$DB_USER" -d postgres -c "DROP ROLE IF EXISTS \"${OLD_USERNAME}\"" || true
"#
        .to_string()),
        _ => Err(Error::not_implemented(technology, "credential rotation")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_methods_map_to_tools() {
        let dump = backup_script(Technology::PostgreSQL, BackupMethod::Dump).unwrap();
        assert!(dump.contains("pg_dump"));
        assert!(dump.contains("-Fc"));

        let snapshot = backup_script(Technology::PostgreSQL, BackupMethod::Snapshot).unwrap();
        assert!(snapshot.contains("pg_basebackup"));
        assert!(snapshot.contains("-Ft -z"));

        let wal = backup_script(Technology::PostgreSQL, BackupMethod::WAL).unwrap();
        assert!(wal.contains("-X stream"));
    }

    #[test]
    fn test_other_technologies() {
        assert!(backup_script(Technology::MongoDB, BackupMethod::Dump)
            .unwrap()
            .contains("mongodump"));
        assert!(backup_script(Technology::Redis, BackupMethod::Snapshot)
            .unwrap()
            .contains("--rdb"));
    }

    #[test]
    fn test_unsupported_combinations_are_not_implemented() {
        let err = backup_script(Technology::PostgreSQL, BackupMethod::Incremental).unwrap_err();
        assert_eq!(err.reason(), "NotImplemented");
        assert!(err.to_string().contains("incremental backup"));

        let err = backup_script(Technology::Elasticsearch, BackupMethod::Snapshot).unwrap_err();
        assert_eq!(err.reason(), "NotImplemented");

        assert!(client_image(Technology::SQLite, "3").is_err());
        assert!(restore_script(Technology::MongoDB).is_err());
        assert!(grant_script(Technology::Redis).is_err());
    }

    #[test]
    fn test_scripts_never_inline_credentials() {
        let script = backup_script(Technology::PostgreSQL, BackupMethod::Snapshot).unwrap();
        assert!(script.contains("\"$DB_PASSWORD\""));
        assert!(script.starts_with("set -e\n"));
        assert!(script.contains("s3 sync /backup"));
    }

    #[test]
    fn test_restore_handles_point_in_time() {
        let script = restore_script(Technology::PostgreSQL).unwrap();
        assert!(script.contains("recovery.signal"));
        assert!(script.contains("recovery_target_time"));
        assert!(script.contains("base.tar.gz"));
    }

    #[test]
    fn test_rotation_scripts_are_rerunnable() {
        let grant = grant_script(Technology::PostgreSQL).unwrap();
        assert!(grant.contains("IF EXISTS"));
        assert!(grant.contains("ALTER ROLE"));
        let revoke = revoke_script(Technology::PostgreSQL).unwrap();
        assert!(revoke.contains("DROP ROLE IF EXISTS"));
    }

    #[test]
    fn test_client_images() {
        assert_eq!(client_image(Technology::PostgreSQL, "16").unwrap(), "postgres:16");
        assert_eq!(client_image(Technology::MongoDB, "7.0").unwrap(), "mongo:7.0");
    }
}
