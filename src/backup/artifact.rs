// mongodumper/src/backup/artifact.rs
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use std::path::{Path, PathBuf};

/// Second-resolution UTC stamp used in every backup name.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";
const TIMESTAMP_LEN: usize = "2006-01-02T15-04-05Z".len();
const DATE_FORMAT: &str = "%Y-%m-%d";
const ARCHIVE_EXTENSION: &str = "zip";

/// Local and remote names for one run, derived once when the run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub base_name: String,
    pub dump_dir: PathBuf,
    pub archive_path: PathBuf,
    pub remote_key: String,
    pub created_at: DateTime<Utc>,
}

/// The three inputs a remote key was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKeyParts {
    pub environment: String,
    pub database: String,
    pub created_at: DateTime<Utc>,
}

impl BackupArtifact {
    pub fn generate(temp_dir: &Path, environment: &str, database: &str, now: DateTime<Utc>) -> Self {
        // Nanoseconds are dropped so created_at matches what the key encodes.
        let created_at = now.with_nanosecond(0).unwrap_or(now);
        let timestamp = created_at.format(TIMESTAMP_FORMAT).to_string();
        let date = created_at.format(DATE_FORMAT).to_string();

        let base_name = format!("{}-{}-{}", database, environment, timestamp);
        let dump_dir = temp_dir.join(&base_name);
        let archive_path = temp_dir.join(format!("{}.{}", base_name, ARCHIVE_EXTENSION));
        let remote_key = format!("{}/{}/{}.{}", environment, date, base_name, ARCHIVE_EXTENSION);

        Self {
            base_name,
            dump_dir,
            archive_path,
            remote_key,
            created_at,
        }
    }

    /// Splits `{env}/{date}/{db}-{env}-{timestamp}.zip` back into its inputs.
    ///
    /// The environment comes from the first path segment and the timestamp has a
    /// fixed width, so database names containing `-` still parse correctly.
    pub fn parse_remote_key(key: &str) -> Option<RemoteKeyParts> {
        let mut segments = key.splitn(3, '/');
        let environment = segments.next().filter(|s| !s.is_empty())?;
        let date = segments.next()?;
        let file_name = segments.next()?;
        if file_name.contains('/') {
            return None;
        }

        let stem = file_name.strip_suffix(&format!(".{}", ARCHIVE_EXTENSION))?;
        if stem.len() < TIMESTAMP_LEN || !stem.is_char_boundary(stem.len() - TIMESTAMP_LEN) {
            return None;
        }
        let (prefix, timestamp) = stem.split_at(stem.len() - TIMESTAMP_LEN);
        let database = prefix.strip_suffix(&format!("-{}-", environment))?;
        if database.is_empty() {
            return None;
        }

        let created_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();
        if created_at.format(DATE_FORMAT).to_string() != date {
            return None;
        }

        Some(RemoteKeyParts {
            environment: environment.to_string(),
            database: database.to_string(),
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn april_15() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_remote_key_format() {
        let artifact = BackupArtifact::generate(Path::new("/tmp/mongodb-dumps"), "staging", "orders", april_15());

        assert_eq!(artifact.base_name, "orders-staging-2023-04-15T12-00-00Z");
        assert_eq!(
            artifact.remote_key,
            "staging/2023-04-15/orders-staging-2023-04-15T12-00-00Z.zip"
        );
        assert_eq!(
            artifact.dump_dir,
            PathBuf::from("/tmp/mongodb-dumps/orders-staging-2023-04-15T12-00-00Z")
        );
        assert_eq!(
            artifact.archive_path,
            PathBuf::from("/tmp/mongodb-dumps/orders-staging-2023-04-15T12-00-00Z.zip")
        );
    }

    #[test]
    fn test_generation_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 59).unwrap()
            + chrono::Duration::milliseconds(750);
        let a = BackupArtifact::generate(Path::new("/tmp"), "production", "all-databases", at);
        let b = BackupArtifact::generate(Path::new("/tmp"), "production", "all-databases", at);
        assert_eq!(a, b);
        assert_eq!(a.created_at, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 59).unwrap());
    }

    #[test]
    fn test_remote_key_parses_back() {
        let artifact = BackupArtifact::generate(Path::new("/tmp"), "staging", "orders", april_15());
        let parts = BackupArtifact::parse_remote_key(&artifact.remote_key).unwrap();

        assert_eq!(parts.environment, "staging");
        assert_eq!(parts.database, "orders");
        assert_eq!(parts.created_at, april_15());
    }

    #[test]
    fn test_hyphenated_names_parse_back() {
        let at = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 58).unwrap();
        let artifact = BackupArtifact::generate(Path::new("/tmp"), "eu-prod", "all-databases", at);
        let parts = BackupArtifact::parse_remote_key(&artifact.remote_key).unwrap();

        assert_eq!(parts.environment, "eu-prod");
        assert_eq!(parts.database, "all-databases");
        assert_eq!(parts.created_at, at);
    }

    #[test]
    fn test_malformed_keys_are_rejected() {
        for key in [
            "",
            "staging",
            "staging/2023-04-15",
            "staging/2023-04-15/orders-staging-2023-04-15T12-00-00Z.tar.gz",
            "staging/2023-04-16/orders-staging-2023-04-15T12-00-00Z.zip",
            "staging/2023-04-15/orders-production-2023-04-15T12-00-00Z.zip",
            "staging/2023-04-15/nested/orders-staging-2023-04-15T12-00-00Z.zip",
            "staging/2023-04-15/-staging-2023-04-15T12-00-00Z.zip",
        ] {
            assert!(BackupArtifact::parse_remote_key(key).is_none(), "accepted {key:?}");
        }
    }
}
