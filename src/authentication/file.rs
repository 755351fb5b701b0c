//! File-backed user provider with argon2 password hashes.

use anyhow::{Context, anyhow};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::{AuthenticationError, UserDetails, UserProvider, hash_password};

#[derive(Clone, Debug, Deserialize, Serialize)]
struct FileUserRecord {
    /// PHC-formatted argon2 hash, never the clear-text password.
    password: String,
    #[serde(default)]
    displayname: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct FileUserDatabase {
    users: BTreeMap<String, FileUserRecord>,
}

/// User provider reading a JSON user database from disk. Password updates
/// rewrite the file.
pub struct FileUserProvider {
    path: PathBuf,
    users: RwLock<BTreeMap<String, FileUserRecord>>,
}

impl FileUserProvider {
    /// Load the user database.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or when any
    /// stored hash is not a valid PHC string.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read user database {}", path.display()))?;
        let database: FileUserDatabase = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse user database {}", path.display()))?;

        for (username, record) in &database.users {
            PasswordHash::new(&record.password)
                .map_err(|err| anyhow!("user {username}: invalid password hash: {err}"))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            users: RwLock::new(database.users),
        })
    }

    #[cfg(test)]
    fn from_users(users: BTreeMap<String, FileUserRecord>) -> Self {
        Self {
            path: PathBuf::from("/dev/null"),
            users: RwLock::new(users),
        }
    }

    async fn persist(&self) -> Result<(), AuthenticationError> {
        if self.path == Path::new("/dev/null") {
            return Ok(());
        }

        let database = FileUserDatabase {
            users: self.users.read().await.clone(),
        };
        let raw = serde_json::to_string_pretty(&database)
            .map_err(|err| AuthenticationError::Provider(err.into()))?;
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|err| AuthenticationError::Provider(err.into()))
    }
}

#[async_trait]
impl UserProvider for FileUserProvider {
    async fn check_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool, AuthenticationError> {
        let stored = {
            let users = self.users.read().await;
            users
                .get(username)
                .map(|record| record.password.clone())
                .ok_or(AuthenticationError::UserNotFound)?
        };

        let parsed = PasswordHash::new(&stored)
            .map_err(|err| AuthenticationError::Provider(anyhow!("corrupt hash: {err}")))?;

        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    async fn get_details(&self, username: &str) -> Result<UserDetails, AuthenticationError> {
        let users = self.users.read().await;
        let record = users.get(username).ok_or(AuthenticationError::UserNotFound)?;

        Ok(UserDetails {
            username: username.to_string(),
            display_name: if record.displayname.is_empty() {
                username.to_string()
            } else {
                record.displayname.clone()
            },
            groups: record.groups.clone(),
            emails: record.email.iter().cloned().collect(),
        })
    }

    async fn update_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), AuthenticationError> {
        let hash = hash_password(password)?;

        {
            let mut users = self.users.write().await;
            let record = users
                .get_mut(username)
                .ok_or(AuthenticationError::UserNotFound)?;
            record.password = hash;
        }

        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_with(username: &str, password: &str) -> FileUserProvider {
        let mut users = BTreeMap::new();
        users.insert(
            username.to_string(),
            FileUserRecord {
                password: hash_password(password).expect("hash"),
                displayname: "John Doe".to_string(),
                email: Some("john@example.com".to_string()),
                groups: vec!["dev".to_string()],
            },
        );
        FileUserProvider::from_users(users)
    }

    #[tokio::test]
    async fn correct_password_verifies() {
        let provider = provider_with("john", "hunter2");
        assert!(provider.check_password("john", "hunter2").await.expect("check"));
        assert!(!provider.check_password("john", "wrong").await.expect("check"));
    }

    #[tokio::test]
    async fn unknown_user_is_distinct_internally() {
        let provider = provider_with("john", "hunter2");
        assert!(matches!(
            provider.check_password("ghost", "hunter2").await,
            Err(AuthenticationError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn details_carry_profile_fields() {
        let provider = provider_with("john", "hunter2");
        let details = provider.get_details("john").await.expect("details");
        assert_eq!(details.username, "john");
        assert_eq!(details.display_name, "John Doe");
        assert_eq!(details.groups, vec!["dev".to_string()]);
        assert_eq!(details.emails, vec!["john@example.com".to_string()]);
    }

    #[tokio::test]
    async fn password_update_replaces_the_hash() {
        let provider = provider_with("john", "hunter2");
        provider
            .update_password("john", "correct horse battery staple")
            .await
            .expect("update");
        assert!(!provider.check_password("john", "hunter2").await.expect("check"));
        assert!(
            provider
                .check_password("john", "correct horse battery staple")
                .await
                .expect("check")
        );
    }
}
