//! Default account creation, for fresh installs.

use crate::config::Configuration;
use crate::crypto::PasswordManager;
use crate::database::Database;
use crate::error::Result;
use crate::user::{PgUserRepository, User, UserRepository};

const DEFAULT_EMAIL: &str = "admin@example.com";
const DEFAULT_PASSWORD: &str = "password123";
const DEFAULT_NAME: &str = "Admin User";

/// Account created by [`seed`].
#[derive(Debug, Clone, PartialEq)]
pub struct SeedAccount {
    pub email: String,
    pub password: String,
    pub name: String,
}

impl SeedAccount {
    /// Read `SEED_EMAIL`, `SEED_PASSWORD` and `SEED_NAME`, with defaults.
    pub fn from_env() -> Self {
        let var = |key: &str, default: &str| {
            std::env::var(key)
                .ok()
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_owned())
        };

        Self {
            email: var("SEED_EMAIL", DEFAULT_EMAIL),
            password: var("SEED_PASSWORD", DEFAULT_PASSWORD),
            name: var("SEED_NAME", DEFAULT_NAME),
        }
    }
}

/// Create `account` unless its email is already registered.
///
/// Returns the created user, or `None` if it existed.
pub async fn seed(
    users: &dyn UserRepository,
    pwd: &PasswordManager,
    account: &SeedAccount,
) -> Result<Option<User>> {
    if users.find_by_email(&account.email).await?.is_some() {
        tracing::info!(email = %account.email, "user already exists, skipping seed");
        return Ok(None);
    }

    let hash = pwd.hash_password(&account.password)?;
    let user = users.insert(&account.email, &hash, &account.name).await?;
    tracing::info!(user_id = %user.id, email = %user.email, "default user created");

    Ok(Some(user))
}

/// `lastseen seed`: create `account` in the configured database.
///
/// Only needs the `postgres` and `argon2` sections. Without a database there
/// is nothing to persist into, so it warns and does nothing.
pub async fn run(
    config: &Configuration,
    account: &SeedAccount,
) -> std::result::Result<Option<User>, Box<dyn std::error::Error + Send + Sync>> {
    let Some(postgres) = &config.postgres else {
        tracing::warn!(
            "missing `postgres` entry on `config.yaml` file, nothing to seed"
        );
        return Ok(None);
    };

    let db = Database::from_config(postgres).await?;
    db.migrate().await?;

    let pwd = PasswordManager::new(config.argon2.clone())?;
    let users = PgUserRepository::new(db.postgres.clone());
    let result = seed(&users, &pwd, account).await;
    db.close().await;

    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Argon2;
    use crate::database::MemoryStore;

    #[tokio::test]
    async fn test_seed_once() {
        let store = MemoryStore::new();
        let pwd = PasswordManager::new(Some(Argon2 {
            memory_cost: 1024,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        }))
        .unwrap();
        let account = SeedAccount {
            email: "seed@example.com".into(),
            password: "password123".into(),
            name: "Seed".into(),
        };

        let user = seed(&store, &pwd, &account).await.unwrap().unwrap();
        assert_eq!(user.name, "Seed");
        assert!(pwd.verify_password("password123", &user.password).is_ok());

        assert!(seed(&store, &pwd, &account).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_without_database() {
        // No token secret nor database configured.
        let config = Configuration::default();
        let account = SeedAccount {
            email: "seed@example.com".into(),
            password: "password123".into(),
            name: "Seed".into(),
        };

        assert!(run(&config, &account).await.unwrap().is_none());
    }
}
