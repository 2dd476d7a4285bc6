// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Addon provisioning.
//!
//! Addons are auxiliary capabilities attached to an app: OAuth client credentials, LDAP bind
//! credentials, a mailbox, a private redis, databases on the shared MySQL and PostgreSQL
//! servers. Credentials are persisted per app and reused when an addon is provisioned again,
//! so re-running a pipeline never rotates secrets. Teardown is idempotent.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::app::App;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::manifest::Addon;
use crate::provision::{ContainerRuntime, ContainerSpec};

/// Container running the shared MySQL server.
pub const MYSQL_CONTAINER: &str = "mysql";
/// Container running the shared PostgreSQL server.
pub const POSTGRESQL_CONTAINER: &str = "postgresql";
/// Host of the box mail relay.
pub const MAIL_SERVER: &str = "mail";
/// Address of the box LDAP server as seen from app containers.
pub const LDAP_SERVER: &str = "172.18.0.1";
/// Port of the box LDAP server.
pub const LDAP_PORT: u16 = 3002;

const MAILBOX_PATTERN: &str = r"^[a-z0-9][a-z0-9._-]{0,63}$";

/// Environment variables for an app container.
pub type Env = BTreeMap<String, String>;

/// An OAuth client registered for an app.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OAuthClient {
    /// Client id
    pub id: String,
    /// Owning app
    pub app_id: String,
    /// Client secret
    pub client_secret: String,
    /// Allowed redirect URI
    pub redirect_uri: String,
    /// Granted scope
    pub scope: String,
}

/// Provisions and tears down addons.
#[derive(Clone)]
pub struct AddonManager {
    pool: SqlitePool,
    config: Arc<Config>,
    runtime: Arc<dyn ContainerRuntime>,
}

fn secret() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Name of the redis sidecar of an app.
pub fn redis_container_name(app_id: &str) -> String {
    format!("redis-{}", app_id)
}

fn database_name(app_id: &str) -> String {
    format!(
        "db{}",
        app_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
    )
}

/// Default mailbox of an app at `location`.
pub fn default_mailbox(location: &str) -> String {
    if location.is_empty() {
        "app".to_string()
    } else {
        format!("{}.app", location)
    }
}

impl AddonManager {
    /// Create an addon manager.
    pub fn new(pool: SqlitePool, config: Arc<Config>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            pool,
            config,
            runtime,
        }
    }

    async fn load_config(&self, app_id: &str, addon: Addon) -> Result<Env> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT name, value FROM app_addon_configs WHERE app_id = ? AND addon = ?",
        )
        .bind(app_id)
        .bind(addon.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn save_config(&self, app_id: &str, addon: Addon, env: &Env) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM app_addon_configs WHERE app_id = ? AND addon = ?")
            .bind(app_id)
            .bind(addon.as_str())
            .execute(&mut *tx)
            .await?;
        for (name, value) in env {
            sqlx::query(
                "INSERT INTO app_addon_configs (app_id, addon, name, value) VALUES (?, ?, ?, ?)",
            )
            .bind(app_id)
            .bind(addon.as_str())
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_config(&self, app_id: &str, addon: Addon) -> Result<()> {
        sqlx::query("DELETE FROM app_addon_configs WHERE app_id = ? AND addon = ?")
            .bind(app_id)
            .bind(addon.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Provision every addon declared by the app's manifest.
    pub async fn setup(&self, app: &App) -> Result<()> {
        for addon in app.manifest.addon_list() {
            self.setup_addon(app, addon).await?;
        }
        Ok(())
    }

    /// Provision one addon.
    pub async fn setup_addon(&self, app: &App, addon: Addon) -> Result<()> {
        debug!(app_id = %app.id, addon = %addon, "Setting up addon");
        match addon {
            Addon::LocalStorage => Ok(()),
            Addon::Oauth => self.setup_oauth(app).await.map(|_| ()),
            Addon::Ldap => self.setup_ldap(app).await,
            Addon::Sendmail => self.setup_sendmail(app).await,
            Addon::Redis => self.setup_redis(app).await,
            Addon::Mysql => self.setup_database(app, Addon::Mysql).await,
            Addon::Postgresql => self.setup_database(app, Addon::Postgresql).await,
        }
    }

    /// Tear down every addon the app may hold, declared or not.
    pub async fn teardown(&self, app: &App) -> Result<()> {
        for addon in Addon::ALL {
            self.teardown_addon(&app.id, addon).await?;
        }
        Ok(())
    }

    /// Tear down addons the app holds but its manifest no longer declares.
    pub async fn teardown_unused(&self, app: &App) -> Result<()> {
        let declared = app.manifest.addon_list();
        for addon in Addon::ALL {
            if !declared.contains(&addon) {
                self.teardown_addon(&app.id, addon).await?;
            }
        }
        Ok(())
    }

    /// Tear down one addon. Succeeds when nothing was provisioned.
    pub async fn teardown_addon(&self, app_id: &str, addon: Addon) -> Result<()> {
        match addon {
            Addon::LocalStorage => {}
            Addon::Oauth => {
                sqlx::query("DELETE FROM oauth_clients WHERE app_id = ?")
                    .bind(app_id)
                    .execute(&self.pool)
                    .await?;
            }
            Addon::Ldap => self.delete_config(app_id, addon).await?,
            Addon::Sendmail => {
                sqlx::query("DELETE FROM mailboxes WHERE owner_id = ? AND owner_type = 'app'")
                    .bind(app_id)
                    .execute(&self.pool)
                    .await?;
                self.delete_config(app_id, addon).await?;
            }
            Addon::Redis => {
                self.runtime
                    .remove_container(&redis_container_name(app_id))
                    .await?;
                self.delete_config(app_id, addon).await?;
            }
            Addon::Mysql | Addon::Postgresql => {
                let config = self.load_config(app_id, addon).await?;
                if !config.is_empty() {
                    let container = database_container(addon);
                    let command = vec![
                        format!("/addons/{}/service.sh", addon),
                        "remove".to_string(),
                        database_name(app_id),
                    ];
                    self.runtime.exec(container, &command).await?;
                    self.delete_config(app_id, addon).await?;
                }
            }
        }
        Ok(())
    }

    /// Environment variables for the addons declared by the app's manifest.
    pub async fn environment(&self, app: &App) -> Result<Env> {
        let mut env = Env::new();
        for addon in app.manifest.addon_list() {
            match addon {
                Addon::LocalStorage => {}
                Addon::Oauth => {
                    if let Some(client) = self.oauth_client(&app.id).await? {
                        env.insert("OAUTH_CLIENT_ID".into(), client.id);
                        env.insert("OAUTH_CLIENT_SECRET".into(), client.client_secret);
                        env.insert("OAUTH_ORIGIN".into(), self.config.admin_origin());
                    }
                }
                Addon::Sendmail => {
                    let config = self.load_config(&app.id, addon).await?;
                    if let Some(mailbox) = self.mailbox(&app.id).await? {
                        env.insert("MAIL_SMTP_SERVER".into(), MAIL_SERVER.into());
                        env.insert("MAIL_SMTP_PORT".into(), "2525".into());
                        env.insert("MAIL_SMTP_USERNAME".into(), mailbox.clone());
                        env.insert(
                            "MAIL_FROM".into(),
                            format!("{}@{}", mailbox, self.config.fqdn),
                        );
                        env.insert("MAIL_DOMAIN".into(), self.config.fqdn.clone());
                        env.extend(config);
                    }
                }
                _ => env.extend(self.load_config(&app.id, addon).await?),
            }
        }
        Ok(env)
    }

    /// OAuth client of an app.
    pub async fn oauth_client(&self, app_id: &str) -> Result<Option<OAuthClient>> {
        Ok(
            sqlx::query_as::<_, OAuthClient>("SELECT * FROM oauth_clients WHERE app_id = ?")
                .bind(app_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn setup_oauth(&self, app: &App) -> Result<OAuthClient> {
        let redirect_uri = format!("https://{}", self.config.app_fqdn(&app.location));

        // the secret survives re-provisioning; the redirect follows location changes
        sqlx::query(
            r#"
            INSERT INTO oauth_clients (id, app_id, client_secret, redirect_uri, scope)
            VALUES (?, ?, ?, ?, 'profile')
            ON CONFLICT (app_id) DO UPDATE SET redirect_uri = excluded.redirect_uri
            "#,
        )
        .bind(format!("cid-{}", app.id))
        .bind(&app.id)
        .bind(secret())
        .bind(&redirect_uri)
        .execute(&self.pool)
        .await?;

        self.oauth_client(&app.id)
            .await?
            .ok_or_else(|| Error::Other(format!("OAuth client of {} vanished", app.id)))
    }

    async fn setup_ldap(&self, app: &App) -> Result<()> {
        if !self.load_config(&app.id, Addon::Ldap).await?.is_empty() {
            return Ok(());
        }

        let env = Env::from([
            ("LDAP_SERVER".into(), LDAP_SERVER.into()),
            ("LDAP_PORT".into(), LDAP_PORT.to_string()),
            (
                "LDAP_URL".into(),
                format!("ldap://{}:{}", LDAP_SERVER, LDAP_PORT),
            ),
            ("LDAP_USERS_BASE_DN".into(), "ou=users,dc=cloudron".into()),
            ("LDAP_GROUPS_BASE_DN".into(), "ou=groups,dc=cloudron".into()),
            (
                "LDAP_BIND_DN".into(),
                format!("cn={},ou=apps,dc=cloudron", app.id),
            ),
            ("LDAP_BIND_PASSWORD".into(), secret()),
        ]);
        self.save_config(&app.id, Addon::Ldap, &env).await
    }

    async fn setup_sendmail(&self, app: &App) -> Result<()> {
        if self.mailbox(&app.id).await?.is_none() {
            let name = default_mailbox(&app.location);
            self.insert_mailbox(&name, &app.id).await?;
            info!(app_id = %app.id, mailbox = %name, "Created mailbox");
        }

        if self.load_config(&app.id, Addon::Sendmail).await?.is_empty() {
            let env = Env::from([("MAIL_SMTP_PASSWORD".into(), secret())]);
            self.save_config(&app.id, Addon::Sendmail, &env).await?;
        }
        Ok(())
    }

    async fn setup_redis(&self, app: &App) -> Result<()> {
        let name = redis_container_name(&app.id);
        let mut config = self.load_config(&app.id, Addon::Redis).await?;
        if config.is_empty() {
            config = Env::from([
                ("REDIS_HOST".into(), name.clone()),
                ("REDIS_PORT".into(), "6379".into()),
                ("REDIS_PASSWORD".into(), secret()),
            ]);
            config.insert(
                "REDIS_URL".into(),
                format!("redis://redis:{}@{}:6379", config["REDIS_PASSWORD"], name),
            );
            self.save_config(&app.id, Addon::Redis, &config).await?;
        }

        let existing = self.runtime.inspect_container(&name).await?;
        let id = match existing {
            Some(info) if info.running => return Ok(()),
            Some(info) => info.id,
            None => {
                self.runtime.pull_image(&self.config.redis_image).await?;
                let spec = ContainerSpec {
                    name: name.clone(),
                    image: self.config.redis_image.clone(),
                    hostname: name.clone(),
                    env: Env::from([(
                        "REDIS_PASSWORD".into(),
                        config.get("REDIS_PASSWORD").cloned().unwrap_or_default(),
                    )]),
                    labels: BTreeMap::from([
                        ("addon".into(), "redis".into()),
                        ("addonOf".into(), app.id.clone()),
                    ]),
                    ..Default::default()
                };
                self.runtime.create_container(&spec).await?
            }
        };

        self.runtime.start_container(&id).await?;
        info!(app_id = %app.id, container = %name, "Started redis addon");
        Ok(())
    }

    async fn setup_database(&self, app: &App, addon: Addon) -> Result<()> {
        if !self.load_config(&app.id, addon).await?.is_empty() {
            return Ok(());
        }

        let database = database_name(&app.id);
        let password = secret();
        let container = database_container(addon);
        let command = vec![
            format!("/addons/{}/service.sh", addon),
            "add".to_string(),
            database.clone(),
            password.clone(),
        ];
        self.runtime.exec(container, &command).await?;

        let (prefix, port, scheme) = match addon {
            Addon::Mysql => ("MYSQL", 3306, "mysql"),
            _ => ("POSTGRESQL", 5432, "postgres"),
        };
        let env = Env::from([
            (format!("{}_HOST", prefix), container.to_string()),
            (format!("{}_PORT", prefix), port.to_string()),
            (format!("{}_USERNAME", prefix), database.clone()),
            (format!("{}_PASSWORD", prefix), password.clone()),
            (format!("{}_DATABASE", prefix), database.clone()),
            (
                format!("{}_URL", prefix),
                format!(
                    "{}://{}:{}@{}:{}/{}",
                    scheme, database, password, container, port, database
                ),
            ),
        ]);
        self.save_config(&app.id, addon, &env).await?;
        info!(app_id = %app.id, addon = %addon, database = %database, "Created database");
        Ok(())
    }

    /// Mailbox owned by an app.
    pub async fn mailbox(&self, app_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM mailboxes WHERE owner_id = ? AND owner_type = 'app' ORDER BY created_at LIMIT 1",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(name,)| name))
    }

    async fn insert_mailbox(&self, name: &str, app_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO mailboxes (name, owner_id, owner_type, created_at) VALUES (?, ?, 'app', ?)",
        )
        .bind(name)
        .bind(app_id)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| mailbox_error(e, name))?;
        Ok(())
    }

    /// Rename (or create) the mailbox of an app. Takes effect in the container on the next
    /// configure.
    pub async fn set_mailbox(&self, app_id: &str, name: &str) -> Result<()> {
        let pattern = Regex::new(MAILBOX_PATTERN).map_err(|e| Error::Other(e.to_string()))?;
        if !pattern.is_match(name) {
            return Err(Error::InvalidRequest(
                "Mailbox name can only contain lowercase alphanumerics, dot, hyphen and underscore"
                    .to_string(),
            ));
        }

        if self.mailbox(app_id).await?.as_deref() == Some(name) {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mailboxes WHERE owner_id = ? AND owner_type = 'app'")
            .bind(app_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO mailboxes (name, owner_id, owner_type, created_at) VALUES (?, ?, 'app', ?)",
        )
        .bind(name)
        .bind(app_id)
        .bind(chrono::Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| mailbox_error(e, name))?;
        tx.commit().await?;

        info!(app_id = %app_id, mailbox = %name, "Set mailbox");
        Ok(())
    }
}

fn mailbox_error(err: sqlx::Error, name: &str) -> Error {
    if let sqlx::Error::Database(db) = &err
        && db.is_unique_violation()
    {
        return Error::Conflict(format!("Mailbox {} is already taken", name));
    }
    Error::Database(err)
}

fn database_container(addon: Addon) -> &'static str {
    match addon {
        Addon::Mysql => MYSQL_CONTAINER,
        _ => POSTGRESQL_CONTAINER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{InstallationState, PortBindings};
    use crate::app_registry::{AppRegistry, NewAppFields};
    use crate::manifest::Manifest;
    use crate::provision::mock::MockContainerRuntime;
    use serde_json::json;

    struct Ctx {
        _dir: tempfile::TempDir,
        registry: AppRegistry,
        runtime: Arc<MockContainerRuntime>,
        addons: AddonManager,
    }

    async fn ctx() -> Ctx {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(dir.path().join("box.db")).await.unwrap();
        let mut config = Config::new(dir.path());
        config.fqdn = "example.com".to_string();
        let runtime = Arc::new(MockContainerRuntime::new());
        let addons = AddonManager::new(pool.clone(), Arc::new(config), runtime.clone());
        Ctx {
            _dir: dir,
            registry: AppRegistry::new(pool),
            runtime,
            addons,
        }
    }

    async fn app(ctx: &Ctx, id: &str, location: &str, addons: &[&str]) -> App {
        let manifest = Manifest {
            id: "io.cloudron.test".into(),
            addons: addons.iter().map(|a| (a.to_string(), json!({}))).collect(),
            ..Default::default()
        };
        ctx.registry
            .add(
                id,
                None,
                &manifest,
                location,
                &PortBindings::new(),
                NewAppFields {
                    installation_state: InstallationState::Installing,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_oauth_secret_is_reused() {
        let ctx = ctx().await;
        let app = app(&ctx, "a1", "blog", &["oauth"]).await;

        ctx.addons.setup(&app).await.unwrap();
        let first = ctx.addons.oauth_client("a1").await.unwrap().unwrap();
        assert_eq!(first.redirect_uri, "https://blog.example.com");

        let mut moved = app.clone();
        moved.location = "news".into();
        ctx.addons.setup(&moved).await.unwrap();
        let second = ctx.addons.oauth_client("a1").await.unwrap().unwrap();
        assert_eq!(second.client_secret, first.client_secret);
        assert_eq!(second.redirect_uri, "https://news.example.com");

        let env = ctx.addons.environment(&moved).await.unwrap();
        assert_eq!(env["OAUTH_CLIENT_ID"], "cid-a1");
        assert_eq!(env["OAUTH_ORIGIN"], "https://my.example.com");

        ctx.addons.teardown(&moved).await.unwrap();
        assert!(ctx.addons.oauth_client("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mailbox() {
        let ctx = ctx().await;
        let app = app(&ctx, "a1", "blog", &["sendmail"]).await;

        ctx.addons.setup(&app).await.unwrap();
        assert_eq!(
            ctx.addons.mailbox("a1").await.unwrap().as_deref(),
            Some("blog.app")
        );

        ctx.addons.set_mailbox("a1", "news.app").await.unwrap();
        // re-provisioning keeps the renamed mailbox
        ctx.addons.setup(&app).await.unwrap();
        let env = ctx.addons.environment(&app).await.unwrap();
        assert_eq!(env["MAIL_SMTP_USERNAME"], "news.app");
        assert_eq!(env["MAIL_FROM"], "news.app@example.com");
        assert!(env.contains_key("MAIL_SMTP_PASSWORD"));

        assert!(ctx.addons.set_mailbox("a1", "Bad Name").await.is_err());

        let other = self::app(&ctx, "a2", "wiki", &["sendmail"]).await;
        ctx.addons.setup(&other).await.unwrap();
        let err = ctx.addons.set_mailbox("a2", "news.app").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        ctx.addons.teardown(&app).await.unwrap();
        assert!(ctx.addons.mailbox("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_redis_sidecar() {
        let ctx = ctx().await;
        let app = app(&ctx, "a1", "blog", &["redis"]).await;

        ctx.addons.setup(&app).await.unwrap();
        ctx.addons.setup(&app).await.unwrap();
        let sidecar = ctx
            .runtime
            .inspect_container("redis-a1")
            .await
            .unwrap()
            .unwrap();
        assert!(sidecar.running);
        assert_eq!(ctx.runtime.containers().await.len(), 1);

        let env = ctx.addons.environment(&app).await.unwrap();
        assert_eq!(env["REDIS_HOST"], "redis-a1");

        ctx.addons.teardown(&app).await.unwrap();
        assert!(ctx.runtime.containers().await.is_empty());
        // idempotent
        ctx.addons.teardown(&app).await.unwrap();
    }

    #[tokio::test]
    async fn test_mysql_database() {
        let ctx = ctx().await;
        ctx.runtime.pull_image("mysql:8").await.unwrap();
        ctx.runtime
            .create_container(&ContainerSpec {
                name: MYSQL_CONTAINER.into(),
                image: "mysql:8".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let app = app(&ctx, "a-1", "blog", &["mysql"]).await;
        ctx.addons.setup(&app).await.unwrap();
        ctx.addons.setup(&app).await.unwrap();

        let log = ctx.runtime.exec_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1[1], "add");
        assert_eq!(log[0].1[2], "dba1");

        let env = ctx.addons.environment(&app).await.unwrap();
        assert_eq!(env["MYSQL_DATABASE"], "dba1");
        assert_eq!(env["MYSQL_HOST"], "mysql");

        ctx.addons.teardown(&app).await.unwrap();
        assert_eq!(ctx.runtime.exec_log().await.len(), 2);
        ctx.addons.teardown(&app).await.unwrap();
        assert_eq!(ctx.runtime.exec_log().await.len(), 2);
    }
}
