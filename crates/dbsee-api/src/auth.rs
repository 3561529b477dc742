use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use colored::Colorize;
use inquire::{Password, Text};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::client::ApiClient;
use crate::config::ApiConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub username: Option<String>,
    pub saved_at: i64,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl AuthTokens {
    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.saved_at, 0)
    }
}

/// What changed in the stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChange {
    LoggedIn,
    LoggedOut,
}

type Listener = Arc<dyn Fn(AuthChange) + Send + Sync>;

/// Publishes credential changes to subscribers. Each store owns its own
/// emitter, so independent stores (and tests) never see each other's events.
#[derive(Clone, Default)]
pub struct AuthEvents {
    listeners: Arc<Mutex<Vec<(u64, Listener)>>>,
    next_id: Arc<AtomicU64>,
}

impl AuthEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` until the returned guard is dropped.
    pub fn subscribe(&self, listener: impl Fn(AuthChange) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            events: self.clone(),
        }
    }

    pub fn emit(&self, change: AuthChange) {
        // Snapshot first so listeners may subscribe or unsubscribe while notified.
        let listeners: Vec<Listener> = self.lock().iter().map(|(_, l)| l.clone()).collect();
        log::debug!("Auth change {:?}, notifying {} listeners", change, listeners.len());
        for listener in listeners {
            listener(change);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    events: AuthEvents,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.events.lock().retain(|(id, _)| *id != self.id);
    }
}

/// Token persistence in `~/.dbsee/auth.toml`.
#[derive(Clone)]
pub struct TokenStore {
    path: PathBuf,
    override_token: Option<String>,
    events: AuthEvents,
}

impl TokenStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            override_token: None,
            events: AuthEvents::new(),
        }
    }

    /// Default location; `DBSEE_TOKEN` takes precedence over the file when set.
    pub fn from_env() -> Result<Self> {
        let mut store = Self::at(default_auth_file_path()?);
        store.override_token = std::env::var("DBSEE_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());
        Ok(store)
    }

    pub fn with_override(mut self, token: Option<String>) -> Self {
        self.override_token = token;
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn events(&self) -> &AuthEvents {
        &self.events
    }

    pub fn load(&self) -> Result<Option<AuthTokens>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let tokens = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(Some(tokens))
    }

    /// The credential to present: the override, else the stored token.
    pub fn token(&self) -> Result<Option<String>> {
        if let Some(token) = &self.override_token {
            return Ok(Some(token.clone()));
        }
        Ok(self.load()?.map(|tokens| tokens.access_token))
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.token(), Ok(Some(_)))
    }

    pub fn save(&self, tokens: &AuthTokens) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = toml::to_string(tokens)?;
        fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        self.events.emit(AuthChange::LoggedIn);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }
        self.events.emit(AuthChange::LoggedOut);
        Ok(())
    }
}

fn default_auth_file_path() -> Result<PathBuf> {
    let home_dir = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home_dir.join(".dbsee").join("auth.toml"))
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: String,
}

pub fn login(client: &ApiClient, username: &str, password: &str) -> Result<AuthTokens> {
    let response: TokenResponse = client
        .post("auth/login", &LoginRequest { username, password }, "login")
        .context("Login failed")?;

    let tokens = AuthTokens {
        access_token: response.access_token,
        token_type: response.token_type,
        username: Some(username.to_string()),
        saved_at: Utc::now().timestamp(),
    };
    client.store().save(&tokens)?;
    log::info!("Logged in as {}", username);
    Ok(tokens)
}

/// Tells the server, then forgets the token whatever the server said.
pub fn logout(client: &ApiClient) -> Result<()> {
    let result = client.post_empty("auth/logout", "logout");
    client.store().clear()?;
    if let Err(e) = result {
        log::warn!("Server-side logout failed: {:#}", e);
    }
    Ok(())
}

pub fn current_user(client: &ApiClient) -> Result<User> {
    client.get("auth/me", "current user")
}

#[derive(Args, Debug)]
#[command(about = "Manage authentication")]
pub struct AuthArgs {
    #[command(subcommand)]
    command: Option<AuthCommand>,
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Log in with username and password
    Login {
        /// Username (prompted when omitted)
        #[arg(short, long)]
        username: Option<String>,

        /// Password (read from DBSEE_PASSWORD or prompted when omitted)
        #[arg(long, env = "DBSEE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Forget the stored token
    Logout,
    /// Show whether a token is stored
    Status,
    /// Show the user the server associates with the token
    Whoami,
}

pub fn execute(args: AuthArgs) -> Result<()> {
    let store = TokenStore::from_env()?;
    match args.command {
        Some(AuthCommand::Login { username, password }) => {
            let client = ApiClient::new(ApiConfig::from_env(), store)?;
            let (username, password) = login_credentials(username, password)?;
            login(&client, &username, &password)?;
            println!("{} Logged in as {}", "✓".green(), username.bold());
            Ok(())
        }
        Some(AuthCommand::Logout) => {
            let client = ApiClient::new(ApiConfig::from_env(), store)?;
            logout(&client)?;
            println!("{} Logged out successfully", "✓".green());
            Ok(())
        }
        Some(AuthCommand::Status) | None => status(&store),
        Some(AuthCommand::Whoami) => {
            let client = ApiClient::new(ApiConfig::from_env(), store)?;
            let user = current_user(&client)?;
            println!("{} ({})", user.username.bold(), user.email);
            if !user.is_active {
                println!("  {}", "account inactive".yellow());
            }
            Ok(())
        }
    }
}

pub fn status(store: &TokenStore) -> Result<()> {
    println!("Authentication Status:");
    if store.override_token.is_some() {
        println!("  Status: Using DBSEE_TOKEN");
        return Ok(());
    }
    match store.load()? {
        Some(tokens) => {
            println!("  Status: Logged in");
            if let Some(username) = &tokens.username {
                println!("  User: {}", username);
            }
            if let Some(saved_at) = tokens.saved_at() {
                println!("  Since: {}", saved_at.format("%Y-%m-%d %H:%M UTC"));
            }
        }
        None => {
            println!("  Status: Not logged in");
            println!("\nRun `dbsee auth login` to authenticate.");
        }
    }
    Ok(())
}

/// Fills in whatever the command line left out by prompting on the terminal.
/// The password is read without echo.
fn login_credentials(
    username: Option<String>,
    password: Option<String>,
) -> Result<(String, String)> {
    let username = match username {
        Some(username) => username,
        None => Text::new("Username:")
            .prompt()
            .map_err(|e| anyhow::anyhow!("Prompt cancelled: {}", e))?,
    };
    let username = username.trim().to_string();
    if username.is_empty() {
        anyhow::bail!("Username cannot be empty");
    }

    let password = match password {
        Some(password) => password,
        None => Password::new("Password:")
            .without_confirmation()
            .prompt()
            .map_err(|e| anyhow::anyhow!("Prompt cancelled: {}", e))?,
    };
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok((username, password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn tokens() -> AuthTokens {
        AuthTokens {
            access_token: "abc".to_string(),
            token_type: "bearer".to_string(),
            username: Some("admin".to_string()),
            saved_at: 1_700_000_000,
        }
    }

    #[test]
    fn supplied_credentials_skip_the_prompts() {
        let (username, password) =
            login_credentials(Some(" admin ".into()), Some("s3cret".into())).unwrap();
        assert_eq!(username, "admin");
        assert_eq!(password, "s3cret");
    }

    #[test]
    fn blank_supplied_credentials_are_rejected() {
        let err = login_credentials(Some("  ".into()), Some("x".into())).unwrap_err();
        assert_eq!(err.to_string(), "Username cannot be empty");

        let err = login_credentials(Some("admin".into()), Some(String::new())).unwrap_err();
        assert_eq!(err.to_string(), "Password cannot be empty");
    }

    #[test]
    fn save_load_clear_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::at(dir.path().join("nested").join("auth.toml"));

        assert!(store.load().unwrap().is_none());
        assert!(!store.is_authenticated());

        store.save(&tokens()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.access_token, "abc");
        assert_eq!(loaded.username.as_deref(), Some("admin"));
        assert_eq!(store.token().unwrap().as_deref(), Some("abc"));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        // Clearing twice is fine.
        store.clear().unwrap();
    }

    #[test]
    fn override_token_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::at(dir.path().join("auth.toml")).with_override(Some("env".into()));
        store.save(&tokens()).unwrap();
        assert_eq!(store.token().unwrap().as_deref(), Some("env"));
    }

    #[test]
    fn subscribers_are_notified_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::at(dir.path().join("auth.toml"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let subscription = {
            let seen = seen.clone();
            store
                .events()
                .subscribe(move |change| seen.lock().unwrap().push(change))
        };
        assert_eq!(store.events().listener_count(), 1);

        store.save(&tokens()).unwrap();
        store.clear().unwrap();
        drop(subscription);
        store.save(&tokens()).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![AuthChange::LoggedIn, AuthChange::LoggedOut]
        );
        assert_eq!(store.events().listener_count(), 0);
    }

    #[test]
    fn separate_emitters_do_not_leak() {
        let first = AuthEvents::new();
        let second = AuthEvents::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _guard = {
            let count = count.clone();
            first.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        second.emit(AuthChange::LoggedOut);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        first.emit(AuthChange::LoggedIn);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
