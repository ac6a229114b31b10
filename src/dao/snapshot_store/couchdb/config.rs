use std::env;

use tracing::warn;

use super::error::{CouchDaoError, CouchResult};

const DEFAULT_DATABASE: &str = "gamma_tunes";

/// Where the CouchDB snapshot database lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    /// Server URL, without the database path.
    pub base_url: String,
    /// Database holding one document per guild.
    pub database: String,
    /// Basic-auth user.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
}

impl CouchConfig {
    /// Read `COUCH_BASE_URL` (required), `COUCH_DB` and the optional
    /// `COUCH_USERNAME`/`COUCH_PASSWORD` pair.
    pub fn from_env() -> CouchResult<Self> {
        let base_url = non_empty_var("COUCH_BASE_URL").ok_or(CouchDaoError::MissingEnvVar {
            var: "COUCH_BASE_URL",
        })?;
        let database = non_empty_var("COUCH_DB").unwrap_or_else(|| DEFAULT_DATABASE.into());

        let (username, password) =
            match (non_empty_var("COUCH_USERNAME"), non_empty_var("COUCH_PASSWORD")) {
                (Some(username), Some(password)) => (Some(username), Some(password)),
                (None, None) => (None, None),
                _ => {
                    warn!("only one of COUCH_USERNAME and COUCH_PASSWORD is set; connecting without credentials");
                    (None, None)
                }
            };

        Ok(Self {
            base_url,
            database,
            username,
            password,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}
