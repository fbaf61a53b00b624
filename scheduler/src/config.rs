//! Process configuration, read once from the environment at startup (§10.3).

use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub db_path: String,
    pub ui_root: PathBuf,
    pub base_path: String,
    pub enable_ssl: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub enable_ipv6: bool,
    pub auth_config_path: Option<PathBuf>,
    pub default_account: String,
    pub task_timeout: Duration,
    pub condition_timeout: Duration,
    pub openssl_bin: String,
    pub self_signed_days: u32,
    pub self_signed_subject: String,
}

impl Config {
    pub fn from_env() -> eyre::Result<Self> {
        let enable_ipv6 = env_bool("SCHEDULER_ENABLE_IPV6", false)?;
        let default_host = if enable_ipv6 { "::1" } else { "127.0.0.1" };
        let host: IpAddr = env::var("SCHEDULER_HOST")
            .unwrap_or_else(|_| default_host.to_owned())
            .parse()
            .map_err(|e| eyre::eyre!("invalid SCHEDULER_HOST: {e}"))?;
        if host.is_ipv6() && !enable_ipv6 {
            eyre::bail!("SCHEDULER_HOST is an IPv6 address but SCHEDULER_ENABLE_IPV6 is not set");
        }

        let port: u16 = env_or("SCHEDULER_PORT", "28256")
            .parse()
            .map_err(|e| eyre::eyre!("invalid SCHEDULER_PORT: {e}"))?;

        let db_path = env::var("SCHEDULER_DB_PATH").unwrap_or_else(|_| "scheduler.db".to_owned());
        let ui_root = PathBuf::from(env::var("SCHEDULER_UI_ROOT").unwrap_or_else(|_| "ui".to_owned()));
        let base_path = normalize_base_path(&env::var("SCHEDULER_BASE_PATH").unwrap_or_default());

        let enable_ssl = env_bool("SCHEDULER_ENABLE_SSL", false)?;
        let cert_path = env::var("SCHEDULER_CERT_PATH").ok().map(PathBuf::from);
        let key_path = env::var("SCHEDULER_KEY_PATH").ok().map(PathBuf::from);
        if enable_ssl && (cert_path.is_none() || key_path.is_none()) {
            eyre::bail!("SCHEDULER_ENABLE_SSL is set but SCHEDULER_CERT_PATH/SCHEDULER_KEY_PATH are missing");
        }

        let auth_config_path = env::var("SCHEDULER_AUTH_CONFIG").ok().map(PathBuf::from);

        let default_account = match env::var("SCHEDULER_DEFAULT_ACCOUNT") {
            Ok(v) if !v.is_empty() => v,
            _ => scheduler_core::account::current_account_name()
                .map_err(|e| eyre::eyre!("could not resolve default account: {e}"))?,
        };

        let task_timeout = Duration::from_secs(env_or("SCHEDULER_TASK_TIMEOUT_SECS", "900").parse()?);
        let condition_timeout =
            Duration::from_secs(env_or("SCHEDULER_CONDITION_TIMEOUT_SECS", "60").parse()?);

        let openssl_bin = env::var("SCHEDULER_OPENSSL_BIN").unwrap_or_else(|_| "openssl".to_owned());
        let self_signed_days: u32 = env_or("SCHEDULER_SELF_SIGNED_DAYS", "825").parse()?;
        let self_signed_subject =
            env::var("SCHEDULER_SELF_SIGNED_SUBJECT").unwrap_or_else(|_| "/CN=localhost".to_owned());

        Ok(Self {
            host,
            port,
            db_path,
            ui_root,
            base_path,
            enable_ssl,
            cert_path,
            key_path,
            enable_ipv6,
            auth_config_path,
            default_account,
            task_timeout,
            condition_timeout,
            openssl_bin,
            self_signed_days,
            self_signed_subject,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_bool(key: &str, default: bool) -> eyre::Result<bool> {
    match env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => eyre::bail!("invalid boolean value '{other}' for {key}"),
        },
        Err(_) => Ok(default),
    }
}

fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_path_is_normalized() {
        assert_eq!(normalize_base_path(""), "");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path("scheduler"), "/scheduler");
        assert_eq!(normalize_base_path("/scheduler/"), "/scheduler");
    }
}
