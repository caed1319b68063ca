use anyhow::{Context, Result};
use herald_core::config::{BotConfig, ChatProviderKind};
use herald_scheduler::JobRunnerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub bots: Vec<BotConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_concurrent_jobs() -> usize {
    100
}

fn default_max_history() -> usize {
    200
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_history: default_max_history(),
        }
    }
}

impl From<&JobsConfig> for JobRunnerConfig {
    fn from(jobs: &JobsConfig) -> Self {
        JobRunnerConfig {
            max_concurrent_jobs: jobs.max_concurrent_jobs,
            max_history: jobs.max_history,
        }
    }
}

/// Mask a secret string for display.
/// Shows the first 3 and last 4 chars for secrets longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

/// Connection string with its secret field masked
fn mask_connection_string(bot: &BotConfig) -> String {
    let mut fields: Vec<String> = bot
        .connection_string
        .splitn(6, ';')
        .map(str::to_string)
        .collect();
    let secret_index = match bot.provider.parse::<ChatProviderKind>() {
        Ok(ChatProviderKind::Discord) => Some(0),
        Ok(ChatProviderKind::Irc) if fields.len() == 6 => Some(5),
        Ok(ChatProviderKind::Irc) => None,
        // Unknown protocol, nothing is known to be safe
        Err(_) => return mask_secret(&bot.connection_string),
    };
    if let Some(i) = secret_index {
        fields[i] = mask_secret(&fields[i]);
    }
    fields.join(";")
}

/// Does this bot carry a literal secret instead of an env reference
fn has_hardcoded_secret(bot: &BotConfig) -> bool {
    let fields: Vec<&str> = bot.connection_string.splitn(6, ';').collect();
    let secret = match bot.provider.parse::<ChatProviderKind>() {
        Ok(ChatProviderKind::Discord) => fields.first().copied(),
        Ok(ChatProviderKind::Irc) => fields.get(5).copied(),
        Err(_) => None,
    };
    secret.is_some_and(|s| !s.trim().is_empty() && !s.contains("${"))
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".herald")
}

impl HeraldConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // Connection strings hold tokens and passwords
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `herald init` first.",
                path.display()
            )
        })?;

        let expanded = expand_env_vars(&content);

        let config: Self = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        for bot in &config.bots {
            if has_hardcoded_secret(bot) {
                warn!(
                    "Bot '{}' has a secret hardcoded in its connection string. For security, use environment variables such as ${{HERALD_DISCORD_TOKEN}}",
                    bot.name
                );
            }
        }

        Ok(config)
    }

    /// Copy safe to print, with every connection string secret masked
    pub fn masked(&self) -> Self {
        let mut masked = self.clone();
        for bot in &mut masked.bots {
            bot.connection_string = mask_connection_string(bot);
        }
        masked
    }

    pub fn enabled_bots(&self) -> impl Iterator<Item = &BotConfig> {
        self.bots.iter().filter(|b| b.enabled)
    }
}

/// Environment variables that may be expanded in config files
const ALLOWED_ENV_VARS: &[&str] = &[
    "HERALD_IRC_PASSWORD",
    "HERALD_IRC_NICKNAME",
    "HERALD_DISCORD_TOKEN",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bot(provider: &str, connection_string: &str) -> BotConfig {
        BotConfig {
            name: "ops".to_string(),
            provider: provider.to_string(),
            connection_string: connection_string.to_string(),
            enabled: true,
            reconnection_interval_minutes: 5,
            channel_limit: None,
            channels: vec![],
        }
    }

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
                .unwrap();
        }
        file
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("abcdefghijkl"), "abc...ijkl");
        assert_eq!(mask_secret("ünïcödé-tökën"), "ünï...ökën");
    }

    #[test]
    fn test_mask_connection_string() {
        assert_eq!(
            mask_connection_string(&bot("irc", "irc.example.org;6697;herald;true;sasl;hunter2hunter2")),
            "irc.example.org;6697;herald;true;sasl;hun...ter2"
        );
        assert_eq!(
            mask_connection_string(&bot("irc", "irc.example.org;6667;herald;false")),
            "irc.example.org;6667;herald;false"
        );
        assert_eq!(
            mask_connection_string(&bot("discord", "MTIzNDU2Nzg5.token;never")),
            "MTI...oken;never"
        );
        assert_eq!(mask_connection_string(&bot("slack", "abc")), "***");
        assert_eq!(
            mask_connection_string(&bot("irc", "h;6667;n;false;sasl;pass;word;1234")),
            "h;6667;n;false;sasl;pas...1234"
        );
    }

    #[test]
    fn test_hardcoded_secret_detection() {
        assert!(has_hardcoded_secret(&bot("discord", "literal-token")));
        assert!(!has_hardcoded_secret(&bot("discord", "${HERALD_DISCORD_TOKEN}")));
        assert!(has_hardcoded_secret(&bot("irc", "a;1;n;false;nickserv;pw")));
        assert!(!has_hardcoded_secret(&bot("irc", "a;1;n;false")));
        assert!(!has_hardcoded_secret(&bot("irc", "a;1;n;false;sasl;${HERALD_IRC_PASSWORD}")));
    }

    #[test]
    fn test_expand_env_vars_allowlist() {
        // SAFETY: no other test reads or writes this variable
        unsafe { std::env::set_var("HERALD_IRC_NICKNAME", "heraldbot") };
        let expanded = expand_env_vars("nick=${HERALD_IRC_NICKNAME} other=${PATH} tail");
        assert_eq!(expanded, "nick=heraldbot other=${PATH} tail");
    }

    #[test]
    fn test_expand_env_vars_unterminated() {
        assert_eq!(expand_env_vars("value=${HOME"), "value=${HOME");
    }

    #[test]
    fn test_load_default_config() {
        let file = write_config(include_str!("../../../config/default.toml"));
        let config = HeraldConfig::load(&Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.jobs.max_concurrent_jobs, 100);
        assert_eq!(config.bots.len(), 2);
        assert_eq!(config.bots[0].provider, "irc");
        assert_eq!(config.bots[0].channel_limit, Some(10));
        assert_eq!(config.bots[0].channels.len(), 2);
        assert_eq!(
            config.bots[0].channels[1].irc_name_and_key(),
            Some(("#herald-staff", Some("staffkey")))
        );
        assert_eq!(config.bots[1].channels[0].discord_channel_id, Some(0));
        assert_eq!(config.enabled_bots().count(), 0);
    }

    #[test]
    fn test_load_minimal_config_uses_defaults() {
        let file = write_config(
            r#"
[[bots]]
name = "ops"
provider = "irc"
connection_string = "irc.example.org;6667;herald;false"
"#,
        );
        let config = HeraldConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.jobs.max_history, 200);
        let bot = &config.bots[0];
        assert!(bot.enabled);
        assert_eq!(bot.reconnection_interval_minutes, 5);
        assert!(bot.channels.is_empty());
        assert_eq!(config.enabled_bots().count(), 1);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = HeraldConfig::load(&Some(dir.path().join("missing.toml"))).unwrap_err();
        assert!(err.to_string().contains("herald init"));
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let file = write_config("[[bots]]\nname = ");
        assert!(HeraldConfig::load(&Some(file.path().to_path_buf())).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_load_refuses_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let file = write_config("");
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();
        let err = HeraldConfig::load(&Some(file.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("chmod 600"));
    }

    #[test]
    fn test_masked_config_hides_secrets() {
        let config = HeraldConfig {
            jobs: JobsConfig::default(),
            bots: vec![bot("discord", "very-secret-token;always")],
        };
        let masked = config.masked();
        assert_eq!(masked.bots[0].connection_string, "ver...oken;always");
        assert_eq!(config.bots[0].connection_string, "very-secret-token;always");
    }
}
