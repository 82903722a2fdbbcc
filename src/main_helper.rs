use crate::constants::DEFAULT_PROVIDER;
use crate::types::*;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// The only provider name requests may ask for.
    #[arg(long, env = "PROVIDER_NAME", default_value = DEFAULT_PROVIDER)]
    pub provider_name: String,
    #[arg(long, env = "PROVIDER_BASE_URL")]
    pub base_url: Option<String>,
    #[arg(long, env = "PROVIDER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    #[arg(long, env = "PROVIDER_MODEL")]
    pub model: Option<String>,
    /// Deadline for each upstream call, including the repair continuation.
    #[arg(long, default_value_t = 60)]
    pub upstream_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 2 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl Args {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            name: self.provider_name.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
        }
    }
}

/// Provider settings as configured; any field may still be missing.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// Provider settings with every required field present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProvider {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

fn present(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

impl ProviderConfig {
    /// Resolves the settings for one turn. `model_override` wins over the configured model.
    pub fn resolve(&self, model_override: Option<&str>) -> Result<ResolvedProvider> {
        let base_url = present(&self.base_url);
        let api_key = present(&self.api_key);
        let model = present(&self.model);

        let mut need = Vec::new();
        if base_url.is_none() {
            need.push("PROVIDER_BASE_URL");
        }
        if api_key.is_none() {
            need.push("PROVIDER_API_KEY");
        }
        if model.is_none() {
            need.push("PROVIDER_MODEL");
        }
        match (base_url, api_key, model) {
            (Some(base_url), Some(api_key), Some(model)) => Ok(ResolvedProvider {
                name: self.name.clone(),
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key,
                model: model_override
                    .filter(|m| !m.is_empty())
                    .map(str::to_owned)
                    .unwrap_or(model),
            }),
            _ => Err(RelayError::MissingConfig(need).into()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub provider: ProviderConfig,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn new(client: reqwest::Client, args: Arc<Args>) -> Self {
        Self {
            client,
            provider: args.provider_config(),
            args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig {
            name: "deepseek".into(),
            base_url: Some("https://api.example.com/v1/".into()),
            api_key: Some("sk-test".into()),
            model: Some("deepseek-chat".into()),
        }
    }

    #[test]
    fn resolves_complete_config() {
        let resolved = config().resolve(None).unwrap();
        assert_eq!(resolved.base_url, "https://api.example.com/v1");
        assert_eq!(resolved.model, "deepseek-chat");

        let resolved = config().resolve(Some("deepseek-reasoner")).unwrap();
        assert_eq!(resolved.model, "deepseek-reasoner");

        let resolved = config().resolve(Some("")).unwrap();
        assert_eq!(resolved.model, "deepseek-chat");
    }

    #[test]
    fn lists_every_missing_field() {
        let cfg = ProviderConfig {
            api_key: Some("   ".into()),
            model: None,
            ..config()
        };
        let err = cfg.resolve(Some("override")).unwrap_err();
        match err.inner {
            RelayError::MissingConfig(need) => {
                assert_eq!(need, vec!["PROVIDER_API_KEY", "PROVIDER_MODEL"])
            }
            other => panic!("expected MissingConfig, got {other:?}"),
        }
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::try_parse_from(["stagerelay", "--port", "9000"]).unwrap();
        assert_eq!(args.port, 9000);
        assert_eq!(args.upstream_timeout(), Duration::from_secs(60));
        assert!(!args.provider_config().name.is_empty());
    }
}
