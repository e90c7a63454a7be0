use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub security: SecurityConfig,
    /// Base URL this process is reachable at; used to build public media
    /// URLs for locally saved files.
    pub public_url: String,
    pub frontend_urls: Vec<String>,
    pub cors_origins: Vec<String>,
    /// Relaxes webhook signature verification. Never enable in production.
    pub dev_mode: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Graph API version segment, e.g. "v18.0".
    pub api_version: String,
    /// Legacy single-tenant fallback used by the bare /webhook route.
    pub default_verify_token: String,
    pub default_access_token: String,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub jwt_secret: String,
}

fn get_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        dotenv().ok();

        let port = get_str("PORT", "4400")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid PORT: {}", e))?;

        Ok(Self {
            server: ServerConfig {
                host: get_str("HOST", "0.0.0.0"),
                port,
            },
            database: DatabaseConfig {
                url: get_str(
                    "DATABASE_URL",
                    "postgres://waserver:@localhost:5432/waserver",
                ),
                max_connections: get_str("DATABASE_MAX_CONNECTIONS", "16")
                    .parse()
                    .unwrap_or(16),
            },
            provider: ProviderConfig {
                api_version: get_str("WHATSAPP_API_VERSION", "v18.0"),
                default_verify_token: get_str("WHATSAPP_VERIFY_TOKEN", "webhook_verify"),
                default_access_token: get_str("WHATSAPP_ACCESS_TOKEN", ""),
            },
            security: SecurityConfig {
                jwt_secret: get_str("JWT_SECRET", "change-me"),
            },
            public_url: get_str("PUBLIC_URL", "http://localhost:4400"),
            frontend_urls: get_list("FRONTEND_URLS"),
            cors_origins: get_list("CORS_ORIGINS"),
            dev_mode: get_str("DEV_MODE", "false") == "true",
        })
    }

    pub fn graph_base(&self) -> String {
        format!("https://graph.facebook.com/{}", self.provider.api_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_base_uses_api_version() {
        let mut config = AppConfig::load().expect("load config");
        config.provider.api_version = "v19.0".to_string();
        assert_eq!(config.graph_base(), "https://graph.facebook.com/v19.0");
    }
}
