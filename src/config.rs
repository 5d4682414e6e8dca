use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

pub const CONFIG_PATH: &str = "/etc/jpkt/config.toml";
pub const LOCAL_CONFIG_FILE: &str = "jpkt.toml";
pub const ENV_PREFIX: &str = "JPKT_";

/// AES block size in bytes. The only value the gateway accepts.
pub const AES_BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub poll_interval_secs: u64,
    /// Extra status attempts before a transport failure declines a transfer.
    /// Zero keeps the fail-fast behaviour.
    pub status_retry_attempts: u32,
    pub status_retry_delay_ms: u64,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub settings: TransferSettings,
}

/// Gateway and encryption parameters shared by all transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSettings {
    pub endpoint_url: String,
    pub min_filename_length: usize,
    pub max_filename_length: usize,
    pub key_size: usize,
    pub iv_size: usize,
    pub block_size: usize,
    pub max_chunk_size: u64,
    /// PEM certificate (or bare public key) of the gateway, used to wrap
    /// each transfer's secret key.
    pub public_key_path: Option<PathBuf>,
    pub accept_invalid_certs: bool,
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("jpk_transfer.db"),
            poll_interval_secs: 300,
            status_retry_attempts: 0,
            status_retry_delay_ms: 2_000,
            simulation: false,
            verbose: false,
            json_logs: false,
            settings: TransferSettings::default(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            min_filename_length: 5,
            max_filename_length: 55,
            key_size: 32,
            iv_size: 16,
            block_size: AES_BLOCK_SIZE,
            max_chunk_size: 60 * 1024 * 1024,
            public_key_path: None,
            accept_invalid_certs: false,
            request_timeout_secs: 120,
        }
    }
}

impl AppConfig {
    /// Load configuration with CLI overrides applied last.
    pub fn new<T: Serialize>(config_path: Option<&Path>, overrides: Option<&T>) -> anyhow::Result<Self> {
        Ok(Self::load(config_path, overrides)?)
    }

    /// Layering: defaults, system config file, local `jpkt.toml` (or the
    /// explicit `config_path` instead of both files), `JPKT_*` environment,
    /// then serialized overrides.
    pub fn load<T: Serialize>(
        config_path: Option<&Path>,
        overrides: Option<&T>,
    ) -> std::result::Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        figment = match config_path {
            Some(path) => figment.merge(Toml::file(path)),
            None => figment
                .merge(Toml::file(CONFIG_PATH))
                .merge(Toml::file(LOCAL_CONFIG_FILE)),
        };

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract()
    }
}

impl TransferSettings {
    /// Check that the gateway is configured and that the crypto parameters
    /// are ones AES-CBC can honour.
    pub fn validate(&self) -> Result<()> {
        self.endpoint()?;
        self.public_key_path()?;

        if !matches!(self.key_size, 16 | 24 | 32) {
            return Err(TransferError::validation(format!(
                "Unsupported encryption key size {}, expected 16, 24 or 32 bytes",
                self.key_size
            )));
        }
        if self.iv_size != AES_BLOCK_SIZE {
            return Err(TransferError::validation(format!(
                "Unsupported IV size {}, AES-CBC requires {} bytes",
                self.iv_size, AES_BLOCK_SIZE
            )));
        }
        if self.block_size != AES_BLOCK_SIZE {
            return Err(TransferError::validation(format!(
                "Unsupported block size {}, AES requires {} bytes",
                self.block_size, AES_BLOCK_SIZE
            )));
        }
        if self.max_chunk_size == 0 {
            return Err(TransferError::validation("Maximum chunk size must be positive"));
        }
        if self.min_filename_length > self.max_filename_length {
            return Err(TransferError::validation(format!(
                "Minimum file name length {} exceeds maximum {}",
                self.min_filename_length, self.max_filename_length
            )));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Result<&str> {
        let url = self.endpoint_url.trim_end_matches('/');
        if url.is_empty() {
            return Err(TransferError::validation("Missing API endpoint URL in settings"));
        }
        Ok(url)
    }

    pub fn public_key_path(&self) -> Result<&Path> {
        self.public_key_path
            .as_deref()
            .ok_or_else(|| TransferError::validation("Missing gateway public key in settings"))
    }

    pub fn key_bits(&self) -> usize {
        self.key_size * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        simulation: Option<bool>,
    }

    fn configured() -> TransferSettings {
        TransferSettings {
            endpoint_url: "https://test-e-dokumenty.mf.gov.pl".into(),
            public_key_path: Some(PathBuf::from("mf_public_key.pem")),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_gateway_requirements() {
        let settings = TransferSettings::default();
        assert_eq!(settings.key_size, 32);
        assert_eq!(settings.iv_size, 16);
        assert_eq!(settings.max_chunk_size, 60 * 1024 * 1024);
        assert!(configured().validate().is_ok());
    }

    #[test]
    fn layers_file_env_and_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                LOCAL_CONFIG_FILE,
                r#"
                poll_interval_secs = 60
                simulation = false

                [settings]
                endpoint_url = "https://gateway.example/"
                max_chunk_size = 1024
                "#,
            )?;
            jail.set_env("JPKT_SETTINGS__MAX_FILENAME_LENGTH", "40");

            let config = AppConfig::load(
                None,
                Some(&Overrides {
                    simulation: Some(true),
                }),
            )?;

            assert_eq!(config.poll_interval_secs, 60);
            assert_eq!(config.settings.max_chunk_size, 1024);
            assert_eq!(config.settings.max_filename_length, 40);
            assert_eq!(config.settings.min_filename_length, 5);
            assert!(config.simulation);
            assert_eq!(config.settings.endpoint().unwrap(), "https://gateway.example");
            Ok(())
        });
    }

    #[test]
    fn missing_endpoint_and_key_are_validation_errors() {
        let err = TransferSettings::default().validate().unwrap_err();
        assert_eq!(err.to_string(), "Missing API endpoint URL in settings");

        let settings = TransferSettings {
            public_key_path: None,
            ..configured()
        };
        let err = settings.validate().unwrap_err();
        assert_eq!(err.to_string(), "Missing gateway public key in settings");

        let settings = TransferSettings {
            endpoint_url: "/".into(),
            ..configured()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_non_aes_sizes() {
        let settings = TransferSettings {
            key_size: 20,
            ..configured()
        };
        assert!(settings.validate().is_err());

        let settings = TransferSettings {
            block_size: 8,
            ..configured()
        };
        assert!(settings.validate().is_err());
    }
}
