use crate::services::provisioning::ProvisionOptions;
use anyhow::{Context, Result};
use std::{env, net::Ipv4Addr, path::PathBuf, str::FromStr, sync::OnceLock};

/// Application configuration of the host daemon
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Access point and command server settings
    pub provision: ProvisionConfig,

    /// Flash emulation
    pub flash: FlashConfig,

    /// Behaviour of the simulated radio
    pub simulation: SimulationConfig,
}

#[derive(Clone, Debug)]
pub struct ProvisionConfig {
    pub port: u16,
    pub max_connections: u8,
    pub ap_prefix: String,
    pub ap_password: String,
    pub ap_channel: u8,
}

#[derive(Clone, Debug)]
pub struct FlashConfig {
    pub image: PathBuf,
    /// Station config of the simulated radio, kept apart from the image
    pub station: PathBuf,
}

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub connect_ok: bool,
    pub station_ip: Ipv4Addr,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Loads from environment variables on first call and returns the cached
    /// instance afterwards.
    ///
    /// # Panics
    /// Panics if an environment variable holds an invalid value.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG
            .get_or_init(|| Self::load().expect("failed to load application configuration"))
    }

    fn load() -> Result<Self> {
        Ok(Self {
            provision: ProvisionConfig::load()?,
            flash: FlashConfig::load()?,
            simulation: SimulationConfig::load()?,
        })
    }
}

impl ProvisionConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            port: var_or("PROVISION_PORT", 7802)?,
            max_connections: var_or("PROVISION_MAX_CONNECTIONS", 2)?,
            ap_prefix: env::var("AP_PREFIX").unwrap_or_else(|_| "IOT_".to_string()),
            ap_password: env::var("AP_PASSWORD").unwrap_or_else(|_| "password".to_string()),
            ap_channel: var_or("AP_CHANNEL", 6)?,
        })
    }

    pub fn options(&self) -> ProvisionOptions {
        ProvisionOptions {
            ap_prefix: self.ap_prefix.clone(),
            ap_password: self.ap_password.clone(),
            ap_channel: self.ap_channel,
            port: self.port,
            max_connections: self.max_connections,
        }
    }
}

impl FlashConfig {
    fn load() -> Result<Self> {
        let image = env::var("FLASH_IMAGE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join(env!("CARGO_PKG_NAME")).join("flash.bin"));
        let station = env::var("STATION_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| image.with_file_name("station.json"));

        Ok(Self { image, station })
    }
}

impl SimulationConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            connect_ok: var_or("SIM_CONNECT_OK", true)?,
            station_ip: var_or("SIM_IP", Ipv4Addr::new(192, 168, 1, 50))?,
        })
    }
}

fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .context(format!("failed to parse {name}: invalid format")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_yields_default() {
        let port: u16 = var_or("DEVICE_PROVISIONER_TEST_UNSET", 7802).expect("default");
        assert_eq!(port, 7802);
    }

    #[test]
    fn invalid_variable_is_an_error() {
        // SAFETY: no other test touches this variable
        unsafe { env::set_var("DEVICE_PROVISIONER_TEST_PORT", "seventy") };

        let err = var_or::<u16>("DEVICE_PROVISIONER_TEST_PORT", 7802).unwrap_err();
        assert!(err.to_string().contains("DEVICE_PROVISIONER_TEST_PORT"));
    }

    #[test]
    fn defaults_map_to_valid_options() {
        let config = ProvisionConfig {
            port: 7802,
            max_connections: 2,
            ap_prefix: "IOT_".into(),
            ap_password: "password".into(),
            ap_channel: 6,
        };
        let options = config.options();

        assert_eq!(options.port, 7802);
        assert_eq!(options.ap_prefix, "IOT_");
    }
}
