//! Per-instance configuration.
//!
//! Configuration lives in `_init.yaml` inside the configuration directory. The `start` command
//! may name an override file from the same directory which is merged on top of it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub const INIT_FILE: &str = "_init.yaml";
pub const DEFAULT_PORT: u16 = 502;
pub const DEFAULT_GRACE_PERIOD: u64 = 3600;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the configuration file {1:?}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("could not parse the configuration file {1:?}")]
    Parse(#[source] serde_yml::Error, PathBuf),
    #[error("configuration does not match the expected schema")]
    Schema(#[source] serde_yml::Error),
    #[error(
        "cannot find configuration for index {0}, at least the sal_index entry must be provided"
    )]
    MissingInstance(u16),
    #[error(
        "multiple configuration instances match index {0}, please check the configuration file"
    )]
    DuplicateInstance(u16),
    #[error("index {0} is not a valid modbus unit address, configure the unit explicitly")]
    InvalidUnit(u16),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub instances: Vec<Instance>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Instance {
    pub sal_index: u16,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub unit: Option<u8>,
    /// Seconds.
    pub grace_period: Option<u64>,
}

/// Values given on the command line. They take precedence over the configuration file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub unit: Option<u8>,
    pub grace_period: Option<u64>,
}

/// Where and how to reach the compressor.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub unit: u8,
    pub grace_period: Duration,
}

impl Target {
    pub fn simulator(address: SocketAddr, grace_period: Duration) -> Self {
        Self { host: address.ip().to_string(), port: address.port(), unit: 1, grace_period }
    }
}

pub fn default_host(index: u16) -> String {
    format!("m1m3cam-aircomp{index:02}.cp.lsst.org")
}

impl ConfigFile {
    pub async fn load(config_dir: &Path, override_file: &str) -> Result<Self, Error> {
        let mut merged = read_yaml(&config_dir.join(INIT_FILE)).await?;
        if !override_file.is_empty() {
            let overlay = read_yaml(&config_dir.join(override_file)).await?;
            merge(&mut merged, overlay);
        }
        serde_yml::from_value(merged).map_err(Error::Schema)
    }

    pub fn resolve(&self, index: u16, overrides: &Overrides) -> Result<Target, Error> {
        let mut matching = self.instances.iter().filter(|i| i.sal_index == index);
        let instance = matching.next().ok_or(Error::MissingInstance(index))?;
        if matching.next().is_some() {
            return Err(Error::DuplicateInstance(index));
        }
        let unit = match overrides.unit.or(instance.unit) {
            Some(unit) => unit,
            None => u8::try_from(index).map_err(|_| Error::InvalidUnit(index))?,
        };
        let host = overrides
            .host
            .clone()
            .or_else(|| instance.host.clone())
            .unwrap_or_else(|| default_host(index));
        let grace_period =
            overrides.grace_period.or(instance.grace_period).unwrap_or(DEFAULT_GRACE_PERIOD);
        Ok(Target {
            host,
            port: overrides.port.or(instance.port).unwrap_or(DEFAULT_PORT),
            unit,
            grace_period: Duration::from_secs(grace_period),
        })
    }
}

async fn read_yaml(path: &Path) -> Result<serde_yml::Value, Error> {
    let contents =
        tokio::fs::read_to_string(path).await.map_err(|e| Error::Read(e, path.to_path_buf()))?;
    let value: serde_yml::Value =
        serde_yml::from_str(&contents).map_err(|e| Error::Parse(e, path.to_path_buf()))?;
    Ok(match value {
        serde_yml::Value::Null => serde_yml::Value::Mapping(Default::default()),
        value => value,
    })
}

/// Mappings are merged key by key, anything else in `overlay` replaces `base`.
fn merge(base: &mut serde_yml::Value, overlay: serde_yml::Value) {
    match (base, overlay) {
        (serde_yml::Value::Mapping(base), serde_yml::Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ConfigFile {
        serde_yml::from_str(text).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse("instances:\n  - sal_index: 1\n  - sal_index: 2\n    port: 5020\n");
        let target = config.resolve(1, &Overrides::default()).unwrap();
        assert_eq!(
            target,
            Target {
                host: "m1m3cam-aircomp01.cp.lsst.org".into(),
                port: 502,
                unit: 1,
                grace_period: Duration::from_secs(3600),
            }
        );
        let target = config.resolve(2, &Overrides::default()).unwrap();
        assert_eq!(target.port, 5020);
        assert_eq!(target.unit, 2);
    }

    #[test]
    fn command_line_wins() {
        let config = parse(concat!(
            "instances:\n",
            "  - sal_index: 1\n",
            "    host: compressor.local\n",
            "    unit: 3\n",
            "    grace_period: 60\n",
        ));
        let overrides = Overrides {
            host: Some("other".into()),
            grace_period: Some(5),
            ..Default::default()
        };
        let target = config.resolve(1, &overrides).unwrap();
        assert_eq!(target.host, "other");
        assert_eq!(target.unit, 3);
        assert_eq!(target.grace_period, Duration::from_secs(5));
    }

    #[test]
    fn instance_must_be_unique() {
        let config = parse("instances:\n  - sal_index: 1\n  - sal_index: 1\n");
        let overrides = Overrides::default();
        assert!(matches!(config.resolve(1, &overrides), Err(Error::DuplicateInstance(1))));
        assert!(matches!(config.resolve(2, &overrides), Err(Error::MissingInstance(2))));
    }

    #[test]
    fn large_index_needs_unit() {
        let config = parse("instances:\n  - sal_index: 300\n");
        assert!(matches!(config.resolve(300, &Overrides::default()), Err(Error::InvalidUnit(300))));
        let overrides = Overrides { unit: Some(7), ..Default::default() };
        assert_eq!(config.resolve(300, &overrides).unwrap().unit, 7);
    }

    #[tokio::test]
    async fn override_file_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(INIT_FILE), "instances:\n  - sal_index: 1\n")
            .await
            .unwrap();
        tokio::fs::write(
            dir.path().join("lab.yaml"),
            "instances:\n  - sal_index: 1\n    host: lab-compressor\n",
        )
        .await
        .unwrap();
        let base = ConfigFile::load(dir.path(), "").await.unwrap();
        assert_eq!(base.instances[0].host, None);
        let merged = ConfigFile::load(dir.path(), "lab.yaml").await.unwrap();
        assert_eq!(merged.instances[0].host.as_deref(), Some("lab-compressor"));
        assert!(matches!(
            ConfigFile::load(dir.path(), "missing.yaml").await,
            Err(Error::Read(..))
        ));
    }

    #[tokio::test]
    async fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(INIT_FILE), "instances:\n  - sal_index: 1\n    hots: x\n")
            .await
            .unwrap();
        assert!(matches!(ConfigFile::load(dir.path(), "").await, Err(Error::Schema(_))));
    }
}
