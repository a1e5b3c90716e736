//! Per-image configuration overrides
//!
//! Overrides live in image metadata under `conf_<option>`. The same key in
//! pool metadata overrides the cluster value for every image in the pool.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::{ImageHandle, PoolContext, StorageEngine};
use crate::{Error, Result};

const METADATA_PREFIX: &str = "conf_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Integer,
    Bytes,
    Milliseconds,
    Bool,
}

/// Where the effective value of an option comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Global = 0,
    Pool = 1,
    Image = 2,
}

impl Serialize for ConfigSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OptionDef {
    pub name: &'static str,
    pub kind: OptionType,
    pub default: &'static str,
}

macro_rules! options {
    ($($name:literal => $kind:ident, $default:literal;)*) => {
        &[$(OptionDef { name: $name, kind: OptionType::$kind, default: $default },)*]
    };
}

/// Options that can be overridden per pool or per image
pub const OPTIONS: &[OptionDef] = options! {
    "rbd_qos_iops_limit" => Integer, "0";
    "rbd_qos_bps_limit" => Bytes, "0";
    "rbd_qos_read_iops_limit" => Integer, "0";
    "rbd_qos_write_iops_limit" => Integer, "0";
    "rbd_qos_read_bps_limit" => Bytes, "0";
    "rbd_qos_write_bps_limit" => Bytes, "0";
    "rbd_qos_iops_burst" => Integer, "0";
    "rbd_qos_bps_burst" => Bytes, "0";
    "rbd_qos_read_iops_burst" => Integer, "0";
    "rbd_qos_write_iops_burst" => Integer, "0";
    "rbd_qos_read_bps_burst" => Bytes, "0";
    "rbd_qos_write_bps_burst" => Bytes, "0";
    "rbd_qos_schedule_tick_min" => Milliseconds, "50";
    "rbd_cache" => Bool, "true";
    "rbd_readahead_trigger_requests" => Integer, "10";
    "rbd_readahead_max_bytes" => Bytes, "524288";
    "rbd_readahead_disable_after_bytes" => Bytes, "52428800";
};

impl OptionDef {
    pub fn lookup(name: &str) -> Result<&'static OptionDef> {
        OPTIONS
            .iter()
            .find(|o| o.name == name)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown configuration option '{name}'")))
    }

    pub fn metadata_key(&self) -> String {
        format!("{METADATA_PREFIX}{}", self.name)
    }

    /// Check `value` against the option type and normalize it
    pub fn validate(&self, value: &str) -> Result<String> {
        let value = value.trim();
        let bad = || Error::InvalidRequest(format!("invalid value '{value}' for {}", self.name));
        match self.kind {
            OptionType::Integer | OptionType::Bytes | OptionType::Milliseconds => value
                .parse::<u64>()
                .map(|v| v.to_string())
                .map_err(|_| bad()),
            OptionType::Bool => match value.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok("true".into()),
                "false" | "0" => Ok("false".into()),
                _ => Err(bad()),
            },
        }
    }
}

/// Effective value of one option
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigOption {
    pub name: String,
    pub value: String,
    pub source: ConfigSource,
    #[serde(rename = "type")]
    pub kind: OptionType,
}

/// Set (`Some`) or remove (`None`) image overrides
///
/// Every entry is validated before anything is written.
pub fn apply(image: &mut dyn ImageHandle, overrides: &BTreeMap<String, Option<String>>) -> Result<()> {
    let mut planned = Vec::with_capacity(overrides.len());
    for (name, value) in overrides {
        let def = OptionDef::lookup(name)?;
        let value = value.as_deref().map(|v| def.validate(v)).transpose()?;
        planned.push((def.metadata_key(), value));
    }
    if planned.is_empty() {
        return Ok(());
    }

    let current = image.metadata_list()?;
    for (key, value) in planned {
        match value {
            Some(value) => {
                tracing::debug!(key = %key, value = %value, "setting image option");
                image.metadata_set(&key, &value)?;
            }
            None if current.contains_key(&key) => {
                tracing::debug!(key = %key, "removing image option");
                image.metadata_remove(&key)?;
            }
            None => {}
        }
    }
    Ok(())
}

/// Every option with its effective value and source
pub fn list(
    engine: &dyn StorageEngine,
    ctx: &dyn PoolContext,
    image: &dyn ImageHandle,
) -> Result<Vec<ConfigOption>> {
    let pool_meta = ctx.metadata_list()?;
    let image_meta = image.metadata_list()?;
    let mut out = Vec::with_capacity(OPTIONS.len());
    for def in OPTIONS {
        let key = def.metadata_key();
        let (value, source) = if let Some(v) = image_meta.get(&key) {
            (v.clone(), ConfigSource::Image)
        } else if let Some(v) = pool_meta.get(&key) {
            (v.clone(), ConfigSource::Pool)
        } else {
            let global = engine.config_get(def.name)?;
            (global.unwrap_or_else(|| def.default.to_string()), ConfigSource::Global)
        };
        out.push(ConfigOption {
            name: def.name.to_string(),
            value,
            source,
            kind: def.kind,
        });
    }
    Ok(out)
}

/// Image level overrides only, as a name to value map
pub fn image_overrides(image: &dyn ImageHandle) -> Result<BTreeMap<String, String>> {
    Ok(image
        .metadata_list()?
        .into_iter()
        .filter_map(|(k, v)| k.strip_prefix(METADATA_PREFIX).map(|name| (name.to_string(), v)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryCluster, StorageEngine};

    fn overrides(pairs: &[(&str, Option<&str>)]) -> BTreeMap<String, Option<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn test_validate_types() {
        let iops = OptionDef::lookup("rbd_qos_iops_limit").unwrap();
        assert_eq!(iops.validate(" 100 ").unwrap(), "100");
        assert!(iops.validate("fast").is_err());
        let cache = OptionDef::lookup("rbd_cache").unwrap();
        assert_eq!(cache.validate("0").unwrap(), "false");
        assert!(OptionDef::lookup("rbd_warp_factor").is_err());
    }

    #[test]
    fn test_apply_and_list_sources() {
        let cluster = MemoryCluster::new().with_pool("rbd");
        cluster.set_config("rbd_qos_bps_limit", "2048");
        cluster
            .set_pool_metadata("rbd", "conf_rbd_qos_iops_burst", "7")
            .unwrap();
        let ctx = cluster.open_pool("rbd").unwrap();
        ctx.create_image("img", 1 << 22, &Default::default()).unwrap();
        let mut image = ctx.open_image("img").unwrap();

        apply(image.as_mut(), &overrides(&[("rbd_qos_iops_limit", Some("500"))])).unwrap();
        let options = list(&cluster, ctx.as_ref(), image.as_ref()).unwrap();
        let find = |name: &str| options.iter().find(|o| o.name == name).unwrap().clone();

        let iops = find("rbd_qos_iops_limit");
        assert_eq!((iops.value.as_str(), iops.source), ("500", ConfigSource::Image));
        let burst = find("rbd_qos_iops_burst");
        assert_eq!((burst.value.as_str(), burst.source), ("7", ConfigSource::Pool));
        let bps = find("rbd_qos_bps_limit");
        assert_eq!((bps.value.as_str(), bps.source), ("2048", ConfigSource::Global));
        assert_eq!(find("rbd_cache").value, "true");

        apply(image.as_mut(), &overrides(&[("rbd_qos_iops_limit", None)])).unwrap();
        assert!(image_overrides(image.as_ref()).unwrap().is_empty());
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let cluster = MemoryCluster::new().with_pool("rbd");
        let ctx = cluster.open_pool("rbd").unwrap();
        ctx.create_image("img", 1 << 22, &Default::default()).unwrap();
        let mut image = ctx.open_image("img").unwrap();
        let err = apply(
            image.as_mut(),
            &overrides(&[("rbd_qos_bps_limit", Some("1")), ("rbd_qos_iops_limit", Some("x"))]),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidRequest);
        assert!(cluster.calls_to("metadata_set").is_empty());
    }

    #[test]
    fn test_source_serializes_as_number() {
        assert_eq!(serde_json::to_string(&ConfigSource::Pool).unwrap(), "1");
    }
}
