// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{AccountSeed, ConfigFile, EngineOptions, RawConfigFile, RawEngineSection};
use crate::errors::{FlowError, Result};
use crate::store::Account;
use crate::types::UsageKind;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = FlowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let engine = validate_engine(&raw.engine)?;
        let accounts = raw
            .account
            .iter()
            .map(validate_account)
            .collect::<Result<Vec<_>>>()?;
        Ok(ConfigFile {
            engine,
            store: raw.store,
            accounts,
        })
    }
}

fn validate_engine(raw: &RawEngineSection) -> Result<EngineOptions> {
    if raw.max_attempts == 0 {
        return Err(FlowError::ConfigError(
            "[engine].max_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    if raw.workers == 0 {
        return Err(FlowError::ConfigError(
            "[engine].workers must be >= 1 (got 0)".to_string(),
        ));
    }

    let duration = |field: &str, value: &str| {
        parse_duration(value)
            .map_err(|e| FlowError::ConfigError(format!("[engine].{field}: {e}")))
    };

    let reconcile_interval = duration("reconcile_interval", &raw.reconcile_interval)?;
    if reconcile_interval.is_zero() {
        return Err(FlowError::ConfigError(
            "[engine].reconcile_interval must be greater than zero".to_string(),
        ));
    }

    Ok(EngineOptions {
        max_attempts: raw.max_attempts,
        workers: raw.workers,
        lock_ttl: duration("lock_ttl", &raw.lock_ttl)?,
        reconcile_interval,
        component_delay: duration("component_delay", &raw.component_delay)?,
    })
}

fn validate_account(seed: &AccountSeed) -> Result<Account> {
    if seed.id.trim().is_empty() {
        return Err(FlowError::ConfigError(
            "[[account]] entries need a non-empty id".to_string(),
        ));
    }

    let mut account = Account::new(seed.id.clone(), seed.tier);
    account.active = seed.active;
    for (kind, allowed) in &seed.allowances {
        let kind: UsageKind = kind.parse().map_err(|e| {
            FlowError::ConfigError(format!("account '{}': {e}", seed.id))
        })?;
        account = account.with_allowance(kind, *allowed);
    }
    Ok(account)
}

/// Parse a duration like `"500ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_need_a_unit() {
        assert_eq!(parse_duration("300s"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration(" 2m "), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("15ms"), Ok(Duration::from_millis(15)));
        assert_eq!(parse_duration("10").unwrap_err(), "duration missing unit suffix");
        assert!(parse_duration("3d").unwrap_err().contains("unsupported duration unit"));
        assert_eq!(parse_duration("").unwrap_err(), "empty duration string");
    }
}
