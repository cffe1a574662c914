// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::env;

use tracing::warn;

use crate::symbols::dwarf_cache::CacheSetting;

pub const LIB_SOCKET_ENV: &str = "DD_PROFILING_NATIVE_LIB_SOCKET";
pub const AUTO_START_ENV: &str = "DD_PROFILING_AUTO_START";
pub const FOLLOW_EXECS_ENV: &str = "DD_PROFILING_ALLOCATION_FOLLOW_EXECS";
pub const CACHE_SETTING_ENV: &str = "DDPROF_CACHE_SETTING";
pub const LD_PRELOAD_ENV: &str = "LD_PRELOAD";

fn parse_bool(
    value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Socket path the in-process library connects to for its settings.
pub fn lib_socket() -> Option<String> {
    env::var(LIB_SOCKET_ENV).ok().filter(|value| !value.is_empty())
}

pub fn auto_start() -> bool {
    env::var(AUTO_START_ENV)
        .ok()
        .and_then(|value| parse_bool(&value))
        .unwrap_or(false)
}

/// Whether allocation tracking survives exec in children.
pub fn allocation_follow_execs() -> bool {
    env::var(FOLLOW_EXECS_ENV)
        .ok()
        .and_then(|value| parse_bool(&value))
        .unwrap_or(true)
}

pub fn cache_setting() -> CacheSetting {
    match env::var(CACHE_SETTING_ENV) {
        Ok(value) if value == "VALIDATE" => CacheSetting::Validate,
        Ok(value) => {
            warn!(
                "ignoring {} value {}",
                CACHE_SETTING_ENV, value);
            CacheSetting::On
        },
        Err(_) => CacheSetting::On,
    }
}

/// Detects preloaded mode: the profiling library was injected through
/// the dynamic loader rather than attached at runtime.
pub fn is_preloaded() -> bool {
    env::var(LD_PRELOAD_ENV)
        .map(|value| value.contains("profiling"))
        .unwrap_or(false)
}
