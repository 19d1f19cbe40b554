//! WebAssembly bindings for DataSaver
//!
//! Settings, rules and statistics cross the boundary as JSON strings in the
//! same shape the settings store holds them.

use std::sync::OnceLock;

use ds_core::config::{CollectorConfig, DEFAULT_RETENTION_DAYS};
use ds_core::settings::{CompressionEndpoint, CompressionMode};
use ds_core::{Origin, Statistics};
use ds_rules::builder::site_block_ids;
use ds_rules::redirect::{endpoint_template, proxy_template};
use ds_rules::{default_rules, ScopeSettings};
use ds_telemetry::{BandwidthCollector, NetworkObservation, PerformanceObservation};
use wasm_bindgen::prelude::*;

static COLLECTOR: OnceLock<BandwidthCollector> = OnceLock::new();

fn js_error(context: &str, e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&format!("{context}: {e}"))
}

// =============================================================================
// Rules
// =============================================================================

#[wasm_bindgen]
pub fn derive_rule_ids(origin: &str, count: u32) -> Vec<u32> {
    ds_core::derive_rule_ids(origin, count as usize)
}

#[wasm_bindgen]
pub fn site_block_rule_ids(origin: &str) -> Result<Vec<u32>, JsValue> {
    let origin = Origin::parse(origin).ok_or_else(|| JsValue::from_str("Invalid origin"))?;
    Ok(site_block_ids(&origin))
}

#[wasm_bindgen]
pub fn compile_default_rules(settings_json: &str, excluded_json: &str) -> Result<String, JsValue> {
    compile_rules_json(settings_json, excluded_json).map_err(|e| js_error("Failed to compile rules", e))
}

fn compile_rules_json(settings_json: &str, excluded_json: &str) -> Result<String, serde_json::Error> {
    let settings: ScopeSettings = serde_json::from_str(settings_json)?;
    let excluded: Vec<String> = serde_json::from_str(excluded_json)?;
    serde_json::to_string(&default_rules(&settings, excluded))
}

/// Concrete compression target for `url` under `settings_json`, or undefined
/// when the URL would not be redirected.
#[wasm_bindgen]
pub fn redirect_target(settings_json: &str, url: &str) -> Result<Option<String>, JsValue> {
    let settings: ScopeSettings =
        serde_json::from_str(settings_json).map_err(|e| js_error("Invalid settings", e))?;
    Ok(redirect_target_for(&settings, url))
}

fn redirect_target_for(settings: &ScopeSettings, url: &str) -> Option<String> {
    if !settings.general.enabled || !settings.general.compression {
        return None;
    }
    let template = match settings.compression.mode {
        CompressionMode::Simple => endpoint_template(settings.compression.preferred_endpoint, &settings.compression),
        CompressionMode::Proxy => proxy_template(&settings.proxy, &settings.compression),
        CompressionMode::WebRequest => return None,
    };
    template.render_for(url)
}

// =============================================================================
// Telemetry
// =============================================================================

#[wasm_bindgen]
pub fn record_observation(
    global_json: &str,
    site_json: Option<String>,
    observation_json: &str,
    now_ms: f64,
) -> Result<JsValue, JsValue> {
    let (global, site) = record_observation_json(global_json, site_json.as_deref(), observation_json, now_ms as u64)
        .map_err(|e| js_error("Failed to record observation", e))?;

    let result = js_sys::Object::new();
    let _ = js_sys::Reflect::set(&result, &"global".into(), &JsValue::from_str(&global));
    if let Some(site) = site {
        let _ = js_sys::Reflect::set(&result, &"site".into(), &JsValue::from_str(&site));
    }
    Ok(result.into())
}

fn record_observation_json(
    global_json: &str,
    site_json: Option<&str>,
    observation_json: &str,
    now_ms: u64,
) -> Result<(String, Option<String>), serde_json::Error> {
    let mut global: Statistics = serde_json::from_str(global_json)?;
    let mut site: Option<Statistics> = site_json.map(serde_json::from_str).transpose()?;
    let observation = serde_json::from_str(observation_json)?;
    let endpoints = CompressionEndpoint::ALL.iter().map(|e| e.origin()).collect();

    ds_telemetry::record_observation(
        &observation,
        &mut global,
        site.as_mut(),
        now_ms,
        DEFAULT_RETENTION_DAYS,
        &endpoints,
    );

    let site = site.map(|s| serde_json::to_string(&s)).transpose()?;
    Ok((serde_json::to_string(&global)?, site))
}

#[wasm_bindgen]
pub fn init_collector(config_json: Option<String>) -> Result<(), JsValue> {
    if COLLECTOR.get().is_some() {
        return Err(JsValue::from_str("Collector already initialized."));
    }
    let config: CollectorConfig = match config_json {
        Some(json) => serde_json::from_str(&json).map_err(|e| js_error("Invalid collector config", e))?,
        None => CollectorConfig::default(),
    };
    COLLECTOR
        .set(BandwidthCollector::new(config))
        .map_err(|_| JsValue::from_str("Failed to set collector state"))
}

fn collector() -> Option<&'static BandwidthCollector> {
    let collector = COLLECTOR.get();
    if collector.is_none() {
        web_sys::console::warn_1(&"DataSaver collector used before init_collector".into());
    }
    collector
}

#[wasm_bindgen]
pub fn observe_performance(observation_json: &str, now_ms: f64) -> Result<(), JsValue> {
    let observation: PerformanceObservation =
        serde_json::from_str(observation_json).map_err(|e| js_error("Invalid observation", e))?;
    if let Some(collector) = collector() {
        collector.observe_performance(observation, now_ms as u64);
    }
    Ok(())
}

#[wasm_bindgen]
pub fn observe_network(observation_json: &str, now_ms: f64) -> Result<(), JsValue> {
    let observation: NetworkObservation =
        serde_json::from_str(observation_json).map_err(|e| js_error("Invalid observation", e))?;
    if let Some(collector) = collector() {
        collector.observe_network(observation, now_ms as u64);
    }
    Ok(())
}

/// Settled observations as a JSON array.
#[wasm_bindgen]
pub fn flush_due(now_ms: f64) -> Result<String, JsValue> {
    let flushed = collector().map(|c| c.flush_due(now_ms as u64)).unwrap_or_default();
    serde_json::to_string(&flushed).map_err(|e| js_error("Failed to serialize observations", e))
}
