//! Configuration template engine powered by minijinja.
//!
//! Templates render device configuration from a restricted function set;
//! anything that could touch the host (files, network, env, processes) is
//! simply not registered, and unknown callables fail validation before
//! execution. Inheritance is a parent chain resolved leaf→root with cycle
//! detection; variable defaults merge deepest-first.
//!
//! Compiled templates are cached by `(id, content-hash)`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use minijinja::value::{Rest, Value};
use minijinja::Environment;
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::{ConfigTemplate, Device};
use crate::store::SharedStore;

/// Inheritance chains longer than this are treated as cycles.
pub const MAX_CHAIN_DEPTH: usize = 8;

const TEMPLATE_NAME: &str = "body";

/// Filters callable inside templates, beyond minijinja's pure builtins.
const ALLOWED_FILTERS: &[&str] = &[
    // string manipulation
    "upper", "lower", "title", "capitalize", "trim", "replace", "split", "join", "truncate",
    "length", "first", "last", "reverse", "indent", "urlencode",
    // math
    "abs", "round", "int", "float", "min", "max", "sum",
    // structure
    "default", "tojson", "items", "list", "sort", "unique", "batch", "slice", "map",
    "select", "reject", "attr", "bool", "string",
    // custom
    "regex_match", "date",
];

/// Global functions callable inside templates.
const ALLOWED_FUNCTIONS: &[&str] = &["now", "coalesce", "range", "namespace", "dict"];

fn content_hash(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

// ── Sandboxed environment ───────────────────────────────

fn filter_regex_match(value: Value, pattern: String) -> std::result::Result<bool, minijinja::Error> {
    let re = regex::Regex::new(&pattern).map_err(|e| {
        minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, format!("bad regex: {}", e))
    })?;
    Ok(re.is_match(&value.to_string()))
}

/// Format an RFC 3339 timestamp string with a chrono format string.
fn filter_date(value: Value, format: Option<String>) -> Value {
    let raw = value.to_string();
    let format = format.unwrap_or_else(|| "%Y-%m-%d %H:%M:%S".to_string());
    match chrono::DateTime::parse_from_rfc3339(&raw) {
        Ok(dt) => Value::from(dt.format(&format).to_string()),
        Err(_) => value,
    }
}

fn fn_now(format: Option<String>) -> Value {
    let now = chrono::Utc::now();
    match format {
        Some(f) => Value::from(now.format(&f).to_string()),
        None => Value::from(now.to_rfc3339()),
    }
}

/// First non-none, non-undefined argument.
fn fn_coalesce(args: Rest<Value>) -> Value {
    args.iter()
        .find(|v| !v.is_none() && !v.is_undefined())
        .cloned()
        .unwrap_or(Value::from(()))
}

fn build_env(body: String) -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_filter("regex_match", filter_regex_match);
    env.add_filter("date", filter_date);
    env.add_function("now", fn_now);
    env.add_function("coalesce", fn_coalesce);
    env.add_template_owned(TEMPLATE_NAME.to_string(), body)
        .map_err(|e| Error::Template(format!("template parse error: {}", e)))?;
    Ok(env)
}

// ── Pre-execution validation ────────────────────────────

/// Reject templates that call anything outside the whitelist. Filters are
/// identifiers after `|`; functions are identifiers followed by `(` that
/// are not method calls. Runs before any render.
pub fn validate_body(body: &str) -> Result<()> {
    // Syntax first.
    Environment::new()
        .template_from_str(body)
        .map_err(|e| Error::Template(format!("template parse error: {}", e)))?;

    for block in expression_blocks(body) {
        let bytes = block.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i] as char;
            // String literals are opaque.
            if c == '\'' || c == '"' {
                i += 1;
                while i < bytes.len() && bytes[i] as char != c {
                    i += 1;
                }
                i += 1;
                continue;
            }
            if c == '|' {
                let start = skip_spaces(block, i + 1);
                let name = read_identifier(block, start);
                if !name.is_empty()
                    && !ALLOWED_FILTERS.contains(&name)
                    && !is_builtin_keyword(name)
                {
                    return Err(Error::Template(format!("filter '{}' is not allowed", name)));
                }
                i = start + name.len().max(1);
                continue;
            }
            if c.is_ascii_alphabetic() || c == '_' {
                let name = read_identifier(block, i);
                let after = skip_spaces(block, i + name.len());
                let preceded_by_dot = i > 0 && bytes[i - 1] as char == '.';
                if !preceded_by_dot
                    && block[after..].starts_with('(')
                    && !ALLOWED_FUNCTIONS.contains(&name)
                    && !is_builtin_keyword(name)
                {
                    return Err(Error::Template(format!("function '{}' is not allowed", name)));
                }
                i += name.len().max(1);
                continue;
            }
            i += 1;
        }
    }
    Ok(())
}

fn is_builtin_keyword(name: &str) -> bool {
    matches!(
        name,
        "if" | "else" | "elif" | "endif" | "for" | "endfor" | "in" | "set" | "endset" | "not"
            | "and" | "or" | "is" | "true" | "false" | "none" | "loop" | "with" | "endwith"
            | "filter" | "endfilter" | "macro" | "endmacro"
    )
}

fn skip_spaces(s: &str, mut i: usize) -> usize {
    let bytes = s.as_bytes();
    while i < bytes.len() && (bytes[i] as char).is_whitespace() {
        i += 1;
    }
    i
}

fn read_identifier(s: &str, start: usize) -> &str {
    let bytes = s.as_bytes();
    let mut end = start;
    while end < bytes.len() {
        let c = bytes[end] as char;
        if c.is_ascii_alphanumeric() || c == '_' {
            end += 1;
        } else {
            break;
        }
    }
    &s[start..end]
}

/// Contents of `{{ ... }}` and `{% ... %}` blocks.
fn expression_blocks(body: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    for (open, close) in [("{{", "}}"), ("{%", "%}")] {
        let mut rest = body;
        while let Some(start) = rest.find(open) {
            let after = &rest[start + 2..];
            match after.find(close) {
                Some(end) => {
                    blocks.push(&after[..end]);
                    rest = &after[end + 2..];
                }
                None => break,
            }
        }
    }
    blocks
}

// ── Inheritance ─────────────────────────────────────────

/// Materialize the parent chain leaf→root. Revisiting an id or exceeding
/// the depth bound is a cycle.
pub fn resolve_chain(store: &SharedStore, template_id: i64) -> Result<Vec<ConfigTemplate>> {
    let mut chain = Vec::new();
    let mut visited: HashSet<i64> = HashSet::new();
    let mut cursor = Some(template_id);

    while let Some(id) = cursor {
        if !visited.insert(id) {
            return Err(Error::TemplateCycle(id));
        }
        if chain.len() >= MAX_CHAIN_DEPTH {
            return Err(Error::TemplateCycle(id));
        }
        let template = store.get_template(id)?;
        cursor = template.parent_id;
        chain.push(template);
    }
    Ok(chain)
}

/// Merge variable defaults deepest-first: the root contributes first and
/// every descendant overrides it.
pub fn merged_variables(chain: &[ConfigTemplate]) -> serde_json::Map<String, Json> {
    let mut merged = serde_json::Map::new();
    for template in chain.iter().rev() {
        for (key, value) in &template.variables {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// The body that renders: the leaf's, or the nearest ancestor's when the
/// leaf is empty.
pub fn effective_body(chain: &[ConfigTemplate]) -> &str {
    chain
        .iter()
        .map(|t| t.body.as_str())
        .find(|b| !b.trim().is_empty())
        .unwrap_or("")
}

// ── Engine ──────────────────────────────────────────────

struct CachedTemplate {
    hash: String,
    env: Arc<Environment<'static>>,
}

pub struct TemplateEngine {
    cache: RwLock<HashMap<i64, CachedTemplate>>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self { cache: RwLock::new(HashMap::new()) }
    }

    fn compiled(&self, template_id: i64, body: &str) -> Result<Arc<Environment<'static>>> {
        let hash = content_hash(body);
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(&template_id) {
                if cached.hash == hash {
                    return Ok(cached.env.clone());
                }
            }
        }

        validate_body(body)?;
        let env = Arc::new(build_env(body.to_string())?);
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(template_id, CachedTemplate { hash, env: env.clone() });
        Ok(env)
    }

    /// Render a stored template with its inheritance chain applied.
    /// Supplied vars override inherited defaults.
    pub fn render(
        &self,
        store: &SharedStore,
        template_id: i64,
        vars: &serde_json::Map<String, Json>,
    ) -> Result<String> {
        let chain = resolve_chain(store, template_id)?;
        let mut context = merged_variables(&chain);
        for (key, value) in vars {
            context.insert(key.clone(), value.clone());
        }

        let body = effective_body(&chain);
        let env = self.compiled(template_id, body)?;
        let tmpl = env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| Error::Template(format!("template lookup failed: {}", e)))?;
        tmpl.render(Value::from_serialize(&context))
            .map_err(|e| Error::Template(format!("template render error: {}", e)))
    }

    /// Render for a device: the context carries the device record and its
    /// overrides on top of the chain's defaults.
    pub fn render_for_device(
        &self,
        store: &SharedStore,
        template_id: i64,
        device: &Device,
    ) -> Result<String> {
        let mut vars = serde_json::Map::new();
        vars.insert("device".to_string(), serde_json::to_value(device)?);
        if let Some(Json::Object(overrides)) = &device.overrides {
            for (key, value) in overrides {
                vars.insert(key.clone(), value.clone());
            }
        }
        self.render(store, template_id, &vars)
    }

    /// One-off render with no store-backed inheritance or cache.
    pub fn render_body(body: &str, vars: &serde_json::Map<String, Json>) -> Result<String> {
        validate_body(body)?;
        let env = build_env(body.to_string())?;
        let tmpl = env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| Error::Template(format!("template lookup failed: {}", e)))?;
        tmpl.render(Value::from_serialize(vars))
            .map_err(|e| Error::Template(format!("template render error: {}", e)))
    }

    #[cfg(test)]
    fn cached_env_ptr(&self, template_id: i64) -> Option<usize> {
        let cache = self.cache.read().unwrap();
        cache.get(&template_id).map(|c| Arc::as_ptr(&c.env) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Provider;
    use crate::store::SqliteProvider;
    use chrono::Utc;

    fn store_with_templates(templates: Vec<ConfigTemplate>) -> SharedStore {
        let provider = SqliteProvider::open_in_memory().unwrap();
        provider.migrate().unwrap();
        let store: SharedStore = Arc::new(provider);
        for template in templates {
            store.insert_template(&template).unwrap();
        }
        store
    }

    fn template(name: &str, parent_id: Option<i64>, body: &str, vars: Json) -> ConfigTemplate {
        ConfigTemplate {
            id: 0,
            name: name.to_string(),
            description: String::new(),
            device_type: String::new(),
            generation: None,
            parent_id,
            variables: vars.as_object().cloned().unwrap_or_default(),
            body: body.to_string(),
            is_default: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let store = store_with_templates(vec![template(
            "wifi",
            None,
            r#"{"wifi":{"ssid":"{{ ssid }}"}}"#,
            serde_json::json!({"ssid": "lab"}),
        )]);
        let engine = TemplateEngine::new();
        let first = engine.render(&store, 1, &serde_json::Map::new()).unwrap();
        let second = engine.render(&store, 1, &serde_json::Map::new()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, r#"{"wifi":{"ssid":"lab"}}"#);
    }

    #[test]
    fn test_supplied_vars_override_defaults() {
        let store = store_with_templates(vec![template(
            "wifi",
            None,
            "{{ ssid }}",
            serde_json::json!({"ssid": "default"}),
        )]);
        let engine = TemplateEngine::new();
        let mut vars = serde_json::Map::new();
        vars.insert("ssid".into(), serde_json::json!("override"));
        assert_eq!(engine.render(&store, 1, &vars).unwrap(), "override");
    }

    #[test]
    fn test_inheritance_merges_deepest_first() {
        let store = store_with_templates(vec![
            template("root", None, "{{ a }}-{{ b }}", serde_json::json!({"a": "ra", "b": "rb"})),
            template("leaf", Some(1), "", serde_json::json!({"b": "lb"})),
        ]);
        let engine = TemplateEngine::new();
        // Leaf body is empty, so the root body renders with leaf overrides.
        assert_eq!(engine.render(&store, 2, &serde_json::Map::new()).unwrap(), "ra-lb");
    }

    #[test]
    fn test_cycle_detection() {
        let store = store_with_templates(vec![
            template("a", None, "x", serde_json::json!({})),
            template("b", Some(1), "y", serde_json::json!({})),
        ]);
        // Point a's parent at b to close the loop.
        let mut a = store.get_template(1).unwrap();
        a.parent_id = Some(2);
        store.update_template(&a).unwrap();

        let err = resolve_chain(&store, 1).unwrap_err();
        assert!(matches!(err, Error::TemplateCycle(_)));
    }

    #[test]
    fn test_unknown_function_fails_validation() {
        let err = validate_body("{{ read_file('/etc/passwd') }}").unwrap_err();
        assert!(matches!(err, Error::Template(_)));
        assert!(err.to_string().contains("read_file"));
    }

    #[test]
    fn test_unknown_filter_fails_validation() {
        let err = validate_body("{{ name | shell }}").unwrap_err();
        assert!(err.to_string().contains("shell"));
    }

    #[test]
    fn test_whitelisted_functions_pass() {
        validate_body("{{ now('%Y') }} {{ coalesce(a, b, 'x') }}").unwrap();
        validate_body("{{ name | upper | trim }} {{ n | round(2) }}").unwrap();
        validate_body("{% for x in items %}{{ x | default('-') }}{% endfor %}").unwrap();
    }

    #[test]
    fn test_method_calls_are_not_flagged() {
        // `.split(...)` is a method on the value, not a global function.
        validate_body("{{ name.split('-') | first }}").unwrap();
    }

    #[test]
    fn test_regex_match_filter() {
        let mut vars = serde_json::Map::new();
        vars.insert("mac".into(), serde_json::json!("AABBCC"));
        let out =
            TemplateEngine::render_body(r#"{{ mac | regex_match('^[A-F0-9]+$') }}"#, &vars).unwrap();
        assert_eq!(out, "true");
    }

    #[test]
    fn test_compile_cache_reused_until_content_changes() {
        let store = store_with_templates(vec![template("t", None, "{{ 1 }}", serde_json::json!({}))]);
        let engine = TemplateEngine::new();
        engine.render(&store, 1, &serde_json::Map::new()).unwrap();
        let first_ptr = engine.cached_env_ptr(1).unwrap();
        engine.render(&store, 1, &serde_json::Map::new()).unwrap();
        assert_eq!(engine.cached_env_ptr(1).unwrap(), first_ptr);

        let mut t = store.get_template(1).unwrap();
        t.body = "{{ 2 }}".into();
        store.update_template(&t).unwrap();
        assert_eq!(engine.render(&store, 1, &serde_json::Map::new()).unwrap(), "2");
        assert_ne!(engine.cached_env_ptr(1).unwrap(), first_ptr);
    }

    #[test]
    fn test_render_for_device_exposes_device_and_overrides() {
        let store = store_with_templates(vec![template(
            "named",
            None,
            r#"{"name":"{{ device.name }}","zone":"{{ zone }}"}"#,
            serde_json::json!({"zone": "default"}),
        )]);
        let device = Device {
            id: 1,
            mac: "AA".into(),
            ip: "10.0.0.1".into(),
            device_type: "SHSW-1".into(),
            name: "Living".into(),
            firmware: String::new(),
            status: crate::model::DeviceStatus::Online,
            last_seen: Utc::now(),
            settings: None,
            desired_config: None,
            applied: false,
            overrides: Some(serde_json::json!({"zone": "upstairs"})),
            template_ids: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let engine = TemplateEngine::new();
        let out = engine.render_for_device(&store, 1, &device).unwrap();
        assert_eq!(out, r#"{"name":"Living","zone":"upstairs"}"#);
    }
}
