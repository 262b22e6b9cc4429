//! # Secret Materialization Engine
//!
//! Pure transform from a SyncedSecret spec to the flat key/byte-value map of
//! the generated Secret.
//!
//! Resolution is atomic: downstream consumers treat the native Secret as
//! valid as a whole, so any failing source aborts the entire pass and nothing
//! partial is ever returned. The credential role is fixed once per pass by
//! the caller and used for every fetch, including fetches issued from inside
//! templates.
//!
//! Templates use the handlebars dialect with no HTML escaping. The render
//! environment exposes:
//!
//! - `getSecretValue <id>` - raw value of a secret
//! - `getSecretValueMap <id>` - value parsed as a JSON object
//! - `filterByTagKey <tag>` - catalog restricted to entries carrying a tag
//! - `base64 <value>` / `indent <width> <value>` - formatting helpers
//! - `secrets` - the full catalog as context data
//!
//! Handlebars helpers are synchronous, so rendering runs on a blocking thread
//! and bridges to the async fetcher through a captured runtime handle.

use crate::crd::{DataFrom, FieldSource, SecretField, SyncedSecretSpec, ValueFrom};
use crate::error::SyncError;
use crate::poller::{filter_by_tag_key, Catalog};
use anyhow::anyhow;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use handlebars::{
    Context as TemplateContext, Handlebars, Helper, HelperDef, RenderContext, RenderError,
    RenderErrorReason, ScopedJson,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Value-fetch capability the engine resolves references through.
///
/// Implemented by the poller; tests substitute an in-memory map.
#[async_trait]
pub trait SecretFetcher: Send + Sync {
    /// Returns (value, version id) of a secret under a credential role
    async fn fetch(&self, secret_id: &str, role: &str) -> Result<(String, String), SyncError>;
}

#[async_trait]
impl SecretFetcher for crate::poller::Poller {
    async fn fetch(&self, secret_id: &str, role: &str) -> Result<(String, String), SyncError> {
        self.get_secret(secret_id, role).await
    }
}

/// Resolves the spec into the data map of the generated Secret
pub async fn render_data(
    spec: &SyncedSecretSpec,
    role: &str,
    catalog: Arc<Catalog>,
    fetcher: Arc<dyn SecretFetcher>,
) -> Result<BTreeMap<String, Vec<u8>>, SyncError> {
    let mut data = BTreeMap::new();

    if let Some(DataFrom { secret_ref }) = &spec.data_from {
        let (raw, _) = fetcher.fetch(&secret_ref.name, role).await?;
        let object = parse_json_object(&secret_ref.name, &raw)?;
        for (key, value) in object {
            data.insert(key, stringify(&value).into_bytes());
        }
    }

    if let Some(fields) = &spec.data {
        for field in fields {
            let bytes = resolve_field(field, role, &catalog, &fetcher).await?;
            data.insert(field.name.clone(), bytes);
        }
    }

    Ok(data)
}

async fn resolve_field(
    field: &SecretField,
    role: &str,
    catalog: &Arc<Catalog>,
    fetcher: &Arc<dyn SecretFetcher>,
) -> Result<Vec<u8>, SyncError> {
    match &field.source {
        FieldSource::Value { value } => Ok(value.clone().into_bytes()),
        FieldSource::From { value_from } => match value_from {
            ValueFrom::SecretRef { secret_ref } => {
                let (raw, _) = fetcher.fetch(&secret_ref.name, role).await?;
                Ok(raw.into_bytes())
            }
            ValueFrom::SecretKeyRef { secret_key_ref } => {
                let (raw, _) = fetcher.fetch(&secret_key_ref.name, role).await?;
                let object = parse_json_object(&secret_key_ref.name, &raw)?;
                let value = object.get(&secret_key_ref.key).ok_or_else(|| {
                    SyncError::malformed(
                        &secret_key_ref.name,
                        format!("key {} not found", secret_key_ref.key),
                    )
                })?;
                Ok(stringify(value).into_bytes())
            }
            ValueFrom::Template { template } => {
                let rt = tokio::runtime::Handle::current();
                let field_name = field.name.clone();
                let body = template.clone();
                let role = role.to_string();
                let catalog = Arc::clone(catalog);
                let fetcher = Arc::clone(fetcher);
                let rendered = tokio::task::spawn_blocking(move || {
                    render_template(&field_name, &body, &role, &catalog, &fetcher, &rt)
                })
                .await
                .map_err(|e| SyncError::TemplateError {
                    field: field.name.clone(),
                    source: anyhow!("template render task failed: {e}"),
                })??;
                Ok(rendered.into_bytes())
            }
        },
    }
}

fn render_template(
    field: &str,
    body: &str,
    role: &str,
    catalog: &Arc<Catalog>,
    fetcher: &Arc<dyn SecretFetcher>,
    rt: &tokio::runtime::Handle,
) -> Result<String, SyncError> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    registry.register_helper(
        "getSecretValue",
        Box::new(GetSecretValue {
            fetcher: Arc::clone(fetcher),
            role: role.to_string(),
            rt: rt.clone(),
        }),
    );
    registry.register_helper(
        "getSecretValueMap",
        Box::new(GetSecretValueMap {
            fetcher: Arc::clone(fetcher),
            role: role.to_string(),
            rt: rt.clone(),
        }),
    );
    registry.register_helper(
        "filterByTagKey",
        Box::new(FilterByTagKey {
            catalog: Arc::clone(catalog),
        }),
    );
    registry.register_helper("base64", Box::new(Base64Helper));
    registry.register_helper("indent", Box::new(IndentHelper));

    let context = serde_json::json!({ "secrets": catalog_to_json(catalog) });
    registry
        .render_template(body, &context)
        .map_err(|e| SyncError::TemplateError {
            field: field.to_string(),
            source: anyhow!(e),
        })
}

/// The catalog as template context data: id to tags and current version
fn catalog_to_json(catalog: &Catalog) -> Value {
    let mut object = serde_json::Map::with_capacity(catalog.len());
    for (name, meta) in catalog {
        object.insert(
            name.clone(),
            serde_json::json!({
                "tags": meta.tags,
                "currentVersionId": meta.current_version_id,
            }),
        );
    }
    Value::Object(object)
}

fn parse_json_object(
    secret_id: &str,
    raw: &str,
) -> Result<serde_json::Map<String, Value>, SyncError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| SyncError::malformed(secret_id, "not valid JSON"))?;
    match value {
        Value::Object(object) => Ok(object),
        _ => Err(SyncError::malformed(secret_id, "not a JSON object")),
    }
}

/// Renders a JSON value the way it reads in the secret: strings unquoted,
/// everything else as compact JSON
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn param_string(h: &Helper<'_>, idx: usize, helper: &'static str) -> Result<String, RenderError> {
    h.param(idx)
        .and_then(|p| p.value().as_str().map(str::to_owned))
        .ok_or_else(|| RenderErrorReason::ParamNotFoundForIndex(helper, idx).into())
}

struct GetSecretValue {
    fetcher: Arc<dyn SecretFetcher>,
    role: String,
    rt: tokio::runtime::Handle,
}

impl HelperDef for GetSecretValue {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc TemplateContext,
        _rc: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let secret_id = param_string(h, 0, "getSecretValue")?;
        let (value, _) = self
            .rt
            .block_on(self.fetcher.fetch(&secret_id, &self.role))
            .map_err(|e| {
                RenderErrorReason::Other(format!(
                    "failed retrieving value for secret {secret_id}: {e}"
                ))
            })?;
        Ok(ScopedJson::Derived(Value::String(value)))
    }
}

struct GetSecretValueMap {
    fetcher: Arc<dyn SecretFetcher>,
    role: String,
    rt: tokio::runtime::Handle,
}

impl HelperDef for GetSecretValueMap {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc TemplateContext,
        _rc: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let secret_id = param_string(h, 0, "getSecretValueMap")?;
        let (value, _) = self
            .rt
            .block_on(self.fetcher.fetch(&secret_id, &self.role))
            .map_err(|e| {
                RenderErrorReason::Other(format!(
                    "failed retrieving value for secret {secret_id}: {e}"
                ))
            })?;
        let object: Value = serde_json::from_str(&value).map_err(|_| {
            RenderErrorReason::Other(format!("secret {secret_id} does not contain valid JSON"))
        })?;
        Ok(ScopedJson::Derived(object))
    }
}

struct FilterByTagKey {
    catalog: Arc<Catalog>,
}

impl HelperDef for FilterByTagKey {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc TemplateContext,
        _rc: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let tag_key = param_string(h, 0, "filterByTagKey")?;
        let filtered = filter_by_tag_key(&self.catalog, &tag_key);
        Ok(ScopedJson::Derived(catalog_to_json(&filtered)))
    }
}

struct Base64Helper;

impl HelperDef for Base64Helper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc TemplateContext,
        _rc: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let value = h
            .param(0)
            .map(|p| stringify(p.value()))
            .ok_or_else(|| RenderErrorReason::ParamNotFoundForIndex("base64", 0))?;
        Ok(ScopedJson::Derived(Value::String(
            BASE64.encode(value.as_bytes()),
        )))
    }
}

struct IndentHelper;

impl HelperDef for IndentHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _r: &'reg Handlebars<'reg>,
        _ctx: &'rc TemplateContext,
        _rc: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let width = h
            .param(0)
            .and_then(|p| p.value().as_u64())
            .ok_or_else(|| RenderErrorReason::ParamNotFoundForIndex("indent", 0))?;
        let text = h
            .param(1)
            .map(|p| stringify(p.value()))
            .ok_or_else(|| RenderErrorReason::ParamNotFoundForIndex("indent", 1))?;

        let prefix = " ".repeat(usize::try_from(width).unwrap_or(0));
        let indented = text
            .split('\n')
            .map(|line| format!("{prefix}{line}"))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ScopedJson::Derived(Value::String(indented)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::RemoteSecretMeta;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MapFetcher {
        values: HashMap<String, String>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl MapFetcher {
        fn new(pairs: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                values: pairs
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SecretFetcher for MapFetcher {
        async fn fetch(&self, secret_id: &str, role: &str) -> Result<(String, String), SyncError> {
            self.calls
                .lock()
                .expect("calls")
                .push((secret_id.to_string(), role.to_string()));
            self.values
                .get(secret_id)
                .map(|v| (v.clone(), "v1".to_string()))
                .ok_or_else(|| SyncError::RemoteFetchFailed {
                    secret_id: secret_id.to_string(),
                    source: anyhow!("no such secret"),
                })
        }
    }

    fn spec(value: serde_json::Value) -> SyncedSecretSpec {
        serde_json::from_value(value).expect("spec deserializes")
    }

    fn empty_catalog() -> Arc<Catalog> {
        Arc::new(Catalog::new())
    }

    fn tagged_catalog() -> Arc<Catalog> {
        let mut catalog = Catalog::new();
        for (name, host, user, tagged) in [
            ("db-one", "db1.internal", "alice", true),
            ("db-two", "db2.internal", "bob", true),
            ("other", "x", "y", false),
        ] {
            let mut tags = BTreeMap::from([
                ("host".to_string(), host.to_string()),
                ("user".to_string(), user.to_string()),
            ]);
            if tagged {
                tags.insert("group1".to_string(), String::new());
            }
            catalog.insert(
                name.to_string(),
                RemoteSecretMeta {
                    tags,
                    current_version_id: "v1".to_string(),
                    last_changed: None,
                },
            );
        }
        Arc::new(catalog)
    }

    fn as_str(data: &BTreeMap<String, Vec<u8>>, key: &str) -> String {
        String::from_utf8(data.get(key).expect("field present").clone()).expect("utf8")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn whole_secret_copy_round_trips() {
        let fetcher = MapFetcher::new(&[("app/all", r#"{"a":"1","b":"2"}"#)]);
        let spec = spec(serde_json::json!({
            "dataFrom": {"secretRef": {"name": "app/all"}}
        }));

        let data = render_data(&spec, "", empty_catalog(), fetcher)
            .await
            .expect("renders");
        assert_eq!(data.len(), 2);
        assert_eq!(as_str(&data, "a"), "1");
        assert_eq!(as_str(&data, "b"), "2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn whole_secret_copy_rejects_non_json() {
        let fetcher = MapFetcher::new(&[("app/all", "not-json")]);
        let spec = spec(serde_json::json!({
            "dataFrom": {"secretRef": {"name": "app/all"}}
        }));

        let err = render_data(&spec, "", empty_catalog(), fetcher)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SyncError::MalformedSecretValue { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn literal_raw_and_key_extraction_fields() {
        let fetcher = MapFetcher::new(&[
            ("db/creds", r#"{"user":"alice","password":"hunter2"}"#),
            ("raw/blob", "anything at all"),
        ]);
        let spec = spec(serde_json::json!({
            "data": [
                {"name": "endpoint", "value": "db.internal:5432"},
                {"name": "blob", "valueFrom": {"secretRef": {"name": "raw/blob"}}},
                {"name": "password", "valueFrom": {"secretKeyRef": {"name": "db/creds", "key": "password"}}},
            ]
        }));

        let data = render_data(&spec, "reader", empty_catalog(), Arc::clone(&fetcher) as Arc<dyn SecretFetcher>)
            .await
            .expect("renders");
        assert_eq!(as_str(&data, "endpoint"), "db.internal:5432");
        assert_eq!(as_str(&data, "blob"), "anything at all");
        assert_eq!(as_str(&data, "password"), "hunter2");

        // Every fetch in the pass used the caller's fixed role.
        let calls = fetcher.calls.lock().expect("calls");
        assert!(calls.iter().all(|(_, role)| role == "reader"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_key_aborts_resolution() {
        let fetcher = MapFetcher::new(&[("db/creds", r#"{"user":"alice"}"#)]);
        let spec = spec(serde_json::json!({
            "data": [
                {"name": "ok", "value": "fine"},
                {"name": "password", "valueFrom": {"secretKeyRef": {"name": "db/creds", "key": "password"}}},
            ]
        }));

        let err = render_data(&spec, "", empty_catalog(), fetcher)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SyncError::MalformedSecretValue { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_failure_aborts_resolution() {
        let fetcher = MapFetcher::new(&[]);
        let spec = spec(serde_json::json!({
            "data": [
                {"name": "missing", "valueFrom": {"secretRef": {"name": "ghost"}}},
            ]
        }));

        let err = render_data(&spec, "", empty_catalog(), fetcher)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SyncError::RemoteFetchFailed { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn template_reads_secret_value_map() {
        let fetcher = MapFetcher::new(&[("s1", r#"{"k":"v"}"#)]);
        let spec = spec(serde_json::json!({
            "data": [
                {"name": "out", "valueFrom": {"template": "{{#with (getSecretValueMap \"s1\")}}{{k}}{{/with}}"}},
            ]
        }));

        let data = render_data(&spec, "", empty_catalog(), fetcher)
            .await
            .expect("renders");
        assert_eq!(as_str(&data, "out"), "v");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn template_formatting_helpers() {
        let fetcher = MapFetcher::new(&[("s1", "payload")]);
        let spec = spec(serde_json::json!({
            "data": [
                {"name": "b64", "valueFrom": {"template": "{{base64 (getSecretValue \"s1\")}}"}},
                {"name": "indented", "valueFrom": {"template": "{{indent 2 \"a\nb\"}}"}},
            ]
        }));

        let data = render_data(&spec, "", empty_catalog(), fetcher)
            .await
            .expect("renders");
        assert_eq!(as_str(&data, "b64"), "cGF5bG9hZA==");
        assert_eq!(as_str(&data, "indented"), "  a\n  b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn template_iterates_filtered_catalog() {
        let fetcher = MapFetcher::new(&[]);
        let spec = spec(serde_json::json!({
            "data": [
                {"name": "hosts", "valueFrom": {"template":
                    "{{#each (filterByTagKey \"group1\")}}host={{this.tags.host}} user={{this.tags.user}}\n{{/each}}"}},
            ]
        }));

        let data = render_data(&spec, "", tagged_catalog(), fetcher)
            .await
            .expect("renders");
        let mut lines: Vec<&str> = data
            .get("hosts")
            .map(|b| std::str::from_utf8(b).expect("utf8"))
            .expect("field present")
            .lines()
            .collect();
        lines.sort_unstable();
        // Exactly one line per tagged entry, whatever the iteration order.
        assert_eq!(
            lines,
            vec!["host=db1.internal user=alice", "host=db2.internal user=bob"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn template_errors_wrap_the_cause() {
        let fetcher = MapFetcher::new(&[("s1", "not-json")]);

        let bad_syntax = spec(serde_json::json!({
            "data": [{"name": "out", "valueFrom": {"template": "{{#each}}"}}]
        }));
        let err = render_data(&bad_syntax, "", empty_catalog(), Arc::clone(&fetcher) as Arc<dyn SecretFetcher>)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SyncError::TemplateError { .. }));

        let bad_value = spec(serde_json::json!({
            "data": [{"name": "out", "valueFrom": {"template": "{{#with (getSecretValueMap \"s1\")}}{{k}}{{/with}}"}}]
        }));
        let err = render_data(&bad_value, "", empty_catalog(), fetcher)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SyncError::TemplateError { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn whole_secret_copy_then_fields_override() {
        let fetcher = MapFetcher::new(&[("app/all", r#"{"a":"1","b":"2"}"#)]);
        let spec = spec(serde_json::json!({
            "dataFrom": {"secretRef": {"name": "app/all"}},
            "data": [{"name": "b", "value": "overridden"}]
        }));

        let data = render_data(&spec, "", empty_catalog(), fetcher)
            .await
            .expect("renders");
        assert_eq!(as_str(&data, "a"), "1");
        assert_eq!(as_str(&data, "b"), "overridden");
    }
}
