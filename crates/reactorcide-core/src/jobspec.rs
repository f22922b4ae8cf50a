//! `JobSpec` loading (YAML/JSON, flat or nested `job:` form), layered overlay
//! merging, `${env:...}`/`${secret:...}` reference resolution, and
//! shell-quoting-aware command parsing (spec §4.5).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::SourceType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NestedJobBlock {
    pub image: Option<String>,
    pub command: Option<String>,
    pub timeout: Option<u64>,
    pub priority: Option<i32>,
    pub raw_command: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Raw on-disk shape, accepting both the flat form and the nested CI-event
/// form; `job:` fields are lifted onto the flat fields at load time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawJobSpec {
    name: Option<String>,
    description: Option<String>,
    command: Option<String>,
    image: Option<String>,
    #[serde(default)]
    environment: HashMap<String, Value>,
    timeout_seconds: Option<u64>,
    #[serde(default)]
    capabilities: Vec<String>,
    job: Option<NestedJobBlock>,
    triggers: Option<Value>,
    source_type: Option<SourceType>,
    source_url: Option<String>,
    source_ref: Option<String>,
    source_path: Option<String>,
}

/// Loaded, normalised job description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub description: Option<String>,
    pub command: String,
    pub image: Option<String>,
    pub environment: HashMap<String, Value>,
    pub timeout_seconds: Option<u64>,
    pub capabilities: Vec<String>,
    pub source_type: Option<SourceType>,
    pub source_url: Option<String>,
    pub source_ref: Option<String>,
    pub source_path: Option<String>,
}

impl JobSpec {
    /// Loads from YAML or JSON by file extension. Defaults: missing `name`
    /// uses the file basename; missing `image` is left `None` (the caller
    /// substitutes the configured default runner image); `command` is
    /// required.
    pub fn load(path: &Path, default_basename: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let raw: RawJobSpec = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::config_invalid(format!("invalid yaml job spec: {}", e)))?,
            _ => serde_json::from_str(&contents)
                .map_err(|e| Error::config_invalid(format!("invalid json job spec: {}", e)))?,
        };
        Self::from_raw(raw, default_basename)
    }

    pub fn parse_str(contents: &str, is_yaml: bool, default_basename: &str) -> Result<Self> {
        let raw: RawJobSpec = if is_yaml {
            serde_yaml::from_str(contents).map_err(|e| Error::config_invalid(e.to_string()))?
        } else {
            serde_json::from_str(contents).map_err(|e| Error::config_invalid(e.to_string()))?
        };
        Self::from_raw(raw, default_basename)
    }

    fn from_raw(mut raw: RawJobSpec, default_basename: &str) -> Result<Self> {
        // Lift the nested `job:` block onto top-level fields; `timeout ->
        // timeout_seconds`; `priority` is ignored at the spec level.
        if let Some(job) = raw.job.take() {
            if raw.image.is_none() {
                raw.image = job.image;
            }
            if raw.command.is_none() {
                raw.command = job.raw_command.or(job.command);
            }
            if raw.timeout_seconds.is_none() {
                raw.timeout_seconds = job.timeout;
            }
            if raw.capabilities.is_empty() {
                raw.capabilities = job.capabilities;
            }
        }

        let command = raw
            .command
            .ok_or_else(|| Error::config_invalid("job spec is missing a command"))?;

        Ok(JobSpec {
            name: raw.name.unwrap_or_else(|| default_basename.to_string()),
            description: raw.description,
            command,
            image: raw.image,
            environment: raw.environment,
            timeout_seconds: raw.timeout_seconds,
            capabilities: raw.capabilities,
            source_type: raw.source_type,
            source_url: raw.source_url,
            source_ref: raw.source_ref,
            source_path: raw.source_path,
        })
    }
}

/// Emitted when an overlay replaces a base env value that looked like a
/// `${secret:...}` reference with a plaintext value.
#[derive(Debug, Clone)]
pub struct SecretOverride {
    pub key: String,
    pub old: String,
    pub new: String,
    pub overlay_file: Option<String>,
}

/// Later overlays take precedence. Scalars are replaced if non-empty in the
/// overlay; `environment` is merged key-by-key (overlay wins per key);
/// `capabilities` is replaced wholesale when non-empty in the overlay; the
/// source block (`source_type`/`source_url`/`source_ref`/`source_path`) is
/// replaced wholesale when any of its fields are present in the overlay.
/// `merge_job_specs(base, [])` is a deep-copy of `base`.
pub fn merge_job_specs(base: &JobSpec, overlays: &[(JobSpec, Option<String>)]) -> (JobSpec, Vec<SecretOverride>) {
    let mut merged = base.clone();
    let mut overrides = Vec::new();

    for (overlay, overlay_file) in overlays {
        if !overlay.name.is_empty() && overlay.name != base.name {
            merged.name = overlay.name.clone();
        }
        if overlay.description.is_some() {
            merged.description = overlay.description.clone();
        }
        if !overlay.command.is_empty() {
            merged.command = overlay.command.clone();
        }
        if overlay.image.is_some() {
            merged.image = overlay.image.clone();
        }
        if overlay.timeout_seconds.is_some() {
            merged.timeout_seconds = overlay.timeout_seconds;
        }
        if !overlay.capabilities.is_empty() {
            merged.capabilities = overlay.capabilities.clone();
        }
        if overlay.source_type.is_some() || overlay.source_url.is_some() || overlay.source_ref.is_some() || overlay.source_path.is_some() {
            merged.source_type = overlay.source_type;
            merged.source_url = overlay.source_url.clone();
            merged.source_ref = overlay.source_ref.clone();
            merged.source_path = overlay.source_path.clone();
        }

        for (k, v) in &overlay.environment {
            if let Some(existing) = merged.environment.get(k) {
                if let Some(s) = existing.as_str() {
                    if is_secret_reference(s) {
                        if let Some(new_s) = v.as_str() {
                            if !is_secret_reference(new_s) {
                                overrides.push(SecretOverride {
                                    key: k.clone(),
                                    old: s.to_string(),
                                    new: new_s.to_string(),
                                    overlay_file: overlay_file.clone(),
                                });
                            }
                        }
                    }
                }
            }
            merged.environment.insert(k.clone(), v.clone());
        }
    }

    (merged, overrides)
}

fn is_secret_reference(s: &str) -> bool {
    s.starts_with("${secret:") && s.ends_with('}')
}

pub type SecretGetter<'a> = dyn Fn(&str, &str) -> Result<String> + Send + Sync + 'a;

/// Resolves `${env:VAR}` (from the host process environment, unset ⇒ empty
/// string) first across all values, then `${secret:PATH:KEY}` via `getter`.
/// Returns the resolved map plus the set of resolved secret values so the
/// masker can be seeded.
pub fn resolve_references(
    env: &HashMap<String, Value>,
    getter: &SecretGetter,
) -> Result<(HashMap<String, String>, Vec<String>)> {
    let mut resolved: HashMap<String, String> = HashMap::new();
    for (k, v) in env {
        let as_str = match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        resolved.insert(k.clone(), resolve_env_refs(&as_str));
    }

    let mut secret_values = Vec::new();
    for value in resolved.values_mut() {
        if let Some((path, key)) = parse_secret_ref(value) {
            let secret = getter(&path, &key)?;
            secret_values.push(secret.clone());
            *value = secret;
        }
    }

    Ok((resolved, secret_values))
}

pub fn resolve_env_refs(input: &str) -> String {
    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find("${env:") {
        out.push_str(&rest[..start]);
        let after = &rest[start + "${env:".len()..];
        if let Some(end) = after.find('}') {
            let var = &after[..end];
            out.push_str(&std::env::var(var).unwrap_or_default());
            rest = &after[end + 1..];
        } else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        }
    }
    out.push_str(rest);
    out
}

pub(crate) fn parse_secret_ref(input: &str) -> Option<(String, String)> {
    let inner = input.strip_prefix("${secret:")?.strip_suffix('}')?;
    let mut parts = inner.splitn(2, ':');
    let path = parts.next()?.to_string();
    let key = parts.next()?.to_string();
    Some((path, key))
}

const SHELL_PREFIXES: &[&str] = &["sh -c", "bash -c", "/bin/sh -c", "/bin/bash -c"];

/// Splits a single-line command on whitespace honouring basic POSIX-style
/// quoting: backslash escapes the next char outside single quotes; single
/// quotes are literal; double quotes allow spaces but not escapes.
pub fn parse_command(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = input.chars().peekable();
    let mut has_token = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                    has_token = true;
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// Multiline commands are wrapped with `sh -c <whole string>` unless they
/// already start with one of the known shell prefixes. `prefix_override`
/// lets a spec's `command_prefix` replace the default `sh -c`.
pub fn parse_command_with_prefix(prefix_override: Option<&str>, input: &str) -> Vec<String> {
    let is_multiline = input.contains('\n');
    let already_wrapped = SHELL_PREFIXES.iter().any(|p| input.trim_start().starts_with(p));

    if !is_multiline && !already_wrapped {
        return parse_command(input);
    }
    if already_wrapped {
        return parse_command(input);
    }

    let prefix = prefix_override.unwrap_or("sh -c");
    let mut wrapped = parse_command(prefix);
    wrapped.push(input.to_string());
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_job_spec_requires_command() {
        let err = JobSpec::parse_str(r#"{"name": "x"}"#, false, "default").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn nested_job_block_is_lifted() {
        let spec = JobSpec::parse_str(
            r#"{"name": "deploy", "job": {"image": "alpine", "raw_command": "echo hi", "timeout": 60}}"#,
            false,
            "default",
        )
        .unwrap();
        assert_eq!(spec.image.as_deref(), Some("alpine"));
        assert_eq!(spec.command, "echo hi");
        assert_eq!(spec.timeout_seconds, Some(60));
    }

    #[test]
    fn missing_name_uses_basename() {
        let spec = JobSpec::parse_str(r#"{"command": "echo hi"}"#, false, "my-file").unwrap();
        assert_eq!(spec.name, "my-file");
    }

    #[test]
    fn merge_with_no_overlays_is_deep_copy() {
        let base = JobSpec {
            name: "base".into(),
            command: "echo base".into(),
            ..Default::default()
        };
        let (merged, overrides) = merge_job_specs(&base, &[]);
        assert_eq!(merged.command, base.command);
        assert!(overrides.is_empty());
    }

    #[test]
    fn overlay_wins_on_conflicting_env_keys() {
        let mut base = JobSpec::default();
        base.environment.insert("FOO".into(), Value::String("base-value".into()));

        let mut overlay = JobSpec::default();
        overlay.environment.insert("FOO".into(), Value::String("overlay-value".into()));

        let (merged, _) = merge_job_specs(&base, &[(overlay, None)]);
        assert_eq!(merged.environment.get("FOO").unwrap(), "overlay-value");
    }

    #[test]
    fn secret_override_warning_emitted_but_applied() {
        let mut base = JobSpec::default();
        base.environment.insert("TOKEN".into(), Value::String("${secret:vault:token}".into()));

        let mut overlay = JobSpec::default();
        overlay.environment.insert("TOKEN".into(), Value::String("plaintext".into()));

        let (merged, overrides) = merge_job_specs(&base, &[(overlay, Some("overlay.yaml".into()))]);
        assert_eq!(merged.environment.get("TOKEN").unwrap(), "plaintext");
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].key, "TOKEN");
    }

    #[test]
    fn env_ref_resolves_from_process_environment() {
        std::env::set_var("REACTORCIDE_TEST_VAR", "hello");
        assert_eq!(resolve_env_refs("prefix-${env:REACTORCIDE_TEST_VAR}-suffix"), "prefix-hello-suffix");
        std::env::remove_var("REACTORCIDE_TEST_VAR");
    }

    #[test]
    fn unset_env_ref_resolves_to_empty_string() {
        assert_eq!(resolve_env_refs("${env:REACTORCIDE_DEFINITELY_UNSET}"), "");
    }

    #[test]
    fn secret_ref_resolved_via_getter_and_returned_for_masking() {
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), Value::String("${secret:vault:token}".into()));
        let getter: Box<SecretGetter> = Box::new(|path, key| Ok(format!("{}-{}-value", path, key)));
        let (resolved, secret_values) = resolve_references(&env, &*getter).unwrap();
        assert_eq!(resolved.get("TOKEN").unwrap(), "vault-token-value");
        assert_eq!(secret_values, vec!["vault-token-value".to_string()]);
    }

    #[test]
    fn command_parsing_honours_quoting() {
        assert_eq!(parse_command("echo hello world"), vec!["echo", "hello", "world"]);
        assert_eq!(parse_command(r#"echo "hello world""#), vec!["echo", "hello world"]);
        assert_eq!(parse_command("echo 'a b' c"), vec!["echo", "a b", "c"]);
        assert_eq!(parse_command(r"echo a\ b"), vec!["echo", "a b"]);
    }

    #[test]
    fn multiline_command_wrapped_with_sh_c() {
        let parsed = parse_command_with_prefix(None, "echo one\necho two");
        assert_eq!(parsed[0], "sh");
        assert_eq!(parsed[1], "-c");
        assert_eq!(parsed[2], "echo one\necho two");
    }

    #[test]
    fn already_wrapped_multiline_command_is_idempotent() {
        let input = "sh -c \"echo one\necho two\"";
        let once = parse_command_with_prefix(None, input);
        let twice = parse_command_with_prefix(None, &once.join(" "));
        assert_eq!(once[0], "sh");
        assert_eq!(twice[0], "sh");
    }
}
