//! Program definition types: variables, execution spec, install/uninstall
//! pipelines. This is the persisted JSON schema for one controlled program.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in a Program's variable map.
///
/// `value` participates in `${name}` template substitution across argv,
/// env, and operation arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub value: Value,

    #[serde(default)]
    pub required: bool,

    #[serde(default = "default_true")]
    pub user_editable: bool,

    #[serde(default)]
    pub display: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub options: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Variable {
    pub fn as_template_string(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

pub type Variables = HashMap<String, Variable>;

/// The run spec: how to invoke and supervise the main process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub program: String,

    #[serde(default)]
    pub arguments: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub stop_command: String,

    /// Signal number to send on Stop; 0 means "use stopCommand instead".
    #[serde(default)]
    pub stop_code: i32,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub auto_start: bool,

    #[serde(default)]
    pub auto_restart_on_crash: bool,

    #[serde(default)]
    pub auto_restart_on_graceful: bool,

    #[serde(default)]
    pub pre: Vec<Step>,

    #[serde(default)]
    pub post: Vec<Step>,
}

impl Default for Execution {
    fn default() -> Self {
        Self {
            program: String::new(),
            arguments: Vec::new(),
            env: HashMap::new(),
            stop_command: String::new(),
            stop_code: 0,
            enabled: false,
            auto_start: false,
            auto_restart_on_crash: false,
            auto_restart_on_graceful: false,
            pre: Vec::new(),
            post: Vec::new(),
        }
    }
}

/// A tagged, unresolved pipeline step: `{type, args}`. Resolved to a
/// concrete `Operation` via the type→factory registry at pipeline assembly
/// time (see `server::install`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub args: HashMap<String, Value>,
}

/// Full persisted definition of one controlled program: `<serverFolder>/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramDefinition {
    /// Opaque stable identifier; equal to the filename stem.
    pub identifier: String,

    pub display: String,

    /// Environment kind selector: `standard`, `docker`, or `tty`.
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub variables: Variables,

    pub execution: Execution,

    #[serde(default)]
    pub installation: Vec<Step>,

    #[serde(default)]
    pub uninstallation: Vec<Step>,

    /// Docker image, when `kind == "docker"`.
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub limits: BuildLimits,

    #[serde(default)]
    pub suspended: bool,

    /// Reset to 0 on any graceful exit; never serialised as part of a
    /// client-facing edit, only round-tripped across Save/Load.
    #[serde(default)]
    pub crash_counter: u32,
}

/// Resource limits, shared across environment kinds where meaningful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLimits {
    /// Memory limit in MB (0 for unlimited)
    #[serde(default)]
    pub memory_limit: i64,

    #[serde(default)]
    pub swap: i64,

    #[serde(default = "default_io")]
    pub io_weight: u32,

    #[serde(default)]
    pub cpu_limit: i64,

    #[serde(default)]
    pub disk_space: i64,

    #[serde(default)]
    pub oom_disabled: bool,
}

fn default_io() -> u32 {
    500
}

impl Default for BuildLimits {
    fn default() -> Self {
        Self {
            memory_limit: 0,
            swap: 0,
            io_weight: 500,
            cpu_limit: 0,
            disk_space: 0,
            oom_disabled: false,
        }
    }
}

impl ProgramDefinition {
    /// Memory limit in bytes (0 = unlimited).
    pub fn memory_bytes(&self) -> u64 {
        if self.limits.memory_limit <= 0 {
            0
        } else {
            self.limits.memory_limit as u64 * 1024 * 1024
        }
    }

    /// Swap limit in bytes (-1 = unlimited/unset).
    pub fn swap_bytes(&self) -> i64 {
        if self.limits.swap <= 0 {
            -1
        } else {
            self.limits.swap * 1024 * 1024
        }
    }

    /// CPU quota in microseconds per 100ms period (0 = unlimited).
    pub fn cpu_quota(&self) -> i64 {
        if self.limits.cpu_limit <= 0 {
            0
        } else {
            self.limits.cpu_limit * 1000
        }
    }

    pub fn disk_bytes(&self) -> u64 {
        if self.limits.disk_space <= 0 {
            0
        } else {
            self.limits.disk_space as u64 * 1024 * 1024
        }
    }

    /// Build the `${name}` substitution table from variables plus the
    /// implicit `rootDir` injected by `Program::start`.
    pub fn template_context(&self, root_dir: &str) -> HashMap<String, String> {
        let mut ctx: HashMap<String, String> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.as_template_string()))
            .collect();
        ctx.insert("rootDir".to_string(), root_dir.to_string());
        ctx
    }
}

/// Substitute `${name}` occurrences using the given context. Unknown names
/// are left verbatim (matches a permissive templating pass, not a strict one).
pub fn substitute(template: &str, ctx: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match ctx.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn substitute_all(templates: &[String], ctx: &HashMap<String, String>) -> Vec<String> {
    templates.iter().map(|t| substitute(t, ctx)).collect()
}

pub fn substitute_map(
    templates: &HashMap<String, String>,
    ctx: &HashMap<String, String>,
) -> HashMap<String, String> {
    templates
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, ctx)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_replaces_known_names() {
        let mut ctx = HashMap::new();
        ctx.insert("PORT".to_string(), "25565".to_string());
        ctx.insert("rootDir".to_string(), "/srv/1".to_string());
        assert_eq!(substitute("-p ${PORT} -d ${rootDir}", &ctx), "-p 25565 -d /srv/1");
    }

    #[test]
    fn substitute_leaves_unknown_names_verbatim() {
        let ctx = HashMap::new();
        assert_eq!(substitute("${UNKNOWN}", &ctx), "${UNKNOWN}");
    }

    #[test]
    fn substitute_handles_unterminated_brace() {
        let ctx = HashMap::new();
        assert_eq!(substitute("abc${unterminated", &ctx), "abc${unterminated");
    }

    #[test]
    fn memory_bytes_zero_means_unlimited() {
        let limits = BuildLimits::default();
        let def = ProgramDefinition {
            identifier: "x".into(),
            display: "x".into(),
            kind: "standard".into(),
            variables: Variables::new(),
            execution: Execution::default(),
            installation: Vec::new(),
            uninstallation: Vec::new(),
            image: String::new(),
            limits,
            suspended: false,
            crash_counter: 0,
        };
        assert_eq!(def.memory_bytes(), 0);
    }
}
