//! Pipeline definition parsing and validation
//!
//! Definitions are JSON documents (the authoritative form); the same
//! structure rendered as a textual S-expression is also accepted. Object
//! keys starting with `#` are comments and are stripped before
//! deserialization.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sexpr::{self, SMap, SValue};
use crate::stream::Stream;
use crate::{Error, Result};

/// Normalized pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Definition schema version
    pub version: i64,

    /// Pipeline (service) name
    pub name: String,

    /// Informational runtime tag
    #[serde(default)]
    pub runtime: String,

    /// One or more graph S-expressions over element names
    pub graph: Vec<String>,

    /// Pipeline-wide parameter defaults
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,

    /// Processing elements referenced by the graph
    pub elements: Vec<ElementDefinition>,
}

/// One processing element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDefinition {
    /// Unique name within the pipeline
    pub name: String,

    /// Input ports
    #[serde(default)]
    pub input: Vec<PortDefinition>,

    /// Output ports
    #[serde(default)]
    pub output: Vec<PortDefinition>,

    /// Element-specific parameter overrides
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,

    /// Where the element runs
    pub deploy: DeployDefinition,
}

impl ElementDefinition {
    /// Input port names in declaration order
    pub fn input_names(&self) -> Vec<String> {
        self.input.iter().map(|p| p.name.clone()).collect()
    }

    /// Output port names in declaration order
    pub fn output_names(&self) -> Vec<String> {
        self.output.iter().map(|p| p.name.clone()).collect()
    }

    /// Element parameter by name, from the definition overrides
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Resolve a parameter through the tiers: the merged stream
    /// parameters (pipeline defaults under per-stream overrides) win
    /// over this element's own defaults
    pub fn resolve_parameter(&self, stream: &Stream, name: &str) -> Option<SValue> {
        if let Some(value) = stream.parameter(name) {
            return Some(value.clone());
        }
        self.parameters.get(name).map(json_to_svalue)
    }
}

/// Named, typed port; the type is an opaque tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDefinition {
    /// Port name; edges bind by name
    pub name: String,

    /// Opaque type tag; mismatches warn, never fail
    #[serde(rename = "type", default)]
    pub type_name: String,
}

/// Element placement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployDefinition {
    /// Instantiated in this process from the element registry
    Local(LocalDeploy),
    /// Proxied to a service discovered by filter
    Remote(RemoteDeploy),
}

/// Local element placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDeploy {
    /// Registry module the class lives in
    pub module: String,

    /// Class name; defaults to the element's name
    #[serde(default)]
    pub class_name: Option<String>,
}

/// Remote element placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDeploy {
    /// Discovery filter selecting the remote service
    pub service_filter: FilterDefinition,

    /// Informational module hint for the remote side
    #[serde(default)]
    pub module: Option<String>,
}

/// Service filter as written in definitions; absent fields are wildcards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDefinition {
    /// Topic path or `*`
    #[serde(default = "wildcard")]
    pub topic_path: String,
    /// Name or `*`
    #[serde(default = "wildcard")]
    pub name: String,
    /// Owner or `*`
    #[serde(default = "wildcard")]
    pub owner: String,
    /// Protocol or `*`
    #[serde(default = "wildcard")]
    pub protocol: String,
    /// Transport or `*`
    #[serde(default = "wildcard")]
    pub transport: String,
    /// Required `key=value` tags
    #[serde(default)]
    pub tags: Vec<String>,
}

fn wildcard() -> String {
    "*".to_string()
}

impl From<&FilterDefinition> for crate::service::ServiceFilter {
    fn from(definition: &FilterDefinition) -> Self {
        Self {
            topic_path: definition.topic_path.clone(),
            name: definition.name.clone(),
            owner: definition.owner.clone(),
            protocol: definition.protocol.clone(),
            transport: definition.transport.clone(),
            tags: definition.tags.clone(),
        }
    }
}

/// Load a definition from a file; `.json` content is authoritative, any
/// other content is tried as the S-expression form
pub fn load(path: &Path) -> Result<PipelineDefinition> {
    let text = std::fs::read_to_string(path)?;
    if text.trim_start().starts_with('(') {
        parse_sexpr(&text)
    } else {
        parse_json(&text)
    }
}

/// Parse the JSON form
pub fn parse_json(text: &str) -> Result<PipelineDefinition> {
    let mut value: Value = serde_json::from_str(text)?;
    strip_comments(&mut value);
    let definition: PipelineDefinition = serde_json::from_value(value)?;
    validate(&definition)?;
    Ok(definition)
}

/// Parse the textual S-expression form: the same structure as the JSON
/// document, written as one mapping form
pub fn parse_sexpr(text: &str) -> Result<PipelineDefinition> {
    let value = sexpr::parse(text)?;
    let mut json = svalue_to_json(&value);
    strip_comments(&mut json);
    let definition: PipelineDefinition =
        serde_json::from_value(json).map_err(|e| Error::Parse {
            offset: 0,
            reason: format!("definition does not match the schema: {}", e),
        })?;
    validate(&definition)?;
    Ok(definition)
}

/// Structural checks that do not need the graph: unique element names,
/// graph expressions present, every referenced name defined
pub fn validate(definition: &PipelineDefinition) -> Result<()> {
    if definition.graph.is_empty() {
        return Err(Error::Invariant(format!(
            "pipeline {} has no graph expression",
            definition.name
        )));
    }
    if definition.elements.is_empty() {
        return Err(Error::Invariant(format!(
            "pipeline {} has no elements",
            definition.name
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for element in &definition.elements {
        if !seen.insert(&element.name) {
            return Err(Error::Invariant(format!(
                "duplicate element name: {}",
                element.name
            )));
        }
    }
    Ok(())
}

/// Element definition by name
pub fn element<'a>(
    definition: &'a PipelineDefinition,
    name: &str,
) -> Option<&'a ElementDefinition> {
    definition.elements.iter().find(|e| e.name == name)
}

/// Drop `#`-prefixed keys everywhere in the document
fn strip_comments(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !key.starts_with('#'));
            for entry in map.values_mut() {
                strip_comments(entry);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_comments(item);
            }
        }
        _ => {}
    }
}

/// Bridge an S-expression value onto the JSON data model
fn svalue_to_json(value: &SValue) -> Value {
    match value {
        SValue::Null => Value::Null,
        SValue::Bool(b) => Value::Bool(*b),
        SValue::Int(n) => Value::Number((*n).into()),
        SValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SValue::Str(s) | SValue::Symbol(s) => Value::String(s.clone()),
        SValue::List(items) => Value::Array(items.iter().map(svalue_to_json).collect()),
        SValue::Map(map) => {
            let mut object = serde_json::Map::new();
            for (key, entry) in map.entries() {
                let key = match key {
                    SValue::Str(s) | SValue::Symbol(s) => s.clone(),
                    other => other.to_string(),
                };
                object.insert(key, svalue_to_json(entry));
            }
            Value::Object(object)
        }
    }
}

/// Convert a JSON parameter value to the S-expression value model
pub fn json_to_svalue(value: &Value) -> SValue {
    match value {
        Value::Null => SValue::Null,
        Value::Bool(b) => SValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SValue::Int(i)
            } else {
                SValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SValue::str(s),
        Value::Array(items) => SValue::List(items.iter().map(json_to_svalue).collect()),
        Value::Object(map) => SValue::Map(
            map.iter()
                .map(|(k, v)| (SValue::symbol(k), json_to_svalue(v)))
                .collect(),
        ),
    }
}

/// Convert a JSON object to an S-expression mapping
pub fn json_map_to_smap(map: &serde_json::Map<String, Value>) -> SMap {
    map.iter()
        .map(|(k, v)| (SValue::symbol(k), json_to_svalue(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r##"{
        "version": 0,
        "name": "p_test",
        "runtime": "rust",
        "graph": ["(PE_0 PE_1)"],
        "parameters": {"rate": 20},
        "elements": [
            {
                "name": "PE_0",
                "#comment": "adds one",
                "input": [{"name": "a", "type": "int"}],
                "output": [{"name": "b", "type": "int"}],
                "deploy": {"local": {"module": "examples", "class_name": "Increment"}}
            },
            {
                "name": "PE_1",
                "input": [{"name": "b", "type": "int"}],
                "output": [{"name": "f", "type": "int"}],
                "deploy": {"local": {"module": "examples"}}
            }
        ]
    }"##;

    #[test]
    fn parse_linear_definition() {
        let definition = parse_json(LINEAR).unwrap();
        assert_eq!(definition.name, "p_test");
        assert_eq!(definition.graph, vec!["(PE_0 PE_1)"]);
        assert_eq!(definition.elements.len(), 2);

        let pe_0 = element(&definition, "PE_0").unwrap();
        assert_eq!(pe_0.input_names(), vec!["a"]);
        assert_eq!(pe_0.output_names(), vec!["b"]);
        // The comment key was stripped, not treated as data
        let DeployDefinition::Local(local) = &pe_0.deploy else {
            panic!("expected local deploy");
        };
        assert_eq!(local.class_name.as_deref(), Some("Increment"));

        let pe_1 = element(&definition, "PE_1").unwrap();
        let DeployDefinition::Local(local) = &pe_1.deploy else {
            panic!("expected local deploy");
        };
        assert_eq!(local.class_name, None);
    }

    #[test]
    fn duplicate_element_names_rejected() {
        let text = LINEAR.replace("PE_1", "PE_0");
        assert!(matches!(parse_json(&text), Err(Error::Invariant(_))));
    }

    #[test]
    fn remote_deploy_parses_filter() {
        let text = r#"{
            "version": 0,
            "name": "p_remote",
            "graph": ["(PE_1)"],
            "elements": [
                {
                    "name": "PE_1",
                    "input": [{"name": "b", "type": "int"}],
                    "output": [{"name": "f", "type": "int"}],
                    "deploy": {"remote": {"service_filter": {"name": "p_local"}}}
                }
            ]
        }"#;
        let definition = parse_json(text).unwrap();
        let DeployDefinition::Remote(remote) = &definition.elements[0].deploy else {
            panic!("expected remote deploy");
        };
        assert_eq!(remote.service_filter.name, "p_local");
        assert_eq!(remote.service_filter.owner, "*");
    }

    #[test]
    fn sexpr_form_accepted() {
        let text = r#"(version: 0
            name: p_sexpr
            graph: ("(PE_0)")
            elements: ((name: PE_0
                        output: ((name: b type: int))
                        deploy: (local: (module: examples)))))"#;
        let definition = parse_sexpr(text).unwrap();
        assert_eq!(definition.name, "p_sexpr");
        assert_eq!(definition.elements.len(), 1);
    }

    #[test]
    fn sexpr_elements_need_schema_shape() {
        assert!(parse_sexpr("(version: 0 name: p graph: ())").is_err());
    }

    #[test]
    fn parameter_resolution_prefers_stream_over_element() {
        let definition = parse_json(LINEAR).unwrap();
        let pe_0 = element(&definition, "PE_0").unwrap();

        // No stream override: the element's own default applies
        let bare = Stream::new(0, SMap::new(), 0.0);
        assert_eq!(
            pe_0.resolve_parameter(&bare, "amount"),
            Some(SValue::Int(1))
        );

        // Merged stream parameters win over the element default
        let mut parameters = SMap::new();
        parameters.insert(SValue::symbol("amount"), SValue::Int(10));
        let stream = Stream::new(0, parameters, 0.0);
        assert_eq!(
            pe_0.resolve_parameter(&stream, "amount"),
            Some(SValue::Int(10))
        );
        assert_eq!(pe_0.resolve_parameter(&stream, "missing"), None);
    }
}
