//! Attribute mapping expressions.
//!
//! An expression is a pure function of one object's attribute dictionary.
//! The engine only depends on [`ExpressionEvaluator`]; [`RhaiExpressionEvaluator`]
//! is the sandboxed Rhai implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use rhai::{Dynamic, Engine, Scope, AST};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use xavyo_metaverse::{AttributeDataType, AttributeValue, AttributeValues, SchemaAttribute};

use crate::error::{SyncError, SyncResult};

/// Default maximum number of operations per evaluation.
const DEFAULT_MAX_OPERATIONS: u64 = 10_000;

/// Default maximum call stack depth.
const DEFAULT_MAX_CALL_STACK_DEPTH: usize = 32;

/// Default maximum string size in bytes.
const DEFAULT_MAX_STRING_SIZE: usize = 65536;

/// Default maximum array size.
const DEFAULT_MAX_ARRAY_SIZE: usize = 10_000;

/// Default maximum map size.
const DEFAULT_MAX_MAP_SIZE: usize = 10_000;

/// Sandbox limits for expression evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionConfig {
    /// Maximum number of operations before termination.
    pub max_operations: u64,
    /// Maximum call stack depth.
    pub max_call_stack_depth: usize,
    /// Maximum string size in bytes.
    pub max_string_size: usize,
    /// Maximum array size.
    pub max_array_size: usize,
    /// Maximum map size.
    pub max_map_size: usize,
}

impl Default for ExpressionConfig {
    fn default() -> Self {
        Self {
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_call_stack_depth: DEFAULT_MAX_CALL_STACK_DEPTH,
            max_string_size: DEFAULT_MAX_STRING_SIZE,
            max_array_size: DEFAULT_MAX_ARRAY_SIZE,
            max_map_size: DEFAULT_MAX_MAP_SIZE,
        }
    }
}

/// Attribute dictionary an expression is evaluated against, keyed by
/// attribute name. Single-valued attributes are scalars, multi-valued
/// attributes are arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpressionContext {
    attributes: BTreeMap<String, serde_json::Value>,
}

impl ExpressionContext {
    /// Build a context from an object's values and its schema.
    pub fn from_values<A>(values: &AttributeValues<A>, schema: &[SchemaAttribute<A>]) -> Self
    where
        A: Copy + Eq + std::hash::Hash,
    {
        let mut attributes = BTreeMap::new();
        for attribute in schema {
            let present: Vec<serde_json::Value> =
                values.values_of(attribute.id).map(value_to_json).collect();
            if present.is_empty() {
                continue;
            }
            let json = if attribute.is_multi_valued() {
                serde_json::Value::Array(present)
            } else {
                present.into_iter().next().unwrap_or(serde_json::Value::Null)
            };
            attributes.insert(attribute.name.clone(), json);
        }
        Self { attributes }
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpressionOutput {
    /// No value: the target attribute is cleared.
    Null,
    /// One value: scalar comparison against the target.
    Single(AttributeValue),
    /// Many values: full value-set comparison against the target.
    Multiple(Vec<AttributeValue>),
}

impl ExpressionOutput {
    /// Flatten into a value list.
    #[must_use]
    pub fn into_values(self) -> Vec<AttributeValue> {
        match self {
            ExpressionOutput::Null => Vec::new(),
            ExpressionOutput::Single(value) => vec![value],
            ExpressionOutput::Multiple(values) => values,
        }
    }
}

/// Evaluates attribute mapping expressions.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` against `context`, coercing the result to `target_type`.
    fn evaluate(
        &self,
        expression: &str,
        context: &ExpressionContext,
        target_type: AttributeDataType,
    ) -> SyncResult<ExpressionOutput>;
}

/// Sandboxed Rhai evaluator.
///
/// The attribute dictionary is exposed to scripts as the constant map
/// `attributes`. Compiled scripts are cached by source text.
pub struct RhaiExpressionEvaluator {
    engine: Engine,
    compiled: RwLock<HashMap<String, AST>>,
}

impl RhaiExpressionEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ExpressionConfig::default())
    }

    #[must_use]
    pub fn with_config(config: ExpressionConfig) -> Self {
        let mut engine = Engine::new();

        engine.set_max_operations(config.max_operations);
        engine.set_max_call_levels(config.max_call_stack_depth);
        engine.set_max_string_size(config.max_string_size);
        engine.set_max_array_size(config.max_array_size);
        engine.set_max_map_size(config.max_map_size);
        engine.set_strict_variables(true);

        Self {
            engine,
            compiled: RwLock::new(HashMap::new()),
        }
    }

    fn scope(context: &ExpressionContext) -> SyncResult<Scope<'static>> {
        let mut scope = Scope::new();
        let attributes = rhai::serde::to_dynamic(&context.attributes)
            .map_err(|e| SyncError::internal(format!("Cannot expose attributes: {e}")))?;
        scope.push_constant("attributes", attributes);
        Ok(scope)
    }

    fn compile(&self, expression: &str, scope: &Scope) -> SyncResult<AST> {
        if let Ok(cache) = self.compiled.read() {
            if let Some(ast) = cache.get(expression) {
                return Ok(ast.clone());
            }
        }

        let ast = self
            .engine
            .compile_with_scope(scope, expression)
            .map_err(|e| SyncError::expression(expression, format!("Compilation error: {e}")))?;

        if let Ok(mut cache) = self.compiled.write() {
            cache.insert(expression.to_string(), ast.clone());
        }
        Ok(ast)
    }
}

impl Default for RhaiExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator for RhaiExpressionEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        context: &ExpressionContext,
        target_type: AttributeDataType,
    ) -> SyncResult<ExpressionOutput> {
        let mut scope = Self::scope(context)?;
        let ast = self.compile(expression, &scope)?;

        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, &ast)
            .map_err(|e| SyncError::expression(expression, e.to_string()))?;

        if result.is_unit() {
            debug!(expression = %expression, "Expression produced no value");
            return Ok(ExpressionOutput::Null);
        }

        let json: serde_json::Value = rhai::serde::from_dynamic(&result)
            .map_err(|e| SyncError::expression(expression, e.to_string()))?;

        match json {
            serde_json::Value::Null => Ok(ExpressionOutput::Null),
            serde_json::Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(value) = json_to_value(&item, target_type)
                        .map_err(|message| SyncError::expression(expression, message))?
                    {
                        values.push(value);
                    }
                }
                Ok(ExpressionOutput::Multiple(values))
            }
            scalar => match json_to_value(&scalar, target_type)
                .map_err(|message| SyncError::expression(expression, message))?
            {
                Some(value) => Ok(ExpressionOutput::Single(value)),
                None => Ok(ExpressionOutput::Null),
            },
        }
    }
}

/// Render a value for an expression context.
fn value_to_json(value: &AttributeValue) -> serde_json::Value {
    match value {
        AttributeValue::Text(s) => serde_json::Value::String(s.clone()),
        AttributeValue::Number(n) => serde_json::Value::from(*n),
        AttributeValue::LongNumber(n) => serde_json::Value::from(*n),
        AttributeValue::Boolean(b) => serde_json::Value::Bool(*b),
        other => serde_json::Value::String(other.to_string()),
    }
}

/// Coerce an expression result into a typed value. `Ok(None)` means null.
fn json_to_value(
    json: &serde_json::Value,
    target_type: AttributeDataType,
) -> Result<Option<AttributeValue>, String> {
    if json.is_null() {
        return Ok(None);
    }
    let text = || match json {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let value = match target_type {
        AttributeDataType::Text => AttributeValue::Text(text()),
        AttributeDataType::Number => {
            let n = json
                .as_i64()
                .or_else(|| text().parse().ok())
                .ok_or_else(|| format!("'{json}' is not a number"))?;
            AttributeValue::Number(i32::try_from(n).map_err(|_| format!("{n} does not fit a number"))?)
        }
        AttributeDataType::LongNumber => AttributeValue::LongNumber(
            json.as_i64()
                .or_else(|| text().parse().ok())
                .ok_or_else(|| format!("'{json}' is not a number"))?,
        ),
        AttributeDataType::Boolean => AttributeValue::Boolean(
            json.as_bool()
                .or_else(|| text().parse().ok())
                .ok_or_else(|| format!("'{json}' is not a boolean"))?,
        ),
        AttributeDataType::Guid => AttributeValue::Guid(
            Uuid::parse_str(&text()).map_err(|e| format!("'{json}' is not a guid: {e}"))?,
        ),
        AttributeDataType::DateTime => AttributeValue::DateTime(
            chrono::DateTime::parse_from_rfc3339(&text())
                .map_err(|e| format!("'{json}' is not an RFC 3339 timestamp: {e}"))?
                .with_timezone(&chrono::Utc),
        ),
        AttributeDataType::Binary => AttributeValue::Binary(decode_hex(&text())?),
        AttributeDataType::Reference => {
            return Err("expressions cannot produce reference values".to_string())
        }
    };
    Ok(Some(value))
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err(format!("'{s}' is not valid hex"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("'{s}' is not valid hex"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExpressionContext {
        ExpressionContext::default()
            .with("FIRST_NAME", json!("Ada"))
            .with("LAST_NAME", json!("Lovelace"))
            .with("GROUPS", json!(["eng", "ops"]))
    }

    #[test]
    fn test_scalar_result() {
        let evaluator = RhaiExpressionEvaluator::new();
        let output = evaluator
            .evaluate(
                r#"attributes["FIRST_NAME"] + " " + attributes["LAST_NAME"]"#,
                &context(),
                AttributeDataType::Text,
            )
            .unwrap();
        assert_eq!(output, ExpressionOutput::Single("Ada Lovelace".into()));
    }

    #[test]
    fn test_array_result_is_multiple() {
        let evaluator = RhaiExpressionEvaluator::new();
        let output = evaluator
            .evaluate(r#"attributes["GROUPS"]"#, &context(), AttributeDataType::Text)
            .unwrap();
        assert_eq!(
            output,
            ExpressionOutput::Multiple(vec!["eng".into(), "ops".into()])
        );
    }

    #[test]
    fn test_unit_result_is_null() {
        let evaluator = RhaiExpressionEvaluator::new();
        let output = evaluator
            .evaluate("()", &context(), AttributeDataType::Text)
            .unwrap();
        assert_eq!(output, ExpressionOutput::Null);
    }

    #[test]
    fn test_number_coercion() {
        let evaluator = RhaiExpressionEvaluator::new();
        let output = evaluator
            .evaluate("40 + 2", &context(), AttributeDataType::Number)
            .unwrap();
        assert_eq!(output, ExpressionOutput::Single(AttributeValue::Number(42)));
    }

    #[test]
    fn test_unknown_variable_is_expression_error() {
        let evaluator = RhaiExpressionEvaluator::new();
        let err = evaluator
            .evaluate("missing + 1", &context(), AttributeDataType::Text)
            .unwrap_err();
        assert!(matches!(err, SyncError::Expression { .. }));
        assert!(!err.is_systemic());
    }

    #[test]
    fn test_runaway_script_is_bounded() {
        let evaluator = RhaiExpressionEvaluator::with_config(ExpressionConfig {
            max_operations: 100,
            ..ExpressionConfig::default()
        });
        let err = evaluator
            .evaluate(
                "{ let x = 0; loop { x += 1; } }",
                &context(),
                AttributeDataType::Number,
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Expression { .. }));
    }

    #[test]
    fn test_context_from_values_uses_schema_plurality() {
        use xavyo_metaverse::{AttributeDataType as T, ConnectedSystemAttributeId};

        let name = ConnectedSystemAttributeId::new();
        let groups = ConnectedSystemAttributeId::new();
        let schema = vec![
            SchemaAttribute::single(name, "NAME", T::Text),
            SchemaAttribute::multi(groups, "GROUPS", T::Text),
        ];
        let values = AttributeValues::new()
            .with(name, "Ada")
            .with(groups, "eng");

        let context = ExpressionContext::from_values(&values, &schema);
        assert_eq!(context.get("NAME"), Some(&json!("Ada")));
        assert_eq!(context.get("GROUPS"), Some(&json!(["eng"])));
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("dead").unwrap(), vec![0xde, 0xad]);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }
}
