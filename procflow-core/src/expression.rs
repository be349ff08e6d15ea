use crate::execution::ExecutionId;
use std::collections::HashMap;
use uuid::Uuid;

/// Evaluation context handed to conditions and skip expressions.
///
/// `variables` is the merged view from the root scope down to the execution
/// being stepped.
pub struct EvalContext<'a> {
    pub execution_id: ExecutionId,
    pub process_instance_id: Uuid,
    pub variables: &'a HashMap<String, serde_json::Value>,
    pub actor: Option<&'a str>,
}

/// An opaque boolean predicate over an execution and its variables.
///
/// The kernel never evaluates expression syntax itself; embedders hand in
/// whatever capability their expression language produces.
pub trait Condition: Send + Sync {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> anyhow::Result<bool>;
}

/// An opaque value producer (used for skip expressions).
pub trait ValueExpression: Send + Sync {
    fn get_value(&self, ctx: &EvalContext<'_>) -> anyhow::Result<serde_json::Value>;
}

/// Constant condition.
pub struct FixedCondition(pub bool);

impl Condition for FixedCondition {
    fn evaluate(&self, _ctx: &EvalContext<'_>) -> anyhow::Result<bool> {
        Ok(self.0)
    }
}

/// Condition that is true when the named variable is truthy.
pub struct VariableCondition(pub String);

impl Condition for VariableCondition {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> anyhow::Result<bool> {
        Ok(ctx
            .variables
            .get(&self.0)
            .map(is_truthy)
            .unwrap_or(false))
    }
}

/// Constant value expression.
pub struct FixedValue(pub serde_json::Value);

impl ValueExpression for FixedValue {
    fn get_value(&self, _ctx: &EvalContext<'_>) -> anyhow::Result<serde_json::Value> {
        Ok(self.0.clone())
    }
}

/// Value expression that reads the named variable (null when absent).
pub struct VariableValue(pub String);

impl ValueExpression for VariableValue {
    fn get_value(&self, ctx: &EvalContext<'_>) -> anyhow::Result<serde_json::Value> {
        Ok(ctx
            .variables
            .get(&self.0)
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }
}

pub fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
    }

    #[test]
    fn variable_condition_reads_merged_variables() {
        let mut vars = HashMap::new();
        vars.insert("approved".to_string(), json!(true));
        let ctx = EvalContext {
            execution_id: ExecutionId::new(),
            process_instance_id: Uuid::now_v7(),
            variables: &vars,
            actor: None,
        };
        assert!(VariableCondition("approved".into()).evaluate(&ctx).unwrap());
        assert!(!VariableCondition("missing".into()).evaluate(&ctx).unwrap());
    }
}
