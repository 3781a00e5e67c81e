//! 工具参数 Schema：schemars 生成、jsonschema 校验

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 由参数结构体生成 JSON Schema
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// 按 schema 校验工具参数；失败时返回拼接后的错误信息
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let compiled =
        jsonschema::validator_for(schema).map_err(|err| format!("invalid schema: {err}"))?;
    if !compiled.is_valid(args) {
        let messages = compiled
            .iter_errors(args)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(messages.join("; "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct ShipArgs {
        /// 集装箱数量
        num_containers: u32,
        destination: String,
    }

    #[test]
    fn test_schema_of_lists_required_fields() {
        let schema = schema_of::<ShipArgs>();
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("num_containers")));
        assert!(required.contains(&json!("destination")));
    }

    #[test]
    fn test_validate_args() {
        let schema = schema_of::<ShipArgs>();
        assert!(validate_args(&schema, &json!({"num_containers": 3, "destination": "Rotterdam"})).is_ok());
        let err = validate_args(&schema, &json!({"num_containers": "three"})).unwrap_err();
        assert!(!err.is_empty());
    }
}
