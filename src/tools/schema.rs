//! 工具参数 JSON Schema 生成（schemars 自动生成工具 Schema）
//!
//! 每个工具的参数结构体 derive JsonSchema，由此得到发给 Provider 的 `parameters` 字段，
//! 保证 Schema 与 `ToolArgs::parse` 实际接受的结构一致。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 返回参数结构体 T 的 JSON Schema（object 形式）
pub fn parameters_schema_for<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    match serde_json::to_value(schema) {
        Ok(mut value) => {
            // Provider 只需要 object 本体，去掉 $schema / title 噪音
            if let Some(obj) = value.as_object_mut() {
                obj.remove("$schema");
                obj.remove("title");
            }
            value
        }
        Err(_) => serde_json::json!({ "type": "object", "properties": {} }),
    }
}
