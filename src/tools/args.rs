//! 工具参数与调用请求
//!
//! ToolArgs 包装无类型的 key/value 参数表，仅在 CallExtractor / ToolGateway 之间流转；
//! 具体工具通过 `ToolArgs::parse::<T>()` 反序列化为各自带 schema 的参数结构体。

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::ToolError;

/// 工具参数：JSON 对象（文本解析得到的值一律为字符串，结构化调用保留原类型）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolArgs(Map<String, Value>);

impl ToolArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// 非对象的 JSON（如 null）视为空参数；数组、字符串等返回 None
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            Value::Null => Some(Self::new()),
            _ => None,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// 反序列化为工具自己的参数结构体；类型或必填字段不匹配时返回 InvalidArgs
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_value(self.as_value()).map_err(|e| ToolError::InvalidArgs(e.to_string()))
    }

    /// 规范化形式：键有序、值为紧凑 JSON，用于去重比较（与键的插入顺序、来源格式无关）
    pub fn canonical(&self) -> String {
        let sorted: BTreeMap<&str, String> = self
            .0
            .iter()
            .map(|(k, v)| (k.as_str(), canonical_value(v)))
            .collect();
        let mut out = String::from("{");
        for (i, (k, v)) in sorted.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!("{:?}:{}", k, v));
        }
        out.push('}');
        out
    }
}

fn canonical_value(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            let body: Vec<String> = sorted
                .iter()
                .map(|(k, v)| format!("{:?}:{}", k, v))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_value).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

impl From<Map<String, Value>> for ToolArgs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// 单次工具调用请求：来自结构化 function call 或文本模式解析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub args: ToolArgs,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: ToolArgs) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    /// 由内容生成确定性 id（同一 name + 参数总得到同一 id），用于文本解析出的调用
    pub fn with_derived_id(name: impl Into<String>, args: ToolArgs) -> Self {
        let name = name.into();
        let id = derive_call_id(&name, &args);
        Self { id, name, args }
    }

    /// 去重键：(工具名, 规范化参数)
    pub fn dedup_key(&self) -> (String, String) {
        (self.name.clone(), self.args.canonical())
    }
}

pub(crate) fn derive_call_id(name: &str, args: &ToolArgs) -> String {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    args.canonical().hash(&mut hasher);
    format!("call_{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_ignores_insertion_order() {
        let a = ToolArgs::new().with("task", "x").with("agentType", "analyst");
        let b = ToolArgs::new().with("agentType", "analyst").with("task", "x");
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_canonical_distinguishes_types() {
        let a = ToolArgs::new().with("n", "1");
        let b = ToolArgs::new().with("n", 1);
        assert_ne!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_derived_id_is_stable() {
        let a = ToolInvocation::with_derived_id("echo", ToolArgs::new().with("text", "hi"));
        let b = ToolInvocation::with_derived_id("echo", ToolArgs::new().with("text", "hi"));
        let c = ToolInvocation::with_derived_id("echo", ToolArgs::new().with("text", "ho"));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_parse_typed_args() {
        #[derive(Deserialize)]
        struct EchoArgs {
            text: String,
        }
        let args = ToolArgs::from_value(json!({"text": "hello"})).unwrap();
        let parsed: EchoArgs = args.parse().unwrap();
        assert_eq!(parsed.text, "hello");

        let missing = ToolArgs::new();
        assert!(matches!(
            missing.parse::<EchoArgs>(),
            Err(ToolError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(ToolArgs::from_value(json!(null)).unwrap().is_empty());
        assert!(ToolArgs::from_value(json!([1, 2])).is_none());
        assert!(ToolArgs::from_value(json!("text")).is_none());
    }
}
