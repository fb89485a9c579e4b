//! 工具调用提取
//!
//! 两个来源合并为一个有序、去重的 ToolInvocation 列表：
//! 1. 结构化调用：Provider 原生 function call，按返回顺序逐个保留（未注册的工具名丢弃并记录日志）；
//! 2. 文本形式调用：仅当本轮没有任何结构化调用时，按白名单扫描文本中形如
//!    `name(k="v")`、`**name**(k="v")`、`` `name(k="v")` ``、`name({...})` 以及
//!    `{"tool": "name", "args": {...}}` 的片段。
//!
//! 去重键为 (工具名, 规范化参数)，保留首次出现的位置顺序。单个候选解析失败只丢弃它本身。
//! 文本启发式封装在 TextCallStrategy 后面，可单独替换而不影响 TurnLoop。

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;

use crate::llm::ModelTurn;
use crate::tools::{ToolArgs, ToolInvocation};

/// 从自由文本中恢复工具调用的策略
pub trait TextCallStrategy: Send + Sync {
    /// 返回按文本位置排序的候选（可含重复，由 CallExtractor 去重）
    fn extract(&self, text: &str, whitelist: &[String]) -> Vec<ToolInvocation>;
}

/// 工具调用提取器：白名单 + 文本策略
#[derive(Clone)]
pub struct CallExtractor {
    whitelist: Vec<String>,
    strategy: Arc<dyn TextCallStrategy>,
}

impl CallExtractor {
    pub fn new(whitelist: Vec<String>) -> Self {
        let strategy = Arc::new(PatternStrategy::new(&whitelist));
        Self {
            whitelist,
            strategy,
        }
    }

    /// 替换文本启发式
    pub fn with_strategy(mut self, strategy: Arc<dyn TextCallStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn whitelist(&self) -> &[String] {
        &self.whitelist
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.whitelist.iter().any(|n| n == name)
    }

    /// 提取一轮中的工具调用（有序、去重）
    pub fn extract(&self, turn: &ModelTurn) -> Vec<ToolInvocation> {
        let candidates = if turn.tool_calls.is_empty() {
            let found = self.strategy.extract(&turn.text, &self.whitelist);
            if !found.is_empty() {
                tracing::info!(count = found.len(), "recovered tool calls from response text");
            }
            found
                .into_iter()
                .filter(|c| self.keep_known(c))
                .collect()
        } else {
            turn.tool_calls
                .iter()
                .filter(|c| self.keep_known(c))
                .cloned()
                .map(|mut c| {
                    if c.id.is_empty() {
                        c = ToolInvocation::with_derived_id(c.name, c.args);
                    }
                    c
                })
                .collect()
        };
        dedup_invocations(candidates)
    }

    fn keep_known(&self, call: &ToolInvocation) -> bool {
        let known = self.is_known(&call.name);
        if !known {
            tracing::warn!(tool = %call.name, "dropping call to unregistered tool");
        }
        known
    }
}

/// 按 (name, 规范化参数) 去重，保留首次出现
pub fn dedup_invocations(calls: Vec<ToolInvocation>) -> Vec<ToolInvocation> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .filter(|c| seen.insert(c.dedup_key()))
        .collect()
}

/// 默认文本策略：正则定位调用起点，配对括号截取参数，再解析 key="value" 或内嵌 JSON
///
/// 构造时为已知工具名预编译模式；白名单里未预编译的名字在提取时临时编译。
#[derive(Debug, Default, Clone)]
pub struct PatternStrategy {
    compiled: Vec<(String, Vec<Regex>)>,
}

impl PatternStrategy {
    pub fn new(names: &[String]) -> Self {
        Self {
            compiled: names
                .iter()
                .map(|n| (n.clone(), call_patterns(n)))
                .collect(),
        }
    }

    fn patterns_for(&self, name: &str) -> Cow<'_, [Regex]> {
        match self.compiled.iter().find(|(n, _)| n == name) {
            Some((_, patterns)) => Cow::Borrowed(patterns.as_slice()),
            None => Cow::Owned(call_patterns(name)),
        }
    }

    pub fn compiled_names(&self) -> impl Iterator<Item = &str> {
        self.compiled.iter().map(|(n, _)| n.as_str())
    }
}

impl TextCallStrategy for PatternStrategy {
    fn extract(&self, text: &str, whitelist: &[String]) -> Vec<ToolInvocation> {
        let mut found: Vec<(usize, ToolInvocation)> = Vec::new();

        for name in whitelist {
            for pattern in self.patterns_for(name).iter() {
                for m in pattern.find_iter(text) {
                    // 每个模式都以 '(' 结尾
                    let open = m.end() - 1;
                    let Some(close) = find_closing(text, open) else {
                        tracing::debug!(tool = %name, "dropping text call: unbalanced parentheses");
                        continue;
                    };
                    match parse_call_args(&text[open + 1..close]) {
                        Some(args) => found.push((
                            m.start(),
                            ToolInvocation::with_derived_id(name.clone(), args),
                        )),
                        None => tracing::debug!(
                            tool = %name,
                            raw = %&text[m.start()..=close],
                            "dropping text call: unparseable arguments"
                        ),
                    }
                }
            }
        }

        found.extend(json_object_calls(text, whitelist));
        found.sort_by_key(|(pos, _)| *pos);
        found.into_iter().map(|(_, call)| call).collect()
    }
}

/// 某个工具名的调用起点模式：反引号、粗体、裸调用
fn call_patterns(name: &str) -> Vec<Regex> {
    let n = regex::escape(name);
    [
        format!(r"`{}\s*\(", n),
        format!(r"\*\*{}\*\*\s*\(", n),
        format!(r"(?:^|[^A-Za-z0-9_.\-]){}\s*\(", n),
    ]
    .iter()
    .filter_map(|p| match Regex::new(p) {
        Ok(r) => Some(r),
        Err(e) => {
            tracing::warn!(pattern = %p, error = %e, "invalid call pattern");
            None
        }
    })
    .collect()
}

/// 从 open 处的括号开始找配对的闭括号；引号内的括号忽略；不配对或引号未闭合返回 None
fn find_closing(text: &str, open: usize) -> Option<usize> {
    let mut stack: Vec<char> = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (offset, ch) in text[open..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '(' | '{' | '[' => stack.push(ch),
            ')' | '}' | ']' => {
                let expected = match ch {
                    ')' => '(',
                    '}' => '{',
                    _ => '[',
                };
                if stack.pop() != Some(expected) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn kv_regex() -> Option<&'static Regex> {
    static KV: OnceLock<Option<Regex>> = OnceLock::new();
    KV.get_or_init(|| {
        Regex::new(
            r#"([A-Za-z_][A-Za-z0-9_]*)\s*[=:]\s*(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'|([^,\s"'()]+))"#,
        )
        .ok()
    })
    .as_ref()
}

/// 解析括号内的参数：空、JSON 对象、或逗号分隔的 key="value"（值一律为字符串）
fn parse_call_args(inner: &str) -> Option<ToolArgs> {
    let inner = inner.trim();
    if inner.is_empty() {
        return Some(ToolArgs::new());
    }
    if inner.starts_with('{') {
        return serde_json::from_str::<Value>(inner)
            .ok()
            .and_then(ToolArgs::from_value);
    }

    let mut args = ToolArgs::new();
    let mut last_end = 0;
    for caps in kv_regex()?.captures_iter(inner) {
        let whole = caps.get(0)?;
        // 两个键值对之间只允许分隔符
        if !is_separator(&inner[last_end..whole.start()]) {
            return None;
        }
        last_end = whole.end();
        let key = caps.get(1)?.as_str();
        let value = if let Some(v) = caps.get(2).or_else(|| caps.get(3)) {
            unescape(v.as_str())
        } else {
            caps.get(4)?.as_str().to_string()
        };
        args.insert(key, value);
    }
    if args.is_empty() || !is_separator(&inner[last_end..]) {
        return None;
    }
    Some(args)
}

fn is_separator(s: &str) -> bool {
    s.chars().all(|c| c == ',' || c.is_whitespace())
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// 文本中的 `{"tool": "name", "args": {...}}` / `{"name": ..., "arguments": ...}` 对象
fn json_object_calls(text: &str, whitelist: &[String]) -> Vec<(usize, ToolInvocation)> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = text[cursor..].find('{') {
        let start = cursor + rel;
        let Some(end) = find_closing(text, start) else {
            cursor = start + 1;
            continue;
        };
        match serde_json::from_str::<Value>(&text[start..=end])
            .ok()
            .and_then(|v| call_from_json(&v, whitelist))
        {
            Some(call) => {
                out.push((start, call));
                cursor = end + 1;
            }
            None => cursor = start + 1,
        }
    }
    out
}

fn call_from_json(value: &Value, whitelist: &[String]) -> Option<ToolInvocation> {
    let obj = value.as_object()?;
    let name = ["tool", "name", "tool_name"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))?;
    if !whitelist.iter().any(|w| w == name) {
        return None;
    }
    let raw_args = ["args", "arguments", "parameters"]
        .iter()
        .find_map(|k| obj.get(*k))
        .cloned()
        .unwrap_or(Value::Null);
    // 有的模型把 arguments 写成 JSON 字符串
    let raw_args = match raw_args {
        Value::String(s) => serde_json::from_str(&s).ok()?,
        other => other,
    };
    let args = ToolArgs::from_value(raw_args)?;
    Some(ToolInvocation::with_derived_id(name, args))
}
