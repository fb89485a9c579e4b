//! 子智能体类型：每种 agentType 对应一段 worker 系统提示词与可选的工具白名单

use std::collections::HashMap;

/// 子智能体画像
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub name: String,
    pub system_prompt: String,
    /// None 表示可用 worker 网关的全部工具
    pub allowed_tools: Option<Vec<String>>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            allowed_tools: None,
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.allowed_tools = Some(tools.iter().map(|t| t.to_string()).collect());
        self
    }
}

/// 内置画像：general / analyst / researcher / coder
pub fn builtin_profiles() -> HashMap<String, AgentProfile> {
    let profiles = vec![
        AgentProfile::new(
            "general",
            "You are a focused worker agent. Complete the assigned task using the available tools \
and reply with a concise, self-contained result.",
        ),
        AgentProfile::new(
            "analyst",
            "You are an analyst worker. Examine the material referenced by the task, reason about it \
step by step and report findings with the evidence you relied on.",
        )
        .with_tools(&["read_file", "list_dir"]),
        AgentProfile::new(
            "researcher",
            "You are a research worker. Gather the facts needed for the task from the workspace, \
cite the files you used and summarise what you found.",
        )
        .with_tools(&["read_file", "list_dir", "echo"]),
        AgentProfile::new(
            "coder",
            "You are a coding worker. Read the relevant source files, then describe the concrete code \
changes or snippets that accomplish the task.",
        )
        .with_tools(&["read_file", "list_dir"]),
    ];
    profiles
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles() {
        let p = builtin_profiles();
        assert_eq!(p.len(), 4);
        assert!(p["general"].allowed_tools.is_none());
        assert!(p["analyst"]
            .allowed_tools
            .as_ref()
            .unwrap()
            .contains(&"read_file".to_string()));
    }
}
