//! 候选集合目录：工具类别 → 按优先级排列的远端集合名
//!
//! 输出流不说明标识符属于哪个集合，只能按类别逐个探测。目录是封闭、按领域整理的数据；
//! 真实集合不在列表里的标识符会被判为未核验（已知局限）。新增类别只需加一行数据。

use crate::config::{CategoryEntry, VerificationSection};
use crate::core::ToolInvocation;

/// 内置 ServiceNow 目录：(类别, 服务名关键词, 候选表)
const SERVICENOW_CATALOG: &[(&str, &[&str], &[&str])] = &[
    (
        "deployment",
        &["deployment", "development"],
        &["sp_widget", "sys_ui_page", "sys_script_include", "sys_ui_action", "sp_page"],
    ),
    (
        "operations",
        &["operations", "itsm"],
        &["incident", "change_request", "problem", "sc_req_item", "task"],
    ),
    (
        "automation",
        &["automation", "scheduler"],
        &["sys_script", "sysauto_script", "sys_script_client", "sys_ui_policy", "sys_script_fix"],
    ),
    (
        "integration",
        &["integration", "rest", "mid"],
        &["sys_rest_message", "sys_rest_message_fn", "ecc_agent", "sys_transform_map", "sys_soap_message"],
    ),
    (
        "platform",
        &["platform", "update-set", "update_set"],
        &["sys_update_set", "sys_script_include", "sys_properties", "sys_db_object"],
    ),
];

/// 一个工具类别
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCategory {
    pub name: String,
    pub server_keywords: Vec<String>,
    pub collections: Vec<String>,
}

impl From<&CategoryEntry> for ToolCategory {
    fn from(entry: &CategoryEntry) -> Self {
        Self {
            name: entry.name.clone(),
            server_keywords: entry
                .server_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            collections: entry.collections.clone(),
        }
    }
}

/// 候选集合目录
#[derive(Debug, Clone)]
pub struct CandidateCatalog {
    categories: Vec<ToolCategory>,
    default_category: String,
}

impl CandidateCatalog {
    pub fn new(categories: Vec<ToolCategory>, default_category: impl Into<String>) -> Self {
        Self {
            categories,
            default_category: default_category.into(),
        }
    }

    /// 内置 ServiceNow 目录，默认类别 platform
    pub fn servicenow() -> Self {
        let categories = SERVICENOW_CATALOG
            .iter()
            .map(|(name, keywords, collections)| ToolCategory {
                name: name.to_string(),
                server_keywords: keywords.iter().map(|k| k.to_string()).collect(),
                collections: collections.iter().map(|c| c.to_string()).collect(),
            })
            .collect();
        Self::new(categories, "platform")
    }

    /// 按 [verification] 配置构建；未配置类别时使用内置目录
    pub fn from_config(cfg: &VerificationSection) -> Self {
        if cfg.categories.is_empty() {
            let mut catalog = Self::servicenow();
            if catalog.category(&cfg.default_category).is_some() {
                catalog.default_category = cfg.default_category.clone();
            }
            return catalog;
        }
        let categories: Vec<ToolCategory> = cfg.categories.iter().map(ToolCategory::from).collect();
        for category in &categories {
            if !(3..=6).contains(&category.collections.len()) {
                tracing::warn!(
                    category = %category.name,
                    candidates = category.collections.len(),
                    "category candidate list outside the usual 3-6 range"
                );
            }
        }
        Self::new(categories, cfg.default_category.clone())
    }

    pub fn default_category(&self) -> &str {
        &self.default_category
    }

    pub fn categories(&self) -> &[ToolCategory] {
        &self.categories
    }

    pub fn category(&self, name: &str) -> Option<&ToolCategory> {
        self.categories.iter().find(|c| c.name == name)
    }

    /// 由工具调用的服务名（其次工具名）匹配类别关键词，均不命中时返回默认类别
    pub fn category_for(&self, invocation: &ToolInvocation) -> &str {
        let server = invocation.source_label.to_lowercase();
        let action = invocation.action_label.to_lowercase();
        [server, action]
            .iter()
            .find_map(|label| {
                self.categories.iter().find(|c| {
                    c.server_keywords
                        .iter()
                        .any(|k| !k.is_empty() && label.contains(k.as_str()))
                })
            })
            .map(|c| c.name.as_str())
            .unwrap_or(self.default_category.as_str())
    }

    /// 类别的候选集合（优先级顺序）；未知类别退回默认类别
    pub fn candidates(&self, category: &str) -> &[String] {
        self.category(category)
            .or_else(|| self.category(&self.default_category))
            .map(|c| c.collections.as_slice())
            .unwrap_or(&[])
    }
}

impl Default for CandidateCatalog {
    fn default() -> Self {
        Self::servicenow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(server: &str, tool: &str) -> ToolInvocation {
        ToolInvocation {
            source_label: server.to_string(),
            action_label: tool.to_string(),
            protocol_tag: "MCP".to_string(),
            observed_at: 0,
            raw_excerpt: String::new(),
        }
    }

    #[test]
    fn test_builtin_lists_are_bounded() {
        let catalog = CandidateCatalog::servicenow();
        for category in catalog.categories() {
            assert!(
                (3..=6).contains(&category.collections.len()),
                "{} has {} candidates",
                category.name,
                category.collections.len()
            );
        }
    }

    #[test]
    fn test_category_for_server_name() {
        let catalog = CandidateCatalog::servicenow();
        assert_eq!(catalog.category_for(&invocation("servicenow-deployment", "snow_deploy")), "deployment");
        assert_eq!(catalog.category_for(&invocation("servicenow-operations", "snow_query_table")), "operations");
        assert_eq!(catalog.category_for(&invocation("servicenow-integration", "snow_create_rest_message")), "integration");
        assert_eq!(catalog.category_for(&invocation("claude-flow", "memory_usage")), "platform");
    }

    #[test]
    fn test_unknown_category_falls_back_to_default() {
        let catalog = CandidateCatalog::servicenow();
        assert_eq!(catalog.candidates("nope"), catalog.candidates("platform"));
        assert_eq!(catalog.candidates("operations")[0], "incident");
    }

    #[test]
    fn test_from_config() {
        let cfg = VerificationSection {
            default_category: "custom".to_string(),
            categories: vec![CategoryEntry {
                name: "custom".to_string(),
                server_keywords: vec!["Custom".to_string()],
                collections: vec!["a".into(), "b".into(), "c".into()],
            }],
        };
        let catalog = CandidateCatalog::from_config(&cfg);
        assert_eq!(catalog.category_for(&invocation("my-custom-server", "x")), "custom");
        assert_eq!(catalog.candidates("custom").len(), 3);

        // 未配置类别：内置目录，非法默认类别被忽略
        let fallback = CandidateCatalog::from_config(&VerificationSection {
            default_category: "missing".to_string(),
            categories: Vec::new(),
        });
        assert_eq!(fallback.default_category(), "platform");
    }
}
