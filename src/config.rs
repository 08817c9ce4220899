//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__REMOTE__PASSWORD=...`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub fleet: FleetSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub verification: VerificationSection,
    #[serde(default)]
    pub memory: MemorySection,
}

/// [worker] 段：外部 Agent 可执行文件、注入环境、终止宽限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub executable: String,
    pub args: Vec<String>,
    /// 额外注入的环境变量
    pub env: HashMap<String, String>,
    /// 从继承环境中移除的变量（密钥等）
    pub scrub_env: Vec<String>,
    pub worker_id_env: String,
    pub role_env: String,
    pub coordination_env: String,
    pub working_dir: Option<PathBuf>,
    /// SIGTERM 之后等待多久再强杀（毫秒）
    pub termination_grace_ms: u64,
    /// 退出后等待输出流关闭、在途核验完成的上限（毫秒）
    pub drain_timeout_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            executable: "snow-flow".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            scrub_env: default_scrub_env(),
            worker_id_env: "HIVE_WORKER_ID".to_string(),
            role_env: "HIVE_WORKER_ROLE".to_string(),
            coordination_env: "HIVE_COORDINATION_MODE".to_string(),
            working_dir: None,
            termination_grace_ms: 5000,
            drain_timeout_ms: 5000,
        }
    }
}

fn default_scrub_env() -> Vec<String> {
    vec![
        "OPENAI_API_KEY".into(),
        "DEEPSEEK_API_KEY".into(),
        "GITHUB_TOKEN".into(),
        "HIVE__REMOTE__PASSWORD".into(),
    ]
}

/// 单个 Worker 的拉起描述；executable / args 缺省时使用 [worker] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WorkerSpec {
    pub role: String,
    pub instructions: String,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

impl WorkerSpec {
    pub fn new(role: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            instructions: instructions.into(),
            executable: None,
            args: None,
        }
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = Some(args);
        self
    }
}

/// [fleet] 段：轮询间隔、整体超时、Worker 列表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FleetSection {
    pub poll_interval_ms: u64,
    /// 0 表示不限时
    pub timeout_secs: u64,
    pub workers: Vec<WorkerSpec>,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            timeout_secs: 3600,
            workers: Vec::new(),
        }
    }
}

/// [remote] 段：ServiceNow 实例与凭据
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub instance_url: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            instance_url: String::new(),
            username: String::new(),
            password: String::new(),
            timeout_secs: 15,
        }
    }
}

/// [[verification.categories]]：服务名关键词 → 候选集合（按优先级）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CategoryEntry {
    pub name: String,
    #[serde(default)]
    pub server_keywords: Vec<String>,
    pub collections: Vec<String>,
}

/// [verification] 段；categories 为空时使用内置 ServiceNow 目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerificationSection {
    pub default_category: String,
    pub categories: Vec<CategoryEntry>,
}

impl Default for VerificationSection {
    fn default() -> Self {
        Self {
            default_category: "platform".to_string(),
            categories: Vec::new(),
        }
    }
}

/// [memory] 段：共享记忆后端（sqlite / memory）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub backend: String,
    pub path: PathBuf,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: PathBuf::from("hive.db"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
