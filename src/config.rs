//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WAYPOINT__*` 覆盖（双下划线表示嵌套，如 `WAYPOINT__FEEDBACK__MAX_SIZE=8`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub engine: EngineSection,
    pub feedback: FeedbackSection,
    pub narrowing: NarrowingSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [engine] 段：重试预算、退避、调用节流、重规划预算、语音同步
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 条目未显式给出 max_attempts 时的默认值
    pub default_max_attempts: u32,
    /// standard 模式的建议条目数（超出仅告警）
    pub standard_item_advisory: usize,
    /// extended 模式的硬上限
    pub extended_item_limit: usize,
    /// 第 n 次尝试前等待 min(base * 2^(n-2), max) 毫秒
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// 决策类能力调用之间的最小间隔（毫秒），0 表示不节流
    pub min_call_interval_ms: u64,
    /// 单次能力调用超时（秒）
    pub capability_timeout_secs: u64,
    /// 每次 run 最多触发几次深度重规划
    pub max_replans_per_plan: u32,
    /// 为 true 时拒绝过早的 skip（attempt < max_attempts 时降级为 retry）
    pub enforce_skip_policy: bool,
    /// 为 true 时每个阶段结束后等待该阶段的播报完成
    pub sync_narration: bool,
    pub stage_wait_timeout_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            standard_item_advisory: 3,
            extended_item_limit: 10,
            retry_backoff_base_ms: 1000,
            retry_backoff_max_ms: 8000,
            min_call_interval_ms: 0,
            capability_timeout_secs: 60,
            max_replans_per_plan: 2,
            enforce_skip_policy: false,
            sync_narration: false,
            stage_wait_timeout_ms: 10_000,
        }
    }
}

/// [feedback] 段：队列容量、quick 丢弃阈值、条目间隔与三档时长
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackSection {
    pub max_size: usize,
    /// 队列中已有 ≥ 该数量条目时，quick 条目直接丢弃
    pub quick_drop_threshold: usize,
    /// 两条播报之间的固定间隔（毫秒）
    pub gap_ms: u64,
    pub tiers: TierSection,
}

impl Default for FeedbackSection {
    fn default() -> Self {
        Self {
            max_size: 5,
            quick_drop_threshold: 2,
            gap_ms: 100,
            tiers: TierSection::default(),
        }
    }
}

/// [feedback.tiers] 段：每档最长播报时长（毫秒）与默认优先级（数字越小越优先）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TierSection {
    pub quick_ms: u64,
    pub normal_ms: u64,
    pub detailed_ms: u64,
    pub quick_priority: u8,
    pub normal_priority: u8,
    pub detailed_priority: u8,
}

impl Default for TierSection {
    fn default() -> Self {
        Self {
            quick_ms: 200,
            normal_ms: 1000,
            detailed_ms: 3000,
            quick_priority: 1,
            normal_priority: 5,
            detailed_priority: 10,
        }
    }
}

/// [narrowing] 段：执行前先让分类器挑选 1-2 个能力组
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NarrowingSection {
    pub enabled: bool,
    pub max_groups: usize,
    pub groups: Vec<GroupEntry>,
}

impl Default for NarrowingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_groups: 2,
            groups: Vec::new(),
        }
    }
}

/// [[narrowing.groups]] 条目
#[derive(Debug, Clone, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// 从 config 目录加载配置，环境变量 WAYPOINT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WAYPOINT__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("WAYPOINT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
