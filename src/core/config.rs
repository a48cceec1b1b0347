//! 引擎配置
//!
//! 定义热更新引擎的配置结构和加载逻辑。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::utils::{Result, SwapError};

/// 更新策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// 忽略未被接受的变更（丢弃该模块而不是中止整轮）
    #[serde(default)]
    pub ignore_unaccepted: bool,

    /// 忽略被拒绝的变更
    #[serde(default)]
    pub ignore_declined: bool,

    /// 忽略应用阶段的执行错误
    #[serde(default)]
    pub ignore_errored: bool,

    /// 单次 apply 内的失效排空轮次上限
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

fn default_max_rounds() -> usize {
    32
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            ignore_unaccepted: false,
            ignore_declined: false,
            ignore_errored: false,
            max_rounds: default_max_rounds(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
        }
    }
}

/// 引擎配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 更新策略
    #[serde(default)]
    pub update: UpdatePolicy,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,
}

impl EngineConfig {
    /// 创建配置构建器
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// 从文件加载配置
    ///
    /// 根据扩展名识别 JSON，其余按 YAML 解析。
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await?;

        let mut config: EngineConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.config_path = Some(path);
        config.validate()?;
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.update.max_rounds == 0 {
            return Err(SwapError::InvalidConfigValue {
                key: "update.max_rounds".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        Ok(())
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// 忽略未被接受的变更
    pub fn ignore_unaccepted(mut self) -> Self {
        self.config.update.ignore_unaccepted = true;
        self
    }

    /// 忽略被拒绝的变更
    pub fn ignore_declined(mut self) -> Self {
        self.config.update.ignore_declined = true;
        self
    }

    /// 忽略应用阶段的执行错误
    pub fn ignore_errored(mut self) -> Self {
        self.config.update.ignore_errored = true;
        self
    }

    /// 设置失效排空轮次上限
    pub fn max_rounds(mut self, rounds: usize) -> Self {
        self.config.update.max_rounds = rounds;
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(!config.update.ignore_unaccepted);
        assert!(!config.update.ignore_declined);
        assert!(!config.update.ignore_errored);
        assert_eq!(config.update.max_rounds, 32);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::builder()
            .ignore_unaccepted()
            .max_rounds(8)
            .log_level("debug")
            .json_logging()
            .build();

        assert!(config.update.ignore_unaccepted);
        assert_eq!(config.update.max_rounds, 8);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_validate_rejects_zero_rounds() {
        let config = EngineConfig::builder().max_rounds(0).build();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(SwapError::InvalidConfigValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_from_yaml_file() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            r#"
update:
  ignore_declined: true
  max_rounds: 4
logging:
  level: debug
"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).await.unwrap();
        assert!(config.update.ignore_declined);
        assert!(!config.update.ignore_unaccepted);
        assert_eq!(config.update.max_rounds, 4);
        assert_eq!(config.logging.level, "debug");
        assert!(config.config_path.is_some());
    }

    #[tokio::test]
    async fn test_from_json_file() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"update": {{"ignore_errored": true}}, "logging": {{"level": "warn"}}}}"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).await.unwrap();
        assert!(config.update.ignore_errored);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.update.max_rounds, 32);
    }

    #[tokio::test]
    async fn test_from_missing_file() {
        let result = EngineConfig::from_file("/nonexistent/config.yaml").await;
        assert!(matches!(result, Err(SwapError::Io(_))));
    }
}
