use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::processor::ProcessConfig;
use crate::retry::RetryConfig;
use crate::video_processor::CutDetection;
use crate::vision_client::{VisionClientConfig, DEFAULT_ENDPOINT, DEFAULT_MODEL};

const ENV_PREFIX: &str = "HIGHLIGHTS_";
const DEFAULT_API_KEY_ENV: &str = "NVIDIA_API_KEY";

/// 扩展配置（包含评分服务、日志等）
#[derive(Debug, Clone)]
pub struct ExtendedConfig {
    /// 高光提取配置
    pub process: ProcessConfig,
    /// 评分服务配置
    pub oracle: VisionClientConfig,
    /// 读取 API key 的环境变量名
    pub api_key_env: String,
    /// 单条 ffmpeg/ffprobe 命令的超时
    pub media_timeout: Duration,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub threshold: Option<f64>,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    pub optimize_for: Option<String>,
    pub top_count: Option<usize>,
    /// 输出根目录，片段写入 `<dir>/clips`，元数据写入 `<dir>/metadata`
    pub output_dir: Option<PathBuf>,
}

/// 单一来源（命令行、环境变量或配置文件）读到的配置，未设置的项为 None
#[derive(Debug, Clone, Default)]
pub struct ConfigLayer {
    pub cut_source: Option<String>,
    pub scene_threshold: Option<f64>,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    pub optimize_for: Option<String>,
    pub genre: Option<String>,
    pub top_count: Option<usize>,
    pub max_scenes: Option<usize>,
    pub score_floor: Option<u8>,
    pub chunk_fallback: Option<bool>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_tokens: Option<u32>,
    pub concurrency: Option<usize>,
    pub abort_failure_ratio: Option<f64>,
    pub abort_min_attempts: Option<usize>,
    pub media_timeout_secs: Option<u64>,
    pub clips_dir: Option<PathBuf>,
    pub metadata_dir: Option<PathBuf>,
    pub clip_extension: Option<String>,
    pub log_level: Option<String>,
}

impl ConfigLayer {
    /// 通过 `(section, key)` 查询函数读取所有配置项
    fn read(get: impl Fn(&str, &str) -> Option<String>) -> Self {
        let text = |section: &str, key: &str| get(section, key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            cut_source: text("highlights", "cut_source"),
            scene_threshold: parse(text("highlights", "scene_threshold")),
            min_duration: parse(text("highlights", "min_duration")),
            max_duration: parse(text("highlights", "max_duration")),
            optimize_for: text("highlights", "optimize_for"),
            genre: text("highlights", "genre"),
            top_count: parse(text("highlights", "top_count")),
            max_scenes: parse(text("highlights", "max_scenes")),
            score_floor: parse(text("highlights", "score_floor")),
            chunk_fallback: text("highlights", "chunk_fallback").and_then(|v| parse_bool(&v)),
            endpoint: text("oracle", "endpoint"),
            model: text("oracle", "model"),
            api_key_env: text("oracle", "api_key_env"),
            timeout_secs: parse(text("oracle", "timeout_secs")),
            max_tokens: parse(text("oracle", "max_tokens")),
            concurrency: parse(text("oracle", "concurrency")),
            abort_failure_ratio: parse(text("oracle", "abort_failure_ratio")),
            abort_min_attempts: parse(text("oracle", "abort_min_attempts")),
            media_timeout_secs: parse(text("media", "timeout_secs")),
            clips_dir: text("output", "clips_dir").map(PathBuf::from),
            metadata_dir: text("output", "metadata_dir").map(PathBuf::from),
            clip_extension: text("output", "clip_extension"),
            log_level: text("logging", "level"),
        }
    }

    /// 环境变量：`HIGHLIGHTS_<KEY>`，媒体超时为 `HIGHLIGHTS_MEDIA_TIMEOUT_SECS`，日志级别为 `LOG_LEVEL`
    pub fn from_env() -> Self {
        Self::read(|section, key| {
            let name = match (section, key) {
                ("logging", "level") => "LOG_LEVEL".to_string(),
                ("media", "timeout_secs") => format!("{}MEDIA_TIMEOUT_SECS", ENV_PREFIX),
                _ => format!("{}{}", ENV_PREFIX, key.to_uppercase()),
            };
            env::var(name).ok()
        })
    }

    /// 从 INI 配置文件读取，节内缺失的项回退到 `[DEFAULT]`
    pub fn from_file(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut config_parser = configparser::ini::Ini::new();
        config_parser
            .load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(Self::read(|section, key| {
            config_parser
                .get(section, key)
                .or_else(|| config_parser.get("DEFAULT", key))
        }))
    }

    /// 按优先级合并：self 中已设置的项优先于 lower
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            cut_source: self.cut_source.or(lower.cut_source),
            scene_threshold: self.scene_threshold.or(lower.scene_threshold),
            min_duration: self.min_duration.or(lower.min_duration),
            max_duration: self.max_duration.or(lower.max_duration),
            optimize_for: self.optimize_for.or(lower.optimize_for),
            genre: self.genre.or(lower.genre),
            top_count: self.top_count.or(lower.top_count),
            max_scenes: self.max_scenes.or(lower.max_scenes),
            score_floor: self.score_floor.or(lower.score_floor),
            chunk_fallback: self.chunk_fallback.or(lower.chunk_fallback),
            endpoint: self.endpoint.or(lower.endpoint),
            model: self.model.or(lower.model),
            api_key_env: self.api_key_env.or(lower.api_key_env),
            timeout_secs: self.timeout_secs.or(lower.timeout_secs),
            max_tokens: self.max_tokens.or(lower.max_tokens),
            concurrency: self.concurrency.or(lower.concurrency),
            abort_failure_ratio: self.abort_failure_ratio.or(lower.abort_failure_ratio),
            abort_min_attempts: self.abort_min_attempts.or(lower.abort_min_attempts),
            media_timeout_secs: self.media_timeout_secs.or(lower.media_timeout_secs),
            clips_dir: self.clips_dir.or(lower.clips_dir),
            metadata_dir: self.metadata_dir.or(lower.metadata_dir),
            clip_extension: self.clip_extension.or(lower.clip_extension),
            log_level: self.log_level.or(lower.log_level),
        }
    }
}

impl From<&CliOverrides> for ConfigLayer {
    fn from(cli: &CliOverrides) -> Self {
        ConfigLayer {
            scene_threshold: cli.threshold,
            min_duration: cli.min_duration,
            max_duration: cli.max_duration,
            optimize_for: cli.optimize_for.clone(),
            top_count: cli.top_count,
            clips_dir: cli.output_dir.as_ref().map(|d| d.join("clips")),
            metadata_dir: cli.output_dir.as_ref().map(|d| d.join("metadata")),
            ..Default::default()
        }
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.parse().ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    ///
    /// 显式指定的配置文件不存在时报错；未指定时依次尝试默认位置，都不存在则只用默认值。
    pub fn load_config(config_file: Option<&Path>, cli: &CliOverrides) -> Result<ExtendedConfig> {
        // 1. 先加载配置文件
        let file_layer = match config_file {
            Some(config_path) => ConfigLayer::from_file(config_path)?,
            None => Self::load_from_default_locations().unwrap_or_default(),
        };

        // 2. 加载环境变量
        let env_layer = ConfigLayer::from_env();

        // 3. 合并配置
        let merged = ConfigLayer::from(cli).or(env_layer).or(file_layer);
        let api_key_env = merged
            .api_key_env
            .clone()
            .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string());
        let api_key = env::var(&api_key_env).ok().filter(|v| !v.is_empty());

        Self::resolve(merged, api_key)
    }

    /// 把合并后的配置层落到默认值上并校验
    pub fn resolve(layer: ConfigLayer, api_key: Option<String>) -> Result<ExtendedConfig> {
        let defaults = ProcessConfig::default();
        let oracle_defaults = VisionClientConfig::default();

        let scene_threshold = layer.scene_threshold.unwrap_or(0.3);
        let cut_detection = match layer.cut_source.as_deref().unwrap_or("keyframes") {
            "keyframes" => CutDetection::Keyframes,
            "scene" => CutDetection::Scene {
                threshold: scene_threshold,
            },
            other => anyhow::bail!("未知的切点来源: {}（可选 keyframes 或 scene）", other),
        };
        if !(0.0..=1.0).contains(&scene_threshold) {
            anyhow::bail!("scene_threshold 必须在 0.0 到 1.0 之间: {}", scene_threshold);
        }

        let min_duration = layer.min_duration.unwrap_or(defaults.min_duration);
        let max_duration = layer.max_duration.unwrap_or(defaults.max_duration);
        if min_duration < 0.0 || max_duration < min_duration {
            anyhow::bail!(
                "场景时长范围无效: min_duration = {}, max_duration = {}",
                min_duration,
                max_duration
            );
        }

        let score_floor = layer.score_floor.unwrap_or(defaults.score_floor);
        if score_floor > 100 {
            anyhow::bail!("score_floor 必须在 0 到 100 之间: {}", score_floor);
        }

        let abort_failure_ratio = layer.abort_failure_ratio.unwrap_or(defaults.abort_failure_ratio);
        if !(0.0..=1.0).contains(&abort_failure_ratio) {
            anyhow::bail!("abort_failure_ratio 必须在 0.0 到 1.0 之间: {}", abort_failure_ratio);
        }

        let model = layer.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let timeout_secs = layer.timeout_secs.unwrap_or(30);

        let process = ProcessConfig {
            cut_detection,
            min_duration,
            max_duration,
            top_count: layer.top_count.unwrap_or(defaults.top_count),
            max_scenes: layer.max_scenes.unwrap_or(defaults.max_scenes),
            score_floor,
            optimize_for: layer.optimize_for.unwrap_or(defaults.optimize_for),
            genre: layer.genre,
            chunk_fallback: layer.chunk_fallback.unwrap_or(defaults.chunk_fallback),
            clips_dir: layer.clips_dir.unwrap_or(defaults.clips_dir),
            metadata_dir: layer.metadata_dir.unwrap_or(defaults.metadata_dir),
            clip_extension: layer.clip_extension.unwrap_or(defaults.clip_extension),
            concurrency: layer.concurrency.unwrap_or(defaults.concurrency).max(1),
            abort_failure_ratio,
            abort_min_attempts: layer.abort_min_attempts.unwrap_or(defaults.abort_min_attempts),
            scoring_retry: RetryConfig::new("场景评分"),
            oracle_model: model.clone(),
        };

        let oracle = VisionClientConfig {
            endpoint: layer.endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            model,
            api_key,
            timeout: Duration::from_secs(timeout_secs),
            max_tokens: layer.max_tokens.unwrap_or(oracle_defaults.max_tokens),
            temperature: oracle_defaults.temperature,
        };

        Ok(ExtendedConfig {
            process,
            oracle,
            api_key_env: layer.api_key_env.unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string()),
            media_timeout: Duration::from_secs(layer.media_timeout_secs.unwrap_or(120)),
            log_level: layer.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<ConfigLayer> {
        // 1. 当前目录的 highlights.ini
        let current_dir_config = PathBuf::from("highlights.ini");
        if current_dir_config.exists() {
            return ConfigLayer::from_file(&current_dir_config);
        }

        // 2. 当前目录的 .highlights.ini
        let hidden_config = PathBuf::from(".highlights.ini");
        if hidden_config.exists() {
            return ConfigLayer::from_file(&hidden_config);
        }

        // 3. 用户主目录的 .highlights.ini
        if let Some(home) = env::var_os("HOME") {
            let home_config = PathBuf::from(home).join(".highlights.ini");
            if home_config.exists() {
                return ConfigLayer::from_file(&home_config);
            }
        }

        // 4. /etc/highlights.ini (Linux/macOS)
        let etc_config = PathBuf::from("/etc/highlights.ini");
        if etc_config.exists() {
            return ConfigLayer::from_file(&etc_config);
        }

        Err(anyhow::anyhow!("未找到配置文件"))
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let mut config_parser = configparser::ini::Ini::new();
        let mut set = |section: &str, key: &str, value: &str| {
            config_parser.set(section, key, Some(value.to_string()));
        };

        set("highlights", "cut_source", "keyframes");
        set("highlights", "scene_threshold", "0.3");
        set("highlights", "min_duration", "2.0");
        set("highlights", "max_duration", "60.0");
        set("highlights", "optimize_for", "excitement");
        set("highlights", "top_count", "3");
        set("highlights", "max_scenes", "20");
        set("highlights", "score_floor", "0");
        set("highlights", "chunk_fallback", "false");
        set("oracle", "endpoint", DEFAULT_ENDPOINT);
        set("oracle", "model", DEFAULT_MODEL);
        set("oracle", "api_key_env", DEFAULT_API_KEY_ENV);
        set("oracle", "timeout_secs", "30");
        set("oracle", "max_tokens", "512");
        set("oracle", "concurrency", "4");
        set("oracle", "abort_failure_ratio", "1.0");
        set("oracle", "abort_min_attempts", "4");
        set("media", "timeout_secs", "120");
        set("output", "clips_dir", "output/clips");
        set("output", "metadata_dir", "output/metadata");
        set("output", "clip_extension", "mp4");
        set("logging", "level", "info");

        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建配置目录失败: {}", parent.display()))?;
        }
        config_parser
            .write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}
