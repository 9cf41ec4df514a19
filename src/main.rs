use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use game_highlights::config::{CliOverrides, ConfigLoader};
use game_highlights::{process_video, FfmpegTool, ProcessOutput, VisionClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{warn, Level};

/// 游戏高光提取工具 - 检测场景、AI 评分并导出最精彩的片段
#[derive(Parser, Debug)]
#[command(name = "highlights")]
#[command(about = "游戏高光提取工具：检测场景切点、视觉模型评分、导出 Top-K 片段与元数据", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 从本地视频中提取高光片段
    Extract {
        /// 输入视频文件路径
        video_path: PathBuf,

        /// 导出的片段数量
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// 只评分排序并写入元数据，不导出片段文件
        #[arg(long)]
        dry_run: bool,

        /// 配置文件路径（可选，支持 .ini 格式）
        /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
        #[arg(long)]
        config: Option<PathBuf>,

        /// 场景变化检测阈值 (0.0-1.0)，仅在 cut_source = scene 时使用
        /// 可通过环境变量 HIGHLIGHTS_SCENE_THRESHOLD 或配置文件设置
        #[arg(long)]
        threshold: Option<f64>,

        /// 最小场景持续时间（秒）
        #[arg(long)]
        min_duration: Option<f64>,

        /// 最大场景持续时间（秒）
        #[arg(long)]
        max_duration: Option<f64>,

        /// 评分目标，例如 excitement
        #[arg(long)]
        optimize_for: Option<String>,

        /// 输出根目录，片段写入 <DIR>/clips，元数据写入 <DIR>/metadata
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 生成默认配置文件
    InitConfig {
        /// 配置文件路径
        #[arg(long, default_value = "highlights.ini")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Extract {
            video_path,
            count,
            dry_run,
            config: config_file,
            threshold,
            min_duration,
            max_duration,
            optimize_for,
            output,
        } => {
            let overrides = CliOverrides {
                threshold,
                min_duration,
                max_duration,
                optimize_for,
                top_count: count,
                output_dir: output,
            };
            let config = ConfigLoader::load_config(config_file.as_deref(), &overrides)
                .context("加载配置失败")?;

            // 初始化日志
            let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
            tracing_subscriber::fmt().with_max_level(level).init();

            if config.oracle.api_key.is_none() {
                warn!("未设置环境变量 {}，评分请求可能被拒绝", config.api_key_env);
            }

            println!(
                "使用配置: min_duration={:.1}s, max_duration={:.1}s, top_count={}, optimize_for={}",
                config.process.min_duration,
                config.process.max_duration,
                config.process.top_count,
                config.process.optimize_for
            );

            let media = Arc::new(FfmpegTool::new(config.media_timeout));
            let scorer = Arc::new(VisionClient::new(config.oracle.clone()).context("创建评分客户端失败")?);

            let output = process_video(&video_path, config.process, media, scorer, dry_run)
                .await
                .context("提取高光失败")?;

            print_summary(&output);
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path)
                .with_context(|| format!("生成配置文件失败: {}", path.display()))?;
            println!("已生成默认配置文件: {}", path.display());
        }
    }

    Ok(())
}

fn print_summary(output: &ProcessOutput) {
    let metadata = &output.metadata;
    println!();
    println!("🎮 {} ({:.1}s, {})", metadata.video.name, metadata.video.duration, metadata.video.resolution);
    println!(
        "   评分 {} 个场景，失败 {} 个，入选 {} 个片段",
        metadata.processing.scenes_scored,
        metadata.processing.scoring_failures + metadata.processing.frame_failures,
        metadata.processing.clips_selected
    );

    if metadata.clips.is_empty() {
        println!("   没有可导出的片段");
    }
    for clip in &metadata.clips {
        let target = clip.file.as_deref().unwrap_or("(dry run)");
        println!(
            "   #{} [{:.1}s +{:.1}s] {:>3} 分  {}  {}",
            clip.rank, clip.timestamp, clip.duration, clip.score, clip.description, target
        );
    }
    println!("📄 元数据: {}", output.metadata_path.display());
}
