//! Waypoint 演示程序
//!
//! 读取计划草稿（JSON，默认 demos/plan.json），用模拟能力执行并以 JSON 打印执行总结。
//!
//! 用法：waypoint [plan.json] [--config path] [--fail-tool name]...（--help 查看说明）

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use waypoint::capability::mock::{
    EchoToolExecutor, FixedAdjuster, FixedReplanner, LogSink, ScriptedVerifier, StaticGroupSelector,
    StaticPlanner, StaticToolPlanner,
};
use waypoint::capability::CapabilityGate;
use waypoint::config::load_config;
use waypoint::executor::{Capabilities, ExecutionEngine};
use waypoint::feedback::FeedbackQueue;
use waypoint::plan::RawPlan;

/// 加载计划草稿并用模拟能力执行，最后以 JSON 打印执行总结
#[derive(Parser, Debug)]
#[command(version, about, name = "waypoint")]
struct Args {
    /// 计划草稿 JSON 文件
    #[arg(default_value = "demos/plan.json")]
    plan: PathBuf,

    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 模拟执行时总是失败的工具，可重复
    #[arg(long = "fail-tool", value_name = "TOOL")]
    fail_tool: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    waypoint::observability::init();

    let args = Args::parse();
    let config = load_config(args.config).context("Failed to load config")?;
    tracing::info!(
        app = config.app.name.as_deref().unwrap_or("waypoint"),
        "config loaded"
    );

    let raw_json = std::fs::read_to_string(&args.plan)
        .with_context(|| format!("Failed to read plan {}", args.plan.display()))?;
    let raw: RawPlan = serde_json::from_str(&raw_json).context("Invalid plan JSON")?;

    let capabilities = Capabilities {
        planner: Arc::new(StaticPlanner::new(raw)),
        tool_planner: Arc::new(StaticToolPlanner::new()),
        executor: Arc::new(EchoToolExecutor::new().failing_tools(args.fail_tool)),
        verifier: Arc::new(ScriptedVerifier::new()),
        adjuster: Arc::new(FixedAdjuster::retry()),
        replanner: Arc::new(FixedReplanner::skip()),
    };
    let feedback = FeedbackQueue::started(Arc::new(LogSink), &config.feedback).await;
    let mut engine = ExecutionEngine::new(capabilities, feedback, &config.engine);

    let first_group: Vec<String> = config
        .narrowing
        .groups
        .first()
        .map(|g| vec![g.name.clone()])
        .unwrap_or_default();
    if let Some(gate) =
        CapabilityGate::from_config(Arc::new(StaticGroupSelector::new(first_group)), &config.narrowing)
    {
        tracing::info!(groups = gate.groups().len(), "capability narrowing enabled");
        engine = engine.with_gate(gate);
    }

    let request = format!("Run plan from {}", args.plan.display());
    let plan = engine
        .create_plan(&request, &serde_json::json!({ "source": args.plan }))
        .await
        .context("Plan rejected")?;
    let plan_id = plan.id.clone();
    let summary = engine.run(plan).await;

    engine
        .wait_for_stage_completion(&format!("plan-{plan_id}:summary"), Duration::from_secs(5))
        .await;
    engine.feedback().stop().await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults_and_repeated_fail_tool() {
        let args = Args::try_parse_from(["waypoint"]).unwrap();
        assert_eq!(args.plan, PathBuf::from("demos/plan.json"));
        assert!(args.config.is_none());
        assert!(args.fail_tool.is_empty());

        let args = Args::try_parse_from([
            "waypoint",
            "my-plan.json",
            "--config",
            "local.toml",
            "--fail-tool",
            "write_file",
            "--fail-tool",
            "fetch_page",
        ])
        .unwrap();
        assert_eq!(args.plan, PathBuf::from("my-plan.json"));
        assert_eq!(args.config, Some(PathBuf::from("local.toml")));
        assert_eq!(args.fail_tool, vec!["write_file", "fetch_page"]);
    }

    #[test]
    fn test_args_reject_unknown_flag_and_show_help() {
        let err = Args::try_parse_from(["waypoint", "--conifg", "x.toml"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
        let help = Args::try_parse_from(["waypoint", "--help"]).unwrap_err();
        assert_eq!(help.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
