//! turnflow CLI
//!
//! 設定ファイルからエンジンを組み立て、サブコマンドごとに
//! ワークフローの実行やセッションの参照・削除を行います。

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use turnflow::config::Settings;
use turnflow::engine::{EngineEvent, ExecutionStatus, WorkflowEngine, WorkflowResult};
use turnflow::logging;
use turnflow::model::{
    ExtendRequest, InitializeRequest, RecomputeRequest, StepType, Turn, TurnBody, WorkflowRequest,
};
use turnflow::persistence::{FileStore, KvStore, MemoryStore};

type CliResult<T> = Result<T, Box<dyn Error>>;

/// `--config` 省略時に探す設定ファイル
const DEFAULT_CONFIG: &str = "turnflow.toml";

#[derive(Parser)]
#[command(name = "turnflow")]
#[command(about = "複数のAIプロバイダーへ同時に問い合わせ、会話をターン単位で記録する", long_about = None)]
#[command(version)]
struct Cli {
    /// 設定ファイル（TOML）。省略時はカレントディレクトリの turnflow.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// イベントと結果を JSON で出力する
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 新しいセッションを開始する
    Init {
        message: String,
        #[command(flatten)]
        targets: Targets,
    },

    /// セッションの会話を続ける
    Extend {
        session: String,
        message: String,
        #[command(flatten)]
        targets: Targets,
    },

    /// 過去ターンのマッピング・統合を再実行する
    Recompute {
        session: String,
        source_turn: String,
        #[arg(long, value_enum)]
        step: RecomputeStep,
        /// 再実行に使うプロバイダー
        #[arg(long)]
        provider: String,
    },

    /// セッション一覧
    Sessions,

    /// セッションのタイムラインを表示する
    Show { session: String },

    /// セッションを削除する
    Delete { session: String },

    /// プロバイダーのヘルスチェック
    Health,
}

#[derive(clap::Args)]
struct Targets {
    /// 問い合わせるプロバイダー（複数指定可）
    #[arg(short, long = "provider", required = true)]
    providers: Vec<String>,

    /// マッピングに使うプロバイダー
    #[arg(long)]
    mapping: Option<String>,

    /// 統合に使うプロバイダー
    #[arg(long)]
    synthesis: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum RecomputeStep {
    Mapping,
    Synthesis,
}

impl From<RecomputeStep> for StepType {
    fn from(step: RecomputeStep) -> Self {
        match step {
            RecomputeStep::Mapping => StepType::Mapping,
            RecomputeStep::Synthesis => StepType::Synthesis,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None if std::path::Path::new(DEFAULT_CONFIG).exists() => Settings::from_file(DEFAULT_CONFIG)?,
        None => Settings::default(),
    };
    let _log_guard = logging::init(&settings.logging)?;

    let store: Arc<dyn KvStore> = match &settings.persistence.store_path {
        Some(path) => Arc::new(FileStore::open(path).await?),
        None => Arc::new(MemoryStore::new()),
    };
    let engine = WorkflowEngine::from_settings(&settings, store);

    match cli.command {
        Commands::Init { message, targets } => {
            let request = WorkflowRequest::Initialize(InitializeRequest {
                user_message: message,
                provider_ids: targets.providers,
                mapping_provider: targets.mapping,
                synthesis_provider: targets.synthesis,
            });
            run_workflow(&engine, request, cli.json).await
        }
        Commands::Extend {
            session,
            message,
            targets,
        } => {
            let request = WorkflowRequest::Extend(ExtendRequest {
                session_id: session,
                user_message: message,
                provider_ids: targets.providers,
                mapping_provider: targets.mapping,
                synthesis_provider: targets.synthesis,
            });
            run_workflow(&engine, request, cli.json).await
        }
        Commands::Recompute {
            session,
            source_turn,
            step,
            provider,
        } => {
            let request = WorkflowRequest::Recompute(RecomputeRequest {
                session_id: session,
                source_turn_id: source_turn,
                step_type: step.into(),
                target_provider: provider,
            });
            run_workflow(&engine, request, cli.json).await
        }
        Commands::Sessions => {
            let sessions = engine.persistence().list_sessions().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                for session in sessions {
                    println!("{}  {}  {}", session.id, session.last_activity.to_rfc3339(), session.title);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Show { session } => show_session(&engine, &session, cli.json).await,
        Commands::Delete { session } => {
            engine.persistence().delete_session(&session).await?;
            println!("deleted {}", session);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Health => {
            let report = engine.orchestrator().health_report().await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for health in &report {
                    let mark = if health.healthy { "ok" } else { "NG" };
                    println!("{:<12} {:<3} circuit={}", health.provider_id, mark, health.circuit);
                }
            }
            let all_healthy = report.iter().all(|health| health.healthy);
            Ok(if all_healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

async fn run_workflow(engine: &WorkflowEngine, request: WorkflowRequest, json: bool) -> CliResult<ExitCode> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event, json);
        }
    });
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = engine.execute(request, tx, cancel).await;
    interrupt.abort();
    printer.await?;
    let result = result?;

    if json {
        println!("{}", result.to_json()?);
    } else {
        print_summary(&result);
    }

    Ok(match result.status {
        ExecutionStatus::Failed => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

fn print_event(event: &EngineEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("event serialization failed: {}", e),
        }
        return;
    }

    match event {
        EngineEvent::StepUpdate {
            step_id, status, error, ..
        } => match error {
            Some(error) => eprintln!("[{}] {:?}: {}", step_id, status, error),
            None => eprintln!("[{}] {:?}", step_id, status),
        },
        EngineEvent::PartialBatch { updates, .. } => {
            let mut stdout = std::io::stdout().lock();
            for update in updates.iter().filter(|update| !update.text.is_empty()) {
                let _ = write!(stdout, "[{}/{}] {}", update.response_type, update.provider_id, update.text);
            }
            let _ = stdout.flush();
        }
        EngineEvent::WorkflowComplete { error: Some(error), .. } => eprintln!("workflow failed: {}", error),
        EngineEvent::WorkflowComplete { .. } => {}
        EngineEvent::Persisted { receipt } => {
            eprintln!(
                "saved session={} turn={}",
                receipt.session_id,
                receipt.ai_turn_id.as_deref().unwrap_or("-")
            );
        }
        EngineEvent::PersistenceFailed { attempts, error, .. } => {
            eprintln!("persistence failed after {} attempts: {}", attempts, error);
        }
    }
}

fn print_summary(result: &WorkflowResult) {
    println!();
    println!("session: {}", result.session_id);
    for step in &result.steps {
        println!("== {} ({:?}) ==", step.step_id, step.status);
        for (provider_id, output) in &step.outputs {
            println!("--- {} ({} ms)", provider_id, output.latency_ms);
            println!("{}", output.text.trim());
        }
        for (provider_id, failure) in &step.failures {
            println!("--- {} failed: {:?} {}", provider_id, failure.kind, failure.message);
        }
    }
    println!(
        "status: {:?}  tokens: {}  duration: {:?}",
        result.status, result.total_tokens_used, result.total_duration
    );
}

fn print_turn(turn: &Turn, indent: &str) {
    match &turn.body {
        TurnBody::User { text } => println!("{}#{} user: {}", indent, turn.sequence, text),
        TurnBody::Assistant(assistant) => println!(
            "{}#{} assistant [{}] {}",
            indent, turn.sequence, assistant.turn_type, turn.id
        ),
    }
}

async fn show_session(engine: &WorkflowEngine, session_id: &str, json: bool) -> CliResult<ExitCode> {
    let persistence = engine.persistence();
    let Some(session) = persistence.get_session(session_id).await? else {
        eprintln!("session '{}' not found", session_id);
        return Ok(ExitCode::FAILURE);
    };
    let timeline = persistence.timeline(session_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({
            "session": session,
            "timeline": timeline,
        }))?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}  {}", session.id, session.title);
    for turn in &timeline {
        print_turn(turn, "");
        if turn.as_assistant().is_none() {
            continue;
        }
        for response in persistence.responses_for_turn(&turn.id).await? {
            println!(
                "    [{}/{}] {:?}: {}",
                response.response_type,
                response.provider_id,
                response.status,
                response.text.lines().next().unwrap_or_default()
            );
        }
        for branch in persistence.recompute_branches(&turn.id).await? {
            print_turn(&branch, "    ↳ ");
        }
    }
    Ok(ExitCode::SUCCESS)
}
