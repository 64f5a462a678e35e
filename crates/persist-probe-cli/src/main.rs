use clap::{ArgAction, Parser};
use persist_probe::{
    Credentials, DEFAULT_API_PREFIX, DEFAULT_MAX_ITERATIONS, DEFAULT_PROMPT, DEFAULT_WORKING_DIR,
    HttpAgentApi, ProbeConfig, ProbeEvent, ProbeEventKind, ProbeEventSink, ProbeRunResult,
    ProbeRunner, ProbeStatus, SessionOptions, TimingConfig, probe_event_channel,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "persist-probe", version)]
#[command(about = "Checks that an agent session keeps working after its client disconnects")]
struct Cli {
    #[arg(long, env = "PERSIST_PROBE_BASE_URL")]
    base_url: String,
    #[arg(long, env = "PERSIST_PROBE_API_PREFIX", default_value = DEFAULT_API_PREFIX)]
    api_prefix: String,
    #[arg(long, env = "PERSIST_PROBE_IDENTIFIER")]
    identifier: String,
    #[arg(long, env = "PERSIST_PROBE_SECRET", hide_env_values = true)]
    secret: String,
    #[arg(long, env = "PERSIST_PROBE_AGENT_FILE")]
    agent_file: String,
    #[arg(long, env = "PERSIST_PROBE_PROMPT")]
    prompt: Option<String>,
    #[arg(long, env = "PERSIST_PROBE_PROMPT_FILE")]
    prompt_file: Option<PathBuf>,
    #[arg(long, env = "PERSIST_PROBE_MAX_ITERATIONS", default_value_t = DEFAULT_MAX_ITERATIONS)]
    max_iterations: u32,
    #[arg(
        long,
        env = "PERSIST_PROBE_TOOLS_APPROVED",
        default_value_t = true,
        action = ArgAction::Set
    )]
    tools_approved: bool,
    #[arg(long, env = "PERSIST_PROBE_WORKING_DIR", default_value = DEFAULT_WORKING_DIR)]
    working_dir: String,
    #[arg(long, env = "PERSIST_PROBE_DISCONNECT_AFTER_SECS", value_parser = parse_seconds)]
    disconnect_after_secs: Option<Duration>,
    #[arg(long, env = "PERSIST_PROBE_PROGRESS_WAIT_SECS", value_parser = parse_seconds)]
    progress_wait_secs: Option<Duration>,
    #[arg(long, env = "PERSIST_PROBE_POLL_INTERVAL_SECS", value_parser = parse_seconds)]
    poll_interval_secs: Option<Duration>,
    #[arg(long, env = "PERSIST_PROBE_RESUME_WINDOW_SECS", value_parser = parse_seconds)]
    resume_window_secs: Option<Duration>,
    #[arg(long, env = "PERSIST_PROBE_REQUEST_TIMEOUT_SECS", value_parser = parse_seconds)]
    request_timeout_secs: Option<Duration>,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return if error.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_tracing();

    match run_command(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(cli: Cli) -> Result<ExitCode, String> {
    let prompt = load_prompt(cli.prompt_file.as_deref(), cli.prompt.as_deref())?;
    let (event_sink, event_task) = event_stream(!cli.no_stream_events, cli.event_json);
    let config = build_config(cli, prompt);

    let api = HttpAgentApi::from_config(&config);
    let run_result = ProbeRunner::new(api, config)
        .with_events(event_sink)
        .run()
        .await;

    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }

    print_run_summary(&run_result);
    Ok(exit_code_for_status(run_result.status))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_config(cli: Cli, prompt: String) -> ProbeConfig {
    let defaults = TimingConfig::default();
    let mut config = ProbeConfig::new(
        cli.base_url,
        Credentials::new(cli.identifier, cli.secret),
        cli.agent_file,
    );
    config.api_prefix = cli.api_prefix;
    config.prompt = prompt;
    config.session = SessionOptions {
        max_iterations: cli.max_iterations,
        tools_approved: cli.tools_approved,
        working_dir: cli.working_dir,
    };
    config.timing = TimingConfig {
        disconnect_after: cli.disconnect_after_secs.unwrap_or(defaults.disconnect_after),
        progress_wait: cli.progress_wait_secs.unwrap_or(defaults.progress_wait),
        poll_interval: cli.poll_interval_secs.unwrap_or(defaults.poll_interval),
        resume_window: cli.resume_window_secs.unwrap_or(defaults.resume_window),
        request_timeout: cli.request_timeout_secs.unwrap_or(defaults.request_timeout),
    };
    config
}

fn load_prompt(prompt_file: Option<&Path>, prompt: Option<&str>) -> Result<String, String> {
    match (prompt_file, prompt) {
        (Some(_), Some(_)) => Err("provide only one of --prompt-file or --prompt".to_string()),
        (None, None) => Ok(DEFAULT_PROMPT.to_string()),
        (Some(path), None) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("failed reading prompt file '{}': {e}", path.display()))?;
            let prompt = text.trim();
            if prompt.is_empty() {
                return Err(format!("prompt file '{}' is empty", path.display()));
            }
            Ok(prompt.to_string())
        }
        (None, Some(prompt)) if prompt.trim().is_empty() => {
            Err("--prompt must not be empty".to_string())
        }
        (None, Some(prompt)) => Ok(prompt.to_string()),
    }
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let seconds: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{raw}' is not a number of seconds"))?;
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| format!("'{raw}' must be a finite, non-negative number of seconds"))
}

fn event_stream(
    stream_events: bool,
    event_json: bool,
) -> (ProbeEventSink, Option<tokio::task::JoinHandle<()>>) {
    if !stream_events {
        return (ProbeEventSink::default(), None);
    }

    let (tx, mut rx) = probe_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (ProbeEventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &ProbeEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        event_kind_text(&event.kind)
    );
}

fn event_kind_text(kind: &ProbeEventKind) -> String {
    match kind {
        ProbeEventKind::StateReached { state } => format!("state {state}"),
        ProbeEventKind::StreamOpened {
            phase,
            session_id,
            messages_sent,
        } => format!(
            "stream_opened phase={} session={session_id} messages={messages_sent}",
            phase.as_str()
        ),
        ProbeEventKind::StreamEvent {
            phase,
            index,
            event_type,
        } => format!("stream_event phase={} #{index} {event_type}", phase.as_str()),
        ProbeEventKind::StreamClosed {
            phase,
            event_count,
            termination,
        } => format!(
            "stream_closed phase={} events={event_count} termination={}",
            phase.as_str(),
            termination.label()
        ),
        ProbeEventKind::ProgressChecked {
            total_messages,
            assistant_messages,
            tool_messages,
            ..
        } => format!(
            "progress messages={total_messages} assistant={assistant_messages} tool={tool_messages}"
        ),
        ProbeEventKind::RunFailed { failed_at, reason } => {
            format!("run_failed at={failed_at} reason={reason}")
        }
        ProbeEventKind::RunPassed {
            session_id,
            resumed_events,
        } => format!("run_passed session={session_id} resumed_events={resumed_events}"),
    }
}

fn print_run_summary(result: &ProbeRunResult) {
    println!(
        "status: {}",
        match result.status {
            ProbeStatus::Pass => "pass",
            ProbeStatus::Fail => "fail",
        }
    );
    println!(
        "session_id: {}",
        result
            .session_id
            .as_ref()
            .map_or("<none>", |session| session.as_str())
    );
    println!(
        "reached: {}",
        result.reached.map_or("<none>", |state| state.as_str())
    );
    if let Some(report) = result.initial_stream.as_ref() {
        println!(
            "initial_events: {} ({})",
            report.event_count,
            report.termination.label()
        );
    }
    if let Some(progress) = result.progress.as_ref() {
        println!(
            "progress: messages={} assistant={} tool={}",
            progress.verdict.total_messages,
            progress.verdict.assistant_messages,
            progress.verdict.tool_messages
        );
    }
    if let Some(report) = result.resume.as_ref() {
        println!("resumed_events: {}", report.event_count);
    }
    if let Some(state) = result.failed_at {
        println!("failed_at: {state}");
    }
    if let Some(failure) = result.failure.as_ref() {
        println!("failure_reason: {failure}");
    }

    match (result.status, result.failed_at) {
        (ProbeStatus::Pass, _) => {
            println!("PASS: session kept working after the client disconnected")
        }
        (ProbeStatus::Fail, Some(state)) => println!("FAIL at {state}"),
        (ProbeStatus::Fail, None) => println!("FAIL"),
    }
}

fn exit_code_for_status(status: ProbeStatus) -> ExitCode {
    match status {
        ProbeStatus::Pass => ExitCode::SUCCESS,
        ProbeStatus::Fail => ExitCode::from(1),
    }
}
