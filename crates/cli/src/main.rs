use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use servekit::env::{HF_ENDPOINT, HF_HOME, NCCL_CUMEM_HOST_ENABLE, NCCL_DEBUG};
use servekit::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::fmt::SubscriberBuilder;

mod provenance;

use provenance::{ensure_parent, write_sidecar, Payload};

#[derive(Parser)]
#[command(name = "cli")]
#[command(about = "Model server launcher and rollout runner")]
struct Cmd {
    /// Optional run tag; propagated to logs and provenance sidecars
    #[arg(long, global = true)]
    tag: Option<String>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Prepare the environment and start `<binary> serve`; exits with the server's code
    Serve(ServeArgs),
    /// Send every instruction in a JSONL file to the server and save the answers
    Rollout {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = servekit::rollout::DEFAULT_BASE_URL)]
        base_url: String,
        #[arg(long, default_value = servekit::rollout::DEFAULT_MODEL)]
        model: String,
        #[arg(long, default_value_t = servekit::rollout::DEFAULT_CONCURRENCY)]
        concurrency: usize,
        #[arg(long, default_value = "")]
        api_key: String,
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Greedy LPT schedule of job durations over workers x threads
    Schedule {
        #[arg(long)]
        workers: usize,
        #[arg(long)]
        threads: usize,
        /// Comma-separated durations in seconds, e.g. 5,3,8,6,2
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        jobs: Vec<f64>,
        /// Print the schedule and summary as JSON instead of text
        #[arg(long)]
        json: bool,
        /// Also write the JSON report to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Seeded shuffle of a JSONL file, keeping the first `count` records
    Sample {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = servekit::dataset::DEFAULT_COUNT)]
        count: usize,
        #[arg(long, default_value_t = servekit::dataset::DEFAULT_SEED)]
        seed: u64,
    },
    /// Print a small provenance JSON block with the default launch plan
    Report,
}

/// Overrides for the default `serve` invocation and its environment.
#[derive(Args, Debug)]
struct ServeArgs {
    /// Server executable [default: vllm]
    #[arg(long)]
    binary: Option<String>,
    /// Model identifier [default: Qwen/Qwen3-8B]
    #[arg(long)]
    model: Option<String>,
    /// Numeric precision [default: auto]
    #[arg(long)]
    dtype: Option<String>,
    /// Maximum context length [default: 32768]
    #[arg(long)]
    max_model_len: Option<u32>,
    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    host: Option<String>,
    /// Bind port; omitted from the command line unless set
    #[arg(long)]
    port: Option<u16>,
    /// Drop `--enable-auto-tool-choice`
    #[arg(long)]
    no_auto_tool_choice: bool,
    /// Tool-call parser name [default: hermes]
    #[arg(long)]
    tool_call_parser: Option<String>,
    /// GPU memory fraction in (0, 1] [default: 0.9]
    #[arg(long)]
    gpu_memory_utilization: Option<f64>,
    /// Data-parallel replica count [default: 8]
    #[arg(long)]
    data_parallel_size: Option<u32>,
    #[arg(long)]
    hf_home: Option<String>,
    #[arg(long)]
    hf_endpoint: Option<String>,
    #[arg(long)]
    nccl_debug: Option<String>,
    #[arg(long)]
    nccl_cumem_host_enable: Option<String>,
    /// Extra child environment, repeatable
    #[arg(long = "set-env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    set_env: Vec<(String, String)>,
    /// Print the launch plan as JSON and exit without starting anything
    #[arg(long)]
    dry_run: bool,
    /// Replace this process with the server instead of waiting on it (unix)
    #[arg(long)]
    exec: bool,
}

impl ServeArgs {
    fn config(&self) -> ServeConfig {
        let d = ServeConfig::default();
        ServeConfig {
            binary: self.binary.clone().unwrap_or(d.binary),
            model: self.model.clone().unwrap_or(d.model),
            dtype: self.dtype.clone().unwrap_or(d.dtype),
            max_model_len: self.max_model_len.unwrap_or(d.max_model_len),
            host: self.host.clone().unwrap_or(d.host),
            port: self.port.or(d.port),
            enable_auto_tool_choice: d.enable_auto_tool_choice && !self.no_auto_tool_choice,
            tool_call_parser: self.tool_call_parser.clone().unwrap_or(d.tool_call_parser),
            gpu_memory_utilization: self
                .gpu_memory_utilization
                .unwrap_or(d.gpu_memory_utilization),
            data_parallel_size: self.data_parallel_size.unwrap_or(d.data_parallel_size),
        }
    }

    fn env(&self) -> EnvSet {
        let mut env = EnvSet::default();
        let overrides = [
            (HF_HOME, &self.hf_home),
            (HF_ENDPOINT, &self.hf_endpoint),
            (NCCL_DEBUG, &self.nccl_debug),
            (NCCL_CUMEM_HOST_ENABLE, &self.nccl_cumem_host_enable),
        ];
        for (name, value) in overrides {
            if let Some(value) = value {
                env.set(name, value.as_str());
            }
        }
        for (name, value) in &self.set_env {
            env.set(name.as_str(), value.as_str());
        }
        env
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

fn main() -> Result<ExitCode> {
    SubscriberBuilder::default()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    let cmd = Cmd::parse();
    match cmd.action {
        Action::Serve(args) => serve(&args, cmd.tag).map(shell_exit),
        Action::Rollout {
            input,
            out,
            base_url,
            model,
            concurrency,
            api_key,
            timeout_secs,
        } => {
            let cfg = RolloutConfig {
                base_url,
                model,
                api_key,
                concurrency,
                timeout: Duration::from_secs(timeout_secs),
            };
            rollout(&input, &out, cfg, cmd.tag).map(|_| ExitCode::SUCCESS)
        }
        Action::Schedule {
            workers,
            threads,
            jobs,
            json,
            out,
        } => schedule(workers, threads, &jobs, json, out, cmd.tag).map(|_| ExitCode::SUCCESS),
        Action::Sample {
            input,
            out,
            count,
            seed,
        } => sample_cmd(&input, &out, count, seed, cmd.tag).map(|_| ExitCode::SUCCESS),
        Action::Report => report(cmd.tag).map(|_| ExitCode::SUCCESS),
    }
}

/// Returns the code the process should exit with: the child's, or a shell-style launch failure code.
fn serve(args: &ServeArgs, tag: Option<String>) -> Result<i32> {
    let plan = args.config().plan(args.env())?;
    tracing::info!(tag = ?tag, cmdline = %plan.display(), "serve");
    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }
    let code = match launch(&plan, args.exec) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "launch failed");
            eprintln!("error: {err}");
            err.exit_code()
        }
    };
    Ok(code)
}

fn launch(plan: &LaunchPlan, exec: bool) -> Result<i32, LaunchError> {
    if exec {
        exec_plan(plan)
    } else {
        plan.run()
    }
}

#[cfg(unix)]
fn exec_plan(plan: &LaunchPlan) -> Result<i32, LaunchError> {
    Err(plan.exec())
}

#[cfg(not(unix))]
fn exec_plan(plan: &LaunchPlan) -> Result<i32, LaunchError> {
    tracing::warn!("--exec is only supported on unix; waiting on the child instead");
    plan.run()
}

fn shell_exit(code: i32) -> ExitCode {
    ExitCode::from(shell_code(code))
}

/// Truncate to the 8 bits a shell sees.
fn shell_code(code: i32) -> u8 {
    (code & 0xff) as u8
}

fn rollout(input: &Path, out: &Path, cfg: RolloutConfig, tag: Option<String>) -> Result<()> {
    tracing::info!(input = %input.display(), out = %out.display(), tag = ?tag, "rollout");
    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let records = read_jsonl(BufReader::new(file))
        .with_context(|| format!("reading {}", input.display()))?;
    let conversations = conversations_from_records(&records)?;

    let params = serde_json::json!({
        "input": input.to_string_lossy(),
        "base_url": cfg.base_url,
        "model": cfg.model,
        "concurrency": cfg.concurrency,
        "timeout_secs": cfg.timeout.as_secs(),
    });
    let client = RolloutClient::new(cfg)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;
    let results = runtime.block_on(client.run(conversations))?;

    ensure_parent(out)?;
    let file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
    let mut writer = BufWriter::new(file);
    write_records(&mut writer, &results)?;
    writer.flush()?;
    write_sidecar(out, Payload::new(params, tag))?;

    println!("Processed {} messages successfully", results.len());
    Ok(())
}

#[derive(Serialize)]
struct ScheduleReport<'a> {
    schedule: &'a Schedule,
    summary: &'a Summary,
}

fn schedule(
    workers: usize,
    threads: usize,
    jobs: &[f64],
    json: bool,
    out: Option<PathBuf>,
    tag: Option<String>,
) -> Result<()> {
    tracing::info!(workers, threads, jobs = jobs.len(), tag = ?tag, "schedule");
    let sched = LptScheduler::new(workers, threads, jobs)?;
    let schedule = sched.greedy_lpt();
    let summary = sched.summary(&schedule);
    let report = ScheduleReport {
        schedule: &schedule,
        summary: &summary,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Workers: {workers}");
        println!("Threads per worker: {threads}");
        println!("Jobs: {jobs:?}");
        println!("\nTimeline\n{}", schedule.timeline());
        print!("{summary}");
    }

    if let Some(out) = out {
        ensure_parent(&out)?;
        std::fs::write(&out, serde_json::to_vec_pretty(&report)?)
            .with_context(|| format!("writing {}", out.display()))?;
        let params = serde_json::json!({ "workers": workers, "threads": threads, "jobs": jobs });
        write_sidecar(&out, Payload::new(params, tag))?;
    }
    Ok(())
}

fn sample_cmd(input: &Path, out: &Path, count: usize, seed: u64, tag: Option<String>) -> Result<()> {
    tracing::info!(input = %input.display(), out = %out.display(), count, seed, "sample");
    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let records = read_jsonl(BufReader::new(file))
        .with_context(|| format!("reading {}", input.display()))?;
    let available = records.len();
    let picked = sample(records, count, seed);
    if picked.len() < count {
        tracing::warn!(available, count, "input shorter than requested count");
    }

    ensure_parent(out)?;
    let file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
    write_jsonl(BufWriter::new(file), &picked)?;
    let params = serde_json::json!({ "input": input.to_string_lossy(), "count": count, "seed": seed });
    write_sidecar(out, Payload::new(params, tag))?;
    Ok(())
}

fn report(tag: Option<String>) -> Result<()> {
    let plan = ServeConfig::default().plan(EnvSet::default())?;
    let obj = serde_json::json!({
        "code_rev": provenance::current_git_rev(),
        "version": servekit::VERSION,
        "tag": tag,
        "serve": plan,
    });
    println!("{}", serde_json::to_string_pretty(&obj)?);
    Ok(())
}
