use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use loadpilot::config::{ExecutorConfig, MasterConfig, RuntimeConfig};
use loadpilot::grpc::master_service::proto_state_name;
use loadpilot::node::MasterNode;
use loadpilot::proto::master_service_client::MasterServiceClient;
use loadpilot::proto::{
    CancelJobRequest, GetJobStatusRequest, JobInfo, ListJobsRequest, MetricKind, SubmitJobRequest,
    UnitSnapshot,
};
use loadpilot::scenario::compiler;
use loadpilot::shutdown::install_shutdown_handler;
use loadpilot::worker::{run_executor, ExecutorOptions};

#[derive(Parser, Debug)]
#[command(name = "loadpilot")]
#[command(version)]
#[command(about = "A load-testing orchestrator running virtual users in isolated executors")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the master: job API, scheduler and agent endpoint
    Server(ServerArgs),

    /// Build a scenario file into a runnable plan
    Compile(CompileArgs),

    /// Run a compiled plan (spawned by the master, not meant for direct use)
    Executor(ExecutorArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Process Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value = "6890")]
    port: u16,

    /// How often the scheduler looks for pending jobs
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,

    /// Upper bound for an executor to become reachable
    #[arg(long, default_value = "2000")]
    ready_timeout_ms: u64,
}

#[derive(Parser, Debug)]
struct CompileArgs {
    /// Scenario source (TOML)
    #[arg(long)]
    source: PathBuf,

    /// Where to write the compiled plan
    #[arg(long)]
    output: PathBuf,
}

#[derive(Parser, Debug)]
struct ExecutorArgs {
    /// Agent endpoint to report metric snapshots to
    #[arg(long)]
    agent_addr: SocketAddr,

    /// Address to expose the control endpoint on
    #[arg(long)]
    executor_addr: SocketAddr,

    /// Compiled plan to run
    #[arg(long)]
    artifact_path: PathBuf,

    #[arg(long)]
    job_id: Uuid,

    /// Interval between periodic metric snapshots
    #[arg(long, default_value = "10000", value_parser = clap::value_parser!(u64).range(1..))]
    snapshot_interval_ms: u64,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Master address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:6890")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a scenario file as a new job
    Submit {
        /// Path to the scenario (TOML)
        file: PathBuf,

        /// Job name (defaults to a generated one)
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Get status and latest metrics of a job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Cancel the running job
    Cancel {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List all jobs
    List,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
    created_at_ms: i64,
}

#[derive(Serialize)]
struct MetricOutput {
    title: String,
    kind: &'static str,
    value: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    p95: Option<u64>,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    name: String,
    state: &'static str,
    error: String,
    created_at_ms: i64,
    updated_at_ms: i64,
    metrics: Vec<MetricOutput>,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobStatusOutput>,
    total_count: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(ansi: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(ansi)
        .init();
}

fn metric_kind_name(kind: i32) -> &'static str {
    match MetricKind::try_from(kind) {
        Ok(MetricKind::Counter) => "counter",
        Ok(MetricKind::Histogram) => "histogram",
        Ok(MetricKind::Gauge) => "gauge",
        _ => "unknown",
    }
}

fn metric_output(unit: UnitSnapshot) -> MetricOutput {
    MetricOutput {
        kind: metric_kind_name(unit.kind),
        p95: unit.histogram.as_ref().map(|h| h.p95),
        title: unit.title,
        value: unit.value,
    }
}

fn job_output(job: JobInfo) -> JobStatusOutput {
    JobStatusOutput {
        job_id: job.job_id,
        name: job.name,
        state: proto_state_name(job.state),
        error: job.error,
        created_at_ms: job.created_at_ms,
        updated_at_ms: job.updated_at_ms,
        metrics: job.metrics.into_iter().map(metric_output).collect(),
    }
}

// =============================================================================
// Process Implementations
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(true);

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = MasterConfig::new(listen_addr)
        .with_poll_interval_ms(args.poll_interval_ms)
        .with_executor(ExecutorConfig::default().with_ready_timeout_ms(args.ready_timeout_ms));

    tracing::info!(
        listen_addr = %config.listen_addr,
        poll_interval_ms = config.poll_interval_ms,
        ready_timeout_ms = config.executor.ready_timeout_ms,
        "Starting loadpilot master"
    );

    let shutdown = install_shutdown_handler();
    MasterNode::new(config).run(shutdown).await?;
    Ok(())
}

async fn run_executor_process(args: ExecutorArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Output is captured and re-logged by the master.
    init_logging(false);

    let options = ExecutorOptions {
        agent_addr: args.agent_addr,
        executor_addr: args.executor_addr,
        artifact_path: args.artifact_path,
        job_id: args.job_id,
        runtime: RuntimeConfig {
            snapshot_interval_ms: args.snapshot_interval_ms,
        },
    };

    let shutdown = install_shutdown_handler();
    run_executor(options, shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client: &mut MasterServiceClient<Channel>,
    file: PathBuf,
    name: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = tokio::fs::read_to_string(&file).await?;

    match client
        .submit_job(SubmitJobRequest { name, scenario })
        .await
    {
        Ok(response) => {
            let resp = response.into_inner();
            match output_format {
                OutputFormat::Json => {
                    let output = JobSubmitOutput {
                        job_id: resp.job_id,
                        created_at_ms: resp.created_at_ms,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", resp.job_id);
                }
            }
        }
        Err(status) => {
            eprintln!("Error: Job submission failed: {}", status.message());
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &mut MasterServiceClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .get_job_status(GetJobStatusRequest { job_id })
        .await?
        .into_inner();
    let job = job_output(response);

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        OutputFormat::Table => {
            println!("Job ID:  {}", job.job_id);
            println!("Name:    {}", job.name);
            println!("State:   {}", job.state);
            if !job.error.is_empty() {
                println!("Error:");
                for line in job.error.lines() {
                    println!("  {}", line);
                }
            }
            if !job.metrics.is_empty() {
                println!();
                println!("{:<24} {:<10} {:>12} {:>10}", "METRIC", "KIND", "VALUE", "P95");
                println!("{}", "-".repeat(59));
                for metric in &job.metrics {
                    let p95 = metric
                        .p95
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<24} {:<10} {:>12} {:>10}",
                        metric.title, metric.kind, metric.value, p95
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    client: &mut MasterServiceClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match client
        .cancel_job(CancelJobRequest {
            job_id: job_id.clone(),
        })
        .await
    {
        Ok(response) => {
            let cancelled = response.into_inner().cancelled;
            match output_format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::json!({ "job_id": job_id, "cancelled": cancelled })
                    );
                }
                OutputFormat::Table => println!("Cancel requested for job {}", job_id),
            }
        }
        Err(status) => {
            eprintln!("Error: {}", status.message());
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &mut MasterServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.list_jobs(ListJobsRequest {}).await?.into_inner();
    let jobs: Vec<JobStatusOutput> = response.jobs.into_iter().map(job_output).collect();

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                total_count: jobs.len(),
                jobs,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<38} {:<14} NAME", "JOB ID", "STATE");
                println!("{}", "-".repeat(70));
                for job in &jobs {
                    println!("{:<38} {:<14} {}", job.job_id, job.state, job.name);
                }
                println!();
                println!("Showing {} jobs", jobs.len());
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Compile(compile_args) => {
            if let Err(e) = compiler::build(&compile_args.source, &compile_args.output) {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
        Commands::Executor(executor_args) => {
            run_executor_process(executor_args).await?;
        }
        Commands::Job { client, command } => {
            let channel = Channel::from_shared(client.addr.clone())?.connect().await?;
            let mut grpc_client = MasterServiceClient::new(channel);

            match command {
                JobCommands::Submit { file, name } => {
                    handle_job_submit(&mut grpc_client, file, name, &client.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::Cancel { job_id } => {
                    handle_job_cancel(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::List => {
                    handle_job_list(&mut grpc_client, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
