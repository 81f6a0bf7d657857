//! Combo Bench - prefill/decode throughput sweep over a grid of prompt
//! lengths, generation lengths and parallel sequence counts

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, ValueEnum};
use combo_core::{
    load_model_dims, run_sweep, DecodeEngine, EngineParams, FailurePolicy, ModelConfig,
    MonotonicClock, OutputFormat, ReferenceEngine, Reporter, SweepConfig,
};
use std::process::ExitCode;
use tracing::{info, warn, Level};

#[derive(Debug, Parser)]
#[command(name = "combo-bench", version, about)]
struct Args {
    /// Local model directory, config.json, HuggingFace model id, or "tiny"
    model: String,

    /// Parallel sequence counts, comma separated
    #[arg(default_value = "1,2,4,8,16,32", value_parser = parse_list)]
    pl: List,

    /// Prompt lengths, comma separated
    #[arg(default_value = "128,256,512,1024,2048,3584,7680", value_parser = parse_list)]
    pp: List,

    /// Generation lengths, comma separated
    #[arg(default_value = "128,256", value_parser = parse_list)]
    tg: List,

    /// Repeats per grid point
    #[arg(default_value_t = 3)]
    repeat: usize,

    /// CPU/GPU work-split strategy: 0 gradient descent, 1 cold start,
    /// 2 constant ratio, 3 CPU only, 4 iGPU only. The reference engine runs
    /// on a single device, so this is only reported.
    #[arg(default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=4))]
    algorithm: u8,

    /// KV cache size in token slots
    #[arg(default_value_t = 8192)]
    kv_max: usize,

    /// Layers to offload to the GPU; any value above 0 selects CUDA device 0
    #[arg(default_value_t = 0)]
    ngl: usize,

    /// CPU worker threads for the compute backend
    #[arg(short, long)]
    threads: Option<usize>,

    /// Compute the prompt once and share its cache across sequences
    #[arg(long)]
    shared_prefill: bool,

    /// Maximum tokens per decode call
    #[arg(long, default_value_t = 4096)]
    n_batch: usize,

    /// Tokens decoded once before the sweep; 0 disables
    #[arg(long, default_value_t = 32)]
    warmup: usize,

    #[arg(long, value_enum, default_value_t = FailureArg::Abort)]
    on_failure: FailureArg,

    #[arg(long, value_enum, default_value_t = FormatArg::Table)]
    format: FormatArg,

    /// Seed for the reference engine weights
    #[arg(long, default_value_t = 1234)]
    seed: u64,

    /// Model revision on the Hub
    #[arg(long, default_value = "main")]
    revision: String,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone)]
struct List(Vec<usize>);

fn parse_list(s: &str) -> Result<List, String> {
    s.split(',')
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid value {:?}: {}", v, e))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(List)
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FailureArg {
    /// Stop the sweep at the first failed decode
    Abort,
    /// Record the grid point as skipped and continue
    Skip,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Table,
    Json,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // candle sizes its CPU matmul parallelism from this variable on every call
    if let Some(threads) = args.threads {
        std::env::set_var("RAYON_NUM_THREADS", threads.to_string());
    }

    // Results go to stdout, so logs must not
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let device = select_device(args.ngl)?;

    let model_config = ModelConfig {
        model_id: args.model.clone(),
        revision: args.revision.clone(),
        ..Default::default()
    };
    let dims = load_model_dims(&model_config)
        .with_context(|| format!("loading model {}", args.model))?;

    let params = EngineParams {
        n_ctx: args.kv_max,
        n_batch: args.n_batch,
        seed: args.seed,
        ..Default::default()
    };
    let mut engine = ReferenceEngine::new(&dims, params, device, model_config.dtype)?;

    let config = SweepConfig {
        prompt_lens: args.pp.0,
        gen_lens: args.tg.0,
        parallelism: args.pl.0,
        repeat_count: args.repeat,
        cache_budget: args.kv_max,
        shared_prefill: args.shared_prefill,
        max_chunk_size: args.n_batch,
        warmup_tokens: args.warmup,
        n_seq_max: engine.params().n_seq_max,
        failure_policy: match args.on_failure {
            FailureArg::Abort => FailurePolicy::AbortSweep,
            FailureArg::Skip => FailurePolicy::SkipGridPoint,
        },
    };

    let p = engine.params();
    info!(
        "main: nthread = {}, n_kv_max = {}, n_batch = {}, is_pp_shared = {}, n_gpu_layers = {}, algorithm = {}, device = {:?}",
        candle_core::utils::get_num_threads(),
        p.n_ctx,
        p.n_batch,
        config.shared_prefill,
        args.ngl,
        args.algorithm,
        engine.device()
    );

    let format = match args.format {
        FormatArg::Table => OutputFormat::Table,
        FormatArg::Json => OutputFormat::Json,
    };
    let mut reporter = Reporter::new(std::io::stdout().lock(), format);
    reporter.write_header()?;

    let mut write_error = None;
    let outcome = run_sweep(&mut engine, &MonotonicClock::new(), &config, |record| {
        if write_error.is_none() {
            if let Err(e) = reporter.write_record(record) {
                write_error = Some(e);
            }
        }
    })?;
    if let Some(e) = write_error {
        return Err(e).context("writing results");
    }

    let stats = engine.stats();
    info!(
        "Sweep finished: {} trials, {} skipped",
        outcome.trials().count(),
        outcome.skipped().count()
    );
    info!(
        "  Decode calls: {} ({} tokens, {} failed)",
        stats.decode_calls, stats.tokens_decoded, stats.failed_calls
    );

    Ok(())
}

fn select_device(ngl: usize) -> Result<Device> {
    if ngl == 0 {
        return Ok(Device::Cpu);
    }
    let device = Device::cuda_if_available(0)?;
    if !device.is_cuda() {
        warn!("n_gpu_layers = {} requested but no CUDA device is available, using CPU", ngl);
    }
    Ok(device)
}
