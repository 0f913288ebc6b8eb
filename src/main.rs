use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use attackmap::cancel::CancelSignal;
use attackmap::config::{ATTACK_VERSION, ConfigBuilder, EmbeddingKind, ExtractorKind};
use attackmap::output::{self, OutputFormat};
use attackmap::pipeline::{AnalysisOptions, DocumentAnalysis, MappingPipeline};
use attackmap::types::PipelineError;

/// Map threat intelligence reports onto MITRE ATT&CK techniques.
///
/// INPUT is a web URL (http/https) or a local file path. The first run
/// downloads the ATT&CK STIX bundle and builds a local technique index;
/// later runs reuse both.
#[derive(Parser, Debug)]
#[command(name = "attackmap", version, about)]
struct Cli {
    /// Web URL or local file to analyze
    input: String,

    /// Directory for generated report files
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Output formats: json, csv, markdown, navigator
    #[arg(
        short,
        long = "format",
        value_delimiter = ',',
        default_values = ["json", "markdown"]
    )]
    formats: Vec<OutputFormat>,

    /// Extraction backend: openai, anthropic, or ollama
    #[arg(long)]
    extractor: Option<ExtractorKind>,

    /// Extraction model name, backend-specific
    #[arg(long)]
    model: Option<String>,

    /// Embedding backend: openai, ollama, or hash
    #[arg(long)]
    embeddings: Option<EmbeddingKind>,

    /// Target chunk size in tokens
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Token overlap between consecutive chunks
    #[arg(long)]
    chunk_overlap: Option<usize>,

    /// Candidate techniques retrieved per chunk
    #[arg(long)]
    top_k: Option<usize>,

    /// Minimum confidence kept during consolidation (0.0-1.0)
    #[arg(long)]
    min_confidence: Option<f32>,

    /// Only retrieve candidates from these tactics
    #[arg(long, value_delimiter = ',')]
    tactics: Vec<String>,

    /// Directory for the cached STIX bundle and technique index
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Re-download the ATT&CK bundle and rebuild the index
    #[arg(long)]
    force_reload: bool,

    /// Stop after this many seconds and write partial results
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Per-chunk progress output
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "info,attackmap=debug"
    } else {
        "warn,attackmap=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, PipelineError> {
    let mut config = ConfigBuilder::new().with_env().build()?;
    if let Some(kind) = cli.extractor {
        config.extractor.kind = kind;
    }
    if let Some(model) = &cli.model {
        config.extractor.model = Some(model.clone());
    }
    if let Some(kind) = cli.embeddings {
        config.embedding.kind = kind;
    }
    if let Some(size) = cli.chunk_size {
        config.chunk_size = size;
    }
    if let Some(overlap) = cli.chunk_overlap {
        config.chunk_overlap = overlap;
    }
    if let Some(top_k) = cli.top_k {
        config.top_k = top_k;
    }
    if let Some(min_confidence) = cli.min_confidence {
        config.min_confidence = min_confidence;
    }
    if let Some(dir) = &cli.data_dir {
        config.taxonomy.data_dir = dir.clone();
    }
    config.taxonomy.force_reload |= cli.force_reload;
    config.validate()?;

    println!(
        "attackmap {} (ATT&CK {ATTACK_VERSION})",
        env!("CARGO_PKG_VERSION")
    );

    println!("→ Preparing technique index");
    let pipeline = MappingPipeline::builder(config).build().await?;

    // First ctrl-c finishes the current batch and writes partial results;
    // a second one falls through to the runtime's default handling.
    let signal = Arc::new(CancelSignal::new());
    let token = signal.token();
    let interrupt = Arc::clone(&signal);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⚠ interrupt received, finishing current batch");
            interrupt.cancel();
        }
    });
    if let Some(secs) = cli.timeout {
        let deadline = Arc::clone(&signal);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            eprintln!("\n⚠ timeout after {secs}s, finishing current batch");
            deadline.cancel();
        });
    }

    println!("→ Analyzing {}", cli.input);
    let verbose = cli.verbose;
    let mut report_progress = move |done: usize, total: usize, found: usize| {
        if verbose {
            println!("   chunk {done}/{total}: {found} candidate mappings");
        }
    };
    let options = AnalysisOptions {
        tactic_filter: (!cli.tactics.is_empty()).then(|| cli.tactics.clone()),
        progress: Some(&mut report_progress),
        cancel: Some(token),
    };
    let analysis = pipeline.analyze(&cli.input, options).await?;

    println!(
        "✓ {} chunks, {} extraction requests, {} techniques",
        analysis.chunk_count,
        analysis.request_count,
        analysis.mappings.len()
    );

    write_reports(&cli, &analysis).await?;
    print_summary(&analysis);

    if analysis.cancelled {
        Ok(ExitCode::from(130))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn write_reports(cli: &Cli, analysis: &DocumentAnalysis) -> Result<(), PipelineError> {
    tokio::fs::create_dir_all(&cli.output_dir).await?;

    let stamp = analysis.generated_at.format("%Y%m%d_%H%M%S");
    let stem = report_stem(&cli.input);

    let mut written: Vec<OutputFormat> = Vec::new();
    for format in &cli.formats {
        if written.contains(format) {
            continue;
        }
        written.push(*format);

        let rendered = output::render(analysis, *format)?;
        let suffix = if *format == OutputFormat::Navigator {
            "_navigator"
        } else {
            ""
        };
        let path = cli.output_dir.join(format!(
            "attackmap_{stem}_{stamp}{suffix}.{}",
            format.extension()
        ));
        tokio::fs::write(&path, rendered).await?;
        println!("  • {format}: {}", path.display());
    }
    Ok(())
}

/// Local files contribute their stem to report names; URLs and anything
/// unreadable fall back to a generic one.
fn report_stem(input: &str) -> String {
    let path = Path::new(input);
    if path.exists() {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            return stem.to_string();
        }
    }
    "report".to_string()
}

fn print_summary(analysis: &DocumentAnalysis) {
    let band = |name: &str| {
        analysis
            .mappings
            .iter()
            .filter(|m| output::confidence_band(m.confidence) == name)
            .count()
    };

    if analysis.cancelled {
        println!("\n⚠ Analysis cancelled, results are partial");
    } else {
        println!("\n✅ Analysis complete");
    }
    println!("  techniques        : {}", analysis.mappings.len());
    println!("  high confidence   : {}", band("high"));
    println!("  medium confidence : {}", band("medium"));
    println!("  low confidence    : {}", band("low"));
    println!(
        "  elapsed           : {:.1}s",
        analysis.elapsed_ms as f64 / 1000.0
    );
}
