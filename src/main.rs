use anyhow::Context;
use chrono::Utc;
use gengate::cli::{
    Args, BatchConfig, ConfigDiscovery, ContentSource, ExecutionMode, GenerateConfig, TaskLoader,
};
use gengate::gateway::{GatewayConfig, GenerationGateway, ReassemblyPolicy, Task};
use gengate::provider::{GenerationKind, GenerationOutput, GenerationRequest, HttpProvider};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gengate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    match mode {
        ExecutionMode::Generate(config) => run_generate(config).await,
        ExecutionMode::Batch(config) => run_batch(config).await,
        ExecutionMode::Status { config_override } => run_status(config_override).await,
        ExecutionMode::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            Ok(())
        }
    }
}

async fn start_gateway(config: GatewayConfig) -> anyhow::Result<GenerationGateway> {
    if config.pool.credentials.is_empty() {
        warn!("No credentials configured; set GENGATE_API_KEYS or [pool] credentials");
    }

    let provider =
        HttpProvider::new(config.provider.clone()).context("failed to create HTTP provider")?;
    let gateway = GenerationGateway::init(config, Arc::new(provider))
        .await
        .context("failed to initialize gateway")?;
    Ok(gateway)
}

async fn run_generate(config: GenerateConfig) -> anyhow::Result<()> {
    let mut gateway_config = ConfigDiscovery::load(config.config_override.as_deref())?;
    gateway_config.retry.mode = config.retry_mode;

    let content = match &config.content {
        ContentSource::Inline(text) => text.clone(),
        ContentSource::File(path) => TaskLoader::load_content(path)?,
    };

    let voice = match config.kind {
        GenerationKind::Speech => config
            .voice
            .clone()
            .or_else(|| gateway_config.provider.default_voice.clone()),
        GenerationKind::Text => None,
    };
    let request = GenerationRequest {
        kind: config.kind,
        content,
        voice,
        model: config.model.clone(),
        parameters: BTreeMap::new(),
    };
    let task = Task::new(format!("cli-{}", Utc::now().timestamp_millis()), request);

    if config.verbose {
        println!(
            "Generating {:?} for {} characters",
            config.kind,
            task.payload.content.chars().count()
        );
    }

    let gateway = start_gateway(gateway_config).await?;
    let result = match config.reassembly {
        ReassemblyPolicy::AcceptPartial => gateway
            .submit_segmented(task, config.reassembly)
            .await
            .map(|reassembled| {
                if reassembled.degraded {
                    warn!(
                        "Only part of the content was generated ({} of {} chunks failed)",
                        reassembled.failed, reassembled.chunks
                    );
                }
                reassembled.output
            }),
        ReassemblyPolicy::RequireAll => gateway.submit(task).await,
    };

    if config.verbose {
        let stats = gateway.cache_stats().await;
        println!(
            "Cache: {} memory hits, {} persistent hits, {} misses",
            stats.memory_hits, stats.persistent_hits, stats.misses
        );
    }
    gateway.shutdown().await;

    match result {
        Ok(output) => {
            match &config.output {
                Some(path) => {
                    write_output(path, &output)?;
                    println!("✅ Wrote {} to {:?}", describe(&output), path);
                }
                None => match output.as_text() {
                    Some(text) => println!("{}", text),
                    None => anyhow::bail!("speech output needs --output"),
                },
            }
            Ok(())
        }
        Err(e) => {
            error!("Generation failed: {}", e);
            eprintln!("❌ {}", e.user_message());
            if config.verbose {
                eprintln!("   {}", e);
            }
            std::process::exit(1);
        }
    }
}

async fn run_batch(config: BatchConfig) -> anyhow::Result<()> {
    info!("Running batch from {:?}", config.task_file);
    let tasks = TaskLoader::load_tasks(&config.task_file)?;

    if config.dry_run {
        println!("🔍 Dry run: {} task(s) loaded", tasks.len());
        for task in &tasks {
            println!(
                "  {} [{:?}, priority {}] {}",
                task.id,
                task.payload.kind,
                task.priority.map_or_else(|| "-".to_string(), |p| p.to_string()),
                preview(&task.payload.content)
            );
        }
        return Ok(());
    }

    if let Some(dir) = &config.output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    }

    let gateway_config = ConfigDiscovery::load(config.config_override.as_deref())?;
    let gateway = start_gateway(gateway_config).await?;

    let verbose = config.verbose;
    let results = gateway
        .submit_batch(tasks, |completed, total, id| {
            if verbose {
                println!("[{}/{}] {}", completed, total, id);
            }
        })
        .await;
    gateway.shutdown().await;

    let mut ids: Vec<_> = results.keys().cloned().collect();
    ids.sort();

    let mut names = OutputNames::default();
    let mut failed = 0;
    for id in &ids {
        match results.get(id).and_then(Option::as_ref) {
            Some(output) => {
                if let Some(dir) = &config.output_dir {
                    let path = dir.join(names.claim(id, output));
                    write_output(&path, output)?;
                }
                println!("  ✅ {} ({})", id, describe(output));
            }
            None => {
                failed += 1;
                println!("  ❌ {}", id);
            }
        }
    }

    println!();
    println!(
        "Batch finished: {} succeeded, {} failed",
        ids.len() - failed,
        failed
    );

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_status(config_override: Option<PathBuf>) -> anyhow::Result<()> {
    let gateway_config = ConfigDiscovery::load(config_override.as_deref())?;
    let gateway = start_gateway(gateway_config).await?;

    let status = gateway.status().await;
    let now = Utc::now();

    println!("Credential pool:");
    println!(
        "  {} of {} credential(s) available, usage {:.0}%",
        status.available_slots,
        status.total_slots,
        status.usage_ratio * 100.0
    );
    if let Some(at) = status.next_available_at {
        println!("  Next credential free at {}", at.format("%H:%M:%S UTC"));
    }
    if status.exhausted {
        println!("  ⚠️  No credential is usable right now");
    }

    for slot in gateway.credentials().await {
        let state = if slot.disabled {
            "disabled".to_string()
        } else if slot.is_cooling_at(now) {
            match slot.cooldown_until {
                Some(until) => format!("cooling until {}", until.format("%H:%M:%S UTC")),
                None => "cooling".to_string(),
            }
        } else {
            "ready".to_string()
        };
        println!("  {}  used {:>5}  {}", slot.id, slot.usage_count, state);
    }

    let cache = gateway.cache_stats().await;
    println!();
    println!(
        "Response cache: {} entries in memory, persistent tier {}",
        cache.memory_entries,
        if cache.persistent_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );

    gateway.shutdown().await;
    Ok(())
}

fn write_output(path: &Path, output: &GenerationOutput) -> anyhow::Result<()> {
    let bytes: &[u8] = match output {
        GenerationOutput::Text { text } => text.as_bytes(),
        GenerationOutput::Audio { bytes, .. } => bytes,
    };
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

/// Hands out one file name per task id; ids that sanitize to the same stem get
/// a numeric suffix instead of overwriting each other
#[derive(Debug, Default)]
struct OutputNames {
    used: HashSet<String>,
}

impl OutputNames {
    fn claim(&mut self, id: &str, output: &GenerationOutput) -> String {
        let (stem, extension) = output_file_name(id, output);
        let mut name = format!("{}.{}", stem, extension);
        let mut n = 1;
        while self.used.contains(&name) {
            n += 1;
            name = format!("{}-{}.{}", stem, n, extension);
        }
        self.used.insert(name.clone());
        name
    }
}

fn output_file_name(id: &str, output: &GenerationOutput) -> (String, &'static str) {
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let extension = match output {
        GenerationOutput::Text { .. } => "txt",
        GenerationOutput::Audio { mime_type, .. } => match mime_type.as_str() {
            "audio/mpeg" | "audio/mp3" => "mp3",
            "audio/wav" | "audio/x-wav" => "wav",
            "audio/ogg" => "ogg",
            _ => "bin",
        },
    };

    (stem, extension)
}

fn describe(output: &GenerationOutput) -> String {
    match output {
        GenerationOutput::Text { .. } => format!("{} characters", output.len()),
        GenerationOutput::Audio { mime_type, .. } => {
            format!("{} bytes of {}", output.len(), mime_type)
        }
    }
}

fn preview(content: &str) -> String {
    let mut preview: String = content.chars().take(60).collect();
    if content.chars().count() > 60 {
        preview.push_str("...");
    }
    preview
}
