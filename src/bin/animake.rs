use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use animake::{
    ApiServer, ApiState, EngineConfig, Format, JobStatus, OpenAiGenerator, PreviewCoordinator,
    ProcessRenderer, Project, Quality, RenderJobManager, RenderSpec, ScriptGenerator, ScriptStore,
    TimelineId,
};

#[derive(Parser, Debug)]
#[command(name = "animake", version)]
struct Cli {
    /// Engine configuration file (TOML). Flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the artifact cache, work dirs and job journal.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Maximum number of renders running at once.
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API.
    Serve(ServeArgs),
    /// Render a script or a project and print the artifact path.
    Render(RenderArgs),
    /// Resolve a project and print its render spec as JSON.
    Resolve(ResolveArgs),
    /// Generate a script from a natural-language prompt.
    Generate(GenerateArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Listen address, e.g. 127.0.0.1:8000.
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// Standalone script file.
    #[arg(long, conflicts_with = "project", required_unless_present = "project")]
    script: Option<PathBuf>,

    /// Project file (script history plus timeline).
    #[arg(long)]
    project: Option<PathBuf>,

    #[arg(long, default_value_t = Quality::Medium)]
    quality: Quality,

    /// Defaults to the configured preview format with --preview, mp4 otherwise.
    #[arg(long)]
    format: Option<Format>,

    /// Render as a low quality preview.
    #[arg(long)]
    preview: bool,
}

#[derive(Args, Debug)]
struct ResolveArgs {
    /// Project file to resolve.
    #[arg(long)]
    project: PathBuf,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Description of the animation.
    #[arg(long)]
    prompt: String,

    /// Commit the result as a new version of this project's script.
    #[arg(long)]
    project: Option<PathBuf>,

    /// Write the script here instead of stdout (ignored with --project).
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;
    match cli.cmd {
        Command::Serve(args) => cmd_serve(cfg, args),
        Command::Render(args) => cmd_render(cfg, args),
        Command::Resolve(args) => cmd_resolve(cfg, args),
        Command::Generate(args) => cmd_generate(cfg, args),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut cfg = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &cli.output_dir {
        cfg.output_dir = dir.clone();
    }
    if let Some(n) = cli.max_concurrent {
        cfg.max_concurrent_renders = n;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn make_manager(cfg: &EngineConfig) -> anyhow::Result<Arc<RenderJobManager>> {
    let renderer = Arc::new(ProcessRenderer::new(cfg.renderer.clone()));
    let manager = RenderJobManager::new(renderer, cfg.manager_opts())
        .with_context(|| format!("start render manager in '{}'", cfg.output_dir.display()))?;
    Ok(Arc::new(manager))
}

fn cmd_serve(mut cfg: EngineConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(bind) = args.bind {
        cfg.server.bind = bind;
    }
    let generator: Option<Arc<dyn ScriptGenerator>> =
        match OpenAiGenerator::new(cfg.generator.clone()) {
            Ok(g) => Some(Arc::new(g)),
            Err(e) => {
                tracing::warn!(error = %e, "script generation disabled");
                None
            }
        };

    let state = ApiState {
        manager: make_manager(&cfg)?,
        scripts: Arc::new(ScriptStore::new("session", cfg.script_opts())),
        generator,
    };
    ApiServer::new(state).serve(&cfg.server.bind)
}

fn cmd_render(cfg: EngineConfig, args: RenderArgs) -> anyhow::Result<()> {
    let (spec, timeline) = match (&args.script, &args.project) {
        (Some(path), _) => {
            let code = std::fs::read_to_string(path)
                .with_context(|| format!("read script '{}'", path.display()))?;
            (RenderSpec::from_script(code), TimelineId(0))
        }
        (None, Some(path)) => {
            let project = Project::load(path, cfg.script_opts())?;
            (project.resolve()?, project.timeline.id())
        }
        (None, None) => anyhow::bail!("either --script or --project is required"),
    };

    let manager = make_manager(&cfg)?;
    if args.preview {
        let format = args.format.unwrap_or(cfg.preview_format);
        let previews = PreviewCoordinator::new(Arc::clone(&manager), format);
        let job = previews.request_preview(timeline, &spec)?.wait();
        if job.status != JobStatus::Succeeded {
            let reason = job.error.map(|e| e.to_string()).unwrap_or_default();
            anyhow::bail!("{} {}: {reason}", job.id, job.status);
        }
        let path = job
            .output_path
            .context("succeeded preview has no output path")?;
        print_artifact(&path, job.duration.unwrap_or(spec.duration), job.cache_hit);
    } else {
        let format = args.format.unwrap_or_default();
        let outcome = manager.render_blocking(&spec, args.quality, format)?;
        print_artifact(&outcome.output_path, outcome.duration, false);
    }
    manager.shutdown();
    Ok(())
}

fn print_artifact(path: &Path, duration: f64, cache_hit: bool) {
    println!("{}", path.display());
    eprintln!(
        "duration {duration:.2}s{}",
        if cache_hit { " (cached)" } else { "" }
    );
}

fn cmd_resolve(cfg: EngineConfig, args: ResolveArgs) -> anyhow::Result<()> {
    let project = Project::load(&args.project, cfg.script_opts())?;
    let spec = project.resolve()?;
    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}

fn cmd_generate(cfg: EngineConfig, args: GenerateArgs) -> anyhow::Result<()> {
    let generator = OpenAiGenerator::new(cfg.generator.clone())?;

    if let Some(path) = &args.project {
        let project = Project::load(path, cfg.script_opts())?;
        let (script, _metadata) = animake::generate_into(&generator, &project.scripts, &args.prompt, None)?;
        project.save(path)?;
        eprintln!("committed {} v{}", project.scripts.id(), script.version);
        return Ok(());
    }

    let generated = generator.generate(&args.prompt, None, None)?;
    match &args.out {
        Some(out) => {
            std::fs::write(out, &generated.code)
                .with_context(|| format!("write script '{}'", out.display()))?;
            eprintln!("wrote {}", out.display());
        }
        None => println!("{}", generated.code),
    }
    Ok(())
}
