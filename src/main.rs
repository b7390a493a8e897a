use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use imagegen::catalog::Catalog;
use imagegen::downloader::{ModelDownloader, SEARCH_LIMIT};
use imagegen::gallery::{CopyField, Gallery, GallerySync};
use imagegen::model::Upscale;
use imagegen::preview::Preview;
use imagegen::{Backend, Config, Generator, GeneratorForm, MarketplaceType};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base url of the generation backend
    #[arg(long, env = "IMAGEGEN_BACKEND_URL", global = true)]
    backend_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the backend is up
    Status,
    /// List models, VAEs, LoRAs, negative embeddings and samplers
    Catalog,
    /// Generate one image
    Generate(GenerateArgs),
    /// Browse generated images
    Gallery(GalleryArgs),
    /// Search and download models from Civitai
    #[command(subcommand)]
    Civitai(CivitaiCommand),
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(short, long)]
    prompt: Option<String>,
    #[arg(short, long)]
    negative_prompt: Option<String>,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(short, long)]
    guidance_scale: Option<f64>,
    /// 0 picks a random seed
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    sampler: Option<String>,
    #[arg(short, long)]
    model: Option<String>,
    #[arg(long)]
    vae: Option<String>,
    #[arg(long)]
    lora: Option<String>,
    #[arg(long)]
    lora_scale: Option<f64>,
    /// 0, 2 or 4
    #[arg(long)]
    upscale: Option<u8>,
    #[arg(long)]
    negative_embedding: Option<String>,
    /// Start from the parameters of the last generation
    #[arg(long)]
    resume: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CopyTarget {
    Prompt,
    Negative,
}

#[derive(Args, Debug)]
struct GalleryArgs {
    /// Keep polling and print the gallery whenever it changes
    #[arg(short, long)]
    watch: bool,
    /// Show the generation parameters of one image
    #[arg(short, long)]
    show: Option<String>,
    /// Print the prompt or negative prompt of the shown image
    #[arg(long, requires = "show")]
    copy: Option<CopyTarget>,
    /// Save an image into the download directory
    #[arg(short, long)]
    download: Option<String>,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum CivitaiCommand {
    Search {
        query: String,
        #[arg(short = 't', long, default_value = "Checkpoint")]
        model_type: MarketplaceType,
        /// Maximum number of results
        #[arg(short, long, default_value_t = SEARCH_LIMIT)]
        limit: u32,
    },
    Popular,
    Download {
        model_id: i64,
        version_id: i64,
        #[arg(short = 't', long, default_value = "Checkpoint")]
        model_type: MarketplaceType,
    },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(url) = cli.backend_url {
        config = config.with_backend_url(url)?;
    }
    let backend = Backend::new(&config).context("Failed to construct backend client")?;

    match cli.command {
        Command::Status => status(&backend).await,
        Command::Catalog => catalog(&backend).await,
        Command::Generate(args) => generate(&backend, args).await,
        Command::Gallery(args) => gallery(&backend, &config, args).await,
        Command::Civitai(command) => civitai(&backend, command).await,
    }
}

async fn status(backend: &Backend) -> anyhow::Result<()> {
    let health = backend
        .health()
        .await
        .with_context(|| format!("Backend at {} is not reachable", backend.base_url()))?;
    println!("{}: {}", health.status, health.message);
    Ok(())
}

async fn catalog(backend: &Backend) -> anyhow::Result<()> {
    let snapshot = Catalog::load(backend).await;
    let catalog = &snapshot.catalog;
    for (title, entries) in [
        ("Models", &catalog.models),
        ("VAEs", &catalog.vaes),
        ("LoRAs", &catalog.loras),
        ("Negative embeddings", &catalog.embeddings),
    ] {
        println!("{title}:");
        for entry in entries {
            match &entry.path {
                Some(path) => println!("  {} - {} ({path})", entry.id, entry.name),
                None => println!("  {} - {}", entry.id, entry.name),
            }
        }
    }
    println!("Samplers: {}", catalog.samplers.join(", "));
    if let Some(last) = &snapshot.last_metadata {
        println!("Last prompt: {}", last.prompt);
    }
    Ok(())
}

fn apply_generate_args(form: &mut GeneratorForm, args: GenerateArgs) -> anyhow::Result<()> {
    if let Some(prompt) = args.prompt {
        form.set_prompt(prompt);
    }
    if let Some(negative_prompt) = args.negative_prompt {
        form.set_negative_prompt(negative_prompt);
    }
    if let Some(steps) = args.steps {
        form.set_steps(steps);
    }
    if let Some(guidance_scale) = args.guidance_scale {
        form.set_guidance_scale(guidance_scale);
    }
    if let Some(seed) = args.seed {
        form.set_seed(seed);
    }
    if let Some(width) = args.width {
        form.set_width(width);
    }
    if let Some(height) = args.height {
        form.set_height(height);
    }
    if let Some(sampler) = args.sampler {
        form.set_sampler(sampler);
    }
    if let Some(model) = args.model {
        form.set_model(model);
    }
    if let Some(vae) = args.vae {
        form.set_vae(vae);
    }
    if args.lora.is_some() {
        form.set_lora(args.lora);
    }
    if let Some(lora_scale) = args.lora_scale {
        form.set_lora_scale(lora_scale);
    }
    if let Some(upscale) = args.upscale {
        form.set_upscale(Upscale::try_from(upscale).map_err(|e| anyhow!(e))?);
    }
    if args.negative_embedding.is_some() {
        form.set_negative_embedding(args.negative_embedding);
    }
    Ok(())
}

async fn generate(backend: &Backend, args: GenerateArgs) -> anyhow::Result<()> {
    let mut form = GeneratorForm::new();
    let snapshot = Catalog::load(backend).await;
    snapshot.catalog.select_defaults(&mut form);
    if args.resume {
        match &snapshot.last_metadata {
            Some(metadata) => form.restore_from(metadata),
            None => info!("No previous session to resume"),
        }
    }
    apply_generate_args(&mut form, args)?;

    let preview = Arc::new(Mutex::new(Preview::new()));
    let panel = preview.clone();
    let generator = Generator::new(backend.clone()).on_image_generated(move |url| {
        if let Ok(mut preview) = panel.lock() {
            preview.show(url);
        }
    });

    if !generator.can_submit(&form) {
        return Err(anyhow!("A prompt is required, pass one with --prompt"));
    }
    let generated = generator
        .submit(&form)
        .await
        .map_err(|e| anyhow!(e.user_message()))?;
    debug!("Request sent: {:?}", generated.request);

    println!(
        "Seed {} | {}x{} | {} steps | guidance {:.1} | {}",
        generated.request.seed,
        generated.request.width,
        generated.request.height,
        generated.request.steps,
        generated.request.guidance_scale,
        generated.request.sampler,
    );
    let view = preview
        .lock()
        .map_err(|_| anyhow!("Preview state is unavailable"))?
        .render(|url| backend.resolve(url));
    println!("{view}");
    Ok(())
}

fn print_gallery(gallery: &Gallery) {
    println!("{} images ({:?})", gallery.images().len(), gallery.state());
    for image in gallery.images() {
        let prompt = image
            .metadata
            .as_ref()
            .map(|m| m.prompt.as_str())
            .unwrap_or("-");
        println!("  {}  {}", image.filename, prompt);
    }
}

/// Selects `filename` and returns the requested prompt text.
fn copy_from(gallery: &mut Gallery, filename: &str, target: CopyTarget) -> anyhow::Result<String> {
    if !gallery.select(filename) {
        return Err(anyhow!("No such image: {filename}"));
    }
    let field = match target {
        CopyTarget::Prompt => CopyField::Prompt,
        CopyTarget::Negative => CopyField::NegativePrompt,
    };
    gallery
        .copy(field)
        .ok_or_else(|| anyhow!("{filename} has no recorded metadata"))
}

fn print_details(gallery: &Gallery) {
    let Some(image) = gallery.selected() else {
        return;
    };
    println!("{} ({})", image.filename, image.url);
    match &image.metadata {
        None => println!("  no metadata recorded"),
        Some(m) => {
            println!("  prompt:          {}", m.prompt);
            println!("  negative prompt: {}", m.negative_prompt);
            println!("  model:           {}", m.model);
            println!("  seed:            {}", m.seed);
            println!("  steps:           {}", m.steps);
            println!("  guidance scale:  {:.1}", m.guidance_scale);
            println!("  size:            {}x{}", m.width, m.height);
            if let Some(lora) = &m.lora_path {
                println!("  lora:            {lora}");
            }
            if let Some(upscale) = m.upscale_factor {
                println!("  upscale:         {upscale}");
            }
        }
    }
}

async fn gallery(backend: &Backend, config: &Config, args: GalleryArgs) -> anyhow::Result<()> {
    let sync = GallerySync::new(backend.clone());

    if let Some(filename) = &args.download {
        let directory = args.output.clone().unwrap_or_else(|| config.download_dir.clone());
        let path = sync
            .download(filename, &directory)
            .await
            .with_context(|| format!("Failed to download {filename}"))?;
        println!("Saved {}", path.to_string_lossy());
        return Ok(());
    }

    sync.refresh().await;
    if let Some(filename) = &args.show {
        let mut gallery = sync.gallery();
        match args.copy {
            Some(target) => println!("{}", copy_from(&mut gallery, filename, target)?),
            None if gallery.select(filename) => print_details(&gallery),
            None => return Err(anyhow!("No such image: {filename}")),
        }
        return Ok(());
    }

    print_gallery(&sync.gallery());
    if !args.watch {
        return Ok(());
    }

    let _polling = sync.start(config.poll_interval());
    let mut last_seen: Vec<String> = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(config.poll_interval()) => {
                let gallery = sync.gallery();
                let current: Vec<String> =
                    gallery.images().iter().map(|i| i.filename.clone()).collect();
                if current != last_seen {
                    print_gallery(&gallery);
                    last_seen = current;
                }
            }
        }
    }
    Ok(())
}

async fn civitai(backend: &Backend, command: CivitaiCommand) -> anyhow::Result<()> {
    let mut downloader =
        ModelDownloader::new(backend.clone()).on_model_downloaded(|| {
            info!("Model downloaded, catalogs should be refreshed");
        });

    match command {
        CivitaiCommand::Search {
            query,
            model_type,
            limit,
        } => {
            downloader.set_query(query);
            downloader.set_model_type(model_type);
            downloader.set_limit(limit);
            downloader.search().await;
            let state = downloader.state();
            for model in &state.models {
                println!(
                    "{}  {}  [{} downloads, {} stars, {} versions]",
                    model.id,
                    model.name,
                    model.downloads_label(),
                    model.rating_label(),
                    model.versions.len()
                );
                for version in &model.versions {
                    println!("    version {}: {}", version.id, version.name);
                }
            }
            if let Some(feedback) = state.feedback {
                println!("{}", feedback.text);
            }
        }
        CivitaiCommand::Popular => {
            downloader.load_popular().await;
            let state = downloader.state();
            if let Some(popular) = state.popular.as_ref().filter(|_| state.show_popular) {
                for (category, items) in popular {
                    println!("{category}:");
                    for item in items {
                        let downloads = item.downloads_label().unwrap_or_default();
                        let link = item.page_url().unwrap_or_default();
                        println!("  {}  {}  {downloads}  {link}", item.name, item.description);
                    }
                }
            }
            if let Some(feedback) = state.feedback {
                println!("{}", feedback.text);
            }
        }
        CivitaiCommand::Download {
            model_id,
            version_id,
            model_type,
        } => {
            downloader.set_model_type(model_type);
            let ok = downloader.download(model_id, version_id).await;
            if let Some(feedback) = downloader.state().feedback {
                println!("{}", feedback.text);
            }
            if ok {
                let mut catalog = Catalog::default();
                catalog.refresh(backend).await;
                println!(
                    "Catalog now lists {} models and {} LoRAs",
                    catalog.models.len(),
                    catalog.loras.len()
                );
            } else {
                return Err(anyhow!("Download of model {model_id} failed"));
            }
        }
    }
    Ok(())
}
