use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pageview_core::{
    columns_for_scale, Bounds, LoadCoordinator, PageImage, PageInfo, PageLoadError, Tier,
    TierManifest, ViewerConfig, VisibilityScanner, VisibleRange,
};
use pageview_scheduler::{DownloadQueue, QueueStats, SchedulerConfig, Transports};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pageview")]
#[command(about = "Progressive page image loader")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print which pages of a manifest are visible and the tier each needs.
    Plan {
        #[command(flatten)]
        view: ViewArgs,
    },
    /// Download the visible pages of a manifest and print a summary.
    Prefetch {
        #[command(flatten)]
        view: ViewArgs,
        /// Load every visible page at this tier instead of its target tier.
        #[arg(long)]
        tier: Option<Tier>,
        /// Override the number of simultaneous transfers.
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Args)]
struct ViewArgs {
    #[arg(value_name = "MANIFEST")]
    manifest: PathBuf,
    /// Viewport top in layout pixels.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    top: f64,
    /// Viewport height in layout pixels.
    #[arg(long, default_value_t = 900.0)]
    height: f64,
    /// Render scale of the pages.
    #[arg(long, default_value_t = 1.0)]
    scale: f64,
    /// Configuration file; `PAGEVIEW_*` variables are used otherwise.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl ViewArgs {
    fn viewport(&self) -> Bounds {
        Bounds::new(self.top, self.top + self.height.max(0.0))
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    pages: Vec<ManifestPage>,
}

#[derive(Debug, Deserialize)]
struct ManifestPage {
    width: f64,
    height: f64,
    top: f64,
    bottom: f64,
    #[serde(default)]
    urls: TierManifest,
}

impl ManifestPage {
    fn info(&self) -> PageInfo {
        PageInfo {
            width: self.width,
            height: self.height,
            urls: self.urls.clone(),
        }
    }
}

impl Manifest {
    fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;

        for (index, pair) in manifest.pages.windows(2).enumerate() {
            if pair[1].top < pair[0].top {
                anyhow::bail!("manifest pages must be sorted by top (page {})", index + 1);
            }
        }

        Ok(manifest)
    }

    fn layout(&self) -> Vec<Bounds> {
        self.pages
            .iter()
            .map(|page| Bounds::new(page.top, page.bottom))
            .collect()
    }

    fn into_pages(self) -> Vec<PageInfo> {
        self.pages.iter().map(ManifestPage::info).collect()
    }
}

#[derive(Debug, Serialize)]
struct PlanOutput {
    columns: usize,
    visible: Option<VisibleRange>,
    pages: Vec<PlannedPage>,
}

#[derive(Debug, Serialize)]
struct PlannedPage {
    index: usize,
    tier: Tier,
    resolved: Option<Tier>,
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct PrefetchOutput {
    visible: Option<VisibleRange>,
    pages: Vec<PrefetchedPage>,
    stats: QueueStats,
}

#[derive(Debug, Serialize)]
struct PrefetchedPage {
    index: usize,
    tier: Option<Tier>,
    bytes: Option<usize>,
    format: Option<String>,
    error: Option<String>,
}

impl PrefetchedPage {
    fn new(index: usize, result: Result<PageImage, PageLoadError>) -> Self {
        match result {
            Ok(image) => Self {
                index,
                tier: Some(image.tier),
                bytes: Some(image.len()),
                format: image
                    .format
                    .and_then(|format| format.extensions_str().first())
                    .map(|ext| ext.to_string()),
                error: None,
            },
            Err(err) => Self {
                index,
                tier: None,
                bytes: None,
                format: None,
                error: Some(err.to_string()),
            },
        }
    }
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Plan { view } => {
            init_tracing();
            run_plan(&view)
        }
        Commands::Prefetch {
            view,
            tier,
            concurrency,
        } => {
            init_tracing();
            run_prefetch(&view, tier, concurrency)
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // a subscriber may already be installed when embedded
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_configs(path: Option<&Path>) -> Result<(SchedulerConfig, ViewerConfig)> {
    match path {
        Some(path) => {
            let scheduler = SchedulerConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?;
            let viewer = ViewerConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?;
            Ok((scheduler, viewer))
        }
        None => {
            let scheduler =
                SchedulerConfig::from_env().context("invalid scheduler configuration")?;
            let viewer = ViewerConfig::from_env().context("invalid viewer configuration")?;
            Ok((scheduler, viewer))
        }
    }
}

fn run_plan(view: &ViewArgs) -> Result<()> {
    let (_, viewer) = load_configs(view.config.as_deref())?;
    let manifest = Manifest::load(&view.manifest)?;
    let layout = manifest.layout();

    let columns = columns_for_scale(view.scale);
    let visible = VisibilityScanner::from_config(&viewer).scan(&layout, view.viewport(), columns);
    debug!(?visible, columns, "planned viewport");

    let pages = visible
        .map(|range| {
            range
                .indices()
                .map(|index| {
                    let info = manifest.pages[index].info();
                    let tier = info.target_tier(layout[index], view.scale, &viewer);
                    let resolved = info.urls.resolve(tier);

                    PlannedPage {
                        index,
                        tier,
                        resolved: resolved.map(|(tier, _)| tier),
                        url: resolved.map(|(_, url)| url.to_string()),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let payload = PlanOutput {
        columns,
        visible,
        pages,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);

    Ok(())
}

fn run_prefetch(view: &ViewArgs, tier: Option<Tier>, concurrency: Option<usize>) -> Result<()> {
    let (mut scheduler, viewer) = load_configs(view.config.as_deref())?;
    if let Some(concurrency) = concurrency {
        scheduler = scheduler.with_concurrency(concurrency);
    }

    let manifest = Manifest::load(&view.manifest)?;
    let layout = manifest.layout();
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;

    let payload = runtime.block_on(async {
        let transports = Transports::http(&scheduler).context("failed to build HTTP client")?;
        let queue = DownloadQueue::new(&scheduler, transports);
        let mut coordinator = LoadCoordinator::new(queue, manifest.into_pages(), viewer);

        let visible = coordinator.report_viewport(view.viewport(), &layout, view.scale);
        let results = match (tier, visible) {
            (Some(tier), Some(range)) => coordinator.ensure_range(range.indices(), tier).await,
            _ => coordinator.settle_visible().await,
        };

        anyhow::Ok(PrefetchOutput {
            visible,
            pages: results
                .into_iter()
                .map(|(index, result)| PrefetchedPage::new(index, result))
                .collect(),
            stats: coordinator.queue().stats(),
        })
    })?;

    println!("{}", serde_json::to_string_pretty(&payload)?);

    let failed = payload.pages.iter().filter(|page| page.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} pages failed to load", payload.pages.len());
    }

    Ok(())
}
