use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use runner_image_common::{Arch, BaseImage, CloudConfig, FlavorSelection, ImageConfig, RunnerVersion};
use runner_image_orchestrator::cloud_image::{LocalSeedImage, SeedImageSource, UbuntuCloudImages};
use runner_image_orchestrator::logger;
use runner_image_orchestrator::provider_manager::ProviderManager;
use runner_image_orchestrator::{BuildError, BuilderSettings, ImageBuilder, RunOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "github-runner-image-builder",
    version,
    about = "Build GitHub Actions runner VM images on OpenStack"
)]
struct Cli {
    /// Log level (error, warn, info, debug, trace). RUST_LOG overrides it.
    #[arg(long, global = true, default_value = "info", env = "IMAGE_BUILDER_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the shared keypair, security group and seed images.
    Init {
        /// clouds.yaml entry to initialize. Defaults to the first cloud found.
        #[arg(long)]
        cloud_name: Option<String>,
        /// Defaults to the architecture of this machine.
        #[arg(long)]
        arch: Option<Arch>,
    },
    /// Print the id of the newest image revision of IMAGE_NAME.
    LatestBuildId { cloud_name: String, image_name: String },
    /// Build a new revision of IMAGE_NAME.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    cloud_name: String,
    image_name: String,
    #[arg(short = 'b', long, default_value = "noble")]
    base_image: BaseImage,
    #[arg(long)]
    arch: Option<Arch>,
    /// Revisions to keep after this build, the new one included (minimum 1).
    #[arg(short = 'k', long, default_value_t = 5)]
    keep_revisions: u32,
    /// Executable called with the new image id after a successful build.
    #[arg(short = 's', long)]
    callback_script: Option<PathBuf>,
    /// `latest` or a release such as 2.317.0.
    #[arg(long, default_value = "latest")]
    runner_version: RunnerVersion,
    /// NAME, or NAME:VCPUS:RAM_MIB:DISK_GIB. Defaults to the smallest sufficient flavor.
    #[arg(long)]
    flavor: Option<FlavorSelection>,
    #[arg(long)]
    network: Option<String>,
    /// host:port of an HTTP proxy the builder VM must use.
    #[arg(long)]
    proxy: Option<String>,
    /// clouds.yaml entry to copy the finished image to.
    #[arg(long)]
    upload_cloud: Option<String>,
    /// Assume `init` already ran against this cloud.
    #[arg(long)]
    skip_bootstrap: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let _guard = match logger::init_logging(Some(&cli.log_level)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error[configuration]: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("[main] interrupted, cancelling build");
            on_signal.cancel();
        }
    });

    match dispatch(cli.command, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let category = e
                .downcast_ref::<BuildError>()
                .map(|b| b.category())
                .unwrap_or("configuration");
            tracing::error!("[main] {:#}", e);
            eprintln!("error[{}]: {:#}", category, e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command, cancel: CancellationToken) -> Result<()> {
    let settings = BuilderSettings::from_env()?;
    let provider_name = ProviderManager::current_provider_name();

    match command {
        Command::Init { cloud_name, arch } => {
            let cloud_name = match cloud_name {
                Some(name) => name,
                None => ProviderManager::default_cloud_name(&provider_name)?,
            };
            let arch = resolve_arch(arch)?;
            let cloud = ProviderManager::get_provider(&provider_name, &cloud_name)?;
            let builder = ImageBuilder::new(cloud, settings.clone(), seed_source(&settings)?)
                .with_cancellation(cancel);
            let resources = builder.initialize(arch).await?;
            for shared in resources {
                tracing::info!(
                    "[main] ready: seed {} keypair {} security group {}",
                    shared.seed_image_id,
                    shared.keypair_name,
                    shared.security_group_id
                );
            }
            Ok(())
        }
        Command::LatestBuildId {
            cloud_name,
            image_name,
        } => {
            let cloud = ProviderManager::get_provider(&provider_name, &cloud_name)?;
            let builder = ImageBuilder::new(cloud, settings.clone(), seed_source(&settings)?)
                .with_cancellation(cancel);
            let id = builder.latest_build_id(&image_name).await?.unwrap_or_default();
            let mut stdout = std::io::stdout();
            write!(stdout, "{}", id)?;
            stdout.flush()?;
            Ok(())
        }
        Command::Run(args) => run(args, &provider_name, settings, cancel).await,
    }
}

async fn run(
    args: RunArgs,
    provider_name: &str,
    settings: BuilderSettings,
    cancel: CancellationToken,
) -> Result<()> {
    let arch = resolve_arch(args.arch)?;
    let cloud = ProviderManager::get_provider(provider_name, &args.cloud_name)?;
    let mut builder = ImageBuilder::new(cloud, settings.clone(), seed_source(&settings)?)
        .with_cancellation(cancel);
    if let Some(upload) = &args.upload_cloud {
        builder = builder.with_upload_cloud(ProviderManager::get_provider(provider_name, upload)?);
    }

    let cloud_config = CloudConfig {
        cloud_name: args.cloud_name,
        flavor: args.flavor.unwrap_or_default(),
        network: args.network,
        proxy: args.proxy,
        upload_cloud_name: args.upload_cloud,
    };
    let image_config = ImageConfig {
        arch,
        base: args.base_image,
        runner_version: args.runner_version,
        name: args.image_name,
    };
    let options = RunOptions {
        keep_revisions: args.keep_revisions,
        skip_bootstrap: args.skip_bootstrap,
    };

    let outcome = builder.build(&cloud_config, &image_config, options).await?;
    for warning in &outcome.rotation.warnings {
        tracing::warn!("[main] rotation: {}", warning);
    }
    println!("{}", outcome.artifact_id);

    if let Some(script) = args.callback_script {
        run_callback(&script, &outcome.artifact_id).await?;
    }
    Ok(())
}

async fn run_callback(script: &Path, image_id: &str) -> Result<()> {
    tracing::info!("[main] calling {} {}", script.display(), image_id);
    let status = tokio::process::Command::new(script)
        .arg(image_id)
        .status()
        .await
        .with_context(|| format!("failed to run callback script {}", script.display()))?;
    if !status.success() {
        bail!("callback script {} exited with {}", script.display(), status);
    }
    Ok(())
}

fn resolve_arch(arch: Option<Arch>) -> Result<Arch> {
    match arch {
        Some(arch) => Ok(arch),
        None => Arch::host().context("cannot build for this machine's architecture; pass --arch"),
    }
}

fn seed_source(settings: &BuilderSettings) -> Result<Arc<dyn SeedImageSource>> {
    match std::env::var("IMAGE_BUILDER_SEED_IMAGE_FILE") {
        Ok(path) if !path.trim().is_empty() => Ok(Arc::new(LocalSeedImage::new(path.trim()))),
        _ => Ok(Arc::new(UbuntuCloudImages::new(&settings.cloud_images_url)?)),
    }
}
