use std::sync::Arc;
use anyhow::{Context, Result, bail};
use colored::Colorize;
use tracing::debug;
use xpdep::config::Config;
use xpdep::dep::Dependency;
use xpdep::global::cache::{CacheConfig, Local};
use xpdep::manager::Manager;
use xpdep::registry::RegistryResolver;
use xpdep::workspace::{META_FILE, Workspace};
use xpdep::xpkg::ParsedPackage;
use crate::cli::{CLI, XpdepCommand};

pub fn execute(cli: CLI) -> Result<()> {
    let config = load_config(&cli)?;
    debug!(cache_dir = %config.cache_dir().display(), timeout_secs = config.registry.timeout_secs, "effective configuration");
    match cli.command {
        XpdepCommand::Clean => execute_clean(&config),
        XpdepCommand::List => execute_list(&config),
        XpdepCommand::Add { package, transitive } => execute_add(&config, &package, transitive),
        XpdepCommand::Sync { transitive } => execute_sync(&config, transitive),
    }
}

/// The config file overlaid with command line flags.
fn load_config(cli: &CLI) -> Result<Config> {
    let mut config = Config::load_or_default().context("failed to load configuration")?;
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    if let Some(timeout) = cli.timeout {
        config.registry.timeout_secs = timeout;
    }
    if cli.insecure_skip_tls_verify {
        config.registry.insecure_skip_tls_verify = true;
    }
    if let Some(token) = &cli.token {
        config.registry.token = Some(token.clone());
    }
    Ok(config)
}

fn open_cache(config: &Config) -> Result<Arc<Local>> {
    let cache = Local::new(CacheConfig {
        root: config.cache_dir(),
        ..CacheConfig::default()
    })
    .context("failed to open package cache")?;
    Ok(Arc::new(cache))
}

fn new_manager(config: &Config) -> Result<Manager> {
    let cache = open_cache(config)?;
    let resolver = RegistryResolver::new(&config.registry).context("failed to set up registry client")?;
    Ok(Manager::new(cache, Arc::new(resolver)))
}

pub fn execute_clean(config: &Config) -> Result<()> {
    let cache = open_cache(config)?;
    if let Err(e) = cache.clean() {
        if e.is_permission_denied() {
            bail!("{e}: check the permissions of {}", cache.root().display());
        }
        return Err(e.into());
    }
    println!("{} {}", "Cleaned".green().bold(), cache.root().display());
    Ok(())
}

pub fn execute_list(config: &Config) -> Result<()> {
    let cache = open_cache(config)?;
    let keys = cache.list()?;
    if keys.is_empty() {
        println!("No cached packages");
        return Ok(());
    }
    for key in keys {
        println!("{key}");
    }
    Ok(())
}

pub fn execute_add(config: &Config, package: &str, transitive: bool) -> Result<()> {
    let dep = Dependency::parse(package)?;
    let cwd = std::env::current_dir()?;
    let mut ws = Workspace::load(&cwd)?;
    let manager = new_manager(config)?;

    let resolved = if transitive {
        manager.add_with_dependencies(&dep)?
    } else {
        vec![manager.add_all(&dep)?]
    };
    print_resolved(&resolved);

    let Some((pinned, _)) = resolved.first() else {
        return Ok(());
    };
    if let Some(mut meta) = ws.meta().cloned() {
        meta.upsert(pinned)
            .with_context(|| format!("failed to record {pinned} in {META_FILE}"))?;
        ws.write(&meta)?;
        println!("{} {pinned} to {META_FILE}", "Added".green().bold());
    }
    Ok(())
}

pub fn execute_sync(config: &Config, transitive: bool) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let ws = Workspace::load(&cwd)?;
    let Some(meta) = ws.meta() else {
        bail!("{META_FILE} file not found in current directory");
    };
    let deps = meta.depends_on()?;
    if deps.is_empty() {
        println!("No dependencies");
        return Ok(());
    }

    let manager = new_manager(config)?;
    let resolved = if transitive {
        let mut all = Vec::new();
        for dep in &deps {
            all.extend(manager.add_with_dependencies(dep)?);
        }
        all
    } else {
        manager.add_many(&deps)?
    };
    print_resolved(&resolved);
    Ok(())
}

fn print_resolved(resolved: &[(Dependency, ParsedPackage)]) {
    for (pinned, pkg) in resolved {
        println!(
            "{} {} ({})",
            "Resolved".cyan().bold(),
            pinned,
            pkg.digest().dimmed()
        );
    }
}
