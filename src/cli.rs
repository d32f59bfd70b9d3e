use std::path::PathBuf;
use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CLI {
    #[command(subcommand)]
    pub(crate) command: XpdepCommand,

    /// Directory used for the package cache. Defaults to `~/.up/cache/`
    #[clap(long, global = true, env = "CACHE_DIR")]
    pub(crate) cache_dir: Option<PathBuf>,

    /// Timeout in seconds for registry requests
    #[clap(long, global = true)]
    pub(crate) timeout: Option<u64>,

    /// Accept any TLS certificate from registries
    #[clap(long, global = true, env = "UP_INSECURE_SKIP_TLS_VERIFY")]
    pub(crate) insecure_skip_tls_verify: bool,

    /// Bearer token sent to registries
    #[clap(long, global = true, env = "UP_TOKEN", hide_env_values = true)]
    pub(crate) token: Option<String>,

    /// Increase log output (-v debug, -vv trace)
    #[clap(short, long, global = true, action = ArgAction::Count)]
    pub(crate) verbose: u8,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum XpdepCommand {
    /// Resolves a package and caches it. Updates `crossplane.yaml` when the
    /// current directory has one
    Add {
        /// Package and optional constraint: <package>[@<version>], e.g.
        /// `xpkg.upbound.io/upbound/provider-aws@>=v1.0.0`
        package: String,
        /// Also resolve the package's own dependencies
        #[clap(long)]
        transitive: bool,
    },
    /// Resolves and caches every dependency declared in `crossplane.yaml`
    Sync {
        /// Also resolve the dependencies' own dependencies
        #[clap(long)]
        transitive: bool,
    },
    /// Removes the whole package cache
    Clean,
    /// Lists the cached packages
    List,
}
