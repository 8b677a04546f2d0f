//! A3S Box Build Proxy - Docker build interception.
//!
//! Rewrites a Docker build in flight so that every build stage trusts the
//! intercepting proxy:
//!
//! - [`context`] streams the build context archive, rewrites its Dockerfile
//!   and appends the proxy CA certificate and override files.
//! - [`inject`] splices the setup instructions after every `FROM`.
//! - [`output`] hides the injected steps from the build output and keeps the
//!   `Step n/m` numbering consistent with the original Dockerfile.
//!
//! # Example
//!
//! ```text
//! let stream = Arc::new(BuildContextInjector::default())
//!     .spawn("Dockerfile", client_body, engine_body, config);
//! let extra = stream.commands_added.resolved().await?;
//! build_output_pipeline(extra).pipe(engine_output, client_output).await?;
//! ```

pub mod context;
pub mod dockerfile;
pub mod env;
pub mod inject;
pub mod output;
pub mod serialize;

// Re-export common types
pub use context::{
    command_count, inject_into_build_stream, maybe_decompress, BuildContextInjector,
    CommandCount, CommandCountCell, InjectedBuildStream, InjectedContext,
};
pub use dockerfile::{Command, CommandArgs};
pub use env::{
    DirectoryOverrides, DockerHostResolver, EnvVars, HostAddressResolver, NoOverrides,
    OverridePacker, Platform, ProxyEnvGenerator, ProxyEnvRequest, RuntimeInheritance,
    StandardProxyEnv,
};
pub use inject::{inject_into_dockerfile, injection_block, BuildConfig, InjectedDockerfile};
pub use output::{build_output_pipeline, BuildOutputPipeline, OutputFilter};
pub use serialize::{serialize_command, serialize_dockerfile};

/// A3S Box Build Proxy version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
