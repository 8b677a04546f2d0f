//! Dockerfile injection.
//!
//! Splices a fixed block of instructions after every `FROM` so that each
//! build stage receives the proxy certificate, override files and proxy
//! environment variables. The block is bracketed by two labels which the
//! output normalizer later uses to hide the injected steps.

use a3s_box_core::error::Result;

use crate::dockerfile::{self, Command, CommandArgs};
use crate::env::EnvVars;
use crate::serialize::serialize_dockerfile;

/// Label key marking injected instructions.
pub const BUILD_LABEL: &str = "io.a3s.box.build-proxy";

/// In-container directory holding everything injected into a build.
pub const INJECTION_PATH: &str = "/.a3s-box-injections";

/// In-container directory for override files.
pub const OVERRIDES_PATH: &str = "/.a3s-box-injections/overrides";

/// In-container path of the proxy CA certificate.
pub const CERT_PATH: &str = "/.a3s-box-injections/ca.pem";

/// Location of the injection directory inside the build context archive.
pub const CONTEXT_INJECTION_DIR: &str = ".a3s-box-injections";

/// Value of the start label for a proxy port.
pub fn start_label_value(proxy_port: u16) -> String {
    format!("started-{}", proxy_port)
}

/// Settings for injecting into a single Dockerfile.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub proxy_port: u16,
    /// PEM-encoded CA certificate
    pub certificate: String,
    /// Variables set in every stage, rendered in order
    pub env: EnvVars,
}

/// A Dockerfile after injection.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectedDockerfile {
    pub dockerfile: String,
    /// Number of instructions added across all stages
    pub commands_added: usize,
}

/// The instructions inserted after each `FROM`.
///
/// The block never ends with `COPY`: a trailing `COPY` in a stage breaks
/// later `COPY --from` of that stage in the classic builder.
pub fn injection_block(config: &BuildConfig) -> Vec<Command> {
    let mut block = vec![
        Command::new(
            "LABEL",
            CommandArgs::Map(vec![(
                BUILD_LABEL.to_string(),
                start_label_value(config.proxy_port),
            )]),
        ),
        Command::new(
            "COPY",
            CommandArgs::List(vec![
                CONTEXT_INJECTION_DIR.to_string(),
                INJECTION_PATH.to_string(),
            ]),
        ),
    ];

    if !config.env.is_empty() {
        block.push(Command::new(
            "ENV",
            CommandArgs::Map(config.env.clone().into_pairs()),
        ));
    }

    block.push(Command::new(
        "LABEL",
        CommandArgs::Map(vec![(
            BUILD_LABEL.to_string(),
            config.proxy_port.to_string(),
        )]),
    ));
    block
}

/// Insert the injection block after every `FROM` in `content`.
pub fn inject_into_dockerfile(content: &str, config: &BuildConfig) -> Result<InjectedDockerfile> {
    let mut commands = dockerfile::parse(content)?;

    let from_indexes: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter(|(_, command)| command.is_from())
        .map(|(index, _)| index)
        .collect();

    let block = injection_block(config);

    // Back to front, so earlier indexes stay valid
    for &index in from_indexes.iter().rev() {
        commands.splice(index + 1..index + 1, block.iter().cloned());
    }

    let commands_added = from_indexes.len() * block.len();
    tracing::debug!(
        stages = from_indexes.len(),
        commands_added,
        "Injected proxy setup into Dockerfile"
    );

    Ok(InjectedDockerfile {
        dockerfile: serialize_dockerfile(&commands),
        commands_added,
    })
}
