//! Build context rewriting.
//!
//! Streams a build context archive, rewrites its Dockerfile entry via
//! [`inject_into_dockerfile`], and appends the proxy certificate and override
//! files the injected instructions copy into every stage. All other entries
//! are copied through header-for-header without being buffered.

use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use a3s_box_core::config::BuildProxyConfig;
use a3s_box_core::error::{BoxError, Result};
use parking_lot::Mutex;
use tar::{EntryType, Header};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::env::{
    DockerHostResolver, HostAddressResolver, NoOverrides, OverridePacker, Platform,
    ProxyEnvGenerator, ProxyEnvRequest, RuntimeInheritance, StandardProxyEnv,
};
use crate::inject::{inject_into_dockerfile, BuildConfig, CERT_PATH, CONTEXT_INJECTION_DIR};

/// Variable that would point a container at a Docker engine. Nested builds
/// are not intercepted, so it is never injected.
const DOCKER_HOST_VAR: &str = "DOCKER_HOST";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Archive path of the injected CA certificate.
pub fn cert_archive_path() -> String {
    format!("{}/ca.pem", CONTEXT_INJECTION_DIR)
}

/// Archive base path handed to the override packer.
pub fn overrides_archive_path() -> String {
    format!("{}/overrides", CONTEXT_INJECTION_DIR)
}

// --- Injected command count ---

/// Create a single-assignment cell for the injected command count.
pub fn command_count() -> (CommandCountCell, CommandCount) {
    let (tx, rx) = oneshot::channel();
    (
        CommandCountCell {
            tx: Mutex::new(Some(tx)),
        },
        CommandCount { rx },
    )
}

/// Write side of the command count. The first `resolve` wins.
#[derive(Debug)]
pub struct CommandCountCell {
    tx: Mutex<Option<oneshot::Sender<usize>>>,
}

impl CommandCountCell {
    /// Publish the count. Returns `false` if it had already been published.
    pub fn resolve(&self, count: usize) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                // The reader may have stopped listening; the value is still final
                let _ = tx.send(count);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Read side of the command count.
#[derive(Debug)]
pub struct CommandCount {
    rx: oneshot::Receiver<usize>,
}

impl CommandCount {
    /// Wait for the count.
    ///
    /// Fails if the rewrite stopped before either the Dockerfile was found
    /// or the archive was fully read.
    pub async fn resolved(self) -> Result<usize> {
        self.rx.await.map_err(|_| {
            BoxError::BuildError(
                "Build context rewrite ended before the injected command count was known"
                    .to_string(),
            )
        })
    }

    /// The count, if already published.
    pub fn try_get(&mut self) -> Option<usize> {
        self.rx.try_recv().ok()
    }
}

// --- Decompression ---

/// Transparently gunzip `reader` if it starts with the gzip magic bytes.
pub fn maybe_decompress<'a, R: Read + 'a>(mut reader: R) -> Result<Box<dyn Read + 'a>> {
    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < magic.len() {
        match reader.read(&mut magic[filled..])? {
            0 => break,
            n => filled += n,
        }
    }

    let stream = Cursor::new(magic[..filled].to_vec()).chain(reader);
    if filled == magic.len() && magic == GZIP_MAGIC {
        tracing::debug!("Build context is gzip-compressed");
        Ok(Box::new(flate2::read::MultiGzDecoder::new(stream)))
    } else {
        Ok(Box::new(stream))
    }
}

// --- Build context rewriting ---

/// Result of rewriting a build context synchronously.
#[derive(Debug)]
pub struct InjectedContext<W> {
    pub output: W,
    pub commands_added: usize,
}

/// A build context rewrite running on the blocking pool.
#[derive(Debug)]
pub struct InjectedBuildStream<W> {
    /// Completes once the output archive is finalized
    pub task: JoinHandle<Result<W>>,
    /// Resolves as soon as the Dockerfile is rewritten, or with 0 once the
    /// archive turns out not to contain it
    pub commands_added: CommandCount,
}

impl<W> InjectedBuildStream<W> {
    /// Wait for the rewrite to finish and return the output writer.
    pub async fn finish(self) -> Result<W> {
        self.task
            .await
            .map_err(|e| BoxError::Other(format!("Build context rewrite task failed: {}", e)))?
    }
}

/// An extension header (GNU long name/link or PAX) waiting for its entry.
struct Extension {
    header: Header,
    data: Vec<u8>,
}

/// Rewrites build contexts using the given collaborators.
#[derive(Debug, Clone, Default)]
pub struct BuildContextInjector<
    G = StandardProxyEnv,
    H = DockerHostResolver,
    P = NoOverrides,
> {
    env: G,
    host: H,
    overrides: P,
}

impl<G, H, P> BuildContextInjector<G, H, P>
where
    G: ProxyEnvGenerator,
    H: HostAddressResolver,
    P: OverridePacker,
{
    pub fn new(env: G, host: H, overrides: P) -> Self {
        Self {
            env,
            host,
            overrides,
        }
    }

    /// Compute the per-build injection settings.
    pub fn build_config(&self, config: &BuildProxyConfig) -> Result<BuildConfig> {
        let host_address = self.host.host_address(Platform::current())?;
        let mut env = self.env.proxy_env(&ProxyEnvRequest {
            proxy_port: config.proxy_port,
            cert_path: CERT_PATH,
            host_address: &host_address,
            runtime: RuntimeInheritance::PosixInherit,
            target_platform: Platform::Linux,
        })?;
        env.remove(DOCKER_HOST_VAR);

        Ok(BuildConfig {
            proxy_port: config.proxy_port,
            certificate: config.ca_certificate.clone(),
            env,
        })
    }

    /// Rewrite the build context read from `input` into `output`.
    ///
    /// `count` is resolved with the Dockerfile's injected command count, or
    /// with 0 once the whole archive has been read without finding it.
    pub fn inject<R: Read, W: Write>(
        &self,
        dockerfile_name: &str,
        input: R,
        output: W,
        config: &BuildProxyConfig,
        count: &CommandCountCell,
    ) -> Result<W> {
        config.validate()?;
        let build_config = self.build_config(config)?;

        let mut archive = tar::Archive::new(maybe_decompress(input)?);
        let mut builder = tar::Builder::new(output);
        let mut pending: Vec<Extension> = Vec::new();
        let mut found = false;

        for entry in archive.entries()?.raw(true) {
            let mut entry = entry?;
            let header = entry.header().clone();
            let size = entry.size();

            if matches!(
                header.entry_type(),
                EntryType::GNULongName | EntryType::GNULongLink | EntryType::XHeader
            ) {
                let mut data = Vec::new();
                ExactSize::new(&mut entry, size).read_to_end(&mut data)?;
                pending.push(Extension { header, data });
                continue;
            }

            let extensions = std::mem::take(&mut pending);
            let path = effective_path(&header, &extensions)?;

            if path != dockerfile_name {
                for ext in &extensions {
                    builder.append(&ext.header, ext.data.as_slice())?;
                }
                builder.append(&header, ExactSize::new(&mut entry, size))?;
                continue;
            }

            tracing::debug!(path = %path, "Rewriting Dockerfile in build context");
            let mut content = Vec::new();
            ExactSize::new(&mut entry, size).read_to_end(&mut content)?;
            let content = String::from_utf8(content).map_err(|e| {
                BoxError::BuildError(format!("Dockerfile {} is not valid UTF-8: {}", path, e))
            })?;

            let injected = inject_into_dockerfile(&content, &build_config)?;
            let body = injected.dockerfile.into_bytes();

            for ext in &extensions {
                if ext.header.entry_type() == EntryType::XHeader {
                    let data = strip_pax_size(&ext.data)?;
                    let mut ext_header = ext.header.clone();
                    ext_header.set_size(data.len() as u64);
                    ext_header.set_cksum();
                    builder.append(&ext_header, data.as_slice())?;
                } else {
                    builder.append(&ext.header, ext.data.as_slice())?;
                }
            }

            let mut header = header;
            header.set_size(body.len() as u64);
            header.set_cksum();
            builder.append(&header, body.as_slice())?;

            count.resolve(injected.commands_added);
            found = true;
        }

        // Extension headers with no entry after them
        for ext in &pending {
            builder.append(&ext.header, ext.data.as_slice())?;
        }

        if found {
            tracing::info!(
                dockerfile = dockerfile_name,
                "Injected build proxy into build context"
            );
        } else {
            tracing::warn!(
                dockerfile = dockerfile_name,
                "Dockerfile not found in build context, nothing injected"
            );
        }
        count.resolve(0);

        let mut cert_header = Header::new_gnu();
        cert_header.set_entry_type(EntryType::Regular);
        cert_header.set_size(config.ca_certificate.len() as u64);
        cert_header.set_mode(0o644);
        cert_header.set_mtime(unix_now());
        builder.append_data(
            &mut cert_header,
            cert_archive_path(),
            config.ca_certificate.as_bytes(),
        )?;

        self.overrides
            .pack_overrides(&mut builder, &overrides_archive_path())?;

        let mut output = builder.into_inner()?;
        output.flush()?;
        Ok(output)
    }
}

impl<G, H, P> BuildContextInjector<G, H, P>
where
    G: ProxyEnvGenerator + Send + Sync + 'static,
    H: HostAddressResolver + Send + Sync + 'static,
    P: OverridePacker + Send + Sync + 'static,
{
    /// Run [`inject`](Self::inject) on the blocking pool.
    ///
    /// The command count can be awaited while the archive is still streaming.
    pub fn spawn<R, W>(
        self: Arc<Self>,
        dockerfile_name: impl Into<String>,
        input: R,
        output: W,
        config: BuildProxyConfig,
    ) -> InjectedBuildStream<W>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let dockerfile_name = dockerfile_name.into();
        let (cell, commands_added) = command_count();

        let task = tokio::task::spawn_blocking(move || {
            let result = self.inject(&dockerfile_name, input, output, &config, &cell);
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Build context rewrite failed");
            }
            result
        });

        InjectedBuildStream {
            task,
            commands_added,
        }
    }
}

/// Rewrite a build context with the standard collaborators, using the
/// Dockerfile name from `config`.
pub fn inject_into_build_stream<R: Read, W: Write>(
    input: R,
    output: W,
    config: &BuildProxyConfig,
) -> Result<InjectedContext<W>> {
    let (cell, mut count) = command_count();
    let output = BuildContextInjector::<StandardProxyEnv, DockerHostResolver, NoOverrides>::default()
        .inject(&config.dockerfile, input, output, config, &cell)?;
    Ok(InjectedContext {
        output,
        commands_added: count.try_get().unwrap_or_default(),
    })
}

/// Reads exactly `remaining` bytes, failing if the archive ends first.
struct ExactSize<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> ExactSize<R> {
    fn new(inner: R, remaining: u64) -> Self {
        Self { inner, remaining }
    }
}

impl<R: Read> Read for ExactSize<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = usize::try_from(self.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "build context archive is truncated",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Entry name after applying any GNU long-name or PAX `path` override.
fn effective_path(header: &Header, extensions: &[Extension]) -> Result<String> {
    for ext in extensions.iter().rev() {
        match ext.header.entry_type() {
            EntryType::GNULongName => {
                let name = ext.data.split(|b| *b == 0).next().unwrap_or_default();
                return Ok(String::from_utf8_lossy(name).into_owned());
            }
            EntryType::XHeader => {
                if let Some((_, value)) = parse_pax_records(&ext.data)?
                    .into_iter()
                    .find(|(key, _)| key == "path")
                {
                    return Ok(String::from_utf8_lossy(&value).into_owned());
                }
            }
            _ => {}
        }
    }
    Ok(header.path()?.to_string_lossy().into_owned())
}

/// Split PAX extended header data into `(key, value)` records.
fn parse_pax_records(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let malformed = || BoxError::BuildError("Malformed PAX extended header".to_string());
    let mut records = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let space = rest.iter().position(|b| *b == b' ').ok_or_else(malformed)?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(malformed)?;
        if len <= space + 1 || len > rest.len() {
            return Err(malformed());
        }

        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        let eq = record.iter().position(|b| *b == b'=').ok_or_else(malformed)?;
        let key = String::from_utf8_lossy(&record[..eq]).into_owned();
        records.push((key, record[eq + 1..].to_vec()));
        rest = &rest[len..];
    }

    Ok(records)
}

/// Render `(key, value)` records in PAX `"<len> <key>=<value>\n"` form.
fn render_pax_records(records: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in records {
        // The length prefix counts its own digits
        let base = key.len() + value.len() + 3;
        let mut len = base + 1;
        while len != base + len.to_string().len() {
            len = base + len.to_string().len();
        }
        data.extend_from_slice(format!("{} {}=", len, key).as_bytes());
        data.extend_from_slice(value);
        data.push(b'\n');
    }
    data
}

/// Drop the `size` record so the rewritten ustar size is authoritative.
fn strip_pax_size(data: &[u8]) -> Result<Vec<u8>> {
    let records = parse_pax_records(data)?;
    if !records.iter().any(|(key, _)| key == "size") {
        return Ok(data.to_vec());
    }
    let kept: Vec<_> = records.into_iter().filter(|(key, _)| key != "size").collect();
    Ok(render_pax_records(&kept))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
