use std::future::Future;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::time::{self, Instant};
use tracing::{debug, error, trace};

use crate::cache::ResolutionCache;
use crate::config::{CniEnv, PluginInput, Settings, DEFAULT_CNI_VERSION};
use crate::delegate::Delegate;
use crate::error::{Error, Result};
use crate::filter;
use crate::logging;
use crate::node::{self, KubeNodeReader, NodeReader};
use crate::types::{DelegateConf, ErrorResult, HostLocalIpam};

/// Serve one invocation and return the delegate's stdout.
///
/// The host-local config is taken from the cache when it is valid,
/// otherwise it is resolved from the own node object and cached. It is
/// then narrowed by the IPv4 namespace allow-list and handed to
/// host-local. If host-local fails or the deadline passes while it runs,
/// the cache is removed so the next invocation resolves it again.
///
/// The API server may be slow, so the invocation as a whole is bounded by
/// `settings.timeout`.
pub async fn execute(
    input: &PluginInput,
    env: &CniEnv,
    settings: &Settings,
    nodes: &dyn NodeReader,
) -> Result<Vec<u8>> {
    trace!(command = %env.command, args = ?env.args, ?input, "Started");
    let deadline = Instant::now() + settings.timeout;

    let Some(ipam) = &input.ipam else {
        // Acceptable for VERSION only
        if env.is_version() {
            let delegate = Delegate::locate(&settings.delegate, &env.path)?;
            let conf = delegate_conf(input, None);
            return within(deadline, settings.timeout, delegate.invoke(&conf)).await;
        }
        return Err(Error::MissingIpam);
    };

    let cache = ResolutionCache::for_network(settings, &input.name, ipam.data_dir());
    let resolved = match cache.read() {
        Ok(resolved) => resolved,
        Err(err) => {
            // Expected on first use and harmless, keep it out of info
            debug!(error = %err, "Read cache");
            let own_node = node::get_own_node(nodes, env.node_name.as_deref(), &settings.machine_id_path);
            let node = within(deadline, settings.timeout, own_node).await?;
            let subnets = node::get_subnets(&node, ipam.annotation())?;
            let resolved = ResolutionCache::build(&subnets, ipam.data_dir().map(str::to_string))?;
            cache.write(&resolved);
            resolved
        }
    };

    let ranges = filter::apply(&resolved, env.pod_namespace(), ipam.ipv4_namespaces.as_deref());
    let conf = delegate_conf(input, Some(ranges));

    let mut delegate =
        Delegate::locate(&settings.delegate, &env.path).inspect_err(|_| cache.invalidate())?;
    if let Some(kubeconfig) = ipam.kubeconfig() {
        delegate = delegate.with_env("KUBECONFIG", kubeconfig.to_string_lossy());
    }
    let delegate = delegate.for_check(env.is_check());
    within(deadline, settings.timeout, delegate.invoke(&conf))
        .await
        .inspect_err(|_| cache.invalidate())
}

/// Run `fut` until `deadline`. Dropping a delegate invocation kills the
/// child.
async fn within<T>(
    deadline: Instant,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    time::timeout_at(deadline, fut)
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(timeout)))
}

fn delegate_conf(input: &PluginInput, ipam: Option<HostLocalIpam>) -> DelegateConf {
    DelegateConf {
        name: input.name.clone(),
        cni_version: input.cni_version.clone(),
        is_default_gateway: input.is_default_gateway,
        ipam,
    }
}

/// Format `err` as a CNI error on stdout. This is the only place a
/// failure is reported.
pub fn emit_error(cni_version: &str, err: &Error) -> ExitCode {
    error!(code = err.code(), msg = err.msg(), error = %err, "CNI error");
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{}", ErrorResult::new(cni_version, err).to_json());
    let _ = stdout.flush();
    ExitCode::FAILURE
}

/// Main entry point for the CNI plugin
pub fn run_cni(settings: &Settings) -> ExitCode {
    let mut stdin_data = Vec::new();
    if let Err(e) = io::stdin().read_to_end(&mut stdin_data) {
        return emit_error(DEFAULT_CNI_VERSION, &Error::Stdin(e));
    }
    let input = match PluginInput::parse(&stdin_data) {
        Ok(input) => input,
        Err(err) => return emit_error(DEFAULT_CNI_VERSION, &err),
    };
    let cni_version = input.cni_version_or_default().to_string();

    logging::init(input.ipam.as_ref());
    let env = CniEnv::from_env();

    match run(&input, &env, settings) {
        Ok(stdout) => {
            let mut out = io::stdout().lock();
            if let Err(e) = out.write_all(&stdout).and_then(|_| out.flush()) {
                error!(error = %e, "Write result");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(err) => emit_error(&cni_version, &err),
    }
}

fn run(input: &PluginInput, env: &CniEnv, settings: &Settings) -> Result<Vec<u8>> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Runtime)?;

    let kubeconfig = input
        .ipam
        .as_ref()
        .and_then(|ipam| ipam.kubeconfig())
        .map(PathBuf::from);
    let nodes = KubeNodeReader::new(kubeconfig);

    runtime.block_on(execute(input, env, settings, &nodes))
}
