#[cfg(feature = "https")]
use std::fs::read;
use std::net::SocketAddr;
#[cfg(feature = "https")]
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::{BoxFuture, try_join_all};
use tokio::runtime::Runtime;
use verdict_cache::{TokioClock, metric};

use crate::config::Config;
use crate::endpoints;
use crate::service::ClassifyService;

type ServerFuture = BoxFuture<'static, std::io::Result<()>>;

#[cfg(feature = "https")]
fn read_pem_file(path: &Path) -> Result<Vec<u8>> {
    read(path).with_context(|| format!("unable to read file: {}", path.display()))
}

#[cfg(feature = "https")]
fn serve_https(
    runtime: &Runtime,
    config: &Config,
    socket: SocketAddr,
    service: ClassifyService,
) -> Result<ServerFuture> {
    use axum_server::tls_rustls::RustlsConfig;

    let https_conf = config
        .https
        .as_ref()
        .context("`bind_https` needs an `https` configuration")?;
    let certificate = read_pem_file(&https_conf.certificate_path)?;
    let key = read_pem_file(&https_conf.key_path)?;
    let tls_config = runtime.block_on(RustlsConfig::from_pem(certificate, key))?;

    let server = axum_server::bind_rustls(socket, tls_config)
        .serve(endpoints::create_app(service).into_make_service());
    Ok(Box::pin(server))
}

#[cfg(not(feature = "https"))]
fn serve_https(
    _runtime: &Runtime,
    _config: &Config,
    _socket: SocketAddr,
    _service: ClassifyService,
) -> Result<ServerFuture> {
    anyhow::bail!("HTTPS support requires the `https` feature, use `run --local` to skip it")
}

/// Starts the HTTP (and optionally HTTPS) server based on the loaded config.
///
/// With `local`, HTTPS is skipped even if it is configured.
pub fn run(config: Config, local: bool) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("verdict-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    // A single service, so that both servers share one cache.
    let clock = Arc::new(TokioClock::new(runtime.handle().clone()));
    let service = ClassifyService::create(&config, clock).context("failed to create service")?;

    let mut servers: Vec<ServerFuture> = vec![];

    let socket_http = config.bind.parse::<SocketAddr>()?;
    let server_http = axum_server::bind(socket_http)
        .serve(endpoints::create_app(service.clone()).into_make_service());
    servers.push(Box::pin(server_http));
    tracing::info!("Starting HTTP server on {}", socket_http);

    match config.bind_https {
        Some(ref bind_str) if !local => {
            let socket_https = bind_str.parse::<SocketAddr>()?;
            let server_https = serve_https(&runtime, &config, socket_https, service)?;
            servers.push(server_https);
            tracing::info!("Starting HTTPS server on {}", socket_https);
        }
        Some(_) => tracing::info!("Running locally, not starting HTTPS server"),
        None => {}
    }

    runtime.block_on(try_join_all(servers))?;
    tracing::info!("System shutdown complete");

    Ok(())
}
