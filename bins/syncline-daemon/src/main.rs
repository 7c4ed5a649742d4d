mod api;
mod config;
mod webhooks;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use log::{error, info, LevelFilter};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use syncline_core::comm::InProcessCommunicator;
use syncline_core::security::OpenAuthenticator;
use syncline_core::store::{FileStore, InMemoryStore, Storage};
use syncline_core::SyncService;

use config::DaemonConfig;

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("core: {0}")]
    Core(#[from] syncline_core::error::SyncError),
    #[error("bind: {0}")]
    Bind(std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("syncline.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path)?;
    init_logging(&cfg);

    let service = init_service(&cfg).await?;
    webhooks::start_dispatcher(service.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = start_api_server(&cfg, service.clone(), shutdown_rx).await?;
    info!(
        "syncline daemon listening on {}:{}",
        cfg.listening.address, cfg.listening.unsecure_port
    );

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let _ = ctrl_c.as_mut().await;
    info!("shutting down");
    service.stop(3).await;
    let _ = shutdown_tx.send(());
    let _ = server.await;
    Ok(())
}

fn init_logging(cfg: &DaemonConfig) {
    let level = match cfg.sync.log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

async fn init_service(cfg: &DaemonConfig) -> Result<Arc<SyncService>, DaemonError> {
    let store: Arc<dyn Storage> = if cfg.sync.ess_persistent_storage {
        Arc::new(
            FileStore::open(&cfg.sync.persistence_root_path, cfg.sync.max_chunk_buffer_bytes)
                .await?,
        )
    } else {
        Arc::new(InMemoryStore::new(cfg.sync.max_chunk_buffer_bytes))
    };
    let comm = Arc::new(InProcessCommunicator::new());
    let service = SyncService::init(
        cfg.sync.clone(),
        store,
        comm.clone(),
        Arc::new(OpenAuthenticator),
    )
    .await?;
    comm.attach(service.party(), service.clone()).await;
    Ok(service)
}

async fn start_api_server(
    cfg: &DaemonConfig,
    service: Arc<SyncService>,
    shutdown: oneshot::Receiver<()>,
) -> Result<JoinHandle<()>, DaemonError> {
    let addr: SocketAddr = format!("{}:{}", cfg.listening.address, cfg.listening.unsecure_port)
        .parse()
        .map_err(|_| {
            DaemonError::Config(config::ConfigError::Validation(
                "invalid listening address".to_string(),
            ))
        })?;
    let listener = TcpListener::bind(addr).await.map_err(DaemonError::Bind)?;

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let service = service.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let handler = service_fn(move |req: Request<Incoming>| {
                                    let service = service.clone();
                                    async move { api::handle_request(service, req).await }
                                });
                                let _ = http1::Builder::new().serve_connection(io, handler).await;
                            });
                        }
                        Err(err) => {
                            error!("accept failed: {}", err);
                            break;
                        }
                    }
                }
            }
        }
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::config::{load_config, ListeningType};
    use tempfile::tempdir;

    #[test]
    fn config_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("syncline.toml");
        let cfg = format!(
            r#"
[sync]
node_type = "CSS"
org_id = "myorg"
destination_type = "cloud"
destination_id = "css1"
communication_protocol = "http"
persistence_root_path = "{dir}"
resend_interval_secs = 5
log_level = "warn"

[listening]
listening_type = "unsecure"
address = "127.0.0.1"
unsecure_port = 9000
"#,
            dir = dir.path().display()
        );
        std::fs::write(&path, cfg).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.sync.org_id, "myorg");
        assert_eq!(loaded.listening.unsecure_port, 9000);
        assert_eq!(loaded.listening.listening_type, ListeningType::Unsecure);
    }

    #[test]
    fn ess_mode_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("syncline.toml");
        let cfg = r#"
[sync]
node_type = "ESS"
org_id = "myorg"
destination_type = "edge"
destination_id = "e1"
communication_protocol = "http"
http_css_host = "localhost"
http_css_port = 8080
"#;
        std::fs::write(&path, cfg).unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn secure_listening_requires_external_tls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("syncline.toml");
        let cfg = r#"
[sync]
node_type = "CSS"
destination_type = "cloud"
destination_id = "css1"

[listening]
listening_type = "secure"
"#;
        std::fs::write(&path, cfg).unwrap();
        assert!(load_config(&path).is_err());
    }
}
