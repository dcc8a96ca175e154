//! The supervisor: owns the listener set, handles signals, and drives
//! graceful shutdown.
//!
//! SIGHUP re-reads the configuration and rebuilds the listeners; existing
//! connections keep the configuration snapshot they started with. SIGINT
//! and SIGTERM begin a graceful shutdown: accept loops stop, every
//! connection is told to wind down (log-io sessions send one final commit
//! point), and a watchdog bounds the wait.

pub(crate) mod connection;
pub(crate) mod dispatch;
pub(crate) mod listener;
pub(crate) mod shutdown;

use {
    anyhow::Context as _,
    std::{future::Future, path::PathBuf, sync::Arc},
    tokio::{
        signal::unix::{signal, SignalKind},
        sync::{broadcast, mpsc},
        task::JoinHandle,
        time,
    },
    tokio_rustls::TlsAcceptor,
    tracing::{error, info, warn},
};

use crate::{config::Config, transport::tls};
use listener::Listener;

/// Everything a connection needs from the server, captured at accept time.
pub(crate) struct ServerContext {
    pub(crate) config: Arc<Config>,
    pub(crate) tls_acceptor: Option<TlsAcceptor>,
    pub(crate) random_drop: f64,
    pub(crate) notify_shutdown: broadcast::Sender<()>,
    /// Never sent on; dropping the last clone tells the supervisor that
    /// every connection has drained.
    pub(crate) _done: mpsc::Sender<()>,
}

pub struct Server {
    config: Arc<Config>,
    config_path: PathBuf,
    random_drop: f64,
}

impl Server {
    pub fn new(config: Config, config_path: impl Into<PathBuf>, random_drop: f64) -> Server {
        Server {
            config: Arc::new(config),
            config_path: config_path.into(),
            random_drop,
        }
    }

    /// Serve until the given future completes or a termination signal
    /// arrives, then drain connections gracefully.
    pub async fn run(mut self, shutdown: impl Future) -> Result<(), anyhow::Error> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        let mut accept_tasks = self
            .start_listeners(&notify_shutdown, &done_tx)
            .context("unable to set up listen sockets")?;

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    self.reload(&mut accept_tasks, &notify_shutdown, &done_tx).await;
                }
            }
        }

        // Stop accepting, then ask every connection to wind down.
        stop_listeners(&mut accept_tasks).await;
        let _ = notify_shutdown.send(());
        drop(notify_shutdown);
        drop(done_tx);

        // `recv` returns None once the last connection has dropped its
        // sender; the watchdog bounds how long we wait for that.
        let timeout = self.config.server.shutdown_timeout;
        if time::timeout(timeout, done_rx.recv()).await.is_err() {
            warn!(
                "clients did not exit within {}, forcing shutdown",
                humantime::format_duration(timeout)
            );
        }
        Ok(())
    }

    fn context(
        &self,
        notify_shutdown: &broadcast::Sender<()>,
        done: &mpsc::Sender<()>,
    ) -> Result<Arc<ServerContext>, anyhow::Error> {
        let tls_acceptor = if self.config.server.listen_address.iter().any(|l| l.tls) {
            Some(tls::acceptor(&self.config.server).context("unable to set up TLS")?)
        } else {
            None
        };
        Ok(Arc::new(ServerContext {
            config: self.config.clone(),
            tls_acceptor,
            random_drop: self.random_drop,
            notify_shutdown: notify_shutdown.clone(),
            _done: done.clone(),
        }))
    }

    /// Bind every configured address; at least one must succeed.
    fn start_listeners(
        &self,
        notify_shutdown: &broadcast::Sender<()>,
        done: &mpsc::Sender<()>,
    ) -> Result<Vec<JoinHandle<()>>, anyhow::Error> {
        let ctx = self.context(notify_shutdown, done)?;
        let mut tasks = Vec::new();
        for address in &self.config.server.listen_address {
            match Listener::bind(address) {
                Ok(listener) => {
                    info!("listening on {}", address);
                    tasks.push(tokio::spawn(listener.accept_loop(ctx.clone())));
                }
                Err(err) => warn!("unable to listen on {}: {}", address, err),
            }
        }
        if tasks.is_empty() {
            anyhow::bail!("unable to listen on any address");
        }
        Ok(tasks)
    }

    /// Re-read the configuration and rebuild the listener set. A failure
    /// leaves the previous configuration serving.
    async fn reload(
        &mut self,
        accept_tasks: &mut Vec<JoinHandle<()>>,
        notify_shutdown: &broadcast::Sender<()>,
        done: &mpsc::Sender<()>,
    ) {
        info!(
            "received SIGHUP, reloading {}",
            self.config_path.display()
        );
        let reloaded = match Config::load(&self.config_path).await {
            Ok(config) => config,
            Err(err) => {
                error!("reload failed, keeping existing configuration: {:#}", err);
                return;
            }
        };

        // The old sockets must be gone before rebinding the same addresses.
        let previous = std::mem::replace(&mut self.config, Arc::new(reloaded));
        stop_listeners(accept_tasks).await;

        match self.start_listeners(notify_shutdown, done) {
            Ok(tasks) => *accept_tasks = tasks,
            Err(err) => {
                error!("reload failed, restoring previous listeners: {:#}", err);
                self.config = previous;
                match self.start_listeners(notify_shutdown, done) {
                    Ok(tasks) => *accept_tasks = tasks,
                    Err(err) => error!("unable to restore previous listeners: {:#}", err),
                }
            }
        }
    }
}

async fn stop_listeners(accept_tasks: &mut Vec<JoinHandle<()>>) {
    for task in accept_tasks.drain(..) {
        task.abort();
        // Await so the listening socket is certainly closed.
        let _ = task.await;
    }
}
