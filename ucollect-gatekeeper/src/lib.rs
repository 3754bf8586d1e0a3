//! Public-facing accept loop (§4.8, §4.11): challenge/login/authenticate
//! each connection, then hand it off to a worker. Structured after
//! `ando-proxy::worker`'s `worker_loop` — bind, loop `accept`, spawn a
//! task per connection — adapted from a thread-per-core monoio loop to a
//! single tokio task per gatekeeper process (§5: one OS thread, one
//! current-thread runtime, per role).

pub mod authenticator;
pub mod login;
pub mod session;
pub mod worker_pool;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use authenticator::AuthenticatorClient;
use session::{Authenticate, Outcome};
use worker_pool::WorkerPool;

/// Bind `addr` and loop accepting clients, each driven through
/// [`session::run`] and handed off to a worker on success. Runs until the
/// listener errors or the process is asked to shut down.
pub async fn accept_loop(
    addr: &str,
    authenticator: Arc<AuthenticatorClient>,
    pool: Arc<WorkerPool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "gatekeeper listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let authenticator = authenticator.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, authenticator, pool).await {
                warn!(%peer, %err, "gatekeeper session ended with an error");
            }
        });
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    authenticator: Arc<AuthenticatorClient>,
    pool: Arc<WorkerPool>,
) -> anyhow::Result<()> {
    let authenticator_ref: &dyn Authenticate = authenticator.as_ref();
    match session::run(stream, authenticator_ref).await? {
        Outcome::HandOff {
            cid,
            stream,
            leftover,
            replay,
        } => {
            let worker = pool.route(&cid);
            info!(%cid, worker = worker.index, "handing off client to worker");
            worker.handoff(&cid, &replay, &leftover, stream).await?;
        }
        Outcome::Rejected => {}
    }
    Ok(())
}
