//! TCP listener and per-connection RPC bootstrap.
//!
//! capnp-rpc is `!Send`, so everything here runs on a `LocalSet`: the accept
//! loop and one local task per connection, each owning its own
//! `RpcSystem`. Connections share the backend and nothing else.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use capnp_rpc::{RpcSystem, rpc_twoparty_capnp, twoparty};
use futures::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::Instrument;

use mirrorfs_vfs::VfsOps;

use crate::constants::ACCEPT_ERROR_BACKOFF;
use crate::mirrorfs_capnp::mirror_fs;
use crate::rpc::MirrorFsImpl;

/// Accept connections forever, serving each on its own local task.
///
/// MUST be called within a `tokio::task::LocalSet` context. A failed
/// `accept` is logged and retried after [`ACCEPT_ERROR_BACKOFF`]; it never
/// takes down sessions that are already running.
pub async fn serve(listener: TcpListener, backend: Arc<dyn VfsOps>) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Listening on {}", addr);
    }

    accept_loop(|| listener.accept(), backend).await
}

async fn accept_loop<F, Fut>(mut accept: F, backend: Arc<dyn VfsOps>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok((stream, peer)) => {
                let backend = backend.clone();
                tokio::task::spawn_local(
                    serve_connection(stream, backend).instrument(tracing::info_span!(
                        "serve.connection",
                        peer = %peer
                    )),
                );
            }
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Run one RPC session to completion over an accepted stream.
pub async fn serve_connection(stream: TcpStream, backend: Arc<dyn VfsOps>) {
    let peer: Option<SocketAddr> = stream.peer_addr().ok();
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let (reader, writer) = stream.compat().split();

    let client: mirror_fs::Client = capnp_rpc::new_client(MirrorFsImpl::new(backend));

    let network = twoparty::VatNetwork::new(
        futures::io::BufReader::new(reader),
        futures::io::BufWriter::new(writer),
        rpc_twoparty_capnp::Side::Server,
        Default::default(),
    );
    let rpc_system = RpcSystem::new(Box::new(network), Some(client.client));

    tracing::info!(?peer, "RPC session started");
    if let Err(e) = rpc_system.await {
        tracing::warn!(?peer, "RPC session error: {}", e);
    }
    tracing::info!(?peer, "RPC session ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    use mirrorfs_vfs::MemoryBackend;
    use tokio::task::LocalSet;

    fn run_local<F: Future<Output = ()>>(f: F) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(LocalSet::new().run_until(f));
    }

    #[test]
    fn test_accept_errors_do_not_stop_the_loop() {
        run_local(async {
            let listener = Rc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
            let addr = listener.local_addr().unwrap();
            let backend: Arc<dyn VfsOps> =
                Arc::new(MemoryBackend::new().with_file("/a.txt", b"hello".to_vec()));

            // The first two accepts fail the way EMFILE would.
            let attempts = Rc::new(Cell::new(0u32));
            let accept = {
                let attempts = attempts.clone();
                move || {
                    let listener = listener.clone();
                    let attempt = attempts.get();
                    attempts.set(attempt + 1);
                    async move {
                        if attempt < 2 {
                            Err(io::Error::other("too many open files"))
                        } else {
                            listener.accept().await
                        }
                    }
                }
            };
            tokio::task::spawn_local(accept_loop(accept, backend));

            let client = mirrorfs_client::connect_tcp(&addr.to_string())
                .await
                .unwrap();
            let attr = client.stat_entry("/a.txt").await.unwrap();
            assert_eq!(attr.size, 5);
            assert!(attempts.get() >= 3);

            // Still accepting after the first connection
            let second = mirrorfs_client::connect_tcp(&addr.to_string())
                .await
                .unwrap();
            assert!(second.stat_entry("/a.txt").await.is_ok());
        });
    }
}
