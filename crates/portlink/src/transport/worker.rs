//! Worker thread: a peer served on a dedicated OS thread.
//!
//! Each connect starts a new thread with its own current-thread runtime and
//! joins it to the caller through an in-memory channel pair. The thread exits
//! once the caller's end is dropped.

use std::sync::Arc;

use async_trait::async_trait;

use super::TransportError;
use crate::bridge::channel::{Channel, ChannelFactory};
use crate::peer::{PeerOptions, RequestHandler, serve};

pub struct WorkerFactory<H> {
    handler: Arc<H>,
    options: PeerOptions,
}

impl<H: RequestHandler> WorkerFactory<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            options: PeerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PeerOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl<H: RequestHandler> ChannelFactory for WorkerFactory<H> {
    async fn open(&self, peer: &str) -> Result<Channel, TransportError> {
        let (local, remote) = Channel::pair(peer);
        let handler = Arc::clone(&self.handler);
        let options = self.options.clone();
        let thread_peer = peer.to_string();

        std::thread::Builder::new()
            .name(format!("portlink-worker-{peer}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        // Dropping `remote` here closes the caller's channel.
                        tracing::error!(peer = %thread_peer, error = %e, "Failed to build worker runtime");
                        return;
                    }
                };
                runtime.block_on(serve(remote, handler, options));
                tracing::debug!(peer = %thread_peer, "Worker thread exiting");
            })
            .map_err(|source| TransportError::Spawn {
                peer: peer.to_string(),
                source,
            })?;

        tracing::info!(%peer, "Started worker thread");
        Ok(local)
    }
}
