//! TCP server exposing a directory to remote connectors

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::error::ConnectionError;
use crate::logging::*;
use crate::session::{Session, SessionConfig};
use crate::tree::Directory;

/// Stops a running [`Server`] and all of its sessions
#[derive(Clone)]
pub struct ShutdownHandle {
	tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
	pub fn shutdown(&self) {
		self.tx.send_replace(true);
	}
}

/// Decrements the live session counter when a session task ends
struct SessionGuard(Arc<AtomicUsize>);

impl Drop for SessionGuard {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

pub struct Server {
	dir: Directory,
	listener: TcpListener,
	config: Arc<SessionConfig>,
	shutdown: Arc<watch::Sender<bool>>,
	sessions: Arc<AtomicUsize>,
	next_id: AtomicU64,
}

impl Server {
	pub async fn bind<A: ToSocketAddrs>(
		dir: &Directory,
		addr: A,
		config: SessionConfig,
	) -> Result<Self, ConnectionError> {
		let listener = TcpListener::bind(addr).await.map_err(|e| ConnectionError::ConnectFailed {
			addr: "listen address".to_string(),
			source: e,
		})?;
		let (tx, _) = watch::channel(false);
		Ok(Server {
			dir: dir.clone(),
			listener,
			config: Arc::new(config),
			shutdown: Arc::new(tx),
			sessions: Arc::new(AtomicUsize::new(0)),
			next_id: AtomicU64::new(1),
		})
	}

	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	/// Number of sessions currently being served
	pub fn session_count(&self) -> usize {
		self.sessions.load(Ordering::SeqCst)
	}

	/// Shared counter behind [`Server::session_count`], usable after `run` took the server
	pub fn session_counter(&self) -> Arc<AtomicUsize> {
		self.sessions.clone()
	}

	pub fn shutdown_handle(&self) -> ShutdownHandle {
		ShutdownHandle { tx: self.shutdown.clone() }
	}

	/// Accept connections until shut down, then wait for every session to finish
	pub async fn run(self) -> Result<(), ConnectionError> {
		let mut stop = self.shutdown.subscribe();
		let mut tasks = JoinSet::new();
		if let Ok(addr) = self.listener.local_addr() {
			info!("Serving on {}", addr);
		}

		loop {
			tokio::select! {
				accepted = self.listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(conn) => conn,
						Err(e) => {
							warn!("Accept failed: {}", e);
							continue;
						}
					};
					if let Err(e) = stream.set_nodelay(true) {
						debug!("Cannot set TCP_NODELAY for {}: {}", peer, e);
					}
					let id = self.next_id.fetch_add(1, Ordering::SeqCst);
					info!("Session {} accepted from {}", id, peer);
					let (reader, writer) = stream.into_split();
					let session = Session::new(
						id,
						&self.dir,
						self.config.clone(),
						reader,
						writer,
						self.shutdown.subscribe(),
					);
					self.sessions.fetch_add(1, Ordering::SeqCst);
					let guard = SessionGuard(self.sessions.clone());
					tasks.spawn(async move {
						let _guard = guard;
						let _ = session.run().await;
					});
				}
				Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
					if let Err(e) = finished {
						error!("Session task failed: {}", e);
					}
				}
				_ = stop.wait_for(|stopped| *stopped) => break,
			}
		}

		info!("Server shutting down, waiting for {} sessions", tasks.len());
		while tasks.join_next().await.is_some() {}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn test_bind_and_shutdown() {
		let dir = Directory::new();
		let server = Server::bind(&dir, "127.0.0.1:0", SessionConfig::default()).await.unwrap();
		assert_ne!(server.local_addr().unwrap().port(), 0);
		assert_eq!(server.session_count(), 0);
		let handle = server.shutdown_handle();
		let task = tokio::spawn(server.run());
		handle.shutdown();
		tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
	}
}

// vim: ts=4
