use std::path::{Path, PathBuf};

/// Default directory holding rendezvous sockets.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp";

/// Environment variable overriding [`DEFAULT_SOCKET_DIR`].
pub const SOCKET_DIR_ENV: &str = "VCHAN_SOCKET_DIR";

/// Socket directory from the environment, falling back to [`DEFAULT_SOCKET_DIR`].
pub fn default_socket_dir() -> PathBuf {
    match std::env::var_os(SOCKET_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_SOCKET_DIR),
    }
}

/// Addressing triple for a channel rendezvous point.
///
/// Server and client build the key from opposite id orderings — the server
/// puts its own domain first, the client puts the peer's domain first — so
/// both sides resolve the identical socket path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RendezvousKey {
    pub server_domain: u32,
    pub client_domain: u32,
    pub port: u32,
}

impl RendezvousKey {
    /// Key as derived by the listening side.
    pub fn for_server(local_domain: u32, peer_domain: u32, port: u32) -> Self {
        Self {
            server_domain: local_domain,
            client_domain: peer_domain,
            port,
        }
    }

    /// Key as derived by the connecting side.
    pub fn for_client(local_domain: u32, peer_domain: u32, port: u32) -> Self {
        Self {
            server_domain: peer_domain,
            client_domain: local_domain,
            port,
        }
    }

    /// Rendezvous socket path under `dir`.
    pub fn socket_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!(
            "vchan.{}.{}.{}.sock",
            self.server_domain, self.client_domain, self.port
        ))
    }
}
