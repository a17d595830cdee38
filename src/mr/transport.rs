//! Moving intermediate files between processes: every master and worker runs
//! a read-only file server over its work directory, and anyone who needs a
//! file fetches it by URL.

use std::net::SocketAddr;
use std::path::Path;

use axum::Router;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{debug, error, info};

use crate::mr::error::{MrError, Result};
use crate::mr::names;

/// Expose `dir` read-only under `/data/` on `addr`, in the background.
///
/// Returns the bound address (useful when `addr` carries port 0) and the
/// server task handle. There is no write route and no range support.
pub async fn serve_files(addr: &str, dir: impl AsRef<Path>) -> Result<(SocketAddr, JoinHandle<()>)> {
    let app = Router::new().nest_service(&format!("/{}", names::DATA_DIR), ServeDir::new(dir.as_ref()));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    info!("serving {} on http://{bound}/{}/", dir.as_ref().display(), names::DATA_DIR);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("file server on {bound} failed: {e}");
        }
    });
    Ok((bound, handle))
}

/// Stream the file at `url` into `dest`, replacing it. No caching, no
/// partial content; repeated fetches of one URL yield identical files.
pub async fn fetch(url: &str, dest: impl AsRef<Path>) -> Result<()> {
    let dest = dest.as_ref();
    debug!("fetching {url} into {}", dest.display());

    let failed = |reason: String| MrError::FetchFailed {
        url: url.to_string(),
        reason,
    };

    let response = reqwest::get(url).await.map_err(|e| failed(e.to_string()))?;
    if !response.status().is_success() {
        return Err(failed(format!("status {}", response.status())));
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| failed(e.to_string()))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// The sibling address one port above `address`. The master's RPC endpoint
/// and its file server share a host this way.
pub fn data_sibling(address: &str) -> Result<String> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| MrError::Config(format!("address {address:?} is not host:port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| MrError::Config(format!("bad port in address {address:?}")))?;
    let port = port
        .checked_add(1)
        .ok_or_else(|| MrError::Config(format!("no port above {port} for the file server")))?;
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn fetch_round_trips_served_bytes() {
        let dir = TempDir::new().unwrap();
        let content = b"pairs ahead".repeat(1000);
        tokio::fs::write(dir.path().join("blob.sqlite3"), &content)
            .await
            .unwrap();
        let (addr, _server) = serve_files("127.0.0.1:0", dir.path()).await.unwrap();

        let dest_dir = TempDir::new().unwrap();
        let dest = dest_dir.path().join("copy.sqlite3");
        let url = names::make_url(&addr.to_string(), "blob.sqlite3");
        fetch(&url, &dest).await.unwrap();
        // A second fetch of the same URL yields the same bytes.
        fetch(&url, &dest).await.unwrap();

        assert_eq!(tokio::fs::read(&dest).await.unwrap(), content);
    }

    #[tokio::test]
    async fn fetch_of_a_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let (addr, _server) = serve_files("127.0.0.1:0", dir.path()).await.unwrap();

        let dest_dir = TempDir::new().unwrap();
        let url = names::make_url(&addr.to_string(), "nope.sqlite3");
        let err = fetch(&url, dest_dir.path().join("copy.sqlite3"))
            .await
            .unwrap_err();
        assert!(matches!(err, MrError::FetchFailed { .. }));
    }

    #[test]
    fn data_sibling_is_one_port_up() {
        assert_eq!(data_sibling("localhost:8080").unwrap(), "localhost:8081");
        assert!(data_sibling("no-port").is_err());
        assert!(data_sibling("host:65535").is_err());
    }
}
