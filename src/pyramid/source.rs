//! Where tile bytes come from.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::TileFetchError;
use super::metadata::TileDescriptor;
use super::zif::ZifContainer;
use crate::download::PageFetcher;

/// Supplies the encoded bytes of one tile.
#[async_trait]
pub trait TileSource: Send + Sync {
    async fn fetch_tile(&self, tile: &TileDescriptor) -> Result<Vec<u8>, TileFetchError>;
}

/// Fetches tiles over HTTP with the page fetcher's retry budget and egress pool.
#[derive(Debug, Clone)]
pub struct HttpTileSource {
    fetcher: PageFetcher,
    cancel: CancellationToken,
}

impl HttpTileSource {
    #[must_use]
    pub fn new(fetcher: PageFetcher, cancel: CancellationToken) -> Self {
        Self { fetcher, cancel }
    }
}

#[async_trait]
impl TileSource for HttpTileSource {
    async fn fetch_tile(&self, tile: &TileDescriptor) -> Result<Vec<u8>, TileFetchError> {
        Ok(self.fetcher.fetch_body(&tile.url, &self.cancel).await?)
    }
}

#[async_trait]
impl TileSource for ZifContainer {
    async fn fetch_tile(&self, tile: &TileDescriptor) -> Result<Vec<u8>, TileFetchError> {
        self.tile(tile.column, tile.row)
            .map(<[u8]>::to_vec)
            .ok_or(TileFetchError::NotInContainer {
                column: tile.column,
                row: tile.row,
            })
    }
}
