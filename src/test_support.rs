//! Fixtures shared by the unit tests: a throwaway HTTP responder for the
//! dataset download and an in-memory catalog that can be told to fail.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{CatalogItem, CatalogStore, ItemKind};

pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Answers every request with the next canned `(status, body)`; the last one repeats.
pub(crate) struct DatasetServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl DatasetServer {
    pub(crate) async fn start(status: u16, body: Vec<u8>) -> Self {
        Self::start_sequence(vec![(status, body)]).await
    }

    pub(crate) async fn start_sequence(responses: Vec<(u16, Vec<u8>)>) -> Self {
        assert!(!responses.is_empty());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses[n.min(responses.len() - 1)].clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = format!(
                        "HTTP/1.1 {status} Canned\r\nContent-Type: application/gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        Self { addr, hits, task }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}/title.ratings.tsv.gz", self.addr)
    }

    pub(crate) fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for DatasetServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) fn item(
    imdb_id: Option<&str>,
    rating: Option<f32>,
    parent_key: &str,
) -> CatalogItem {
    CatalogItem {
        id: Uuid::new_v4(),
        name: imdb_id.unwrap_or("untitled").to_string(),
        kind: ItemKind::Movie,
        imdb_id: imdb_id.map(str::to_string),
        community_rating: rating,
        parent_key: parent_key.to_string(),
    }
}

/// Catalog held in memory. `fail_on_call` makes the n-th `persist_batch` (0-based) fail.
#[derive(Default)]
pub(crate) struct MemoryCatalog {
    pub(crate) items: Vec<CatalogItem>,
    pub(crate) fail_on_call: Option<usize>,
    pub(crate) calls: AtomicUsize,
    pub(crate) persisted: Mutex<HashMap<Uuid, Option<f32>>>,
    pub(crate) batches: Mutex<Vec<(String, usize)>>,
}

impl MemoryCatalog {
    pub(crate) fn new(items: Vec<CatalogItem>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub(crate) fn persisted_rating(&self, id: &Uuid) -> Option<Option<f32>> {
        self.persisted.lock().unwrap().get(id).copied()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn list_rated_items(&self, kinds: &[ItemKind]) -> anyhow::Result<Vec<CatalogItem>> {
        Ok(self
            .items
            .iter()
            .filter(|i| kinds.contains(&i.kind))
            .cloned()
            .collect())
    }

    async fn persist_batch(
        &self,
        parent_key: &str,
        items: &[&CatalogItem],
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            anyhow::bail!("cancelled");
        }
        if self.fail_on_call == Some(call) {
            anyhow::bail!("simulated write failure on batch {call}");
        }
        let mut persisted = self.persisted.lock().unwrap();
        for item in items {
            persisted.insert(item.id, item.community_rating);
        }
        self.batches
            .lock()
            .unwrap()
            .push((parent_key.to_string(), items.len()));
        Ok(())
    }
}
