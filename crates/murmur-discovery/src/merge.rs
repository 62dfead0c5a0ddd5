//! Fan-in of several discovery sources into one stream.

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::{Discovery, Sightings};

/// Forwards every sighting from every inner source. The merged stream
/// ends only after all inner streams have ended; with no sources it ends
/// immediately.
#[derive(Default)]
pub struct MergeDiscovery {
    sources: Vec<Box<dyn Discovery>>,
}

impl MergeDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: impl Discovery + 'static) {
        self.sources.push(Box::new(source));
    }

    pub fn with(mut self, source: impl Discovery + 'static) -> Self {
        self.push(source);
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl Discovery for MergeDiscovery {
    fn discover(&self, cancel: CancellationToken) -> Sightings {
        let (tx, rx) = Sightings::channel();

        let forwarders: Vec<_> = self
            .sources
            .iter()
            .map(|source| {
                let mut inner = source.discover(cancel.clone());
                let tx = tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    while let Some(peer) = inner.next().await {
                        if !tx.emit(peer, &cancel).await {
                            break;
                        }
                    }
                })
            })
            .collect();

        // Barrier: the last sender goes away only once every forwarder
        // has finished, which is what closes the merged stream.
        tokio::spawn(async move {
            for result in join_all(forwarders).await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "discovery forwarder panicked");
                }
            }
            drop(tx);
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticDiscovery;
    use murmur_core::{PeerRecord, Ports};
    use std::time::Duration;

    fn source(prefix: &str, k: usize) -> StaticDiscovery {
        (0..k).fold(StaticDiscovery::new(), |s, i| {
            s.with_peer(&PeerRecord::new(format!("{prefix}-{i}"), "n".into(), Ports::default(), String::new()))
        })
    }

    #[tokio::test]
    async fn zero_sources_close_immediately() {
        let mut merged = MergeDiscovery::new().discover(CancellationToken::new());
        let next = tokio::time::timeout(Duration::from_secs(1), merged.next()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn nested_merge_forwards_everything() {
        let inner = MergeDiscovery::new().with(source("x", 2)).with(source("y", 1));
        let outer = MergeDiscovery::new().with(inner).with(source("z", 3));

        let mut merged = outer.discover(CancellationToken::new());
        let mut ids = Vec::new();
        while let Some(p) = merged.next().await {
            ids.push(p.id);
        }
        ids.sort();
        assert_eq!(ids, vec!["x-0", "x-1", "y-0", "z-0", "z-1", "z-2"]);
    }
}
