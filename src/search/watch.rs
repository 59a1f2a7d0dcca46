//! One change-feed tailer per replication-log host

use super::IndexSynchronizer;
use crate::config::FeedSettings;
use crate::error::Result;
use crate::feed::{FeedHandler, OperationKind, ReplicationLog, StopSignal, Tailer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Start one tailer task per distinct host among `synchronizers`, each
/// following the source namespaces of its indexes. `connect` opens the
/// replication log of a host.
pub fn watch<C>(
    synchronizers: &[Arc<IndexSynchronizer>],
    settings: &FeedSettings,
    connect: C,
    stop: StopSignal,
) -> Result<Vec<JoinHandle<Result<()>>>>
where
    C: Fn(&str) -> Result<Arc<dyn ReplicationLog>>,
{
    let mut hosts: BTreeMap<&str, Vec<&Arc<IndexSynchronizer>>> = BTreeMap::new();
    for synchronizer in synchronizers {
        hosts
            .entry(synchronizer.index().host())
            .or_default()
            .push(synchronizer);
    }

    let mut tasks = Vec::with_capacity(hosts.len());
    for (host, group) in hosts {
        let mut tailer = Tailer::new(connect(host)?, settings);
        let mut namespaces = Vec::new();
        for synchronizer in group {
            let namespace = synchronizer.index().feed_namespace();
            tailer.follow(namespace.clone());
            let handler: Arc<dyn FeedHandler> = synchronizer.clone();
            for kind in [OperationKind::Insert, OperationKind::Update, OperationKind::Delete] {
                tailer.add_handler(namespace.clone(), kind, Arc::clone(&handler));
            }
            namespaces.push(namespace);
        }
        info!(host, ?namespaces, "watching");

        let stop = stop.clone();
        tasks.push(tokio::spawn(async move { tailer.run(stop).await }));
    }
    Ok(tasks)
}
