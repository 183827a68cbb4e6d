use std::time::Duration;

use changestream::coordinator::{ChangeStream, ChangeStreamService};
use changestream::error::ErrorKind;
use changestream::options::OpenRequest;
use changestream::source::ClusterConnector;
use changestream::types::WatchScope;
use cluster::InMemoryCluster;
use config::shared::ServerConfig;
use tracing::{debug, info, warn};

/// Runs the server until the stream ends or ctrl-c is received.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let cluster = InMemoryCluster::new(config.shards.iter().map(String::as_str));
    let stream = open_stream(&config, cluster).await?;

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c, the server runs until the stream ends");
            std::future::pending::<()>().await;
        }
    };
    let delivered = log_changes(stream, Duration::from_millis(config.poll_timeout_ms), shutdown).await?;
    info!(delivered, "change stream server stopped");

    Ok(())
}

/// Opens the stream the server logs, on the configured database or the whole cluster.
pub async fn open_stream<C>(config: &ServerConfig, connector: C) -> anyhow::Result<ChangeStream<C>>
where
    C: ClusterConnector,
{
    let scope = match &config.database {
        Some(database) => WatchScope::database(database.clone()),
        None => WatchScope::Cluster,
    };

    let service = ChangeStreamService::new(connector, config.stream.clone())?;
    let stream = service.open(OpenRequest::new(scope.clone())).await?;
    info!(stream_id = %stream.id(), %scope, "streaming changes");

    Ok(stream)
}

/// Logs every event of `stream` and returns how many were delivered.
///
/// Returns after a terminal event or once `shutdown` completes. Stream failures are returned as
/// errors.
pub async fn log_changes<C, F>(
    mut stream: ChangeStream<C>,
    poll_timeout: Duration,
    shutdown: F,
) -> anyhow::Result<u64>
where
    C: ClusterConnector,
    F: Future<Output = ()> + Send + 'static,
{
    let canceller = stream.canceller();
    let shutdown_handle = tokio::spawn(async move {
        shutdown.await;
        canceller.cancel();
    });

    let mut delivered = 0;
    let result = loop {
        match stream.next(poll_timeout).await {
            Ok(Some(event)) => {
                delivered += 1;
                info!(
                    operation_type = %event.operation_type,
                    cluster_time = %event.cluster_time,
                    namespace = ?event.namespace,
                    resume_token = %event.resume_token,
                    "change event"
                );

                if event.is_terminal() {
                    info!(
                        resume_token = %event.resume_token,
                        "stream ended, continue it with startAfter"
                    );
                    break Ok(delivered);
                }
            }
            Ok(None) => debug!("no change within the poll timeout"),
            Err(err) if err.kind() == ErrorKind::Cancelled => {
                info!("shutdown requested, closing the stream");
                break Ok(delivered);
            }
            Err(err) => break Err(err.into()),
        }
    };

    shutdown_handle.abort();
    stream.close();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster::Namespace;
    use config::shared::StreamServiceConfig;
    use serde_json::json;

    fn server_config(database: Option<&str>) -> ServerConfig {
        ServerConfig {
            shards: vec!["a".to_string(), "b".to_string()],
            database: database.map(str::to_string),
            poll_timeout_ms: 20,
            stream: StreamServiceConfig::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn logs_changes_until_the_database_is_dropped() {
        let config = server_config(Some("app"));
        let cluster = InMemoryCluster::new(config.shards.iter().map(String::as_str));
        let stream = open_stream(&config, cluster.clone()).await.unwrap();

        let namespace = Namespace::new("app", "items");
        cluster.insert(&namespace, json!({ "_id": 1 })).unwrap();
        cluster.insert(&namespace, json!({ "_id": 2 })).unwrap();
        cluster.drop_database("app").unwrap();

        let delivered = tokio::time::timeout(
            Duration::from_secs(5),
            log_changes(stream, Duration::from_millis(20), std::future::pending()),
        )
        .await
        .unwrap()
        .unwrap();

        // Two inserts, the collection drop, the database drop and the invalidate.
        assert_eq!(delivered, 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_stops_an_idle_stream() {
        let config = server_config(None);
        let cluster = InMemoryCluster::new(config.shards.iter().map(String::as_str));
        let stream = open_stream(&config, cluster).await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(log_changes(stream, Duration::from_millis(20), async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivered, 0);
    }
}
