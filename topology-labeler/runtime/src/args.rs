use crate::{admission::Admission, metrics::AdmissionMetrics, store::KubeStore};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::time::Duration;
use topology_labeler_core::{Config, TopologyLabeler, DEFAULT_TOPOLOGY_PREFIX};
use tracing::info;

#[derive(Debug, Parser)]
#[clap(
    name = "topology-labeler",
    about = "Copies node topology labels onto pods as they are bound"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "topology_labeler=info,warn",
        env = "TOPOLOGY_LABELER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Logs each raw binding and every label written to a pod.
    #[clap(long, env = "TOPOLOGY_LABELER_DEBUG")]
    debug: bool,

    /// Node labels with keys under this prefix are copied onto pods.
    #[clap(long, default_value = DEFAULT_TOPOLOGY_PREFIX)]
    topology_prefix: String,

    /// Bounds each read or write against the Kubernetes API.
    #[clap(long, default_value = "10000")]
    store_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            debug,
            topology_prefix,
            store_timeout_ms,
        } = self;

        if topology_prefix.is_empty() {
            bail!("--topology-prefix must not be empty");
        }

        let mut prom = <Registry>::default();
        let metrics = AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        let store = KubeStore::new(runtime.client(), Duration::from_millis(store_timeout_ms));
        let labeler = TopologyLabeler::new(
            store,
            Config {
                debug,
                topology_prefix,
            },
        );
        info!(
            prefix = %labeler.config().topology_prefix,
            debug = labeler.config().debug,
            "Propagating node topology labels to pods"
        );

        let runtime = runtime.spawn_server(Admission::new(labeler, metrics));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
