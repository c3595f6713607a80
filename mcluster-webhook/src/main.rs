//! `mcluster-vcontroller`: the validating admission webhook for mcluster resources.
use anyhow::Context;
use clap::Parser;
use mcluster_core::PolicyEngine;
use mcluster_webhook::{
    config::{Args, Config},
    server,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mcluster_webhook=info")))
        .init();

    let config = Config::from_args(Args::parse()).context("invalid configuration")?;
    let engine = PolicyEngine::from_config(&config.policy);
    info!(
        rules = ?engine.rule_names(),
        mode = ?engine.mode(),
        listen = %config.listen,
        "starting mcluster admission webhook"
    );

    server::run(config, engine).await.context("webhook server failed")?;
    Ok(())
}
