mod actuator;
mod ambient;
mod host;
mod metrics;
mod mqtt;
mod realtime;
mod wemo;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
