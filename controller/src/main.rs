mod host;
mod pins;
mod remote;
mod weather;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
