use std::time::Duration;

use lifebank_client::{ChannelOptions, LifeBankClient, PushChannel};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client = LifeBankClient::from_env().map_err(anyhow::Error::msg)?;
    let inventory = client.get_blood_inventory().await?;
    for (blood_type, level) in &inventory {
        println!("{blood_type}: {level}");
    }

    let channel = PushChannel::new(ChannelOptions::from_env().map_err(anyhow::Error::msg)?);
    channel.subscribe_to_inventory_updates(|update| {
        println!("inventory update: {update}");
    });
    if let Err(err) = channel.connect().await {
        tracing::warn!(error = %err, "first connect failed, reconnecting in the background");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                channel.disconnect();
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if channel.is_exhausted() {
                    anyhow::bail!("push channel gave up reconnecting");
                }
            }
        }
    }
    Ok(())
}
