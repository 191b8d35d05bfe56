//! Streams command - lists stored streams.

use anyhow::{Context, Result};
use strand_storage::StreamStorage;

use strand_config::StrandConfig;

pub async fn run(config: &StrandConfig) -> Result<()> {
    let store = super::open_store(config, None).await?;

    let streams = store.get_streams().await.context("Failed to list streams")?;
    for stream_id in &streams {
        let last = store
            .get_last_miniblock_number(stream_id)
            .await
            .with_context(|| format!("Failed to read stream {stream_id}"))?;
        println!("{stream_id}  kind={}  last_miniblock={last}", stream_id.kind());
    }
    let count = store
        .get_streams_number()
        .await
        .context("Failed to count streams")?;
    println!();
    println!("{count} stream(s)");

    super::release_store(&store).await;
    Ok(())
}
