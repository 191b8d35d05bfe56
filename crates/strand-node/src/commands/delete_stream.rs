//! Delete-stream command - administrative removal of one stream.

use anyhow::{Context, Result};
use strand_config::StrandConfig;
use strand_storage::StreamStorage;
use strand_types::StreamId;
use tracing::info;

pub async fn run(config: &StrandConfig, stream_id: &str) -> Result<()> {
    let stream_id: StreamId = stream_id
        .parse()
        .with_context(|| format!("Invalid stream id '{stream_id}'"))?;

    let store = super::open_store(config, None).await?;
    let result = store
        .delete_stream(&stream_id)
        .await
        .with_context(|| format!("Failed to delete stream {stream_id}"));
    super::release_store(&store).await;
    result?;

    info!(stream_id = %stream_id, "stream deleted");
    println!("Deleted stream {stream_id}");
    Ok(())
}
