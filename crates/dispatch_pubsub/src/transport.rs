#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Raw pub/sub seam under the broker: string payloads on named channels.
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
	/// Short name for logs and metric labels.
	fn name(&self) -> &'static str;

	async fn publish(&self, channel: &str, payload: String) -> anyhow::Result<()>;

	/// Open a subscription. The stream ends when the subscription is lost.
	async fn subscribe(&self, channel: &str) -> anyhow::Result<BoxStream<'static, String>>;
}
