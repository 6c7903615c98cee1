//! Vision-LLM provider contract: multimodal turns grounded on an image.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::dialogue::Message;

/// Streaming multimodal backend. `image_data` is base64-encoded image
/// bytes; the stream yields plain text chunks. Cancellation is by dropping
/// the stream.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    async fn stream_with_image(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        image_data: &str,
        text: &str,
    ) -> Result<BoxStream<'static, String>>;
}
