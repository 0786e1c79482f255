use crate::error::AppError;
use crate::feed::types::FeedSettings;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type PriceWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn ws_endpoint(settings: &FeedSettings) -> String {
    format!(
        "{}/quotes/price?apikey={}",
        settings.base_url.trim_end_matches('/'),
        settings.api_key
    )
}

pub async fn connect_price_stream(endpoint: &str) -> Result<PriceWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(endpoint, Some(ws_config), true).await?;
    Ok(stream)
}
