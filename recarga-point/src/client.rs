//! Broker connection for a charging point

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use recarga_core::{split_stream, Message, MessageKind, MessageSink, QueueStatus};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::PointConfig;
use crate::engine::QueueEngine;
use crate::error::PointError;

/// Connect to the broker and serve vehicles until the connection ends.
pub async fn run(config: PointConfig) -> Result<(), PointError> {
    info!("Point: connecting to broker at {}", config.broker_addr);
    let stream = TcpStream::connect(&config.broker_addr).await?;
    stream.set_nodelay(true)?;
    let (mut reader, writer) = split_stream(stream);
    let writer = Arc::new(writer);

    let engine = Arc::new(QueueEngine::new(
        config,
        writer.clone(),
        StdRng::from_entropy(),
    ));

    writer
        .send_message(&Message::point(MessageKind::Identify, "charging point online"))
        .await?;
    let drain = tokio::spawn(engine.clone().run());

    let result = loop {
        match reader.next_message().await {
            Ok(Some(msg)) => {
                if let Err(e) = handle_message(&engine, msg).await {
                    break Err(e);
                }
            }
            Ok(None) => {
                info!("Point: broker closed the connection");
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        }
    };

    drain.abort();
    writer.close().await;
    result
}

/// Handle one broker message in arrival order
pub async fn handle_message<S, R>(
    engine: &QueueEngine<S, R>,
    msg: Message,
) -> Result<(), PointError>
where
    S: MessageSink,
    R: rand::Rng + Send,
{
    match msg.kind {
        MessageKind::GetAvailability => {
            let report = engine.availability();
            let reply = Message::point(MessageKind::Availability, report.to_payload()?);
            engine.sink().send(reply).await?;
        }
        MessageKind::NewRequest => {
            let plate = msg.content.trim().to_string();
            let position = engine.enqueue(&plate);
            let status = QueueStatus { plate, position };
            let reply = Message::point(MessageKind::QueueStatus, status.to_payload()?);
            engine.sink().send(reply).await?;
        }
        MessageKind::VehicleArrived => {
            if let Err(e) = engine.arrived(msg.content.trim()) {
                warn!("Point: arrival ignored: {}", e);
            }
        }
        MessageKind::ReleasePoint => {
            engine.release();
        }
        MessageKind::IdentifyRejected => {
            warn!("Point: broker refused registration: {}", msg.content);
            return Err(PointError::Rejected(msg.content));
        }
        other => debug!("Point: ignoring {} from broker", other),
    }
    Ok(())
}
