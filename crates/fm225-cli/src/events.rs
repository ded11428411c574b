//! JSON event stream for `fm225 listen`

use fm225_protocol::{FaceEvent, FaceTransport, Note, Outcome, ParsedResponse};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

/// Events printed to stdout, one JSON object per line
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliEvent {
    Listening { port: String },
    Note { note: Note },
    UnsolicitedReply {
        response: ParsedResponse,
        outcome: Outcome,
    },
}

impl From<FaceEvent> for CliEvent {
    fn from(event: FaceEvent) -> Self {
        match event {
            FaceEvent::Note(note) => CliEvent::Note { note },
            FaceEvent::UnsolicitedReply(response) => CliEvent::UnsolicitedReply {
                outcome: response.outcome(),
                response,
            },
        }
    }
}

fn emit(event: &CliEvent) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

/// Print module events until Ctrl-C
pub async fn listen(transport: &FaceTransport, port: &str) -> anyhow::Result<()> {
    let mut event_rx = transport.subscribe();
    emit(&CliEvent::Listening {
        port: port.to_string(),
    })?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = event_rx.recv() => match event {
                Ok(event) => emit(&CliEvent::from(event))?,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Event stream lagged by {} messages", n);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}
