use crate::client::BlipClient;
use crate::config::ClientConfig;
use crate::error::{BlipError, Error};
use crate::message::{BlipMessage, MessageType, Properties, SequenceCounter};
use crate::messenger::Messenger;
use log::debug;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Default deadline for one inbound message.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Flag bits applied to an outbound message.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub urgent: bool,
    pub compress: bool,
    pub no_reply: bool,
    pub partial: bool,
}

/// The asynchronous send/receive surface over one BLIP connection.
///
/// Allocates message numbers, frames outbound messages through the
/// `Messenger`, and classifies inbound traffic; an inbound error message is
/// always raised, never returned.
pub struct BlipProtocol {
    client: BlipClient,
    messenger: Messenger,
    sequence: Arc<SequenceCounter>,
}

impl BlipProtocol {
    pub async fn connect(
        url: &str,
        headers: &[(String, String)],
        config: ClientConfig,
    ) -> Result<Self, Error> {
        let client = BlipClient::connect(url, headers, config).await?;
        Ok(Self::over(client))
    }

    pub(crate) fn over(client: BlipClient) -> Self {
        BlipProtocol {
            client,
            messenger: Messenger::new(),
            sequence: Arc::new(SequenceCounter::new()),
        }
    }

    /// The shared number source, for callers that emit multi-part requests
    /// with a set size greater than one.
    pub fn sequence(&self) -> Arc<SequenceCounter> {
        self.sequence.clone()
    }

    /// Builds and queues one message; returns its number so the caller can
    /// correlate the reply. A `reply_to` reuses the request's number and
    /// forces the kind to `Response`.
    pub async fn send_message(
        &mut self,
        kind: MessageType,
        properties: Properties,
        body: &[u8],
        options: SendOptions,
        reply_to: Option<u64>,
    ) -> Result<u64, Error> {
        let mut message = BlipMessage::new();
        match reply_to {
            Some(number) => {
                message.number = number;
                message.kind = MessageType::Response;
            }
            None => {
                message.number = self.sequence.next();
                message.kind = kind;
            }
        }
        message.urgent = options.urgent;
        message.compressed = options.compress;
        message.no_reply = options.no_reply;
        message.more_coming = options.partial;
        message.properties = properties;
        message.body = body.to_vec();

        let frame = self.messenger.compose(&message)?;
        self.client.send(frame).await?;
        Ok(message.number)
    }

    /// The next inbound message, within the default 15-second deadline.
    pub async fn receive_message(&mut self) -> Result<BlipMessage, Error> {
        self.receive_message_within(RECEIVE_TIMEOUT).await
    }

    pub async fn receive_message_within(
        &mut self,
        deadline: Duration,
    ) -> Result<BlipMessage, Error> {
        let data = match timeout(deadline, self.client.recv()).await {
            Err(_) => {
                return Err(Error::Client {
                    status: 408,
                    message: "Receive Timeout".to_string(),
                })
            }
            Ok(None) => {
                let (status, message) = self.client.status();
                return Err(Error::Client { status, message });
            }
            Ok(Some(data)) => data,
        };

        let message = self.messenger.parse(&data)?;

        debug!("Message #{}", message.number);
        debug!("Type: {:?}", message.kind);
        debug!("Properties: {:?}", message.properties);
        debug!("Body: {} bytes", message.body.len());

        if message.kind == MessageType::Error {
            return Err(Error::Blip(BlipError {
                number: message.number,
                properties: message.properties,
                body: String::from_utf8_lossy(&message.body).into_owned(),
            }));
        }

        Ok(message)
    }

    pub async fn stop(&mut self) {
        debug!("received protocol stop request");
        self.client.stop().await;
    }
}
