use crate::config::ClientConfig;
use crate::error::Error;
use crate::headers::Authenticator;
use crate::message::{
    MessageType, Properties, CLIENT, DIGEST, DOC_ID, ID, PROFILE, REV, SEQUENCE,
};
use crate::output::Datastore;
use crate::protocol::{BlipProtocol, SendOptions};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorType {
    Pull,
    Push,
    PushAndPull,
}

impl ReplicatorType {
    fn name(&self) -> &'static str {
        match self {
            ReplicatorType::Pull => "PULL",
            ReplicatorType::Push => "PUSH",
            ReplicatorType::PushAndPull => "PUSH_AND_PULL",
        }
    }
}

/// Everything one replication pass needs. Built with defaults for a local
/// Sync Gateway and adjusted through the builder-style setters.
pub struct ReplicatorConfiguration {
    pub database: String,
    pub host: String,
    pub r_type: ReplicatorType,
    pub authenticator: Authenticator,
    pub datastore: Box<dyn Datastore + Send>,
    pub continuous: bool,
    pub checkpoint: bool,
    pub ssl: bool,
    pub port: u16,
    pub scope: String,
    pub collections: Vec<String>,
}

impl ReplicatorConfiguration {
    pub fn new(
        database: impl Into<String>,
        host: impl Into<String>,
        r_type: ReplicatorType,
        authenticator: Authenticator,
        datastore: Box<dyn Datastore + Send>,
    ) -> Self {
        ReplicatorConfiguration {
            database: database.into(),
            host: host.into(),
            r_type,
            authenticator,
            datastore,
            continuous: false,
            checkpoint: true,
            ssl: false,
            port: 4984,
            scope: "_default".to_string(),
            collections: vec!["_default".to_string()],
        }
    }

    pub fn ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn checkpoint(mut self, checkpoint: bool) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn collections(mut self, collections: Vec<String>) -> Self {
        self.collections = collections;
        self
    }

    /// The sync endpoint for this database.
    pub fn target(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!(
            "{}://{}:{}/{}/_blipsync",
            scheme, self.host, self.port, self.database
        )
    }
}

/// Server-stored checkpoint: the last replicated sequence for this client.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    remote: Option<Value>,
}

#[derive(Debug, Clone)]
struct AttachmentRef {
    doc_id: String,
    digest: String,
    content_type: String,
    length: u64,
}

/// Pulls one database from a remote sync endpoint into the configured
/// datastore: checkpoint negotiation, change subscription, per-document
/// retrieval, attachment fetch, checkpoint commit.
pub struct Replicator {
    config: ReplicatorConfiguration,
    client_id: String,
    checkpoint_rev: String,
    sequences: Vec<u64>,
    attachments: Vec<AttachmentRef>,
    blip: Option<BlipProtocol>,
}

impl Replicator {
    pub fn new(mut config: ReplicatorConfiguration) -> Result<Self, Error> {
        // Stable-enough client identity for checkpoint correlation: a node
        // uuid hashed together with what and where we replicate
        let node = Uuid::new_v8(rand::random::<[u8; 16]>());
        let target = config.target();
        let mut hash = Sha1::new();
        hash.update(node.as_bytes());
        hash.update(config.database.as_bytes());
        hash.update(target.as_bytes());
        hash.update(config.r_type.name().as_bytes());
        let client_id = format!("cp-{}", BASE64_STANDARD.encode(hash.finalize()));

        config.datastore.bind(&config.database)?;

        Ok(Replicator {
            config,
            client_id,
            checkpoint_rev: String::new(),
            sequences: Vec::new(),
            attachments: Vec::new(),
            blip: None,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connects and negotiates the checkpoint. A missing checkpoint (404)
    /// just means a fresh replication.
    pub async fn start(&mut self) -> Result<(), Error> {
        let target = self.config.target();
        info!("starting {} replication of {}", self.config.r_type.name(), target);

        let blip = match BlipProtocol::connect(
            &target,
            &self.config.authenticator.headers(),
            ClientConfig::default(),
        )
        .await
        {
            Ok(blip) => blip,
            Err(Error::Client { status: 401, .. }) => {
                return Err(Error::Replication(
                    "Unauthorized: invalid credentials provided".to_string(),
                ))
            }
            Err(err) => return Err(Error::Replication(format!("websocket error: {}", err))),
        };
        self.blip = Some(blip);

        match self.read_checkpoint().await {
            Ok(()) => Ok(()),
            Err(err @ Error::Blip(_)) if err.error_code() == Some(404) => {
                info!("previous checkpoint not found");
                Ok(())
            }
            Err(Error::Client { status: 401, .. }) => {
                self.stop().await;
                Err(Error::Replication(
                    "Unauthorized: invalid credentials provided".to_string(),
                ))
            }
            Err(err @ Error::Blip(_)) => {
                self.stop().await;
                Err(Error::Replication(format!(
                    "replication protocol error: {}",
                    err
                )))
            }
            Err(err @ Error::Client { .. }) => {
                self.stop().await;
                Err(Error::Replication(format!("websocket error: {}", err)))
            }
            Err(err) => {
                self.stop().await;
                Err(Error::Replication(format!("general error: {}", err)))
            }
        }
    }

    /// Runs one pull pass. Any unrecovered failure closes the connection
    /// before surfacing; sequences seen before the failure are not
    /// checkpointed.
    pub async fn replicate(&mut self) -> Result<(), Error> {
        match self.pull_pass().await {
            Ok(count) => {
                debug!("replicated {} documents", count);
                Ok(())
            }
            Err(err) => {
                self.stop().await;
                match err {
                    err @ Error::Replication(_) => Err(err),
                    Error::Client { status: 401, .. } => Err(Error::Replication(
                        "Unauthorized: invalid credentials provided".to_string(),
                    )),
                    err @ Error::Blip(_) => Err(Error::Replication(format!(
                        "replication protocol error: {}",
                        err
                    ))),
                    err @ Error::Client { .. } => {
                        Err(Error::Replication(format!("websocket error: {}", err)))
                    }
                    err => Err(Error::Replication(format!("general error: {}", err))),
                }
            }
        }
    }

    /// Closes the connection.
    pub async fn stop(&mut self) {
        if let Some(mut blip) = self.blip.take() {
            blip.stop().await;
        }
    }

    fn blip_mut(&mut self) -> Result<&mut BlipProtocol, Error> {
        self.blip
            .as_mut()
            .ok_or_else(|| Error::Replication("replicator is not connected".to_string()))
    }

    async fn read_checkpoint(&mut self) -> Result<(), Error> {
        let properties = Properties::from([
            (PROFILE, "getCheckpoint"),
            (CLIENT, self.client_id.as_str()),
        ]);
        self.blip_mut()?
            .send_message(
                MessageType::Request,
                properties,
                b"",
                SendOptions::default(),
                None,
            )
            .await?;
        let reply = self.blip_mut()?.receive_message().await?;

        if let Some(rev) = reply.properties.get(REV) {
            self.checkpoint_rev = rev.to_string();
        }
        if let Ok(checkpoint) = serde_json::from_slice::<Checkpoint>(&reply.body) {
            debug!("remote checkpoint: {:?}", checkpoint.remote);
        }
        Ok(())
    }

    async fn pull_pass(&mut self) -> Result<usize, Error> {
        // Subscribe to the change feed
        let properties = Properties::from([
            (PROFILE, "subChanges"),
            ("versioning", "rev-trees"),
            ("activeOnly", "true"),
        ]);
        self.blip_mut()?
            .send_message(
                MessageType::Request,
                properties,
                b"",
                SendOptions::default(),
                None,
            )
            .await?;
        let _subscribed = self.blip_mut()?.receive_message().await?;

        // The endpoint follows up with one batch of change descriptors
        let changes_message = self.blip_mut()?.receive_message().await?;
        let changes: Vec<Value> = serde_json::from_slice(&changes_message.body)?;
        debug!("{} changes in batch", changes.len());

        // Acknowledge the batch: no history known for any of the revisions
        let history: Vec<Vec<Value>> = vec![Vec::new(); changes.len()];
        let properties = Properties::from([
            ("maxHistory", "20"),
            ("blobs", "true"),
            ("deltas", "true"),
        ]);
        self.blip_mut()?
            .send_message(
                MessageType::Response,
                properties,
                &serde_json::to_vec(&history)?,
                SendOptions::default(),
                Some(changes_message.number),
            )
            .await?;
        let _acknowledged = self.blip_mut()?.receive_message().await?;

        // Drain the revisions the batch announced
        let mut received = 0usize;
        for _ in 0..changes.len() {
            let message = self.blip_mut()?.receive_message().await?;

            match message
                .properties
                .get(SEQUENCE)
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(sequence) => self.sequences.push(sequence),
                None => warn!(
                    "message #{} carries no usable sequence",
                    message.number
                ),
            }
            let doc_id = message.properties.get(ID).unwrap_or_default().to_string();

            let text = message.body_as_string()?;
            let document = match serde_json::from_str::<Value>(&text) {
                Ok(value) => value,
                Err(_) => Value::String(text),
            };

            if let Some(entries) = document.get("_attachments").and_then(Value::as_object) {
                for (name, entry) in entries {
                    debug!("document {} attachment {}", doc_id, name);
                    self.attachments.push(AttachmentRef {
                        doc_id: doc_id.clone(),
                        digest: entry
                            .get("digest")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        content_type: entry
                            .get("content_type")
                            .and_then(Value::as_str)
                            .unwrap_or("application/octet-stream")
                            .to_string(),
                        length: entry.get("length").and_then(Value::as_u64).unwrap_or(0),
                    });
                }
            }

            self.config.datastore.write(&doc_id, &document)?;
            received += 1;
        }

        self.commit_checkpoint().await?;
        self.fetch_attachments().await?;
        Ok(received)
    }

    async fn commit_checkpoint(&mut self) -> Result<(), Error> {
        if !self.config.checkpoint || self.sequences.is_empty() {
            return Ok(());
        }
        let remote = self.sequences.iter().copied().max().unwrap_or(0);
        let properties = Properties::from([
            (PROFILE, "setCheckpoint"),
            (CLIENT, self.client_id.as_str()),
            (REV, self.checkpoint_rev.as_str()),
        ]);
        let body = serde_json::to_vec(&Checkpoint {
            time: Some(OffsetDateTime::now_utc().unix_timestamp()),
            remote: Some(Value::from(remote)),
        })?;
        self.blip_mut()?
            .send_message(
                MessageType::Request,
                properties,
                &body,
                SendOptions::default(),
                None,
            )
            .await?;
        let reply = self.blip_mut()?.receive_message().await?;
        if let Some(rev) = reply.properties.get(REV) {
            self.checkpoint_rev = rev.to_string();
        }
        info!("checkpoint committed at sequence {}", remote);
        Ok(())
    }

    async fn fetch_attachments(&mut self) -> Result<(), Error> {
        let attachments = std::mem::take(&mut self.attachments);
        for attachment in attachments {
            let properties = Properties::from([
                (PROFILE, "getAttachment"),
                (DIGEST, attachment.digest.as_str()),
                (DOC_ID, attachment.doc_id.as_str()),
            ]);
            self.blip_mut()?
                .send_message(
                    MessageType::Request,
                    properties,
                    b"",
                    SendOptions::default(),
                    None,
                )
                .await?;
            let reply = self.blip_mut()?.receive_message().await?;
            if attachment.length != 0 && reply.body.len() as u64 != attachment.length {
                warn!(
                    "attachment {} for {}: expected {} bytes, received {}",
                    attachment.digest,
                    attachment.doc_id,
                    attachment.length,
                    reply.body.len()
                );
            }
            self.config.datastore.write_attachment(
                &attachment.doc_id,
                &attachment.content_type,
                &reply.body,
            )?;
        }
        Ok(())
    }
}
