/// Transport-level tunables for one connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_frame_size: usize,
    pub max_message_size: usize,
    /// Extra PEM CA bundle for `wss://` targets with self-signed
    /// certificates (e.g. a local Sync Gateway).
    pub ca_file: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_frame_size: 16 << 20,
            max_message_size: 64 << 20,
            ca_file: None,
        }
    }
}
